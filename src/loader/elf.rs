use crate::memory::SegmentFlags;
use crate::scheduler::{self, LoadSegment, ProcessId};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;
const PT_INTERP: u32 = 3;

/// Load base applied to position-independent (ET_DYN) images.
const DEFAULT_DYN_BASE: u64 = 0x4004_8000;

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

struct Elf64Ehdr {
    e_type: u16,
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 64 {
            return Err(ExecError::InvalidFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(ExecError::InvalidFormat);
        }
        if data[4] != ELFCLASS64 {
            return Err(ExecError::UnsupportedArch);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ExecError::UnsupportedArch);
        }

        let e_type = u16::from_le_bytes([data[16], data[17]]);
        let e_machine = u16::from_le_bytes([data[18], data[19]]);
        if e_type != ET_EXEC && e_type != ET_DYN {
            return Err(ExecError::UnsupportedType);
        }
        if e_machine != EM_X86_64 {
            return Err(ExecError::UnsupportedArch);
        }

        Ok(Elf64Ehdr {
            e_type,
            e_entry: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            e_phoff: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[54], data[55]]),
            e_phnum: u16::from_le_bytes([data[56], data[57]]),
        })
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 56 {
            return Err(ExecError::InvalidFormat);
        }
        Ok(Elf64Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_offset: u64::from_le_bytes(data[8..16].try_into().unwrap()),
            p_vaddr: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            p_filesz: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            p_memsz: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

// ══════════════════════════════════════════════════════════════
//  ExecError
// ══════════════════════════════════════════════════════════════

#[derive(Debug, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
    ReadError,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound => write!(f, "File not found"),
            ExecError::InvalidFormat => write!(f, "Invalid ELF format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type"),
            ExecError::MemoryError => write!(f, "Memory allocation error"),
            ExecError::ReadError => write!(f, "File read error"),
        }
    }
}

// ══════════════════════════════════════════════════════════════
//  Parsing — bytes in, segment list out
// ══════════════════════════════════════════════════════════════

/// One loadable segment as described by the image, borrowing its
/// initial content from the file bytes.
pub struct ParsedSegment<'a> {
    pub vaddr: u64,
    pub mem_size: usize,
    pub data: &'a [u8],
    pub flags: SegmentFlags,
}

/// The loader's view of an executable: entry point, loadable segments,
/// and the interpreter path for dynamically linked binaries.
pub struct ParsedExecutable<'a> {
    pub entry: u64,
    pub segments: Vec<ParsedSegment<'a>>,
    pub interpreter: Option<String>,
}

/// Parse an ELF64 image into the segment list the process core
/// consumes. ET_DYN images are rebased to DEFAULT_DYN_BASE.
pub fn parse(bytes: &[u8]) -> Result<ParsedExecutable, ExecError> {
    let ehdr = Elf64Ehdr::parse(bytes)?;
    let rebase = if ehdr.e_type == ET_DYN {
        DEFAULT_DYN_BASE
    } else {
        0
    };

    let mut segments = Vec::new();
    let mut interpreter = None;

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize;
        if off + 56 > bytes.len() {
            return Err(ExecError::InvalidFormat);
        }
        let phdr = Elf64Phdr::parse(&bytes[off..])?;
        match phdr.p_type {
            PT_LOAD => {
                let start = phdr.p_offset as usize;
                let end = start + phdr.p_filesz as usize;
                if end > bytes.len() || phdr.p_memsz < phdr.p_filesz {
                    return Err(ExecError::InvalidFormat);
                }
                segments.push(ParsedSegment {
                    vaddr: phdr.p_vaddr + rebase,
                    mem_size: phdr.p_memsz as usize,
                    data: &bytes[start..end],
                    flags: SegmentFlags::from_bits_truncate(phdr.p_flags),
                });
            }
            PT_INTERP => {
                let start = phdr.p_offset as usize;
                let end = start + phdr.p_filesz as usize;
                if end > bytes.len() {
                    return Err(ExecError::InvalidFormat);
                }
                let raw = &bytes[start..end];
                let nul = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                interpreter = Some(
                    core::str::from_utf8(&raw[..nul])
                        .map_err(|_| ExecError::InvalidFormat)?
                        .into(),
                );
            }
            _ => {}
        }
    }

    if segments.is_empty() {
        return Err(ExecError::InvalidFormat);
    }

    Ok(ParsedExecutable {
        entry: ehdr.e_entry + rebase,
        segments,
        interpreter,
    })
}

// ══════════════════════════════════════════════════════════════
//  Spawning
// ══════════════════════════════════════════════════════════════

fn read_file_all(path: &str) -> Result<Vec<u8>, ExecError> {
    let vfs = crate::fs::VFS.lock();
    let inode = vfs.lookup(path).map_err(|_| ExecError::FileNotFound)?;
    if inode.size == 0 {
        return Err(ExecError::InvalidFormat);
    }
    let mut buf = vec![0u8; inode.size];
    let bytes_read = vfs
        .read_file(path, 0, &mut buf)
        .map_err(|_| ExecError::ReadError)?;
    buf.truncate(bytes_read);
    Ok(buf)
}

fn spawn_parsed(
    path: &str,
    argv: &[&str],
    image: &ParsedExecutable,
) -> Result<ProcessId, ExecError> {
    let segments: Vec<LoadSegment> = image
        .segments
        .iter()
        .map(|s| LoadSegment {
            vaddr: s.vaddr,
            mem_size: s.mem_size,
            data: s.data,
            flags: s.flags,
        })
        .collect();
    scheduler::spawn_new_process(path, argv, &segments, image.entry, "/")
        .map_err(|_| ExecError::MemoryError)
}

/// Load `path` and enqueue it as a new process. A dynamically linked
/// binary is started through its interpreter: the interpreter image is
/// the one loaded, with the target path prepended to its argv.
pub fn spawn_program(path: &str, argv: &[&str]) -> Result<ProcessId, ExecError> {
    let file_data = read_file_all(path)?;
    let image = parse(&file_data)?;

    let Some(interp_path) = image.interpreter.clone() else {
        return spawn_parsed(path, argv, &image);
    };

    let interp_data = read_file_all(&interp_path)?;
    let interp_image = parse(&interp_data)?;
    if interp_image.interpreter.is_some() {
        return Err(ExecError::UnsupportedType);
    }

    let mut full_argv: Vec<&str> = Vec::with_capacity(argv.len() + 1);
    full_argv.push(interp_path.as_str());
    full_argv.extend_from_slice(argv);
    spawn_parsed(&interp_path, &full_argv, &interp_image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehdr_bytes(e_type: u16, entry: u64, phnum: u16) -> Vec<u8> {
        let mut h = vec![0u8; 64];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELFCLASS64;
        h[5] = ELFDATA2LSB;
        h[6] = 1; // version
        h[16..18].copy_from_slice(&e_type.to_le_bytes());
        h[18..20].copy_from_slice(&EM_X86_64.to_le_bytes());
        h[24..32].copy_from_slice(&entry.to_le_bytes());
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        h[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        h[56..58].copy_from_slice(&phnum.to_le_bytes());
        h
    }

    fn phdr_bytes(
        p_type: u32,
        flags: u32,
        offset: u64,
        vaddr: u64,
        filesz: u64,
        memsz: u64,
    ) -> Vec<u8> {
        let mut p = vec![0u8; 56];
        p[0..4].copy_from_slice(&p_type.to_le_bytes());
        p[4..8].copy_from_slice(&flags.to_le_bytes());
        p[8..16].copy_from_slice(&offset.to_le_bytes());
        p[16..24].copy_from_slice(&vaddr.to_le_bytes());
        p[32..40].copy_from_slice(&filesz.to_le_bytes());
        p[40..48].copy_from_slice(&memsz.to_le_bytes());
        p
    }

    #[test]
    fn parses_a_static_executable() {
        let mut image = ehdr_bytes(ET_EXEC, 0x4004_8000, 1);
        image.extend(phdr_bytes(PT_LOAD, 0x5, 120, 0x4004_8000, 4, 64));
        image.resize(120, 0);
        image.extend(b"CODE");

        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry, 0x4004_8000);
        assert!(parsed.interpreter.is_none());
        assert_eq!(parsed.segments.len(), 1);
        let seg = &parsed.segments[0];
        assert_eq!(seg.vaddr, 0x4004_8000);
        assert_eq!(seg.mem_size, 64);
        assert_eq!(seg.data, b"CODE");
        assert_eq!(seg.flags, SegmentFlags::READ | SegmentFlags::EXEC);
    }

    #[test]
    fn rebases_pie_images_and_finds_the_interpreter() {
        let mut image = ehdr_bytes(ET_DYN, 0x1000, 2);
        image.extend(phdr_bytes(PT_LOAD, 0x5, 0, 0x0, 0, 16));
        image.extend(phdr_bytes(PT_INTERP, 0x4, 176, 0, 13, 13));
        image.resize(176, 0);
        image.extend(b"/lib/ld.so.1\0");

        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry, DEFAULT_DYN_BASE + 0x1000);
        assert_eq!(parsed.segments[0].vaddr, DEFAULT_DYN_BASE);
        assert_eq!(parsed.interpreter.as_deref(), Some("/lib/ld.so.1"));
    }

    #[test]
    fn rejects_foreign_binaries() {
        let mut not_elf = ehdr_bytes(ET_EXEC, 0, 0);
        not_elf[0] = 0x7E;
        assert!(matches!(parse(&not_elf), Err(ExecError::InvalidFormat)));

        let mut elf32 = ehdr_bytes(ET_EXEC, 0, 0);
        elf32[4] = 1;
        assert!(matches!(parse(&elf32), Err(ExecError::UnsupportedArch)));

        let reloc = ehdr_bytes(1, 0, 0); // ET_REL
        assert!(matches!(parse(&reloc), Err(ExecError::UnsupportedType)));
    }

    #[test]
    fn rejects_truncated_segment_data() {
        let mut image = ehdr_bytes(ET_EXEC, 0x4004_8000, 1);
        image.extend(phdr_bytes(PT_LOAD, 0x5, 4096, 0x4004_8000, 100, 100));
        assert!(matches!(parse(&image), Err(ExecError::InvalidFormat)));
    }
}

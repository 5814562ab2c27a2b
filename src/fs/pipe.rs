use crate::memory::user;
use crate::scheduler::{wait, ProcessTable, WaitReason};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

pub const PIPE_BUFFER_SIZE: usize = 4096;

/// The kernel-side state of one pipe: a fixed ring buffer, endpoint
/// reference counts, at most one blocked reader, and a FIFO of blocked
/// writers (referenced by their registry slots).
pub struct Pipe {
    buffer: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    readers: usize,
    writers: usize,
    pub(crate) read_waiter: Option<usize>,
    pub(crate) write_waiters: VecDeque<usize>,
}

impl Pipe {
    pub fn new() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Pipe {
            buffer: vec![0; PIPE_BUFFER_SIZE],
            read_pos: 0,
            write_pos: 0,
            readers: 0,
            writers: 0,
            read_waiter: None,
            write_waiters: VecDeque::new(),
        }))
    }

    pub fn add_reader(&mut self) {
        self.readers += 1;
    }

    pub fn add_writer(&mut self) {
        self.writers += 1;
    }

    pub fn drop_reader(&mut self) {
        if self.readers > 0 {
            self.readers -= 1;
        }
    }

    pub fn drop_writer(&mut self) {
        if self.writers > 0 {
            self.writers -= 1;
        }
    }

    pub fn active_readers(&self) -> usize {
        self.readers
    }

    pub fn active_writers(&self) -> usize {
        self.writers
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    pub fn is_full(&self) -> bool {
        (self.write_pos + 1) % PIPE_BUFFER_SIZE == self.read_pos
    }

    /// Pop up to `buf.len()` bytes off the ring.
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && !self.is_empty() {
            buf[n] = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_BUFFER_SIZE;
            n += 1;
        }
        n
    }

    /// Push up to `buf.len()` bytes onto the ring.
    pub fn write_bytes(&mut self, buf: &[u8]) -> usize {
        let mut n = 0;
        while n < buf.len() && !self.is_full() {
            self.buffer[self.write_pos] = buf[n];
            self.write_pos = (self.write_pos + 1) % PIPE_BUFFER_SIZE;
            n += 1;
        }
        n
    }
}

fn reader_wait_fields(table: &ProcessTable, slot: usize) -> Option<(u64, usize, usize)> {
    match table.get(slot)?.wait {
        Some(WaitReason::PipeRead { buf, len, filled, .. }) => Some((buf, len, filled)),
        _ => None,
    }
}

fn writer_wait_fields(table: &ProcessTable, slot: usize) -> Option<(u64, usize, usize)> {
    match table.get(slot)?.wait {
        Some(WaitReason::PipeWrite { buf, len, written, .. }) => Some((buf, len, written)),
        _ => None,
    }
}

/// Write `size` bytes from the current process's `src` into the pipe.
/// Delivers straight into a blocked reader first, buffers what fits,
/// and blocks for the remainder when the ring fills. Returns the full
/// size; a blocked writer finishes its transfer asynchronously.
pub fn write_to_pipe(
    table: &mut ProcessTable,
    pipe_arc: &Arc<Mutex<Pipe>>,
    mut src: u64,
    mut size: usize,
) -> usize {
    let total = size;
    let current_slot = table.current_slot().expect("pipe write without a process");
    let mut pipe = pipe_arc.lock();

    // If someone is already waiting on this data, write directly into
    // their buffer across address spaces.
    if size > 0 {
        if let Some(reader_slot) = pipe.read_waiter {
            if let Some((rbuf, rlen, rfilled)) = reader_wait_fields(table, reader_slot) {
                let n = size.min(rlen - rfilled);
                if n > 0 {
                    let (current, reader) = table.pair_mut(current_slot, reader_slot);
                    if user::copy_between(
                        &mut current.image,
                        src,
                        &mut reader.image,
                        rbuf + rfilled as u64,
                        n,
                    )
                    .is_ok()
                    {
                        src += n as u64;
                        size -= n;
                        let satisfied = rfilled + n == rlen;
                        if let Some(WaitReason::PipeRead { filled, .. }) = &mut reader.wait {
                            *filled = rfilled + n;
                        }
                        if satisfied {
                            pipe.read_waiter = None;
                            wait::wake_slot(table, reader_slot);
                        }
                    }
                }
            }
        }
    }

    // Buffer as much as the ring accepts.
    let mut bounce = [0u8; 64];
    while size > 0 && !pipe.is_full() {
        let chunk = size.min(bounce.len());
        let current = table.current_mut();
        if user::copy_from_user(&mut current.image, src, &mut bounce[..chunk]).is_err() {
            break;
        }
        let pushed = pipe.write_bytes(&bounce[..chunk]);
        src += pushed as u64;
        size -= pushed;
        if pushed == 0 {
            break;
        }
    }

    // Ring full: queue up and block for the rest.
    if size > 0 {
        pipe.write_waiters.push_back(current_slot);
        drop(pipe);
        wait::block_current(
            table,
            WaitReason::PipeWrite {
                pipe: pipe_arc.clone(),
                buf: src,
                len: size,
                written: 0,
            },
        );
    }

    total
}

/// Read `size` bytes into the current process's `dst`. Drains the ring,
/// then blocked writers in FIFO order (so byte order always matches
/// write order), and finally blocks — unless every write end is closed,
/// in which case it returns what it got.
pub fn read_from_pipe(
    table: &mut ProcessTable,
    pipe_arc: &Arc<Mutex<Pipe>>,
    mut dst: u64,
    mut size: usize,
) -> usize {
    let total = size;
    let current_slot = table.current_slot().expect("pipe read without a process");
    let mut pipe = pipe_arc.lock();

    // Drain the ring first.
    let mut bounce = [0u8; 64];
    while size > 0 && !pipe.is_empty() {
        let chunk = size.min(bounce.len());
        let got = pipe.read_bytes(&mut bounce[..chunk]);
        if got == 0 {
            break;
        }
        let current = table.current_mut();
        if user::copy_to_user(&mut current.image, dst, &bounce[..got]).is_err() {
            break;
        }
        dst += got as u64;
        size -= got;
    }

    // Unblock queued writers in order, taking their bytes directly and
    // spilling any remainder back into the freed ring space.
    while let Some(&writer_slot) = pipe.write_waiters.front() {
        let Some((wbuf, wlen, mut written)) = writer_wait_fields(table, writer_slot) else {
            pipe.write_waiters.pop_front();
            continue;
        };

        if size > 0 && written < wlen {
            let n = size.min(wlen - written);
            let (writer, current) = table.pair_mut(writer_slot, current_slot);
            if user::copy_between(
                &mut writer.image,
                wbuf + written as u64,
                &mut current.image,
                dst,
                n,
            )
            .is_ok()
            {
                written += n;
                dst += n as u64;
                size -= n;
            }
        }

        while written < wlen && !pipe.is_full() {
            let chunk = (wlen - written).min(bounce.len());
            let writer = table.get_mut(writer_slot).unwrap();
            if user::copy_from_user(
                &mut writer.image,
                wbuf + written as u64,
                &mut bounce[..chunk],
            )
            .is_err()
            {
                break;
            }
            let pushed = pipe.write_bytes(&bounce[..chunk]);
            written += pushed;
            if pushed == 0 {
                break;
            }
        }

        if let Some(WaitReason::PipeWrite { written: w, .. }) =
            &mut table.get_mut(writer_slot).unwrap().wait
        {
            *w = written;
        }

        if written == wlen {
            pipe.write_waiters.pop_front();
            wait::wake_slot(table, writer_slot);
        } else {
            // Ring filled up again; the writer stays queued.
            break;
        }
    }

    // Still unsatisfied: block, unless the write side is gone.
    if size > 0 {
        if pipe.active_writers() == 0 {
            return total - size;
        }
        pipe.read_waiter = Some(current_slot);
        drop(pipe);
        wait::block_current(
            table,
            WaitReason::PipeRead {
                pipe: pipe_arc.clone(),
                buf: dst,
                len: size,
                filled: 0,
            },
        );
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SegmentFlags;
    use crate::scheduler::tests::spawn_bare;
    use crate::scheduler::{ProcessState, ProcessTable};

    const A_BUF: u64 = 0x4004_8000;
    const B_BUF: u64 = 0x4010_0000;

    fn table_with_two_processes() -> (ProcessTable, usize, usize) {
        let mut table = ProcessTable::new();
        let a = spawn_bare(&mut table);
        let b = spawn_bare(&mut table);
        for (slot, base) in [(a, A_BUF), (b, B_BUF)] {
            let p = table.get_mut(slot).unwrap();
            p.state = ProcessState::Runnable;
            p.image
                .create_segment(
                    base,
                    2 * PIPE_BUFFER_SIZE,
                    SegmentFlags::READ | SegmentFlags::WRITE,
                    None,
                )
                .unwrap();
        }
        (table, a, b)
    }

    #[test]
    fn ring_preserves_byte_order() {
        let pipe = Pipe::new();
        let mut p = pipe.lock();
        assert_eq!(p.write_bytes(b"abc"), 3);
        assert_eq!(p.write_bytes(b"def"), 3);
        let mut out = [0u8; 6];
        assert_eq!(p.read_bytes(&mut out), 6);
        assert_eq!(&out, b"abcdef");
        assert!(p.is_empty());
    }

    #[test]
    fn ring_capacity_is_one_less_than_the_buffer() {
        let pipe = Pipe::new();
        let mut p = pipe.lock();
        let big = [1u8; PIPE_BUFFER_SIZE + 10];
        assert_eq!(p.write_bytes(&big), PIPE_BUFFER_SIZE - 1);
        assert!(p.is_full());
    }

    #[test]
    fn small_write_passes_through_the_ring() {
        let (mut table, a, b) = table_with_two_processes();
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        pipe.lock().add_writer();

        table.set_current(a);
        let w = table.get_mut(a).unwrap();
        crate::memory::user::copy_to_user(&mut w.image, A_BUF, b"hello").unwrap();
        assert_eq!(write_to_pipe(&mut table, &pipe, A_BUF, 5), 5);
        assert_eq!(table.get(a).unwrap().state, ProcessState::Runnable);

        table.set_current(b);
        assert_eq!(read_from_pipe(&mut table, &pipe, B_BUF, 5), 5);
        let r = table.get_mut(b).unwrap();
        let mut out = [0u8; 5];
        crate::memory::user::copy_from_user(&mut r.image, B_BUF, &mut out).unwrap();
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn oversized_write_blocks_and_drains_in_order() {
        let (mut table, a, b) = table_with_two_processes();
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        pipe.lock().add_writer();

        // W1 fills the ring and blocks with a remainder; the payload is
        // a strictly increasing sequence so order mistakes are visible.
        let payload: Vec<u8> = (0..(PIPE_BUFFER_SIZE + 100) as u32)
            .map(|i| (i % 251) as u8)
            .collect();
        table.set_current(a);
        {
            let w = table.get_mut(a).unwrap();
            crate::memory::user::copy_to_user(&mut w.image, A_BUF, &payload).unwrap();
        }
        assert_eq!(
            write_to_pipe(&mut table, &pipe, A_BUF, payload.len()),
            payload.len()
        );
        assert_eq!(table.get(a).unwrap().state, ProcessState::Waiting);
        assert_eq!(pipe.lock().write_waiters.len(), 1);

        // The reader drains everything in two incremental reads; bytes
        // arrive in exactly the order W1 wrote them, and the blocked
        // writer completes.
        table.set_current(b);
        let first = PIPE_BUFFER_SIZE / 2;
        assert_eq!(read_from_pipe(&mut table, &pipe, B_BUF, first), first);
        let rest = payload.len() - first;
        assert_eq!(
            read_from_pipe(&mut table, &pipe, B_BUF + first as u64, rest),
            rest
        );

        let r = table.get_mut(b).unwrap();
        let mut out = alloc::vec![0u8; payload.len()];
        crate::memory::user::copy_from_user(&mut r.image, B_BUF, &mut out).unwrap();
        assert_eq!(out, payload);

        assert_eq!(table.get(a).unwrap().state, ProcessState::Runnable);
        assert!(table.get(a).unwrap().wait.is_none());
        assert!(pipe.lock().write_waiters.is_empty());
    }

    #[test]
    fn two_writes_are_observed_in_write_order() {
        let (mut table, a, b) = table_with_two_processes();
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        pipe.lock().add_writer();

        table.set_current(a);
        {
            let w = table.get_mut(a).unwrap();
            crate::memory::user::copy_to_user(&mut w.image, A_BUF, b"W1-first").unwrap();
            crate::memory::user::copy_to_user(&mut w.image, A_BUF + 0x100, b"W2-second").unwrap();
        }
        write_to_pipe(&mut table, &pipe, A_BUF, 8);
        write_to_pipe(&mut table, &pipe, A_BUF + 0x100, 9);

        table.set_current(b);
        assert_eq!(read_from_pipe(&mut table, &pipe, B_BUF, 17), 17);
        let r = table.get_mut(b).unwrap();
        let mut out = [0u8; 17];
        crate::memory::user::copy_from_user(&mut r.image, B_BUF, &mut out).unwrap();
        assert_eq!(&out, b"W1-firstW2-second");
    }

    #[test]
    fn empty_read_blocks_until_a_writer_delivers() {
        let (mut table, a, b) = table_with_two_processes();
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        pipe.lock().add_writer();

        // B reads on an empty pipe: it blocks with a PipeRead wait.
        table.set_current(b);
        read_from_pipe(&mut table, &pipe, B_BUF, 4);
        assert_eq!(table.get(b).unwrap().state, ProcessState::Waiting);
        assert_eq!(pipe.lock().read_waiter, Some(b));

        // A's write lands directly in B's buffer and wakes it.
        table.set_current(a);
        {
            let w = table.get_mut(a).unwrap();
            crate::memory::user::copy_to_user(&mut w.image, A_BUF, b"ping").unwrap();
        }
        write_to_pipe(&mut table, &pipe, A_BUF, 4);

        assert_eq!(table.get(b).unwrap().state, ProcessState::Runnable);
        assert!(pipe.lock().read_waiter.is_none());
        let r = table.get_mut(b).unwrap();
        let mut out = [0u8; 4];
        crate::memory::user::copy_from_user(&mut r.image, B_BUF, &mut out).unwrap();
        assert_eq!(&out, b"ping");
    }

    #[test]
    fn read_returns_short_when_all_writers_are_gone() {
        let (mut table, _a, b) = table_with_two_processes();
        let pipe = Pipe::new();
        pipe.lock().add_reader();
        // No writer endpoint at all.

        table.set_current(b);
        assert_eq!(read_from_pipe(&mut table, &pipe, B_BUF, 16), 0);
        assert_eq!(table.get(b).unwrap().state, ProcessState::Runnable);
    }
}

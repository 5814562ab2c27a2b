use super::process::ProcessState;
use super::ProcessTable;
use crate::fs::pipe::Pipe;
use crate::memory::user;
use crate::time::TimeSpec;
use alloc::sync::Arc;
use spin::Mutex;

/// Why a process is blocked. Installing one of these is the only way
/// into the WAITING state and is always done by the process itself;
/// removal is always done by a different actor (timer tick, keyboard
/// interrupt, or the pipe peer) exactly once.
pub enum WaitReason {
    /// Wake when the system clock passes this absolute time.
    Sleep { wake_at: TimeSpec },
    /// Line-buffered keyboard read into user memory.
    Keyboard { buf: u64, len: usize, filled: usize },
    /// Blocked pipe read; progress recorded in `filled`.
    PipeRead {
        pipe: Arc<Mutex<Pipe>>,
        buf: u64,
        len: usize,
        filled: usize,
    },
    /// Blocked pipe write; progress recorded in `written`. Writers
    /// queue FIFO on the pipe itself.
    PipeWrite {
        pipe: Arc<Mutex<Pipe>>,
        buf: u64,
        len: usize,
        written: usize,
    },
}

/// Block the current process on `reason`. The caller returns to the
/// dispatch loop afterwards; the process resumes only when its specific
/// wake condition fires.
pub fn block_current(table: &mut ProcessTable, reason: WaitReason) {
    let current = table.current_mut();
    debug_assert!(current.wait.is_none(), "double block");
    current.wait = Some(reason);
    current.state = ProcessState::Waiting;
}

/// Transition one waiting process back to RUNNABLE, consuming its wait
/// reason. No-ops if the process is not actually waiting, which keeps
/// wakeups exactly-once.
pub fn wake_slot(table: &mut ProcessTable, slot: usize) {
    if let Some(process) = table.get_mut(slot) {
        if process.state == ProcessState::Waiting {
            process.wait = None;
            process.state = ProcessState::Runnable;
        }
    }
}

/// Timer-driven scan: make every process whose sleep deadline has
/// passed RUNNABLE again.
pub fn wake_expired_sleepers(table: &mut ProcessTable, now: TimeSpec) {
    for slot in table.occupied_slots() {
        let process = match table.get_mut(slot) {
            Some(p) => p,
            None => continue,
        };
        if process.state != ProcessState::Waiting {
            continue;
        }
        let expired = matches!(
            process.wait,
            Some(WaitReason::Sleep { wake_at }) if wake_at <= now
        );
        if expired {
            process.wait = None;
            process.state = ProcessState::Runnable;
        }
    }
}

/// Keyboard interrupt delivery: feed decoded characters to the process
/// (if any) blocked on a keyboard read. Characters are echoed; a
/// newline or a full buffer completes the read.
pub fn deliver_key(table: &mut ProcessTable, mut next_char: impl FnMut() -> Option<u8>) {
    let Some(slot) = table.occupied_slots().into_iter().find(|&s| {
        table
            .get(s)
            .map(|p| {
                p.state == ProcessState::Waiting
                    && matches!(p.wait, Some(WaitReason::Keyboard { .. }))
            })
            .unwrap_or(false)
    }) else {
        return;
    };

    let process = table.get_mut(slot).unwrap();
    let (buf, len, mut filled) = match process.wait {
        Some(WaitReason::Keyboard { buf, len, filled }) => (buf, len, filled),
        _ => return,
    };

    let mut done = false;
    while filled < len {
        let Some(c) = next_char() else {
            // Queue drained and the line is not finished: stay blocked.
            match &mut process.wait {
                Some(WaitReason::Keyboard { filled: f, .. }) => *f = filled,
                _ => {}
            }
            return;
        };

        crate::print!("{}", c as char);
        if user::copy_to_user(&mut process.image, buf + filled as u64, &[c]).is_err() {
            // Bad buffer: complete the read with what fit.
            done = true;
            break;
        }
        filled += 1;

        if c == b'\n' {
            done = true;
            break;
        }
    }

    if done || filled == len {
        process.wait = None;
        process.state = ProcessState::Runnable;
    } else {
        match &mut process.wait {
            Some(WaitReason::Keyboard { filled: f, .. }) => *f = filled,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::spawn_bare;
    use crate::scheduler::ProcessTable;

    #[test]
    fn sleep_wakes_exactly_once_at_the_exact_tick() {
        let mut table = ProcessTable::new();
        let slot = spawn_bare(&mut table);
        table.get_mut(slot).unwrap().state = ProcessState::Runnable;

        // Sleep 10 ticks of 1s each, starting at t=0.
        let wake_at = TimeSpec::new(10, 0);
        table.set_current(slot);
        block_current(&mut table, WaitReason::Sleep { wake_at });
        assert_eq!(table.get(slot).unwrap().state, ProcessState::Waiting);

        // No earlier tick count may wake it.
        for second in 1..10u64 {
            wake_expired_sleepers(&mut table, TimeSpec::new(second, 0));
            assert_eq!(
                table.get(slot).unwrap().state,
                ProcessState::Waiting,
                "woke early at t={}",
                second
            );
        }

        // The tenth tick is the one that does.
        wake_expired_sleepers(&mut table, TimeSpec::new(10, 0));
        assert_eq!(table.get(slot).unwrap().state, ProcessState::Runnable);
        assert!(table.get(slot).unwrap().wait.is_none());

        // A later scan must not "wake" it again or disturb it.
        wake_expired_sleepers(&mut table, TimeSpec::new(12, 0));
        assert_eq!(table.get(slot).unwrap().state, ProcessState::Runnable);
    }

    #[test]
    fn wake_slot_is_exactly_once() {
        let mut table = ProcessTable::new();
        let slot = spawn_bare(&mut table);
        table.set_current(slot);
        block_current(
            &mut table,
            WaitReason::Sleep {
                wake_at: TimeSpec::new(100, 0),
            },
        );

        wake_slot(&mut table, slot);
        assert_eq!(table.get(slot).unwrap().state, ProcessState::Runnable);

        // Waking a runnable process changes nothing.
        wake_slot(&mut table, slot);
        assert_eq!(table.get(slot).unwrap().state, ProcessState::Runnable);
    }

    #[test]
    fn keyboard_delivery_completes_on_newline() {
        use crate::memory::SegmentFlags;

        let mut table = ProcessTable::new();
        let slot = spawn_bare(&mut table);
        table
            .get_mut(slot)
            .unwrap()
            .image
            .create_segment(
                0x4004_8000,
                4096,
                SegmentFlags::READ | SegmentFlags::WRITE,
                None,
            )
            .unwrap();

        table.set_current(slot);
        block_current(
            &mut table,
            WaitReason::Keyboard {
                buf: 0x4004_8000,
                len: 64,
                filled: 0,
            },
        );

        let mut input = alloc::vec![b'h', b'i', b'\n'].into_iter();
        deliver_key(&mut table, move || input.next());

        let process = table.get_mut(slot).unwrap();
        assert_eq!(process.state, ProcessState::Runnable);
        let mut out = [0u8; 3];
        user::copy_from_user(&mut process.image, 0x4004_8000, &mut out).unwrap();
        assert_eq!(&out, b"hi\n");
    }

    #[test]
    fn keyboard_delivery_stays_blocked_without_newline() {
        use crate::memory::SegmentFlags;

        let mut table = ProcessTable::new();
        let slot = spawn_bare(&mut table);
        table
            .get_mut(slot)
            .unwrap()
            .image
            .create_segment(
                0x4004_8000,
                4096,
                SegmentFlags::READ | SegmentFlags::WRITE,
                None,
            )
            .unwrap();

        table.set_current(slot);
        block_current(
            &mut table,
            WaitReason::Keyboard {
                buf: 0x4004_8000,
                len: 64,
                filled: 0,
            },
        );

        let mut input = alloc::vec![b'h', b'i'].into_iter();
        deliver_key(&mut table, move || input.next());

        let process = table.get(slot).unwrap();
        assert_eq!(process.state, ProcessState::Waiting);
        match process.wait {
            Some(WaitReason::Keyboard { filled, .. }) => assert_eq!(filled, 2),
            _ => panic!("expected a keyboard wait"),
        }
    }
}

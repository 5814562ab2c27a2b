use crate::time::TimeSpec;
use spin::Once;
use x86_64::instructions::port::Port;

const PIT_DATA_PORT: u16 = 0x40;
const PIT_COMMAND_PORT: u16 = 0x43;

/// PIT input clock is 3.579545 MHz / 3.
const PIT_HZ_NUM: u64 = 3_579_545;

static TICK_HANDLER: Once<fn(TimeSpec, bool)> = Once::new();
static TICK_SIZE: Once<TimeSpec> = Once::new();

/// Register the function invoked on every timer interrupt with the
/// tick length and whether user code was interrupted.
pub fn register_tick_callback(handler: fn(TimeSpec, bool)) {
    TICK_HANDLER.call_once(|| handler);
}

/// Program PIT channel 0 as a square wave with the given period in PIT
/// cycles. Mode 3 only handles even periods.
pub fn init(period: u16) {
    let actual_period = period & 0xFFFE;
    let nanos = (actual_period as u64) * 3 * 1_000_000_000 / PIT_HZ_NUM;
    TICK_SIZE.call_once(|| TimeSpec::new(0, nanos));

    let mut command: Port<u8> = Port::new(PIT_COMMAND_PORT);
    let mut data: Port<u8> = Port::new(PIT_DATA_PORT);
    unsafe {
        // Channel 0, access low+high, square wave, binary.
        command.write(0b0011_0110);
        data.write((actual_period & 0xFF) as u8);
        data.write((actual_period >> 8) as u8);
    }

    crate::log_info!(
        "PIT initialized: period {} cycles ({} ns per tick).",
        actual_period,
        nanos
    );
}

/// Timer ISR body, entered through the context-switch protocol.
pub extern "C" fn timer_interrupt(is_userspace: bool) {
    unsafe {
        crate::interrupts::idt::PICS
            .lock()
            .notify_end_of_interrupt(crate::interrupts::idt::InterruptIndex::Timer.as_u8());
    }
    if let (Some(step), Some(handler)) = (TICK_SIZE.get(), TICK_HANDLER.get()) {
        // May not return when user code was interrupted (the remainder
        // of the slice is yielded).
        handler(*step, is_userspace);
    }
}

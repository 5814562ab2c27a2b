pub mod keyboard;
pub mod pit;

/// Timer period in PIT cycles, ≈10 ms per tick.
const TIMER_PERIOD: u16 = 11932;

pub fn init() {
    pit::register_tick_callback(crate::scheduler::on_tick);
    keyboard::register_key_callback(crate::scheduler::on_key_event);
    pit::init(TIMER_PERIOD);
    keyboard::init();
    crate::log_info!("Drivers subsystem initialized.");
}

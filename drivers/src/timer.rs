//! PIT tick entry: the platform interrupt stub lands here once per
//! tick (~10 ms); the scheduler accounts the quantum and the command
//! scheduler runs anything due.

use core::sync::atomic::{AtomicU64, Ordering};

static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn handle_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    ferrox_core::sched::timer_tick();
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

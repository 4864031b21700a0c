use std::sync::atomic::{AtomicBool, Ordering};

/// At-most-one-run gate for a background pass.
///
/// A second caller arriving while a pass is running is turned away instead
/// of queueing behind it.
#[derive(Debug, Default)]
pub struct SingleFlight {
    running: AtomicBool,
}

/// Held while a pass runs; releases the gate on drop.
#[derive(Debug)]
pub struct FlightGuard<'a> {
    running: &'a AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<FlightGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                running: &self.running,
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

//! Bounded admission of in-flight executions.
//!
//! A counting semaphore that caps concurrent children and gives the
//! fuzzer a deterministic place to hang expensive periodic maintenance
//! (the kernel-leak scan): the hook runs once every `capacity` leaves.

use std::sync::{Condvar, Mutex};

pub type GateHook = Box<dyn Fn() + Send + Sync>;

pub struct Gate {
    capacity: usize,
    state: Mutex<GateState>,
    cond: Condvar,
    hook: Option<GateHook>,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    leaves: u64,
}

impl Gate {
    pub fn new(capacity: usize, hook: Option<GateHook>) -> Gate {
        assert!(capacity > 0, "gate requires a positive capacity");
        Gate {
            capacity,
            state: Mutex::new(GateState::default()),
            cond: Condvar::new(),
            hook,
        }
    }

    /// Blocks until a permit is available. The permit is released when
    /// the returned guard drops.
    pub fn enter(&self) -> GateGuard<'_> {
        let mut state = self.state.lock().unwrap();
        while state.in_flight == self.capacity {
            state = self.cond.wait(state).unwrap();
        }
        state.in_flight += 1;
        GateGuard { gate: self }
    }

    fn leave(&self) {
        let run_hook = {
            let mut state = self.state.lock().unwrap();
            assert!(state.in_flight > 0, "gate leave underflow");
            state.in_flight -= 1;
            state.leaves += 1;
            state.leaves % self.capacity as u64 == 0
        };
        self.cond.notify_one();
        if run_hook {
            if let Some(hook) = &self.hook {
                hook();
            }
        }
    }
}

pub struct GateGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn bounds_outstanding_permits() {
        let gate = Arc::new(Gate::new(4, None));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = Arc::clone(&gate);
            let in_flight = Arc::clone(&in_flight);
            let high_water = Arc::clone(&high_water);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _permit = gate.enter();
                    let cur = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(cur, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(50));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(high_water.load(Ordering::SeqCst) <= 4);
    }

    #[test]
    fn hook_runs_every_capacity_leaves() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let gate = Gate::new(3, Some(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        for _ in 0..7 {
            drop(gate.enter());
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn permits_are_reusable() {
        let gate = Gate::new(1, None);
        for _ in 0..10 {
            drop(gate.enter());
        }
    }
}

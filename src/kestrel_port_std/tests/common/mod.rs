//! Shared utilities for the kernel scenario tests.
#![allow(dead_code)]
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kestrel_port_std::PortInstance;

/// Drives one kernel scenario per process: boots the simulation and
/// requires an explicit success handshake before it shuts down.
pub struct KernelTestUtil {
    is_successful: AtomicBool,
}

impl KernelTestUtil {
    pub const fn new() -> Self {
        Self {
            is_successful: AtomicBool::new(false),
        }
    }

    /// Mark the scenario as passed and initiate shutdown.
    pub fn success<Traits: PortInstance>(&self) {
        self.is_successful.store(true, Ordering::Relaxed);
        kestrel_port_std::shutdown::<Traits>();
    }

    pub fn run(&self, func: impl FnOnce()) {
        let _ = env_logger::builder().is_test(true).try_init();

        func();

        if !self.is_successful.load(Ordering::Relaxed) {
            panic!("the program shut down without calling `success`");
        }
    }
}

/// Tracks the expected interleaving of a scenario as a monotonic step
/// counter.
pub struct SeqTracker {
    counter: AtomicUsize,
}

impl SeqTracker {
    pub const fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn get(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// Assert that the step counter is `old` and advance it to `new`.
    #[track_caller]
    pub fn expect_and_replace(&self, old: usize, new: usize) {
        match self
            .counter
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(actual) => panic!("expected step {old}, but the scenario is at step {actual}"),
        }
    }
}

//! The scheduler/timer seam.
//!
//! Thread creation, semaphores, locks, and the periodic timer are used only
//! abstractly by this crate: we never touch a real scheduler, only this
//! trait, so that an embedder can wire it to whatever kernel or userspace
//! scheduling primitives it actually has.

use alloc::boxed::Box;

/// Spawns detached background work and provides a tick-based sleep.
///
/// `spawn` must not block the caller: read-ahead relies on
/// this to return immediately. `sleep_ticks` suspends the *calling* task
/// (used only by the periodic flusher, which the embedder runs as its own
/// task) until at least that many ticks have elapsed.
pub trait Scheduler: Send + Sync {
    /// Runs `task` on a new, detached task/thread.
    fn spawn(&self, task: Box<dyn FnOnce() + Send + 'static>);

    /// Blocks the calling task for at least `ticks` timer ticks.
    fn sleep_ticks(&self, ticks: u64);
}

/// Diagnostic hooks the embedder can wire to its own console or logging
/// facade. Never affects correctness; every method has a no-op default.
pub trait Tracer: Send + Sync {
    /// Called whenever the clock hand selects a dirty victim and writes it
    /// back before reuse.
    fn on_evict(&self, _sector: u32) {}

    /// Called after `flush_all` completes, with the number of slots
    /// written back.
    fn on_flush(&self, _written: usize) {}

    /// Called when `grow` fails and any sectors allocated so far are being
    /// released.
    fn on_grow_fail(&self, _inumber: u32, _released: usize) {}
}

/// A `Tracer` that discards every event; the default when the embedder
/// does not care to observe the cache.
pub struct NullTracer;

impl Tracer for NullTracer {}

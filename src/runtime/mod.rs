//! Thread-based network runtime.
//!
//! Two thread pools cooperate: event loops poll for socket readiness and
//! translate it into event-bit signals, workers run the signalled tasks
//! (sessions, timers). All socket I/O happens on worker threads.

pub mod channel;
pub mod event_loop;
pub mod session;
pub mod tls;
pub mod worker;

use crate::config::RuntimeOptions;
use std::io;

/// The two thread groups every session is assigned from.
pub struct Runtime {
    pub workers: worker::WorkerGroup,
    pub event_loops: event_loop::EventLoopGroup,
}

impl Runtime {
    pub fn new(options: &RuntimeOptions) -> io::Result<Runtime> {
        Ok(Runtime {
            workers: worker::WorkerGroup::new(options.runtime.worker_threads)?,
            event_loops: event_loop::EventLoopGroup::new(options.runtime.event_loops)?,
        })
    }

    /// A runtime with explicit pool sizes; 0 selects hardware defaults.
    pub fn with_threads(workers: usize, event_loops: usize) -> io::Result<Runtime> {
        Ok(Runtime {
            workers: worker::WorkerGroup::new(workers)?,
            event_loops: event_loop::EventLoopGroup::new(event_loops)?,
        })
    }
}

//! Readiness reactor built on mio.
//!
//! Each `EventLoop` runs a poll thread translating socket readiness into
//! READ/WRITE event bits on the task registered for that descriptor. All
//! I/O keeps happening on worker threads; the reactor only signals.
//!
//! Registration is edge-triggered. Reregistering an fd (to add or drop
//! write interest) re-reports current readiness once, which the
//! write-interest-on-demand scheme relies on.

use crate::runtime::channel::SocketChannel;
use crate::runtime::worker::{events, TaskHandle};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const EVENT_CAPACITY: usize = 1024;

struct LoopShared {
    registry: Registry,
    running: AtomicBool,
    channels: Mutex<HashMap<RawFd, TaskHandle>>,
}

/// Cheap handle to one reactor thread.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

impl EventLoop {
    fn spawn(name: String) -> io::Result<(EventLoop, thread::JoinHandle<()>)> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let shared = Arc::new(LoopShared {
            registry,
            running: AtomicBool::new(true),
            channels: Mutex::new(HashMap::new()),
        });
        let handle = thread::Builder::new().name(name).spawn({
            let shared = Arc::clone(&shared);
            move || Self::run(poll, shared)
        })?;
        Ok((EventLoop { shared }, handle))
    }

    /// Register a channel, or update its interest set if already known.
    /// Read interest is always kept; `wants_write` adds write interest.
    /// The task mapping of a known descriptor is never replaced.
    pub fn add_channel(
        &self,
        channel: &SocketChannel,
        task: &TaskHandle,
        wants_write: bool,
    ) -> io::Result<()> {
        let fd = channel.raw_fd();
        let interests = if wants_write {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        let mut channels = self.shared.channels.lock().unwrap();
        let mut source = SourceFd(&fd);
        if channels.contains_key(&fd) {
            self.shared
                .registry
                .reregister(&mut source, Token(fd as usize), interests)?;
        } else {
            self.shared
                .registry
                .register(&mut source, Token(fd as usize), interests)?;
            channels.insert(fd, task.clone());
        }
        Ok(())
    }

    /// Deregister a channel. Must be called before its descriptor closes so
    /// a recycled fd can never signal a dead task.
    pub fn remove_channel(&self, channel: &SocketChannel) {
        let fd = channel.raw_fd();
        if self.shared.channels.lock().unwrap().remove(&fd).is_some() {
            if let Err(e) = self.shared.registry.deregister(&mut SourceFd(&fd)) {
                tracing::debug!(fd, "deregister failed: {}", e);
            }
        }
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    fn run(mut poll: Poll, shared: Arc<LoopShared>) {
        tracing::debug!("event loop started");
        let mut poll_events = Events::with_capacity(EVENT_CAPACITY);
        while shared.running.load(Ordering::SeqCst) {
            if let Err(e) = poll.poll(&mut poll_events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!("poll failed: {}", e);
                break;
            }

            for event in poll_events.iter() {
                let fd = event.token().0 as RawFd;
                let mut bits = events::NONE;
                // Close and error readiness surface as READ so the owning
                // session discovers EOF through a read attempt.
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    bits |= events::READ;
                }
                if event.is_writable() || event.is_write_closed() {
                    bits |= events::WRITE;
                }
                if bits == events::NONE {
                    continue;
                }
                let task = shared.channels.lock().unwrap().get(&fd).cloned();
                if let Some(task) = task {
                    task.signal(bits);
                }
            }
        }

        // Abandoned connections are killed; the owning worker destroys the
        // session, which closes the socket.
        let remaining: Vec<_> = {
            let mut channels = shared.channels.lock().unwrap();
            channels.drain().collect()
        };
        for (fd, task) in remaining {
            let _ = shared.registry.deregister(&mut SourceFd(&fd));
            task.signal(events::KILL);
        }
        tracing::debug!("event loop stopped");
    }
}

/// A pool of reactor threads with round-robin assignment.
pub struct EventLoopGroup {
    loops: Vec<EventLoop>,
    handles: Vec<thread::JoinHandle<()>>,
    next: Mutex<usize>,
}

impl EventLoopGroup {
    /// Spawn `threads` reactors; 0 selects the hardware concurrency.
    pub fn new(threads: usize) -> io::Result<EventLoopGroup> {
        let count = if threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            threads
        };

        let mut loops = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let (event_loop, handle) = EventLoop::spawn(format!("event-loop-{}", i))?;
            loops.push(event_loop);
            handles.push(handle);
        }

        Ok(EventLoopGroup {
            loops,
            handles,
            next: Mutex::new(0),
        })
    }

    /// Round-robin reactor selection.
    pub fn next(&self) -> EventLoop {
        let mut next = self.next.lock().unwrap();
        let event_loop = self.loops[*next % self.loops.len()].clone();
        *next = next.wrapping_add(1);
        event_loop
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.shutdown();
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::worker::{spawn_task, Task, WorkerGroup};
    use std::sync::atomic::AtomicUsize;

    struct ReadCounter {
        reads: Arc<AtomicUsize>,
    }

    impl Task for ReadCounter {
        fn handle_read(&mut self) -> bool {
            self.reads.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            if what() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_readiness_signals_registered_task() {
        let workers = WorkerGroup::new(1).unwrap();
        let loops = EventLoopGroup::new(1).unwrap();

        let listener = SocketChannel::bind("127.0.0.1", 0).unwrap();
        let port = listener.local_addr().unwrap().port();

        let reads = Arc::new(AtomicUsize::new(0));
        let task = spawn_task(
            &workers.next(),
            ReadCounter {
                reads: reads.clone(),
            },
        );
        let event_loop = loops.next();
        event_loop.add_channel(&listener, &task, false).unwrap();

        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        assert!(wait_until(|| reads.load(Ordering::SeqCst) > 0));

        event_loop.remove_channel(&listener);
    }
}

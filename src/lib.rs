//! An embeddable event-driven network runtime.
//!
//! A [`Runtime`] owns two thread groups: event loops polling socket
//! readiness and workers running task callbacks and timers. Sessions tie
//! a socket to a protocol decoder and a [`SessionLogic`], which receives
//! decoded messages and writes replies through a [`SessionWriter`] from
//! any thread.
//!
//! HTTP/1.1 and WebSocket codecs ship in [`protocols`], each in a
//! streaming flavor (heads and body pieces as they arrive) and a full
//! flavor (whole messages). The WebSocket logics run the HTTP upgrade
//! themselves and swap the session decoder once it completes.
//!
//! ```no_run
//! use wireloop::{bind, Runtime};
//!
//! let runtime = Runtime::new(&Default::default())?;
//! bind(&runtime, "0.0.0.0", 8080, move |_channel| {
//!     // build a ConnectedSession per accepted channel
//! })?;
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod protocols;
pub mod runtime;

pub use buffer::ByteBuf;
pub use error::SessionError;
pub use runtime::session::{
    bind, connect, start_session, ConnectedSession, ListenerSession, SessionControl,
    SessionLogic, SessionWriter, WriteCallback,
};
pub use runtime::Runtime;

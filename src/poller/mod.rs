//! C3: backend-independent poller facade.
//!
//! Wraps `mio` (which already abstracts epoll/poll/kqueue behind one API)
//! so the engines above never touch a platform-specific readiness
//! mechanism directly. Each specialized poller below exposes exactly the
//! interest set its socket kind needs; the composite types in
//! `composite` wire several of them to one shared backend so an engine
//! services all of its sockets from a single blocking `poll(timeout)`.

pub mod backend;
pub mod composite;
pub mod connecting;
pub mod listener;
pub mod reader;
pub mod writer;

pub use backend::{PollBackend, Readiness, SocketKind, TokenAllocator};
pub use composite::{ClientPoller, MeshPoller, ServerPoller};
pub use connecting::{ConnectingEvent, ConnectingPoller};
pub use listener::ListenerPoller;
pub use reader::ReaderPoller;
pub use writer::WriterPoller;

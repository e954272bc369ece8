//! Composite pollers (spec §4.3): combine the four specialized facades over
//! one shared backend so a single `poll(timeout)` call services every
//! socket an engine owns. `ClientPoller`/`ServerPoller` are the two named
//! combinations; `MeshPoller` is the superset the delivery engine (C5)
//! actually needs, since a mesh node is simultaneously a client (it
//! connects out to every discovered peer) and a server (it accepts
//! inbound channels).

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use super::backend::{PollBackend, Readiness, TokenAllocator};
use super::connecting::ConnectingPoller;
use super::listener::ListenerPoller;
use super::reader::ReaderPoller;
use super::writer::WriterPoller;

fn new_backend(capacity: usize) -> io::Result<Rc<RefCell<PollBackend>>> {
    Ok(Rc::new(RefCell::new(PollBackend::new(capacity)?)))
}

/// Connecting + reader + writer: everything a pure outbound client needs.
pub struct ClientPoller {
    backend: Rc<RefCell<PollBackend>>,
    pub connecting: ConnectingPoller,
    pub reader: ReaderPoller,
    pub writer: WriterPoller,
    pub tokens: TokenAllocator,
}

impl ClientPoller {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let backend = new_backend(events_capacity)?;
        Ok(Self {
            connecting: ConnectingPoller::new(backend.clone()),
            reader: ReaderPoller::new(backend.clone()),
            writer: WriterPoller::new(backend.clone()),
            backend,
            tokens: TokenAllocator::new(),
        })
    }

    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.backend.borrow_mut().poll(timeout)
    }
}

/// Listener + reader + writer: everything a pure inbound server needs.
pub struct ServerPoller {
    backend: Rc<RefCell<PollBackend>>,
    pub listener: ListenerPoller,
    pub reader: ReaderPoller,
    pub writer: WriterPoller,
    pub tokens: TokenAllocator,
}

impl ServerPoller {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let backend = new_backend(events_capacity)?;
        Ok(Self {
            listener: ListenerPoller::new(backend.clone()),
            reader: ReaderPoller::new(backend.clone()),
            writer: WriterPoller::new(backend.clone()),
            backend,
            tokens: TokenAllocator::new(),
        })
    }

    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.backend.borrow_mut().poll(timeout)
    }
}

/// Connecting + listener + reader + writer, all sharing one backend: the
/// combination the delivery engine (C5) uses, since a mesh node dials out
/// to discovered peers *and* accepts their inbound channel in the same
/// loop. Not named in spec §4.3's two examples, but it is the same
/// composition technique applied to a fourth, equally valid combination.
pub struct MeshPoller {
    backend: Rc<RefCell<PollBackend>>,
    pub connecting: ConnectingPoller,
    pub listener: ListenerPoller,
    pub reader: ReaderPoller,
    pub writer: WriterPoller,
    pub tokens: TokenAllocator,
}

impl MeshPoller {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        let backend = new_backend(events_capacity)?;
        Ok(Self {
            connecting: ConnectingPoller::new(backend.clone()),
            listener: ListenerPoller::new(backend.clone()),
            reader: ReaderPoller::new(backend.clone()),
            writer: WriterPoller::new(backend.clone()),
            backend,
            tokens: TokenAllocator::new(),
        })
    }

    /// Blocks up to `timeout`, dispatches ready events and returns the
    /// event count (spec §4.3: `poll(timeout)` "returns the count").
    pub fn poll(&self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.backend.borrow_mut().poll(timeout)
    }
}

//! Writer poller: one-shot writability wait.
//!
//! A caller arms `wait_for_write` only after a send attempt returned
//! `again`/`overflow`. Once `can_write` fires the registration is not
//! renewed automatically — spec §4.3 calls this out explicitly ("the
//! poller removes the registration until re-armed"), which keeps the
//! writer poller silent (and off the OS's ready list) whenever the
//! engine isn't backpressured.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use mio::net::TcpStream;
use mio::{Interest, Token};

use super::backend::{PollBackend, SocketKind};

pub struct WriterPoller {
    backend: Rc<RefCell<PollBackend>>,
}

impl WriterPoller {
    pub fn new(backend: Rc<RefCell<PollBackend>>) -> Self {
        Self { backend }
    }

    /// Arms (or re-arms) the one-shot writability wait.
    pub fn wait_for_write(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        let mut backend = self.backend.borrow_mut();
        // Re-registering is idempotent whether or not the token was already
        // armed — mio's register fails on duplicate, so fall back to
        // reregister for the common "already armed, arm again" case.
        if backend.register(stream, token, SocketKind::Writer, Interest::WRITABLE).is_err() {
            backend.reregister(stream, token, Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Disarms after a `can_write` event fires, per the one-shot contract.
    pub fn disarm(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.backend.borrow_mut().deregister(stream, token)
    }
}

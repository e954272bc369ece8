//! Listener poller: monitors bound+listening sockets for incoming connections.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use mio::net::TcpListener;
use mio::{Interest, Token};

use super::backend::{PollBackend, SocketKind};

pub struct ListenerPoller {
    backend: Rc<RefCell<PollBackend>>,
}

impl ListenerPoller {
    pub fn new(backend: Rc<RefCell<PollBackend>>) -> Self {
        Self { backend }
    }

    pub fn watch(&self, listener: &mut TcpListener, token: Token) -> io::Result<()> {
        self.backend
            .borrow_mut()
            .register(listener, token, SocketKind::Listener, Interest::READABLE)
    }

    pub fn stop(&self, listener: &mut TcpListener, token: Token) -> io::Result<()> {
        self.backend.borrow_mut().deregister(listener, token)
    }
}

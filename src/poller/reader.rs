//! Reader poller: monitors connected sockets for readability.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use mio::net::TcpStream;
use mio::{Interest, Token};

use super::backend::{PollBackend, SocketKind};

pub struct ReaderPoller {
    backend: Rc<RefCell<PollBackend>>,
}

impl ReaderPoller {
    pub fn new(backend: Rc<RefCell<PollBackend>>) -> Self {
        Self { backend }
    }

    pub fn watch(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.backend
            .borrow_mut()
            .register(stream, token, SocketKind::Reader, Interest::READABLE)
    }

    pub fn stop(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.backend.borrow_mut().deregister(stream, token)
    }

    pub fn forget(&self, token: Token) {
        self.backend.borrow_mut().forget(token);
    }
}

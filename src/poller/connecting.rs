//! Connecting poller: monitors sockets performing a non-blocking `connect()`.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use mio::net::TcpStream;
use mio::{Interest, Token};

use super::backend::{PollBackend, SocketKind};

#[derive(Debug, Clone, Copy)]
pub enum ConnectingEvent {
    Connected(Token),
    ConnectionRefused(Token, String),
    Failure(Token, String),
}

pub struct ConnectingPoller {
    backend: Rc<RefCell<PollBackend>>,
}

impl ConnectingPoller {
    pub fn new(backend: Rc<RefCell<PollBackend>>) -> Self {
        Self { backend }
    }

    /// Registers a socket currently mid-`connect()` for writability, which
    /// mio/epoll signals once the connect attempt resolves either way.
    pub fn watch(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.backend
            .borrow_mut()
            .register(stream, token, SocketKind::Connecting, Interest::WRITABLE)
    }

    pub fn stop(&self, stream: &mut TcpStream, token: Token) -> io::Result<()> {
        self.backend.borrow_mut().deregister(stream, token)
    }

    /// Resolves a writable-ready connecting socket into connected/refused/
    /// failure by inspecting `SO_ERROR` (the standard non-blocking connect
    /// idiom: readiness alone doesn't tell you which way it resolved).
    pub fn resolve(stream: &TcpStream, token: Token) -> ConnectingEvent {
        match stream.take_error() {
            Ok(None) => ConnectingEvent::Connected(token),
            Ok(Some(err)) => {
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
                ) {
                    ConnectingEvent::ConnectionRefused(token, err.to_string())
                } else {
                    ConnectingEvent::Failure(token, err.to_string())
                }
            }
            Err(err) => ConnectingEvent::Failure(token, err.to_string()),
        }
    }
}

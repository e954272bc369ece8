//! Shared backend for the four specialized pollers (C3).
//!
//! One `mio::Poll` per engine, wrapping whichever of epoll/poll/kqueue mio
//! picks for the host platform — this is what makes the facade
//! backend-independent per spec §4.3 without hand-rolling a backend per
//! platform. `Token`s double as the stable slab index of the account
//! (reader/writer/listener) they belong to, per the arena+index design
//! note in spec §9.
//!
//! Registration/deregistration is synchronous and immediate: mio's `Poll`
//! and `Events` are decoupled (an `Events` batch is a snapshot, not a
//! borrow of the registry), so callbacks invoked while iterating a batch
//! may freely re-arm or drop registrations for *this* poller. What spec
//! §4.3 actually requires deferred is mutation of the *account maps*
//! (readers/writers/peers) mid-iteration, which the owning engines
//! implement themselves via `defer_expire_peer`-style queues — see
//! `delivery::engine` and `discovery::engine`.

use std::collections::HashMap;
use std::io;
use std::time::Duration;

use mio::{Events, Interest, Poll, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketKind {
    Connecting,
    Listener,
    Reader,
    Writer,
}

#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub token: Token,
    pub kind: SocketKind,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Owns the OS-level poll instance. Does not own the sockets themselves —
/// callers must keep the `mio::event::Source` alive and pass it back in for
/// register/reregister/deregister, matching the spec's "sockets are owned
/// by exactly one account" invariant.
pub struct PollBackend {
    poll: Poll,
    events: Events,
    kinds: HashMap<Token, SocketKind>,
}

impl PollBackend {
    pub fn new(events_capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(events_capacity),
            kinds: HashMap::new(),
        })
    }

    pub fn register<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        kind: SocketKind,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)?;
        self.kinds.insert(token, kind);
        Ok(())
    }

    pub fn reregister<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    pub fn deregister<S: mio::event::Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
    ) -> io::Result<()> {
        let result = self.poll.registry().deregister(source);
        self.kinds.remove(&token);
        result
    }

    /// Forgets a token's kind without touching the OS registry (used when
    /// the socket itself is already gone, e.g. after the peer closed it).
    pub fn forget(&mut self, token: Token) {
        self.kinds.remove(&token);
    }

    /// Blocks up to `timeout`, dispatches readiness into `Readiness` events
    /// and returns them as an owned batch — safe for the caller to iterate
    /// while also calling back into `register`/`reregister`/`deregister`.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Readiness>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut ready = Vec::with_capacity(self.events.iter().count());
        for ev in self.events.iter() {
            let token = ev.token();
            let Some(kind) = self.kinds.get(&token).copied() else {
                continue;
            };
            ready.push(Readiness {
                token,
                kind,
                readable: ev.is_readable(),
                writable: ev.is_writable(),
                error: ev.is_error() || ev.is_read_closed() || ev.is_write_closed(),
            });
        }
        Ok(ready)
    }
}

/// Monotonic token allocator with free-list reuse, mirroring the arena+index
/// convention the rest of the engine uses for reader/writer accounts.
#[derive(Default)]
pub struct TokenAllocator {
    next: usize,
    free: Vec<usize>,
}

impl TokenAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> Token {
        let idx = self.free.pop().unwrap_or_else(|| {
            let idx = self.next;
            self.next += 1;
            idx
        });
        Token(idx)
    }

    pub fn free(&mut self, token: Token) {
        self.free.push(token.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_allocator_reuses_freed_slots() {
        let mut alloc = TokenAllocator::new();
        let a = alloc.alloc();
        let b = alloc.alloc();
        assert_ne!(a, b);
        alloc.free(a);
        let c = alloc.alloc();
        assert_eq!(a, c);
    }
}

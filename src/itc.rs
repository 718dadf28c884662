//! Inter-thread wake channel.
//!
//! `mio::Waker` is the eventfd/self-pipe analog: writing to it makes a
//! thread blocked in `poll` return.  Every command mailbox pairs a waker
//! with a mutexed queue, so list mutations requested from outside the event
//! thread (resume, shutdown, connection handoff) are applied on the next
//! loop turn rather than racing the poller.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use mio::net::TcpStream;
use mio::{Registry, Token, Waker};

pub(crate) enum Command {
    /// Accepted socket handed off by the listening thread.
    NewConnection(TcpStream, SocketAddr),
    /// Cross-thread resume of a suspended connection.  The generation guards
    /// against slab-slot reuse after the original connection died.
    Resume { key: usize, generation: u64 },
    /// Quiesce request; the receiving loop drains and exits.
    Shutdown,
}

pub(crate) struct Itc {
    queue: Mutex<VecDeque<Command>>,
    waker: Waker,
}

pub(crate) type ItcHandle = Arc<Itc>;

impl Itc {
    pub fn new(registry: &Registry, token: Token) -> io::Result<ItcHandle> {
        Ok(Arc::new(Itc {
            queue: Mutex::new(VecDeque::new()),
            waker: Waker::new(registry, token)?,
        }))
    }

    pub fn send(&self, cmd: Command) {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).push_back(cmd);
        let _ = self.waker.wake();
    }

    pub fn drain(&self) -> VecDeque<Command> {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        core::mem::take(&mut *queue)
    }
}

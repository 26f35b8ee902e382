//! Transport abstraction and the in-process network.

use crate::error::{ReplError, ReplResult};
use crate::message::{Envelope, Message, SiteId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Moves messages between the sites of a replication group.
///
/// Delivery may be lossy; the protocol recovers lost log records through
/// `LogRequest` and lost election traffic through timeouts.
pub trait Transport: Send + Sync {
    /// The local site.
    fn site_id(&self) -> SiteId;

    /// Sends a message to one site.
    fn send(&self, to: SiteId, message: &Message) -> ReplResult<()>;

    /// Sends a message to every other site; returns how many were reached.
    fn broadcast(&self, message: &Message) -> ReplResult<usize>;

    /// Waits up to `timeout` for the next message.
    fn recv(&self, timeout: Duration) -> ReplResult<Option<Envelope>>;
}

#[derive(Debug, Default)]
struct Mailbox {
    queue: Mutex<VecDeque<(SiteId, Vec<u8>)>>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct NetworkInner {
    sites: Mutex<HashMap<SiteId, Arc<Mailbox>>>,
    isolated: Mutex<HashSet<SiteId>>,
}

/// An in-process network connecting sites of one group, for tests and
/// groups embedded in a single process. Messages are CBOR encoded on
/// send and decoded on receive, as on a real wire.
#[derive(Debug, Clone, Default)]
pub struct InProcessNetwork {
    inner: Arc<NetworkInner>,
}

impl InProcessNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a site and returns its transport. Rejoining replaces the
    /// site's mailbox.
    pub fn join(&self, site: SiteId) -> InProcessTransport {
        let mailbox = Arc::new(Mailbox::default());
        self.inner.sites.lock().insert(site, Arc::clone(&mailbox));
        InProcessTransport {
            site,
            mailbox,
            net: Arc::clone(&self.inner),
        }
    }

    /// Cuts a site off: everything it sends or is sent is dropped.
    pub fn isolate(&self, site: SiteId) {
        self.inner.isolated.lock().insert(site);
        tracing::debug!(site, "site isolated");
    }

    /// Undoes [`isolate`](Self::isolate).
    pub fn reconnect(&self, site: SiteId) {
        self.inner.isolated.lock().remove(&site);
        tracing::debug!(site, "site reconnected");
    }

    /// Returns true if the site is cut off.
    pub fn is_isolated(&self, site: SiteId) -> bool {
        self.inner.isolated.lock().contains(&site)
    }
}

/// One site's end of an [`InProcessNetwork`].
#[derive(Debug)]
pub struct InProcessTransport {
    site: SiteId,
    mailbox: Arc<Mailbox>,
    net: Arc<NetworkInner>,
}

impl InProcessTransport {
    fn deliver(&self, to: SiteId, bytes: Vec<u8>) -> ReplResult<bool> {
        let mailbox = self
            .net
            .sites
            .lock()
            .get(&to)
            .cloned()
            .ok_or(ReplError::UnknownSite(to))?;
        {
            let isolated = self.net.isolated.lock();
            if isolated.contains(&self.site) || isolated.contains(&to) {
                return Ok(false);
            }
        }
        mailbox.queue.lock().push_back((self.site, bytes));
        mailbox.ready.notify_one();
        Ok(true)
    }
}

impl Transport for InProcessTransport {
    fn site_id(&self) -> SiteId {
        self.site
    }

    fn send(&self, to: SiteId, message: &Message) -> ReplResult<()> {
        self.deliver(to, message.encode()?)?;
        Ok(())
    }

    fn broadcast(&self, message: &Message) -> ReplResult<usize> {
        let bytes = message.encode()?;
        let mut targets: Vec<SiteId> = self
            .net
            .sites
            .lock()
            .keys()
            .copied()
            .filter(|&s| s != self.site)
            .collect();
        targets.sort_unstable();
        let mut reached = 0;
        for to in targets {
            if self.deliver(to, bytes.clone())? {
                reached += 1;
            }
        }
        Ok(reached)
    }

    fn recv(&self, timeout: Duration) -> ReplResult<Option<Envelope>> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.mailbox.queue.lock();
        loop {
            if let Some((from, bytes)) = queue.pop_front() {
                drop(queue);
                let message = Message::decode(&bytes)?;
                return Ok(Some(Envelope { from, message }));
            }
            if self.mailbox.ready.wait_until(&mut queue, deadline).timed_out() {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_receive() {
        let net = InProcessNetwork::new();
        let a = net.join(1);
        let b = net.join(2);
        a.send(2, &Message::MasterQuery).unwrap();
        let got = b.recv(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(got.from, 1);
        assert_eq!(got.message, Message::MasterQuery);
        assert!(b.recv(Duration::from_millis(10)).unwrap().is_none());
    }

    #[test]
    fn broadcast_skips_sender() {
        let net = InProcessNetwork::new();
        let a = net.join(1);
        let b = net.join(2);
        let c = net.join(3);
        let msg = Message::NewMaster { gen: 1, site: 1 };
        assert_eq!(a.broadcast(&msg).unwrap(), 2);
        assert!(a.recv(Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(b.recv(Duration::ZERO).unwrap().unwrap().message, msg);
        assert_eq!(c.recv(Duration::ZERO).unwrap().unwrap().message, msg);
    }

    #[test]
    fn isolated_sites_lose_messages() {
        let net = InProcessNetwork::new();
        let a = net.join(1);
        let b = net.join(2);
        net.isolate(2);
        assert_eq!(a.broadcast(&Message::MasterQuery).unwrap(), 0);
        b.send(1, &Message::MasterQuery).unwrap();
        assert!(a.recv(Duration::from_millis(10)).unwrap().is_none());
        net.reconnect(2);
        b.send(1, &Message::MasterQuery).unwrap();
        assert!(a.recv(Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn unknown_site() {
        let net = InProcessNetwork::new();
        let a = net.join(1);
        assert!(matches!(
            a.send(9, &Message::MasterQuery),
            Err(ReplError::UnknownSite(9))
        ));
    }
}

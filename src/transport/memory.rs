//! An in-process [`Transport`]: every bound host lives in one shared [`MemoryNetwork`].
//!
//! Delivery is instant, lossless and ordered. Connection semantics follow ENet: both sides see
//! a connect event, a graceful disconnect notifies both sides, an immediate disconnect only
//! notifies the remote side, and connecting to an address nobody is bound to never completes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use web_time::{Duration, Instant};

use super::{
    Channel, PeerId, PeerState, Reliability, Transport, TransportEvent, TransportFactory,
};
use crate::NetplayError;

/// Longest single sleep while [`MemoryTransport::poll`] waits for an event.
const POLL_SLICE: Duration = Duration::from_millis(1);
/// First port handed out by [`MemoryNetwork::bind_any`].
const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Debug)]
struct Link {
    remote_addr: SocketAddr,
    /// Our id on the remote host; `None` until the connection completes.
    remote_peer: Option<PeerId>,
    state: PeerState,
}

#[derive(Debug, Default)]
struct HostQueue {
    events: VecDeque<TransportEvent>,
    links: BTreeMap<PeerId, Link>,
    next_peer: u32,
}

impl HostQueue {
    fn allocate_peer(&mut self) -> PeerId {
        let peer = PeerId::new(self.next_peer);
        self.next_peer = self.next_peer.wrapping_add(1);
        peer
    }
}

#[derive(Debug, Default)]
struct Hub {
    hosts: BTreeMap<SocketAddr, HostQueue>,
    severed: BTreeSet<(SocketAddr, SocketAddr)>,
}

fn pair(a: SocketAddr, b: SocketAddr) -> (SocketAddr, SocketAddr) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl Hub {
    /// Removes the link on both hosts. Each host in `notify` gets a disconnect event.
    fn tear_down(&mut self, addr: SocketAddr, peer: PeerId, notify_local: bool, notify_remote: bool) {
        let Some(link) = self.hosts.get_mut(&addr).and_then(|h| h.links.remove(&peer)) else {
            return;
        };
        if notify_local {
            if let Some(host) = self.hosts.get_mut(&addr) {
                host.events.push_back(TransportEvent::Disconnected { peer });
            }
        }
        let Some(remote_peer) = link.remote_peer else {
            return;
        };
        if let Some(remote) = self.hosts.get_mut(&link.remote_addr) {
            if remote.links.remove(&remote_peer).is_some() && notify_remote {
                remote
                    .events
                    .push_back(TransportEvent::Disconnected { peer: remote_peer });
            }
        }
    }
}

/// A network of in-process hosts. Cloning shares the network.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a host to `127.0.0.1:port`.
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if the port is taken.
    pub fn bind(&self, port: u16) -> Result<MemoryTransport, NetplayError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let mut hub = self.hub.lock();
        if hub.hosts.contains_key(&addr) {
            return Err(NetplayError::Transport {
                context: format!("address {addr} is already bound"),
            });
        }
        hub.hosts.insert(addr, HostQueue::default());
        debug!("Bound memory transport at {}", addr);
        Ok(MemoryTransport {
            addr,
            hub: Arc::clone(&self.hub),
        })
    }

    /// Binds a host to the lowest free ephemeral port.
    ///
    /// # Errors
    /// Returns [`NetplayError::Transport`] if every ephemeral port is taken.
    pub fn bind_any(&self) -> Result<MemoryTransport, NetplayError> {
        let port = {
            let hub = self.hub.lock();
            (EPHEMERAL_PORT_START..=u16::MAX).find(|&port| {
                !hub.hosts
                    .contains_key(&SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            })
        };
        match port {
            Some(port) => self.bind(port),
            None => Err(NetplayError::Transport {
                context: "no free ephemeral port".to_owned(),
            }),
        }
    }

    /// Cuts every connection between `a` and `b` as if it timed out, and makes new connection
    /// attempts between them hang until [`heal`](Self::heal).
    pub fn sever(&self, a: SocketAddr, b: SocketAddr) {
        let mut hub = self.hub.lock();
        hub.severed.insert(pair(a, b));
        let doomed: Vec<PeerId> = hub
            .hosts
            .get(&a)
            .map(|host| {
                host.links
                    .iter()
                    .filter(|(_, link)| link.remote_addr == b)
                    .map(|(&peer, _)| peer)
                    .collect()
            })
            .unwrap_or_default();
        for peer in doomed {
            hub.tear_down(a, peer, true, true);
        }
    }

    /// Allows `a` and `b` to connect again.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        self.hub.lock().severed.remove(&pair(a, b));
    }

    /// Number of live links a host has.
    #[must_use]
    pub fn link_count(&self, addr: SocketAddr) -> usize {
        self.hub
            .lock()
            .hosts
            .get(&addr)
            .map_or(0, |host| {
                host.links
                    .values()
                    .filter(|link| link.state == PeerState::Connected)
                    .count()
            })
    }
}

impl TransportFactory for MemoryNetwork {
    fn open(&self, port: Option<u16>) -> Result<Box<dyn Transport>, NetplayError> {
        let transport = match port {
            Some(port) => self.bind(port)?,
            None => self.bind_any()?,
        };
        Ok(Box::new(transport))
    }
}

/// One host bound to a [`MemoryNetwork`]. Dropping it disconnects all of its peers.
#[derive(Debug)]
pub struct MemoryTransport {
    addr: SocketAddr,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    fn with_link<R>(&self, peer: PeerId, f: impl FnOnce(&Link) -> R) -> Option<R> {
        let hub = self.hub.lock();
        hub.hosts
            .get(&self.addr)
            .and_then(|host| host.links.get(&peer))
            .map(f)
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&mut self, addr: SocketAddr, data: u32) -> Result<PeerId, NetplayError> {
        if addr == self.addr {
            return Err(NetplayError::Transport {
                context: "cannot connect to ourselves".to_owned(),
            });
        }
        let mut hub = self.hub.lock();
        let reachable = hub.hosts.contains_key(&addr) && !hub.severed.contains(&pair(self.addr, addr));
        let local = hub
            .hosts
            .get_mut(&self.addr)
            .ok_or_else(|| NetplayError::Transport {
                context: format!("{} is no longer bound", self.addr),
            })?;
        let peer = local.allocate_peer();
        local.links.insert(
            peer,
            Link {
                remote_addr: addr,
                remote_peer: None,
                state: PeerState::Connecting,
            },
        );
        if !reachable {
            trace!("{} connecting to unreachable {}", self.addr, addr);
            return Ok(peer);
        }

        let remote_peer = match hub.hosts.get_mut(&addr) {
            Some(remote) => {
                let remote_peer = remote.allocate_peer();
                remote.links.insert(
                    remote_peer,
                    Link {
                        remote_addr: self.addr,
                        remote_peer: Some(peer),
                        state: PeerState::Connected,
                    },
                );
                remote.events.push_back(TransportEvent::Connected {
                    peer: remote_peer,
                    data,
                });
                remote_peer
            },
            None => return Ok(peer),
        };
        if let Some(local) = hub.hosts.get_mut(&self.addr) {
            if let Some(link) = local.links.get_mut(&peer) {
                link.remote_peer = Some(remote_peer);
                link.state = PeerState::Connected;
            }
            local
                .events
                .push_back(TransportEvent::Connected { peer, data: 0 });
        }
        Ok(peer)
    }

    fn send(
        &mut self,
        peer: PeerId,
        channel: Channel,
        payload: &[u8],
        _reliability: Reliability,
    ) -> Result<(), NetplayError> {
        let mut hub = self.hub.lock();
        let (remote_addr, remote_peer) = hub
            .hosts
            .get(&self.addr)
            .and_then(|host| host.links.get(&peer))
            .filter(|link| link.state == PeerState::Connected)
            .and_then(|link| link.remote_peer.map(|rp| (link.remote_addr, rp)))
            .ok_or_else(|| NetplayError::Transport {
                context: format!("{peer} is not connected"),
            })?;

        match hub.hosts.get_mut(&remote_addr) {
            // A remote that reset its side silently swallows the packet.
            Some(remote) if remote.links.contains_key(&remote_peer) => {
                remote.events.push_back(TransportEvent::Received {
                    peer: remote_peer,
                    channel,
                    payload: payload.to_vec(),
                });
            },
            _ => trace!("{} dropped packet to vanished {}", self.addr, peer),
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Option<TransportEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self
                .hub
                .lock()
                .hosts
                .get_mut(&self.addr)
                .and_then(|host| host.events.pop_front())
            {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(std::cmp::min(deadline - now, POLL_SLICE));
        }
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.hub.lock().tear_down(self.addr, peer, true, true);
    }

    fn disconnect_now(&mut self, peer: PeerId) {
        self.hub.lock().tear_down(self.addr, peer, false, true);
    }

    fn disconnect_later(&mut self, peer: PeerId) {
        // Nothing is ever queued in flight.
        self.disconnect(peer);
    }

    fn reset_peer(&mut self, peer: PeerId) {
        let mut hub = self.hub.lock();
        if let Some(host) = hub.hosts.get_mut(&self.addr) {
            host.links.remove(&peer);
        }
    }

    fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.with_link(peer, |link| link.remote_addr)
    }

    fn peer_state(&self, peer: PeerId) -> PeerState {
        self.with_link(peer, |link| link.state)
            .unwrap_or(PeerState::Disconnected)
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let mut hub = self.hub.lock();
        let peers: Vec<PeerId> = hub
            .hosts
            .get(&self.addr)
            .map(|host| host.links.keys().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            hub.tear_down(self.addr, peer, false, true);
        }
        hub.hosts.remove(&self.addr);
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn connected_pair() -> (MemoryNetwork, MemoryTransport, MemoryTransport, PeerId, PeerId) {
        let network = MemoryNetwork::new();
        let mut a = network.bind(1000).unwrap();
        let mut b = network.bind(1001).unwrap();
        let a_to_b = a.connect(b.local_addr(), 42).unwrap();
        let Some(TransportEvent::Connected { peer: b_to_a, data }) = b.poll(Duration::ZERO) else {
            panic!("b saw no connect");
        };
        assert_eq!(data, 42);
        assert_eq!(
            a.poll(Duration::ZERO),
            Some(TransportEvent::Connected {
                peer: a_to_b,
                data: 0
            })
        );
        (network, a, b, a_to_b, b_to_a)
    }

    #[test]
    fn factory_picks_free_ephemeral_ports() {
        let network = MemoryNetwork::new();
        let first = network.open(None).unwrap();
        let second = network.open(None).unwrap();
        assert_eq!(first.local_addr().port(), EPHEMERAL_PORT_START);
        assert_eq!(second.local_addr().port(), EPHEMERAL_PORT_START + 1);
        assert_eq!(network.open(Some(7000)).unwrap().local_addr().port(), 7000);
    }

    #[test]
    fn bind_twice_fails() {
        let network = MemoryNetwork::new();
        let _a = network.bind(1000).unwrap();
        assert!(network.bind(1000).is_err());
    }

    #[test]
    fn packets_arrive_in_order_on_their_channel() {
        let (_network, mut a, mut b, a_to_b, b_to_a) = connected_pair();
        a.send(a_to_b, Channel::Control, &[1], Reliability::Reliable)
            .unwrap();
        a.send(a_to_b, Channel::Rollback, &[2], Reliability::Unreliable)
            .unwrap();
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Received {
                peer: b_to_a,
                channel: Channel::Control,
                payload: vec![1]
            })
        );
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Received {
                peer: b_to_a,
                channel: Channel::Rollback,
                payload: vec![2]
            })
        );
        assert_eq!(b.poll(Duration::ZERO), None);
    }

    #[test]
    fn graceful_disconnect_notifies_both_sides() {
        let (_network, mut a, mut b, a_to_b, b_to_a) = connected_pair();
        a.disconnect(a_to_b);
        assert_eq!(
            a.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: a_to_b })
        );
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: b_to_a })
        );
        assert_eq!(a.peer_state(a_to_b), PeerState::Disconnected);
    }

    #[test]
    fn disconnect_now_is_silent_locally() {
        let (_network, mut a, mut b, a_to_b, b_to_a) = connected_pair();
        a.disconnect_now(a_to_b);
        assert_eq!(a.poll(Duration::ZERO), None);
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: b_to_a })
        );
    }

    #[test]
    fn unreachable_connect_never_completes() {
        let network = MemoryNetwork::new();
        let mut a = network.bind(1000).unwrap();
        let target: SocketAddr = "127.0.0.1:4444".parse().unwrap();
        let peer = a.connect(target, 0).unwrap();
        assert_eq!(a.peer_state(peer), PeerState::Connecting);
        assert_eq!(a.poll(Duration::from_millis(2)), None);
        assert!(a
            .send(peer, Channel::Control, &[0], Reliability::Reliable)
            .is_err());
    }

    #[test]
    fn sever_drops_links_and_blocks_reconnects() {
        let (network, mut a, mut b, a_to_b, b_to_a) = connected_pair();
        network.sever(a.local_addr(), b.local_addr());
        assert_eq!(
            a.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: a_to_b })
        );
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: b_to_a })
        );

        let retry = a.connect(b.local_addr(), 0).unwrap();
        assert_eq!(a.peer_state(retry), PeerState::Connecting);

        network.heal(a.local_addr(), b.local_addr());
        let again = a.connect(b.local_addr(), 0).unwrap();
        assert_eq!(a.peer_state(again), PeerState::Connected);
    }

    #[test]
    fn dropping_a_host_disconnects_its_peers() {
        let (network, a, mut b, _a_to_b, b_to_a) = connected_pair();
        let a_addr = a.local_addr();
        drop(a);
        assert_eq!(
            b.poll(Duration::ZERO),
            Some(TransportEvent::Disconnected { peer: b_to_a })
        );
        assert_eq!(network.link_count(a_addr), 0);
        assert_eq!(network.link_count(b.local_addr()), 0);
    }

    #[test]
    fn reset_peer_forgets_silently() {
        let (_network, mut a, mut b, a_to_b, b_to_a) = connected_pair();
        a.reset_peer(a_to_b);
        assert_eq!(a.peer_state(a_to_b), PeerState::Disconnected);
        assert_eq!(b.peer_state(b_to_a), PeerState::Connected);
        b.send(b_to_a, Channel::Control, &[9], Reliability::Reliable)
            .unwrap();
        assert_eq!(a.poll(Duration::ZERO), None);
    }
}

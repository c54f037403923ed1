//! Transport abstraction and the in-memory test network.
//!
//! The core talks to the outside world exclusively through [`Transport`].
//! [`LocalHub`] is the in-process implementation used by the test suites: a
//! star network with per-link latency and loss, driven by a virtual clock so
//! every run is deterministic. Messages still pass through the real rkyv
//! codec, so wire-format regressions surface here too.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::ids::{PeerId, SERVER_PEER};
use crate::protocol::{Channel, NetMessage};

pub trait Transport {
    fn is_server(&self) -> bool;
    fn local_peer_id(&self) -> PeerId;
    fn connected_peers(&self) -> Vec<PeerId>;
    fn send(&mut self, peer: PeerId, channel: Channel, message: NetMessage);
    fn broadcast(&mut self, channel: Channel, message: NetMessage);
    /// Drains one inbound message, oldest first.
    fn poll(&mut self) -> Option<(PeerId, NetMessage)>;
}

/// Simulated link conditions, per destination peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkConditions {
    /// One-way latency applied to each direction, in milliseconds.
    pub latency_ms: f32,
    /// Unreliable-channel drop chance in `[0, 1]`. Reliable messages are
    /// never dropped.
    pub loss: f32,
}

struct InFlight {
    deliver_at_ms: f64,
    from: PeerId,
    to: PeerId,
    bytes: Vec<u8>,
}

struct HubInner {
    now_ms: f64,
    peers: Vec<PeerId>,
    conditions: Vec<(PeerId, LinkConditions)>,
    in_flight: Vec<InFlight>,
    inboxes: Vec<(PeerId, VecDeque<(PeerId, NetMessage)>)>,
    rng_state: u64,
}

impl HubInner {
    fn conditions_for(&self, peer: PeerId) -> LinkConditions {
        self.conditions
            .iter()
            .find(|(p, _)| *p == peer)
            .map(|(_, c)| *c)
            .unwrap_or_default()
    }

    fn next_rand(&mut self) -> f32 {
        // xorshift64*; seeded, so failures reproduce.
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        ((x.wrapping_mul(0x2545F4914F6CDD1D) >> 40) as f32) / ((1u64 << 24) as f32)
    }

    fn enqueue(&mut self, from: PeerId, to: PeerId, channel: Channel, message: &NetMessage) {
        // The remote end of the link decides latency/loss for both
        // directions; the server side is condition-free.
        let remote = if from == SERVER_PEER { to } else { from };
        let conditions = self.conditions_for(remote);

        if channel == Channel::Unreliable && conditions.loss > 0.0 {
            if self.next_rand() < conditions.loss {
                return;
            }
        }

        let bytes = match message.serialize() {
            Ok(b) => b,
            Err(e) => {
                log::error!("dropping unserializable message: {}", e);
                return;
            }
        };

        self.in_flight.push(InFlight {
            deliver_at_ms: self.now_ms + (conditions.latency_ms / 2.0) as f64,
            from,
            to,
            bytes,
        });
    }

    fn advance(&mut self, delta_ms: f64) {
        self.now_ms += delta_ms;
        let now = self.now_ms;

        let mut due: Vec<InFlight> = Vec::new();
        let mut i = 0;
        while i < self.in_flight.len() {
            if self.in_flight[i].deliver_at_ms <= now {
                due.push(self.in_flight.remove(i));
            } else {
                i += 1;
            }
        }
        due.sort_by(|a, b| a.deliver_at_ms.total_cmp(&b.deliver_at_ms));

        for flight in due {
            let message = match NetMessage::deserialize(&flight.bytes) {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("dropping undecodable message: {}", e);
                    continue;
                }
            };
            if let Some((_, inbox)) = self.inboxes.iter_mut().find(|(p, _)| *p == flight.to) {
                inbox.push_back((flight.from, message));
            }
        }
    }
}

/// An in-memory star network: one server endpoint plus client endpoints.
#[derive(Clone)]
pub struct LocalHub {
    inner: Rc<RefCell<HubInner>>,
}

impl LocalHub {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Rc::new(RefCell::new(HubInner {
                now_ms: 0.0,
                peers: Vec::new(),
                conditions: Vec::new(),
                in_flight: Vec::new(),
                inboxes: Vec::new(),
                rng_state: seed | 1,
            })),
        }
    }

    pub fn server_endpoint(&self) -> LocalEndpoint {
        self.endpoint(SERVER_PEER)
    }

    pub fn client_endpoint(&self, peer: PeerId) -> LocalEndpoint {
        assert_ne!(peer, SERVER_PEER);
        self.endpoint(peer)
    }

    fn endpoint(&self, peer: PeerId) -> LocalEndpoint {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.peers.contains(&peer) {
                inner.peers.push(peer);
                inner.inboxes.push((peer, VecDeque::new()));
            }
        }
        LocalEndpoint {
            inner: self.inner.clone(),
            peer,
        }
    }

    /// Configures the link between the server and `peer`, both directions.
    pub fn set_link_conditions(&self, peer: PeerId, conditions: LinkConditions) {
        let mut inner = self.inner.borrow_mut();
        if let Some(entry) = inner.conditions.iter_mut().find(|(p, _)| *p == peer) {
            entry.1 = conditions;
        } else {
            inner.conditions.push((peer, conditions));
        }
    }

    /// Round-trip time currently configured towards `peer`, as a real
    /// transport would report it from its ack tracking.
    pub fn round_trip_ms(&self, peer: PeerId) -> f32 {
        self.inner.borrow().conditions_for(peer).latency_ms
    }

    /// Moves the virtual clock forward, delivering due messages.
    pub fn advance(&self, delta_sec: f32) {
        self.inner.borrow_mut().advance(delta_sec as f64 * 1000.0);
    }

    pub fn disconnect(&self, peer: PeerId) {
        let mut inner = self.inner.borrow_mut();
        inner.peers.retain(|p| *p != peer);
        inner.inboxes.retain(|(p, _)| *p != peer);
        inner.in_flight.retain(|f| f.to != peer && f.from != peer);
    }
}

pub struct LocalEndpoint {
    inner: Rc<RefCell<HubInner>>,
    peer: PeerId,
}

impl Transport for LocalEndpoint {
    fn is_server(&self) -> bool {
        self.peer == SERVER_PEER
    }

    fn local_peer_id(&self) -> PeerId {
        self.peer
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let inner = self.inner.borrow();
        if self.peer == SERVER_PEER {
            inner
                .peers
                .iter()
                .copied()
                .filter(|p| *p != SERVER_PEER)
                .collect()
        } else if inner.peers.contains(&SERVER_PEER) {
            vec![SERVER_PEER]
        } else {
            Vec::new()
        }
    }

    fn send(&mut self, peer: PeerId, channel: Channel, message: NetMessage) {
        self.inner
            .borrow_mut()
            .enqueue(self.peer, peer, channel, &message);
    }

    fn broadcast(&mut self, channel: Channel, message: NetMessage) {
        let peers = self.connected_peers();
        let mut inner = self.inner.borrow_mut();
        for peer in peers {
            inner.enqueue(self.peer, peer, channel, &message);
        }
    }

    fn poll(&mut self) -> Option<(PeerId, NetMessage)> {
        let mut inner = self.inner.borrow_mut();
        inner
            .inboxes
            .iter_mut()
            .find(|(p, _)| *p == self.peer)
            .and_then(|(_, inbox)| inbox.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_latency_delivers_on_advance() {
        let hub = LocalHub::new(7);
        let mut server = hub.server_endpoint();
        let mut client = hub.client_endpoint(2);

        server.send(2, Channel::Reliable, NetMessage::NotifyPeerStatus { enabled: true });
        assert!(client.poll().is_none());

        hub.advance(0.0);
        let (from, msg) = client.poll().unwrap();
        assert_eq!(from, SERVER_PEER);
        assert_eq!(msg, NetMessage::NotifyPeerStatus { enabled: true });
    }

    #[test]
    fn latency_delays_delivery() {
        let hub = LocalHub::new(7);
        let mut server = hub.server_endpoint();
        let mut client = hub.client_endpoint(2);
        hub.set_link_conditions(
            2,
            LinkConditions {
                latency_ms: 100.0,
                loss: 0.0,
            },
        );

        server.send(2, Channel::Unreliable, NetMessage::NotifyNeedFullSnapshot);
        hub.advance(0.016);
        assert!(client.poll().is_none());

        hub.advance(0.050);
        assert!(client.poll().is_some());
    }

    #[test]
    fn full_loss_drops_unreliable_only() {
        let hub = LocalHub::new(7);
        let mut server = hub.server_endpoint();
        let mut client = hub.client_endpoint(2);
        hub.set_link_conditions(
            2,
            LinkConditions {
                latency_ms: 0.0,
                loss: 1.0,
            },
        );

        server.send(2, Channel::Unreliable, NetMessage::NotifyNeedFullSnapshot);
        server.send(2, Channel::Reliable, NetMessage::NotifyPeerStatus { enabled: true });
        hub.advance(0.0);

        let (_, msg) = client.poll().unwrap();
        assert_eq!(msg, NetMessage::NotifyPeerStatus { enabled: true });
        assert!(client.poll().is_none());
    }

    #[test]
    fn broadcast_reaches_all_clients() {
        let hub = LocalHub::new(9);
        let mut server = hub.server_endpoint();
        let mut c2 = hub.client_endpoint(2);
        let mut c3 = hub.client_endpoint(3);

        server.broadcast(Channel::Reliable, NetMessage::NotifyNeedFullSnapshot);
        hub.advance(0.0);

        assert!(c2.poll().is_some());
        assert!(c3.poll().is_some());
    }

    #[test]
    fn client_sees_only_the_server() {
        let hub = LocalHub::new(9);
        let _server = hub.server_endpoint();
        let client = hub.client_endpoint(2);
        let _other = hub.client_endpoint(3);

        assert_eq!(client.connected_peers(), vec![SERVER_PEER]);
    }
}

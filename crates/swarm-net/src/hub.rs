//! The hub: request/response plumbing between peers.
//!
//! Every process owns one [`Hub`]. Outbound, it offers `request` /
//! `try_request` / broadcast; inbound, it dispatches messages to
//! handlers registered by kind. Each inbound connection gets its own
//! worker thread, so handlers for one connection run serially in
//! arrival order while different connections proceed in parallel.
//!
//! [`HubNetwork`] is the in-process routing table connecting hubs of a
//! swarm that shares one address space. The wire transport behind a
//! real deployment is an external collaborator with the same surface.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use swarm_common::constants::RPC_TIMEOUT_MS;
use swarm_common::{PeerId, SwarmError, SwarmResult};

use crate::message::{Message, DISCOVERY};

/// A registered message handler.
pub type Handler = Arc<dyn Fn(&Message) -> Message + Send + Sync>;

/// Discovery announcement payload.
#[derive(Debug, Serialize, Deserialize)]
struct DiscoveryAnnouncement {
    peer_address: String,
}

struct Envelope {
    request: Message,
    reply: Sender<Message>,
}

struct HubShared {
    peer: PeerId,
    handlers: DashMap<String, Handler>,
    inboxes: Mutex<HashMap<PeerId, Sender<Envelope>>>,
    known_peers: RwLock<BTreeSet<PeerId>>,
}

impl HubShared {
    fn inbox_for(self: &Arc<Self>, from: PeerId) -> Sender<Envelope> {
        let mut inboxes = self.inboxes.lock();
        if let Some(sender) = inboxes.get(&from) {
            return sender.clone();
        }
        let (sender, receiver) = unbounded();
        inboxes.insert(from.clone(), sender.clone());
        let shared = Arc::clone(self);
        thread::spawn(move || shared.serve_connection(&from, &receiver));
        sender
    }

    fn serve_connection(&self, from: &PeerId, receiver: &Receiver<Envelope>) {
        for envelope in receiver.iter() {
            let handler = self
                .handlers
                .get(envelope.request.kind())
                .map(|entry| Arc::clone(entry.value()));
            let response = match handler {
                Some(handler) => handler(&envelope.request),
                None => {
                    warn!(
                        peer = %self.peer,
                        kind = envelope.request.kind(),
                        "no handler registered, declining"
                    );
                    Message::decline(self.peer.clone())
                }
            };
            // The requester may have timed out and dropped the receiver.
            let _ = envelope.reply.send(response);
        }
        debug!(peer = %self.peer, %from, "inbound connection closed");
    }
}

/// The in-process routing table of a swarm.
#[derive(Default)]
pub struct HubNetwork {
    hubs: DashMap<PeerId, Arc<HubShared>>,
}

impl HubNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the addresses currently attached to the network.
    #[must_use]
    pub fn attached_peers(&self) -> Vec<PeerId> {
        self.hubs.iter().map(|e| e.key().clone()).collect()
    }
}

/// One process's messaging facade.
pub struct Hub {
    shared: Arc<HubShared>,
    network: Arc<HubNetwork>,
}

impl Hub {
    /// Creates a hub bound to `peer` and attaches it to the network.
    #[must_use]
    pub fn create(network: &Arc<HubNetwork>, peer: PeerId) -> Arc<Hub> {
        let shared = Arc::new(HubShared {
            peer: peer.clone(),
            handlers: DashMap::new(),
            inboxes: Mutex::new(HashMap::new()),
            known_peers: RwLock::new(BTreeSet::new()),
        });
        network.hubs.insert(peer, Arc::clone(&shared));

        let hub = Arc::new(Hub {
            shared,
            network: Arc::clone(network),
        });
        hub.register_discovery_handler();
        hub
    }

    fn register_discovery_handler(&self) {
        let shared = Arc::clone(&self.shared);
        self.register_handler(DISCOVERY, move |message| {
            let mut peers = shared.known_peers.write();
            peers.insert(message.sender().clone());
            if let Ok(announcement) = message.extract::<DiscoveryAnnouncement>() {
                peers.insert(PeerId::new(announcement.peer_address));
            }
            let addresses: Vec<String> =
                peers.iter().map(|p| p.ip_port().to_string()).collect();
            drop(peers);
            Message::impose(crate::message::ACK, shared.peer.clone(), &addresses)
        });
    }

    /// Returns this hub's own peer id.
    #[must_use]
    pub fn self_id(&self) -> &PeerId {
        &self.shared.peer
    }

    /// Registers the handler for a message kind, replacing any previous
    /// registration.
    pub fn register_handler<F>(&self, kind: &str, handler: F)
    where
        F: Fn(&Message) -> Message + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .insert(kind.to_string(), Arc::new(handler));
    }

    /// Returns the discovery set, excluding self.
    #[must_use]
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.shared.known_peers.read().clone()
    }

    /// Announces this peer to `seed` and merges the peers the seed
    /// already knows. One round of ring stabilization.
    pub fn announce_to(&self, seed: &PeerId) -> SwarmResult<()> {
        self.shared.known_peers.write().insert(seed.clone());
        let announcement = DiscoveryAnnouncement {
            peer_address: self.shared.peer.ip_port().to_string(),
        };
        let response = self.try_request(
            seed,
            Message::impose(DISCOVERY, self.shared.peer.clone(), &announcement),
        )?;
        if let Ok(addresses) = response.extract::<Vec<String>>() {
            let mut peers = self.shared.known_peers.write();
            for address in addresses {
                let peer = PeerId::new(address);
                if peer != self.shared.peer {
                    peers.insert(peer);
                }
            }
        }
        Ok(())
    }

    fn request_inner(
        &self,
        to: &PeerId,
        request: Message,
        timeout: Option<Duration>,
    ) -> SwarmResult<Message> {
        let target = self.network.hubs.get(to).map(|e| Arc::clone(e.value()));
        let target = target.ok_or_else(|| SwarmError::Transport {
            peer: to.clone(),
            reason: "unknown peer".to_string(),
        })?;

        let (reply_tx, reply_rx) = bounded(1);
        let inbox = target.inbox_for(self.shared.peer.clone());
        inbox
            .send(Envelope {
                request,
                reply: reply_tx,
            })
            .map_err(|_| SwarmError::Transport {
                peer: to.clone(),
                reason: "peer shut down".to_string(),
            })?;

        match timeout {
            Some(timeout) => reply_rx.recv_timeout(timeout).map_err(|_| {
                SwarmError::Transport {
                    peer: to.clone(),
                    reason: format!("no response within {:?}", timeout),
                }
            }),
            None => reply_rx.recv().map_err(|_| SwarmError::Transport {
                peer: to.clone(),
                reason: "peer shut down".to_string(),
            }),
        }
    }

    /// Sends a request and blocks for the response.
    ///
    /// # Panics
    ///
    /// Panics on transport failure. Callers must have verified the
    /// peer's liveness; use [`Self::try_request`] otherwise.
    #[must_use]
    pub fn request(&self, to: &PeerId, request: Message) -> Message {
        match self.request_inner(to, request, None) {
            Ok(response) => response,
            Err(e) => panic!("request to live peer {} failed: {}", to, e),
        }
    }

    /// Sends a request; transport failures and timeouts come back as
    /// `Transport` errors.
    pub fn try_request(&self, to: &PeerId, request: Message) -> SwarmResult<Message> {
        self.request_inner(to, request, Some(Duration::from_millis(RPC_TIMEOUT_MS)))
    }

    /// Sends a request to every peer in `peers`, collecting responses.
    /// Unreachable peers are skipped with a warning.
    pub fn broadcast_to(
        &self,
        peers: &BTreeSet<PeerId>,
        request: &Message,
    ) -> HashMap<PeerId, Message> {
        let mut responses = HashMap::new();
        for peer in peers {
            if peer == &self.shared.peer {
                continue;
            }
            match self.try_request(peer, request.clone()) {
                Ok(response) => {
                    responses.insert(peer.clone(), response);
                }
                Err(e) => warn!(%peer, error = %e, "broadcast recipient unreachable"),
            }
        }
        responses
    }

    /// Sends a request to the whole discovery set.
    pub fn broadcast(&self, request: &Message) -> HashMap<PeerId, Message> {
        self.broadcast_to(&self.peers(), request)
    }

    /// Sends a request to every peer in `peers` and requires each to
    /// acknowledge. Any decline or transport failure is an error.
    pub fn undisputable_broadcast_to(
        &self,
        peers: &BTreeSet<PeerId>,
        request: &Message,
    ) -> SwarmResult<()> {
        for peer in peers {
            if peer == &self.shared.peer {
                continue;
            }
            let response = self.try_request(peer, request.clone())?;
            if !response.is_ack() {
                return Err(SwarmError::internal(format!(
                    "peer {} disputed {} with {}",
                    peer,
                    request.kind(),
                    response.kind()
                )));
            }
        }
        Ok(())
    }

    /// Detaches this hub from the network. In-flight requests to it
    /// fail; inbound worker threads drain and exit.
    pub fn detach(&self) {
        self.network.hubs.remove(&self.shared.peer);
        self.shared.inboxes.lock().clear();
    }
}

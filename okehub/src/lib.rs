//! # okehub - Connection hub and per-client send pipeline
//!
//! The hub owns the set of live client connections and everything that
//! flows out to them. It is deliberately protocol-agnostic: messages are
//! pre-serialized frames (`Arc<str>`), so the hub never depends on the
//! wire protocol or on any store.
//!
//! Lifecycle and fan-out are serialized through a single event-loop task:
//! register, unregister, broadcast and targeted sends are queued on one
//! bounded channel and processed in order, so no broadcast can observe a
//! client after its unregister event. Queries (`find_by_key`,
//! `connected_keys`, counts) read the shared registry directly.
//!
//! Each client drains its own bounded send channel (capacity 256 by
//! default) from a writer task. A broadcast that finds the channel full
//! evicts the slow client: its channel is closed and it is removed from
//! the set. Targeted sends drop silently instead.
//!
//! The disconnect observer runs after the hub has released its internal
//! lock, so it may freely call back into the hub or into stores.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

pub mod error;

pub use error::{Error, Result};

/// A pre-serialized outbound frame, shared between all recipients.
pub type Frame = Arc<str>;

/// Hub-local identifier of one socket. One identity (handshake key) can
/// hold several of these at once.
pub type ClientId = u64;

/// Default capacity of each client's send channel.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Capacity of the hub's own event channel.
const EVENT_QUEUE: usize = 256;

type DisconnectObserver = Arc<dyn Fn(ClientId, &str) + Send + Sync>;

/// One registered connection as the hub tracks it.
#[derive(Clone)]
struct ClientHandle {
    id: ClientId,
    martyn_key: String,
    sender: mpsc::Sender<Frame>,
}

enum HubEvent {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Frame),
    BroadcastToKeys(HashSet<String>, Frame),
    SendTo(ClientId, Frame),
    DisconnectAll(Frame),
}

struct HubState {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    observer: RwLock<Option<DisconnectObserver>>,
}

impl HubState {
    /// Removes a client and fires the disconnect observer outside the
    /// registry lock. Safe to call for ids that are already gone.
    fn drop_client(&self, id: ClientId) {
        let removed = self.clients.write().unwrap().remove(&id);

        if let Some(client) = removed {
            debug!(client = id, key = %client.martyn_key, "Client unregistered");
            let observer = self.observer.read().unwrap().clone();
            if let Some(observer) = observer {
                observer(client.id, &client.martyn_key);
            }
        }
    }
}

/// The connection hub. Cheap to clone; all clones share the same state
/// and event loop.
#[derive(Clone)]
pub struct Hub {
    state: Arc<HubState>,
    events: mpsc::Sender<HubEvent>,
    next_id: Arc<AtomicU64>,
    client_buffer: usize,
}

impl Hub {
    /// Creates the hub and spawns its event loop on the current runtime.
    pub fn new(client_buffer: usize) -> Self {
        let (events, events_rx) = mpsc::channel(EVENT_QUEUE);
        let state = Arc::new(HubState {
            clients: RwLock::new(HashMap::new()),
            observer: RwLock::new(None),
        });

        tokio::spawn(Self::run(state.clone(), events_rx));

        Self {
            state,
            events,
            next_id: Arc::new(AtomicU64::new(1)),
            client_buffer,
        }
    }

    async fn run(state: Arc<HubState>, mut events: mpsc::Receiver<HubEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                HubEvent::Register(client) => {
                    debug!(client = client.id, key = %client.martyn_key, "Client registered");
                    state.clients.write().unwrap().insert(client.id, client);
                }
                HubEvent::Unregister(id) => {
                    state.drop_client(id);
                }
                HubEvent::Broadcast(frame) => {
                    Self::fan_out(&state, &frame, None);
                }
                HubEvent::BroadcastToKeys(keys, frame) => {
                    Self::fan_out(&state, &frame, Some(&keys));
                }
                HubEvent::SendTo(id, frame) => {
                    let sender = {
                        let clients = state.clients.read().unwrap();
                        clients.get(&id).map(|c| c.sender.clone())
                    };
                    if let Some(sender) = sender {
                        // Targeted sends drop on a full channel instead of
                        // evicting the client.
                        let _ = sender.try_send(frame);
                    }
                }
                HubEvent::DisconnectAll(frame) => {
                    let ids: Vec<ClientId> = {
                        let clients = state.clients.read().unwrap();
                        for client in clients.values() {
                            let _ = client.sender.try_send(frame.clone());
                        }
                        clients.keys().copied().collect()
                    };
                    for id in ids {
                        state.drop_client(id);
                    }
                }
            }
        }
    }

    /// Replicates a frame into every (matching) client channel, evicting
    /// clients whose channel is full.
    fn fan_out(state: &HubState, frame: &Frame, keys: Option<&HashSet<String>>) {
        let targets: Vec<(ClientId, mpsc::Sender<Frame>)> = {
            let clients = state.clients.read().unwrap();
            clients
                .values()
                .filter(|c| keys.map(|k| k.contains(&c.martyn_key)).unwrap_or(true))
                .map(|c| (c.id, c.sender.clone()))
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, sender) in targets {
            if sender.try_send(frame.clone()).is_err() {
                evicted.push(id);
            }
        }

        for id in evicted {
            warn!(client = id, "Evicting slow consumer");
            state.drop_client(id);
        }
    }

    /// Registers a new connection for the given identity.
    ///
    /// Returns the client id and the receiving end of its send channel;
    /// the caller's writer task drains it until it closes.
    pub async fn register(&self, martyn_key: &str) -> Result<(ClientId, mpsc::Receiver<Frame>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.client_buffer);

        self.events
            .send(HubEvent::Register(ClientHandle {
                id,
                martyn_key: martyn_key.to_string(),
                sender,
            }))
            .await
            .map_err(|_| Error::HubClosed)?;

        Ok((id, receiver))
    }

    /// Removes a connection. Idempotent; safe for already-evicted ids.
    pub async fn unregister(&self, id: ClientId) -> Result<()> {
        self.events
            .send(HubEvent::Unregister(id))
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Fans a frame out to every connected client.
    pub async fn broadcast(&self, frame: Frame) -> Result<()> {
        self.events
            .send(HubEvent::Broadcast(frame))
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Fans a frame out to every connection of the given identities.
    pub async fn broadcast_to_keys(&self, keys: HashSet<String>, frame: Frame) -> Result<()> {
        self.events
            .send(HubEvent::BroadcastToKeys(keys, frame))
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Delivers a frame to one connection; silently dropped when its
    /// channel is full.
    pub async fn send_to(&self, id: ClientId, frame: Frame) -> Result<()> {
        self.events
            .send(HubEvent::SendTo(id, frame))
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Sends a final frame to the client, then closes it.
    pub async fn kick(&self, id: ClientId, frame: Frame) -> Result<()> {
        self.send_to(id, frame).await?;
        self.unregister(id).await
    }

    /// Sends a final frame to every client and closes them all.
    pub async fn disconnect_all(&self, frame: Frame) -> Result<()> {
        self.events
            .send(HubEvent::DisconnectAll(frame))
            .await
            .map_err(|_| Error::HubClosed)
    }

    /// Every open connection of the given identity.
    pub fn find_by_key(&self, martyn_key: &str) -> Vec<ClientId> {
        let clients = self.state.clients.read().unwrap();
        clients
            .values()
            .filter(|c| c.martyn_key == martyn_key)
            .map(|c| c.id)
            .collect()
    }

    /// Connected identities, deduplicated: one identity may hold several
    /// sockets but is listed once.
    pub fn connected_keys(&self) -> Vec<String> {
        let clients = self.state.clients.read().unwrap();
        let mut keys: Vec<String> = clients
            .values()
            .map(|c| c.martyn_key.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        keys.sort();
        keys
    }

    /// Number of open sockets (not deduplicated).
    pub fn client_count(&self) -> usize {
        self.state.clients.read().unwrap().len()
    }

    /// Installs the observer fired after each disconnect (eviction, kick,
    /// normal unregister). Runs outside the hub's locks.
    pub fn set_disconnect_observer<F>(&self, observer: F)
    where
        F: Fn(ClientId, &str) + Send + Sync + 'static,
    {
        *self.state.observer.write().unwrap() = Some(Arc::new(observer));
    }
}

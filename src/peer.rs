//! Peer lifecycle and address book
//!
//! `PeerManager` tracks every peer the node knows about, persists the set in
//! a sled tree, scores peers from reactor feedback, and decides which peer to
//! dial next. All state transitions go through it, so the router can stay a
//! dumb pump: dial loop asks `dial_next`, accept loop reports `accepted`,
//! pumps report `ready` / `disconnected` / `errored`.

use crate::address::{NodeAddress, NodeId};
use crate::channel::{PeerStatus, PeerUpdate};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Scoring
// =============================================================================

/// Peer ranking score.
pub type PeerScore = i16;

/// Score assigned to persistent peers, above everything else.
pub const PEER_SCORE_PERSISTENT: PeerScore = i16::MAX;

/// Ceiling for non-persistent peers, so feedback alone can never promote a
/// peer to the persistent tier.
pub const MAX_PEER_SCORE_NOT_PERSISTENT: PeerScore = PEER_SCORE_PERSISTENT - 1;

/// Buffer for peer update subscribers.
const UPDATES_CAPACITY: usize = 128;

/// Buffer for reactor feedback reports.
const FEEDBACK_CAPACITY: usize = 128;

/// Re-check interval for retry backoff windows while `dial_next` waits.
const DIAL_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Persisted records
// =============================================================================

/// One known address of a peer, with its dialing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    pub address: NodeAddress,
    pub last_dial_attempt: Option<DateTime<Utc>>,
    pub last_dial_success: Option<DateTime<Utc>>,
    pub dial_failures: u32,
}

impl AddressInfo {
    fn new(address: NodeAddress) -> Self {
        AddressInfo {
            address,
            last_dial_attempt: None,
            last_dial_success: None,
            dial_failures: 0,
        }
    }
}

/// Everything tracked about one peer. The `persistent` flag is derived from
/// the options on load, never trusted from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: NodeId,
    pub addresses: BTreeMap<String, AddressInfo>,
    #[serde(skip)]
    pub persistent: bool,
    #[serde(default)]
    pub mutable_score: i64,
    pub last_connected: Option<DateTime<Utc>>,
}

impl PeerInfo {
    fn new(id: NodeId) -> Self {
        PeerInfo {
            id,
            addresses: BTreeMap::new(),
            persistent: false,
            mutable_score: 0,
            last_connected: None,
        }
    }

    /// Effective score: persistent peers pin to the top, everyone else is the
    /// accumulated feedback clamped below [`MAX_PEER_SCORE_NOT_PERSISTENT`].
    pub fn score(&self) -> PeerScore {
        if self.persistent {
            return PEER_SCORE_PERSISTENT;
        }
        self.mutable_score
            .clamp(PeerScore::MIN as i64, MAX_PEER_SCORE_NOT_PERSISTENT as i64)
            as PeerScore
    }

    /// Oldest dial attempt across addresses; `None` means never attempted.
    fn last_dial_attempt(&self) -> Option<DateTime<Utc>> {
        self.addresses.values().filter_map(|a| a.last_dial_attempt).min()
    }
}

// =============================================================================
// Options
// =============================================================================

/// Tuning knobs for the peer manager. Zero means unlimited for the caps.
#[derive(Debug, Clone)]
pub struct PeerManagerOptions {
    /// Peers to keep connected to at all times, scored above all others.
    pub persistent_peers: Vec<NodeId>,
    /// Cap on connected plus in-flight dialing peers.
    pub max_connected: usize,
    /// Cap on tracked peers; the worst prunable entry is dropped beyond it.
    pub max_peers: usize,
    /// Base retry delay after a failed dial, doubled per failure.
    pub min_retry_time: Duration,
    /// Retry delay ceiling.
    pub max_retry_time: Duration,
    /// Random jitter added on top of the retry delay.
    pub retry_time_jitter: Duration,
}

impl Default for PeerManagerOptions {
    fn default() -> Self {
        PeerManagerOptions {
            persistent_peers: Vec::new(),
            max_connected: 0,
            max_peers: 0,
            min_retry_time: Duration::from_secs(1),
            max_retry_time: Duration::from_secs(600),
            retry_time_jitter: Duration::from_secs(3),
        }
    }
}

impl PeerManagerOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_connected > 0 && self.persistent_peers.len() > self.max_connected {
            return Err(Error::Config(format!(
                "{} persistent peers cannot fit within max_connected {}",
                self.persistent_peers.len(),
                self.max_connected
            )));
        }
        if self.max_peers > 0 && self.max_connected > self.max_peers {
            return Err(Error::Config(
                "max_connected cannot exceed max_peers".into(),
            ));
        }
        Ok(())
    }

    fn is_persistent(&self, id: &NodeId) -> bool {
        self.persistent_peers.contains(id)
    }
}

// =============================================================================
// Store
// =============================================================================

/// Peer records mirrored between memory and a sled tree.
struct PeerStore {
    tree: sled::Tree,
    peers: HashMap<NodeId, PeerInfo>,
}

impl PeerStore {
    fn load(tree: sled::Tree, options: &PeerManagerOptions) -> Result<Self> {
        let mut peers = HashMap::new();
        for entry in tree.iter() {
            let (_, value) = entry?;
            let mut info: PeerInfo = serde_json::from_slice(&value)?;
            info.persistent = options.is_persistent(&info.id);
            peers.insert(info.id.clone(), info);
        }
        Ok(PeerStore { tree, peers })
    }

    fn set(&mut self, info: PeerInfo) -> Result<()> {
        self.tree
            .insert(info.id.as_str(), serde_json::to_vec(&info)?)?;
        self.peers.insert(info.id.clone(), info);
        Ok(())
    }

    fn remove(&mut self, id: &NodeId) -> Result<()> {
        self.tree.remove(id.as_str())?;
        self.peers.remove(id);
        Ok(())
    }
}

struct State {
    store: PeerStore,
    connected: HashSet<NodeId>,
    ready: HashSet<NodeId>,
    dialing: HashSet<NodeId>,
}

// =============================================================================
// PeerManager
// =============================================================================

/// Manages peer state transitions and dial scheduling.
pub struct PeerManager {
    options: PeerManagerOptions,
    state: Mutex<State>,
    dial_waker: Notify,
    updates_tx: broadcast::Sender<PeerUpdate>,
    feedback_tx: mpsc::Sender<PeerUpdate>,
    feedback_rx: tokio::sync::Mutex<mpsc::Receiver<PeerUpdate>>,
}

impl PeerManager {
    /// Loads the peer set from the given tree and applies the options.
    pub fn new(tree: sled::Tree, options: PeerManagerOptions) -> Result<Self> {
        options.validate()?;
        let store = PeerStore::load(tree, &options)?;
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        let (feedback_tx, feedback_rx) = mpsc::channel(FEEDBACK_CAPACITY);
        let manager = PeerManager {
            options,
            state: Mutex::new(State {
                store,
                connected: HashSet::new(),
                ready: HashSet::new(),
                dialing: HashSet::new(),
            }),
            dial_waker: Notify::new(),
            updates_tx,
            feedback_tx,
            feedback_rx: tokio::sync::Mutex::new(feedback_rx),
        };
        manager.prune(&mut manager.state.lock().unwrap())?;
        Ok(manager)
    }

    /// Registers a peer address. Returns `true` if it was not known before.
    pub fn add(&self, address: NodeAddress) -> Result<bool> {
        address.validate()?;
        let mut state = self.state.lock().unwrap();
        let mut info = state
            .store
            .peers
            .get(&address.node_id)
            .cloned()
            .unwrap_or_else(|| PeerInfo::new(address.node_id.clone()));
        info.persistent = self.options.is_persistent(&info.id);

        let key = address.to_string();
        if info.addresses.contains_key(&key) {
            return Ok(false);
        }
        info.addresses.insert(key, AddressInfo::new(address));
        state.store.set(info)?;
        self.prune(&mut state)?;
        drop(state);
        self.dial_waker.notify_waiters();
        Ok(true)
    }

    /// Drops the worst prunable peers while over the tracked-peer cap,
    /// broadcasting `Removed` for each.
    fn prune(&self, state: &mut State) -> Result<()> {
        if self.options.max_peers == 0 {
            return Ok(());
        }
        while state.store.peers.len() > self.options.max_peers {
            let victim = state
                .store
                .peers
                .values()
                .filter(|p| {
                    !p.persistent
                        && !state.connected.contains(&p.id)
                        && !state.dialing.contains(&p.id)
                })
                .min_by_key(|p| (p.score(), p.last_connected))
                .map(|p| p.id.clone());
            match victim {
                Some(id) => {
                    log::debug!("pruning peer {}", id);
                    state.store.remove(&id)?;
                    let _ = self
                        .updates_tx
                        .send(PeerUpdate::new(id, PeerStatus::Removed));
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Waits until some peer should be dialed, marks it in-flight, and
    /// returns its address. Ranked by score, oldest dial attempt first.
    pub async fn dial_next(&self, token: &CancellationToken) -> Result<NodeAddress> {
        loop {
            if let Some(address) = self.try_dial_next()? {
                return Ok(address);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Canceled),
                _ = self.dial_waker.notified() => {}
                _ = tokio::time::sleep(DIAL_POLL_INTERVAL) => {}
            }
        }
    }

    fn try_dial_next(&self) -> Result<Option<NodeAddress>> {
        let mut state = self.state.lock().unwrap();
        if self.options.max_connected > 0
            && state.connected.len() + state.dialing.len() >= self.options.max_connected
        {
            return Ok(None);
        }

        let mut ranked: Vec<&PeerInfo> = state
            .store
            .peers
            .values()
            .filter(|p| !state.connected.contains(&p.id) && !state.dialing.contains(&p.id))
            .collect();
        ranked.sort_by_key(|p| (Reverse(p.score()), p.last_dial_attempt()));

        let now = Utc::now();
        let mut picked = None;
        'outer: for info in ranked {
            for addr_info in info.addresses.values() {
                let delay = self.retry_delay(addr_info.dial_failures);
                let due = match addr_info.last_dial_attempt {
                    None => true,
                    Some(at) => {
                        now.signed_duration_since(at).to_std().unwrap_or(Duration::ZERO) >= delay
                    }
                };
                if due {
                    picked = Some((info.id.clone(), addr_info.address.clone()));
                    break 'outer;
                }
            }
        }

        let Some((id, address)) = picked else {
            return Ok(None);
        };
        if let Some(mut info) = state.store.peers.get(&id).cloned() {
            if let Some(addr_info) = info.addresses.get_mut(&address.to_string()) {
                addr_info.last_dial_attempt = Some(now);
            }
            state.store.set(info)?;
        }
        state.dialing.insert(id);
        Ok(Some(address))
    }

    /// Exponential backoff with jitter, capped at the configured maximum.
    fn retry_delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let backoff = self
            .options
            .min_retry_time
            .saturating_mul(2u32.saturating_pow(failures.saturating_sub(1).min(30)));
        let mut delay = backoff.min(self.options.max_retry_time);
        if !self.options.retry_time_jitter.is_zero() {
            delay += self
                .options
                .retry_time_jitter
                .mul_f64(rand::thread_rng().gen::<f64>());
        }
        delay
    }

    /// Records a failed dial attempt, making the address retryable later.
    pub fn dial_failed(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.dialing.remove(&address.node_id);
        if let Some(mut info) = state.store.peers.get(&address.node_id).cloned() {
            if let Some(addr_info) = info.addresses.get_mut(&address.to_string()) {
                addr_info.dial_failures += 1;
                addr_info.last_dial_attempt = Some(Utc::now());
            }
            state.store.set(info)?;
        }
        drop(state);
        self.dial_waker.notify_waiters();
        Ok(())
    }

    /// Marks an in-flight dial as connected.
    pub fn dialed(&self, address: &NodeAddress) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.dialing.remove(&address.node_id) {
            return Err(Error::Protocol(format!(
                "peer {} was not being dialed",
                address.node_id
            )));
        }
        if state.connected.contains(&address.node_id) {
            return Err(Error::Protocol(format!(
                "peer {} is already connected",
                address.node_id
            )));
        }
        if self.options.max_connected > 0 && state.connected.len() >= self.options.max_connected {
            return Err(Error::Protocol("connection slots are full".into()));
        }

        let now = Utc::now();
        let mut info = state
            .store
            .peers
            .get(&address.node_id)
            .cloned()
            .unwrap_or_else(|| PeerInfo::new(address.node_id.clone()));
        info.persistent = self.options.is_persistent(&info.id);
        info.last_connected = Some(now);
        if let Some(addr_info) = info.addresses.get_mut(&address.to_string()) {
            addr_info.last_dial_success = Some(now);
            addr_info.dial_failures = 0;
        }
        state.store.set(info)?;
        state.connected.insert(address.node_id.clone());
        Ok(())
    }

    /// Admits an inbound connection. A peer being dialed cannot also be
    /// accepted; one slot per peer.
    pub fn accepted(&self, node_id: &NodeId) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.connected.contains(node_id) {
            return Err(Error::Protocol(format!(
                "peer {} is already connected",
                node_id
            )));
        }
        if state.dialing.contains(node_id) {
            return Err(Error::Protocol(format!(
                "peer {} is being dialed",
                node_id
            )));
        }
        if self.options.max_connected > 0 && state.connected.len() >= self.options.max_connected {
            return Err(Error::Protocol("connection slots are full".into()));
        }

        let mut info = state
            .store
            .peers
            .get(node_id)
            .cloned()
            .unwrap_or_else(|| PeerInfo::new(node_id.clone()));
        info.persistent = self.options.is_persistent(node_id);
        info.last_connected = Some(Utc::now());
        state.store.set(info)?;
        state.connected.insert(node_id.clone());
        Ok(())
    }

    /// Marks a connected peer as ready for traffic and broadcasts `Up`.
    pub fn ready(&self, node_id: &NodeId) {
        let mut state = self.state.lock().unwrap();
        if state.connected.contains(node_id) && state.ready.insert(node_id.clone()) {
            drop(state);
            let _ = self.updates_tx.send(PeerUpdate {
                node_id: node_id.clone(),
                status: PeerStatus::Up,
            });
        }
    }

    /// Releases a peer's connection slot; broadcasts `Down` if it was ready.
    pub fn disconnected(&self, node_id: &NodeId) {
        let mut state = self.state.lock().unwrap();
        state.connected.remove(node_id);
        state.dialing.remove(node_id);
        let was_ready = state.ready.remove(node_id);
        if let Some(mut info) = state.store.peers.get(node_id).cloned() {
            info.last_connected = Some(Utc::now());
            if let Err(e) = state.store.set(info) {
                log::warn!("failed to persist peer {}: {}", node_id, e);
            }
        }
        drop(state);
        if was_ready {
            let _ = self.updates_tx.send(PeerUpdate {
                node_id: node_id.clone(),
                status: PeerStatus::Down,
            });
        }
        self.dial_waker.notify_waiters();
    }

    /// Records a misbehaving peer. The router tears down the connection;
    /// here it only costs score.
    pub fn errored(&self, node_id: &NodeId, reason: &str) {
        log::warn!("peer {} errored: {}", node_id, reason);
        if let Err(e) = self.process_peer_event(PeerUpdate {
            node_id: node_id.clone(),
            status: PeerStatus::Bad,
        }) {
            log::warn!("failed to persist peer {}: {}", node_id, e);
        }
    }

    /// Applies one reactor feedback report to the peer's score.
    pub fn process_peer_event(&self, update: PeerUpdate) -> Result<()> {
        let delta: i64 = match update.status {
            PeerStatus::Good => 1,
            PeerStatus::Bad => -1,
            _ => return Ok(()),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(mut info) = state.store.peers.get(&update.node_id).cloned() {
            info.mutable_score = info.mutable_score.saturating_add(delta);
            state.store.set(info)?;
        }
        Ok(())
    }

    /// Subscribes to peer status broadcasts, with a feedback path for
    /// reporting peer behavior back.
    pub fn subscribe(&self) -> PeerUpdates {
        PeerUpdates {
            updates: self.updates_tx.subscribe(),
            feedback: self.feedback_tx.clone(),
        }
    }

    /// Consumes subscriber feedback until canceled. A single writer applies
    /// all score changes, so reports are serialized.
    pub async fn run(&self, token: &CancellationToken) {
        let mut rx = self.feedback_rx.lock().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                update = rx.recv() => match update {
                    Some(update) => {
                        if let Err(e) = self.process_peer_event(update) {
                            log::warn!("failed to apply peer feedback: {}", e);
                        }
                    }
                    None => break,
                },
            }
        }
    }

    /// Snapshot of every tracked peer's current score.
    pub fn scores(&self) -> HashMap<NodeId, PeerScore> {
        let state = self.state.lock().unwrap();
        state
            .store
            .peers
            .values()
            .map(|p| (p.id.clone(), p.score()))
            .collect()
    }

    /// Stored record for one peer, if known.
    pub fn peer_info(&self, node_id: &NodeId) -> Option<PeerInfo> {
        self.state.lock().unwrap().store.peers.get(node_id).cloned()
    }
}

/// A subscription handle: peer status updates in, behavior reports out.
pub struct PeerUpdates {
    updates: broadcast::Receiver<PeerUpdate>,
    feedback: mpsc::Sender<PeerUpdate>,
}

impl PeerUpdates {
    /// Next status update, or `None` once canceled. Lagged subscribers skip
    /// missed updates rather than erroring out.
    pub async fn next(&mut self, token: &CancellationToken) -> Option<PeerUpdate> {
        loop {
            tokio::select! {
                _ = token.cancelled() => return None,
                res = self.updates.recv() => match res {
                    Ok(update) => return Some(update),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("peer update subscriber lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Reports peer behavior (Good / Bad) back to the manager.
    pub async fn send_update(&self, update: PeerUpdate) {
        let _ = self.feedback.send(update).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

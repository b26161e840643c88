//! Connection registry, correlation table and session router.
//!
//! All three tables live behind one mutex (`Registry::lock`) so every
//! inbound frame observes them atomically. The guard is held only across
//! in-memory mutation; frames are pushed onto per-connection channels
//! after the guard drops, and a dedicated writer task per socket drains
//! the channel, which is what preserves per-connection ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub type ClientId = u64;

/// A frame queued for a connection's writer task.
#[derive(Clone, Debug)]
pub enum Outbound {
    Frame(String),
    Ping,
    Close { code: u16, reason: &'static str },
}

/// Queue depth shared between an [`Outbox`] and its writer task. The
/// writer holds only this gauge, not the sender, so dropping the outbox
/// closes the channel.
#[derive(Clone, Default)]
pub struct QueueGauge {
    bytes: Arc<AtomicUsize>,
    frames: Arc<AtomicUsize>,
}

impl QueueGauge {
    /// Writer-side bookkeeping after a frame left the queue.
    pub fn mark_sent(&self, bytes: usize) {
        self.bytes.fetch_sub(bytes, Ordering::Relaxed);
        self.frames.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle for pushing frames to one connection. Byte/frame accounting is
/// shared with the writer task, which decrements as frames drain.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
    gauge: QueueGauge,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            gauge: QueueGauge::default(),
        }
    }

    pub fn gauge(&self) -> QueueGauge {
        self.gauge.clone()
    }

    /// Queue a frame unconditionally: command responses and forwarded
    /// commands are never subject to the event cap.
    pub fn push_frame(&self, text: String) {
        self.gauge.bytes.fetch_add(text.len(), Ordering::Relaxed);
        self.gauge.frames.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(Outbound::Frame(text));
    }

    /// Queue an event, unless the receiver is too far behind. Returns
    /// `false` when the event was dropped.
    pub fn push_event(&self, text: String, max_bytes: usize, max_frames: usize) -> bool {
        if self.gauge.bytes.load(Ordering::Relaxed) > max_bytes
            || self.gauge.frames.load(Ordering::Relaxed) > max_frames
        {
            return false;
        }
        self.push_frame(text);
        true
    }

    pub fn push_ping(&self) {
        let _ = self.tx.send(Outbound::Ping);
    }

    pub fn push_close(&self, code: u16, reason: &'static str) {
        let _ = self.tx.send(Outbound::Close { code, reason });
    }

    pub fn queued_bytes(&self) -> usize {
        self.gauge.bytes.load(Ordering::Relaxed)
    }
}

/// One automation client admitted on `/cdp`.
pub struct ClientRecord {
    pub id: ClientId,
    pub outbox: Outbox,
    /// `Target.setDiscoverTargets` state for this client.
    pub discover: bool,
    /// `Target.setAutoAttach` state for this client.
    pub auto_attach: bool,
    /// Remote address, for logs only.
    pub remote: String,
}

/// The at-most-one extension admitted on `/extension`. The epoch tells a
/// superseded connection's cleanup apart from the live one's.
pub struct ExtensionRecord {
    pub epoch: u64,
    pub extension_id: String,
    pub outbox: Outbox,
}

/// Correlation record for a command in flight to the extension.
pub struct PendingCommand {
    pub client: ClientId,
    pub original_id: Value,
    pub method: String,
    pub session_id: Option<String>,
    pub deadline: Instant,
}

/// Ownership record for a CDP session handed to a client.
pub struct SessionBinding {
    pub owner: ClientId,
    pub target_id: String,
    pub auto_attached: bool,
    pub waiting_for_debugger: bool,
}

/// The single page the extension exposes, as advertised to clients.
#[derive(Clone, Debug)]
pub struct SyntheticTarget {
    pub target_id: String,
    pub title: String,
    pub url: String,
    pub browser_context_id: String,
    /// User agent reported by the extension handshake.
    pub user_agent: Option<String>,
    /// Optional capability strings from the handshake.
    pub capabilities: Vec<String>,
}

impl SyntheticTarget {
    pub fn placeholder() -> Self {
        Self {
            target_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            title: String::new(),
            url: "about:blank".to_string(),
            browser_context_id: uuid::Uuid::new_v4().simple().to_string().to_uppercase(),
            user_agent: None,
            capabilities: Vec::new(),
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Everything the single-writer discipline protects.
#[derive(Default)]
pub struct Tables {
    pub clients: HashMap<ClientId, ClientRecord>,
    pub extension: Option<ExtensionRecord>,
    pub pending: HashMap<u64, PendingCommand>,
    pub sessions: HashMap<String, SessionBinding>,
    pub target: Option<SyntheticTarget>,
}

impl Tables {
    /// Sessions owned by a client, for cleanup and detach bookkeeping.
    pub fn sessions_of(&self, client: ClientId) -> Vec<String> {
        self.sessions
            .iter()
            .filter(|(_, binding)| binding.owner == client)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn session_owner(&self, session_id: &str) -> Option<ClientId> {
        self.sessions.get(session_id).map(|binding| binding.owner)
    }

    /// Whether at least one client currently holds a session.
    pub fn target_attached(&self) -> bool {
        !self.sessions.is_empty()
    }
}

/// Pending commands torn out of the table when their answer can no longer
/// arrive; the caller turns these into error replies.
pub struct OrphanedCommand {
    pub client: ClientId,
    pub original_id: Value,
    pub method: String,
}

pub struct Registry {
    tables: Mutex<Tables>,
    next_client: AtomicU64,
    next_epoch: AtomicU64,
    next_relay_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            next_client: AtomicU64::new(1),
            next_epoch: AtomicU64::new(1),
            next_relay_id: AtomicU64::new(1),
        }
    }

    /// Acquire the single-writer guard. Callers must not hold it across an
    /// await point.
    pub fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Relay-scoped command ids, unique for the lifetime of the process.
    pub fn next_relay_id(&self) -> u64 {
        self.next_relay_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn admit_client(&self, outbox: Outbox, remote: String) -> ClientId {
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let record = ClientRecord {
            id,
            outbox,
            discover: false,
            auto_attach: false,
            remote,
        };
        self.lock().clients.insert(id, record);
        id
    }

    /// Drop a client and cancel everything it owns. In-flight commands are
    /// discarded (their owner can no longer receive the reply); a late
    /// response from the extension will miss the correlation table and be
    /// counted as unknown.
    pub fn remove_client(&self, client: ClientId) -> usize {
        let mut tables = self.lock();
        tables.clients.remove(&client);
        tables.sessions.retain(|_, binding| binding.owner != client);
        let before = tables.pending.len();
        tables.pending.retain(|_, cmd| cmd.client != client);
        before - tables.pending.len()
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    /// Admit a new extension, superseding any live one. Returns the
    /// superseded record (to be closed with "replaced") together with the
    /// commands that were awaiting it.
    pub fn admit_extension(
        &self,
        extension_id: String,
        outbox: Outbox,
    ) -> (u64, Option<ExtensionRecord>, Vec<OrphanedCommand>) {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let mut tables = self.lock();
        let replaced = tables.extension.take();
        let orphaned = if replaced.is_some() {
            drain_pending(&mut tables)
        } else {
            Vec::new()
        };
        tables.sessions.clear();
        tables.target = Some(SyntheticTarget::placeholder());
        tables.extension = Some(ExtensionRecord {
            epoch,
            extension_id,
            outbox,
        });
        (epoch, replaced, orphaned)
    }

    /// Tear down the extension identified by `epoch`. A superseded
    /// connection's late cleanup is a no-op: the live record has a newer
    /// epoch and must not be touched.
    pub fn remove_extension(&self, epoch: u64) -> Option<Vec<OrphanedCommand>> {
        let mut tables = self.lock();
        match &tables.extension {
            Some(ext) if ext.epoch == epoch => {}
            _ => return None,
        }
        tables.extension = None;
        tables.target = None;
        tables.sessions.clear();
        Some(drain_pending(&mut tables))
    }

    pub fn extension_id(&self) -> Option<String> {
        self.lock()
            .extension
            .as_ref()
            .map(|ext| ext.extension_id.clone())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn drain_pending(tables: &mut Tables) -> Vec<OrphanedCommand> {
    tables
        .pending
        .drain()
        .map(|(_, cmd)| OrphanedCommand {
            client: cmd.client,
            original_id: cmd.original_id,
            method: cmd.method,
        })
        .collect()
}

//! Per-peer connection records and the registry that owns them.
//!
//! The registry is the only state shared between the reconciler and the
//! signaling exchange. Check-and-insert runs as one synchronous critical
//! section so two cooperative tasks can never both decide to engage the same
//! peer across an await point.

mod candidates;

pub use candidates::CandidateBuffer;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::link::PeerLink;
use crate::model::ParticipantId;

/// Which side of the handshake this record plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// Lifecycle of one pairwise handshake. `Completed` is reachable only for
/// initiators; responders treat `Published` as terminal and leave true
/// connectivity to the peer link's own events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Negotiating,
    Published,
    Completed,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("already connected to peer {0}")]
    AlreadyConnected(ParticipantId),
}

/// Local bookkeeping for one remote peer: role, handshake progress, the peer
/// link once acquired, the candidate buffer, and the driver tasks that serve
/// this record. Never persisted remotely.
pub struct ConnectionRecord {
    peer: ParticipantId,
    role: HandshakeRole,
    state: Mutex<HandshakeState>,
    link: Mutex<Option<Arc<dyn PeerLink>>>,
    candidates: CandidateBuffer,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionRecord {
    fn new(peer: ParticipantId, role: HandshakeRole) -> Self {
        Self {
            peer,
            role,
            state: Mutex::new(HandshakeState::Idle),
            link: Mutex::new(None),
            candidates: CandidateBuffer::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: HandshakeState) {
        let mut current = self.state.lock().unwrap();
        debug!(
            target: "connection",
            peer = %self.peer,
            from = ?*current,
            to = ?state,
            "handshake state changed"
        );
        *current = state;
    }

    pub fn candidates(&self) -> &CandidateBuffer {
        &self.candidates
    }

    /// Install the peer link once the factory has produced it. The record is
    /// registered before the link exists so the insert stays atomic.
    pub fn attach_link(&self, link: Arc<dyn PeerLink>) {
        *self.link.lock().unwrap() = Some(link);
    }

    pub fn link(&self) -> Option<Arc<dyn PeerLink>> {
        self.link.lock().unwrap().clone()
    }

    /// Hand the record a task working on its behalf; aborted on teardown.
    pub fn adopt_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(task);
    }

    /// Abort every driver task and close the link. Idempotent.
    pub fn teardown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(link) = self.link.lock().unwrap().take() {
            link.close();
        }
    }
}

impl std::fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Owns every ConnectionRecord for one room, keyed by remote identifier.
/// Enforces at-most-one record per peer.
#[derive(Default)]
pub struct ConnectionRegistry {
    records: Mutex<HashMap<ParticipantId, Arc<ConnectionRecord>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check-and-insert in one critical section. No await may intervene
    /// between the duplicate check and the insertion, so the lock is held
    /// across both and released before the caller resumes async work.
    pub fn create_if_absent(
        &self,
        peer: ParticipantId,
        role: HandshakeRole,
    ) -> Result<Arc<ConnectionRecord>, RegistryError> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&peer) {
            return Err(RegistryError::AlreadyConnected(peer));
        }
        let record = Arc::new(ConnectionRecord::new(peer.clone(), role));
        records.insert(peer, Arc::clone(&record));
        Ok(record)
    }

    pub fn get(&self, peer: &ParticipantId) -> Option<Arc<ConnectionRecord>> {
        self.records.lock().unwrap().get(peer).cloned()
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.records.lock().unwrap().contains_key(peer)
    }

    /// Detach the record and tear it down (tasks aborted, link closed).
    pub fn remove(&self, peer: &ParticipantId) -> Option<Arc<ConnectionRecord>> {
        let record = self.records.lock().unwrap().remove(peer);
        if let Some(record) = &record {
            record.teardown();
            debug!(target: "connection", peer = %peer, "connection record removed");
        }
        record
    }

    /// Snapshot of every record; order is meaningless.
    pub fn all(&self) -> Vec<Arc<ConnectionRecord>> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Room teardown: every record torn down and the map emptied together.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut records = self.records.lock().unwrap();
            records.drain().map(|(_, record)| record).collect()
        };
        for record in drained {
            record.teardown();
        }
    }
}

//! Deterministic peer link for tests: canned descriptions, scripted
//! candidates queued at creation time, and call counters the scenario tests
//! assert against.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{LinkError, LinkEvent, PeerLink, PeerLinkFactory};
use crate::model::{IceCandidate, SessionDescription};

#[derive(Debug, Default)]
struct Counters {
    offers: usize,
    answers: usize,
    locals_set: usize,
    remotes_set: usize,
}

pub struct ScriptedPeerLink {
    label: String,
    counters: Mutex<Counters>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    events: UnboundedSender<LinkEvent>,
    closed: AtomicBool,
}

impl ScriptedPeerLink {
    fn new(label: String) -> (Arc<Self>, UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            label,
            counters: Mutex::new(Counters::default()),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            events: tx,
            closed: AtomicBool::new(false),
        });
        (link, rx)
    }

    /// Push an event into the stream as the engine would.
    pub fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }

    pub fn offer_count(&self) -> usize {
        self.counters.lock().unwrap().offers
    }

    pub fn answer_count(&self) -> usize {
        self.counters.lock().unwrap().answers
    }

    pub fn local_set_count(&self) -> usize {
        self.counters.lock().unwrap().locals_set
    }

    pub fn remote_set_count(&self) -> usize {
        self.counters.lock().unwrap().remotes_set
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn guard_open(&self) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerLink for ScriptedPeerLink {
    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.guard_open()?;
        let mut counters = self.counters.lock().unwrap();
        counters.offers += 1;
        Ok(SessionDescription::new(
            "offer",
            format!("v=0 {}-offer-{}", self.label, counters.offers),
        ))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.guard_open()?;
        let mut counters = self.counters.lock().unwrap();
        counters.answers += 1;
        Ok(SessionDescription::new(
            "answer",
            format!("v=0 {}-answer-{}", self.label, counters.answers),
        ))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.guard_open()?;
        self.counters.lock().unwrap().locals_set += 1;
        *self.local.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), LinkError> {
        self.guard_open()?;
        self.counters.lock().unwrap().remotes_set += 1;
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        self.guard_open()?;
        self.remote_candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Creates scripted links, optionally failing the first N creations to model
/// an unavailable media stack. Every created link stays reachable for
/// inspection.
pub struct ScriptedLinkFactory {
    label: String,
    scripted_candidates: Vec<IceCandidate>,
    failures_remaining: AtomicUsize,
    created: Mutex<Vec<Arc<ScriptedPeerLink>>>,
}

impl ScriptedLinkFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            scripted_candidates: Vec::new(),
            failures_remaining: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Candidates every new link discovers immediately, before the settle
    /// delay expires.
    pub fn with_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.scripted_candidates = candidates;
        self
    }

    /// Make the next `n` creations fail with `MediaUnavailable`.
    pub fn fail_times(self, n: usize) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub fn created(&self) -> Vec<Arc<ScriptedPeerLink>> {
        self.created.lock().unwrap().clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl PeerLinkFactory for ScriptedLinkFactory {
    async fn create(
        &self,
    ) -> Result<(Arc<dyn PeerLink>, UnboundedReceiver<LinkEvent>), LinkError> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(LinkError::MediaUnavailable("scripted failure".into()));
        }

        let index = self.created_count();
        let (link, events) = ScriptedPeerLink::new(format!("{}-{index}", self.label));
        for candidate in &self.scripted_candidates {
            link.emit(LinkEvent::CandidateDiscovered(candidate.clone()));
        }
        self.created.lock().unwrap().push(Arc::clone(&link));
        Ok((link, events))
    }
}

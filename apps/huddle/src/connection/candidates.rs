use std::sync::Mutex;

use crate::model::IceCandidate;

/// Accumulates candidates discovered by one peer link until the describing
/// message is ready to publish. Drained exactly when the payload is built;
/// anything appended afterward stays here and is never retransmitted.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    inner: Mutex<Vec<IceCandidate>>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate in arrival order.
    pub fn append(&self, candidate: IceCandidate) {
        self.inner.lock().unwrap().push(candidate);
    }

    /// Take everything gathered so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<IceCandidate> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            line_index: n,
            candidate: format!("candidate:{n}"),
        }
    }

    #[test]
    fn drain_preserves_arrival_order_and_clears() {
        let buffer = CandidateBuffer::new();
        buffer.append(candidate(0));
        buffer.append(candidate(1));
        buffer.append(candidate(2));
        assert_eq!(buffer.len(), 3);

        let drained = buffer.drain();
        assert_eq!(
            drained.iter().map(|c| c.line_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_on_empty_buffer_yields_nothing() {
        let buffer = CandidateBuffer::new();
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn appends_after_drain_accumulate_separately() {
        let buffer = CandidateBuffer::new();
        buffer.append(candidate(0));
        buffer.drain();
        buffer.append(candidate(7));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].line_index, 7);
    }
}

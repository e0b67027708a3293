//! Puffer für Remote ICE Candidates
//!
//! Candidates, die vor (oder während) dem Setzen der Remote Description
//! eintreffen, werden hier in Ankunftsreihenfolge gehalten.

use crate::signaling::IceCandidate;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;

/// Ergebnis eines Flush-Durchlaufs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queue: Mutex<VecDeque<IceCandidate>>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, candidate: IceCandidate) {
        self.queue.lock().push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    /// Leert den Puffer strikt FIFO.
    ///
    /// Jeder Candidate wird genau einmal an `apply` übergeben und danach
    /// verworfen, auch wenn `apply` fehlschlägt. Während des Flushs
    /// eingereihte Candidates werden mit abgearbeitet.
    pub async fn flush<F, Fut, E>(&self, mut apply: F) -> FlushReport
    where
        F: FnMut(IceCandidate) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let mut report = FlushReport::default();

        loop {
            // Lock nicht über das await halten
            let next = self.queue.lock().pop_front();
            let Some(candidate) = next else {
                break;
            };

            match apply(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    tracing::debug!("Dropping buffered candidate: {}", e);
                    report.failed += 1;
                }
            }
        }

        report
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 1 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_flush_drains_in_arrival_order() {
        let buffer = IceCandidateBuffer::new();
        for n in 1..=3 {
            buffer.enqueue(candidate(n));
        }

        let mut seen = Vec::new();
        let report = buffer
            .flush(|c| {
                seen.push(c);
                async { Ok::<(), String>(()) }
            })
            .await;

        assert_eq!(report, FlushReport { applied: 3, failed: 0 });
        assert_eq!(seen, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_failing_candidate_is_discarded_not_retried() {
        let buffer = IceCandidateBuffer::new();
        for n in 1..=5 {
            buffer.enqueue(candidate(n));
        }

        let mut attempts = 0;
        let report = buffer
            .flush(|c| {
                attempts += 1;
                let fail = c == candidate(3);
                async move {
                    if fail {
                        Err("bad candidate".to_string())
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(attempts, 5);
        assert_eq!(report, FlushReport { applied: 4, failed: 1 });
        assert_eq!(buffer.len(), 0);

        // Zweiter Flush findet nichts mehr
        let again = buffer.flush(|_| async { Ok::<(), String>(()) }).await;
        assert_eq!(again, FlushReport::default());
    }

    #[tokio::test]
    async fn test_buffer_refills_after_flush() {
        let buffer = IceCandidateBuffer::new();
        buffer.enqueue(candidate(1));
        buffer.flush(|_| async { Ok::<(), String>(()) }).await;

        buffer.enqueue(candidate(2));
        assert_eq!(buffer.len(), 1);
        buffer.clear();
        assert!(buffer.is_empty());
    }
}

//! FairShare-Arbiter: Embargo Queue
//!
//! Submitted requests sit under embargo for a fixed window before they can
//! be batched. Within a batch, ordering is a stable hash of
//! `agent_id || request_id` rather than arrival time, so submission jitter
//! (or a tactically low-latency agent) cannot win tie-breaks by being
//! first.
//!
//! Submission is safe from any thread; draining is the arbitration
//! thread's job. Past the high-water mark the drainer may emit early: the
//! window is a minimum from the caller's perspective, never a maximum.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A request for arbitration in the next cycle.
#[derive(Debug, Clone)]
pub struct ArbitrationRequest {
    pub request_id: Uuid,
    pub agent_id: String,
    /// Currency the agent burns for priority this cycle
    pub burn: Decimal,
}

impl ArbitrationRequest {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            burn: Decimal::ZERO,
        }
    }

    pub fn with_burn(mut self, burn: Decimal) -> Self {
        self.burn = burn;
        self
    }

    /// Stable ordering key: the first eight bytes of
    /// sha256(agent_id || request_id).
    pub fn ordering_key(&self) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.agent_id.as_bytes());
        hasher.update(self.request_id.as_bytes());
        let digest = hasher.finalize();
        u64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}

/// One emitted batch, already in deterministic order.
#[derive(Debug, Clone)]
pub struct RequestBatch {
    pub requests: Vec<ArbitrationRequest>,
    pub emitted_at: Instant,
}

impl RequestBatch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

struct PendingRequest {
    request: ArbitrationRequest,
    submitted_at: Instant,
}

/// Fixed-window embargo batcher.
pub struct EmbargoQueue {
    window: Duration,
    high_water_mark: usize,
    pending: Mutex<VecDeque<PendingRequest>>,
}

impl Default for EmbargoQueue {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl EmbargoQueue {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            high_water_mark: 10_000,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_high_water_mark(mut self, mark: usize) -> Self {
        self.high_water_mark = mark;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Enqueue a request. Callable from any thread; never blocks beyond
    /// the internal lock.
    pub fn submit(&self, request: ArbitrationRequest) {
        self.pending.lock().push_back(PendingRequest {
            request,
            submitted_at: Instant::now(),
        });
    }

    /// Emit a batch of all requests whose embargo has elapsed, or `None`
    /// when nothing has matured. Above the high-water mark everything
    /// pending is drained regardless of age.
    pub fn try_drain(&self) -> Option<RequestBatch> {
        let now = Instant::now();
        let mut pending = self.pending.lock();

        let backpressure = pending.len() > self.high_water_mark;
        let mut matured = Vec::new();
        let mut waiting = VecDeque::new();
        for entry in pending.drain(..) {
            if backpressure || now.duration_since(entry.submitted_at) >= self.window {
                matured.push(entry.request);
            } else {
                waiting.push_back(entry);
            }
        }
        *pending = waiting;
        drop(pending);

        if matured.is_empty() {
            return None;
        }
        Some(Self::finish_batch(matured, backpressure))
    }

    /// Force an immediate batch of everything pending.
    pub fn flush_all(&self) -> Option<RequestBatch> {
        let matured: Vec<ArbitrationRequest> = self
            .pending
            .lock()
            .drain(..)
            .map(|entry| entry.request)
            .collect();
        if matured.is_empty() {
            return None;
        }
        Some(Self::finish_batch(matured, false))
    }

    /// Sleep until the oldest pending request matures, then drain. Returns
    /// `None` when the queue is empty.
    pub async fn wait_and_collect(&self) -> Option<RequestBatch> {
        let oldest_age = {
            let pending = self.pending.lock();
            pending.front().map(|entry| entry.submitted_at.elapsed())
        };

        match oldest_age {
            None => None,
            Some(age) => {
                if age < self.window {
                    tokio::time::sleep(self.window - age).await;
                }
                self.try_drain()
            }
        }
    }

    fn finish_batch(mut requests: Vec<ArbitrationRequest>, backpressure: bool) -> RequestBatch {
        requests.sort_by_key(|r| (r.ordering_key(), r.agent_id.clone()));
        if backpressure {
            tracing::warn!(
                len = requests.len(),
                "embargo queue over high-water mark, batch emitted early"
            );
        }
        RequestBatch {
            requests,
            emitted_at: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_named(agent: &str) -> ArbitrationRequest {
        ArbitrationRequest::new(agent)
    }

    #[test]
    fn test_nothing_matures_before_window() {
        let queue = EmbargoQueue::new(Duration::from_millis(200));
        queue.submit(request_named("a"));
        assert!(queue.try_drain().is_none());
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_flush_all_ignores_window() {
        let queue = EmbargoQueue::new(Duration::from_secs(60));
        queue.submit(request_named("a"));
        queue.submit(request_named("b"));

        let batch = queue.flush_all().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_each_request_in_exactly_one_batch() {
        let queue = EmbargoQueue::new(Duration::ZERO);
        queue.submit(request_named("a"));
        queue.submit(request_named("b"));

        let first = queue.try_drain().unwrap();
        assert_eq!(first.len(), 2);
        assert!(queue.try_drain().is_none());
    }

    #[test]
    fn test_order_is_hash_based_not_arrival() {
        // Fixed request ids make the hash order reproducible and distinct
        // from the submission order for at least one of the permutations.
        let ids: Vec<Uuid> = (0..6)
            .map(|i| Uuid::from_u128(0x1000 + i as u128))
            .collect();

        let build = |order: &[usize]| -> Vec<String> {
            let queue = EmbargoQueue::new(Duration::ZERO);
            for &i in order {
                queue.submit(ArbitrationRequest {
                    request_id: ids[i],
                    agent_id: format!("agent-{i}"),
                    burn: Decimal::ZERO,
                });
            }
            queue
                .try_drain()
                .unwrap()
                .requests
                .iter()
                .map(|r| r.agent_id.clone())
                .collect()
        };

        let forward = build(&[0, 1, 2, 3, 4, 5]);
        let reversed = build(&[5, 4, 3, 2, 1, 0]);
        // Same set, same order, regardless of arrival permutation.
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_backpressure_emits_early() {
        let queue = EmbargoQueue::new(Duration::from_secs(60)).with_high_water_mark(3);
        for i in 0..5 {
            queue.submit(request_named(&format!("agent-{i}")));
        }

        // Window has not elapsed, but the mark is exceeded.
        let batch = queue.try_drain().unwrap();
        assert_eq!(batch.len(), 5);
    }

    #[tokio::test]
    async fn test_wait_and_collect_honors_window() {
        let queue = EmbargoQueue::new(Duration::from_millis(50));
        queue.submit(request_named("a"));

        let started = Instant::now();
        let batch = queue.wait_and_collect().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_wait_and_collect_empty_queue() {
        let queue = EmbargoQueue::default();
        assert!(queue.wait_and_collect().await.is_none());
    }

    #[test]
    fn test_ordering_key_is_stable() {
        let request = ArbitrationRequest {
            request_id: Uuid::from_u128(42),
            agent_id: "agent-x".to_string(),
            burn: Decimal::ZERO,
        };
        assert_eq!(request.ordering_key(), request.ordering_key());
    }
}

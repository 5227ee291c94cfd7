//! Runs a client-supplied list of prompts against the shared slot pool.
//!
//! A failing item never aborts its siblings, and results always come back in
//! the order the prompts were submitted.

use std::time::Duration;

use futures::{StreamExt, stream::FuturesOrdered};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{
    config::{DispatchPolicy, GatewayConfig},
    error::ServiceError,
    model::{GenerationRequest, GenerationResult},
    pool::ExecutionSlotPool,
};

#[derive(Debug)]
pub struct BatchItem {
    pub index: usize,
    pub prompt: String,
    pub outcome: Result<GenerationResult, ServiceError>,
}

impl BatchItem {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Clone)]
pub struct BatchCoordinator {
    pool: ExecutionSlotPool,
    max_batch_size: usize,
    policy: DispatchPolicy,
    batch_timeout: Option<Duration>,
}

impl BatchCoordinator {
    pub fn new(pool: ExecutionSlotPool, config: &GatewayConfig) -> Self {
        Self {
            pool,
            max_batch_size: config.max_batch_size,
            policy: config.batch_dispatch,
            batch_timeout: config.batch_timeout,
        }
    }

    pub fn ensure_within_limit(&self, size: usize) -> Result<(), ServiceError> {
        if size > self.max_batch_size {
            return Err(ServiceError::BatchTooLarge {
                size,
                max: self.max_batch_size,
            });
        }
        Ok(())
    }

    fn parallelism(&self) -> usize {
        match self.policy {
            DispatchPolicy::Sequential => 1,
            DispatchPolicy::Concurrent => self.pool.capacity().max(1),
        }
    }

    pub async fn run_batch(
        &self,
        items: Vec<GenerationRequest>,
    ) -> Result<Vec<BatchItem>, ServiceError> {
        self.ensure_within_limit(items.len())?;

        let size = items.len();
        let parallelism = self.parallelism();
        let deadline = self.batch_timeout.map(|timeout| Instant::now() + timeout);
        info!(size, parallelism, policy = ?self.policy, "running batch");

        // FuturesOrdered yields in push order no matter which item finishes first.
        let mut pending = items.into_iter().enumerate();
        let mut in_flight = FuturesOrdered::new();
        let mut results = Vec::with_capacity(size);
        loop {
            while in_flight.len() < parallelism {
                match pending.next() {
                    Some((index, request)) => {
                        in_flight.push_back(self.run_item(index, request, deadline));
                    }
                    None => break,
                }
            }
            match in_flight.next().await {
                Some(item) => results.push(item),
                None => break,
            }
        }

        let failed = results.iter().filter(|item| !item.is_success()).count();
        debug!(size, failed, "batch finished");
        Ok(results)
    }

    async fn run_item(
        &self,
        index: usize,
        request: GenerationRequest,
        deadline: Option<Instant>,
    ) -> BatchItem {
        let prompt = request.prompt.clone();
        let timeout = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                // Past the deadline no new model work is started, even if a slot is free.
                if remaining.is_zero() {
                    debug!(index, "batch deadline passed, skipping item");
                    return BatchItem {
                        index,
                        prompt,
                        outcome: Err(ServiceError::Timeout(self.batch_timeout.unwrap_or_default())),
                    };
                }
                self.pool.acquire_timeout().min(remaining)
            }
            None => self.pool.acquire_timeout(),
        };
        let outcome = self.pool.run_with_timeout(request, timeout).await;
        if let Err(err) = &outcome {
            debug!(index, kind = err.kind(), "batch item failed");
        }
        BatchItem {
            index,
            prompt,
            outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::model::{GenerationOutput, GenerationParams, ModelCapability, ModelError};

    /// Fails on prompts starting with "fail"; slower for earlier prompts so
    /// that concurrent completion order differs from input order.
    struct Scripted {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl ModelCapability for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate(
            &mut self,
            prompt: &str,
            _params: &GenerationParams,
        ) -> Result<GenerationOutput, ModelError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let delay = prompt
                .trim_start_matches("fail")
                .trim_start_matches('p')
                .parse::<u64>()
                .map(|n| 40u64.saturating_sub(n * 10))
                .unwrap_or(0);
            std::thread::sleep(Duration::from_millis(delay));
            self.active.fetch_sub(1, Ordering::SeqCst);

            if prompt.starts_with("fail") {
                Err(ModelError::Execution(format!("cannot handle {prompt}")))
            } else {
                Ok(GenerationOutput {
                    text: format!("out-{prompt}"),
                    tokens_generated: 1,
                })
            }
        }
    }

    fn coordinator(
        slots: usize,
        policy: DispatchPolicy,
        max_batch_size: usize,
    ) -> (BatchCoordinator, Arc<AtomicUsize>) {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let models = (0..slots)
            .map(|_| {
                Box::new(Scripted {
                    active: active.clone(),
                    peak: peak.clone(),
                }) as Box<dyn ModelCapability>
            })
            .collect();
        let pool = ExecutionSlotPool::new(models, Duration::from_secs(5));
        let config = GatewayConfig {
            max_batch_size,
            batch_dispatch: policy,
            ..GatewayConfig::default()
        };
        (BatchCoordinator::new(pool, &config), peak)
    }

    fn requests(prompts: &[&str]) -> Vec<GenerationRequest> {
        prompts
            .iter()
            .map(|p| GenerationRequest::new(*p, GenerationParams::default()))
            .collect()
    }

    fn assert_partial_failure(items: &[BatchItem]) {
        assert_eq!(items.len(), 4);
        for (pos, item) in items.iter().enumerate() {
            assert_eq!(item.index, pos);
        }
        assert_eq!(items[0].outcome.as_ref().unwrap().text, "out-p0");
        assert_eq!(items[1].outcome.as_ref().unwrap().text, "out-p1");
        let err = items[2].outcome.as_ref().unwrap_err();
        assert_eq!(err.kind(), "inference_error");
        assert_eq!(items[2].prompt, "fail2");
        assert_eq!(items[3].outcome.as_ref().unwrap().text, "out-p3");
    }

    #[tokio::test]
    async fn sequential_batch_isolates_failures() {
        let (coordinator, peak) = coordinator(2, DispatchPolicy::Sequential, 8);
        let items = coordinator
            .run_batch(requests(&["p0", "p1", "fail2", "p3"]))
            .await
            .unwrap();
        assert_partial_failure(&items);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_batch_keeps_input_order() {
        let (coordinator, peak) = coordinator(2, DispatchPolicy::Concurrent, 8);
        let items = coordinator
            .run_batch(requests(&["p0", "p1", "fail2", "p3"]))
            .await
            .unwrap();
        assert_partial_failure(&items);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_before_running() {
        let (coordinator, peak) = coordinator(1, DispatchPolicy::Sequential, 2);
        let err = coordinator
            .run_batch(requests(&["p0", "p1", "p2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BatchTooLarge { size: 3, max: 2 }));
        assert_eq!(peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_deadline_fails_items_individually() {
        let (mut coordinator, _) = coordinator(1, DispatchPolicy::Sequential, 8);
        coordinator.batch_timeout = Some(Duration::ZERO);

        let held = coordinator.pool.acquire(Duration::ZERO).await.unwrap();
        let items = coordinator
            .run_batch(requests(&["p0", "p1"]))
            .await
            .unwrap();
        drop(held);

        assert_eq!(items.len(), 2);
        assert!(items
            .iter()
            .all(|item| matches!(item.outcome, Err(ServiceError::Timeout(_)))));
    }

    #[tokio::test]
    async fn deadline_stops_new_work_while_slots_are_free() {
        let (mut coordinator, _) = coordinator(1, DispatchPolicy::Sequential, 8);
        // Each "p0" call takes 40ms, so only the first few fit in 100ms.
        coordinator.batch_timeout = Some(Duration::from_millis(100));

        let items = coordinator
            .run_batch(requests(&["p0", "p0", "p0", "p0", "p0", "p0"]))
            .await
            .unwrap();

        assert_eq!(items.len(), 6);
        assert_eq!(items[0].outcome.as_ref().unwrap().text, "out-p0");
        assert!(matches!(items[5].outcome, Err(ServiceError::Timeout(_))));
        let skipped = items.iter().filter(|item| !item.is_success()).count();
        assert!(skipped >= 3, "only {skipped} items were skipped");
    }
}

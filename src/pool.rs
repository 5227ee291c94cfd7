//! Fixed-size pool of model instances.
//!
//! Every generation in the service goes through [`ExecutionSlotPool::run`].
//! A slot is held by at most one request at a time; with a single slot this
//! is a global lock around the model. Waiting for a slot is the only
//! suspension point, and it is always bounded by a timeout.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    task,
};
use tracing::{debug, error, warn};

use crate::{
    error::ServiceError,
    model::{GenerationOutput, GenerationRequest, GenerationResult, ModelCapability, ModelError},
};

/// One loaded model instance.
pub struct ExecutionSlot {
    id: usize,
    model: Box<dyn ModelCapability>,
}

impl ExecutionSlot {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        params: &crate::model::GenerationParams,
    ) -> Result<GenerationOutput, ModelError> {
        self.model.generate(prompt, params)
    }
}

struct PoolInner {
    free: Mutex<Vec<ExecutionSlot>>,
    permits: Arc<Semaphore>,
    capacity: usize,
    waiting: AtomicUsize,
    acquire_timeout: Duration,
    model_name: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStatus {
    pub capacity: usize,
    pub available: usize,
    pub waiting: usize,
}

/// Shared handle to the pool. Cloning is cheap and every clone refers to the
/// same slots.
#[derive(Clone)]
pub struct ExecutionSlotPool {
    inner: Arc<PoolInner>,
}

impl ExecutionSlotPool {
    /// Builds a pool with one slot per model instance. `acquire_timeout` bounds
    /// the wait in [`run`](Self::run).
    pub fn new(models: Vec<Box<dyn ModelCapability>>, acquire_timeout: Duration) -> Self {
        let capacity = models.len();
        let model_name = models
            .first()
            .map(|m| m.name().to_string())
            .unwrap_or_default();
        let free = models
            .into_iter()
            .enumerate()
            .map(|(id, model)| ExecutionSlot { id, model })
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits: Arc::new(Semaphore::new(capacity)),
                capacity,
                waiting: AtomicUsize::new(0),
                acquire_timeout,
                model_name,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model_name
    }

    /// Number of callers currently blocked in [`acquire`](Self::acquire).
    pub fn queue_depth(&self) -> usize {
        self.inner.waiting.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            capacity: self.inner.capacity,
            available: self.inner.permits.available_permits(),
            waiting: self.queue_depth(),
        }
    }

    /// Waits up to `timeout` for a free slot. A zero timeout only succeeds if
    /// a slot is free right now. Dropping the returned future abandons the
    /// wait without taking a slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<SlotGuard, ServiceError> {
        let _waiting = WaitingGuard::enter(&self.inner.waiting);
        let permit =
            match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => {
                    return Err(ServiceError::ServiceOverloaded(
                        "slot pool is shutting down".into(),
                    ));
                }
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for slot");
                    return Err(ServiceError::Timeout(timeout));
                }
            };

        let slot = self.take_free_slot()?;
        debug!(slot = slot.id, "slot acquired");

        Ok(SlotGuard {
            slot: Some(slot),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Pops a slot for a caller that already holds a permit. The free list
    /// can only be empty here if `close` ran after the permit was granted.
    fn take_free_slot(&self) -> Result<ExecutionSlot, ServiceError> {
        if let Some(slot) = self.inner.free.lock().pop() {
            return Ok(slot);
        }
        if self.is_closed() {
            return Err(ServiceError::ServiceOverloaded(
                "slot pool is shutting down".into(),
            ));
        }
        error!("permit granted with an empty free list");
        Err(ServiceError::Inference("slot bookkeeping out of sync".into()))
    }

    /// Acquires a slot, runs the model on a blocking thread and releases the
    /// slot once the call returns, whether or not the caller is still
    /// waiting for the answer.
    pub async fn run(&self, request: GenerationRequest) -> Result<GenerationResult, ServiceError> {
        self.run_with_timeout(request, self.inner.acquire_timeout)
            .await
    }

    pub async fn run_with_timeout(
        &self,
        request: GenerationRequest,
        timeout: Duration,
    ) -> Result<GenerationResult, ServiceError> {
        let mut guard = self.acquire(timeout).await?;
        let queued_ms = request.submitted_at.elapsed().as_millis() as u64;

        // The guard moves into the blocking task so the slot comes back when
        // the model call ends, even if this future has been dropped.
        let handle = task::spawn_blocking(move || {
            let slot = guard.id();
            let started = Instant::now();
            let output = guard.generate(&request.prompt, &request.params);
            (slot, output, started.elapsed())
        });

        match handle.await {
            Ok((slot, Ok(output), elapsed)) => {
                debug!(
                    slot,
                    queued_ms,
                    elapsed_ms = elapsed.as_millis() as u64,
                    tokens = output.tokens_generated,
                    "generation finished"
                );
                Ok(GenerationResult {
                    text: output.text,
                    tokens_generated: output.tokens_generated,
                    elapsed,
                    slot,
                })
            }
            Ok((slot, Err(err), _)) => {
                error!(slot, error = %err, "model call failed");
                Err(ServiceError::Inference(err.to_string()))
            }
            Err(join_err) => {
                error!(error = %join_err, "inference task aborted");
                Err(ServiceError::Inference(format!(
                    "inference task failed: {join_err}"
                )))
            }
        }
    }

    /// Stops handing out slots. Pending and future acquisitions fail; slots
    /// in use are dropped when their holders finish.
    pub fn close(&self) {
        self.inner.permits.close();
        let retired = {
            let mut free = self.inner.free.lock();
            std::mem::take(&mut *free)
        };
        debug!(retired = retired.len(), "slot pool closed");
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.inner.acquire_timeout
    }
}

/// Exclusive hold on one slot, returned to the pool on drop.
pub struct SlotGuard {
    slot: Option<ExecutionSlot>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl SlotGuard {
    pub fn id(&self) -> usize {
        self.slot.as_ref().map(ExecutionSlot::id).unwrap_or_default()
    }

    pub fn generate(
        &mut self,
        prompt: &str,
        params: &crate::model::GenerationParams,
    ) -> Result<GenerationOutput, ModelError> {
        match self.slot.as_mut() {
            Some(slot) => slot.generate(prompt, params),
            None => Err(ModelError::Execution("slot already released".into())),
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if std::thread::panicking() {
                warn!(slot = slot.id, "model call panicked, returning slot to pool");
            }
            // Slot goes back before the permit is released (field drop order).
            if !self.pool.permits.is_closed() {
                self.pool.free.lock().push(slot);
            }
        }
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

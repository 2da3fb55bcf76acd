//! Worker dispatch service.
//!
//! [`AudioWorkerService`] owns at most one background worker and multiplexes
//! any number of concurrent requests over it. Each request is registered in a
//! pending table under a fresh [`RequestId`], bounded by its own timeout, and
//! settled exactly once: by the worker's response, by its deadline, by being
//! evicted as the oldest request when the table is full, or by terminate.
//!
//! All state sits behind a single mutex. Settlement always starts by removing
//! the entry from the table, and the entry owns the only sender of the
//! caller's reply, so whichever path removes it is the only one that can
//! settle it.

mod reply;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use futures::future::{try_join_all, TryJoinAll};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{runtime::Handle, sync::oneshot, task::AbortHandle, time::Instant};
use tracing::{debug, error, info, warn};

use crate::{
    analysis::{
        BeatDetectionOptions, BeatDetectionResult, FftProcessOptions, FftProcessResult,
        FindPeaksOptions, FindPeaksResult, FrequencyConversionOptions, FrequencyConversionResult,
        LevelOptions, LevelResult, Operation, SmoothDataOptions, SmoothDataResult,
        TimeDomainOptions, TimeDomainResult, WaveformDownsampleOptions, WaveformDownsampleResult,
    },
    config::{WorkerConfig, WorkerConfigUpdate},
    protocol::{OperationKind, RequestId, WorkerMessage},
    worker::{ThreadBackend, WorkerBackend, WorkerEvent, WorkerEvents, WorkerHandle},
    AudioWorkerError, Result,
};

pub use reply::Reply;
use reply::Settlement;

/// Read-only snapshot of the service counters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub is_initialized: bool,
    pub pending_count: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Typed, timeout-bounded, backpressure-bounded request API over one
/// background worker.
///
/// Workers are started on construction when the config enables them. Timers
/// run on the tokio runtime that is current when the worker is initialized;
/// initializing outside a runtime fails and records the reason in
/// [`WorkerStats::last_error`]. Dropping the service terminates the worker.
pub struct AudioWorkerService {
    shared: Arc<Shared>,
    backend: Arc<dyn WorkerBackend>,
}

impl AudioWorkerService {
    /// Creates a service backed by a dedicated worker thread.
    pub fn new(config: WorkerConfig) -> Self {
        Self::with_backend(config, ThreadBackend::default())
    }

    /// Creates a service that starts its workers through `backend`.
    pub fn with_backend(config: WorkerConfig, backend: impl WorkerBackend) -> Self {
        let enabled = config.enabled;
        let service = Self {
            shared: Arc::new(Shared::new(config)),
            backend: Arc::new(backend),
        };
        if enabled && service.is_supported() {
            service.initialize();
        }
        service
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Merges `update` into the config, stopping or starting the worker when
    /// `enabled` changes.
    pub fn configure(&self, update: WorkerConfigUpdate) {
        let (enabled, running) = {
            let mut state = self.shared.lock();
            state.config.apply(&update);
            (state.config.enabled, state.worker.is_some())
        };
        debug!(?update, "audio worker reconfigured");

        if !enabled && running {
            self.terminate();
        } else if enabled && !running && self.is_supported() {
            self.initialize();
        }
    }

    pub fn config(&self) -> WorkerConfig {
        self.shared.lock().config.clone()
    }

    pub fn is_supported(&self) -> bool {
        self.backend.is_supported()
    }

    /// True when the environment supports workers, the service is enabled and
    /// a worker is running.
    pub fn is_available(&self) -> bool {
        let state = self.shared.lock();
        self.is_supported() && state.config.enabled && state.worker.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().worker.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// True while at least one request is in flight.
    pub fn is_processing(&self) -> bool {
        self.pending_count() > 0
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the worker. Returns the running state; a no-op when the worker
    /// already runs or the environment does not support workers.
    pub fn initialize(&self) -> bool {
        let (generation, runtime) = {
            let mut state = self.shared.lock();
            if state.worker.is_some() || !self.is_supported() {
                return state.worker.is_some();
            }
            let Ok(runtime) = Handle::try_current() else {
                let err = AudioWorkerError::NoRuntime;
                error!(%err, "failed to initialize audio worker");
                state.last_error = Some(err.to_string());
                return false;
            };
            state.generation += 1;
            (state.generation, runtime)
        };

        // Spawn outside the lock so a backend may report events right away.
        let spawned = self.backend.spawn(Shared::events_for(&self.shared, generation));

        let mut state = self.shared.lock();
        match spawned {
            Ok(handle) if state.worker.is_none() => {
                state.worker = Some(ActiveWorker {
                    handle: Arc::from(handle),
                    runtime,
                    generation,
                });
                info!(generation, "audio worker initialized");
                true
            }
            Ok(handle) => {
                // A concurrent initialize won the race.
                drop(state);
                handle.terminate();
                true
            }
            Err(err) => {
                error!(%err, "failed to initialize audio worker");
                state.last_error = Some(err.to_string());
                false
            }
        }
    }

    /// Stops the worker and rejects every pending request with
    /// [`AudioWorkerError::Terminated`]. Safe to call repeatedly.
    pub fn terminate(&self) {
        let (worker, drained) = {
            let mut state = self.shared.lock();
            let drained: Vec<PendingRequest> = state.pending.drain().map(|(_, r)| r).collect();
            (state.worker.take(), drained)
        };

        if let Some(worker) = worker {
            worker.handle.terminate();
            info!(
                generation = worker.generation,
                drained = drained.len(),
                "audio worker terminated"
            );
        }

        for request in drained {
            request.settle(Err(AudioWorkerError::Terminated));
        }
    }

    /// Terminates and re-initializes the worker.
    pub fn restart(&self) -> bool {
        self.terminate();
        self.initialize()
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Sends `payload` to the worker as `operation` and returns the future of
    /// its decoded result.
    ///
    /// Fails with [`AudioWorkerError::NotInitialized`] when no worker runs. When
    /// the pending table is full the oldest request is rejected with
    /// [`AudioWorkerError::QueueOverflow`] before this one is admitted.
    pub fn dispatch<T, R>(&self, operation: OperationKind, payload: &T) -> Reply<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let data = match serde_json::to_value(payload) {
            Ok(data) => data,
            Err(err) => return Reply::failed(err.into()),
        };
        match Shared::register(&self.shared, operation, data) {
            Ok(rx) => Reply::waiting(rx),
            Err(err) => Reply::failed(err),
        }
    }

    fn submit<O: Operation>(&self, options: &O) -> Reply<O::Output> {
        self.dispatch(O::KIND, options)
    }

    /// Smooths, rescales and summarises byte frequency data.
    pub fn process_fft(&self, options: &FftProcessOptions) -> Reply<FftProcessResult> {
        self.submit(options)
    }

    /// Downsamples time-domain data and computes RMS, peak and zero crossings.
    pub fn process_time_domain(&self, options: &TimeDomainOptions) -> Reply<TimeDomainResult> {
        self.submit(options)
    }

    /// RMS and peak levels, linear and in dB.
    pub fn calculate_levels(&self, options: &LevelOptions) -> Reply<LevelResult> {
        self.submit(options)
    }

    pub fn detect_beat(&self, options: &BeatDetectionOptions) -> Reply<BeatDetectionResult> {
        self.submit(options)
    }

    pub fn downsample_waveform(
        &self,
        options: &WaveformDownsampleOptions,
    ) -> Reply<WaveformDownsampleResult> {
        self.submit(options)
    }

    pub fn smooth_data(&self, options: &SmoothDataOptions) -> Reply<SmoothDataResult> {
        self.submit(options)
    }

    pub fn find_peaks(&self, options: &FindPeaksOptions) -> Reply<FindPeaksResult> {
        self.submit(options)
    }

    pub fn convert_frequencies(
        &self,
        options: &FrequencyConversionOptions,
    ) -> Reply<FrequencyConversionResult> {
        self.submit(options)
    }

    /// Dispatches every frame at once and resolves with all results, or with
    /// the first failure.
    pub fn process_fft_batch(
        &self,
        frames: &[FftProcessOptions],
    ) -> TryJoinAll<Reply<FftProcessResult>> {
        try_join_all(frames.iter().map(|frame| self.process_fft(frame)))
    }

    /// Runs `operation` on the worker when it is available and falls back to
    /// `fallback` on the calling thread when it is not or when the worker path
    /// fails for any reason.
    pub async fn process_with_fallback<T, R, F>(
        &self,
        operation: OperationKind,
        options: T,
        fallback: F,
    ) -> R
    where
        T: Serialize,
        R: DeserializeOwned,
        F: FnOnce(&T) -> R,
    {
        if self.is_available() {
            match self.dispatch::<T, R>(operation, &options).await {
                Ok(result) => return result,
                Err(err) => warn!(%operation, %err, "worker path failed, running fallback"),
            }
        }
        fallback(&options)
    }

    /// [`process_with_fallback`](Self::process_with_fallback) using the
    /// operation's own implementation as the fallback.
    pub async fn run_with_local_fallback<O: Operation>(&self, options: &O) -> Result<O::Output> {
        if self.is_available() {
            match self.submit(options).await {
                Ok(result) => return Ok(result),
                Err(err) => warn!(operation = %O::KIND, %err, "worker path failed, running locally"),
            }
        }
        options.run()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn stats(&self) -> WorkerStats {
        let state = self.shared.lock();
        WorkerStats {
            is_initialized: state.worker.is_some(),
            pending_count: state.pending.len(),
            error_count: state.error_count,
            last_error: state.last_error.clone(),
        }
    }

    /// Clears the error counters; pending requests are untouched.
    pub fn reset_error_count(&self) {
        let mut state = self.shared.lock();
        state.error_count = 0;
        state.last_error = None;
    }
}

impl Drop for AudioWorkerService {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl fmt::Debug for AudioWorkerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("AudioWorkerService")
            .field("config", &state.config)
            .field("initialized", &state.worker.is_some())
            .field("pending", &state.pending.len())
            .field("error_count", &state.error_count)
            .finish()
    }
}

struct Shared {
    state: Mutex<DispatchState>,
}

struct DispatchState {
    worker: Option<ActiveWorker>,
    pending: HashMap<RequestId, PendingRequest>,
    request_counter: u64,
    /// Bumped for every spawned worker so events of retired ones are ignored.
    generation: u64,
    config: WorkerConfig,
    error_count: u64,
    last_error: Option<String>,
}

struct ActiveWorker {
    handle: Arc<dyn WorkerHandle>,
    runtime: Handle,
    generation: u64,
}

struct PendingRequest {
    operation: OperationKind,
    reply: oneshot::Sender<Settlement>,
    deadline: AbortHandle,
    created_at: Instant,
}

impl PendingRequest {
    fn settle(self, outcome: Settlement) {
        self.deadline.abort();
        // The caller may have dropped its reply; nothing to deliver then.
        let _ = self.reply.send(outcome);
    }
}

impl Shared {
    fn new(config: WorkerConfig) -> Self {
        Self {
            state: Mutex::new(DispatchState {
                worker: None,
                pending: HashMap::new(),
                request_counter: 0,
                generation: 0,
                config,
                error_count: 0,
                last_error: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        // Nothing panics while the lock is held, so a poisoned state is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn events_for(this: &Arc<Self>, generation: u64) -> WorkerEvents {
        let shared = Arc::downgrade(this);
        WorkerEvents::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_event(generation, event);
            }
        })
    }

    fn register(
        this: &Arc<Self>,
        operation: OperationKind,
        data: Value,
    ) -> Result<oneshot::Receiver<Settlement>> {
        let mut state = this.lock();
        let (handle, runtime, generation) = match &state.worker {
            Some(worker) => (
                Arc::clone(&worker.handle),
                worker.runtime.clone(),
                worker.generation,
            ),
            None => return Err(AudioWorkerError::NotInitialized),
        };

        // Room is made before admission, but the displaced entries are only
        // rejected once the new request has reached the worker.
        let limit = state.config.queue_limit();
        let mut evicted = Vec::new();
        while state.pending.len() >= limit {
            match state.take_oldest() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }

        state.request_counter += 1;
        let id = RequestId::new(state.request_counter);
        let created_at = Instant::now();
        let deadline = created_at + state.config.timeout();
        let timer = runtime
            .spawn(expire_at(Arc::downgrade(this), id, deadline))
            .abort_handle();

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                operation,
                reply: tx,
                deadline: timer,
                created_at,
            },
        );
        let pending = state.pending.len();
        drop(state);

        // The worker may answer before `post` returns.
        let posted = handle.post(WorkerMessage {
            id,
            kind: operation,
            data,
        });

        match posted {
            Ok(()) => {
                debug!(%id, %operation, pending, "dispatched worker request");
                for (evicted_id, request) in evicted {
                    warn!(
                        id = %evicted_id,
                        operation = %request.operation,
                        "dropping oldest worker request due to queue overflow"
                    );
                    request.settle(Err(AudioWorkerError::QueueOverflow));
                }
                Ok(rx)
            }
            Err(err) => {
                error!(%id, %operation, %err, "failed to post worker request");
                this.withdraw(id, generation, evicted, &err);
                Err(err)
            }
        }
    }

    /// Removes a request the worker never received and puts back the entries
    /// it displaced. Entries that can no longer wait are settled with the
    /// outcome they would have had in the table.
    fn withdraw(
        &self,
        id: RequestId,
        generation: u64,
        evicted: Vec<(RequestId, PendingRequest)>,
        err: &AudioWorkerError,
    ) {
        let mut state = self.lock();
        state.error_count += 1;
        state.last_error = Some(err.to_string());
        if let Some(request) = state.pending.remove(&id) {
            request.deadline.abort();
        }

        let current = state.worker.as_ref().map(|w| w.generation) == Some(generation);
        let limit = state.config.queue_limit();
        let mut rejected = Vec::new();
        for (evicted_id, request) in evicted {
            let outcome = if !current {
                AudioWorkerError::Terminated
            } else if request.deadline.is_finished() {
                AudioWorkerError::Timeout(request.operation)
            } else if state.pending.len() >= limit {
                AudioWorkerError::QueueOverflow
            } else {
                state.pending.insert(evicted_id, request);
                continue;
            };
            rejected.push((evicted_id, request, outcome));
        }
        drop(state);

        for (evicted_id, request, outcome) in rejected {
            warn!(id = %evicted_id, %outcome, "displaced worker request could not be restored");
            request.settle(Err(outcome));
        }
    }

    fn expire(&self, id: RequestId) {
        let request = self.lock().pending.remove(&id);
        if let Some(request) = request {
            let operation = request.operation;
            warn!(%id, %operation, "worker request timed out");
            request.settle(Err(AudioWorkerError::Timeout(operation)));
        }
    }

    fn handle_event(&self, generation: u64, event: WorkerEvent) {
        let mut state = self.lock();
        if state.worker.as_ref().map(|w| w.generation) != Some(generation) {
            debug!(generation, "ignoring event from retired audio worker");
            return;
        }

        match event {
            WorkerEvent::Response(response) => {
                let Some(request) = state.pending.remove(&response.id) else {
                    debug!(id = %response.id, "response for unknown or settled request");
                    return;
                };
                let outcome = match response.error {
                    Some(message) => {
                        state.error_count += 1;
                        state.last_error = Some(message.clone());
                        Err(AudioWorkerError::Worker(message))
                    }
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                drop(state);
                debug!(id = %response.id, ok = outcome.is_ok(), "worker request settled");
                request.settle(outcome);
            }
            WorkerEvent::Fault(message) => {
                error!(%message, "audio worker error");
                state.error_count += 1;
                state.last_error = Some(message);
            }
        }
    }
}

impl DispatchState {
    fn take_oldest(&mut self) -> Option<(RequestId, PendingRequest)> {
        let oldest = self
            .pending
            .iter()
            .min_by_key(|(id, request)| (request.created_at, id.seq()))
            .map(|(id, _)| *id)?;
        self.pending.remove_entry(&oldest)
    }
}

async fn expire_at(shared: Weak<Shared>, id: RequestId, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(shared) = shared.upgrade() {
        shared.expire(id);
    }
}

//! Background execution contexts the dispatch service can drive.
//!
//! A worker is only reachable through messages: the service posts
//! [`WorkerMessage`]s into it and receives [`WorkerEvent`]s back through the
//! [`WorkerEvents`] sink it handed over at spawn time.

use std::{
    any::Any,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    analysis,
    protocol::{WorkerMessage, WorkerResponse},
    AudioWorkerError, Result,
};

/// Something a worker reports back to its owner.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Answer to one posted message.
    Response(WorkerResponse),
    /// Failure of the worker itself, not tied to any request.
    Fault(String),
}

/// Sink a worker uses to report responses and faults.
#[derive(Clone)]
pub struct WorkerEvents {
    deliver: Arc<dyn Fn(WorkerEvent) + Send + Sync>,
}

impl WorkerEvents {
    pub fn new(deliver: impl Fn(WorkerEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn respond(&self, response: WorkerResponse) {
        (self.deliver)(WorkerEvent::Response(response));
    }

    pub fn fault(&self, message: impl Into<String>) {
        (self.deliver)(WorkerEvent::Fault(message.into()));
    }
}

impl fmt::Debug for WorkerEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerEvents").finish()
    }
}

/// Factory for worker contexts.
pub trait WorkerBackend: Send + Sync + 'static {
    /// Whether this environment can run workers at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Starts a new worker that reports through `events`.
    fn spawn(&self, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>>;
}

/// Handle of a running worker.
///
/// The service calls both methods without holding its own locks, so a worker
/// may report events from inside `post` or `terminate`.
pub trait WorkerHandle: Send + Sync {
    /// Hands a message to the worker without waiting for it to be processed.
    fn post(&self, message: WorkerMessage) -> Result<()>;

    /// Stops the worker. Events it emits afterwards are ignored by the owner,
    /// and later posts may fail.
    fn terminate(&self);
}

type MessageHandler = Arc<dyn Fn(WorkerMessage) -> WorkerResponse + Send + Sync>;

/// Runs the processing table on a dedicated OS thread.
#[derive(Clone)]
pub struct ThreadBackend {
    thread_name: String,
    handler: MessageHandler,
}

impl Default for ThreadBackend {
    fn default() -> Self {
        Self::with_handler(analysis::handle_message)
    }
}

impl ThreadBackend {
    /// Worker thread that answers messages with `handler` instead of the
    /// built-in processing table.
    pub fn with_handler(
        handler: impl Fn(WorkerMessage) -> WorkerResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            thread_name: "audio-worker".to_string(),
            handler: Arc::new(handler),
        }
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl fmt::Debug for ThreadBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBackend")
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

impl WorkerBackend for ThreadBackend {
    fn spawn(&self, events: WorkerEvents) -> Result<Box<dyn WorkerHandle>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Arc::clone(&self.handler);
        thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || run_worker_loop(rx, handler, events))?;
        Ok(Box::new(ThreadWorker {
            tx: Mutex::new(Some(tx)),
        }))
    }
}

struct ThreadWorker {
    tx: Mutex<Option<mpsc::UnboundedSender<WorkerMessage>>>,
}

impl WorkerHandle for ThreadWorker {
    fn post(&self, message: WorkerMessage) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match tx.as_ref() {
            Some(tx) => tx
                .send(message)
                .map_err(|err| AudioWorkerError::Disconnected(format!("request {}", err.0.id))),
            None => Err(AudioWorkerError::Disconnected(format!(
                "request {}",
                message.id
            ))),
        }
    }

    fn terminate(&self) {
        // Closing the inbox ends the loop once the message in hand is done;
        // the thread is detached rather than joined.
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

fn run_worker_loop(
    mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    handler: MessageHandler,
    events: WorkerEvents,
) {
    while let Some(message) = rx.blocking_recv() {
        let id = message.id;
        match catch_unwind(AssertUnwindSafe(|| handler(message))) {
            Ok(response) => events.respond(response),
            Err(panic) => events.fault(format!(
                "worker panicked while handling {id}: {}",
                panic_message(panic.as_ref())
            )),
        }
    }
    debug!("audio worker thread exiting");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc as std_mpsc, time::Duration};

    use serde_json::json;

    use super::*;
    use crate::protocol::{OperationKind, RequestId};

    fn collecting_events() -> (WorkerEvents, std_mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let events = WorkerEvents::new(move |event| {
            let _ = tx.lock().map(|tx| tx.send(event));
        });
        (events, rx)
    }

    #[test]
    fn thread_worker_answers_messages() {
        let (events, rx) = collecting_events();
        let worker = ThreadBackend::default()
            .thread_name("analysis-test")
            .spawn(events)
            .unwrap();

        let id = RequestId::new(1);
        worker
            .post(WorkerMessage {
                id,
                kind: OperationKind::ConvertFrequencies,
                data: json!({ "bins": [2], "sampleRate": 1000, "fftSize": 10 }),
            })
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Response(response) => {
                assert_eq!(response.id, id);
                assert_eq!(response.result, Some(json!({ "frequencies": [200.0] })));
            }
            other => panic!("unexpected event {other:?}"),
        }
        worker.terminate();
    }

    #[test]
    fn handler_panic_becomes_fault_and_worker_survives() {
        let (events, rx) = collecting_events();
        let backend = ThreadBackend::with_handler(|message| {
            if message.kind == OperationKind::FindPeaks {
                panic!("peak finder exploded");
            }
            analysis::handle_message(message)
        })
        .thread_name("audio-worker-test");
        let worker = backend.spawn(events).unwrap();

        worker
            .post(WorkerMessage {
                id: RequestId::new(1),
                kind: OperationKind::FindPeaks,
                data: json!({ "data": [] }),
            })
            .unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            WorkerEvent::Fault(message) => assert!(message.contains("peak finder exploded")),
            other => panic!("unexpected event {other:?}"),
        }

        worker
            .post(WorkerMessage {
                id: RequestId::new(2),
                kind: OperationKind::SmoothData,
                data: json!({ "data": [1.0] }),
            })
            .unwrap();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerEvent::Response(_)
        ));
        worker.terminate();
    }

    #[test]
    fn post_after_terminate_is_disconnected() {
        let (events, _rx) = collecting_events();
        let worker = ThreadBackend::default().spawn(events).unwrap();

        worker.terminate();
        worker.terminate();

        let err = worker
            .post(WorkerMessage {
                id: RequestId::new(7),
                kind: OperationKind::SmoothData,
                data: json!({ "data": [1.0] }),
            })
            .unwrap_err();
        assert!(matches!(
            &err,
            AudioWorkerError::Disconnected(target) if target.starts_with("request 7-")
        ));
    }
}

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use health::{HealthCheck, HealthCheckResult};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, info, warn};

use crate::error::StreamError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Stopped { because_of_error: bool },
    Starting,
    Running,
    /// Still running, but failing to consume since `since`.
    Errored { since: Instant },
    Stopping { because_of_error: bool },
}

impl StreamState {
    fn describe(&self) -> String {
        match self {
            StreamState::Stopped {
                because_of_error: false,
            } => "stopped".to_owned(),
            StreamState::Stopped {
                because_of_error: true,
            } => "stopped because of an error".to_owned(),
            StreamState::Starting => "starting".to_owned(),
            StreamState::Running => "running".to_owned(),
            StreamState::Errored { since } => {
                format!("failing for {}s", since.elapsed().as_secs())
            }
            StreamState::Stopping { .. } => "stopping".to_owned(),
        }
    }
}

fn lock(state: &Mutex<StreamState>) -> std::sync::MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of one stream: started once, stopped once, and polled for
/// liveness and readiness in between.
pub struct ManagedStream {
    name: String,
    grace_period: Duration,
    state: Arc<Mutex<StreamState>>,
    cancel: CancellationToken,
}

impl ManagedStream {
    pub fn new(name: &str, grace_period: Duration) -> Self {
        Self {
            name: name.to_owned(),
            grace_period,
            state: Arc::new(Mutex::new(StreamState::Stopped {
                because_of_error: false,
            })),
            cancel: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    /// Alive unless stopped because of an error, or failing for longer than
    /// the grace period.
    pub fn is_healthy(&self) -> bool {
        match self.state() {
            StreamState::Starting | StreamState::Running => true,
            StreamState::Errored { since } => since.elapsed() < self.grace_period,
            StreamState::Stopping { because_of_error }
            | StreamState::Stopped { because_of_error } => !because_of_error,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Spawn the loop of the stream. `run` is handed a `StreamHandle` to
    /// report progress and to learn when to stop; its result decides how the
    /// stream ends.
    pub fn start<F, Fut>(&self, run: F) -> JoinHandle<()>
    where
        F: FnOnce(StreamHandle) -> Fut,
        Fut: Future<Output = Result<(), StreamError>> + Send + 'static,
    {
        *lock(&self.state) = StreamState::Starting;
        info!(stream = %self.name, "starting stream");

        let handle = StreamHandle {
            state: self.state.clone(),
            cancel: self.cancel.clone(),
        };
        let running = run(handle);
        let name = self.name.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            let result = running.await;

            let mut state = lock(&state);
            let because_of_error = match (&result, *state) {
                (Err(_), _) => true,
                (Ok(()), StreamState::Stopping { because_of_error }) => because_of_error,
                (Ok(()), _) => false,
            };
            match result {
                Ok(()) => info!(stream = %name, because_of_error, "stream stopped"),
                Err(error) => error!(stream = %name, "stream stopped: {}", error),
            }
            *state = StreamState::Stopped { because_of_error };
        })
    }

    /// Ask the stream to stop once the record in flight is handled.
    pub fn stop(&self, because_of_error: bool) {
        {
            let mut state = lock(&self.state);
            *state = match *state {
                // Never started or already done: only keep an error flag
                StreamState::Stopped {
                    because_of_error: stopped_by_error,
                } => StreamState::Stopped {
                    because_of_error: because_of_error || stopped_by_error,
                },
                _ => StreamState::Stopping { because_of_error },
            };
        }
        if because_of_error {
            warn!(stream = %self.name, "stopping stream because of an error");
        } else {
            info!(stream = %self.name, "stopping stream");
        }
        self.cancel.cancel();
    }
}

#[async_trait]
impl HealthCheck for ManagedStream {
    async fn check(&self) -> HealthCheckResult {
        let state = self.state().describe();
        if self.is_healthy() {
            HealthCheckResult::healthy(&self.name, &state)
        } else {
            HealthCheckResult::unhealthy(&self.name, &state)
        }
    }
}

/// Held by the loop of a stream to report its state.
#[derive(Clone)]
pub struct StreamHandle {
    state: Arc<Mutex<StreamState>>,
    cancel: CancellationToken,
}

impl StreamHandle {
    /// A record went through, or the loop started: the stream is running
    /// unless it is being stopped.
    pub fn running(&self) {
        let mut state = lock(&self.state);
        if matches!(
            *state,
            StreamState::Starting | StreamState::Errored { .. }
        ) {
            *state = StreamState::Running;
        }
    }

    /// Consuming failed. Only the first failure of a streak is timestamped.
    pub fn errored(&self) {
        let mut state = lock(&self.state);
        if matches!(*state, StreamState::Starting | StreamState::Running) {
            *state = StreamState::Errored {
                since: Instant::now(),
            };
        }
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(60);

    /// Start a stream whose loop reports through the returned handle and
    /// ends with `result` once stopped.
    fn start(
        stream: &ManagedStream,
        result: Result<(), StreamError>,
    ) -> (StreamHandle, JoinHandle<()>) {
        let mut reporter = None;
        let task = stream.start(|handle| {
            reporter = Some(handle.clone());
            async move {
                handle.running();
                handle.cancelled().await;
                result
            }
        });
        (reporter.expect("run is called on start"), task)
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle() {
        let stream = ManagedStream::new("test", GRACE);
        assert!(!stream.is_ready());

        let (_handle, task) = start(&stream, Ok(()));
        assert_eq!(stream.state(), StreamState::Starting);
        assert!(stream.is_healthy());

        tokio::task::yield_now().await;
        assert_eq!(stream.state(), StreamState::Running);
        assert!(stream.is_ready());

        stream.stop(false);
        assert_eq!(
            stream.state(),
            StreamState::Stopping {
                because_of_error: false
            }
        );
        assert!(!stream.is_ready());

        task.await.unwrap();
        assert_eq!(
            stream.state(),
            StreamState::Stopped {
                because_of_error: false
            }
        );
        assert!(stream.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn errored_within_grace_period_is_healthy() {
        let stream = ManagedStream::new("test", GRACE);
        let (handle, _task) = start(&stream, Ok(()));
        tokio::task::yield_now().await;

        handle.errored();
        assert!(stream.is_healthy());
        assert!(!stream.is_ready());

        tokio::time::advance(Duration::from_secs(30)).await;
        handle.errored();
        assert!(stream.is_healthy());

        // The streak started 30s ago
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!stream.is_healthy());

        handle.running();
        assert!(stream.is_healthy());
        assert!(stream.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_loop_stops_unhealthy() {
        let stream = ManagedStream::new("test", GRACE);
        let error = StreamError::OffsetError(common_kafka::kafka_consumer::OffsetErr::Gone);
        let (_handle, task) = start(&stream, Err(error));

        stream.stop(false);
        task.await.unwrap();

        assert_eq!(
            stream.state(),
            StreamState::Stopped {
                because_of_error: true
            }
        );
        assert!(!stream.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_because_of_error_is_unhealthy() {
        let stream = ManagedStream::new("test", GRACE);
        let (_handle, task) = start(&stream, Ok(()));
        tokio::task::yield_now().await;

        stream.stop(true);
        assert!(!stream.is_healthy());
        task.await.unwrap();

        assert_eq!(
            stream.state(),
            StreamState::Stopped {
                because_of_error: true
            }
        );
        let check = stream.check().await;
        assert!(!check.is_healthy());
        assert_eq!(
            check.details().get("test").unwrap(),
            "stopped because of an error"
        );
    }
}

//! Generic "wait until a provider resource reaches a state" primitive.
//!
//! [`poll`] spawns one task per wait. The task sleeps the initial wait,
//! then issues one describe per tick and pushes a [`StatusEvent`] into a
//! bounded channel. The stream closes after the first terminal event:
//!
//! - the desired state was observed (success)
//! - a failure state was observed, or a non-retryable error occurred
//! - the phase deadline expired
//! - the stop signal fired (unless `ignore_stop` is set)
//!
//! Transient provider errors never close the stream; they surface as an
//! event carrying the last known state. A missing resource maps to
//! [`STATUS_DELETED_OR_NOT_EXIST`], which is success when it is the desired
//! state and a failure otherwise.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::abort::{abortable_sleep, abortable_wait, StopSignal};
use crate::config::STATUS_DELETED_OR_NOT_EXIST;
use crate::provider::{
    ClusterDescription, NodegroupDescription, ProviderError, ProviderErrorKind, ProviderResult,
    StackDescription, UpdateDescription,
};
use crate::{Error, Result};

/// Buffered events per poll before the task waits on the consumer
pub const EVENT_BUFFER: usize = 10;

/// Default failure state
pub const STATE_FAILED: &str = "FAILED";

/// A provider resource that reports a status string
pub trait HasStatus {
    /// Current status as reported by the provider
    fn status(&self) -> &str;
}

impl HasStatus for StackDescription {
    fn status(&self) -> &str {
        &self.status
    }
}

impl HasStatus for ClusterDescription {
    fn status(&self) -> &str {
        &self.status
    }
}

impl HasStatus for NodegroupDescription {
    fn status(&self) -> &str {
        &self.status
    }
}

impl HasStatus for UpdateDescription {
    fn status(&self) -> &str {
        &self.status
    }
}

/// What to wait for and how long
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollSpec {
    /// Human-readable subject, used in logs and errors
    pub what: String,
    /// State that ends the wait successfully
    pub desired: String,
    /// States that end the wait with an error
    pub failure_states: Vec<String>,
    /// Delay before the first describe
    pub initial_wait: Duration,
    /// Delay between describes
    pub interval: Duration,
    /// Phase deadline, measured from the start of the wait
    pub timeout: Duration,
    /// Keep polling through an operator stop (teardown)
    pub ignore_stop: bool,
}

impl PollSpec {
    /// Wait for `what` to reach `desired` with default timing
    pub fn new(what: impl Into<String>, desired: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            desired: desired.into(),
            failure_states: vec![STATE_FAILED.to_string()],
            initial_wait: Duration::ZERO,
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30 * 60),
            ignore_stop: false,
        }
    }

    /// Replace the failure states
    pub fn failure_states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Delay before the first describe
    pub fn initial_wait(mut self, d: Duration) -> Self {
        self.initial_wait = d;
        self
    }

    /// Delay between describes
    pub fn interval(mut self, d: Duration) -> Self {
        self.interval = d;
        self
    }

    /// Phase deadline
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = d;
        self
    }

    /// Ignore the operator stop signal
    pub fn ignore_stop(mut self, ignore: bool) -> Self {
        self.ignore_stop = ignore;
        self
    }

    fn is_failure(&self, state: &str) -> bool {
        self.failure_states.iter().any(|s| s == state)
    }
}

/// One observation made by the poller
pub struct StatusEvent<T> {
    /// Observed state (the last known one for transient errors)
    pub state: String,
    /// Describe result, absent when the resource does not exist
    pub resource: Option<T>,
    /// Set on the terminal event of a failed wait
    pub error: Option<Error>,
}

impl<T> fmt::Debug for StatusEvent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusEvent")
            .field("state", &self.state)
            .field("has_resource", &self.resource.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Terminal success of a wait
#[derive(Clone, Debug, PartialEq)]
pub struct Reached<T> {
    /// The desired state
    pub state: String,
    /// Last describe result
    pub resource: Option<T>,
}

/// Events of one wait. Dropping the stream stops the polling task.
pub struct PollStream<T> {
    rx: mpsc::Receiver<StatusEvent<T>>,
    handle: JoinHandle<()>,
    desired: String,
    what: String,
}

impl<T> Stream for PollStream<T> {
    type Item = StatusEvent<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for PollStream<T> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start polling. `describe` is called once per tick.
pub fn poll<T, F, Fut>(spec: PollSpec, stop: &StopSignal, describe: F) -> PollStream<T>
where
    T: HasStatus + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ProviderResult<T>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let stop = stop.ignoring(spec.ignore_stop);
    let desired = spec.desired.clone();
    let what = spec.what.clone();
    let handle = tokio::spawn(run(spec, stop, describe, tx));
    PollStream {
        rx,
        handle,
        desired,
        what,
    }
}

async fn run<T, F, Fut>(
    spec: PollSpec,
    stop: StopSignal,
    mut describe: F,
    tx: mpsc::Sender<StatusEvent<T>>,
) where
    T: HasStatus + Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ProviderResult<T>> + Send + 'static,
{
    let started = Instant::now();
    let fail = |state: &str, error: Error| StatusEvent {
        state: state.to_string(),
        resource: None,
        error: Some(error),
    };

    if !spec.initial_wait.is_zero() {
        info!(what = %spec.what, wait_secs = spec.initial_wait.as_secs(), "initial wait before polling");
        if let Err(e) = abortable_sleep(&stop, spec.initial_wait, &spec.what).await {
            let _ = tx.send(fail("", e)).await;
            return;
        }
    }

    let mut last_state = String::new();
    loop {
        let outcome = match abortable_wait(&stop, &spec.what, describe()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tx.send(fail(&last_state, e)).await;
                return;
            }
        };

        let (event, done) = match outcome {
            Ok(resource) => {
                let state = resource.status().to_string();
                last_state = state.clone();
                if state == spec.desired {
                    info!(what = %spec.what, state = %state, "reached desired state");
                    let ev = StatusEvent {
                        state,
                        resource: Some(resource),
                        error: None,
                    };
                    (ev, true)
                } else if spec.is_failure(&state) {
                    warn!(what = %spec.what, state = %state, "reached failure state");
                    let error = Error::Provider(ProviderError::new(
                        "poller",
                        spec.what.clone(),
                        ProviderErrorKind::Other,
                        format!("{} reached {state}, expected {}", spec.what, spec.desired),
                    ));
                    let ev = StatusEvent {
                        state,
                        resource: Some(resource),
                        error: Some(error),
                    };
                    (ev, true)
                } else {
                    debug!(what = %spec.what, state = %state, "polled");
                    let ev = StatusEvent {
                        state,
                        resource: Some(resource),
                        error: None,
                    };
                    (ev, false)
                }
            }
            Err(e) if e.is_not_found() => {
                last_state = STATUS_DELETED_OR_NOT_EXIST.to_string();
                if spec.desired == STATUS_DELETED_OR_NOT_EXIST {
                    info!(what = %spec.what, "resource no longer exists");
                    let ev = StatusEvent {
                        state: last_state.clone(),
                        resource: None,
                        error: None,
                    };
                    (ev, true)
                } else {
                    warn!(what = %spec.what, error = %e, "resource does not exist");
                    (fail(&last_state, e.into()), true)
                }
            }
            Err(e) if e.is_transient() => {
                warn!(what = %spec.what, error = %e, "transient describe failure");
                let ev = StatusEvent {
                    state: last_state.clone(),
                    resource: None,
                    error: None,
                };
                (ev, false)
            }
            Err(e) => {
                warn!(what = %spec.what, error = %e, "describe failed");
                (fail(&last_state, e.into()), true)
            }
        };

        if tx.send(event).await.is_err() || done {
            return;
        }

        let elapsed = started.elapsed();
        if elapsed >= spec.timeout {
            let msg = format!(
                "{} did not reach {} within {}s (last state {:?})",
                spec.what,
                spec.desired,
                spec.timeout.as_secs(),
                last_state
            );
            let _ = tx.send(fail(&last_state, Error::timeout(msg))).await;
            return;
        }
        let nap = spec.interval.min(spec.timeout - elapsed);
        if let Err(e) = abortable_sleep(&stop, nap, &spec.what).await {
            let _ = tx.send(fail(&last_state, e)).await;
            return;
        }
    }
}

/// Drain `stream`, calling `on_event` for every event, and return the
/// terminal outcome.
pub async fn wait_for_with<T>(
    mut stream: PollStream<T>,
    mut on_event: impl FnMut(&StatusEvent<T>),
) -> Result<Reached<T>> {
    let mut last: Option<StatusEvent<T>> = None;
    while let Some(ev) = stream.next().await {
        on_event(&ev);
        let terminal = ev.error.is_some() || ev.state == stream.desired;
        last = Some(ev);
        if terminal {
            break;
        }
    }

    match last {
        Some(StatusEvent {
            error: Some(e), ..
        }) => Err(e),
        Some(StatusEvent {
            state, resource, ..
        }) if state == stream.desired => Ok(Reached { state, resource }),
        _ => Err(Error::aborted(format!(
            "{}: poller stopped before a terminal state",
            stream.what
        ))),
    }
}

/// Drain `stream` and return the terminal outcome.
pub async fn wait_for<T>(stream: PollStream<T>) -> Result<Reached<T>> {
    wait_for_with(stream, |_| {}).await
}

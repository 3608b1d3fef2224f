//! Cooperative cancellation for long-running waits.
//!
//! Every suspension point (poll tick, fixed sleep, SSH session, URL probe)
//! goes through [`abortable_sleep`] or [`abortable_wait`], so a single
//! [`StopSignal`] reaches all of them. The first OS signal is converted into
//! a stop by [`spawn_signal_listener`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Error, Result};

/// Operator stop channel shared by every phase of `Up`.
#[derive(Clone, Debug)]
pub struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<String>>>,
    ignored: bool,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl StopSignal {
    /// Fresh, not yet stopped signal
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
            ignored: false,
        }
    }

    /// A signal that never fires. Teardown uses this so an interrupt cannot
    /// leave a half-deleted stack behind.
    pub fn never() -> Self {
        Self {
            ignored: true,
            ..Self::new()
        }
    }

    /// View of this signal that ignores stops when `ignore` is set
    pub fn ignoring(&self, ignore: bool) -> Self {
        if ignore {
            Self::never()
        } else {
            self.clone()
        }
    }

    /// Close the stop channel. Only the first reason is kept.
    pub fn stop(&self, reason: impl Into<String>) {
        if self.ignored {
            return;
        }
        {
            let mut guard = self.reason.lock();
            if guard.is_none() {
                *guard = Some(reason.into());
            }
        }
        self.token.cancel();
    }

    /// True once [`StopSignal::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        !self.ignored && self.token.is_cancelled()
    }

    /// Why the signal fired, if it has
    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Resolves when the signal fires; pending forever for `never()`
    pub async fn stopped(&self) {
        if self.ignored {
            std::future::pending::<()>().await;
        }
        self.token.cancelled().await;
    }

    fn aborted(&self, what: &str) -> Error {
        let reason = self.reason().unwrap_or_else(|| "stop requested".to_string());
        Error::aborted(format!("{what}: {reason}"))
    }
}

/// Sleep for `dur` unless the stop signal fires first.
pub async fn abortable_sleep(stop: &StopSignal, dur: Duration, what: &str) -> Result<()> {
    if stop.is_stopped() {
        return Err(stop.aborted(what));
    }
    tokio::select! {
        biased;
        _ = stop.stopped() => Err(stop.aborted(what)),
        _ = tokio::time::sleep(dur) => Ok(()),
    }
}

/// Await `fut` unless the stop signal fires first. On abort the future is
/// dropped, so nothing is left waiting on its completion.
pub async fn abortable_wait<F>(stop: &StopSignal, what: &str, fut: F) -> Result<F::Output>
where
    F: Future,
{
    if stop.is_stopped() {
        return Err(stop.aborted(what));
    }
    tokio::select! {
        biased;
        _ = stop.stopped() => Err(stop.aborted(what)),
        out = fut => Ok(out),
    }
}

/// Convert the first SIGINT/SIGTERM into a stop.
pub fn spawn_signal_listener(stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = wait_for_os_signal().await;
        warn!(signal = %name, "received OS signal, stopping");
        stop.stop(format!("received signal {name}"));
    })
}

#[cfg(unix)]
async fn wait_for_os_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = term.recv() => "SIGTERM",
        },
        Err(e) => {
            warn!(error = %e, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

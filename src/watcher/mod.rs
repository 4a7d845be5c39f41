// src/watcher/mod.rs
// Per-dependency health state machine with backoff and edge callbacks
// (spec §4.9, C10). The worker loop structure (spawned task, select! over
// a cancellation signal and the next timer tick) is grounded on the
// teacher's watcher/mod.rs WatcherService; the state machine itself has no
// teacher analogue and is carried by watcher/state.rs::apply_probe_result.

pub mod manager;
pub mod state;

use crate::config::WatcherConfig;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use state::{apply_probe_result, Transition};
pub use state::{Phase, Status};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use manager::WatcherManager;

/// Probes an external dependency for health (spec §6 `HealthProbe`).
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> anyhow::Result<()>;
}

/// Fires on edge transitions into ready / into down. Runs on a fresh task
/// so a slow or panicking callback cannot stall the state machine
/// (spec §4.9 policy).
pub trait WatcherCallbacks: Send + Sync + 'static {
    fn on_ready(&self) {}
    fn on_down(&self, _err: &str) {}
}

impl WatcherCallbacks for () {}

struct Shared {
    ready: AtomicBool,
    status: Mutex<Status>,
}

/// A running watcher worker plus its thread-safe observers.
pub struct Watcher {
    name: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Watcher {
    /// Starts a concurrent worker. Rejects an empty name as a programming
    /// error (spec §4.9 validation) — the probe argument can never be
    /// "missing" in Rust's type system, so only the name is checked here.
    pub fn watch<P, C>(name: impl Into<String>, probe: P, config: WatcherConfig, callbacks: C) -> Arc<Self>
    where
        P: HealthProbe + 'static,
        C: WatcherCallbacks,
    {
        let name = name.into();
        assert!(!name.is_empty(), "watcher name must not be empty");

        let shared = Arc::new(Shared {
            ready: AtomicBool::new(false),
            status: Mutex::new(Status::initial()),
        });
        let cancel = CancellationToken::new();

        let watcher = Arc::new(Self {
            name: name.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
            handle: Mutex::new(None),
        });

        let probe = Arc::new(probe);
        let callbacks = Arc::new(callbacks);
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(run_worker(name, shared, worker_cancel, probe, config, callbacks));
        *watcher.handle.lock() = Some(handle);

        watcher
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.status.lock().last_error.clone()
    }

    pub fn status(&self) -> Status {
        self.shared.status.lock().clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signals the worker to stop; does not block. Use `wait` to join.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Blocks until the worker has exited.
    pub async fn wait(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_worker<C: WatcherCallbacks>(
    name: String,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    probe: Arc<dyn HealthProbe>,
    config: WatcherConfig,
    callbacks: Arc<C>,
) {
    let mut delay = Duration::from_millis(config.initial_delay_ms);
    let max_delay = Duration::from_millis(config.max_delay_ms);
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let probe_timeout = Duration::from_millis(config.probe_timeout_ms);

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let phase = shared.status.lock().phase;
        let attempt = shared.status.lock().attempt;

        let probe_result = tokio::select! {
            _ = cancel.cancelled() => break,
            res = tokio::time::timeout(probe_timeout, probe.probe()) => res,
        };
        let ok = matches!(probe_result, Ok(Ok(())));
        let err_text = match &probe_result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("probe timed out after {probe_timeout:?}")),
        };

        let transition = apply_probe_result(phase, attempt, config.max_startup_attempts, ok);

        {
            let mut status = shared.status.lock();
            status.last_check = Some(Utc::now());
            status.last_error = err_text.clone();
        }

        match transition {
            Transition::StayStartup => {
                {
                    let mut status = shared.status.lock();
                    status.attempt += 1;
                }
                debug!(watcher = %name, attempt, "startup probe failed, backing off");

                if sleep_or_cancel(delay, &cancel).await.is_cancelled() {
                    break;
                }
                delay = std::cmp::min(
                    Duration::from_secs_f64(delay.as_secs_f64() * config.multiplier),
                    max_delay,
                );
                continue;
            }
            Transition::EnterSteadyDownFromStartup => {
                let mut status = shared.status.lock();
                status.phase = Phase::SteadyDown;
                status.attempt = 0;
                shared.ready.store(false, Ordering::Release);
                warn!(watcher = %name, "startup attempts exhausted, entering steady polling down");
            }
            Transition::EnterReady { emit_on_ready } => {
                let mut status = shared.status.lock();
                status.phase = Phase::SteadyReady;
                status.attempt = 0;
                drop(status);
                shared.ready.store(true, Ordering::Release);
                if emit_on_ready {
                    let callbacks = callbacks.clone();
                    let name = name.clone();
                    tokio::spawn(async move {
                        info!(watcher = %name, "watcher ready");
                        callbacks.on_ready();
                    });
                }
            }
            Transition::EnterDown { emit_on_down } => {
                let mut status = shared.status.lock();
                status.phase = Phase::SteadyDown;
                drop(status);
                shared.ready.store(false, Ordering::Release);
                if emit_on_down {
                    let callbacks = callbacks.clone();
                    let name = name.clone();
                    let err = err_text.clone().unwrap_or_default();
                    tokio::spawn(async move {
                        warn!(watcher = %name, error = %err, "watcher down");
                        callbacks.on_down(&err);
                    });
                }
            }
        }

        if sleep_or_cancel(poll_interval, &cancel).await.is_cancelled() {
            break;
        }
    }

    debug!(watcher = %name, "watcher worker terminated");
}

enum SleepOutcome {
    Elapsed,
    Cancelled,
}

impl SleepOutcome {
    fn is_cancelled(&self) -> bool {
        matches!(self, SleepOutcome::Cancelled)
    }
}

async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> SleepOutcome {
    tokio::select! {
        _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
        _ = cancel.cancelled() => SleepOutcome::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyProbe {
        fails_remaining: AtomicU32,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self) -> anyhow::Result<()> {
            let remaining = self.fails_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fails_remaining.store(remaining - 1, Ordering::SeqCst);
                anyhow::bail!("not ready yet");
            }
            Ok(())
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_startup_attempts: 2,
            poll_interval_ms: 10,
            probe_timeout_ms: 500,
        }
    }

    #[tokio::test]
    async fn recovers_after_startup_failures() {
        let probe = FlakyProbe { fails_remaining: AtomicU32::new(2) };
        let watcher = Watcher::watch("dep", probe, fast_config(), ());

        let mut ready = false;
        for _ in 0..50 {
            if watcher.is_ready() {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(ready);
        watcher.stop();
        watcher.wait().await;
    }

    #[tokio::test]
    async fn stop_terminates_worker() {
        struct AlwaysOk;
        #[async_trait]
        impl HealthProbe for AlwaysOk {
            async fn probe(&self) -> anyhow::Result<()> {
                Ok(())
            }
        }
        let watcher = Watcher::watch("dep", AlwaysOk, fast_config(), ());
        tokio::time::sleep(Duration::from_millis(20)).await;
        watcher.stop();
        watcher.wait().await;
    }
}

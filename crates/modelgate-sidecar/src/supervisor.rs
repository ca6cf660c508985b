//! Sidecar process supervisor.
//!
//! Owns the child's entire lifecycle: spawn with the generated config,
//! poll health until ready, stop gracefully, restart on config changes,
//! and recover from crashes. Only this type ever touches the child
//! handle.
//!
//! Lifecycle operations (`start`/`stop`/`restart`/`reload`) are
//! serialized by an internal mutex, so two concurrent provider edits
//! produce one reload per resulting state, not two interleaved ones. A
//! background watcher observes unexpected exits: the first crash triggers
//! one automatic restart after a jittered delay; a second crash within a
//! short window disables auto-restart until an admin starts the proxy
//! again.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::config_gen;
use crate::error::SidecarError;

/// How often the crash watcher polls the child.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

/// Base delay before an automatic restart; up to one extra second of
/// jitter is added so repeated crashes don't beat a fixed rhythm.
const RESTART_DELAY_BASE: Duration = Duration::from_millis(500);

/// Paths, port, and timing knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the sidecar executable.
    pub binary: PathBuf,
    /// Where the generated YAML lives.
    pub config_path: PathBuf,
    /// The sidecar's own state directory (placement is ours, contents are
    /// not interpreted).
    pub state_dir: PathBuf,
    /// Loopback port for the management endpoint.
    pub port: u16,
    /// Per-probe health timeout.
    pub probe_timeout: Duration,
    /// Total budget for the child to become healthy after spawn.
    pub health_budget: Duration,
    /// Grace period between SIGTERM and SIGKILL.
    pub stop_grace: Duration,
    /// Two crashes inside this window disable auto-restart.
    pub crash_window: Duration,
}

impl SupervisorConfig {
    /// Config with production timing defaults.
    #[must_use]
    pub fn new(binary: PathBuf, config_path: PathBuf, state_dir: PathBuf, port: u16) -> Self {
        Self {
            binary,
            config_path,
            state_dir,
            port,
            probe_timeout: Duration::from_secs(5),
            health_budget: Duration::from_secs(30),
            stop_grace: Duration::from_secs(5),
            crash_window: Duration::from_secs(10),
        }
    }
}

/// Snapshot returned by [`Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatus {
    pub running: bool,
    pub port: u16,
    pub pid: Option<u32>,
    pub endpoint: String,
    pub uptime_secs: Option<u64>,
    pub last_crash: Option<DateTime<Utc>>,
    pub auto_restart_disabled: bool,
}

/// Outcome of [`Supervisor::reload`].
#[derive(Debug, Clone, Copy)]
pub struct ReloadOutcome {
    /// Whether the projected config differed and a restart happened.
    pub changed: bool,
}

#[derive(Default)]
struct Inner {
    child: Option<Child>,
    started_at: Option<Instant>,
    /// Set once the child answered health; an exit before that is a
    /// startup failure handled by `start`, not a crash.
    ready: bool,
    last_crash: Option<DateTime<Utc>>,
    last_crash_at: Option<Instant>,
    auto_restart_disabled: bool,
}

/// Supervises the sidecar child process. Construct with
/// [`Supervisor::spawn`], which also starts the crash watcher.
pub struct Supervisor {
    cfg: SupervisorConfig,
    http: reqwest::Client,
    /// Serializes start/stop/restart/reload.
    lifecycle: Mutex<()>,
    /// Guards the child handle and crash bookkeeping; held briefly.
    inner: Mutex<Inner>,
    shutdown: watch::Sender<bool>,
}

impl Supervisor {
    /// Build a supervisor and start its crash watcher.
    #[must_use]
    pub fn spawn(cfg: SupervisorConfig) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.probe_timeout)
            .build()
            .unwrap_or_default();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let supervisor = Arc::new(Self {
            cfg,
            http,
            lifecycle: Mutex::new(()),
            inner: Mutex::new(Inner::default()),
            shutdown,
        });

        tokio::spawn(crash_watcher(Arc::downgrade(&supervisor), shutdown_rx));
        supervisor
    }

    /// The loopback endpoint the gateway forwards to.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.cfg.port)
    }

    /// The configured management port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    /// Start the sidecar with the given config bytes.
    ///
    /// Idempotent: when a live child already answers health, this is a
    /// no-op. An explicit start also clears the crash lockout.
    ///
    /// # Errors
    ///
    /// Returns [`SidecarError::Spawn`] when the binary cannot be launched
    /// and [`SidecarError::Unhealthy`] when it never answers health; in
    /// both cases the state stays not-running.
    pub async fn start(&self, yaml: &[u8]) -> Result<(), SidecarError> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut inner = self.inner.lock().await;
            inner.auto_restart_disabled = false;
            if child_is_alive(&mut inner) && self.probe_health().await {
                debug!("sidecar already healthy, start is a no-op");
                return Ok(());
            }
        }

        config_gen::write_atomic(&self.cfg.config_path, yaml)?;
        self.start_from_disk().await
    }

    /// Stop the sidecar: graceful signal, grace period, then kill.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_child().await;
    }

    /// Stop then start, preserving the configured port and the config on
    /// disk.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Supervisor::start`].
    pub async fn restart(&self) -> Result<(), SidecarError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_child().await;
        self.start_from_disk().await
    }

    /// Apply new config bytes: write and restart only when they differ
    /// from what is on disk.
    ///
    /// When the proxy is not running, the config is written but nothing
    /// is started — the next start picks it up.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Supervisor::start`].
    pub async fn reload(&self, yaml: &[u8]) -> Result<ReloadOutcome, SidecarError> {
        let _lifecycle = self.lifecycle.lock().await;

        if !config_gen::differs_from_disk(&self.cfg.config_path, yaml) {
            debug!("sidecar config unchanged, reload skipped");
            return Ok(ReloadOutcome { changed: false });
        }

        config_gen::write_atomic(&self.cfg.config_path, yaml)?;

        let running = child_is_alive(&mut *self.inner.lock().await);
        if running {
            info!("sidecar config changed, restarting");
            self.stop_child().await;
            self.start_from_disk().await?;
        } else {
            info!("sidecar config changed while stopped, written for next start");
        }

        Ok(ReloadOutcome { changed: true })
    }

    /// Current lifecycle snapshot.
    pub async fn status(&self) -> ProxyStatus {
        let mut inner = self.inner.lock().await;
        let running = child_is_alive(&mut inner);
        ProxyStatus {
            running,
            port: self.cfg.port,
            pid: inner.child.as_ref().and_then(Child::id),
            endpoint: self.endpoint(),
            uptime_secs: if running {
                inner.started_at.map(|t| t.elapsed().as_secs())
            } else {
                None
            },
            last_crash: inner.last_crash,
            auto_restart_disabled: inner.auto_restart_disabled,
        }
    }

    /// Probe the management health endpoint once.
    pub async fn probe_health(&self) -> bool {
        let url = format!("{}/health", self.endpoint());
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    /// Stop the watcher and the child (process shutdown path).
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_child().await;
    }

    /// Spawn from the config already on disk and wait for health.
    async fn start_from_disk(&self) -> Result<(), SidecarError> {
        let mut command = Command::new(&self.cfg.binary);
        command
            .arg("--config")
            .arg(&self.cfg.config_path)
            .arg("--listen")
            .arg(format!("127.0.0.1:{}", self.cfg.port))
            .arg("--state-dir")
            .arg(&self.cfg.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| SidecarError::Spawn {
            reason: format!("{}: {e}", self.cfg.binary.display()),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "modelgate::sidecar", "{line}");
                }
            });
        }

        let pid = child.id();
        {
            let mut inner = self.inner.lock().await;
            inner.child = Some(child);
            inner.started_at = Some(Instant::now());
            inner.ready = false;
        }

        match self.wait_healthy().await {
            Ok(()) => {
                self.inner.lock().await.ready = true;
                info!(port = self.cfg.port, pid, "sidecar started");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sidecar failed to become healthy, stopping it");
                self.stop_child().await;
                Err(err)
            }
        }
    }

    /// Poll health with exponential backoff until ready or the budget is
    /// spent.
    async fn wait_healthy(&self) -> Result<(), SidecarError> {
        let deadline = Instant::now() + self.cfg.health_budget;
        let mut backoff = Duration::from_millis(250);

        loop {
            if self.probe_health().await {
                return Ok(());
            }
            if Instant::now() + backoff >= deadline {
                return Err(SidecarError::Unhealthy {
                    budget_secs: self.cfg.health_budget.as_secs(),
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(4));
        }
    }

    /// Take the child out of the shared state and bring it down.
    ///
    /// Removing the handle first means the watcher never mistakes this
    /// exit for a crash.
    async fn stop_child(&self) {
        let child = {
            let mut inner = self.inner.lock().await;
            inner.started_at = None;
            inner.ready = false;
            inner.child.take()
        };

        let Some(mut child) = child else {
            return;
        };

        if let Some(pid) = child.id() {
            terminate_gracefully(pid);
        }

        match tokio::time::timeout(self.cfg.stop_grace, child.wait()).await {
            Ok(_) => info!("sidecar stopped"),
            Err(_) => {
                warn!(
                    grace_secs = self.cfg.stop_grace.as_secs(),
                    "sidecar ignored termination signal, killing"
                );
                let _ = child.kill().await;
            }
        }
    }

    /// Crash bookkeeping + single auto-restart. Called by the watcher
    /// when the child exited without a `stop`.
    async fn handle_crash(&self, exit: std::process::ExitStatus) {
        let restart = {
            let mut inner = self.inner.lock().await;
            inner.child = None;
            inner.started_at = None;
            inner.ready = false;
            inner.last_crash = Some(Utc::now());

            let repeat = inner
                .last_crash_at
                .is_some_and(|prev| prev.elapsed() < self.cfg.crash_window);
            inner.last_crash_at = Some(Instant::now());

            if inner.auto_restart_disabled {
                false
            } else if repeat {
                error!(
                    window_secs = self.cfg.crash_window.as_secs(),
                    "sidecar crashed twice in quick succession, auto-restart disabled until manual start"
                );
                inner.auto_restart_disabled = true;
                false
            } else {
                true
            }
        };

        warn!(exit = %exit, restart, "sidecar exited unexpectedly");

        if !restart {
            return;
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        tokio::time::sleep(RESTART_DELAY_BASE + jitter).await;

        let _lifecycle = self.lifecycle.lock().await;
        {
            let mut inner = self.inner.lock().await;
            // An admin may have started or locked it out during the delay.
            if child_is_alive(&mut inner) || inner.auto_restart_disabled {
                return;
            }
        }
        if let Err(err) = self.start_from_disk().await {
            error!(error = %err, "automatic sidecar restart failed");
        } else {
            info!("sidecar restarted automatically after crash");
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("binary", &self.cfg.binary)
            .field("port", &self.cfg.port)
            .finish_non_exhaustive()
    }
}

/// Whether the handle holds a process that has not exited.
fn child_is_alive(inner: &mut Inner) -> bool {
    match inner.child.as_mut() {
        Some(child) => matches!(child.try_wait(), Ok(None)),
        None => false,
    }
}

/// Background task observing unexpected child exits.
async fn crash_watcher(supervisor: Weak<Supervisor>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(WATCH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(supervisor) = supervisor.upgrade() else {
                    return;
                };
                let exited = {
                    let mut inner = supervisor.inner.lock().await;
                    if !inner.ready {
                        continue;
                    }
                    match inner.child.as_mut().map(Child::try_wait) {
                        Some(Ok(Some(status))) => Some(status),
                        _ => None,
                    }
                };
                if let Some(status) = exited {
                    supervisor.handle_crash(status).await;
                }
            }
            _ = shutdown.changed() => {
                return;
            }
        }
    }
}

/// Ask the child to exit. SIGTERM on unix; elsewhere the grace-period
/// kill in `stop_child` is the only mechanism.
#[cfg(unix)]
fn terminate_gracefully(pid: u32) {
    // SAFETY: `kill` is a POSIX syscall delivering a signal to a process
    // we spawned and still hold a handle to. Sending SIGTERM has no
    // memory safety implications; a stale PID at worst returns ESRCH.
    #[allow(unsafe_code)]
    let result = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
    if result != 0 {
        debug!(pid, "SIGTERM delivery failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn terminate_gracefully(_pid: u32) {}

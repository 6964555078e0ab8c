//! Startup connectivity probe
//!
//! Runs once in the background when the process starts: a handful of
//! handshake queries with exponential backoff. Running out of attempts is
//! logged and reported, never fatal; the server keeps serving and the
//! executor deals with per-request failures.
//!
//! ```text
//! Idle -> Attempting(1) -> Connected
//!                       -> Attempting(2) -> ... -> ExhaustedWarned
//! ```

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::DbError;
use crate::pool::Pool;

const HANDSHAKE_SQL: &str = "SELECT NOW() AS now";

/// Attempt bound and backoff base
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    pub attempts: u32,
    /// Failure `i` (0-based) waits `base_delay * 2^i`
    pub base_delay: Duration,
    /// Which database profile is being probed, for the connected log line
    pub profile: &'static str,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
            profile: "database",
        }
    }
}

impl ProbeConfig {
    pub fn with_profile(mut self, profile: &'static str) -> Self {
        self.profile = profile;
        self
    }

    pub fn backoff(&self, failed: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(failed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    /// Running handshake number `n` (1-based)
    Attempting(u32),
    Connected,
    ExhaustedWarned,
}

impl ProbeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Attempting(_) => "probing",
            Self::Connected => "connected",
            Self::ExhaustedWarned => "unavailable",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::ExhaustedWarned)
    }
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Connected {
        attempts: u32,
        server_time: Option<String>,
    },
    Exhausted {
        attempts: u32,
        last_error: DbError,
    },
}

impl ProbeOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Drives the probe state machine against a pool
pub struct StartupProber {
    pool: Pool,
    config: ProbeConfig,
    state: watch::Sender<ProbeState>,
}

impl StartupProber {
    pub fn new(pool: Pool, config: ProbeConfig) -> Self {
        let (state, _) = watch::channel(ProbeState::Idle);
        Self {
            pool,
            config,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProbeState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> ProbeState {
        *self.state.borrow()
    }

    /// Run the probe to completion.
    pub async fn run(self) -> ProbeOutcome {
        let attempts = self.config.attempts.max(1);
        let mut last_error = DbError::fatal("probe did not run");

        for attempt in 1..=attempts {
            self.state.send_replace(ProbeState::Attempting(attempt));

            match self.pool.execute(HANDSHAKE_SQL, &[]).await {
                Ok(rows) => {
                    let server_time = rows
                        .first()
                        .and_then(|row| row.get("now"))
                        .and_then(|v| v.as_str())
                        .map(str::to_owned);
                    self.state.send_replace(ProbeState::Connected);
                    info!(
                        attempt,
                        profile = self.config.profile,
                        server_time = ?server_time,
                        "connected to database"
                    );
                    return ProbeOutcome::Connected {
                        attempts: attempt,
                        server_time,
                    };
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "database connection attempt failed");
                    last_error = err;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.backoff(attempt - 1)).await;
            }
        }

        self.state.send_replace(ProbeState::ExhaustedWarned);
        error!(
            attempts,
            error = %last_error,
            "all database connection attempts failed; continuing without a verified database"
        );
        ProbeOutcome::Exhausted {
            attempts,
            last_error,
        }
    }
}

/// Background probe started by the entry point
pub struct ProbeHandle {
    task: JoinHandle<ProbeOutcome>,
    state: watch::Receiver<ProbeState>,
}

impl ProbeHandle {
    /// Live view of the probe state
    pub fn state(&self) -> watch::Receiver<ProbeState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the probe; `None` if the task was aborted or panicked.
    pub async fn wait(self) -> Option<ProbeOutcome> {
        self.task.await.ok()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Spawn the probe; returns immediately.
pub fn spawn_startup_probe(pool: Pool, config: ProbeConfig) -> ProbeHandle {
    let prober = StartupProber::new(pool, config);
    let state = prober.subscribe();
    let task = tokio::spawn(prober.run());
    ProbeHandle { task, state }
}

//! Remote maintenance session state machine.
//!
//! One session at a time per device: `Idle -> Active -> (Expiring) ->
//! Closed`, after which the device is idle again. The single current
//! session is owned by an actor task and mutated only through the
//! [`SessionManager`] handle, so concurrent start attempts serialize and
//! the one-active-session invariant holds by construction.
//!
//! Opening a session acquires the camera, resumes the detection pipeline
//! lane and mirrors `maintenance` status to the platform; closing reverses
//! all three. Expiry is timer-driven, with a best-effort operator warning
//! at `expires_at - warn_window`.

use crate::config::SessionConfig;
use argus_platform::client::DeviceStatus;
use argus_platform::status_sync::PlatformStatusSync;
use argus_vision::camera::{Camera, CameraError};
use argus_vision::pipeline::DetectionPipeline;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A session is already active or expiring on this device.
    #[error("a maintenance session is already active")]
    Conflict,

    /// Camera acquisition failed; the session stays idle.
    #[error("camera unavailable: {0}")]
    Hardware(#[from] CameraError),

    #[error("internal session error: {0}")]
    Internal(String),

    #[error("session manager unavailable")]
    Unavailable,
}

/// Lifecycle of a maintenance session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Expiring,
    Closed,
}

/// One remote maintenance session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub device_id: String,
    pub operator_id: String,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Best-effort notifications for the operator channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorNotice {
    ExpiryWarning {
        session_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    SessionClosed {
        session_id: Uuid,
        reason: String,
    },
}

/// Counters describing session activity.
#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub sessions_started: u64,
    pub sessions_closed: u64,
    pub sessions_expired: u64,
    pub start_conflicts: u64,
    pub hardware_failures: u64,
}

/// Point-in-time view of the session manager.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    /// `Idle` when no session is open.
    pub state: SessionState,
    pub session: Option<Session>,
    pub archived: usize,
    pub stats: SessionStats,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Warn,
    Expire,
}

enum Command {
    Start {
        operator_id: String,
        reply: oneshot::Sender<Result<Session, SessionError>>,
    },
    Stop {
        reply: oneshot::Sender<Option<Session>>,
    },
    Heartbeat {
        reply: oneshot::Sender<Option<DateTime<Utc>>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    TimerFired {
        epoch: u64,
        kind: TimerKind,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Session timing knobs in runtime form.
#[derive(Debug, Clone)]
pub struct SessionTimings {
    pub ttl: Duration,
    pub warn_window: Duration,
    pub heartbeat_extension: Duration,
    pub archive_capacity: usize,
}

impl From<&SessionConfig> for SessionTimings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            ttl: config.ttl(),
            warn_window: config.warn_window(),
            heartbeat_extension: config.heartbeat_extension(),
            archive_capacity: config.archive_capacity,
        }
    }
}

/// Handle to the session actor.
#[derive(Clone)]
pub struct SessionManager {
    tx: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Spawn the session actor. Returns the handle and the operator
    /// notice channel.
    pub fn spawn(
        config: SessionTimings,
        device_id: impl Into<String>,
        camera: Arc<Camera>,
        pipeline: Arc<DetectionPipeline>,
        sync: Arc<PlatformStatusSync>,
    ) -> (Self, watch::Receiver<Option<OperatorNotice>>) {
        let (tx, rx) = mpsc::channel(32);
        let (notice_tx, notice_rx) = watch::channel(None);

        let runner = SessionRunner {
            config,
            device_id: device_id.into(),
            camera,
            pipeline,
            sync,
            notifier: notice_tx,
            cmd_tx: tx.clone(),
            current: None,
            archived: VecDeque::new(),
            epoch: 0,
            stats: SessionStats::default(),
        };
        tokio::spawn(runner.run(rx));

        (Self { tx }, notice_rx)
    }

    /// Open a maintenance session for `operator_id`.
    pub async fn start(&self, operator_id: impl Into<String>) -> Result<Session, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Start {
                operator_id: operator_id.into(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)?
    }

    /// Close the current session. Idempotent: returns `None` when no
    /// session is open, which is not an error.
    pub async fn stop(&self) -> Result<Option<Session>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Stop { reply })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)
    }

    /// Extend the current session. Returns the new expiry, or `None`
    /// when no session is open (a no-op, not an error).
    pub async fn heartbeat(&self) -> Result<Option<DateTime<Utc>>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Heartbeat { reply })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| SessionError::Unavailable)?;
        rx.await.map_err(|_| SessionError::Unavailable)
    }

    /// Close any open session and terminate the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct ActiveSession {
    session: Session,
    epoch: u64,
}

struct SessionRunner {
    config: SessionTimings,
    device_id: String,
    camera: Arc<Camera>,
    pipeline: Arc<DetectionPipeline>,
    sync: Arc<PlatformStatusSync>,
    notifier: watch::Sender<Option<OperatorNotice>>,
    cmd_tx: mpsc::Sender<Command>,
    current: Option<ActiveSession>,
    archived: VecDeque<Session>,
    epoch: u64,
    stats: SessionStats,
}

impl SessionRunner {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Start { operator_id, reply } => {
                    let _ = reply.send(self.handle_start(operator_id).await);
                }
                Command::Stop { reply } => {
                    let closed = match self.current.take() {
                        Some(active) => Some(self.close_session(active, "operator stop").await),
                        None => None,
                    };
                    let _ = reply.send(closed);
                }
                Command::Heartbeat { reply } => {
                    let _ = reply.send(self.handle_heartbeat());
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.snapshot());
                }
                Command::TimerFired { epoch, kind } => {
                    self.handle_timer(epoch, kind).await;
                }
                Command::Shutdown { reply } => {
                    if let Some(active) = self.current.take() {
                        self.close_session(active, "agent shutdown").await;
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    async fn handle_start(&mut self, operator_id: String) -> Result<Session, SessionError> {
        if self.current.is_some() {
            self.stats.start_conflicts += 1;
            warn!(
                device_id = %self.device_id,
                operator_id = %operator_id,
                "Session start refused, another session is active"
            );
            return Err(SessionError::Conflict);
        }

        // Camera first: acquisition failure aborts the start with nothing
        // to roll back and no status pushed.
        let handle = match self.camera.acquire().await {
            Ok(handle) => handle,
            Err(e) => {
                self.stats.hardware_failures += 1;
                warn!(device_id = %self.device_id, error = %e, "Session start aborted, camera unavailable");
                return Err(SessionError::Hardware(e));
            }
        };

        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            device_id: self.device_id.clone(),
            operator_id,
            state: SessionState::Active,
            started_at: now,
            expires_at: now + chrono_duration(self.config.ttl),
            last_heartbeat: now,
        };

        if self.pipeline.is_lane_active().await {
            warn!("Pipeline lane unexpectedly active, closing it first");
            if let Some(stale) = self.pipeline.pause().await {
                stale.release().await;
            }
        }
        if let Err(e) = self.pipeline.resume(Some(session.id), handle).await {
            error!(error = %e, "Failed to resume detection pipeline");
            return Err(SessionError::Internal(e.to_string()));
        }

        self.sync.push_status(DeviceStatus::Maintenance);

        let deadline = Instant::now() + self.config.ttl;
        self.arm_timers(deadline);
        self.current = Some(ActiveSession {
            session: session.clone(),
            epoch: self.epoch,
        });
        self.stats.sessions_started += 1;
        metrics::counter!("session.started").increment(1);

        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            operator_id = %session.operator_id,
            expires_at = %session.expires_at,
            "Maintenance session opened"
        );
        Ok(session)
    }

    fn handle_heartbeat(&mut self) -> Option<DateTime<Utc>> {
        self.current.as_ref()?;

        let extension = self.config.heartbeat_extension;
        let now = Utc::now();
        let expires_at = now + chrono_duration(extension);
        let deadline = Instant::now() + extension;

        self.arm_timers(deadline);
        let epoch = self.epoch;
        if let Some(active) = &mut self.current {
            active.session.last_heartbeat = now;
            active.session.expires_at = expires_at;
            if active.session.state == SessionState::Expiring {
                active.session.state = SessionState::Active;
            }
            active.epoch = epoch;
            info!(session_id = %active.session.id, expires_at = %expires_at, "Session heartbeat");
        }
        Some(expires_at)
    }

    async fn handle_timer(&mut self, epoch: u64, kind: TimerKind) {
        let matches_current = self
            .current
            .as_ref()
            .map(|active| active.epoch == epoch)
            .unwrap_or(false);
        if !matches_current {
            return;
        }

        match kind {
            TimerKind::Warn => {
                if let Some(active) = &mut self.current {
                    if active.session.state == SessionState::Active {
                        active.session.state = SessionState::Expiring;
                        info!(
                            session_id = %active.session.id,
                            expires_at = %active.session.expires_at,
                            "Session expiring soon, operator warned"
                        );
                        self.notifier
                            .send_replace(Some(OperatorNotice::ExpiryWarning {
                                session_id: active.session.id,
                                expires_at: active.session.expires_at,
                            }));
                    }
                }
            }
            TimerKind::Expire => {
                if let Some(active) = self.current.take() {
                    self.stats.sessions_expired += 1;
                    self.close_session(active, "expired").await;
                }
            }
        }
    }

    /// Tear down a session: pause the pipeline, release the camera, push
    /// `active` status, archive. In-flight inference is left to drain.
    async fn close_session(&mut self, active: ActiveSession, reason: &str) -> Session {
        // Invalidate any armed timers for this session.
        self.epoch += 1;

        if let Some(handle) = self.pipeline.pause().await {
            handle.release().await;
        }
        self.sync.push_status(DeviceStatus::Active);

        let mut session = active.session;
        session.state = SessionState::Closed;

        self.notifier.send_replace(Some(OperatorNotice::SessionClosed {
            session_id: session.id,
            reason: reason.to_string(),
        }));

        self.archived.push_back(session.clone());
        while self.archived.len() > self.config.archive_capacity {
            self.archived.pop_front();
        }
        self.stats.sessions_closed += 1;
        metrics::counter!("session.closed").increment(1);

        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            reason,
            "Maintenance session closed"
        );
        session
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.current.as_ref().map(|a| a.session.clone());
        SessionSnapshot {
            state: session
                .as_ref()
                .map(|s| s.state)
                .unwrap_or(SessionState::Idle),
            session,
            archived: self.archived.len(),
            stats: self.stats.clone(),
        }
    }

    fn arm_timers(&mut self, deadline: Instant) {
        self.epoch += 1;
        let epoch = self.epoch;

        let warn_at = deadline
            .checked_sub(self.config.warn_window)
            .unwrap_or_else(Instant::now);

        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(warn_at).await;
            let _ = tx
                .send(Command::TimerFired {
                    epoch,
                    kind: TimerKind::Warn,
                })
                .await;
        });

        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx
                .send(Command::TimerFired {
                    epoch,
                    kind: TimerKind::Expire,
                })
                .await;
        });
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(duration.as_millis() as i64)
}

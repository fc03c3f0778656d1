// src/progress.rs
//! Process-wide progress state of report jobs, keyed by job id.
//!
//! Each job has exactly one writer (its run task); any number of readers may
//! poll a snapshot at the same time. Every change is also published on a
//! broadcast channel so that push clients (the websocket) see it without
//! polling.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast};

use crate::errors::{ReportError, Result};

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobState {
    Created,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Created => write!(f, "Created"),
            JobState::Running => write!(f, "Running"),
            JobState::Succeeded => write!(f, "Succeeded"),
            JobState::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of one job's progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressState {
    pub job_id: String,
    pub caption: String,
    pub status_message: String,
    /// `None` while the amount of remaining work is unknown.
    pub percent: Option<f64>,
    pub state: JobState,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProgressState {
    fn new(job_id: &str, caption: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            caption: caption.to_string(),
            status_message: String::new(),
            percent: None,
            state: JobState::Created,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

#[derive(Clone)]
pub struct ProgressTracker {
    states: Arc<RwLock<HashMap<String, ProgressState>>>,
    updates: broadcast::Sender<ProgressState>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            updates,
        }
    }

    /// Receive every state change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressState> {
        self.updates.subscribe()
    }

    fn publish(&self, state: &ProgressState) {
        // no receivers is fine
        let _ = self.updates.send(state.clone());
    }

    /// Registers a new job in state `Created` with indeterminate progress.
    pub async fn init(&self, job_id: &str, caption: &str) {
        let state = ProgressState::new(job_id, caption);
        self.publish(&state);
        self.states.write().await.insert(job_id.to_string(), state);
    }

    pub async fn get(&self, job_id: &str) -> Option<ProgressState> {
        self.states.read().await.get(job_id).cloned()
    }

    pub async fn mark_running(&self, job_id: &str) -> Result<()> {
        self.update(job_id, |state| {
            state.state = JobState::Running;
        })
        .await
    }

    /// Publishes a status message; ignored once the job has finished.
    pub async fn set_status(&self, job_id: &str, message: &str, percent: Option<f64>) -> Result<()> {
        log::debug!("{}: {} ({:?})", job_id, message, percent);
        self.update(job_id, |state| {
            state.status_message = message.to_string();
            state.percent = percent.map(|p| p.clamp(0.0, 100.0));
        })
        .await
    }

    pub async fn request_cancel(&self, job_id: &str) -> bool {
        self.update(job_id, |state| state.cancel_requested = true)
            .await
            .is_ok()
    }

    /// Moves the job into a terminal state. A job finishes exactly once; a
    /// second call fails and leaves the recorded state untouched.
    pub async fn finish(&self, job_id: &str, outcome: JobState, message: &str) -> Result<()> {
        if !outcome.is_terminal() {
            return Err(ReportError::Validation(format!(
                "{} is not a terminal job state",
                outcome
            )));
        }

        let mut states = self.states.write().await;
        let state = states
            .get_mut(job_id)
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))?;
        if state.state.is_terminal() {
            return Err(ReportError::AlreadyFinished(job_id.to_string()));
        }

        let now = Utc::now();
        state.state = outcome;
        state.status_message = message.to_string();
        if outcome == JobState::Succeeded {
            state.percent = Some(100.0);
        }
        state.updated_at = now;
        state.finished_at = Some(now);
        self.publish(state);
        Ok(())
    }

    pub async fn remove(&self, job_id: &str) -> Option<ProgressState> {
        self.states.write().await.remove(job_id)
    }

    /// Drops finished jobs older than `retention`; returns the evicted ids.
    pub async fn evict_finished_before(&self, now: DateTime<Utc>, retention: Duration) -> Vec<String> {
        let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut states = self.states.write().await;
        let expired: Vec<String> = states
            .values()
            .filter(|s| matches!(s.finished_at, Some(done) if now - done >= retention))
            .map(|s| s.job_id.clone())
            .collect();
        for id in &expired {
            states.remove(id);
        }
        expired
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    async fn update<F>(&self, job_id: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ProgressState),
    {
        let mut states = self.states.write().await;
        let state = states
            .get_mut(job_id)
            .ok_or_else(|| ReportError::JobNotFound(job_id.to_string()))?;
        if state.state.is_terminal() {
            return Ok(());
        }
        apply(state);
        state.updated_at = Utc::now();
        self.publish(state);
        Ok(())
    }
}

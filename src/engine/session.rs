//! Owner of "the current run".
//!
//! [`RunSession`] starts runs on the backend, keeps exactly one
//! [`StatusPoller`] alive for the newest of them and folds the snapshots it
//! reports into a [`SessionView`]. Every write goes through one mutex and is
//! tagged with a session generation, so a snapshot from a superseded run can
//! never overwrite the current one.

use crate::engine::api::ApiError;
use crate::engine::poller::{PollHandle, StatusPoller};
use crate::engine::PipelineBackend;
use crate::model::{RunId, RunPhase, RunStatus};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info, warn};

const GENERIC_FAILURE: &str = "Pipeline failed";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Start(#[from] ApiError),
    #[error("run start superseded by a newer request")]
    Superseded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
    Completed,
    Failed,
}

/// Merged, read-only view of the session.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub current_run_id: Option<RunId>,
    /// Replaced wholesale on every accepted poll.
    pub latest_status: Option<Arc<RunStatus>>,
    pub is_running: bool,
    pub last_error: Option<String>,
}

impl SessionView {
    pub fn phase(&self) -> SessionPhase {
        if self.is_running {
            return SessionPhase::Running;
        }
        match self.latest_status.as_deref().map(|s| &s.phase) {
            Some(RunPhase::Completed) => SessionPhase::Completed,
            Some(RunPhase::Failed { .. }) => SessionPhase::Failed,
            _ => SessionPhase::Idle,
        }
    }

    pub fn current_stage(&self) -> Option<&str> {
        self.latest_status.as_deref()?.current_stage.as_deref()
    }
}

struct SessionState {
    view: SessionView,
    generation: u64,
    poller: Option<PollHandle>,
}

type Shared = Arc<Mutex<SessionState>>;

pub struct RunSession {
    backend: Arc<dyn PipelineBackend>,
    poller: StatusPoller,
    state: Shared,
    view_tx: Arc<watch::Sender<SessionView>>,
}

impl RunSession {
    pub fn new(backend: Arc<dyn PipelineBackend>, poller: StatusPoller) -> Self {
        let (view_tx, _) = watch::channel(SessionView::default());
        Self {
            backend,
            poller,
            state: Arc::new(Mutex::new(SessionState {
                view: SessionView::default(),
                generation: 0,
                poller: None,
            })),
            view_tx: Arc::new(view_tx),
        }
    }

    /// Start a run for `dataset_path` and begin polling it.
    ///
    /// Any previous poller is cancelled before the request goes out. If the
    /// request fails the session is left not running with `last_error` set
    /// and no poller.
    pub async fn start(&self, dataset_path: &str) -> Result<RunId, SessionError> {
        let generation = {
            let mut st = lock(&self.state);
            st.generation += 1;
            if let Some(old) = st.poller.take() {
                debug!(run_id = %old.run_id(), "cancelling previous poller");
                old.cancel();
            }
            st.view = SessionView {
                is_running: true,
                ..SessionView::default()
            };
            self.view_tx.send_replace(st.view.clone());
            st.generation
        };

        let result = self.backend.start_run(dataset_path).await;

        let mut st = lock(&self.state);
        if st.generation != generation {
            debug!(dataset_path, "start response arrived after a newer request");
            return Err(SessionError::Superseded);
        }
        match result {
            Err(e) => {
                warn!(dataset_path, error = %e, "pipeline start failed");
                st.view.is_running = false;
                st.view.last_error = Some(e.to_string());
                self.view_tx.send_replace(st.view.clone());
                Err(SessionError::Start(e))
            }
            Ok(ticket) => {
                info!(run_id = %ticket.run_id, dataset_path, "pipeline run started");
                let run_id = ticket.run_id;
                st.view.current_run_id = Some(run_id.clone());
                let state = self.state.clone();
                let view_tx = self.view_tx.clone();
                st.poller = Some(self.poller.start(run_id.clone(), move |status| {
                    apply_snapshot(&state, &view_tx, generation, status);
                }));
                self.view_tx.send_replace(st.view.clone());
                Ok(run_id)
            }
        }
    }

    /// Cancel the active poller (if any) and mark the session not running.
    pub fn stop(&self) {
        let mut st = lock(&self.state);
        st.generation += 1;
        if let Some(p) = st.poller.take() {
            p.cancel();
        }
        if st.view.is_running {
            st.view.is_running = false;
            self.view_tx.send_replace(st.view.clone());
        }
    }

    pub fn view(&self) -> SessionView {
        lock(&self.state).view.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view_tx.subscribe()
    }
}

#[allow(dead_code)]
impl RunSession {
    pub fn current_status(&self) -> Option<Arc<RunStatus>> {
        lock(&self.state).view.latest_status.clone()
    }

    pub fn current_run_id(&self) -> Option<RunId> {
        lock(&self.state).view.current_run_id.clone()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.state).view.is_running
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.state).view.last_error.clone()
    }
}

impl Drop for RunSession {
    fn drop(&mut self) {
        if let Some(p) = lock(&self.state).poller.take() {
            p.cancel();
        }
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Fold one snapshot into the session, unless it belongs to a superseded run.
fn apply_snapshot(
    state: &Mutex<SessionState>,
    view_tx: &watch::Sender<SessionView>,
    generation: u64,
    status: RunStatus,
) -> bool {
    let mut st = lock(state);
    if st.generation != generation || st.view.current_run_id.as_ref() != Some(&status.run_id) {
        debug!(run_id = %status.run_id, "discarding stale status snapshot");
        return false;
    }

    if status.is_terminal() {
        st.view.is_running = false;
        if let RunPhase::Failed { error } = &status.phase {
            st.view.last_error = Some(error.clone().unwrap_or_else(|| GENERIC_FAILURE.to_string()));
        }
        info!(run_id = %status.run_id, outcome = status.phase.as_str(), "pipeline run finished");
    }
    st.view.latest_status = Some(Arc::new(status));
    view_tx.send_replace(st.view.clone());
    true
}

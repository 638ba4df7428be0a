use crate::engine::PipelineBackend;
use crate::model::{RunId, RunStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fixed-cadence status fetcher for one run.
#[derive(Clone)]
pub struct StatusPoller {
    backend: Arc<dyn PipelineBackend>,
    interval: Duration,
    fetch_timeout: Duration,
}

/// Handle to a running poll loop. Dropping it does not stop the loop.
pub struct PollHandle {
    run_id: RunId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PollHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Stop polling. No snapshot is delivered after this returns, unless a
    /// delivery was already in progress on another thread. Safe to call any
    /// number of times, including after the loop ended by itself.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[allow(dead_code)]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end, either by cancellation or a terminal snapshot.
    #[allow(dead_code)]
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

impl StatusPoller {
    pub fn new(backend: Arc<dyn PipelineBackend>, interval: Duration, fetch_timeout: Duration) -> Self {
        Self {
            backend,
            interval,
            fetch_timeout,
        }
    }

    /// Poll `run_id` right away and then every interval, handing each
    /// snapshot to `deliver`. Stops after delivering a terminal snapshot.
    pub fn start<F>(&self, run_id: RunId, mut deliver: F) -> PollHandle
    where
        F: FnMut(RunStatus) + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let backend = self.backend.clone();
        let interval = self.interval;
        let fetch_timeout = self.fetch_timeout;
        let id = run_id.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A slow fetch pushes the schedule back instead of causing a burst.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // The first tick completes immediately.
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let fetched = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    r = tokio::time::timeout(fetch_timeout, backend.fetch_status(&id)) => r,
                };

                match fetched {
                    Ok(Ok(status)) => {
                        if token.is_cancelled() {
                            break;
                        }
                        if status.run_id != id {
                            warn!(run_id = %id, got = %status.run_id, "status response for a different run, ignoring");
                            continue;
                        }
                        let terminal = status.is_terminal();
                        deliver(status);
                        if terminal {
                            debug!(run_id = %id, "terminal status reached, polling stopped");
                            break;
                        }
                    }
                    Ok(Err(e)) => warn!(run_id = %id, error = %e, "status fetch failed"),
                    Err(_) => warn!(
                        run_id = %id,
                        timeout_ms = fetch_timeout.as_millis() as u64,
                        "status fetch timed out"
                    ),
                }
            }
        });

        PollHandle {
            run_id,
            cancel,
            task,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::api::ApiError;
    use crate::model::{RunPhase, RunTicket};
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// One scripted reply of [`ScriptedBackend`].
    pub(crate) enum Reply {
        Status(RunPhase, Option<&'static str>),
        Fail,
        /// Reply after a delay.
        Slow(Duration, RunPhase),
    }

    /// Backend returning scripted status replies per run id, recording fetch times.
    #[derive(Default)]
    pub(crate) struct ScriptedBackend {
        pub(crate) scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
        pub(crate) fetches: Mutex<Vec<(String, Instant)>>,
        pub(crate) tickets: Mutex<VecDeque<Result<&'static str, &'static str>>>,
        pub(crate) ticket_delay: Mutex<Duration>,
    }

    impl ScriptedBackend {
        pub(crate) fn script(&self, run: &str, replies: Vec<Reply>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(run.to_string(), replies.into());
        }

        pub(crate) fn fetch_count(&self, run: &str) -> usize {
            self.fetches
                .lock()
                .unwrap()
                .iter()
                .filter(|(r, _)| r == run)
                .count()
        }
    }

    pub(crate) fn status(run: &str, phase: RunPhase, stage: Option<&str>) -> RunStatus {
        RunStatus {
            run_id: RunId::new(run),
            phase,
            current_stage: stage.map(str::to_string),
            dataset_stats: None,
            aug_plan: None,
            selected_model: None,
            model_results: None,
        }
    }

    #[async_trait]
    impl PipelineBackend for ScriptedBackend {
        async fn start_run(&self, _dataset_path: &str) -> Result<RunTicket, ApiError> {
            let ticket = self.tickets.lock().unwrap().pop_front();
            let delay = *self.ticket_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match ticket {
                Some(Ok(id)) => Ok(RunTicket {
                    run_id: RunId::new(id),
                    status: "started".into(),
                }),
                Some(Err(detail)) => Err(ApiError::Status {
                    status: StatusCode::BAD_REQUEST,
                    message: detail.to_string(),
                }),
                None => Err(ApiError::Decode("no ticket scripted".into())),
            }
        }

        async fn fetch_status(&self, run_id: &RunId) -> Result<RunStatus, ApiError> {
            let run = run_id.as_str().to_string();
            self.fetches
                .lock()
                .unwrap()
                .push((run.clone(), Instant::now()));
            let reply = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&run)
                .and_then(|q| q.pop_front());
            match reply {
                Some(Reply::Status(phase, stage)) => Ok(status(&run, phase, stage)),
                Some(Reply::Slow(delay, phase)) => {
                    tokio::time::sleep(delay).await;
                    Ok(status(&run, phase, None))
                }
                Some(Reply::Fail) => Err(ApiError::Status {
                    status: StatusCode::BAD_GATEWAY,
                    message: "Bad Gateway".into(),
                }),
                // An exhausted script keeps reporting a running run.
                None => Ok(status(&run, RunPhase::Running, None)),
            }
        }
    }

    fn poller(backend: &Arc<ScriptedBackend>) -> StatusPoller {
        StatusPoller::new(
            backend.clone(),
            Duration::from_millis(2000),
            Duration::from_secs(10),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_immediately_then_every_interval_until_terminal() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script(
            "r1",
            vec![
                Reply::Status(RunPhase::Running, Some("inspect")),
                Reply::Status(RunPhase::Running, Some("augment")),
                Reply::Status(RunPhase::Completed, Some("completed")),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();
        let handle = poller(&backend).start(RunId::new("r1"), move |s| {
            let _ = tx.send(s);
        });
        handle.join().await;

        let mut stages = Vec::new();
        while let Ok(s) = rx.try_recv() {
            stages.push(s.current_stage.unwrap());
        }
        assert_eq!(stages, vec!["inspect", "augment", "completed"]);

        let times: Vec<_> = backend
            .fetches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.duration_since(started))
            .collect();
        assert_eq!(
            times,
            vec![
                Duration::ZERO,
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );

        // Nothing more after the terminal snapshot.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(backend.fetch_count("r1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetches_are_retried_on_next_tick() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script(
            "r1",
            vec![
                Reply::Fail,
                Reply::Fail,
                Reply::Status(RunPhase::Failed { error: Some("OOM".into()) }, None),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = poller(&backend).start(RunId::new("r1"), move |s| {
            let _ = tx.send(s);
        });
        handle.join().await;

        let delivered = rx.try_recv().unwrap();
        assert_eq!(delivered.error(), Some("OOM"));
        assert!(rx.try_recv().is_err());
        assert_eq!(backend.fetch_count("r1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_is_transient() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script(
            "r1",
            vec![
                Reply::Slow(Duration::from_secs(60), RunPhase::Completed),
                Reply::Status(RunPhase::Completed, None),
            ],
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let p = StatusPoller::new(backend.clone(), Duration::from_millis(2000), Duration::from_secs(1));
        p.start(RunId::new("r1"), move |s| {
            let _ = tx.send(s);
        })
        .join()
        .await;

        assert_eq!(backend.fetch_count("r1"), 2);
        assert_eq!(rx.try_recv().unwrap().phase, RunPhase::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_deliveries_and_is_idempotent() {
        let backend = Arc::new(ScriptedBackend::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = poller(&backend).start(RunId::new("r1"), move |s| {
            let _ = tx.send(s);
        });

        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert_eq!(backend.fetch_count("r1"), 3);

        handle.cancel();
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(backend.fetch_count("r1"), 3);
        assert!(handle.is_finished());

        let mut delivered = 0;
        while rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 3);

        // Cancelling after the loop is gone is still fine.
        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_slow_fetch_discards_its_result() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.script("r1", vec![Reply::Slow(Duration::from_secs(5), RunPhase::Completed)]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = poller(&backend).start(RunId::new("r1"), move |s| {
            let _ = tx.send(s);
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        handle.join().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}

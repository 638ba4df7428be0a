//! Run lifecycle controller.
//!
//! Starts a run, then multiplexes log events, session changes and the user's
//! interrupt into one stream of output lines until the run reaches a terminal
//! status or the user gives up on it.

use crate::cli::OutputLine;
use crate::engine::channel::{ChannelError, ConnectionState};
use crate::engine::session::{RunSession, SessionView};
use crate::model::AgentEvent;
use anyhow::{Context, Result};
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

/// How long to keep printing trailing log lines once the run is terminal.
const LOG_DRAIN: Duration = Duration::from_millis(250);

/// Final state of a followed run.
pub(crate) struct FollowOutcome {
    pub view: SessionView,
    pub interrupted: bool,
}

/// Start a run for `dataset_path` and follow it until it is no longer running.
///
/// Events arriving on `events` are printed (when `show_logs`) as they come.
/// Resolving `interrupt` stops the session and returns early.
pub(crate) async fn follow_run(
    session: &RunSession,
    dataset_path: &str,
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    out: &mpsc::UnboundedSender<OutputLine>,
    show_logs: bool,
    interrupt: impl Future<Output = ()>,
) -> Result<FollowOutcome> {
    let mut views = session.subscribe();
    tokio::pin!(interrupt);

    let started = tokio::select! {
        _ = &mut interrupt => {
            session.stop();
            let _ = out.send(OutputLine::Stderr("Interrupted before the run started".into()));
            return Ok(FollowOutcome {
                view: session.view(),
                interrupted: true,
            });
        }
        r = session.start(dataset_path) => r,
    };
    let run_id =
        started.with_context(|| format!("failed to start pipeline for {dataset_path}"))?;
    let _ = out.send(OutputLine::Stderr(format!("Started run {run_id}")));

    let mut last_stage: Option<String> = None;
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = &mut interrupt => {
                session.stop();
                interrupted = true;
                let _ = out.send(OutputLine::Stderr("Interrupted, stopped following the run".into()));
                break;
            }
            Some(ev) = events.recv() => {
                if show_logs {
                    let _ = out.send(OutputLine::Stderr(ev.to_line()));
                }
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                if let Some(stage) = view.current_stage() {
                    if last_stage.as_deref() != Some(stage) {
                        let _ = out.send(OutputLine::Stderr(format!("== {stage} ==")));
                        last_stage = Some(stage.to_string());
                    }
                }
                if !view.is_running {
                    break;
                }
            }
        }
    }

    if !interrupted && show_logs {
        // The backend's closing log line usually trails the terminal status.
        let deadline = Instant::now() + LOG_DRAIN;
        loop {
            tokio::select! {
                Some(ev) = events.recv() => {
                    let _ = out.send(OutputLine::Stderr(ev.to_line()));
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }
    }

    Ok(FollowOutcome {
        view: session.view(),
        interrupted,
    })
}

/// Print events until interrupted. Returns `false` if the stream went away.
///
/// Connection errors and reconnect attempts are reported on stderr.
pub(crate) async fn stream_logs(
    events: &mut mpsc::UnboundedReceiver<AgentEvent>,
    state: &mut watch::Receiver<ConnectionState>,
    errors: &mut mpsc::UnboundedReceiver<ChannelError>,
    out: &mpsc::UnboundedSender<OutputLine>,
    interrupt: impl Future<Output = ()>,
) -> bool {
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => return true,
            ev = events.recv() => match ev {
                Some(ev) => {
                    let _ = out.send(OutputLine::Stdout(ev.to_line()));
                }
                None => return false,
            },
            Some(err) = errors.recv() => {
                let _ = out.send(OutputLine::Stderr(format!("Log stream: {err}")));
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return false;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnectionState::Reconnecting { attempt } => {
                        let _ = out.send(OutputLine::Stderr(format!(
                            "Log stream reconnecting (attempt {attempt})"
                        )));
                    }
                    ConnectionState::GaveUp => {
                        let _ = out.send(OutputLine::Stderr(
                            "Log stream unavailable: reconnect attempts exhausted".into(),
                        ));
                        return false;
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::poller::tests::{Reply, ScriptedBackend};
    use crate::engine::poller::StatusPoller;
    use crate::engine::session::SessionPhase;
    use crate::model::{LogLevel, RunPhase};
    use std::sync::Arc;

    fn session(backend: &Arc<ScriptedBackend>) -> RunSession {
        let poller = StatusPoller::new(backend.clone(), Duration::from_secs(2), Duration::from_secs(10));
        RunSession::new(backend.clone(), poller)
    }

    fn ev(msg: &str) -> AgentEvent {
        AgentEvent {
            timestamp: "2024-05-01T10:00:00".into(),
            agent: "orchestrator".into(),
            message: msg.into(),
            level: LogLevel::Info,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutputLine>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            match line {
                OutputLine::Stdout(s) | OutputLine::Stderr(s) => lines.push(s),
            }
        }
        lines
    }

    #[tokio::test(start_paused = true)]
    async fn follows_run_to_completion_printing_stages_once() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.tickets.lock().unwrap() = vec![Ok("r1")].into();
        backend.script(
            "r1",
            vec![
                Reply::Status(RunPhase::Running, Some("data_inspector")),
                Reply::Status(RunPhase::Running, Some("data_inspector")),
                Reply::Status(RunPhase::Running, Some("model_trainer")),
                Reply::Status(RunPhase::Completed, Some("completed")),
            ],
        );
        let s = session(&backend);
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        ev_tx.send(ev("Pipeline started for dataset: /data/x")).unwrap();

        let outcome = follow_run(
            &s,
            "/data/x",
            &mut ev_rx,
            &out_tx,
            true,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert!(!outcome.interrupted);
        assert_eq!(outcome.view.phase(), SessionPhase::Completed);
        let lines = drain(&mut out_rx);
        assert_eq!(lines[0], "Started run r1");
        let stages: Vec<_> = lines.iter().filter(|l| l.starts_with("==")).collect();
        assert_eq!(
            stages,
            vec!["== data_inspector ==", "== model_trainer ==", "== completed =="]
        );
        assert!(lines.iter().any(|l| l.ends_with("Pipeline started for dataset: /data/x")));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_stops_the_session() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.tickets.lock().unwrap() = vec![Ok("r1")].into();
        let s = session(&backend);
        let (_ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();

        let outcome = follow_run(
            &s,
            "/data/x",
            &mut ev_rx,
            &out_tx,
            false,
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert!(outcome.interrupted);
        assert!(!outcome.view.is_running);
        let fetched = backend.fetch_count("r1");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.fetch_count("r1"), fetched);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_during_slow_start_returns_cleanly() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.tickets.lock().unwrap() = vec![Ok("r1")].into();
        *backend.ticket_delay.lock().unwrap() = Duration::from_secs(30);
        let s = session(&backend);
        let (_ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        let outcome = follow_run(
            &s,
            "/data/x",
            &mut ev_rx,
            &out_tx,
            true,
            tokio::time::sleep(Duration::from_secs(1)),
        )
        .await
        .unwrap();

        assert!(outcome.interrupted);
        assert!(!outcome.view.is_running);
        assert_eq!(outcome.view.current_run_id, None);
        assert_eq!(drain(&mut out_rx), vec!["Interrupted before the run started"]);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(backend.fetch_count("r1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_is_reported_with_context() {
        let backend = Arc::new(ScriptedBackend::default());
        *backend.tickets.lock().unwrap() = vec![Err("Dataset path does not exist")].into();
        let s = session(&backend);
        let (_ev_tx, mut ev_rx) = mpsc::unbounded_channel();
        let (out_tx, _out_rx) = mpsc::unbounded_channel();

        let err = follow_run(&s, "/nope", &mut ev_rx, &out_tx, true, std::future::pending())
            .await
            .err()
            .unwrap();
        let msg = format!("{err:#}");
        assert!(msg.contains("failed to start pipeline for /nope"), "{msg}");
        assert!(msg.contains("Dataset path does not exist"), "{msg}");
    }

    #[tokio::test]
    async fn stream_logs_ends_when_channel_gives_up() {
        let (_ev_tx, mut ev_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let (_err_tx, mut err_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        state_tx.send_replace(ConnectionState::GaveUp);
        let ok = stream_logs(
            &mut ev_rx,
            &mut state_rx,
            &mut err_rx,
            &out_tx,
            std::future::pending(),
        )
        .await;
        assert!(!ok);
        assert_eq!(
            drain(&mut out_rx),
            vec!["Log stream unavailable: reconnect attempts exhausted"]
        );
    }

    #[tokio::test]
    async fn stream_logs_reports_connection_trouble() {
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connected);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();

        ev_tx.send(ev("epoch 1")).unwrap();
        err_tx
            .send(ChannelError::Lost(
                tokio_tungstenite::tungstenite::Error::ConnectionClosed,
            ))
            .unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let streaming = tokio::spawn(async move {
            let ok = stream_logs(&mut ev_rx, &mut state_rx, &mut err_rx, &out_tx, async {
                let _ = stop_rx.await;
            })
            .await;
            (ok, out_tx)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        state_tx.send_replace(ConnectionState::Reconnecting { attempt: 1 });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop_tx.send(()).unwrap();
        let (ok, _out_tx) = streaming.await.unwrap();

        assert!(ok);
        let lines = drain(&mut out_rx);
        assert!(lines.iter().any(|l| l.ends_with("orchestrator: epoch 1")), "{lines:?}");
        assert!(lines.iter().any(|l| l.starts_with("Log stream: event channel connection lost")), "{lines:?}");
        assert!(lines.contains(&"Log stream reconnecting (attempt 1)".to_string()), "{lines:?}");
    }
}

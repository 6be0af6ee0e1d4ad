//! Implementation of the one-shot bare-metal executor.

use std::sync::Arc;

use gantry_sim::SimClock;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;

use crate::Action;
use crate::ActionKind;
use crate::CompoundJob;
use crate::JobEvent;
use crate::TerminationCause;
use crate::config::TaskSelectionAlgorithm;

/// Represents a request to stop a running executor.
#[derive(Debug)]
pub(crate) struct StopRequest {
    /// Why the executor is being stopped.
    pub cause: TerminationCause,
    /// Whether the executor posts a failure notification for the job.
    pub notify: bool,
}

/// A handle to a spawned one-shot executor.
#[derive(Debug)]
pub(crate) struct ExecutorHandle {
    /// The stop channel; consumed by the first stop request.
    stop: Option<oneshot::Sender<StopRequest>>,
}

impl ExecutorHandle {
    /// Asks the executor to stop with the given cause.
    ///
    /// With `notify`, the executor posts a failure notification on the job's
    /// current callback port; without it, the executor exits silently and
    /// the caller owns all cleanup. Stopping an executor that already
    /// finished is a no-op.
    pub fn stop(&mut self, cause: TerminationCause, notify: bool) {
        if let Some(tx) = self.stop.take() {
            tx.send(StopRequest { cause, notify }).ok();
        }
    }
}

/// Spawns an ephemeral executor that runs exactly one compound job and
/// exits.
///
/// The executor runs the job's actions one after another in the configured
/// order, each consuming its simulated duration, then posts a done
/// notification on the job's current callback port. The enclosing service
/// pushes its own port there before calling this, so the notification comes
/// back to it.
pub(crate) fn spawn_one_shot_executor(
    clock: &SimClock,
    job: &Arc<CompoundJob>,
    speed: f64,
    order: TaskSelectionAlgorithm,
    service: &str,
) -> ExecutorHandle {
    let (stop_tx, stop_rx) = oneshot::channel::<StopRequest>();
    let clock = clock.clone();
    let job = job.clone();
    let service = service.to_string();

    tokio::spawn(async move {
        info!(
            "one-shot executor running job `{name}`",
            name = job.name()
        );

        let actions = ordered_actions(&job, order);
        let work = async {
            for action in &actions {
                let seconds = match action.kind() {
                    ActionKind::Sleep(seconds) => seconds,
                    ActionKind::Compute(flops) => flops / speed,
                };
                debug!(
                    "running action `{name}` for {seconds} seconds",
                    name = action.name()
                );
                clock.sleep(seconds).await;
            }
        };

        // A dropped stop channel means nobody can stop us anymore.
        let stopped = async {
            match stop_rx.await {
                Ok(request) => request,
                Err(_) => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = work => {
                if let Some(port) = job.current_callback_port() {
                    port.send(JobEvent::Done {
                        job: job.clone(),
                        service,
                    })
                    .ok();
                }
            }
            request = stopped => {
                debug!(
                    "executor for job `{name}` stopped ({cause:?})",
                    name = job.name(),
                    cause = request.cause
                );
                if request.notify
                    && let Some(port) = job.current_callback_port()
                {
                    let cause = request.cause.failure_cause(job.name(), &service);
                    port.send(JobEvent::Failed {
                        job: job.clone(),
                        service,
                        cause,
                    })
                    .ok();
                }
            }
        }
    });

    ExecutorHandle {
        stop: Some(stop_tx),
    }
}

/// Orders a job's actions per the task selection algorithm.
fn ordered_actions(job: &CompoundJob, order: TaskSelectionAlgorithm) -> Vec<Arc<Action>> {
    let mut actions = job.actions();
    match order {
        TaskSelectionAlgorithm::MaximumFlops => {
            actions.sort_by(|a, b| {
                let work = |action: &Action| match action.kind() {
                    ActionKind::Compute(flops) => flops,
                    ActionKind::Sleep(_) => 0.0,
                };
                work(b).total_cmp(&work(a))
            });
        }
        TaskSelectionAlgorithm::MaximumMinimumCores => {
            actions.sort_by_key(|a| std::cmp::Reverse(a.min_cores()));
        }
        TaskSelectionAlgorithm::MinimumTopLevel => {}
    }
    actions
}

#[cfg(test)]
mod test {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn executor_runs_actions_and_reports_done() {
        let clock = SimClock::new();
        let job = CompoundJob::new("job");
        job.add_sleep_action("a", 5.0);
        job.add_compute_action("b", 10e9, 1, 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        job.push_callback_port(tx);

        let _handle = spawn_one_shot_executor(
            &clock,
            &job,
            1e9,
            TaskSelectionAlgorithm::MinimumTopLevel,
            "batch",
        );

        match rx.recv().await.unwrap() {
            JobEvent::Done { job, .. } => assert_eq!(job.name(), "job"),
            event => panic!("unexpected event {event:?}"),
        }
        // 5 seconds of sleep plus 10 Gflop at 1 Gflop/s.
        assert!((clock.now() - 15.0).abs() < 1e-3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stopped_executor_reports_the_cause() {
        let clock = SimClock::new();
        let job = CompoundJob::new("job");
        job.add_sleep_action("a", 100.0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        job.push_callback_port(tx);

        let mut handle = spawn_one_shot_executor(
            &clock,
            &job,
            1e9,
            TaskSelectionAlgorithm::MinimumTopLevel,
            "batch",
        );

        clock.sleep(10.0).await;
        handle.stop(TerminationCause::JobTimeout, true);

        match rx.recv().await.unwrap() {
            JobEvent::Failed { cause, .. } => {
                assert_eq!(cause, crate::Error::JobTimeout {
                    job: "job".to_string()
                });
            }
            event => panic!("unexpected event {event:?}"),
        }
        assert!((clock.now() - 10.0).abs() < 1e-3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn silent_stop_posts_nothing() {
        let clock = SimClock::new();
        let job = CompoundJob::new("job");
        job.add_sleep_action("a", 100.0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        job.push_callback_port(tx);

        let mut handle = spawn_one_shot_executor(
            &clock,
            &job,
            1e9,
            TaskSelectionAlgorithm::MinimumTopLevel,
            "batch",
        );

        clock.sleep(1.0).await;
        handle.stop(TerminationCause::JobKilled, false);
        clock.sleep(1.0).await;

        assert!(rx.try_recv().is_err());
    }
}

//! Implementation of killable one-shot alarms.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::SimClock;

/// A one-shot alarm that posts a message to a port at a future simulated
/// date.
///
/// Killing the alarm cancels the pending message. Killing an alarm that has
/// already fired, or killing it twice, is a no-op.
#[derive(Debug)]
pub struct Alarm {
    /// The cancellation token of the alarm task.
    token: CancellationToken,
}

impl Alarm {
    /// Starts an alarm that sends `message` on `port` at simulated date
    /// `date`.
    ///
    /// A date in the past fires immediately. A send on a closed port is
    /// silently dropped, as the receiving service is gone.
    pub fn start<M: Send + 'static>(
        clock: &SimClock,
        date: f64,
        message: M,
        port: mpsc::UnboundedSender<M>,
    ) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let clock = clock.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => {
                    trace!("alarm for date {date} was killed");
                }
                _ = clock.sleep_until(date) => {
                    port.send(message).ok();
                }
            }
        });

        Self { token }
    }

    /// Kills the alarm, cancelling its pending message if it has not fired
    /// yet.
    pub fn kill(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn alarm_fires_at_its_date() {
        let clock = SimClock::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _alarm = Alarm::start(&clock, 10.0, "timeout", tx);

        rx.recv().await.unwrap();
        assert!((clock.now() - 10.0).abs() < 1e-3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn killed_alarm_does_not_fire() {
        let clock = SimClock::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let alarm = Alarm::start(&clock, 10.0, "timeout", tx);
        alarm.kill();

        clock.sleep(20.0).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn killing_a_fired_alarm_is_a_no_op() {
        let clock = SimClock::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let alarm = Alarm::start(&clock, 1.0, "timeout", tx);
        rx.recv().await.unwrap();

        alarm.kill();
        alarm.kill();
    }
}

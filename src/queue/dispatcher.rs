use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    Delivery, Disposition, QueueSettings, RetryPolicy, TaskError, TaskHandler, TaskQueue, decide,
};

/// Feeds one queue to one handler: claims under a concurrency cap and an
/// optional dispatch rate, enforces the per-invocation timeout, and applies
/// the queue's retry policy to every result.
pub struct Dispatcher {
    backend: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    settings: QueueSettings,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        settings: QueueSettings,
        poll_interval: Duration,
    ) -> Self {
        Self {
            backend,
            handler,
            settings,
            poll_interval,
        }
    }

    /// Run until `shutdown` fires, then drain in-flight deliveries.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let queue = self.settings.name;
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_dispatches.max(1)));
        let mut pacer = self
            .settings
            .max_dispatches_per_second
            .filter(|rate| *rate > 0.0)
            .map(|rate| {
                let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / rate));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
        let mut in_flight = JoinSet::new();

        tracing::info!(
            queue = %queue,
            concurrency = self.settings.max_concurrent_dispatches,
            rate = ?self.settings.max_dispatches_per_second,
            "Dispatcher started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => permit?,
            };

            if let Some(pacer) = pacer.as_mut() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = pacer.tick() => {}
                }
            }

            let claimed = match self.backend.claim(queue, 1, self.settings.lease()).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    tracing::error!(queue = %queue, "Failed to claim messages: {e}");
                    Vec::new()
                }
            };

            let Some(delivery) = claimed.into_iter().next() else {
                drop(permit);
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            let backend = self.backend.clone();
            let handler = self.handler.clone();
            let settings = self.settings.clone();
            in_flight.spawn(async move {
                process_delivery(&*backend, &*handler, &settings, delivery).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!(queue = %queue, "Dispatch task aborted: {e}");
                }
            }
        }

        if !in_flight.is_empty() {
            tracing::info!(queue = %queue, "Draining {} in-flight deliveries", in_flight.len());
        }
        while in_flight.join_next().await.is_some() {}
        tracing::info!(queue = %queue, "Dispatcher stopped");
        Ok(())
    }
}

/// Run one delivery through its handler and settle it on the backend.
pub async fn process_delivery(
    backend: &dyn TaskQueue,
    handler: &dyn TaskHandler,
    settings: &QueueSettings,
    delivery: Delivery,
) -> Disposition {
    let started = Instant::now();

    let result = if delivery.attempt > delivery.max_attempts {
        // The lease lapsed during the final attempt; the handler already had its chances.
        Err(TaskError::Terminal(format!(
            "Attempt {} exceeds max attempts {}",
            delivery.attempt, delivery.max_attempts
        )))
    } else {
        match tokio::time::timeout(settings.timeout, handler.handle(&delivery)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::Retryable(format!(
                "Timed out after {}s",
                settings.timeout.as_secs()
            ))),
        }
    };

    // The attempt budget travels with the message.
    let policy = RetryPolicy {
        max_attempts: delivery.max_attempts,
        ..settings.retry.clone()
    };
    let disposition = decide(&policy, delivery.attempt, &result);

    match &disposition {
        Disposition::Ack => {
            tracing::debug!(
                queue = %delivery.queue,
                message_id = delivery.id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Delivery handled: {:?}",
                result
            );
            if let Err(e) = backend.ack(delivery.id).await {
                tracing::error!(message_id = delivery.id, "Failed to ack message: {e}");
            }
        }
        Disposition::Retry { delay, error } => {
            let delay = with_jitter(*delay);
            tracing::warn!(
                queue = %delivery.queue,
                message_id = delivery.id,
                attempt = delivery.attempt,
                "Delivery failed, retrying in {}s: {error}",
                delay.as_secs()
            );
            handler.on_retry(&delivery, error).await;
            let run_at = chrono::Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            if let Err(e) = backend.retry(delivery.id, run_at, error).await {
                tracing::error!(message_id = delivery.id, "Failed to schedule retry: {e}");
            }
        }
        Disposition::DeadLetter { error } => {
            tracing::error!(
                queue = %delivery.queue,
                message_id = delivery.id,
                attempt = delivery.attempt,
                "Delivery dead-lettered: {error}"
            );
            handler.on_exhausted(&delivery, error).await;
            if let Err(e) = backend.dead_letter(delivery.id, error).await {
                tracing::error!(message_id = delivery.id, "Failed to dead-letter message: {e}");
            }
        }
    }

    disposition
}

/// Spread retries by up to 10% so a burst of failures does not come back in lockstep.
fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=spread))
}

//! Processing of a single delivery attempt.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::DeliveryPipeline;
use crate::Result;
use crate::domain::{AttemptKey, DeliveryAttempt, DeliveryStatus};
use crate::event_bus::DispatchEvent;
use crate::provider::{ProviderError, SendContext};
use crate::scheduler::MAX_DELAY_MS;

/// What came out of one send.
enum SendOutcome {
    Sent,
    Failed(ProviderError),
    /// Shutdown cancelled the call before it finished.
    Interrupted,
}

impl DeliveryPipeline {
    /// Claim and process one attempt.
    ///
    /// Returns the status the attempt was left in, or `None` when it could
    /// not be claimed (already in flight, not due, terminal or gone).
    pub async fn process(&self, key: AttemptKey) -> Result<Option<DeliveryStatus>> {
        let Some(mut attempt) = self.inner.attempts.claim(key, Instant::now()).await? else {
            return Ok(None);
        };

        let result = self.advance(&mut attempt).await;

        // Always hand the record back, even if advancing failed half way.
        self.inner.attempts.release(attempt.clone()).await?;
        result?;

        if attempt.is_terminal() {
            self.publish_outcome(&attempt);
        }
        Ok(Some(attempt.status))
    }

    /// Run the state machine for a claimed attempt.
    async fn advance(&self, attempt: &mut DeliveryAttempt) -> Result<()> {
        let key = attempt.key;

        let subscription = match self.inner.subscriptions.get(key.subscription_id).await? {
            Some(sub) if sub.enabled => sub,
            Some(_) => return self.give_up(attempt, "subscription disabled"),
            None => return self.give_up(attempt, "subscription removed"),
        };

        // Rate check. A denial defers the attempt without counting it.
        if !self.inner.limiter.allow(&subscription.rate_limit_key()).await {
            attempt.transition(DeliveryStatus::RateLimited)?;
            attempt.next_retry_at = Some(after(self.inner.config.rate_limit_delay()));
            debug!(
                attempt = %key,
                delay = ?self.inner.config.rate_limit_delay(),
                "rate limited, deferring"
            );
            return Ok(());
        }

        let provider = match self.provider_for(&subscription) {
            Ok(provider) => provider,
            Err(e) => {
                warn!(attempt = %key, error = %e, "provider configuration rejected");
                return self.give_up(attempt, &e.to_string());
            }
        };

        attempt.transition(DeliveryStatus::Sending)?;
        attempt.next_retry_at = None;
        if let Err(e) = self.inner.attempts.update(attempt).await {
            warn!(attempt = %key, error = %e, "failed to record sending status");
        }

        let timeout = self.inner.config.send_timeout();
        let ctx = SendContext {
            subscription_id: key.subscription_id,
            user_id: attempt.user_id,
            attempt: attempt.attempts + 1,
            deadline: after(timeout),
            cancel: self.inner.cancel.child_token(),
        };
        let article = attempt.article.clone();

        let send = AssertUnwindSafe(provider.send(&ctx, &article)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => SendOutcome::Interrupted,
            result = tokio::time::timeout(timeout, send) => match result {
                Err(_) => SendOutcome::Failed(ProviderError::transient(format!(
                    "timed out after {:?}",
                    timeout
                ))),
                Ok(Err(panic)) => SendOutcome::Failed(ProviderError::transient(format!(
                    "provider panicked: {}",
                    panic_message(&*panic)
                ))),
                Ok(Ok(Ok(()))) => SendOutcome::Sent,
                Ok(Ok(Err(e))) => SendOutcome::Failed(e),
            },
        };

        self.classify(attempt, outcome)
    }

    /// Apply a send outcome to the attempt.
    fn classify(&self, attempt: &mut DeliveryAttempt, outcome: SendOutcome) -> Result<()> {
        let key = attempt.key;
        match outcome {
            SendOutcome::Sent => {
                attempt.attempts += 1;
                attempt.last_error = None;
                attempt.transition(DeliveryStatus::Success)?;
                info!(
                    attempt = %key,
                    provider = %attempt.provider_kind,
                    attempts = attempt.attempts,
                    "Article delivered"
                );
            }
            SendOutcome::Failed(ProviderError::Permanent(msg)) => {
                attempt.attempts += 1;
                warn!(attempt = %key, provider = %attempt.provider_kind, error = %msg, "Delivery failed permanently");
                attempt.last_error = Some(msg);
                attempt.transition(DeliveryStatus::PermanentFailure)?;
            }
            SendOutcome::Failed(ProviderError::Transient(msg)) => {
                attempt.attempts += 1;
                let retry = &self.inner.config.retry;
                if retry.is_exhausted(attempt.attempts) {
                    warn!(
                        attempt = %key,
                        provider = %attempt.provider_kind,
                        attempts = attempt.attempts,
                        error = %msg,
                        "Delivery retries exhausted"
                    );
                    attempt.last_error = Some(format!("retries exhausted: {}", msg));
                    attempt.transition(DeliveryStatus::PermanentFailure)?;
                } else {
                    let delay = retry.delay_for(attempt.attempts);
                    debug!(
                        attempt = %key,
                        attempts = attempt.attempts,
                        ?delay,
                        error = %msg,
                        "transient failure, will retry"
                    );
                    attempt.last_error = Some(msg);
                    attempt.transition(DeliveryStatus::TransientFailure)?;
                    attempt.next_retry_at = Some(after(delay));
                }
            }
            SendOutcome::Interrupted => {
                // Not counted: the send may or may not have reached the
                // provider, it will be sent again after restart.
                attempt.transition(DeliveryStatus::Pending)?;
                attempt.next_retry_at = None;
                info!(attempt = %key, "Send interrupted by shutdown, returned to pending");
            }
        }
        Ok(())
    }

    /// Terminate an attempt without sending it.
    fn give_up(&self, attempt: &mut DeliveryAttempt, reason: &str) -> Result<()> {
        attempt.transition(DeliveryStatus::Sending)?;
        attempt.last_error = Some(reason.to_string());
        attempt.transition(DeliveryStatus::PermanentFailure)?;
        warn!(attempt = %attempt.key, reason = %reason, "Delivery abandoned");
        Ok(())
    }

    fn publish_outcome(&self, attempt: &DeliveryAttempt) {
        if let Some(bus) = &self.inner.outcomes {
            bus.try_publish(DispatchEvent::DeliveryFinished(attempt.report()));
        }
    }
}

/// `now + delay`, with the delay clamped to [`MAX_DELAY_MS`].
fn after(delay: Duration) -> Instant {
    Instant::now() + delay.min(Duration::from_millis(MAX_DELAY_MS))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

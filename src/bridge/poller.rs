use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{
    Attestation, AttestationApi, AttestationError, AttestationKey, PollError, PollOutcome,
};

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive malformed responses tolerated before giving up.
    pub max_hard_errors: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_hard_errors: 5,
        }
    }
}

/// Doubling delay schedule, capped.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            next: base.min(cap),
            cap,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.cap);
        delay
    }
}

/// Polls the attestation network until a signed message shows up.
#[derive(Clone)]
pub struct AttestationClient {
    api: Arc<dyn AttestationApi>,
    policy: BackoffPolicy,
}

impl AttestationClient {
    pub fn new(api: Arc<dyn AttestationApi>, policy: BackoffPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn fetch(
        &self,
        key: &AttestationKey,
        deadline: Duration,
    ) -> Result<Attestation, AttestationError> {
        let started = Instant::now();
        // `None` when the deadline lies past what `Instant` can represent.
        let give_up_at = started.checked_add(deadline);
        let mut backoff = Backoff::new(self.policy.base_delay, self.policy.max_delay);
        let mut hard_errors = 0u32;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.api.poll(key).await {
                Ok(PollOutcome::Ready(attestation)) => {
                    tracing::info!(%key, attempt, "attestation obtained");
                    return Ok(attestation);
                }
                Ok(PollOutcome::NotYet) => {
                    hard_errors = 0;
                    tracing::debug!(%key, attempt, "attestation not yet signed");
                }
                Err(PollError::Transient(err)) => {
                    hard_errors = 0;
                    tracing::warn!(%key, attempt, error = %format!("{err:#}"), "attestation poll failed");
                }
                Err(PollError::Malformed(msg)) => {
                    hard_errors += 1;
                    tracing::warn!(%key, attempt, hard_errors, error = %msg, "malformed attestation response");
                    if hard_errors >= self.policy.max_hard_errors {
                        return Err(AttestationError::Unavailable {
                            key: key.clone(),
                            consecutive: hard_errors,
                            last: msg,
                        });
                    }
                }
            }

            let now = Instant::now();
            let mut delay = backoff.next_delay();
            if let Some(give_up_at) = give_up_at {
                if now >= give_up_at {
                    return Err(AttestationError::Timeout {
                        key: key.clone(),
                        waited: now - started,
                    });
                }
                delay = delay.min(give_up_at - now);
            }
            tokio::time::sleep(delay).await;
        }
    }
}

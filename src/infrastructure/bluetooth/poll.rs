use crate::domain::settings::PollPolicy;
use tokio_util::sync::CancellationToken;

/// Check `predicate` now and after each interval until it holds
///
/// Gives up after `policy.max_cycles` intervals, or as soon as `cancel`
/// fires. Returns whether the predicate held.
pub async fn poll_until<F>(
    policy: PollPolicy,
    cancel: Option<&CancellationToken>,
    mut predicate: F,
) -> bool
where
    F: FnMut() -> bool,
{
    if predicate() {
        return true;
    }
    for _ in 0..policy.max_cycles {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    _ = tokio::time::sleep(policy.interval()) => {}
                }
            }
            None => tokio::time::sleep(policy.interval()).await,
        }
        if predicate() {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let start = Instant::now();
        assert!(poll_until(PollPolicy::new(500, 10), None, || true).await);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let mut calls = 0;
        let ok = poll_until(PollPolicy::new(1, 5), None, || {
            calls += 1;
            false
        })
        .await;
        assert!(!ok);
        assert_eq!(calls, 6);
    }

    #[tokio::test]
    async fn test_succeeds_mid_budget() {
        let mut calls = 0;
        let ok = poll_until(PollPolicy::new(1, 50), None, || {
            calls += 1;
            calls == 3
        })
        .await;
        assert!(ok);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_cancellation_ends_wait() {
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!poll_until(PollPolicy::new(1000, 10), Some(&token), || false).await);
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::{RateLimitAlgorithm, RateLimitPolicy};

use super::RateLimitDecision;

/// Stored counter, tagged so a policy switching algorithms starts afresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum CounterState {
    TokenBucket { tokens: f64, last_refill: f64 },
    SlidingWindow { timestamps: VecDeque<f64> },
    FixedWindow { window_start: f64, count: u32 },
}

/// Evaluates one check and returns the state to store with the decision.
pub(super) fn consume(
    policy: &RateLimitPolicy,
    state: Option<CounterState>,
    now: f64,
) -> (CounterState, RateLimitDecision) {
    match policy.algorithm {
        RateLimitAlgorithm::TokenBucket => token_bucket(policy, state, now, true),
        RateLimitAlgorithm::SlidingWindow => sliding_window(policy, state, now, true),
        RateLimitAlgorithm::FixedWindow => fixed_window(policy, state, now, true),
    }
}

/// Same evaluation as [`consume`] with the admission left out.
pub(super) fn peek(
    policy: &RateLimitPolicy,
    state: Option<CounterState>,
    now: f64,
) -> RateLimitDecision {
    let (_, mut decision) = match policy.algorithm {
        RateLimitAlgorithm::TokenBucket => token_bucket(policy, state, now, false),
        RateLimitAlgorithm::SlidingWindow => sliding_window(policy, state, now, false),
        RateLimitAlgorithm::FixedWindow => fixed_window(policy, state, now, false),
    };
    decision.allowed = decision.remaining > 0;
    decision
}

fn token_bucket(
    policy: &RateLimitPolicy,
    state: Option<CounterState>,
    now: f64,
    admit: bool,
) -> (CounterState, RateLimitDecision) {
    let burst = policy.burst() as f64;
    let rate = policy.tokens_per_second();

    let (tokens, last_refill) = match state {
        Some(CounterState::TokenBucket {
            tokens,
            last_refill,
        }) => (tokens, last_refill),
        _ => (burst, now),
    };

    // a clock stepping backwards refills nothing
    let elapsed = (now - last_refill).max(0.0);
    let mut tokens = (tokens + elapsed * rate).min(burst);

    let allowed = tokens >= 1.0;
    if allowed && admit {
        tokens -= 1.0;
    }

    let reset_at = if tokens >= 1.0 {
        now + (burst - tokens) / rate
    } else {
        now + (1.0 - tokens) / rate
    };

    (
        CounterState::TokenBucket {
            tokens,
            last_refill: now,
        },
        RateLimitDecision {
            allowed,
            limit: policy.burst(),
            remaining: tokens.floor() as u32,
            reset_at: Some(reset_at),
        },
    )
}

fn sliding_window(
    policy: &RateLimitPolicy,
    state: Option<CounterState>,
    now: f64,
    admit: bool,
) -> (CounterState, RateLimitDecision) {
    let window = policy.window_size_seconds as f64;
    let limit = policy.requests_per_minute;

    let mut timestamps = match state {
        Some(CounterState::SlidingWindow { timestamps }) => timestamps,
        _ => VecDeque::new(),
    };

    // an entry exactly one window old has expired
    while timestamps.front().is_some_and(|t| *t <= now - window) {
        timestamps.pop_front();
    }

    let allowed = (timestamps.len() as u32) < limit;
    if allowed && admit {
        timestamps.push_back(now);
    }

    let remaining = limit.saturating_sub(timestamps.len() as u32);
    let reset_at = timestamps.front().map(|oldest| oldest + window);

    (
        CounterState::SlidingWindow { timestamps },
        RateLimitDecision {
            allowed,
            limit,
            remaining,
            reset_at,
        },
    )
}

fn fixed_window(
    policy: &RateLimitPolicy,
    state: Option<CounterState>,
    now: f64,
    admit: bool,
) -> (CounterState, RateLimitDecision) {
    let window = policy.window_size_seconds as f64;
    let limit = policy.requests_per_minute;
    let current_start = (now / window).floor() * window;

    let mut count = match state {
        Some(CounterState::FixedWindow {
            window_start,
            count,
        }) if window_start == current_start => count,
        _ => 0,
    };

    let allowed = count < limit;
    if allowed && admit {
        count += 1;
    }

    (
        CounterState::FixedWindow {
            window_start: current_start,
            count,
        },
        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at: Some(current_start + window),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitScope;

    fn policy(algorithm: RateLimitAlgorithm) -> RateLimitPolicy {
        RateLimitPolicy {
            policy_id: "p".to_string(),
            algorithm,
            requests_per_minute: 60,
            burst_size: Some(2),
            window_size_seconds: 60,
            refill_rate: None,
            scope: RateLimitScope::PerIp,
        }
    }

    #[test]
    fn test_token_bucket_never_exceeds_burst() {
        let policy = policy(RateLimitAlgorithm::TokenBucket);
        let state = CounterState::TokenBucket {
            tokens: 0.0,
            last_refill: 0.0,
        };
        let (state, decision) = consume(&policy, Some(state), 3600.0);
        assert_eq!(
            CounterState::TokenBucket {
                tokens: 1.0,
                last_refill: 3600.0
            },
            state
        );
        assert_eq!(1, decision.remaining);
    }

    #[test]
    fn test_token_bucket_refill_rate_override() {
        let mut policy = policy(RateLimitAlgorithm::TokenBucket);
        policy.refill_rate = Some(0.5);
        let state = CounterState::TokenBucket {
            tokens: 0.0,
            last_refill: 0.0,
        };
        let (_, decision) = consume(&policy, Some(state.clone()), 1.0);
        assert!(!decision.allowed);
        assert_eq!(Some(2.0), decision.reset_at);
        let (_, decision) = consume(&policy, Some(state), 2.0);
        assert!(decision.allowed);
    }

    #[test]
    fn test_mismatched_state_starts_fresh() {
        let policy = policy(RateLimitAlgorithm::FixedWindow);
        let stale = CounterState::TokenBucket {
            tokens: 0.0,
            last_refill: 0.0,
        };
        let (state, decision) = consume(&policy, Some(stale), 5.0);
        assert!(decision.allowed);
        assert_eq!(
            CounterState::FixedWindow {
                window_start: 0.0,
                count: 1
            },
            state
        );
    }

    #[test]
    fn test_sliding_window_state_is_bounded_to_window() {
        let mut policy = policy(RateLimitAlgorithm::SlidingWindow);
        policy.window_size_seconds = 10;
        let mut state = None;
        for t in 0..30 {
            let (next, _) = consume(&policy, state, t as f64);
            state = Some(next);
        }
        match state {
            Some(CounterState::SlidingWindow { timestamps }) => {
                assert_eq!(10, timestamps.len());
                assert!(timestamps.iter().all(|t| *t > 19.0));
            }
            other => panic!("unexpected state {other:?}"),
        }
    }

    #[test]
    fn test_peek_reports_rejection() {
        let policy = policy(RateLimitAlgorithm::TokenBucket);
        let state = CounterState::TokenBucket {
            tokens: 0.2,
            last_refill: 10.0,
        };
        let decision = peek(&policy, Some(state), 10.0);
        assert!(!decision.allowed);
        assert_eq!(0, decision.remaining);
    }
}

//! Per-service circuit breaker
//!
//! Each service has one JSON record in the [`StateStore`] under
//! `breaker:{service}`. Admission and outcome reporting both go through
//! [`update_json`], so concurrent reports for one service are applied one at
//! a time and every transition happens exactly once.
//!
//! ```text
//! closed --(failure_threshold failures within failure_window)--> open
//! open --(cooldown elapsed, next call becomes the probe)--> half_open
//! half_open --(probe succeeds)--> closed
//! half_open --(probe fails)--> open
//! ```

use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    config,
    core::{
        store::{read_json, update_json},
        unix_now, GatewayError, GatewayResult, StateStore,
    },
    observability,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// How a call was let through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single trial call of a half-open breaker
    Probe,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct BreakerRecord {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    window_started_at: Option<f64>,
    last_failure_at: Option<f64>,
    opened_at: Option<f64>,
    probe_started_at: Option<f64>,
}

/// Snapshot served by `GET /api/v1/circuit-breaker/{service}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<f64>,
    /// When an open breaker admits its next probe
    pub next_attempt: Option<f64>,
}

fn breaker_key(service: &str) -> String {
    format!("breaker:{service}")
}

pub struct CircuitBreakers {
    store: Arc<dyn StateStore>,
    config: config::CircuitBreaker,
}

impl CircuitBreakers {
    pub fn new(store: Arc<dyn StateStore>, config: config::CircuitBreaker) -> Self {
        Self { store, config }
    }

    fn cooldown(&self) -> f64 {
        self.config.cooldown_seconds as f64
    }

    /// Asks to send one call to `service`.
    pub async fn acquire(&self, service: &str) -> GatewayResult<Admission> {
        self.acquire_at(service, unix_now()).await
    }

    pub async fn acquire_at(&self, service: &str, now: f64) -> GatewayResult<Admission> {
        let key = breaker_key(service);

        // closed breakers are the common case and need no write
        let current: Option<BreakerRecord> = read_json(self.store.as_ref(), &key).await?;
        if current.map_or(true, |r| r.state == CircuitState::Closed) {
            return Ok(Admission::Normal);
        }

        let cooldown = self.cooldown();
        let (admission, transition) =
            update_json(self.store.as_ref(), &key, |record: Option<BreakerRecord>| {
                let mut record = record.unwrap_or_default();
                let mut transition = None;

                let admission = match record.state {
                    CircuitState::Closed => Some(Admission::Normal),
                    CircuitState::Open => {
                        let opened_at = record.opened_at.unwrap_or(now);
                        if now >= opened_at + cooldown {
                            record.state = CircuitState::HalfOpen;
                            record.probe_started_at = Some(now);
                            transition = Some(CircuitState::HalfOpen);
                            Some(Admission::Probe)
                        } else {
                            None
                        }
                    }
                    CircuitState::HalfOpen => {
                        // a probe that never reported frees the slot after one more cooldown
                        let probe_free = record
                            .probe_started_at
                            .map_or(true, |started| now >= started + cooldown);
                        if probe_free {
                            record.probe_started_at = Some(now);
                            Some(Admission::Probe)
                        } else {
                            None
                        }
                    }
                };

                (record, (admission, transition))
            })
            .await?;

        if let Some(state) = transition {
            self.on_transition(service, state);
        }

        admission.ok_or_else(|| {
            log::debug!("Circuit open, short-circuiting call to '{service}'");
            GatewayError::CircuitOpen(format!(
                "Circuit breaker is open for service '{service}'"
            ))
        })
    }

    /// Reports the outcome of a call admitted by [`Self::acquire`].
    pub async fn record(&self, service: &str, admission: Admission, success: bool) -> GatewayResult<()> {
        self.record_at(service, admission, success, unix_now()).await
    }

    pub async fn record_at(
        &self,
        service: &str,
        admission: Admission,
        success: bool,
        now: f64,
    ) -> GatewayResult<()> {
        let key = breaker_key(service);
        let config = self.config;

        let transition = update_json(self.store.as_ref(), &key, |record: Option<BreakerRecord>| {
            let mut record = record.unwrap_or_default();
            let transition = apply_outcome(&mut record, &config, admission, success, now);
            (record, transition)
        })
        .await?;

        if let Some(state) = transition {
            self.on_transition(service, state);
        }
        Ok(())
    }

    /// Runs `call` under the breaker, counting upstream failures.
    pub async fn call<F, Fut, T>(&self, service: &str, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        self.call_at(service, unix_now(), call).await
    }

    pub async fn call_at<F, Fut, T>(&self, service: &str, now: f64, call: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<T>>,
    {
        let admission = self.acquire_at(service, now).await?;
        let result = call().await;
        let success = !matches!(&result, Err(e) if e.is_upstream_failure());
        self.record_at(service, admission, success, now).await?;
        result
    }

    pub async fn status(&self, service: &str) -> GatewayResult<BreakerStatus> {
        self.status_at(service, unix_now()).await
    }

    pub async fn status_at(&self, service: &str, now: f64) -> GatewayResult<BreakerStatus> {
        let record: BreakerRecord = read_json(self.store.as_ref(), &breaker_key(service))
            .await?
            .unwrap_or_default();

        let next_attempt = match record.state {
            CircuitState::Open => record.opened_at.map(|opened| opened + self.cooldown()),
            _ => None,
        };

        // an open breaker past its cooldown will admit a probe on the next call
        let state = match next_attempt {
            Some(at) if now >= at => CircuitState::HalfOpen,
            _ => record.state,
        };

        Ok(BreakerStatus {
            service: service.to_string(),
            state,
            failure_count: record.failure_count,
            success_count: record.success_count,
            last_failure: record.last_failure_at,
            next_attempt,
        })
    }

    fn on_transition(&self, service: &str, state: CircuitState) {
        match state {
            CircuitState::Open => log::warn!("Circuit breaker for '{service}' opened"),
            _ => log::info!("Circuit breaker for '{service}' is now {}", state.as_str()),
        }
        observability::record_transition(service, state);
    }
}

/// Applies one call outcome, returning the new state if it changed.
fn apply_outcome(
    record: &mut BreakerRecord,
    config: &config::CircuitBreaker,
    admission: Admission,
    success: bool,
    now: f64,
) -> Option<CircuitState> {
    match (record.state, admission) {
        (CircuitState::Closed, _) => {
            if success {
                record.failure_count = 0;
                record.window_started_at = None;
                record.success_count += 1;
                return None;
            }

            let window = config.failure_window_seconds as f64;
            if record
                .window_started_at
                .map_or(true, |started| now - started > window)
            {
                record.failure_count = 0;
                record.window_started_at = Some(now);
            }
            record.failure_count += 1;
            record.last_failure_at = Some(now);

            if record.failure_count >= config.failure_threshold {
                open(record, now);
                Some(CircuitState::Open)
            } else {
                None
            }
        }
        (CircuitState::HalfOpen, Admission::Probe) => {
            if success {
                *record = BreakerRecord::default();
                Some(CircuitState::Closed)
            } else {
                record.failure_count += 1;
                record.last_failure_at = Some(now);
                open(record, now);
                Some(CircuitState::Open)
            }
        }
        // results of calls admitted before the breaker opened
        _ => {
            if !success {
                record.last_failure_at = Some(now);
            }
            None
        }
    }
}

fn open(record: &mut BreakerRecord, now: f64) {
    record.state = CircuitState::Open;
    record.opened_at = Some(now);
    record.probe_started_at = None;
    record.window_started_at = None;
}

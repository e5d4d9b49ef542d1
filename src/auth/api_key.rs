use serde::{Deserialize, Serialize};

use crate::core::{
    store::{read_json, update_json},
    GatewayResult, StateStore,
};

/// Usage statistics kept in the state store, outside the key record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyUsage {
    pub usage_count: u64,
    pub last_used_at: Option<f64>,
}

fn usage_key(key_id: &str) -> String {
    format!("apikey:{key_id}:usage")
}

/// Counts one successful validation. Count and timestamp move together in a
/// single record; `last_used_at` never goes backwards.
pub(super) async fn record_use(
    store: &dyn StateStore,
    key_id: &str,
    now: f64,
) -> GatewayResult<ApiKeyUsage> {
    update_json(store, &usage_key(key_id), |usage: Option<ApiKeyUsage>| {
        let usage = usage.unwrap_or_default();
        let next = ApiKeyUsage {
            usage_count: usage.usage_count + 1,
            last_used_at: Some(usage.last_used_at.map_or(now, |last| last.max(now))),
        };
        (next.clone(), next)
    })
    .await
}

pub(super) async fn read_usage(store: &dyn StateStore, key_id: &str) -> GatewayResult<ApiKeyUsage> {
    Ok(read_json(store, &usage_key(key_id)).await?.unwrap_or_default())
}

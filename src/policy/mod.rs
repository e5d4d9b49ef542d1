//! Policy store
//!
//! Holds rate-limit policies, auth policies and API key records. Reads happen
//! on every request, writes only at startup and through the admin endpoints,
//! so plain DashMaps of `Arc`s are enough: a replaced policy is swapped in
//! whole and in-flight requests keep the version they already loaded.

use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use serde::Deserialize;
use validator::Validate;

use crate::{
    config::{self, ApiKey, ApiKeyStatus, AuthPolicy, RateLimitPolicy},
    core::{GatewayError, GatewayResult},
};

const API_KEY_PREFIX: &str = "pgk_";
const API_KEY_RANDOM_LEN: usize = 32;

pub trait Identifiable {
    fn id(&self) -> &str;
}

impl Identifiable for RateLimitPolicy {
    fn id(&self) -> &str {
        &self.policy_id
    }
}

impl Identifiable for AuthPolicy {
    fn id(&self) -> &str {
        &self.policy_id
    }
}

impl Identifiable for ApiKey {
    fn id(&self) -> &str {
        &self.key_id
    }
}

pub trait MapOperations<T> {
    fn reload_resource(&self, resources: Vec<Arc<T>>);

    fn insert_resource(&self, resource: Arc<T>);
}

impl<T> MapOperations<T> for DashMap<String, Arc<T>>
where
    T: Identifiable,
{
    /// Replaces the map contents, dropping entries absent from `resources`.
    fn reload_resource(&self, resources: Vec<Arc<T>>) {
        let resource_ids: HashSet<String> = resources.iter().map(|r| r.id().to_string()).collect();
        self.retain(|key, _| resource_ids.contains(key));

        for resource in resources {
            log::info!("Inserting/Updating resource: {}", resource.id());
            self.insert(resource.id().to_string(), resource);
        }
    }

    fn insert_resource(&self, resource: Arc<T>) {
        self.insert(resource.id().to_string(), resource);
    }
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.status == ApiKeyStatus::Revoked
    }

    pub fn is_expired_at(&self, now: f64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }
}

/// Body of `POST /auth/api-keys`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct IssueApiKey {
    #[validate(length(min = 1))]
    pub key_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub expires_at: Option<f64>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
}

#[derive(Default)]
pub struct PolicyStore {
    rate_limits: DashMap<String, Arc<RateLimitPolicy>>,
    auth: DashMap<String, Arc<AuthPolicy>>,
    /// Keyed by key id
    api_keys: DashMap<String, Arc<ApiKey>>,
    /// Secret to key id
    secrets: DashMap<String, String>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every policy and key from configuration.
    pub fn from_config(config: &config::Config) -> GatewayResult<Self> {
        let store = Self::new();

        store.rate_limits.reload_resource(
            config
                .effective_rate_limit_policies()
                .into_iter()
                .map(Arc::new)
                .collect(),
        );
        store
            .auth
            .reload_resource(config.auth_policies.iter().cloned().map(Arc::new).collect());

        for key in &config.api_keys {
            store.insert_api_key(key.clone())?;
        }

        Ok(store)
    }

    pub fn rate_limit_policy(&self, policy_id: &str) -> Option<Arc<RateLimitPolicy>> {
        self.rate_limits.get(policy_id).map(|p| p.value().clone())
    }

    /// Creates or replaces a rate-limit policy.
    pub fn put_rate_limit_policy(
        &self,
        policy: RateLimitPolicy,
    ) -> GatewayResult<Arc<RateLimitPolicy>> {
        policy
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let policy = Arc::new(policy);
        log::info!("Rate limit policy '{}' stored", policy.policy_id);
        self.rate_limits.insert_resource(policy.clone());
        Ok(policy)
    }

    pub fn rate_limit_policy_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rate_limits.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn auth_policy(&self, policy_id: &str) -> Option<Arc<AuthPolicy>> {
        self.auth.get(policy_id).map(|p| p.value().clone())
    }

    /// Creates or replaces an auth policy. Key material is checked by the
    /// auth engine before the policy reaches this store.
    pub fn put_auth_policy(&self, policy: AuthPolicy) -> GatewayResult<Arc<AuthPolicy>> {
        policy
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let policy = Arc::new(policy);
        log::info!("Auth policy '{}' stored", policy.policy_id);
        self.auth.insert_resource(policy.clone());
        Ok(policy)
    }

    pub fn auth_policies(&self) -> Vec<Arc<AuthPolicy>> {
        self.auth.iter().map(|e| e.value().clone()).collect()
    }

    /// Looks an API key up by its secret value.
    pub fn api_key(&self, secret: &str) -> Option<Arc<ApiKey>> {
        let key_id = self.secrets.get(secret)?;
        self.api_keys.get(key_id.value()).map(|k| k.value().clone())
    }

    pub fn api_key_by_id(&self, key_id: &str) -> Option<Arc<ApiKey>> {
        self.api_keys.get(key_id).map(|k| k.value().clone())
    }

    pub fn insert_api_key(&self, key: ApiKey) -> GatewayResult<Arc<ApiKey>> {
        key.validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        if self.api_keys.contains_key(&key.key_id) {
            return Err(GatewayError::Validation(format!(
                "API key id '{}' already exists",
                key.key_id
            )));
        }
        if self.secrets.contains_key(&key.api_key) {
            return Err(GatewayError::Validation(
                "API key value already in use".to_string(),
            ));
        }

        let key = Arc::new(key);
        self.secrets.insert(key.api_key.clone(), key.key_id.clone());
        self.api_keys.insert_resource(key.clone());
        Ok(key)
    }

    /// Issues a fresh key with a random secret.
    pub fn issue_api_key(&self, request: IssueApiKey) -> GatewayResult<Arc<ApiKey>> {
        request
            .validate()
            .map_err(|e| GatewayError::Validation(e.to_string()))?;

        let key_id = request
            .key_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        self.insert_api_key(ApiKey {
            key_id,
            api_key: generate_secret(),
            scopes: request.scopes,
            roles: request.roles,
            status: ApiKeyStatus::Active,
            expires_at: request.expires_at,
            user_id: request.user_id,
            tenant_id: request.tenant_id,
        })
    }

    /// Revokes a key. Revocation is terminal.
    pub fn revoke_api_key(&self, key_id: &str) -> GatewayResult<Arc<ApiKey>> {
        let mut entry = self
            .api_keys
            .get_mut(key_id)
            .ok_or_else(|| GatewayError::Routing(format!("Unknown API key '{key_id}'")))?;

        if !entry.is_revoked() {
            let mut revoked = ApiKey::clone(entry.value());
            revoked.status = ApiKeyStatus::Revoked;
            *entry.value_mut() = Arc::new(revoked);
            log::info!("API key '{key_id}' revoked");
        }

        Ok(entry.value().clone())
    }
}

fn generate_secret() -> String {
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(API_KEY_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("{API_KEY_PREFIX}{random}")
}

//! Authentication engine
//!
//! Validates the credential a policy asks for and returns an [`AuthResult`].
//! JWT policies are compiled into a [`JwtVerifier`] when they are registered,
//! so a policy with missing key material is refused up front rather than on
//! the first request.

mod api_key;
mod jwt;

use std::sync::Arc;

use dashmap::DashMap;
use http::HeaderMap;
use serde::Serialize;

use crate::{
    config::{ApiKey, AuthPolicy, AuthType, JwtDefaults},
    core::{unix_now, GatewayError, GatewayResult, StateStore},
    policy::PolicyStore,
    utils::request::{get_bearer_token, get_header_value, get_query_value},
};

pub use api_key::ApiKeyUsage;
pub use jwt::{Claims, JwtVerifier};

/// Identity established for a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthResult {
    pub auth_type: AuthType,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    pub scopes: Vec<String>,
    pub roles: Vec<String>,
}

pub struct AuthEngine {
    policies: Arc<PolicyStore>,
    store: Arc<dyn StateStore>,
    jwt_defaults: JwtDefaults,
    verifiers: DashMap<String, Arc<JwtVerifier>>,
}

impl AuthEngine {
    pub fn new(
        policies: Arc<PolicyStore>,
        store: Arc<dyn StateStore>,
        jwt_defaults: JwtDefaults,
    ) -> Self {
        Self {
            policies,
            store,
            jwt_defaults,
            verifiers: DashMap::new(),
        }
    }

    /// Compiles every policy already in the store. Fails on the first
    /// policy that cannot be used.
    pub fn compile_all(&self) -> GatewayResult<()> {
        for policy in self.policies.auth_policies() {
            self.compile(&policy)?;
        }
        Ok(())
    }

    fn compile(&self, policy: &AuthPolicy) -> GatewayResult<()> {
        if policy.auth_type == AuthType::Jwt {
            let verifier = JwtVerifier::from_policy(policy, &self.jwt_defaults)?;
            self.verifiers
                .insert(policy.policy_id.clone(), Arc::new(verifier));
        } else {
            self.verifiers.remove(&policy.policy_id);
        }
        Ok(())
    }

    /// Validates, compiles and stores a policy.
    pub fn register_policy(&self, policy: AuthPolicy) -> GatewayResult<Arc<AuthPolicy>> {
        // compile first so a broken policy never replaces a working one
        if policy.auth_type == AuthType::Jwt {
            JwtVerifier::from_policy(&policy, &self.jwt_defaults)?;
        }
        let policy = self.policies.put_auth_policy(policy)?;
        self.compile(&policy)?;
        Ok(policy)
    }

    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        policy_id: &str,
    ) -> GatewayResult<AuthResult> {
        self.authenticate_at(headers, query, policy_id, unix_now())
            .await
    }

    pub async fn authenticate_at(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        policy_id: &str,
        now: f64,
    ) -> GatewayResult<AuthResult> {
        let policy = self.policies.auth_policy(policy_id).ok_or_else(|| {
            GatewayError::Configuration(format!("Unknown auth policy '{policy_id}'"))
        })?;

        match policy.auth_type {
            AuthType::Jwt => self.authenticate_jwt(&policy, headers),
            AuthType::ApiKey => self.authenticate_api_key(&policy, headers, query, now).await,
            AuthType::Oauth2 => authenticate_oauth2(headers),
        }
    }

    fn verifier(&self, policy: &AuthPolicy) -> GatewayResult<Arc<JwtVerifier>> {
        if let Some(verifier) = self.verifiers.get(&policy.policy_id) {
            return Ok(verifier.value().clone());
        }

        // policy inserted into the store directly, compile on first use
        self.compile(policy)?;
        self.verifiers
            .get(&policy.policy_id)
            .map(|v| v.value().clone())
            .ok_or_else(|| {
                GatewayError::Configuration(format!(
                    "Auth policy '{}' has no verifier",
                    policy.policy_id
                ))
            })
    }

    fn authenticate_jwt(&self, policy: &AuthPolicy, headers: &HeaderMap) -> GatewayResult<AuthResult> {
        let token = get_bearer_token(headers).ok_or_else(|| {
            GatewayError::Authentication("Bearer token required".to_string())
        })?;

        let claims = self.verifier(policy)?.verify(token)?;
        let scopes = claims.all_scopes();
        require_scopes(policy, &scopes)?;
        require_roles(policy, &claims.roles)?;

        Ok(AuthResult {
            auth_type: AuthType::Jwt,
            user_id: claims.user_id.or(claims.sub),
            tenant_id: claims.tenant_id,
            scopes,
            roles: claims.roles,
        })
    }

    async fn authenticate_api_key(
        &self,
        policy: &AuthPolicy,
        headers: &HeaderMap,
        query: Option<&str>,
        now: f64,
    ) -> GatewayResult<AuthResult> {
        let key = self.lookup_api_key(policy, headers, query, now)?;
        require_scopes(policy, &key.scopes)?;
        require_roles(policy, &key.roles)?;

        api_key::record_use(self.store.as_ref(), &key.key_id, now).await?;

        Ok(AuthResult {
            auth_type: AuthType::ApiKey,
            user_id: Some(key.user_id.clone().unwrap_or_else(|| key.key_id.clone())),
            tenant_id: key.tenant_id.clone(),
            scopes: key.scopes.clone(),
            roles: key.roles.clone(),
        })
    }

    fn lookup_api_key(
        &self,
        policy: &AuthPolicy,
        headers: &HeaderMap,
        query: Option<&str>,
        now: f64,
    ) -> GatewayResult<Arc<ApiKey>> {
        let presented = get_header_value(headers, &policy.api_key_header)
            .or_else(|| {
                policy
                    .api_key_query_param
                    .as_deref()
                    .and_then(|param| get_query_value(query, param))
            })
            .filter(|key| !key.is_empty())
            .ok_or_else(|| GatewayError::Authentication("API key required".to_string()))?;

        // unknown, revoked and expired keys are indistinguishable to the caller
        let invalid = || GatewayError::Authentication("Invalid API key".to_string());
        let key = self.policies.api_key(presented).ok_or_else(invalid)?;
        if key.is_revoked() || key.is_expired_at(now) {
            log::debug!("API key '{}' rejected: revoked or expired", key.key_id);
            return Err(invalid());
        }
        Ok(key)
    }

    /// Verified principal behind a request's credential, without recording
    /// usage or enforcing scopes. `None` when the credential is missing or
    /// does not verify; OAuth2 tokens are never verified here.
    pub fn identify_at(
        &self,
        headers: &HeaderMap,
        query: Option<&str>,
        policy_id: &str,
        now: f64,
    ) -> Option<String> {
        let policy = self.policies.auth_policy(policy_id)?;
        match policy.auth_type {
            AuthType::Jwt => {
                let token = get_bearer_token(headers)?;
                let claims = self.verifier(&policy).ok()?.verify(token).ok()?;
                claims.user_id.or(claims.sub)
            }
            AuthType::ApiKey => {
                let key = self.lookup_api_key(&policy, headers, query, now).ok()?;
                Some(key.user_id.clone().unwrap_or_else(|| key.key_id.clone()))
            }
            AuthType::Oauth2 => None,
        }
    }

    pub async fn api_key_usage(&self, key_id: &str) -> GatewayResult<ApiKeyUsage> {
        api_key::read_usage(self.store.as_ref(), key_id).await
    }
}

/// Token presence only; provider validation is not performed.
fn authenticate_oauth2(headers: &HeaderMap) -> GatewayResult<AuthResult> {
    get_bearer_token(headers)
        .ok_or_else(|| GatewayError::Authentication("Bearer token required".to_string()))?;

    Ok(AuthResult {
        auth_type: AuthType::Oauth2,
        user_id: None,
        tenant_id: None,
        scopes: Vec::new(),
        roles: Vec::new(),
    })
}

fn require_scopes(policy: &AuthPolicy, granted: &[String]) -> GatewayResult<()> {
    match policy
        .required_scopes
        .iter()
        .find(|scope| !granted.contains(scope))
    {
        Some(missing) => Err(GatewayError::Authorization(format!(
            "Missing required scope: {missing}"
        ))),
        None => Ok(()),
    }
}

fn require_roles(policy: &AuthPolicy, granted: &[String]) -> GatewayResult<()> {
    if policy.required_roles.is_empty()
        || policy.required_roles.iter().any(|role| granted.contains(role))
    {
        Ok(())
    } else {
        Err(GatewayError::Authorization(
            "Missing required role".to_string(),
        ))
    }
}

use base64::{engine::general_purpose, Engine as _};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    config::{AuthPolicy, JwtDefaults},
    core::{GatewayError, GatewayResult},
};

/// Claims the gateway reads from a verified token.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub user_id: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// OAuth2 style space separated scopes, merged into `scopes`
    pub scope: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Claims {
    pub fn all_scopes(&self) -> Vec<String> {
        let mut scopes = self.scopes.clone();
        if let Some(scope) = &self.scope {
            scopes.extend(scope.split_whitespace().map(String::from));
        }
        scopes
    }
}

/// Decoding key and validation rules compiled from one JWT policy.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Fails with `Configuration` when the policy has no usable key material.
    pub fn from_policy(policy: &AuthPolicy, defaults: &JwtDefaults) -> GatewayResult<Self> {
        let algorithm = policy.jwt_algorithm.unwrap_or(defaults.algorithm);
        let decoding_key = decoding_key(policy, defaults, algorithm).map_err(|e| {
            GatewayError::Configuration(format!(
                "Auth policy '{}': {e}",
                policy.policy_id
            ))
        })?;

        let mut validation = Validation::new(algorithm);
        validation.leeway = policy.jwt_leeway_seconds;
        if let Some(issuer) = &policy.jwt_issuer {
            validation.set_issuer(&[issuer]);
        }
        match &policy.jwt_audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    pub fn verify(&self, token: &str) -> GatewayResult<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => {
                    GatewayError::Authentication("Token has expired".to_string())
                }
                _ => {
                    log::debug!("JWT rejected: {e}");
                    GatewayError::Authentication("Invalid token".to_string())
                }
            })
    }
}

fn decoding_key(
    policy: &AuthPolicy,
    defaults: &JwtDefaults,
    algorithm: Algorithm,
) -> Result<DecodingKey, &'static str> {
    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            let secret = policy
                .jwt_secret_key
                .as_ref()
                .or(defaults.secret_key.as_ref())
                .filter(|s| !s.is_empty())
                .ok_or("missing secret")?;
            let key: Vec<u8> = if policy.base64_secret {
                general_purpose::STANDARD
                    .decode(secret)
                    .map_err(|_| "invalid base64")?
            } else {
                secret.as_bytes().to_vec()
            };
            Ok(DecodingKey::from_secret(&key))
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => {
            let pem = policy.jwt_public_key.as_ref().ok_or("missing public key")?;
            DecodingKey::from_rsa_pem(pem.as_bytes()).map_err(|_| "bad rsa pem")
        }
        Algorithm::ES256 | Algorithm::ES384 => {
            let pem = policy.jwt_public_key.as_ref().ok_or("missing public key")?;
            DecodingKey::from_ec_pem(pem.as_bytes()).map_err(|_| "bad ec pem")
        }
        Algorithm::EdDSA => {
            let pem = policy.jwt_public_key.as_ref().ok_or("missing public key")?;
            DecodingKey::from_ed_pem(pem.as_bytes()).map_err(|_| "bad ed25519 pem")
        }
    }
}

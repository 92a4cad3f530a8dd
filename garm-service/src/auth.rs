use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use garm_common::model::{Entity, ForgeType, Instance, InstanceStatus};
use garm_service_base::store::Store;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use poem::{Endpoint, Middleware, Request};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;

pub const TOKEN_ISSUER: &str = "garm";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("internal auth error: {0}")]
    Internal(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserClaims {
    pub user: String,
    pub token_id: String,
    pub is_admin: bool,
    /// Bumped on password reset; stale generations are rejected.
    pub generation: u64,
    pub exp: u64,
    pub iss: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstanceClaims {
    pub instance_id: String,
    pub instance_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_id: Option<String>,
    pub scope: TokenScope,
    pub entity_id: String,
    pub forge_type: ForgeType,
    pub is_agent: bool,
    pub create_attempt: u32,
    pub exp: u64,
    pub iss: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenScope {
    Pool,
    ScaleSet,
}

/// Issues and validates the deployment's HS256 credentials: user session
/// tokens and per-instance agent tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    user_token_ttl: Duration,
    instance_token_ttl: Duration,
    store: Store,
}

impl TokenService {
    pub fn new(config: &JwtConfig, store: Store) -> Self {
        Self {
            encoding_key: Arc::new(EncodingKey::from_secret(config.secret.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(config.secret.as_bytes())),
            user_token_ttl: config.user_token_ttl,
            instance_token_ttl: config.instance_token_ttl,
            store,
        }
    }

    pub fn issue_user_token(
        &self,
        user: &str,
        token_id: &str,
        is_admin: bool,
        generation: u64,
    ) -> Result<String, AuthError> {
        let claims = UserClaims {
            user: user.to_string(),
            token_id: token_id.to_string(),
            is_admin,
            generation,
            exp: expiry(self.user_token_ttl),
            iss: TOKEN_ISSUER.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// `current_generation` is the user's live generation; a password reset
    /// bumps it and invalidates every outstanding token.
    pub fn verify_user_token(
        &self,
        token: &str,
        current_generation: u64,
    ) -> Result<UserClaims, AuthError> {
        let claims: UserClaims = self.decode_claims(token)?;
        if claims.generation != current_generation {
            return Err(AuthError::Unauthorized(
                "token generation is stale".to_string(),
            ));
        }
        Ok(claims)
    }

    pub fn issue_instance_token(
        &self,
        instance: &Instance,
        entity: &Entity,
        forge_type: ForgeType,
    ) -> Result<String, AuthError> {
        let (scope, pool_id) = match (&instance.pool_id, &instance.scale_set_id) {
            (Some(pool_id), None) => (TokenScope::Pool, Some(pool_id.to_string())),
            (None, Some(scale_set_id)) => (TokenScope::ScaleSet, Some(scale_set_id.to_string())),
            _ => {
                return Err(AuthError::Internal(format!(
                    "instance {} has no single owner",
                    instance.name
                )))
            }
        };
        let claims = InstanceClaims {
            instance_id: instance.id.to_string(),
            instance_name: instance.name.clone(),
            pool_id,
            scope,
            entity_id: entity.id.to_string(),
            forge_type,
            is_agent: true,
            create_attempt: instance.create_attempt,
            exp: expiry(self.instance_token_ttl),
            iss: TOKEN_ISSUER.to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Full freshness check for an agent credential. Returns the live
    /// instance so handlers never have to trust the claims themselves.
    pub async fn verify_instance_token(&self, token: &str) -> Result<Instance, AuthError> {
        let claims: InstanceClaims = self.decode_claims(token)?;
        if !claims.is_agent {
            return Err(AuthError::Unauthorized("not an agent token".to_string()));
        }

        let instance = self
            .store
            .get_instance_by_name(&claims.instance_name)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or_else(|| {
                AuthError::Unauthorized(format!(
                    "instance {} no longer exists",
                    claims.instance_name
                ))
            })?;

        check_instance_freshness(&claims, &instance)?;
        Ok(instance)
    }

    fn decode_claims<T: serde::de::DeserializeOwned>(&self, token: &str) -> Result<T, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[TOKEN_ISSUER]);
        decode::<T>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::Unauthorized(e.to_string()))
    }
}

/// The stateless part of agent token verification.
pub fn check_instance_freshness(
    claims: &InstanceClaims,
    instance: &Instance,
) -> Result<(), AuthError> {
    if claims.create_attempt != instance.create_attempt {
        return Err(AuthError::Unauthorized(format!(
            "token was issued for create attempt {}, instance is at {}",
            claims.create_attempt, instance.create_attempt
        )));
    }
    if instance.status != InstanceStatus::Running {
        return Err(AuthError::Unauthorized(format!(
            "instance {} is not running (status: {})",
            instance.name, instance.status
        )));
    }
    if instance.runner_status.refuses_credentials() {
        return Err(AuthError::Unauthorized(format!(
            "instance {} no longer accepts agent credentials (runner status: {})",
            instance.name, instance.runner_status
        )));
    }
    Ok(())
}

/// The instance resolved by the auth middleware, available to handlers via
/// request data.
#[derive(Clone, Debug)]
pub struct AuthenticatedInstance(pub Instance);

pub struct InstanceAuthMiddleware {
    token_service: Arc<TokenService>,
}

impl InstanceAuthMiddleware {
    pub fn new(token_service: Arc<TokenService>) -> Self {
        Self { token_service }
    }
}

impl<E: Endpoint> Middleware<E> for InstanceAuthMiddleware {
    type Output = InstanceAuthMiddlewareImpl<E>;

    fn transform(&self, ep: E) -> Self::Output {
        InstanceAuthMiddlewareImpl {
            ep,
            token_service: self.token_service.clone(),
        }
    }
}

pub struct InstanceAuthMiddlewareImpl<E> {
    ep: E,
    token_service: Arc<TokenService>,
}

impl<E: Endpoint> Endpoint for InstanceAuthMiddlewareImpl<E> {
    type Output = E::Output;

    async fn call(&self, mut req: Request) -> poem::Result<Self::Output> {
        let token = bearer_token(&req).ok_or_else(|| {
            poem::Error::from_string("missing bearer token", http::StatusCode::UNAUTHORIZED)
        })?;

        let instance = self
            .token_service
            .verify_instance_token(&token)
            .await
            .map_err(|e| match e {
                AuthError::Unauthorized(message) => {
                    poem::Error::from_string(message, http::StatusCode::UNAUTHORIZED)
                }
                AuthError::Internal(message) => {
                    poem::Error::from_string(message, http::StatusCode::INTERNAL_SERVER_ERROR)
                }
            })?;

        req.extensions_mut().insert(AuthenticatedInstance(instance));
        self.ep.call(req).await
    }
}

fn bearer_token(req: &Request) -> Option<String> {
    let header = req.headers().get(http::header::AUTHORIZATION)?;
    let value = header.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.to_string())
}

fn expiry(ttl: Duration) -> u64 {
    (Utc::now().timestamp() as u64).saturating_add(ttl.as_secs())
}

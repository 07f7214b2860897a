use std::sync::Arc;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
    RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use casbin::{CoreApi, Enforcer};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::Modify;

use crate::error::ApiError;
use crate::model::{Role, UserProfile};

pub const BEARER_SCHEME: &str = "bearer_jwt";

pub struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_hours: i64,
}

impl Keys {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_hours,
        }
    }

    /// Signs a session token for `user`.
    pub fn issue(&self, user: &UserProfile) -> Result<String, ApiError> {
        let exp = Utc::now()
            .checked_add_signed(TimeDelta::hours(self.ttl_hours))
            .ok_or(ApiError::TokenCreation)?
            .timestamp();
        let claims = Claims {
            sub: user.email.clone(),
            user_id: user.user_id,
            account_number: user.account_number.clone(),
            role: user.role,
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|_| ApiError::TokenCreation)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

/// Session carried by the bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: i32,
    pub account_number: Option<String>,
    pub role: Role,
    pub exp: i64,
}

impl Claims {
    /// Checks `(role, object, action)` against the access policy.
    pub fn authorize(&self, enforcer: &Enforcer, object: &str, action: &str) -> Result<(), ApiError> {
        if enforcer
            .enforce((self.role.as_str(), object, action))
            .unwrap_or_default()
        {
            Ok(())
        } else {
            tracing::debug!(
                "{} ({}) denied {} on {}",
                self.sub,
                self.role,
                action,
                object
            );
            Err(ApiError::PermissionDenied)
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Claims
where
    Arc<Keys>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        // Extract the token from the authorization header
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| ApiError::MissingCredentials)?;
        Arc::<Keys>::from_ref(state).verify(bearer.token())
    }
}

pub fn hash_password(password: &str) -> Result<String, ApiError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| {
            tracing::debug!("hash_password: {}", e);
            ApiError::PasswordHash
        })
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    PasswordHash::new(stored)
        .map(|hash| {
            Argon2::default()
                .verify_password(password.as_bytes(), &hash)
                .is_ok()
        })
        .unwrap_or(false)
}

pub struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                BEARER_SCHEME,
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

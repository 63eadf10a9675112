//! HS256 session and scoped tokens.

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use keystone_core::models::UserType;
use keystone_core::{AppError, AuthSettings};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Gates which endpoints accept a token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    ResetPassword,
    RentalApplicationView,
    GuestPatient,
    CustomerOnboarding,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenClaims {
    pub sub: Uuid,
    pub tenant: Uuid,
    pub sub_token_type: TokenType,
    pub user_type: UserType,
    pub jti: String,
    pub exp: i64,
    pub iat: i64,
}

impl TokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub jti: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    settings: AuthSettings,
}

impl TokenService {
    pub fn new(settings: AuthSettings) -> Self {
        Self {
            encoding: EncodingKey::from_secret(settings.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.jwt_secret.as_bytes()),
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    fn ttl(&self, token_type: TokenType) -> Duration {
        let seconds = match token_type {
            TokenType::Access => self.settings.access_token_ttl_seconds,
            TokenType::Refresh => self.settings.refresh_token_ttl_seconds,
            _ => self.settings.reset_token_ttl_seconds,
        };
        Duration::seconds(seconds)
    }

    /// Sign a token. A jti is generated unless one is given.
    pub fn issue(
        &self,
        tenant_id: Uuid,
        user_id: Uuid,
        user_type: UserType,
        token_type: TokenType,
        jti: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<IssuedToken, AppError> {
        let expires_at = now + self.ttl(token_type);
        let claims = TokenClaims {
            sub: user_id,
            tenant: tenant_id,
            sub_token_type: token_type,
            user_type,
            jti: jti.unwrap_or_else(|| Uuid::new_v4().to_string()),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::Internal(format!("Failed to sign token: {}", e)))?;
        Ok(IssuedToken {
            token,
            jti: claims.jti,
            expires_at,
        })
    }

    /// Decode and check signature, expiry and the expected token type.
    pub fn decode(&self, token: &str, expected: TokenType) -> Result<TokenClaims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<TokenClaims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!("JWT validation failed: {}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AppError::Unauthorized("Token has expired".to_string())
                }
                _ => AppError::Unauthorized("Invalid token".to_string()),
            }
        })?;

        if data.claims.sub_token_type != expected {
            return Err(AppError::Unauthorized(format!(
                "{:?} token not accepted here",
                data.claims.sub_token_type
            )));
        }
        Ok(data.claims)
    }
}

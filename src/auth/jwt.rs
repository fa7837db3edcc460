use crate::config::JwtConfig;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{Authenticator, Principal};

/// JWT claims issued by the authentication service
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Primary role
    #[serde(default = "default_role")]
    pub role: String,
    /// Granted permissions
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Identity verified
    #[serde(default)]
    pub verified: bool,
    /// Account flagged for review
    #[serde(default)]
    pub flagged: bool,
    /// Issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
    /// Issued at (Unix timestamp)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<usize>,
}

fn default_role() -> String {
    "user".to_string()
}

/// Bearer-token authenticator
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    /// Create a new JWT authenticator from configuration
    pub fn new(config: &JwtConfig) -> Result<Self> {
        let algorithm = Self::parse_algorithm(&config.algorithm)?;

        let decoding_key = match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config.secret.as_ref().ok_or_else(|| {
                    GatewayError::Config(
                        "JWT secret is required for HS256/HS384/HS512 algorithms".to_string(),
                    )
                })?;
                DecodingKey::from_secret(secret.as_bytes())
            }
            _ => {
                let public_key = config.public_key.as_ref().ok_or_else(|| {
                    GatewayError::Config(
                        "JWT public key is required for RS256/RS384/RS512 algorithms".to_string(),
                    )
                })?;
                DecodingKey::from_rsa_pem(public_key.as_bytes()).map_err(|e| {
                    GatewayError::Config(format!("Invalid RSA public key: {}", e))
                })?
            }
        };

        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;

        if let Some(issuer) = &config.issuer {
            validation.set_issuer(&[issuer]);
        }

        match &config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            decoding_key,
            validation,
        })
    }

    /// Extract JWT token from Authorization header
    fn extract_token(headers: &HeaderMap) -> Result<&str> {
        let auth_header = headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or(GatewayError::MissingCredentials)?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| GatewayError::InvalidToken("Invalid authorization header".to_string()))?;

        auth_str
            .strip_prefix("Bearer ")
            .or_else(|| auth_str.strip_prefix("bearer "))
            .ok_or_else(|| {
                GatewayError::InvalidToken(
                    "Authorization header must start with 'Bearer '".to_string(),
                )
            })
    }

    /// Parse algorithm string to Algorithm enum
    fn parse_algorithm(algo: &str) -> Result<Algorithm> {
        match algo.to_uppercase().as_str() {
            "HS256" => Ok(Algorithm::HS256),
            "HS384" => Ok(Algorithm::HS384),
            "HS512" => Ok(Algorithm::HS512),
            "RS256" => Ok(Algorithm::RS256),
            "RS384" => Ok(Algorithm::RS384),
            "RS512" => Ok(Algorithm::RS512),
            _ => Err(GatewayError::Config(format!(
                "Unsupported algorithm: {}",
                algo
            ))),
        }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal> {
        let token = Self::extract_token(headers)?;

        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| GatewayError::InvalidToken(format!("Token validation failed: {}", e)))?
            .claims;

        Ok(Principal {
            id: claims.sub,
            role: claims.role,
            permissions: claims.permissions,
            verified: claims.verified,
            flagged: claims.flagged,
        })
    }
}

//! Resolves the endpoint identity of a connecting socket.
//!
//! Identity is issued elsewhere; the relay only reads it. With a configured
//! secret the `token` query parameter must be an HS256 JWT whose `sub` (or
//! legacy `id`) claim names the endpoint. Without one, `user_id`/`name` query
//! parameters are taken as given.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use lanline_proto::EndpointId;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub endpoint: EndpointId,
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub user_id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token does not name an endpoint")]
    MissingSubject,
}

#[derive(Clone)]
pub struct IdentityResolver {
    key: Option<DecodingKey>,
}

impl IdentityResolver {
    pub fn new(jwt_secret: Option<&str>) -> Self {
        Self {
            key: jwt_secret.map(|secret| DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    pub fn requires_token(&self) -> bool {
        self.key.is_some()
    }

    pub fn resolve(&self, params: &ConnectParams) -> Result<Identity, IdentityError> {
        match &self.key {
            Some(key) => {
                let token = params
                    .token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or(IdentityError::MissingCredentials)?;
                let data = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))?;
                let claims = data.claims;
                let subject = claims
                    .sub
                    .or(claims.id)
                    .filter(|s| !s.trim().is_empty())
                    .ok_or(IdentityError::MissingSubject)?;
                Ok(Identity {
                    endpoint: EndpointId::new(subject),
                    name: non_empty(claims.name),
                })
            }
            None => {
                let user_id = params
                    .user_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .ok_or(IdentityError::MissingCredentials)?;
                Ok(Identity {
                    endpoint: EndpointId::new(user_id),
                    name: non_empty(params.name.clone()),
                })
            }
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        name: &'a str,
        exp: u64,
    }

    fn token(secret: &str, sub: &str) -> String {
        let claims = TestClaims {
            sub,
            name: "Alice",
            exp: 4_102_444_800, // 2100-01-01
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test_timeout::timeout]
    fn open_mode_trusts_query_identity() {
        let resolver = IdentityResolver::new(None);
        let params = ConnectParams {
            user_id: Some(" alice ".into()),
            name: Some("".into()),
            ..Default::default()
        };
        let identity = resolver.resolve(&params).unwrap();
        assert_eq!(identity.endpoint.as_str(), "alice");
        assert_eq!(identity.name, None);
    }

    #[test_timeout::timeout]
    fn open_mode_requires_user_id() {
        let resolver = IdentityResolver::new(None);
        let err = resolver.resolve(&ConnectParams::default()).unwrap_err();
        assert!(matches!(err, IdentityError::MissingCredentials));
    }

    #[test_timeout::timeout]
    fn token_mode_reads_subject_and_name() {
        let resolver = IdentityResolver::new(Some("lan-secret"));
        let params = ConnectParams {
            token: Some(token("lan-secret", "u-42")),
            user_id: Some("spoofed".into()),
            ..Default::default()
        };
        let identity = resolver.resolve(&params).unwrap();
        assert_eq!(identity.endpoint.as_str(), "u-42");
        assert_eq!(identity.name.as_deref(), Some("Alice"));
    }

    #[test_timeout::timeout]
    fn token_mode_rejects_foreign_signature() {
        let resolver = IdentityResolver::new(Some("lan-secret"));
        let params = ConnectParams {
            token: Some(token("other-secret", "u-42")),
            ..Default::default()
        };
        assert!(matches!(
            resolver.resolve(&params),
            Err(IdentityError::InvalidToken(_))
        ));
    }
}

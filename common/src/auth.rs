use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Claims carried by the platform's bearer tokens (HS256, shared secret).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    pub sub: String,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: usize,
}

#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthClaims, AppError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        decode::<AuthClaims>(token, &self.key, &validation)
            .map(|data| data.claims)
            .map_err(|err| AppError::Auth(format!("invalid token: {err}")))
    }

    /// Extracts and verifies a `Bearer` token from an Authorization header
    /// value.
    pub fn verify_bearer(&self, header_value: &str) -> Result<AuthClaims, AppError> {
        let token = header_value
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Auth("missing bearer token".into()))?;
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(claims: &AuthClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims() -> AuthClaims {
        AuthClaims {
            sub: "user-1".into(),
            tenant_id: Some(Uuid::new_v4()),
            role: Some("authenticated".into()),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        }
    }

    #[test]
    fn verifies_round_trip() {
        let verifier = JwtVerifier::new("secret");
        let claims = claims();
        let token = token_for(&claims, "secret");
        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.sub, claims.sub);
        assert_eq!(verified.tenant_id, claims.tenant_id);
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for(&claims(), "other-secret");
        assert!(matches!(verifier.verify(&token), Err(AppError::Auth(_))));
    }

    #[test]
    fn bearer_prefix_is_required() {
        let verifier = JwtVerifier::new("secret");
        let token = token_for(&claims(), "secret");
        assert!(verifier.verify_bearer(&token).is_err());
        assert!(verifier
            .verify_bearer(&format!("Bearer {token}"))
            .is_ok());
    }
}

use anyhow::{Result, bail};
use chrono::{Duration, Utc};
use common::storage::ContentHash;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

const FILE_SCOPE: &str = "receipt-file";

/// Claims of a bearer token issued by the identity provider.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Owner ID
    pub exp: usize,  // Expiration timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Claims of a short-lived file download token.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileClaims {
    /// Content hash of the blob, hex encoded.
    pub sub: String,
    pub exp: usize,
    pub scope: String,
}

fn expiry(ttl: Duration) -> Result<usize> {
    let Some(at) = Utc::now().checked_add_signed(ttl) else {
        bail!("token lifetime out of range");
    };
    Ok(at.timestamp() as usize)
}

/// Sign a bearer token for an owner. The service only verifies these in production;
/// signing is used by tests and local tooling.
pub fn sign(owner_id: &str, secret: &str, issuer: Option<&str>, ttl: Duration) -> Result<String> {
    let claims = Claims {
        sub: owner_id.to_owned(),
        exp: expiry(ttl)?,
        iss: issuer.map(str::to_owned),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

/// Verify and decode a bearer token.
pub fn verify(token: &str, secret: &str, issuer: Option<&str>) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;

    if token_data.claims.sub.trim().is_empty() {
        bail!("token has an empty subject");
    }
    Ok(token_data.claims)
}

/// Sign a token granting read access to one blob for `ttl`.
pub fn sign_file_token(hash: &ContentHash, secret: &str, ttl: Duration) -> Result<String> {
    let claims = FileClaims {
        sub: hash.to_hex(),
        exp: expiry(ttl)?,
        scope: FILE_SCOPE.to_owned(),
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Verify a file token and return the blob it grants access to.
pub fn verify_file_token(token: &str, secret: &str) -> Result<ContentHash> {
    let token_data = decode::<FileClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;

    if token_data.claims.scope != FILE_SCOPE {
        bail!("token is not a file token");
    }
    Ok(ContentHash::from_hex(&token_data.claims.sub)?)
}

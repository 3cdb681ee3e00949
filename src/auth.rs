use actix_web::cookie::{time::Duration, Cookie, SameSite};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;

use crate::models::Claims;

/// Name of the cookie carrying the signed credential.
pub const TOKEN_COOKIE: &str = "token";

const TOKEN_TTL_HOURS: i64 = 24;

/// Sign the caller-supplied claims object with a 1-day expiry.
///
/// The body is trusted verbatim as the claims payload; only `exp` is added
/// here. Non-object payloads cannot carry an expiry and are rejected.
pub fn issue(claims: &Value, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let mut payload = match claims {
        Value::Object(map) => map.clone(),
        _ => return Err(jsonwebtoken::errors::ErrorKind::InvalidToken.into()),
    };

    let expiration = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::hours(TOKEN_TTL_HOURS))
        .expect("valid timestamp")
        .timestamp() as usize;
    payload.insert("exp".into(), Value::from(expiration));

    encode(
        &Header::default(),
        &payload,
        &EncodingKey::from_secret(secret.as_ref()),
    )
}

/// Check signature and expiry, returning the decoded identity claims.
pub fn verify(token: &str, secret: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &Validation::new(Algorithm::HS256),
    )
    .map(|data| data.claims)
}

/// Build the httpOnly session cookie holding the token.
///
/// Cross-site policy depends on the deployment environment: the deployed
/// front end lives on a different origin, so production needs
/// `Secure; SameSite=None`; local development stays on `Strict`.
pub fn session_cookie(token: String, production: bool) -> Cookie<'static> {
    Cookie::build(TOKEN_COOKIE, token)
        .path("/")
        .http_only(true)
        .secure(production)
        .same_site(if production {
            SameSite::None
        } else {
            SameSite::Strict
        })
        .max_age(Duration::hours(TOKEN_TTL_HOURS))
        .finish()
}

/// Build an expired cookie to clear the session. The token itself keeps its
/// own expiry; clearing the cookie does not revoke it.
pub fn clear_session_cookie(production: bool) -> Cookie<'static> {
    Cookie::build(TOKEN_COOKIE, "")
        .path("/")
        .http_only(true)
        .secure(production)
        .same_site(if production {
            SameSite::None
        } else {
            SameSite::Strict
        })
        .max_age(Duration::ZERO)
        .finish()
}

//! HTTP Basic authentication of callers.
//!
//! The middleware resolves credentials to a [`Caller`] and puts it in the
//! request extensions for `carebase-api`. A request without credentials
//! passes through anonymously; routes that need a caller refuse it there.

use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
  extract::{Request, State},
  http::{HeaderMap, HeaderValue, StatusCode, header},
  middleware::Next,
  response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use carebase_api::Caller;

use crate::{config::Account, error::Error};

/// The accounts accepted by this server instance.
#[derive(Clone, Default)]
pub struct AuthConfig {
  pub accounts: Vec<Account>,
}

/// Resolve the `Authorization` header. `Ok(None)` when there is none.
pub fn verify_auth(headers: &HeaderMap, config: &AuthConfig) -> Result<Option<Caller>, Error> {
  let Some(header_val) = headers.get(header::AUTHORIZATION) else {
    return Ok(None);
  };
  let header_val = header_val.to_str().map_err(|_| Error::Unauthorized)?;

  let encoded = header_val
    .strip_prefix("Basic ")
    .ok_or(Error::Unauthorized)?;

  let decoded = B64.decode(encoded).map_err(|_| Error::Unauthorized)?;
  let creds = std::str::from_utf8(&decoded).map_err(|_| Error::Unauthorized)?;

  let (username, password) = creds.split_once(':').ok_or(Error::Unauthorized)?;

  let account = config
    .accounts
    .iter()
    .find(|a| a.username == username)
    .ok_or(Error::Unauthorized)?;

  let parsed_hash = PasswordHash::new(&account.password_hash).map_err(|_| Error::Unauthorized)?;

  Argon2::default()
    .verify_password(password.as_bytes(), &parsed_hash)
    .map_err(|_| Error::Unauthorized)?;

  Ok(Some(Caller::new(account.party_id.clone(), account.role)))
}

/// Middleware for [`axum::middleware::from_fn_with_state`].
pub async fn authenticate(
  State(config): State<Arc<AuthConfig>>,
  mut req: Request,
  next: Next,
) -> Response {
  match verify_auth(req.headers(), &config) {
    Ok(Some(caller)) => {
      tracing::debug!(party = %caller.party_id, role = %caller.role, "authenticated");
      req.extensions_mut().insert(caller);
    }
    Ok(None) => {}
    Err(e) => return e.into_response(),
  }

  let mut res = next.run(req).await;
  if res.status() == StatusCode::UNAUTHORIZED {
    res
      .headers_mut()
      .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic realm=\"carebase\""));
  }
  res
}

#[cfg(test)]
mod tests {
  use argon2::{PasswordHasher, password_hash::SaltString};
  use axum::http::Request;
  use carebase_api::Role;
  use rand_core::OsRng;

  use super::*;

  fn make_config(password: &str) -> AuthConfig {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .unwrap()
      .to_string();

    AuthConfig {
      accounts: vec![Account {
        username:      "okafor".to_string(),
        password_hash: hash,
        role:          Role::Doctor,
        party_id:      "dr-okafor".to_string(),
      }],
    }
  }

  fn headers(value: &str) -> HeaderMap {
    let req = Request::builder()
      .header(header::AUTHORIZATION, value)
      .body(())
      .unwrap();
    req.headers().clone()
  }

  fn basic(user: &str, pass: &str) -> String {
    let encoded = B64.encode(format!("{user}:{pass}"));
    format!("Basic {encoded}")
  }

  #[test]
  fn correct_credentials_resolve_the_caller() {
    let config = make_config("secret");
    let caller = verify_auth(&headers(&basic("okafor", "secret")), &config).unwrap();
    assert_eq!(caller, Some(Caller::new("dr-okafor", Role::Doctor)));
  }

  #[test]
  fn wrong_password() {
    let config = make_config("secret");
    let result = verify_auth(&headers(&basic("okafor", "wrong")), &config);
    assert!(matches!(result, Err(Error::Unauthorized)));
  }

  #[test]
  fn unknown_user() {
    let config = make_config("secret");
    let result = verify_auth(&headers(&basic("mallory", "secret")), &config);
    assert!(matches!(result, Err(Error::Unauthorized)));
  }

  #[test]
  fn missing_header_is_anonymous() {
    let config = make_config("secret");
    assert!(matches!(verify_auth(&HeaderMap::new(), &config), Ok(None)));
  }

  #[test]
  fn invalid_base64() {
    let config = make_config("secret");
    let result = verify_auth(&headers("Basic !!!not-base64!!!"), &config);
    assert!(matches!(result, Err(Error::Unauthorized)));
  }
}

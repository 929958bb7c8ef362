//! Proxy authentication: credential parsing, the verifier capability, and
//! the gate the connection loop consults before dispatching a request.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header, HeaderValue, StatusCode};
use thiserror::Error;
use tracing::info;

use crate::proxy::{ProxyRequest, ProxyResponse};

mod cache;

pub use cache::VerdictCache;

/// Backend capability that checks a username/password pair. Injected into
/// the connection handler at construction so tests can supply their own.
pub trait Authenticator: Send + Sync {
    fn verify(&self, username: &str, password: &str) -> bool;
}

/// Verifier over a fixed user table, built from the configured user list.
#[derive(Debug, Default)]
pub struct StaticUserTable {
    users: HashMap<String, String>,
}

impl StaticUserTable {
    pub fn new(users: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            users: users.into_iter().collect(),
        }
    }
}

impl Authenticator for StaticUserTable {
    fn verify(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("credential is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("credential is missing the ':' separator")]
    MissingSeparator,
}

/// Extract the Basic credential payload from a request, if it carries one.
/// The payload doubles as the verdict cache key.
pub fn parse_proxy_authorization(request: &ProxyRequest) -> Option<&str> {
    let value = request
        .headers
        .get(header::PROXY_AUTHORIZATION)?
        .to_str()
        .ok()?;
    value.strip_prefix("Basic ").map(str::trim)
}

/// Decode a Basic credential payload into its username/password pair.
pub fn decode_credential(credential: &str) -> Result<(String, String), CredentialError> {
    let decoded = String::from_utf8(STANDARD.decode(credential)?)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(CredentialError::MissingSeparator)?;
    Ok((username.to_string(), password.to_string()))
}

fn proxy_auth_required() -> ProxyResponse {
    let mut response = ProxyResponse::with_status(StatusCode::PROXY_AUTHENTICATION_REQUIRED);
    response
        .headers
        .insert(header::PROXY_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}

/// Decides whether a request is trusted, memoizing verdicts per credential.
pub struct AuthGate {
    verifier: Arc<dyn Authenticator>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn Authenticator>) -> Self {
        Self { verifier }
    }

    /// `None` means trusted; otherwise the denial response to write back.
    ///
    /// Verdicts are cached under the credential for a minute, failures
    /// included, so repeated bad attempts do not hammer the backend.
    pub fn authenticate(
        &self,
        request: &ProxyRequest,
        cache: &VerdictCache,
    ) -> Option<ProxyResponse> {
        let Some(credential) = parse_proxy_authorization(request) else {
            return Some(proxy_auth_required());
        };

        let verdict = match cache.get(credential) {
            Some(verdict) => verdict,
            None => {
                // Undecodable credentials fail closed.
                let verdict = match decode_credential(credential) {
                    Ok((username, password)) => self.verifier.verify(&username, &password),
                    Err(_) => false,
                };
                cache.put(credential.to_string(), verdict);
                verdict
            }
        };

        if verdict {
            None
        } else {
            info!(peer = ?request.remote_addr, "proxy authentication failed");
            Some(ProxyResponse::with_status(StatusCode::FORBIDDEN))
        }
    }
}

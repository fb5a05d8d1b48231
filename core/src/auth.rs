//! Token exchange against the identity service and one-shot re-authentication.
//!
//! # Design
//! The current token lives in a versioned `Credentials` snapshot. Readers
//! clone the `Arc` and build their request headers from it, so a concurrent
//! refresh never tears the header set. Writers serialize on `writer`; a
//! refresh triggered by a 401 is skipped when another caller has already
//! replaced the snapshot the failed request was built from.
//!
//! A request rejected with 401 is retried exactly once. A second rejection is
//! returned to the caller: expired tokens and revoked credentials look the
//! same on the wire, and only the first can be fixed by retrying.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{OrionError, Result};
use crate::http::HttpRequest;
use crate::session::{Fetched, Session, Transport};

pub const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";
pub const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
pub const SERVICE_HEADER: &str = "Fiware-Service";
pub const SERVICE_PATH_HEADER: &str = "Fiware-ServicePath";

/// A token together with the tenant routing it was issued for.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    token: String,
    service: String,
    subservice: String,
    version: u64,
}

impl Credentials {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Incremented on every successful token exchange.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        vec![
            (SERVICE_HEADER.to_string(), self.service.clone()),
            (SERVICE_PATH_HEADER.to_string(), self.subservice.clone()),
            (AUTH_TOKEN_HEADER.to_string(), self.token.clone()),
        ]
    }

    /// Copy of `request` carrying the routing and token headers.
    pub fn authorize(&self, request: &HttpRequest) -> HttpRequest {
        let mut authorized = request.clone();
        authorized.headers.extend(self.headers());
        authorized
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("service", &self.service)
            .field("subservice", &self.subservice)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Obtains tokens and wraps broker calls with re-authentication on 401.
pub struct AuthManager {
    keystone_url: String,
    service: String,
    subservice: String,
    username: String,
    password: String,
    current: RwLock<Option<Arc<Credentials>>>,
    writer: Mutex<()>,
}

impl AuthManager {
    pub fn new(
        keystone_url: &str,
        service: &str,
        subservice: &str,
        username: &str,
        password: &str,
    ) -> Self {
        Self {
            keystone_url: keystone_url.trim_end_matches('/').to_string(),
            service: service.to_string(),
            subservice: subservice.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            current: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    pub fn token_url(&self) -> String {
        format!("{}/v3/auth/tokens", self.keystone_url)
    }

    /// Password-grant body scoped to the service domain.
    pub fn identity_body(&self) -> Value {
        json!({
            "auth": {
                "identity": {
                    "methods": ["password"],
                    "password": {
                        "user": {
                            "domain": { "name": self.service },
                            "name": self.username,
                            "password": self.password,
                        }
                    }
                },
                "scope": {
                    "domain": { "name": self.service }
                }
            }
        })
    }

    /// Latest credentials, or `None` before the first successful `auth`.
    pub fn credentials(&self) -> Option<Arc<Credentials>> {
        self.current.read().clone()
    }

    /// Exchange username and password for a fresh token.
    pub fn auth<T: Transport>(&self, session: &Session<T>) -> Result<Arc<Credentials>> {
        let _writer = self.writer.lock();
        self.exchange(session)
    }

    /// Run `request` with the current credentials, re-authenticating and
    /// retrying once if the broker answers 401.
    pub fn invoke<T: Transport>(
        &self,
        session: &Session<T>,
        request: &HttpRequest,
    ) -> Result<Fetched> {
        let credentials = self.credentials().ok_or(OrionError::NotAuthenticated)?;
        match session.execute(&credentials.authorize(request)) {
            Err(err) if err.is_unauthorized() => {
                warn!(
                    method = %request.method,
                    url = %request.url,
                    version = credentials.version,
                    "token rejected, re-authenticating"
                );
                let refreshed = self.refresh(session, credentials.version)?;
                session.execute(&refreshed.authorize(request))
            }
            other => other,
        }
    }

    fn refresh<T: Transport>(
        &self,
        session: &Session<T>,
        stale: u64,
    ) -> Result<Arc<Credentials>> {
        let _writer = self.writer.lock();
        if let Some(current) = self.credentials() {
            if current.version != stale {
                return Ok(current);
            }
        }
        self.exchange(session)
    }

    // Callers hold `writer`.
    fn exchange<T: Transport>(&self, session: &Session<T>) -> Result<Arc<Credentials>> {
        let response = session.post(&self.token_url(), &[], &[], Some(self.identity_body()))?;
        let token = response
            .header(SUBJECT_TOKEN_HEADER)
            .ok_or(OrionError::MissingToken)?
            .to_string();

        let version = self.credentials().map_or(0, |c| c.version) + 1;
        let credentials = Arc::new(Credentials {
            token,
            service: self.service.clone(),
            subservice: self.subservice.clone(),
            version,
        });
        *self.current.write() = Some(Arc::clone(&credentials));
        info!(
            service = %self.service,
            subservice = %self.subservice,
            username = %self.username,
            version,
            "authenticated"
        );
        Ok(credentials)
    }
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthManager")
            .field("keystone_url", &self.keystone_url)
            .field("service", &self.service)
            .field("subservice", &self.subservice)
            .field("username", &self.username)
            .field("credentials", &self.credentials())
            .finish_non_exhaustive()
    }
}

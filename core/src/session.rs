//! Thread-confined HTTP session and the transport seam beneath it.
//!
//! # Design
//! `Transport` is the only place network I/O happens. `UreqTransport` owns a
//! `ureq::Agent`, i.e. one connection pool. A `Session` wraps one transport
//! and turns raw responses into `Fetched` values or `FetchError`s.
//!
//! Sessions are deliberately `!Send` and `!Sync`: a worker thread obtains its
//! own session from a `SessionFactory` instead of sharing one pool through
//! global or thread-local state.

use std::marker::PhantomData;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{FetchError, OrionError, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Executes a request and returns whatever the server answered.
///
/// Implementations must return non-2xx responses as data, never as `Err`;
/// `Err` is reserved for exchanges that produced no response at all.
pub trait Transport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

/// Blocking transport backed by a pooled `ureq::Agent`.
///
/// Not `Clone`: a cloned agent shares its pool, and each session must own
/// its connections.
#[derive(Debug)]
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Option<Duration>) -> Self {
        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(timeout)
            .build()
            .new_agent();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Transport for UreqTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let url = request.url.as_str();
        let result = match request.method {
            HttpMethod::Get => prepare(self.agent.get(url), request).call(),
            HttpMethod::Delete => prepare(self.agent.delete(url), request).call(),
            HttpMethod::Post => send_with_body(prepare(self.agent.post(url), request), request)?,
            HttpMethod::Put => send_with_body(prepare(self.agent.put(url), request), request)?,
        };
        let mut response = result.map_err(|e| transport_error(request, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let body = response
            .body_mut()
            .read_to_string()
            .map_err(|e| transport_error(request, e))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn prepare<B>(
    mut builder: ureq::RequestBuilder<B>,
    request: &HttpRequest,
) -> ureq::RequestBuilder<B> {
    for (key, value) in &request.params {
        builder = builder.query(key, value);
    }
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
}

fn send_with_body(
    builder: ureq::RequestBuilder<ureq::typestate::WithBody>,
    request: &HttpRequest,
) -> Result<std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>> {
    match &request.body {
        Some(body) => {
            let payload =
                serde_json::to_vec(body).map_err(|e| OrionError::Serialization(e.to_string()))?;
            Ok(builder.content_type("application/json").send(&payload[..]))
        }
        None => Ok(builder.send_empty()),
    }
}

fn transport_error(request: &HttpRequest, err: ureq::Error) -> OrionError {
    OrionError::Transport {
        method: request.method,
        url: request.url.clone(),
        message: err.to_string(),
    }
}

/// Outcome of a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    Found(HttpResponse),
    /// The server answered 404 to a GET or DELETE.
    Absent,
}

impl Fetched {
    pub fn is_absent(&self) -> bool {
        matches!(self, Fetched::Absent)
    }
}

/// An HTTP session owned by exactly one thread.
#[derive(Debug)]
pub struct Session<T: Transport = UreqTransport> {
    id: Uuid,
    transport: T,
    _thread_bound: PhantomData<*const ()>,
}

impl Session<UreqTransport> {
    pub fn new() -> Self {
        Self::with_transport(UreqTransport::default())
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_transport(UreqTransport::new(Some(timeout)))
    }
}

impl Default for Session<UreqTransport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> Session<T> {
    pub fn with_transport(transport: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            _thread_bound: PhantomData,
        }
    }

    /// Unique per session, for correlating log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Execute `request`, mapping 404 on GET/DELETE to `Fetched::Absent` and
    /// any other status outside 200..=204 to a `FetchError`.
    pub fn execute(&self, request: &HttpRequest) -> Result<Fetched> {
        let response = self.send(request)?;
        if response.status == 404 && request.method.treats_404_as_absent() {
            return Ok(Fetched::Absent);
        }
        check_status(request, response).map(Fetched::Found)
    }

    pub fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
    ) -> Result<Fetched> {
        self.execute(&assemble(HttpMethod::Get, url, headers, params, None))
    }

    pub fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<HttpResponse> {
        let request = assemble(HttpMethod::Post, url, headers, params, body);
        check_status(&request, self.send(&request)?)
    }

    pub fn put(
        &self,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
        body: Option<Value>,
    ) -> Result<HttpResponse> {
        let request = assemble(HttpMethod::Put, url, headers, params, body);
        check_status(&request, self.send(&request)?)
    }

    pub fn delete(
        &self,
        url: &str,
        headers: &[(String, String)],
        params: &[(String, String)],
    ) -> Result<Fetched> {
        self.execute(&assemble(HttpMethod::Delete, url, headers, params, None))
    }

    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let response = self.transport.execute(request)?;
        debug!(
            session = %self.id,
            method = %request.method,
            url = %request.url,
            status = response.status,
            "http exchange"
        );
        Ok(response)
    }
}

fn check_status(request: &HttpRequest, response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(FetchError::new(request, response).into())
    }
}

fn assemble(
    method: HttpMethod,
    url: &str,
    headers: &[(String, String)],
    params: &[(String, String)],
    body: Option<Value>,
) -> HttpRequest {
    HttpRequest {
        method,
        url: url.to_string(),
        headers: headers.to_vec(),
        params: params.to_vec(),
        body,
    }
}

/// Hands out fresh sessions, one per worker.
///
/// The factory itself is `Send + Clone`; the sessions it creates are not.
#[derive(Debug, Clone, Default)]
pub struct SessionFactory {
    timeout: Option<Duration>,
}

impl SessionFactory {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.timeout)
    }

    /// Build a session with its own connection pool.
    pub fn session(&self) -> Session {
        Session::with_transport(UreqTransport::new(self.timeout))
    }
}

//! Scripted transport for unit tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::error::{OrionError, Result};
use crate::http::{HttpRequest, HttpResponse};
use crate::session::Transport;

/// Replays canned responses in order and records every request it sees.
#[derive(Debug, Default)]
pub(crate) struct ScriptedTransport {
    responses: RefCell<VecDeque<HttpResponse>>,
    requests: RefCell<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new<I: IntoIterator<Item = HttpResponse>>(responses: I) -> Self {
        Self {
            responses: RefCell::new(responses.into_iter().collect()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.borrow().clone()
    }

    pub(crate) fn urls(&self) -> Vec<String> {
        self.requests.borrow().iter().map(|r| r.url.clone()).collect()
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| OrionError::Transport {
                method: request.method,
                url: request.url.clone(),
                message: "script exhausted".to_string(),
            })
    }
}

/// Identity-service answer carrying `token`.
pub(crate) fn token_response(token: &str) -> HttpResponse {
    HttpResponse::new(201).with_header("X-Subject-Token", token)
}

//! Typed entity operations against an NGSIv2 context broker.
//!
//! # Design
//! `ContextBroker` holds the broker and identity URLs plus, once `auth` has
//! succeeded, a shared `AuthManager`. Every operation builds an
//! `HttpRequest`, passes through the optional `Throttle`, and goes out via
//! `AuthManager::invoke`, so all operations share the one-shot 401 retry.
//!
//! The broker carries no session. Callers pass the `Session` owned by their
//! thread to each call, so a cloned broker can serve many workers at once.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use urlencoding::encode;

use crate::auth::AuthManager;
use crate::batch::split_batches;
use crate::config::BrokerConfig;
use crate::entity::{Attributes, Entity};
use crate::error::{OrionError, Result};
use crate::http::HttpRequest;
use crate::session::{Fetched, Session, Transport};
use crate::throttle::Throttle;

/// `actionType` used for batch updates: create missing entities, merge
/// attributes into existing ones.
pub const APPEND: &str = "APPEND";

/// Client for the broker's `/v2` entity API.
#[derive(Debug, Clone)]
pub struct ContextBroker {
    keystone_url: String,
    orion_url: String,
    service: String,
    subservice: String,
    manager: Option<Arc<AuthManager>>,
    throttle: Option<Arc<Throttle>>,
}

impl ContextBroker {
    pub fn new(keystone_url: &str, orion_url: &str, service: &str, subservice: &str) -> Self {
        Self {
            keystone_url: keystone_url.trim_end_matches('/').to_string(),
            orion_url: orion_url.trim_end_matches('/').to_string(),
            service: service.to_string(),
            subservice: subservice.to_string(),
            manager: None,
            throttle: None,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(
            &config.keystone_url,
            &config.orion_url,
            &config.service,
            &config.subservice,
        )
    }

    /// Build a broker from `config` and authenticate it, applying the
    /// configured rate limit if any.
    pub fn connect<T: Transport>(session: &Session<T>, config: &BrokerConfig) -> Result<Self> {
        let mut broker = Self::from_config(config);
        match config.rate_limit {
            Some(limit) => broker.auth_with_rate_limit(
                session,
                &config.username,
                &config.password,
                limit.calls,
                limit.period,
            )?,
            None => broker.auth(session, &config.username, &config.password)?,
        }
        Ok(broker)
    }

    pub fn orion_url(&self) -> &str {
        &self.orion_url
    }

    pub fn is_authenticated(&self) -> bool {
        self.manager.is_some()
    }

    /// Obtain a token for `username` and enable the entity operations.
    ///
    /// On failure the broker keeps its previous state.
    pub fn auth<T: Transport>(
        &mut self,
        session: &Session<T>,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let manager = AuthManager::new(
            &self.keystone_url,
            &self.service,
            &self.subservice,
            username,
            password,
        );
        manager.auth(session)?;
        self.manager = Some(Arc::new(manager));
        self.throttle = None;
        Ok(())
    }

    /// Like [`auth`](Self::auth), additionally limiting this broker and its
    /// clones to `calls` requests per `period`.
    pub fn auth_with_rate_limit<T: Transport>(
        &mut self,
        session: &Session<T>,
        username: &str,
        password: &str,
        calls: u32,
        period: Duration,
    ) -> Result<()> {
        let throttle = Throttle::new(calls, period)?;
        self.auth(session, username, password)?;
        self.throttle = Some(Arc::new(throttle));
        Ok(())
    }

    /// Fetch an entity, or `None` if the broker does not know it.
    pub fn get<T: Transport>(
        &self,
        session: &Session<T>,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Option<Entity>> {
        let request = HttpRequest::get(self.entity_url(entity_id)).with_param("type", entity_type);
        match self.invoke(session, &request)? {
            Fetched::Found(response) => response.json().map(Some),
            Fetched::Absent => Ok(None),
        }
    }

    /// Create a new entity. Fails (usually 422) if it already exists.
    pub fn create<T: Transport>(
        &self,
        session: &Session<T>,
        entity_id: &str,
        entity_type: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        let mut body = to_object(attributes)?;
        body.insert("id".to_string(), Value::from(entity_id));
        body.insert("type".to_string(), Value::from(entity_type));
        let url = format!("{}/v2/entities", self.orion_url);
        let request = HttpRequest::post(url, Value::Object(body));
        self.invoke(session, &request)?;
        Ok(())
    }

    /// Upsert `entities`, one request per duplicate-free sub-batch.
    ///
    /// Returns the number of requests sent. A failing sub-batch stops the
    /// call; sub-batches sent before it stay applied.
    pub fn batch<T, I>(&self, session: &Session<T>, entities: I) -> Result<usize>
    where
        T: Transport,
        I: IntoIterator,
        I::Item: Into<Entity>,
    {
        let manager = self.manager()?;
        let url = format!("{}/v2/op/update", self.orion_url);
        let mut sent = 0;
        for batch in split_batches(entities.into_iter().map(Into::into)) {
            debug!(entities = batch.len(), sequence = sent, "flushing sub-batch");
            let body = json!({
                "actionType": APPEND,
                "entities": serialize(&batch)?,
            });
            self.send(manager, session, &HttpRequest::post(&url, body))?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Add attributes to an existing entity, merging with the current ones.
    pub fn add_attributes<T: Transport>(
        &self,
        session: &Session<T>,
        entity_id: &str,
        entity_type: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        let request = HttpRequest::post(self.attrs_url(entity_id), serialize(attributes)?)
            .with_param("type", entity_type);
        self.invoke(session, &request)?;
        Ok(())
    }

    /// Replace the named attributes, leaving the others untouched.
    pub fn replace_attributes<T: Transport>(
        &self,
        session: &Session<T>,
        entity_id: &str,
        entity_type: &str,
        attributes: &Attributes,
    ) -> Result<()> {
        let request = HttpRequest::put(self.attrs_url(entity_id), serialize(attributes)?)
            .with_param("type", entity_type);
        self.invoke(session, &request)?;
        Ok(())
    }

    /// Remove one attribute. Returns `false` if the entity or attribute did
    /// not exist.
    pub fn delete_attribute<T: Transport>(
        &self,
        session: &Session<T>,
        entity_id: &str,
        entity_type: &str,
        attribute: &str,
    ) -> Result<bool> {
        let url = format!("{}/{}", self.attrs_url(entity_id), encode(attribute));
        let request = HttpRequest::delete(url).with_param("type", entity_type);
        Ok(!self.invoke(session, &request)?.is_absent())
    }

    fn entity_url(&self, entity_id: &str) -> String {
        format!("{}/v2/entities/{}", self.orion_url, encode(entity_id))
    }

    fn attrs_url(&self, entity_id: &str) -> String {
        format!("{}/attrs", self.entity_url(entity_id))
    }

    fn manager(&self) -> Result<&AuthManager> {
        self.manager.as_deref().ok_or(OrionError::NotAuthenticated)
    }

    fn invoke<T: Transport>(&self, session: &Session<T>, request: &HttpRequest) -> Result<Fetched> {
        self.send(self.manager()?, session, request)
    }

    fn send<T: Transport>(
        &self,
        manager: &AuthManager,
        session: &Session<T>,
        request: &HttpRequest,
    ) -> Result<Fetched> {
        if let Some(throttle) = &self.throttle {
            throttle.acquire();
        }
        manager.invoke(session, request)
    }
}

fn serialize<S: Serialize + ?Sized>(value: &S) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| OrionError::Serialization(e.to_string()))
}

fn to_object(attributes: &Attributes) -> Result<serde_json::Map<String, Value>> {
    match serialize(attributes)? {
        Value::Object(map) => Ok(map),
        other => Err(OrionError::Serialization(format!(
            "attributes serialized to {other}, expected an object"
        ))),
    }
}

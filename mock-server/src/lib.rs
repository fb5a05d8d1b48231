//! In-memory NGSIv2 context broker with a Keystone-style token endpoint.
//!
//! Covers the slice of the broker API the collectors use: entity
//! get/create, attribute add/replace/delete and `APPEND` batch updates.
//! Entity routes require a token issued by `/v3/auth/tokens` and are
//! partitioned by the `Fiware-Service` / `Fiware-ServicePath` headers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// `(service, service path)` a request is routed to.
pub type Tenant = (String, String);

type Entities = BTreeMap<String, Map<String, Value>>;

#[derive(Debug, Default)]
struct Store {
    users: HashMap<(String, String), String>,
    tokens: HashSet<String>,
    tenants: HashMap<Tenant, Entities>,
    identity_requests: usize,
    update_requests: usize,
}

/// Shared server state, also used by tests to steer and inspect the server.
///
/// Guarded by a plain mutex: handlers never hold it across an await, and
/// tests drive it from threads outside the runtime.
#[derive(Debug, Clone, Default)]
pub struct MockState {
    store: Arc<Mutex<Store>>,
}

impl MockState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name`/`password` in identity domain `domain`.
    pub fn with_user(self, domain: &str, name: &str, password: &str) -> Self {
        self.store
            .lock()
            .users
            .insert((domain.to_string(), name.to_string()), password.to_string());
        self
    }

    /// Invalidate every token issued so far.
    pub fn expire_tokens(&self) {
        self.store.lock().tokens.clear();
    }

    pub fn identity_requests(&self) -> usize {
        self.store.lock().identity_requests
    }

    pub fn update_requests(&self) -> usize {
        self.store.lock().update_requests
    }

    pub fn entity(&self, service: &str, service_path: &str, id: &str) -> Option<Value> {
        let store = self.store.lock();
        store
            .tenants
            .get(&(service.to_string(), service_path.to_string()))
            .and_then(|entities| entities.get(id))
            .map(|entity| Value::Object(entity.clone()))
    }

    pub fn entity_count(&self, service: &str, service_path: &str) -> usize {
        let store = self.store.lock();
        store
            .tenants
            .get(&(service.to_string(), service_path.to_string()))
            .map_or(0, BTreeMap::len)
    }
}

pub fn app() -> Router {
    app_with_state(MockState::new())
}

pub fn app_with_state(state: MockState) -> Router {
    Router::new()
        .route("/v3/auth/tokens", post(issue_token))
        .route("/v2/entities", post(create_entity))
        .route("/v2/entities/{id}", get(get_entity))
        .route(
            "/v2/entities/{id}/attrs",
            post(add_attributes).put(replace_attributes),
        )
        .route("/v2/entities/{id}/attrs/{attr}", delete(delete_attribute))
        .route("/v2/op/update", post(batch_update))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, MockState::new()).await
}

pub async fn run_with_state(
    listener: TcpListener,
    state: MockState,
) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

/// Broker-style error body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: &'static str,
    description: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, description: impl Into<String>) -> Self {
        Self {
            status,
            error,
            description: description.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "The request you have made requires authentication.",
        )
    }

    fn bad_request(description: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BadRequest", description)
    }

    fn not_found() -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            "The requested entity has not been found. Check type and id",
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.error, "description": self.description});
        (self.status, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct TypeQuery {
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchUpdate {
    #[serde(rename = "actionType")]
    pub action_type: String,
    pub entities: Vec<Value>,
}

async fn issue_token(State(state): State<MockState>, Json(body): Json<Value>) -> Response {
    let user = &body["auth"]["identity"]["password"]["user"];
    let domain = user["domain"]["name"].as_str().unwrap_or_default();
    let name = user["name"].as_str().unwrap_or_default();
    let password = user["password"].as_str().unwrap_or_default();

    let mut store = state.store.lock();
    store.identity_requests += 1;
    let known = store.users.get(&(domain.to_string(), name.to_string()));
    if known.map(String::as_str) != Some(password) {
        tracing::warn!(domain, name, "rejected identity request");
        return ApiError::unauthorized().into_response();
    }

    let token = Uuid::new_v4().simple().to_string();
    store.tokens.insert(token.clone());
    let body = json!({
        "token": {
            "methods": ["password"],
            "user": {"name": name, "domain": {"name": domain}},
        }
    });
    (StatusCode::CREATED, [("X-Subject-Token", token)], Json(body)).into_response()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Check the token and resolve the tenant a request is routed to.
fn tenant(store: &Store, headers: &HeaderMap) -> Result<Tenant, ApiError> {
    match header(headers, "X-Auth-Token") {
        Some(token) if store.tokens.contains(token) => {}
        _ => return Err(ApiError::unauthorized()),
    }
    let service = header(headers, "Fiware-Service").unwrap_or_default();
    let path = header(headers, "Fiware-ServicePath").unwrap_or("/");
    Ok((service.to_string(), path.to_string()))
}

/// `id` and `type` of a posted entity, both required strings.
fn identify(entity: &Value) -> Result<(String, String), ApiError> {
    let id = entity.get("id").and_then(Value::as_str);
    let entity_type = entity.get("type").and_then(Value::as_str);
    match (id, entity_type) {
        (Some(id), Some(entity_type)) if !id.is_empty() => {
            Ok((id.to_string(), entity_type.to_string()))
        }
        _ => Err(ApiError::bad_request("entity id and type are required")),
    }
}

fn attributes_of(body: Value) -> Result<Map<String, Value>, ApiError> {
    match body {
        Value::Object(map) => Ok(map),
        _ => Err(ApiError::bad_request("attributes must be a JSON object")),
    }
}

fn merge(target: &mut Map<String, Value>, attributes: Map<String, Value>) {
    for (name, mut attribute) in attributes {
        if name == "id" || name == "type" {
            continue;
        }
        if let Value::Object(fields) = &mut attribute {
            fields
                .entry("metadata")
                .or_insert_with(|| Value::Object(Map::new()));
        }
        target.insert(name, attribute);
    }
}

fn lookup<'a>(
    entities: Option<&'a mut Entities>,
    id: &str,
    entity_type: Option<&str>,
) -> Result<&'a mut Map<String, Value>, ApiError> {
    let entity = entities
        .and_then(|entities| entities.get_mut(id))
        .ok_or_else(ApiError::not_found)?;
    match entity_type {
        Some(expected) if entity.get("type").and_then(Value::as_str) != Some(expected) => {
            Err(ApiError::not_found())
        }
        _ => Ok(entity),
    }
}

async fn get_entity(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Query(query): Query<TypeQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let mut store = state.store.lock();
    let tenant = tenant(&store, &headers)?;
    let entity = lookup(
        store.tenants.get_mut(&tenant),
        &id,
        query.entity_type.as_deref(),
    )?;
    Ok(Json(Value::Object(entity.clone())))
}

async fn create_entity(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let mut store = state.store.lock();
    let tenant = tenant(&store, &headers)?;
    let (id, entity_type) = identify(&body)?;

    let entities = store.tenants.entry(tenant).or_default();
    if entities.contains_key(&id) {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "Unprocessable",
            "Already Exists",
        ));
    }
    let mut entity = Map::new();
    entity.insert("id".to_string(), Value::from(id.clone()));
    entity.insert("type".to_string(), Value::from(entity_type.clone()));
    merge(&mut entity, attributes_of(body)?);
    entities.insert(id.clone(), entity);

    let location = format!("/v2/entities/{id}?type={entity_type}");
    Ok((StatusCode::CREATED, [("Location", location)]))
}

async fn batch_update(
    State(state): State<MockState>,
    headers: HeaderMap,
    Json(update): Json<BatchUpdate>,
) -> Result<StatusCode, ApiError> {
    let mut store = state.store.lock();
    let tenant = tenant(&store, &headers)?;
    store.update_requests += 1;

    if update.action_type != "APPEND" {
        return Err(ApiError::bad_request(format!(
            "unsupported actionType {}",
            update.action_type
        )));
    }
    let mut seen = HashSet::new();
    for entity in &update.entities {
        let (id, _) = identify(entity)?;
        if !seen.insert(id.clone()) {
            return Err(ApiError::bad_request(format!(
                "duplicated entity id {id} in batch"
            )));
        }
    }

    let entities = store.tenants.entry(tenant).or_default();
    for entity in update.entities {
        let (id, entity_type) = identify(&entity)?;
        let target = entities.entry(id.clone()).or_insert_with(|| {
            let mut fresh = Map::new();
            fresh.insert("id".to_string(), Value::from(id));
            fresh.insert("type".to_string(), Value::from(entity_type));
            fresh
        });
        merge(target, attributes_of(entity)?);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn add_attributes(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Query(query): Query<TypeQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    update_attributes(&state, &id, query, &headers, body)
}

async fn replace_attributes(
    State(state): State<MockState>,
    Path(id): Path<String>,
    Query(query): Query<TypeQuery>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    update_attributes(&state, &id, query, &headers, body)
}

fn update_attributes(
    state: &MockState,
    id: &str,
    query: TypeQuery,
    headers: &HeaderMap,
    body: Value,
) -> Result<StatusCode, ApiError> {
    let mut store = state.store.lock();
    let tenant = tenant(&store, headers)?;
    let attributes = attributes_of(body)?;
    let entity = lookup(store.tenants.get_mut(&tenant), id, query.entity_type.as_deref())?;
    merge(entity, attributes);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_attribute(
    State(state): State<MockState>,
    Path((id, attr)): Path<(String, String)>,
    Query(query): Query<TypeQuery>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let mut store = state.store.lock();
    let tenant = tenant(&store, &headers)?;
    let entity = lookup(
        store.tenants.get_mut(&tenant),
        &id,
        query.entity_type.as_deref(),
    )?;
    if attr == "id" || attr == "type" || entity.remove(&attr).is_none() {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "NotFound",
            "Attribute not found",
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

//! Verify the requests each broker operation sends, and how it reads the
//! answers, against JSON test vectors stored in `test-vectors/`.
//!
//! Each vector file lists cases with an operation, its input, the responses
//! the server gives, the requests expected on the wire and the expected
//! outcome. Request fields missing from a vector are not checked. Bodies are
//! compared as parsed JSON so field ordering does not matter.

use std::cell::RefCell;
use std::collections::VecDeque;

use orion_core::{
    Attributes, ContextBroker, Entity, HttpMethod, HttpRequest, HttpResponse, OrionError, Result,
    Session, Transport,
};
use serde_json::Value;

const KEYSTONE_URL: &str = "http://keystone:5001";
const ORION_URL: &str = "http://orion:1026";

/// Replays the responses of one vector case and records what was sent.
#[derive(Default)]
struct VectorTransport {
    responses: RefCell<VecDeque<HttpResponse>>,
    requests: RefCell<Vec<HttpRequest>>,
}

impl VectorTransport {
    fn push(&self, response: HttpResponse) {
        self.responses.borrow_mut().push_back(response);
    }
}

impl Transport for VectorTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.requests.borrow_mut().push(request.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| OrionError::Transport {
                method: request.method,
                url: request.url.clone(),
                message: "no response left in vector".to_string(),
            })
    }
}

fn parse_method(s: &str) -> HttpMethod {
    match s {
        "GET" => HttpMethod::Get,
        "POST" => HttpMethod::Post,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        other => panic!("unknown method: {other}"),
    }
}

fn pairs(value: &Value) -> Vec<(String, String)> {
    value
        .as_array()
        .unwrap()
        .iter()
        .map(|pair| {
            let pair = pair.as_array().unwrap();
            (
                pair[0].as_str().unwrap().to_string(),
                pair[1].as_str().unwrap().to_string(),
            )
        })
        .collect()
}

fn response(value: &Value) -> HttpResponse {
    let mut response = HttpResponse::new(value["status"].as_u64().unwrap() as u16);
    for (name, header) in pairs(&value["headers"]) {
        response = response.with_header(name, header);
    }
    match &value["body"] {
        Value::String(text) => response.with_body(text.clone()),
        other => response.with_body(other.to_string()),
    }
}

fn error_kind(err: &OrionError) -> &'static str {
    match err {
        OrionError::Fetch(_) => "Fetch",
        OrionError::Transport { .. } => "Transport",
        OrionError::NotAuthenticated => "NotAuthenticated",
        OrionError::MissingToken => "MissingToken",
        OrionError::Serialization(_) => "Serialization",
        OrionError::Deserialization(_) => "Deserialization",
        OrionError::InvalidRateLimit { .. } => "InvalidRateLimit",
        OrionError::Config(_) => "Config",
    }
}

fn attributes(input: &Value) -> Attributes {
    serde_json::from_value(input["attributes"].clone()).unwrap()
}

fn str_field<'a>(input: &'a Value, key: &str) -> &'a str {
    input[key].as_str().unwrap()
}

/// Run one operation and express its outcome as JSON.
fn perform(
    broker: &mut ContextBroker,
    session: &Session<VectorTransport>,
    operation: &str,
    input: &Value,
) -> Result<Value> {
    match operation {
        "auth" => broker.auth(session, "etl", "s3cret").map(|()| Value::Null),
        "get" => {
            let entity = broker.get(session, str_field(input, "id"), str_field(input, "type"))?;
            Ok(serde_json::to_value(entity).unwrap())
        }
        "create" => broker
            .create(
                session,
                str_field(input, "id"),
                str_field(input, "type"),
                &attributes(input),
            )
            .map(|()| Value::Null),
        "batch" => {
            let entities: Vec<Entity> =
                serde_json::from_value(input["entities"].clone()).unwrap();
            broker.batch(session, entities).map(Value::from)
        }
        "add_attributes" => broker
            .add_attributes(
                session,
                str_field(input, "id"),
                str_field(input, "type"),
                &attributes(input),
            )
            .map(|()| Value::Null),
        "replace_attributes" => broker
            .replace_attributes(
                session,
                str_field(input, "id"),
                str_field(input, "type"),
                &attributes(input),
            )
            .map(|()| Value::Null),
        "delete_attribute" => broker
            .delete_attribute(
                session,
                str_field(input, "id"),
                str_field(input, "type"),
                str_field(input, "attribute"),
            )
            .map(Value::from),
        other => panic!("unknown operation: {other}"),
    }
}

fn check_request(name: &str, index: usize, actual: &HttpRequest, expected: &Value) {
    let label = format!("{name}: request {index}");
    assert_eq!(
        actual.method,
        parse_method(expected["method"].as_str().unwrap()),
        "{label}: method"
    );
    assert_eq!(actual.url, expected["url"].as_str().unwrap(), "{label}: url");
    if let Some(params) = expected.get("params") {
        assert_eq!(actual.params, pairs(params), "{label}: params");
    }
    if let Some(headers) = expected.get("headers") {
        assert_eq!(actual.headers, pairs(headers), "{label}: headers");
    }
    if let Some(body) = expected.get("body") {
        let actual_body = actual.body.clone().unwrap_or(Value::Null);
        assert_eq!(&actual_body, body, "{label}: body");
    }
}

fn check_outcome(name: &str, outcome: Result<Value>, expected: &Value) {
    match (outcome, expected.get("ok"), expected.get("error")) {
        (Ok(value), Some(ok), None) => assert_eq!(&value, ok, "{name}: result"),
        (Err(err), None, Some(error)) => {
            if let Some(status) = error.get("status") {
                assert_eq!(
                    err.status().map(u64::from),
                    status.as_u64(),
                    "{name}: status ({err})"
                );
            }
            if let Some(kind) = error.get("kind") {
                assert_eq!(error_kind(&err), kind.as_str().unwrap(), "{name}: kind");
            }
        }
        (outcome, _, _) => panic!("{name}: unexpected outcome {outcome:?}"),
    }
}

fn run_vectors(raw: &str) {
    let vectors: Value = serde_json::from_str(raw).unwrap();
    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let operation = case["operation"].as_str().unwrap();

        let session = Session::with_transport(VectorTransport::default());
        let mut broker = ContextBroker::new(KEYSTONE_URL, ORION_URL, "tenant", "/kpi");
        let skipped = if operation == "auth" {
            0
        } else {
            session
                .transport()
                .push(HttpResponse::new(201).with_header("X-Subject-Token", "tok-1"));
            broker.auth(&session, "etl", "s3cret").unwrap();
            1
        };
        for scripted in case["responses"].as_array().unwrap() {
            session.transport().push(response(scripted));
        }

        let outcome = perform(&mut broker, &session, operation, &case["input"]);

        let requests = session.transport().requests.borrow();
        let sent = &requests[skipped..];
        let expected = case["expected_requests"].as_array().unwrap();
        assert_eq!(sent.len(), expected.len(), "{name}: request count");
        for (index, (actual, expected)) in sent.iter().zip(expected).enumerate() {
            check_request(name, index, actual, expected);
        }
        assert!(
            session.transport().responses.borrow().is_empty(),
            "{name}: unused responses"
        );

        check_outcome(name, outcome, &case["expected"]);
    }
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

#[test]
fn auth_test_vectors() {
    run_vectors(include_str!("../../test-vectors/auth.json"));
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[test]
fn entity_test_vectors() {
    run_vectors(include_str!("../../test-vectors/entities.json"));
}

#[test]
fn batch_test_vectors() {
    run_vectors(include_str!("../../test-vectors/batch.json"));
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

#[test]
fn attribute_test_vectors() {
    run_vectors(include_str!("../../test-vectors/attributes.json"));
}

#[test]
fn operations_before_auth_send_nothing() {
    let session = Session::with_transport(VectorTransport::default());
    let broker = ContextBroker::new(KEYSTONE_URL, ORION_URL, "tenant", "/kpi");

    let err = broker
        .batch(&session, vec![Entity::new("a", "T")])
        .unwrap_err();
    assert!(matches!(err, OrionError::NotAuthenticated));
    let err = broker.get(&session, "a", "T").unwrap_err();
    assert!(matches!(err, OrionError::NotAuthenticated));
    assert!(session.transport().requests.borrow().is_empty());
}

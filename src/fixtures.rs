//! In-memory API server for driving controllers in tests.
//!
//! Requests are answered from a path-keyed object store: GET and PATCH
//! return the stored object (a `/status` suffix is ignored), POST echoes the
//! submitted object, DELETE succeeds and anything unknown is a 404.  A
//! responder can override the reply for individual calls.  Every call is
//! recorded so tests can count writes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use kube::runtime::events::Reporter;
use kube::Client;
use serde_json::{json, Value};

use crate::controller::Context;
use crate::provider::fake::FakeProvider;

pub const OPERATOR_NAMESPACE: &str = "getdeck";
pub const CONFIG_MAP: &str = "beiboot-config";

#[derive(Debug, Clone)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub query: String,
    pub body: Value,
}

type Responder = dyn Fn(&Call) -> Option<(StatusCode, Value)> + Send + Sync;

#[derive(Clone, Default)]
pub struct ApiServer {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl ApiServer {
    /// Serve `objects` with the default replies.
    pub fn start(objects: Vec<(String, Value)>) -> (Client, ApiServer) {
        Self::start_with(objects, |_| None)
    }

    pub fn start_with<F>(objects: Vec<(String, Value)>, respond: F) -> (Client, ApiServer)
    where
        F: Fn(&Call) -> Option<(StatusCode, Value)> + Send + Sync + 'static,
    {
        let (service, mut handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let server = ApiServer::default();
        let calls = server.calls.clone();
        let objects: BTreeMap<String, Value> = objects.into_iter().collect();
        let respond: Arc<Responder> = Arc::new(respond);

        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let method = request.method().clone();
                let path = request.uri().path().to_string();
                let query = request.uri().query().unwrap_or_default().to_string();
                let bytes = request.into_body().collect_bytes().await.unwrap_or_default();
                let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                let call = Call { method, path, query, body };

                let (code, reply) = respond(&call).unwrap_or_else(|| default_reply(&call, &objects));
                calls.lock().unwrap().push(call);
                send.send_response(
                    Response::builder()
                        .status(code)
                        .body(Body::from(serde_json::to_vec(&reply).unwrap()))
                        .unwrap(),
                );
            }
        });
        (Client::new(service, "default"), server)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls with `method` whose path contains `fragment`.
    pub fn count(&self, method: Method, fragment: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.method == method && c.path.contains(fragment))
            .count()
    }

    /// Every call that is not a read.
    pub fn writes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.method != Method::GET)
            .collect()
    }

    /// States written through status patches, in order.
    pub fn state_patches(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.method == Method::PATCH && c.path.ends_with("/status"))
            .filter_map(|c| c.body["status"]["state"].as_str().map(String::from))
            .collect()
    }
}

fn default_reply(call: &Call, objects: &BTreeMap<String, Value>) -> (StatusCode, Value) {
    let path = call.path.trim_end_matches("/status");
    match call.method {
        Method::GET | Method::PATCH => match objects.get(path) {
            Some(obj) => (StatusCode::OK, obj.clone()),
            None => (StatusCode::NOT_FOUND, status(404, "NotFound")),
        },
        Method::POST => (StatusCode::CREATED, call.body.clone()),
        Method::DELETE => (
            StatusCode::OK,
            json!({"apiVersion": "v1", "kind": "Status", "metadata": {}, "status": "Success"}),
        ),
        _ => (StatusCode::METHOD_NOT_ALLOWED, status(405, "MethodNotAllowed")),
    }
}

/// A failure `Status` body.
pub fn status(code: u16, reason: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Status",
        "metadata": {},
        "status": "Failure",
        "message": reason.to_lowercase(),
        "reason": reason,
        "code": code,
    })
}

/// Operator configuration ConfigMap with the tunnel turned off.
pub fn config_map(extra: &[(&str, &str)]) -> (String, Value) {
    let mut data = serde_json::Map::new();
    data.insert("tunnelEnabled".into(), json!("false"));
    for (k, v) in extra {
        data.insert(k.to_string(), json!(v));
    }
    (
        format!("/api/v1/namespaces/{OPERATOR_NAMESPACE}/configmaps/{CONFIG_MAP}"),
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": CONFIG_MAP, "namespace": OPERATOR_NAMESPACE },
            "data": data,
        }),
    )
}

pub fn context(client: Client, provider: Arc<FakeProvider>) -> Context {
    Context {
        client,
        reporter: Reporter {
            controller: "beiboot-operator".into(),
            instance: None,
        },
        operator_namespace: OPERATOR_NAMESPACE.into(),
        config_map_name: CONFIG_MAP.into(),
        k3s: provider,
        timer_interval: Duration::from_secs(60),
        retry_delay: Duration::from_secs(5),
        poll_interval: Duration::from_secs(1),
    }
}

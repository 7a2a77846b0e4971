//! Shared fixtures for the integration tests: an in-memory TrueNAS REST API
//! served by axum on a loopback port, and request-map builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::{Path, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use libcsi::backend::truenas::client::{
    IscsiExtent, IscsiTarget, IscsiTargetExtent, IscsiTargetGroup,
};
use serde::Deserialize;
use serde_json::json;

pub const API_KEY: &str = "1-test-api-key";
pub const PARENT_DATASET: &str = "tank/k8s";
pub const BASE_IQN: &str = "iqn.2005-10.org.freenas.ctl";
pub const PORTAL_IP: &str = "10.0.0.5";
pub const PORTAL_ID: i64 = 3;
pub const INITIATOR_ID: i64 = 4;
pub const MIB: i64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    pub id: String,
    pub volsize: i64,
    pub comments: String,
}

impl Dataset {
    fn to_json(&self) -> serde_json::Value {
        let pool = self.id.split('/').next().unwrap_or_default();
        json!({
            "id": self.id,
            "name": self.id,
            "type": "VOLUME",
            "pool": pool,
            "volsize": { "parsed": self.volsize },
            "comments": { "value": self.comments },
        })
    }
}

#[derive(Debug, Default)]
pub struct ApplianceState {
    pub datasets: BTreeMap<String, Dataset>,
    pub targets: Vec<IscsiTarget>,
    pub extents: Vec<IscsiExtent>,
    pub target_extents: Vec<IscsiTargetExtent>,
    /// `METHOD /path` of every authorised request.
    pub requests: Vec<String>,
    fail_next: Option<(Method, String)>,
    next_id: i64,
}

impl ApplianceState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Handle to a running fake appliance.
#[derive(Debug, Clone)]
pub struct Appliance {
    pub url: String,
    state: Arc<Mutex<ApplianceState>>,
}

impl Appliance {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(ApplianceState::default()));
        let app = Router::new()
            .route("/api/v2.0/pool/dataset", post(dataset_create))
            .route(
                "/api/v2.0/pool/dataset/id/{id}",
                get(dataset_get).put(dataset_update).delete(dataset_delete),
            )
            .route("/api/v2.0/iscsi/target", get(target_list).post(target_create))
            .route("/api/v2.0/iscsi/target/id/{id}", delete(target_delete))
            .route("/api/v2.0/iscsi/extent", get(extent_list).post(extent_create))
            .route("/api/v2.0/iscsi/extent/id/{id}", delete(extent_delete))
            .route(
                "/api/v2.0/iscsi/targetextent",
                get(target_extent_list).post(target_extent_create),
            )
            .route(
                "/api/v2.0/iscsi/targetextent/id/{id}",
                delete(target_extent_delete),
            )
            .layer(middleware::from_fn_with_state(Arc::clone(&state), authorize))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            url: format!("http://{addr}"),
            state,
        }
    }

    pub fn state(&self) -> MutexGuard<'_, ApplianceState> {
        lock(&self.state)
    }

    pub fn dataset(&self, id: &str) -> Option<Dataset> {
        self.state().datasets.get(id).cloned()
    }

    /// Answers the next `method path` request with a 500.
    pub fn fail_next(&self, method: Method, path: &str) {
        self.state().fail_next = Some((method, path.to_owned()));
    }

    /// Secrets of a storage class pointing at this appliance.
    pub fn secrets(&self) -> HashMap<String, String> {
        map(&[
            ("truenas-url", &self.url),
            ("truenas-api-key", API_KEY),
            ("truenas-parent-dataset", PARENT_DATASET),
            ("iscsi-base-iqn", BASE_IQN),
            ("iscsi-portal-ip", PORTAL_IP),
            ("iscsi-portal-id", &PORTAL_ID.to_string()),
            ("iscsi-initiator-id", &INITIATOR_ID.to_string()),
        ])
    }
}

pub fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect()
}

type Shared = Arc<Mutex<ApplianceState>>;

fn lock(state: &Shared) -> MutexGuard<'_, ApplianceState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

fn unprocessable(message: String) -> Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(json!({ "message": message })),
    )
        .into_response()
}

async fn authorize(State(state): State<Shared>, request: Request, next: Next) -> Response {
    let expected = format!("Bearer {API_KEY}");
    let authorised = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(expected.as_str());
    if !authorised {
        return (StatusCode::UNAUTHORIZED, "invalid api key").into_response();
    }

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    {
        let mut state = lock(&state);
        state.requests.push(format!("{method} {path}"));
        if state.fail_next.as_ref() == Some(&(method.clone(), path.clone())) {
            state.fail_next = None;
            return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
        }
    }
    next.run(request).await
}

// ----- pool/dataset ----------------------------------------------------------

#[derive(Deserialize)]
struct CreateDataset {
    name: String,
    volsize: i64,
}

async fn dataset_create(State(state): State<Shared>, Json(body): Json<CreateDataset>) -> Response {
    let mut state = lock(&state);
    if state.datasets.contains_key(&body.name) {
        return unprocessable(format!("Path {} already exists", body.name));
    }
    let dataset = Dataset {
        id: body.name.clone(),
        volsize: body.volsize,
        comments: String::new(),
    };
    let response = dataset.to_json();
    state.datasets.insert(body.name, dataset);
    Json(response).into_response()
}

fn missing_dataset(id: &str) -> Response {
    unprocessable(format!("[ENOENT] Dataset {id} does not exist"))
}

async fn dataset_get(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match lock(&state).datasets.get(&id) {
        Some(dataset) => Json(dataset.to_json()).into_response(),
        None => missing_dataset(&id),
    }
}

#[derive(Deserialize)]
struct UpdateDataset {
    volsize: Option<i64>,
    comments: Option<String>,
}

async fn dataset_update(
    State(state): State<Shared>,
    Path(id): Path<String>,
    Json(body): Json<UpdateDataset>,
) -> Response {
    let mut state = lock(&state);
    let Some(dataset) = state.datasets.get_mut(&id) else {
        return missing_dataset(&id);
    };
    if let Some(volsize) = body.volsize {
        dataset.volsize = volsize;
    }
    if let Some(comments) = body.comments {
        dataset.comments = comments;
    }
    Json(dataset.to_json()).into_response()
}

async fn dataset_delete(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    match lock(&state).datasets.remove(&id) {
        Some(_) => Json(true).into_response(),
        None => missing_dataset(&id),
    }
}

// ----- iscsi/target ----------------------------------------------------------

#[derive(Deserialize)]
struct CreateTarget {
    name: String,
    groups: Vec<IscsiTargetGroup>,
}

async fn target_list(State(state): State<Shared>) -> Json<Vec<IscsiTarget>> {
    Json(lock(&state).targets.clone())
}

async fn target_create(State(state): State<Shared>, Json(body): Json<CreateTarget>) -> Response {
    let mut state = lock(&state);
    if state.targets.iter().any(|t| t.name == body.name) {
        return unprocessable("Target name already exists".to_owned());
    }
    let target = IscsiTarget {
        id: state.allocate_id(),
        name: body.name,
        groups: body.groups,
    };
    state.targets.push(target.clone());
    Json(target).into_response()
}

async fn target_delete(State(state): State<Shared>, Path(id): Path<i64>) -> Response {
    let mut state = lock(&state);
    let before = state.targets.len();
    state.targets.retain(|t| t.id != id);
    if state.targets.len() == before {
        return unprocessable(format!("Target {id} does not exist"));
    }
    Json(true).into_response()
}

// ----- iscsi/extent ----------------------------------------------------------

#[derive(Deserialize)]
struct CreateExtent {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    disk: String,
    insecure_tpc: bool,
}

async fn extent_list(State(state): State<Shared>) -> Json<Vec<IscsiExtent>> {
    Json(lock(&state).extents.clone())
}

async fn extent_create(State(state): State<Shared>, Json(body): Json<CreateExtent>) -> Response {
    let mut state = lock(&state);
    if state.extents.iter().any(|e| e.name == body.name) {
        return unprocessable("Extent name must be unique".to_owned());
    }
    let extent = IscsiExtent {
        id: state.allocate_id(),
        name: body.name,
        kind: body.kind,
        disk: Some(body.disk),
        insecure_tpc: body.insecure_tpc,
    };
    state.extents.push(extent.clone());
    Json(extent).into_response()
}

async fn extent_delete(State(state): State<Shared>, Path(id): Path<i64>) -> Response {
    let mut state = lock(&state);
    let before = state.extents.len();
    state.extents.retain(|e| e.id != id);
    if state.extents.len() == before {
        return unprocessable(format!("Extent {id} does not exist"));
    }
    Json(true).into_response()
}

// ----- iscsi/targetextent ----------------------------------------------------

#[derive(Deserialize)]
struct CreateTargetExtent {
    target: i64,
    extent: i64,
    lunid: i64,
}

async fn target_extent_list(State(state): State<Shared>) -> Json<Vec<IscsiTargetExtent>> {
    Json(lock(&state).target_extents.clone())
}

async fn target_extent_create(
    State(state): State<Shared>,
    Json(body): Json<CreateTargetExtent>,
) -> Response {
    let mut state = lock(&state);
    if state
        .target_extents
        .iter()
        .any(|l| l.target == body.target && l.lunid == Some(body.lunid))
    {
        return unprocessable("LUN ID is already being used for this target".to_owned());
    }
    let link = IscsiTargetExtent {
        id: state.allocate_id(),
        target: body.target,
        extent: body.extent,
        lunid: Some(body.lunid),
    };
    state.target_extents.push(link.clone());
    Json(link).into_response()
}

async fn target_extent_delete(State(state): State<Shared>, Path(id): Path<i64>) -> Response {
    let mut state = lock(&state);
    let before = state.target_extents.len();
    state.target_extents.retain(|l| l.id != id);
    if state.target_extents.len() == before {
        return unprocessable(format!("Target extent {id} does not exist"));
    }
    Json(true).into_response()
}

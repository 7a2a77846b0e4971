//! Minimal TrueNAS v2.0 REST client.
//!
//! Only the endpoints the driver needs are wrapped: pool datasets and the
//! three iSCSI sharing objects (target, extent, target-extent association).
//! Failures keep the HTTP status and response body so callers can recognise
//! idempotent outcomes such as "already exists".

use std::time::Duration;

use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Path prefix of the REST API.
const API_PREFIX: [&str; 2] = ["api", "v2.0"];

/// Page size for list calls.  The driver never paginates.
const LIST_LIMIT: u32 = 1000;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid base url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unable to build http client")]
    Client(#[source] reqwest::Error),

    #[error("{method} {path} failed")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: StatusCode,
        body: String,
    },

    #[error("unable to decode response of {method} {path}")]
    Decode {
        method: Method,
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl HttpError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the appliance answered with an error body containing `needle`.
    pub fn body_contains(&self, needle: &str) -> bool {
        match self {
            Self::Status { body, .. } => body.contains(needle),
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Resource shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDataset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub pool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiTargetGroup {
    pub portal: i64,
    pub initiator: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiTarget {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<IscsiTargetGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiExtent {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default)]
    pub insecure_tpc: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IscsiTargetExtent {
    pub id: i64,
    pub target: i64,
    pub extent: i64,
    #[serde(default)]
    pub lunid: Option<i64>,
}

#[derive(Debug, Serialize)]
struct CreateDataset<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    volsize: i64,
}

#[derive(Debug, Default, Serialize)]
struct UpdateDataset<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    volsize: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    comments: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DeleteDataset {
    recursive: bool,
    force: bool,
}

#[derive(Debug, Serialize)]
struct CreateTarget<'a> {
    name: &'a str,
    groups: Vec<IscsiTargetGroup>,
}

#[derive(Debug, Serialize)]
struct CreateExtent<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'static str,
    disk: &'a str,
    insecure_tpc: bool,
}

#[derive(Debug, Serialize)]
struct CreateTargetExtent {
    target: i64,
    extent: i64,
    lunid: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bearer-authenticated JSON client for one appliance.
#[derive(Debug, Clone)]
pub struct TruenasClient {
    base: Url,
    api_key: String,
    http: reqwest::Client,
}

impl TruenasClient {
    pub fn new(base_url: &str, api_key: &str, tls_skip_verify: bool) -> Result<Self, HttpError> {
        let base = Url::parse(base_url).map_err(|e| HttpError::InvalidUrl {
            url: base_url.to_owned(),
            reason: e.to_string(),
        })?;
        if base.cannot_be_a_base() {
            return Err(HttpError::InvalidUrl {
                url: base_url.to_owned(),
                reason: "not a base url".to_owned(),
            });
        }

        let http = reqwest::ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(tls_skip_verify)
            .build()
            .map_err(HttpError::Client)?;

        Ok(Self {
            base,
            api_key: api_key.to_owned(),
            http,
        })
    }

    /// Builds `<base>/api/v2.0/<segments...>`, percent-encoding each segment
    /// so dataset ids like `tank/k8s/pvc-1` stay a single path component.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(API_PREFIX).extend(segments);
        }
        url
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<String, HttpError> {
        let path = url.path().to_owned();
        debug!(%method, %path, "truenas request");

        let mut request = self
            .http
            .request(method.clone(), url)
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|source| HttpError::Transport {
            method: method.clone(),
            path: path.clone(),
            source,
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| HttpError::Transport {
            method: method.clone(),
            path: path.clone(),
            source,
        })?;
        debug!(%method, %path, %status, "truenas response");

        if !status.is_success() {
            return Err(HttpError::Status {
                method,
                path,
                status,
                body: text,
            });
        }
        Ok(text)
    }

    async fn call<B, T>(&self, method: Method, url: Url, body: Option<&B>) -> Result<T, HttpError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let path = url.path().to_owned();
        let text = self.send(method.clone(), url, body).await?;
        serde_json::from_str(&text).map_err(|source| HttpError::Decode {
            method,
            path,
            source,
        })
    }

    async fn list<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Vec<T>, HttpError> {
        let mut url = self.url(segments);
        url.query_pairs_mut()
            .append_pair("limit", &LIST_LIMIT.to_string());
        self.call::<(), _>(Method::GET, url, None).await
    }

    /// Response bodies of deletes vary by endpoint and are ignored.
    async fn delete<B: Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<(), HttpError> {
        self.send(Method::DELETE, self.url(segments), body)
            .await
            .map(drop)
    }

    // ----- pool/dataset ------------------------------------------------------

    pub async fn dataset_create(&self, name: &str, volsize: i64) -> Result<PoolDataset, HttpError> {
        let body = CreateDataset {
            kind: "VOLUME",
            name,
            volsize,
        };
        self.call(Method::POST, self.url(&["pool", "dataset"]), Some(&body))
            .await
    }

    pub async fn dataset_set_volsize(
        &self,
        id: &str,
        volsize: i64,
    ) -> Result<PoolDataset, HttpError> {
        let body = UpdateDataset {
            volsize: Some(volsize),
            ..Default::default()
        };
        self.call(Method::PUT, self.url(&["pool", "dataset", "id", id]), Some(&body))
            .await
    }

    pub async fn dataset_set_comments(
        &self,
        id: &str,
        comments: &str,
    ) -> Result<PoolDataset, HttpError> {
        let body = UpdateDataset {
            comments: Some(comments),
            ..Default::default()
        };
        self.call(Method::PUT, self.url(&["pool", "dataset", "id", id]), Some(&body))
            .await
    }

    pub async fn dataset_delete(
        &self,
        id: &str,
        recursive: bool,
        force: bool,
    ) -> Result<(), HttpError> {
        let body = DeleteDataset { recursive, force };
        self.delete(&["pool", "dataset", "id", id], Some(&body)).await
    }

    // ----- iscsi/target ------------------------------------------------------

    pub async fn target_list(&self) -> Result<Vec<IscsiTarget>, HttpError> {
        self.list(&["iscsi", "target"]).await
    }

    pub async fn target_create(
        &self,
        name: &str,
        portal_id: i64,
        initiator_id: i64,
    ) -> Result<IscsiTarget, HttpError> {
        let body = CreateTarget {
            name,
            groups: vec![IscsiTargetGroup {
                portal: portal_id,
                initiator: Some(initiator_id),
            }],
        };
        self.call(Method::POST, self.url(&["iscsi", "target"]), Some(&body))
            .await
    }

    pub async fn target_delete(&self, id: i64) -> Result<(), HttpError> {
        self.delete::<()>(&["iscsi", "target", "id", &id.to_string()], None)
            .await
    }

    // ----- iscsi/extent ------------------------------------------------------

    pub async fn extent_list(&self) -> Result<Vec<IscsiExtent>, HttpError> {
        self.list(&["iscsi", "extent"]).await
    }

    /// Exports `disk` (a `zvol/<dataset>` path) as a disk-type extent.
    pub async fn extent_create(&self, name: &str, disk: &str) -> Result<IscsiExtent, HttpError> {
        let body = CreateExtent {
            name,
            kind: "DISK",
            disk,
            insecure_tpc: false,
        };
        self.call(Method::POST, self.url(&["iscsi", "extent"]), Some(&body))
            .await
    }

    pub async fn extent_delete(&self, id: i64) -> Result<(), HttpError> {
        self.delete::<()>(&["iscsi", "extent", "id", &id.to_string()], None)
            .await
    }

    // ----- iscsi/targetextent ------------------------------------------------

    pub async fn target_extent_list(&self) -> Result<Vec<IscsiTargetExtent>, HttpError> {
        self.list(&["iscsi", "targetextent"]).await
    }

    pub async fn target_extent_create(
        &self,
        target: i64,
        extent: i64,
        lunid: i64,
    ) -> Result<IscsiTargetExtent, HttpError> {
        let body = CreateTargetExtent {
            target,
            extent,
            lunid,
        };
        self.call(Method::POST, self.url(&["iscsi", "targetextent"]), Some(&body))
            .await
    }

    pub async fn target_extent_delete(&self, id: i64) -> Result<(), HttpError> {
        self.delete::<()>(&["iscsi", "targetextent", "id", &id.to_string()], None)
            .await
    }
}

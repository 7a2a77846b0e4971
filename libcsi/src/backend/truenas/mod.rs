//! TrueNAS backend.
//!
//! One volume maps onto four appliance objects:
//!
//! ```text
//! dataset  <parent>/<name>         type VOLUME, volsize = size
//! target   <name>                  group { portal, initiator }
//! extent   <name>                  DISK, zvol/<parent>/<name>
//! link     (target, extent)        LUN 0
//! ```
//!
//! Creation re-derives existence of every object from list calls, so a create
//! interrupted at any step can simply be retried.

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use self::client::{HttpError, TruenasClient};
use super::{
    Backend, BackendError, BackendFactory, BoxedBackend, IscsiSecrets, SecretsError, flag,
    required,
};
use crate::types::secret_keys;

/// LUN of every target-extent association.
pub const LUN: i64 = 0;

/// Connection details and policy for one appliance, taken from the request
/// secrets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruenasSecrets {
    pub url: String,
    pub api_key: String,
    pub tls_skip_verify: bool,
    /// Datasets are created as children of this dataset.
    pub parent_dataset: String,
    /// Also remove the target, extent and link when deleting a volume.
    pub delete_iscsi_objects: bool,
    pub iscsi: IscsiSecrets,
}

impl TruenasSecrets {
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, SecretsError> {
        let url = required(secrets, secret_keys::TRUENAS_URL)?.to_owned();
        let api_key = required(secrets, secret_keys::TRUENAS_API_KEY)?.to_owned();
        let parent_dataset = required(secrets, secret_keys::TRUENAS_PARENT_DATASET)?
            .trim_end_matches('/')
            .to_owned();
        if parent_dataset.is_empty() {
            return Err(SecretsError::Malformed {
                key: secret_keys::TRUENAS_PARENT_DATASET,
                reason: "must name a dataset".to_owned(),
            });
        }

        Ok(Self {
            url,
            api_key,
            tls_skip_verify: flag(secrets, secret_keys::TRUENAS_TLS_SKIP_VERIFY),
            parent_dataset,
            delete_iscsi_objects: flag(secrets, secret_keys::TRUENAS_DELETE_ISCSI_OBJECTS),
            iscsi: IscsiSecrets::from_secrets(secrets)?,
        })
    }
}

pub struct TruenasBackend {
    secrets: TruenasSecrets,
    client: TruenasClient,
}

impl TruenasBackend {
    pub fn new(secrets: TruenasSecrets) -> Result<Self, BackendError> {
        let client = TruenasClient::new(&secrets.url, &secrets.api_key, secrets.tls_skip_verify)
            .map_err(BackendError::remote("configure truenas client"))?;
        Ok(Self { secrets, client })
    }

    /// Dataset id for volume `name`.
    pub fn dataset_name(&self, name: &str) -> String {
        format!("{}/{}", self.secrets.parent_dataset, name)
    }

    async fn ensure_dataset(&self, name: &str, size: i64) -> Result<String, BackendError> {
        let dataset_name = self.dataset_name(name);
        match self.client.dataset_create(&dataset_name, size).await {
            Ok(dataset) if dataset.id != dataset_name => Err(BackendError::DatasetIdMismatch {
                expected: dataset_name,
                actual: dataset.id,
            }),
            Ok(_) => {
                info!(dataset = %dataset_name, size, "created dataset");
                Ok(dataset_name)
            }
            Err(e) if e.body_contains("already exists") => {
                warn!(dataset = %dataset_name, "dataset already exists");
                Ok(dataset_name)
            }
            Err(e) => Err(BackendError::remote("create dataset")(e)),
        }
    }

    async fn ensure_target(&self, name: &str) -> Result<i64, BackendError> {
        let targets = self
            .client
            .target_list()
            .await
            .map_err(BackendError::remote("list iscsi targets"))?;
        if let Some(target) = targets.into_iter().find(|t| t.name == name) {
            debug!(target = name, id = target.id, "iscsi target exists");
            return Ok(target.id);
        }

        let iscsi = &self.secrets.iscsi;
        let target = self
            .client
            .target_create(name, iscsi.portal_id, iscsi.initiator_id)
            .await
            .map_err(BackendError::remote("create iscsi target"))?;
        info!(target = name, id = target.id, "created iscsi target");
        Ok(target.id)
    }

    async fn ensure_extent(&self, name: &str, dataset_id: &str) -> Result<i64, BackendError> {
        let extents = self
            .client
            .extent_list()
            .await
            .map_err(BackendError::remote("list iscsi extents"))?;
        if let Some(extent) = extents.into_iter().find(|e| e.name == name) {
            debug!(extent = name, id = extent.id, "iscsi extent exists");
            return Ok(extent.id);
        }

        let disk = format!("zvol/{dataset_id}");
        let extent = self
            .client
            .extent_create(name, &disk)
            .await
            .map_err(BackendError::remote("create iscsi extent"))?;
        info!(extent = name, id = extent.id, %disk, "created iscsi extent");
        Ok(extent.id)
    }

    async fn ensure_target_extent(&self, target: i64, extent: i64) -> Result<i64, BackendError> {
        let links = self
            .client
            .target_extent_list()
            .await
            .map_err(BackendError::remote("list iscsi target extents"))?;
        if let Some(link) = links
            .into_iter()
            .find(|l| l.target == target && l.extent == extent)
        {
            debug!(target, extent, id = link.id, "iscsi target extent exists");
            return Ok(link.id);
        }

        let link = self
            .client
            .target_extent_create(target, extent, LUN)
            .await
            .map_err(BackendError::remote("create iscsi target extent"))?;
        info!(target, extent, id = link.id, lun = LUN, "created iscsi target extent");
        Ok(link.id)
    }

    /// Removes link, extent and target for the volume whose dataset is `id`,
    /// in that order.  Objects that are already gone are skipped.
    async fn delete_iscsi_objects(&self, id: &str) -> Result<(), BackendError> {
        let name = id.rsplit('/').next().unwrap_or(id);

        let target = self
            .client
            .target_list()
            .await
            .map_err(BackendError::remote("list iscsi targets"))?
            .into_iter()
            .find(|t| t.name == name);
        let extent = self
            .client
            .extent_list()
            .await
            .map_err(BackendError::remote("list iscsi extents"))?
            .into_iter()
            .find(|e| e.name == name);

        if let (Some(target), Some(extent)) = (&target, &extent) {
            let links = self
                .client
                .target_extent_list()
                .await
                .map_err(BackendError::remote("list iscsi target extents"))?;
            for link in links
                .iter()
                .filter(|l| l.target == target.id && l.extent == extent.id)
            {
                tolerate_missing(self.client.target_extent_delete(link.id).await)
                    .map_err(BackendError::remote("delete iscsi target extent"))?;
                info!(id = link.id, "deleted iscsi target extent");
            }
        }
        if let Some(extent) = extent {
            tolerate_missing(self.client.extent_delete(extent.id).await)
                .map_err(BackendError::remote("delete iscsi extent"))?;
            info!(extent = name, id = extent.id, "deleted iscsi extent");
        }
        if let Some(target) = target {
            tolerate_missing(self.client.target_delete(target.id).await)
                .map_err(BackendError::remote("delete iscsi target"))?;
            info!(target = name, id = target.id, "deleted iscsi target");
        }
        Ok(())
    }
}

/// Treats "does not exist" answers of a delete as success.
fn tolerate_missing(result: Result<(), HttpError>) -> Result<(), HttpError> {
    match result {
        Err(e) if is_missing(&e) => {
            warn!(error = %e, "object does not exist");
            Ok(())
        }
        other => other,
    }
}

fn is_missing(err: &HttpError) -> bool {
    err.body_contains("does not exist") || err.status() == Some(reqwest::StatusCode::NOT_FOUND)
}

#[async_trait]
impl Backend for TruenasBackend {
    #[instrument(skip(self), fields(parent = %self.secrets.parent_dataset))]
    async fn create_volume(&self, name: &str, size: i64) -> Result<String, BackendError> {
        let dataset_id = self.ensure_dataset(name, size).await?;
        let target = self.ensure_target(name).await?;
        let extent = self.ensure_extent(name, &dataset_id).await?;
        self.ensure_target_extent(target, extent).await?;
        Ok(dataset_id)
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, id: &str) -> Result<(), BackendError> {
        if self.secrets.delete_iscsi_objects {
            self.delete_iscsi_objects(id).await?;
        }
        tolerate_missing(self.client.dataset_delete(id, false, false).await)
            .map_err(BackendError::remote("delete dataset"))?;
        info!(dataset = id, "deleted dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expand_volume(&self, id: &str, size: i64) -> Result<(), BackendError> {
        self.client
            .dataset_set_volsize(id, size)
            .await
            .map_err(BackendError::remote("resize dataset"))?;
        info!(dataset = id, size, "resized dataset");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn comment_volume(&self, id: &str, comment: &str) -> Result<(), BackendError> {
        self.client
            .dataset_set_comments(id, comment)
            .await
            .map_err(BackendError::remote("set dataset comment"))?;
        Ok(())
    }

    fn iscsi_secrets(&self) -> &IscsiSecrets {
        &self.secrets.iscsi
    }
}

/// Builds a [`TruenasBackend`] per request.
#[derive(Debug, Default, Clone, Copy)]
pub struct TruenasBackendFactory;

impl BackendFactory for TruenasBackendFactory {
    fn from_secrets(
        &self,
        secrets: &HashMap<String, String>,
    ) -> Result<BoxedBackend, BackendError> {
        let secrets = TruenasSecrets::from_secrets(secrets)?;
        Ok(Arc::new(TruenasBackend::new(secrets)?))
    }
}

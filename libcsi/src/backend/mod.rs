//! Storage appliance backends.
//!
//! A [`Backend`] owns the mapping from a logical volume name onto the remote
//! objects that export it over iSCSI.  Backends are built per request from the
//! `secrets` map by a [`BackendFactory`]; the protocol layer only ever talks
//! to the trait, so another appliance can be plugged in without touching the
//! services.

pub mod truenas;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::iscsi::Portal;
use crate::types::secret_keys;

/// Default iSCSI portal port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A required secret is absent or cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretsError {
    #[error("missing secret {0}")]
    Missing(&'static str),

    #[error("malformed secret {key}: {reason}")]
    Malformed { key: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Secrets(#[from] SecretsError),

    /// A remote call failed; `operation` names the step, e.g. "create iscsi target".
    #[error("unable to {operation}")]
    Remote {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    #[error("expected dataset id to equal {expected}, got {actual}")]
    DatasetIdMismatch { expected: String, actual: String },
}

impl BackendError {
    pub fn remote<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: Into<BoxError>,
    {
        move |err| Self::Remote {
            operation,
            source: err.into(),
        }
    }

    pub fn is_secrets(&self) -> bool {
        matches!(self, Self::Secrets(_))
    }
}

/// Looks up a non-empty secret.
pub fn required<'a>(
    secrets: &'a HashMap<String, String>,
    key: &'static str,
) -> Result<&'a str, SecretsError> {
    match secrets.get(key).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(SecretsError::Missing(key)),
    }
}

/// Looks up an optional secret, treating an empty value as absent.
pub fn optional<'a>(secrets: &'a HashMap<String, String>, key: &'static str) -> Option<&'a str> {
    secrets
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
}

/// Parses a secret value, naming the key on failure.
pub fn parse<T>(key: &'static str, value: &str) -> Result<T, SecretsError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| SecretsError::Malformed {
        key,
        reason: e.to_string(),
    })
}

/// Boolean toggles are enabled only by the literal string `"true"`.
pub fn flag(secrets: &HashMap<String, String>, key: &'static str) -> bool {
    optional(secrets, key) == Some("true")
}

/// iSCSI connection details shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiSecrets {
    /// Target names are `<base_iqn>:<volume name>`.
    pub base_iqn: String,
    pub portal_ip: String,
    pub portal_port: u16,
    /// Appliance id of the portal new targets are bound to.
    pub portal_id: i64,
    /// Appliance id of the initiator group new targets are bound to.
    pub initiator_id: i64,
}

impl IscsiSecrets {
    pub fn from_secrets(secrets: &HashMap<String, String>) -> Result<Self, SecretsError> {
        let base_iqn = required(secrets, secret_keys::ISCSI_BASE_IQN)?.to_owned();
        let portal_ip = required(secrets, secret_keys::ISCSI_PORTAL_IP)?.to_owned();
        let portal_port = match optional(secrets, secret_keys::ISCSI_PORTAL_PORT) {
            Some(port) => parse(secret_keys::ISCSI_PORTAL_PORT, port)?,
            None => DEFAULT_ISCSI_PORT,
        };
        let portal_id = parse(
            secret_keys::ISCSI_PORTAL_ID,
            required(secrets, secret_keys::ISCSI_PORTAL_ID)?,
        )?;
        let initiator_id = parse(
            secret_keys::ISCSI_INITIATOR_ID,
            required(secrets, secret_keys::ISCSI_INITIATOR_ID)?,
        )?;

        Ok(Self {
            base_iqn,
            portal_ip,
            portal_port,
            portal_id,
            initiator_id,
        })
    }

    pub fn portal(&self) -> Portal {
        Portal::new(self.portal_ip.clone(), self.portal_port)
    }

    /// IQN under which the target for volume `name` is exported.
    pub fn target_iqn(&self, name: &str) -> String {
        format!("{}:{}", self.base_iqn, name)
    }
}

/// Storage appliance operations backing one logical volume.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates (or adopts) every remote object for volume `name` and returns
    /// its durable id.  Safe to retry after any partial failure.
    async fn create_volume(&self, name: &str, size: i64) -> Result<String, BackendError>;

    /// Deletes the volume; an already missing volume is not an error.
    async fn delete_volume(&self, id: &str) -> Result<(), BackendError>;

    async fn expand_volume(&self, id: &str, size: i64) -> Result<(), BackendError>;

    /// Sets a free-text annotation on the volume.
    async fn comment_volume(&self, id: &str, comment: &str) -> Result<(), BackendError>;

    fn iscsi_secrets(&self) -> &IscsiSecrets;
}

pub type BoxedBackend = Arc<dyn Backend>;

/// Builds backends from per-call request fields.
pub trait BackendFactory: Send + Sync {
    fn from_secrets(
        &self,
        secrets: &HashMap<String, String>,
    ) -> Result<BoxedBackend, BackendError>;
}

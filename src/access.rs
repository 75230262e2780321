//! Per-model access control.
//!
//! Model records live in a registry that is owned elsewhere (loaded from the gateway file here).
//! [`authorize`] is a pure decision over a caller and the record for the requested model.
use crate::auth::CallerIdentity;
use crate::errors::MODEL_NOT_FOUND;
use bon::Builder;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The principals granted one kind of access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    #[serde(default)]
    pub user_ids: Vec<String>,
    #[serde(default)]
    pub group_ids: Vec<String>,
}

impl Grant {
    fn admits(&self, caller: &CallerIdentity) -> bool {
        self.user_ids.iter().any(|id| *id == caller.id)
            || self
                .group_ids
                .iter()
                .any(|group| caller.group_ids.contains(group))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// An access-control list. A record without one is readable by everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControl {
    #[serde(default)]
    pub read: Grant,
    #[serde(default)]
    pub write: Grant,
}

/// Whether `caller` holds `kind` access under `access_control`.
pub fn has_access(
    caller: &CallerIdentity,
    kind: AccessKind,
    access_control: Option<&AccessControl>,
) -> bool {
    match (access_control, kind) {
        (None, AccessKind::Read) => true,
        (None, AccessKind::Write) => false,
        (Some(acl), AccessKind::Read) => acl.read.admits(caller),
        (Some(acl), AccessKind::Write) => acl.write.admits(caller),
    }
}

/// A registered model: ownership, access control and optional base model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct ModelRecord {
    #[builder(into)]
    pub id: String,
    #[serde(default)]
    #[builder(into)]
    pub name: Option<String>,
    /// Id of the owning user.
    #[builder(into)]
    pub user_id: String,
    /// When set, requests for this model are served by the base model.
    #[serde(default)]
    #[builder(into)]
    pub base_model_id: Option<String>,
    #[serde(default)]
    pub access_control: Option<AccessControl>,
}

/// The live model registry.
#[derive(Debug, Clone, Default)]
pub struct ModelRecords {
    records: Arc<DashMap<String, ModelRecord>>,
}

impl ModelRecords {
    pub fn from_records(records: Vec<ModelRecord>) -> Self {
        let registry = Self::default();
        registry.replace(records);
        registry
    }

    pub fn get_model_by_id(&self, id: &str) -> Option<ModelRecord> {
        self.records.get(id).map(|entry| entry.value().clone())
    }

    pub fn replace(&self, records: Vec<ModelRecord>) {
        self.records
            .retain(|id, _| records.iter().any(|record| record.id == *id));
        for record in records {
            self.records.insert(record.id.clone(), record);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    Deny(&'static str),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allow)
    }
}

/// Decides whether `caller` may invoke the model described by `record`.
///
/// Denials always carry the same "model not found" reason whether or not the model exists.
pub fn authorize(
    caller: &CallerIdentity,
    record: Option<&ModelRecord>,
    bypass: bool,
) -> AccessDecision {
    if bypass {
        return AccessDecision::Allow;
    }

    match record {
        None if caller.is_admin() => AccessDecision::Allow,
        None => AccessDecision::Deny(MODEL_NOT_FOUND),
        Some(record)
            if record.user_id == caller.id
                || has_access(caller, AccessKind::Read, record.access_control.as_ref()) =>
        {
            AccessDecision::Allow
        }
        Some(_) => AccessDecision::Deny(MODEL_NOT_FOUND),
    }
}

//! Tenant-scoped collection naming and bulk cleanup.
//!
//! Collection names take the form `u_{tenant}-{digest}_{short_name}`. The tenant segment is a
//! readable `[a-z0-9-]` rendering of the tenant id followed by a digest of the raw id, so it
//! never contains the `_` separator and ids that render alike still get distinct prefixes.
//! Names are truncated to [`MAX_COLLECTION_NAME_LEN`]; two short names that only differ past
//! that bound map to the same collection.
//!
//! Ending a tenant bumps its epoch before anything is deleted. Jobs remember the epoch they were
//! submitted under and discard their collection if it moved while they ran.

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::status::StatusStore;
use crate::store::{StoreError, VectorStore};

/// Longest collection name handed to the store.
pub const MAX_COLLECTION_NAME_LEN: usize = 63;
/// Longest short name produced by [`sanitize_short_name`].
pub const MAX_SHORT_NAME_LEN: usize = 63;

const MIN_SHORT_NAME_LEN: usize = 3;
const MAX_TENANT_SEGMENT_LEN: usize = 24;
const TENANT_DIGEST_LEN: usize = 8;
const TENANT_PREFIX: &str = "u_";

/// Sanitize an uploaded file stem into a short name.
///
/// Spaces become `_`, characters outside `[A-Za-z0-9._-]` are dropped, names shorter than three
/// characters gain a `doc_` prefix, and the result always starts and ends with an alphanumeric.
pub fn sanitize_short_name(stem: &str) -> String {
    let mut name: String = stem
        .replace(' ', "_")
        .chars()
        .filter(|c| is_short_name_char(*c))
        .collect();

    if name.len() < MIN_SHORT_NAME_LEN {
        name = format!("doc_{name}");
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        name = format!("c_{name}");
    }
    if !name.ends_with(|c: char| c.is_ascii_alphanumeric()) {
        name.push_str("_c");
    }
    name.truncate(MAX_SHORT_NAME_LEN);
    name
}

fn is_short_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Reduce a tenant identifier to the segment embedded in collection names.
///
/// The readable part keeps `[a-z0-9]` and maps everything else to `-`; the trailing digest is
/// taken over the raw id, so `a.b@x.com` and `a-b@x.com` never share a segment.
pub fn sanitize_tenant(tenant_id: &str) -> String {
    let mut segment: String = tenant_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    if segment.is_empty() {
        segment.push_str("anon");
    }
    segment.truncate(MAX_TENANT_SEGMENT_LEN);

    let digest = hex::encode(Sha256::digest(tenant_id.as_bytes()));
    segment.push('-');
    segment.push_str(&digest[..TENANT_DIGEST_LEN]);
    segment
}

/// Prefix carried by every collection owned by `tenant_id`.
pub fn tenant_prefix(tenant_id: &str) -> String {
    format!("{TENANT_PREFIX}{}_", sanitize_tenant(tenant_id))
}

/// Derive the collection name for a tenant document. Pure in both arguments.
pub fn derive_name(tenant_id: &str, short_name: &str) -> String {
    let safe_short: String = short_name
        .chars()
        .filter(|c| is_short_name_char(*c))
        .collect();
    let mut name = tenant_prefix(tenant_id);
    name.push_str(&safe_short);
    name.truncate(MAX_COLLECTION_NAME_LEN);
    name
}

/// Owns collection lifecycle operations that span a whole tenant.
#[derive(Clone)]
pub struct NamespaceManager {
    store: Arc<dyn VectorStore>,
    status: Option<Arc<dyn StatusStore>>,
    epochs: Arc<DashMap<String, u64>>,
}

impl NamespaceManager {
    /// Wrap the shared store.
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            status: None,
            epochs: Arc::default(),
        }
    }

    /// Also forget the tenant's finished job statuses when the tenant ends.
    pub fn with_status(mut self, status: Arc<dyn StatusStore>) -> Self {
        self.status = Some(status);
        self
    }

    /// Number of times `tenant_id` has been ended. Jobs record it at submission.
    pub fn tenant_epoch(&self, tenant_id: &str) -> u64 {
        self.epochs
            .get(tenant_id)
            .map(|epoch| *epoch.value())
            .unwrap_or(0)
    }

    /// Whether `tenant_id` has not been ended since `epoch` was read.
    pub fn is_current(&self, tenant_id: &str, epoch: u64) -> bool {
        self.tenant_epoch(tenant_id) == epoch
    }

    /// End `tenant_id`: invalidate in-flight jobs, delete its collections, and forget its
    /// finished statuses. Returns how many collections were removed. Never fails.
    pub async fn end_tenant(&self, tenant_id: &str) -> usize {
        *self
            .epochs
            .entry(tenant_id.to_string())
            .and_modify(|epoch| *epoch += 1)
            .or_insert(1);
        let deleted = self.delete_all_for_tenant(tenant_id).await;
        if let Some(status) = &self.status {
            let cleared = status.clear_finished(&tenant_prefix(tenant_id));
            tracing::debug!(tenant = %sanitize_tenant(tenant_id), cleared, "Tenant statuses cleared");
        }
        deleted
    }

    /// Delete one collection written on behalf of an ended tenant.
    pub async fn discard_collection(&self, name: &str) {
        match self.store.delete_collection(name).await {
            Ok(removed) => {
                tracing::info!(collection = %name, removed, "Discarded collection of ended tenant");
            }
            Err(error) => {
                tracing::warn!(collection = %name, error = %error, "Failed to discard collection");
            }
        }
    }

    /// Collections currently owned by `tenant_id`.
    pub async fn tenant_collections(&self, tenant_id: &str) -> Result<Vec<String>, StoreError> {
        let prefix = tenant_prefix(tenant_id);
        let names = self.store.list_collections().await?;
        Ok(names
            .into_iter()
            .filter(|name| name.starts_with(&prefix))
            .collect())
    }

    /// Delete every collection owned by `tenant_id`, returning how many were removed.
    ///
    /// A listing failure is returned. Individual deletions that fail are logged and skipped.
    pub async fn try_delete_all_for_tenant(&self, tenant_id: &str) -> Result<usize, StoreError> {
        let owned = self.tenant_collections(tenant_id).await?;
        let mut deleted = 0;
        for name in owned {
            match self.store.delete_collection(&name).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::warn!(collection = %name, error = %error, "Failed to delete tenant collection");
                }
            }
        }
        Ok(deleted)
    }

    /// Best-effort variant used on logout and session end. Never fails.
    pub async fn delete_all_for_tenant(&self, tenant_id: &str) -> usize {
        match self.try_delete_all_for_tenant(tenant_id).await {
            Ok(deleted) => {
                tracing::info!(tenant = %sanitize_tenant(tenant_id), deleted, "Tenant collections removed");
                deleted
            }
            Err(error) => {
                tracing::warn!(
                    tenant = %sanitize_tenant(tenant_id),
                    error = %error,
                    "Tenant cleanup skipped; store unreachable"
                );
                0
            }
        }
    }
}

//! The remote store interface.
//!
//! All three verbs are keyed by record identifier and must be idempotent:
//! replaying a batch from its start after a partial failure is how the
//! engine recovers, so applying the same call twice must leave the remote
//! as applying it once would.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use tallydb_sync_protocol::{Credential, CrudOp, OpKind, Row};

/// A keyed remote collection store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Creates or replaces a record.
    async fn upsert(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()>;

    /// Updates some fields of a record. Updating an absent record succeeds.
    async fn patch(
        &self,
        credential: &Credential,
        table: &str,
        id: &str,
        data: &Row,
    ) -> SyncResult<()>;

    /// Deletes a record. Deleting an absent record succeeds.
    async fn delete(&self, credential: &Credential, table: &str, id: &str) -> SyncResult<()>;
}

/// Applies one outbox operation to the remote.
pub async fn apply_op(
    remote: &dyn RemoteStore,
    credential: &Credential,
    op: &CrudOp,
) -> SyncResult<()> {
    op.validate()?;
    match op.kind {
        OpKind::Put => {
            let data = payload(op)?;
            remote.upsert(credential, &op.table, &op.id, data).await
        }
        OpKind::Patch => {
            let data = payload(op)?;
            remote.patch(credential, &op.table, &op.id, data).await
        }
        OpKind::Delete => remote.delete(credential, &op.table, &op.id).await,
    }
}

fn payload(op: &CrudOp) -> SyncResult<&Row> {
    op.data
        .as_ref()
        .ok_or_else(|| SyncError::rejected(None, format!("{} without payload", op.kind)))
}

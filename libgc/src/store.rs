use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use serde_json::json;

use crate::error::StoreError;
use crate::models::{FOREGROUND_FINALIZER, ORPHAN_FINALIZER, Object, PropagationPolicy, Uid};
use crate::resolver::ResourceType;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// One change observed on a watched resource. For `Deleted` the object is
/// its last stored state.
#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Object,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

#[derive(Clone, Debug, Default)]
pub struct ObjectList {
    pub items: Vec<Object>,
    /// Store revision the list was read at; watch from here.
    pub revision: i64,
}

#[derive(Clone, Debug, Default)]
pub struct DeleteOptions {
    /// The delete only applies to the object with this uid.
    pub uid: Option<Uid>,
    pub propagation_policy: PropagationPolicy,
}

impl DeleteOptions {
    pub fn with_uid(uid: Uid, propagation_policy: PropagationPolicy) -> Self {
        DeleteOptions {
            uid: Some(uid),
            propagation_policy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerReferencePatch {
    /// Drop the owner reference with this uid.
    Delete(Uid),
    /// Clear `blockOwnerDeletion` on the owner reference with this uid.
    Unblock(Uid),
}

/// Patch of an object's owner references, guarded by the object's uid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectPatch {
    pub uid: Uid,
    pub owner_references: Vec<OwnerReferencePatch>,
}

impl ObjectPatch {
    pub fn delete_owner_references(uid: Uid, owners: impl IntoIterator<Item = Uid>) -> Self {
        ObjectPatch {
            uid,
            owner_references: owners.into_iter().map(OwnerReferencePatch::Delete).collect(),
        }
    }

    pub fn unblock_owner_references(uid: Uid, owners: impl IntoIterator<Item = Uid>) -> Self {
        ObjectPatch {
            uid,
            owner_references: owners.into_iter().map(OwnerReferencePatch::Unblock).collect(),
        }
    }

    /// Applies the patch in place. References that are already absent are
    /// skipped. Returns whether anything changed.
    pub fn apply(&self, obj: &mut Object) -> Result<bool, StoreError> {
        if obj.metadata.uid != self.uid {
            return Err(StoreError::Conflict(format!(
                "precondition failed: uid in precondition: {}, uid in object meta: {}",
                self.uid, obj.metadata.uid
            )));
        }
        let mut changed = false;
        for op in &self.owner_references {
            match op {
                OwnerReferencePatch::Delete(uid) => {
                    let before = obj.metadata.owner_references.len();
                    obj.metadata.owner_references.retain(|r| &r.uid != uid);
                    changed |= before != obj.metadata.owner_references.len();
                }
                OwnerReferencePatch::Unblock(uid) => {
                    for r in obj
                        .metadata
                        .owner_references
                        .iter_mut()
                        .filter(|r| &r.uid == uid && r.blocks_owner_deletion())
                    {
                        r.block_owner_deletion = Some(false);
                        changed = true;
                    }
                }
            }
        }
        Ok(changed)
    }

    /// The equivalent strategic-merge patch document.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let refs: Vec<_> = self
            .owner_references
            .iter()
            .map(|op| match op {
                OwnerReferencePatch::Delete(uid) => json!({"$patch": "delete", "uid": uid}),
                OwnerReferencePatch::Unblock(uid) => {
                    json!({"uid": uid, "blockOwnerDeletion": false})
                }
            })
            .collect();
        json!({"metadata": {"ownerReferences": refs, "uid": self.uid}})
    }
}

/// The object store client every collector operation goes through.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list(&self, resource: &ResourceType) -> Result<ObjectList, StoreError>;

    /// Watches `resource` for changes after `revision`.
    async fn watch(&self, resource: &ResourceType, revision: i64)
    -> Result<WatchStream, StoreError>;

    async fn get(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
    ) -> Result<Object, StoreError>;

    async fn create(&self, resource: &ResourceType, object: Object) -> Result<Object, StoreError>;

    /// Replaces the object. Fails with `Conflict` if its resourceVersion is
    /// stale.
    async fn update(&self, resource: &ResourceType, object: Object) -> Result<Object, StoreError>;

    async fn patch(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<Object, StoreError>;

    async fn delete(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError>;
}

/// What a store must do with an object after a delete request.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Finalizers remain; write back the object with its deletion timestamp.
    Persist,
    Remove,
}

pub fn check_uid_precondition(obj: &Object, options: &DeleteOptions) -> Result<(), StoreError> {
    match &options.uid {
        Some(uid) if uid != obj.uid() => Err(StoreError::Conflict(format!(
            "precondition failed: uid in precondition: {}, uid in object meta: {}",
            uid,
            obj.uid()
        ))),
        _ => Ok(()),
    }
}

/// Applies the propagation policy's finalizers to `obj` and decides whether
/// it can be removed right away.
pub fn prepare_delete(obj: &mut Object, policy: PropagationPolicy) -> DeleteOutcome {
    let finalizers = &mut obj.metadata.finalizers;
    match policy {
        PropagationPolicy::Default => {}
        PropagationPolicy::Background => finalizers.retain(|f| f != ORPHAN_FINALIZER),
        PropagationPolicy::Orphan => {
            finalizers.retain(|f| f != FOREGROUND_FINALIZER);
            if !finalizers.iter().any(|f| f == ORPHAN_FINALIZER) {
                finalizers.push(ORPHAN_FINALIZER.to_string());
            }
        }
        PropagationPolicy::Foreground => {
            finalizers.retain(|f| f != ORPHAN_FINALIZER);
            if !finalizers.iter().any(|f| f == FOREGROUND_FINALIZER) {
                finalizers.push(FOREGROUND_FINALIZER.to_string());
            }
        }
    }
    if obj.metadata.finalizers.is_empty() {
        return DeleteOutcome::Remove;
    }
    if obj.metadata.deletion_timestamp.is_none() {
        obj.metadata.deletion_timestamp = Some(Utc::now());
    }
    DeleteOutcome::Persist
}

/// A deleting object whose last finalizer is gone must be removed instead
/// of written back.
pub fn is_finalized(obj: &Object) -> bool {
    obj.is_being_deleted() && obj.metadata.finalizers.is_empty()
}

/// Deletion timestamp and uid are owned by the store; an update cannot
/// change them.
pub fn preserve_store_fields(existing: &Object, updated: &mut Object) {
    updated.metadata.uid = existing.metadata.uid.clone();
    if existing.metadata.deletion_timestamp.is_some() {
        updated.metadata.deletion_timestamp = existing.metadata.deletion_timestamp;
    }
}

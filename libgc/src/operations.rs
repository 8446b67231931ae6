use std::sync::Arc;

use log::{debug, warn};

use crate::error::GcError;
use crate::metrics;
use crate::models::{Object, ObjectReference, PropagationPolicy};
use crate::resolver::{ResourceResolver, ResourceType};
use crate::store::{DeleteOptions, ObjectPatch, ObjectStore};

/// Store requests addressed by object identity.
pub struct Operations {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn ResourceResolver>,
    finalizer_retries: usize,
}

impl Operations {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn ResourceResolver>,
        finalizer_retries: usize,
    ) -> Self {
        Operations {
            store,
            resolver,
            finalizer_retries: finalizer_retries.max(1),
        }
    }

    /// Resource and namespace to address `reference` with; cluster-scoped
    /// kinds ignore the namespace the reference inherited.
    fn locate<'a>(
        &self,
        reference: &'a ObjectReference,
    ) -> Result<(ResourceType, &'a str), GcError> {
        let mapping = self
            .resolver
            .resolve(&reference.api_version, &reference.kind)?;
        let namespace = if mapping.namespaced {
            reference.namespace.as_str()
        } else {
            ""
        };
        Ok((mapping.resource, namespace))
    }

    pub async fn get_object(&self, reference: &ObjectReference) -> Result<Object, GcError> {
        let (resource, namespace) = self.locate(reference)?;
        Ok(self
            .store
            .get(&resource, namespace, &reference.name)
            .await?)
    }

    /// Deletes the object only if it still has the referenced uid.
    pub async fn delete_object(
        &self,
        reference: &ObjectReference,
        policy: PropagationPolicy,
    ) -> Result<(), GcError> {
        let (resource, namespace) = self.locate(reference)?;
        let options = DeleteOptions::with_uid(reference.uid.clone(), policy);
        self.store
            .delete(&resource, namespace, &reference.name, &options)
            .await?;
        Ok(())
    }

    pub async fn patch_object(
        &self,
        reference: &ObjectReference,
        patch: &ObjectPatch,
    ) -> Result<Object, GcError> {
        let (resource, namespace) = self.locate(reference)?;
        debug!("patching {reference} with {}", patch.to_merge_patch());
        Ok(self
            .store
            .patch(&resource, namespace, &reference.name, patch)
            .await?)
    }

    pub async fn update_object(
        &self,
        reference: &ObjectReference,
        object: Object,
    ) -> Result<Object, GcError> {
        let (resource, _) = self.locate(reference)?;
        Ok(self.store.update(&resource, object).await?)
    }

    /// Removes `finalizer` from the object, re-reading it on every conflict.
    /// An object that is gone, replaced or already without the finalizer
    /// counts as done.
    pub async fn remove_finalizer(
        &self,
        reference: &ObjectReference,
        finalizer: &str,
    ) -> Result<(), GcError> {
        for attempt in 0..self.finalizer_retries {
            let mut obj = match self.get_object(reference).await {
                Ok(obj) => obj,
                Err(GcError::Store(e)) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            if obj.uid() != &reference.uid {
                debug!("{reference} was replaced, nothing to finalize");
                return Ok(());
            }
            if !obj.has_finalizer(finalizer) {
                return Ok(());
            }
            obj.metadata.finalizers.retain(|f| f != finalizer);
            match self.update_object(reference, obj).await {
                Ok(_) => {
                    debug!("removed the {finalizer} finalizer from {reference}");
                    metrics::record_finalizer_removed(finalizer);
                    return Ok(());
                }
                Err(GcError::Store(e)) if e.is_not_found() => return Ok(()),
                Err(GcError::Store(e)) if e.is_conflict() => {
                    warn!(
                        "conflict removing the {finalizer} finalizer from {reference} (attempt {})",
                        attempt + 1
                    );
                    metrics::record_conflict_retry();
                }
                Err(e) => return Err(e),
            }
        }
        Err(GcError::RetriesExhausted {
            object: reference.clone(),
            retries: self.finalizer_retries,
        })
    }
}

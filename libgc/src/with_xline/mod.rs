use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, KeyValue, Txn, TxnOp,
    WatchOptions, WatchResponse,
};
use futures::StreamExt;
use log::{debug, info, warn};

use crate::config::XlineConfig;
use crate::error::StoreError;
use crate::models::{Object, Uid};
use crate::resolver::ResourceType;
use crate::store::{
    DeleteOptions, DeleteOutcome, ObjectList, ObjectPatch, ObjectStore, WatchEvent,
    WatchEventType, WatchStream, check_uid_precondition, is_finalized, prepare_delete,
    preserve_store_fields,
};

/// Attempts at a read-modify-write before reporting a conflict.
const CAS_ATTEMPTS: usize = 5;

/// Object store on Xline.
///
/// k:/registry/pods/<namespace>/<name> v:yaml of the pod,
/// k:/registry/apps/replicasets/<namespace>/<name> v:yaml of the replicaset,
/// k:/registry/nodes/<name> v:yaml of a cluster-scoped node.
/// The key's mod revision is the object's resourceVersion.
#[derive(Clone)]
pub struct XlineStore {
    client: Client,
    prefix: String,
}

impl XlineStore {
    pub async fn new(config: &XlineConfig) -> Result<Self, StoreError> {
        let options = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(config.endpoints.clone(), options).await?;
        info!("connected to xline at {:?}", config.endpoints);
        Ok(XlineStore {
            client,
            prefix: config.prefix.trim_end_matches('/').to_string(),
        })
    }

    fn resource_prefix(&self, resource: &ResourceType) -> String {
        match resource.group() {
            "" => format!("{}/{}/", self.prefix, resource.resource),
            group => format!("{}/{}/{}/", self.prefix, group, resource.resource),
        }
    }

    fn key(&self, resource: &ResourceType, namespace: &str, name: &str) -> String {
        if namespace.is_empty() {
            format!("{}{name}", self.resource_prefix(resource))
        } else {
            format!("{}{namespace}/{name}", self.resource_prefix(resource))
        }
    }

    /// Current object and its mod revision.
    async fn read(&self, key: &str) -> Result<(Object, i64), StoreError> {
        let resp = self.client.clone().get(key, None).await?;
        match resp.kvs().first() {
            Some(kv) => Ok((decode(kv)?, kv.mod_revision())),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    /// Writes `object` (or deletes the key for `None`) if the key is still
    /// at `mod_revision`. Returns the new revision, or `None` if the key
    /// moved on.
    async fn write_if_unchanged(
        &self,
        key: &str,
        mod_revision: i64,
        object: Option<&Object>,
    ) -> Result<Option<i64>, StoreError> {
        let op = match object {
            Some(object) => TxnOp::put(key, encode(object)?, None),
            None => TxnOp::delete(key, None),
        };
        let txn = Txn::new()
            .when([Compare::mod_revision(key, CompareOp::Equal, mod_revision)])
            .and_then([op]);
        let resp = self.client.clone().txn(txn).await?;
        if !resp.succeeded() {
            return Ok(None);
        }
        Ok(Some(resp.header().map_or(0, |h| h.revision())))
    }

    /// Writes back an object, removing it when that drops its last
    /// finalizer during deletion.
    async fn write_back(
        &self,
        key: &str,
        mod_revision: i64,
        mut object: Object,
    ) -> Result<Option<Object>, StoreError> {
        if is_finalized(&object) {
            debug!("{} finalized, removing it", object.reference());
            return Ok(self
                .write_if_unchanged(key, mod_revision, None)
                .await?
                .map(|_| object));
        }
        object.metadata.resource_version.clear();
        Ok(self
            .write_if_unchanged(key, mod_revision, Some(&object))
            .await?
            .map(|rev| {
                object.metadata.resource_version = rev.to_string();
                object
            }))
    }
}

fn decode(kv: &KeyValue) -> Result<Object, StoreError> {
    let value = std::str::from_utf8(kv.value())?;
    let mut object: Object = serde_yaml::from_str(value)?;
    object.metadata.resource_version = kv.mod_revision().to_string();
    Ok(object)
}

/// The resourceVersion lives in the key's revision, never in the value.
fn encode(object: &Object) -> Result<String, StoreError> {
    let mut object = object.clone();
    object.metadata.resource_version.clear();
    Ok(serde_yaml::to_string(&object)?)
}

fn to_watch_events(resp: Result<WatchResponse, etcd_client::Error>) -> Vec<Result<WatchEvent, StoreError>> {
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => return vec![Err(e.into())],
    };
    if resp.canceled() {
        let err = if resp.compact_revision() > 0 {
            StoreError::Expired(format!("compacted at revision {}", resp.compact_revision()))
        } else {
            StoreError::Other(anyhow::anyhow!("watch canceled: {}", resp.cancel_reason()))
        };
        return vec![Err(err)];
    }
    let mut events = Vec::with_capacity(resp.events().len());
    for event in resp.events() {
        let converted = match event.event_type() {
            EventType::Put => event.kv().map(|kv| {
                let event_type = if kv.create_revision() == kv.mod_revision() {
                    WatchEventType::Added
                } else {
                    WatchEventType::Modified
                };
                decode(kv).map(|object| WatchEvent { event_type, object })
            }),
            EventType::Delete => event.prev_kv().map(|kv| {
                decode(kv).map(|object| WatchEvent {
                    event_type: WatchEventType::Deleted,
                    object,
                })
            }),
        };
        match converted {
            Some(Ok(event)) => events.push(Ok(event)),
            Some(Err(e)) => warn!("ignoring undecodable watch event: {e}"),
            None => warn!("ignoring {:?} watch event without a value", event.event_type()),
        }
    }
    events
}

#[async_trait]
impl ObjectStore for XlineStore {
    async fn list(&self, resource: &ResourceType) -> Result<ObjectList, StoreError> {
        let prefix = self.resource_prefix(resource);
        let resp = self
            .client
            .clone()
            .get(prefix.as_str(), Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let mut items = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match decode(kv) {
                Ok(object) => items.push(object),
                Err(e) => warn!("ignoring undecodable object under {prefix}: {e}"),
            }
        }
        Ok(ObjectList { items, revision })
    }

    async fn watch(
        &self,
        resource: &ResourceType,
        revision: i64,
    ) -> Result<WatchStream, StoreError> {
        let prefix = self.resource_prefix(resource);
        let options = WatchOptions::new()
            .with_prefix()
            .with_prev_key()
            .with_start_revision(revision + 1);
        let (watcher, stream) = self.client.clone().watch(prefix, Some(options)).await?;
        let events = stream
            .map(move |resp| {
                // Dropping the watcher ends the watch.
                let _watcher = &watcher;
                futures::stream::iter(to_watch_events(resp))
            })
            .flatten();
        Ok(events.boxed())
    }

    async fn get(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
    ) -> Result<Object, StoreError> {
        let key = self.key(resource, namespace, name);
        Ok(self.read(&key).await?.0)
    }

    async fn create(
        &self,
        resource: &ResourceType,
        mut object: Object,
    ) -> Result<Object, StoreError> {
        if object.metadata.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".to_string()));
        }
        if object.metadata.uid.is_empty() {
            object.metadata.uid = Uid::generate();
        }
        let key = self.key(resource, &object.metadata.namespace, &object.metadata.name);
        let txn = Txn::new()
            .when([Compare::version(key.as_str(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key.as_str(), encode(&object)?, None)]);
        let resp = self.client.clone().txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::Conflict(format!("{key} already exists")));
        }
        object.metadata.resource_version = resp.header().map_or(0, |h| h.revision()).to_string();
        Ok(object)
    }

    async fn update(
        &self,
        resource: &ResourceType,
        mut object: Object,
    ) -> Result<Object, StoreError> {
        let key = self.key(resource, &object.metadata.namespace, &object.metadata.name);
        let (existing, mod_revision) = self.read(&key).await?;
        if !object.metadata.uid.is_empty() && object.metadata.uid != existing.metadata.uid {
            return Err(StoreError::Conflict(format!(
                "{key}: uid {} does not match stored uid {}",
                object.metadata.uid, existing.metadata.uid
            )));
        }
        if !object.metadata.resource_version.is_empty()
            && object.metadata.resource_version != mod_revision.to_string()
        {
            return Err(StoreError::Conflict(format!(
                "{key}: resourceVersion {} is stale",
                object.metadata.resource_version
            )));
        }
        preserve_store_fields(&existing, &mut object);
        self.write_back(&key, mod_revision, object)
            .await?
            .ok_or_else(|| StoreError::Conflict(format!("{key} changed during update")))
    }

    async fn patch(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<Object, StoreError> {
        let key = self.key(resource, namespace, name);
        for _ in 0..CAS_ATTEMPTS {
            let (mut object, mod_revision) = self.read(&key).await?;
            if !patch.apply(&mut object)? {
                return Ok(object);
            }
            if let Some(patched) = self.write_back(&key, mod_revision, object).await? {
                return Ok(patched);
            }
            debug!("{key} changed while patching, retrying");
        }
        Err(StoreError::Conflict(format!("{key} kept changing during patch")))
    }

    async fn delete(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let key = self.key(resource, namespace, name);
        for _ in 0..CAS_ATTEMPTS {
            let (existing, mod_revision) = self.read(&key).await?;
            check_uid_precondition(&existing, options)?;
            let mut object = existing.clone();
            let written = match prepare_delete(&mut object, options.propagation_policy) {
                DeleteOutcome::Remove => self.write_if_unchanged(&key, mod_revision, None).await?,
                DeleteOutcome::Persist if object != existing => {
                    self.write_if_unchanged(&key, mod_revision, Some(&object))
                        .await?
                }
                DeleteOutcome::Persist => return Ok(()),
            };
            if written.is_some() {
                return Ok(());
            }
            debug!("{key} changed while deleting, retrying");
        }
        Err(StoreError::Conflict(format!("{key} kept changing during delete")))
    }
}

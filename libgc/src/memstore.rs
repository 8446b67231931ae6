use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};

use crate::error::StoreError;
use crate::models::{Object, Uid};
use crate::resolver::ResourceType;
use crate::store::{
    DeleteOptions, DeleteOutcome, ObjectList, ObjectPatch, ObjectStore, WatchEvent,
    WatchEventType, WatchStream, check_uid_precondition, is_finalized, prepare_delete,
    preserve_store_fields,
};

const DEFAULT_HISTORY_LIMIT: usize = 10_000;
const DEFAULT_ACTION_LIMIT: usize = 10_000;

/// One request served by a [`MemoryStore`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    pub verb: &'static str,
    pub resource: ResourceType,
    pub namespace: String,
    pub name: String,
}

type Revisioned = (i64, ResourceType, WatchEvent);

struct MemoryState {
    revision: i64,
    objects: HashMap<ResourceType, BTreeMap<(String, String), Object>>,
    history: VecDeque<Revisioned>,
    /// Watches must start at or after this revision.
    compacted: i64,
    /// The most recent requests, oldest first.
    actions: VecDeque<Action>,
    action_limit: usize,
}

impl MemoryState {
    fn record(&mut self, verb: &'static str, resource: &ResourceType, namespace: &str, name: &str) {
        if self.action_limit == 0 {
            return;
        }
        if self.actions.len() == self.action_limit {
            self.actions.pop_front();
        }
        self.actions.push_back(Action {
            verb,
            resource: resource.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
    }
}

/// Object store kept in process memory, with the same revision, watch and
/// deletion semantics as the Xline store. Used by tests and local runs.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<Revisioned>,
    history_limit: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        let (events, _) = broadcast::channel(4096);
        MemoryStore {
            state: Mutex::new(MemoryState {
                revision: 0,
                objects: HashMap::new(),
                history: VecDeque::new(),
                compacted: 0,
                actions: VecDeque::new(),
                action_limit: DEFAULT_ACTION_LIMIT,
            }),
            events,
            history_limit: history_limit.max(1),
        }
    }

    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    /// Keeps only the last `limit` requests in the action log; 0 turns the
    /// log off.
    pub fn with_action_limit(mut self, limit: usize) -> Self {
        let state = self.state.get_mut();
        state.action_limit = limit;
        state.actions.truncate(limit);
        self
    }

    /// The most recent requests served, in order.
    pub async fn actions(&self) -> Vec<Action> {
        self.state.lock().await.actions.iter().cloned().collect()
    }

    pub async fn clear_actions(&self) {
        self.state.lock().await.actions.clear();
    }

    /// Drops watch history up to and including `revision`.
    pub async fn compact(&self, revision: i64) {
        let mut state = self.state.lock().await;
        while state
            .history
            .front()
            .is_some_and(|(rev, _, _)| *rev <= revision)
        {
            state.history.pop_front();
        }
        state.compacted = state.compacted.max(revision);
    }

    /// Objects of `resource` currently stored, without recording an action.
    pub async fn snapshot(&self, resource: &ResourceType) -> Vec<Object> {
        let state = self.state.lock().await;
        state
            .objects
            .get(resource)
            .map(|objs| objs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Stores the new state of an object, or removes it for `Deleted`, and
    /// publishes the change.
    fn commit(
        &self,
        state: &mut MemoryState,
        resource: &ResourceType,
        event_type: WatchEventType,
        mut object: Object,
    ) -> Object {
        state.revision += 1;
        let revision = state.revision;
        let key = (
            object.metadata.namespace.clone(),
            object.metadata.name.clone(),
        );
        let objects = state.objects.entry(resource.clone()).or_default();
        if event_type == WatchEventType::Deleted {
            objects.remove(&key);
        } else {
            object.metadata.resource_version = revision.to_string();
            objects.insert(key, object.clone());
        }
        let event = WatchEvent {
            event_type,
            object: object.clone(),
        };
        state
            .history
            .push_back((revision, resource.clone(), event.clone()));
        while state.history.len() > self.history_limit {
            if let Some((rev, _, _)) = state.history.pop_front() {
                state.compacted = rev;
            }
        }
        // No receivers is fine.
        let _ = self.events.send((revision, resource.clone(), event));
        object
    }

    /// Writes `object` back, removing it if that drops its last finalizer
    /// during deletion.
    fn write_back(
        &self,
        state: &mut MemoryState,
        resource: &ResourceType,
        object: Object,
    ) -> Object {
        if is_finalized(&object) {
            debug!("{} finalized, removing it", object.reference());
            self.commit(state, resource, WatchEventType::Deleted, object)
        } else {
            self.commit(state, resource, WatchEventType::Modified, object)
        }
    }
}

fn not_found(resource: &ResourceType, namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound(format!("{resource} {namespace}/{name}"))
}

fn lookup(
    state: &MemoryState,
    resource: &ResourceType,
    namespace: &str,
    name: &str,
) -> Result<Object, StoreError> {
    state
        .objects
        .get(resource)
        .and_then(|objs| objs.get(&(namespace.to_string(), name.to_string())))
        .cloned()
        .ok_or_else(|| not_found(resource, namespace, name))
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, resource: &ResourceType) -> Result<ObjectList, StoreError> {
        let mut state = self.state.lock().await;
        state.record("list", resource, "", "");
        let items = state
            .objects
            .get(resource)
            .map(|objs| objs.values().cloned().collect())
            .unwrap_or_default();
        Ok(ObjectList {
            items,
            revision: state.revision,
        })
    }

    async fn watch(
        &self,
        resource: &ResourceType,
        revision: i64,
    ) -> Result<WatchStream, StoreError> {
        let mut state = self.state.lock().await;
        state.record("watch", resource, "", "");
        if revision < state.compacted {
            return Err(StoreError::Expired(format!(
                "revision {revision} is compacted, oldest available is {}",
                state.compacted
            )));
        }
        let backlog: Vec<Result<WatchEvent, StoreError>> = state
            .history
            .iter()
            .filter(|(rev, res, _)| *rev > revision && res == resource)
            .map(|(_, _, event)| Ok(event.clone()))
            .collect();
        // Subscribed under the lock: nothing committed after the backlog
        // snapshot can be missed.
        let rx = self.events.subscribe();
        let resource = resource.clone();
        let live = futures::stream::unfold(rx, move |mut rx| {
            let resource = resource.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((rev, res, event)) => {
                            if rev > revision && res == resource {
                                return Some((Ok(event), rx));
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            let err = StoreError::Expired(format!("watch fell {n} events behind"));
                            return Some((Err(err), rx));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(futures::stream::iter(backlog).chain(live).boxed())
    }

    async fn get(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
    ) -> Result<Object, StoreError> {
        let mut state = self.state.lock().await;
        state.record("get", resource, namespace, name);
        lookup(&state, resource, namespace, name)
    }

    async fn create(
        &self,
        resource: &ResourceType,
        mut object: Object,
    ) -> Result<Object, StoreError> {
        let mut state = self.state.lock().await;
        let (namespace, name) = (
            object.metadata.namespace.clone(),
            object.metadata.name.clone(),
        );
        state.record("create", resource, &namespace, &name);
        if name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".to_string()));
        }
        if lookup(&state, resource, &namespace, &name).is_ok() {
            return Err(StoreError::Conflict(format!(
                "{resource} {namespace}/{name} already exists"
            )));
        }
        if object.metadata.uid.is_empty() {
            object.metadata.uid = Uid::generate();
        }
        Ok(self.commit(&mut state, resource, WatchEventType::Added, object))
    }

    async fn update(
        &self,
        resource: &ResourceType,
        mut object: Object,
    ) -> Result<Object, StoreError> {
        let mut state = self.state.lock().await;
        let (namespace, name) = (
            object.metadata.namespace.clone(),
            object.metadata.name.clone(),
        );
        state.record("update", resource, &namespace, &name);
        let existing = lookup(&state, resource, &namespace, &name)?;
        if !object.metadata.uid.is_empty() && object.metadata.uid != existing.metadata.uid {
            return Err(StoreError::Conflict(format!(
                "uid {} does not match stored uid {}",
                object.metadata.uid, existing.metadata.uid
            )));
        }
        if !object.metadata.resource_version.is_empty()
            && object.metadata.resource_version != existing.metadata.resource_version
        {
            return Err(StoreError::Conflict(format!(
                "{resource} {namespace}/{name}: resourceVersion {} is stale",
                object.metadata.resource_version
            )));
        }
        preserve_store_fields(&existing, &mut object);
        Ok(self.write_back(&mut state, resource, object))
    }

    async fn patch(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        patch: &ObjectPatch,
    ) -> Result<Object, StoreError> {
        let mut state = self.state.lock().await;
        state.record("patch", resource, namespace, name);
        let mut object = lookup(&state, resource, namespace, name)?;
        if !patch.apply(&mut object)? {
            return Ok(object);
        }
        Ok(self.write_back(&mut state, resource, object))
    }

    async fn delete(
        &self,
        resource: &ResourceType,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.record("delete", resource, namespace, name);
        let existing = lookup(&state, resource, namespace, name)?;
        check_uid_precondition(&existing, options)?;
        let mut object = existing.clone();
        match prepare_delete(&mut object, options.propagation_policy) {
            DeleteOutcome::Remove => {
                self.commit(&mut state, resource, WatchEventType::Deleted, object);
            }
            DeleteOutcome::Persist if object != existing => {
                self.commit(&mut state, resource, WatchEventType::Modified, object);
            }
            DeleteOutcome::Persist => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FOREGROUND_FINALIZER, PropagationPolicy};
    use tokio::time::{Duration, timeout};

    fn pods() -> ResourceType {
        ResourceType::new("v1", "pods")
    }

    fn make_pod(name: &str) -> Object {
        Object::new("v1", "Pod", "default", name)
    }

    #[tokio::test]
    async fn test_create_assigns_uid_and_revision() {
        let store = MemoryStore::new();
        let pod = store.create(&pods(), make_pod("p1")).await.unwrap();
        assert!(!pod.uid().is_empty());
        assert_eq!(pod.metadata.resource_version, "1");

        let err = store.create(&pods(), make_pod("p1")).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let store = MemoryStore::new();
        let pod = store.create(&pods(), make_pod("p1")).await.unwrap();
        let mut first = pod.clone();
        first.metadata.labels.insert("a".to_string(), "b".to_string());
        store.update(&pods(), first).await.unwrap();

        let err = store.update(&pods(), pod).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_foreground_delete_persists_until_finalized() {
        let store = MemoryStore::new();
        let pod = store.create(&pods(), make_pod("p1")).await.unwrap();
        let options = DeleteOptions::with_uid(pod.uid().clone(), PropagationPolicy::Foreground);
        store
            .delete(&pods(), "default", "p1", &options)
            .await
            .unwrap();

        let mut deleting = store.get(&pods(), "default", "p1").await.unwrap();
        assert!(deleting.is_being_deleted());
        assert!(deleting.has_finalizer(FOREGROUND_FINALIZER));

        deleting.metadata.finalizers.clear();
        store.update(&pods(), deleting).await.unwrap();
        assert!(
            store
                .get(&pods(), "default", "p1")
                .await
                .unwrap_err()
                .is_not_found()
        );
    }

    #[tokio::test]
    async fn test_delete_uid_precondition() {
        let store = MemoryStore::new();
        store.create(&pods(), make_pod("p1")).await.unwrap();
        let options = DeleteOptions::with_uid(Uid::from("other"), PropagationPolicy::Default);
        let err = store
            .delete(&pods(), "default", "p1", &options)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.snapshot(&pods()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_replays_history_and_follows() {
        let store = MemoryStore::new();
        let list = store.list(&pods()).await.unwrap();
        store.create(&pods(), make_pod("p1")).await.unwrap();
        let mut stream = store.watch(&pods(), list.revision).await.unwrap();
        store.create(&pods(), make_pod("p2")).await.unwrap();
        store
            .create(&ResourceType::new("v1", "services"), make_pod("s1"))
            .await
            .unwrap();
        store
            .delete(&pods(), "default", "p1", &DeleteOptions::default())
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let event = timeout(Duration::from_secs(2), stream.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push((event.event_type, event.object.metadata.name));
        }
        assert_eq!(
            seen,
            vec![
                (WatchEventType::Added, "p1".to_string()),
                (WatchEventType::Added, "p2".to_string()),
                (WatchEventType::Deleted, "p1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_watch_compacted_revision_expires() {
        let store = MemoryStore::with_history_limit(1);
        store.create(&pods(), make_pod("p1")).await.unwrap();
        store.create(&pods(), make_pod("p2")).await.unwrap();
        let err = store.watch(&pods(), 0).await.err().unwrap();
        assert!(matches!(err, StoreError::Expired(_)));
        assert!(store.watch(&pods(), 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_actions_are_recorded() {
        let store = MemoryStore::new();
        store.create(&pods(), make_pod("p1")).await.unwrap();
        let _ = store.get(&pods(), "default", "missing").await;
        let verbs: Vec<_> = store.actions().await.iter().map(|a| a.verb).collect();
        assert_eq!(verbs, vec!["create", "get"]);
    }

    #[tokio::test]
    async fn test_action_log_is_bounded() {
        let store = MemoryStore::new().with_action_limit(2);
        store.create(&pods(), make_pod("p1")).await.unwrap();
        for name in ["a", "b"] {
            let _ = store.get(&pods(), "default", name).await;
        }
        let names: Vec<_> = store
            .actions()
            .await
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);

        let silent = MemoryStore::new().with_action_limit(0);
        silent.create(&pods(), make_pod("p1")).await.unwrap();
        assert!(silent.actions().await.is_empty());
    }
}

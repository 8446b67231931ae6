use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error, info, warn};

use crate::cache::AbsentOwnerCache;
use crate::graph::{Graph, Node};
use crate::metrics;
use crate::models::{
    Event, EventType, FOREGROUND_FINALIZER, ORPHAN_FINALIZER, Object, ObjectReference,
    OwnerReference, Uid,
};
use crate::workqueue::{QueueKey, WorkQueue};

pub const EVENT_QUEUE: &str = "graph_changes";
pub const DIRTY_QUEUE: &str = "attempt_to_delete";
pub const ORPHAN_QUEUE: &str = "attempt_to_orphan";

impl QueueKey for Event {
    type Key = (EventType, Uid, String);

    fn queue_key(&self) -> Self::Key {
        (
            self.event_type,
            self.object.metadata.uid.clone(),
            self.object.metadata.resource_version.clone(),
        )
    }
}

/// Owner references that differ between two versions of an object, keyed
/// by uid.
#[derive(Debug, Default, PartialEq)]
pub struct OwnerDiff {
    pub added: Vec<OwnerReference>,
    pub removed: Vec<OwnerReference>,
    /// (old, new) pairs with the same uid but different values.
    pub changed: Vec<(OwnerReference, OwnerReference)>,
}

impl OwnerDiff {
    pub fn compute(old: &[OwnerReference], new: &[OwnerReference]) -> Self {
        let old_by_uid: HashMap<&Uid, &OwnerReference> = old.iter().map(|r| (&r.uid, r)).collect();
        let new_by_uid: HashMap<&Uid, &OwnerReference> = new.iter().map(|r| (&r.uid, r)).collect();
        let mut diff = OwnerDiff::default();
        for r in new {
            match old_by_uid.get(&r.uid) {
                None => diff.added.push(r.clone()),
                Some(o) if *o != r => diff.changed.push(((*o).clone(), r.clone())),
                Some(_) => {}
            }
        }
        for r in old {
            if !new_by_uid.contains_key(&r.uid) {
                diff.removed.push(r.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Maintains the dependency graph from the event stream. The only writer of
/// the graph; runs as a single task.
pub struct Propagator {
    graph: Arc<Graph>,
    events: Arc<WorkQueue<Event>>,
    dirty: Arc<WorkQueue<Arc<Node>>>,
    orphans: Arc<WorkQueue<Arc<Node>>>,
    absent_owners: Arc<AbsentOwnerCache>,
}

impl Propagator {
    pub fn new(
        graph: Arc<Graph>,
        events: Arc<WorkQueue<Event>>,
        dirty: Arc<WorkQueue<Arc<Node>>>,
        orphans: Arc<WorkQueue<Arc<Node>>>,
        absent_owners: Arc<AbsentOwnerCache>,
    ) -> Self {
        Propagator {
            graph,
            events,
            dirty,
            orphans,
            absent_owners,
        }
    }

    /// Drains the event queue until it is shut down.
    pub async fn run(&self) {
        info!("[propagator] started");
        while self.process_next().await {}
        info!("[propagator] stopped");
    }

    /// Handles one event. Returns false once the queue has shut down.
    pub async fn process_next(&self) -> bool {
        let item = match self.events.get().await {
            Some(item) => item,
            None => return false,
        };
        let key = item.payload.queue_key();
        metrics::record_queue_latency(EVENT_QUEUE, item.enqueued_at);
        let res = AssertUnwindSafe(self.process_event(item.payload))
            .catch_unwind()
            .await;
        if res.is_err() {
            error!("[propagator] panicked while processing event {key:?}, dropping it");
            metrics::record_event_dropped("panic");
        }
        self.events.done(&key).await;
        true
    }

    pub async fn process_event(&self, event: Event) {
        let obj = &event.object;
        if obj.uid().is_empty() {
            error!(
                "[propagator] dropping {:?} event for {}/{} without uid",
                event.event_type, obj.metadata.namespace, obj.metadata.name
            );
            metrics::record_event_dropped("missing_uid");
            return;
        }
        debug!(
            "[propagator] {:?} event for {}",
            event.event_type,
            obj.reference()
        );
        let existing = self.graph.get(obj.uid()).await;
        match (event.event_type, existing) {
            (EventType::Add | EventType::Update, None) => self.observe_new(&event).await,
            (EventType::Add | EventType::Update, Some(node)) => {
                self.observe_existing(&event, node).await
            }
            (EventType::Delete, Some(node)) => self.observe_delete(obj, node).await,
            (EventType::Delete, None) => {
                debug!("[propagator] {} is already gone from the graph", obj.reference());
            }
        }
    }

    async fn observe_new(&self, event: &Event) {
        let obj = &event.object;
        let node = Arc::new(Node::new(obj.reference(), obj.owner_references().to_vec()));
        if obj.is_being_deleted() {
            node.mark_being_deleted();
        }
        self.graph.insert(node.clone()).await;
        self.add_dependent_to_owners(&node, obj.owner_references())
            .await;
        self.process_transitions(event, &node).await;
    }

    async fn observe_existing(&self, event: &Event, mut node: Arc<Node>) {
        let obj = &event.object;
        if node.is_virtual() {
            if node.identity() != &obj.reference() {
                node = self.replace_identity(&node, obj.reference()).await;
            }
            node.mark_observed();
        }

        let diff = OwnerDiff::compute(&node.owners().await, obj.owner_references());
        if !diff.is_empty() {
            debug!(
                "[propagator] owners of {} changed: {} added, {} removed, {} changed",
                node.identity(),
                diff.added.len(),
                diff.removed.len(),
                diff.changed.len()
            );
            self.enqueue_unblocked_owners(&diff).await;
            node.set_owners(obj.owner_references().to_vec()).await;
            self.add_dependent_to_owners(&node, &diff.added).await;
            self.remove_dependent_from_owners(&node, &diff.removed)
                .await;
        }

        if obj.is_being_deleted() {
            node.mark_being_deleted();
        }
        self.process_transitions(event, &node).await;
    }

    async fn observe_delete(&self, obj: &Object, node: Arc<Node>) {
        if !node.is_virtual() && node.identity() != &obj.reference() {
            // Raised for an identity the node no longer has.
            warn!(
                "[propagator] ignoring delete of {}, graph holds {}",
                obj.reference(),
                node.identity()
            );
            metrics::record_event_dropped("stale_identity");
            return;
        }

        let owners = node.owners().await;
        self.graph.remove(node.uid()).await;
        self.remove_dependent_from_owners(&node, &owners).await;

        let dependents = self.graph.dependents_of(&node).await;
        if !dependents.is_empty() {
            self.absent_owners.add(node.uid().clone()).await;
        }
        for dep in dependents {
            self.dirty.add(dep).await;
        }
        for owner in owners {
            if let Some(owner_node) = self.graph.get(&owner.uid).await {
                if owner_node.is_deleting_dependents() {
                    self.dirty.add(owner_node).await;
                }
            }
        }
    }

    async fn process_transitions(&self, event: &Event, node: &Arc<Node>) {
        let obj = &event.object;
        let orphan = obj.has_finalizer(ORPHAN_FINALIZER);
        let foreground = obj.has_finalizer(FOREGROUND_FINALIZER);

        if orphan {
            if event.deletion_starts() {
                if foreground {
                    warn!(
                        "[propagator] {} carries both the {} and {} finalizers, orphaning first",
                        node.identity(),
                        ORPHAN_FINALIZER,
                        FOREGROUND_FINALIZER
                    );
                }
                debug!("[propagator] add {} to the orphan queue", node.identity());
                self.orphans.add(node.clone()).await;
            }
            return;
        }

        // Not tied to the deletion start: a foreground finalizer left behind
        // once an orphan finalizer is removed must still be acted on.
        if foreground && obj.is_being_deleted() && !node.is_deleting_dependents() {
            debug!(
                "[propagator] {} is waiting for its dependents to be deleted",
                node.identity()
            );
            node.mark_deleting_dependents();
            for dep in self.graph.dependents_of(node).await {
                self.dirty.add(dep).await;
            }
            self.dirty.add(node.clone()).await;
        }
    }

    /// Links `node` into the dependents of each owner, creating virtual
    /// owner nodes for uids not seen yet.
    async fn add_dependent_to_owners(&self, node: &Arc<Node>, owners: &[OwnerReference]) {
        for owner in owners {
            let owner_node = match self.graph.get(&owner.uid).await {
                Some(owner_node) => owner_node,
                None => {
                    let identity = ObjectReference::from_owner(owner, &node.identity().namespace);
                    debug!("[propagator] add virtual node {identity}");
                    let owner_node = Arc::new(Node::new_virtual(identity));
                    self.graph.insert(owner_node.clone()).await;
                    self.dirty.add(owner_node.clone()).await;
                    owner_node
                }
            };
            owner_node.add_dependent(node.uid().clone()).await;
        }
    }

    async fn remove_dependent_from_owners(&self, node: &Node, owners: &[OwnerReference]) {
        for owner in owners {
            if let Some(owner_node) = self.graph.get(&owner.uid).await {
                owner_node.delete_dependent(node.uid()).await;
            }
        }
    }

    /// An owner waiting on its dependents may be free to go once a
    /// dependent stops blocking it.
    async fn enqueue_unblocked_owners(&self, diff: &OwnerDiff) {
        let removed = diff
            .removed
            .iter()
            .filter(|r| r.blocks_owner_deletion())
            .map(|r| &r.uid);
        let unblocked = diff
            .changed
            .iter()
            .filter(|(old, new)| old.blocks_owner_deletion() && !new.blocks_owner_deletion())
            .map(|(old, _)| &old.uid);
        for uid in removed.chain(unblocked) {
            if let Some(owner_node) = self.graph.get(uid).await {
                if owner_node.is_deleting_dependents() {
                    debug!(
                        "[propagator] {} is unblocked, add it to the dirty queue",
                        owner_node.identity()
                    );
                    self.dirty.add(owner_node).await;
                }
            }
        }
    }

    /// Swaps a virtual node for one carrying the observed identity. A
    /// dependent may have named the owner with the wrong kind or namespace.
    async fn replace_identity(&self, node: &Arc<Node>, identity: ObjectReference) -> Arc<Node> {
        debug!(
            "[propagator] virtual node {} observed as {}",
            node.identity(),
            identity
        );
        let replacement = Arc::new(Node::new_virtual(identity));
        for uid in node.dependent_uids().await {
            replacement.add_dependent(uid).await;
        }
        self.graph.insert(replacement.clone()).await;
        replacement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::time::Duration;

    struct Fixture {
        graph: Arc<Graph>,
        dirty: Arc<WorkQueue<Arc<Node>>>,
        orphans: Arc<WorkQueue<Arc<Node>>>,
        absent: Arc<AbsentOwnerCache>,
        propagator: Propagator,
    }

    fn queue<T: QueueKey + Send + 'static>(name: &'static str) -> Arc<WorkQueue<T>> {
        Arc::new(WorkQueue::new(
            name,
            Duration::from_millis(1),
            Duration::from_millis(10),
        ))
    }

    fn fixture() -> Fixture {
        let graph = Arc::new(Graph::new());
        let dirty = queue(DIRTY_QUEUE);
        let orphans = queue(ORPHAN_QUEUE);
        let absent = Arc::new(AbsentOwnerCache::new(16));
        let propagator = Propagator::new(
            graph.clone(),
            queue(EVENT_QUEUE),
            dirty.clone(),
            orphans.clone(),
            absent.clone(),
        );
        Fixture {
            graph,
            dirty,
            orphans,
            absent,
            propagator,
        }
    }

    fn owner_ref(uid: &str, block: bool) -> OwnerReference {
        OwnerReference {
            api_version: "v1".to_string(),
            kind: "ReplicationController".to_string(),
            name: format!("rc-{uid}"),
            uid: Uid::from(uid),
            controller: None,
            block_owner_deletion: Some(block),
        }
    }

    fn make_rc(uid: &str) -> Object {
        let mut rc = Object::new("v1", "ReplicationController", "ns", &format!("rc-{uid}"));
        rc.metadata.uid = Uid::from(uid);
        rc
    }

    fn make_pod(uid: &str, owners: Vec<OwnerReference>) -> Object {
        let mut pod = Object::new("v1", "Pod", "ns", &format!("pod-{uid}"));
        pod.metadata.uid = Uid::from(uid);
        pod.metadata.owner_references = owners;
        pod
    }

    async fn drain(queue: &WorkQueue<Arc<Node>>) -> Vec<String> {
        let mut res = Vec::new();
        while !queue.is_empty().await {
            if let Some(item) = queue.get().await {
                res.push(item.payload.uid().to_string());
                queue.done(&item.payload.queue_key()).await;
            }
        }
        res.sort();
        res
    }

    #[test]
    fn test_owner_diff() {
        let old = vec![owner_ref("a", true), owner_ref("b", false)];
        let new = vec![owner_ref("a", false), owner_ref("c", false)];
        let diff = OwnerDiff::compute(&old, &new);
        assert_eq!(diff.added, vec![owner_ref("c", false)]);
        assert_eq!(diff.removed, vec![owner_ref("b", false)]);
        assert_eq!(diff.changed, vec![(owner_ref("a", true), owner_ref("a", false))]);
        assert!(OwnerDiff::compute(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn test_add_creates_virtual_owner() {
        let f = fixture();
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![owner_ref("rc1", true)])))
            .await;

        let owner = f.graph.get(&Uid::from("rc1")).await.unwrap();
        assert!(owner.is_virtual());
        assert_eq!(owner.identity().namespace, "ns");
        assert_eq!(owner.dependent_uids().await, vec![Uid::from("p1")]);
        assert_eq!(drain(&f.dirty).await, vec!["rc1"]);

        f.propagator.process_event(Event::add(make_rc("rc1"))).await;
        let owner = f.graph.get(&Uid::from("rc1")).await.unwrap();
        assert!(!owner.is_virtual());
        assert_eq!(owner.dependents_len().await, 1);
    }

    #[tokio::test]
    async fn test_virtual_node_takes_observed_identity() {
        let f = fixture();
        let mut wrong = owner_ref("rs1", false);
        wrong.kind = "ReplicaSet".to_string();
        wrong.api_version = "extensions/v1beta1".to_string();
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![wrong])))
            .await;
        let mut rs = Object::new("apps/v1", "ReplicaSet", "ns", "rc-rs1");
        rs.metadata.uid = Uid::from("rs1");
        f.propagator.process_event(Event::add(rs)).await;

        let node = f.graph.get(&Uid::from("rs1")).await.unwrap();
        assert_eq!(node.identity().api_version, "apps/v1");
        assert!(!node.is_virtual());
        assert_eq!(node.dependent_uids().await, vec![Uid::from("p1")]);
    }

    #[tokio::test]
    async fn test_update_relinks_owners() {
        let f = fixture();
        f.propagator.process_event(Event::add(make_rc("rc1"))).await;
        f.propagator.process_event(Event::add(make_rc("rc2"))).await;
        let old = make_pod("p1", vec![owner_ref("rc1", false)]);
        f.propagator.process_event(Event::add(old.clone())).await;

        let new = make_pod("p1", vec![owner_ref("rc2", false)]);
        f.propagator.process_event(Event::update(old, new)).await;

        let rc1 = f.graph.get(&Uid::from("rc1")).await.unwrap();
        let rc2 = f.graph.get(&Uid::from("rc2")).await.unwrap();
        assert_eq!(rc1.dependents_len().await, 0);
        assert_eq!(rc2.dependent_uids().await, vec![Uid::from("p1")]);
        assert!(f.dirty.is_empty().await);
    }

    #[tokio::test]
    async fn test_delete_enqueues_dependents_and_records_absence() {
        let f = fixture();
        f.propagator.process_event(Event::add(make_rc("rc1"))).await;
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![owner_ref("rc1", false)])))
            .await;
        f.propagator
            .process_event(Event::add(make_pod("p2", vec![owner_ref("rc1", false)])))
            .await;

        f.propagator.process_event(Event::delete(make_rc("rc1"))).await;

        assert!(!f.graph.contains(&Uid::from("rc1")).await);
        assert!(f.absent.has(&Uid::from("rc1")).await);
        assert_eq!(drain(&f.dirty).await, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn test_delete_without_dependents_skips_absent_cache() {
        let f = fixture();
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![])))
            .await;
        f.propagator
            .process_event(Event::delete(make_pod("p1", vec![])))
            .await;
        assert!(f.graph.is_empty().await);
        assert!(f.absent.is_empty().await);
    }

    #[tokio::test]
    async fn test_orphan_finalizer_enqueues_orphan() {
        let f = fixture();
        let rc = make_rc("rc1");
        f.propagator.process_event(Event::add(rc.clone())).await;

        let mut deleting = rc.clone();
        deleting.metadata.deletion_timestamp = Some(Utc::now());
        deleting.metadata.finalizers = vec![
            ORPHAN_FINALIZER.to_string(),
            FOREGROUND_FINALIZER.to_string(),
        ];
        f.propagator
            .process_event(Event::update(rc, deleting.clone()))
            .await;

        let node = f.graph.get(&Uid::from("rc1")).await.unwrap();
        assert!(node.is_being_deleted());
        assert!(!node.is_deleting_dependents());
        assert_eq!(drain(&f.orphans).await, vec!["rc1"]);
        assert!(f.dirty.is_empty().await);

        // Resync of the same state does not orphan again.
        f.propagator
            .process_event(Event::update(deleting.clone(), deleting))
            .await;
        assert!(f.orphans.is_empty().await);
    }

    #[tokio::test]
    async fn test_foreground_marks_deleting_dependents() {
        let f = fixture();
        let mut rc = make_rc("rc1");
        f.propagator.process_event(Event::add(rc.clone())).await;
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![owner_ref("rc1", true)])))
            .await;

        let old = rc.clone();
        rc.metadata.deletion_timestamp = Some(Utc::now());
        rc.metadata.finalizers = vec![FOREGROUND_FINALIZER.to_string()];
        f.propagator.process_event(Event::update(old, rc)).await;

        let node = f.graph.get(&Uid::from("rc1")).await.unwrap();
        assert!(node.is_deleting_dependents());
        assert!(node.is_being_deleted());
        assert_eq!(drain(&f.dirty).await, vec!["p1", "rc1"]);
    }

    #[tokio::test]
    async fn test_unblocked_owner_is_requeued() {
        let f = fixture();
        let mut rc = make_rc("rc1");
        rc.metadata.deletion_timestamp = Some(Utc::now());
        rc.metadata.finalizers = vec![FOREGROUND_FINALIZER.to_string()];
        f.propagator.process_event(Event::add(rc)).await;
        let old = make_pod("p1", vec![owner_ref("rc1", true)]);
        f.propagator.process_event(Event::add(old.clone())).await;
        drain(&f.dirty).await;

        let new = make_pod("p1", vec![owner_ref("rc1", false)]);
        f.propagator.process_event(Event::update(old, new)).await;
        assert_eq!(drain(&f.dirty).await, vec!["rc1"]);
    }

    #[tokio::test]
    async fn test_deleted_dependent_requeues_waiting_owner() {
        let f = fixture();
        let mut rc = make_rc("rc1");
        rc.metadata.deletion_timestamp = Some(Utc::now());
        rc.metadata.finalizers = vec![FOREGROUND_FINALIZER.to_string()];
        f.propagator.process_event(Event::add(rc)).await;
        let pod = make_pod("p1", vec![owner_ref("rc1", true)]);
        f.propagator.process_event(Event::add(pod.clone())).await;
        drain(&f.dirty).await;

        f.propagator.process_event(Event::delete(pod)).await;
        assert_eq!(drain(&f.dirty).await, vec!["rc1"]);
        let rc = f.graph.get(&Uid::from("rc1")).await.unwrap();
        assert_eq!(rc.dependents_len().await, 0);
    }

    #[tokio::test]
    async fn test_stale_virtual_delete_is_ignored() {
        let f = fixture();
        f.propagator
            .process_event(Event::add(make_pod("p1", vec![])))
            .await;
        let mut stale = make_pod("p1", vec![]);
        stale.metadata.name = "old-name".to_string();
        f.propagator.process_event(Event::delete(stale)).await;
        assert!(f.graph.contains(&Uid::from("p1")).await);
    }

    #[tokio::test]
    async fn test_event_without_uid_is_dropped() {
        let f = fixture();
        let pod = Object::new("v1", "Pod", "ns", "nameless");
        f.propagator.process_event(Event::add(pod)).await;
        assert!(f.graph.is_empty().await);
    }
}

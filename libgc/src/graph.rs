use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use crate::models::{ObjectReference, OwnerReference, Uid};
use crate::workqueue::QueueKey;

/// One object in the dependency graph.
///
/// The propagator is the only writer. Workers read the flags and take the
/// reader side of `owners`/`dependents`.
pub struct Node {
    identity: ObjectReference,
    owners: RwLock<Vec<OwnerReference>>,
    /// Uids of the nodes naming this one as an owner.
    dependents: RwLock<HashSet<Uid>>,
    /// The object's deletion timestamp is set. Never reset.
    being_deleted: AtomicBool,
    /// Being deleted with the foreground finalizer. Implies `being_deleted`.
    deleting_dependents: AtomicBool,
    /// Only known as somebody's owner, not observed yet.
    virtual_node: AtomicBool,
}

impl Node {
    pub fn new(identity: ObjectReference, owners: Vec<OwnerReference>) -> Self {
        Node {
            identity,
            owners: RwLock::new(owners),
            dependents: RwLock::new(HashSet::new()),
            being_deleted: AtomicBool::new(false),
            deleting_dependents: AtomicBool::new(false),
            virtual_node: AtomicBool::new(false),
        }
    }

    pub fn new_virtual(identity: ObjectReference) -> Self {
        let node = Node::new(identity, Vec::new());
        node.virtual_node.store(true, Ordering::SeqCst);
        node
    }

    pub fn identity(&self) -> &ObjectReference {
        &self.identity
    }

    pub fn uid(&self) -> &Uid {
        &self.identity.uid
    }

    pub async fn owners(&self) -> Vec<OwnerReference> {
        self.owners.read().await.clone()
    }

    pub(crate) async fn set_owners(&self, owners: Vec<OwnerReference>) {
        *self.owners.write().await = owners;
    }

    pub(crate) async fn add_dependent(&self, uid: Uid) {
        self.dependents.write().await.insert(uid);
    }

    pub(crate) async fn delete_dependent(&self, uid: &Uid) {
        self.dependents.write().await.remove(uid);
    }

    /// Snapshot of the dependent uids, taken under the reader lock.
    pub async fn dependent_uids(&self) -> Vec<Uid> {
        self.dependents.read().await.iter().cloned().collect()
    }

    pub async fn dependents_len(&self) -> usize {
        self.dependents.read().await.len()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.being_deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_being_deleted(&self) {
        self.being_deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleting_dependents(&self) -> bool {
        self.deleting_dependents.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_deleting_dependents(&self) {
        self.mark_being_deleted();
        self.deleting_dependents.store(true, Ordering::SeqCst);
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_node.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_observed(&self) {
        self.virtual_node.store(false, Ordering::SeqCst);
    }

    /// Whether one of this node's owner references names `owner` with
    /// `blockOwnerDeletion` set.
    pub async fn blocks(&self, owner: &Uid) -> bool {
        self.owners
            .read()
            .await
            .iter()
            .any(|r| &r.uid == owner && r.blocks_owner_deletion())
    }
}

impl QueueKey for Arc<Node> {
    type Key = Uid;

    fn queue_key(&self) -> Uid {
        self.uid().clone()
    }
}

/// Concurrent uid → node map.
#[derive(Default)]
pub struct Graph {
    uid_to_node: RwLock<HashMap<Uid, Arc<Node>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, uid: &Uid) -> Option<Arc<Node>> {
        self.uid_to_node.read().await.get(uid).cloned()
    }

    pub async fn contains(&self, uid: &Uid) -> bool {
        self.uid_to_node.read().await.contains_key(uid)
    }

    pub(crate) async fn insert(&self, node: Arc<Node>) {
        self.uid_to_node
            .write()
            .await
            .insert(node.uid().clone(), node);
    }

    pub(crate) async fn remove(&self, uid: &Uid) -> Option<Arc<Node>> {
        self.uid_to_node.write().await.remove(uid)
    }

    pub async fn len(&self) -> usize {
        self.uid_to_node.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.uid_to_node.read().await.is_empty()
    }

    /// Resolves the dependents of `node` to their nodes.
    pub async fn dependents_of(&self, node: &Node) -> Vec<Arc<Node>> {
        let uids = node.dependent_uids().await;
        let map = self.uid_to_node.read().await;
        uids.iter().filter_map(|uid| map.get(uid).cloned()).collect()
    }

    /// Dependents holding a blocking owner reference to `node`.
    pub async fn blocking_dependents(&self, node: &Node) -> Vec<Arc<Node>> {
        let mut res = Vec::new();
        for dep in self.dependents_of(node).await {
            if dep.blocks(node.uid()).await {
                res.push(dep);
            }
        }
        res
    }
}

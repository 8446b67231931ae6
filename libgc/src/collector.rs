use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::select;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

use crate::cache::AbsentOwnerCache;
use crate::config::GcConfig;
use crate::error::GcError;
use crate::graph::{Graph, Node};
use crate::metrics;
use crate::models::{
    Event, FOREGROUND_FINALIZER, ORPHAN_FINALIZER, Object, ObjectReference, OwnerReference,
    PropagationPolicy, Uid,
};
use crate::monitor::Monitor;
use crate::operations::Operations;
use crate::propagator::{DIRTY_QUEUE, EVENT_QUEUE, ORPHAN_QUEUE, Propagator};
use crate::resolver::ResourceResolver;
use crate::store::{ObjectPatch, ObjectStore};
use crate::workqueue::{QueueItem, QueueKey, WorkQueue};

/// Owner references of one object, sorted by what the store says about
/// each owner.
#[derive(Debug, Default)]
pub struct OwnerClassification {
    /// The owner exists and is not waiting on its dependents.
    pub solid: Vec<OwnerReference>,
    /// The owner is gone.
    pub dangling: Vec<OwnerReference>,
    /// The owner is being deleted in the foreground.
    pub waiting: Vec<OwnerReference>,
}

fn new_queue<T: QueueKey + Send + 'static>(
    name: &'static str,
    config: &GcConfig,
) -> Arc<WorkQueue<T>> {
    Arc::new(WorkQueue::new(
        name,
        config.retry_base_delay(),
        config.retry_max_delay(),
    ))
}

pub struct GarbageCollector {
    graph: Arc<Graph>,
    events: Arc<WorkQueue<Event>>,
    dirty: Arc<WorkQueue<Arc<Node>>>,
    orphans: Arc<WorkQueue<Arc<Node>>>,
    absent_owners: Arc<AbsentOwnerCache>,
    propagator: Arc<Propagator>,
    monitors: Vec<Arc<Monitor>>,
    ops: Operations,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        resolver: Arc<dyn ResourceResolver>,
        config: &GcConfig,
    ) -> Self {
        let graph = Arc::new(Graph::new());
        let events: Arc<WorkQueue<Event>> = new_queue(EVENT_QUEUE, config);
        let dirty: Arc<WorkQueue<Arc<Node>>> = new_queue(DIRTY_QUEUE, config);
        let orphans: Arc<WorkQueue<Arc<Node>>> = new_queue(ORPHAN_QUEUE, config);
        let absent_owners = Arc::new(AbsentOwnerCache::new(config.absent_owner_cache_size));
        let propagator = Arc::new(Propagator::new(
            graph.clone(),
            events.clone(),
            dirty.clone(),
            orphans.clone(),
            absent_owners.clone(),
        ));

        let ignored: HashSet<&str> = config
            .ignored_resources
            .iter()
            .map(String::as_str)
            .collect();
        let mut seen = HashSet::new();
        let mut monitors = Vec::new();
        for mapping in resolver.resources() {
            if ignored.contains(mapping.resource.resource.as_str()) {
                debug!("not monitoring ignored resource {}", mapping.resource);
                continue;
            }
            if !seen.insert(mapping.resource.clone()) {
                continue;
            }
            monitors.push(Arc::new(Monitor::new(
                mapping,
                store.clone(),
                events.clone(),
                config.resync_period(),
            )));
        }

        GarbageCollector {
            graph,
            events,
            dirty,
            orphans,
            absent_owners,
            propagator,
            monitors,
            ops: Operations::new(store, resolver, config.finalizer_update_retries),
        }
    }

    pub fn graph(&self) -> &Arc<Graph> {
        &self.graph
    }

    pub fn absent_owners(&self) -> &Arc<AbsentOwnerCache> {
        &self.absent_owners
    }

    pub fn monitors(&self) -> &[Arc<Monitor>] {
        &self.monitors
    }

    /// Runs monitors, the propagator and `workers` workers per queue until
    /// `cancel` fires, then shuts the queues down and waits for every task.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        info!(
            "starting garbage collector with {} monitors and {workers} workers",
            self.monitors.len()
        );
        let mut tasks = JoinSet::new();
        for monitor in &self.monitors {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { monitor.run(cancel).await });
        }
        let propagator = self.propagator.clone();
        tasks.spawn(async move { propagator.run().await });

        if self.wait_for_sync(&cancel).await {
            info!("garbage collector caches synced");
            for _ in 0..workers {
                let gc = self.clone();
                tasks.spawn(async move { while gc.process_dirty_item().await {} });
                let gc = self.clone();
                tasks.spawn(async move { while gc.process_orphan_item().await {} });
            }
        }

        cancel.cancelled().await;
        info!("shutting down garbage collector");
        self.shut_down().await;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("garbage collector task failed: {e}");
            }
        }
        info!("garbage collector stopped");
    }

    /// Returns false if cancelled first.
    async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        while !self.has_synced() {
            select! {
                _ = cancel.cancelled() => return false,
                _ = sleep(Duration::from_millis(100)) => {}
            }
        }
        true
    }

    pub async fn shut_down(&self) {
        self.events.shut_down().await;
        self.dirty.shut_down().await;
        self.orphans.shut_down().await;
    }

    /// Every monitor has delivered its first list.
    pub fn has_synced(&self) -> bool {
        self.monitors.iter().all(|m| m.has_synced())
    }

    /// No queue holds a queued, in-flight or pending-retry item.
    ///
    /// The three queues are checked one after the other, so the result only
    /// counts if none of them changed during the pass: a worker may hand
    /// work to an already checked queue before finishing its own item.
    pub async fn queues_drained(&self) -> bool {
        let before = self.queue_generation();
        let idle = self.events.is_idle().await
            && self.dirty.is_idle().await
            && self.orphans.is_idle().await;
        idle && self.queue_generation() == before
    }

    fn queue_generation(&self) -> u64 {
        self.events
            .generation()
            .wrapping_add(self.dirty.generation())
            .wrapping_add(self.orphans.generation())
    }

    /// Whether any of `uids` still has a node in the graph.
    pub async fn graph_has_uid(&self, uids: &[Uid]) -> bool {
        for uid in uids {
            if self.graph.contains(uid).await {
                return true;
            }
        }
        false
    }

    /// Handles one dirty item. Returns false once the queue has shut down.
    pub async fn process_dirty_item(&self) -> bool {
        let item = match self.dirty.get().await {
            Some(item) => item,
            None => return false,
        };
        metrics::record_queue_latency(DIRTY_QUEUE, item.enqueued_at);
        let node = item.payload.clone();
        let res = AssertUnwindSafe(self.attempt_to_delete_item(&node))
            .catch_unwind()
            .await;
        self.finish(&self.dirty, item, res).await;
        true
    }

    /// Handles one owner being orphaned. Returns false once the queue has
    /// shut down.
    pub async fn process_orphan_item(&self) -> bool {
        let item = match self.orphans.get().await {
            Some(item) => item,
            None => return false,
        };
        metrics::record_queue_latency(ORPHAN_QUEUE, item.enqueued_at);
        let node = item.payload.clone();
        let res = AssertUnwindSafe(self.orphan_finalize(&node))
            .catch_unwind()
            .await;
        self.finish(&self.orphans, item, res).await;
        true
    }

    async fn finish(
        &self,
        queue: &Arc<WorkQueue<Arc<Node>>>,
        item: QueueItem<Arc<Node>>,
        res: std::thread::Result<Result<(), GcError>>,
    ) {
        let uid = item.payload.uid().clone();
        match res {
            Ok(Ok(())) => queue.forget(&uid).await,
            Ok(Err(e)) => {
                error!(
                    "[{}] error syncing item {}: {e}",
                    queue.name(),
                    item.payload.identity()
                );
                metrics::record_processing_error(queue.name());
                queue.add_rate_limited(item).await;
            }
            Err(_) => {
                error!(
                    "[{}] panicked while processing {}, requeueing",
                    queue.name(),
                    item.payload.identity()
                );
                metrics::record_processing_error(queue.name());
                queue.add_rate_limited(item).await;
            }
        }
        queue.done(&uid).await;
    }

    /// Decides the fate of one node: leave it, strip dead owner references,
    /// or delete it.
    pub async fn attempt_to_delete_item(&self, item: &Arc<Node>) -> Result<(), GcError> {
        debug!("processing item {}", item.identity());
        if item.is_being_deleted() && !item.is_deleting_dependents() {
            debug!(
                "{} is being deleted and not waiting on dependents, skipping",
                item.identity()
            );
            return Ok(());
        }

        let latest = match self.ops.get_object(item.identity()).await {
            Ok(latest) => latest,
            Err(GcError::Store(e)) if e.is_not_found() => {
                debug!("{} not found in the store", item.identity());
                self.enqueue_virtual_delete(item).await;
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if latest.uid() != item.uid() {
            debug!(
                "{} was replaced by uid {}",
                item.identity(),
                latest.uid()
            );
            self.enqueue_virtual_delete(item).await;
            return Ok(());
        }

        if item.is_deleting_dependents() {
            return self.process_deleting_dependents(item).await;
        }

        let owners = latest.owner_references();
        if owners.is_empty() {
            debug!("{} has no owners", item.identity());
            return Ok(());
        }

        let classified = self.classify_references(item, owners).await?;
        debug!(
            "classified owners of {}: {} solid, {} dangling, {} waiting",
            item.identity(),
            classified.solid.len(),
            classified.dangling.len(),
            classified.waiting.len()
        );

        if !classified.solid.is_empty() {
            let stale: Vec<Uid> = classified
                .dangling
                .iter()
                .chain(&classified.waiting)
                .map(|r| r.uid.clone())
                .collect();
            if stale.is_empty() {
                return Ok(());
            }
            let patch = ObjectPatch::delete_owner_references(item.uid().clone(), stale);
            return match self.ops.patch_object(item.identity(), &patch).await {
                Ok(_) => {
                    metrics::record_owner_reference_patches("dangling", 1);
                    Ok(())
                }
                Err(GcError::Store(e)) if e.is_not_found() => Ok(()),
                Err(e) => Err(e),
            };
        }

        if !classified.waiting.is_empty() && item.dependents_len().await > 0 {
            let blocking: Vec<Uid> = owners
                .iter()
                .filter(|r| r.blocks_owner_deletion())
                .map(|r| r.uid.clone())
                .collect();
            if !blocking.is_empty() {
                let patch = ObjectPatch::unblock_owner_references(item.uid().clone(), blocking);
                match self.ops.patch_object(item.identity(), &patch).await {
                    Ok(_) => metrics::record_owner_reference_patches("unblock", 1),
                    Err(GcError::Store(e)) if e.is_not_found() => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
            return self
                .delete_item(item, PropagationPolicy::Foreground)
                .await;
        }

        self.delete_item(item, PropagationPolicy::Default).await
    }

    async fn delete_item(
        &self,
        item: &Node,
        policy: PropagationPolicy,
    ) -> Result<(), GcError> {
        info!(
            "deleting {} with propagation policy {policy:?}",
            item.identity()
        );
        match self.ops.delete_object(item.identity(), policy).await {
            Ok(()) => {
                metrics::record_deletion(match policy {
                    PropagationPolicy::Foreground => "foreground",
                    _ => "default",
                });
                Ok(())
            }
            Err(GcError::Store(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// The item waits for its blocking dependents; once there are none its
    /// foreground finalizer goes.
    async fn process_deleting_dependents(&self, item: &Arc<Node>) -> Result<(), GcError> {
        let blocking = self.graph.blocking_dependents(item).await;
        if blocking.is_empty() {
            debug!(
                "{} has no blocking dependents left, removing the {} finalizer",
                item.identity(),
                FOREGROUND_FINALIZER
            );
            return self
                .ops
                .remove_finalizer(item.identity(), FOREGROUND_FINALIZER)
                .await;
        }
        debug!(
            "{} still has {} blocking dependents",
            item.identity(),
            blocking.len()
        );
        for dep in blocking {
            if dep.is_deleting_dependents() && self.waits_on(&dep, item.uid()).await {
                // Neither side can finish first; let this item go.
                info!(
                    "breaking deletion cycle between {} and {}",
                    item.identity(),
                    dep.identity()
                );
                let patch =
                    ObjectPatch::unblock_owner_references(dep.uid().clone(), [item.uid().clone()]);
                match self.ops.patch_object(dep.identity(), &patch).await {
                    Ok(_) => metrics::record_owner_reference_patches("unblock", 1),
                    Err(GcError::Store(e)) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            } else {
                self.dirty.add(dep).await;
            }
        }
        Ok(())
    }

    /// Whether `from` waits, directly or through other nodes deleting their
    /// dependents, on the node with uid `target`.
    async fn waits_on(&self, from: &Arc<Node>, target: &Uid) -> bool {
        let mut stack = vec![from.clone()];
        let mut visited = HashSet::new();
        while let Some(node) = stack.pop() {
            if !visited.insert(node.uid().clone()) {
                continue;
            }
            for dep in self.graph.blocking_dependents(&node).await {
                if dep.uid() == target {
                    return true;
                }
                if dep.is_deleting_dependents() {
                    stack.push(dep);
                }
            }
        }
        false
    }

    /// Looks every owner up, consulting the absent-owner cache first.
    pub async fn classify_references(
        &self,
        item: &Node,
        owners: &[OwnerReference],
    ) -> Result<OwnerClassification, GcError> {
        let mut res = OwnerClassification::default();
        for owner in owners {
            if self.absent_owners.has(&owner.uid).await {
                debug!("owner {} of {} is known absent", owner.uid, item.identity());
                res.dangling.push(owner.clone());
                continue;
            }
            let identity = ObjectReference::from_owner(owner, &item.identity().namespace);
            match self.ops.get_object(&identity).await {
                Ok(found) if found.uid() != &owner.uid => {
                    debug!("owner {identity} was replaced by uid {}", found.uid());
                    self.absent_owners.add(owner.uid.clone()).await;
                    res.dangling.push(owner.clone());
                }
                Ok(found) => {
                    if found.is_being_deleted() && found.has_finalizer(FOREGROUND_FINALIZER) {
                        res.waiting.push(owner.clone());
                    } else {
                        res.solid.push(owner.clone());
                    }
                }
                Err(GcError::Store(e)) if e.is_not_found() => {
                    debug!("owner {identity} not found");
                    self.absent_owners.add(owner.uid.clone()).await;
                    res.dangling.push(owner.clone());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(res)
    }

    async fn orphan_finalize(&self, owner: &Arc<Node>) -> Result<(), GcError> {
        let dependents = self.graph.dependents_of(owner).await;
        self.orphan_dependents(owner, &dependents).await?;
        self.ops
            .remove_finalizer(owner.identity(), ORPHAN_FINALIZER)
            .await
    }

    /// Removes `owner` from the owner references of every dependent. Fails
    /// as a whole if any patch fails.
    pub async fn orphan_dependents(
        &self,
        owner: &Node,
        dependents: &[Arc<Node>],
    ) -> Result<(), GcError> {
        let results = join_all(dependents.iter().map(|dep| async move {
            let patch = ObjectPatch::delete_owner_references(dep.uid().clone(), [owner.uid().clone()]);
            match self.ops.patch_object(dep.identity(), &patch).await {
                Ok(_) => Ok(true),
                Err(GcError::Store(e)) if e.is_not_found() => Ok(false),
                Err(e) => {
                    warn!(
                        "failed to orphan {} from {}: {e}",
                        dep.identity(),
                        owner.identity()
                    );
                    Err(e)
                }
            }
        }))
        .await;
        let mut patched = 0;
        let mut errors = Vec::new();
        for res in results {
            match res {
                Ok(true) => patched += 1,
                Ok(false) => {}
                Err(e) => errors.push(e),
            }
        }
        metrics::record_owner_reference_patches("orphan", patched);
        if errors.is_empty() {
            debug!(
                "orphaned {patched} of {} dependents of {}",
                dependents.len(),
                owner.identity()
            );
            return Ok(());
        }
        let failed = errors.len();
        Err(GcError::OrphanFailed {
            owner: owner.identity().clone(),
            failed,
            first: Box::new(errors.swap_remove(0)),
        })
    }

    /// Tells the propagator the item is gone without waiting for a watch
    /// event.
    async fn enqueue_virtual_delete(&self, item: &Node) {
        self.absent_owners.add(item.uid().clone()).await;
        self.events
            .add(Event::delete(Object::from_reference(item.identity())))
            .await;
    }
}

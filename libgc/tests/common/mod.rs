#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use libgc::config::GcConfig;
use libgc::{
    GarbageCollector, MemoryStore, Object, ObjectStore, OwnerReference, ResourceType,
    StaticResolver,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

pub const NAMESPACE: &str = "gc-test";

pub fn pods() -> ResourceType {
    ResourceType::new("v1", "pods")
}

pub fn rcs() -> ResourceType {
    ResourceType::new("v1", "replicationcontrollers")
}

pub fn test_config() -> GcConfig {
    GcConfig {
        workers: 5,
        resync_period_secs: 0,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 50,
        ..Default::default()
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub gc: Arc<GarbageCollector>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Harness {
    pub async fn start() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::start_with(store.clone(), store).await
    }

    /// Runs the collector against `client`, a view of `store`.
    pub async fn start_with(store: Arc<MemoryStore>, client: Arc<dyn ObjectStore>) -> Self {
        Self::start_with_config(store, client, test_config()).await
    }

    pub async fn start_with_config(
        store: Arc<MemoryStore>,
        client: Arc<dyn ObjectStore>,
        config: GcConfig,
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let gc = Arc::new(GarbageCollector::new(
            client,
            Arc::new(StaticResolver::with_defaults()),
            &config,
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(gc.clone().run(config.workers, cancel.clone()));
        let synced = gc.clone();
        assert!(
            eventually(Duration::from_secs(10), || {
                let gc = synced.clone();
                async move { gc.has_synced() }
            })
            .await,
            "monitors did not sync"
        );
        Harness {
            store,
            gc,
            cancel,
            handle,
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("collector did not stop")
            .expect("collector task failed");
    }

    pub async fn create_rc(&self, name: &str, finalizers: &[&str]) -> Object {
        let mut rc = Object::new("v1", "ReplicationController", NAMESPACE, name);
        rc.metadata.finalizers = finalizers.iter().map(|f| f.to_string()).collect();
        self.store.create(&rcs(), rc).await.unwrap()
    }

    pub async fn create_pod(&self, name: &str, owners: Vec<OwnerReference>) -> Object {
        let mut pod = Object::new("v1", "Pod", NAMESPACE, name);
        pod.metadata.owner_references = owners;
        self.store.create(&pods(), pod).await.unwrap()
    }

    pub async fn get_pod(&self, name: &str) -> Option<Object> {
        self.store.get(&pods(), NAMESPACE, name).await.ok()
    }

    pub async fn get_rc(&self, name: &str) -> Option<Object> {
        self.store.get(&rcs(), NAMESPACE, name).await.ok()
    }

    /// Waits for the queues to drain with `cond` holding.
    pub async fn converge<F, Fut>(&self, mut cond: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let gc = self.gc.clone();
        let deadline = Instant::now() + Duration::from_secs(30);
        while Instant::now() < deadline {
            if cond().await && gc.queues_drained().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

pub async fn eventually<F, Fut>(limit: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

pub fn owner_ref(owner: &Object, block: bool) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.metadata.name.clone(),
        uid: owner.uid().clone(),
        controller: None,
        block_owner_deletion: Some(block),
    }
}

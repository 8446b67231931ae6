use std::sync::Arc;
use std::time::Duration;

use etcd_client::{Client, DeleteOptions as EtcdDeleteOptions};
use futures::StreamExt;
use serial_test::serial;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use libgc::config::{GcConfig, XlineConfig};
use libgc::models::ORPHAN_FINALIZER;
use libgc::store::{DeleteOptions, ObjectPatch, WatchEventType};
use libgc::{
    GarbageCollector, Object, ObjectStore, OwnerReference, PropagationPolicy, ResourceType,
    StaticResolver, StoreError, XlineStore,
};

const XLINE_ENDPOINTS: &[&str] = &["127.0.0.1:2379"];
const PREFIX: &str = "/gc-test-registry";
const NAMESPACE: &str = "default";

fn pods() -> ResourceType {
    ResourceType::new("v1", "pods")
}

fn replicasets() -> ResourceType {
    ResourceType::new("apps/v1", "replicasets")
}

async fn connect() -> XlineStore {
    let config = XlineConfig {
        endpoints: XLINE_ENDPOINTS.iter().map(|e| e.to_string()).collect(),
        prefix: PREFIX.to_string(),
        username: None,
        password: None,
    };
    XlineStore::new(&config).await.unwrap()
}

async fn cleanup() {
    let mut client = Client::connect(XLINE_ENDPOINTS, None).await.unwrap();
    client
        .delete(PREFIX, Some(EtcdDeleteOptions::new().with_prefix()))
        .await
        .unwrap();
}

fn owner_ref(owner: &Object) -> OwnerReference {
    OwnerReference {
        api_version: owner.api_version.clone(),
        kind: owner.kind.clone(),
        name: owner.metadata.name.clone(),
        uid: owner.uid().clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[tokio::test]
#[serial]
#[ignore = "needs xline on 127.0.0.1:2379"]
async fn test_xline_crud() {
    cleanup().await;
    let store = connect().await;

    let pod = store
        .create(&pods(), Object::new("v1", "Pod", NAMESPACE, "p1"))
        .await
        .unwrap();
    assert!(!pod.uid().is_empty());
    assert!(!pod.metadata.resource_version.is_empty());

    let err = store
        .create(&pods(), Object::new("v1", "Pod", NAMESPACE, "p1"))
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let fetched = store.get(&pods(), NAMESPACE, "p1").await.unwrap();
    assert_eq!(fetched.uid(), pod.uid());
    assert_eq!(
        fetched.metadata.resource_version,
        pod.metadata.resource_version
    );

    let mut stale = fetched.clone();
    stale.metadata.labels.insert("a".to_string(), "b".to_string());
    store.update(&pods(), stale.clone()).await.unwrap();
    assert!(
        store
            .update(&pods(), stale)
            .await
            .unwrap_err()
            .is_conflict()
    );

    let list = store.list(&pods()).await.unwrap();
    assert_eq!(list.items.len(), 1);
    assert!(list.revision > 0);

    store
        .delete(&pods(), NAMESPACE, "p1", &DeleteOptions::default())
        .await
        .unwrap();
    assert!(matches!(
        store.get(&pods(), NAMESPACE, "p1").await,
        Err(StoreError::NotFound(_))
    ));
    cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore = "needs xline on 127.0.0.1:2379"]
async fn test_xline_delete_with_finalizer_and_patch() {
    cleanup().await;
    let store = connect().await;
    let mut rs = Object::new("apps/v1", "ReplicaSet", NAMESPACE, "rs1");
    rs.metadata.finalizers = vec![ORPHAN_FINALIZER.to_string()];
    let rs = store.create(&replicasets(), rs).await.unwrap();
    let mut pod = Object::new("v1", "Pod", NAMESPACE, "p1");
    pod.metadata.owner_references = vec![owner_ref(&rs)];
    let pod = store.create(&pods(), pod).await.unwrap();

    store
        .delete(
            &replicasets(),
            NAMESPACE,
            "rs1",
            &DeleteOptions::with_uid(rs.uid().clone(), PropagationPolicy::Default),
        )
        .await
        .unwrap();
    let deleting = store.get(&replicasets(), NAMESPACE, "rs1").await.unwrap();
    assert!(deleting.is_being_deleted());

    let patch = ObjectPatch::delete_owner_references(pod.uid().clone(), [rs.uid().clone()]);
    let patched = store.patch(&pods(), NAMESPACE, "p1", &patch).await.unwrap();
    assert!(patched.owner_references().is_empty());

    let mut finalized = deleting.clone();
    finalized.metadata.finalizers.clear();
    store.update(&replicasets(), finalized).await.unwrap();
    assert!(
        store
            .get(&replicasets(), NAMESPACE, "rs1")
            .await
            .unwrap_err()
            .is_not_found()
    );
    cleanup().await;
}

#[tokio::test]
#[serial]
#[ignore = "needs xline on 127.0.0.1:2379"]
async fn test_xline_watch_events() {
    cleanup().await;
    let store = connect().await;
    let revision = store.list(&pods()).await.unwrap().revision;
    let mut stream = store.watch(&pods(), revision).await.unwrap();

    let pod = store
        .create(&pods(), Object::new("v1", "Pod", NAMESPACE, "w1"))
        .await
        .unwrap();
    let mut labelled = pod.clone();
    labelled.metadata.labels.insert("x".to_string(), "y".to_string());
    store.update(&pods(), labelled).await.unwrap();
    store
        .delete(&pods(), NAMESPACE, "w1", &DeleteOptions::default())
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("watch stalled")
            .expect("watch ended")
            .unwrap();
        assert_eq!(event.object.uid(), pod.uid());
        seen.push(event.event_type);
    }
    assert_eq!(
        seen,
        vec![
            WatchEventType::Added,
            WatchEventType::Modified,
            WatchEventType::Deleted
        ]
    );
    cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
#[ignore = "needs xline on 127.0.0.1:2379"]
async fn test_xline_cascading_deletion() {
    cleanup().await;
    let store = Arc::new(connect().await);
    let config = GcConfig {
        resync_period_secs: 0,
        retry_base_delay_ms: 1,
        retry_max_delay_ms: 100,
        ..Default::default()
    };
    let gc = Arc::new(GarbageCollector::new(
        store.clone(),
        Arc::new(StaticResolver::with_defaults()),
        &config,
    ));
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(gc.clone().run(config.workers, cancel.clone()));

    let rs = store
        .create(
            &replicasets(),
            Object::new("apps/v1", "ReplicaSet", NAMESPACE, "rs1"),
        )
        .await
        .unwrap();
    let mut pod = Object::new("v1", "Pod", NAMESPACE, "p1");
    pod.metadata.owner_references = vec![owner_ref(&rs)];
    store.create(&pods(), pod).await.unwrap();

    timeout(Duration::from_secs(10), async {
        while gc.graph().len().await < 2 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("collector never observed the objects");

    store
        .delete(&replicasets(), NAMESPACE, "rs1", &DeleteOptions::default())
        .await
        .unwrap();

    timeout(Duration::from_secs(10), async {
        while store.get(&pods(), NAMESPACE, "p1").await.is_ok() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("dependent pod was not collected");

    cancel.cancel();
    handle.await.unwrap();
    cleanup().await;
}

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::select;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, Interval, interval_at, sleep};
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::models::{Event, Object, Uid};
use crate::resolver::ResourceMapping;
use crate::store::{ObjectStore, WatchEvent, WatchEventType};
use crate::workqueue::WorkQueue;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// List+watch loop over one resource, turning store changes into
/// propagator events.
pub struct Monitor {
    mapping: ResourceMapping,
    store: Arc<dyn ObjectStore>,
    events: Arc<WorkQueue<Event>>,
    resync_period: Duration,
    synced: AtomicBool,
    /// Last state seen per uid; the old object of update events.
    known: Mutex<HashMap<Uid, Object>>,
}

impl Monitor {
    pub fn new(
        mapping: ResourceMapping,
        store: Arc<dyn ObjectStore>,
        events: Arc<WorkQueue<Event>>,
        resync_period: Duration,
    ) -> Self {
        Monitor {
            mapping,
            store,
            events,
            resync_period,
            synced: AtomicBool::new(false),
            known: Mutex::new(HashMap::new()),
        }
    }

    pub fn mapping(&self) -> &ResourceMapping {
        &self.mapping
    }

    /// Whether the first list has been delivered.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("[monitor] starting {}", self.mapping.resource);
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let res = select! {
                _ = cancel.cancelled() => break,
                res = self.list_and_watch(&cancel, &mut backoff) => res,
            };
            match res {
                Ok(()) => break,
                Err(StoreError::Expired(msg)) => {
                    info!("[monitor] {} watch expired ({msg}), relisting", self.mapping.resource);
                }
                Err(e) => {
                    warn!(
                        "[monitor] {} list/watch failed: {e}, retrying in {backoff:?}",
                        self.mapping.resource
                    );
                    select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
        info!("[monitor] stopped {}", self.mapping.resource);
    }

    /// Returns `Ok` only when cancelled.
    async fn list_and_watch(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<(), StoreError> {
        let resource = &self.mapping.resource;
        let list = self.store.list(resource).await?;
        debug!(
            "[monitor] listed {} {resource} at revision {}",
            list.items.len(),
            list.revision
        );
        self.replace(list.items).await;
        self.synced.store(true, Ordering::SeqCst);
        *backoff = INITIAL_BACKOFF;

        let mut stream = self.store.watch(resource, list.revision).await?;
        let mut resync = (!self.resync_period.is_zero()).then(|| {
            interval_at(Instant::now() + self.resync_period, self.resync_period)
        });
        loop {
            select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick(&mut resync) => self.resync().await,
                msg = stream.next() => match msg {
                    Some(Ok(event)) => self.handle(event).await,
                    Some(Err(e)) => return Err(e),
                    None => return Err(StoreError::Expired(format!("{resource} watch closed"))),
                },
            }
        }
    }

    async fn handle(&self, event: WatchEvent) {
        let object = event.object;
        let uid = object.uid().clone();
        let mut known = self.known.lock().await;
        let event = match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                match known.insert(uid, object.clone()) {
                    Some(old) => Event::update(old, object),
                    None => Event::add(object),
                }
            }
            WatchEventType::Deleted => {
                known.remove(&uid);
                Event::delete(object)
            }
        };
        drop(known);
        self.events.add(event).await;
    }

    /// Installs a fresh list, synthesizing deletes for objects that vanished
    /// since the last one.
    async fn replace(&self, items: Vec<Object>) {
        let mut known = self.known.lock().await;
        let mut fresh = HashMap::with_capacity(items.len());
        let mut events = Vec::with_capacity(items.len());
        for object in items {
            let uid = object.uid().clone();
            events.push(match known.remove(&uid) {
                Some(old) => Event::update(old, object.clone()),
                None => Event::add(object.clone()),
            });
            fresh.insert(uid, object);
        }
        for (_, gone) in known.drain() {
            events.push(Event::delete(gone));
        }
        *known = fresh;
        drop(known);
        for event in events {
            self.events.add(event).await;
        }
    }

    async fn resync(&self) {
        let objects: Vec<Object> = self.known.lock().await.values().cloned().collect();
        debug!(
            "[monitor] resyncing {} {}",
            objects.len(),
            self.mapping.resource
        );
        for object in objects {
            self.events.add(Event::update(object.clone(), object)).await;
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

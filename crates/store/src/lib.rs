//! ekspose store: the cache mirror of watched Deployments.
//!
//! A single ingest task owns the writable state. It coalesces stream events per
//! key, applies them in batches, publishes an immutable snapshot through
//! `ArcSwap` and only then notifies the registered handlers, so a handler that
//! enqueues a key can rely on readers already seeing the state that caused it.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use ekspose_core::{EventHandler, LogicalKey, PrimaryObject, StreamEvent, WatchEvent};
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Coalescing buffer keyed by logical key with FIFO order of first arrival.
/// A later event for a buffered key replaces the earlier one.
#[derive(Default)]
pub struct Coalescer {
    map: FxHashMap<LogicalKey, WatchEvent>,
    order: VecDeque<LogicalKey>,
}

impl Coalescer {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }

    pub fn push(&mut self, ev: WatchEvent) {
        let key = ev.key();
        if !self.map.contains_key(&key) {
            self.order.push_back(key.clone());
        }
        self.map.insert(key, ev);
    }

    pub fn drain_ready(&mut self) -> Vec<WatchEvent> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

/// Persistent map: freezing a snapshot shares structure instead of copying every entry.
type Items = im::HashMap<LogicalKey, Arc<PrimaryObject>>;

/// Immutable view published to readers.
#[derive(Debug, Default)]
pub struct MirrorSnapshot {
    pub epoch: u64,
    /// True once at least one full listing has been merged.
    pub synced: bool,
    items: Items,
}

impl MirrorSnapshot {
    pub fn get(&self, key: &LogicalKey) -> Option<Arc<PrimaryObject>> {
        self.items.get(key).cloned()
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn keys(&self) -> Vec<LogicalKey> {
        let mut keys: Vec<_> = self.items.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }
}

/// Single-writer state behind the mirror. Returns the events that were actually applied.
#[derive(Default)]
pub struct MirrorBuilder {
    epoch: u64,
    synced: bool,
    items: Items,
}

impl MirrorBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn apply(&mut self, batch: Vec<WatchEvent>) -> Vec<WatchEvent> {
        for ev in batch.iter() {
            match ev {
                WatchEvent::Added(o) | WatchEvent::Updated(o) => {
                    self.items.insert(o.key(), Arc::new(o.clone()));
                }
                WatchEvent::Deleted(o) => {
                    self.items.remove(&o.key());
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        batch
    }

    /// Replace the content with a full listing. Objects missing from the listing
    /// yield a synthesized `Deleted` carrying their last known state.
    pub fn relist(&mut self, list: Vec<PrimaryObject>) -> Vec<WatchEvent> {
        let mut events = Vec::with_capacity(list.len());
        let mut seen: FxHashSet<LogicalKey> = FxHashSet::default();
        let mut next = Items::new();
        for o in list {
            let key = o.key();
            let ev = if self.items.contains_key(&key) { WatchEvent::Updated(o.clone()) } else { WatchEvent::Added(o.clone()) };
            events.push(ev);
            seen.insert(key.clone());
            next.insert(key, Arc::new(o));
        }
        let mut gone: Vec<_> = self.items.iter().filter(|(k, _)| !seen.contains(*k)).map(|(_, v)| v.clone()).collect();
        gone.sort_unstable_by(|a, b| a.key().cmp(&b.key()));
        events.extend(gone.into_iter().map(|o| WatchEvent::Deleted((*o).clone())));
        self.items = next;
        self.synced = true;
        self.epoch = self.epoch.saturating_add(1);
        events
    }

    pub fn freeze(&self) -> Arc<MirrorSnapshot> {
        Arc::new(MirrorSnapshot { epoch: self.epoch, synced: self.synced, items: self.items.clone() })
    }
}

/// Result of a point lookup against the mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Arc<PrimaryObject>),
    Absent,
    /// No full listing merged yet; absence means nothing.
    NotWarm,
}

/// Read handle shared by workers. Never blocks on cluster I/O.
#[derive(Clone)]
pub struct CacheMirror {
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
    ready_rx: watch::Receiver<bool>,
}

impl CacheMirror {
    pub fn current(&self) -> Arc<MirrorSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<PrimaryObject>> {
        self.current().get(&LogicalKey::new(namespace, name))
    }

    pub fn lookup(&self, key: &LogicalKey) -> Lookup {
        let snap = self.snap.load();
        if !snap.synced {
            return Lookup::NotWarm;
        }
        match snap.get(key) {
            Some(o) => Lookup::Found(o),
            None => Lookup::Absent,
        }
    }

    pub fn ready(&self) -> bool { *self.ready_rx.borrow() }

    /// Resolves once the first full listing is merged. Returns false if the
    /// ingest loop stopped before that happened.
    pub async fn wait_ready(&self) -> bool {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return true;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }
}

/// Write side of the mirror. Exactly one exists per mirror; the ingest loop owns it.
pub struct MirrorWriter {
    builder: MirrorBuilder,
    snap: Arc<ArcSwap<MirrorSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    ready_tx: watch::Sender<bool>,
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl MirrorWriter {
    /// Create a writer and its read handle without spawning an ingest loop.
    pub fn new(handlers: Vec<Arc<dyn EventHandler>>) -> (Self, CacheMirror) {
        let snap = Arc::new(ArcSwap::from_pointee(MirrorSnapshot::default()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (ready_tx, ready_rx) = watch::channel(false);
        let mirror = CacheMirror { snap: Arc::clone(&snap), epoch_rx, ready_rx };
        (Self { builder: MirrorBuilder::new(), snap, epoch_tx, ready_tx, handlers }, mirror)
    }

    pub fn apply(&mut self, batch: Vec<WatchEvent>) {
        if batch.is_empty() {
            return;
        }
        let applied = self.builder.apply(batch);
        self.publish(applied);
    }

    pub fn relist(&mut self, list: Vec<PrimaryObject>) {
        let applied = self.builder.relist(list);
        self.publish(applied);
    }

    fn publish(&self, applied: Vec<WatchEvent>) {
        let next = self.builder.freeze();
        let epoch = next.epoch;
        let synced = next.synced;
        gauge!("cache_objects", next.len() as f64);
        gauge!("cache_epoch", epoch as f64);
        self.snap.store(next);
        self.epoch_tx.send_replace(epoch);
        if synced && !*self.ready_tx.borrow() {
            info!(epoch, "cache mirror warm");
            self.ready_tx.send_replace(true);
        }
        for ev in applied.iter() {
            for h in self.handlers.iter() {
                h.on_event(ev);
            }
        }
    }
}

/// Spawn the ingest loop. Returns the sender the watcher feeds and the read handle.
/// The loop exits once every sender is dropped, after flushing what it buffered.
pub fn spawn_ingest(cap: usize, handlers: Vec<Arc<dyn EventHandler>>) -> (mpsc::Sender<StreamEvent>, CacheMirror) {
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(cap.max(1));
    let (mut writer, mirror) = MirrorWriter::new(handlers);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::new();
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(StreamEvent::Event(ev)) => coalescer.push(ev),
                        Some(StreamEvent::Relisted(list)) => {
                            debug!(count = list.len(), "relist");
                            // Buffered events predate the listing.
                            writer.apply(coalescer.drain_ready());
                            writer.relist(list);
                        }
                        None => {
                            debug!("stream channel closed; draining and exiting ingest loop");
                            writer.apply(coalescer.drain_ready());
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    writer.apply(coalescer.drain_ready());
                }
            }
        }
        info!("ingest loop stopped");
    });

    (tx, mirror)
}

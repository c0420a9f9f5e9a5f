#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use ekspose_core::{EventHandler, LogicalKey, PrimaryObject, WatchEvent};
use ekspose_store::{Coalescer, Lookup, MirrorBuilder, MirrorWriter};

fn obj(ns: &str, name: &str, rv: &str) -> PrimaryObject {
    PrimaryObject {
        namespace: ns.into(),
        name: name.into(),
        uid: format!("uid-{}-{}", ns, name),
        resource_version: Some(rv.into()),
        ..Default::default()
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl EventHandler for Recorder {
    fn on_event(&self, ev: &WatchEvent) {
        let tag = match ev {
            WatchEvent::Added(_) => "+",
            WatchEvent::Updated(_) => "~",
            WatchEvent::Deleted(_) => "-",
        };
        self.seen.lock().unwrap().push(format!("{}{}", tag, ev.key()));
    }
}

#[test]
fn coalescer_keeps_last_event_per_key_in_first_arrival_order() {
    let mut c = Coalescer::new();
    c.push(WatchEvent::Added(obj("ns", "a", "1")));
    c.push(WatchEvent::Added(obj("ns", "b", "1")));
    c.push(WatchEvent::Updated(obj("ns", "a", "2")));
    c.push(WatchEvent::Deleted(obj("ns", "a", "2")));
    assert_eq!(c.len(), 2);
    let out = c.drain_ready();
    assert!(matches!(&out[0], WatchEvent::Deleted(o) if o.name == "a"));
    assert!(matches!(&out[1], WatchEvent::Added(o) if o.name == "b"));
    assert!(c.is_empty());
}

#[test]
fn replay_basic_sequence() {
    let mut mb = MirrorBuilder::new();
    mb.apply(vec![
        WatchEvent::Added(obj("ns", "a", "1")),
        WatchEvent::Added(obj("ns", "a", "1")),
        WatchEvent::Added(obj("ns", "b", "1")),
    ]);
    let snap1 = mb.freeze();
    assert_eq!(snap1.epoch, 1);
    assert_eq!(snap1.len(), 2);
    assert!(!snap1.synced);

    mb.apply(vec![WatchEvent::Updated(obj("ns", "a", "2")), WatchEvent::Deleted(obj("ns", "b", "1"))]);
    let snap2 = mb.freeze();
    assert_eq!(snap2.epoch, 2);
    assert_eq!(snap2.keys(), vec![LogicalKey::new("ns", "a")]);
    assert_eq!(snap2.get(&LogicalKey::new("ns", "a")).unwrap().resource_version.as_deref(), Some("2"));
    // Earlier snapshots are immutable.
    assert_eq!(snap1.len(), 2);
}

#[test]
fn freezing_shares_untouched_entries_between_snapshots() {
    let mut mb = MirrorBuilder::new();
    mb.apply((0..1000).map(|i| WatchEvent::Added(obj("ns", &format!("d{}", i), "1"))).collect());
    let before = mb.freeze();
    mb.apply(vec![WatchEvent::Updated(obj("ns", "d7", "2"))]);
    let after = mb.freeze();

    let untouched = LogicalKey::new("ns", "d500");
    assert!(Arc::ptr_eq(&before.get(&untouched).unwrap(), &after.get(&untouched).unwrap()));
    let changed = LogicalKey::new("ns", "d7");
    assert_eq!(before.get(&changed).unwrap().resource_version.as_deref(), Some("1"));
    assert_eq!(after.get(&changed).unwrap().resource_version.as_deref(), Some("2"));
}

#[test]
fn relist_replaces_content_and_synthesizes_deletes() {
    let mut mb = MirrorBuilder::new();
    mb.apply(vec![WatchEvent::Added(obj("ns", "a", "1")), WatchEvent::Added(obj("ns", "stale", "1"))]);
    let events = mb.relist(vec![obj("ns", "a", "3"), obj("ns", "c", "1")]);
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], WatchEvent::Updated(o) if o.name == "a"));
    assert!(matches!(&events[1], WatchEvent::Added(o) if o.name == "c"));
    assert!(matches!(&events[2], WatchEvent::Deleted(o) if o.name == "stale"));
    let snap = mb.freeze();
    assert!(snap.synced);
    assert_eq!(snap.keys(), vec![LogicalKey::new("ns", "a"), LogicalKey::new("ns", "c")]);
}

#[test]
fn lookups_report_not_warm_until_first_listing() {
    let (mut writer, mirror) = MirrorWriter::new(Vec::new());
    let key = LogicalKey::new("app", "web");
    writer.apply(vec![WatchEvent::Added(obj("app", "web", "1"))]);
    assert!(!mirror.ready());
    assert_eq!(mirror.lookup(&key), Lookup::NotWarm);
    // Point reads work regardless of warmth.
    assert!(mirror.get("app", "web").is_some());

    writer.relist(vec![obj("app", "web", "1")]);
    assert!(mirror.ready());
    assert!(matches!(mirror.lookup(&key), Lookup::Found(o) if o.name == "web"));
    assert_eq!(mirror.lookup(&LogicalKey::new("app", "gone")), Lookup::Absent);
}

#[test]
fn handlers_observe_events_after_readers_do() {
    struct Observer {
        mirror: Mutex<Option<ekspose_store::CacheMirror>>,
        visible: Mutex<Vec<bool>>,
    }
    impl EventHandler for Observer {
        fn on_event(&self, ev: &WatchEvent) {
            let m = self.mirror.lock().unwrap();
            let present = m.as_ref().and_then(|m| m.get(&ev.object().namespace, &ev.object().name)).is_some();
            self.visible.lock().unwrap().push(present);
        }
    }
    let observer = Arc::new(Observer { mirror: Mutex::new(None), visible: Mutex::new(Vec::new()) });
    let recorder = Arc::new(Recorder::default());
    let (mut writer, mirror) = MirrorWriter::new(vec![observer.clone() as Arc<dyn EventHandler>, recorder.clone() as Arc<dyn EventHandler>]);
    *observer.mirror.lock().unwrap() = Some(mirror);

    writer.apply(vec![WatchEvent::Added(obj("ns", "a", "1"))]);
    writer.apply(vec![WatchEvent::Deleted(obj("ns", "a", "1"))]);
    assert_eq!(*observer.visible.lock().unwrap(), vec![true, false]);
    assert_eq!(*recorder.seen.lock().unwrap(), vec!["+ns/a".to_string(), "-ns/a".to_string()]);
}

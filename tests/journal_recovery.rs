use std::fs;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use ontosync::mapper::vocab;
use ontosync::{
    BufferConfig, ChangeCategory, ChangeOrigin, ConnectivityConfig, ConnectivityEvent,
    ConnectivityTracker, DeliveryBuffer, ExecutionError, InMemoryStore, MutationBatch, Statement,
    SyncError, Term,
};

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

fn label_batch(id: &str, text: &str) -> MutationBatch {
    MutationBatch::builder(ChangeOrigin::new(ChangeCategory::Unknown).with_unit_type("Light"))
        .delete(Statement::any_object(vocab::unit_iri(id), vocab::HAS_LABEL))
        .insert(Statement::new(vocab::unit_iri(id), vocab::HAS_LABEL, Term::literal(text)))
        .build()
        .unwrap()
}

fn offline_tracker(store: Arc<InMemoryStore>) -> ConnectivityTracker {
    let tracker = ConnectivityTracker::new(ConnectivityConfig::default(), store).unwrap();
    tracker.record_probe(false, t(0)).unwrap();
    tracker
}

#[test]
fn pending_batches_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = BufferConfig {
        journal_path: Some(dir.path().join("queue.journal")),
        ..BufferConfig::default()
    };

    let before = {
        let store = Arc::new(InMemoryStore::new());
        let tracker = offline_tracker(store.clone());
        let buffer = DeliveryBuffer::new(cfg.clone(), store, tracker.view()).unwrap();
        buffer.enqueue(label_batch("lamp", "Lamp")).unwrap();
        buffer.enqueue(label_batch("lamp", "Reading lamp")).unwrap();
        assert!(buffer.drain().unwrap().suspended);
        buffer.pending()
    };

    let store = Arc::new(InMemoryStore::new());
    let tracker = ConnectivityTracker::new(ConnectivityConfig::default(), store.clone()).unwrap();
    let buffer = DeliveryBuffer::new(cfg.clone(), store.clone(), tracker.view()).unwrap();
    assert_eq!(buffer.pending(), before);

    let next = buffer.enqueue(label_batch("door", "Door")).unwrap();
    assert!(before.iter().all(|e| e.id < next.id));

    tracker.record_probe(true, t(1)).unwrap();
    assert_eq!(buffer.drain().unwrap().applied, 3);
    assert!(store.contains(&Statement::new(
        vocab::unit_iri("lamp"),
        vocab::HAS_LABEL,
        Term::literal("Reading lamp"),
    )));

    // The drained queue is persisted too.
    drop(buffer);
    let reopened = DeliveryBuffer::new(cfg, store, tracker.view()).unwrap();
    assert_eq!(reopened.depth(), 0);
}

#[test]
fn attempts_and_deliveries_are_replayed_from_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = BufferConfig {
        journal_path: Some(dir.path().join("queue.journal")),
        ..BufferConfig::default()
    };

    let store = Arc::new(InMemoryStore::new());
    let tracker = ConnectivityTracker::new(ConnectivityConfig::default(), store.clone()).unwrap();
    tracker.record_probe(true, t(0)).unwrap();
    {
        let buffer = DeliveryBuffer::new(cfg.clone(), store.clone(), tracker.view()).unwrap();
        buffer.enqueue(label_batch("lamp", "Lamp")).unwrap();
        assert_eq!(buffer.drain().unwrap().applied, 1);

        store.set_reachable(false);
        buffer.enqueue(label_batch("door", "Door")).unwrap();
        buffer.enqueue(label_batch("fan", "Fan")).unwrap();
        assert!(buffer.drain().unwrap().retry_pending);
        assert!(buffer.drain().unwrap().retry_pending);
    }

    let buffer = DeliveryBuffer::new(cfg, store, tracker.view()).unwrap();
    let pending = buffer.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].attempts, 2);
    assert_eq!(pending[1].attempts, 0);
    assert!(pending[0].id < pending[1].id);
}

#[test]
fn stale_open_phase_is_closed_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ConnectivityConfig {
        journal_path: Some(dir.path().join("phases.journal")),
        ..ConnectivityConfig::default()
    };

    {
        let tracker =
            ConnectivityTracker::new(cfg.clone(), Arc::new(InMemoryStore::new())).unwrap();
        tracker.record_probe(true, t(0)).unwrap();
        tracker.record_probe(true, t(5)).unwrap();
    }

    let tracker = ConnectivityTracker::new(cfg.clone(), Arc::new(InMemoryStore::new())).unwrap();
    let events = tracker.subscribe();
    assert!(tracker.phases()[0].open);

    let closed = tracker.recover().unwrap().unwrap();
    assert!(!closed.open);
    assert_eq!(closed.first_seen, t(0));
    assert_eq!(closed.last_seen, t(5));
    assert_eq!(events.try_recv().unwrap(), ConnectivityEvent::PhaseClosed(closed.clone()));

    // A new success opens a second phase instead of extending the stale one.
    tracker.record_probe(true, t(100)).unwrap();
    let phases = tracker.phases();
    assert_eq!(phases.len(), 2);
    assert_eq!(phases[0], closed);
    assert_ne!(phases[1].phase_id, closed.phase_id);

    drop(tracker);
    let again = ConnectivityTracker::new(cfg, Arc::new(InMemoryStore::new())).unwrap();
    assert_eq!(again.phases().len(), 2);
}

#[test]
fn recovery_without_open_phase_is_a_no_op() {
    let tracker =
        ConnectivityTracker::new(ConnectivityConfig::default(), Arc::new(InMemoryStore::new()))
            .unwrap();
    let events = tracker.subscribe();
    assert!(tracker.recover().unwrap().is_none());
    assert!(events.try_recv().is_err());
}

#[test]
fn corrupted_queue_journal_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.journal");
    let cfg = BufferConfig {
        journal_path: Some(path.clone()),
        ..BufferConfig::default()
    };

    {
        let store = Arc::new(InMemoryStore::new());
        let tracker = offline_tracker(store.clone());
        let buffer = DeliveryBuffer::new(cfg.clone(), store, tracker.view()).unwrap();
        buffer.enqueue(label_batch("lamp", "Lamp")).unwrap();
    }

    let mut raw = fs::read(&path).unwrap();
    let at = raw.windows(4).position(|w| w == b"Lamp").unwrap();
    raw[at + 1] = b'u';
    fs::write(&path, raw).unwrap();

    let store = Arc::new(InMemoryStore::new());
    let tracker = offline_tracker(store.clone());
    let err = DeliveryBuffer::new(cfg, store, tracker.view()).unwrap_err();
    assert!(matches!(err, SyncError::Execution(ExecutionError::Journal { .. })), "{err}");
}

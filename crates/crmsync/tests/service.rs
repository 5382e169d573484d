//! End to end runs of the service over the in-memory CRM.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crmsync::core::{Clock, Counterparty, CounterpartyKind, ManualClock, Timestamp};
use crmsync::store::{EntityRepository, MemoryStore, SqliteStore};
use crmsync::sync::{fields, Fields, MemoryCrm};
use crmsync::{
    ChangeSource, ChangeStatus, EntityBody, EntityType, ExternalId, LocalRecord, ServiceConfig,
    ServiceError, StopSignal, SyncConfig, SyncService,
};

const INN: &str = "7707083893";

fn config() -> ServiceConfig {
    ServiceConfig::default()
        .with_sync(SyncConfig::default().with_call_delay(Duration::ZERO))
        .with_poll_interval(Duration::from_millis(10))
}

fn service() -> (SyncService<MemoryStore, MemoryCrm>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let crm = Arc::new(MemoryCrm::new(clock.clone()));
    let store = Arc::new(MemoryStore::new().with_clock(clock.clone()));
    (SyncService::new(store, crm, clock.clone(), config()), clock)
}

fn counterparty(name: &str) -> LocalRecord {
    LocalRecord::new(EntityBody::Counterparty(Counterparty {
        name: name.into(),
        kind: CounterpartyKind::LegalEntity,
        tax_id: Some(INN.into()),
        phone: None,
        email: None,
    }))
}

fn remote_company(name: &str) -> Fields {
    let mut f = Fields::new();
    f.insert("TITLE".into(), json!(name));
    f.insert("UF_INN".into(), json!(INN));
    f
}

#[tokio::test]
async fn test_local_change_is_pushed_and_linked() {
    let (service, clock) = service();

    let (local_id, entry) = service
        .record_local_change(&counterparty("Horns & Hooves"))
        .await
        .unwrap();
    clock.advance(1_000);

    let stats = service
        .drain_queue(&[EntityType::Counterparty], ChangeSource::Local, None)
        .await
        .unwrap();
    assert_eq!(stats.processed, 1);

    let entry = service.entry(entry).await.unwrap().unwrap();
    assert_eq!(entry.status, ChangeStatus::Processed);
    let remote_id = entry.external_ref_id.clone().unwrap();

    let record = service
        .store()
        .find_by_id(EntityType::Counterparty, local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.meta.external_id, Some(remote_id.clone()));

    let remote = service
        .engine()
        .api()
        .record(EntityType::Counterparty, &remote_id)
        .unwrap();
    assert_eq!(remote["TITLE"], json!("Horns & Hooves"));
    assert_eq!(remote[fields::LAST_PUSHED], json!(2_000));
}

#[tokio::test]
async fn test_run_once_pulls_then_stays_quiet() {
    let (service, clock) = service();
    let crm = service.engine().api();
    let remote_id = crm.insert(EntityType::Counterparty, remote_company("Remote Ltd"));
    clock.advance(1_000);

    let stop = StopSignal::new();
    let first = service.run_once(&stop).await.unwrap();
    let pulled = first.pull_stats(EntityType::Counterparty).unwrap();
    assert_eq!((pulled.total, pulled.created), (1, 1));
    // The REMOTE entry of the import goes back out through the queue
    assert_eq!(first.remote.processed, 1);
    assert!(!first.stopped);

    let local = service
        .store()
        .find_by_external_id(EntityType::Counterparty, &remote_id)
        .await
        .unwrap()
        .unwrap();
    let gid = local.meta.global_id.clone().unwrap();
    let remote = crm.record(EntityType::Counterparty, &remote_id).unwrap();
    assert_eq!(remote[fields::GLOBAL_ID], json!(gid.as_str()));

    clock.advance(1_000);
    let second = service.run_once(&stop).await.unwrap();
    let pulled = second.pull_stats(EntityType::Counterparty).unwrap();
    assert_eq!(pulled.created + pulled.updated, 0);
    assert_eq!(second.remote.processed, 0);
    assert_eq!(crm.records(EntityType::Counterparty).len(), 1);
}

/// Moves one millisecond on every reading.
struct TickingClock(AtomicI64);

impl Clock for TickingClock {
    fn now_millis(&self) -> Timestamp {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_run_once_stays_quiet_on_a_ticking_clock() {
    let clock = Arc::new(TickingClock(AtomicI64::new(1_000)));
    let crm = Arc::new(MemoryCrm::new(clock.clone()));
    let store = Arc::new(MemoryStore::new().with_clock(clock.clone()));
    let service = SyncService::new(store, crm.clone(), clock, config());
    crm.insert(EntityType::Counterparty, remote_company("Remote Ltd"));

    let stop = StopSignal::new();
    let first = service.run_once(&stop).await.unwrap();
    assert_eq!(first.pull_stats(EntityType::Counterparty).unwrap().created, 1);

    for _ in 0..3 {
        let report = service.run_once(&stop).await.unwrap();
        let pulled = report.pull_stats(EntityType::Counterparty).unwrap();
        assert_eq!(pulled.created + pulled.updated, 0);
        assert_eq!(report.remote.processed, 0);
    }
    assert_eq!(service.queue_summary().await.unwrap().outstanding(), 0);
}

#[tokio::test]
async fn test_run_once_honours_stop() {
    let (service, _clock) = service();
    service
        .record_local_change(&counterparty("Pending Ltd"))
        .await
        .unwrap();

    let stop = StopSignal::new();
    stop.request_stop();
    let report = service.run_once(&stop).await.unwrap();

    assert!(report.stopped);
    assert!(report.pulls.is_empty());
    assert_eq!(service.queue_summary().await.unwrap().pending, 1);
}

#[tokio::test]
async fn test_run_until_stopped() {
    let (service, _clock) = service();
    let stop = StopSignal::new();

    let (runs, ()) = tokio::join!(service.run_until_stopped(stop.clone()), async {
        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.request_stop();
    });

    assert!(runs.unwrap() >= 1);
}

#[tokio::test]
async fn test_requeue_only_terminal_entries() {
    let (service, _clock) = service();
    let mut record = counterparty("Broken Ltd");
    if let EntityBody::Counterparty(c) = &mut record.body {
        c.tax_id = Some("1234567890".into());
    }
    let (_, entry) = service.record_local_change(&record).await.unwrap();

    // Still pending: nothing to requeue
    assert!(matches!(
        service.requeue(entry).await,
        Err(ServiceError::InvalidOperation(_))
    ));

    let stats = service
        .drain_queue(&[], ChangeSource::Local, None)
        .await
        .unwrap();
    assert_eq!(stats.skipped, 1);
    let skipped = service.entry(entry).await.unwrap().unwrap();
    assert_eq!(skipped.status, ChangeStatus::Skipped);
    assert!(skipped.last_error.unwrap().contains("1234567890"));

    service.requeue(entry).await.unwrap();
    let summary = service.queue_summary().await.unwrap();
    assert_eq!((summary.pending, summary.skipped), (1, 0));
}

#[tokio::test]
async fn test_failed_listing_does_not_end_the_run() {
    let (service, _clock) = service();
    service.engine().api().fail_next(
        "crm.mycompany.list",
        crmsync::sync::RemoteApiError::from_status(503, "maintenance"),
    );

    let report = service.run_once(&StopSignal::new()).await.unwrap();
    assert_eq!(report.failed_pulls, vec![EntityType::Organization]);
    assert_eq!(report.pulls.len(), EntityType::ALL.len() - 1);
}

#[tokio::test]
async fn test_sqlite_backed_service() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let crm = Arc::new(MemoryCrm::new(clock.clone()));
    let store = Arc::new(SqliteStore::open(dir.path().join("crmsync.db")).unwrap());
    let service = SyncService::new(store, crm, clock.clone(), config());

    service
        .record_local_change(&counterparty("Disk Ltd"))
        .await
        .unwrap();
    clock.advance(500);
    let report = service.run_once(&StopSignal::new()).await.unwrap();
    assert_eq!(report.local.processed, 1);

    let remote: Vec<_> = service.engine().api().records(EntityType::Counterparty);
    assert_eq!(remote.len(), 1);
    let id = ExternalId::new(remote[0][fields::ID].as_str().unwrap());
    assert!(service
        .store()
        .find_by_external_id(EntityType::Counterparty, &id)
        .await
        .unwrap()
        .is_some());
}

#[test]
fn test_report_serializes() {
    let report = crmsync::RunReport::default();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["stopped"], json!(false));
    assert_eq!(json["local"]["processed"], json!(0));
}

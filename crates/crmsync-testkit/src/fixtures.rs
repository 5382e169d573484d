//! Test fixtures and helpers.
//!
//! [`Harness`] wires a memory store and a memory CRM to one engine, all on
//! a shared [`ManualClock`]. Time only moves when a test says so: the CRM
//! stamps `DATE_MODIFY` from the same clock the engine stamps
//! `UF_LAST_PUSHED` with, so tests advance it between remote edits.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crmsync::{ServiceConfig, SyncService};
use crmsync_core::{
    ChangeQueueEntry, ChangeSource, Clock, Contract, Counterparty, CounterpartyKind, EntityBody,
    EntityType, EntryId, ExternalId, LocalId, LocalRecord, ManualClock, Order, OrderLine,
    Organization, PaymentStatus, Product, ShipmentStatus, Timestamp,
};
use crmsync_store::{ChangeQueue, EntityRepository, LocalStore, MemoryStore};
use crmsync_sync::{Fields, MemoryCrm, RunContext, SyncConfig, SyncEngine};

/// Valid 10 digit INNs (legal entities).
pub const LEGAL_INNS: [&str; 3] = ["7707083893", "7736050003", "7830002293"];

/// A valid 12 digit INN (individual).
pub const PERSON_INN: &str = "500100732259";

/// A clock that moves forward by `step` every time it is read, the way
/// wall time passes between stamping a push and the CRM receiving it.
#[derive(Debug)]
pub struct SteppingClock {
    now: AtomicI64,
    step: i64,
}

impl SteppingClock {
    pub fn new(start: Timestamp, step: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
            step,
        }
    }
}

impl Clock for SteppingClock {
    fn now_millis(&self) -> Timestamp {
        self.now.fetch_add(self.step, Ordering::SeqCst)
    }
}

/// Engine, store and CRM sharing one manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub crm: Arc<MemoryCrm>,
    pub engine: SyncEngine<MemoryStore, MemoryCrm>,
}

impl Harness {
    /// Clock value at construction.
    pub const START: Timestamp = 1_000_000;

    pub fn new() -> Self {
        Self::with_config(SyncConfig::default())
    }

    /// Build with `config`; the inter-call delay is always dropped.
    pub fn with_config(config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Self::START));
        let store = Arc::new(MemoryStore::new().with_clock(clock.clone()));
        let crm = Arc::new(MemoryCrm::new(clock.clone()));
        let engine = SyncEngine::new(
            store.clone(),
            crm.clone(),
            clock.clone(),
            config.with_call_delay(Duration::ZERO),
        );
        Self {
            clock,
            store,
            crm,
            engine,
        }
    }

    /// A service over the same store, CRM and clock.
    pub fn service(&self, config: ServiceConfig) -> SyncService<MemoryStore, MemoryCrm> {
        let sync = config.sync.clone().with_call_delay(Duration::ZERO);
        SyncService::new(
            self.store.clone(),
            self.crm.clone(),
            self.clock.clone(),
            config.with_sync(sync),
        )
    }

    pub fn ctx(&self) -> RunContext {
        RunContext::new()
    }

    /// Advance the clock by one second and return the new time.
    pub fn tick(&self) -> Timestamp {
        self.clock.advance(1_000)
    }

    pub fn now(&self) -> Timestamp {
        self.engine.now()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Side
    // ─────────────────────────────────────────────────────────────────────────

    /// Save a new record as a domain operation would, enqueueing a `LOCAL`
    /// change.
    pub async fn save_local(&self, body: EntityBody) -> (LocalId, EntryId) {
        let (id, entry) = self
            .store
            .commit_upsert(&LocalRecord::new(body), Some(ChangeSource::Local))
            .await
            .expect("commit local record");
        (id, entry.expect("local change enqueued"))
    }

    /// Save a record without enqueueing anything.
    pub async fn save_quiet(&self, record: &LocalRecord) -> LocalId {
        self.store.save(record).await.expect("save local record")
    }

    pub async fn local(&self, entity_type: EntityType, id: LocalId) -> LocalRecord {
        self.store
            .find_by_id(entity_type, id)
            .await
            .expect("read local record")
            .expect("local record exists")
    }

    pub async fn local_by_remote(
        &self,
        entity_type: EntityType,
        remote_id: &ExternalId,
    ) -> Option<LocalRecord> {
        self.store
            .find_by_external_id(entity_type, remote_id)
            .await
            .expect("read local record")
    }

    pub async fn locals_with_key(&self, entity_type: EntityType, key: &str) -> Vec<LocalRecord> {
        self.store
            .find_by_business_key(entity_type, key)
            .await
            .expect("read local records")
    }

    pub async fn entry(&self, id: EntryId) -> ChangeQueueEntry {
        self.store
            .get_entry(id)
            .await
            .expect("read queue entry")
            .expect("queue entry exists")
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Remote Side
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a record in the CRM as a remote user would.
    pub fn remote_insert(&self, entity_type: EntityType, fields: Fields) -> ExternalId {
        self.crm.insert(entity_type, fields)
    }

    pub fn remote(&self, entity_type: EntityType, id: &ExternalId) -> Fields {
        self.crm.record(entity_type, id).expect("remote record exists")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a `tracing` subscriber writing to the test output. Idempotent.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

// ─────────────────────────────────────────────────────────────────────────────
// Local Bodies
// ─────────────────────────────────────────────────────────────────────────────

pub fn organization(name: &str, inn: &str) -> EntityBody {
    EntityBody::Organization(Organization {
        name: name.into(),
        tax_id: inn.into(),
        kpp: None,
    })
}

pub fn counterparty(name: &str, inn: &str) -> EntityBody {
    EntityBody::Counterparty(Counterparty {
        name: name.into(),
        kind: CounterpartyKind::LegalEntity,
        tax_id: Some(inn.into()),
        phone: None,
        email: None,
    })
}

pub fn product(sku: &str, price_cents: i64) -> EntityBody {
    EntityBody::Product(Product {
        sku: sku.into(),
        name: format!("Product {sku}"),
        price_cents,
        unit: "pcs".into(),
    })
}

pub fn contract(number: &str, counterparty: LocalId) -> EntityBody {
    EntityBody::Contract(Contract {
        number: number.into(),
        counterparty,
        organization: None,
        signed_on: None,
        amount_cents: 100_000,
    })
}

pub fn order(number: &str, counterparty: LocalId, product: LocalId) -> EntityBody {
    EntityBody::Order(Order {
        number: number.into(),
        counterparty,
        contract: None,
        total_cents: 2_000,
        payment_status: PaymentStatus::Unpaid,
        shipment_status: ShipmentStatus::Pending,
        lines: vec![OrderLine {
            product,
            quantity: 2,
            price_cents: 1_000,
        }],
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Field Bags
// ─────────────────────────────────────────────────────────────────────────────

pub fn remote_company(name: &str, inn: &str) -> Fields {
    let mut f = Fields::new();
    f.insert("TITLE".into(), json!(name));
    f.insert("UF_INN".into(), json!(inn));
    f
}

pub fn remote_product(sku: &str, price_cents: i64) -> Fields {
    let mut f = Fields::new();
    f.insert("CODE".into(), json!(sku));
    f.insert("NAME".into(), json!(format!("Product {sku}")));
    f.insert("PRICE".into(), json!(price_cents));
    f
}

pub fn remote_contract(number: &str, company: &ExternalId) -> Fields {
    let mut f = Fields::new();
    f.insert("NUMBER".into(), json!(number));
    f.insert("COMPANY_ID".into(), json!(company.as_str()));
    f.insert("AMOUNT".into(), json!(50_000));
    f
}

pub fn remote_order(title: &str, company: &ExternalId, product: &ExternalId) -> Fields {
    let mut f = Fields::new();
    f.insert("TITLE".into(), json!(title));
    f.insert("COMPANY_ID".into(), json!(company.as_str()));
    f.insert("OPPORTUNITY".into(), json!(3_000));
    f.insert("UF_PAYMENT_STATUS".into(), json!("PAID"));
    f.insert(
        "PRODUCT_ROWS".into(),
        json!([{ "PRODUCT_ID": product.as_str(), "QUANTITY": 3, "PRICE": 1_000 }]),
    );
    f
}

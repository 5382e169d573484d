//! Remote CRM seam.
//!
//! The engine reaches the CRM through one narrow method,
//! [`RemoteApi::call`]. Field bags (`serde_json` maps) exist only at this
//! boundary: responses are parsed into [`RemoteItem`] as soon as they arrive,
//! and the entity handlers turn those into typed bodies.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crmsync_core::{EntityType, ExternalId, GlobalId, Timestamp};

use crate::error::{Result, SyncError};

/// A remote record as a loose field bag.
pub type Fields = Map<String, Value>;

/// Field names every synchronized remote resource carries.
pub mod fields {
    /// Remote primary key.
    pub const ID: &str = "ID";
    /// Remote modification time, Unix ms.
    pub const DATE_MODIFY: &str = "DATE_MODIFY";
    /// Global id shared with the local side.
    pub const GLOBAL_ID: &str = "UF_GLOBAL_ID";
    /// When the local side last wrote this record, Unix ms.
    pub const LAST_PUSHED: &str = "UF_LAST_PUSHED";
    /// Remote deletion flag.
    pub const DELETED: &str = "DELETED";
}

/// Failure of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApiError {
    pub message: String,
    /// HTTP-like status, when the remote answered at all.
    pub status: Option<u16>,
    pub retryable: bool,
}

impl RemoteApiError {
    /// Classify by status: 408, 429 and 5xx are transient, other 4xx are
    /// semantic rejections.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let retryable = matches!(status, 408 | 429) || status >= 500;
        Self {
            message: message.into(),
            status: Some(status),
            retryable,
        }
    }

    /// The call did not complete in time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    /// The connection failed before any answer.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::timeout(message)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl fmt::Display for RemoteApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {})", self.message, status),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteApiError {}

/// The remote API client.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Invoke a remote method and return its structured response.
    async fn call(&self, method: &str, params: Value) -> std::result::Result<Value, RemoteApiError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsed payloads
// ─────────────────────────────────────────────────────────────────────────────

/// One remote record with its sync fields parsed out.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub external_id: ExternalId,
    pub global_id: Option<GlobalId>,
    /// `remoteModifiedAt`.
    pub modified_at: Timestamp,
    /// `lastPushedStamp`.
    pub last_pushed_at: Option<Timestamp>,
    pub deleted: bool,
    /// The full field bag, for the entity mappers.
    pub fields: Fields,
}

impl RemoteItem {
    pub fn from_fields(fields: Fields) -> Result<Self> {
        let external_id = fields
            .get(fields::ID)
            .and_then(value_to_string)
            .map(ExternalId)
            .ok_or_else(|| SyncError::mapping("remote record without ID"))?;

        let modified_at = fields
            .get(fields::DATE_MODIFY)
            .and_then(value_to_i64)
            .ok_or_else(|| {
                SyncError::mapping(format!("remote record {} without DATE_MODIFY", external_id))
            })?;

        let global_id = fields
            .get(fields::GLOBAL_ID)
            .and_then(value_to_string)
            .map(|g| GlobalId::parse(&g))
            .transpose()?;

        let last_pushed_at = fields.get(fields::LAST_PUSHED).and_then(value_to_i64);
        let deleted = fields.get(fields::DELETED).map(value_to_bool).unwrap_or(false);

        Ok(Self {
            external_id,
            global_id,
            modified_at,
            last_pushed_at,
            deleted,
            fields,
        })
    }

    /// A non-blank text field.
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(Value::String(s)) => Some(s.trim()).filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    pub fn require_text(&self, name: &'static str) -> Result<&str> {
        self.text(name).ok_or_else(|| {
            SyncError::mapping(format!("{} is missing on remote record {}", name, self.external_id))
        })
    }

    /// An integer field given as a number or a numeric string.
    pub fn int(&self, name: &str) -> Result<Option<i64>> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
            Some(v) => value_to_i64(v).map(Some).ok_or_else(|| {
                SyncError::mapping(format!("{} is not an integer: {}", name, v))
            }),
        }
    }

    /// A link to another remote record. `0` and blanks mean "no link".
    pub fn reference(&self, name: &str) -> Option<ExternalId> {
        self.fields
            .get(name)
            .and_then(value_to_string)
            .filter(|id| id != "0")
            .map(ExternalId)
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub items: Vec<RemoteItem>,
    /// Offset of the next page, if there is one.
    pub next: Option<u64>,
}

pub(crate) fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn value_to_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64() == Some(1),
        Value::String(s) => matches!(s.as_str(), "Y" | "y" | "1" | "true"),
        _ => false,
    }
}

fn parse_items(result: &Value) -> Result<Vec<RemoteItem>> {
    let rows = result
        .as_array()
        .ok_or_else(|| SyncError::mapping("listing result is not an array"))?;
    rows.iter()
        .map(|row| match row {
            Value::Object(fields) => RemoteItem::from_fields(fields.clone()),
            other => Err(SyncError::mapping(format!("listing row is not an object: {}", other))),
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed helpers over `call`
// ─────────────────────────────────────────────────────────────────────────────

/// The `<resource>.{list,get,add,update}` method family, typed.
pub trait RemoteEntities: RemoteApi {
    /// Records modified after `since`, oldest first, starting at offset `start`.
    fn list_changed(
        &self,
        entity_type: EntityType,
        since: Option<Timestamp>,
        start: u64,
    ) -> impl Future<Output = Result<RemotePage>> + Send;

    /// The current representation of one record, or `None` if it is gone.
    fn get(
        &self,
        entity_type: EntityType,
        id: &ExternalId,
    ) -> impl Future<Output = Result<Option<RemoteItem>>> + Send;

    /// Records whose `field` equals `value`, lowest id first.
    fn find_by_field(
        &self,
        entity_type: EntityType,
        field: &str,
        value: &str,
    ) -> impl Future<Output = Result<Vec<RemoteItem>>> + Send;

    fn add(
        &self,
        entity_type: EntityType,
        fields: Fields,
    ) -> impl Future<Output = Result<ExternalId>> + Send;

    fn update(
        &self,
        entity_type: EntityType,
        id: &ExternalId,
        fields: Fields,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<T: RemoteApi + ?Sized> RemoteEntities for T {
    async fn list_changed(
        &self,
        entity_type: EntityType,
        since: Option<Timestamp>,
        start: u64,
    ) -> Result<RemotePage> {
        let mut filter = Fields::new();
        if let Some(since) = since {
            filter.insert(format!(">{}", fields::DATE_MODIFY), json!(since));
        }
        let mut order = Fields::new();
        order.insert(fields::DATE_MODIFY.into(), json!("ASC"));
        order.insert(fields::ID.into(), json!("ASC"));
        let params = json!({ "filter": filter, "order": order, "start": start });

        let method = format!("{}.list", entity_type.remote_resource());
        let response = self.call(&method, params).await?;

        Ok(RemotePage {
            items: parse_items(&response["result"])?,
            next: response.get("next").and_then(Value::as_u64),
        })
    }

    async fn get(&self, entity_type: EntityType, id: &ExternalId) -> Result<Option<RemoteItem>> {
        let method = format!("{}.get", entity_type.remote_resource());
        let response = match self.call(&method, json!({ "id": id.as_str() })).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match response.get("result") {
            Some(Value::Object(fields)) => Ok(Some(RemoteItem::from_fields(fields.clone())?)),
            None | Some(Value::Null) => Ok(None),
            Some(other) => Err(SyncError::mapping(format!(
                "{} returned a non-object: {}",
                method, other
            ))),
        }
    }

    async fn find_by_field(
        &self,
        entity_type: EntityType,
        field: &str,
        value: &str,
    ) -> Result<Vec<RemoteItem>> {
        let mut filter = Fields::new();
        filter.insert(field.to_string(), Value::String(value.to_string()));
        let mut order = Fields::new();
        order.insert(fields::ID.into(), json!("ASC"));

        let method = format!("{}.list", entity_type.remote_resource());
        let mut items = Vec::new();
        let mut start = 0;
        loop {
            let params = json!({ "filter": filter, "order": order, "start": start });
            let response = self.call(&method, params).await?;
            items.extend(parse_items(&response["result"])?);
            match response.get("next").and_then(Value::as_u64) {
                Some(next) if next > start => start = next,
                _ => return Ok(items),
            }
        }
    }

    async fn add(&self, entity_type: EntityType, fields: Fields) -> Result<ExternalId> {
        let method = format!("{}.add", entity_type.remote_resource());
        let response = self.call(&method, json!({ "fields": fields })).await?;
        response
            .get("result")
            .and_then(value_to_string)
            .map(ExternalId)
            .ok_or_else(|| SyncError::mapping(format!("{} returned no id", method)))
    }

    async fn update(&self, entity_type: EntityType, id: &ExternalId, fields: Fields) -> Result<()> {
        let method = format!("{}.update", entity_type.remote_resource());
        self.call(&method, json!({ "id": id.as_str(), "fields": fields }))
            .await?;
        Ok(())
    }
}

/// An in-process CRM for tests and demos.
///
/// Keeps one collection per remote resource, stamps `DATE_MODIFY` from a
/// shared [`Clock`](crmsync_core::Clock), pages listings and can be told to
/// fail specific methods.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    use crmsync_core::Clock;

    /// Default number of rows per listing page.
    pub const PAGE_SIZE: usize = 50;

    /// A logged call.
    #[derive(Debug, Clone, PartialEq)]
    pub struct RemoteCall {
        pub method: String,
        pub params: Value,
    }

    #[derive(Default)]
    struct CrmState {
        /// resource -> id -> record.
        collections: HashMap<&'static str, BTreeMap<u64, Fields>>,
        next_id: u64,
        failures: VecDeque<(String, RemoteApiError)>,
        calls: Vec<RemoteCall>,
    }

    /// In-memory CRM implementation.
    pub struct MemoryCrm {
        clock: Arc<dyn Clock>,
        page_size: usize,
        state: Mutex<CrmState>,
    }

    impl MemoryCrm {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            let mut state = CrmState::default();
            for entity_type in EntityType::ALL {
                state
                    .collections
                    .insert(entity_type.remote_resource(), BTreeMap::new());
            }
            Self {
                clock,
                page_size: PAGE_SIZE,
                state: Mutex::new(state),
            }
        }

        pub fn with_page_size(mut self, page_size: usize) -> Self {
            self.page_size = page_size.max(1);
            self
        }

        fn lock(&self) -> MutexGuard<'_, CrmState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Create a record as a remote user would. Returns its id.
        pub fn insert(&self, entity_type: EntityType, fields: Fields) -> ExternalId {
            let now = self.clock.now_millis();
            let mut state = self.lock();
            let id = state.insert(entity_type.remote_resource(), fields, now);
            ExternalId(id.to_string())
        }

        /// Edit a record as a remote user would: `UF_LAST_PUSHED` is left alone.
        pub fn touch(&self, entity_type: EntityType, id: &ExternalId, fields: Fields) -> bool {
            let now = self.clock.now_millis();
            let mut state = self.lock();
            state.merge(entity_type.remote_resource(), id.as_str(), fields, now)
        }

        /// Flag a record as deleted.
        pub fn delete(&self, entity_type: EntityType, id: &ExternalId) -> bool {
            let mut flag = Fields::new();
            flag.insert(fields::DELETED.into(), json!("Y"));
            self.touch(entity_type, id, flag)
        }

        pub fn record(&self, entity_type: EntityType, id: &ExternalId) -> Option<Fields> {
            let state = self.lock();
            let id: u64 = id.as_str().parse().ok()?;
            state
                .collections
                .get(entity_type.remote_resource())
                .and_then(|c| c.get(&id))
                .cloned()
        }

        pub fn records(&self, entity_type: EntityType) -> Vec<Fields> {
            let state = self.lock();
            state
                .collections
                .get(entity_type.remote_resource())
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default()
        }

        /// Make the next call to `method` fail with `error`.
        pub fn fail_next(&self, method: impl Into<String>, error: RemoteApiError) {
            self.lock().failures.push_back((method.into(), error));
        }

        pub fn calls(&self) -> Vec<RemoteCall> {
            self.lock().calls.clone()
        }

        pub fn count_calls(&self, method: &str) -> usize {
            self.lock().calls.iter().filter(|c| c.method == method).count()
        }
    }

    impl CrmState {
        fn insert(&mut self, resource: &'static str, mut fields: Fields, now: Timestamp) -> u64 {
            self.next_id += 1;
            let id = self.next_id;
            fields.insert(fields::ID.into(), json!(id.to_string()));
            fields.insert(fields::DATE_MODIFY.into(), json!(now));
            self.collections.entry(resource).or_default().insert(id, fields);
            id
        }

        fn merge(&mut self, resource: &str, id: &str, fields: Fields, now: Timestamp) -> bool {
            let Ok(id) = id.parse::<u64>() else {
                return false;
            };
            match self.collections.get_mut(resource).and_then(|c| c.get_mut(&id)) {
                Some(record) => {
                    for (k, v) in fields {
                        if k != fields::ID {
                            record.insert(k, v);
                        }
                    }
                    record.insert(fields::DATE_MODIFY.into(), json!(now));
                    true
                }
                None => false,
            }
        }

        fn resource_key(&self, resource: &str) -> std::result::Result<&'static str, RemoteApiError> {
            self.collections
                .keys()
                .find(|k| **k == resource)
                .copied()
                .ok_or_else(|| RemoteApiError::from_status(400, format!("unknown resource {resource}")))
        }

        fn list(&self, resource: &str, params: &Value, page_size: usize) -> Value {
            let filter = params.get("filter").and_then(Value::as_object);
            let start = params.get("start").and_then(Value::as_u64).unwrap_or(0) as usize;

            let mut matched: Vec<&Fields> = self
                .collections
                .get(resource)
                .map(|c| c.values().filter(|r| matches_filter(r, filter)).collect())
                .unwrap_or_default();
            // Ids ascend already; the stable sort keeps them ascending within a timestamp.
            matched.sort_by_key(|r| r.get(fields::DATE_MODIFY).and_then(value_to_i64));

            let total = matched.len();
            let page: Vec<Value> = matched
                .iter()
                .skip(start)
                .take(page_size)
                .map(|r| Value::Object((*r).clone()))
                .collect();

            let mut response = json!({ "result": page, "total": total });
            if start + page_size < total {
                response["next"] = json!(start + page_size);
            }
            response
        }
    }

    fn matches_filter(record: &Fields, filter: Option<&Fields>) -> bool {
        let Some(filter) = filter else {
            return true;
        };
        filter.iter().all(|(key, expected)| match key.strip_prefix('>') {
            Some(field) => match (record.get(field).and_then(value_to_i64), value_to_i64(expected)) {
                (Some(actual), Some(bound)) => actual > bound,
                _ => false,
            },
            None => record.get(key).and_then(value_to_string) == value_to_string(expected),
        })
    }

    fn id_param(params: &Value) -> std::result::Result<String, RemoteApiError> {
        params
            .get("id")
            .and_then(value_to_string)
            .ok_or_else(|| RemoteApiError::from_status(400, "id is required"))
    }

    fn fields_param(params: &Value) -> std::result::Result<Fields, RemoteApiError> {
        params
            .get("fields")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| RemoteApiError::from_status(400, "fields are required"))
    }

    #[async_trait]
    impl RemoteApi for MemoryCrm {
        async fn call(
            &self,
            method: &str,
            params: Value,
        ) -> std::result::Result<Value, RemoteApiError> {
            let now = self.clock.now_millis();
            let mut state = self.lock();
            state.calls.push(RemoteCall {
                method: method.to_string(),
                params: params.clone(),
            });

            if let Some(pos) = state.failures.iter().position(|(m, _)| m == method) {
                if let Some((_, error)) = state.failures.remove(pos) {
                    return Err(error);
                }
            }

            let (resource, action) = method
                .rsplit_once('.')
                .ok_or_else(|| RemoteApiError::from_status(400, format!("unknown method {method}")))?;
            let resource = state.resource_key(resource)?;

            match action {
                "list" => Ok(state.list(resource, &params, self.page_size)),
                "get" => {
                    let id = id_param(&params)?;
                    let record = id
                        .parse::<u64>()
                        .ok()
                        .and_then(|id| state.collections.get(resource)?.get(&id).cloned());
                    Ok(json!({ "result": record }))
                }
                "add" => {
                    let fields = fields_param(&params)?;
                    let id = state.insert(resource, fields, now);
                    Ok(json!({ "result": id }))
                }
                "update" => {
                    let id = id_param(&params)?;
                    let fields = fields_param(&params)?;
                    if state.merge(resource, &id, fields, now) {
                        Ok(json!({ "result": true }))
                    } else {
                        Err(RemoteApiError::from_status(404, format!("{method}: {id} not found")))
                    }
                }
                _ => Err(RemoteApiError::from_status(400, format!("unknown method {method}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCrm;
    use super::*;
    use crmsync_core::ManualClock;
    use std::sync::Arc;

    fn crm(page_size: usize) -> (Arc<ManualClock>, MemoryCrm) {
        let clock = Arc::new(ManualClock::new(1_000));
        let crm = MemoryCrm::new(clock.clone()).with_page_size(page_size);
        (clock, crm)
    }

    fn product(sku: &str) -> Fields {
        let mut f = Fields::new();
        f.insert("CODE".into(), json!(sku));
        f.insert("NAME".into(), json!("Widget"));
        f
    }

    #[test]
    fn test_status_classification() {
        assert!(RemoteApiError::from_status(500, "boom").retryable);
        assert!(RemoteApiError::from_status(503, "down").retryable);
        assert!(RemoteApiError::from_status(429, "slow down").retryable);
        assert!(RemoteApiError::from_status(408, "timeout").retryable);
        assert!(!RemoteApiError::from_status(400, "bad").retryable);
        assert!(!RemoteApiError::from_status(404, "gone").retryable);
        assert!(RemoteApiError::timeout("no answer").retryable);
    }

    #[test]
    fn test_item_parsing() {
        let gid = GlobalId::generate();
        let mut f = Fields::new();
        f.insert(fields::ID.into(), json!(17));
        f.insert(fields::DATE_MODIFY.into(), json!("5000"));
        f.insert(fields::GLOBAL_ID.into(), json!(gid.as_str()));
        f.insert(fields::DELETED.into(), json!("Y"));
        f.insert("COMPANY_ID".into(), json!("0"));

        let item = RemoteItem::from_fields(f).unwrap();
        assert_eq!(item.external_id, ExternalId::new("17"));
        assert_eq!(item.modified_at, 5_000);
        assert_eq!(item.global_id, Some(gid));
        assert_eq!(item.last_pushed_at, None);
        assert!(item.deleted);
        assert_eq!(item.reference("COMPANY_ID"), None);

        let mut f = Fields::new();
        f.insert(fields::ID.into(), json!("1"));
        assert!(RemoteItem::from_fields(f).is_err());
    }

    #[tokio::test]
    async fn test_list_changed_pages_and_filters() {
        let (clock, crm) = crm(2);
        for i in 0..5 {
            clock.advance(10);
            crm.insert(EntityType::Product, product(&format!("W-{i}")));
        }

        let first = crm.list_changed(EntityType::Product, None, 0).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.next, Some(2));

        let since = first.items[1].modified_at;
        let rest = crm.list_changed(EntityType::Product, Some(since), 0).await.unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.items.iter().all(|i| i.modified_at > since));
        assert_eq!(rest.next, Some(2));
    }

    #[tokio::test]
    async fn test_add_update_get() {
        let (clock, crm) = crm(50);
        let id = crm.add(EntityType::Product, product("W-1")).await.unwrap();

        clock.advance(5);
        let mut change = Fields::new();
        change.insert("NAME".into(), json!("Gadget"));
        crm.update(EntityType::Product, &id, change).await.unwrap();

        let item = crm.get(EntityType::Product, &id).await.unwrap().unwrap();
        assert_eq!(item.text("NAME"), Some("Gadget"));
        assert_eq!(item.modified_at, 1_005);

        assert!(crm
            .get(EntityType::Product, &ExternalId::new("999"))
            .await
            .unwrap()
            .is_none());
        let missing = crm
            .update(EntityType::Product, &ExternalId::new("999"), Fields::new())
            .await
            .unwrap_err();
        assert!(!missing.is_retryable());
    }

    #[tokio::test]
    async fn test_find_by_field_and_scripted_failure() {
        let (_clock, crm) = crm(50);
        crm.insert(EntityType::Product, product("W-1"));
        crm.insert(EntityType::Product, product("W-2"));

        let found = crm.find_by_field(EntityType::Product, "CODE", "W-2").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].text("CODE"), Some("W-2"));

        crm.fail_next("crm.product.list", RemoteApiError::from_status(503, "maintenance"));
        let err = crm.find_by_field(EntityType::Product, "CODE", "W-2").await.unwrap_err();
        assert!(err.is_retryable());
        // Failures are consumed
        crm.find_by_field(EntityType::Product, "CODE", "W-2").await.unwrap();
        assert_eq!(crm.count_calls("crm.product.list"), 3);
    }

    #[tokio::test]
    async fn test_find_by_field_follows_pages() {
        let (_clock, crm) = crm(1);
        for _ in 0..3 {
            crm.insert(EntityType::Product, product("W-1"));
        }
        crm.insert(EntityType::Product, product("W-2"));

        let found = crm.find_by_field(EntityType::Product, "CODE", "W-1").await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(crm.count_calls("crm.product.list"), 3);
    }
}

//! Reconciliation key resolution.
//!
//! Pairs a remote record with its local counterpart (and the other way
//! round) by trying, in order: the external id link, the shared global id,
//! and the domain business key. The first key that matches wins. Business
//! keys are a last resort and never merge ambiguous candidates unless the
//! configured [`DuplicateKeyPolicy`] says so.

use crmsync_core::{EntityType, ExternalId, GlobalId, LocalRecord, ValidationError};
use crmsync_store::EntityRepository;

use crate::config::DuplicateKeyPolicy;
use crate::error::Result;
use crate::remote::{fields, RemoteApi, RemoteEntities, RemoteItem};

/// Which key produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKey {
    ExternalId,
    GlobalId,
    BusinessKey,
}

/// A counterpart found by one of the reconciliation keys.
#[derive(Debug, Clone)]
pub struct Matched<T> {
    pub key: MatchKey,
    pub value: T,
}

impl<T> Matched<T> {
    fn by(key: MatchKey, value: T) -> Self {
        Self { key, value }
    }
}

/// Apply the duplicate policy to business-key candidates, oldest first.
fn pick_candidate<T>(
    mut candidates: Vec<T>,
    entity_type: EntityType,
    key: &str,
    policy: DuplicateKeyPolicy,
) -> Result<Option<T>> {
    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.pop()),
        n => match policy {
            DuplicateKeyPolicy::CreateNew => {
                tracing::warn!(
                    %entity_type,
                    key,
                    candidates = n,
                    "ambiguous business key, creating a new record instead of merging"
                );
                Ok(None)
            }
            DuplicateKeyPolicy::MatchOldest => {
                tracing::warn!(%entity_type, key, candidates = n, "ambiguous business key, using oldest");
                Ok(Some(candidates.swap_remove(0)))
            }
            DuplicateKeyPolicy::Reject => Err(ValidationError::AmbiguousBusinessKey {
                key: key.to_string(),
                candidates: n,
            }
            .into()),
        },
    }
}

/// Find the local counterpart of a remote record.
pub async fn match_local<R: EntityRepository + ?Sized>(
    repo: &R,
    entity_type: EntityType,
    external_id: &ExternalId,
    global_id: Option<&GlobalId>,
    business_key: Option<&str>,
    policy: DuplicateKeyPolicy,
) -> Result<Option<Matched<LocalRecord>>> {
    if let Some(record) = repo.find_by_external_id(entity_type, external_id).await? {
        return Ok(Some(Matched::by(MatchKey::ExternalId, record)));
    }

    if let Some(gid) = global_id {
        if let Some(record) = repo.find_by_global_id(entity_type, gid).await? {
            return Ok(Some(Matched::by(MatchKey::GlobalId, record)));
        }
    }

    let Some(key) = business_key.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };

    // A record already linked to a different remote record is someone else's
    // counterpart, even if it shares the key.
    let candidates: Vec<LocalRecord> = repo
        .find_by_business_key(entity_type, key)
        .await?
        .into_iter()
        .filter(|r| match &r.meta.external_id {
            None => true,
            Some(linked) => linked == external_id,
        })
        .collect();

    Ok(pick_candidate(candidates, entity_type, key, policy)?
        .map(|record| Matched::by(MatchKey::BusinessKey, record)))
}

/// Find the remote counterpart of a local record.
///
/// `key_field` names the remote field holding the business key.
pub async fn locate_remote(
    api: &dyn RemoteApi,
    record: &LocalRecord,
    key_field: &str,
    policy: DuplicateKeyPolicy,
) -> Result<Option<Matched<ExternalId>>> {
    let entity_type = record.entity_type();

    if let Some(id) = &record.meta.external_id {
        return Ok(Some(Matched::by(MatchKey::ExternalId, id.clone())));
    }

    if let Some(gid) = &record.meta.global_id {
        let found = api
            .find_by_field(entity_type, fields::GLOBAL_ID, gid.as_str())
            .await?;
        if let Some(item) = found.into_iter().next() {
            return Ok(Some(Matched::by(MatchKey::GlobalId, item.external_id)));
        }
    }

    let Some(key) = record.business_key() else {
        return Ok(None);
    };

    let candidates: Vec<RemoteItem> = api
        .find_by_field(entity_type, key_field, key)
        .await?
        .into_iter()
        .filter(|item| !item.deleted)
        .filter(|item| match (&item.global_id, &record.meta.global_id) {
            (Some(theirs), Some(ours)) => theirs == ours,
            (Some(_), None) | (None, _) => true,
        })
        .collect();

    Ok(pick_candidate(candidates, entity_type, key, policy)?
        .map(|item| Matched::by(MatchKey::BusinessKey, item.external_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::remote::memory::MemoryCrm;
    use crate::remote::Fields;
    use crmsync_core::{EntityBody, ManualClock, Product};
    use crmsync_store::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn product(sku: &str) -> LocalRecord {
        LocalRecord::new(EntityBody::Product(Product {
            sku: sku.into(),
            name: "Widget".into(),
            price_cents: 100,
            unit: "pcs".into(),
        }))
    }

    #[tokio::test]
    async fn test_external_id_beats_business_key() {
        let store = MemoryStore::new();

        let mut a = product("A-1");
        a.meta.external_id = Some(ExternalId::new("17"));
        let a_id = store.save(&a).await.unwrap();
        let b_id = store.save(&product("B-1")).await.unwrap();

        let found = match_local(
            &store,
            EntityType::Product,
            &ExternalId::new("17"),
            None,
            Some("B-1"),
            DuplicateKeyPolicy::CreateNew,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(found.key, MatchKey::ExternalId);
        assert_eq!(found.value.id, Some(a_id));
        assert_ne!(found.value.id, Some(b_id));
    }

    #[tokio::test]
    async fn test_global_id_then_business_key() {
        let store = MemoryStore::new();
        let gid = GlobalId::generate();
        let mut a = product("A-1");
        a.meta.global_id = Some(gid.clone());
        store.save(&a).await.unwrap();
        store.save(&product("B-1")).await.unwrap();

        let by_gid = match_local(
            &store,
            EntityType::Product,
            &ExternalId::new("99"),
            Some(&gid),
            Some("B-1"),
            DuplicateKeyPolicy::CreateNew,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(by_gid.key, MatchKey::GlobalId);

        let by_key = match_local(
            &store,
            EntityType::Product,
            &ExternalId::new("99"),
            None,
            Some(" B-1 "),
            DuplicateKeyPolicy::CreateNew,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(by_key.key, MatchKey::BusinessKey);
        assert_eq!(by_key.value.business_key(), Some("B-1"));
    }

    #[tokio::test]
    async fn test_duplicate_business_keys_follow_policy() {
        let store = MemoryStore::new();
        let first = store.save(&product("DUP")).await.unwrap();
        store.save(&product("DUP")).await.unwrap();

        let lookup = |policy| {
            let store = &store;
            async move {
                match_local(
                    store,
                    EntityType::Product,
                    &ExternalId::new("5"),
                    None,
                    Some("DUP"),
                    policy,
                )
                .await
            }
        };

        assert!(lookup(DuplicateKeyPolicy::CreateNew).await.unwrap().is_none());
        let oldest = lookup(DuplicateKeyPolicy::MatchOldest).await.unwrap().unwrap();
        assert_eq!(oldest.value.id, Some(first));
        assert!(matches!(
            lookup(DuplicateKeyPolicy::Reject).await,
            Err(SyncError::Validation(ValidationError::AmbiguousBusinessKey { candidates: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_linked_records_are_not_business_key_candidates() {
        let store = MemoryStore::new();
        let mut linked = product("K-1");
        linked.meta.external_id = Some(ExternalId::new("1"));
        store.save(&linked).await.unwrap();

        let found = match_local(
            &store,
            EntityType::Product,
            &ExternalId::new("2"),
            None,
            Some("K-1"),
            DuplicateKeyPolicy::MatchOldest,
        )
        .await
        .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_locate_remote_by_global_id_and_key() {
        let crm = MemoryCrm::new(Arc::new(ManualClock::new(0)));
        let gid = GlobalId::generate();

        let mut by_gid = Fields::new();
        by_gid.insert("CODE".into(), json!("G-1"));
        by_gid.insert(fields::GLOBAL_ID.into(), json!(gid.as_str()));
        let gid_remote = crm.insert(EntityType::Product, by_gid);

        let mut by_key = Fields::new();
        by_key.insert("CODE".into(), json!("K-1"));
        let key_remote = crm.insert(EntityType::Product, by_key);

        let mut record = product("K-1");
        record.meta.global_id = Some(gid);
        let found = locate_remote(&crm, &record, "CODE", DuplicateKeyPolicy::CreateNew)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key, MatchKey::GlobalId);
        assert_eq!(found.value, gid_remote);

        record.meta.global_id = None;
        let found = locate_remote(&crm, &record, "CODE", DuplicateKeyPolicy::CreateNew)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.key, MatchKey::BusinessKey);
        assert_eq!(found.value, key_remote);

        let unknown = product("NOPE");
        assert!(locate_remote(&crm, &unknown, "CODE", DuplicateKeyPolicy::CreateNew)
            .await
            .unwrap()
            .is_none());
    }
}

//! Mutations
//!
//! A closed set of commands applied optimistically to the local replica and
//! replayed by the server under the domain's wire names. Every applied
//! mutation leaves a [`MutationRecord`] in the [`MutationQueue`] until a push
//! or pull confirms the server has it.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{Domain, Entity};
use crate::replica::Transaction;

/// A command against one domain's replica
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation<F, P> {
    /// Insert a record; the id is generated by the client
    Create { id: String, fields: F },
    /// Patch an existing record; a missing record is left alone
    Update { id: String, patch: P },
    /// Remove a record; a missing record is left alone
    Delete { id: String },
}

/// The mutation type of a domain
pub type DomainMutation<D> = Mutation<<D as Domain>::Fields, <D as Domain>::Patch>;

impl<F, P> Mutation<F, P> {
    /// Create a record under a fresh random id
    pub fn create(fields: F) -> Self {
        Mutation::Create {
            id: uuid::Uuid::new_v4().to_string(),
            fields,
        }
    }

    pub fn update(id: impl Into<String>, patch: P) -> Self {
        Mutation::Update {
            id: id.into(),
            patch,
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Mutation::Delete { id: id.into() }
    }

    /// Id of the record this mutation targets
    pub fn id(&self) -> &str {
        match self {
            Mutation::Create { id, .. } | Mutation::Update { id, .. } | Mutation::Delete { id } => {
                id
            }
        }
    }
}

/// Apply a mutation inside a replica transaction
///
/// Errors leave the transaction to be discarded by the caller.
pub fn apply<D: Domain>(
    tx: &mut Transaction<'_, D::Fields>,
    mutation: &DomainMutation<D>,
    now: DateTime<Utc>,
) -> Result<()> {
    if mutation.id().trim().is_empty() {
        return Err(SyncError::InvalidMutation(format!(
            "{}: record id must not be empty",
            wire_name::<D>(mutation)
        )));
    }

    match mutation {
        Mutation::Create { id, fields } => {
            D::validate(fields).map_err(|e| {
                SyncError::InvalidMutation(format!("{}: {}", D::MUTATORS.create, e))
            })?;
            tx.set(D::key(id), Entity::new_at(id.clone(), fields.clone(), now));
        }
        Mutation::Update { id, patch } => {
            let key = D::key(id);
            let Some(current) = tx.get(&key) else {
                debug!("{}: no record '{}', skipping", D::MUTATORS.update, id);
                return Ok(());
            };
            let mut updated = current.clone();
            D::apply_patch(&mut updated.fields, patch);
            D::validate(&updated.fields).map_err(|e| {
                SyncError::InvalidMutation(format!("{}: {}", D::MUTATORS.update, e))
            })?;
            updated.touch(now);
            tx.set(key, updated);
        }
        Mutation::Delete { id } => {
            tx.delete(&D::key(id));
        }
    }
    Ok(())
}

/// Name the server replays a mutation under
pub fn wire_name<D: Domain>(mutation: &DomainMutation<D>) -> &'static str {
    match mutation {
        Mutation::Create { .. } => D::MUTATORS.create,
        Mutation::Update { .. } => D::MUTATORS.update,
        Mutation::Delete { .. } => D::MUTATORS.delete,
    }
}

/// JSON arguments sent with a mutation: the record id merged with its fields or patch
pub fn wire_args<D: Domain>(mutation: &DomainMutation<D>) -> Result<Value> {
    let mut args = match mutation {
        Mutation::Create { fields, .. } => serde_json::to_value(fields)?,
        Mutation::Update { patch, .. } => serde_json::to_value(patch)?,
        Mutation::Delete { .. } => Value::Object(Default::default()),
    };
    let Value::Object(ref mut map) = args else {
        return Err(SyncError::InvalidMutation(format!(
            "{}: arguments must serialize to an object",
            wire_name::<D>(mutation)
        )));
    };
    map.insert("id".to_string(), Value::String(mutation.id().to_string()));
    Ok(args)
}

/// A mutation as transmitted to the push endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    /// Per-client sequence number; the server uses it to drop replays
    pub id: u64,
    pub name: String,
    pub args: Value,
    /// Id generated locally for create mutations
    #[serde(
        rename = "clientGeneratedID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_generated_id: Option<String>,
    #[serde(rename = "timestamp")]
    pub issued_at: DateTime<Utc>,
}

/// Mutations applied locally but not yet confirmed by the server, in order
#[derive(Debug, Clone)]
pub struct MutationQueue {
    records: VecDeque<MutationRecord>,
    next_id: u64,
}

impl MutationQueue {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Rebuild a queue from persisted records
    pub fn restore(records: Vec<MutationRecord>, next_id: u64) -> Self {
        let floor = records.last().map(|r| r.id + 1).unwrap_or(1);
        Self {
            records: records.into(),
            next_id: next_id.max(floor),
        }
    }

    /// Append a record and return its id
    pub fn enqueue(
        &mut self,
        name: &str,
        args: Value,
        client_generated_id: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(MutationRecord {
            id,
            name: name.to_string(),
            args,
            client_generated_id,
            issued_at,
        });
        id
    }

    /// Copy of every pending record, oldest first
    pub fn pending(&self) -> Vec<MutationRecord> {
        self.records.iter().cloned().collect()
    }

    /// Drop records with an id at or below `last_id`; returns how many were dropped
    pub fn acknowledge(&mut self, last_id: u64) -> usize {
        let before = self.records.len();
        while self.records.front().is_some_and(|r| r.id <= last_id) {
            self.records.pop_front();
        }
        before - self.records.len()
    }

    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MutationQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Diary, DiaryEntry, DiaryPatch, Food, FoodEntry};
    use crate::replica::Replica;

    fn run<D: Domain>(replica: &Replica<D::Fields>, mutation: DomainMutation<D>) -> Result<()> {
        replica.transact(|tx| apply::<D>(tx, &mutation, Utc::now()))
    }

    #[test]
    fn test_create_is_visible_immediately() {
        let replica: Replica<DiaryEntry> = Replica::new();
        let fields = DiaryEntry {
            title: "Monday".to_string(),
            body: "Rain".to_string(),
        };
        run::<Diary>(&replica, Mutation::Create { id: "a".to_string(), fields }).unwrap();

        let entity = replica.get("entry/a").unwrap();
        assert_eq!(entity.fields.title, "Monday");
        assert_eq!(entity.created_at, entity.updated_at);
    }

    #[test]
    fn test_update_missing_is_noop() {
        let replica: Replica<DiaryEntry> = Replica::new();
        let patch = DiaryPatch {
            title: Some("x".to_string()),
            body: None,
        };
        run::<Diary>(&replica, Mutation::update("missing", patch)).unwrap();

        assert!(replica.get("entry/missing").is_none());
        assert!(replica.is_empty());
    }

    #[test]
    fn test_update_keeps_created_at_and_advances_updated_at() {
        let replica: Replica<DiaryEntry> = Replica::new();
        let created = Utc::now() - chrono::Duration::seconds(60);
        replica
            .transact(|tx| {
                apply::<Diary>(
                    tx,
                    &Mutation::Create {
                        id: "a".to_string(),
                        fields: DiaryEntry::default(),
                    },
                    created,
                )
            })
            .unwrap();

        let patch = DiaryPatch {
            title: Some("Edited".to_string()),
            body: None,
        };
        run::<Diary>(&replica, Mutation::update("a", patch)).unwrap();

        let entity = replica.get("entry/a").unwrap();
        assert_eq!(entity.fields.title, "Edited");
        assert_eq!(entity.created_at, created);
        assert!(entity.updated_at > created);
    }

    #[test]
    fn test_delete_twice_is_idempotent() {
        let replica: Replica<DiaryEntry> = Replica::new();
        run::<Diary>(
            &replica,
            Mutation::Create {
                id: "a".to_string(),
                fields: DiaryEntry::default(),
            },
        )
        .unwrap();

        run::<Diary>(&replica, Mutation::delete("a")).unwrap();
        assert!(replica.get("entry/a").is_none());
        run::<Diary>(&replica, Mutation::delete("a")).unwrap();
        assert!(replica.get("entry/a").is_none());
    }

    #[test]
    fn test_invalid_create_is_rejected_without_writes() {
        let replica: Replica<FoodEntry> = Replica::new();
        let result = run::<Food>(
            &replica,
            Mutation::Create {
                id: "a".to_string(),
                fields: FoodEntry {
                    name: String::new(),
                    price: None,
                },
            },
        );

        assert!(matches!(result, Err(SyncError::InvalidMutation(_))));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_empty_id_is_rejected() {
        let replica: Replica<DiaryEntry> = Replica::new();
        let result = run::<Diary>(&replica, Mutation::delete(" "));
        assert!(matches!(result, Err(SyncError::InvalidMutation(_))));
    }

    #[test]
    fn test_wire_args_merge_id() {
        let mutation: DomainMutation<Food> = Mutation::Create {
            id: "a".to_string(),
            fields: FoodEntry {
                name: "Tea".to_string(),
                price: None,
            },
        };
        assert_eq!(wire_name::<Food>(&mutation), "createEntry");

        let args = wire_args::<Food>(&mutation).unwrap();
        assert_eq!(args, serde_json::json!({"id": "a", "name": "Tea"}));

        let delete: DomainMutation<Food> = Mutation::delete("a");
        assert_eq!(
            wire_args::<Food>(&delete).unwrap(),
            serde_json::json!({"id": "a"})
        );
    }

    #[test]
    fn test_queue_acknowledge_drops_prefix() {
        let mut queue = MutationQueue::new();
        let now = Utc::now();
        let first = queue.enqueue("createEntry", Value::Null, Some("a".into()), now);
        let second = queue.enqueue("updateEntry", Value::Null, None, now);
        queue.enqueue("deleteEntry", Value::Null, None, now);
        assert_eq!((first, second), (1, 2));

        assert_eq!(queue.acknowledge(second), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pending()[0].name, "deleteEntry");

        // Acknowledging an older id again changes nothing
        assert_eq!(queue.acknowledge(first), 0);
    }

    #[test]
    fn test_queue_restore_never_reuses_ids() {
        let mut queue = MutationQueue::new();
        let now = Utc::now();
        queue.enqueue("createEntry", Value::Null, None, now);
        queue.enqueue("createEntry", Value::Null, None, now);

        let restored = MutationQueue::restore(queue.pending(), 1);
        assert_eq!(restored.next_id(), 3);
    }

    #[test]
    fn test_record_wire_format() {
        let record = MutationRecord {
            id: 7,
            name: "createIdea".to_string(),
            args: serde_json::json!({"id": "x"}),
            client_generated_id: Some("x".to_string()),
            issued_at: Utc::now(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["clientGeneratedID"], "x");
        assert!(value.get("timestamp").is_some());
    }
}

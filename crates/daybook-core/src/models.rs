//! Data models for Daybook
//!
//! Every feature (diary, food log, ideas) stores the same envelope: an
//! [`Entity`] with an opaque id, timestamps, and domain-specific fields.
//! A [`Domain`] binds a feature to its field and patch types, its replica key
//! prefix, and the wire names its mutations are replayed under on the server.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A synced record
///
/// Domain fields are flattened into the record on the wire, so a diary entry
/// serializes as `{"id": .., "title": .., "body": .., "createdAt": .., ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Entity<F> {
    /// Opaque identifier, unique within its domain
    pub id: String,
    /// Domain-specific fields
    #[serde(flatten)]
    pub fields: F,
    /// When this record was created
    pub created_at: DateTime<Utc>,
    /// When this record was last updated
    pub updated_at: DateTime<Utc>,
}

impl<F> Entity<F> {
    /// Create a record stamped with the given time
    pub fn new_at(id: impl Into<String>, fields: F, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a record stamped with the local clock
    pub fn new(id: impl Into<String>, fields: F) -> Self {
        Self::new_at(id, fields, Utc::now())
    }

    /// Advance `updated_at`, never moving it backwards
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Wire names of a domain's mutators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutatorNames {
    pub create: &'static str,
    pub update: &'static str,
    pub delete: &'static str,
}

/// A feature whose state is synced through its own replica
pub trait Domain: Send + Sync + 'static {
    /// Domain name, used in endpoint paths and snapshot file names
    const NAME: &'static str;

    /// Prefix under which this domain's records are keyed in the replica
    const KEY_PREFIX: &'static str;

    /// Names the server replays this domain's mutations under
    const MUTATORS: MutatorNames;

    /// Record fields
    type Fields: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Partial update; `None` members leave the field untouched
    type Patch: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Apply a partial update in place
    fn apply_patch(fields: &mut Self::Fields, patch: &Self::Patch);

    /// Reject field values the server would refuse
    fn validate(_fields: &Self::Fields) -> Result<(), String> {
        Ok(())
    }

    /// Replica key for a record id
    fn key(id: &str) -> String {
        format!("{}{}", Self::KEY_PREFIX, id)
    }
}

// ==================== Diary ====================

/// The diary feature
#[derive(Debug, Clone, Copy)]
pub struct Diary;

/// A diary entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiaryEntry {
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Partial update of a diary entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DiaryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl Domain for Diary {
    const NAME: &'static str = "diary";
    const KEY_PREFIX: &'static str = "entry/";
    const MUTATORS: MutatorNames = MutatorNames {
        create: "createEntry",
        update: "updateEntry",
        delete: "deleteEntry",
    };

    type Fields = DiaryEntry;
    type Patch = DiaryPatch;

    fn apply_patch(fields: &mut DiaryEntry, patch: &DiaryPatch) {
        if let Some(ref title) = patch.title {
            fields.title = title.clone();
        }
        if let Some(ref body) = patch.body {
            fields.body = body.clone();
        }
    }
}

// ==================== Food ====================

/// The food log feature
#[derive(Debug, Clone, Copy)]
pub struct Food;

/// Something eaten or drunk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FoodEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

/// Partial update of a food entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FoodPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl Domain for Food {
    const NAME: &'static str = "food";
    const KEY_PREFIX: &'static str = "entry/";
    const MUTATORS: MutatorNames = MutatorNames {
        create: "createEntry",
        update: "updateEntry",
        delete: "deleteEntry",
    };

    type Fields = FoodEntry;
    type Patch = FoodPatch;

    fn apply_patch(fields: &mut FoodEntry, patch: &FoodPatch) {
        if let Some(ref name) = patch.name {
            fields.name = name.clone();
        }
        if patch.price.is_some() {
            fields.price = patch.price;
        }
    }

    fn validate(fields: &FoodEntry) -> Result<(), String> {
        if fields.name.trim().is_empty() {
            return Err("food entry name must not be empty".to_string());
        }
        match fields.price {
            Some(price) if !price.is_finite() || price < 0.0 => {
                Err(format!("invalid price: {}", price))
            }
            _ => Ok(()),
        }
    }
}

// ==================== Ideas ====================

/// The ideas feature
#[derive(Debug, Clone, Copy)]
pub struct Ideas;

/// An idea
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Idea {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Partial update of an idea
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IdeaPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Domain for Ideas {
    const NAME: &'static str = "ideas";
    const KEY_PREFIX: &'static str = "idea/";
    const MUTATORS: MutatorNames = MutatorNames {
        create: "createIdea",
        update: "updateIdea",
        delete: "deleteIdea",
    };

    type Fields = Idea;
    type Patch = IdeaPatch;

    fn apply_patch(fields: &mut Idea, patch: &IdeaPatch) {
        if let Some(ref title) = patch.title {
            fields.title = title.clone();
        }
        if let Some(ref description) = patch.description {
            fields.description = if description.is_empty() {
                None
            } else {
                Some(description.clone())
            };
        }
    }

    fn validate(fields: &Idea) -> Result<(), String> {
        if fields.title.trim().is_empty() {
            return Err("idea title must not be empty".to_string());
        }
        Ok(())
    }
}

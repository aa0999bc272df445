//! Items, write preconditions and update mutations.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{DbError, DbResult};

/// Address of an item: partition key plus sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ItemKey {
    pub pk: String,
    pub sk: String,
}

impl ItemKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.pk, self.sk)
    }
}

/// A stored item: key plus a JSON attribute map.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub key: ItemKey,
    pub attrs: Map<String, Value>,
}

impl Item {
    /// Create an empty item.
    pub fn new(key: ItemKey) -> Self {
        Self {
            key,
            attrs: Map::new(),
        }
    }

    /// Build an item from a serializable record. The record must serialize to an object.
    pub fn from_record<T: Serialize>(key: ItemKey, record: &T) -> DbResult<Self> {
        match serde_json::to_value(record)? {
            Value::Object(attrs) => Ok(Self { key, attrs }),
            other => Err(DbError::Constraint(format!(
                "record for {} is not an object: {}",
                key, other
            ))),
        }
    }

    /// Decode the attribute map into a record.
    pub fn to_record<T: DeserializeOwned>(&self) -> DbResult<T> {
        Ok(serde_json::from_value(Value::Object(self.attrs.clone()))?)
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, attr: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(attr.to_string(), value.into());
        self
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.attrs.get(attr)
    }

    pub fn get_str(&self, attr: &str) -> Option<&str> {
        self.attrs.get(attr).and_then(Value::as_str)
    }

    pub fn get_i64(&self, attr: &str) -> Option<i64> {
        self.attrs.get(attr).and_then(Value::as_i64)
    }
}

/// Precondition evaluated against the current image of the target item.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The item exists.
    Exists,
    /// The item does not exist.
    NotExists,
    /// The item exists and `attr` equals `value`. A missing attribute compares as null.
    Equals { attr: String, value: Value },
    /// Every condition holds.
    All(Vec<Condition>),
    /// At least one condition holds.
    Any(Vec<Condition>),
}

impl Condition {
    pub fn equals(attr: &str, value: impl Into<Value>) -> Self {
        Condition::Equals {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    /// Whether the condition holds for `current` (`None` when the item is absent).
    pub fn holds(&self, current: Option<&Map<String, Value>>) -> bool {
        match self {
            Condition::Exists => current.is_some(),
            Condition::NotExists => current.is_none(),
            Condition::Equals { attr, value } => match current {
                Some(attrs) => attrs.get(attr).unwrap_or(&Value::Null) == value,
                None => false,
            },
            Condition::All(conds) => conds.iter().all(|c| c.holds(current)),
            Condition::Any(conds) => conds.iter().any(|c| c.holds(current)),
        }
    }
}

/// A single attribute change applied by an update.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Overwrite an attribute.
    Set { attr: String, value: Value },
    /// Write an attribute only if it is absent or null.
    SetIfAbsent { attr: String, value: Value },
    /// Write one entry of a map-typed attribute only if that entry is absent.
    SetEntryIfAbsent {
        attr: String,
        entry: String,
        value: Value,
    },
    /// Append values to a list-typed attribute, creating it if needed.
    Append { attr: String, values: Vec<Value> },
    /// Add to a numeric attribute, treating absent as zero.
    Increment { attr: String, by: i64 },
    /// Remove an attribute.
    Remove { attr: String },
}

impl Mutation {
    pub fn set(attr: &str, value: impl Into<Value>) -> Self {
        Mutation::Set {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    /// Overwrite an attribute with any serializable value.
    pub fn set_json<T: Serialize>(attr: &str, value: &T) -> DbResult<Self> {
        Ok(Mutation::Set {
            attr: attr.to_string(),
            value: serde_json::to_value(value)?,
        })
    }

    pub fn set_if_absent(attr: &str, value: impl Into<Value>) -> Self {
        Mutation::SetIfAbsent {
            attr: attr.to_string(),
            value: value.into(),
        }
    }

    pub fn set_entry_if_absent(attr: &str, entry: &str, value: impl Into<Value>) -> Self {
        Mutation::SetEntryIfAbsent {
            attr: attr.to_string(),
            entry: entry.to_string(),
            value: value.into(),
        }
    }

    pub fn append<T: Serialize>(attr: &str, values: &[T]) -> DbResult<Self> {
        let values = values
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Mutation::Append {
            attr: attr.to_string(),
            values,
        })
    }

    pub fn increment(attr: &str, by: i64) -> Self {
        Mutation::Increment {
            attr: attr.to_string(),
            by,
        }
    }

    pub fn remove(attr: &str) -> Self {
        Mutation::Remove {
            attr: attr.to_string(),
        }
    }

    /// Apply the mutation to an attribute map in place.
    pub fn apply(&self, attrs: &mut Map<String, Value>) -> DbResult<()> {
        match self {
            Mutation::Set { attr, value } => {
                attrs.insert(attr.clone(), value.clone());
            }
            Mutation::SetIfAbsent { attr, value } => {
                let present = attrs.get(attr).is_some_and(|v| !v.is_null());
                if !present {
                    attrs.insert(attr.clone(), value.clone());
                }
            }
            Mutation::SetEntryIfAbsent { attr, entry, value } => {
                let slot = attrs
                    .entry(attr.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                if slot.is_null() {
                    *slot = Value::Object(Map::new());
                }
                match slot {
                    Value::Object(map) => {
                        map.entry(entry.clone()).or_insert_with(|| value.clone());
                    }
                    _ => {
                        return Err(DbError::Constraint(format!(
                            "attribute {} is not a map",
                            attr
                        )))
                    }
                }
            }
            Mutation::Append { attr, values } => {
                let slot = attrs
                    .entry(attr.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if slot.is_null() {
                    *slot = Value::Array(Vec::new());
                }
                match slot {
                    Value::Array(list) => list.extend(values.iter().cloned()),
                    _ => {
                        return Err(DbError::Constraint(format!(
                            "attribute {} is not a list",
                            attr
                        )))
                    }
                }
            }
            Mutation::Increment { attr, by } => {
                let current = match attrs.get(attr) {
                    None | Some(Value::Null) => 0,
                    Some(v) => v.as_i64().ok_or_else(|| {
                        DbError::Constraint(format!("attribute {} is not an integer", attr))
                    })?,
                };
                attrs.insert(attr.clone(), Value::from(current + by));
            }
            Mutation::Remove { attr } => {
                attrs.remove(attr);
            }
        }
        Ok(())
    }
}

/// One element of a multi-item write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        item: Item,
        condition: Option<Condition>,
    },
    Update {
        key: ItemKey,
        mutations: Vec<Mutation>,
        condition: Option<Condition>,
    },
    Delete {
        key: ItemKey,
        condition: Option<Condition>,
    },
    /// Assert a condition on an item without writing it.
    Check { key: ItemKey, condition: Condition },
}

impl WriteOp {
    pub fn key(&self) -> &ItemKey {
        match self {
            WriteOp::Put { item, .. } => &item.key,
            WriteOp::Update { key, .. } => key,
            WriteOp::Delete { key, .. } => key,
            WriteOp::Check { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            WriteOp::Put { condition, .. }
            | WriteOp::Update { condition, .. }
            | WriteOp::Delete { condition, .. } => condition.as_ref(),
            WriteOp::Check { condition, .. } => Some(condition),
        }
    }
}

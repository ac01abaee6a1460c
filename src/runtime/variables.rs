//! Process Variables
//!
//! Typed variable values, the pluggable type registry that decides how a
//! value is stored, and the per-instance variable table the scope chain
//! reads and writes.
//!
//! A value is stored under the first registered [`VariableType`] that can
//! hold it. When a later write no longer fits the stored type, the old
//! record is deleted and a new record with a new id is inserted.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::{Entity, EntityChanges};

/// Strings longer than this move from `string` to `longString`.
pub const MAX_SHORT_STRING: usize = 4000;

/// A runtime variable value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum VariableValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    Json(Value),
}

impl VariableValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// JSON view of the value, used by guard expressions and payloads.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Boolean(b) => Value::Bool(*b),
            Self::Integer(i) => Value::from(*i),
            Self::Double(d) => Value::from(*d),
            Self::String(s) => Value::String(s.clone()),
            Self::Date(d) => Value::String(d.to_rfc3339()),
            Self::Bytes(b) => Value::from(b.clone()),
            Self::Json(v) => v.clone(),
        }
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for VariableValue {
    fn from(value: i32) -> Self {
        Self::Integer(value as i64)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<DateTime<Utc>> for VariableValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl From<Value> for VariableValue {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Storage columns of a variable record.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ValueFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub double: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<Vec<u8>>,
}

/// Persistent record of one variable in one scope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VariableInstance {
    pub id: String,
    #[serde(default)]
    pub revision: u64,
    pub name: String,
    /// Name of the [`VariableType`] that wrote the fields
    pub type_name: String,
    /// Id of the scope-owning execution
    pub scope_id: String,
    pub process_instance_id: String,
    #[serde(flatten)]
    pub fields: ValueFields,
}

impl Entity for VariableInstance {
    const KIND: &'static str = "variable";

    fn entity_id(&self) -> &str {
        &self.id
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

/// Strategy for storing one family of values.
pub trait VariableType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this type can hold the value.
    fn can_store(&self, value: &VariableValue) -> bool;

    fn write(&self, value: &VariableValue, fields: &mut ValueFields);

    fn read(&self, fields: &ValueFields) -> Option<VariableValue>;
}

struct NullType;

impl VariableType for NullType {
    fn name(&self) -> &'static str {
        "null"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Null)
    }

    fn write(&self, _value: &VariableValue, _fields: &mut ValueFields) {}

    fn read(&self, _fields: &ValueFields) -> Option<VariableValue> {
        Some(VariableValue::Null)
    }
}

struct BooleanType;

impl VariableType for BooleanType {
    fn name(&self) -> &'static str {
        "boolean"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Boolean(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Boolean(b) = value {
            fields.long = Some(i64::from(*b));
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.long.map(|l| VariableValue::Boolean(l != 0))
    }
}

/// Integers within the 32-bit range.
struct IntegerType;

impl VariableType for IntegerType {
    fn name(&self) -> &'static str {
        "integer"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Integer(i) if i32::try_from(*i).is_ok())
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Integer(i) = value {
            fields.long = Some(*i);
            fields.text = Some(i.to_string());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.long.map(VariableValue::Integer)
    }
}

struct LongType;

impl VariableType for LongType {
    fn name(&self) -> &'static str {
        "long"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Integer(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Integer(i) = value {
            fields.long = Some(*i);
            fields.text = Some(i.to_string());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.long.map(VariableValue::Integer)
    }
}

struct DoubleType;

impl VariableType for DoubleType {
    fn name(&self) -> &'static str {
        "double"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Double(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Double(d) = value {
            fields.double = Some(*d);
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.double.map(VariableValue::Double)
    }
}

struct StringType;

impl VariableType for StringType {
    fn name(&self) -> &'static str {
        "string"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::String(s) if s.chars().count() <= MAX_SHORT_STRING)
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::String(s) = value {
            fields.text = Some(s.clone());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.text.clone().map(VariableValue::String)
    }
}

/// Strings too long for the text column, kept as UTF-8 bytes.
struct LongStringType;

impl VariableType for LongStringType {
    fn name(&self) -> &'static str {
        "longString"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::String(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::String(s) = value {
            fields.bytes = Some(s.as_bytes().to_vec());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        let bytes = fields.bytes.as_ref()?;
        String::from_utf8(bytes.clone()).ok().map(VariableValue::String)
    }
}

struct DateType;

impl VariableType for DateType {
    fn name(&self) -> &'static str {
        "date"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Date(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Date(d) = value {
            fields.long = Some(d.timestamp_millis());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        let millis = fields.long?;
        Utc.timestamp_millis_opt(millis).single().map(VariableValue::Date)
    }
}

struct BytesType;

impl VariableType for BytesType {
    fn name(&self) -> &'static str {
        "bytes"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Bytes(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Bytes(b) = value {
            fields.bytes = Some(b.clone());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        fields.bytes.clone().map(VariableValue::Bytes)
    }
}

/// Structured values, serialized to JSON text.
struct JsonType;

impl VariableType for JsonType {
    fn name(&self) -> &'static str {
        "json"
    }

    fn can_store(&self, value: &VariableValue) -> bool {
        matches!(value, VariableValue::Json(_))
    }

    fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
        if let VariableValue::Json(v) = value {
            fields.text = Some(v.to_string());
        }
    }

    fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
        let text = fields.text.as_ref()?;
        serde_json::from_str(text).ok().map(VariableValue::Json)
    }
}

/// Ordered registry of variable types; the first type that can store a value wins.
pub struct VariableTypes {
    types: Vec<Box<dyn VariableType>>,
}

impl VariableTypes {
    /// Registry with no types at all.
    pub fn empty() -> Self {
        Self { types: Vec::new() }
    }

    /// Appends a type at the end of the lookup order.
    pub fn add(&mut self, variable_type: Box<dyn VariableType>) {
        self.types.push(variable_type);
    }

    /// Inserts a type ahead of the built-in ones.
    pub fn add_first(&mut self, variable_type: Box<dyn VariableType>) {
        self.types.insert(0, variable_type);
    }

    pub fn get(&self, name: &str) -> Option<&dyn VariableType> {
        self.types
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// First type able to store the value.
    pub fn find_for(&self, value: &VariableValue) -> Option<&dyn VariableType> {
        self.types
            .iter()
            .find(|t| t.can_store(value))
            .map(|t| t.as_ref())
    }

    /// Decodes a stored record.
    pub fn read(&self, instance: &VariableInstance) -> Option<VariableValue> {
        let Some(variable_type) = self.get(&instance.type_name) else {
            warn!(
                "Variable '{}' has unknown type '{}'",
                instance.name, instance.type_name
            );
            return None;
        };
        variable_type.read(&instance.fields)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.types.iter().map(|t| t.name()).collect()
    }
}

impl Default for VariableTypes {
    fn default() -> Self {
        let mut types = Self::empty();
        types.add(Box::new(NullType));
        types.add(Box::new(BooleanType));
        types.add(Box::new(IntegerType));
        types.add(Box::new(LongType));
        types.add(Box::new(DoubleType));
        types.add(Box::new(StringType));
        types.add(Box::new(LongStringType));
        types.add(Box::new(DateType));
        types.add(Box::new(BytesType));
        types.add(Box::new(JsonType));
        types
    }
}

/// Result of a variable write.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableWrite {
    pub variable_id: String,
    pub type_name: String,
    pub old_value: Option<VariableValue>,
    /// True when the variable did not exist in the scope before
    pub created: bool,
    /// True when the stored type changed and the record was replaced
    pub migrated: bool,
}

impl VariableWrite {
    /// A record was inserted, so no loaded revision guards this write.
    pub fn inserted_record(&self) -> bool {
        self.created || self.migrated
    }
}

/// Variable records of one process instance.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    current: BTreeMap<String, VariableInstance>,
    original: BTreeMap<String, VariableInstance>,
}

impl VariableStore {
    pub fn from_loaded(loaded: Vec<VariableInstance>) -> Self {
        let current: BTreeMap<String, VariableInstance> = loaded
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();
        Self {
            original: current.clone(),
            current,
        }
    }

    pub fn find(&self, scope_id: &str, name: &str) -> Option<&VariableInstance> {
        self.current
            .values()
            .find(|v| v.scope_id == scope_id && v.name == name)
    }

    pub fn in_scope<'a>(&'a self, scope_id: &'a str) -> impl Iterator<Item = &'a VariableInstance> {
        self.current.values().filter(move |v| v.scope_id == scope_id)
    }

    /// Writes a value into a scope, migrating the record when the type changes.
    pub fn write(
        &mut self,
        scope_id: &str,
        process_instance_id: &str,
        name: &str,
        value: &VariableValue,
        types: &VariableTypes,
        next_id: impl FnOnce() -> String,
    ) -> Option<VariableWrite> {
        let new_type = types.find_for(value)?;
        let existing_id = self.find(scope_id, name).map(|v| v.id.clone());

        if let Some(id) = existing_id {
            let existing = self.current.get_mut(&id)?;
            let old_value = types.read(existing);

            if existing.type_name == new_type.name() {
                existing.fields = ValueFields::default();
                new_type.write(value, &mut existing.fields);
                return Some(VariableWrite {
                    variable_id: id,
                    type_name: existing.type_name.clone(),
                    old_value,
                    created: false,
                    migrated: false,
                });
            }

            debug!(
                "Variable '{}' changes type {} -> {}, replacing record {}",
                name,
                existing.type_name,
                new_type.name(),
                id
            );
            self.current.remove(&id);
            let variable_id = self.insert(scope_id, process_instance_id, name, value, new_type, next_id());
            return Some(VariableWrite {
                variable_id,
                type_name: new_type.name().to_string(),
                old_value,
                created: false,
                migrated: true,
            });
        }

        let variable_id = self.insert(scope_id, process_instance_id, name, value, new_type, next_id());
        Some(VariableWrite {
            variable_id,
            type_name: new_type.name().to_string(),
            old_value: None,
            created: true,
            migrated: false,
        })
    }

    fn insert(
        &mut self,
        scope_id: &str,
        process_instance_id: &str,
        name: &str,
        value: &VariableValue,
        variable_type: &dyn VariableType,
        id: String,
    ) -> String {
        let mut fields = ValueFields::default();
        variable_type.write(value, &mut fields);
        self.current.insert(
            id.clone(),
            VariableInstance {
                id: id.clone(),
                revision: 0,
                name: name.to_string(),
                type_name: variable_type.name().to_string(),
                scope_id: scope_id.to_string(),
                process_instance_id: process_instance_id.to_string(),
                fields,
            },
        );
        id
    }

    /// Removes a variable from one scope. Returns true when it existed.
    pub fn remove(&mut self, scope_id: &str, name: &str) -> bool {
        match self.find(scope_id, name).map(|v| v.id.clone()) {
            Some(id) => self.current.remove(&id).is_some(),
            None => false,
        }
    }

    /// Drops every variable owned by a scope.
    pub fn remove_scope(&mut self, scope_id: &str) {
        self.current.retain(|_, v| v.scope_id != scope_id);
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn changes(&self) -> EntityChanges<VariableInstance> {
        EntityChanges::diff(&self.original, self.current.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn counter() -> impl FnMut() -> String {
        let mut next = 100;
        move || {
            next += 1;
            next.to_string()
        }
    }

    #[test]
    fn test_first_match_type_selection() {
        let types = VariableTypes::default();

        assert_eq!(types.find_for(&VariableValue::Integer(5)).unwrap().name(), "integer");
        assert_eq!(
            types.find_for(&VariableValue::Integer(i64::from(i32::MAX) + 1)).unwrap().name(),
            "long"
        );
        assert_eq!(types.find_for(&"short".into()).unwrap().name(), "string");
        assert_eq!(
            types.find_for(&VariableValue::String("x".repeat(MAX_SHORT_STRING + 1))).unwrap().name(),
            "longString"
        );
        assert_eq!(types.find_for(&json!({"a": 1}).into()).unwrap().name(), "json");
        assert_eq!(types.find_for(&VariableValue::Null).unwrap().name(), "null");
    }

    #[test]
    fn test_every_builtin_type_reads_back() {
        let types = VariableTypes::default();
        let values = vec![
            VariableValue::Null,
            VariableValue::Boolean(true),
            VariableValue::Integer(-42),
            VariableValue::Integer(i64::MAX),
            VariableValue::Double(2.5),
            VariableValue::String("hello".to_string()),
            VariableValue::String("y".repeat(MAX_SHORT_STRING + 10)),
            VariableValue::Date(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()),
            VariableValue::Bytes(vec![0, 1, 255]),
            VariableValue::Json(json!({"items": [1, 2, 3]})),
        ];

        for value in values {
            let variable_type = types.find_for(&value).unwrap();
            let mut fields = ValueFields::default();
            variable_type.write(&value, &mut fields);
            assert_eq!(variable_type.read(&fields), Some(value));
        }
    }

    #[test]
    fn test_write_updates_in_place_for_same_type() {
        let types = VariableTypes::default();
        let mut store = VariableStore::default();
        let mut ids = counter();

        let first = store.write("1", "1", "x", &5.into(), &types, &mut ids).unwrap();
        let second = store.write("1", "1", "x", &7.into(), &types, &mut ids).unwrap();

        assert_eq!(first.variable_id, second.variable_id);
        assert!(first.created && first.inserted_record());
        assert_eq!(second.old_value, Some(VariableValue::Integer(5)));
        assert!(!second.migrated);
        assert!(!second.inserted_record());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_type_migration_replaces_record() {
        let types = VariableTypes::default();
        let mut store = VariableStore::from_loaded(vec![VariableInstance {
            id: "9".to_string(),
            revision: 1,
            name: "x".to_string(),
            type_name: "integer".to_string(),
            scope_id: "1".to_string(),
            process_instance_id: "1".to_string(),
            fields: ValueFields {
                long: Some(5),
                text: Some("5".to_string()),
                ..ValueFields::default()
            },
        }]);

        let write = store
            .write("1", "1", "x", &"hello".into(), &types, counter())
            .unwrap();

        assert!(write.migrated);
        assert!(!write.created);
        assert!(write.inserted_record());
        assert_ne!(write.variable_id, "9");
        assert_eq!(write.type_name, "string");

        let changes = store.changes();
        assert_eq!(changes.deleted, vec![("9".to_string(), 1)]);
        assert_eq!(changes.inserted.len(), 1);
        assert_eq!(changes.inserted[0].name, "x");
    }

    #[test]
    fn test_remove_scope() {
        let types = VariableTypes::default();
        let mut store = VariableStore::default();
        let mut ids = counter();
        store.write("1", "1", "a", &1.into(), &types, &mut ids);
        store.write("2", "1", "b", &2.into(), &types, &mut ids);

        store.remove_scope("2");

        assert!(store.find("2", "b").is_none());
        assert!(store.find("1", "a").is_some());
        assert_eq!(store.in_scope("1").count(), 1);
    }

    #[test]
    fn test_custom_type_takes_precedence() {
        struct UpperCaseType;

        impl VariableType for UpperCaseType {
            fn name(&self) -> &'static str {
                "upper"
            }
            fn can_store(&self, value: &VariableValue) -> bool {
                matches!(value, VariableValue::String(s) if s.chars().all(|c| c.is_uppercase()))
            }
            fn write(&self, value: &VariableValue, fields: &mut ValueFields) {
                if let VariableValue::String(s) = value {
                    fields.text = Some(s.to_lowercase());
                }
            }
            fn read(&self, fields: &ValueFields) -> Option<VariableValue> {
                fields.text.as_ref().map(|t| VariableValue::String(t.to_uppercase()))
            }
        }

        let mut types = VariableTypes::default();
        types.add_first(Box::new(UpperCaseType));

        assert_eq!(types.find_for(&"ABC".into()).unwrap().name(), "upper");
        assert_eq!(types.find_for(&"abc".into()).unwrap().name(), "string");
        assert_eq!(types.names()[0], "upper");
    }

    #[test]
    fn test_unknown_type_reads_none() {
        let types = VariableTypes::default();
        let instance = VariableInstance {
            id: "1".to_string(),
            revision: 1,
            name: "x".to_string(),
            type_name: "serializable".to_string(),
            scope_id: "1".to_string(),
            process_instance_id: "1".to_string(),
            fields: ValueFields::default(),
        };
        assert!(types.read(&instance).is_none());
    }

    #[test]
    fn test_value_json_view() {
        assert_eq!(VariableValue::Integer(3).to_json(), json!(3));
        assert_eq!(VariableValue::from("a").to_json(), json!("a"));
        assert_eq!(VariableValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(VariableValue::Boolean(true).as_bool(), Some(true));
    }
}

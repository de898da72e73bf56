//! In-memory state store.
//!
//! [`MemState`] implements [`ExtensionIo`] over a list of records held in
//! memory. It backs the CLI and the test suites.
//!
//! - Reads match a partial key: every field set on the key builder must be
//!   equal, fields left unset match anything. Items are visited in insertion
//!   order.
//! - `must_exist` and `can_exist` require the full key to match.
//! - Intents are buffered and only change the records on
//!   [`MemState::apply_intents`].

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use ext_engine_common::{FullQName, QName, StateError};
use ext_engine_core::{
    ExtensionIo, ReadCallback, RowReader, RowWriter, StateKey, StateKeyBuilder, StateValue,
    StateValueBuilder,
};

/// Named fields of a key or value.
pub type Fields = BTreeMap<String, FieldValue>;

/// A field stored in [`MemState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    QName(FullQName),
    Bool(bool),
    Object(Fields),
    Array(Vec<FieldValue>),
}

impl FieldValue {
    /// Convert a TOML value. Integers become `Int64`, floats `Float64`,
    /// tables `Object` and datetimes their string form.
    pub fn from_toml(value: &toml::Value) -> Self {
        match value {
            toml::Value::String(s) => Self::String(s.clone()),
            toml::Value::Integer(i) => Self::Int64(*i),
            toml::Value::Float(f) => Self::Float64(*f),
            toml::Value::Boolean(b) => Self::Bool(*b),
            toml::Value::Datetime(d) => Self::String(d.to_string()),
            toml::Value::Array(items) => Self::Array(items.iter().map(Self::from_toml).collect()),
            toml::Value::Table(table) => Self::Object(fields_from_toml(table)),
        }
    }

    // Integer and float reads accept either width as long as the value fits.

    fn to_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            Self::Int64(v) => i32::try_from(*v).ok(),
            _ => None,
        }
    }

    fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(v) => Some(i64::from(*v)),
            Self::Int64(v) => Some(*v),
            _ => None,
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn to_f32(&self) -> Option<f32> {
        match self {
            Self::Float32(v) => Some(*v),
            Self::Float64(v) => Some(*v as f32),
            _ => None,
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Float32(v) => Some(f64::from(*v)),
            Self::Float64(v) => Some(*v),
            _ => None,
        }
    }

    fn to_string_value(&self) -> Option<String> {
        match self {
            Self::String(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes(v) => Some(v.clone()),
            Self::String(v) => Some(v.as_bytes().to_vec()),
            _ => None,
        }
    }

    fn to_qname(&self) -> Option<FullQName> {
        match self {
            Self::QName(v) => Some(v.clone()),
            Self::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    fn to_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn to_value(&self) -> Option<MemValue> {
        match self {
            Self::Object(_) | Self::Array(_) => Some(MemValue(self.clone())),
            _ => None,
        }
    }
}

/// Convert a TOML table into fields.
pub fn fields_from_toml(table: &toml::Table) -> Fields {
    table
        .iter()
        .map(|(name, value)| (name.clone(), FieldValue::from_toml(value)))
        .collect()
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub storage: QName,
    pub entity: Option<FullQName>,
    pub key: Fields,
    pub value: Fields,
}

impl Record {
    fn matches(&self, key: &MemKeyBuilder, exact: bool) -> bool {
        if self.storage != key.storage || self.entity != key.entity {
            return false;
        }
        if exact {
            return self.key == key.fields;
        }
        key.fields
            .iter()
            .all(|(name, value)| self.key.get(name) == Some(value))
    }
}

/// Operations that can be made to fail with [`MemState::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemOperation {
    KeyBuilder,
    MustExist,
    CanExist,
    Read,
    NewValue,
    UpdateValue,
}

#[derive(Debug)]
enum IntentKind {
    Insert,
    Update,
}

#[derive(Debug)]
struct Intent {
    kind: IntentKind,
    key: MemKeyBuilder,
    value: Arc<Mutex<Fields>>,
}

/// In-memory [`ExtensionIo`].
#[derive(Debug, Default)]
pub struct MemState {
    records: RwLock<Vec<Record>>,
    intents: Mutex<Vec<Intent>>,
    storages: Option<HashSet<QName>>,
    failures: Mutex<HashMap<MemOperation, String>>,
}

impl MemState {
    /// Create an empty store accepting every storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store that only provides `storages`.
    ///
    /// Key builders for any other storage fail with
    /// [`StateError::UnsupportedStorage`].
    pub fn with_storages(storages: impl IntoIterator<Item = QName>) -> Self {
        Self {
            storages: Some(storages.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Insert or replace the item with the given full key.
    pub fn insert(&self, storage: QName, entity: Option<FullQName>, key: Fields, value: Fields) {
        let record = Record {
            storage,
            entity,
            key,
            value,
        };
        let mut records = self.records.write();
        match records.iter_mut().find(|r| {
            r.storage == record.storage && r.entity == record.entity && r.key == record.key
        }) {
            Some(existing) => existing.value = record.value,
            None => records.push(record),
        }
    }

    /// Value of the item with the given full key.
    pub fn get(&self, storage: &QName, entity: Option<&FullQName>, key: &Fields) -> Option<Fields> {
        self.records
            .read()
            .iter()
            .find(|r| &r.storage == storage && r.entity.as_ref() == entity && &r.key == key)
            .map(|r| r.value.clone())
    }

    /// Snapshot of every item in insertion order.
    pub fn records(&self) -> Vec<Record> {
        self.records.read().clone()
    }

    /// Number of intents recorded and not yet applied.
    pub fn pending_intents(&self) -> usize {
        self.intents.lock().len()
    }

    /// Apply recorded intents in order and return how many were applied.
    pub fn apply_intents(&self) -> usize {
        let intents = std::mem::take(&mut *self.intents.lock());
        let applied = intents.len();

        for intent in intents {
            let value = intent.value.lock().clone();
            debug!(
                storage = %intent.key.storage,
                kind = ?intent.kind,
                "Applying intent"
            );
            self.insert(
                intent.key.storage,
                intent.key.entity,
                intent.key.fields,
                value,
            );
        }

        applied
    }

    /// Drop recorded intents without applying them.
    pub fn discard_intents(&self) {
        self.intents.lock().clear();
    }

    /// Make every subsequent `operation` fail with [`StateError::Io`].
    pub fn fail_on(&self, operation: MemOperation, message: impl Into<String>) {
        self.failures.lock().insert(operation, message.into());
    }

    fn check(&self, operation: MemOperation) -> Result<(), StateError> {
        match self.failures.lock().get(&operation) {
            Some(message) => Err(StateError::Io(message.clone())),
            None => Ok(()),
        }
    }

    fn find(&self, key: &MemKeyBuilder) -> Option<MemValue> {
        self.records
            .read()
            .iter()
            .find(|r| r.matches(key, true))
            .map(|r| MemValue(FieldValue::Object(r.value.clone())))
    }

    fn record_intent(
        &self,
        kind: IntentKind,
        key: &MemKeyBuilder,
        value: Fields,
    ) -> Box<dyn StateValueBuilder> {
        let value = Arc::new(Mutex::new(value));
        self.intents.lock().push(Intent {
            kind,
            key: key.clone(),
            value: Arc::clone(&value),
        });
        Box::new(MemIntent(value))
    }
}

fn downcast_key(key: &dyn StateKeyBuilder) -> Result<&MemKeyBuilder, StateError> {
    key.as_any()
        .downcast_ref::<MemKeyBuilder>()
        .ok_or_else(|| StateError::Io("key builder was not created by this state".into()))
}

impl ExtensionIo for MemState {
    fn key_builder(
        &self,
        storage: &QName,
        entity: Option<&FullQName>,
    ) -> Result<Box<dyn StateKeyBuilder>, StateError> {
        self.check(MemOperation::KeyBuilder)?;
        if let Some(storages) = &self.storages {
            if !storages.contains(storage) {
                return Err(StateError::UnsupportedStorage {
                    storage: storage.to_string(),
                });
            }
        }
        Ok(Box::new(MemKeyBuilder {
            storage: storage.clone(),
            entity: entity.cloned(),
            fields: Fields::new(),
        }))
    }

    fn must_exist(&self, key: &dyn StateKeyBuilder) -> Result<Box<dyn StateValue>, StateError> {
        self.check(MemOperation::MustExist)?;
        let key = downcast_key(key)?;
        self.find(key)
            .map(|v| Box::new(v) as Box<dyn StateValue>)
            .ok_or(StateError::NotExists)
    }

    fn can_exist(
        &self,
        key: &dyn StateKeyBuilder,
    ) -> Result<Option<Box<dyn StateValue>>, StateError> {
        self.check(MemOperation::CanExist)?;
        let key = downcast_key(key)?;
        Ok(self.find(key).map(|v| Box::new(v) as Box<dyn StateValue>))
    }

    fn read(
        &self,
        key: &dyn StateKeyBuilder,
        callback: &mut ReadCallback<'_>,
    ) -> Result<(), StateError> {
        self.check(MemOperation::Read)?;
        let key = downcast_key(key)?;

        // Snapshot so the callback runs without the lock held
        let matched: Vec<Record> = self
            .records
            .read()
            .iter()
            .filter(|r| r.matches(key, false))
            .cloned()
            .collect();

        for record in matched {
            callback(
                Box::new(MemKey(record.key)),
                Box::new(MemValue(FieldValue::Object(record.value))),
            )?;
        }
        Ok(())
    }

    fn new_value(
        &self,
        key: &dyn StateKeyBuilder,
    ) -> Result<Box<dyn StateValueBuilder>, StateError> {
        self.check(MemOperation::NewValue)?;
        let key = downcast_key(key)?;
        Ok(self.record_intent(IntentKind::Insert, key, Fields::new()))
    }

    fn update_value(
        &self,
        key: &dyn StateKeyBuilder,
        existing: &dyn StateValue,
    ) -> Result<Box<dyn StateValueBuilder>, StateError> {
        self.check(MemOperation::UpdateValue)?;
        let key = downcast_key(key)?;
        let fields = match existing.as_any().downcast_ref::<MemValue>() {
            Some(MemValue(FieldValue::Object(fields))) => fields.clone(),
            _ => Fields::new(),
        };
        Ok(self.record_intent(IntentKind::Update, key, fields))
    }
}

/// Implements [`RowWriter`] for a type given access to its [`Fields`].
macro_rules! impl_row_writer {
    ($ty:ty, |$this:ident| $fields:expr) => {
        impl RowWriter for $ty {
            fn put_int32(&mut self, name: &str, value: i32) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Int32(value));
                Ok(())
            }
            fn put_int64(&mut self, name: &str, value: i64) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Int64(value));
                Ok(())
            }
            fn put_float32(&mut self, name: &str, value: f32) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Float32(value));
                Ok(())
            }
            fn put_float64(&mut self, name: &str, value: f64) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Float64(value));
                Ok(())
            }
            fn put_string(&mut self, name: &str, value: &str) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::String(value.to_string()));
                Ok(())
            }
            fn put_bytes(&mut self, name: &str, value: &[u8]) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Bytes(value.to_vec()));
                Ok(())
            }
            fn put_qname(&mut self, name: &str, value: &FullQName) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::QName(value.clone()));
                Ok(())
            }
            fn put_bool(&mut self, name: &str, value: bool) -> Result<(), StateError> {
                let $this = self;
                $fields.insert(name.to_string(), FieldValue::Bool(value));
                Ok(())
            }
        }
    };
}

#[derive(Debug, Clone)]
struct MemKeyBuilder {
    storage: QName,
    entity: Option<FullQName>,
    fields: Fields,
}

impl_row_writer!(MemKeyBuilder, |this| this.fields);

impl StateKeyBuilder for MemKeyBuilder {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_row_writer(&mut self) -> &mut dyn RowWriter {
        self
    }
}

#[derive(Debug)]
struct MemIntent(Arc<Mutex<Fields>>);

impl_row_writer!(MemIntent, |this| this.0.lock());

impl StateValueBuilder for MemIntent {
    fn as_row_writer(&mut self) -> &mut dyn RowWriter {
        self
    }
}

fn field<'a>(fields: &'a Fields, name: &str) -> Result<&'a FieldValue, StateError> {
    fields.get(name).ok_or_else(|| StateError::NameNotFound {
        name: name.to_string(),
    })
}

fn by_name<T>(
    fields: &Fields,
    name: &str,
    convert: impl FnOnce(&FieldValue) -> Option<T>,
) -> Result<T, StateError> {
    convert(field(fields, name)?).ok_or_else(|| StateError::TypeMismatch {
        name: name.to_string(),
    })
}

/// Implements [`RowReader`] on top of a `read(name, convert)` method.
macro_rules! impl_row_reader {
    ($ty:ty) => {
        impl RowReader for $ty {
            fn as_int32(&self, name: &str) -> Result<i32, StateError> {
                self.read(name, FieldValue::to_i32)
            }
            fn as_int64(&self, name: &str) -> Result<i64, StateError> {
                self.read(name, FieldValue::to_i64)
            }
            fn as_float32(&self, name: &str) -> Result<f32, StateError> {
                self.read(name, FieldValue::to_f32)
            }
            fn as_float64(&self, name: &str) -> Result<f64, StateError> {
                self.read(name, FieldValue::to_f64)
            }
            fn as_string(&self, name: &str) -> Result<String, StateError> {
                self.read(name, FieldValue::to_string_value)
            }
            fn as_bytes(&self, name: &str) -> Result<Vec<u8>, StateError> {
                self.read(name, FieldValue::to_bytes)
            }
            fn as_qname(&self, name: &str) -> Result<FullQName, StateError> {
                self.read(name, FieldValue::to_qname)
            }
            fn as_bool(&self, name: &str) -> Result<bool, StateError> {
                self.read(name, FieldValue::to_bool)
            }
        }
    };
}

/// Key of an item visited by a read.
#[derive(Debug)]
struct MemKey(Fields);

impl MemKey {
    fn read<T>(
        &self,
        name: &str,
        convert: impl FnOnce(&FieldValue) -> Option<T>,
    ) -> Result<T, StateError> {
        by_name(&self.0, name, convert)
    }
}

impl_row_reader!(MemKey);

impl StateKey for MemKey {}

/// An item value, or a nested object or array inside one.
#[derive(Debug, Clone)]
struct MemValue(FieldValue);

impl MemValue {
    fn read<T>(
        &self,
        name: &str,
        convert: impl FnOnce(&FieldValue) -> Option<T>,
    ) -> Result<T, StateError> {
        match &self.0 {
            FieldValue::Object(fields) => by_name(fields, name, convert),
            _ => Err(StateError::TypeMismatch {
                name: name.to_string(),
            }),
        }
    }

    fn element<T>(
        &self,
        index: usize,
        convert: impl FnOnce(&FieldValue) -> Option<T>,
    ) -> Result<T, StateError> {
        let FieldValue::Array(items) = &self.0 else {
            return Err(StateError::TypeMismatch {
                name: format!("[{index}]"),
            });
        };
        let item = items
            .get(index)
            .ok_or(StateError::IndexOutOfRange { index })?;
        convert(item).ok_or_else(|| StateError::TypeMismatch {
            name: format!("[{index}]"),
        })
    }
}

impl_row_reader!(MemValue);

impl StateValue for MemValue {
    fn as_value(&self, name: &str) -> Result<Box<dyn StateValue>, StateError> {
        let value = self.read(name, FieldValue::to_value)?;
        Ok(Box::new(value))
    }

    fn length(&self) -> Result<usize, StateError> {
        match &self.0 {
            FieldValue::Array(items) => Ok(items.len()),
            FieldValue::Object(fields) => Ok(fields.len()),
            _ => Err(StateError::TypeMismatch {
                name: String::new(),
            }),
        }
    }

    fn get_as_int32(&self, index: usize) -> Result<i32, StateError> {
        self.element(index, FieldValue::to_i32)
    }

    fn get_as_int64(&self, index: usize) -> Result<i64, StateError> {
        self.element(index, FieldValue::to_i64)
    }

    fn get_as_float32(&self, index: usize) -> Result<f32, StateError> {
        self.element(index, FieldValue::to_f32)
    }

    fn get_as_float64(&self, index: usize) -> Result<f64, StateError> {
        self.element(index, FieldValue::to_f64)
    }

    fn get_as_string(&self, index: usize) -> Result<String, StateError> {
        self.element(index, FieldValue::to_string_value)
    }

    fn get_as_bytes(&self, index: usize) -> Result<Vec<u8>, StateError> {
        self.element(index, FieldValue::to_bytes)
    }

    fn get_as_qname(&self, index: usize) -> Result<FullQName, StateError> {
        self.element(index, FieldValue::to_qname)
    }

    fn get_as_bool(&self, index: usize) -> Result<bool, StateError> {
        self.element(index, FieldValue::to_bool)
    }

    fn get_as_value(&self, index: usize) -> Result<Box<dyn StateValue>, StateError> {
        let value = self.element(index, FieldValue::to_value)?;
        Ok(Box::new(value))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

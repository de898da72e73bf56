//! Backing state bridge and per-invocation handle tables.
//!
//! The engine never stores data itself. Every invocation is bound to an
//! [`ExtensionIo`] implementation, and guest code reaches it through integer
//! handles that index into [`StateHandles`].
//!
//! Handles carry the binding generation in their upper 32 bits, so a handle
//! kept by the guest across invocations is rejected instead of aliasing a
//! different object.
//!
//! Reads stream: the host hands each `(key, value)` pair to the guest while
//! the state is still iterating. Key builders are therefore shared behind a
//! lock; a key builder being read stays readable but cannot be written.

use std::any::Any;
use std::sync::Arc;

use parking_lot::RwLock;

use ext_engine_common::{AbiError, FullQName, QName, RuntimeError, StateError};

/// Handle value returned by `QueryValue` when the item does not exist.
pub const NOT_FOUND: u64 = u64::MAX;

/// Typed field access by name.
pub trait RowReader: Send {
    fn as_int32(&self, name: &str) -> Result<i32, StateError>;
    fn as_int64(&self, name: &str) -> Result<i64, StateError>;
    fn as_float32(&self, name: &str) -> Result<f32, StateError>;
    fn as_float64(&self, name: &str) -> Result<f64, StateError>;
    fn as_string(&self, name: &str) -> Result<String, StateError>;
    fn as_bytes(&self, name: &str) -> Result<Vec<u8>, StateError>;
    fn as_qname(&self, name: &str) -> Result<FullQName, StateError>;
    fn as_bool(&self, name: &str) -> Result<bool, StateError>;
}

/// Typed field assignment by name.
pub trait RowWriter: Send {
    fn put_int32(&mut self, name: &str, value: i32) -> Result<(), StateError>;
    fn put_int64(&mut self, name: &str, value: i64) -> Result<(), StateError>;
    fn put_float32(&mut self, name: &str, value: f32) -> Result<(), StateError>;
    fn put_float64(&mut self, name: &str, value: f64) -> Result<(), StateError>;
    fn put_string(&mut self, name: &str, value: &str) -> Result<(), StateError>;
    fn put_bytes(&mut self, name: &str, value: &[u8]) -> Result<(), StateError>;
    fn put_qname(&mut self, name: &str, value: &FullQName) -> Result<(), StateError>;
    fn put_bool(&mut self, name: &str, value: bool) -> Result<(), StateError>;
}

/// A key under construction, addressing one item (or a range for reads).
pub trait StateKeyBuilder: RowWriter + Sync {
    fn as_any(&self) -> &dyn Any;
    fn as_row_writer(&mut self) -> &mut dyn RowWriter;
}

/// The key of an item produced by a read.
pub trait StateKey: RowReader {}

/// An item value. Values may be nested (objects and arrays).
pub trait StateValue: RowReader {
    fn as_value(&self, name: &str) -> Result<Box<dyn StateValue>, StateError>;

    /// Number of elements of an array-shaped value.
    fn length(&self) -> Result<usize, StateError>;

    fn get_as_int32(&self, index: usize) -> Result<i32, StateError>;
    fn get_as_int64(&self, index: usize) -> Result<i64, StateError>;
    fn get_as_float32(&self, index: usize) -> Result<f32, StateError>;
    fn get_as_float64(&self, index: usize) -> Result<f64, StateError>;
    fn get_as_string(&self, index: usize) -> Result<String, StateError>;
    fn get_as_bytes(&self, index: usize) -> Result<Vec<u8>, StateError>;
    fn get_as_qname(&self, index: usize) -> Result<FullQName, StateError>;
    fn get_as_bool(&self, index: usize) -> Result<bool, StateError>;
    fn get_as_value(&self, index: usize) -> Result<Box<dyn StateValue>, StateError>;

    fn as_any(&self) -> &dyn Any;
}

/// A pending insert or update. Takes effect when the state commits intents.
pub trait StateValueBuilder: RowWriter {
    fn as_row_writer(&mut self) -> &mut dyn RowWriter;
}

/// Callback receiving the items of a read, in storage order.
pub type ReadCallback<'a> =
    dyn FnMut(Box<dyn StateKey>, Box<dyn StateValue>) -> Result<(), StateError> + 'a;

/// State bridge an invocation runs against.
///
/// Implementations are supplied per invocation by the caller and may be
/// shared across engines.
pub trait ExtensionIo: Send + Sync {
    /// Start a key for `storage`, optionally scoped to `entity`.
    fn key_builder(
        &self,
        storage: &QName,
        entity: Option<&FullQName>,
    ) -> Result<Box<dyn StateKeyBuilder>, StateError>;

    /// Get the item, failing if it does not exist.
    fn must_exist(&self, key: &dyn StateKeyBuilder) -> Result<Box<dyn StateValue>, StateError>;

    /// Get the item if it exists.
    fn can_exist(
        &self,
        key: &dyn StateKeyBuilder,
    ) -> Result<Option<Box<dyn StateValue>>, StateError>;

    /// Visit every item matching the (possibly partial) key.
    fn read(
        &self,
        key: &dyn StateKeyBuilder,
        callback: &mut ReadCallback<'_>,
    ) -> Result<(), StateError>;

    /// Record an intent to insert a new item.
    fn new_value(&self, key: &dyn StateKeyBuilder)
    -> Result<Box<dyn StateValueBuilder>, StateError>;

    /// Record an intent to update an existing item.
    fn update_value(
        &self,
        key: &dyn StateKeyBuilder,
        existing: &dyn StateValue,
    ) -> Result<Box<dyn StateValueBuilder>, StateError>;
}

/// Target of a row writer host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowWriterRef {
    KeyBuilder(u64),
    Intent(u64),
}

impl RowWriterRef {
    /// Decode the `(kind, handle)` pair passed by the guest.
    pub fn from_abi(kind: u32, handle: u64) -> Result<Self, AbiError> {
        match kind {
            0 => Ok(Self::KeyBuilder(handle)),
            1 => Ok(Self::Intent(handle)),
            _ => Err(AbiError::InvalidRowWriterKind { kind }),
        }
    }
}

/// Key builder slot, shared with reads in progress.
pub type SharedKeyBuilder = Arc<RwLock<Box<dyn StateKeyBuilder>>>;

/// Objects handed out to the guest during one invocation.
#[derive(Default)]
pub struct StateHandles {
    io: Option<Arc<dyn ExtensionIo>>,
    generation: u32,
    key_builders: Vec<SharedKeyBuilder>,
    keys: Vec<Box<dyn StateKey>>,
    values: Vec<Box<dyn StateValue>>,
    intents: Vec<Box<dyn StateValueBuilder>>,
}

impl StateHandles {
    /// Bind a state bridge and invalidate every handle from earlier bindings.
    pub fn bind(&mut self, io: Arc<dyn ExtensionIo>) {
        self.release();
        self.generation = self.generation.wrapping_add(1);
        self.io = Some(io);
    }

    /// Drop the bridge and all objects; capacity is kept for the next bind.
    pub fn release(&mut self) {
        self.io = None;
        self.key_builders.clear();
        self.keys.clear();
        self.values.clear();
        self.intents.clear();
    }

    pub fn is_bound(&self) -> bool {
        self.io.is_some()
    }

    /// The bound state bridge.
    pub fn io(&self) -> Result<Arc<dyn ExtensionIo>, AbiError> {
        self.io.clone().ok_or(AbiError::UnboundState)
    }

    fn handle(&self, index: usize) -> u64 {
        (u64::from(self.generation) << 32) | index as u64
    }

    fn index(&self, handle: u64, len: usize) -> Option<usize> {
        if (handle >> 32) as u32 != self.generation {
            return None;
        }
        let index = usize::try_from(handle & 0xffff_ffff).ok()?;
        (index < len).then_some(index)
    }

    fn push_value(&mut self, value: Box<dyn StateValue>) -> u64 {
        self.values.push(value);
        self.handle(self.values.len() - 1)
    }

    fn push_intent(&mut self, intent: Box<dyn StateValueBuilder>) -> u64 {
        self.intents.push(intent);
        self.handle(self.intents.len() - 1)
    }

    /// Resolve a key builder handle.
    pub fn key_builder(&self, handle: u64) -> Result<SharedKeyBuilder, AbiError> {
        let index = self
            .index(handle, self.key_builders.len())
            .ok_or(AbiError::IncorrectKeyBuilder)?;
        Ok(Arc::clone(&self.key_builders[index]))
    }

    /// Resolve a key handle.
    pub fn key(&self, handle: u64) -> Result<&dyn StateKey, AbiError> {
        let index = self
            .index(handle, self.keys.len())
            .ok_or(AbiError::IncorrectKey)?;
        Ok(self.keys[index].as_ref())
    }

    /// Resolve a value handle.
    pub fn value(&self, handle: u64) -> Result<&dyn StateValue, AbiError> {
        let index = self
            .index(handle, self.values.len())
            .ok_or(AbiError::IncorrectValue)?;
        Ok(self.values[index].as_ref())
    }

    /// Apply `write` to the object a row writer call targets.
    ///
    /// Fails with [`AbiError::KeyBuilderInUse`] for a key builder that is
    /// being read.
    pub fn with_row_writer<R>(
        &mut self,
        target: RowWriterRef,
        write: impl FnOnce(&mut dyn RowWriter) -> Result<R, StateError>,
    ) -> Result<R, RuntimeError> {
        match target {
            RowWriterRef::KeyBuilder(handle) => {
                let key_builder = self.key_builder(handle)?;
                let mut guard = key_builder
                    .try_write()
                    .ok_or(AbiError::KeyBuilderInUse)?;
                Ok(write(guard.as_row_writer())?)
            }
            RowWriterRef::Intent(handle) => {
                let index = self
                    .index(handle, self.intents.len())
                    .ok_or(AbiError::IncorrectIntent)?;
                Ok(write(self.intents[index].as_row_writer())?)
            }
        }
    }

    /// Create a key builder for `storage` and `entity` (empty for none).
    pub fn new_key_builder(&mut self, storage: &str, entity: &str) -> Result<u64, RuntimeError> {
        let storage: QName = storage.parse()?;
        let entity = if entity.is_empty() {
            None
        } else {
            Some(entity.parse::<FullQName>()?)
        };

        let builder = self.io()?.key_builder(&storage, entity.as_ref())?;
        self.key_builders.push(Arc::new(RwLock::new(builder)));
        Ok(self.handle(self.key_builders.len() - 1))
    }

    /// Get the value of an item that must exist.
    pub fn must_get_value(&mut self, key_builder: u64) -> Result<u64, RuntimeError> {
        let io = self.io()?;
        let key_builder = self.key_builder(key_builder)?;
        let value = io.must_exist(&**key_builder.read_recursive())?;
        Ok(self.push_value(value))
    }

    /// Get the value of an item if it exists.
    pub fn query_value(&mut self, key_builder: u64) -> Result<Option<u64>, RuntimeError> {
        let io = self.io()?;
        let key_builder = self.key_builder(key_builder)?;
        let value = io.can_exist(&**key_builder.read_recursive())?;
        Ok(value.map(|value| self.push_value(value)))
    }

    /// Register one item produced by a read; returns its `(key, value)`
    /// handles.
    ///
    /// Called for every item while [`ExtensionIo::read`] iterates, so the
    /// guest can use the handles before the next item is produced.
    pub fn push_item(&mut self, key: Box<dyn StateKey>, value: Box<dyn StateValue>) -> (u64, u64) {
        self.keys.push(key);
        let key = self.handle(self.keys.len() - 1);
        (key, self.push_value(value))
    }

    /// Record an insert intent.
    pub fn new_intent(&mut self, key_builder: u64) -> Result<u64, RuntimeError> {
        let io = self.io()?;
        let key_builder = self.key_builder(key_builder)?;
        let intent = io.new_value(&**key_builder.read_recursive())?;
        Ok(self.push_intent(intent))
    }

    /// Record an update intent for an existing value.
    pub fn update_intent(&mut self, key_builder: u64, existing: u64) -> Result<u64, RuntimeError> {
        let io = self.io()?;
        let key_builder = self.key_builder(key_builder)?;
        let intent = io.update_value(&**key_builder.read_recursive(), self.value(existing)?)?;
        Ok(self.push_intent(intent))
    }

    /// Register the nested value `name` of a value.
    pub fn value_as_value(&mut self, value: u64, name: &str) -> Result<u64, RuntimeError> {
        let nested = self.value(value)?.as_value(name)?;
        Ok(self.push_value(nested))
    }

    /// Register the nested value at `index` of an array value.
    pub fn value_get_as_value(&mut self, value: u64, index: usize) -> Result<u64, RuntimeError> {
        let nested = self.value(value)?.get_as_value(index)?;
        Ok(self.push_value(nested))
    }

    /// Number of live handles as `(key builders, keys, values, intents)`.
    pub(crate) fn counts(&self) -> (usize, usize, usize, usize) {
        (
            self.key_builders.len(),
            self.keys.len(),
            self.values.len(),
            self.intents.len(),
        )
    }
}

impl std::fmt::Debug for StateHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandles")
            .field("bound", &self.is_bound())
            .field("generation", &self.generation)
            .field("counts", &self.counts())
            .finish()
    }
}

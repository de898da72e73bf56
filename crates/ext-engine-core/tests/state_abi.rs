//! Integration tests for the state host ABI.
//!
//! Guests drive an in-memory state through the `env` host functions:
//! - Key builders, values, reads and intents addressed by handle
//! - Handle validation across invocations
//! - Data copied into guest return buffers
//! - State errors passed through unchanged

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use ext_engine_common::{AbiError, FullQName, QName, RuntimeError, StateError};
use ext_engine_core::{
    ExtensionIo, ReadCallback, StateKeyBuilder, StateValue, StateValueBuilder,
};
use ext_engine_host::{FieldValue, MemOperation, MemState};

use common::{
    Guest, PACKAGE, engine, fields, items_view, order_state, orders_guest, record_storage,
    view_storage,
};

/// Unpacking of `(addr << 32) | len` return values.
const UNPACK: &str = r#"
    (func $ptr (param i64) (result i32) (i32.wrap_i64 (i64.shr_u (local.get 0) (i64.const 32))))
    (func $len (param i64) (result i32) (i32.wrap_i64 (local.get 0)))
"#;

fn record_key(id: i64) -> ext_engine_host::Fields {
    fields(&[("ID", FieldValue::Int64(id))])
}

// ============================================================================
// Test: Handles
// ============================================================================

#[test]
fn test_handles_do_not_survive_invocations() {
    let mut g = Guest::new();
    let view = g.s("sys.View");
    let items = g.s("test/orders.Items");
    g.func(&format!(
        r#"
    (global $saved (mut i64) (i64.const -1))
    (func (export "Keep")
        (if (i64.eq (global.get $saved) (i64.const -1))
            (then
                (global.set $saved (call $hostGetKey {view} {items})))
            (else
                (drop (call $hostGetKey {view} {items}))
                (drop (call $hostQueryValue (global.get $saved))))))
"#
    ));
    let mut engine = engine(&g, &["Keep"]);
    let state = Arc::new(MemState::new());

    engine.invoke(PACKAGE, "Keep", state.clone()).unwrap();

    // Same index, previous invocation
    let err = engine.invoke(PACKAGE, "Keep", state).unwrap_err();
    assert!(
        matches!(err, RuntimeError::Abi(AbiError::IncorrectKeyBuilder)),
        "got {err:?}"
    );
}

#[test]
fn test_incorrect_handles() {
    let mut g = Guest::new();
    let amount = g.s("Amount");
    let year = g.s("Year");
    g.func(&format!(
        r#"
    (func (export "BadKeyBuilder") (drop (call $hostGetValue (i64.const 12345))))
    (func (export "BadValue") (drop (call $hostValueAsInt64 (i64.const 7) {amount})))
    (func (export "BadKey") (drop (call $hostKeyAsInt32 (i64.const 0) {year})))
    (func (export "BadIntent")
        (call $hostRowWriterPutInt64 (i64.const 3) (i32.const 1) {amount} (i64.const 1)))
    (func (export "BadKind")
        (call $hostRowWriterPutInt64 (i64.const 0) (i32.const 7) {amount} (i64.const 1)))
    (func (export "BadMemory")
        (drop (call $hostGetKey (i32.const -16) (i32.const 100) (i32.const 0) (i32.const 0))))
"#
    ));
    let extensions = [
        ("BadKeyBuilder", AbiError::IncorrectKeyBuilder),
        ("BadValue", AbiError::IncorrectValue),
        ("BadKey", AbiError::IncorrectKey),
        ("BadIntent", AbiError::IncorrectIntent),
        ("BadKind", AbiError::InvalidRowWriterKind { kind: 7 }),
        ("BadMemory", AbiError::UnableToReadMemory),
    ];
    let names: Vec<&str> = extensions.iter().map(|(name, _)| *name).collect();
    let mut engine = engine(&g, &names);
    let state = Arc::new(MemState::new());

    for (name, expected) in extensions {
        match engine.invoke(PACKAGE, name, state.clone()) {
            Err(RuntimeError::Abi(abi)) => assert_eq!(abi, expected, "{name}"),
            other => panic!("{name}: unexpected {other:?}"),
        }
    }
}

#[test]
fn test_invalid_qname() {
    let mut g = Guest::new();
    let storage = g.s("noDot");
    g.func(&format!(
        r#"(func (export "BadName") (drop (call $hostGetKey {storage} (i32.const 0) (i32.const 0))))"#
    ));
    let mut engine = engine(&g, &["BadName"]);

    let err = engine
        .invoke(PACKAGE, "BadName", Arc::new(MemState::new()))
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::Abi(AbiError::InvalidQName { ref value }) if value == "noDot"
    ));
}

// ============================================================================
// Test: State Errors
// ============================================================================

#[test]
fn test_state_errors_pass_through() {
    let mut engine = engine(&orders_guest(), &["CalcOrderedItems"]);

    let state = order_state();
    state.fail_on(MemOperation::MustExist, "disk on fire");
    let err = engine
        .invoke(PACKAGE, "CalcOrderedItems", state)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::State(StateError::Io(_))));
    assert_eq!(err.to_string(), "disk on fire");

    let err = engine
        .invoke(PACKAGE, "CalcOrderedItems", Arc::new(MemState::new()))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::State(StateError::NotExists)));

    let state = Arc::new(MemState::with_storages([view_storage()]));
    let err = engine
        .invoke(PACKAGE, "CalcOrderedItems", state)
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::State(StateError::UnsupportedStorage { .. })
    ));
}

// ============================================================================
// Test: Reads
// ============================================================================

#[test]
fn test_read_values_calls_guest_per_item() {
    let state = MemState::new();
    for (year, month, amount) in [(2023, 1, 100), (2023, 2, 200), (2024, 1, 300)] {
        state.insert(
            view_storage(),
            Some(items_view()),
            fields(&[
                ("Year", FieldValue::Int32(year)),
                ("Month", FieldValue::Int32(month)),
            ]),
            fields(&[("Amount", FieldValue::Int64(amount))]),
        );
    }
    let state = Arc::new(state);

    let mut g = Guest::new();
    let view = g.s("sys.View");
    let items = g.s("test/orders.Items");
    let record = g.s("sys.Record");
    let id = g.s("ID");
    let year = g.s("Year");
    let month = g.s("Month");
    let amount = g.s("Amount");
    let total = g.s("Total");
    let months = g.s("Months");
    g.on_read(&format!(
        r#"
    (func (export "WasmOnReadValue") (param $key i64) (param $value i64)
        (global.set $total
            (i64.add (global.get $total) (call $hostValueAsInt64 (local.get $value) {amount})))
        (global.set $months
            (i64.add
                (global.get $months)
                (i64.extend_i32_s (call $hostKeyAsInt32 (local.get $key) {month})))))
"#
    ));
    g.func(&format!(
        r#"
    (global $total (mut i64) (i64.const 0))
    (global $months (mut i64) (i64.const 0))
    (func (export "Summarize")
        (local $kb i64)
        (local $intent i64)
        (global.set $total (i64.const 0))
        (global.set $months (i64.const 0))
        (local.set $kb (call $hostGetKey {view} {items}))
        (call $hostRowWriterPutInt32 (local.get $kb) (i32.const 0) {year} (i32.const 2023))
        (call $hostReadValues (local.get $kb))
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 1))
        (local.set $intent (call $hostNewValue (local.get $kb)))
        (call $hostRowWriterPutInt64 (local.get $intent) (i32.const 1) {total} (global.get $total))
        (call $hostRowWriterPutInt64 (local.get $intent) (i32.const 1) {months} (global.get $months)))
"#
    ));
    let mut engine = engine(&g, &["Summarize"]);

    engine.invoke(PACKAGE, "Summarize", state.clone()).unwrap();
    state.apply_intents();

    let summary = state.get(&record_storage(), None, &record_key(1)).unwrap();
    assert_eq!(summary.get("Total"), Some(&FieldValue::Int64(300)));
    assert_eq!(summary.get("Months"), Some(&FieldValue::Int64(3)));
}

/// Delegates to a [`MemState`], noting for every item a read yields how
/// many insert intents existed at that point.
#[derive(Default)]
struct RecordingState {
    inner: MemState,
    intents: AtomicUsize,
    yielded: Mutex<Vec<usize>>,
}

impl ExtensionIo for RecordingState {
    fn key_builder(
        &self,
        storage: &QName,
        entity: Option<&FullQName>,
    ) -> Result<Box<dyn StateKeyBuilder>, StateError> {
        self.inner.key_builder(storage, entity)
    }

    fn must_exist(&self, key: &dyn StateKeyBuilder) -> Result<Box<dyn StateValue>, StateError> {
        self.inner.must_exist(key)
    }

    fn can_exist(
        &self,
        key: &dyn StateKeyBuilder,
    ) -> Result<Option<Box<dyn StateValue>>, StateError> {
        self.inner.can_exist(key)
    }

    fn read(
        &self,
        key: &dyn StateKeyBuilder,
        callback: &mut ReadCallback<'_>,
    ) -> Result<(), StateError> {
        self.inner.read(key, &mut |key, value| {
            self.yielded.lock().push(self.intents.load(Ordering::SeqCst));
            callback(key, value)
        })
    }

    fn new_value(
        &self,
        key: &dyn StateKeyBuilder,
    ) -> Result<Box<dyn StateValueBuilder>, StateError> {
        self.intents.fetch_add(1, Ordering::SeqCst);
        self.inner.new_value(key)
    }

    fn update_value(
        &self,
        key: &dyn StateKeyBuilder,
        existing: &dyn StateValue,
    ) -> Result<Box<dyn StateValueBuilder>, StateError> {
        self.inner.update_value(key, existing)
    }
}

fn recording_state() -> Arc<RecordingState> {
    let state = RecordingState::default();
    for month in 1..=3 {
        state.inner.insert(
            view_storage(),
            Some(items_view()),
            fields(&[
                ("Year", FieldValue::Int32(2023)),
                ("Month", FieldValue::Int32(month)),
            ]),
            fields(&[("Amount", FieldValue::Int64(i64::from(month) * 100))]),
        );
    }
    Arc::new(state)
}

/// Add `ReadItems`, reading the `Year=2023` items through a key builder
/// kept in `$reading`.
fn add_read_items(g: &mut Guest) {
    let view = g.s("sys.View");
    let items = g.s("test/orders.Items");
    let year = g.s("Year");
    g.func(&format!(
        r#"
    (global $reading (mut i64) (i64.const -1))
    (func (export "ReadItems")
        (global.set $reading (call $hostGetKey {view} {items}))
        (call $hostRowWriterPutInt32 (global.get $reading) (i32.const 0) {year} (i32.const 2023))
        (call $hostReadValues (global.get $reading)))
"#
    ));
}

#[test]
fn test_read_values_streams_items() {
    // Each item is copied into a record before the next one is produced
    let mut g = Guest::new();
    let record = g.s("sys.Record");
    let id = g.s("ID");
    let month = g.s("Month");
    let amount = g.s("Amount");
    g.on_read(&format!(
        r#"
    (func (export "WasmOnReadValue") (param $key i64) (param $value i64)
        (local $kb i64)
        (local $intent i64)
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id}
            (i64.extend_i32_s (call $hostKeyAsInt32 (local.get $key) {month})))
        (local.set $intent (call $hostNewValue (local.get $kb)))
        (call $hostRowWriterPutInt64 (local.get $intent) (i32.const 1) {amount}
            (call $hostValueAsInt64 (local.get $value) {amount})))
"#
    ));
    add_read_items(&mut g);
    let mut engine = engine(&g, &["ReadItems"]);
    let state = recording_state();

    engine.invoke(PACKAGE, "ReadItems", state.clone()).unwrap();

    assert_eq!(*state.yielded.lock(), vec![0, 1, 2]);
    assert_eq!(state.inner.apply_intents(), 3);
    let copied = state
        .inner
        .get(&record_storage(), None, &record_key(2))
        .unwrap();
    assert_eq!(copied.get("Amount"), Some(&FieldValue::Int64(200)));
}

#[test]
fn test_read_values_stops_on_guest_failure() {
    let mut g = Guest::new();
    g.on_read(
        r#"
    (func (export "WasmOnReadValue") (param i64 i64) unreachable)
"#,
    );
    add_read_items(&mut g);
    let mut engine = engine(&g, &["ReadItems"]);
    let state = recording_state();

    let err = engine
        .invoke(PACKAGE, "ReadItems", state.clone())
        .unwrap_err();

    assert!(matches!(err, RuntimeError::Trap { .. }), "got {err:?}");
    assert_eq!(state.yielded.lock().len(), 1);
}

#[test]
fn test_key_builder_is_read_only_during_read() {
    let mut g = Guest::new();
    let year = g.s("Year");
    g.on_read(&format!(
        r#"
    (func (export "WasmOnReadValue") (param i64 i64)
        (call $hostRowWriterPutInt32 (global.get $reading) (i32.const 0) {year} (i32.const 2024)))
"#
    ));
    add_read_items(&mut g);
    let mut engine = engine(&g, &["ReadItems"]);

    let err = engine
        .invoke(PACKAGE, "ReadItems", recording_state())
        .unwrap_err();

    assert!(
        matches!(err, RuntimeError::Abi(AbiError::KeyBuilderInUse)),
        "got {err:?}"
    );
}

// ============================================================================
// Test: Data Transfer
// ============================================================================

fn typed_record_state() -> Arc<MemState> {
    let state = MemState::new();
    state.insert(
        record_storage(),
        None,
        record_key(7),
        fields(&[
            ("Name", FieldValue::String("hello, world".into())),
            ("Data", FieldValue::Bytes(vec![0, 1, 2, 255])),
            ("Kind", FieldValue::QName(items_view())),
            ("Flag", FieldValue::Bool(true)),
            (
                "Lines",
                FieldValue::Array(vec![
                    FieldValue::Int64(3),
                    FieldValue::Int64(4),
                    FieldValue::Int64(5),
                ]),
            ),
        ]),
    );
    Arc::new(state)
}

#[test]
fn test_values_copied_into_guest_memory() {
    let mut g = Guest::new();
    let record = g.s("sys.Record");
    let id = g.s("ID");
    let name = g.s("Name");
    let data = g.s("Data");
    let kind = g.s("Kind");
    let flag = g.s("Flag");
    let entity = g.s("Entity");
    let copied_kind = g.s("CopiedKind");
    let pkg = g.s("test/orders");
    let items = g.s("Items");
    g.func(UNPACK);
    g.func(&format!(
        r#"
    (func (export "Copy")
        (local $kb i64)
        (local $rec i64)
        (local $intent i64)
        (local $r i64)
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 7))
        (local.set $rec (call $hostGetValue (local.get $kb)))

        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 8))
        (local.set $intent (call $hostNewValue (local.get $kb)))

        (local.set $r (call $hostValueAsString (local.get $rec) {name}))
        (call $hostRowWriterPutString (local.get $intent) (i32.const 1) {name}
            (call $ptr (local.get $r)) (call $len (local.get $r)))
        (local.set $r (call $hostValueAsBytes (local.get $rec) {data}))
        (call $hostRowWriterPutBytes (local.get $intent) (i32.const 1) {data}
            (call $ptr (local.get $r)) (call $len (local.get $r)))
        (local.set $r (call $hostValueAsQNameEntity (local.get $rec) {kind}))
        (call $hostRowWriterPutString (local.get $intent) (i32.const 1) {entity}
            (call $ptr (local.get $r)) (call $len (local.get $r)))
        (call $hostRowWriterPutInt64 (local.get $intent) (i32.const 1) {flag}
            (call $hostValueAsBool (local.get $rec) {flag}))
        (call $hostRowWriterPutQName (local.get $intent) (i32.const 1) {copied_kind} {pkg} {items}))
"#
    ));
    let mut engine = engine(&g, &["Copy"]);
    let state = typed_record_state();

    engine.invoke(PACKAGE, "Copy", state.clone()).unwrap();
    state.apply_intents();

    let copy = state.get(&record_storage(), None, &record_key(8)).unwrap();
    assert_eq!(
        copy.get("Name"),
        Some(&FieldValue::String("hello, world".into()))
    );
    assert_eq!(copy.get("Data"), Some(&FieldValue::Bytes(vec![0, 1, 2, 255])));
    assert_eq!(copy.get("Entity"), Some(&FieldValue::String("Items".into())));
    assert_eq!(copy.get("Flag"), Some(&FieldValue::Int64(1)));
    assert_eq!(
        copy.get("CopiedKind"),
        Some(&FieldValue::QName(FullQName::new("test/orders", "Items")))
    );
}

#[test]
fn test_nested_array_value() {
    let mut g = Guest::new();
    let record = g.s("sys.Record");
    let id = g.s("ID");
    let lines = g.s("Lines");
    let sum = g.s("Sum");
    let count = g.s("Count");
    g.func(&format!(
        r#"
    (func (export "SumLines")
        (local $kb i64)
        (local $arr i64)
        (local $n i32)
        (local $i i32)
        (local $sum i64)
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 7))
        (local.set $arr (call $hostValueAsValue (call $hostGetValue (local.get $kb)) {lines}))
        (local.set $n (call $hostValueLength (local.get $arr)))
        (block $done
            (loop $next
                (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
                (local.set $sum
                    (i64.add (local.get $sum)
                        (call $hostValueGetAsInt64 (local.get $arr) (local.get $i))))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $next)))
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 9))
        (local.set $kb (call $hostNewValue (local.get $kb)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 1) {sum} (local.get $sum))
        (call $hostRowWriterPutInt32 (local.get $kb) (i32.const 1) {count} (local.get $n)))
"#
    ));
    let mut engine = engine(&g, &["SumLines"]);
    let state = typed_record_state();

    engine.invoke(PACKAGE, "SumLines", state.clone()).unwrap();
    state.apply_intents();

    let result = state.get(&record_storage(), None, &record_key(9)).unwrap();
    assert_eq!(result.get("Sum"), Some(&FieldValue::Int64(12)));
    assert_eq!(result.get("Count"), Some(&FieldValue::Int32(3)));
}

// ============================================================================
// Test: Return Buffers
// ============================================================================

/// Guest reading the `Name` of record `ID=7` ten times per invocation.
fn read_name_guest() -> Guest {
    let mut g = Guest::new();
    let record = g.s("sys.Record");
    let id = g.s("ID");
    let name = g.s("Name");
    g.func(&format!(
        r#"
    (func (export "ReadName")
        (local $kb i64)
        (local $rec i64)
        (local $i i32)
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 7))
        (local.set $rec (call $hostGetValue (local.get $kb)))
        (loop $again
            (drop (call $hostValueAsString (local.get $rec) {name}))
            (local.set $i (i32.add (local.get $i) (i32.const 1)))
            (br_if $again (i32.lt_u (local.get $i) (i32.const 10)))))
"#
    ));
    g
}

#[test]
fn test_return_buffers_are_reused() {
    let mut engine = engine(&read_name_guest(), &["ReadName"]);
    let state = typed_record_state();

    for _ in 0..5 {
        engine.invoke(PACKAGE, "ReadName", state.clone()).unwrap();
    }

    assert_eq!(engine.allocated_buffers(PACKAGE).unwrap(), 1);
    assert_eq!(engine.mallocs(PACKAGE).unwrap(), 1);
}

#[test]
fn test_return_buffers_grow_for_large_values() {
    let state = MemState::new();
    state.insert(
        record_storage(),
        None,
        record_key(7),
        fields(&[("Name", FieldValue::String("x".repeat(100_000)))]),
    );
    let state = Arc::new(state);
    let mut engine = engine(&read_name_guest(), &["ReadName"]);

    engine.invoke(PACKAGE, "ReadName", state.clone()).unwrap();
    assert_eq!(engine.allocated_buffers(PACKAGE).unwrap(), 2);

    // Both buffers are rewound for the next invocation
    engine.invoke(PACKAGE, "ReadName", state).unwrap();
    assert_eq!(engine.allocated_buffers(PACKAGE).unwrap(), 2);
    assert_eq!(engine.mallocs(PACKAGE).unwrap(), 2);
}

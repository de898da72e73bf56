//! Shared helpers for integration tests.
//!
//! Guests are written in WAT on top of a small runtime: a bump allocator
//! exported as `malloc` that prints Go-style panic text and traps when
//! linear memory cannot grow, the `Wasm*` runtime exports and a `$print`
//! helper writing to stdout through WASI.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use ext_engine_common::{EngineConfig, ExtEngineConfig, FullQName, QName, RuntimeError};
use ext_engine_core::{
    ExtensionEngine, ExtensionEngineFactory, ExtensionModule, Metrics, ModuleSource,
};
use ext_engine_host::{FieldValue, Fields, MemState, provide_extension_engine_factory};

pub const APP: &str = "test1/app1";
pub const VVM: &str = "test-vvm";
pub const PACKAGE: &str = "test/orders";

/// Heap in use right after instantiation: the preallocated return buffer.
pub const INITIAL_HEAP: u64 = 64 * 1024;

const IMPORTS: &str = r#"
    (import "wasi_snapshot_preview1" "fd_write"
        (func $fd_write (param i32 i32 i32 i32) (result i32)))
    (import "env" "hostGetKey" (func $hostGetKey (param i32 i32 i32 i32) (result i64)))
    (import "env" "hostGetValue" (func $hostGetValue (param i64) (result i64)))
    (import "env" "hostQueryValue" (func $hostQueryValue (param i64) (result i64)))
    (import "env" "hostReadValues" (func $hostReadValues (param i64)))
    (import "env" "hostNewValue" (func $hostNewValue (param i64) (result i64)))
    (import "env" "hostUpdateValue" (func $hostUpdateValue (param i64 i64) (result i64)))
    (import "env" "hostKeyAsInt32" (func $hostKeyAsInt32 (param i64 i32 i32) (result i32)))
    (import "env" "hostKeyAsString" (func $hostKeyAsString (param i64 i32 i32) (result i64)))
    (import "env" "hostValueLength" (func $hostValueLength (param i64) (result i32)))
    (import "env" "hostValueAsValue" (func $hostValueAsValue (param i64 i32 i32) (result i64)))
    (import "env" "hostValueAsInt32" (func $hostValueAsInt32 (param i64 i32 i32) (result i32)))
    (import "env" "hostValueAsInt64" (func $hostValueAsInt64 (param i64 i32 i32) (result i64)))
    (import "env" "hostValueAsString" (func $hostValueAsString (param i64 i32 i32) (result i64)))
    (import "env" "hostValueAsBytes" (func $hostValueAsBytes (param i64 i32 i32) (result i64)))
    (import "env" "hostValueAsBool" (func $hostValueAsBool (param i64 i32 i32) (result i64)))
    (import "env" "hostValueAsQNameEntity"
        (func $hostValueAsQNameEntity (param i64 i32 i32) (result i64)))
    (import "env" "hostValueGetAsInt64" (func $hostValueGetAsInt64 (param i64 i32) (result i64)))
    (import "env" "hostRowWriterPutInt32"
        (func $hostRowWriterPutInt32 (param i64 i32 i32 i32 i32)))
    (import "env" "hostRowWriterPutInt64"
        (func $hostRowWriterPutInt64 (param i64 i32 i32 i32 i64)))
    (import "env" "hostRowWriterPutString"
        (func $hostRowWriterPutString (param i64 i32 i32 i32 i32 i32)))
    (import "env" "hostRowWriterPutBytes"
        (func $hostRowWriterPutBytes (param i64 i32 i32 i32 i32 i32)))
    (import "env" "hostRowWriterPutQName"
        (func $hostRowWriterPutQName (param i64 i32 i32 i32 i32 i32 i32 i32)))
    (import "env" "hostPanic" (func $hostPanic (param i32 i32)))
"#;

/// Runtime functions every guest carries.
///
/// Layout of page 0: iovec at 0, `nwritten` at 8, the out-of-memory panic
/// text at 16, test strings from 256.
const RUNTIME: &str = r#"
    (memory (export "memory") 2)
    (global $heap (mut i32) (i32.const 65536))
    (global $mallocs (mut i64) (i64.const 0))
    (global $frees (mut i64) (i64.const 0))
    (data (i32.const 16) "panic: runtime error: out of memory\n")

    (func $print (param $ptr i32) (param $len i32)
        (i32.store (i32.const 0) (local.get $ptr))
        (i32.store (i32.const 4) (local.get $len))
        (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8))))

    (func $runtime.alloc (export "malloc") (param $size i32) (result i32)
        (local $addr i32)
        (local $end i32)
        (local $have i32)
        (local.set $addr (global.get $heap))
        (local.set $end (i32.add (local.get $addr) (local.get $size)))
        (local.set $have (i32.mul (memory.size) (i32.const 65536)))
        (if (i32.gt_u (local.get $end) (local.get $have))
            (then
                (if (i32.eq
                        (memory.grow
                            (i32.add
                                (i32.shr_u
                                    (i32.sub (local.get $end) (local.get $have))
                                    (i32.const 16))
                                (i32.const 1)))
                        (i32.const -1))
                    (then
                        (call $print (i32.const 16) (i32.const 36))
                        unreachable))))
        (global.set $heap (local.get $end))
        (global.set $mallocs (i64.add (global.get $mallocs) (i64.const 1)))
        (local.get $addr))

    (func (export "free") (param i32)
        (global.set $frees (i64.add (global.get $frees) (i64.const 1))))

    (func (export "WasmAbiVersion_0_0_1"))
    (func (export "WasmGetHeapInuse") (result i64)
        (i64.extend_i32_u (i32.sub (global.get $heap) (i32.const 65536))))
    (func (export "WasmGetHeapSys") (result i64)
        (i64.extend_i32_u (i32.mul (memory.size) (i32.const 65536))))
    (func (export "WasmGetMallocs") (result i64) (global.get $mallocs))
    (func (export "WasmGetFrees") (result i64) (global.get $frees))
    (func (export "WasmGC"))
"#;

const DEFAULT_ON_READ: &str = r#"
    (func (export "WasmOnReadValue") (param i64 i64))
"#;

/// WAT guest under construction.
#[derive(Default)]
pub struct Guest {
    strings: HashMap<String, u32>,
    data: String,
    next: u32,
    funcs: String,
    on_read: Option<String>,
    skip_exports: Vec<&'static str>,
}

impl Guest {
    pub fn new() -> Self {
        Self {
            next: 256,
            ..Self::default()
        }
    }

    /// Place `text` in the data section; returns the `ptr len` operands.
    pub fn s(&mut self, text: &str) -> String {
        let len = u32::try_from(text.len()).unwrap();
        let ptr = match self.strings.get(text) {
            Some(ptr) => *ptr,
            None => {
                let ptr = self.next;
                writeln!(
                    self.data,
                    "    (data (i32.const {ptr}) \"{}\")",
                    text.escape_default()
                )
                .unwrap();
                self.strings.insert(text.to_string(), ptr);
                self.next += len.max(1);
                ptr
            }
        };
        format!("(i32.const {ptr}) (i32.const {len})")
    }

    /// Add a function or global.
    pub fn func(&mut self, wat: &str) -> &mut Self {
        self.funcs.push_str(wat);
        self.funcs.push('\n');
        self
    }

    /// Replace the no-op `WasmOnReadValue`.
    pub fn on_read(&mut self, wat: &str) -> &mut Self {
        self.on_read = Some(wat.to_string());
        self
    }

    /// Drop a runtime export from the module.
    pub fn without_export(&mut self, name: &'static str) -> &mut Self {
        self.skip_exports.push(name);
        self
    }

    pub fn build(&self) -> String {
        let mut runtime = RUNTIME.to_string();
        for name in &self.skip_exports {
            runtime = runtime.replace(&format!("(export \"{name}\")"), "");
        }
        let on_read = self.on_read.as_deref().unwrap_or(DEFAULT_ON_READ);

        format!(
            "(module\n{IMPORTS}\n{runtime}\n{on_read}\n{}\n{})",
            self.data, self.funcs
        )
    }
}

pub fn factory() -> ExtensionEngineFactory {
    factory_with(&EngineConfig::default())
}

pub fn factory_with(config: &EngineConfig) -> ExtensionEngineFactory {
    provide_extension_engine_factory(config, VVM, Arc::new(Metrics::new())).unwrap()
}

pub fn module(wat: String, extensions: &[&str]) -> ExtensionModule {
    ExtensionModule {
        path: PACKAGE.to_string(),
        source: ModuleSource::Wat(wat.into()),
        extension_names: extensions.iter().map(ToString::to_string).collect(),
    }
}

pub fn try_engine(
    factory: &ExtensionEngineFactory,
    guest: &Guest,
    extensions: &[&str],
    config: &ExtEngineConfig,
) -> Result<ExtensionEngine, RuntimeError> {
    let mut engines =
        factory.new_engines(APP, &[module(guest.build(), extensions)], config, 1)?;
    Ok(engines.remove(0))
}

/// Single engine with the default configuration.
pub fn engine(guest: &Guest, extensions: &[&str]) -> ExtensionEngine {
    try_engine(&factory(), guest, extensions, &ExtEngineConfig::default()).unwrap()
}

pub fn fields(items: &[(&str, FieldValue)]) -> Fields {
    items
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

pub fn record_storage() -> QName {
    QName::new("sys", "Record")
}

pub fn view_storage() -> QName {
    QName::new("sys", "View")
}

pub fn items_view() -> FullQName {
    FullQName::new(PACKAGE, "Items")
}

/// State with one order record: `ID=1, Quantity=2, SinglePrice=100`.
pub fn order_state() -> Arc<MemState> {
    let state = MemState::new();
    state.insert(
        record_storage(),
        None,
        fields(&[("ID", FieldValue::Int64(1))]),
        fields(&[
            ("Quantity", FieldValue::Int32(2)),
            ("SinglePrice", FieldValue::Int64(100)),
        ]),
    );
    Arc::new(state)
}

/// Guest with `CalcOrderedItems`: reads the order record and adds
/// `Quantity * SinglePrice` to the `Amount` of view item `Year=2023`.
pub fn orders_guest() -> Guest {
    let mut g = Guest::new();
    let record = g.s("sys.Record");
    let view = g.s("sys.View");
    let items = g.s("test/orders.Items");
    let id = g.s("ID");
    let quantity = g.s("Quantity");
    let price = g.s("SinglePrice");
    let year = g.s("Year");
    let amount = g.s("Amount");

    g.func(&format!(
        r#"
    (func (export "CalcOrderedItems")
        (local $kb i64)
        (local $rec i64)
        (local $existing i64)
        (local $intent i64)
        (local $amount i64)
        (local.set $kb (call $hostGetKey {record} (i32.const 0) (i32.const 0)))
        (call $hostRowWriterPutInt64 (local.get $kb) (i32.const 0) {id} (i64.const 1))
        (local.set $rec (call $hostGetValue (local.get $kb)))
        (local.set $amount
            (i64.mul
                (i64.extend_i32_s (call $hostValueAsInt32 (local.get $rec) {quantity}))
                (call $hostValueAsInt64 (local.get $rec) {price})))
        (local.set $kb (call $hostGetKey {view} {items}))
        (call $hostRowWriterPutInt32 (local.get $kb) (i32.const 0) {year} (i32.const 2023))
        (local.set $existing (call $hostQueryValue (local.get $kb)))
        (if (i64.eq (local.get $existing) (i64.const -1))
            (then
                (local.set $intent (call $hostNewValue (local.get $kb))))
            (else
                (local.set $intent (call $hostUpdateValue (local.get $kb) (local.get $existing)))
                (local.set $amount
                    (i64.add
                        (local.get $amount)
                        (call $hostValueAsInt64 (local.get $existing) {amount})))))
        (call $hostRowWriterPutInt64 (local.get $intent) (i32.const 1) {amount} (local.get $amount)))
"#
    ));
    g
}

/// `Amount` of view item `Year=2023`.
pub fn ordered_amount(state: &MemState) -> Option<FieldValue> {
    state
        .get(
            &view_storage(),
            Some(&items_view()),
            &fields(&[("Year", FieldValue::Int32(2023))]),
        )
        .and_then(|value| value.get("Amount").cloned())
}

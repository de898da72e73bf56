//! Row writer host functions.
//!
//! One set of `hostRowWriterPut*` functions serves both key builders and
//! intents. The guest passes a kind discriminator next to the handle:
//! `0` for a key builder, `1` for an intent.

use wasmtime::{Caller, Linker};

use ext_engine_common::{FullQName, RuntimeError, StateError};
use ext_engine_core::{ExtensionContext, RowWriter, RowWriterRef};

use crate::memory::{read_bytes, read_str};
use crate::state_abi::HOST_MODULE;

/// Register the row writer host functions.
///
/// # Errors
///
/// Returns an error if a function is already defined on the linker.
pub fn register_row_writer(linker: &mut Linker<ExtensionContext>) -> Result<(), RuntimeError> {
    let mut define = || -> wasmtime::Result<()> {
        linker
            .func_wrap(HOST_MODULE, "hostRowWriterPutString", put_string)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutBytes", put_bytes)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutInt32", put_int32)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutInt64", put_int64)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutFloat32", put_float32)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutFloat64", put_float64)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutBool", put_bool)?
            .func_wrap(HOST_MODULE, "hostRowWriterPutQName", put_qname)?;
        Ok(())
    };

    define().map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register row writer functions: {e}"))
    })
}

type Ctx<'a> = Caller<'a, ExtensionContext>;

/// Resolve the target, read the field name and apply `write`.
fn with_writer(
    caller: &mut Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    write: impl FnOnce(&mut dyn RowWriter, &str) -> Result<(), StateError>,
) -> wasmtime::Result<()> {
    let target = RowWriterRef::from_abi(kind, id)?;
    let name = read_str(caller, name_ptr, name_len)?;
    Ok(caller
        .data_mut()
        .state
        .with_row_writer(target, |writer| write(writer, &name))?)
}

fn put_string(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
) -> wasmtime::Result<()> {
    let value = read_str(&caller, value_ptr, value_len)?;
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_string(name, &value)
    })
}

fn put_bytes(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value_ptr: u32,
    value_len: u32,
) -> wasmtime::Result<()> {
    let value = read_bytes(&caller, value_ptr, value_len)?;
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_bytes(name, &value)
    })
}

fn put_int32(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: i32,
) -> wasmtime::Result<()> {
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_int32(name, value)
    })
}

fn put_int64(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: i64,
) -> wasmtime::Result<()> {
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_int64(name, value)
    })
}

fn put_float32(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: f32,
) -> wasmtime::Result<()> {
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_float32(name, value)
    })
}

fn put_float64(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: f64,
) -> wasmtime::Result<()> {
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_float64(name, value)
    })
}

/// Any positive value is `true`.
fn put_bool(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    value: i32,
) -> wasmtime::Result<()> {
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_bool(name, value > 0)
    })
}

#[allow(clippy::too_many_arguments)]
fn put_qname(
    mut caller: Ctx<'_>,
    id: u64,
    kind: u32,
    name_ptr: u32,
    name_len: u32,
    pkg_ptr: u32,
    pkg_len: u32,
    entity_ptr: u32,
    entity_len: u32,
) -> wasmtime::Result<()> {
    let qname = FullQName::new(
        read_str(&caller, pkg_ptr, pkg_len)?,
        read_str(&caller, entity_ptr, entity_len)?,
    );
    with_writer(&mut caller, id, kind, name_ptr, name_len, |w, name| {
        w.put_qname(name, &qname)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ext_engine_common::EngineConfig;
    use ext_engine_core::WasmEngine;

    #[test]
    fn test_register_row_writer() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut linker = Linker::new(engine.inner());

        assert!(register_row_writer(&mut linker).is_ok());
    }
}

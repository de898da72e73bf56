//! State host functions.
//!
//! Guest code addresses state through handles. These functions resolve
//! handles against the invocation's [`StateHandles`] and forward to the bound
//! [`ExtensionIo`]. Failures abort the guest call:
//! - Bad handles and unreadable memory surface as [`AbiError`]
//! - State store failures surface unchanged as [`StateError`]
//!
//! [`StateHandles`]: ext_engine_core::StateHandles
//! [`ExtensionIo`]: ext_engine_core::ExtensionIo
//! [`AbiError`]: ext_engine_common::AbiError

use wasmtime::{Caller, Linker};

use ext_engine_common::{RuntimeError, StateError};
use ext_engine_core::{ExtensionContext, NOT_FOUND, StateKey, StateValue};

use crate::memory::{read_str, send_bytes, send_str};

/// Import module of the host ABI.
pub const HOST_MODULE: &str = "env";

/// Reported to the state when a read callback fails in the guest.
const READ_ABORTED: &str = "read aborted by extension";

/// Register key, value and intent host functions.
///
/// # Errors
///
/// Returns an error if a function is already defined on the linker.
pub fn register_state_abi(linker: &mut Linker<ExtensionContext>) -> Result<(), RuntimeError> {
    let mut define = || -> wasmtime::Result<()> {
        linker
            .func_wrap(HOST_MODULE, "hostGetKey", host_get_key)?
            .func_wrap(HOST_MODULE, "hostGetValue", host_get_value)?
            .func_wrap(HOST_MODULE, "hostQueryValue", host_query_value)?
            .func_wrap(HOST_MODULE, "hostReadValues", host_read_values)?
            .func_wrap(HOST_MODULE, "hostNewValue", host_new_value)?
            .func_wrap(HOST_MODULE, "hostUpdateValue", host_update_value)?
            // Keys
            .func_wrap(HOST_MODULE, "hostKeyAsString", host_key_as_string)?
            .func_wrap(HOST_MODULE, "hostKeyAsBytes", host_key_as_bytes)?
            .func_wrap(HOST_MODULE, "hostKeyAsInt32", host_key_as_int32)?
            .func_wrap(HOST_MODULE, "hostKeyAsInt64", host_key_as_int64)?
            .func_wrap(HOST_MODULE, "hostKeyAsFloat32", host_key_as_float32)?
            .func_wrap(HOST_MODULE, "hostKeyAsFloat64", host_key_as_float64)?
            .func_wrap(HOST_MODULE, "hostKeyAsBool", host_key_as_bool)?
            .func_wrap(HOST_MODULE, "hostKeyAsQNamePkg", host_key_as_qname_pkg)?
            .func_wrap(HOST_MODULE, "hostKeyAsQNameEntity", host_key_as_qname_entity)?
            // Values by name
            .func_wrap(HOST_MODULE, "hostValueLength", host_value_length)?
            .func_wrap(HOST_MODULE, "hostValueAsValue", host_value_as_value)?
            .func_wrap(HOST_MODULE, "hostValueAsString", host_value_as_string)?
            .func_wrap(HOST_MODULE, "hostValueAsBytes", host_value_as_bytes)?
            .func_wrap(HOST_MODULE, "hostValueAsInt32", host_value_as_int32)?
            .func_wrap(HOST_MODULE, "hostValueAsInt64", host_value_as_int64)?
            .func_wrap(HOST_MODULE, "hostValueAsFloat32", host_value_as_float32)?
            .func_wrap(HOST_MODULE, "hostValueAsFloat64", host_value_as_float64)?
            .func_wrap(HOST_MODULE, "hostValueAsBool", host_value_as_bool)?
            .func_wrap(HOST_MODULE, "hostValueAsQNamePkg", host_value_as_qname_pkg)?
            .func_wrap(HOST_MODULE, "hostValueAsQNameEntity", host_value_as_qname_entity)?
            // Values by index
            .func_wrap(HOST_MODULE, "hostValueGetAsValue", host_value_get_as_value)?
            .func_wrap(HOST_MODULE, "hostValueGetAsString", host_value_get_as_string)?
            .func_wrap(HOST_MODULE, "hostValueGetAsBytes", host_value_get_as_bytes)?
            .func_wrap(HOST_MODULE, "hostValueGetAsInt32", host_value_get_as_int32)?
            .func_wrap(HOST_MODULE, "hostValueGetAsInt64", host_value_get_as_int64)?
            .func_wrap(HOST_MODULE, "hostValueGetAsFloat32", host_value_get_as_float32)?
            .func_wrap(HOST_MODULE, "hostValueGetAsFloat64", host_value_get_as_float64)?
            .func_wrap(HOST_MODULE, "hostValueGetAsBool", host_value_get_as_bool)?
            .func_wrap(HOST_MODULE, "hostValueGetAsQNamePkg", host_value_get_as_qname_pkg)?
            .func_wrap(
                HOST_MODULE,
                "hostValueGetAsQNameEntity",
                host_value_get_as_qname_entity,
            )?;
        Ok(())
    };

    define().map_err(|e| {
        RuntimeError::invalid_config(format!("Failed to register state functions: {e}"))
    })
}

type Ctx<'a> = Caller<'a, ExtensionContext>;

fn bool_result(value: bool) -> u64 {
    u64::from(value)
}

fn host_get_key(
    mut caller: Ctx<'_>,
    storage_ptr: u32,
    storage_len: u32,
    entity_ptr: u32,
    entity_len: u32,
) -> wasmtime::Result<u64> {
    let storage = read_str(&caller, storage_ptr, storage_len)?;
    let entity = read_str(&caller, entity_ptr, entity_len)?;
    Ok(caller.data_mut().state.new_key_builder(&storage, &entity)?)
}

fn host_get_value(mut caller: Ctx<'_>, key_builder: u64) -> wasmtime::Result<u64> {
    Ok(caller.data_mut().state.must_get_value(key_builder)?)
}

fn host_query_value(mut caller: Ctx<'_>, key_builder: u64) -> wasmtime::Result<u64> {
    Ok(caller
        .data_mut()
        .state
        .query_value(key_builder)?
        .unwrap_or(NOT_FOUND))
}

/// Call `WasmOnReadValue` for every item while the state iterates.
///
/// A failing callback stops the iteration and its error is returned as is,
/// whatever the state makes of the abort.
fn host_read_values(mut caller: Ctx<'_>, key_builder: u64) -> wasmtime::Result<()> {
    let state = &caller.data().state;
    let io = state.io()?;
    let key_builder = state.key_builder(key_builder)?;
    let on_read = caller.data().guest()?.on_read_value.clone();

    let mut guest_error = None;
    let key = key_builder.read_recursive();
    let result = io.read(&**key, &mut |key, value| {
        let pair = caller.data_mut().state.push_item(key, value);
        on_read.call(&mut caller, pair).map_err(|e| {
            guest_error = Some(e);
            StateError::Io(READ_ABORTED.to_string())
        })
    });

    match guest_error {
        Some(err) => Err(err),
        None => Ok(result?),
    }
}

fn host_new_value(mut caller: Ctx<'_>, key_builder: u64) -> wasmtime::Result<u64> {
    Ok(caller.data_mut().state.new_intent(key_builder)?)
}

fn host_update_value(
    mut caller: Ctx<'_>,
    key_builder: u64,
    existing: u64,
) -> wasmtime::Result<u64> {
    Ok(caller.data_mut().state.update_intent(key_builder, existing)?)
}

fn with_key<R>(
    caller: &Ctx<'_>,
    id: u64,
    name_ptr: u32,
    name_len: u32,
    read: impl FnOnce(&dyn StateKey, &str) -> Result<R, StateError>,
) -> wasmtime::Result<R> {
    let name = read_str(caller, name_ptr, name_len)?;
    let key = caller.data().state.key(id)?;
    Ok(read(key, &name)?)
}

fn host_key_as_string(mut caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    let value = with_key(&caller, id, ptr, len, |key, name| key.as_string(name))?;
    send_str(&mut caller, &value)
}

fn host_key_as_bytes(mut caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    let value = with_key(&caller, id, ptr, len, |key, name| key.as_bytes(name))?;
    send_bytes(&mut caller, &value)
}

fn host_key_as_int32(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<i32> {
    with_key(&caller, id, ptr, len, |key, name| key.as_int32(name))
}

fn host_key_as_int64(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<i64> {
    with_key(&caller, id, ptr, len, |key, name| key.as_int64(name))
}

fn host_key_as_float32(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<f32> {
    with_key(&caller, id, ptr, len, |key, name| key.as_float32(name))
}

fn host_key_as_float64(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<f64> {
    with_key(&caller, id, ptr, len, |key, name| key.as_float64(name))
}

fn host_key_as_bool(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    with_key(&caller, id, ptr, len, |key, name| key.as_bool(name)).map(bool_result)
}

fn host_key_as_qname_pkg(
    mut caller: Ctx<'_>,
    id: u64,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u64> {
    let qname = with_key(&caller, id, ptr, len, |key, name| key.as_qname(name))?;
    send_str(&mut caller, &qname.pkg_path)
}

fn host_key_as_qname_entity(
    mut caller: Ctx<'_>,
    id: u64,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u64> {
    let qname = with_key(&caller, id, ptr, len, |key, name| key.as_qname(name))?;
    send_str(&mut caller, &qname.entity)
}

fn with_value<R>(
    caller: &Ctx<'_>,
    id: u64,
    name_ptr: u32,
    name_len: u32,
    read: impl FnOnce(&dyn StateValue, &str) -> Result<R, StateError>,
) -> wasmtime::Result<R> {
    let name = read_str(caller, name_ptr, name_len)?;
    let value = caller.data().state.value(id)?;
    Ok(read(value, &name)?)
}

fn host_value_length(caller: Ctx<'_>, id: u64) -> wasmtime::Result<u32> {
    let len = caller.data().state.value(id)?.length()?;
    Ok(u32::try_from(len).unwrap_or(u32::MAX))
}

fn host_value_as_value(mut caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    let name = read_str(&caller, ptr, len)?;
    Ok(caller.data_mut().state.value_as_value(id, &name)?)
}

fn host_value_as_string(
    mut caller: Ctx<'_>,
    id: u64,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u64> {
    let value = with_value(&caller, id, ptr, len, |value, name| value.as_string(name))?;
    send_str(&mut caller, &value)
}

fn host_value_as_bytes(mut caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    let value = with_value(&caller, id, ptr, len, |value, name| value.as_bytes(name))?;
    send_bytes(&mut caller, &value)
}

fn host_value_as_int32(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<i32> {
    with_value(&caller, id, ptr, len, |value, name| value.as_int32(name))
}

fn host_value_as_int64(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<i64> {
    with_value(&caller, id, ptr, len, |value, name| value.as_int64(name))
}

fn host_value_as_float32(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<f32> {
    with_value(&caller, id, ptr, len, |value, name| value.as_float32(name))
}

fn host_value_as_float64(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<f64> {
    with_value(&caller, id, ptr, len, |value, name| value.as_float64(name))
}

fn host_value_as_bool(caller: Ctx<'_>, id: u64, ptr: u32, len: u32) -> wasmtime::Result<u64> {
    with_value(&caller, id, ptr, len, |value, name| value.as_bool(name)).map(bool_result)
}

fn host_value_as_qname_pkg(
    mut caller: Ctx<'_>,
    id: u64,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u64> {
    let qname = with_value(&caller, id, ptr, len, |value, name| value.as_qname(name))?;
    send_str(&mut caller, &qname.pkg_path)
}

fn host_value_as_qname_entity(
    mut caller: Ctx<'_>,
    id: u64,
    ptr: u32,
    len: u32,
) -> wasmtime::Result<u64> {
    let qname = with_value(&caller, id, ptr, len, |value, name| value.as_qname(name))?;
    send_str(&mut caller, &qname.entity)
}

fn with_element<R>(
    caller: &Ctx<'_>,
    id: u64,
    index: u32,
    read: impl FnOnce(&dyn StateValue, usize) -> Result<R, StateError>,
) -> wasmtime::Result<R> {
    let value = caller.data().state.value(id)?;
    Ok(read(value, index as usize)?)
}

fn host_value_get_as_value(mut caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<u64> {
    Ok(caller
        .data_mut()
        .state
        .value_get_as_value(id, index as usize)?)
}

fn host_value_get_as_string(mut caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<u64> {
    let value = with_element(&caller, id, index, |value, i| value.get_as_string(i))?;
    send_str(&mut caller, &value)
}

fn host_value_get_as_bytes(mut caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<u64> {
    let value = with_element(&caller, id, index, |value, i| value.get_as_bytes(i))?;
    send_bytes(&mut caller, &value)
}

fn host_value_get_as_int32(caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<i32> {
    with_element(&caller, id, index, |value, i| value.get_as_int32(i))
}

fn host_value_get_as_int64(caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<i64> {
    with_element(&caller, id, index, |value, i| value.get_as_int64(i))
}

fn host_value_get_as_float32(caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<f32> {
    with_element(&caller, id, index, |value, i| value.get_as_float32(i))
}

fn host_value_get_as_float64(caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<f64> {
    with_element(&caller, id, index, |value, i| value.get_as_float64(i))
}

fn host_value_get_as_bool(caller: Ctx<'_>, id: u64, index: u32) -> wasmtime::Result<u64> {
    with_element(&caller, id, index, |value, i| value.get_as_bool(i)).map(bool_result)
}

fn host_value_get_as_qname_pkg(
    mut caller: Ctx<'_>,
    id: u64,
    index: u32,
) -> wasmtime::Result<u64> {
    let qname = with_element(&caller, id, index, |value, i| value.get_as_qname(i))?;
    send_str(&mut caller, &qname.pkg_path)
}

fn host_value_get_as_qname_entity(
    mut caller: Ctx<'_>,
    id: u64,
    index: u32,
) -> wasmtime::Result<u64> {
    let qname = with_element(&caller, id, index, |value, i| value.get_as_qname(i))?;
    send_str(&mut caller, &qname.entity)
}

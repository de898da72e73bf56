//! Guest memory access for host functions.
//!
//! # Memory Protocol
//!
//! - Guest to host: the guest passes `(ptr, len)` pairs pointing into its
//!   linear memory. Strings are UTF-8.
//! - Host to guest: the host copies data into a return buffer and returns
//!   `(addr << 32) | len` packed into a `u64`.

use wasmtime::Caller;

use ext_engine_common::AbiError;
use ext_engine_core::{ExtensionContext, pack_region};

/// Copy `len` bytes at `ptr` out of guest memory.
pub(crate) fn read_bytes(
    caller: &Caller<'_, ExtensionContext>,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, AbiError> {
    let memory = caller.data().guest()?.memory;
    let data = memory.data(caller);

    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or(AbiError::UnableToReadMemory)?;

    data.get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or(AbiError::UnableToReadMemory)
}

/// Read a string at `ptr` out of guest memory.
///
/// Invalid UTF-8 sequences are replaced rather than rejected.
pub(crate) fn read_str(
    caller: &Caller<'_, ExtensionContext>,
    ptr: u32,
    len: u32,
) -> Result<String, AbiError> {
    let bytes = read_bytes(caller, ptr, len)?;
    Ok(match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    })
}

/// Copy `bytes` into a return buffer and return the packed region.
///
/// Calls guest `malloc` when no return buffer has room; that call can fail
/// with a trap if the guest is out of memory.
pub(crate) fn send_bytes(
    caller: &mut Caller<'_, ExtensionContext>,
    bytes: &[u8],
) -> wasmtime::Result<u64> {
    let len = u32::try_from(bytes.len()).map_err(|_| AbiError::MemoryOutOfRange)?;
    let guest = caller.data().guest()?.clone();

    let addr = match caller.data_mut().buffers.try_allocate(len)? {
        Some(addr) => addr,
        None => {
            let size = caller.data().buffers.next_buffer_size(len);
            let addr = guest.malloc.call(&mut *caller, size)?;
            if addr == 0 {
                return Err(AbiError::GuestOutOfMemory { size }.into());
            }

            let buffers = &mut caller.data_mut().buffers;
            buffers.push(addr, size);
            buffers
                .try_allocate(len)?
                .ok_or(AbiError::MemoryOutOfRange)?
        }
    };

    guest
        .memory
        .write(&mut *caller, addr as usize, bytes)
        .map_err(|_| AbiError::MemoryOutOfRange)?;

    Ok(pack_region(addr, len))
}

/// Copy a string into a return buffer and return the packed region.
pub(crate) fn send_str(
    caller: &mut Caller<'_, ExtensionContext>,
    value: &str,
) -> wasmtime::Result<u64> {
    send_bytes(caller, value.as_bytes())
}

//! Copying buffers in and out of a guest's linear memory.
//!
//! The host never keeps pointers into guest memory: arguments are written
//! into buffers the guest allocates, results are copied out of buffers the
//! guest owns and then handed back through `fx_free`.

use anyhow::{Context, Result, anyhow};
use scriptdomain_api::OutRecord;
use wasmtime::{AsContext, AsContextMut, Memory};

use super::bindings::Bindings;

/// A `(ptr, len)` buffer inside guest memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct GuestBuf {
    pub ptr: i32,
    pub len: i32,
}

fn offset(ptr: i32) -> Result<usize> {
    usize::try_from(ptr).map_err(|_| anyhow!("invalid guest pointer {}", ptr))
}

/// Copy `bytes` into a fresh guest allocation. Empty input allocates nothing.
pub(crate) fn write_guest(
    mut store: impl AsContextMut,
    bindings: &Bindings,
    bytes: &[u8],
) -> Result<GuestBuf> {
    if bytes.is_empty() {
        return Ok(GuestBuf::default());
    }

    let len = i32::try_from(bytes.len()).context("buffer exceeds guest address space")?;
    let ptr = bindings.alloc(&mut store, len)?;
    bindings
        .memory()
        .write(&mut store, offset(ptr)?, bytes)
        .with_context(|| format!("fx_alloc returned {} bytes at {} outside memory", len, ptr))?;

    Ok(GuestBuf { ptr, len })
}

/// Allocate a zeroed slot the guest fills with an out record
pub(crate) fn alloc_out_slot(mut store: impl AsContextMut, bindings: &Bindings) -> Result<GuestBuf> {
    write_guest(&mut store, bindings, &[0u8; OutRecord::SIZE])
}

pub(crate) fn release(mut store: impl AsContextMut, bindings: &Bindings, buf: GuestBuf) -> Result<()> {
    if buf.len > 0 {
        bindings.free(&mut store, buf.ptr, buf.len)?;
    }
    Ok(())
}

pub(crate) fn read_guest(store: impl AsContext, memory: Memory, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let len = usize::try_from(len).map_err(|_| anyhow!("negative guest buffer length {}", len))?;
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    memory
        .read(&store, offset(ptr)?, &mut buf)
        .with_context(|| format!("guest buffer {}+{} is outside memory", ptr, len))?;
    Ok(buf)
}

pub(crate) fn read_str(store: impl AsContext, memory: Memory, ptr: i32, len: i32) -> Result<String> {
    let bytes = read_guest(store, memory, ptr, len)?;
    String::from_utf8(bytes).context("guest string is not valid UTF-8")
}

/// Copy the buffer an out record points at, then return it to the guest
pub(crate) fn take_out_record(
    mut store: impl AsContextMut,
    bindings: &Bindings,
    slot: GuestBuf,
) -> Result<Vec<u8>> {
    let raw = read_guest(&store, bindings.memory(), slot.ptr, OutRecord::SIZE as i32)?;
    let record = OutRecord::decode(&raw)?;
    if record.is_empty() {
        return Ok(Vec::new());
    }

    let bytes = read_guest(&store, bindings.memory(), record.ptr, record.len)?;
    bindings.free(&mut store, record.ptr, record.len)?;
    Ok(bytes)
}

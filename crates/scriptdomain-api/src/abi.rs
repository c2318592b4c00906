//! Names and record layouts of the core-module ABI.
//!
//! A script module is a WebAssembly core module. It exports a linear memory,
//! an allocator pair and one entry point per host operation. Buffers always
//! cross the boundary as `(ptr, len)` pairs in the module's memory: the host
//! writes arguments into memory it allocates through [`ALLOC`], and the guest
//! hands results back through an out record that the host copies and then
//! releases through [`FREE`].

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

/// Import module name for every host function
pub const HOST_MODULE: &str = "fx";

// ===== Guest exports =====

pub const MEMORY: &str = "memory";
/// `(size: i32) -> i32`
pub const ALLOC: &str = "fx_alloc";
/// `(ptr: i32, len: i32)`
pub const FREE: &str = "fx_free";
/// `()`, optional, runs once after instantiation
pub const INIT: &str = "fx_init";
/// `(game_time: i64, profiling: i32) -> i32`
pub const TICK: &str = "fx_tick";
/// `(name, name_len, args, args_len, source, source_len, game_time: i64, profiling) -> i32`
pub const TRIGGER_EVENT: &str = "fx_trigger_event";
/// `(ref, args, args_len, out, game_time: i64, profiling) -> i32`
pub const CALL_REF: &str = "fx_call_ref";
/// `(ref: i32) -> i32`
pub const DUPLICATE_REF: &str = "fx_duplicate_ref";
/// `(ref: i32)`
pub const REMOVE_REF: &str = "fx_remove_ref";
/// `(private_id: i64, binding: i64, args, args_len, out, async_id: i64, game_time: i64, profiling) -> i32`
pub const INVOKE_EXPORT: &str = "fx_invoke_export";
/// `() -> i64`, optional
pub const MEMORY_USAGE: &str = "fx_memory_usage";
/// `()`, optional
pub const START_PROFILING: &str = "fx_start_profiling";
/// `()`, optional
pub const STOP_PROFILING: &str = "fx_stop_profiling";
/// `(async_id: i64, status, payload, payload_len, game_time: i64, profiling) -> i32`, optional;
/// receives results of pending exports the module called
pub const ASYNC_RESULT: &str = "fx_async_result";

// ===== Host imports =====

/// `(time_ms: i64)`
pub const IMPORT_SCHEDULE_TICK: &str = "schedule_tick";
/// `(name, name_len, private_id: i64, binding: i64)`
pub const IMPORT_REGISTER_EXPORT: &str = "register_export";
/// `(async_id: i64, status, ptr, len, game_time: i64, profiling) -> i32`
pub const IMPORT_DELIVER_ASYNC_RESULT: &str = "deliver_async_result";
/// `(engine_ref: i32) -> i32`
pub const IMPORT_EXPOSE_REF: &str = "expose_ref";
/// `(resource, resource_len, export, export_len, args, args_len, out) -> i32`
pub const IMPORT_INVOKE_EXPORT: &str = "invoke_export";
/// `(level, ptr, len)`
pub const IMPORT_LOG: &str = "log";

/// `fx_trigger_event` return values
pub const EVENT_UNHANDLED: i32 = 0;
pub const EVENT_HANDLED: i32 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("record needs {expected} bytes, got {actual}")]
    ShortRecord { expected: usize, actual: usize },
    #[error("negative buffer length {0}")]
    NegativeLength(i32),
}

/// `(ptr, len)` pair a guest writes to hand a buffer back to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutRecord {
    pub ptr: i32,
    pub len: i32,
}

impl OutRecord {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.ptr);
        LittleEndian::write_i32(&mut buf[4..8], self.len);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AbiError> {
        if bytes.len() < Self::SIZE {
            return Err(AbiError::ShortRecord {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        let record = Self {
            ptr: LittleEndian::read_i32(&bytes[0..4]),
            len: LittleEndian::read_i32(&bytes[4..8]),
        };
        if record.len < 0 {
            return Err(AbiError::NegativeLength(record.len));
        }
        Ok(record)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Result record the host writes for the `invoke_export` import
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExportRecord {
    pub ptr: i32,
    pub len: i32,
    /// Non-zero only when the call returned pending
    pub async_id: u64,
}

impl ExportRecord {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        LittleEndian::write_i32(&mut buf[0..4], self.ptr);
        LittleEndian::write_i32(&mut buf[4..8], self.len);
        LittleEndian::write_u64(&mut buf[8..16], self.async_id);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AbiError> {
        if bytes.len() < Self::SIZE {
            return Err(AbiError::ShortRecord {
                expected: Self::SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            ptr: LittleEndian::read_i32(&bytes[0..4]),
            len: LittleEndian::read_i32(&bytes[4..8]),
            async_id: LittleEndian::read_u64(&bytes[8..16]),
        })
    }
}

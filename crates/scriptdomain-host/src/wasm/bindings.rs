use anyhow::{Context, Result};
use scriptdomain_api::abi::{self, EVENT_HANDLED, EVENT_UNHANDLED, HOST_MODULE};
use scriptdomain_api::{AsyncResultId, CallStatus, ExportRecord};
use tracing::{debug, warn};
use wasmtime::{AsContextMut, Caller, Instance, Linker, Memory, TypedFunc, WasmParams, WasmResults};

use super::memory::{self, GuestBuf};
use super::module::DomainState;
use crate::error::BridgeError;
use crate::marshal::{CallMeta, EventCall, ExportCall, ExportReply, Operation, Payload, RefCall};
use crate::pending::{AsyncResult, ExportOutcome};

type TriggerEventParams = (i32, i32, i32, i32, i32, i32, i64, i32);
type CallRefParams = (i32, i32, i32, i32, i64, i32);
type InvokeExportParams = (i64, i64, i32, i32, i32, i64, i64, i32);
type AsyncResultParams = (i64, i32, i32, i32, i64, i32);

/// Entry points of a script module, resolved once at instantiation
#[derive(Clone)]
pub(crate) struct Bindings {
    memory: Memory,
    fx_alloc: TypedFunc<i32, i32>,
    fx_free: TypedFunc<(i32, i32), ()>,
    fx_init: Option<TypedFunc<(), ()>>,
    fx_tick: TypedFunc<(i64, i32), i32>,
    fx_trigger_event: TypedFunc<TriggerEventParams, i32>,
    fx_call_ref: TypedFunc<CallRefParams, i32>,
    fx_duplicate_ref: TypedFunc<i32, i32>,
    fx_remove_ref: TypedFunc<i32, ()>,
    fx_invoke_export: TypedFunc<InvokeExportParams, i32>,
    fx_memory_usage: Option<TypedFunc<(), i64>>,
    fx_start_profiling: Option<TypedFunc<(), ()>>,
    fx_stop_profiling: Option<TypedFunc<(), ()>>,
    fx_async_result: Option<TypedFunc<AsyncResultParams, i32>>,
}

fn required<P, R>(mut store: impl AsContextMut, instance: &Instance, name: &str) -> Result<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(&mut store, name)
        .with_context(|| format!("module is missing required export `{}`", name))
}

/// Optional exports may be absent but must have the right signature when present
fn optional<P, R>(
    mut store: impl AsContextMut,
    instance: &Instance,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: WasmParams,
    R: WasmResults,
{
    if instance.get_func(&mut store, name).is_none() {
        return Ok(None);
    }
    instance
        .get_typed_func::<P, R>(&mut store, name)
        .map(Some)
        .with_context(|| format!("export `{}` has the wrong signature", name))
}

fn meta_args(meta: CallMeta) -> (i64, i32) {
    (
        i64::try_from(meta.game_time).unwrap_or(i64::MAX),
        i32::from(meta.profiling),
    )
}

/// Turn a non-zero guest status into a call error carrying that status
fn check_status(operation: Operation, export: &str, code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(guest_failure(operation, export, code, None).into())
}

fn guest_failure(operation: Operation, export: &str, code: i32, diagnostic: Option<String>) -> BridgeError {
    let status = match CallStatus::from_guest(code) {
        status if status.is_success() => CallStatus::CallError,
        status => status,
    };
    BridgeError::Call {
        operation,
        status,
        diagnostic: diagnostic.unwrap_or_else(|| format!("{} returned status {}", export, code)),
    }
}

fn diagnostic_text(bytes: Vec<u8>) -> Option<String> {
    if bytes.is_empty() {
        None
    } else {
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Bindings {
    pub fn resolve(mut store: impl AsContextMut, instance: &Instance) -> Result<Self> {
        let memory = instance
            .get_memory(&mut store, abi::MEMORY)
            .with_context(|| format!("module is missing required export `{}`", abi::MEMORY))?;

        Ok(Self {
            memory,
            fx_alloc: required(&mut store, instance, abi::ALLOC)?,
            fx_free: required(&mut store, instance, abi::FREE)?,
            fx_init: optional(&mut store, instance, abi::INIT)?,
            fx_tick: required(&mut store, instance, abi::TICK)?,
            fx_trigger_event: required(&mut store, instance, abi::TRIGGER_EVENT)?,
            fx_call_ref: required(&mut store, instance, abi::CALL_REF)?,
            fx_duplicate_ref: required(&mut store, instance, abi::DUPLICATE_REF)?,
            fx_remove_ref: required(&mut store, instance, abi::REMOVE_REF)?,
            fx_invoke_export: required(&mut store, instance, abi::INVOKE_EXPORT)?,
            fx_memory_usage: optional(&mut store, instance, abi::MEMORY_USAGE)?,
            fx_start_profiling: optional(&mut store, instance, abi::START_PROFILING)?,
            fx_stop_profiling: optional(&mut store, instance, abi::STOP_PROFILING)?,
            fx_async_result: optional(&mut store, instance, abi::ASYNC_RESULT)?,
        })
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    pub fn has_memory_usage(&self) -> bool {
        self.fx_memory_usage.is_some()
    }

    pub fn has_profiling(&self) -> bool {
        self.fx_start_profiling.is_some() && self.fx_stop_profiling.is_some()
    }

    pub fn has_async_result(&self) -> bool {
        self.fx_async_result.is_some()
    }

    pub fn alloc(&self, store: impl AsContextMut, len: i32) -> Result<i32> {
        self.fx_alloc.call(store, len).context("fx_alloc failed")
    }

    pub fn free(&self, store: impl AsContextMut, ptr: i32, len: i32) -> Result<()> {
        self.fx_free.call(store, (ptr, len)).context("fx_free failed")
    }

    pub fn init(&self, store: impl AsContextMut) -> Result<()> {
        match self.fx_init {
            Some(ref init) => init.call(store, ()),
            None => Ok(()),
        }
    }

    pub fn tick(&self, mut store: impl AsContextMut, meta: CallMeta) -> Result<()> {
        let code = self.fx_tick.call(&mut store, meta_args(meta))?;
        check_status(Operation::Tick, abi::TICK, code)
    }

    pub fn trigger_event(&self, mut store: impl AsContextMut, event: &EventCall<'_>) -> Result<bool> {
        let name = memory::write_guest(&mut store, self, event.name.as_bytes())?;
        let args = memory::write_guest(&mut store, self, event.args)?;
        let source = memory::write_guest(&mut store, self, event.source.as_bytes())?;
        let (game_time, profiling) = meta_args(event.meta);

        let result = self.fx_trigger_event.call(
            &mut store,
            (
                name.ptr, name.len, args.ptr, args.len, source.ptr, source.len, game_time, profiling,
            ),
        );
        for buf in [name, args, source] {
            memory::release(&mut store, self, buf)?;
        }

        match result? {
            EVENT_HANDLED => Ok(true),
            EVENT_UNHANDLED => Ok(false),
            code => Err(guest_failure(Operation::TriggerEvent, abi::TRIGGER_EVENT, code, None).into()),
        }
    }

    pub fn call_ref(&self, mut store: impl AsContextMut, call: &RefCall<'_>) -> Result<Payload> {
        let args = memory::write_guest(&mut store, self, call.args)?;
        let out = memory::alloc_out_slot(&mut store, self)?;
        let (game_time, profiling) = meta_args(call.meta);

        let result = self.fx_call_ref.call(
            &mut store,
            (call.engine_ref, args.ptr, args.len, out.ptr, game_time, profiling),
        );
        memory::release(&mut store, self, args)?;
        let code = result?;

        let bytes = memory::take_out_record(&mut store, self, out)?;
        memory::release(&mut store, self, out)?;

        if code == 0 {
            Ok(Payload::from(bytes))
        } else {
            Err(guest_failure(Operation::CallRef, abi::CALL_REF, code, diagnostic_text(bytes)).into())
        }
    }

    pub fn duplicate_ref(&self, store: impl AsContextMut, engine_ref: i32) -> Result<i32> {
        self.fx_duplicate_ref.call(store, engine_ref)
    }

    pub fn remove_ref(&self, store: impl AsContextMut, engine_ref: i32) -> Result<()> {
        self.fx_remove_ref.call(store, engine_ref)
    }

    pub fn invoke_export(&self, mut store: impl AsContextMut, call: &ExportCall<'_>) -> Result<ExportReply> {
        let args = memory::write_guest(&mut store, self, call.args)?;
        let out = memory::alloc_out_slot(&mut store, self)?;
        let (game_time, profiling) = meta_args(call.meta);

        let result = self.fx_invoke_export.call(
            &mut store,
            (
                call.private_id as i64,
                call.binding as i64,
                args.ptr,
                args.len,
                out.ptr,
                call.async_id.0 as i64,
                game_time,
                profiling,
            ),
        );
        memory::release(&mut store, self, args)?;
        let code = result?;

        let bytes = memory::take_out_record(&mut store, self, out)?;
        memory::release(&mut store, self, out)?;

        Ok(match CallStatus::from_guest(code) {
            CallStatus::Ok => ExportReply::Ready(Payload::from(bytes)),
            CallStatus::Pending => ExportReply::Pending,
            status => ExportReply::Failed {
                status,
                diagnostic: diagnostic_text(bytes),
            },
        })
    }

    pub fn async_result(
        &self,
        mut store: impl AsContextMut,
        async_id: AsyncResultId,
        result: &AsyncResult,
    ) -> Result<()> {
        let Some(ref fx_async_result) = self.fx_async_result else {
            return Err(BridgeError::Unavailable(Operation::AsyncResult).into());
        };

        let payload = memory::write_guest(&mut store, self, result.payload.as_bytes())?;
        let (game_time, profiling) = meta_args(CallMeta::new(result.game_time, result.profiling));
        let code = fx_async_result.call(
            &mut store,
            (
                async_id.0 as i64,
                i32::from(result.status.as_u8()),
                payload.ptr,
                payload.len,
                game_time,
                profiling,
            ),
        );
        memory::release(&mut store, self, payload)?;
        check_status(Operation::AsyncResult, abi::ASYNC_RESULT, code?)
    }

    pub fn memory_usage(&self, store: impl AsContextMut) -> Result<i64> {
        match self.fx_memory_usage {
            Some(ref memory_usage) => memory_usage.call(store, ()),
            None => Err(BridgeError::Unavailable(Operation::MemoryUsage).into()),
        }
    }

    pub fn start_profiling(&self, store: impl AsContextMut) -> Result<()> {
        match self.fx_start_profiling {
            Some(ref start) => start.call(store, ()),
            None => Err(BridgeError::Unavailable(Operation::StartProfiling).into()),
        }
    }

    pub fn stop_profiling(&self, store: impl AsContextMut) -> Result<()> {
        match self.fx_stop_profiling {
            Some(ref stop) => stop.call(store, ()),
            None => Err(BridgeError::Unavailable(Operation::StopProfiling).into()),
        }
    }
}

fn bindings_of(caller: &Caller<'_, DomainState>) -> Result<Bindings> {
    caller
        .data()
        .bindings()
        .cloned()
        .context("host function called before the module finished instantiating")
}

/// Add the `fx` host functions to the linker
pub(crate) fn add_host_imports(linker: &mut Linker<DomainState>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_SCHEDULE_TICK,
        |caller: Caller<'_, DomainState>, time_ms: i64| {
            let bridge = caller.data().bridge();
            // Failures are recorded by the scheduler and reported when the call returns
            if let Err(e) = bridge.schedule_tick(u64::try_from(time_ms).unwrap_or(0)) {
                debug!(target: "runtime::wasm", "schedule_tick({}) from {} failed: {}", time_ms, bridge.resource_name(), e);
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_REGISTER_EXPORT,
        |caller: Caller<'_, DomainState>,
         name_ptr: i32,
         name_len: i32,
         private_id: i64,
         binding: i64|
         -> Result<()> {
            let bindings = bindings_of(&caller)?;
            let name = memory::read_str(&caller, bindings.memory(), name_ptr, name_len)?;
            let bridge = caller.data().bridge();
            if let Err(e) = bridge.register_export(&name, private_id as u64, binding as u64) {
                warn!(target: "runtime::wasm", "Resource {} could not register export {}: {}", bridge.resource_name(), name, e);
            }
            Ok(())
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_DELIVER_ASYNC_RESULT,
        |caller: Caller<'_, DomainState>,
         async_id: i64,
         status: i32,
         ptr: i32,
         len: i32,
         game_time: i64,
         profiling: i32|
         -> Result<i32> {
            let bindings = bindings_of(&caller)?;
            let payload = memory::read_guest(&caller, bindings.memory(), ptr, len)?;
            let meta = CallMeta::new(u64::try_from(game_time).unwrap_or(0), profiling != 0);

            let delivered = caller.data().bridge().deliver_async_result(
                AsyncResultId(async_id as u64),
                CallStatus::from_guest(status),
                Payload::from(payload),
                meta,
            );
            Ok(match delivered {
                Ok(()) => CallStatus::Ok.as_u8() as i32,
                Err(e) => e.status().as_u8() as i32,
            })
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_EXPOSE_REF,
        |caller: Caller<'_, DomainState>, engine_ref: i32| -> i32 {
            let bridge = caller.data().bridge();
            match bridge.expose_ref(engine_ref) {
                Ok(handle) => handle.raw(),
                Err(e) => {
                    warn!(target: "runtime::wasm", "Resource {} could not expose ref {}: {}", bridge.resource_name(), engine_ref, e);
                    0
                }
            }
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_INVOKE_EXPORT,
        |mut caller: Caller<'_, DomainState>,
         resource_ptr: i32,
         resource_len: i32,
         export_ptr: i32,
         export_len: i32,
         args_ptr: i32,
         args_len: i32,
         out_ptr: i32|
         -> Result<i32> {
            let bindings = bindings_of(&caller)?;
            let bridge = caller.data().bridge().clone();
            let resource = memory::read_str(&caller, bindings.memory(), resource_ptr, resource_len)?;
            let export = memory::read_str(&caller, bindings.memory(), export_ptr, export_len)?;
            let args = memory::read_guest(&caller, bindings.memory(), args_ptr, args_len)?;

            let outcome = bridge.invoke_external_export(&resource, &export, &args, |call| {
                bindings.invoke_export(&mut caller, call)
            });

            let (status, bytes, async_id) = match outcome {
                Ok(ExportOutcome::Ready(payload)) => (CallStatus::Ok, payload.to_vec(), 0),
                Ok(ExportOutcome::Pending(pending)) => {
                    let async_id = pending.async_id().0;
                    // The result reaches the module through fx_async_result on its next tick
                    match bridge.await_result(pending) {
                        Ok(()) => (CallStatus::Pending, Vec::new(), async_id),
                        Err(e) => (e.status(), e.diagnostic().into_bytes(), 0),
                    }
                }
                Err(e) => {
                    debug!(target: "runtime::wasm", "invoke_export {}:{} from {} failed: {}", resource, export, bridge.resource_name(), e);
                    (e.status(), e.diagnostic().into_bytes(), 0)
                }
            };

            let GuestBuf { ptr, len } = memory::write_guest(&mut caller, &bindings, &bytes)?;
            let record = ExportRecord { ptr, len, async_id };
            let out = usize::try_from(out_ptr).context("invalid out record pointer")?;
            bindings
                .memory()
                .write(&mut caller, out, &record.encode())
                .context("out record is outside memory")?;

            Ok(status.as_u8() as i32)
        },
    )?;

    linker.func_wrap(
        HOST_MODULE,
        abi::IMPORT_LOG,
        |caller: Caller<'_, DomainState>, level: i32, ptr: i32, len: i32| -> Result<()> {
            let bindings = bindings_of(&caller)?;
            let bytes = memory::read_guest(&caller, bindings.memory(), ptr, len)?;
            caller.data().bridge().log(level, &String::from_utf8_lossy(&bytes));
            Ok(())
        },
    )?;

    Ok(())
}

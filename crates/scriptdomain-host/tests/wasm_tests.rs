// Integration tests running real script modules through wasmtime

use std::path::{Path, PathBuf};
use std::sync::Arc;

use scriptdomain_host::{
    BookmarkQueue, BridgeError, CallMeta, CallStatus, ContextCapabilities, DomainSession,
    Operation, RefHandle, RefRemoval, ResourceContext, WasmConfig, WasmRuntime,
};

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// The first reference a fresh session exposes
const FIRST_HANDLE: RefHandle = RefHandle(1);

fn start_guest() -> (DomainSession, Arc<BookmarkQueue>) {
    let runtime = WasmRuntime::new(WasmConfig::default()).unwrap();
    let factory = runtime.factory_from_file(&fixture("guest.wat")).unwrap();
    let bookmarks = Arc::new(BookmarkQueue::new());

    let session = DomainSession::create(
        ResourceContext::new("guest").with_path(fixture("guest.wat")),
        bookmarks.clone(),
        &factory,
    )
    .expect("guest module should initialize");
    (session, bookmarks)
}

/// A module exporting every required entry point as a stub
fn stub_module(tick: &str) -> String {
    format!(
        r#"(module
            (memory (export "memory") 1)
            (func (export "fx_alloc") (param i32) (result i32) (i32.const 1024))
            (func (export "fx_free") (param i32 i32))
            {tick}
            (func (export "fx_trigger_event") (param i32 i32 i32 i32 i32 i32 i64 i32) (result i32) (i32.const 0))
            (func (export "fx_call_ref") (param i32 i32 i32 i32 i64 i32) (result i32) (i32.const 0))
            (func (export "fx_duplicate_ref") (param i32) (result i32) (local.get 0))
            (func (export "fx_remove_ref") (param i32))
            (func (export "fx_invoke_export") (param i64 i64 i32 i32 i32 i64 i64 i32) (result i32) (i32.const 0))
        )"#
    )
}

#[test]
fn test_init_registers_exports_and_ref() {
    let (session, _) = start_guest();

    assert!(session.is_active());
    assert_eq!(
        session.exports(),
        vec!["awaitFetch", "fetchAsync", "getPlayerName", "lastResult", "reenter"]
    );
    assert_eq!(session.live_refs(), 1);
    assert_eq!(
        session.capabilities(),
        ContextCapabilities::MEMORY_USAGE | ContextCapabilities::ASYNC_RESULT
    );
}

#[test]
fn test_missing_required_export_fails_initialization() {
    let runtime = WasmRuntime::new(WasmConfig::default()).unwrap();
    let factory = runtime.factory_from_bytes(stub_module("")).unwrap();

    let session = DomainSession::new(ResourceContext::new("stub"), Arc::new(BookmarkQueue::new()));
    match session.initialize(&factory) {
        Err(BridgeError::Initialization(msg)) => assert!(msg.contains("fx_tick"), "{}", msg),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!session.is_active());
}

#[test]
fn test_tick_registers_earliest_request() {
    let (session, bookmarks) = start_guest();

    session.tick(CallMeta::at(1_000)).unwrap();

    assert_eq!(session.scheduled_tick(), Some(1_050));
    assert_eq!(bookmarks.wake_of(session.instance_id()), Some(1_050_000));
    assert!(bookmarks.due(1_049_999).is_empty());
    assert_eq!(bookmarks.due(1_050_000), vec![session.instance_id()]);
}

#[test]
fn test_trigger_event() {
    let (session, _) = start_guest();
    let meta = CallMeta::at(0);

    assert_eq!(session.trigger_event("chat", b"hello", "player:1", meta), Ok(true));
    assert_eq!(session.trigger_event("spawned", b"", "world", meta), Ok(false));
}

#[test]
fn test_call_ref_echoes_arguments() {
    let (session, _) = start_guest();
    let payload = session
        .call_ref(FIRST_HANDLE, b"hello, ref", CallMeta::at(0))
        .unwrap();
    assert_eq!(payload.as_bytes(), b"hello, ref");

    let empty = session.call_ref(FIRST_HANDLE, b"", CallMeta::at(0)).unwrap();
    assert!(empty.is_empty());
}

#[test]
fn test_guest_trap_is_call_error() {
    let (session, _) = start_guest();

    let err = session
        .call_ref(FIRST_HANDLE, b"trap", CallMeta::at(0))
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Call {
            operation: Operation::CallRef,
            status: CallStatus::CallError,
            ..
        }
    ));

    // The session survives the trap
    assert!(session.is_active());
    assert!(session.call_ref(FIRST_HANDLE, b"again!", CallMeta::at(1)).is_ok());
}

#[test]
fn test_guest_failure_diagnostic() {
    let (session, _) = start_guest();
    let err = session
        .call_ref(FIRST_HANDLE, b"fail!", CallMeta::at(0))
        .unwrap_err();

    assert_eq!(err.status(), CallStatus::CallError);
    assert_eq!(err.diagnostic(), "no such ref");
}

#[test]
fn test_duplicate_and_remove() {
    let (session, _) = start_guest();

    let duplicate = session.duplicate_ref(FIRST_HANDLE).unwrap();
    assert_eq!(session.remove_ref(FIRST_HANDLE), Ok(RefRemoval::Released));
    assert_eq!(
        session.call_ref(duplicate, b"still here", CallMeta::at(0)).unwrap().as_bytes(),
        b"still here"
    );

    session.remove_ref(duplicate).unwrap();
    assert_eq!(
        session.call_ref(duplicate, b"", CallMeta::at(0)),
        Err(BridgeError::InvalidReference(duplicate))
    );
}

#[test]
fn test_ready_export() {
    let (session, _) = start_guest();
    let outcome = session
        .invoke_external_export("guest", "getPlayerName", b"")
        .unwrap();
    assert_eq!(outcome.into_ready().unwrap().as_bytes(), b"player-one");
}

#[test]
fn test_async_export_completes_on_next_tick() {
    let (session, _) = start_guest();

    let mut pending = session
        .invoke_external_export("guest", "fetchAsync", b"")
        .unwrap()
        .into_pending()
        .unwrap();
    assert!(pending.try_result().is_none());
    assert_eq!(session.pending_async_calls(), 1);

    session.tick(CallMeta::at(20)).unwrap();

    let result = pending.try_result().unwrap().unwrap();
    assert_eq!(result.status, CallStatus::Ok);
    assert_eq!(result.payload.as_bytes(), b"player-one");
    assert_eq!(result.game_time, 20);
    assert_eq!(session.pending_async_calls(), 0);
}

#[test]
fn test_reentrant_export_from_guest() {
    let (session, _) = start_guest();
    let outcome = session.invoke_external_export("guest", "reenter", b"").unwrap();
    assert_eq!(outcome.into_ready().unwrap().as_bytes(), b"player-one");
    assert_eq!(session.pending_async_calls(), 0);
}

#[test]
fn test_guest_receives_result_of_export_it_awaits() {
    let (session, _) = start_guest();

    let started = session.invoke_external_export("guest", "awaitFetch", b"").unwrap();
    assert!(started.into_ready().unwrap().is_empty());
    assert_eq!(session.awaited_async_results(), 1);
    assert_eq!(session.pending_async_calls(), 1);

    // fetchAsync completes during this tick, after results were forwarded
    session.tick(CallMeta::at(10)).unwrap();
    assert_eq!(session.pending_async_calls(), 0);
    assert_eq!(session.awaited_async_results(), 1);

    session.tick(CallMeta::at(20)).unwrap();
    assert_eq!(session.awaited_async_results(), 0);

    let last = session.invoke_external_export("guest", "lastResult", b"").unwrap();
    assert_eq!(last.into_ready().unwrap().as_bytes(), b"player-one");
}

#[test]
fn test_unknown_export() {
    let (session, _) = start_guest();
    let err = session
        .invoke_external_export("guest", "missing", b"")
        .unwrap_err();
    assert_eq!(err.status(), CallStatus::ExportNotFound);
    assert_eq!(session.pending_async_calls(), 0);
}

#[test]
fn test_memory_usage_and_profiling() {
    let (session, _) = start_guest();
    assert_eq!(session.memory_usage(), Ok(65_536));
    assert_eq!(
        session.start_profiling(),
        Err(BridgeError::Unavailable(Operation::StartProfiling))
    );
}

#[test]
fn test_fuel_limits_runaway_ticks() {
    let config = WasmConfig {
        fuel_per_call: Some(100_000),
        ..WasmConfig::default()
    };
    let runtime = WasmRuntime::new(config).unwrap();
    let spin = r#"(func (export "fx_tick") (param i64 i32) (result i32)
        (loop $spin (br $spin))
        (i32.const 0))"#;
    let factory = runtime.factory_from_bytes(stub_module(spin)).unwrap();

    let session = DomainSession::create(
        ResourceContext::new("spinner"),
        Arc::new(BookmarkQueue::new()),
        &factory,
    )
    .unwrap();

    for time in [0, 1] {
        let err = session.tick(CallMeta::at(time)).unwrap_err();
        assert_eq!(err.status(), CallStatus::CallError);
    }
    assert!(session.is_active());
}

#[test]
fn test_stop_fails_pending_guest_calls() {
    let (session, bookmarks) = start_guest();
    session.tick(CallMeta::at(0)).unwrap();

    let mut pending = session
        .invoke_external_export("guest", "fetchAsync", b"")
        .unwrap()
        .into_pending()
        .unwrap();

    session.stop().unwrap();
    assert_eq!(pending.try_result(), Some(Err(BridgeError::SessionStopped)));
    assert_eq!(session.live_refs(), 0);
    assert!(matches!(
        session.tick(CallMeta::at(100)),
        Err(BridgeError::InvalidState { .. })
    ));
    // The queue is owned by the host; the session only stops registering
    assert_eq!(bookmarks.pending_count(), 1);
}

// Integration tests for the multi-resource host

use std::path::Path;
use std::sync::Arc;

use scriptdomain_host::{
    CallStatus, DomainHost, ResourceContext, RuntimeConfig, TickPolicy, WasmConfig, WasmRuntime,
};
use tempfile::TempDir;

const GUEST: &str = include_str!("fixtures/guest.wat");

/// Resource directory holding the test guest under several names
fn resource_dir(names: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(format!("{}.wat", name)), GUEST).unwrap();
    }
    dir
}

fn load(policy: TickPolicy, dir: &Path, config_text: &str) -> Arc<DomainHost> {
    let mut config = RuntimeConfig::from_toml_str(config_text).unwrap();
    config.tick_policy = policy;

    let host = DomainHost::from_config(&config);
    let runtime = WasmRuntime::new(config.wasm.clone()).unwrap();
    host.load_resources(&runtime, dir, &config);
    host
}

#[test]
fn test_load_resources_respects_config() {
    let dir = resource_dir(&["guest", "other", "disabled"]);
    let host = load(
        TickPolicy::Bookmarks,
        dir.path(),
        "[resources.disabled]\nenabled = false",
    );

    assert_eq!(host.resource_names(), vec!["guest", "other"]);
    let session = host.session("guest").unwrap();
    assert_eq!(
        session.resource().path(),
        Some(dir.path().join("guest.wat").as_path())
    );
}

#[test]
fn test_bookmark_policy_ticks_only_due_sessions() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::Bookmarks, dir.path(), "");

    // Nothing has asked to run yet
    assert_eq!(host.frame(0), 0);

    host.session("guest").unwrap().schedule_tick(10).unwrap();
    assert_eq!(host.next_wake_ms(), Some(10));
    assert_eq!(host.frame(5), 0);
    assert_eq!(host.frame(10), 1);

    // The guest asked for time + 50 during its tick
    assert_eq!(host.next_wake_ms(), Some(60));
    assert_eq!(host.frame(59), 0);
    assert_eq!(host.frame(60), 1);
}

#[test]
fn test_every_frame_policy_ticks_everything() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::EveryFrame, dir.path(), "");

    assert_eq!(host.frame(0), 2);
    assert_eq!(host.frame(16), 2);
}

#[test]
fn test_broadcast_event() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::Bookmarks, dir.path(), "");

    assert_eq!(host.trigger_event("chat", b"hi", "player:1", 0), 2);
    assert_eq!(host.trigger_event("spawned", b"", "world", 0), 0);
}

#[test]
fn test_cross_resource_export_is_routed() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::Bookmarks, dir.path(), "");

    // other:reenter calls guest:getPlayerName through the host
    let outcome = host.invoke_export("other", "reenter", b"").unwrap();
    assert_eq!(outcome.into_ready().unwrap().as_bytes(), b"player-one");

    assert!(host.stop_resource("guest").unwrap());
    let err = host.invoke_export("other", "reenter", b"").unwrap_err();
    assert_eq!(err.status(), CallStatus::ExportNotFound);
}

#[test]
fn test_awaited_export_result_reaches_the_caller() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::EveryFrame, dir.path(), "");
    let other = host.session("other").unwrap();

    // other:awaitFetch starts guest:fetchAsync and waits for it
    let started = host.invoke_export("other", "awaitFetch", b"").unwrap();
    assert!(started.into_ready().unwrap().is_empty());
    assert_eq!(other.awaited_async_results(), 1);
    assert_eq!(host.session("guest").unwrap().pending_async_calls(), 1);

    // guest ticks first and delivers, then other receives it
    assert_eq!(host.frame(0), 2);
    assert_eq!(other.awaited_async_results(), 0);

    let last = host.invoke_export("other", "lastResult", b"").unwrap();
    assert_eq!(last.into_ready().unwrap().as_bytes(), b"player-one");
}

#[test]
fn test_awaited_export_fails_when_callee_stops() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::EveryFrame, dir.path(), "");

    host.invoke_export("other", "awaitFetch", b"").unwrap();
    assert!(host.stop_resource("guest").unwrap());
    assert_eq!(host.frame(0), 1);

    let last = host.invoke_export("other", "lastResult", b"").unwrap();
    assert_eq!(last.into_ready().unwrap().as_bytes(), b"session stopped");
}

#[test]
fn test_unknown_resource() {
    let host = DomainHost::new(TickPolicy::Bookmarks, false);
    let err = host.invoke_export("nobody", "anything", b"").unwrap_err();
    assert_eq!(err.status(), CallStatus::ExportNotFound);
    assert!(!host.stop_resource("nobody").unwrap());
}

#[test]
fn test_memory_usage_per_resource() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::Bookmarks, dir.path(), "");

    assert_eq!(
        host.memory_usage(),
        vec![("guest".to_string(), 65_536), ("other".to_string(), 65_536)]
    );
}

#[test]
fn test_restart_replaces_session() {
    let host = DomainHost::new(TickPolicy::Bookmarks, false);
    let runtime = WasmRuntime::new(WasmConfig::default()).unwrap();
    let factory = runtime.factory_from_bytes(GUEST).unwrap();

    let first = host
        .start_resource(ResourceContext::new("guest"), &factory)
        .unwrap();
    first.schedule_tick(100).unwrap();

    let second = host
        .start_resource(ResourceContext::new("guest"), &factory)
        .unwrap();

    assert!(!first.is_active());
    assert!(second.is_active());
    assert_ne!(first.instance_id(), second.instance_id());
    assert_eq!(host.len(), 1);
    // The stopped session's bookmark is gone with it
    assert_eq!(host.bookmarks().wake_of(first.instance_id()), None);
}

#[test]
fn test_stop_all() {
    let dir = resource_dir(&["guest", "other"]);
    let host = load(TickPolicy::Bookmarks, dir.path(), "");
    let guest = host.session("guest").unwrap();

    host.stop_all();
    assert!(host.is_empty());
    assert!(!guest.is_active());
}

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{RuntimeConfig, TickPolicy};
use crate::context::{ContextFactory, ExportRouter};
use crate::error::BridgeError;
use crate::marshal::{CallMeta, Operation};
use crate::pending::ExportOutcome;
use crate::scheduler::{BookmarkHost, BookmarkQueue, MICROS_PER_MILLI};
use crate::session::{DomainSession, ResourceContext};
use crate::wasm::WasmRuntime;

/// Owns one session per started resource and drives them
///
/// No lock on the session map is held while a session runs, so scripts may
/// call into other resources through the host.
pub struct DomainHost {
    bookmarks: Arc<BookmarkQueue>,
    sessions: RwLock<HashMap<String, Arc<DomainSession>>>,
    policy: TickPolicy,
    profiling: bool,
    this: Weak<DomainHost>,
}

impl DomainHost {
    pub fn new(policy: TickPolicy, profiling: bool) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            bookmarks: Arc::new(BookmarkQueue::new()),
            sessions: RwLock::new(HashMap::new()),
            policy,
            profiling,
            this: this.clone(),
        })
    }

    pub fn from_config(config: &RuntimeConfig) -> Arc<Self> {
        Self::new(config.tick_policy, config.profiling)
    }

    pub fn policy(&self) -> TickPolicy {
        self.policy
    }

    pub fn bookmarks(&self) -> &Arc<BookmarkQueue> {
        &self.bookmarks
    }

    /// Start a session for `resource`, replacing any running one of the same name
    pub fn start_resource(
        &self,
        resource: ResourceContext,
        factory: &dyn ContextFactory,
    ) -> Result<Arc<DomainSession>, BridgeError> {
        let name = resource.name().to_string();
        if self.stop_resource(&name)? {
            info!(target: "runtime", "Restarting resource {}", name);
        }

        let bookmarks: Arc<dyn BookmarkHost> = self.bookmarks.clone();
        let session = DomainSession::new(resource, bookmarks);
        let router: Weak<dyn ExportRouter> = self.this.clone();
        session.set_export_router(router);
        session.initialize(factory)?;

        if self.profiling {
            match session.start_profiling() {
                Ok(()) | Err(BridgeError::Unavailable(_)) => {}
                Err(e) => warn!(target: "runtime", "Could not start profiling {}: {}", name, e),
            }
        }

        let session = Arc::new(session);
        self.sessions.write().insert(name, session.clone());
        Ok(session)
    }

    /// Stop and forget a resource's session. Returns whether one was running.
    pub fn stop_resource(&self, name: &str) -> Result<bool, BridgeError> {
        let Some(session) = self.sessions.write().remove(name) else {
            return Ok(false);
        };

        self.bookmarks.cancel(session.instance_id());
        session.stop()?;
        Ok(true)
    }

    /// Start every enabled module found in `dir`, returning how many started
    pub fn load_resources(&self, runtime: &WasmRuntime, dir: &Path, config: &RuntimeConfig) -> usize {
        debug!(target: "runtime", "Loading resources from {}", dir.display());

        let mut started = 0;
        for (resource, factory) in runtime.load_dir(dir, config) {
            let name = resource.name().to_string();
            match self.start_resource(resource, &factory) {
                Ok(_) => started += 1,
                Err(e) => error!(target: "runtime", "Failed to start resource {}: {}", name, e),
            }
        }

        if started > 0 {
            info!(target: "runtime", "Started {} resource(s)", started);
        }
        started
    }

    pub fn session(&self, name: &str) -> Option<Arc<DomainSession>> {
        self.sessions.read().get(name).cloned()
    }

    pub fn resource_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest outstanding bookmark in milliseconds
    pub fn next_wake_ms(&self) -> Option<u64> {
        self.bookmarks
            .next_wake()
            .map(|us| u64::try_from(us).unwrap_or(0) / MICROS_PER_MILLI)
    }

    fn snapshot(&self) -> Vec<Arc<DomainSession>> {
        let mut sessions: Vec<_> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.resource().name().cmp(b.resource().name()));
        sessions
    }

    /// Run one host frame at `now_ms`, returning how many sessions were ticked
    pub fn frame(&self, now_ms: u64) -> usize {
        let sessions = match self.policy {
            TickPolicy::EveryFrame => self.snapshot(),
            TickPolicy::Bookmarks => {
                let now_us = now_ms
                    .checked_mul(MICROS_PER_MILLI)
                    .and_then(|us| i64::try_from(us).ok())
                    .unwrap_or(i64::MAX);
                let due = self.bookmarks.due(now_us);
                if due.is_empty() {
                    return 0;
                }
                self.snapshot()
                    .into_iter()
                    .filter(|session| due.contains(&session.instance_id()))
                    .collect()
            }
        };

        let mut ticked = 0;
        for session in sessions {
            let meta = CallMeta::new(now_ms, session.is_profiling());
            match session.tick(meta) {
                Ok(()) => ticked += 1,
                Err(e) => error!(
                    target: "runtime",
                    "Tick failed for {} ({}): {}",
                    session.resource().name(),
                    session.name(),
                    e
                ),
            }
        }
        ticked
    }

    /// Deliver an event to every session, returning how many handled it
    pub fn trigger_event(&self, name: &str, args: &[u8], source: &str, now_ms: u64) -> usize {
        let mut handled = 0;
        for session in self.snapshot() {
            let meta = CallMeta::new(now_ms, session.is_profiling());
            match session.trigger_event(name, args, source, meta) {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) => error!(
                    target: "runtime",
                    "Event {} failed in {}: {}",
                    name,
                    session.resource().name(),
                    e
                ),
            }
        }
        handled
    }

    /// Invoke an export of a running resource
    pub fn invoke_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError> {
        let session = self
            .session(resource)
            .ok_or_else(|| BridgeError::ExportNotFound {
                resource: resource.to_string(),
                export: export.to_string(),
            })?;
        session.invoke_external_export(resource, export, args)
    }

    /// Memory usage per resource, for those whose runtime reports it
    pub fn memory_usage(&self) -> Vec<(String, i64)> {
        self.snapshot()
            .into_iter()
            .filter_map(|session| match session.memory_usage() {
                Ok(bytes) => Some((session.resource().name().to_string(), bytes)),
                Err(BridgeError::Unavailable(Operation::MemoryUsage)) => None,
                Err(e) => {
                    warn!(target: "runtime", "Memory usage of {} failed: {}", session.resource().name(), e);
                    None
                }
            })
            .collect()
    }

    /// Stop every session
    pub fn stop_all(&self) {
        let sessions: Vec<_> = self.sessions.write().drain().collect();
        for (name, session) in sessions {
            self.bookmarks.cancel(session.instance_id());
            if let Err(e) = session.stop() {
                warn!(target: "runtime", "Failed to stop {}: {}", name, e);
            }
        }
    }
}

impl ExportRouter for DomainHost {
    fn route_export(
        &self,
        resource: &str,
        export: &str,
        args: &[u8],
    ) -> Result<ExportOutcome, BridgeError> {
        self.invoke_export(resource, export, args)
    }
}

impl Drop for DomainHost {
    fn drop(&mut self) {
        self.stop_all();
    }
}

//! Backend selection with a cached view of isolation-runtime availability.
//!
//! The container runtime is probed at most once per refresh interval. Callers
//! that arrive while a probe is in flight wait for it instead of probing
//! again. A launch failure invalidates the cached verdict so the next call
//! probes afresh.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use super::{BackendKind, SandboxBackend};
use crate::config::SelectorConfig;
use crate::errors::EngineError;

/// Backend chosen for one call.
#[derive(Clone)]
pub struct Selection {
    pub backend: Arc<dyn SandboxBackend>,
    /// Set when the call runs without container isolation.
    pub degraded: bool,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("backend", &self.backend.kind())
            .field("degraded", &self.degraded)
            .finish()
    }
}

/// Point-in-time availability of both backends.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReport {
    pub container_available: bool,
    pub local_available: bool,
    pub selected: Option<BackendKind>,
    pub degraded_isolation: bool,
}

#[derive(Debug, Clone, Copy)]
struct ProbeRecord {
    available: bool,
    probed_at: Instant,
}

pub struct BackendSelector {
    primary: Option<Arc<dyn SandboxBackend>>,
    fallback: Option<Arc<dyn SandboxBackend>>,
    cache: RwLock<Option<ProbeRecord>>,
    probe_lock: Mutex<()>,
    refresh_interval: Duration,
    probe_timeout: Duration,
    probes: AtomicU64,
}

impl BackendSelector {
    pub fn new(
        primary: Option<Arc<dyn SandboxBackend>>,
        fallback: Option<Arc<dyn SandboxBackend>>,
        config: &SelectorConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache: RwLock::new(None),
            probe_lock: Mutex::new(()),
            refresh_interval: Duration::from_secs(config.probe_interval_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            probes: AtomicU64::new(0),
        }
    }

    /// Pick the container backend when its runtime is reachable, the local
    /// executor otherwise.
    pub async fn select(&self) -> Result<Selection, EngineError> {
        if let Some(primary) = &self.primary {
            if self.primary_available(primary).await {
                return Ok(Selection {
                    backend: Arc::clone(primary),
                    degraded: false,
                });
            }
        }

        if let Some(fallback) = &self.fallback {
            if fallback.is_available().await {
                log::warn!("Container runtime unavailable; running with degraded isolation on the local restricted executor");
                return Ok(Selection {
                    backend: Arc::clone(fallback),
                    degraded: true,
                });
            }
        }

        Err(EngineError::BackendUnavailable(
            "neither the container runtime nor a local interpreter is available".to_string(),
        ))
    }

    /// Drop the cached verdict. The next `select` probes the runtime again.
    pub fn invalidate(&self) {
        if self.write_cache().take().is_some() {
            log::info!("Container runtime availability cache invalidated");
        }
    }

    /// Cached verdict, if one is present and still fresh.
    pub fn cached_availability(&self) -> Option<bool> {
        self.read_cache()
            .filter(|record| record.probed_at.elapsed() < self.refresh_interval)
            .map(|record| record.available)
    }

    /// Number of runtime probes issued so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Re-probe both backends, bypassing the cache.
    pub async fn report(&self) -> BackendReport {
        self.invalidate();
        let container_available = match &self.primary {
            Some(primary) => self.primary_available(primary).await,
            None => false,
        };
        let local_available = match &self.fallback {
            Some(fallback) => fallback.is_available().await,
            None => false,
        };
        let selected = if container_available {
            Some(BackendKind::Container)
        } else if local_available {
            Some(BackendKind::LocalRestricted)
        } else {
            None
        };
        BackendReport {
            container_available,
            local_available,
            degraded_isolation: selected.map(|kind| kind.is_degraded()).unwrap_or(false),
            selected,
        }
    }

    async fn primary_available(&self, primary: &Arc<dyn SandboxBackend>) -> bool {
        if let Some(available) = self.cached_availability() {
            return available;
        }

        let _probe = self.probe_lock.lock().await;
        // Another caller may have finished a probe while we waited.
        if let Some(available) = self.cached_availability() {
            return available;
        }

        self.probes.fetch_add(1, Ordering::Relaxed);
        let available = match tokio::time::timeout(self.probe_timeout, primary.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                log::warn!(
                    "Container runtime probe timed out after {:?}",
                    self.probe_timeout
                );
                false
            }
        };
        log::debug!("Container runtime probe: available={}", available);

        *self.write_cache() = Some(ProbeRecord {
            available,
            probed_at: Instant::now(),
        });
        available
    }

    fn read_cache(&self) -> Option<ProbeRecord> {
        let guard: RwLockReadGuard<'_, Option<ProbeRecord>> = match self.cache.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Option<ProbeRecord>> {
        match self.cache.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

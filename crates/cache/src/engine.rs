//! Composition root for the cache engine
//!
//! The application creates one [`CacheEngine`] at startup and hands out the
//! registry and optimizer handles to the subsystems that own caches. There is
//! no global instance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pdf_reader_scheduler::IntervalScheduler;

use crate::config::GlobalConfig;
use crate::optimizer::MemoryOptimizer;
use crate::policy::EvictionPolicy;
use crate::registry::CacheRegistry;
use crate::system::{OsMemoryProbe, SystemMemoryProbe};

/// One scheduler, one registry and one optimizer wired together
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pdf_reader_cache::{CacheEngine, CacheKind, GlobalConfig, PageTextCache};
///
/// let engine = CacheEngine::new(GlobalConfig::default());
/// engine.start();
///
/// let text = Arc::new(PageTextCache::new(4 * 1024 * 1024).with_policy(engine.policy().clone()));
/// engine.registry().register(CacheKind::PageText, &text).unwrap();
/// text.put("report.pdf", 0, "Quarterly results");
///
/// engine.registry().unregister(CacheKind::PageText);
/// engine.shutdown();
/// ```
pub struct CacheEngine {
    scheduler: Arc<IntervalScheduler>,
    registry: Arc<CacheRegistry>,
    optimizer: Arc<MemoryOptimizer>,
    started: AtomicBool,
}

impl CacheEngine {
    /// Engine reading system memory from the operating system
    pub fn new(config: GlobalConfig) -> Self {
        Self::with_parts(config, Arc::new(EvictionPolicy::new()), Arc::new(OsMemoryProbe))
    }

    /// Engine with a caller-supplied policy and memory probe
    pub fn with_parts(
        config: GlobalConfig,
        policy: Arc<EvictionPolicy>,
        probe: Arc<dyn SystemMemoryProbe>,
    ) -> Self {
        let registry = Arc::new(CacheRegistry::new(config).with_policy(policy).with_probe(probe));
        let optimizer = Arc::new(MemoryOptimizer::new(registry.clone()));
        Self {
            scheduler: Arc::new(IntervalScheduler::start("cache-maintenance")),
            registry,
            optimizer,
            started: AtomicBool::new(false),
        }
    }

    /// Arm the periodic loops and connect the optimizer to registry events
    ///
    /// Calling this more than once has no further effect.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.optimizer.attach();
        self.registry.start_timers(&self.scheduler);
        self.optimizer.start_timers(&self.scheduler);
        tracing::info!("cache engine started");
    }

    /// Stop every loop and disconnect the optimizer
    ///
    /// Idempotent and callable from any thread.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.optimizer.stop_timers();
        self.optimizer.detach();
        self.registry.stop_all_timers();
        tracing::info!("cache engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn optimizer(&self) -> &Arc<MemoryOptimizer> {
        &self.optimizer
    }

    pub fn policy(&self) -> &Arc<EvictionPolicy> {
        self.registry.policy()
    }

    pub fn scheduler(&self) -> &Arc<IntervalScheduler> {
        &self.scheduler
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        self.shutdown();
        self.scheduler.stop();
    }
}

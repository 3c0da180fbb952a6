use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::engine::{Engine, EngineOptions};
use crate::limits::*;
use crate::model::Ms;
use crate::notify::NotifyHub;
use crate::pricing::AddOnPolicy;
use crate::reaper;

/// Per-storefront engine settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorefrontOptions {
    pub compact_threshold: u64,
    /// `None` disables pending expiry.
    pub pending_ttl_ms: Option<Ms>,
    pub add_on_policy: AddOnPolicy,
}

impl Default for StorefrontOptions {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            pending_ttl_ms: Some(30 * 60 * 1000),
            add_on_policy: AddOnPolicy::Drop,
        }
    }
}

/// One engine per storefront, keyed by the pgwire database name.
/// Each storefront gets its own WAL file, reaper and compactor.
pub struct StorefrontManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    options: StorefrontOptions,
}

impl StorefrontManager {
    pub fn new(data_dir: PathBuf, options: StorefrontOptions) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            options,
        }
    }

    /// Get or lazily open the engine for `storefront`.
    pub fn get_or_create(&self, storefront: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(storefront) {
            return Ok(engine.value().clone());
        }
        if storefront.len() > MAX_STOREFRONT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "storefront name too long",
            ));
        }

        // Keep the WAL inside data_dir whatever the client sends.
        let safe_name: String = storefront
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty storefront name",
            ));
        }

        if self.engines.len() >= MAX_STOREFRONTS {
            return Err(std::io::Error::other("too many storefronts"));
        }

        // The shard lock serializes creation per name, so two first
        // connections share one engine.
        let slot = match self.engines.entry(storefront.to_string()) {
            Entry::Occupied(existing) => return Ok(existing.get().clone()),
            Entry::Vacant(slot) => slot,
        };

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine_options = EngineOptions {
            add_on_policy: self.options.add_on_policy,
            ..Default::default()
        };
        let engine = Arc::new(Engine::with_options(wal_path, Arc::new(NotifyHub::new()), engine_options)?);

        if let Some(ttl_ms) = self.options.pending_ttl_ms {
            let reaper_engine = engine.clone();
            tokio::spawn(async move {
                reaper::run_reaper(reaper_engine, ttl_ms).await;
            });
        }
        let compactor_engine = engine.clone();
        let threshold = self.options.compact_threshold;
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, threshold).await;
        });

        drop(slot.insert(engine.clone()));
        metrics::gauge!(crate::observability::STOREFRONTS_ACTIVE).set(self.engines.len() as f64);
        info!("storefront {storefront} opened");
        Ok(engine)
    }

    pub fn storefront_count(&self) -> usize {
        self.engines.len()
    }
}

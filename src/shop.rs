use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotificationDispatcher;
use crate::observability;
use crate::policy::{Clock, Policy};
use crate::sweeper;

/// Per-shop knobs shared by every shop of one server.
#[derive(Debug, Clone)]
pub struct ShopSettings {
    pub policy: Policy,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub cache_ttl: Duration,
}

impl Default for ShopSettings {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Lazily opened shops. Each one gets its own engine, WAL file, sweeper and compactor.
/// Shop = database name from the pgwire connection.
pub struct ShopRegistry {
    engines: DashMap<String, Arc<Engine>>,
    /// Serializes first-time opens so one shop never gets two engines.
    opening: Mutex<()>,
    data_dir: PathBuf,
    settings: ShopSettings,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn NotificationDispatcher>,
}

impl ShopRegistry {
    pub fn new(
        data_dir: PathBuf,
        settings: ShopSettings,
        clock: Arc<dyn Clock>,
        dispatcher: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            opening: Mutex::new(()),
            data_dir,
            settings,
            clock,
            dispatcher,
        }
    }

    pub async fn get_or_create(&self, shop: &str) -> io::Result<Arc<Engine>> {
        if shop.len() > MAX_SHOP_NAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "shop name too long"));
        }
        // Engines are keyed by the WAL file name, so names that sanitize alike share one.
        let safe_name = wal_stem(shop);
        if safe_name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty shop name"));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }

        let _opening = self.opening.lock().await;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_SHOPS {
            return Err(io::Error::other("too many shops"));
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(
            &wal_path,
            self.settings.policy.clone(),
            self.settings.cache_ttl,
            self.clock.clone(),
            self.dispatcher.clone(),
        )?);
        engine.seed_catalog().await.map_err(io::Error::other)?;

        tokio::spawn(sweeper::run_sweeper(engine.clone(), self.settings.sweep_interval));
        tokio::spawn(sweeper::run_compactor(engine.clone(), self.settings.compact_threshold));

        self.engines.insert(safe_name.clone(), engine.clone());
        metrics::gauge!(observability::SHOPS_ACTIVE).set(self.engines.len() as f64);
        info!(shop = %safe_name, "shop opened");
        Ok(engine)
    }
}

/// Keep the name usable as a file name.
fn wal_stem(shop: &str) -> String {
    shop.chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

//! Multi-database store routing.
//!
//! Deployments that spread tenants across several databases operate over a
//! set of logical store keys. A discovery source yields the current set;
//! the provider materializes one store instance per key through an async
//! factory (which runs that store's schema migration exactly once),
//! disposes instances whose keys disappear, and hands out stores
//! round-robin so every database makes fair progress. A readiness gate
//! holds startup until the first discovery succeeded and every discovered
//! store migrated, so handlers never observe an unmigrated schema.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::service::{idle, Service};

/// Yields the current set of logical store keys.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    async fn current(&self) -> Result<Vec<String>>;
}

/// A fixed key list; the common single-fleet deployment.
pub struct StaticDiscovery {
    keys: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DiscoverySource for StaticDiscovery {
    async fn current(&self) -> Result<Vec<String>> {
        Ok(self.keys.clone())
    }
}

type FactoryFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type StoreFactory<T> = Box<dyn Fn(String) -> FactoryFuture<T> + Send + Sync>;

/// Cadence for the provider refresh loop.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub refresh_interval: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Key → store map with round-robin selection and a readiness gate.
pub struct StoreProvider<T> {
    discovery: Arc<dyn DiscoverySource>,
    factory: StoreFactory<T>,
    stores: RwLock<HashMap<String, Arc<T>>>,
    /// Key order for fair round-robin; tracks discovery order.
    order: RwLock<Vec<String>>,
    cursor: AtomicUsize,
    ready: watch::Sender<bool>,
}

impl<T: Send + Sync + 'static> StoreProvider<T> {
    /// `factory` builds (and migrates) the store for one key. It runs once
    /// per key per appearance; a key that leaves and returns is rebuilt.
    pub fn new<F, Fut>(discovery: Arc<dyn DiscoverySource>, factory: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (ready, _) = watch::channel(false);
        Self {
            discovery,
            factory: Box::new(move |key| Box::pin(factory(key))),
            stores: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            ready,
        }
    }

    /// Re-runs discovery and reconciles the store map: new keys are
    /// materialized through the factory, removed keys are disposed. The
    /// readiness gate opens after the first fully successful pass.
    pub async fn refresh(&self) -> Result<()> {
        let discovered = self
            .discovery
            .current()
            .await
            .context("store discovery failed")?;

        let mut keys = Vec::with_capacity(discovered.len());
        for key in discovered {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        // Build instances for new keys before touching the live map so a
        // failed migration leaves the previous generation intact. No map
        // lock is held across the factory's I/O.
        let missing: Vec<String> = {
            let stores = self.stores.read().await;
            keys.iter()
                .filter(|key| !stores.contains_key(*key))
                .cloned()
                .collect()
        };
        let mut created: Vec<(String, Arc<T>)> = Vec::with_capacity(missing.len());
        for key in missing {
            let store = (self.factory)(key.clone())
                .await
                .with_context(|| format!("failed to materialize store `{key}`"))?;
            created.push((key, Arc::new(store)));
        }

        {
            let mut stores = self.stores.write().await;
            let removed: Vec<String> = stores
                .keys()
                .filter(|key| !keys.contains(key))
                .cloned()
                .collect();
            for key in removed {
                stores.remove(&key);
                info!(store = %key, "disposed store for removed key");
            }
            for (key, store) in created {
                info!(store = %key, "materialized store");
                stores.insert(key, store);
            }
        }
        *self.order.write().await = keys;

        let _ = self.ready.send(true);
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        self.stores.read().await.get(key).cloned()
    }

    /// Picks the next store round-robin. `None` until discovery yields a
    /// non-empty set.
    pub async fn select(&self) -> Option<(String, Arc<T>)> {
        let order = self.order.read().await;
        if order.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % order.len();
        let key = order[index].clone();
        drop(order);
        let store = self.get(&key).await?;
        Some((key, store))
    }

    pub async fn keys(&self) -> Vec<String> {
        self.order.read().await.clone()
    }

    /// Resolves true once the first refresh fully succeeded; false if
    /// cancelled first.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.ready.subscribe();
        loop {
            if *rx.borrow() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

/// Background loop re-running discovery on an interval.
pub struct ProviderRefresh<T> {
    provider: Arc<StoreProvider<T>>,
    config: ProviderConfig,
}

impl<T: Send + Sync + 'static> ProviderRefresh<T> {
    pub fn new(provider: Arc<StoreProvider<T>>, config: ProviderConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> Service for ProviderRefresh<T> {
    fn name(&self) -> &str {
        "store-provider-refresh"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        // Refresh immediately so readiness does not wait a full interval.
        if let Err(e) = self.provider.refresh().await {
            warn!(error = %e, "initial store discovery failed");
        }
        while idle(&shutdown, self.config.refresh_interval).await {
            if let Err(e) = self.provider.refresh().await {
                warn!(error = %e, "store discovery refresh failed");
            }
        }
        Ok(())
    }
}

// src/watcher/manager.rs
// Aggregates watchers by name (spec §4.9). Grounded on the teacher's
// watcher/registry.rs WatchRegistry: a reader-preferring mutex over a name
// keyed map, mirroring the teacher's debouncer-by-path registration.

use super::{HealthProbe, Status, Watcher, WatcherCallbacks};
use crate::config::WatcherConfig;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Aggregates named watchers and tears them all down together.
#[derive(Default)]
pub struct WatcherManager {
    watchers: RwLock<HashMap<String, Arc<Watcher>>>,
}

impl WatcherManager {
    pub fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
        }
    }

    pub fn watch<P, C>(&self, name: impl Into<String>, probe: P, config: WatcherConfig, callbacks: C) -> Arc<Watcher>
    where
        P: HealthProbe + 'static,
        C: WatcherCallbacks,
    {
        let name = name.into();
        let watcher = Watcher::watch(name.clone(), probe, config, callbacks);
        self.watchers.write().insert(name, watcher.clone());
        watcher
    }

    pub fn status(&self) -> HashMap<String, Status> {
        self.watchers
            .read()
            .iter()
            .map(|(name, watcher)| (name.clone(), watcher.status()))
            .collect()
    }

    pub async fn stop(&self) {
        let watchers: Vec<Arc<Watcher>> = self.watchers.write().drain().map(|(_, w)| w).collect();
        for watcher in &watchers {
            watcher.stop();
        }
        for watcher in &watchers {
            watcher.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl HealthProbe for AlwaysOk {
        async fn probe(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            max_startup_attempts: 2,
            poll_interval_ms: 10,
            probe_timeout_ms: 200,
        }
    }

    #[tokio::test]
    async fn aggregates_status_by_name() {
        let manager = WatcherManager::new();
        manager.watch("db", AlwaysOk, fast_config(), ());
        manager.watch("llm", AlwaysOk, fast_config(), ());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = manager.status();
        assert_eq!(status.len(), 2);
        assert!(status.contains_key("db"));
        assert!(status.contains_key("llm"));

        manager.stop().await;
    }
}

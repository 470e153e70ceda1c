//! Island model and the listing registry.
//!
//! The registry deduplicates islands by identity across poll cycles and
//! reports which ones were seen for the first time. Entries are replaced
//! wholesale on every re-registration and never removed.

use crate::sources::{IslandSource, SourceError};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// A single marketplace listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Island {
    /// Provider-qualified unique ID, e.g. `turnip.exchange:abc123`.
    pub id: String,
    pub name: String,
    pub turnip_price: i64,
    /// Current visitors in the queue, -1 when unknown.
    pub in_queue: i64,
    pub max_queue: i64,
    pub fee: i64,
    pub islander: String,
    pub category: String,
    pub created_at: String,
    pub description: String,
    pub url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("island is missing required field: {0}")]
    MissingField(&'static str),
}

impl Island {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if self.url.is_empty() {
            return Err(ValidationError::MissingField("url"));
        }
        Ok(())
    }
}

/// Thread-safe store of every island seen since startup, keyed by id,
/// plus the sources that feed it.
#[derive(Clone)]
pub struct IslandRegistry {
    islands: Arc<DashMap<String, Island>>,
    sources: Arc<Mutex<Vec<Box<dyn IslandSource>>>>,
}

impl IslandRegistry {
    pub fn new() -> Self {
        Self {
            islands: Arc::new(DashMap::new()),
            sources: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn add_source(&self, source: Box<dyn IslandSource>) {
        info!(source = source.name(), "registered island source");
        self.sources.lock().await.push(source);
    }

    /// Register an island, replacing any previous entry with the same id.
    pub fn add_island(&self, island: Island) -> Result<(), ValidationError> {
        self.insert(island).map(|_| ())
    }

    /// Returns true when the id was not present before this call.
    fn insert(&self, island: Island) -> Result<bool, ValidationError> {
        island.validate()?;
        Ok(self.islands.insert(island.id.clone(), island).is_none())
    }

    pub fn get(&self, id: &str) -> Option<Island> {
        self.islands.get(id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.islands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.islands.is_empty()
    }

    /// Run every source in order and return the islands not seen before.
    ///
    /// A failing source contributes nothing this cycle; the remaining
    /// sources still run.
    pub async fn poll_sources(&self) -> Vec<Island> {
        let mut new_islands = Vec::new();
        let mut sources = self.sources.lock().await;

        for source in sources.iter_mut() {
            let islands = match source.run().await {
                Ok(islands) => islands,
                Err(SourceError::Transient(reason)) => {
                    info!(source = source.name(), reason = %reason, "source asked us to try later");
                    continue;
                }
                Err(SourceError::Fatal(reason)) => {
                    error!(source = source.name(), error = %reason, "source poll failed");
                    continue;
                }
            };

            let fetched = islands.len();
            for island in islands {
                let (name, url) = (island.name.clone(), island.url.clone());
                match self.insert(island.clone()) {
                    Ok(true) => new_islands.push(island),
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            source = source.name(),
                            name = %name,
                            url = %url,
                            error = %e,
                            "skipping invalid island"
                        );
                    }
                }
            }

            debug!(source = source.name(), fetched, "polled source");
        }

        new_islands
    }
}

impl Default for IslandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;

    pub(crate) fn island(id: &str, price: i64) -> Island {
        Island {
            id: id.to_string(),
            name: format!("island {id}"),
            turnip_price: price,
            in_queue: 2,
            max_queue: 10,
            fee: 0,
            islander: "neither".to_string(),
            category: "turnips".to_string(),
            created_at: "2020-04-20 12:00:00".to_string(),
            description: "bring bells".to_string(),
            url: format!("https://turnip.exchange/island/{id}"),
        }
    }

    /// Returns the same canned result on every run.
    pub(crate) struct FixedSource {
        pub islands: Vec<Island>,
    }

    #[async_trait]
    impl IslandSource for FixedSource {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(&mut self) -> Result<Vec<Island>, SourceError> {
            Ok(self.islands.clone())
        }
    }

    struct FailingSource(SourceError);

    #[async_trait]
    impl IslandSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn run(&mut self) -> Result<Vec<Island>, SourceError> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn test_rejects_missing_id_and_url() {
        let registry = IslandRegistry::new();

        let mut no_id = island("a", 100);
        no_id.id.clear();
        assert_eq!(
            registry.add_island(no_id),
            Err(ValidationError::MissingField("id"))
        );

        let mut no_url = island("b", 100);
        no_url.url.clear();
        assert_eq!(
            registry.add_island(no_url),
            Err(ValidationError::MissingField("url"))
        );

        assert!(registry.is_empty());
    }

    #[test]
    fn test_re_registration_replaces_entry() {
        let registry = IslandRegistry::new();
        registry.add_island(island("a", 100)).unwrap();
        registry.add_island(island("a", 250)).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("a").unwrap().turnip_price, 250);
    }

    #[tokio::test]
    async fn test_poll_sources_dedupes_across_cycles() {
        let registry = IslandRegistry::new();
        registry
            .add_source(Box::new(FixedSource {
                islands: vec![island("a", 100), island("b", 200)],
            }))
            .await;

        let first = registry.poll_sources().await;
        assert_eq!(first.len(), 2);

        let second = registry.poll_sources().await;
        assert!(second.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_poll_sources_skips_invalid_and_failed_sources() {
        let registry = IslandRegistry::new();
        let mut bad = island("bad", 100);
        bad.url.clear();

        registry
            .add_source(Box::new(FailingSource(SourceError::Fatal("boom".into()))))
            .await;
        registry
            .add_source(Box::new(FailingSource(SourceError::Transient("later".into()))))
            .await;
        registry
            .add_source(Box::new(FixedSource {
                islands: vec![bad, island("good", 300)],
            }))
            .await;

        let new = registry.poll_sources().await;
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].id, "good");
        assert!(registry.get("bad").is_none());
    }
}

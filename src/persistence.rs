//! Policy state persistence - one JSON file, loaded at startup and written
//! after each learning step.

use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, warn};

use crate::policy::PolicyState;

/// Loads and saves the bandit policy record.
pub struct PolicyStore {
    path: PathBuf,
}

impl PolicyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted record. A missing file yields `None` (fresh start);
    /// a corrupt file is logged and also yields `None` so a bad state file
    /// never blocks startup.
    pub async fn load(&self) -> anyhow::Result<Option<PolicyState>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No policy state at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<PolicyState>(&raw) {
            Ok(state) => {
                debug!(
                    "Loaded policy state from {} ({} trades)",
                    self.path.display(),
                    state.n_trades
                );
                Ok(Some(state))
            }
            Err(e) => {
                warn!(
                    "Corrupt policy state at {}: {}, starting fresh",
                    self.path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Write the record as pretty JSON, creating parent directories on first
    /// save.
    pub async fn save(&self, state: &PolicyState) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json).await?;
        debug!("Saved policy state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::DIM;
    use crate::policy::{BanditPolicy, PolicyConfig};

    #[tokio::test]
    async fn test_missing_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("policy.json"));
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let store = PolicyStore::new(path);
        assert!(store.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = PolicyStore::new(dir.path().join("state").join("policy.json"));

        let policy = BanditPolicy::seeded(PolicyConfig::default(), 3);
        let state = policy.to_state();
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.n_trades, state.n_trades);
        assert_eq!(loaded.gate.dim, DIM);
        assert_eq!(loaded.gate.a, state.gate.a);
        assert_eq!(loaded.size.b, state.size.b);
    }
}

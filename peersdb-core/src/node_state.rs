use crate::constants::{DEFAULT_CONTRIBUTIONS_STORE, DEFAULT_VALIDATIONS_STORE};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Node state persisted between runs as `<repo>_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    /// Full address once a Contributions log is known, the bare default name otherwise.
    pub contributions_store_addr: String,
    pub validations_store_addr: String,
    #[serde(rename = "peerID")]
    pub peer_id: String,
    #[serde(default)]
    pub region: String,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            contributions_store_addr: DEFAULT_CONTRIBUTIONS_STORE.to_string(),
            validations_store_addr: DEFAULT_VALIDATIONS_STORE.to_string(),
            peer_id: String::new(),
            region: String::new(),
        }
    }
}

impl NodeState {
    /// Load the document at `path`, falling back to defaults if there is none.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No node state at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, data)?;
        tracing::info!("Node state written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let state = NodeState::load(&temp_dir.path().join("peersdb_config")).unwrap();
        assert_eq!(state.contributions_store_addr, "contributions");
        assert_eq!(state.validations_store_addr, "validations");
        assert!(state.peer_id.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("peersdb_config");

        let state = NodeState {
            contributions_store_addr: "/peersdb/01HZX3K9M1V2Q8S7T6R5P4N3B2/contributions".to_string(),
            validations_store_addr: "validations".to_string(),
            peer_id: "peer-a".to_string(),
            region: "eu-central".to_string(),
        };
        state.save(&path).unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["peerID"], "peer-a");
        assert_eq!(NodeState::load(&path).unwrap(), state);
    }
}

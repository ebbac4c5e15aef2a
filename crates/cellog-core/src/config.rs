//! Configuration for cellog-core

use serde::{Deserialize, Serialize};

/// Engine-wide configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellogConfig {
    /// Queue that receives material displaced by a pallet swap when the
    /// incoming material did not vacate a queue of its own.
    pub quarantine_queue: Option<String>,
}

impl CellogConfig {
    /// Configuration with a quarantine queue set.
    pub fn with_quarantine_queue(queue: impl Into<String>) -> Self {
        Self {
            quarantine_queue: Some(queue.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_quarantine_queue() {
        assert!(CellogConfig::default().quarantine_queue.is_none());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let cfg = CellogConfig::with_quarantine_queue("Quarantine");
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CellogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.quarantine_queue.as_deref(), Some("Quarantine"));
    }
}

//! State snapshots - "chatty" JSON files for operator observability

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

/// Writes snapshot files under a workspace directory
pub struct StateWriter {
    state_dir: PathBuf,
}

/// Current governor status (state/now.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorSnapshot {
    pub timestamp: String,
    pub status: String,
    pub bots_active: usize,
    pub bots_paused: usize,
    pub bots_quarantined: usize,
    pub session_stats: SessionStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub trades_today: u64,
    pub equity: Decimal,
    pub realized_pnl: Decimal,
}

impl StateWriter {
    pub fn new(workspace_dir: &str) -> Self {
        Self {
            state_dir: PathBuf::from(workspace_dir).join("state"),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.state_dir).await?;
        Ok(())
    }

    pub async fn write_now(&self, snapshot: &GovernorSnapshot) -> anyhow::Result<()> {
        let path = self.state_dir.join("now.json");
        let json = serde_json::to_string_pretty(snapshot)?;
        fs::write(&path, json).await?;
        debug!("Wrote state/now.json");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StateWriter::new(dir.path().to_str().unwrap());
        writer.init().await.unwrap();

        let snapshot = GovernorSnapshot {
            timestamp: chrono::Utc::now().to_rfc3339(),
            status: "running".to_string(),
            bots_active: 3,
            bots_paused: 1,
            bots_quarantined: 0,
            session_stats: SessionStats {
                trades_today: 12,
                equity: Decimal::from(10500),
                realized_pnl: Decimal::from(500),
            },
        };
        writer.write_now(&snapshot).await.unwrap();

        let raw = fs::read_to_string(dir.path().join("state").join("now.json"))
            .await
            .unwrap();
        let parsed: GovernorSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.bots_active, 3);
        assert_eq!(parsed.session_stats.equity, Decimal::from(10500));
    }
}

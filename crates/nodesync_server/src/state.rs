use nodesync_core::SyncError;
use nodesync_core::authority::Hub;
use nodesync_core::config::EngineConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Open workspaces, each served by its own [`Hub`].
pub struct SyncState {
    hubs: RwLock<HashMap<String, Arc<Hub>>>,
    /// Base path for workspace databases; `None` keeps everything in memory
    data_dir: Option<PathBuf>,
    engine: EngineConfig,
}

/// Statistics about the sync state
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub active_workspaces: usize,
    pub active_connections: usize,
    pub active_consumers: usize,
}

impl SyncState {
    pub fn new(data_dir: PathBuf, engine: EngineConfig) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            data_dir: Some(data_dir),
            engine,
        }
    }

    /// State whose workspaces live only as long as the process.
    pub fn in_memory(engine: EngineConfig) -> Self {
        Self {
            hubs: RwLock::new(HashMap::new()),
            data_dir: None,
            engine,
        }
    }

    /// Get the hub for a workspace, opening and starting it on first use.
    pub async fn hub(&self, workspace_id: &str) -> Result<Arc<Hub>, SyncError> {
        validate_workspace_id(workspace_id)?;
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(workspace_id) {
                return Ok(hub.clone());
            }
        }

        let mut hubs = self.hubs.write().await;

        // Double-check after acquiring write lock
        if let Some(hub) = hubs.get(workspace_id) {
            return Ok(hub.clone());
        }

        let hub = match &self.data_dir {
            Some(dir) => {
                let db_path = dir.join(format!("{}.db", workspace_id));
                Hub::open(workspace_id, db_path, self.engine.clone())?
            }
            None => Hub::in_memory(workspace_id, self.engine.clone())?,
        };
        let hub = Arc::new(hub);
        hub.start();
        hubs.insert(workspace_id.to_string(), hub.clone());
        info!("Opened workspace: {}", workspace_id);

        Ok(hub)
    }

    pub async fn stats(&self) -> SyncStats {
        let hubs = self.hubs.read().await;
        let mut stats = SyncStats {
            active_workspaces: hubs.len(),
            ..Default::default()
        };
        for hub in hubs.values() {
            let consumers = hub.registry().stats();
            stats.active_connections += consumers.connections;
            stats.active_consumers += consumers.consumers;
        }
        stats
    }

    /// Stop every workspace's jobs.
    pub async fn shutdown(&self) {
        let hubs: Vec<Arc<Hub>> = self.hubs.write().await.drain().map(|(_, h)| h).collect();
        for hub in hubs {
            hub.shutdown().await;
        }
    }
}

/// Workspace ids become file names, so only a safe alphabet is accepted.
fn validate_workspace_id(workspace_id: &str) -> Result<(), SyncError> {
    let valid = !workspace_id.is_empty()
        && workspace_id.len() <= 128
        && workspace_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SyncError::InvalidInput(format!(
            "invalid workspace id: {:?}",
            workspace_id
        )))
    }
}

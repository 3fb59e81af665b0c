//! Node configuration and forwarding-tracking persistence.
//!
//! Grounded in `original_source/dicom_receiver/core/node_manager.py`'s
//! `NodeManager._load_nodes`/`_create_default_nodes_file`/`add_node`/
//! `remove_node`/`_load_tracking`/`_save_tracking`: two JSON documents under
//! the storage directory, `nodes.json` (a `nodes` map plus an opaque
//! `settings` block this binary never interprets but must round-trip) and
//! `forwarding_tracking.json` (`{node_id: {series_uid: timestamp}}`). Node
//! mutations read the file before rewriting it so a hand-edited `settings`
//! block survives a CLI `node add`/`node remove` call, matching the
//! source's own read-modify-write pattern.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeManagerError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no node named '{0}' is configured")]
    UnknownNode(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub aet: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct NodesDocument {
    #[serde(default)]
    nodes: HashMap<String, NodeConfig>,
    /// Preserved verbatim; this binary doesn't interpret polling/retry
    /// settings from this file (see [`crate::config::config::Config`]).
    #[serde(default)]
    settings: Value,
}

/// Default node document written the first time a gateway runs with no
/// `nodes.json` present, mirroring `_create_default_nodes_file`.
fn default_nodes_document() -> NodesDocument {
    let mut nodes = HashMap::new();
    nodes.insert(
        "horos_workstation".to_string(),
        NodeConfig {
            name: "Horos Workstation".to_string(),
            ip: "127.0.0.1".to_string(),
            port: 11113,
            aet: "HOROS".to_string(),
            enabled: true,
            description: "Local Horos DICOM viewer".to_string(),
        },
    );
    nodes.insert(
        "pacs_server".to_string(),
        NodeConfig {
            name: "PACS Server".to_string(),
            ip: "192.168.1.100".to_string(),
            port: 104,
            aet: "PACS".to_string(),
            enabled: false,
            description: "Main PACS server".to_string(),
        },
    );

    NodesDocument {
        nodes,
        settings: serde_json::json!({
            "polling_interval": 60,
            "max_retry_attempts": 3,
            "retry_delay": 5,
            "auto_forward_enabled": true,
        }),
    }
}

type Tracking = HashMap<String, HashMap<String, DateTime<Utc>>>;

struct Inner {
    nodes_path: PathBuf,
    tracking_path: PathBuf,
    document: NodesDocument,
    tracking: Tracking,
}

/// Node registry plus per-(node, series) "already forwarded" ledger.
pub struct NodeManager {
    inner: Mutex<Inner>,
}

impl NodeManager {
    pub fn load(nodes_path: PathBuf, tracking_path: PathBuf) -> Result<Self, NodeManagerError> {
        let document = if nodes_path.exists() {
            read_json(&nodes_path)?
        } else {
            let doc = default_nodes_document();
            write_json(&nodes_path, &doc)?;
            doc
        };

        let tracking = if tracking_path.exists() {
            read_json(&tracking_path)?
        } else {
            Tracking::new()
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                nodes_path,
                tracking_path,
                document,
                tracking,
            }),
        })
    }

    pub fn list_nodes(&self) -> HashMap<String, NodeConfig> {
        self.inner.lock().unwrap().document.nodes.clone()
    }

    pub fn enabled_nodes(&self) -> HashMap<String, NodeConfig> {
        self.inner
            .lock()
            .unwrap()
            .document
            .nodes
            .iter()
            .filter(|(_, n)| n.enabled)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get_node(&self, node_id: &str) -> Option<NodeConfig> {
        self.inner.lock().unwrap().document.nodes.get(node_id).cloned()
    }

    pub fn add_node(&self, node_id: &str, config: NodeConfig) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.document.nodes.insert(node_id.to_string(), config);
        let nodes_path = inner.nodes_path.clone();
        write_json(&nodes_path, &inner.document)
    }

    pub fn set_enabled(&self, node_id: &str, enabled: bool) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.document.nodes.get_mut(node_id) {
            Some(node) => node.enabled = enabled,
            None => return Err(NodeManagerError::UnknownNode(node_id.to_string())),
        }
        let nodes_path = inner.nodes_path.clone();
        write_json(&nodes_path, &inner.document)
    }

    pub fn remove_node(&self, node_id: &str) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.document.nodes.remove(node_id).is_none() {
            return Err(NodeManagerError::UnknownNode(node_id.to_string()));
        }
        let removed_tracking = inner.tracking.remove(node_id).is_some();

        let nodes_path = inner.nodes_path.clone();
        write_json(&nodes_path, &inner.document)?;

        if removed_tracking {
            let tracking_path = inner.tracking_path.clone();
            write_json(&tracking_path, &inner.tracking)?;
        }
        Ok(())
    }

    pub fn is_series_sent(&self, node_id: &str, series_uid: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .tracking
            .get(node_id)
            .map(|sent| sent.contains_key(series_uid))
            .unwrap_or(false)
    }

    pub fn mark_series_sent(&self, node_id: &str, series_uid: &str) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tracking
            .entry(node_id.to_string())
            .or_default()
            .insert(series_uid.to_string(), Utc::now());
        let tracking_path = inner.tracking_path.clone();
        write_json(&tracking_path, &inner.tracking)
    }

    pub fn clear_tracking_for_node(&self, node_id: &str) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tracking.remove(node_id);
        let tracking_path = inner.tracking_path.clone();
        write_json(&tracking_path, &inner.tracking)
    }

    pub fn clear_all_tracking(&self) -> Result<(), NodeManagerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tracking.clear();
        let tracking_path = inner.tracking_path.clone();
        write_json(&tracking_path, &inner.tracking)
    }

    pub fn stats(&self) -> ForwardingStats {
        let inner = self.inner.lock().unwrap();
        let nodes = inner
            .document
            .nodes
            .iter()
            .map(|(id, cfg)| {
                let sent = inner.tracking.get(id).map(|m| m.len()).unwrap_or(0);
                (
                    id.clone(),
                    NodeStats {
                        name: cfg.name.clone(),
                        enabled: cfg.enabled,
                        series_sent: sent,
                    },
                )
            })
            .collect();

        ForwardingStats {
            total_nodes: inner.document.nodes.len(),
            enabled_nodes: inner.document.nodes.values().filter(|n| n.enabled).count(),
            nodes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub name: String,
    pub enabled: bool,
    pub series_sent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForwardingStats {
    pub total_nodes: usize,
    pub enabled_nodes: usize,
    pub nodes: HashMap<String, NodeStats>,
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, NodeManagerError> {
    let text = std::fs::read_to_string(path).map_err(|e| NodeManagerError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&text).map_err(|e| NodeManagerError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), NodeManagerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| NodeManagerError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|e| NodeManagerError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    std::fs::write(path, text).map_err(|e| NodeManagerError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_paths() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let nodes = dir.path().join("nodes.json");
        let tracking = dir.path().join("forwarding_tracking.json");
        (dir, nodes, tracking)
    }

    #[test]
    fn first_load_creates_default_nodes_file_with_settings_block() {
        let (_dir, nodes_path, tracking_path) = temp_paths();
        let manager = NodeManager::load(nodes_path.clone(), tracking_path).unwrap();

        let nodes = manager.list_nodes();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.contains_key("horos_workstation"));

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&nodes_path).unwrap()).unwrap();
        assert!(raw.get("settings").unwrap().get("polling_interval").is_some());
    }

    #[test]
    fn add_node_preserves_existing_settings_block() {
        let (_dir, nodes_path, tracking_path) = temp_paths();
        std::fs::write(
            &nodes_path,
            serde_json::json!({
                "nodes": {},
                "settings": {"polling_interval": 99, "custom_field": "keep-me"}
            })
            .to_string(),
        )
        .unwrap();

        let manager = NodeManager::load(nodes_path.clone(), tracking_path).unwrap();
        manager
            .add_node(
                "new_node",
                NodeConfig {
                    name: "New Node".into(),
                    ip: "10.0.0.5".into(),
                    port: 11112,
                    aet: "NEWNODE".into(),
                    enabled: true,
                    description: "".into(),
                },
            )
            .unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&nodes_path).unwrap()).unwrap();
        assert_eq!(raw["settings"]["polling_interval"], 99);
        assert_eq!(raw["settings"]["custom_field"], "keep-me");
        assert!(raw["nodes"]["new_node"].is_object());
    }

    #[test]
    fn tracking_round_trips_and_clears() {
        let (_dir, nodes_path, tracking_path) = temp_paths();
        let manager = NodeManager::load(nodes_path, tracking_path.clone()).unwrap();

        assert!(!manager.is_series_sent("horos_workstation", "1.2.3"));
        manager.mark_series_sent("horos_workstation", "1.2.3").unwrap();
        assert!(manager.is_series_sent("horos_workstation", "1.2.3"));

        manager.clear_tracking_for_node("horos_workstation").unwrap();
        assert!(!manager.is_series_sent("horos_workstation", "1.2.3"));

        assert!(tracking_path.exists());
    }

    #[test]
    fn remove_node_also_drops_its_tracking_entry() {
        let (_dir, nodes_path, tracking_path) = temp_paths();
        let manager = NodeManager::load(nodes_path, tracking_path).unwrap();
        manager.mark_series_sent("pacs_server", "9.9.9").unwrap();

        manager.remove_node("pacs_server").unwrap();

        assert!(manager.get_node("pacs_server").is_none());
        assert!(!manager.is_series_sent("pacs_server", "9.9.9"));
    }
}

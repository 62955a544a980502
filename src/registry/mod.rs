//! Directory of known agents, their capabilities and health.
//!
//! The registry is seeded from a YAML roster file and mutated at runtime
//! by discovery exchanges (an `offer` envelope upserts its sender). Status
//! writes are last-writer-wins per agent id.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::{
    models::{AgentAvailability, AgentDescriptor},
    protocol::Envelope,
    ConductorError, Result,
};

#[derive(Debug, Clone)]
struct Entry {
    descriptor: AgentDescriptor,
    /// Monotonic registration order; final tie-break in selection.
    seq: u64,
    from_roster: bool,
}

/// Shape of the agents.yaml roster file.
#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    agents: Vec<RosterAgent>,
}

#[derive(Debug, Deserialize)]
struct RosterAgent {
    name: String,
    #[serde(default = "default_owner")]
    owner: String,
    endpoint: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

fn default_owner() -> String {
    "roster".to_string()
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
    roster_path: Option<PathBuf>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            roster_path: None,
        }
    }

    /// Build a registry seeded from a roster file. A missing file is not
    /// an error; the registry starts empty and can be populated by
    /// discovery.
    pub async fn with_roster(path: impl AsRef<Path>) -> Result<Self> {
        let mut registry = Self::new();
        registry.roster_path = Some(path.as_ref().to_path_buf());
        if path.as_ref().exists() {
            registry.reload_roster().await?;
        } else {
            warn!("Agent roster not found at {:?}; starting empty", path.as_ref());
        }
        Ok(registry)
    }

    /// Re-read the roster file, replacing roster-sourced descriptors while
    /// preserving agents registered at runtime.
    pub async fn reload_roster(&self) -> Result<()> {
        let Some(path) = &self.roster_path else {
            return Err(ConductorError::Configuration(
                "No roster path configured".to_string(),
            ));
        };
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            ConductorError::Configuration(format!("Reading roster {path:?}: {e}"))
        })?;
        let roster: RosterFile = serde_yml::from_str(&raw)?;

        let mut descriptors = Vec::with_capacity(roster.agents.len());
        for agent in roster.agents {
            url::Url::parse(&agent.endpoint).map_err(|e| {
                ConductorError::Configuration(format!(
                    "Invalid endpoint for roster agent {}: {e}",
                    agent.name
                ))
            })?;
            let mut descriptor = AgentDescriptor::new(
                format!("agent://{}/{}", agent.owner, agent.name),
                agent.endpoint,
                agent.capabilities,
            );
            descriptor.metadata = agent.metadata;
            descriptors.push(descriptor);
        }

        let mut agents = self.agents.write().await;
        agents.retain(|_, entry| !entry.from_roster);
        for descriptor in descriptors {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            agents.insert(
                descriptor.id.clone(),
                Entry {
                    descriptor,
                    seq,
                    from_roster: true,
                },
            );
        }
        info!(
            "Roster loaded: {} agents registered from {:?}",
            agents.values().filter(|e| e.from_roster).count(),
            path
        );
        Ok(())
    }

    /// Register (or replace) an agent at runtime.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<()> {
        url::Url::parse(&descriptor.endpoint).map_err(|e| {
            ConductorError::Validation(format!("Invalid agent endpoint: {e}"))
        })?;
        let mut agents = self.agents.write().await;
        let seq = match agents.get(&descriptor.id) {
            // Re-registration keeps the original order for tie-breaks.
            Some(existing) => existing.seq,
            None => self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        info!("Registered agent {} ({:?})", descriptor.id, descriptor.capabilities);
        agents.insert(
            descriptor.id.clone(),
            Entry {
                descriptor,
                seq,
                from_roster: false,
            },
        );
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let removed = agents.remove(agent_id).is_some();
        if removed {
            info!("Unregistered agent {}", agent_id);
        }
        removed
    }

    pub async fn lookup_by_id(&self, agent_id: &str) -> Option<AgentDescriptor> {
        let agents = self.agents.read().await;
        agents.get(agent_id).map(|e| e.descriptor.clone())
    }

    /// Best match for a capability tag: prefer `available`, then
    /// most-recently-seen, then earliest registration.
    pub async fn lookup_by_capability(&self, tag: &str) -> Option<AgentDescriptor> {
        let agents = self.agents.read().await;
        agents
            .values()
            .filter(|e| e.descriptor.has_capability(tag))
            .filter(|e| e.descriptor.status != AgentAvailability::Offline)
            .max_by(|a, b| {
                let a_avail = a.descriptor.status == AgentAvailability::Available;
                let b_avail = b.descriptor.status == AgentAvailability::Available;
                a_avail
                    .cmp(&b_avail)
                    .then(a.descriptor.last_seen.cmp(&b.descriptor.last_seen))
                    // max_by keeps the later element on Equal, so invert
                    // seq to make the earliest registration win ties.
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|e| e.descriptor.clone())
    }

    pub async fn list_by_capability(&self, tag: &str) -> Vec<AgentDescriptor> {
        let agents = self.agents.read().await;
        let mut matches: Vec<&Entry> = agents
            .values()
            .filter(|e| e.descriptor.has_capability(tag))
            .collect();
        matches.sort_by_key(|e| e.seq);
        matches.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    /// Last-writer-wins status update; bumps `last_seen`.
    pub async fn update_status(&self, agent_id: &str, status: AgentAvailability) -> Result<()> {
        let mut agents = self.agents.write().await;
        let entry = agents
            .get_mut(agent_id)
            .ok_or_else(|| ConductorError::NotFound(format!("Agent {agent_id}")))?;
        entry.descriptor.status = status;
        entry.descriptor.last_seen = chrono::Utc::now();
        Ok(())
    }

    pub async fn list_all(&self) -> Vec<AgentDescriptor> {
        let agents = self.agents.read().await;
        let mut entries: Vec<&Entry> = agents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.descriptor.clone()).collect()
    }

    pub async fn count(&self) -> usize {
        self.agents.read().await.len()
    }

    /// Ingest a discovery `offer`: the sender becomes (or refreshes) a
    /// runtime registration using the endpoint and capabilities it
    /// advertises in the payload.
    pub async fn ingest_offer(&self, offer: &Envelope) -> Result<()> {
        let endpoint = offer
            .payload
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ConductorError::Validation("Offer payload is missing 'endpoint'".to_string())
            })?;
        let capabilities: Vec<String> = offer
            .payload
            .get("capabilities")
            .and_then(|v| v.as_array())
            .map(|caps| {
                caps.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let descriptor = AgentDescriptor::new(offer.sender.clone(), endpoint, capabilities);
        self.register(descriptor).await
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

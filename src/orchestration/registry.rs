//! Catalog of worker agents and the capabilities each one exposes.
//!
//! The registry is built once per process and shared by reference. It is
//! usually loaded from a TOML file:
//!
//! ```toml
//! [[agent]]
//! name = "sql"
//! description = "Runs read-only SQL against the warehouse"
//! command = "sql-agent"
//! args = ["--json"]
//!
//! [[agent.capability]]
//! name = "query"
//! description = "Execute a SELECT statement"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};
use crate::twlog_debug;

/// A named operation an agent can perform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// External program that performs the agent's work, if any.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, rename = "capability")]
    pub capabilities: Vec<Capability>,
}

impl AgentSpec {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            command: None,
            args: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capability(mut self, name: &str, description: &str) -> Self {
        self.capabilities.push(Capability {
            name: name.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn with_command(mut self, command: &str, args: &[&str]) -> Self {
        self.command = Some(command.to_string());
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "agent")]
    agents: Vec<AgentSpec>,
}

/// Agents by name, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    agents: Vec<AgentSpec>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new(agents: Vec<AgentSpec>) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, agent) in agents.iter().enumerate() {
            if agent.name.trim().is_empty() {
                return Err(Error::Validation("agent with empty name".to_string()));
            }
            if index.insert(agent.name.clone(), i).is_some() {
                return Err(Error::Validation(format!(
                    "agent {} registered twice",
                    agent.name
                )));
            }
        }
        Ok(Self { agents, index })
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let file: RegistryFile = toml::from_str(contents)?;
        Self::new(file.agents)
    }

    pub fn load(path: &Path) -> Result<Self> {
        twlog_debug!("CapabilityRegistry::load path={}", path.display());
        let registry = Self::parse(&std::fs::read_to_string(path)?)?;
        twlog_debug!("Loaded {} agents", registry.len());
        Ok(registry)
    }

    pub fn to_toml(&self) -> Result<String> {
        let file = RegistryFile {
            agents: self.agents.clone(),
        };
        Ok(toml::to_string_pretty(&file)?)
    }

    pub fn get(&self, name: &str) -> Option<&AgentSpec> {
        self.index.get(name).map(|&i| &self.agents[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn capabilities_of(&self, name: &str) -> &[Capability] {
        self.get(name).map(|a| a.capabilities.as_slice()).unwrap_or(&[])
    }

    pub fn description_of(&self, name: &str) -> &str {
        self.get(name).map(|a| a.description.as_str()).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

use std::collections::BTreeMap;

use crate::models::{CoreError, CoreResult};
use crate::orchestration::Agent;

/// Explicitly constructed set of agents available to one scheduling run.
#[derive(Clone, Debug, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> CoreResult<Self> {
        let mut registry = Self::default();
        for agent in agents {
            registry.register(agent)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, agent: Agent) -> CoreResult<()> {
        let name = agent.name().to_string();
        if self.agents.contains_key(&name) {
            return Err(CoreError::validation(format!(
                "duplicate agent registration for '{name}'"
            )));
        }
        self.agents.insert(name, agent);
        Ok(())
    }

    pub fn get(&self, name: &str) -> CoreResult<&Agent> {
        self.agents.get(name).ok_or_else(|| {
            CoreError::validation(format!("no agent is registered under '{name}'"))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

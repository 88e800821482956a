//! Agent registry -- the named set of agents the classifier can route to.

use std::collections::BTreeMap;
use std::sync::Arc;

use drover_db::models::ProfileKind;

use super::Agent;

/// Registered [`Agent`]s keyed by name.
///
/// Names iterate in sorted order, which keeps the catalog handed to the
/// classifier deterministic.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under [`Agent::name`], returning any agent it
    /// replaced.
    pub fn register(&mut self, agent: impl Agent + 'static) -> Option<Arc<dyn Agent>> {
        self.register_arc(Arc::new(agent))
    }

    pub fn register_arc(&mut self, agent: Arc<dyn Agent>) -> Option<Arc<dyn Agent>> {
        let name = agent.name().to_string();
        self.agents.insert(name, agent)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    /// Runner profile required by `name`, if registered.
    pub fn profile_for(&self, name: &str) -> Option<ProfileKind> {
        self.agents.get(name).map(|a| a.profile())
    }

    /// Sorted agent names.
    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}

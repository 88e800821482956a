//! Strategy adaptation from recent execution outcomes.
//!
//! Every `every` recorded outcomes the success rate over the last
//! `2 * every` is checked. Below the threshold one corrective policy is
//! put in force for `ttl_cycles` cycles:
//!
//! - **deprioritize**: one agent accounts for most of the window's
//!   failures, so its tasks go to the back of the queue;
//! - **conservative**: failures are spread out, so tasks needing the
//!   smallest runner profiles go first.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::info;

use drover_db::models::{ProfileKind, Task};

/// `[adaptation]` settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptationConfig {
    pub every: usize,
    pub success_threshold: f64,
    pub failure_share: f64,
    pub min_failures: usize,
    pub ttl_cycles: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            every: 5,
            success_threshold: 0.6,
            failure_share: 0.6,
            min_failures: 2,
            ttl_cycles: 10,
        }
    }
}

/// What an evaluation decided; persisted as an adaptation entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptationDecision {
    pub kind: String,
    pub reason: String,
    pub action: String,
}

#[derive(Debug)]
pub struct AdaptationEngine {
    config: AdaptationConfig,
    window: VecDeque<(String, bool)>,
    since_evaluation: usize,
    deprioritized: BTreeMap<String, u64>,
    conservative_until: Option<u64>,
}

impl AdaptationEngine {
    pub fn new(config: AdaptationConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            since_evaluation: 0,
            deprioritized: BTreeMap::new(),
            conservative_until: None,
        }
    }

    fn window_len(&self) -> usize {
        self.config.every.max(1) * 2
    }

    /// Record one finished execution.
    pub fn record(&mut self, agent: &str, success: bool) {
        self.window.push_back((agent.to_string(), success));
        while self.window.len() > self.window_len() {
            self.window.pop_front();
        }
        self.since_evaluation += 1;
    }

    /// Evaluate once `every` outcomes have accumulated since the last
    /// evaluation. Returns the policy put in force, if any.
    pub fn evaluate(&mut self, cycle: u64) -> Option<AdaptationDecision> {
        if self.since_evaluation < self.config.every.max(1) {
            return None;
        }
        self.since_evaluation = 0;

        let total = self.window.len();
        let successes = self.window.iter().filter(|(_, ok)| *ok).count();
        let rate = successes as f64 / total as f64;
        if rate >= self.config.success_threshold {
            return None;
        }

        let failures = total - successes;
        let mut by_agent: BTreeMap<&str, usize> = BTreeMap::new();
        for (agent, ok) in &self.window {
            if !ok {
                *by_agent.entry(agent.as_str()).or_default() += 1;
            }
        }
        // Highest count; BTreeMap iteration breaks ties by name.
        let worst = by_agent
            .iter()
            .fold(None::<(&str, usize)>, |best, (&agent, &count)| match best {
                Some((_, c)) if c >= count => best,
                _ => Some((agent, count)),
            });

        let until = cycle + self.config.ttl_cycles;
        let reason = format!(
            "success rate {:.0}% over last {total} executions is below {:.0}%",
            rate * 100.0,
            self.config.success_threshold * 100.0
        );

        let decision = match worst {
            Some((agent, count))
                if count >= self.config.min_failures
                    && count as f64 / failures as f64 >= self.config.failure_share =>
            {
                let agent = agent.to_string();
                self.deprioritized.insert(agent.clone(), until);
                AdaptationDecision {
                    kind: "deprioritize".to_string(),
                    reason: format!("{reason}; {agent} caused {count} of {failures} failures"),
                    action: format!("deprioritize {agent} until cycle {until}"),
                }
            }
            _ => {
                self.conservative_until = Some(until);
                AdaptationDecision {
                    kind: "conservative".to_string(),
                    reason,
                    action: format!("prefer smallest runner profiles until cycle {until}"),
                }
            }
        };

        info!(kind = %decision.kind, action = %decision.action, "adaptation applied");
        Some(decision)
    }

    /// Drop policies whose time is up. Returns a description of each.
    pub fn expire(&mut self, cycle: u64) -> Vec<String> {
        let mut expired = Vec::new();
        self.deprioritized.retain(|agent, until| {
            if *until <= cycle {
                expired.push(format!("deprioritize {agent}"));
                false
            } else {
                true
            }
        });
        if self.conservative_until.is_some_and(|until| until <= cycle) {
            self.conservative_until = None;
            expired.push("conservative".to_string());
        }
        expired
    }

    pub fn is_deprioritized(&self, agent: &str) -> bool {
        self.deprioritized.contains_key(agent)
    }

    pub fn is_conservative(&self) -> bool {
        self.conservative_until.is_some()
    }

    /// Reorder a priority-ordered queue under the active policies. The sort
    /// is stable, so with no policy in force the order is unchanged.
    pub fn order_tasks<F>(&self, mut tasks: Vec<Task>, profile_of: F) -> Vec<Task>
    where
        F: Fn(&Task) -> ProfileKind,
    {
        let conservative = self.is_conservative();
        tasks.sort_by_key(|task| {
            let demoted = task
                .assigned_agent
                .as_deref()
                .is_some_and(|agent| self.is_deprioritized(agent));
            let profile = if conservative {
                profile_of(task)
            } else {
                ProfileKind::Light
            };
            (demoted, profile)
        });
        tasks
    }
}

impl Default for AdaptationEngine {
    fn default() -> Self {
        Self::new(AdaptationConfig::default())
    }
}

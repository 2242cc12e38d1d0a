// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Recovery scenario catalogue.

use std::collections::BTreeMap;

use serde::Serialize;

pub const INFRASTRUCTURE_FAILURE: &str = "infrastructure_failure";
pub const DATABASE_FAILURE: &str = "database_failure";
pub const CACHE_FAILURE: &str = "cache_failure";
pub const APPLICATION_FAILURE: &str = "application_failure";
pub const CHAIN_RPC_FAILURE: &str = "chain_rpc_failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

/// A named, ordered list of recovery steps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scenario {
    pub id: String,
    pub description: String,
    pub severity: Severity,
    /// Recovery time objective.
    pub rto_minutes: u32,
    /// Recovery point objective.
    pub rpo_minutes: u32,
    pub steps: Vec<String>,
}

impl Scenario {
    pub fn new(id: impl Into<String>, severity: Severity, steps: &[&str]) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            severity,
            rto_minutes: 0,
            rpo_minutes: 0,
            steps: steps.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn described(mut self, description: &str, rto_minutes: u32, rpo_minutes: u32) -> Self {
        self.description = description.to_string();
        self.rto_minutes = rto_minutes;
        self.rpo_minutes = rpo_minutes;
        self
    }
}

/// Scenarios by id.
#[derive(Debug, Clone, Default)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in scenarios. They only reference built-in steps.
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for scenario in [
            Scenario::new(
                INFRASTRUCTURE_FAILURE,
                Severity::Critical,
                &["probe", "enable_maintenance", "reload_workers", "verify", "disable_maintenance"],
            )
            .described("Every external dependency is unreachable", 60, 15),
            Scenario::new(
                DATABASE_FAILURE,
                Severity::Critical,
                &["probe", "enable_maintenance", "verify", "disable_maintenance"],
            )
            .described("Primary store unreachable", 30, 5),
            Scenario::new(
                APPLICATION_FAILURE,
                Severity::High,
                &["probe", "reload_workers", "verify"],
            )
            .described("Application health endpoint failing", 10, 0),
            Scenario::new(CACHE_FAILURE, Severity::High, &["probe", "reload_workers", "verify"])
                .described("Cache unreachable", 15, 0),
            Scenario::new(CHAIN_RPC_FAILURE, Severity::Medium, &["probe", "verify"])
                .described("Chain RPC endpoint unreachable", 15, 0),
        ] {
            catalog.insert(scenario);
        }
        catalog
    }

    /// Replace step lists, or add new scenarios, from configuration.
    /// Scenarios not already in the catalogue are added with medium severity.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Self {
        for (id, steps) in overrides {
            match self.scenarios.get_mut(id) {
                Some(scenario) => scenario.steps = steps.clone(),
                None => {
                    let mut scenario = Scenario::new(id.clone(), Severity::Medium, &[]);
                    scenario.steps = steps.clone();
                    self.insert(scenario);
                }
            }
        }
        self
    }

    pub fn insert(&mut self, scenario: Scenario) {
        self.scenarios.insert(scenario.id.clone(), scenario);
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalogue() {
        let catalog = ScenarioCatalog::builtin();
        assert_eq!(catalog.len(), 5);
        let infra = catalog.get(INFRASTRUCTURE_FAILURE).unwrap();
        assert_eq!(infra.severity, Severity::Critical);
        assert_eq!(infra.steps.first().map(String::as_str), Some("probe"));
        assert_eq!(infra.steps.last().map(String::as_str), Some("disable_maintenance"));
    }

    #[test]
    fn test_overrides_replace_and_add() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            DATABASE_FAILURE.to_string(),
            vec!["probe".into(), "restore".into(), "verify".into()],
        );
        overrides.insert("queue_failure".to_string(), vec!["probe".into()]);

        let catalog = ScenarioCatalog::builtin().with_overrides(&overrides);
        let db = catalog.get(DATABASE_FAILURE).unwrap();
        assert_eq!(db.steps, vec!["probe", "restore", "verify"]);
        assert_eq!(db.severity, Severity::Critical);
        assert_eq!(catalog.get("queue_failure").unwrap().severity, Severity::Medium);
        assert_eq!(catalog.len(), 6);
    }
}

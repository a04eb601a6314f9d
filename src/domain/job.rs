//! Jobs declared by a pipeline at run time.

use serde::{Deserialize, Serialize};

/// One entry of the list a plugin returns from `get_jobs`.
///
/// This is also the wire representation, so every field except `name` is
/// optional on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Ordinal priority; lower values run earlier, a missing priority counts
    /// as 0 and ties keep the declared order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    /// Independent jobs keep running after an unrelated job failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub independent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl JobDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            priority: None,
            independent: false,
            description: None,
        }
    }

    pub fn depends_on(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn independent(mut self) -> Self {
        self.independent = true;
        self
    }
}

/// Terminal result of executing one job through a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

// src/dag/graph.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::domain::JobDescriptor;
use crate::errors::{ConveyorError, Result};

/// Direct dependencies: jobs that must succeed before this one can run.
#[derive(Debug, Clone, Default)]
struct JobNode {
    deps: Vec<String>,
}

/// Adjacency view of the jobs a pipeline declared for one run.
///
/// Construction validates the declaration; a plugin that reports an empty
/// list, duplicate or empty names, unknown dependencies or a dependency
/// cycle is violating the protocol.
#[derive(Debug, Clone)]
pub struct JobGraph {
    nodes: HashMap<String, JobNode>,
}

impl JobGraph {
    pub fn from_descriptors(jobs: &[JobDescriptor]) -> Result<Self> {
        if jobs.is_empty() {
            return Err(ConveyorError::PluginProtocolError(
                "plugin declared no jobs".to_string(),
            ));
        }

        let mut names: HashSet<&str> = HashSet::new();
        for job in jobs {
            if job.name.trim().is_empty() {
                return Err(ConveyorError::PluginProtocolError(
                    "plugin declared a job with an empty name".to_string(),
                ));
            }
            if !names.insert(job.name.as_str()) {
                return Err(ConveyorError::PluginProtocolError(format!(
                    "plugin declared job '{}' more than once",
                    job.name
                )));
            }
        }

        for job in jobs {
            for dep in &job.depends_on {
                if dep == &job.name {
                    return Err(ConveyorError::PluginProtocolError(format!(
                        "job '{}' cannot depend on itself",
                        job.name
                    )));
                }
                if !names.contains(dep.as_str()) {
                    return Err(ConveyorError::PluginProtocolError(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.name, dep
                    )));
                }
            }
        }

        ensure_acyclic(jobs)?;

        let nodes: HashMap<String, JobNode> = jobs
            .iter()
            .map(|job| {
                (
                    job.name.clone(),
                    JobNode {
                        deps: job.depends_on.clone(),
                    },
                )
            })
            .collect();

        Ok(Self { nodes })
    }

    /// Immediate dependencies of a job.
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn ensure_acyclic(jobs: &[JobDescriptor]) -> Result<()> {
    // Edge direction: dep -> job
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for job in jobs {
        graph.add_node(job.name.as_str());
    }
    for job in jobs {
        for dep in &job.depends_on {
            graph.add_edge(dep.as_str(), job.name.as_str(), ());
        }
    }

    // A topological sort will fail if there is a cycle.
    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(ConveyorError::PluginProtocolError(format!(
            "dependency cycle involving job '{}'",
            cycle.node_id()
        ))),
    }
}

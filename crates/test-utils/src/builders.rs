#![allow(dead_code)]

use std::path::PathBuf;

use conveyor::config::{ConfigFile, PipelineSettings, RawConfigFile};
use conveyor::domain::{JobDescriptor, Pipeline, PipelineId};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn home(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.server.home_path = path.into();
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.server.workers = workers;
        self
    }

    pub fn job_timeout(mut self, duration: &str) -> Self {
        self.config.server.job_timeout = Some(duration.to_string());
        self
    }

    pub fn interval(mut self, duration: &str) -> Self {
        self.config.discovery.interval = duration.to_string();
        self
    }

    pub fn watch(mut self, val: bool) -> Self {
        self.config.discovery.watch = val;
        self
    }

    pub fn include(mut self, pattern: &str) -> Self {
        self.config.discovery.include.push(pattern.to_string());
        self
    }

    pub fn with_pipeline(mut self, name: &str, concurrent: bool, priority: i32) -> Self {
        self.config.pipeline.insert(
            name.to_string(),
            PipelineSettings {
                concurrent,
                priority,
            },
        );
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for a registered `Pipeline` whose binary never exists on disk.
pub struct PipelineBuilder {
    pipeline: Pipeline,
}

impl PipelineBuilder {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            pipeline: Pipeline::new(PipelineId(id), name, format!("/nonexistent/{name}_golang")),
        }
    }

    pub fn exclusive(mut self) -> Self {
        self.pipeline.concurrent = false;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.pipeline.priority = priority;
        self
    }

    pub fn exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipeline.exec_path = path.into();
        self
    }

    pub fn build(self) -> Pipeline {
        self.pipeline
    }
}

/// `build -> test -> deploy`, the usual three-stage chain.
pub fn linear_jobs() -> Vec<JobDescriptor> {
    vec![
        JobDescriptor::new("build"),
        JobDescriptor::new("test").depends_on("build"),
        JobDescriptor::new("deploy").depends_on("test"),
    ]
}

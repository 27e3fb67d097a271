//! The job submitted to the orchestrator and its successful outcomes.

use std::path::PathBuf;

use serde::Deserialize;

use imagegen_core::generation::{GenerationParameters, ProjectDocument};

use crate::collector::OutputArtifact;
use crate::error::JobError;

/// One generation request. Immutable once submitted.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    /// The engine-specific node graph.
    pub workflow: serde_json::Value,
    /// Output node identifiers; the first one supplies the artifacts.
    pub output_node_names: Vec<String>,
    #[serde(default)]
    pub parameters: Option<GenerationParameters>,
    #[serde(default)]
    pub project: Option<ProjectDocument>,
    /// Clear the gallery before adding this job's artifacts.
    #[serde(default = "default_clear_output_images")]
    pub clear_output_images: bool,
    /// Local images the workflow references, uploaded before submission.
    #[serde(default)]
    pub input_images: Vec<PathBuf>,
}

fn default_clear_output_images() -> bool {
    true
}

impl Job {
    pub fn new(workflow: serde_json::Value, output_node_names: Vec<String>) -> Self {
        Self {
            workflow,
            output_node_names,
            parameters: None,
            project: None,
            clear_output_images: true,
            input_images: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    pub fn with_project(mut self, project: ProjectDocument) -> Self {
        self.project = Some(project);
        self
    }

    pub fn with_input_images(mut self, input_images: Vec<PathBuf>) -> Self {
        self.input_images = input_images;
        self
    }

    pub fn with_clear_output_images(mut self, clear: bool) -> Self {
        self.clear_output_images = clear;
        self
    }

    /// Check the preconditions that do not depend on the compute client.
    pub fn validate(&self) -> Result<(&GenerationParameters, &ProjectDocument), JobError> {
        let parameters = self
            .parameters
            .as_ref()
            .ok_or_else(|| JobError::InvalidRequest("Generation parameters are missing".into()))?;
        let project = self
            .project
            .as_ref()
            .ok_or_else(|| JobError::InvalidRequest("Project document is missing".into()))?;
        if self.output_node_names.is_empty() {
            return Err(JobError::InvalidRequest(
                "At least one output node name is required".into(),
            ));
        }
        Ok((parameters, project))
    }

    /// The output node whose images become the job's artifacts.
    pub fn primary_output_node(&self) -> Option<&str> {
        self.output_node_names.first().map(String::as_str)
    }
}

/// How a job that did not fail ended.
#[derive(Debug)]
pub enum JobOutcome {
    /// Artifacts in engine order, with the grid (if any) at index 0.
    Completed(Vec<OutputArtifact>),
    /// The engine finished but the primary output node produced nothing.
    NoOutput,
}

impl JobOutcome {
    pub fn artifacts(&self) -> &[OutputArtifact] {
        match self {
            Self::Completed(artifacts) => artifacts,
            Self::NoOutput => &[],
        }
    }
}

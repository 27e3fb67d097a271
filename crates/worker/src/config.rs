use std::path::PathBuf;

use imagegen_comfyui::session::SessionConfig;
use imagegen_pipeline::orchestrator::OrchestratorConfig;

/// Default ComfyUI HTTP endpoint.
pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// ComfyUI HTTP base URL.
    pub comfyui_url: String,
    /// WebSocket URL; derived from `comfyui_url` when unset.
    pub comfyui_ws_url: Option<String>,
    /// Where artifacts are written.
    pub output_dir: PathBuf,
    pub file_name_template: Option<String>,
    pub project_name: Option<String>,
    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var             | Default                  |
    /// |---------------------|--------------------------|
    /// | `COMFYUI_URL`       | `http://127.0.0.1:8188`  |
    /// | `COMFYUI_WS_URL`    | derived from the URL     |
    /// | `OUTPUT_DIR`        | required                 |
    /// | `FILENAME_TEMPLATE` | built-in template        |
    /// | `PROJECT_NAME`      | none                     |
    /// | `LOG_FORMAT`        | `text` (`json` to switch)|
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let output_dir = var("OUTPUT_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("OUTPUT_DIR"))?;

        Ok(Self {
            comfyui_url: var("COMFYUI_URL").unwrap_or_else(|| DEFAULT_COMFYUI_URL.into()),
            comfyui_ws_url: var("COMFYUI_WS_URL"),
            output_dir,
            file_name_template: var("FILENAME_TEMPLATE"),
            project_name: var("PROJECT_NAME"),
            json_logs: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(self.comfyui_url.clone());
        config.ws_url = self.comfyui_ws_url.clone();
        config.output_dir = Some(self.output_dir.clone());
        config
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            file_name_template: self.file_name_template.clone(),
            project_name: self.project_name.clone(),
            ..Default::default()
        }
    }
}

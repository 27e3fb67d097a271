//! Generation parameter and project document models.
//!
//! Both are embedded into output images as provenance metadata, so their
//! JSON shape is stable: PascalCase keys, enum values as names, and
//! `None` fields omitted.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Project state key holding the seed card model.
pub const SEED_MODULE: &str = "Seed";

/// Project state key holding the batch size card model.
pub const BATCH_SIZE_MODULE: &str = "BatchSize";

/// Current project document version.
pub const PROJECT_VERSION: u32 = 2;

// ---------------------------------------------------------------------------
// Generation parameters
// ---------------------------------------------------------------------------

/// Sampling parameters a job was generated with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GenerationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positive_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hash: Option<String>,
}

impl GenerationParameters {
    /// Render the parameters in the plain-text layout understood by most
    /// image viewers and web UIs:
    ///
    /// ```text
    /// <prompt>
    /// Negative prompt: <negative>
    /// Steps: 20, Sampler: euler, CFG scale: 7, Seed: 42, Size: 512x768, Model hash: abc, Model: sdxl
    /// ```
    ///
    /// The negative line is omitted when empty; absent settings are skipped.
    pub fn to_parameters_text(&self) -> String {
        let mut lines = vec![self.positive_prompt.clone().unwrap_or_default()];

        if let Some(neg) = self.negative_prompt.as_deref().filter(|n| !n.is_empty()) {
            lines.push(format!("Negative prompt: {neg}"));
        }

        let mut settings = Vec::new();
        if let Some(steps) = self.steps {
            settings.push(format!("Steps: {steps}"));
        }
        if let Some(sampler) = &self.sampler {
            settings.push(format!("Sampler: {sampler}"));
        }
        if let Some(scheduler) = &self.scheduler {
            settings.push(format!("Schedule type: {scheduler}"));
        }
        if let Some(cfg) = self.cfg_scale {
            settings.push(format!("CFG scale: {cfg}"));
        }
        if let Some(seed) = self.seed {
            settings.push(format!("Seed: {seed}"));
        }
        if let (Some(w), Some(h)) = (self.width, self.height) {
            settings.push(format!("Size: {w}x{h}"));
        }
        if let Some(hash) = &self.model_hash {
            settings.push(format!("Model hash: {hash}"));
        }
        if let Some(model) = &self.model_name {
            settings.push(format!("Model: {model}"));
        }
        if !settings.is_empty() {
            lines.push(settings.join(", "));
        }

        lines.join("\n")
    }
}

// ---------------------------------------------------------------------------
// Project document
// ---------------------------------------------------------------------------

/// The kind of inference tab a project was saved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectType {
    TextToImage,
    ImageToImage,
    Inpainting,
    Upscale,
    ImageToVideo,
}

impl fmt::Display for ProjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TextToImage => "TextToImage",
            Self::ImageToImage => "ImageToImage",
            Self::Inpainting => "Inpainting",
            Self::Upscale => "Upscale",
            Self::ImageToVideo => "ImageToVideo",
        };
        f.write_str(s)
    }
}

/// A saved inference project: the project type plus the serialized state
/// of every card module, keyed by module name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectDocument {
    pub version: u32,
    pub project_type: ProjectType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ProjectDocument {
    pub fn new(project_type: ProjectType) -> Self {
        Self {
            version: PROJECT_VERSION,
            project_type,
            state: Some(serde_json::Map::new()),
        }
    }

    /// Builder-style insertion of a module's state.
    pub fn with_module(mut self, key: impl Into<String>, model: serde_json::Value) -> Self {
        self.state
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), model);
        self
    }

    /// Look up a module's state.
    pub fn model(&self, key: &str) -> Option<&serde_json::Value> {
        self.state.as_ref()?.get(key)
    }

    /// Apply `update` to the module stored under `key`.
    ///
    /// Returns `false` (and leaves the document untouched) when the module
    /// is absent or is not a JSON object.
    pub fn try_update_model<F>(&mut self, key: &str, update: F) -> bool
    where
        F: FnOnce(&mut serde_json::Map<String, serde_json::Value>),
    {
        match self
            .state
            .as_mut()
            .and_then(|s| s.get_mut(key))
            .and_then(|v| v.as_object_mut())
        {
            Some(model) => {
                update(model);
                true
            }
            None => false,
        }
    }

    /// Disable seed re-randomization so the embedded project reproduces the
    /// exact image when reopened.
    pub fn lock_seed(&mut self) {
        self.try_update_model(SEED_MODULE, |seed| {
            seed.insert("IsRandomizeEnabled".into(), serde_json::Value::Bool(false));
        });
    }

    /// Clone of this document pinned to a single batch index (1-based).
    pub fn with_batch_index(&self, batch_index: u32) -> Self {
        let mut doc = self.clone();
        doc.try_update_model(BATCH_SIZE_MODULE, |batch| {
            batch.insert("BatchCount".into(), 1.into());
            batch.insert("IsBatchIndexEnabled".into(), true.into());
            batch.insert("BatchIndex".into(), batch_index.into());
        });
        doc
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample_project() -> ProjectDocument {
        ProjectDocument::new(ProjectType::TextToImage)
            .with_module(SEED_MODULE, json!({"Seed": 42, "IsRandomizeEnabled": true}))
            .with_module(BATCH_SIZE_MODULE, json!({"BatchSize": 3, "BatchCount": 2}))
    }

    #[test]
    fn parameters_json_omits_nulls_and_uses_pascal_case() {
        let params = GenerationParameters {
            seed: Some(7),
            model_name: Some("sdxl".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"Seed": 7, "ModelName": "sdxl"}));
    }

    #[test]
    fn project_type_serializes_as_name() {
        let doc = ProjectDocument::new(ProjectType::ImageToImage);
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["ProjectType"], "ImageToImage");
        assert_eq!(value["Version"], PROJECT_VERSION);
    }

    #[test]
    fn parameters_text_layout() {
        let params = GenerationParameters {
            positive_prompt: Some("a cat".into()),
            negative_prompt: Some("blurry".into()),
            seed: Some(42),
            steps: Some(20),
            sampler: Some("euler".into()),
            cfg_scale: Some(7.0),
            width: Some(512),
            height: Some(768),
            model_name: Some("sdxl".into()),
            ..Default::default()
        };
        assert_eq!(
            params.to_parameters_text(),
            "a cat\nNegative prompt: blurry\nSteps: 20, Sampler: euler, CFG scale: 7, Seed: 42, Size: 512x768, Model: sdxl"
        );
    }

    #[test]
    fn parameters_text_skips_empty_negative() {
        let params = GenerationParameters {
            positive_prompt: Some("a dog".into()),
            negative_prompt: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(params.to_parameters_text(), "a dog");
    }

    #[test]
    fn lock_seed_disables_randomization() {
        let mut doc = sample_project();
        doc.lock_seed();
        assert_eq!(doc.model(SEED_MODULE).unwrap()["IsRandomizeEnabled"], false);
        assert_eq!(doc.model(SEED_MODULE).unwrap()["Seed"], 42);
    }

    #[test]
    fn lock_seed_without_seed_module_is_noop() {
        let mut doc = ProjectDocument::new(ProjectType::Upscale);
        let before = doc.clone();
        doc.lock_seed();
        assert_eq!(doc, before);
    }

    #[test]
    fn batch_index_variant_leaves_original_untouched() {
        let doc = sample_project();
        let variant = doc.with_batch_index(2);

        let batch = variant.model(BATCH_SIZE_MODULE).unwrap();
        assert_eq!(batch["BatchCount"], 1);
        assert_eq!(batch["IsBatchIndexEnabled"], true);
        assert_eq!(batch["BatchIndex"], 2);
        assert_eq!(batch["BatchSize"], 3);

        assert_eq!(doc.model(BATCH_SIZE_MODULE).unwrap()["BatchCount"], 2);
    }

    #[test]
    fn try_update_model_rejects_non_object() {
        let mut doc = ProjectDocument::new(ProjectType::TextToImage).with_module("Seed", json!(5));
        assert!(!doc.try_update_model("Seed", |_| {}));
    }
}

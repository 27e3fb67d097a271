//! Output file naming engine.
//!
//! Resolves a user-configurable template such as
//! `{date}_{time}-{model_name}-{seed}` against a [`NamingContext`], applies
//! the grid prefix and batch postfix, and picks a collision-free path in the
//! output directory.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;

use crate::error::CoreError;
use crate::generation::{GenerationParameters, ProjectType};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Template used when the configured one is empty or fails to parse.
pub const DEFAULT_TEMPLATE: &str = "{date}_{time}-{model_name}-{seed}";

/// Prefix applied to grid artifacts.
pub const GRID_PREFIX: &str = "grid_";

/// Highest numeric suffix tried before falling back to a random one.
pub const MAX_NUMERIC_SUFFIX: u32 = 99;

/// Length of the random fallback suffix.
pub const RANDOM_SUFFIX_LEN: usize = 7;

/// Used when a rendered name sanitizes down to nothing.
const EMPTY_NAME_FALLBACK: &str = "image";

/// Characters that are invalid in filenames on at least one major platform.
const INVALID_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// `{name}`, `{name:start}` or `{name:start:length}`.
static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([a-z_]+)(?::(\d+)(?::(\d+))?)?\}").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Naming context
// ---------------------------------------------------------------------------

/// Per-artifact naming inputs.
#[derive(Debug, Clone)]
pub struct NamingContext {
    pub parameters: GenerationParameters,
    pub project_type: Option<ProjectType>,
    pub project_name: Option<String>,
    /// 1-based position in the batch; `0` when not part of a batch.
    pub batch_index: u32,
    pub batch_total: u32,
    pub is_grid: bool,
    /// Source for `{date}` and `{time}`.
    pub timestamp: DateTime<Local>,
}

impl NamingContext {
    pub fn new(parameters: GenerationParameters) -> Self {
        Self {
            parameters,
            project_type: None,
            project_name: None,
            batch_index: 0,
            batch_total: 0,
            is_grid: false,
            timestamp: Local::now(),
        }
    }

    pub fn with_project(mut self, project_type: ProjectType, project_name: Option<String>) -> Self {
        self.project_type = Some(project_type);
        self.project_name = project_name;
        self
    }

    pub fn with_batch(mut self, batch_index: u32, batch_total: u32) -> Self {
        self.batch_index = batch_index;
        self.batch_total = batch_total;
        self
    }

    pub fn as_grid(mut self) -> Self {
        self.is_grid = true;
        self
    }
}

// ---------------------------------------------------------------------------
// Template parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variable {
    Date,
    Time,
    Seed,
    Prompt,
    NegativePrompt,
    ModelName,
    ModelHash,
    Width,
    Height,
    ProjectType,
    ProjectName,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "date" => Self::Date,
            "time" => Self::Time,
            "seed" => Self::Seed,
            "prompt" => Self::Prompt,
            "negative_prompt" => Self::NegativePrompt,
            "model_name" => Self::ModelName,
            "model_hash" => Self::ModelHash,
            "width" => Self::Width,
            "height" => Self::Height,
            "project_type" => Self::ProjectType,
            "project_name" => Self::ProjectName,
            _ => return None,
        })
    }

    fn value(self, ctx: &NamingContext) -> String {
        let p = &ctx.parameters;
        match self {
            Self::Date => ctx.timestamp.format("%Y-%m-%d").to_string(),
            Self::Time => ctx.timestamp.format("%H-%M-%S").to_string(),
            Self::Seed => p.seed.map(|s| s.to_string()).unwrap_or_default(),
            Self::Prompt => p.positive_prompt.clone().unwrap_or_default(),
            Self::NegativePrompt => p.negative_prompt.clone().unwrap_or_default(),
            Self::ModelName => p.model_name.clone().unwrap_or_default(),
            Self::ModelHash => p.model_hash.clone().unwrap_or_default(),
            Self::Width => p.width.map(|w| w.to_string()).unwrap_or_default(),
            Self::Height => p.height.map(|h| h.to_string()).unwrap_or_default(),
            Self::ProjectType => ctx.project_type.map(|t| t.to_string()).unwrap_or_default(),
            Self::ProjectName => ctx.project_name.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Variable {
        variable: Variable,
        start: usize,
        length: Option<usize>,
    },
}

/// A parsed filename template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameTemplate {
    parts: Vec<Part>,
}

impl FileNameTemplate {
    /// Parse a template string.
    ///
    /// Fails on empty templates, unknown variables, and stray braces.
    pub fn parse(template: &str) -> Result<Self, CoreError> {
        if template.trim().is_empty() {
            return Err(CoreError::Validation("Filename template is empty".into()));
        }

        let mut parts = Vec::new();
        let mut cursor = 0;

        for caps in VARIABLE_RE.captures_iter(template) {
            let Some(whole) = caps.get(0) else { continue };
            push_literal(&mut parts, &template[cursor..whole.start()])?;

            let name = &caps[1];
            let variable = Variable::from_name(name).ok_or_else(|| {
                CoreError::Validation(format!("Unknown filename template variable '{name}'"))
            })?;
            let start = parse_index(caps.get(2).map(|m| m.as_str()))?.unwrap_or(0);
            let length = parse_index(caps.get(3).map(|m| m.as_str()))?;

            parts.push(Part::Variable {
                variable,
                start,
                length,
            });
            cursor = whole.end();
        }
        push_literal(&mut parts, &template[cursor..])?;

        Ok(Self { parts })
    }

    /// Substitute every variable from `ctx`.
    pub fn render(&self, ctx: &NamingContext) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Literal(s) => s.clone(),
                Part::Variable {
                    variable,
                    start,
                    length,
                } => {
                    let value = variable.value(ctx);
                    let chars = value.chars().skip(*start);
                    match length {
                        Some(n) => chars.take(*n).collect(),
                        None => chars.collect(),
                    }
                }
            })
            .collect()
    }
}

fn push_literal(parts: &mut Vec<Part>, literal: &str) -> Result<(), CoreError> {
    if literal.contains(['{', '}']) {
        return Err(CoreError::Validation(format!(
            "Unbalanced or malformed braces in filename template near '{literal}'"
        )));
    }
    if !literal.is_empty() {
        parts.push(Part::Literal(literal.to_string()));
    }
    Ok(())
}

fn parse_index(raw: Option<&str>) -> Result<Option<usize>, CoreError> {
    raw.map(|s| {
        s.parse::<usize>()
            .map_err(|e| CoreError::Validation(format!("Invalid template index '{s}': {e}")))
    })
    .transpose()
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve the base filename (no extension, no directory) for an artifact.
///
/// Falls back to [`DEFAULT_TEMPLATE`] with a warning when `template` is
/// missing, empty or invalid. The grid prefix is applied before the batch
/// postfix so a grid never carries a per-member suffix ahead of its prefix.
pub fn resolve_file_name(template: Option<&str>, ctx: &NamingContext) -> String {
    let parsed = match template.map(FileNameTemplate::parse) {
        Some(Ok(parsed)) => parsed,
        other => {
            let reason = match other {
                Some(Err(e)) => e.to_string(),
                _ => "no template configured".to_string(),
            };
            tracing::warn!(
                template = template.unwrap_or_default(),
                reason = %reason,
                "Failed to parse filename template, using default",
            );
            FileNameTemplate::parse(DEFAULT_TEMPLATE).expect("default template is valid")
        }
    };

    let mut name = sanitize_file_name(&parsed.render(ctx));

    if ctx.is_grid {
        name = format!("{GRID_PREFIX}{name}");
    }
    if ctx.batch_index >= 1 && ctx.batch_total > 1 {
        name = format!("{name}{}", batch_postfix(ctx.batch_index, ctx.batch_total));
    }

    name
}

/// `_{index}-of-{total}`.
pub fn batch_postfix(batch_index: u32, batch_total: u32) -> String {
    format!("_{batch_index}-of-{batch_total}")
}

/// Replace characters that cannot appear in a filename and trim the result.
pub fn sanitize_file_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.');

    if trimmed.is_empty() {
        EMPTY_NAME_FALLBACK.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Pick a destination path in `dir` that does not collide with an existing
/// file.
///
/// Tries `base.ext`, then `base_1.ext` through `base_99.ext`. When all of
/// those exist, a random 7-character suffix is used without re-checking.
pub fn resolve_output_path(dir: &Path, base: &str, extension: &str) -> PathBuf {
    let candidate = dir.join(format!("{base}.{extension}"));
    if !candidate.exists() {
        return candidate;
    }

    for i in 1..=MAX_NUMERIC_SUFFIX {
        let candidate = dir.join(format!("{base}_{i}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }

    let random = uuid::Uuid::new_v4().simple().to_string();
    tracing::debug!(
        base,
        "All numeric filename suffixes taken, using random suffix",
    );
    dir.join(format!("{base}_{}.{extension}", &random[..RANDOM_SUFFIX_LEN]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Observable progress of the active job.

use imagegen_comfyui::compute::ProgressUpdate;

/// Value used for both `value` and `maximum` while indeterminate.
pub const INDETERMINATE_SCALE: u32 = 100;

/// Snapshot of the active job's progress. `Default` is the idle state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub value: u32,
    pub maximum: u32,
    pub is_indeterminate: bool,
    pub text: Option<String>,
}

impl ProgressState {
    /// Step-level progress, e.g. `(4 / 20) KSampler`.
    pub fn determinate(update: &ProgressUpdate) -> Self {
        let mut text = format!("({} / {})", update.value, update.maximum);
        if let Some(node) = &update.running_node {
            text.push(' ');
            text.push_str(node);
        }
        Self {
            value: update.value,
            maximum: update.maximum,
            is_indeterminate: false,
            text: Some(text),
        }
    }

    /// A node is running but reports no steps.
    pub fn indeterminate(node: &str) -> Self {
        Self {
            value: INDETERMINATE_SCALE,
            maximum: INDETERMINATE_SCALE,
            is_indeterminate: true,
            text: Some(node.to_string()),
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }

    /// Completion in percent, `0` when the maximum is unknown.
    pub fn percent(&self) -> u8 {
        if self.maximum == 0 {
            return 0;
        }
        ((u64::from(self.value.min(self.maximum)) * 100) / u64::from(self.maximum)) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn determinate_text_includes_node() {
        let state = ProgressState::determinate(&ProgressUpdate {
            value: 4,
            maximum: 20,
            running_node: Some("KSampler".into()),
        });
        assert_eq!(state.text.as_deref(), Some("(4 / 20) KSampler"));
        assert!(!state.is_indeterminate);
        assert_eq!(state.percent(), 20);
    }

    #[test]
    fn determinate_text_without_node() {
        let state = ProgressState::determinate(&ProgressUpdate {
            value: 1,
            maximum: 2,
            running_node: None,
        });
        assert_eq!(state.text.as_deref(), Some("(1 / 2)"));
    }

    #[test]
    fn indeterminate_state() {
        let state = ProgressState::indeterminate("VAEDecode");
        assert_eq!((state.value, state.maximum), (100, 100));
        assert!(state.is_indeterminate);
        assert!(!state.is_idle());
        assert!(ProgressState::default().is_idle());
        assert_eq!(ProgressState::default().percent(), 0);
    }
}

//! Routes compute-engine events into [`ProgressState`] and the gallery.
//!
//! Every mutation goes through the `watch::Sender`'s write lock, so
//! progress, node-change, preview and reset never interleave a partial
//! update and readers only ever see committed snapshots.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use imagegen_comfyui::compute::{PreviewImage, ProgressUpdate};

use crate::gallery::OutputGallery;
use crate::progress::ProgressState;

pub struct EventRouter {
    state: watch::Sender<ProgressState>,
    /// Events are only applied between `begin_job` and `reset`.
    active: AtomicBool,
    progress_seen: AtomicBool,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ProgressState::default());
        Self {
            state,
            active: AtomicBool::new(false),
            progress_seen: AtomicBool::new(false),
        }
    }

    /// Receiver that observes every committed [`ProgressState`].
    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> ProgressState {
        self.state.borrow().clone()
    }

    /// Start accepting events for a new job.
    pub fn begin_job(&self) {
        self.state.send_modify(|state| {
            self.progress_seen.store(false, Ordering::SeqCst);
            self.active.store(true, Ordering::SeqCst);
            *state = ProgressState::default();
        });
    }

    /// Step-level progress always wins and disables node-change updates.
    pub fn on_progress(&self, update: &ProgressUpdate) {
        self.state.send_if_modified(|state| {
            if !self.active.load(Ordering::SeqCst) {
                return false;
            }
            self.progress_seen.store(true, Ordering::SeqCst);
            *state = ProgressState::determinate(update);
            true
        });
    }

    /// Show `node` as indeterminate progress unless step progress started.
    ///
    /// `progress_started` is the task's own flag; it can be set before the
    /// corresponding progress event reaches [`on_progress`](Self::on_progress).
    pub fn on_running_node(&self, node: &str, progress_started: bool) {
        self.state.send_if_modified(|state| {
            if !self.active.load(Ordering::SeqCst)
                || progress_started
                || self.progress_seen.load(Ordering::SeqCst)
            {
                return false;
            }
            *state = ProgressState::indeterminate(node);
            true
        });
    }

    /// Forward a preview frame to the gallery verbatim.
    ///
    /// Activity is checked under the write lock; the gallery is called after
    /// the lock is released.
    pub fn on_preview(&self, preview: PreviewImage, gallery: &dyn OutputGallery) {
        let mut active = false;
        self.state.send_if_modified(|_| {
            active = self.active.load(Ordering::SeqCst);
            false
        });
        if active {
            gallery.set_preview_image(preview);
        }
    }

    /// Return to the idle state and ignore further events until the next
    /// [`begin_job`](Self::begin_job).
    pub fn reset(&self) {
        self.state.send_modify(|state| {
            self.active.store(false, Ordering::SeqCst);
            self.progress_seen.store(false, Ordering::SeqCst);
            *state = ProgressState::default();
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use imagegen_comfyui::compute::PreviewFormat;

    use super::*;
    use crate::collector::OutputArtifact;

    #[derive(Default)]
    struct PreviewLog(Mutex<Vec<PreviewImage>>);

    impl OutputGallery for PreviewLog {
        fn set_preview_image(&self, preview: PreviewImage) {
            self.0.lock().unwrap().push(preview);
        }
        fn clear_preview(&self) {}
        fn clear_images(&self) {}
        fn add_images(&self, _artifacts: &[OutputArtifact]) {}
    }

    fn update(value: u32) -> ProgressUpdate {
        ProgressUpdate {
            value,
            maximum: 10,
            running_node: None,
        }
    }

    #[test]
    fn node_change_before_progress_is_indeterminate() {
        let router = EventRouter::new();
        router.begin_job();
        router.on_running_node("CheckpointLoader", false);
        let state = router.snapshot();
        assert!(state.is_indeterminate);
        assert_eq!(state.text.as_deref(), Some("CheckpointLoader"));
    }

    #[test]
    fn progress_wins_over_node_change() {
        let router = EventRouter::new();
        router.begin_job();
        router.on_progress(&update(3));
        router.on_running_node("VAEDecode", false);
        let state = router.snapshot();
        assert!(!state.is_indeterminate);
        assert_eq!(state.value, 3);
    }

    #[test]
    fn task_progress_flag_suppresses_node_change() {
        let router = EventRouter::new();
        router.begin_job();
        router.on_running_node("KSampler", true);
        assert!(router.snapshot().is_idle());
    }

    #[test]
    fn events_outside_a_job_are_ignored() {
        let router = EventRouter::new();
        router.on_progress(&update(1));
        assert!(router.snapshot().is_idle());

        router.begin_job();
        router.on_progress(&update(2));
        router.reset();
        router.on_progress(&update(5));
        assert!(router.snapshot().is_idle());
    }

    #[test]
    fn previews_forwarded_only_while_active() {
        let router = EventRouter::new();
        let gallery = PreviewLog::default();
        let preview = PreviewImage {
            format: PreviewFormat::Jpeg,
            bytes: vec![1, 2, 3],
        };

        router.on_preview(preview.clone(), &gallery);
        router.begin_job();
        router.on_preview(preview.clone(), &gallery);

        let seen = gallery.0.lock().unwrap();
        assert_eq!(seen.as_slice(), &[preview]);
    }

    /// Gallery that reads router state from inside the sink callback.
    struct ReentrantGallery<'a> {
        router: &'a EventRouter,
        seen: Mutex<Vec<ProgressState>>,
    }

    impl OutputGallery for ReentrantGallery<'_> {
        fn set_preview_image(&self, _preview: PreviewImage) {
            self.seen.lock().unwrap().push(self.router.snapshot());
        }
        fn clear_preview(&self) {}
        fn clear_images(&self) {}
        fn add_images(&self, _artifacts: &[OutputArtifact]) {}
    }

    #[test]
    fn preview_sink_runs_outside_the_state_lock() {
        let router = EventRouter::new();
        router.begin_job();
        router.on_progress(&update(4));
        let gallery = ReentrantGallery {
            router: &router,
            seen: Mutex::new(Vec::new()),
        };

        router.on_preview(
            PreviewImage {
                format: PreviewFormat::Png,
                bytes: vec![9],
            },
            &gallery,
        );

        let seen = gallery.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value, 4);
    }

    #[tokio::test]
    async fn subscribers_see_committed_snapshots() {
        let router = EventRouter::new();
        let mut rx = router.subscribe();
        router.begin_job();
        router.on_progress(&update(7));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().value, 7);
    }
}

//! Resize detection and the extent-dependent resource lifecycle.
//!
//! The extent-dependent resources (swapchain, scene color, depth, visibility
//! buffer) move through `Created → InUse → PendingDestroy → Destroyed` and
//! back. A resize is detected purely by comparing the window's polled extent
//! against the extent the current generation was built for, once per frame,
//! before any recording starts.
//!
//! The transition is stop-the-world on purpose: wait-idle, destroy the whole
//! generation, recreate at the new extent, re-register descriptors. Resize is
//! rare next to steady-state frames, so simplicity wins over throughput here.
//! Frame recording is not allowed between `PendingDestroy` and the completed
//! recreation.

/// Lifecycle state of one generation of extent-dependent resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeState {
    /// Resources exist but have not been used by a frame yet.
    Created,
    /// Resources are valid targets for frame recording.
    InUse,
    /// A new extent was observed; resources must not be recorded against.
    PendingDestroy,
    /// Resources are gone; a new generation must be created.
    Destroyed,
}

/// Tracks the surface extent and drives the resize state machine.
#[derive(Debug)]
pub struct SurfaceTracker {
    extent: (u32, u32),
    pending_extent: Option<(u32, u32)>,
    state: ResizeState,
    generation: u64,
}

impl SurfaceTracker {
    pub fn new(initial_extent: (u32, u32)) -> Self {
        Self {
            extent: initial_extent,
            pending_extent: None,
            state: ResizeState::Created,
            generation: 0,
        }
    }

    pub fn state(&self) -> ResizeState {
        self.state
    }

    /// Extent the current generation was built for.
    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    /// Extent the next generation must be built for, while a resize is in
    /// flight.
    pub fn pending_extent(&self) -> Option<(u32, u32)> {
        self.pending_extent
    }

    /// Monotonic generation counter; bumps on every completed recreation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First frame recorded against a fresh generation.
    pub fn mark_in_use(&mut self) {
        assert_eq!(
            self.state,
            ResizeState::Created,
            "resources can only enter use once, right after creation"
        );
        self.state = ResizeState::InUse;
    }

    /// Compare the polled window extent against the current generation.
    /// Returns true when the resize path must run before this frame.
    ///
    /// Zero-area extents (minimized window) are ignored; the caller should
    /// skip rendering entirely until the window has area again.
    pub fn poll(&mut self, window_extent: (u32, u32)) -> bool {
        if window_extent.0 == 0 || window_extent.1 == 0 {
            return false;
        }
        match self.state {
            ResizeState::InUse | ResizeState::Created => {
                if window_extent != self.extent {
                    log::info!(
                        "surface extent changed {}x{} -> {}x{}",
                        self.extent.0,
                        self.extent.1,
                        window_extent.0,
                        window_extent.1
                    );
                    self.state = ResizeState::PendingDestroy;
                    self.pending_extent = Some(window_extent);
                    true
                } else {
                    false
                }
            }
            // Already mid-resize; the latest extent wins.
            ResizeState::PendingDestroy => {
                self.pending_extent = Some(window_extent);
                true
            }
            ResizeState::Destroyed => true,
        }
    }

    /// The presentation engine reported the surface stale (out of date on
    /// acquire or present). Runs the resize path at the current extent.
    pub fn mark_surface_lost(&mut self) {
        if matches!(self.state, ResizeState::Created | ResizeState::InUse) {
            log::info!("surface reported out of date, recreating at current extent");
            self.state = ResizeState::PendingDestroy;
            self.pending_extent = Some(self.extent);
        }
    }

    /// The old generation's resources have been destroyed (after wait-idle).
    pub fn mark_destroyed(&mut self) {
        assert_eq!(
            self.state,
            ResizeState::PendingDestroy,
            "destruction must follow resize detection"
        );
        self.state = ResizeState::Destroyed;
    }

    /// A new generation exists at `new_extent`; descriptors have been
    /// re-registered and recording may resume.
    pub fn mark_recreated(&mut self, new_extent: (u32, u32)) {
        assert_eq!(
            self.state,
            ResizeState::Destroyed,
            "recreation must follow destruction"
        );
        self.extent = new_extent;
        self.pending_extent = None;
        self.generation += 1;
        self.state = ResizeState::Created;
    }

    /// Whether frame recording is currently legal.
    pub fn is_renderable(&self) -> bool {
        matches!(self.state, ResizeState::Created | ResizeState::InUse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_in_use(extent: (u32, u32)) -> SurfaceTracker {
        let mut tracker = SurfaceTracker::new(extent);
        tracker.mark_in_use();
        tracker
    }

    #[test]
    fn test_same_extent_is_a_noop() {
        let mut tracker = tracker_in_use((640, 480));
        assert!(!tracker.poll((640, 480)));
        assert_eq!(tracker.state(), ResizeState::InUse);
        assert_eq!(tracker.generation(), 0);
    }

    #[test]
    fn test_resize_walks_the_state_machine() {
        let mut tracker = tracker_in_use((640, 480));

        assert!(tracker.poll((1920, 1080)));
        assert_eq!(tracker.state(), ResizeState::PendingDestroy);
        assert!(!tracker.is_renderable());
        assert_eq!(tracker.pending_extent(), Some((1920, 1080)));
        // Old extent is still reported until recreation completes.
        assert_eq!(tracker.extent(), (640, 480));

        tracker.mark_destroyed();
        assert_eq!(tracker.state(), ResizeState::Destroyed);

        tracker.mark_recreated((1920, 1080));
        assert_eq!(tracker.state(), ResizeState::Created);
        assert_eq!(tracker.extent(), (1920, 1080));
        assert_eq!(tracker.generation(), 1);
        assert!(tracker.is_renderable());

        tracker.mark_in_use();
        assert_eq!(tracker.state(), ResizeState::InUse);
    }

    #[test]
    fn test_resize_is_idempotent() {
        let mut tracker = tracker_in_use((640, 480));

        tracker.poll((1920, 1080));
        tracker.mark_destroyed();
        tracker.mark_recreated((1920, 1080));
        tracker.mark_in_use();
        let generation = tracker.generation();

        // Polling the same extent again must not start another cycle.
        assert!(!tracker.poll((1920, 1080)));
        assert_eq!(tracker.state(), ResizeState::InUse);
        assert_eq!(tracker.generation(), generation);
    }

    #[test]
    fn test_latest_extent_wins_mid_resize() {
        let mut tracker = tracker_in_use((640, 480));

        assert!(tracker.poll((800, 600)));
        // The window moved again before the recreation ran.
        assert!(tracker.poll((1920, 1080)));
        assert_eq!(tracker.pending_extent(), Some((1920, 1080)));

        tracker.mark_destroyed();
        tracker.mark_recreated((1920, 1080));
        assert_eq!(tracker.extent(), (1920, 1080));
    }

    #[test]
    fn test_zero_extent_is_ignored() {
        let mut tracker = tracker_in_use((640, 480));
        assert!(!tracker.poll((0, 0)));
        assert!(!tracker.poll((640, 0)));
        assert_eq!(tracker.state(), ResizeState::InUse);
    }

    #[test]
    fn test_surface_lost_recreates_at_current_extent() {
        let mut tracker = tracker_in_use((640, 480));
        tracker.mark_surface_lost();
        assert_eq!(tracker.state(), ResizeState::PendingDestroy);
        assert_eq!(tracker.pending_extent(), Some((640, 480)));

        tracker.mark_destroyed();
        tracker.mark_recreated((640, 480));
        assert_eq!(tracker.generation(), 1);
    }

    #[test]
    #[should_panic(expected = "must follow resize detection")]
    fn test_destroy_without_detection_panics() {
        let mut tracker = tracker_in_use((640, 480));
        tracker.mark_destroyed();
    }

    #[test]
    #[should_panic(expected = "must follow destruction")]
    fn test_recreate_without_destroy_panics() {
        let mut tracker = tracker_in_use((640, 480));
        tracker.poll((1920, 1080));
        tracker.mark_recreated((1920, 1080));
    }
}

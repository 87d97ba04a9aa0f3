//! # Viewport Controller
//!
//! Debounced state machine over the map camera: **Idle → Settling → Settled**.
//!
//! Every pan/zoom arms a trailing debounce timer; only the last interaction of a
//! burst settles. Crossing the performance zoom threshold settles immediately and
//! with `force` set, because it always changes the rendering mode even when the
//! snapped bounds stay the same. Non-forced settles whose snapped viewport equals
//! the last served one are suppressed.
//!
//! The controller never sleeps itself. Callers feed it timestamps and ask for the
//! next deadline, which keeps it deterministic under test.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::geo_utils::{bounds_signature, normalize_bounds};
use crate::{Bounds, Camera};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportState {
    Idle,
    Settling,
    Settled,
}

/// A settled camera that may need serving.
#[derive(Debug, Clone, PartialEq)]
pub struct SettleRequest {
    pub camera: Camera,
    /// Bypass the same-viewport suppression
    pub force: bool,
    /// Monotonic id of the request, used to reject stale completions
    pub sequence: u64,
}

/// Outcome of checking a settle request against the last served viewport.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Fetch this viewport
    Serve { bounds: Bounds, signature: String },
    /// Same viewport as last served and not forced
    Suppressed,
    /// The camera bounds cannot be normalized yet
    InvalidBounds,
}

#[derive(Debug)]
pub struct ViewportController {
    state: ViewportState,
    debounce: Duration,
    performance_threshold: f64,
    grid_step: f64,
    fixed_decimals: usize,
    camera: Option<Camera>,
    deadline: Option<Instant>,
    /// Bumped whenever the pending timer is invalidated
    generation: u64,
    next_sequence: u64,
    last_served: Option<String>,
}

impl ViewportController {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            state: ViewportState::Idle,
            debounce: config.debounce(),
            performance_threshold: config.performance_zoom_threshold,
            grid_step: config.grid_step,
            fixed_decimals: config.fixed_decimals,
            camera: None,
            deadline: None,
            generation: 0,
            next_sequence: 0,
            last_served: None,
        }
    }

    pub fn state(&self) -> ViewportState {
        self.state
    }

    pub fn camera(&self) -> Option<Camera> {
        self.camera
    }

    /// Whether `zoom` renders in performance (clustered) mode.
    pub fn is_performance_zoom(&self, zoom: f64) -> bool {
        zoom <= self.performance_threshold
    }

    fn crosses_threshold(&self, previous: f64, current: f64) -> bool {
        self.is_performance_zoom(previous) != self.is_performance_zoom(current)
    }

    fn cancel_timer(&mut self) {
        if self.deadline.take().is_some() {
            self.generation += 1;
        }
    }

    fn emit(&mut self, camera: Camera, force: bool) -> SettleRequest {
        self.next_sequence += 1;
        self.state = ViewportState::Settled;
        SettleRequest {
            camera,
            force,
            sequence: self.next_sequence,
        }
    }

    /// Record a pan/zoom interaction.
    ///
    /// Returns a forced request right away when the zoom crossed the performance
    /// threshold; otherwise (re)arms the debounce timer and returns `None`.
    pub fn on_camera_changed(&mut self, camera: Camera, now: Instant) -> Option<SettleRequest> {
        let previous = self.camera.replace(camera);
        self.cancel_timer();

        if let Some(previous) = previous {
            if self.crosses_threshold(previous.zoom, camera.zoom) {
                debug!(
                    "[ViewportController] Zoom {} -> {} crossed threshold {}, forcing reload",
                    previous.zoom, camera.zoom, self.performance_threshold
                );
                return Some(self.emit(camera, true));
            }
        }

        self.generation += 1;
        self.deadline = Some(now + self.debounce);
        self.state = ViewportState::Settling;
        None
    }

    /// The pending timer as `(generation, deadline)`.
    pub fn pending_timer(&self) -> Option<(u64, Instant)> {
        self.deadline.map(|deadline| (self.generation, deadline))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fire the timer armed as `generation`. Invalidated or early timers do nothing.
    pub fn fire(&mut self, generation: u64, now: Instant) -> Option<SettleRequest> {
        if generation != self.generation || self.state != ViewportState::Settling {
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let camera = self.camera?;
        Some(self.emit(camera, false))
    }

    /// Fire the current timer if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SettleRequest> {
        self.fire(self.generation, now)
    }

    /// Forced request for the current camera, cancelling any pending timer.
    pub fn force_settle(&mut self) -> Option<SettleRequest> {
        let camera = self.camera?;
        self.cancel_timer();
        Some(self.emit(camera, true))
    }

    /// Decide whether a settle request needs a fetch.
    pub fn admit(&self, request: &SettleRequest) -> Admission {
        let Some(bounds) =
            normalize_bounds(&request.camera.bounds, self.grid_step, self.fixed_decimals)
        else {
            return Admission::InvalidBounds;
        };
        let signature = bounds_signature(&bounds);
        if !request.force && self.last_served.as_deref() == Some(signature.as_str()) {
            debug!("[ViewportController] Viewport {} already served", signature);
            return Admission::Suppressed;
        }
        Admission::Serve { bounds, signature }
    }

    /// Record a successfully served viewport.
    pub fn mark_served(&mut self, signature: String) {
        self.last_served = Some(signature);
    }

    pub fn last_served(&self) -> Option<&str> {
        self.last_served.as_deref()
    }

    pub fn clear_served(&mut self) {
        self.last_served = None;
    }

    /// Cancel timers and forget camera and served state.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.camera = None;
        self.last_served = None;
        self.state = ViewportState::Idle;
    }
}

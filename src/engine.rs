//! # Map Orchestrator
//!
//! Stateful control loop of the map engine. One orchestrator is created per page
//! session and owns every piece of mutable map state:
//! - The viewport controller (debounce, served signature)
//! - The pin lifecycle manager (pins, clusters, popup, countdown)
//! - The pending popup request raised by search/list selection
//! - The active filter fragment and the latest requested viewport
//!
//! A settle is split in two halves, [`MapOrchestrator::begin_settle`] and
//! [`MapOrchestrator::complete_settle`], so the fetch in between can run while
//! newer interactions arrive. Completions for anything but the most recently
//! requested viewport are discarded.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::cluster::{cluster_or_points, Rendering};
use crate::config::EngineConfig;
use crate::error::{MapError, Result};
use crate::http::{ListingSource, SpatialDataLoader};
use crate::pins::{CountdownTick, MapSurface, PinLifecycleManager, ReconcileStats};
use crate::viewport::{Admission, SettleRequest, ViewportController};
use crate::{Bounds, ListingDetail, Location, MapStatus, PendingPopupRequest};

// ============================================================================
// Core Types
// ============================================================================

/// An admitted viewport load waiting for its fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadTicket {
    pub sequence: u64,
    pub signature: String,
    pub bounds: Bounds,
    pub filters: String,
    pub zoom: f64,
}

/// Detail load for the listing whose popup is open.
#[derive(Debug, Clone, PartialEq)]
pub struct DetailTicket {
    pub key: String,
    pub id: String,
}

/// What a settle did.
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// Suppressed or bounds not measurable; nothing fetched
    Skipped,
    /// A newer viewport was requested meanwhile; response discarded
    Stale,
    /// Zero listings in view; pins cleared
    Empty,
    Clustered { clusters: usize, points: usize },
    Pins(ReconcileStats),
    Failed(MapError),
}

// ============================================================================
// Map Orchestrator
// ============================================================================

/// The map engine's control loop and state owner.
pub struct MapOrchestrator<S, B> {
    config: EngineConfig,
    surface: S,
    loader: Arc<SpatialDataLoader<B>>,
    viewport: ViewportController,
    pins: PinLifecycleManager,

    pending_popup: Option<PendingPopupRequest>,
    filters: String,
    /// Sequence and signature of the fetch in flight, if any
    latest_request: Option<(u64, String)>,
    /// Status shown for the last served viewport
    served_status: MapStatus,
    /// True until the first load has been reconciled
    initial_load: bool,
    /// Popup serial a detail load was last issued for
    detail_serial: Option<u64>,
    status: MapStatus,
}

impl<S: MapSurface, B: ListingSource> MapOrchestrator<S, B> {
    /// Create an orchestrator for one page session.
    pub fn new(config: EngineConfig, surface: S, source: B) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            loader: Arc::new(SpatialDataLoader::new(source, &config)),
            viewport: ViewportController::new(&config),
            pins: PinLifecycleManager::new(),
            config,
            surface,
            pending_popup: None,
            filters: String::new(),
            latest_request: None,
            served_status: MapStatus::Idle,
            initial_load: true,
            detail_serial: None,
            status: MapStatus::Idle,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    /// Shared handle to the loader, for running fetches outside `&mut self`.
    pub fn loader(&self) -> Arc<SpatialDataLoader<B>> {
        Arc::clone(&self.loader)
    }

    pub fn pins(&self) -> &PinLifecycleManager {
        &self.pins
    }

    pub fn viewport(&self) -> &ViewportController {
        &self.viewport
    }

    pub fn status(&self) -> &MapStatus {
        &self.status
    }

    pub fn pending_popup(&self) -> Option<&PendingPopupRequest> {
        self.pending_popup.as_ref()
    }

    pub fn filters(&self) -> &str {
        &self.filters
    }

    pub fn is_initial_load(&self) -> bool {
        self.initial_load
    }

    fn set_status(&mut self, status: MapStatus) {
        self.surface.show_status(&status);
        self.status = status;
    }

    // ========================================================================
    // Viewport events
    // ========================================================================

    /// The surface camera moved. Returns a request when it must settle right away.
    pub fn on_camera_changed(&mut self, now: Instant) -> Option<SettleRequest> {
        let camera = self.surface.camera();
        self.viewport.on_camera_changed(camera, now)
    }

    /// Deadline of the pending debounce timer.
    pub fn settle_deadline(&self) -> Option<Instant> {
        self.viewport.next_deadline()
    }

    /// Fire the debounce timer if due.
    pub fn poll_settle(&mut self, now: Instant) -> Option<SettleRequest> {
        self.viewport.poll(now)
    }

    /// Replace the opaque filter fragment and force a reload of the current view.
    pub fn set_filters(&mut self, fragment: &str) -> Option<SettleRequest> {
        if self.filters == fragment {
            return None;
        }
        self.filters = fragment.to_string();
        debug!("[MapOrchestrator] Filters changed to '{}'", self.filters);
        self.viewport.force_settle()
    }

    // ========================================================================
    // Settle
    // ========================================================================

    /// First half of a settle: admission and loading indicator.
    ///
    /// Returns `None` when the settle is suppressed or the bounds are not
    /// measurable yet.
    pub fn begin_settle(&mut self, request: &SettleRequest) -> Option<LoadTicket> {
        match self.viewport.admit(request) {
            Admission::InvalidBounds => {
                debug!("[MapOrchestrator] Bounds not measurable, waiting for next settle");
                self.set_status(MapStatus::WaitingForBounds);
                None
            }
            Admission::Suppressed => {
                // The camera is back on the served viewport; any fetch still in
                // flight is for a viewport the user already left
                if let Some((sequence, signature)) = self.latest_request.take() {
                    debug!(
                        "[MapOrchestrator] Superseding in-flight #{} for {}",
                        sequence, signature
                    );
                    let served = self.served_status.clone();
                    self.set_status(served);
                }
                None
            }
            Admission::Serve { bounds, signature } => {
                self.set_status(MapStatus::Loading);
                self.latest_request = Some((request.sequence, signature.clone()));
                Some(LoadTicket {
                    sequence: request.sequence,
                    signature,
                    bounds,
                    filters: self.filters.clone(),
                    zoom: request.camera.zoom,
                })
            }
        }
    }

    fn is_current(&self, ticket: &LoadTicket) -> bool {
        matches!(
            &self.latest_request,
            Some((sequence, signature))
                if *sequence == ticket.sequence && *signature == ticket.signature
        )
    }

    /// Second half of a settle: reconcile the fetched locations.
    pub fn complete_settle(
        &mut self,
        ticket: LoadTicket,
        result: Result<Vec<Location>>,
    ) -> SettleOutcome {
        if !self.is_current(&ticket) {
            debug!(
                "[MapOrchestrator] Discarding stale response #{} for {}",
                ticket.sequence, ticket.signature
            );
            return SettleOutcome::Stale;
        }
        self.latest_request = None;

        let locations = match result {
            Ok(locations) => locations,
            Err(e) => {
                // Served signature stays untouched so the same viewport retries
                warn!("[MapOrchestrator] Viewport load failed: {}", e);
                self.set_status(MapStatus::Failed {
                    message: e.to_string(),
                });
                return SettleOutcome::Failed(e);
            }
        };

        if locations.is_empty() {
            self.pins.clear(&mut self.surface);
            self.viewport.mark_served(ticket.signature);
            self.initial_load = false;
            self.served_status = MapStatus::Empty;
            self.set_status(MapStatus::Empty);
            return SettleOutcome::Empty;
        }

        let rendering = cluster_or_points(
            &locations,
            ticket.zoom,
            self.config.performance_zoom_threshold,
            self.config.min_cluster_count,
            &self.config.cluster,
        );
        let (outcome, unique) = match &rendering {
            Rendering::Clusters(cells) => {
                self.pins.reconcile(&mut self.surface, &rendering, false);
                let points = cells.iter().map(|cell| cell.count).sum();
                (
                    SettleOutcome::Clustered {
                        clusters: cells.len(),
                        points,
                    },
                    points,
                )
            }
            Rendering::Pins(points) => {
                let append =
                    !self.initial_load && ticket.zoom >= self.config.append_zoom_threshold;
                let stats = self.pins.reconcile(&mut self.surface, &rendering, append);
                (SettleOutcome::Pins(stats), points.len())
            }
        };

        info!(
            "[MapOrchestrator] Served {} ({} unique listings, zoom {})",
            ticket.signature, unique, ticket.zoom
        );
        self.viewport.mark_served(ticket.signature);
        self.initial_load = false;
        self.served_status = MapStatus::Loaded { count: unique };
        self.set_status(self.served_status.clone());
        self.resolve_pending_popup();
        outcome
    }

    /// Run a whole settle inline: admit, fetch, reconcile.
    pub async fn settle_now(&mut self, request: &SettleRequest) -> SettleOutcome {
        let Some(ticket) = self.begin_settle(request) else {
            return SettleOutcome::Skipped;
        };
        let loader = self.loader();
        let result = loader.load_normalized(&ticket.bounds, &ticket.filters).await;
        self.complete_settle(ticket, result)
    }

    // ========================================================================
    // Popups
    // ========================================================================

    fn resolve_pending_popup(&mut self) -> bool {
        let Some(request) = self.pending_popup.as_ref() else {
            return false;
        };
        match self.pins.find_pin(request, self.config.popup_tolerance) {
            Some(key) => {
                debug!("[MapOrchestrator] Resolved pending popup to {}", key);
                self.pending_popup = None;
                self.pins.select_pin(&mut self.surface, &key)
            }
            None => false,
        }
    }

    /// Open the popup for a listing chosen outside the map (search, list).
    ///
    /// When its pin is not on the map yet the request is kept pending, the map
    /// pans to it and the next reconciliation retries. Returns whether the popup
    /// opened right away.
    pub fn request_popup(&mut self, request: PendingPopupRequest) -> bool {
        let (lat, lng) = (request.lat, request.lng);
        self.pending_popup = Some(request);
        if self.resolve_pending_popup() {
            return true;
        }
        debug!(
            "[MapOrchestrator] Popup target ({}, {}) not loaded, panning",
            lat, lng
        );
        self.surface.pan_to(lat, lng);
        false
    }

    /// A pin was clicked on the map.
    pub fn on_pin_clicked(&mut self, key: &str) -> bool {
        self.pending_popup = None;
        self.pins.select_pin(&mut self.surface, key)
    }

    /// A cluster marker was clicked: zoom to its members.
    pub fn on_cluster_clicked(&mut self, key: &str) -> bool {
        let Some(bounds) = self.pins.cluster(key).and_then(|cell| cell.member_bounds()) else {
            return false;
        };
        if bounds.south == bounds.north && bounds.west == bounds.east {
            self.surface.pan_to(bounds.south, bounds.west);
        } else {
            self.surface.fit_bounds(&bounds);
        }
        true
    }

    /// Close the popup (explicit close button or outside click).
    pub fn close_popup(&mut self) -> bool {
        self.pins.close_popup(&mut self.surface)
    }

    /// Detail load owed for a newly opened popup, issued once per open.
    pub fn take_detail_request(&mut self) -> Option<DetailTicket> {
        let (key, serial) = self.pins.open_popup()?;
        if self.detail_serial == Some(serial) {
            return None;
        }
        self.detail_serial = Some(serial);
        let key = key.to_string();
        let id = self.pins.location(&key)?.id.clone()?;
        Some(DetailTicket { key, id })
    }

    /// Show a loaded detail record and start the countdown for time-limited
    /// listings. Ignored when the popup it was loaded for has closed.
    pub fn complete_detail(
        &mut self,
        ticket: DetailTicket,
        result: Result<Option<ListingDetail>>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.pins.open_popup().map(|(key, _)| key) != Some(ticket.key.as_str()) {
            debug!("[MapOrchestrator] Detail for {} arrived after popup closed", ticket.key);
            return false;
        }
        match result {
            Ok(Some(detail)) => {
                self.surface.show_detail(&detail);
                if let Some(finish) = detail.event_finish_time {
                    self.pins
                        .popup_mounted(&mut self.surface, &ticket.key, finish, now);
                }
                true
            }
            Ok(None) => {
                debug!("[MapOrchestrator] No detail record for {}", ticket.id);
                false
            }
            Err(e) => {
                warn!("[MapOrchestrator] Detail load for {} failed: {}", ticket.id, e);
                false
            }
        }
    }

    /// Advance the popup countdown (called once per second).
    pub fn tick_countdown(&mut self, now: DateTime<Utc>) -> Option<CountdownTick> {
        self.pins.tick_countdown(&mut self.surface, now)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Stop timers, detach all pins and forget all per-session state.
    pub fn teardown(&mut self) {
        let removed = self.pins.clear(&mut self.surface);
        self.viewport.reset();
        self.pending_popup = None;
        self.latest_request = None;
        self.served_status = MapStatus::Idle;
        self.initial_load = true;
        self.detail_serial = None;
        self.loader.invalidate_cache();
        self.set_status(MapStatus::Idle);
        info!("[MapOrchestrator] Torn down ({} markers removed)", removed);
    }
}

// ============================================================================
// Tests
// ============================================================================

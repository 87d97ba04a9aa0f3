//! # Pin Lifecycle
//!
//! Owns everything currently drawn on the map surface: individual pins, cluster
//! markers, the single detail popup and its countdown timer.
//!
//! A pin exists here only while it is attached to the surface; there is no hidden
//! or retained state. The [`DisplayedPinSet`] mirrors the identity keys of the
//! attached pins and drives append mode.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use log::debug;
use rstar::primitives::GeomWithData;
use rstar::{PointDistance, RTree, AABB};

use crate::cluster::{ClusterCell, Rendering};
use crate::geo_utils::{coords_match, format_count, format_price_scaled};
use crate::{Camera, ListingDetail, Location, MapStatus, PendingPopupRequest, RawBounds};

const SECONDS_PER_DAY: i64 = 86_400;

/// Surface-assigned handle of an attached marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PinHandle(pub u64);

/// What to draw for an individual listing.
#[derive(Debug, Clone, PartialEq)]
pub struct PinSpec {
    pub key: String,
    pub lat: f64,
    pub lng: f64,
    /// Compact price label
    pub label: String,
    pub thumbnail: Option<String>,
    pub featured: bool,
}

impl PinSpec {
    pub fn from_location(location: &Location) -> Self {
        Self {
            key: location.key(),
            lat: location.lat,
            lng: location.lng,
            label: location
                .price
                .map(format_price_scaled)
                .unwrap_or_else(|| "-".to_string()),
            thumbnail: location.thumbnail.clone(),
            featured: location.featured,
        }
    }
}

/// What to draw for a cluster cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSpec {
    pub key: String,
    pub lat: f64,
    pub lng: f64,
    pub count: usize,
    pub label: String,
    /// Render the "contains a promoted listing" icon
    pub featured: bool,
}

impl ClusterSpec {
    pub fn from_cell(cell: &ClusterCell) -> Self {
        Self {
            key: cell.key.clone(),
            lat: cell.center_lat,
            lng: cell.center_lng,
            count: cell.count,
            label: format_count(cell.count),
            featured: cell.has_featured_item,
        }
    }
}

/// Summary content of a pin's popup.
#[derive(Debug, Clone, PartialEq)]
pub struct PopupContent {
    pub key: String,
    pub title: String,
    pub price_label: String,
    pub thumbnail: Option<String>,
}

impl PopupContent {
    pub fn from_location(location: &Location) -> Self {
        Self {
            key: location.key(),
            title: location
                .address
                .clone()
                .unwrap_or_else(|| format!("{:.5}, {:.5}", location.lat, location.lng)),
            price_label: location
                .price
                .map(format_price_scaled)
                .unwrap_or_else(|| "-".to_string()),
            thumbnail: location.thumbnail.clone(),
        }
    }
}

/// The external map surface the engine drives.
///
/// Implementations render; the engine only decides what is shown and when.
pub trait MapSurface {
    /// Current camera (bounds and zoom).
    fn camera(&self) -> Camera;
    fn attach_pin(&mut self, pin: &PinSpec) -> PinHandle;
    fn attach_cluster(&mut self, cluster: &ClusterSpec) -> PinHandle;
    fn detach(&mut self, handle: PinHandle);
    /// Toggle the dimmed/selected look of a pin.
    fn set_selected(&mut self, handle: PinHandle, selected: bool);
    /// Open the single detail popup anchored to a pin.
    fn open_popup(&mut self, handle: PinHandle, content: &PopupContent);
    fn close_popup(&mut self);
    fn update_countdown(&mut self, handle: PinHandle, label: &str);
    fn show_status(&mut self, status: &MapStatus);
    fn show_detail(&mut self, detail: &ListingDetail);
    fn pan_to(&mut self, lat: f64, lng: f64);
    fn fit_bounds(&mut self, bounds: &RawBounds);
}

/// Identity keys of the pins currently attached to the surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayedPinSet {
    keys: HashSet<String>,
}

impl DisplayedPinSet {
    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    fn insert(&mut self, key: String) -> bool {
        self.keys.insert(key)
    }

    fn clear(&mut self) {
        self.keys.clear();
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys in sorted order.
    pub fn sorted(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.iter().cloned().collect();
        keys.sort();
        keys
    }
}

/// Counts from one reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub attached: usize,
    /// Pins skipped because they were already displayed
    pub skipped: usize,
    pub removed: usize,
    pub appended: bool,
}

/// One tick of the popup countdown.
#[derive(Debug, Clone, PartialEq)]
pub struct CountdownTick {
    pub owner_key: String,
    pub remaining_secs: i64,
    pub label: String,
    pub finished: bool,
}

/// `HH:MM:SS` for a remainder, wrapped into a 24-hour window.
///
/// Remainders longer than one day only show their position within the current
/// day, so the label never grows past `24:00:00`.
pub fn format_countdown(remaining_secs: i64) -> String {
    let mut secs = remaining_secs.max(0);
    if secs > SECONDS_PER_DAY {
        secs = (secs - 1) % SECONDS_PER_DAY + 1;
    }
    format!(
        "{:02}:{:02}:{:02}",
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

struct AttachedPin {
    handle: PinHandle,
    location: Location,
}

struct AttachedCluster {
    handle: PinHandle,
    cell: ClusterCell,
}

struct OpenPopup {
    key: String,
    handle: PinHandle,
    serial: u64,
}

struct Countdown {
    owner_key: String,
    handle: PinHandle,
    finish: DateTime<Utc>,
}

type PinPoint = GeomWithData<[f64; 2], String>;

/// Owner of the rendered pin set, the popup and its countdown.
pub struct PinLifecycleManager {
    pins: HashMap<String, AttachedPin>,
    clusters: HashMap<String, AttachedCluster>,
    displayed: DisplayedPinSet,
    // Spatial index over attached pins, [lng, lat]
    index: RTree<PinPoint>,
    popup: Option<OpenPopup>,
    /// Bumped on every popup open
    popup_serial: u64,
    selected: Option<PinHandle>,
    countdown: Option<Countdown>,
}

impl PinLifecycleManager {
    pub fn new() -> Self {
        Self {
            pins: HashMap::new(),
            clusters: HashMap::new(),
            displayed: DisplayedPinSet::default(),
            index: RTree::new(),
            popup: None,
            popup_serial: 0,
            selected: None,
            countdown: None,
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Reconcile the surface with a new rendering.
    ///
    /// The popup (and its countdown) is always closed first. Clusters and
    /// non-append loads replace everything; append mode keeps attached pins and
    /// adds only keys not displayed yet. Append mode is ignored while cluster
    /// markers are on screen.
    pub fn reconcile<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        rendering: &Rendering,
        append_mode: bool,
    ) -> ReconcileStats {
        self.close_popup(surface);

        let append = append_mode && !rendering.is_clustered() && self.clusters.is_empty();
        let mut stats = ReconcileStats {
            appended: append,
            ..ReconcileStats::default()
        };
        if !append {
            stats.removed = self.clear_markers(surface);
        }

        match rendering {
            Rendering::Clusters(cells) => {
                for cell in cells {
                    let handle = surface.attach_cluster(&ClusterSpec::from_cell(cell));
                    self.clusters.insert(
                        cell.key.clone(),
                        AttachedCluster {
                            handle,
                            cell: cell.clone(),
                        },
                    );
                    stats.attached += 1;
                }
            }
            Rendering::Pins(locations) => {
                for location in locations {
                    if self.attach_pin(surface, location) {
                        stats.attached += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
            }
        }

        debug!(
            "[PinLifecycle] Reconciled: +{} skipped {} removed {} (append: {})",
            stats.attached, stats.skipped, stats.removed, append
        );
        stats
    }

    fn attach_pin<S: MapSurface + ?Sized>(&mut self, surface: &mut S, location: &Location) -> bool {
        let spec = PinSpec::from_location(location);
        if self.displayed.contains(&spec.key) {
            return false;
        }
        let handle = surface.attach_pin(&spec);
        // Only recorded once the surface holds the pin
        self.displayed.insert(spec.key.clone());
        self.index
            .insert(GeomWithData::new([location.lng, location.lat], spec.key.clone()));
        self.pins.insert(
            spec.key,
            AttachedPin {
                handle,
                location: location.clone(),
            },
        );
        true
    }

    fn clear_markers<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> usize {
        let removed = self.pins.len() + self.clusters.len();
        for (_, pin) in self.pins.drain() {
            surface.detach(pin.handle);
        }
        for (_, cluster) in self.clusters.drain() {
            surface.detach(cluster.handle);
        }
        self.displayed.clear();
        self.index = RTree::new();
        removed
    }

    /// Detach everything and close the popup.
    pub fn clear<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> usize {
        self.close_popup(surface);
        self.clear_markers(surface)
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the pin a popup request refers to: by identity first, then the nearest
    /// pin within `tolerance` degrees.
    pub fn find_pin(&self, request: &PendingPopupRequest, tolerance: f64) -> Option<String> {
        if let Some(key) = request.key() {
            if self.pins.contains_key(&key) {
                return Some(key);
            }
        }
        let target = [request.lng, request.lat];
        let window = AABB::from_corners(
            [request.lng - tolerance, request.lat - tolerance],
            [request.lng + tolerance, request.lat + tolerance],
        );
        self.index
            .locate_in_envelope(&window)
            .filter(|pin| {
                let [lng, lat] = *pin.geom();
                coords_match(lat, lng, request.lat, request.lng, tolerance)
            })
            .min_by(|a, b| {
                a.distance_2(&target)
                    .partial_cmp(&b.distance_2(&target))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|pin| pin.data.clone())
    }

    pub fn location(&self, key: &str) -> Option<&Location> {
        self.pins.get(key).map(|pin| &pin.location)
    }

    pub fn cluster(&self, key: &str) -> Option<&ClusterCell> {
        self.clusters.get(key).map(|cluster| &cluster.cell)
    }

    pub fn handle_of(&self, key: &str) -> Option<PinHandle> {
        self.pins.get(key).map(|pin| pin.handle)
    }

    pub fn displayed_keys(&self) -> &DisplayedPinSet {
        &self.displayed
    }

    pub fn pin_count(&self) -> usize {
        self.pins.len()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    // ========================================================================
    // Popup and selection
    // ========================================================================

    /// Select a pin and open its popup, closing any previous one first.
    pub fn select_pin<S: MapSurface + ?Sized>(&mut self, surface: &mut S, key: &str) -> bool {
        let Some(pin) = self.pins.get(key) else {
            return false;
        };
        let handle = pin.handle;
        let content = PopupContent::from_location(&pin.location);

        self.close_popup(surface);
        surface.set_selected(handle, true);
        self.selected = Some(handle);
        surface.open_popup(handle, &content);
        self.popup_serial += 1;
        self.popup = Some(OpenPopup {
            key: key.to_string(),
            handle,
            serial: self.popup_serial,
        });
        true
    }

    /// Close the popup by any path. Stops the countdown and restores the selected
    /// pin in the same call.
    pub fn close_popup<S: MapSurface + ?Sized>(&mut self, surface: &mut S) -> bool {
        self.stop_countdown();
        let was_open = self.popup.take().is_some();
        if was_open {
            surface.close_popup();
        }
        if let Some(handle) = self.selected.take() {
            surface.set_selected(handle, false);
        }
        was_open
    }

    pub fn open_popup_key(&self) -> Option<&str> {
        self.popup.as_ref().map(|popup| popup.key.as_str())
    }

    /// Key and serial of the open popup. The serial changes on every open, even
    /// when the same pin is reopened.
    pub fn open_popup(&self) -> Option<(&str, u64)> {
        self.popup
            .as_ref()
            .map(|popup| (popup.key.as_str(), popup.serial))
    }

    pub fn selected_handle(&self) -> Option<PinHandle> {
        self.selected
    }

    // ========================================================================
    // Countdown
    // ========================================================================

    /// Start the countdown once the popup content for `key` has mounted.
    ///
    /// Ignored when `key` is no longer the open popup. Renders the first label
    /// immediately and returns whether the countdown is running.
    pub fn popup_mounted<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        key: &str,
        finish: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let handle = match &self.popup {
            Some(popup) if popup.key == key => popup.handle,
            _ => {
                debug!("[PinLifecycle] Popup for {} is gone, countdown not started", key);
                return false;
            }
        };
        self.countdown = Some(Countdown {
            owner_key: key.to_string(),
            handle,
            finish,
        });
        self.tick_countdown(surface, now);
        self.countdown.is_some()
    }

    /// Advance the countdown.
    ///
    /// The remainder is re-derived from the finish time on every tick. The timer
    /// stops when it runs out or when its owner is no longer the open popup.
    pub fn tick_countdown<S: MapSurface + ?Sized>(
        &mut self,
        surface: &mut S,
        now: DateTime<Utc>,
    ) -> Option<CountdownTick> {
        let countdown = self.countdown.as_ref()?;
        let owner_open = self
            .popup
            .as_ref()
            .is_some_and(|popup| popup.key == countdown.owner_key);
        if !owner_open {
            debug!(
                "[PinLifecycle] Stopping stale countdown for {}",
                countdown.owner_key
            );
            self.countdown = None;
            return None;
        }

        let remaining = (countdown.finish - now).num_seconds().max(0);
        let label = format_countdown(remaining);
        surface.update_countdown(countdown.handle, &label);
        let tick = CountdownTick {
            owner_key: countdown.owner_key.clone(),
            remaining_secs: remaining,
            label,
            finished: remaining == 0,
        };
        if tick.finished {
            self.countdown = None;
        }
        Some(tick)
    }

    pub fn countdown_owner(&self) -> Option<&str> {
        self.countdown.as_ref().map(|c| c.owner_key.as_str())
    }

    pub fn stop_countdown(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            debug!("[PinLifecycle] Countdown for {} stopped", countdown.owner_key);
        }
    }
}

impl Default for PinLifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

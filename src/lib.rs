//! # Listing Map
//!
//! Viewport-driven spatial loading and clustering engine for listing maps.
//!
//! This library provides:
//! - Grid-snapped viewport normalization for cache-friendly backend queries
//! - Zoom-dependent grid clustering of listing locations
//! - Debounced viewport settling with redundant-fetch suppression
//! - Incremental pin reconciliation with a single detail popup and countdown
//!
//! The engine never renders anything itself. It decides *what* should be on the map
//! and *when*, and drives an external [`MapSurface`] to show it.
//!
//! ## Features
//!
//! - **`http`** (default) - reqwest-backed [`http::HttpListingSource`] transport
//!
//! ## Quick Start
//!
//! ```rust
//! use listing_map::geo_utils::{bounds_signature, normalize_bounds};
//! use listing_map::RawBounds;
//!
//! let raw = RawBounds::new(34.0, 135.0, 34.1, 135.1);
//! let bounds = normalize_bounds(&raw, 0.001, 4).unwrap();
//! assert_eq!(bounds.max_lat, "34.1000");
//! assert_eq!(bounds_signature(&bounds), "34.1000|135.1000|34.0000|135.0000");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{MapError, OptionExt, Result};

// Engine configuration
pub mod config;
pub use config::{ClusterConfig, EngineConfig, Endpoints, PrecisionBand};

// Geographic utilities (grid snapping, signatures, formatting, dedup)
pub mod geo_utils;

// Zoom-dependent grid clustering
pub mod cluster;
pub use cluster::{ClusterCell, Rendering};

// LRU + TTL cache of viewport responses
pub mod cache;
pub use cache::ViewportCache;

// Backend transport and response normalization
pub mod http;
pub use http::{ListingSource, SourceResponse, SpatialDataLoader};

// Debounced viewport state machine
pub mod viewport;
pub use viewport::{Admission, SettleRequest, ViewportController, ViewportState};

// Rendered pins, popup and countdown
pub mod pins;
pub use pins::{
    ClusterSpec, CountdownTick, DisplayedPinSet, MapSurface, PinHandle, PinLifecycleManager,
    PinSpec, PopupContent, ReconcileStats,
};

// Control loop composing the components above
pub mod engine;
pub use engine::{DetailTicket, LoadTicket, MapOrchestrator, SettleOutcome};

// Single-threaded tokio event loop
pub mod driver;
pub use driver::{run, MapEvent};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("ListingMap"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// Viewport rectangle as reported by the map surface, before grid snapping.
///
/// Any corner may be non-finite while the map is not yet laid out.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawBounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl RawBounds {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    /// Check whether a point lies inside (edges included).
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.south && lat <= self.north && lng >= self.west && lng <= self.east
    }
}

/// Grid-snapped viewport bounds.
///
/// Coordinates are kept in their rendered fixed-decimal form because that exact
/// text is what goes into the backend query string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: String,
    pub min_lon: String,
    pub max_lat: String,
    pub max_lon: String,
}

impl Bounds {
    /// Parse the rendered coordinates back into raw bounds.
    ///
    /// Rendered values always parse, so an unparseable field can only come from a
    /// hand-built value and is mapped to NaN (which normalization rejects).
    pub fn as_raw(&self) -> RawBounds {
        let parse = |s: &str| s.parse::<f64>().unwrap_or(f64::NAN);
        RawBounds {
            south: parse(&self.min_lat),
            west: parse(&self.min_lon),
            north: parse(&self.max_lat),
            east: parse(&self.max_lon),
        }
    }
}

/// Snapshot of the map camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub bounds: RawBounds,
    pub zoom: f64,
}

impl Camera {
    pub fn new(bounds: RawBounds, zoom: f64) -> Self {
        Self { bounds, zoom }
    }
}

/// A listing location in canonical form.
///
/// `(producer, id)` is the identity. When `id` is absent the coordinate pair is used
/// instead (see [`geo_utils::identity_key`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Option<String>,
    /// Tenant/source key the listing belongs to
    pub producer: Option<String>,
    pub lat: f64,
    pub lng: f64,
    pub price: Option<f64>,
    pub thumbnail: Option<String>,
    pub address: Option<String>,
    pub event_id: Option<String>,
    /// Promoted listing marker
    pub featured: bool,
}

impl Location {
    /// Create a location with only identity and coordinates set.
    pub fn new(producer: &str, id: &str, lat: f64, lng: f64) -> Self {
        Self {
            id: Some(id.to_string()),
            producer: Some(producer.to_string()),
            lat,
            lng,
            price: None,
            thumbnail: None,
            address: None,
            event_id: None,
            featured: false,
        }
    }

    /// Identity key, `producer_id` or a coordinate fallback.
    pub fn key(&self) -> String {
        geo_utils::identity_key(self)
    }
}

/// Detail record for the sidebar/detail panel of a single listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingDetail {
    pub id: String,
    pub producer: Option<String>,
    pub title: Option<String>,
    pub address: Option<String>,
    pub price: Option<f64>,
    pub thumbnail: Option<String>,
    pub description: Option<String>,
    pub event_id: Option<String>,
    /// End of a time-limited promotion; drives the popup countdown
    pub event_finish_time: Option<DateTime<Utc>>,
}

/// Request to open the popup of a listing whose pin may not be loaded yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingPopupRequest {
    pub lat: f64,
    pub lng: f64,
    pub producer: Option<String>,
    pub id: Option<String>,
}

impl PendingPopupRequest {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            producer: None,
            id: None,
        }
    }

    pub fn for_location(location: &Location) -> Self {
        Self {
            lat: location.lat,
            lng: location.lng,
            producer: location.producer.clone(),
            id: location.id.clone(),
        }
    }

    /// Identity key when the request names a listing id.
    pub fn key(&self) -> Option<String> {
        self.id.as_ref().map(|id| {
            geo_utils::compose_key(self.producer.as_deref(), id)
        })
    }
}

/// Map status line shown in place of the loading indicator.
#[derive(Debug, Clone, PartialEq)]
pub enum MapStatus {
    Idle,
    Loading,
    /// The map is not measurable yet; the next settle retries
    WaitingForBounds,
    Loaded { count: usize },
    /// Zero listings in the viewport (not an error)
    Empty,
    Failed { message: String },
}

impl MapStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, MapStatus::Failed { .. })
    }
}

impl std::fmt::Display for MapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapStatus::Idle => Ok(()),
            MapStatus::Loading => write!(f, "Loading listings..."),
            MapStatus::WaitingForBounds => write!(f, "Waiting for the map to be ready"),
            MapStatus::Loaded { count } => {
                write!(f, "{} listings in view", geo_utils::format_count(*count))
            }
            MapStatus::Empty => write!(f, "No listings in this area"),
            MapStatus::Failed { message } => write!(f, "Could not load listings: {}", message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_key() {
        let loc = Location::new("acme", "42", 34.5, 135.5);
        assert_eq!(loc.key(), "acme_42");

        let request = PendingPopupRequest::for_location(&loc);
        assert_eq!(request.key().as_deref(), Some("acme_42"));
        assert_eq!(PendingPopupRequest::at(34.5, 135.5).key(), None);
    }

    #[test]
    fn test_listing_detail_serde_keeps_finish_time() {
        let finish = DateTime::parse_from_rfc3339("2026-10-18T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let detail = ListingDetail {
            id: "42".to_string(),
            producer: Some("acme".to_string()),
            title: None,
            address: None,
            price: Some(35_000_000.0),
            thumbnail: None,
            description: None,
            event_id: None,
            event_finish_time: Some(finish),
        };
        let json = serde_json::to_string(&detail).unwrap();
        let back: ListingDetail = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_finish_time, Some(finish));
        assert_eq!(back, detail);
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(
            MapStatus::Loaded { count: 1234 }.to_string(),
            "1,234 listings in view"
        );
        assert_eq!(MapStatus::Empty.to_string(), "No listings in this area");
        assert!(MapStatus::Failed {
            message: "HTTP 500".into()
        }
        .is_failure());
    }
}

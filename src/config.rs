//! Engine configuration.
//!
//! All tunables live in [`EngineConfig`]. Every field has a documented default so a
//! partial JSON document is enough to override a single value.

use serde::{Deserialize, Serialize};

use crate::error::{MapError, Result};

/// Top-level configuration for the map engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Grid step used to snap viewport corners, in degrees.
    /// Default: 0.001 (~110 m)
    pub grid_step: f64,

    /// Decimals used when rendering snapped coordinates into the query.
    /// Must be able to represent `grid_step` exactly. Default: 4
    pub fixed_decimals: usize,

    /// Trailing debounce window for pan/zoom bursts, in milliseconds.
    /// Default: 400
    pub debounce_ms: u64,

    /// Zoom at or below which the map renders in performance (clustered) mode.
    /// Default: 15.0
    pub performance_zoom_threshold: f64,

    /// Zoom at or above which non-initial pin loads append instead of replacing.
    /// Must be greater than `performance_zoom_threshold`. Default: 16.0
    pub append_zoom_threshold: f64,

    /// Clustering only kicks in when the unique point count exceeds this.
    /// Default: 30
    pub min_cluster_count: usize,

    /// Coordinate tolerance for resolving popup requests without an id, in degrees.
    /// Default: 0.0001 (~11 m)
    pub popup_tolerance: f64,

    /// Number of viewport responses kept in the cache. 0 disables caching.
    /// Default: 64
    pub cache_capacity: usize,

    /// Age after which a cached viewport response is refetched, in seconds.
    /// Default: 60
    pub cache_ttl_secs: u64,

    /// HTTP request timeout, in seconds. Default: 30
    pub request_timeout_secs: u64,

    pub cluster: ClusterConfig,

    pub endpoints: Endpoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            grid_step: 0.001,
            fixed_decimals: 4,
            debounce_ms: 400,
            performance_zoom_threshold: 15.0,
            append_zoom_threshold: 16.0,
            min_cluster_count: 30,
            popup_tolerance: 0.0001,
            cache_capacity: 64,
            cache_ttl_secs: 60,
            request_timeout_secs: 30,
            cluster: ClusterConfig::default(),
            endpoints: Endpoints::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a (possibly partial) JSON configuration and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)
            .map_err(|e| MapError::config(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !(self.grid_step.is_finite() && self.grid_step > 0.0) {
            return Err(MapError::config("grid_step must be a positive number"));
        }
        if self.fixed_decimals > 10 {
            return Err(MapError::config("fixed_decimals must be at most 10"));
        }
        // The rendered grid must survive a parse/render round trip, otherwise
        // normalization stops being idempotent.
        let scale = 10f64.powi(self.fixed_decimals as i32);
        let scaled = self.grid_step * scale;
        if (scaled - scaled.round()).abs() > 1e-6 || scaled.round() < 1.0 {
            return Err(MapError::config(format!(
                "fixed_decimals {} cannot represent grid_step {}",
                self.fixed_decimals, self.grid_step
            )));
        }
        if self.append_zoom_threshold <= self.performance_zoom_threshold {
            return Err(MapError::config(format!(
                "append_zoom_threshold ({}) must be greater than performance_zoom_threshold ({})",
                self.append_zoom_threshold, self.performance_zoom_threshold
            )));
        }
        if !(self.popup_tolerance.is_finite() && self.popup_tolerance >= 0.0) {
            return Err(MapError::config("popup_tolerance must be non-negative"));
        }
        self.cluster.validate()
    }

    pub fn debounce(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.debounce_ms)
    }

    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

/// One step of the zoom → grid precision table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionBand {
    /// Band applies to zoom levels at or below this value
    pub max_zoom: f64,
    /// Grid cell width in degrees
    pub precision: f64,
}

/// Precision table for grid clustering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Bands sorted by ascending `max_zoom`, with non-increasing precision.
    pub precision_table: Vec<PrecisionBand>,

    /// Cell width pinned for every zoom above the last band.
    /// Default: 0.02
    pub near_threshold_precision: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            precision_table: vec![
                PrecisionBand { max_zoom: 6.0, precision: 2.0 },
                PrecisionBand { max_zoom: 8.0, precision: 1.0 },
                PrecisionBand { max_zoom: 10.0, precision: 0.5 },
                PrecisionBand { max_zoom: 12.0, precision: 0.1 },
                PrecisionBand { max_zoom: 14.0, precision: 0.05 },
            ],
            near_threshold_precision: 0.02,
        }
    }
}

impl ClusterConfig {
    /// Zoom above which the near-threshold band applies.
    pub fn near_threshold_zoom(&self) -> f64 {
        self.precision_table
            .last()
            .map(|band| band.max_zoom)
            .unwrap_or(f64::NEG_INFINITY)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |p: f64| p.is_finite() && p > 0.0;
        if !positive(self.near_threshold_precision) {
            return Err(MapError::config("near_threshold_precision must be positive"));
        }
        let mut previous: Option<&PrecisionBand> = None;
        for band in &self.precision_table {
            if !positive(band.precision) || !band.max_zoom.is_finite() {
                return Err(MapError::config(format!(
                    "invalid precision band {:?}",
                    band
                )));
            }
            if let Some(prev) = previous {
                if band.max_zoom <= prev.max_zoom || band.precision > prev.precision {
                    return Err(MapError::config(
                        "precision_table must ascend in zoom and not coarsen",
                    ));
                }
            }
            previous = Some(band);
        }
        if let Some(last) = previous {
            if self.near_threshold_precision > last.precision {
                return Err(MapError::config(
                    "near_threshold_precision must not be coarser than the last band",
                ));
            }
        }
        Ok(())
    }
}

/// Backend endpoint URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Viewport search: `GET <viewport_search>?minLat&minLon&maxLat&maxLon&<filters>`
    pub viewport_search: String,
    /// Item detail: `GET <detail>/{id}` and `GET <detail>/{id}/room/sync`
    pub detail: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            viewport_search: "http://localhost:8080/api/locations/viewport".to_string(),
            detail: "http://localhost:8080/api/items".to_string(),
        }
    }
}

//! Zoom-dependent grid clustering.
//!
//! Points are bucketed by rounding their coordinates to a zoom-dependent grid
//! precision. Each non-empty bucket becomes one [`ClusterCell`] centred on the
//! average of its unique members. Clustering is pure and deterministic: the same
//! input and zoom always produce the same list of cells.

use std::collections::{BTreeMap, HashSet};

use geo::{BoundingRect, MultiPoint, Point};

use crate::config::ClusterConfig;
use crate::geo_utils::{dedupe_by_identity, identity_key};
use crate::{Location, RawBounds};

/// Upper bound on the decimals used in grid keys.
const MAX_KEY_DECIMALS: i32 = 6;

/// An aggregated marker standing in for nearby locations.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterCell {
    /// Grid key (`lat_lng` rounded to the active precision)
    pub key: String,
    pub center_lat: f64,
    pub center_lng: f64,
    /// Number of unique members
    pub count: usize,
    pub member_locations: Vec<Location>,
    /// At least one member is a promoted listing
    pub has_featured_item: bool,
}

impl ClusterCell {
    /// Bounding rectangle of the members, used to zoom into the cluster.
    pub fn member_bounds(&self) -> Option<RawBounds> {
        let points: MultiPoint<f64> = self
            .member_locations
            .iter()
            .map(|loc| Point::new(loc.lng, loc.lat))
            .collect::<Vec<_>>()
            .into();
        let rect = points.bounding_rect()?;
        Some(RawBounds::new(
            rect.min().y,
            rect.min().x,
            rect.max().y,
            rect.max().x,
        ))
    }
}

/// What a settle ends up drawing.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendering {
    /// Detail mode: one pin per location
    Pins(Vec<Location>),
    /// Performance mode: one marker per cluster cell
    Clusters(Vec<ClusterCell>),
}

impl Rendering {
    pub fn len(&self) -> usize {
        match self {
            Rendering::Pins(points) => points.len(),
            Rendering::Clusters(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_clustered(&self) -> bool {
        matches!(self, Rendering::Clusters(_))
    }
}

/// Grid precision (cell width in degrees) for a zoom level.
///
/// Coarsest at low zoom and refining through the table; every zoom above the
/// last band is pinned to the near-threshold precision.
pub fn precision_for_zoom(zoom: f64, config: &ClusterConfig) -> f64 {
    if zoom > config.near_threshold_zoom() {
        return config.near_threshold_precision;
    }
    config
        .precision_table
        .iter()
        .find(|band| zoom <= band.max_zoom)
        .map(|band| band.precision)
        .unwrap_or(config.near_threshold_precision)
}

/// Decimals kept in a grid key for a precision: coarser grids keep fewer.
pub fn key_decimals(precision: f64) -> usize {
    let decimals = (-precision.log10() - 1e-9).ceil() as i32;
    decimals.clamp(0, MAX_KEY_DECIMALS) as usize
}

fn grid_key(lat: f64, lng: f64, precision: f64, decimals: usize) -> String {
    let round = |v: f64| (v / precision).round() * precision + 0.0;
    format!("{:.*}_{:.*}", decimals, round(lat), decimals, round(lng))
}

#[derive(Default)]
struct Accumulator {
    sum_lat: f64,
    sum_lng: f64,
    members: Vec<Location>,
    identities: HashSet<String>,
    featured: bool,
}

/// Group points into grid cells for the given zoom.
///
/// Within a cell a point whose identity was already seen is skipped, so duplicate
/// source records never inflate counts. Cells are returned ordered by key.
pub fn group_by_grid(points: &[Location], zoom: f64, config: &ClusterConfig) -> Vec<ClusterCell> {
    let precision = precision_for_zoom(zoom, config);
    let decimals = key_decimals(precision);

    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    for point in points {
        if !(point.lat.is_finite() && point.lng.is_finite()) {
            continue;
        }
        let key = grid_key(point.lat, point.lng, precision, decimals);
        let group = groups.entry(key).or_default();
        if !group.identities.insert(identity_key(point)) {
            continue;
        }
        group.sum_lat += point.lat;
        group.sum_lng += point.lng;
        group.featured |= point.featured;
        group.members.push(point.clone());
    }

    groups
        .into_iter()
        .filter(|(_, group)| !group.members.is_empty())
        .map(|(key, group)| {
            let count = group.members.len();
            ClusterCell {
                key,
                center_lat: group.sum_lat / count as f64,
                center_lng: group.sum_lng / count as f64,
                count,
                member_locations: group.members,
                has_featured_item: group.featured,
            }
        })
        .collect()
}

/// Decide between detail and performance rendering.
///
/// Points are de-duplicated first. Clusters are produced only when the zoom is at
/// or below `performance_threshold` and more than `min_cluster_count` unique points
/// remain.
pub fn cluster_or_points(
    points: &[Location],
    zoom: f64,
    performance_threshold: f64,
    min_cluster_count: usize,
    config: &ClusterConfig,
) -> Rendering {
    let unique = dedupe_by_identity(points);
    if zoom <= performance_threshold && unique.len() > min_cluster_count {
        Rendering::Clusters(group_by_grid(&unique, zoom, config))
    } else {
        Rendering::Pins(unique)
    }
}

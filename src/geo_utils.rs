//! Geographic utilities.
//!
//! Pure functions for coordinate validation, viewport grid snapping, viewport
//! signatures, identity handling and display formatting. Every caching and
//! dedup guarantee of the engine rests on the contracts in this module.

use std::collections::HashSet;

use serde_json::Value;

use crate::{Bounds, Location, RawBounds};

/// Quotients this close to an integer are treated as already on the grid.
const GRID_EPSILON: f64 = 1e-9;

/// Strict finiteness check. NaN and infinities are rejected.
#[inline]
pub fn is_finite_number(v: f64) -> bool {
    v.is_finite()
}

/// Lenient numeric read of a JSON value: numbers and numeric strings.
///
/// Returns `None` for anything that does not yield a finite number.
pub fn parse_finite(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    is_finite_number(v).then_some(v)
}

fn snap(value: f64, step: f64, ceil: bool) -> f64 {
    let q = value / step;
    let nearest = q.round();
    let cells = if (q - nearest).abs() < GRID_EPSILON {
        nearest
    } else if ceil {
        q.ceil()
    } else {
        q.floor()
    };
    // Adding 0.0 turns -0.0 into 0.0 so it renders without a sign.
    cells * step + 0.0
}

/// Snap raw bounds outward to the grid and render them with fixed decimals.
///
/// Returns `None` when a corner is non-finite, the step is not positive or the
/// corners are inverted. South-west is floored, north-east is ceiled, so two raw
/// viewports whose corners fall in the same grid cells normalize byte-identically.
pub fn normalize_bounds(raw: &RawBounds, step: f64, fixed_decimals: usize) -> Option<Bounds> {
    let corners = [raw.south, raw.west, raw.north, raw.east];
    if !corners.iter().all(|&v| is_finite_number(v)) {
        return None;
    }
    if !(is_finite_number(step) && step > 0.0) {
        return None;
    }
    if raw.south > raw.north || raw.west > raw.east {
        return None;
    }

    let render = |v: f64| format!("{:.*}", fixed_decimals, v);
    Some(Bounds {
        min_lat: render(snap(raw.south, step, false)),
        min_lon: render(snap(raw.west, step, false)),
        max_lat: render(snap(raw.north, step, true)),
        max_lon: render(snap(raw.east, step, true)),
    })
}

/// Signature of normalized bounds, used only for equality checks.
pub fn bounds_signature(bounds: &Bounds) -> String {
    format!(
        "{}|{}|{}|{}",
        bounds.max_lat, bounds.max_lon, bounds.min_lat, bounds.min_lon
    )
}

/// Integer with thousands separators: `12345` → `"12,345"`.
pub fn format_count(count: usize) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Compact price label.
///
/// Below 10,000 the price is shown in full with separators. From 10,000 it is
/// scaled to units of 万 (10^4), from 100,000,000 to units of 億 (10^8), with at
/// most one decimal. Invalid prices render as `-`.
pub fn format_price_scaled(price: f64) -> String {
    const MAN: f64 = 10_000.0;
    const OKU: f64 = 100_000_000.0;

    if !is_finite_number(price) || price < 0.0 {
        return "-".to_string();
    }
    if price.round() < MAN {
        return format_count(price.round() as usize);
    }
    // Unit is picked after rounding so 99,999,999 reads 1億, not 10,000万
    let man_tenths = (price / MAN * 10.0).round();
    let (tenths, unit) = if man_tenths < OKU / MAN * 10.0 {
        (man_tenths, "万")
    } else {
        ((price / OKU * 10.0).round(), "億")
    };
    if tenths % 10.0 == 0.0 {
        format!("{}{}", format_count((tenths / 10.0) as usize), unit)
    } else {
        format!("{:.1}{}", tenths / 10.0, unit)
    }
}

/// Join producer and id into the identity key.
pub fn compose_key(producer: Option<&str>, id: &str) -> String {
    format!("{}_{}", producer.unwrap_or(""), id)
}

/// Identity key of a location: `producer_id`, or the coordinate pair when the id
/// is missing.
pub fn identity_key(location: &Location) -> String {
    match location.id.as_deref() {
        Some(id) if !id.is_empty() => compose_key(location.producer.as_deref(), id),
        _ => format!("@{:.6},{:.6}", location.lat, location.lng),
    }
}

/// Stable de-duplication by identity; the first occurrence wins.
pub fn dedupe_by_identity(locations: &[Location]) -> Vec<Location> {
    let mut seen = HashSet::with_capacity(locations.len());
    locations
        .iter()
        .filter(|loc| seen.insert(identity_key(loc)))
        .cloned()
        .collect()
}

/// Whether two coordinates are within `tolerance` degrees on both axes.
#[inline]
pub fn coords_match(lat1: f64, lng1: f64, lat2: f64, lng2: f64, tolerance: f64) -> bool {
    (lat1 - lat2).abs() <= tolerance && (lng1 - lng2).abs() <= tolerance
}

//! Spatial data loading from the listings backend.
//!
//! This module provides:
//! - A [`ListingSource`] transport seam with a pooled reqwest implementation
//! - Byte-stable viewport query strings built from grid-snapped bounds
//! - Normalization of loosely-shaped backend records into [`Location`] and
//!   [`ListingDetail`]
//! - An LRU viewport cache in front of the transport
//!
//! Field aliases and shape variants are handled here and nowhere else.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::ViewportCache;
use crate::config::{EngineConfig, Endpoints};
use crate::error::{MapError, Result};
use crate::geo_utils::{normalize_bounds, parse_finite};
use crate::{Bounds, ListingDetail, Location, RawBounds};

const HTTP_NOT_FOUND: u16 = 404;

/// Raw response from a backend GET.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResponse {
    pub status: u16,
    pub body: String,
}

impl SourceResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport for backend GET requests.
///
/// Transport errors map to [`MapError::FetchFailed`] without a status code.
#[allow(async_fn_in_trait)]
pub trait ListingSource {
    async fn get(&self, url: &str) -> Result<SourceResponse>;
}

/// reqwest-backed transport with connection pooling.
#[cfg(feature = "http")]
pub struct HttpListingSource {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpListingSource {
    /// Create a transport with the request timeout from `config`.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| MapError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
impl ListingSource for HttpListingSource {
    async fn get(&self, url: &str) -> Result<SourceResponse> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| MapError::fetch_failed(format!("Request error: {}", e)))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| MapError::fetch_failed(format!("Body read error: {}", e)))?;
        Ok(SourceResponse { status, body })
    }
}

// ============================================================================
// Query building
// ============================================================================

/// Build the viewport query string.
///
/// The filter fragment is appended verbatim after stripping a leading `?` or `&`.
/// Identical inputs always produce identical bytes.
pub fn build_viewport_query(bounds: &Bounds, filter_fragment: &str) -> String {
    let mut query = format!(
        "minLat={}&minLon={}&maxLat={}&maxLon={}",
        bounds.min_lat, bounds.min_lon, bounds.max_lat, bounds.max_lon
    );
    let filters = filter_fragment.trim_start_matches(['?', '&']);
    if !filters.is_empty() {
        query.push('&');
        query.push_str(filters);
    }
    query
}

fn join_query(endpoint: &str, query: &str) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, separator, query)
}

// ============================================================================
// Response normalization
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ViewportPayload {
    List(Vec<Value>),
    Page {
        content: Vec<Value>,
        #[serde(rename = "totalElements", default)]
        total_elements: Option<u64>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawLocation {
    #[serde(alias = "itemId", alias = "listingId")]
    id: Option<Value>,
    #[serde(alias = "producerId", alias = "tenant")]
    producer: Option<Value>,
    #[serde(alias = "latitude")]
    lat: Option<Value>,
    #[serde(alias = "lon", alias = "longitude")]
    lng: Option<Value>,
    price: Option<Value>,
    #[serde(alias = "thumbnailUrl", alias = "image")]
    thumbnail: Option<String>,
    address: Option<String>,
    #[serde(alias = "event_id")]
    event_id: Option<Value>,
    #[serde(alias = "isPromoted", alias = "promoted", alias = "isFeatured")]
    featured: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawDetail {
    #[serde(alias = "itemId", alias = "listingId")]
    id: Option<Value>,
    #[serde(alias = "producerId", alias = "tenant")]
    producer: Option<Value>,
    #[serde(alias = "name")]
    title: Option<String>,
    address: Option<String>,
    price: Option<Value>,
    #[serde(alias = "thumbnailUrl", alias = "image")]
    thumbnail: Option<String>,
    description: Option<String>,
    #[serde(alias = "event_id")]
    event_id: Option<Value>,
    #[serde(alias = "finishTime", alias = "event_finish_time")]
    event_finish_time: Option<Value>,
}

/// Read an identifier that may arrive as a string or a number.
fn value_to_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_to_flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => matches!(s.trim(), "true" | "1" | "Y" | "y"),
        _ => false,
    }
}

/// Parse a finish time from RFC 3339 text or epoch milliseconds.
fn value_to_time(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_i64()?),
        _ => None,
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}

/// Map one backend record to a location. Records without finite coordinates
/// are dropped.
fn location_from_value(value: Value) -> Option<Location> {
    let raw: RawLocation = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("[SpatialDataLoader] Skipping malformed record: {}", e);
            return None;
        }
    };
    let lat = raw.lat.as_ref().and_then(parse_finite)?;
    let lng = raw.lng.as_ref().and_then(parse_finite)?;
    let event_id = value_to_id(raw.event_id.as_ref());
    Some(Location {
        id: value_to_id(raw.id.as_ref()),
        producer: value_to_id(raw.producer.as_ref()),
        lat,
        lng,
        price: raw.price.as_ref().and_then(parse_finite),
        thumbnail: non_empty(raw.thumbnail),
        address: non_empty(raw.address),
        featured: value_to_flag(raw.featured.as_ref()) || event_id.is_some(),
        event_id,
    })
}

/// Parse a viewport response body: a JSON array or a `{content, totalElements}` page.
pub fn parse_viewport_body(body: &str) -> Result<Vec<Location>> {
    let payload: ViewportPayload = serde_json::from_str(body)
        .map_err(|e| MapError::fetch_failed(format!("Parse error: {}", e)))?;
    let records = match payload {
        ViewportPayload::List(records) => records,
        ViewportPayload::Page {
            content,
            total_elements,
        } => {
            if let Some(total) = total_elements {
                if total as usize > content.len() {
                    debug!(
                        "[SpatialDataLoader] Page holds {} of {} matches",
                        content.len(),
                        total
                    );
                }
            }
            content
        }
    };
    let received = records.len();
    let locations: Vec<Location> = records.into_iter().filter_map(location_from_value).collect();
    if locations.len() < received {
        debug!(
            "[SpatialDataLoader] Dropped {} records without usable coordinates",
            received - locations.len()
        );
    }
    Ok(locations)
}

/// Parse a detail body. `null` means the listing is gone.
pub fn parse_detail_body(body: &str, requested_id: &str) -> Result<Option<ListingDetail>> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| MapError::fetch_failed(format!("Parse error: {}", e)))?;
    if value.is_null() {
        return Ok(None);
    }
    let raw: RawDetail = serde_json::from_value(value)
        .map_err(|e| MapError::fetch_failed(format!("Parse error: {}", e)))?;
    Ok(Some(ListingDetail {
        id: value_to_id(raw.id.as_ref()).unwrap_or_else(|| requested_id.to_string()),
        producer: value_to_id(raw.producer.as_ref()),
        title: non_empty(raw.title),
        address: non_empty(raw.address),
        price: raw.price.as_ref().and_then(parse_finite),
        thumbnail: non_empty(raw.thumbnail),
        description: non_empty(raw.description),
        event_id: value_to_id(raw.event_id.as_ref()),
        event_finish_time: value_to_time(raw.event_finish_time.as_ref()),
    }))
}

// ============================================================================
// Loader
// ============================================================================

/// Translates viewports into backend calls and returns canonical locations.
pub struct SpatialDataLoader<S> {
    source: S,
    endpoints: Endpoints,
    grid_step: f64,
    fixed_decimals: usize,
    cache: Mutex<ViewportCache>,
}

impl<S: ListingSource> SpatialDataLoader<S> {
    pub fn new(source: S, config: &EngineConfig) -> Self {
        Self {
            source,
            endpoints: config.endpoints.clone(),
            grid_step: config.grid_step,
            fixed_decimals: config.fixed_decimals,
            cache: Mutex::new(ViewportCache::new(
                config.cache_capacity,
                config.cache_ttl(),
            )),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Full URL of the viewport request for already-normalized bounds.
    pub fn viewport_url(&self, bounds: &Bounds, filter_fragment: &str) -> String {
        join_query(
            &self.endpoints.viewport_search,
            &build_viewport_query(bounds, filter_fragment),
        )
    }

    fn detail_url(&self, id: &str) -> String {
        format!("{}/{}", self.endpoints.detail.trim_end_matches('/'), id)
    }

    /// Load the locations inside a raw viewport.
    ///
    /// Fails with [`MapError::InvalidBounds`] when the viewport cannot be normalized.
    pub async fn load_viewport(
        &self,
        raw: &RawBounds,
        filter_fragment: &str,
    ) -> Result<Vec<Location>> {
        let bounds = normalize_bounds(raw, self.grid_step, self.fixed_decimals)
            .ok_or(MapError::InvalidBounds)?;
        self.load_normalized(&bounds, filter_fragment).await
    }

    /// Load the locations inside already-normalized bounds.
    ///
    /// Successful responses are cached by URL; failures never are.
    pub async fn load_normalized(
        &self,
        bounds: &Bounds,
        filter_fragment: &str,
    ) -> Result<Vec<Location>> {
        let url = self.viewport_url(bounds, filter_fragment);

        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&url, Instant::now()) {
                debug!("[SpatialDataLoader] Cache hit ({} locations)", hit.len());
                return Ok(hit);
            }
        }

        let start = Instant::now();
        let response = self.source.get(&url).await?;
        if !response.is_success() {
            warn!(
                "[SpatialDataLoader] Viewport request failed with HTTP {}",
                response.status
            );
            return Err(MapError::http_status(response.status));
        }
        let locations = parse_viewport_body(&response.body)?;

        info!(
            "[SpatialDataLoader] Loaded {} locations in {} ms",
            locations.len(),
            start.elapsed().as_millis()
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(url, locations.clone(), Instant::now());
        }
        Ok(locations)
    }

    /// Load the detail record of one listing.
    ///
    /// A missing id, a 404 or a `null` body yield `Ok(None)` so callers can fall
    /// back to other detail sources.
    pub async fn load_item_detail(&self, id: Option<&str>) -> Result<Option<ListingDetail>> {
        let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) else {
            return Ok(None);
        };
        let response = self.source.get(&self.detail_url(id)).await?;
        if response.status == HTTP_NOT_FOUND {
            debug!("[SpatialDataLoader] No detail for {}", id);
            return Ok(None);
        }
        if !response.is_success() {
            return Err(MapError::http_status(response.status));
        }
        parse_detail_body(&response.body, id)
    }

    /// Ask the backend to refresh a listing's room data. Fire-and-forget:
    /// failures are logged, never returned.
    pub async fn request_room_sync(&self, id: &str) {
        let url = format!("{}/room/sync", self.detail_url(id));
        match self.source.get(&url).await {
            Ok(response) if response.is_success() => {
                debug!("[SpatialDataLoader] Room sync requested for {}", id)
            }
            Ok(response) => warn!(
                "[SpatialDataLoader] Room sync for {} returned HTTP {}",
                id, response.status
            ),
            Err(e) => warn!("[SpatialDataLoader] Room sync for {} failed: {}", id, e),
        }
    }

    /// Drop every cached viewport response.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

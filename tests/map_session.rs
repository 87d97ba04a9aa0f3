//! Map session integration tests.
//!
//! Drives a [`MapOrchestrator`] end to end with a recording surface and a scripted
//! backend: settle -> fetch -> reconcile -> popup -> detail -> countdown.
//!
//! Run with: `cargo test --test map_session`

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use listing_map::{
    run, Camera, ClusterSpec, EngineConfig, Endpoints, ListingDetail, ListingSource, MapError,
    MapEvent, MapOrchestrator, MapStatus, MapSurface, PendingPopupRequest, PinHandle, PinSpec,
    PopupContent, RawBounds, Result, SettleOutcome, SettleRequest, SourceResponse,
};
use tokio::sync::mpsc::unbounded_channel;
use tokio::time::sleep;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Call {
    AttachPin(String, PinHandle),
    AttachCluster(String, PinHandle),
    Detach(PinHandle),
    OpenPopup(String),
    ClosePopup,
    Countdown(PinHandle, String),
    Detail(String),
    PanTo(f64, f64),
    FitBounds(RawBounds),
}

/// Records every call; the camera is shared with the test script.
struct RecordingSurface {
    camera: Rc<Cell<Camera>>,
    next: u64,
    calls: Vec<Call>,
    statuses: Vec<MapStatus>,
}

impl RecordingSurface {
    fn new(camera: Rc<Cell<Camera>>) -> Self {
        Self {
            camera,
            next: 0,
            calls: Vec::new(),
            statuses: Vec::new(),
        }
    }

    fn handle_of(&self, key: &str) -> Option<PinHandle> {
        self.calls.iter().rev().find_map(|call| match call {
            Call::AttachPin(k, handle) if k == key => Some(*handle),
            _ => None,
        })
    }

    fn cluster_keys(&self) -> Vec<String> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::AttachCluster(key, _) => Some(key.clone()),
                _ => None,
            })
            .collect()
    }
}

impl MapSurface for RecordingSurface {
    fn camera(&self) -> Camera {
        self.camera.get()
    }
    fn attach_pin(&mut self, pin: &PinSpec) -> PinHandle {
        self.next += 1;
        let handle = PinHandle(self.next);
        self.calls.push(Call::AttachPin(pin.key.clone(), handle));
        handle
    }
    fn attach_cluster(&mut self, cluster: &ClusterSpec) -> PinHandle {
        self.next += 1;
        let handle = PinHandle(self.next);
        self.calls.push(Call::AttachCluster(cluster.key.clone(), handle));
        handle
    }
    fn detach(&mut self, handle: PinHandle) {
        self.calls.push(Call::Detach(handle));
    }
    fn set_selected(&mut self, _handle: PinHandle, _selected: bool) {}
    fn open_popup(&mut self, _handle: PinHandle, content: &PopupContent) {
        self.calls.push(Call::OpenPopup(content.key.clone()));
    }
    fn close_popup(&mut self) {
        self.calls.push(Call::ClosePopup);
    }
    fn update_countdown(&mut self, handle: PinHandle, label: &str) {
        self.calls.push(Call::Countdown(handle, label.to_string()));
    }
    fn show_status(&mut self, status: &MapStatus) {
        self.statuses.push(status.clone());
    }
    fn show_detail(&mut self, detail: &ListingDetail) {
        self.calls.push(Call::Detail(detail.id.clone()));
    }
    fn pan_to(&mut self, lat: f64, lng: f64) {
        self.calls.push(Call::PanTo(lat, lng));
    }
    fn fit_bounds(&mut self, bounds: &RawBounds) {
        self.calls.push(Call::FitBounds(*bounds));
    }
}

/// Backend fake: queued viewport responses, detail bodies by id.
#[derive(Default)]
struct ScriptedBackend {
    viewports: RefCell<VecDeque<Result<SourceResponse>>>,
    details: HashMap<String, String>,
    requests: RefCell<Vec<String>>,
}

impl ScriptedBackend {
    fn push_viewport(&self, response: Result<SourceResponse>) {
        self.viewports.borrow_mut().push_back(response);
    }

    fn requests_matching(&self, needle: &str) -> usize {
        self.requests
            .borrow()
            .iter()
            .filter(|url| url.contains(needle))
            .count()
    }
}

impl ListingSource for ScriptedBackend {
    async fn get(&self, url: &str) -> Result<SourceResponse> {
        self.requests.borrow_mut().push(url.to_string());
        if url.ends_with("/room/sync") {
            return Ok(SourceResponse::ok("{}"));
        }
        if let Some(id) = url.strip_prefix("https://api.test/items/") {
            return Ok(match self.details.get(id) {
                Some(body) => SourceResponse::ok(body.clone()),
                None => SourceResponse {
                    status: 404,
                    body: String::new(),
                },
            });
        }
        self.viewports
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Ok(SourceResponse::ok("[]")))
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> EngineConfig {
    EngineConfig {
        endpoints: Endpoints {
            viewport_search: "https://api.test/search".to_string(),
            detail: "https://api.test/items".to_string(),
        },
        ..EngineConfig::default()
    }
}

fn camera(south: f64, west: f64, zoom: f64) -> Camera {
    Camera::new(RawBounds::new(south, west, south + 0.1, west + 0.1), zoom)
}

fn listing_json(id: &str, lat: f64, lng: f64) -> String {
    format!(
        r#"{{"id": "{}", "producer": "acme", "lat": {}, "lng": {}, "price": 35000000}}"#,
        id, lat, lng
    )
}

fn body(listings: &[String]) -> SourceResponse {
    SourceResponse::ok(format!("[{}]", listings.join(",")))
}

fn session(
    backend: ScriptedBackend,
    initial: Camera,
) -> (
    MapOrchestrator<RecordingSurface, ScriptedBackend>,
    Rc<Cell<Camera>>,
) {
    init_logging();
    let shared = Rc::new(Cell::new(initial));
    let surface = RecordingSurface::new(Rc::clone(&shared));
    let orch = MapOrchestrator::new(config(), surface, backend).unwrap();
    (orch, shared)
}

// ============================================================================
// Test: Popup detail and countdown through the event loop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_countdown_follows_selected_pin() {
    let finish = (Utc::now() + ChronoDuration::hours(2)).to_rfc3339();
    let mut backend = ScriptedBackend::default();
    backend.details.insert(
        "x".to_string(),
        format!(r#"{{"id": "x", "title": "Corner house", "eventFinishTime": "{}"}}"#, finish),
    );
    backend
        .details
        .insert("y".to_string(), r#"{"id": "y", "title": "Flat"}"#.to_string());
    backend.push_viewport(Ok(body(&[
        listing_json("x", 34.02, 135.02),
        listing_json("y", 34.07, 135.07),
    ])));

    let (orch, _camera) = session(backend, camera(34.0, 135.0, 16.0));
    let (tx, rx) = unbounded_channel();

    let script = async {
        tx.send(MapEvent::CameraChanged).unwrap();
        sleep(Duration::from_millis(500)).await;
        tx.send(MapEvent::PinClicked("acme_x".to_string())).unwrap();
        sleep(Duration::from_millis(2500)).await;
        tx.send(MapEvent::PinClicked("acme_y".to_string())).unwrap();
        sleep(Duration::from_millis(3000)).await;
        tx.send(MapEvent::Shutdown).unwrap();
    };

    let (orch, ()) = tokio::join!(run(orch, rx), script);
    let surface = orch.surface();
    let backend = orch.loader();

    // One detail load and one room sync per opened popup
    assert_eq!(backend.source().requests_matching("/items/x"), 2);
    assert_eq!(backend.source().requests_matching("/items/x/room/sync"), 1);
    assert_eq!(backend.source().requests_matching("/items/y/room/sync"), 1);
    assert!(surface.calls.contains(&Call::Detail("x".to_string())));
    assert!(surface.calls.contains(&Call::Detail("y".to_string())));

    let x = surface.handle_of("acme_x").unwrap();
    let y_opened = surface
        .calls
        .iter()
        .position(|call| *call == Call::OpenPopup("acme_y".to_string()))
        .unwrap();
    let x_ticks_before = surface.calls[..y_opened]
        .iter()
        .filter(|call| matches!(call, Call::Countdown(h, _) if *h == x))
        .count();
    assert!(x_ticks_before >= 2, "expected countdown ticks for x");
    assert!(
        !surface.calls[y_opened..]
            .iter()
            .any(|call| matches!(call, Call::Countdown(..))),
        "countdown continued after switching popups"
    );

    // Teardown detached everything
    assert_eq!(orch.pins().pin_count(), 0);
    assert_eq!(orch.status(), &MapStatus::Idle);
}

// ============================================================================
// Test: Pending popup across a pan
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_pending_popup_opens_after_pan() {
    let backend = ScriptedBackend::default();
    backend.push_viewport(Ok(body(&[listing_json("a", 34.05, 135.05)])));
    backend.push_viewport(Ok(body(&[listing_json("far", 35.05, 136.05)])));

    let (orch, shared) = session(backend, camera(34.0, 135.0, 16.0));
    let (tx, rx) = unbounded_channel();

    let script = async {
        tx.send(MapEvent::CameraChanged).unwrap();
        sleep(Duration::from_millis(500)).await;
        tx.send(MapEvent::PopupRequested(PendingPopupRequest {
            lat: 35.05,
            lng: 136.05,
            producer: Some("acme".to_string()),
            id: Some("far".to_string()),
        }))
        .unwrap();
        sleep(Duration::from_millis(10)).await;
        // The host reacts to pan_to by moving the camera
        shared.set(camera(35.0, 136.0, 16.0));
        tx.send(MapEvent::CameraChanged).unwrap();
        sleep(Duration::from_millis(500)).await;
        tx.send(MapEvent::Shutdown).unwrap();
    };

    let (orch, ()) = tokio::join!(run(orch, rx), script);
    let calls = &orch.surface().calls;

    assert!(calls.contains(&Call::PanTo(35.05, 136.05)));
    let opened: Vec<_> = calls
        .iter()
        .filter(|call| matches!(call, Call::OpenPopup(_)))
        .collect();
    assert_eq!(opened, vec![&Call::OpenPopup("acme_far".to_string())]);
    assert!(orch.pending_popup().is_none());
}

// ============================================================================
// Test: Failure keeps the loop usable
// ============================================================================

#[tokio::test]
async fn test_failed_load_retries_same_viewport() {
    let backend = ScriptedBackend::default();
    backend.push_viewport(Err(MapError::fetch_failed("connection reset")));
    backend.push_viewport(Ok(SourceResponse {
        status: 500,
        body: String::new(),
    }));
    backend.push_viewport(Ok(body(&[listing_json("a", 34.05, 135.05)])));

    let (mut orch, _camera) = session(backend, camera(34.0, 135.0, 16.0));
    let request = SettleRequest {
        camera: camera(34.0, 135.0, 16.0),
        force: false,
        sequence: 1,
    };

    match orch.settle_now(&request).await {
        SettleOutcome::Failed(e) => assert_eq!(e.status_code(), None),
        other => panic!("unexpected {:?}", other),
    }
    match orch.settle_now(&request).await {
        SettleOutcome::Failed(e) => assert_eq!(e.status_code(), Some(500)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(orch.status().to_string().contains("HTTP 500"));

    assert!(matches!(
        orch.settle_now(&request).await,
        SettleOutcome::Pins(_)
    ));
    assert_eq!(orch.status(), &MapStatus::Loaded { count: 1 });
    // Served now, so the same viewport is suppressed
    assert_eq!(orch.settle_now(&request).await, SettleOutcome::Skipped);
    assert_eq!(orch.loader().source().requests_matching("/search?"), 3);
}

// ============================================================================
// Test: Clusters at low zoom
// ============================================================================

#[tokio::test]
async fn test_cluster_click_fits_members() {
    let listings: Vec<String> = (0..5)
        .flat_map(|i| {
            (0..8).map(move |j| {
                listing_json(
                    &format!("{}-{}", i, j),
                    34.0 + i as f64 * 0.4,
                    135.0 + j as f64 * 0.25,
                )
            })
        })
        .collect();
    let backend = ScriptedBackend::default();
    backend.push_viewport(Ok(body(&listings)));

    let (mut orch, _camera) = session(backend, camera(34.0, 135.0, 8.0));
    let request = SettleRequest {
        camera: Camera::new(RawBounds::new(33.5, 134.5, 36.5, 137.5), 8.0),
        force: false,
        sequence: 1,
    };

    let (clusters, points) = match orch.settle_now(&request).await {
        SettleOutcome::Clustered { clusters, points } => (clusters, points),
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(points, 40);
    assert!(clusters < points);
    assert_eq!(orch.pins().cluster_count(), clusters);
    assert_eq!(orch.pins().pin_count(), 0);

    let keys = orch.surface().cluster_keys();
    let multi = keys
        .iter()
        .find(|key| orch.pins().cluster(key).is_some_and(|cell| cell.count > 1))
        .unwrap()
        .clone();
    let center = {
        let cell = orch.pins().cluster(&multi).unwrap();
        (cell.center_lat, cell.center_lng)
    };
    assert!(orch.on_cluster_clicked(&multi));
    match orch.surface().calls.last() {
        Some(Call::FitBounds(bounds)) => assert!(bounds.contains(center.0, center.1)),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!orch.on_cluster_clicked("no-such-cluster"));
}

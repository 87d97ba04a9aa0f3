//! Event loop driving a [`MapOrchestrator`] on a single-threaded tokio runtime.
//!
//! The loop multiplexes four sources:
//! - UI events from the map host ([`MapEvent`])
//! - The viewport debounce deadline
//! - A one-second countdown tick
//! - In-flight viewport, detail and room-sync fetches
//!
//! Superseded viewport fetches are left to finish; the orchestrator drops their
//! completions as stale.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use futures::future::LocalBoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use log::{debug, info};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::engine::{DetailTicket, LoadTicket, MapOrchestrator};
use crate::error::Result;
use crate::http::ListingSource;
use crate::pins::MapSurface;
use crate::viewport::SettleRequest;
use crate::{ListingDetail, Location, PendingPopupRequest};

const COUNTDOWN_PERIOD: Duration = Duration::from_secs(1);

/// Interaction reported by the map host.
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    /// The camera moved; the orchestrator reads the new camera from the surface
    CameraChanged,
    PinClicked(String),
    ClusterClicked(String),
    /// Open a listing chosen from search or a list
    PopupRequested(PendingPopupRequest),
    PopupClosed,
    FiltersChanged(String),
    Shutdown,
}

enum Completion {
    Viewport(LoadTicket, Result<Vec<Location>>),
    Detail(DetailTicket, Result<Option<ListingDetail>>),
    RoomSynced,
}

type Inflight = FuturesUnordered<LocalBoxFuture<'static, Completion>>;

/// Resolves at `deadline`, or never when there is none.
fn wait_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

fn start_settle<S, B>(orch: &mut MapOrchestrator<S, B>, request: &SettleRequest, inflight: &Inflight)
where
    S: MapSurface,
    B: ListingSource + 'static,
{
    let Some(ticket) = orch.begin_settle(request) else {
        return;
    };
    debug!("[MapDriver] Fetching {} (#{})", ticket.signature, ticket.sequence);
    let loader = orch.loader();
    inflight.push(
        async move {
            let result = loader.load_normalized(&ticket.bounds, &ticket.filters).await;
            Completion::Viewport(ticket, result)
        }
        .boxed_local(),
    );
}

fn start_detail<S, B>(orch: &mut MapOrchestrator<S, B>, inflight: &Inflight)
where
    S: MapSurface,
    B: ListingSource + 'static,
{
    let Some(ticket) = orch.take_detail_request() else {
        return;
    };
    let loader = orch.loader();
    let sync_loader = orch.loader();
    let sync_id = ticket.id.clone();
    inflight.push(
        async move {
            let result = loader.load_item_detail(Some(&ticket.id)).await;
            Completion::Detail(ticket, result)
        }
        .boxed_local(),
    );
    inflight.push(
        async move {
            sync_loader.request_room_sync(&sync_id).await;
            Completion::RoomSynced
        }
        .boxed_local(),
    );
}

/// Apply one host event. Returns a settle request that must start right away.
fn handle_event<S, B>(orch: &mut MapOrchestrator<S, B>, event: MapEvent) -> Option<SettleRequest>
where
    S: MapSurface,
    B: ListingSource,
{
    match event {
        MapEvent::CameraChanged => orch.on_camera_changed(Instant::now()),
        MapEvent::PinClicked(key) => {
            orch.on_pin_clicked(&key);
            None
        }
        MapEvent::ClusterClicked(key) => {
            orch.on_cluster_clicked(&key);
            None
        }
        MapEvent::PopupRequested(request) => {
            orch.request_popup(request);
            None
        }
        MapEvent::PopupClosed => {
            orch.close_popup();
            None
        }
        MapEvent::FiltersChanged(fragment) => orch.set_filters(&fragment),
        MapEvent::Shutdown => None,
    }
}

/// Run the map loop until [`MapEvent::Shutdown`] or until every sender is dropped.
///
/// The orchestrator is torn down on exit and handed back to the caller.
pub async fn run<S, B>(
    mut orch: MapOrchestrator<S, B>,
    mut events: UnboundedReceiver<MapEvent>,
) -> MapOrchestrator<S, B>
where
    S: MapSurface,
    B: ListingSource + 'static,
{
    let mut inflight: Inflight = FuturesUnordered::new();
    let mut countdown = interval(COUNTDOWN_PERIOD);
    countdown.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("[MapDriver] Started");
    loop {
        let deadline = orch.settle_deadline();
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Some(MapEvent::Shutdown) | None => break,
                    Some(event) => event,
                };
                if let Some(request) = handle_event(&mut orch, event) {
                    start_settle(&mut orch, &request, &inflight);
                }
            }
            _ = wait_until(deadline) => {
                if let Some(request) = orch.poll_settle(Instant::now()) {
                    start_settle(&mut orch, &request, &inflight);
                }
            }
            Some(completion) = inflight.next(), if !inflight.is_empty() => {
                match completion {
                    Completion::Viewport(ticket, result) => {
                        orch.complete_settle(ticket, result);
                    }
                    Completion::Detail(ticket, result) => {
                        orch.complete_detail(ticket, result, Utc::now());
                    }
                    Completion::RoomSynced => {}
                }
            }
            _ = countdown.tick() => {
                orch.tick_countdown(Utc::now());
            }
        }
        start_detail(&mut orch, &inflight);
    }

    if !inflight.is_empty() {
        debug!("[MapDriver] Dropping {} in-flight fetches", inflight.len());
    }
    orch.teardown();
    info!("[MapDriver] Stopped");
    orch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::http::SourceResponse;
    use crate::pins::{ClusterSpec, PinHandle, PinSpec, PopupContent};
    use crate::{Camera, MapStatus, RawBounds};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::sleep;

    struct SharedCameraSurface {
        camera: Rc<Cell<Camera>>,
        next: u64,
    }

    impl MapSurface for SharedCameraSurface {
        fn camera(&self) -> Camera {
            self.camera.get()
        }
        fn attach_pin(&mut self, _pin: &PinSpec) -> PinHandle {
            self.next += 1;
            PinHandle(self.next)
        }
        fn attach_cluster(&mut self, _cluster: &ClusterSpec) -> PinHandle {
            self.next += 1;
            PinHandle(self.next)
        }
        fn detach(&mut self, _handle: PinHandle) {}
        fn set_selected(&mut self, _handle: PinHandle, _selected: bool) {}
        fn open_popup(&mut self, _handle: PinHandle, _content: &PopupContent) {}
        fn close_popup(&mut self) {}
        fn update_countdown(&mut self, _handle: PinHandle, _label: &str) {}
        fn show_status(&mut self, _status: &MapStatus) {}
        fn show_detail(&mut self, _detail: &ListingDetail) {}
        fn pan_to(&mut self, _lat: f64, _lng: f64) {}
        fn fit_bounds(&mut self, _bounds: &RawBounds) {}
    }

    #[derive(Default)]
    struct CountingSource {
        urls: RefCell<Vec<String>>,
    }

    impl ListingSource for CountingSource {
        async fn get(&self, url: &str) -> Result<SourceResponse> {
            self.urls.borrow_mut().push(url.to_string());
            Ok(SourceResponse::ok("[]"))
        }
    }

    fn view(south: f64, west: f64) -> Camera {
        Camera::new(RawBounds::new(south, west, south + 0.1, west + 0.1), 16.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_pans_fetches_once() {
        let camera = Rc::new(Cell::new(view(34.0, 135.0)));
        let surface = SharedCameraSurface {
            camera: Rc::clone(&camera),
            next: 0,
        };
        let orch =
            MapOrchestrator::new(EngineConfig::default(), surface, CountingSource::default())
                .unwrap();
        let (tx, rx) = unbounded_channel();

        let script = async {
            tx.send(MapEvent::CameraChanged).unwrap();
            sleep(Duration::from_millis(50)).await;
            camera.set(view(35.0, 136.0));
            tx.send(MapEvent::CameraChanged).unwrap();
            sleep(Duration::from_millis(50)).await;
            camera.set(view(34.0, 135.0));
            tx.send(MapEvent::CameraChanged).unwrap();
            sleep(Duration::from_millis(1000)).await;
            tx.send(MapEvent::Shutdown).unwrap();
        };

        let (orch, ()) = tokio::join!(run(orch, rx), script);

        let urls = orch.loader().source().urls.borrow().clone();
        assert_eq!(urls.len(), 1, "unexpected fetches: {:?}", urls);
        assert!(urls[0].contains("minLat=34.0000&minLon=135.0000"));
        assert_eq!(orch.status(), &MapStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filters_force_reload_and_channel_close_stops() {
        let camera = Rc::new(Cell::new(view(34.0, 135.0)));
        let surface = SharedCameraSurface {
            camera: Rc::clone(&camera),
            next: 0,
        };
        let orch =
            MapOrchestrator::new(EngineConfig::default(), surface, CountingSource::default())
                .unwrap();
        let (tx, rx) = unbounded_channel();

        let script = async move {
            tx.send(MapEvent::CameraChanged).unwrap();
            sleep(Duration::from_millis(500)).await;
            tx.send(MapEvent::FiltersChanged("type=house".to_string()))
                .unwrap();
            sleep(Duration::from_millis(10)).await;
            // Same fragment again changes nothing
            tx.send(MapEvent::FiltersChanged("type=house".to_string()))
                .unwrap();
            sleep(Duration::from_millis(10)).await;
            drop(tx);
        };

        let (orch, ()) = tokio::join!(run(orch, rx), script);

        let urls = orch.loader().source().urls.borrow().clone();
        assert_eq!(urls.len(), 2, "unexpected fetches: {:?}", urls);
        assert!(!urls[0].contains("type=house"));
        assert!(urls[1].ends_with("&type=house"));
    }
}

//! Builders for the messages the client reports: heartbeats, beacon
//! sightings, region lookups and device registration, plus the timers that
//! send the automatic ones for an authorised device.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::normalize_base_url;
use crate::dispatcher::Dispatcher;
use crate::envelope::{Completion, Envelope, EnvelopeId, Outcome};
use crate::error::{DispatchError, EventError};
use crate::transport::Transport;

const DEVICE_ROUTE: &str = "device";
const PROXIMITY_ROUTE: &str = "proximity";
const REGION_ROUTE: &str = "region";
const RECEIVER_ROUTE: &str = "receiver";

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_REGION_REFRESH_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub uuid: String,
    pub os: String,
    pub os_version: String,
    pub model: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatus {
    pub level: u8,
    pub is_plugged: bool,
}

/// A beacon as reported by the scanner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Beacon {
    pub bid: Vec<u8>,
    pub address: Option<String>,
    pub rssi: i32,
    pub tx_power: Option<i32>,
    pub rssi_max: Option<i32>,
    /// Set by the scanner once the sighting was confirmed. Only confirmed
    /// beacons are reported lost.
    pub confirmed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum ProximityKind {
    Found,
    Lost,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatEvent<'a> {
    event_type: &'static str,
    datetime: UnixTimeMs,
    uuid: &'a str,
    token: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery: Option<BatteryStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProximityEvent<'a> {
    event_type: ProximityKind,
    datetime: UnixTimeMs,
    beacon_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<&'a str>,
    rssi: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_power: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi_max: Option<i32>,
    uuid: &'a str,
    token: &'a str,
}

#[derive(Debug, Serialize)]
struct DeviceRegistration<'a> {
    #[serde(flatten)]
    device: &'a DeviceInfo,
    token: &'a str,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub point: Point,
    /// Metres.
    pub radius: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionSet {
    pub changed: u64,
    pub regions: Vec<Region>,
}

#[derive(Debug, Deserialize)]
struct ReceiverResponse {
    token: Option<String>,
}

/// Periods of the automatic messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Schedule {
    pub heartbeat_every: Duration,
    pub regions_every: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            heartbeat_every: DEFAULT_HEARTBEAT_PERIOD,
            regions_every: DEFAULT_REGION_REFRESH_PERIOD,
        }
    }
}

/// Builds event envelopes for one authorised device and submits them.
pub struct EventFactory<T: Transport + 'static> {
    dispatcher: Arc<Dispatcher<T>>,
    base_url: String,
    token: String,
    device: DeviceInfo,
    battery: Mutex<Option<BatteryStatus>>,
    last_heartbeat: Mutex<Option<EnvelopeId>>,
    regions: watch::Sender<Option<RegionSet>>,
}

impl<T: Transport + 'static> EventFactory<T> {
    pub fn new(
        dispatcher: Arc<Dispatcher<T>>,
        base_url: impl Into<String>,
        token: impl Into<String>,
        device: DeviceInfo,
    ) -> Result<Self, DispatchError> {
        let base_url = normalize_base_url(base_url.into());
        Url::parse(&base_url).map_err(|e| DispatchError::InvalidUrl {
            url: base_url.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            dispatcher,
            base_url,
            token: token.into(),
            device,
            battery: Mutex::new(None),
            last_heartbeat: Mutex::new(None),
            regions: watch::Sender::new(None),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher<T>> {
        &self.dispatcher
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Latest region set, updated whenever a fetch returns a new `changed`
    /// stamp.
    pub fn subscribe_regions(&self) -> watch::Receiver<Option<RegionSet>> {
        self.regions.subscribe()
    }

    /// Latest battery reading, attached to subsequent heartbeats.
    pub fn set_battery(&self, status: BatteryStatus) {
        *self.battery.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    fn device_url(&self) -> String {
        format!("{}{}/{}", self.base_url, DEVICE_ROUTE, self.device.uuid)
    }

    fn heartbeat_envelope(&self) -> Result<Envelope, DispatchError> {
        let battery = *self.battery.lock().unwrap_or_else(PoisonError::into_inner);
        let event = HeartbeatEvent {
            event_type: "heartbeat",
            datetime: UnixTimeMs::now(),
            uuid: &self.device.uuid,
            token: &self.token,
            battery,
        };
        Ok(Envelope::put(self.device_url(), serde_json::to_value(&event)?))
    }

    fn proximity_envelope(
        &self,
        kind: ProximityKind,
        beacon: &Beacon,
    ) -> Result<Envelope, DispatchError> {
        let event = ProximityEvent {
            event_type: kind,
            datetime: UnixTimeMs::now(),
            beacon_id: hex::encode(&beacon.bid),
            address: beacon.address.as_deref(),
            rssi: beacon.rssi,
            tx_power: match kind {
                ProximityKind::Found => beacon.tx_power,
                ProximityKind::Lost => None,
            },
            rssi_max: match kind {
                ProximityKind::Found => None,
                ProximityKind::Lost => beacon.rssi_max,
            },
            uuid: &self.device.uuid,
            token: &self.token,
        };
        Ok(Envelope::post(
            format!("{}{}", self.base_url, PROXIMITY_ROUTE),
            serde_json::to_value(&event)?,
        ))
    }

    /// Report that the device is alive. The previous heartbeat is replaced
    /// if it is still queued, and never resent if it is still in flight.
    #[instrument(skip(self))]
    pub fn heartbeat(&self) -> Result<Completion, DispatchError> {
        let envelope = self.heartbeat_envelope()?;
        let mut last = self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let completion = match last.take() {
            Some(previous) => self.dispatcher.supersede(previous, envelope),
            None => self.dispatcher.submit(envelope),
        };
        *last = Some(completion.id());
        Ok(completion)
    }

    /// The last heartbeat, if it is still parked in the pending queue.
    pub fn pending_heartbeat(&self) -> Option<EnvelopeId> {
        let last = *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        last.filter(|id| self.dispatcher.is_queued(*id))
    }

    #[instrument(skip(self, beacon), fields(beacon = %hex::encode(&beacon.bid)))]
    pub fn found_beacon(&self, beacon: &Beacon) -> Result<Completion, DispatchError> {
        let envelope = self.proximity_envelope(ProximityKind::Found, beacon)?;
        Ok(self.dispatcher.submit(envelope))
    }

    /// Report a confirmed beacon as gone. Unconfirmed sightings send
    /// nothing and return `None`.
    #[instrument(skip(self, beacon), fields(beacon = %hex::encode(&beacon.bid)))]
    pub fn lost_beacon(&self, beacon: &Beacon) -> Result<Option<Completion>, DispatchError> {
        if !beacon.confirmed {
            debug!("Beacon never confirmed, not reporting it lost");
            return Ok(None);
        }
        let envelope = self.proximity_envelope(ProximityKind::Lost, beacon)?;
        Ok(Some(self.dispatcher.submit(envelope)))
    }

    /// Announce this device (and its token) to the backend.
    pub fn register_device(&self) -> Result<Completion, DispatchError> {
        let registration = DeviceRegistration {
            device: &self.device,
            token: &self.token,
        };
        let envelope = Envelope::post(
            format!("{}{}", self.base_url, DEVICE_ROUTE),
            serde_json::to_value(&registration)?,
        )
        .expect_body(true);
        Ok(self.dispatcher.submit(envelope))
    }

    /// Fetch the regions the scanner should watch.
    #[instrument(skip(self))]
    pub async fn fetch_regions(&self) -> Result<RegionSet, EventError> {
        let envelope = Envelope::get(format!("{}{}", self.base_url, REGION_ROUTE))
            .with_header("Authorization", format!("Bearer {}", self.token))
            .expect_body(true);

        match self.dispatcher.submit(envelope).await {
            Outcome::Response {
                status: 200,
                body: Some(body),
            } => {
                let regions: RegionSet = serde_json::from_value(body)
                    .map_err(|e| EventError::MalformedResponse(e.to_string()))?;
                debug!(count = regions.regions.len(), "Regions fetched");
                self.regions.send_if_modified(|current| {
                    if current.as_ref().map(|r| r.changed) == Some(regions.changed) {
                        return false;
                    }
                    *current = Some(regions.clone());
                    true
                });
                Ok(regions)
            }
            Outcome::Response { status: 200, .. } => Err(EventError::MalformedResponse(
                "region response had no body".into(),
            )),
            other => Err(EventError::Refused {
                status: other.status_code(),
            }),
        }
    }

    /// Send a heartbeat now and then on a fixed period until the handle is
    /// aborted.
    pub fn start_heartbeat(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        self.spawn_heartbeat(Instant::now(), every)
    }

    fn spawn_heartbeat(self: &Arc<Self>, first: Instant, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.dispatcher.runtime().spawn(async move {
            let mut ticker = tokio::time::interval_at(first, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.dispatcher.is_shut_down() {
                    debug!("Dispatcher shut down, stopping heartbeat");
                    return;
                }
                if let Err(e) = this.heartbeat() {
                    warn!("Failed to build heartbeat: {}", e);
                }
            }
        })
    }

    /// Fetch regions now and then on a fixed period until the handle is
    /// aborted. Results are published through [`subscribe_regions`].
    ///
    /// [`subscribe_regions`]: Self::subscribe_regions
    pub fn start_region_refresh(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        self.dispatcher.runtime().spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if this.dispatcher.is_shut_down() {
                    debug!("Dispatcher shut down, stopping region refresh");
                    return;
                }
                if let Err(e) = this.fetch_regions().await {
                    warn!("Region refresh failed: {}", e);
                }
            }
        })
    }

    /// Start the automatic messages for a device whose token is already
    /// known: heartbeat and region fetch right away, then periodically.
    pub fn resume(self: &Arc<Self>, schedule: Schedule) -> Session<T> {
        info!("Resuming automatic messages");
        Session {
            factory: Arc::clone(self),
            heartbeat: self.start_heartbeat(schedule.heartbeat_every),
            regions: self.start_region_refresh(schedule.regions_every),
        }
    }

    /// Authorise, register the device, then start the automatic messages.
    /// Regions are fetched right away; the first heartbeat waits one period.
    #[instrument(skip(dispatcher, api_key, device, schedule))]
    pub async fn connect(
        dispatcher: Arc<Dispatcher<T>>,
        base_url: &str,
        email: &str,
        api_key: &str,
        device: DeviceInfo,
        schedule: Schedule,
    ) -> Result<Session<T>, EventError> {
        let token = authorize(&dispatcher, base_url, email, api_key).await?;
        let factory = Arc::new(Self::new(dispatcher, base_url, token, device)?);

        let registered = factory.register_device()?.await;
        if !registered.is_success() {
            return Err(EventError::Refused {
                status: registered.status_code(),
            });
        }
        info!("Device registered");

        let regions = factory.start_region_refresh(schedule.regions_every);
        let heartbeat = factory.spawn_heartbeat(
            Instant::now() + schedule.heartbeat_every,
            schedule.heartbeat_every,
        );
        Ok(Session {
            factory,
            heartbeat,
            regions,
        })
    }
}

/// Automatic messages running for one authorised device. Dropping the
/// session stops its timers; envelopes already submitted are unaffected.
pub struct Session<T: Transport + 'static> {
    factory: Arc<EventFactory<T>>,
    heartbeat: JoinHandle<()>,
    regions: JoinHandle<()>,
}

impl<T: Transport + 'static> Session<T> {
    pub fn factory(&self) -> &Arc<EventFactory<T>> {
        &self.factory
    }
}

impl<T: Transport + 'static> Drop for Session<T> {
    fn drop(&mut self) {
        self.heartbeat.abort();
        self.regions.abort();
    }
}

/// Exchange an email address and API key for a device token.
#[instrument(skip(dispatcher, api_key))]
pub async fn authorize<T: Transport + 'static>(
    dispatcher: &Arc<Dispatcher<T>>,
    base_url: &str,
    email: &str,
    api_key: &str,
) -> Result<String, EventError> {
    let base_url = normalize_base_url(base_url.to_string());
    Url::parse(&base_url).map_err(|e| DispatchError::InvalidUrl {
        url: base_url.clone(),
        reason: e.to_string(),
    })?;
    let url = format!(
        "{}{}/{}?key={}",
        base_url,
        RECEIVER_ROUTE,
        urlencoding::encode(email),
        urlencoding::encode(api_key)
    );

    let outcome = dispatcher
        .submit(Envelope::get(url).expect_body(true))
        .await;
    match outcome {
        Outcome::Response {
            status: 200 | 201,
            body: Some(body),
        } => {
            let response: ReceiverResponse = serde_json::from_value(body)
                .map_err(|e| EventError::MalformedResponse(e.to_string()))?;
            let token = response
                .token
                .ok_or_else(|| EventError::MalformedResponse("missing token".into()))?;
            info!("Device authorised");
            Ok(token)
        }
        other => Err(EventError::Refused {
            status: other.status_code(),
        }),
    }
}

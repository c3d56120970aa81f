// lib.rs - Resilient request delivery for the beacon client

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connectivity;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod transport;

pub use config::DispatcherConfig;
pub use connectivity::NetworkStatus;
pub use dispatcher::Dispatcher;
pub use envelope::{
    Completion, Envelope, EnvelopeId, EnvelopeState, Method, Outcome, STATUS_REJECTED,
    STATUS_UNREACHABLE,
};
pub use error::{DispatchError, EventError, TransportError};
pub use events::{
    authorize, Beacon, BatteryStatus, DeviceInfo, EventFactory, Point, Region, RegionSet,
    Schedule, Session, UnixTimeMs, DEFAULT_HEARTBEAT_PERIOD, DEFAULT_REGION_REFRESH_PERIOD,
};
pub use metrics::{DispatcherMetrics, MetricsSnapshot};
pub use queue::PendingQueue;
pub use transport::{Transport, TransportRequest, TransportResponse};

#[cfg(feature = "http")]
pub use transport::ReqwestTransport;

pub mod forwarding;
pub mod hub;
pub mod registry;
pub mod service;
pub mod telemetry;
pub mod timescale;

pub use forwarding::{ForwardError, RequestKind};
pub use hub::{HubError, LiveHub, LiveUpdateEvent, Subscription};
pub use registry::{RegistryError, ServiceRegistry};
pub use service::{ServiceAddress, ServiceLink};
pub use telemetry::{AnalyticsBucket, ClientOrigin, OriginHeaders, TelemetryStore, TrafficRecord};
pub use timescale::TimeScale;

pub mod comment;
pub mod ipam;
pub mod monitoring;
pub mod olt;
pub mod pppoe;
pub mod radius;

pub use ipam::IpamService;
pub use monitoring::{DeviceProbes, HealthProbe, MonitoringService};
pub use olt::{OltService, OltSettings};
pub use pppoe::{PppoeService, PppoeSettings};
pub use radius::{RadiusService, RadiusSync};

//! rollcalld: the identification daemon.
//!
//! Binds the stream source, the inference engine thread, and the roster
//! store behind a single [`Service`](service::Service) facade.

pub mod config;
pub mod service;

pub use config::Config;
pub use service::{
    IdentifyReport, ReportMode, RosterCheck, RosterPresence, Service, ServiceError,
};

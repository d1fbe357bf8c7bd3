//! Transit data fusion: a static GTFS schedule and GTFS-realtime feeds kept
//! fresh in memory, and the derived views served by OneBusAway-style APIs.

pub mod alerts;
pub mod block;
pub mod config;
pub mod direction;
pub mod error;
pub mod geo;
pub mod gtfs_static;
pub mod manager;
pub mod models;
pub mod realtime;
pub mod schedule;
pub mod trip_status;

pub use config::{Config, FeedSource, RealtimeConfig};
pub use error::{Result, WhereError};
pub use manager::Manager;
pub use trip_status::{build_trip_status, TripStatus};

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, WhereError};

/// Where the static GTFS archive comes from. Local archives are loaded once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSource {
    Local(PathBuf),
    Remote(String),
}

impl FeedSource {
    /// Anything that looks like an http(s) URL is remote, the rest is a path.
    pub fn parse(location: &str) -> Self {
        if location.starts_with("http://") || location.starts_with("https://") {
            FeedSource::Remote(location.to_string())
        } else {
            FeedSource::Local(PathBuf::from(location))
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, FeedSource::Remote(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub trip_updates_url: Option<String>,
    pub vehicle_positions_url: Option<String>,
    pub alerts_url: Option<String>,
    pub auth_header_name: Option<String>,
    pub auth_header_value: Option<String>,
}

impl RealtimeConfig {
    pub fn is_enabled(&self) -> bool {
        self.trip_updates_url.is_some() || self.vehicle_positions_url.is_some()
    }

    /// Header pair sent with every realtime request, if both halves are set.
    pub fn auth_header(&self) -> Option<(&str, &str)> {
        match (&self.auth_header_name, &self.auth_header_value) {
            (Some(name), Some(value)) if !name.is_empty() => Some((name.as_str(), value.as_str())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub static_source: FeedSource,
    pub realtime: RealtimeConfig,
    pub static_refresh_interval: Duration,
    pub realtime_refresh_interval: Duration,
    /// Deadline for each individual realtime fetch.
    pub realtime_fetch_timeout: Duration,
    /// Deadline for the synchronous realtime load during initialization.
    pub initial_realtime_timeout: Duration,
    pub static_download_timeout: Duration,
}

impl Config {
    pub const STATIC_REFRESH_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
    pub const REALTIME_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
    pub const REALTIME_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
    pub const INITIAL_REALTIME_TIMEOUT: Duration = Duration::from_secs(15);
    pub const STATIC_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(static_source: FeedSource) -> Self {
        Self {
            static_source,
            realtime: RealtimeConfig::default(),
            static_refresh_interval: Self::STATIC_REFRESH_INTERVAL,
            realtime_refresh_interval: Self::REALTIME_REFRESH_INTERVAL,
            realtime_fetch_timeout: Self::REALTIME_FETCH_TIMEOUT,
            initial_realtime_timeout: Self::INITIAL_REALTIME_TIMEOUT,
            static_download_timeout: Self::STATIC_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_realtime(mut self, realtime: RealtimeConfig) -> Self {
        self.realtime = realtime;
        self
    }

    /// The realtime cycle as a whole must finish within one refresh period.
    pub fn realtime_cycle_timeout(&self) -> Duration {
        self.realtime_fetch_timeout
            .max(self.realtime_refresh_interval)
    }

    pub fn validate(&self) -> Result<()> {
        if self.static_refresh_interval.is_zero() || self.realtime_refresh_interval.is_zero() {
            return Err(WhereError::Config(
                "refresh intervals must be greater than zero".to_string(),
            ));
        }
        if self.realtime_fetch_timeout.is_zero() {
            return Err(WhereError::Config(
                "realtime fetch timeout must be greater than zero".to_string(),
            ));
        }
        if let FeedSource::Local(path) = &self.static_source {
            if path.as_os_str().is_empty() {
                return Err(WhereError::Config("static feed path is empty".to_string()));
            }
        }
        Ok(())
    }
}

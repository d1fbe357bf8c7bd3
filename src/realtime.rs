// GTFS-RT fetching and decoding. Feeds are fetched as raw bytes through a
// FeedFetcher so the refresh loop can be driven without a network in tests.

use bytes::Bytes;
use futures::future::BoxFuture;
use gtfs_rt::FeedMessage;
use prost::Message;
use std::time::Duration;
use tracing::debug;

use crate::config::RealtimeConfig;
use crate::error::{Result, WhereError};
use crate::models::{ActivePeriod, ServiceAlert, StopTimeUpdate, TripUpdate, Vehicle};

/// A byte-producing source for realtime feeds.
pub trait FeedFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    auth_header: Option<(String, String)>,
}

impl HttpFetcher {
    pub fn new(realtime: &RealtimeConfig, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| WhereError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            auth_header: realtime
                .auth_header()
                .map(|(name, value)| (name.to_string(), value.to_string())),
        })
    }
}

impl FeedFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let mut request = self.client.get(url);
            if let Some((name, value)) = &self.auth_header {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request
                .send()
                .await
                .map_err(|e| WhereError::Network(format!("Failed to fetch {}: {}", url, e)))?;

            if !response.status().is_success() {
                return Err(WhereError::Network(format!(
                    "{} responded with status: {}",
                    url,
                    response.status()
                )));
            }

            response
                .bytes()
                .await
                .map_err(|e| WhereError::Network(format!("Failed to read response from {}: {}", url, e)))
        })
    }
}

pub fn decode_feed(body: &[u8]) -> Result<FeedMessage> {
    FeedMessage::decode(body)
        .map_err(|e| WhereError::Parse(format!("Failed to decode GTFS-RT feed: {}", e)))
}

pub async fn fetch_vehicle_positions(fetcher: &dyn FeedFetcher, url: &str) -> Result<Vec<Vehicle>> {
    let body = fetcher.fetch(url).await?;
    let vehicles = vehicles_from_feed(decode_feed(&body)?);
    debug!(count = vehicles.len(), "decoded vehicle positions");
    Ok(vehicles)
}

pub async fn fetch_trip_updates(fetcher: &dyn FeedFetcher, url: &str) -> Result<Vec<TripUpdate>> {
    let body = fetcher.fetch(url).await?;
    let updates = trip_updates_from_feed(decode_feed(&body)?);
    debug!(count = updates.len(), "decoded trip updates");
    Ok(updates)
}

pub async fn fetch_alerts(fetcher: &dyn FeedFetcher, url: &str) -> Result<Vec<ServiceAlert>> {
    let body = fetcher.fetch(url).await?;
    let alerts = alerts_from_feed(decode_feed(&body)?);
    debug!(count = alerts.len(), "decoded service alerts");
    Ok(alerts)
}

// ============================================================================
// Conversions
// ============================================================================

fn occupancy_label(status: i32) -> Option<&'static str> {
    Some(match status {
        0 => "EMPTY",
        1 => "MANY_SEATS_AVAILABLE",
        2 => "FEW_SEATS_AVAILABLE",
        3 => "STANDING_ROOM_ONLY",
        4 => "CRUSHED_STANDING_ROOM_ONLY",
        5 => "FULL",
        6 => "NOT_ACCEPTING_PASSENGERS",
        7 => "NO_DATA_AVAILABLE",
        8 => "NOT_BOARDABLE",
        _ => return None,
    })
}

pub fn vehicles_from_feed(feed: FeedMessage) -> Vec<Vehicle> {
    feed.entity
        .into_iter()
        .filter_map(|entity| {
            let entity_id = entity.id;
            entity.vehicle.map(|vehicle| {
                let vehicle_id = vehicle
                    .vehicle
                    .as_ref()
                    .and_then(|v| v.id.clone())
                    .filter(|id| !id.is_empty())
                    .unwrap_or(entity_id);

                let trip_id = vehicle
                    .trip
                    .as_ref()
                    .and_then(|t| t.trip_id.clone())
                    .filter(|id| !id.is_empty());

                let route_id = vehicle.trip.as_ref().and_then(|t| t.route_id.clone());

                let (latitude, longitude, bearing) = match vehicle.position.as_ref() {
                    Some(p) => (
                        Some(p.latitude as f64),
                        Some(p.longitude as f64),
                        p.bearing.map(|b| b as f64),
                    ),
                    None => (None, None, None),
                };

                Vehicle {
                    vehicle_id,
                    trip_id,
                    route_id,
                    latitude,
                    longitude,
                    bearing,
                    occupancy_status: vehicle
                        .occupancy_status
                        .and_then(occupancy_label)
                        .map(str::to_string),
                    current_status: vehicle.current_status,
                    current_stop_sequence: vehicle.current_stop_sequence,
                    stop_id: vehicle.stop_id,
                    timestamp: vehicle.timestamp.map(|ts| ts as i64),
                }
            })
        })
        .collect()
}

pub fn trip_updates_from_feed(feed: FeedMessage) -> Vec<TripUpdate> {
    feed.entity
        .into_iter()
        .filter_map(|entity| entity.trip_update)
        .filter_map(|update| {
            let trip_id = update.trip.trip_id.clone().filter(|id| !id.is_empty())?;
            Some(TripUpdate {
                trip_id,
                vehicle_id: update.vehicle.as_ref().and_then(|v| v.id.clone()),
                delay: update.delay,
                timestamp: update.timestamp.map(|ts| ts as i64),
                stop_time_updates: update
                    .stop_time_update
                    .into_iter()
                    .map(|stu| StopTimeUpdate {
                        stop_sequence: stu.stop_sequence,
                        stop_id: stu.stop_id,
                        arrival_delay: stu.arrival.and_then(|event| event.delay),
                        departure_delay: stu.departure.and_then(|event| event.delay),
                    })
                    .collect(),
            })
        })
        .collect()
}

pub fn alerts_from_feed(feed: FeedMessage) -> Vec<ServiceAlert> {
    feed.entity
        .into_iter()
        .filter_map(|entity| {
            let id = entity.id;
            entity.alert.map(|alert| {
                let mut agency_ids = Vec::new();
                let mut route_ids = Vec::new();
                let mut trip_ids = Vec::new();
                let mut stop_ids = Vec::new();

                for informed_entity in alert.informed_entity {
                    if let Some(agency_id) = informed_entity.agency_id {
                        agency_ids.push(agency_id);
                    }
                    if let Some(route_id) = informed_entity.route_id {
                        route_ids.push(route_id);
                    }
                    if let Some(trip_id) = informed_entity.trip.and_then(|t| t.trip_id) {
                        trip_ids.push(trip_id);
                    }
                    if let Some(stop_id) = informed_entity.stop_id {
                        stop_ids.push(stop_id);
                    }
                }

                let active_periods = alert
                    .active_period
                    .iter()
                    .map(|period| ActivePeriod {
                        start: period.start.map(|s| s as i64),
                        end: period.end.map(|e| e as i64),
                    })
                    .collect();

                ServiceAlert {
                    id,
                    agency_ids,
                    route_ids,
                    trip_ids,
                    stop_ids,
                    active_periods,
                }
            })
        })
        .collect()
}

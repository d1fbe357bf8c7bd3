//! Fuses the static schedule of one trip with the current realtime snapshot
//! into an OBA-style trip status.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::debug;

use crate::alerts::AlertsProvider;
use crate::block::get_next_and_previous_trip_ids;
use crate::error::Result;
use crate::geo::{nearest_point_index, LatLon};
use crate::models::{RealtimeSnapshot, ShapePoint, StopTime, TripUpdate, Vehicle};
use crate::schedule::ScheduleStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Scheduled,
    Approaching,
    Stopped,
    InProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VehicleStatus {
    #[default]
    Scheduled,
    IncomingAt,
    StoppedAt,
    InTransitTo,
}

impl VehicleStatus {
    /// GTFS-RT VehicleStopStatus → (status, phase)
    pub fn from_realtime(current_status: Option<i32>) -> (VehicleStatus, Phase) {
        match current_status {
            Some(0) => (VehicleStatus::IncomingAt, Phase::Approaching),
            Some(1) => (VehicleStatus::StoppedAt, Phase::Stopped),
            Some(2) => (VehicleStatus::InTransitTo, Phase::InProgress),
            _ => (VehicleStatus::Scheduled, Phase::Scheduled),
        }
    }
}

/// Derived per request; never cached.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripStatus {
    pub active_trip_id: String,
    pub block_trip_sequence: usize,
    pub closest_stop: Option<String>,
    pub closest_stop_time_offset: Option<i64>,
    pub distance_along_trip: f64,
    pub last_known_distance_along_trip: f64,
    pub last_known_location: Option<LatLon>,
    pub last_known_orientation: Option<f64>,
    /// Milliseconds since the epoch.
    pub last_location_update_time: i64,
    pub last_update_time: i64,
    pub next_stop: Option<String>,
    pub next_stop_time_offset: Option<i64>,
    pub occupancy_status: Option<String>,
    pub orientation: Option<f64>,
    pub phase: Phase,
    pub position: Option<LatLon>,
    pub predicted: bool,
    /// Seconds; positive means late.
    pub schedule_deviation: i64,
    pub scheduled_distance_along_trip: f64,
    /// Agency-local midnight of the service date, in milliseconds.
    pub service_date: i64,
    pub situation_ids: Vec<String>,
    pub status: VehicleStatus,
    /// Full length of the trip's shape in metres; 0 without a usable shape.
    pub total_distance_along_trip: f64,
    pub vehicle_id: Option<String>,
    pub previous_trip_id: Option<String>,
    pub next_trip_id: Option<String>,
}

/// Realtime bearing is clockwise from north; OBA orientation is
/// counter-clockwise from east.
pub fn bearing_to_orientation(bearing: f64) -> f64 {
    (90.0 - bearing).rem_euclid(360.0)
}

/// First stop-time update carrying a delay wins; arrival is preferred over
/// departure within that update. Later updates are never consulted.
pub fn schedule_deviation(update: Option<&TripUpdate>) -> i64 {
    update
        .and_then(|u| {
            u.stop_time_updates
                .iter()
                .find_map(|stu| stu.arrival_delay.or(stu.departure_delay))
        })
        .map(i64::from)
        .unwrap_or(0)
}

fn service_midnight(tz: &Tz, service_date: NaiveDate) -> DateTime<Utc> {
    let midnight = service_date.and_time(chrono::NaiveTime::MIN);
    tz.from_local_datetime(&midnight)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

/// Position of a point along the shape, in metres from its start.
fn project_onto_shape(shape: &[ShapePoint], location: LatLon) -> Option<f64> {
    nearest_point_index(shape, location.lat, location.lon).map(|i| shape[i].cumulative_m)
}

/// Closest (by |delta|) and next (smallest positive delta) along one axis.
/// Earlier stop-times win ties.
fn closest_and_next<'a>(
    deltas: impl Iterator<Item = (&'a StopTime, f64)>,
) -> (Option<&'a StopTime>, Option<&'a StopTime>) {
    let mut closest: Option<(&StopTime, f64)> = None;
    let mut next: Option<(&StopTime, f64)> = None;
    for (stop_time, delta) in deltas {
        if closest.is_none_or(|(_, best)| delta.abs() < best) {
            closest = Some((stop_time, delta.abs()));
        }
        if delta > 0.0 && next.is_none_or(|(_, best)| delta < best) {
            next = Some((stop_time, delta));
        }
    }
    (closest.map(|(st, _)| st), next.map(|(st, _)| st))
}

fn scheduled_time(stop_time: &StopTime) -> Option<u32> {
    stop_time.arrival_time.or(stop_time.departure_time)
}

pub fn build_trip_status<S, A>(
    store: &S,
    realtime: &RealtimeSnapshot,
    alerts: &A,
    agency_id: &str,
    trip_id: &str,
    service_date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Option<TripStatus>>
where
    S: ScheduleStore + ?Sized,
    A: AlertsProvider + ?Sized,
{
    let Some(trip) = store.trip(trip_id)? else {
        return Ok(None);
    };
    let route = store.route(&trip.route_id)?;
    let tz = store.agency_timezone(agency_id)?;

    let midnight = service_midnight(&tz, service_date);
    let now_secs = (now - midnight).num_seconds();

    let mut status = TripStatus {
        active_trip_id: trip.trip_id.clone(),
        service_date: midnight.timestamp_millis(),
        ..Default::default()
    };

    let vehicle: Option<&Vehicle> = realtime.vehicle_for_trip(trip_id);
    let mut vehicle_position = None;
    if let Some(vehicle) = vehicle {
        let reported_ms = vehicle.timestamp.map(|ts| ts * 1000).unwrap_or(0);
        status.last_update_time = reported_ms;
        status.vehicle_id = Some(vehicle.vehicle_id.clone());
        status.occupancy_status = vehicle.occupancy_status.clone();
        status.predicted = true;

        if let Some(position) = vehicle.position() {
            status.position = Some(position);
            status.last_known_location = Some(position);
            status.last_location_update_time = reported_ms;
            vehicle_position = Some(position);
        }

        if let Some(bearing) = vehicle.bearing {
            let orientation = bearing_to_orientation(bearing);
            status.orientation = Some(orientation);
            status.last_known_orientation = Some(orientation);
        }

        let (vehicle_status, phase) = VehicleStatus::from_realtime(vehicle.current_status);
        status.status = vehicle_status;
        status.phase = phase;

        if let Some(active) = vehicle.trip_id.as_ref().filter(|id| !id.is_empty()) {
            status.active_trip_id = active.clone();
        }
    }

    status.schedule_deviation = schedule_deviation(realtime.trip_update_for_trip(trip_id));

    let shape = store.shape_points_for_trip(trip_id).unwrap_or_else(|e| {
        debug!(trip_id, error = %e, "shape lookup failed");
        Vec::new()
    });
    let stop_times = store.stop_times_for_trip(trip_id).unwrap_or_else(|e| {
        debug!(trip_id, error = %e, "stop times lookup failed");
        Vec::new()
    });

    let has_shape = shape.len() >= 2;
    let vehicle_distance = if has_shape {
        status.total_distance_along_trip = shape.last().map(|p| p.cumulative_m).unwrap_or(0.0);
        vehicle_position.and_then(|position| project_onto_shape(&shape, position))
    } else {
        None
    };
    if let Some(distance) = vehicle_distance {
        status.distance_along_trip = distance;
        status.last_known_distance_along_trip = distance;
    }

    // Stop-times paired with their stop location, skipping stops we cannot resolve.
    let located: Vec<(&StopTime, LatLon)> = stop_times
        .iter()
        .filter_map(|st| match store.stop(&st.stop_id) {
            Ok(Some(stop)) => Some((st, stop.location)),
            _ => None,
        })
        .collect();

    let by_time = closest_and_next(
        stop_times
            .iter()
            .filter_map(|st| scheduled_time(st).map(|t| (st, t as f64 - now_secs as f64))),
    );

    let (closest, next) = match vehicle_distance {
        Some(vehicle_distance) => closest_and_next(located.iter().filter_map(|&(st, location)| {
            project_onto_shape(&shape, location).map(|d| (st, d - vehicle_distance))
        })),
        None => by_time,
    };

    if has_shape {
        // Where the schedule says the trip should be right now.
        if let Some(location) = by_time
            .0
            .and_then(|st| located.iter().find(|(l, _)| std::ptr::eq(*l, st)))
            .map(|&(_, location)| location)
        {
            status.scheduled_distance_along_trip =
                project_onto_shape(&shape, location).unwrap_or(0.0);
        }
    }

    let deviation = status.schedule_deviation;
    let offset =
        |stop_time: &StopTime| scheduled_time(stop_time).map(|t| t as i64 + deviation - now_secs);
    status.closest_stop = closest.map(|st| st.stop_id.clone());
    status.closest_stop_time_offset = closest.and_then(offset);
    status.next_stop = next.map(|st| st.stop_id.clone());
    status.next_stop_time_offset = next.and_then(offset);

    match get_next_and_previous_trip_ids(store, &trip, service_date) {
        Ok(neighbours) => {
            status.block_trip_sequence = neighbours.sequence.unwrap_or(0);
            status.previous_trip_id = neighbours.previous_trip_id;
            status.next_trip_id = neighbours.next_trip_id;
        }
        Err(e) => debug!(trip_id, error = %e, "block sequencing failed"),
    }

    status.situation_ids = alerts.alert_ids_for_trip(
        trip_id,
        route.as_ref().map(|r| r.route_id.as_str()),
        now.timestamp(),
    );

    Ok(Some(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::NoAlerts;
    use crate::error::WhereError;
    use crate::models::{
        Agency, FeedTables, Route, ServiceAlert, StaticSnapshot, Stop, StopTimeUpdate, Trip,
    };
    use std::sync::Arc;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
    }

    /// 08:00 local time on the service date (UTC agency).
    fn at(seconds_of_day: i64) -> DateTime<Utc> {
        date().and_time(chrono::NaiveTime::MIN).and_utc() + chrono::Duration::seconds(seconds_of_day)
    }

    fn stop(id: &str, lat: f64) -> Stop {
        Stop {
            stop_id: id.to_string(),
            stop_name: id.to_string(),
            stop_code: None,
            location: LatLon::new(lat, 0.0),
            location_type: 0,
            parent_station: None,
        }
    }

    fn stop_time(stop_id: &str, sequence: u32, time: u32) -> StopTime {
        StopTime {
            trip_id: "T1".to_string(),
            arrival_time: Some(time),
            departure_time: Some(time),
            stop_id: stop_id.to_string(),
            stop_sequence: sequence,
            stop_headsign: None,
        }
    }

    /// A northbound line along the meridian with stops at 0.00, 0.01, 0.02.
    fn feed() -> StaticSnapshot {
        StaticSnapshot::build(FeedTables {
            agencies: vec![Agency {
                agency_id: "1".to_string(),
                agency_name: "Metro".to_string(),
                agency_url: String::new(),
                agency_timezone: "UTC".to_string(),
                agency_phone: None,
            }],
            routes: vec![Route {
                route_id: "R1".to_string(),
                agency_id: Some("1".to_string()),
                route_short_name: None,
                route_long_name: None,
                route_type: 3,
                route_color: None,
            }],
            trips: vec![Trip {
                trip_id: "T1".to_string(),
                route_id: "R1".to_string(),
                service_id: "WK".to_string(),
                trip_headsign: None,
                direction_id: None,
                block_id: None,
                shape_id: Some("S1".to_string()),
            }],
            stops: vec![stop("A", 0.0), stop("B", 0.01), stop("C", 0.02)],
            shape_points: (0..=20)
                .map(|i| ("S1".to_string(), i as f64 * 0.001, 0.0, i))
                .collect(),
            stop_times: vec![
                stop_time("A", 1, 8 * 3600),
                stop_time("B", 2, 8 * 3600 + 600),
                stop_time("C", 3, 8 * 3600 + 1200),
            ],
            ..Default::default()
        })
    }

    fn vehicle_at(lat: f64, status: Option<i32>) -> Vehicle {
        Vehicle {
            vehicle_id: "bus-1".to_string(),
            trip_id: Some("T1".to_string()),
            route_id: None,
            latitude: Some(lat),
            longitude: Some(0.0),
            bearing: Some(0.0),
            occupancy_status: None,
            current_status: status,
            current_stop_sequence: None,
            stop_id: None,
            timestamp: Some(1_709_625_600),
        }
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            VehicleStatus::from_realtime(Some(0)),
            (VehicleStatus::IncomingAt, Phase::Approaching)
        );
        assert_eq!(
            VehicleStatus::from_realtime(Some(1)),
            (VehicleStatus::StoppedAt, Phase::Stopped)
        );
        assert_eq!(
            VehicleStatus::from_realtime(Some(2)),
            (VehicleStatus::InTransitTo, Phase::InProgress)
        );
        assert_eq!(
            VehicleStatus::from_realtime(Some(7)),
            (VehicleStatus::Scheduled, Phase::Scheduled)
        );
        assert_eq!(
            VehicleStatus::from_realtime(None),
            (VehicleStatus::Scheduled, Phase::Scheduled)
        );
    }

    #[test]
    fn test_orientation_conversion() {
        assert_eq!(bearing_to_orientation(0.0), 90.0);
        assert_eq!(bearing_to_orientation(90.0), 0.0);
        assert_eq!(bearing_to_orientation(180.0), 270.0);
        assert_eq!(bearing_to_orientation(270.0), 180.0);
    }

    #[test]
    fn test_schedule_deviation_first_qualifying_update_wins() {
        let update = TripUpdate {
            trip_id: "T1".to_string(),
            vehicle_id: None,
            delay: None,
            timestamp: None,
            stop_time_updates: vec![
                StopTimeUpdate::default(),
                StopTimeUpdate {
                    departure_delay: Some(120),
                    ..Default::default()
                },
                StopTimeUpdate {
                    arrival_delay: Some(5),
                    ..Default::default()
                },
            ],
        };
        assert_eq!(schedule_deviation(Some(&update)), 120);
        assert_eq!(schedule_deviation(None), 0);
    }

    #[test]
    fn test_unknown_trip_is_none() {
        let store = feed();
        let status = build_trip_status(
            &store,
            &RealtimeSnapshot::default(),
            &NoAlerts,
            "1",
            "missing",
            date(),
            at(8 * 3600),
        )
        .unwrap();
        assert!(status.is_none());
    }

    #[test]
    fn test_unknown_agency_uses_utc_midnight() {
        let store = feed();
        let status = build_trip_status(
            &store,
            &RealtimeSnapshot::default(),
            &NoAlerts,
            "no-such-agency",
            "T1",
            date(),
            at(8 * 3600),
        )
        .unwrap()
        .unwrap();
        assert_eq!(status.service_date, at(0).timestamp_millis());
    }

    #[test]
    fn test_scheduled_status_uses_time_axis() {
        let store = feed();
        let status = build_trip_status(
            &store,
            &RealtimeSnapshot::default(),
            &NoAlerts,
            "1",
            "T1",
            date(),
            at(8 * 3600 + 500),
        )
        .unwrap()
        .unwrap();

        assert_eq!(status.phase, Phase::Scheduled);
        assert_eq!(status.status, VehicleStatus::Scheduled);
        assert!(!status.predicted);
        assert_eq!(status.position, None);
        assert_eq!(status.distance_along_trip, 0.0);
        assert!(status.total_distance_along_trip > 2000.0);
        assert_eq!(status.closest_stop.as_deref(), Some("B"));
        assert_eq!(status.closest_stop_time_offset, Some(100));
        assert_eq!(status.next_stop.as_deref(), Some("B"));
        assert!(status.scheduled_distance_along_trip > 1000.0);
        assert_eq!(status.service_date, at(0).timestamp_millis());
    }

    #[test]
    fn test_vehicle_status_uses_distance_axis() {
        let store = feed();
        let realtime = RealtimeSnapshot::new(vec![vehicle_at(0.0042, Some(2))], vec![]);
        let status = build_trip_status(
            &store,
            &realtime,
            &NoAlerts,
            "1",
            "T1",
            date(),
            at(8 * 3600),
        )
        .unwrap()
        .unwrap();

        assert_eq!(status.phase, Phase::InProgress);
        assert_eq!(status.status, VehicleStatus::InTransitTo);
        assert_eq!(status.vehicle_id.as_deref(), Some("bus-1"));
        assert!(status.predicted);
        assert_eq!(status.orientation, Some(90.0));
        assert_eq!(status.last_known_orientation, Some(90.0));
        assert_eq!(status.last_update_time, 1_709_625_600_000);
        // Snapped to the 0.004 shape point, between A and B but nearer A.
        assert!(status.distance_along_trip > 400.0 && status.distance_along_trip < 500.0);
        assert_eq!(status.closest_stop.as_deref(), Some("A"));
        assert_eq!(status.next_stop.as_deref(), Some("B"));
    }

    #[test]
    fn test_schedule_deviation_flows_into_offsets() {
        let store = feed();
        let mut realtime = RealtimeSnapshot::new(
            vec![],
            vec![TripUpdate {
                trip_id: "T1".to_string(),
                vehicle_id: None,
                delay: None,
                timestamp: None,
                stop_time_updates: vec![StopTimeUpdate {
                    arrival_delay: Some(60),
                    ..Default::default()
                }],
            }],
        );
        realtime.alerts = Arc::new(vec![ServiceAlert {
            id: "detour".to_string(),
            agency_ids: vec![],
            route_ids: vec!["R1".to_string()],
            trip_ids: vec![],
            stop_ids: vec![],
            active_periods: vec![],
        }]);

        let status = build_trip_status(
            &store,
            &realtime,
            &realtime,
            "1",
            "T1",
            date(),
            at(8 * 3600 + 500),
        )
        .unwrap()
        .unwrap();
        assert_eq!(status.schedule_deviation, 60);
        assert_eq!(status.closest_stop_time_offset, Some(160));
        assert_eq!(status.situation_ids, vec!["detour".to_string()]);
    }

    struct FailingStore;

    impl ScheduleStore for FailingStore {
        fn trip(&self, _: &str) -> Result<Option<Trip>> {
            Err(WhereError::Query("connection reset".to_string()))
        }
        fn route(&self, _: &str) -> Result<Option<Route>> {
            unreachable!()
        }
        fn agency(&self, _: &str) -> Result<Option<Agency>> {
            unreachable!()
        }
        fn stop(&self, _: &str) -> Result<Option<Stop>> {
            unreachable!()
        }
        fn stop_times_for_trip(&self, _: &str) -> Result<Vec<StopTime>> {
            unreachable!()
        }
        fn shape_points_for_trip(&self, _: &str) -> Result<Vec<ShapePoint>> {
            unreachable!()
        }
        fn next_stop_in_trip(&self, _: &str, _: &str) -> Result<Option<Stop>> {
            unreachable!()
        }
        fn trips_for_block(&self, _: &str) -> Result<Vec<Trip>> {
            unreachable!()
        }
        fn trips_for_stop(&self, _: &str) -> Result<Vec<Trip>> {
            unreachable!()
        }
        fn is_service_active(&self, _: &str, _: NaiveDate) -> Result<bool> {
            unreachable!()
        }
    }

    #[test]
    fn test_hard_query_failure_propagates() {
        let err = build_trip_status(
            &FailingStore,
            &RealtimeSnapshot::default(),
            &NoAlerts,
            "1",
            "T1",
            date(),
            at(0),
        )
        .unwrap_err();
        assert!(matches!(err, WhereError::Query(_)));
    }
}

// Static GTFS entities, the immutable static snapshot built from them, and the
// realtime records decoded from GTFS-RT feeds.

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::geo::{haversine_distance, LatLon};

// ============================================================================
// Static Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    pub agency_id: String,
    pub agency_name: String,
    pub agency_url: String,
    pub agency_timezone: String,
    pub agency_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub agency_id: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub route_type: u32,
    pub route_color: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub trip_id: String,
    pub route_id: String,
    pub service_id: String,
    pub trip_headsign: Option<String>,
    pub direction_id: Option<u32>,
    pub block_id: Option<String>,
    pub shape_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_code: Option<String>,
    pub location: LatLon,
    pub location_type: u32,
    pub parent_station: Option<String>,
}

impl AsRef<LatLon> for Stop {
    fn as_ref(&self) -> &LatLon {
        &self.location
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapePoint {
    pub location: LatLon,
    pub sequence: u32,
    /// Haversine metres from the first point of the shape.
    pub cumulative_m: f64,
}

impl AsRef<LatLon> for ShapePoint {
    fn as_ref(&self) -> &LatLon {
        &self.location
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    /// Seconds since midnight of the service day; may exceed 24h.
    pub arrival_time: Option<u32>,
    pub departure_time: Option<u32>,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub stop_headsign: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: String,
    pub monday: bool,
    pub tuesday: bool,
    pub wednesday: bool,
    pub thursday: bool,
    pub friday: bool,
    pub saturday: bool,
    pub sunday: bool,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl ServiceCalendar {
    fn runs_on_weekday(&self, weekday: Weekday) -> bool {
        match weekday {
            Weekday::Mon => self.monday,
            Weekday::Tue => self.tuesday,
            Weekday::Wed => self.wednesday,
            Weekday::Thu => self.thursday,
            Weekday::Fri => self.friday,
            Weekday::Sat => self.saturday,
            Weekday::Sun => self.sunday,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarDate {
    pub service_id: String,
    pub date: NaiveDate,
    pub exception_type: u32, // 1 = service added, 2 = service removed
}

/// GTFS `H:MM:SS` to seconds since service-day midnight. Hours may exceed 23;
/// minutes and seconds may not.
pub fn parse_gtfs_time(time_str: &str) -> Option<u32> {
    let mut parts = time_str.trim().split(':');
    let (hours, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;
    let seconds: u32 = seconds.parse().ok()?;
    if minutes >= 60 || seconds >= 60 {
        return None;
    }

    hours.checked_mul(3600)?.checked_add(minutes * 60 + seconds)
}

/// Parse a GTFS service date (YYYYMMDD)
pub fn parse_gtfs_date(date_str: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date_str.trim(), "%Y%m%d").ok()
}

// ============================================================================
// Static Snapshot
// ============================================================================

/// Raw tables of a feed, in feed order. Consumed by [`StaticSnapshot::build`].
#[derive(Debug, Clone, Default)]
pub struct FeedTables {
    pub agencies: Vec<Agency>,
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stops: Vec<Stop>,
    /// (shape_id, lat, lon, sequence)
    pub shape_points: Vec<(String, f64, f64, u32)>,
    pub stop_times: Vec<StopTime>,
    pub calendar: Vec<ServiceCalendar>,
    pub calendar_dates: Vec<CalendarDate>,
}

/// One immutable, fully indexed copy of a static feed. Never mutated after
/// [`StaticSnapshot::build`]; refreshes replace the whole value.
#[derive(Debug, Clone)]
pub struct StaticSnapshot {
    agencies: Vec<Agency>,
    routes: HashMap<String, Route>,
    trips: HashMap<String, Trip>,
    stops: HashMap<String, Stop>,
    shapes: HashMap<String, Vec<ShapePoint>>,
    stop_times: HashMap<String, Vec<StopTime>>, // key: trip_id, ordered by stop_sequence
    calendar: HashMap<String, ServiceCalendar>,
    calendar_dates: HashMap<String, Vec<CalendarDate>>,
    trips_by_block: HashMap<String, Vec<String>>,
    trips_by_stop: HashMap<String, Vec<String>>,
    pub loaded_at: DateTime<Utc>,
}

impl StaticSnapshot {
    pub fn build(tables: FeedTables) -> Self {
        let FeedTables {
            agencies,
            routes,
            trips,
            stops,
            shape_points,
            stop_times,
            calendar,
            calendar_dates,
        } = tables;

        let mut shapes: HashMap<String, Vec<ShapePoint>> = HashMap::new();
        for (shape_id, lat, lon, sequence) in shape_points {
            shapes.entry(shape_id).or_default().push(ShapePoint {
                location: LatLon::new(lat, lon),
                sequence,
                cumulative_m: 0.0,
            });
        }
        for points in shapes.values_mut() {
            points.sort_by_key(|p| p.sequence);
            let mut total = 0.0;
            for i in 1..points.len() {
                let (a, b) = (points[i - 1].location, points[i].location);
                total += haversine_distance(a.lat, a.lon, b.lat, b.lon);
                points[i].cumulative_m = total;
            }
        }

        let mut trips_by_block: HashMap<String, Vec<String>> = HashMap::new();
        for trip in &trips {
            if let Some(block_id) = trip.block_id.as_ref().filter(|b| !b.is_empty()) {
                trips_by_block
                    .entry(block_id.clone())
                    .or_default()
                    .push(trip.trip_id.clone());
            }
        }

        let mut trips_by_stop: HashMap<String, Vec<String>> = HashMap::new();
        let mut seen_stop_trip: HashSet<(String, String)> = HashSet::new();
        let mut stop_times_map: HashMap<String, Vec<StopTime>> = HashMap::new();
        for stop_time in stop_times {
            if seen_stop_trip.insert((stop_time.stop_id.clone(), stop_time.trip_id.clone())) {
                trips_by_stop
                    .entry(stop_time.stop_id.clone())
                    .or_default()
                    .push(stop_time.trip_id.clone());
            }
            stop_times_map
                .entry(stop_time.trip_id.clone())
                .or_default()
                .push(stop_time);
        }
        for times in stop_times_map.values_mut() {
            times.sort_by_key(|st| st.stop_sequence);
        }

        let mut calendar_dates_map: HashMap<String, Vec<CalendarDate>> = HashMap::new();
        for date in calendar_dates {
            calendar_dates_map
                .entry(date.service_id.clone())
                .or_default()
                .push(date);
        }

        StaticSnapshot {
            agencies,
            routes: routes.into_iter().map(|r| (r.route_id.clone(), r)).collect(),
            trips: trips.into_iter().map(|t| (t.trip_id.clone(), t)).collect(),
            stops: stops.into_iter().map(|s| (s.stop_id.clone(), s)).collect(),
            shapes,
            stop_times: stop_times_map,
            calendar: calendar.into_iter().map(|c| (c.service_id.clone(), c)).collect(),
            calendar_dates: calendar_dates_map,
            trips_by_block,
            trips_by_stop,
            loaded_at: Utc::now(),
        }
    }

    pub fn agency(&self, agency_id: &str) -> Option<&Agency> {
        self.agencies.iter().find(|a| a.agency_id == agency_id)
    }

    /// Agency a route belongs to; feeds with a single agency may omit the id.
    pub fn agency_for_route(&self, route: &Route) -> Option<&Agency> {
        match route.agency_id.as_deref().filter(|id| !id.is_empty()) {
            Some(agency_id) => self.agency(agency_id),
            None => self.agencies.first(),
        }
    }

    pub fn route(&self, route_id: &str) -> Option<&Route> {
        self.routes.get(route_id)
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trips.get(trip_id)
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stops.get(stop_id)
    }

    pub fn shape(&self, shape_id: &str) -> Option<&[ShapePoint]> {
        self.shapes.get(shape_id).map(Vec::as_slice)
    }

    pub fn stop_times_for_trip(&self, trip_id: &str) -> &[StopTime] {
        self.stop_times
            .get(trip_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn trip_ids_for_block(&self, block_id: &str) -> &[String] {
        self.trips_by_block
            .get(block_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn trip_ids_for_stop(&self, stop_id: &str) -> &[String] {
        self.trips_by_stop
            .get(stop_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Check if a service is active on a given date
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        // Exceptions win over the regular calendar
        if let Some(exceptions) = self.calendar_dates.get(service_id) {
            if let Some(exception) = exceptions.iter().find(|e| e.date == date) {
                return exception.exception_type == 1;
            }
        }

        match self.calendar.get(service_id) {
            Some(cal) if date >= cal.start_date && date <= cal.end_date => {
                cal.runs_on_weekday(date.weekday())
            }
            _ => false,
        }
    }

    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            agencies: self.agencies.len(),
            routes: self.routes.len(),
            trips: self.trips.len(),
            stops: self.stops.len(),
            shapes: self.shapes.len(),
            stop_times: self.stop_times.values().map(Vec::len).sum(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SnapshotCounts {
    pub agencies: usize,
    pub routes: usize,
    pub trips: usize,
    pub stops: usize,
    pub shapes: usize,
    pub stop_times: usize,
}

// ============================================================================
// Realtime Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// Degrees clockwise from north, as reported by the feed.
    pub bearing: Option<f64>,
    pub occupancy_status: Option<String>,
    /// Raw GTFS-RT VehicleStopStatus value.
    pub current_status: Option<i32>,
    pub current_stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<i64>,
}

impl Vehicle {
    pub fn position(&self) -> Option<LatLon> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some(LatLon::new(lat, lon)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub arrival_delay: Option<i32>,
    pub departure_delay: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TripUpdate {
    pub trip_id: String,
    pub vehicle_id: Option<String>,
    pub delay: Option<i32>,
    pub timestamp: Option<i64>,
    pub stop_time_updates: Vec<StopTimeUpdate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ActivePeriod {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl ActivePeriod {
    pub fn contains(&self, unix_seconds: i64) -> bool {
        self.start.is_none_or(|start| unix_seconds >= start)
            && self.end.is_none_or(|end| unix_seconds <= end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceAlert {
    pub id: String,
    pub agency_ids: Vec<String>,
    pub route_ids: Vec<String>,
    pub trip_ids: Vec<String>,
    pub stop_ids: Vec<String>,
    pub active_periods: Vec<ActivePeriod>,
}

impl ServiceAlert {
    pub fn is_active_at(&self, unix_seconds: i64) -> bool {
        self.active_periods.is_empty() || self.active_periods.iter().any(|p| p.contains(unix_seconds))
    }
}

/// The realtime lists as of one read. Cloning copies three `Arc`s; the lists
/// themselves are never mutated once published.
#[derive(Debug, Clone, Default)]
pub struct RealtimeSnapshot {
    pub vehicles: Arc<Vec<Vehicle>>,
    pub trip_updates: Arc<Vec<TripUpdate>>,
    pub alerts: Arc<Vec<ServiceAlert>>,
}

impl RealtimeSnapshot {
    pub fn new(vehicles: Vec<Vehicle>, trip_updates: Vec<TripUpdate>) -> Self {
        Self {
            vehicles: Arc::new(vehicles),
            trip_updates: Arc::new(trip_updates),
            alerts: Arc::new(Vec::new()),
        }
    }

    pub fn vehicle_for_trip(&self, trip_id: &str) -> Option<&Vehicle> {
        self.vehicles
            .iter()
            .find(|v| v.trip_id.as_deref() == Some(trip_id))
    }

    pub fn trip_update_for_trip(&self, trip_id: &str) -> Option<&TripUpdate> {
        self.trip_updates.iter().find(|t| t.trip_id == trip_id)
    }
}

// Static GTFS loading: fetch the archive from a local path or a remote URL and
// parse its tables into a StaticSnapshot.

use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::time::Duration;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::config::FeedSource;
use crate::error::{Result, WhereError};
use crate::geo::LatLon;
use crate::models::{
    parse_gtfs_date, parse_gtfs_time, Agency, CalendarDate, FeedTables, Route, ServiceCalendar,
    StaticSnapshot, Stop, StopTime, Trip,
};

type Archive = ZipArchive<Cursor<Bytes>>;

/// Read the archive bytes from wherever the feed lives.
pub async fn fetch_feed_bytes(source: &FeedSource, timeout: Duration) -> Result<Bytes> {
    match source {
        FeedSource::Local(path) => {
            let contents = tokio::fs::read(path).await.map_err(|e| {
                WhereError::File(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Ok(Bytes::from(contents))
        }
        FeedSource::Remote(url) => {
            let client = reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| WhereError::Network(format!("Failed to create HTTP client: {}", e)))?;

            let response = client
                .get(url)
                .send()
                .await
                .map_err(|e| WhereError::Network(format!("Failed to download GTFS: {}", e)))?;

            if !response.status().is_success() {
                return Err(WhereError::Network(format!(
                    "Download failed with status: {}",
                    response.status()
                )));
            }

            let zip_bytes = response
                .bytes()
                .await
                .map_err(|e| WhereError::Network(format!("Failed to read GTFS zip: {}", e)))?;

            info!(kb = zip_bytes.len() / 1024, "downloaded static GTFS archive");
            Ok(zip_bytes)
        }
    }
}

/// Fetch and parse in one go. Parsing runs on the blocking pool.
pub async fn load_static_snapshot(source: &FeedSource, timeout: Duration) -> Result<StaticSnapshot> {
    let zip_bytes = fetch_feed_bytes(source, timeout).await?;
    tokio::task::spawn_blocking(move || parse_feed(zip_bytes))
        .await
        .map_err(|e| WhereError::Parse(format!("GTFS parse task failed: {}", e)))?
}

pub fn parse_feed(zip_bytes: Bytes) -> Result<StaticSnapshot> {
    let mut archive = ZipArchive::new(Cursor::new(zip_bytes))
        .map_err(|e| WhereError::Parse(format!("Failed to open GTFS zip: {}", e)))?;

    let tables = FeedTables {
        agencies: parse_agencies(&mut archive)?,
        routes: parse_routes(&mut archive)?,
        trips: parse_trips(&mut archive)?,
        stops: parse_stops(&mut archive)?,
        shape_points: parse_shapes(&mut archive)?,
        stop_times: parse_stop_times(&mut archive)?,
        calendar: parse_calendar(&mut archive)?,
        calendar_dates: parse_calendar_dates(&mut archive)?,
    };

    let snapshot = StaticSnapshot::build(tables);
    let counts = snapshot.counts();
    info!(
        agencies = counts.agencies,
        routes = counts.routes,
        trips = counts.trips,
        stops = counts.stops,
        shapes = counts.shapes,
        stop_times = counts.stop_times,
        "parsed static GTFS feed"
    );
    Ok(snapshot)
}

// ============================================================================
// Table plumbing
// ============================================================================

/// Column lookup by header name, so feeds may order their columns freely.
struct Columns {
    index: HashMap<String, usize>,
}

impl Columns {
    fn new(headers: &csv::StringRecord) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim_start_matches('\u{feff}').trim().to_string(), i))
            .collect();
        Columns { index }
    }

    /// Trimmed, non-empty value of `name` in `record`.
    fn get<'r>(&self, record: &'r csv::StringRecord, name: &str) -> Option<&'r str> {
        self.index
            .get(name)
            .and_then(|&i| record.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn owned(&self, record: &csv::StringRecord, name: &str) -> Option<String> {
        self.get(record, name).map(str::to_string)
    }
}

fn read_file(archive: &mut Archive, name: &str) -> Result<Option<Vec<u8>>> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(WhereError::Parse(format!("Failed to open {}: {}", name, e))),
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)
        .map_err(|e| WhereError::File(format!("Failed to read {}: {}", name, e)))?;
    Ok(Some(contents))
}

/// Run `row` over every record of a table. Rows it rejects are skipped.
/// Text that is not valid UTF-8 is decoded lossily, row by row.
fn parse_table<T>(
    archive: &mut Archive,
    name: &str,
    required: bool,
    mut row: impl FnMut(&Columns, &csv::StringRecord) -> Option<T>,
) -> Result<Vec<T>> {
    let contents = match read_file(archive, name)? {
        Some(contents) => contents,
        None if required => return Err(WhereError::Parse(format!("{} not found", name))),
        None => return Ok(Vec::new()),
    };

    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(contents.as_slice());
    let headers = rdr
        .byte_headers()
        .map_err(|e| WhereError::Parse(format!("Bad header in {}: {}", name, e)))?
        .clone();
    let columns = Columns::new(&csv::StringRecord::from_byte_record_lossy(headers));

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.byte_records() {
        let record = result.ok().map(csv::StringRecord::from_byte_record_lossy);
        match record.and_then(|record| row(&columns, &record)) {
            Some(value) => rows.push(value),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(file = name, skipped, "skipped malformed rows");
    }
    Ok(rows)
}

// ============================================================================
// Individual tables
// ============================================================================

fn parse_agencies(archive: &mut Archive) -> Result<Vec<Agency>> {
    parse_table(archive, "agency.txt", true, |cols, record| {
        Some(Agency {
            agency_id: cols.owned(record, "agency_id").unwrap_or_default(),
            agency_name: cols.owned(record, "agency_name")?,
            agency_url: cols.owned(record, "agency_url").unwrap_or_default(),
            agency_timezone: cols.owned(record, "agency_timezone")?,
            agency_phone: cols.owned(record, "agency_phone"),
        })
    })
}

fn parse_routes(archive: &mut Archive) -> Result<Vec<Route>> {
    parse_table(archive, "routes.txt", true, |cols, record| {
        Some(Route {
            route_id: cols.owned(record, "route_id")?,
            agency_id: cols.owned(record, "agency_id"),
            route_short_name: cols.owned(record, "route_short_name"),
            route_long_name: cols.owned(record, "route_long_name"),
            route_type: cols
                .get(record, "route_type")
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            route_color: cols
                .owned(record, "route_color")
                .filter(|color| color.len() == 6),
        })
    })
}

fn parse_trips(archive: &mut Archive) -> Result<Vec<Trip>> {
    parse_table(archive, "trips.txt", true, |cols, record| {
        Some(Trip {
            trip_id: cols.owned(record, "trip_id")?,
            route_id: cols.owned(record, "route_id")?,
            service_id: cols.owned(record, "service_id")?,
            trip_headsign: cols.owned(record, "trip_headsign"),
            direction_id: cols.get(record, "direction_id").and_then(|s| s.parse().ok()),
            block_id: cols.owned(record, "block_id"),
            shape_id: cols.owned(record, "shape_id"),
        })
    })
}

fn parse_stops(archive: &mut Archive) -> Result<Vec<Stop>> {
    parse_table(archive, "stops.txt", true, |cols, record| {
        let lat = cols.get(record, "stop_lat")?.parse::<f64>().ok()?;
        let lon = cols.get(record, "stop_lon")?.parse::<f64>().ok()?;
        Some(Stop {
            stop_id: cols.owned(record, "stop_id")?,
            stop_name: cols.owned(record, "stop_name").unwrap_or_default(),
            stop_code: cols.owned(record, "stop_code"),
            location: LatLon::new(lat, lon),
            location_type: cols
                .get(record, "location_type")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            parent_station: cols.owned(record, "parent_station"),
        })
    })
}

fn parse_shapes(archive: &mut Archive) -> Result<Vec<(String, f64, f64, u32)>> {
    parse_table(archive, "shapes.txt", false, |cols, record| {
        Some((
            cols.owned(record, "shape_id")?,
            cols.get(record, "shape_pt_lat")?.parse().ok()?,
            cols.get(record, "shape_pt_lon")?.parse().ok()?,
            cols.get(record, "shape_pt_sequence")?.parse().ok()?,
        ))
    })
}

fn parse_stop_times(archive: &mut Archive) -> Result<Vec<StopTime>> {
    parse_table(archive, "stop_times.txt", true, |cols, record| {
        // Blank times are allowed; present but unreadable ones reject the row.
        let time = |name: &str| match cols.get(record, name) {
            None => Some(None),
            Some(raw) => parse_gtfs_time(raw).map(Some),
        };
        Some(StopTime {
            trip_id: cols.owned(record, "trip_id")?,
            arrival_time: time("arrival_time")?,
            departure_time: time("departure_time")?,
            stop_id: cols.owned(record, "stop_id")?,
            stop_sequence: cols.get(record, "stop_sequence")?.parse().ok()?,
            stop_headsign: cols.owned(record, "stop_headsign"),
        })
    })
}

fn parse_calendar(archive: &mut Archive) -> Result<Vec<ServiceCalendar>> {
    parse_table(archive, "calendar.txt", false, |cols, record| {
        let day = |name: &str| cols.get(record, name) == Some("1");
        Some(ServiceCalendar {
            service_id: cols.owned(record, "service_id")?,
            monday: day("monday"),
            tuesday: day("tuesday"),
            wednesday: day("wednesday"),
            thursday: day("thursday"),
            friday: day("friday"),
            saturday: day("saturday"),
            sunday: day("sunday"),
            start_date: parse_gtfs_date(cols.get(record, "start_date")?)?,
            end_date: parse_gtfs_date(cols.get(record, "end_date")?)?,
        })
    })
}

fn parse_calendar_dates(archive: &mut Archive) -> Result<Vec<CalendarDate>> {
    parse_table(archive, "calendar_dates.txt", false, |cols, record| {
        Some(CalendarDate {
            service_id: cols.owned(record, "service_id")?,
            date: parse_gtfs_date(cols.get(record, "date")?)?,
            exception_type: cols.get(record, "exception_type")?.parse().ok()?,
        })
    })
}

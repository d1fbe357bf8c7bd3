use bytes::Bytes;
use chrono::{NaiveDate, TimeZone, Utc};
use futures::future::BoxFuture;
use gtfs_rt::{FeedEntity, FeedHeader, FeedMessage, Position, TripDescriptor, VehicleDescriptor, VehiclePosition};
use prost::Message;
use std::io::{Cursor, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zip::write::FileOptions;

use transit_where::alerts::NoAlerts;
use transit_where::direction::DirectionCalculator;
use transit_where::geo::CompassDirection;
use transit_where::realtime::FeedFetcher;
use transit_where::trip_status::{Phase, VehicleStatus};
use transit_where::{build_trip_status, Config, FeedSource, Manager, RealtimeConfig, Result, WhereError};

const VEHICLES_URL: &str = "http://realtime.test/vehicle-positions";

/// One agency, one stop at the southern end of a two-point north-running
/// shape, one trip serving that stop.
fn write_feed(name: &str) -> PathBuf {
    let files = [
        (
            "agency.txt",
            "agency_id,agency_name,agency_url,agency_timezone\nA1,Metro,https://metro.example,America/Los_Angeles\n",
        ),
        ("routes.txt", "route_id,agency_id,route_short_name,route_type\nR1,A1,10,3\n"),
        ("trips.txt", "route_id,service_id,trip_id,shape_id\nR1,WK,T1,SH1\n"),
        ("stops.txt", "stop_id,stop_name,stop_lat,stop_lon\nSOUTH,South End,47.0,-122.0\n"),
        (
            "stop_times.txt",
            "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nT1,08:00:00,08:00:00,SOUTH,1\n",
        ),
        (
            "shapes.txt",
            "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence\nSH1,47.0,-122.0,1\nSH1,47.01,-122.0,2\n",
        ),
        (
            "calendar.txt",
            "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nWK,1,1,1,1,1,1,1,20240101,20241231\n",
        ),
    ];

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (file, contents) in files {
        writer.start_file(file, FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    let bytes = writer.finish().unwrap().into_inner();

    let path = std::env::temp_dir().join(format!("transit-where-{}-{}.zip", name, std::process::id()));
    std::fs::write(&path, bytes).unwrap();
    path
}

struct StaticFetcher(Bytes);

impl FeedFetcher for StaticFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            if url == VEHICLES_URL {
                Ok(self.0.clone())
            } else {
                Err(WhereError::Network(format!("{} unreachable", url)))
            }
        })
    }
}

fn vehicle_at_north_end() -> Bytes {
    let feed = FeedMessage {
        header: FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            ..Default::default()
        },
        entity: vec![FeedEntity {
            id: "e1".to_string(),
            vehicle: Some(VehiclePosition {
                trip: Some(TripDescriptor {
                    trip_id: Some("T1".to_string()),
                    ..Default::default()
                }),
                vehicle: Some(VehicleDescriptor {
                    id: Some("BUS-7".to_string()),
                    ..Default::default()
                }),
                position: Some(Position {
                    latitude: 47.01,
                    longitude: -122.0,
                    bearing: Some(0.0),
                    ..Default::default()
                }),
                current_status: Some(2),
                timestamp: Some(1_709_654_400),
                ..Default::default()
            }),
            ..Default::default()
        }],
    };
    Bytes::from(feed.encode_to_vec())
}

fn service_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
}

#[tokio::test]
async fn test_scheduled_trip_from_local_feed() {
    let path = write_feed("scheduled");
    let manager = Manager::initialize(Config::new(FeedSource::Local(path.clone())))
        .await
        .unwrap();

    let snapshot = manager.static_snapshot();
    let realtime = manager.realtime_snapshot();
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 15, 0, 0).unwrap();

    let status = build_trip_status(snapshot.as_ref(), &realtime, &NoAlerts, "A1", "T1", service_date(), now)
        .unwrap()
        .unwrap();
    assert_eq!(status.phase, Phase::Scheduled);
    assert_eq!(status.status, VehicleStatus::Scheduled);
    assert_eq!(status.distance_along_trip, 0.0);
    assert_eq!(status.closest_stop.as_deref(), Some("SOUTH"));
    assert!(!status.predicted);

    let direction = DirectionCalculator::new(snapshot.as_ref()).calculate_stop_direction("SOUTH");
    assert_eq!(direction, CompassDirection::N);

    assert!(build_trip_status(snapshot.as_ref(), &realtime, &NoAlerts, "A1", "NOPE", service_date(), now)
        .unwrap()
        .is_none());

    manager.shutdown().await;
    manager.shutdown().await;
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_realtime_vehicle_moves_trip_along_shape() {
    let path = write_feed("realtime");
    let mut config = Config::new(FeedSource::Local(path.clone())).with_realtime(RealtimeConfig {
        vehicle_positions_url: Some(VEHICLES_URL.to_string()),
        ..Default::default()
    });
    config.realtime_refresh_interval = Duration::from_secs(3600);

    let fetcher = Arc::new(StaticFetcher(vehicle_at_north_end()));
    let manager = Manager::initialize_with_fetcher(config, fetcher).await.unwrap();
    assert_eq!(manager.realtime_vehicles().len(), 1);

    let snapshot = manager.static_snapshot();
    let realtime = manager.realtime_snapshot();
    let now = Utc.with_ymd_and_hms(2024, 3, 5, 16, 0, 0).unwrap();

    let status = build_trip_status(snapshot.as_ref(), &realtime, &realtime, "A1", "T1", service_date(), now)
        .unwrap()
        .unwrap();
    assert_eq!(status.phase, Phase::InProgress);
    assert_eq!(status.status, VehicleStatus::InTransitTo);
    assert_eq!(status.vehicle_id.as_deref(), Some("BUS-7"));
    assert!(status.predicted);
    assert!(status.distance_along_trip > 1000.0);
    assert_eq!(status.distance_along_trip, status.total_distance_along_trip);
    assert_eq!(status.orientation, Some(90.0));
    assert_eq!(status.last_update_time, 1_709_654_400_000);

    // 2024-03-05 is in PST, so local midnight is 08:00 UTC.
    assert_eq!(
        status.service_date,
        Utc.with_ymd_and_hms(2024, 3, 5, 8, 0, 0).unwrap().timestamp_millis()
    );

    manager.shutdown().await;
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn test_missing_static_feed_is_fatal() {
    let config = Config::new(FeedSource::Local("/nonexistent/transit-where.zip".into()));
    let err = match Manager::initialize(config).await {
        Ok(_) => panic!("initialization should fail without a static feed"),
        Err(e) => e,
    };
    assert!(matches!(err, WhereError::File(_)), "got {:?}", err);
}

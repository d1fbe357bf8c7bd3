// OneBusAway-style API server over a static GTFS feed and its realtime feeds.

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpResponse, HttpResponseBuilder, HttpServer};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use transit_where::direction::DirectionCalculator;
use transit_where::geo::CompassDirection;
use transit_where::models::StaticSnapshot;
use transit_where::schedule::ScheduleStore;
use transit_where::{build_trip_status, Config, FeedSource, Manager, RealtimeConfig, Result, WhereError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the static GTFS zip; refreshed periodically
    #[arg(long, env = "GTFS_URL", conflicts_with = "gtfs_path", required_unless_present = "gtfs_path")]
    gtfs_url: Option<String>,

    /// Path to a local static GTFS zip; loaded once
    #[arg(long, env = "GTFS_PATH")]
    gtfs_path: Option<String>,

    #[arg(long, env = "TRIP_UPDATES_URL")]
    trip_updates_url: Option<String>,

    #[arg(long, env = "VEHICLE_POSITIONS_URL")]
    vehicle_positions_url: Option<String>,

    #[arg(long, env = "ALERTS_URL")]
    alerts_url: Option<String>,

    #[arg(long, env = "REALTIME_AUTH_HEADER_NAME")]
    realtime_auth_header_name: Option<String>,

    #[arg(long, env = "REALTIME_AUTH_HEADER_VALUE")]
    realtime_auth_header_value: Option<String>,

    #[arg(long, env = "STATIC_REFRESH_SECS", default_value_t = 24 * 60 * 60)]
    static_refresh_secs: u64,

    #[arg(long, env = "REALTIME_REFRESH_SECS", default_value_t = 30)]
    realtime_refresh_secs: u64,

    #[arg(short, long, env = "ADDRESS", default_value = "0.0.0.0")]
    address: String,

    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    port: u16,
}

impl Args {
    fn config(&self) -> Config {
        let location = self
            .gtfs_url
            .as_deref()
            .or(self.gtfs_path.as_deref())
            .unwrap_or_default();

        let mut config = Config::new(FeedSource::parse(location)).with_realtime(RealtimeConfig {
            trip_updates_url: self.trip_updates_url.clone(),
            vehicle_positions_url: self.vehicle_positions_url.clone(),
            alerts_url: self.alerts_url.clone(),
            auth_header_name: self.realtime_auth_header_name.clone(),
            auth_header_value: self.realtime_auth_header_value.clone(),
        });
        config.static_refresh_interval = Duration::from_secs(self.static_refresh_secs);
        config.realtime_refresh_interval = Duration::from_secs(self.realtime_refresh_secs);
        config
    }
}

#[derive(Clone)]
struct AppState {
    manager: Arc<Manager>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse<T> {
    code: u16,
    current_time: i64,
    text: String,
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> HttpResponse {
        HttpResponse::Ok().json(ApiResponse {
            code: 200,
            current_time: Utc::now().timestamp_millis(),
            text: "OK".to_string(),
            data: Some(data),
        })
    }
}

fn envelope(mut builder: HttpResponseBuilder, code: u16, text: String) -> HttpResponse {
    builder.json(ApiResponse::<()> {
        code,
        current_time: Utc::now().timestamp_millis(),
        text,
        data: None,
    })
}

/// Store failures are the only errors a caller sees; anything but a missing
/// entity is a server error.
fn error_response(err: &WhereError) -> HttpResponse {
    match err {
        WhereError::NotFound(_) => envelope(HttpResponse::NotFound(), 404, err.to_string()),
        _ => envelope(HttpResponse::InternalServerError(), 500, err.to_string()),
    }
}

fn bad_request(text: &str) -> HttpResponse {
    envelope(HttpResponse::BadRequest(), 400, text.to_string())
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripDetailsQuery {
    /// Milliseconds since the epoch; any instant within the service day.
    service_date: Option<i64>,
}

/// Agency of a trip, by way of its route, and the timezone its service days
/// are counted in.
fn trip_agency(snapshot: &StaticSnapshot, trip_id: &str) -> Result<Option<(String, Tz)>> {
    let Some(agency_id) = snapshot
        .trip(trip_id)
        .and_then(|trip| snapshot.route(&trip.route_id))
        .and_then(|route| snapshot.agency_for_route(route))
        .map(|agency| agency.agency_id.clone())
    else {
        return Ok(None);
    };
    let tz = ScheduleStore::agency_timezone(snapshot, &agency_id)?;
    Ok(Some((agency_id, tz)))
}

fn service_date_for(tz: &Tz, service_date_ms: Option<i64>, now: DateTime<Utc>) -> Option<NaiveDate> {
    let instant = match service_date_ms {
        Some(ms) => Utc.timestamp_millis_opt(ms).single()?,
        None => now,
    };
    Some(instant.with_timezone(tz).date_naive())
}

async fn get_trip_details(
    state: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<TripDetailsQuery>,
) -> HttpResponse {
    let trip_id = path.into_inner();
    let snapshot = state.manager.static_snapshot();
    let realtime = state.manager.realtime_snapshot();
    let now = Utc::now();

    let (agency_id, tz) = match trip_agency(&snapshot, &trip_id) {
        Ok(Some(found)) => found,
        Ok(None) => return error_response(&WhereError::NotFound(format!("trip '{}'", trip_id))),
        Err(e) => return error_response(&e),
    };
    let Some(service_date) = service_date_for(&tz, query.service_date, now) else {
        return bad_request("serviceDate is out of range");
    };

    match build_trip_status(
        snapshot.as_ref(),
        &realtime,
        &realtime,
        &agency_id,
        &trip_id,
        service_date,
        now,
    ) {
        Ok(Some(status)) => ApiResponse::ok(status),
        Ok(None) => error_response(&WhereError::NotFound(format!("trip '{}'", trip_id))),
        Err(e) => {
            error!(trip_id, error = %e, "trip status failed");
            error_response(&e)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StopEntry {
    id: String,
    name: String,
    code: Option<String>,
    lat: f64,
    lon: f64,
    location_type: u32,
    parent: Option<String>,
    direction: CompassDirection,
}

async fn get_stop(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let stop_id = path.into_inner();
    let snapshot = state.manager.static_snapshot();

    let Some(stop) = snapshot.stop(&stop_id) else {
        return error_response(&WhereError::NotFound(format!("stop '{}'", stop_id)));
    };

    let direction = DirectionCalculator::new(snapshot.as_ref()).calculate_stop_direction(&stop_id);
    ApiResponse::ok(StopEntry {
        id: stop.stop_id.clone(),
        name: stop.stop_name.clone(),
        code: stop.stop_code.clone(),
        lat: stop.location.lat,
        lon: stop.location.lon,
        location_type: stop.location_type,
        parent: stop.parent_station.clone(),
        direction,
    })
}

async fn get_vehicles(state: web::Data<AppState>) -> HttpResponse {
    let vehicles = state.manager.realtime_vehicles();
    ApiResponse::ok(vehicles.as_slice())
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.manager.static_snapshot();
    let realtime = state.manager.realtime_snapshot();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "staticLoadedAt": snapshot.loaded_at.timestamp_millis(),
        "static": snapshot.counts(),
        "vehicles": realtime.vehicles.len(),
        "tripUpdates": realtime.trip_updates.len(),
        "alerts": realtime.alerts.len(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(manager: Arc<Manager>, address: String, port: u16) -> std::io::Result<()> {
    let app_state = AppState { manager };

    info!(%address, port, "serving");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/where")
                    .route("/trip-details/{trip_id}", web::get().to(get_trip_details))
                    .route("/stop/{stop_id}", web::get().to(get_stop))
                    .route("/vehicles", web::get().to(get_vehicles)),
            )
    })
    .bind((address, port))?
    .run()
    .await
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = args.config();

    let manager = match Manager::initialize(config).await {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "initialization failed, server cannot start without static data");
            std::process::exit(1);
        }
    };

    let counts = manager.static_snapshot().counts();
    info!(
        agencies = counts.agencies,
        routes = counts.routes,
        trips = counts.trips,
        stops = counts.stops,
        "static data ready"
    );

    let result = run_server(manager.clone(), args.address, args.port).await;
    if let Err(e) = &result {
        warn!(error = %e, "server stopped with an error");
    }

    manager.shutdown().await;
    info!("shut down");
    result
}

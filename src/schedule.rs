//! Query contract the derivations read schedule data through.
//!
//! Every method is fallible so that an engine-backed store can surface hard
//! failures; lookups that simply find nothing return `Ok(None)` or an empty
//! list. The in-memory implementation over [`StaticSnapshot`] never errors.

use chrono::NaiveDate;
use chrono_tz::Tz;
use tracing::debug;

use crate::error::Result;
use crate::models::{Agency, Route, ShapePoint, StaticSnapshot, Stop, StopTime, Trip};

pub trait ScheduleStore {
    fn trip(&self, trip_id: &str) -> Result<Option<Trip>>;
    fn route(&self, route_id: &str) -> Result<Option<Route>>;
    fn agency(&self, agency_id: &str) -> Result<Option<Agency>>;
    fn stop(&self, stop_id: &str) -> Result<Option<Stop>>;

    /// Ordered by stop sequence.
    fn stop_times_for_trip(&self, trip_id: &str) -> Result<Vec<StopTime>>;

    /// Shape of the trip; empty when the trip has no shape.
    fn shape_points_for_trip(&self, trip_id: &str) -> Result<Vec<ShapePoint>>;

    /// The stop served right after `stop_id` on `trip_id`.
    fn next_stop_in_trip(&self, trip_id: &str, stop_id: &str) -> Result<Option<Stop>>;

    fn trips_for_block(&self, block_id: &str) -> Result<Vec<Trip>>;

    /// Trips that call at the stop, in feed order.
    fn trips_for_stop(&self, stop_id: &str) -> Result<Vec<Trip>>;

    fn is_service_active(&self, service_id: &str, date: NaiveDate) -> Result<bool>;

    /// Timezone used to interpret the agency's service days. An unknown
    /// agency or an unparseable zone name falls back to UTC; only a failing
    /// lookup is an error.
    fn agency_timezone(&self, agency_id: &str) -> Result<Tz> {
        let Some(agency) = self.agency(agency_id)? else {
            debug!(agency_id, "unknown agency, using UTC");
            return Ok(Tz::UTC);
        };
        Ok(agency.agency_timezone.parse::<Tz>().unwrap_or_else(|e| {
            debug!(agency_id, timezone = %agency.agency_timezone, error = %e, "unparseable agency timezone, using UTC");
            Tz::UTC
        }))
    }
}

impl ScheduleStore for StaticSnapshot {
    fn trip(&self, trip_id: &str) -> Result<Option<Trip>> {
        Ok(StaticSnapshot::trip(self, trip_id).cloned())
    }

    fn route(&self, route_id: &str) -> Result<Option<Route>> {
        Ok(StaticSnapshot::route(self, route_id).cloned())
    }

    fn agency(&self, agency_id: &str) -> Result<Option<Agency>> {
        Ok(StaticSnapshot::agency(self, agency_id).cloned())
    }

    fn stop(&self, stop_id: &str) -> Result<Option<Stop>> {
        Ok(StaticSnapshot::stop(self, stop_id).cloned())
    }

    fn stop_times_for_trip(&self, trip_id: &str) -> Result<Vec<StopTime>> {
        Ok(StaticSnapshot::stop_times_for_trip(self, trip_id).to_vec())
    }

    fn shape_points_for_trip(&self, trip_id: &str) -> Result<Vec<ShapePoint>> {
        let points = StaticSnapshot::trip(self, trip_id)
            .and_then(|trip| trip.shape_id.as_deref())
            .and_then(|shape_id| self.shape(shape_id))
            .map(<[ShapePoint]>::to_vec)
            .unwrap_or_default();
        Ok(points)
    }

    fn next_stop_in_trip(&self, trip_id: &str, stop_id: &str) -> Result<Option<Stop>> {
        let stop_times = StaticSnapshot::stop_times_for_trip(self, trip_id);
        let next = stop_times
            .iter()
            .position(|st| st.stop_id == stop_id)
            .and_then(|i| stop_times.get(i + 1))
            .and_then(|st| StaticSnapshot::stop(self, &st.stop_id))
            .cloned();
        Ok(next)
    }

    fn trips_for_block(&self, block_id: &str) -> Result<Vec<Trip>> {
        Ok(self
            .trip_ids_for_block(block_id)
            .iter()
            .filter_map(|id| StaticSnapshot::trip(self, id).cloned())
            .collect())
    }

    fn trips_for_stop(&self, stop_id: &str) -> Result<Vec<Trip>> {
        Ok(self
            .trip_ids_for_stop(stop_id)
            .iter()
            .filter_map(|id| StaticSnapshot::trip(self, id).cloned())
            .collect())
    }

    fn is_service_active(&self, service_id: &str, date: NaiveDate) -> Result<bool> {
        Ok(StaticSnapshot::is_service_active(self, service_id, date))
    }
}

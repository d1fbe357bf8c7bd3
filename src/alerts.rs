use crate::models::RealtimeSnapshot;

/// Source of situation ids for a trip. Only ids are exposed, never content.
pub trait AlertsProvider {
    fn alert_ids_for_trip(&self, trip_id: &str, route_id: Option<&str>, now_unix: i64) -> Vec<String>;
}

impl AlertsProvider for RealtimeSnapshot {
    fn alert_ids_for_trip(&self, trip_id: &str, route_id: Option<&str>, now_unix: i64) -> Vec<String> {
        self.alerts
            .iter()
            .filter(|alert| alert.is_active_at(now_unix))
            .filter(|alert| {
                alert.trip_ids.iter().any(|id| id == trip_id)
                    || route_id.is_some_and(|route_id| alert.route_ids.iter().any(|id| id == route_id))
            })
            .map(|alert| alert.id.clone())
            .collect()
    }
}

/// Provider with no alerts, for callers without an alerts feed.
pub struct NoAlerts;

impl AlertsProvider for NoAlerts {
    fn alert_ids_for_trip(&self, _trip_id: &str, _route_id: Option<&str>, _now_unix: i64) -> Vec<String> {
        Vec::new()
    }
}

//! Which way a stop faces, derived from the geometry of the trips serving it.

use tracing::debug;

use crate::geo::{bearing_to_compass, initial_bearing, nearest_point_index, CompassDirection};
use crate::schedule::ScheduleStore;

pub struct DirectionCalculator<'a, S: ScheduleStore + ?Sized> {
    store: &'a S,
}

/// Label frequencies in first-encountered order.
#[derive(Default)]
struct Tally {
    counts: Vec<(CompassDirection, usize)>,
}

impl Tally {
    fn add(&mut self, label: CompassDirection) {
        match self.counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, count)) => *count += 1,
            None => self.counts.push((label, 1)),
        }
    }

    fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Strict `>` keeps the first label to reach the maximum.
    fn winner(&self) -> Option<CompassDirection> {
        let mut best: Option<(CompassDirection, usize)> = None;
        for &(label, count) in &self.counts {
            if best.is_none_or(|(_, best_count)| count > best_count) {
                best = Some((label, count));
            }
        }
        best.map(|(label, _)| label)
    }
}

impl<'a, S: ScheduleStore + ?Sized> DirectionCalculator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Never fails: lookups that go wrong are skipped and an empty result is
    /// reported as [`CompassDirection::Unknown`].
    pub fn calculate_stop_direction(&self, stop_id: &str) -> CompassDirection {
        let stop = match self.store.stop(stop_id) {
            Ok(Some(stop)) => stop,
            Ok(None) => return CompassDirection::Unknown,
            Err(e) => {
                debug!(stop_id, error = %e, "stop lookup failed");
                return CompassDirection::Unknown;
            }
        };

        let trips = match self.store.trips_for_stop(stop_id) {
            Ok(trips) => trips,
            Err(e) => {
                debug!(stop_id, error = %e, "trips for stop lookup failed");
                return CompassDirection::Unknown;
            }
        };

        let mut tally = Tally::default();

        for trip in trips.iter().filter(|t| t.shape_id.is_some()) {
            let Ok(shape) = self.store.shape_points_for_trip(&trip.trip_id) else {
                continue;
            };
            let Some(index) = nearest_point_index(&shape, stop.location.lat, stop.location.lon) else {
                continue;
            };
            let Some(next) = shape.get(index + 1) else {
                continue;
            };
            let here = shape[index].location;
            let bearing = initial_bearing(here.lat, here.lon, next.location.lat, next.location.lon);
            tally.add(bearing_to_compass(bearing));
        }

        if tally.is_empty() {
            for trip in &trips {
                let Ok(Some(next_stop)) = self.store.next_stop_in_trip(&trip.trip_id, stop_id) else {
                    continue;
                };
                let bearing = initial_bearing(
                    stop.location.lat,
                    stop.location.lon,
                    next_stop.location.lat,
                    next_stop.location.lon,
                );
                tally.add(bearing_to_compass(bearing));
            }
        }

        tally.winner().unwrap_or(CompassDirection::Unknown)
    }
}

//! Neighbouring trips within a block on a given service date.

use chrono::NaiveDate;
use std::cmp::Reverse;
use tracing::debug;

use crate::error::Result;
use crate::models::{StopTime, Trip};
use crate::schedule::ScheduleStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockNeighbours {
    pub next_trip_id: Option<String>,
    pub previous_trip_id: Option<String>,
    /// Position of the trip within the ordered block, when it was found.
    pub sequence: Option<usize>,
}

struct RankedTrip {
    trip_id: String,
    active: bool,
    start_time: u32,
}

/// (min positive departure, max positive arrival)
fn trip_bounds(stop_times: &[StopTime]) -> Option<(u32, u32)> {
    let start = stop_times
        .iter()
        .filter_map(|st| st.departure_time)
        .filter(|&t| t > 0)
        .min()?;
    let end = stop_times
        .iter()
        .filter_map(|st| st.arrival_time)
        .filter(|&t| t > 0)
        .max()?;
    Some((start, end))
}

pub fn get_next_and_previous_trip_ids<S: ScheduleStore + ?Sized>(
    store: &S,
    trip: &Trip,
    service_date: NaiveDate,
) -> Result<BlockNeighbours> {
    let Some(block_id) = trip.block_id.as_deref().filter(|b| !b.is_empty()) else {
        return Ok(BlockNeighbours::default());
    };

    let mut ranked = Vec::new();
    for block_trip in store.trips_for_block(block_id)? {
        let active = store.is_service_active(&block_trip.service_id, service_date)?;
        if !active {
            continue;
        }

        let stop_times = store.stop_times_for_trip(&block_trip.trip_id)?;
        let Some((start_time, _end_time)) = trip_bounds(&stop_times) else {
            debug!(trip_id = %block_trip.trip_id, block_id, "block trip has no usable times");
            continue;
        };

        ranked.push(RankedTrip {
            trip_id: block_trip.trip_id,
            active,
            start_time,
        });
    }

    ranked.sort_by_key(|t| (Reverse(t.active), t.start_time));

    let Some(index) = ranked.iter().position(|t| t.trip_id == trip.trip_id) else {
        return Ok(BlockNeighbours::default());
    };

    Ok(BlockNeighbours {
        next_trip_id: ranked.get(index + 1).map(|t| t.trip_id.clone()),
        previous_trip_id: index
            .checked_sub(1)
            .and_then(|i| ranked.get(i))
            .map(|t| t.trip_id.clone()),
        sequence: Some(index),
    })
}

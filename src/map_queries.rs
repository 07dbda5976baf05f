//! Map queries over the loaded stops and vehicles.
//!
//! Everything here is a linear scan: the stop set is a few thousand entries
//! and vehicles a few hundred, so no spatial index is kept.

use crate::transit_models::{BusStop, VehiclePosition};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const NEARBY_RADIUS_KM: f64 = 1.0;
pub const NEARBY_MAX_RESULTS: usize = 5;
pub const SEARCH_MIN_QUERY_LEN: usize = 3;
pub const SEARCH_MAX_RESULTS: usize = 10;
pub const RECENT_WINDOW_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Coordinate { lat, lng }
    }
}

impl From<&BusStop> for Coordinate {
    fn from(stop: &BusStop) -> Self {
        Coordinate::new(stop.lat, stop.lng)
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinate, b: Coordinate) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyStop {
    #[serde(flatten)]
    pub stop: BusStop,
    pub distance_km: f64,
}

/// Stops within `radius_km` of `point`, in input order, first `limit` only.
pub fn nearby_stops(stops: &[BusStop], point: Coordinate, radius_km: f64, limit: usize) -> Vec<NearbyStop> {
    stops
        .iter()
        .filter_map(|stop| {
            let distance_km = haversine_km(point, stop.into());
            (distance_km <= radius_km).then(|| NearbyStop {
                stop: stop.clone(),
                distance_km,
            })
        })
        .take(limit)
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct StopSearch {
    /// Whether the results panel should be shown at all.
    pub visible: bool,
    pub results: Vec<BusStop>,
}

pub fn search_stops(stops: &[BusStop], query: &str) -> StopSearch {
    let query = query.trim();
    if query.chars().count() < SEARCH_MIN_QUERY_LEN {
        return StopSearch {
            visible: false,
            results: Vec::new(),
        };
    }

    let needle = query.to_lowercase();
    let results: Vec<BusStop> = stops
        .iter()
        .filter(|stop| {
            stop.stop_name.to_lowercase().contains(&needle)
                || stop.stop_id.to_lowercase().contains(&needle)
        })
        .take(SEARCH_MAX_RESULTS)
        .cloned()
        .collect();

    StopSearch {
        visible: true,
        results,
    }
}

/// With `recent_only` on, a vehicle must have pinged within the last
/// [`RECENT_WINDOW_MINUTES`].
pub fn is_recent(vehicle: &VehiclePosition, recent_only: bool, now: DateTime<Utc>) -> bool {
    if !recent_only {
        return true;
    }
    match vehicle.last_ping {
        Some(ping) => now.signed_duration_since(ping) <= Duration::minutes(RECENT_WINDOW_MINUTES),
        None => false,
    }
}

/// Vehicles on a selected route, passing the recency check, whose
/// coordinates parse. Anything else cannot be placed on the map.
pub fn filter_displayed(
    vehicles: &[VehiclePosition],
    selected_routes: &HashSet<String>,
    recent_only: bool,
    now: DateTime<Utc>,
) -> Vec<VehiclePosition> {
    vehicles
        .iter()
        .filter(|v| is_recent(v, recent_only, now))
        .filter(|v| selected_routes.contains(&v.route))
        .filter(|v| v.latitude().is_some() && v.longitude().is_some())
        .cloned()
        .collect()
}

/// Collapses repeated ids to one entry. The last record seen for an id wins
/// and takes the slot where that id first appeared.
pub fn dedup_by_id(vehicles: Vec<VehiclePosition>) -> Vec<VehiclePosition> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut unique: Vec<VehiclePosition> = Vec::with_capacity(vehicles.len());

    for vehicle in vehicles {
        match slots.get(&vehicle.id) {
            Some(&i) => unique[i] = vehicle,
            None => {
                slots.insert(vehicle.id.clone(), unique.len());
                unique.push(vehicle);
            }
        }
    }
    unique
}

/// Replaces each existing vehicle with its counterpart from `updates`.
/// Vehicles missing from `updates` are kept as they are and ids that are not
/// already present are dropped, so the collection never grows or shrinks.
/// Returns how many entries were replaced.
pub fn merge_by_id(existing: &mut [VehiclePosition], updates: Vec<VehiclePosition>) -> usize {
    let mut by_id: HashMap<String, VehiclePosition> =
        updates.into_iter().map(|v| (v.id.clone(), v)).collect();

    let mut replaced = 0;
    for slot in existing.iter_mut() {
        if let Some(update) = by_id.remove(&slot.id) {
            *slot = update;
            replaced += 1;
        }
    }
    replaced
}

// Data models for YourRoute (Delhi buses and metro feeders)
//
// Vehicle positions and bus stops are produced by an external Firestore
// database; this service only reads them. Records arrive with loosely typed
// fields (numbers stored as strings, timestamps as epoch millis or RFC 3339),
// so the deserializers below are deliberately lenient.

use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Asia::Kolkata;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleCategory {
    #[default]
    Bus,
    Metro,
}

impl VehicleCategory {
    pub fn label(&self) -> &'static str {
        match self {
            VehicleCategory::Bus => "bus",
            VehicleCategory::Metro => "metro",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    #[serde(deserialize_with = "de_string_or_number")]
    pub id: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub route: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub last_latitude: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub last_longitude: String,
    #[serde(default, deserialize_with = "de_optional_ping")]
    pub last_ping: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "de_optional_f64")]
    pub speed: Option<f64>,
    #[serde(default)]
    pub category: VehicleCategory,
}

impl VehiclePosition {
    pub fn latitude(&self) -> Option<f64> {
        self.last_latitude.trim().parse().ok()
    }

    pub fn longitude(&self) -> Option<f64> {
        self.last_longitude.trim().parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStop {
    #[serde(deserialize_with = "de_string_or_number")]
    pub stop_id: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub stop_name: String,
    #[serde(deserialize_with = "de_f64_lenient")]
    pub lat: f64,
    #[serde(deserialize_with = "de_f64_lenient")]
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
}

/// Next-arrival summary for a single stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopEta {
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub bus: String,
    #[serde(default, deserialize_with = "de_string_or_number")]
    pub time: String,
    #[serde(default, deserialize_with = "de_i64_lenient")]
    pub min: i64,
}

impl StopEta {
    pub fn summary(&self) -> String {
        format!(
            "Next bus is \"{}\" arriving at {} in {} min",
            self.bus, self.time, self.min
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        ChatMessage {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteStep {
    pub mode: String,
    pub duration: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutePlan {
    #[serde(deserialize_with = "de_u32_lenient")]
    pub id: u32,
    pub title: String,
    pub duration: String,
    pub distance: String,
    pub mode: String,
    pub steps: Vec<RouteStep>,
    pub cost: String,
    pub accessibility: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TripPreferences {
    pub preferred_mode: Option<String>,
    #[serde(deserialize_with = "de_optional_f64")]
    pub max_walk_distance: Option<f64>,
    pub accessibility: bool,
    pub avoid_stairs: bool,
}

// ============================================================================
// Lenient field decoding
// ============================================================================

fn de_string_or_number<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    })
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn de_f64_lenient<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let v = Value::deserialize(d)?;
    value_as_f64(&v).ok_or_else(|| serde::de::Error::custom(format!("expected a coordinate, got {}", v)))
}

fn de_optional_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(value_as_f64))
}

fn de_i64_lenient<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(value_as_f64(&v).map(|f| f.round() as i64).unwrap_or_default())
}

fn de_u32_lenient<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u32, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(value_as_f64(&v)
        .filter(|f| *f >= 0.0)
        .map(|f| f as u32)
        .unwrap_or_default())
}

fn de_optional_ping<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<DateTime<Utc>>, D::Error> {
    let v = Option::<Value>::deserialize(d)?;
    Ok(v.as_ref().and_then(parse_ping))
}

/// Accepts epoch milliseconds (number or numeric string) or an RFC 3339 string.
pub fn parse_ping(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                s.trim()
                    .parse::<i64>()
                    .ok()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            }),
        _ => None,
    }
}

// ============================================================================
// Stop Cache (7-day persistence)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopCache {
    pub stops: Vec<BusStop>,
    pub cached_at: i64,
    pub project_id: String,
}

impl StopCache {
    pub const MAX_AGE_DAYS: i64 = 7;

    pub fn new(stops: Vec<BusStop>, project_id: &str) -> Self {
        StopCache {
            stops,
            cached_at: current_timestamp(),
            project_id: project_id.to_string(),
        }
    }

    pub fn is_expired(&self, max_age_days: i64) -> bool {
        let age_days = current_timestamp().saturating_sub(self.cached_at) / 86400;
        age_days >= max_age_days
    }

    pub fn cache_path() -> PathBuf {
        let mut path = dirs::cache_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("yourroute");
        path.push("bus_stops_cache.json");
        path
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| YourRouteError::FileError(format!("Failed to create cache dir: {}", e)))?;
        }

        let json = serde_json::to_string(self)
            .map_err(|e| YourRouteError::FileError(format!("Failed to serialize stop cache: {}", e)))?;

        fs::write(path, json)
            .map_err(|e| YourRouteError::FileError(format!("Failed to write stop cache: {}", e)))?;

        log::info!("✓ Stop cache saved to: {:?} ({} stops)", path, self.stops.len());
        Ok(())
    }

    /// Returns `None` when the cache is missing, unreadable, expired or
    /// belongs to another project.
    pub fn load_from(path: &Path, project_id: &str, max_age_days: i64) -> Option<Self> {
        if !path.exists() {
            log::info!("ℹ️  No stop cache found, will fetch fresh stops");
            return None;
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                log::warn!("⚠️  Failed to read stop cache ({}), will refresh", e);
                return None;
            }
        };

        match serde_json::from_str::<StopCache>(&contents) {
            Ok(cache) if cache.project_id != project_id => {
                log::info!("ℹ️  Stop cache belongs to project '{}', ignoring", cache.project_id);
                None
            }
            Ok(cache) if cache.is_expired(max_age_days) => {
                log::warn!("⚠️  Stop cache expired (>{} days old), refreshing...", max_age_days);
                None
            }
            Ok(cache) => {
                log::info!("✓ Stop cache loaded ({} stops)", cache.stops.len());
                Some(cache)
            }
            Err(e) => {
                log::warn!("⚠️  Failed to parse stop cache ({}), will refresh", e);
                None
            }
        }
    }
}

// ============================================================================
// Live map cache
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LiveMapCache {
    pub buses: Vec<VehiclePosition>,
    pub metro_buses: Vec<VehiclePosition>,
    pub stops: Vec<BusStop>,
    pub stop_etas: HashMap<String, StopEta>,
    pub last_bus_update: Option<i64>,
    pub last_metro_update: Option<i64>,
    pub last_eta_update: Option<i64>,
    pub stops_loaded_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub buses: usize,
    pub metro_buses: usize,
    pub stops: usize,
    pub stops_with_eta: usize,
    pub last_bus_update: Option<String>,
    pub last_metro_update: Option<String>,
    pub last_eta_update: Option<String>,
    pub bus_data_age_secs: Option<i64>,
    pub metro_data_age_secs: Option<i64>,
}

impl LiveMapCache {
    pub fn vehicles_mut(&mut self, category: VehicleCategory) -> &mut Vec<VehiclePosition> {
        match category {
            VehicleCategory::Bus => &mut self.buses,
            VehicleCategory::Metro => &mut self.metro_buses,
        }
    }

    pub fn mark_updated(&mut self, category: VehicleCategory) {
        let now = current_timestamp();
        match category {
            VehicleCategory::Bus => self.last_bus_update = Some(now),
            VehicleCategory::Metro => self.last_metro_update = Some(now),
        }
    }

    /// Buses first, then metro feeders. Each id appears once; a bus keeps
    /// its id over a metro feeder reusing it.
    pub fn combined_vehicles(&self) -> Vec<VehiclePosition> {
        let mut seen: HashSet<&str> = HashSet::new();
        self.buses
            .iter()
            .chain(self.metro_buses.iter())
            .filter(|v| seen.insert(v.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn stops_with_eta(&self) -> Vec<BusStop> {
        self.stops
            .iter()
            .map(|stop| BusStop {
                eta: self.stop_etas.get(&stop.stop_id).map(StopEta::summary),
                ..stop.clone()
            })
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let now = current_timestamp();
        CacheStats {
            buses: self.buses.len(),
            metro_buses: self.metro_buses.len(),
            stops: self.stops.len(),
            stops_with_eta: self
                .stops
                .iter()
                .filter(|s| self.stop_etas.contains_key(&s.stop_id))
                .count(),
            last_bus_update: self.last_bus_update.map(format_timestamp_full),
            last_metro_update: self.last_metro_update.map(format_timestamp_full),
            last_eta_update: self.last_eta_update.map(format_timestamp_full),
            bus_data_age_secs: self.last_bus_update.map(|t| now.saturating_sub(t)),
            metro_data_age_secs: self.last_metro_update.map(|t| now.saturating_sub(t)),
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum YourRouteError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("File error: {0}")]
    FileError(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Upstream error: {0}")]
    UpstreamError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, YourRouteError>;

// ============================================================================
// Time helpers
// ============================================================================

pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

pub fn format_timestamp_full(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => dt
            .with_timezone(&Kolkata)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vehicle_accepts_string_coordinates_and_millis_ping() {
        let v: VehiclePosition = serde_json::from_value(json!({
            "id": 42,
            "route": "522",
            "lastLatitude": "28.6139",
            "lastLongitude": "77.2090",
            "lastPing": 1_700_000_000_000i64,
            "speed": "31.5"
        }))
        .unwrap();

        assert_eq!(v.id, "42");
        assert_eq!(v.latitude(), Some(28.6139));
        assert_eq!(v.longitude(), Some(77.2090));
        assert_eq!(v.last_ping.unwrap().timestamp(), 1_700_000_000);
        assert_eq!(v.speed, Some(31.5));
        assert_eq!(v.category, VehicleCategory::Bus);
    }

    #[test]
    fn vehicle_accepts_rfc3339_ping_and_missing_fields() {
        let v: VehiclePosition = serde_json::from_value(json!({
            "id": "DL1PC0001",
            "lastPing": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(v.route, "");
        assert_eq!(v.latitude(), None);
        assert_eq!(v.last_ping.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(v.speed.is_none());
    }

    #[test]
    fn stop_coordinates_may_be_strings() {
        let stop: BusStop = serde_json::from_value(json!({
            "stop_id": 1001,
            "stop_name": "Kashmere Gate ISBT",
            "lat": "28.6675",
            "lng": 77.2282
        }))
        .unwrap();

        assert_eq!(stop.stop_id, "1001");
        assert_eq!(stop.lat, 28.6675);
        assert!(stop.eta.is_none());

        let bad = serde_json::from_value::<BusStop>(json!({
            "stop_id": "x", "lat": "north", "lng": 77.0
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn eta_summary_matches_tooltip_text() {
        let eta = StopEta { bus: "522".into(), time: "12:00".into(), min: 5 };
        assert_eq!(eta.summary(), "Next bus is \"522\" arriving at 12:00 in 5 min");
    }

    #[test]
    fn stops_with_eta_attaches_summaries() {
        let mut cache = LiveMapCache::default();
        cache.stops = vec![
            BusStop { stop_id: "a".into(), stop_name: "A".into(), lat: 0.0, lng: 0.0, eta: None },
            BusStop { stop_id: "b".into(), stop_name: "B".into(), lat: 0.0, lng: 0.0, eta: None },
        ];
        cache.stop_etas.insert(
            "b".into(),
            StopEta { bus: "615".into(), time: "09:10".into(), min: 3 },
        );

        let stops = cache.stops_with_eta();
        assert!(stops[0].eta.is_none());
        assert!(stops[1].eta.as_deref().unwrap().contains("615"));
        assert_eq!(cache.stats().stops_with_eta, 1);
    }

    #[test]
    fn stop_cache_round_trips_through_disk() {
        let path = std::env::temp_dir()
            .join(format!("yourroute-test-{}", std::process::id()))
            .join("bus_stops_cache.json");
        let stops = vec![BusStop {
            stop_id: "7".into(),
            stop_name: "Rajiv Chowk".into(),
            lat: 28.6328,
            lng: 77.2197,
            eta: None,
        }];

        StopCache::new(stops.clone(), "yourroute-dev").save_to(&path).unwrap();

        let loaded = StopCache::load_from(&path, "yourroute-dev", StopCache::MAX_AGE_DAYS).unwrap();
        assert_eq!(loaded.stops, stops);
        assert!(StopCache::load_from(&path, "other-project", StopCache::MAX_AGE_DAYS).is_none());
        assert!(StopCache::load_from(&path, "yourroute-dev", 0).is_none());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn timestamps_render_in_india_time() {
        assert_eq!(format_timestamp_full(0), "1970-01-01 05:30:00");
    }
}

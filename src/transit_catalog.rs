// Static Delhi transit reference data
//
// Metro line station lists, a sample of DTC bus routes and the fare slabs
// used as context for the trip planner and served by /api/ai/transit-info.
// Nearby-stop and real-time answers on /api/ai are canned; live data is
// served from /api/map instead.

use crate::map_queries::Coordinate;
use crate::transit_models::{Result, YourRouteError};
use chrono::{SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

const YELLOW_LINE: &[&str] = &[
    "Samaypur Badli", "Rohini Sector 18-19", "Haiderpur Badli Mor", "Jahangirpuri", "Adarsh Nagar",
    "Azadpur", "Model Town", "GTB Nagar", "Vishwavidyalaya", "Vidhan Sabha", "Civil Lines",
    "Kashmere Gate", "Chandni Chowk", "Chawri Bazar", "New Delhi", "Rajiv Chowk", "Patel Chowk",
    "Central Secretariat", "Udyog Bhawan", "Lok Kalyan Marg", "Jor Bagh", "INA", "AIIMS",
    "Green Park", "Hauz Khas", "Malviya Nagar", "Saket", "Qutab Minar", "Chhatarpur", "Sultanpur",
    "Ghitorni", "Arjan Garh", "Guru Dronacharya", "Sikandarpur", "MG Road", "IFFCO Chowk",
    "Millennium City Centre Gurugram",
];

const BLUE_LINE: &[&str] = &[
    "Dwarka Sector 21", "Dwarka Sector 8", "Dwarka Sector 9", "Dwarka Sector 10", "Dwarka Sector 11",
    "Dwarka Sector 12", "Dwarka Sector 13", "Dwarka Sector 14", "Dwarka", "Dwarka Mor", "Nawada",
    "Uttam Nagar West", "Uttam Nagar East", "Janakpuri West", "Janakpuri East", "Tilak Nagar",
    "Subhash Nagar", "Tagore Garden", "Rajouri Garden", "Ramesh Nagar", "Moti Nagar", "Kirti Nagar",
    "Shadipur", "Patel Nagar", "Rajendra Place", "Karol Bagh", "Jhandewalan",
    "Ramakrishna Ashram Marg", "Rajiv Chowk", "Barakhamba Road", "Mandi House", "Pragati Maidan",
    "Indraprastha", "Yamuna Bank", "Akshardham", "Mayur Vihar Phase-1", "Mayur Vihar Extension",
    "New Ashok Nagar", "Noida Sector 15", "Noida Sector 16", "Noida Sector 18", "Botanical Garden",
    "Golf Course", "Noida City Centre", "Noida Sector 34", "Noida Sector 52", "Noida Sector 61",
    "Noida Sector 59", "Noida Sector 62", "Noida Electronic City",
];

const RED_LINE: &[&str] = &[
    "Shaheed Sthal (New Bus Adda)", "Hindon River", "Arthala", "Mohan Nagar", "Shyam Park",
    "Major Mohit Sharma", "Raj Bagh", "Shaheed Nagar", "Dilshad Garden", "Jhilmil",
    "Mansarovar Park", "Shahdara", "Welcome", "Seelampur", "Shastri Park", "Kashmere Gate",
    "Tis Hazari", "Pul Bangash", "Pratap Nagar", "Shastri Nagar", "Inderlok", "Kanhiya Nagar",
    "Keshav Puram", "Netaji Subhash Place", "Kohat Enclave", "Pitampura", "Rohini East",
    "Rohini West", "Rithala",
];

const GREEN_LINE: &[&str] = &[
    "Inderlok", "Ashok Park Main", "Punjabi Bagh", "Shivaji Park", "Madipur", "Paschim Vihar East",
    "Paschim Vihar West", "Peera Garhi", "Udyog Nagar", "Surajmal Stadium", "Nangloi",
    "Nangloi Railway Station", "Rajdhani Park", "Mundka", "Mundka Industrial Area", "Ghevra",
    "Tikri Kalan", "Tikri Border", "Pandit Shree Ram Sharma", "Bahadurgarh City",
    "Brigadier Hoshiyar Singh",
];

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MetroLine {
    pub name: String,
    pub stations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BusRoute {
    pub number: String,
    pub route: String,
    pub frequency: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FareBand {
    pub from_km: u32,
    /// `None` for the open-ended top slab.
    pub to_km: Option<u32>,
    pub fare: u32,
}

impl FareBand {
    pub fn label(&self) -> String {
        match self.to_km {
            Some(to) => format!("{}-{}", self.from_km, to),
            None => format!("{}+", self.from_km),
        }
    }
}

/// Serializes as `{"0-2": 10, "2-5": 20, ...}` in slab order.
#[derive(Debug, Clone, PartialEq)]
pub struct FareTable(pub Vec<FareBand>);

impl Serialize for FareTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for band in &self.0 {
            map.serialize_entry(&band.label(), &band.fare)?;
        }
        map.end()
    }
}

impl FareTable {
    /// Slab upper bounds are inclusive.
    pub fn fare_for(&self, distance_km: f64) -> Option<u32> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return None;
        }
        self.0
            .iter()
            .find(|band| band.to_km.is_none_or(|to| distance_km <= to as f64))
            .map(|band| band.fare)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FareStructure {
    pub metro: FareTable,
    pub bus: FareTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FareMode {
    Metro,
    Bus,
}

impl FareMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "metro" => Some(FareMode::Metro),
            "bus" => Some(FareMode::Bus),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FareQuote {
    pub mode: FareMode,
    pub distance_km: f64,
    pub fare: u32,
    pub currency: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitSummary {
    pub metro_lines: usize,
    pub bus_routes: usize,
    pub fare_structure: FareStructure,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TransitInfo {
    MetroLines(Vec<MetroLine>),
    BusRoutes(Vec<BusRoute>),
    Fares(FareStructure),
    Fare(FareQuote),
    Summary(TransitSummary),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransitInfoQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub query: Option<String>,
    /// Only read for `type=fare`; other types ignore it.
    pub mode: Option<String>,
    pub distance: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MockNearbyStop {
    pub id: u32,
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Metres.
    pub distance: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<&'static str>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<&'static str>>,
    pub coordinates: Coordinate,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceUpdate {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub line: &'static str,
    pub station: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severity: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealTimeStatus {
    pub timestamp: String,
    pub updates: Vec<ServiceUpdate>,
    pub general_status: &'static str,
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Clone)]
pub struct TransitCatalog {
    pub metro_lines: Vec<MetroLine>,
    pub bus_routes: Vec<BusRoute>,
    pub fares: FareStructure,
}

impl TransitCatalog {
    /// Routes mentioned in the planner prompt context.
    const CONTEXT_BUS_ROUTES: usize = 3;

    pub fn delhi() -> Self {
        let line = |name: &str, stations: &[&str]| MetroLine {
            name: name.to_string(),
            stations: stations.iter().map(|s| s.to_string()).collect(),
        };
        let route = |number: &str, route: &str, frequency: &str| BusRoute {
            number: number.to_string(),
            route: route.to_string(),
            frequency: frequency.to_string(),
        };
        let band = |from_km, to_km, fare| FareBand { from_km, to_km, fare };

        TransitCatalog {
            metro_lines: vec![
                line("Yellow Line", YELLOW_LINE),
                line("Blue Line", BLUE_LINE),
                line("Red Line", RED_LINE),
                line("Green Line", GREEN_LINE),
            ],
            bus_routes: vec![
                route("522", "Dwarka Sector 21 - Kashmere Gate", "5-8 min"),
                route("543", "Rohini Sector 18 - Connaught Place", "7-10 min"),
                route("615", "Pitampura - ITO", "6-9 min"),
                route("729", "Dwarka Sector 8 - Anand Vihar", "8-12 min"),
                route("891", "Rohini Sector 15 - Nehru Place", "10-15 min"),
            ],
            fares: FareStructure {
                metro: FareTable(vec![
                    band(0, Some(2), 10),
                    band(2, Some(5), 20),
                    band(5, Some(12), 30),
                    band(12, Some(21), 40),
                    band(21, Some(32), 50),
                    band(32, None, 60),
                ]),
                bus: FareTable(vec![band(0, Some(4), 10), band(4, Some(8), 15), band(8, None, 20)]),
            },
        }
    }

    /// Matches the route number, or the route description case-insensitively.
    pub fn search_bus_routes(&self, query: &str) -> Vec<BusRoute> {
        let lowered = query.to_lowercase();
        self.bus_routes
            .iter()
            .filter(|r| r.number.contains(query) || r.route.to_lowercase().contains(&lowered))
            .cloned()
            .collect()
    }

    pub fn quote_fare(&self, mode: FareMode, distance_km: f64) -> Result<FareQuote> {
        let table = match mode {
            FareMode::Metro => &self.fares.metro,
            FareMode::Bus => &self.fares.bus,
        };
        let fare = table.fare_for(distance_km).ok_or_else(|| {
            YourRouteError::ParseError(format!("Invalid distance: {}", distance_km))
        })?;

        Ok(FareQuote {
            mode,
            distance_km,
            fare,
            currency: "INR",
        })
    }

    pub fn transit_info(&self, query: &TransitInfoQuery) -> Result<TransitInfo> {
        let info = match query.kind.as_deref() {
            Some("metro-lines") => TransitInfo::MetroLines(self.metro_lines.clone()),
            Some("bus-routes") => match query.query.as_deref().filter(|q| !q.is_empty()) {
                Some(q) => TransitInfo::BusRoutes(self.search_bus_routes(q)),
                None => TransitInfo::BusRoutes(self.bus_routes.clone()),
            },
            Some("fares") => TransitInfo::Fares(self.fares.clone()),
            Some("fare") => {
                let mode = query.mode.as_deref().and_then(FareMode::parse).ok_or_else(|| {
                    YourRouteError::ParseError("mode must be 'metro' or 'bus'".to_string())
                })?;
                let distance = query
                    .distance
                    .as_deref()
                    .and_then(|d| d.trim().parse::<f64>().ok())
                    .ok_or_else(|| YourRouteError::ParseError("distance (km) is required".to_string()))?;
                TransitInfo::Fare(self.quote_fare(mode, distance)?)
            }
            _ => TransitInfo::Summary(TransitSummary {
                metro_lines: self.metro_lines.len(),
                bus_routes: self.bus_routes.len(),
                fare_structure: self.fares.clone(),
            }),
        };
        Ok(info)
    }

    /// Static network context appended to every planner prompt.
    pub fn chat_context(&self) -> String {
        let lines: Vec<&str> = self.metro_lines.iter().map(|l| l.name.as_str()).collect();
        let routes: Vec<&str> = self
            .bus_routes
            .iter()
            .take(Self::CONTEXT_BUS_ROUTES)
            .map(|r| r.number.as_str())
            .collect();

        format!(
            "Available metro lines: {}. Sample bus routes: {}. ",
            lines.join(", "),
            routes.join(", ")
        )
    }

    pub fn mock_nearby_stops(&self, lat: f64, lng: f64, radius_m: f64) -> Vec<MockNearbyStop> {
        vec![
            MockNearbyStop {
                id: 1,
                name: "Kashmere Gate Metro Station",
                kind: "metro",
                distance: 150,
                lines: Some(vec!["Red Line", "Yellow Line"]),
                routes: None,
                coordinates: Coordinate::new(lat + 0.001, lng + 0.001),
            },
            MockNearbyStop {
                id: 2,
                name: "Kashmere Gate Bus Stop",
                kind: "bus",
                distance: 200,
                lines: None,
                routes: Some(vec!["522", "543", "615"]),
                coordinates: Coordinate::new(lat + 0.002, lng - 0.001),
            },
            MockNearbyStop {
                id: 3,
                name: "Civil Lines Metro Station",
                kind: "metro",
                distance: 800,
                lines: Some(vec!["Yellow Line"]),
                routes: None,
                coordinates: Coordinate::new(lat - 0.001, lng + 0.002),
            },
        ]
        .into_iter()
        .filter(|stop| stop.distance as f64 <= radius_m)
        .collect()
    }

    pub fn mock_real_time(&self, line: Option<&str>, station: Option<&str>) -> RealTimeStatus {
        let passes = |value: &str, filter: Option<&str>| {
            filter
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .is_none_or(|f| value.to_lowercase().contains(&f.to_lowercase()))
        };

        let updates = vec![
            ServiceUpdate {
                kind: "delay",
                line: "Yellow Line",
                station: "Central Secretariat",
                message: "Minor delay due to technical issues",
                duration: Some("5-10 minutes"),
                severity: None,
            },
            ServiceUpdate {
                kind: "crowding",
                line: "Blue Line",
                station: "Rajiv Chowk",
                message: "High passenger density",
                duration: None,
                severity: Some("moderate"),
            },
        ]
        .into_iter()
        .filter(|u| passes(u.line, line) && passes(u.station, station))
        .collect();

        RealTimeStatus {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            updates,
            general_status: "All lines operating normally",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fare_slabs_serialize_in_order() {
        let catalog = TransitCatalog::delhi();
        let json = serde_json::to_string(&catalog.fares.bus).unwrap();
        assert_eq!(json, r#"{"0-4":10,"4-8":15,"8+":20}"#);
    }

    #[test]
    fn fare_lookup_uses_inclusive_upper_bounds() {
        let fares = TransitCatalog::delhi().fares;
        assert_eq!(fares.metro.fare_for(0.5), Some(10));
        assert_eq!(fares.metro.fare_for(2.0), Some(10));
        assert_eq!(fares.metro.fare_for(2.1), Some(20));
        assert_eq!(fares.metro.fare_for(40.0), Some(60));
        assert_eq!(fares.bus.fare_for(6.0), Some(15));
        assert_eq!(fares.bus.fare_for(-1.0), None);
        assert_eq!(fares.bus.fare_for(f64::NAN), None);
    }

    #[test]
    fn bus_route_search_matches_number_or_description() {
        let catalog = TransitCatalog::delhi();
        assert_eq!(catalog.search_bus_routes("52").len(), 1);
        let dwarka = catalog.search_bus_routes("DWARKA");
        assert_eq!(dwarka.iter().map(|r| r.number.as_str()).collect::<Vec<_>>(), vec!["522", "729"]);
        assert!(catalog.search_bus_routes("airport").is_empty());
    }

    #[test]
    fn transit_info_dispatches_on_type() {
        let catalog = TransitCatalog::delhi();

        let summary = serde_json::to_value(catalog.transit_info(&TransitInfoQuery::default()).unwrap()).unwrap();
        assert_eq!(summary["metroLines"], json!(4));
        assert_eq!(summary["busRoutes"], json!(5));
        assert_eq!(summary["fareStructure"]["metro"]["32+"], json!(60));

        let query = TransitInfoQuery { kind: Some("bus-routes".into()), query: Some("ito".into()), ..Default::default() };
        let routes = serde_json::to_value(catalog.transit_info(&query).unwrap()).unwrap();
        assert_eq!(routes, json!([{ "number": "615", "route": "Pitampura - ITO", "frequency": "6-9 min" }]));

        let query = TransitInfoQuery {
            kind: Some("fare".into()),
            mode: Some("Metro".into()),
            distance: Some("7.5".into()),
            ..Default::default()
        };
        let quote = serde_json::to_value(catalog.transit_info(&query).unwrap()).unwrap();
        assert_eq!(quote["fare"], json!(30));

        let missing = TransitInfoQuery { kind: Some("fare".into()), ..Default::default() };
        assert!(catalog.transit_info(&missing).is_err());

        let bad_distance = TransitInfoQuery {
            kind: Some("fare".into()),
            mode: Some("bus".into()),
            distance: Some("far".into()),
            ..Default::default()
        };
        assert!(catalog.transit_info(&bad_distance).is_err());
    }

    #[test]
    fn fare_params_are_ignored_for_other_types() {
        let catalog = TransitCatalog::delhi();
        let query = TransitInfoQuery {
            kind: Some("metro-lines".into()),
            mode: Some("ferry".into()),
            distance: Some("abc".into()),
            ..Default::default()
        };
        match catalog.transit_info(&query).unwrap() {
            TransitInfo::MetroLines(lines) => assert_eq!(lines.len(), 4),
            other => panic!("expected metro lines, got {:?}", other),
        }
    }

    #[test]
    fn chat_context_names_lines_and_first_routes() {
        assert_eq!(
            TransitCatalog::delhi().chat_context(),
            "Available metro lines: Yellow Line, Blue Line, Red Line, Green Line. Sample bus routes: 522, 543, 615. "
        );
    }

    #[test]
    fn mock_nearby_respects_radius() {
        let catalog = TransitCatalog::delhi();
        assert_eq!(catalog.mock_nearby_stops(28.66, 77.22, 1000.0).len(), 3);
        let close = catalog.mock_nearby_stops(28.66, 77.22, 180.0);
        assert_eq!(close.len(), 1);
        assert_eq!(close[0].name, "Kashmere Gate Metro Station");
    }

    #[test]
    fn real_time_filters_by_line_and_station() {
        let catalog = TransitCatalog::delhi();
        assert_eq!(catalog.mock_real_time(None, None).updates.len(), 2);
        assert_eq!(catalog.mock_real_time(Some("blue"), None).updates.len(), 1);
        assert!(catalog.mock_real_time(Some("yellow"), Some("rajiv")).updates.is_empty());
    }
}

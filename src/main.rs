// YourRoute transit server
// Live Delhi bus/metro map data from Firestore + trip planner chat proxy

use actix_cors::Cors;
use actix_web::error::{InternalError, JsonPayloadError, QueryPayloadError};
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, middleware, web};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

mod ai_planner;
mod chat_client;
mod firestore;
mod live_map;
mod map_queries;
mod transit_catalog;
mod transit_models;
mod ui_context;

use ai_planner::{ChatRequest, GeminiClient, GeminiConfig, TripPlanner};
use firestore::{FirestoreConfig, FirestoreStore, PingEncoding};
use live_map::{LiveMapRefresher, RefreshConfig, SharedCache, Visibility};
use map_queries::Coordinate;
use transit_catalog::{TransitCatalog, TransitInfoQuery};
use transit_models::{LiveMapCache, StopCache, TripPreferences, current_timestamp};
use ui_context::{MapSettings, UiContext};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
struct AppState {
    cache: SharedCache,
    ui: Arc<Mutex<UiContext>>,
    visibility: Arc<watch::Sender<Visibility>>,
    refresher: Arc<LiveMapRefresher>,
    planner: Arc<TripPlanner>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: current_timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: current_timestamp(),
        }
    }
}

fn lock_failed(what: &str, e: impl std::fmt::Display) -> HttpResponse {
    log::error!("❌ Failed to lock {}: {}", what, e);
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!("Failed to retrieve {}", what)))
}

fn bad_request(message: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ApiResponse::<()>::error(message.into()))
}

fn query_error_handler(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid query: {}", err));
    InternalError::from_response(err, response).into()
}

fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = bad_request(format!("Invalid JSON body: {}", err));
    InternalError::from_response(err, response).into()
}

// ============================================================================
// Live map endpoints
// ============================================================================

async fn get_vehicles(state: web::Data<AppState>) -> HttpResponse {
    let (selected, recent_only) = match state.ui.lock() {
        Ok(ui) => (
            ui.selected_routes.iter().cloned().collect::<HashSet<_>>(),
            ui.settings.recent_only,
        ),
        Err(e) => return lock_failed("UI context", e),
    };

    match state.cache.lock() {
        Ok(cache) => {
            let shown = map_queries::filter_displayed(
                &cache.combined_vehicles(),
                &selected,
                recent_only,
                chrono::Utc::now(),
            );
            log::debug!("🚌 Vehicles requested: {} shown of {}", shown.len(), cache.buses.len() + cache.metro_buses.len());
            HttpResponse::Ok().json(ApiResponse::success(shown))
        }
        Err(e) => lock_failed("vehicles", e),
    }
}

async fn get_stops(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => {
            let stops = cache.stops_with_eta();
            log::debug!("📍 Stops requested: {} total", stops.len());
            HttpResponse::Ok().json(ApiResponse::success(stops))
        }
        Err(e) => lock_failed("stops", e),
    }
}

#[derive(Deserialize)]
struct NearbyQuery {
    lat: f64,
    lng: f64,
}

async fn get_nearby_stops(state: web::Data<AppState>, query: web::Query<NearbyQuery>) -> HttpResponse {
    let point = Coordinate::new(query.lat, query.lng);

    match state.cache.lock() {
        Ok(cache) => {
            let nearby = map_queries::nearby_stops(
                &cache.stops_with_eta(),
                point,
                map_queries::NEARBY_RADIUS_KM,
                map_queries::NEARBY_MAX_RESULTS,
            );
            log::debug!("📍 Nearby stops for ({}, {}): {}", point.lat, point.lng, nearby.len());
            HttpResponse::Ok().json(ApiResponse::success(nearby))
        }
        Err(e) => lock_failed("stops", e),
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search_stops(state: web::Data<AppState>, query: web::Query<SearchQuery>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => HttpResponse::Ok().json(ApiResponse::success(map_queries::search_stops(
            &cache.stops_with_eta(),
            &query.q,
        ))),
        Err(e) => lock_failed("stops", e),
    }
}

#[derive(Deserialize)]
struct RouteSelection {
    routes: Vec<String>,
}

async fn get_routes(state: web::Data<AppState>) -> HttpResponse {
    match state.ui.lock() {
        Ok(ui) => HttpResponse::Ok().json(ApiResponse::success(&ui.selected_routes)),
        Err(e) => lock_failed("selected routes", e),
    }
}

async fn put_routes(state: web::Data<AppState>, body: web::Json<RouteSelection>) -> HttpResponse {
    match state.ui.lock() {
        Ok(mut ui) => {
            ui.set_routes(body.into_inner().routes);
            log::info!("🛣️  Selected routes: {:?}", ui.selected_routes);
            HttpResponse::Ok().json(ApiResponse::success(&ui.selected_routes))
        }
        Err(e) => lock_failed("selected routes", e),
    }
}

async fn toggle_route(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let route = path.into_inner();

    match state.ui.lock() {
        Ok(mut ui) => {
            let selected = ui.toggle_route(&route);
            HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
                "route": route.trim(),
                "selected": selected,
            })))
        }
        Err(e) => lock_failed("selected routes", e),
    }
}

async fn get_settings(state: web::Data<AppState>) -> HttpResponse {
    match state.ui.lock() {
        Ok(ui) => HttpResponse::Ok().json(ApiResponse::success(ui.settings)),
        Err(e) => lock_failed("settings", e),
    }
}

async fn put_settings(state: web::Data<AppState>, body: web::Json<MapSettings>) -> HttpResponse {
    match state.ui.lock() {
        Ok(mut ui) => {
            ui.settings = body.into_inner();
            HttpResponse::Ok().json(ApiResponse::success(ui.settings))
        }
        Err(e) => lock_failed("settings", e),
    }
}

#[derive(Deserialize)]
struct VisibilityChange {
    visible: bool,
}

async fn set_visibility(state: web::Data<AppState>, body: web::Json<VisibilityChange>) -> HttpResponse {
    let visibility = if body.visible {
        Visibility::Visible
    } else {
        Visibility::Hidden
    };

    // repeats of the current state are not forwarded to the refresh loop
    state.visibility.send_if_modified(|current| {
        let changed = *current != visibility;
        *current = visibility;
        changed
    });
    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "visible": body.visible })))
}

async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    log::info!("🔄 Manual refresh requested...");
    state.refresher.refresh_now().await;
    HttpResponse::Ok().json(ApiResponse::success("Data refreshed"))
}

async fn get_stats(state: web::Data<AppState>) -> HttpResponse {
    match state.cache.lock() {
        Ok(cache) => HttpResponse::Ok().json(ApiResponse::success(cache.stats())),
        Err(e) => lock_failed("stats", e),
    }
}

// ============================================================================
// UI context endpoints
// ============================================================================

async fn get_ui_context(state: web::Data<AppState>) -> HttpResponse {
    match state.ui.lock() {
        Ok(ui) => HttpResponse::Ok().json(ApiResponse::success(&*ui)),
        Err(e) => lock_failed("UI context", e),
    }
}

async fn planner_action(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let action = path.into_inner();

    match state.ui.lock() {
        Ok(mut ui) => {
            match action.as_str() {
                "open" => ui.open_planner(),
                "close" => ui.close_planner(),
                "maximize" => {
                    ui.toggle_maximize();
                }
                other => return bad_request(format!("Unknown planner action '{}'", other)),
            }
            HttpResponse::Ok().json(ApiResponse::success(ui.planner))
        }
        Err(e) => lock_failed("UI context", e),
    }
}

// ============================================================================
// AI endpoints
// ============================================================================

async fn ai_chat(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let request = match serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| transit_models::YourRouteError::ParseError(e.to_string()))
        .and_then(|value| ChatRequest::from_json(&value))
    {
        Ok(request) => request,
        Err(e) => {
            log::debug!("Rejected chat request: {}", e);
            return bad_request("Invalid message format");
        }
    };

    let reply = state.planner.respond(&request).await;
    HttpResponse::Ok().json(ApiResponse::success(reply))
}

async fn ai_transit_info(state: web::Data<AppState>, query: web::Query<TransitInfoQuery>) -> HttpResponse {
    match state.planner.catalog().transit_info(&query) {
        Ok(info) => HttpResponse::Ok().json(ApiResponse::success(info)),
        Err(e) => bad_request(e.to_string()),
    }
}

#[derive(Deserialize)]
struct AiNearbyQuery {
    lat: Option<String>,
    lng: Option<String>,
    radius: Option<String>,
}

async fn ai_nearby_stops(state: web::Data<AppState>, query: web::Query<AiNearbyQuery>) -> HttpResponse {
    let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.trim().parse::<f64>().ok()).filter(|f| f.is_finite());

    let (lat, lng) = match (parse(&query.lat), parse(&query.lng)) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => return bad_request("Latitude and longitude are required"),
    };
    let radius = parse(&query.radius).unwrap_or(1000.0);

    let stops = state.planner.catalog().mock_nearby_stops(lat, lng, radius);
    HttpResponse::Ok().json(ApiResponse::success(stops))
}

#[derive(Deserialize)]
struct RealTimeQuery {
    line: Option<String>,
    station: Option<String>,
}

async fn ai_real_time(state: web::Data<AppState>, query: web::Query<RealTimeQuery>) -> HttpResponse {
    let status = state
        .planner
        .catalog()
        .mock_real_time(query.line.as_deref(), query.station.as_deref());
    HttpResponse::Ok().json(ApiResponse::success(status))
}

async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "YourRoute Transit API",
        "version": VERSION,
        "sources": ["Firestore", "Gemini"],
        "timestamp": current_timestamp(),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::QueryConfig::default().error_handler(query_error_handler))
        .app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .route("/health", web::get().to(health_check))
        .service(
            web::scope("/api/map")
                .route("/vehicles", web::get().to(get_vehicles))
                .route("/stops", web::get().to(get_stops))
                .route("/stops/nearby", web::get().to(get_nearby_stops))
                .route("/stops/search", web::get().to(search_stops))
                .route("/routes", web::get().to(get_routes))
                .route("/routes", web::put().to(put_routes))
                .route("/routes/{id}/toggle", web::post().to(toggle_route))
                .route("/settings", web::get().to(get_settings))
                .route("/settings", web::put().to(put_settings))
                .route("/visibility", web::post().to(set_visibility))
                .route("/refresh", web::post().to(force_refresh))
                .route("/stats", web::get().to(get_stats)),
        )
        .service(
            web::scope("/api/ui")
                .route("/context", web::get().to(get_ui_context))
                .route("/planner/{action}", web::post().to(planner_action)),
        )
        .service(
            web::scope("/api/ai")
                .route("/chat", web::post().to(ai_chat))
                .route("/transit-info", web::get().to(ai_transit_info))
                .route("/nearby-stops", web::get().to(ai_nearby_stops))
                .route("/real-time", web::get().to(ai_real_time)),
        );
}

async fn run_server(app_state: AppState, bind: &str, port: u16) -> std::io::Result<()> {
    log::info!("🌐 Server running on: http://{}:{}", bind, port);
    log::info!("📍 Available Routes:");
    log::info!("   GET  /api/map/vehicles            - Displayed vehicles");
    log::info!("   GET  /api/map/stops               - All stops with ETAs");
    log::info!("   GET  /api/map/stops/nearby        - Stops within 1 km");
    log::info!("   GET  /api/map/stops/search        - Search stops by name/id");
    log::info!("   GET|PUT /api/map/routes           - Selected routes");
    log::info!("   GET|PUT /api/map/settings         - Map settings");
    log::info!("   POST /api/map/visibility          - Pause/resume polling");
    log::info!("   POST /api/map/refresh             - Force refresh");
    log::info!("   GET  /api/map/stats               - Cache statistics");
    log::info!("   GET  /api/ui/context              - UI context");
    log::info!("   POST /api/ai/chat                 - Trip planner chat");
    log::info!("   GET  /api/ai/transit-info         - Lines, routes, fares");
    log::info!("   GET  /health                      - Health check");

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(Cors::permissive())
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure_routes)
    })
    .bind((bind, port))?
    .run()
    .await
}

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "yourroute", version, about = "YourRoute live transit server and trip planner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API with live vehicle polling
    Serve(ServeArgs),
    /// Chat with the trip planner of a running server
    Chat(ChatArgs),
    /// Upload a JSON array of bus stops to Firestore
    UploadStops(UploadArgs),
}

#[derive(Args)]
struct FirestoreArgs {
    #[arg(long, env = "FIRESTORE_PROJECT_ID", default_value = "")]
    project_id: String,
    #[arg(long, env = "FIRESTORE_API_KEY")]
    firestore_api_key: Option<String>,
    #[arg(long, env = "FIRESTORE_BEARER_TOKEN")]
    firestore_token: Option<String>,
    #[arg(long, env = "FIRESTORE_BASE_URL", default_value = "https://firestore.googleapis.com/v1")]
    firestore_url: String,
    #[arg(long, env = "BUS_COLLECTION", default_value = "buses")]
    bus_collection: String,
    #[arg(long, env = "METRO_COLLECTION", default_value = "metroBuses")]
    metro_collection: String,
    #[arg(long, env = "STOPS_COLLECTION", default_value = "bus_stops")]
    stops_collection: String,
    #[arg(long, env = "ETAS_COLLECTION", default_value = "bus_etas")]
    etas_collection: String,
    #[arg(long, env = "PING_ENCODING", value_enum, default_value_t = PingEncoding::Millis)]
    ping_encoding: PingEncoding,
}

impl FirestoreArgs {
    fn to_config(&self) -> FirestoreConfig {
        FirestoreConfig {
            base_url: self.firestore_url.clone(),
            project_id: self.project_id.clone(),
            api_key: self.firestore_api_key.clone(),
            bearer_token: self.firestore_token.clone(),
            bus_collection: self.bus_collection.clone(),
            metro_collection: self.metro_collection.clone(),
            stops_collection: self.stops_collection.clone(),
            etas_collection: self.etas_collection.clone(),
            ping_encoding: self.ping_encoding,
        }
    }
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    bind: String,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, env = "GEMINI_API_KEY")]
    gemini_api_key: Option<String>,
    #[arg(long, env = "GEMINI_API_URL", default_value = ai_planner::DEFAULT_GEMINI_URL)]
    gemini_api_url: String,
    /// Seconds between bus position polls
    #[arg(long, env = "BUS_POLL_SECS", default_value_t = 5)]
    bus_poll_secs: u64,
    /// Seconds between metro feeder position polls
    #[arg(long, env = "METRO_POLL_SECS", default_value_t = 12)]
    metro_poll_secs: u64,
    /// A vehicle counts as updated if it pinged within this many seconds
    #[arg(long, env = "UPDATE_LOOKBACK_SECS", default_value_t = 60)]
    update_lookback_secs: i64,
    /// Routes shown on the map at startup, comma separated
    #[arg(long, env = "SELECTED_ROUTES", value_delimiter = ',')]
    routes: Vec<String>,
    /// Always fetch stops from Firestore instead of the disk cache
    #[arg(long)]
    no_stop_cache: bool,
    #[command(flatten)]
    firestore: FirestoreArgs,
}

#[derive(Args)]
struct ChatArgs {
    #[arg(long, env = "YOURROUTE_SERVER", default_value = "http://localhost:8080")]
    server: String,
    #[arg(long, default_value = "any")]
    preferred_mode: String,
    #[arg(long)]
    max_walk_distance: Option<f64>,
    #[arg(long)]
    accessibility: bool,
    #[arg(long)]
    avoid_stairs: bool,
}

#[derive(Args)]
struct UploadArgs {
    /// JSON file holding an array of stop objects with a `stop_id`
    file: PathBuf,
    #[command(flatten)]
    firestore: FirestoreArgs,
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    log::info!("🚀 YourRoute Transit Server v{}", VERSION);

    let store = Arc::new(FirestoreStore::new(args.firestore.to_config())?);
    let refresh_config = RefreshConfig {
        bus_period: Duration::from_secs(args.bus_poll_secs.max(1)),
        metro_period: Duration::from_secs(args.metro_poll_secs.max(1)),
        update_lookback: chrono::Duration::seconds(args.update_lookback_secs.max(1)),
        stop_cache_path: (!args.no_stop_cache).then(StopCache::cache_path),
        project_id: args.firestore.project_id.clone(),
    };

    let refresher = Arc::new(LiveMapRefresher::new(
        store,
        Arc::new(Mutex::new(LiveMapCache::default())),
        refresh_config,
    ));
    let cache = refresher.cache();

    log::info!("📡 Initializing live map cache...");
    refresher.load_stops().await;
    refresher.load_initial().await;
    if let Ok(cache) = cache.lock() {
        log::info!(
            "✅ Cache initialized: {} buses, {} metro feeders, {} stops",
            cache.buses.len(),
            cache.metro_buses.len(),
            cache.stops.len()
        );
    }

    let (visibility_tx, visibility_rx) = watch::channel(Visibility::Visible);
    let runner = refresher.clone();
    tokio::spawn(async move {
        runner.run(visibility_rx).await;
    });

    let gemini = GeminiClient::new(GeminiConfig {
        api_key: args.gemini_api_key.clone(),
        api_url: args.gemini_api_url.clone(),
        ..GeminiConfig::default()
    })?;
    if !gemini.is_configured() {
        log::warn!("⚠️  GEMINI_API_KEY not set, chat will answer with fallback replies");
    }

    let app_state = AppState {
        cache,
        ui: Arc::new(Mutex::new(UiContext::with_routes(args.routes))),
        visibility: Arc::new(visibility_tx),
        refresher,
        planner: Arc::new(TripPlanner::new(Arc::new(gemini), TransitCatalog::delhi())),
    };

    run_server(app_state, &args.bind, args.port)
        .await
        .context("HTTP server failed")
}

async fn upload_stops(args: UploadArgs) -> anyhow::Result<()> {
    let contents = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {:?}", args.file))?;
    let stops: Vec<serde_json::Value> =
        serde_json::from_str(&contents).with_context(|| format!("{:?} is not a JSON array", args.file))?;

    let store = FirestoreStore::new(args.firestore.to_config())?;
    log::info!(
        "📥 Uploading {} stops from {:?} to '{}'",
        stops.len(),
        args.file,
        store.config().stops_collection
    );
    store.upload_stops(&stops).await?;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Chat(args) => {
            let preferences = TripPreferences {
                preferred_mode: Some(args.preferred_mode),
                max_walk_distance: args.max_walk_distance,
                accessibility: args.accessibility,
                avoid_stairs: args.avoid_stairs,
            };
            chat_client::run_chat(&args.server, preferences).await?;
            Ok(())
        }
        Command::UploadStops(args) => upload_stops(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::testing::MemoryStore;
    use crate::transit_models::{BusStop, VehicleCategory, VehiclePosition};
    use actix_web::{http::StatusCode, test};
    use serde_json::{Value, json};

    fn vehicle(id: &str, route: &str, category: VehicleCategory) -> VehiclePosition {
        VehiclePosition {
            id: id.to_string(),
            route: route.to_string(),
            last_latitude: "28.6139".to_string(),
            last_longitude: "77.2090".to_string(),
            last_ping: Some(chrono::Utc::now()),
            speed: Some(22.0),
            category,
        }
    }

    fn stop(id: &str, name: &str, lat: f64, lng: f64) -> BusStop {
        BusStop { stop_id: id.to_string(), stop_name: name.to_string(), lat, lng, eta: None }
    }

    fn test_state() -> (AppState, watch::Receiver<Visibility>) {
        let mut cache = LiveMapCache::default();
        cache.buses = vec![vehicle("b1", "522", VehicleCategory::Bus), vehicle("b2", "543", VehicleCategory::Bus)];
        cache.metro_buses = vec![vehicle("m1", "MS-1", VehicleCategory::Metro)];
        cache.stops = vec![
            stop("101", "Connaught Place", 28.6315, 77.2167),
            stop("102", "Janpath", 28.6250, 77.2190),
            stop("201", "Pitampura", 28.7041, 77.1025),
        ];
        let cache = Arc::new(Mutex::new(cache));

        let refresher = Arc::new(LiveMapRefresher::new(
            Arc::new(MemoryStore::default()),
            cache.clone(),
            RefreshConfig::default(),
        ));
        let gemini = GeminiClient::new(GeminiConfig::default()).unwrap();
        let (tx, rx) = watch::channel(Visibility::Visible);

        let state = AppState {
            cache,
            ui: Arc::new(Mutex::new(UiContext::with_routes(["522"]))),
            visibility: Arc::new(tx),
            refresher,
            planner: Arc::new(TripPlanner::new(Arc::new(gemini), TransitCatalog::delhi())),
        };
        (state, rx)
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::new($state.clone()))
                    .configure(configure_routes),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn chat_rejects_missing_message() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/ai/chat")
            .set_json(json!({ "preferences": {} }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], json!("Invalid message format"));

        let req = test::TestRequest::post()
            .uri("/api/ai/chat")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn chat_without_model_returns_marked_fallback() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/ai/chat")
            .set_json(json!({ "message": "Which bus goes to ITO?", "preferences": { "preferredMode": "bus" } }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["source"], json!("fallback"));
        assert_eq!(body["data"]["routes"][0]["mode"], json!("Bus"));
    }

    #[actix_web::test]
    async fn transit_info_routes_and_fares() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/ai/transit-info").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["metroLines"], json!(4));

        let req = test::TestRequest::get()
            .uri("/api/ai/transit-info?type=bus-routes&query=rohini")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let req = test::TestRequest::get()
            .uri("/api/ai/transit-info?type=fare&mode=bus&distance=5")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["fare"], json!(15));

        let req = test::TestRequest::get()
            .uri("/api/ai/transit-info?type=fare&mode=ferry&distance=5")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/ai/transit-info?type=metro-lines&mode=x&distance=abc")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 4);
    }

    #[actix_web::test]
    async fn ai_nearby_requires_coordinates() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/ai/nearby-stops?lat=28.6").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get()
            .uri("/api/ai/nearby-stops?lat=28.6&lng=77.2&radius=500")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn vehicles_follow_route_selection() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/map/vehicles").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let ids: Vec<&str> = body["data"].as_array().unwrap().iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b1"]);

        let req = test::TestRequest::put()
            .uri("/api/map/routes")
            .set_json(json!({ "routes": ["543", "MS-1"] }))
            .to_request();
        test::call_service(&app, req).await;

        let req = test::TestRequest::get().uri("/api/map/vehicles").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let ids: Vec<&str> = body["data"].as_array().unwrap().iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b2", "m1"]);

        let req = test::TestRequest::post().uri("/api/map/routes/543/toggle").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["selected"], json!(false));
    }

    #[actix_web::test]
    async fn nearby_and_search_over_loaded_stops() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::get()
            .uri("/api/map/stops/nearby?lat=28.6300&lng=77.2180")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let found = body["data"].as_array().unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|s| s["distance_km"].as_f64().unwrap() <= 1.0));

        let req = test::TestRequest::get().uri("/api/map/stops/nearby?lat=north").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::get().uri("/api/map/stops/search?q=ja").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"], json!({ "visible": false, "results": [] }));

        let req = test::TestRequest::get().uri("/api/map/stops/search?q=JANP").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["results"][0]["stop_id"], json!("102"));
    }

    #[actix_web::test]
    async fn visibility_endpoint_drives_the_refresh_channel() {
        let (state, mut rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/map/visibility")
            .set_json(json!({ "visible": false }))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        assert_eq!(*rx.borrow_and_update(), Visibility::Hidden);

        let req = test::TestRequest::post()
            .uri("/api/map/visibility")
            .set_json(json!({ "visible": false }))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
        assert!(!rx.has_changed().unwrap(), "a repeated state is not a transition");
    }

    #[actix_web::test]
    async fn vehicles_are_unique_by_id() {
        let (mut state, _rx) = test_state();

        let store = Arc::new(MemoryStore::default());
        *store.buses.lock().unwrap() = vec![
            vehicle("x", "522", VehicleCategory::Bus),
            vehicle("x", "522", VehicleCategory::Bus),
            vehicle("y", "522", VehicleCategory::Bus),
        ];
        *store.metro.lock().unwrap() = vec![vehicle("x", "522", VehicleCategory::Metro)];
        let refresher = Arc::new(LiveMapRefresher::new(
            store,
            Arc::new(Mutex::new(LiveMapCache::default())),
            RefreshConfig::default(),
        ));
        refresher.load_initial().await;
        state.cache = refresher.cache();
        state.refresher = refresher;
        let app = app!(state);

        let req = test::TestRequest::get().uri("/api/map/vehicles").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        let shown = body["data"].as_array().unwrap();
        let ids: Vec<&str> = shown.iter().map(|v| v["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["x", "y"]);
        assert_eq!(shown[0]["category"], json!("bus"));
    }

    #[actix_web::test]
    async fn planner_panel_actions() {
        let (state, _rx) = test_state();
        let app = app!(state);

        for action in ["open", "maximize"] {
            let req = test::TestRequest::post().uri(&format!("/api/ui/planner/{}", action)).to_request();
            test::call_service(&app, req).await;
        }
        let req = test::TestRequest::get().uri("/api/ui/context").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["planner"], json!({ "open": true, "maximized": true }));
        assert_eq!(body["data"]["selected_routes"], json!(["522"]));

        let req = test::TestRequest::post().uri("/api/ui/planner/close").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"], json!({ "open": false, "maximized": false }));

        let req = test::TestRequest::post().uri("/api/ui/planner/dance").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn health_reports_version() {
        let (state, _rx) = test_state();
        let app = app!(state);

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], json!("healthy"));
        assert_eq!(body["version"], json!(VERSION));
    }
}

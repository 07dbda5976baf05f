// Live map refresh loop
//
// Keeps the vehicle markers fresh without burning through the store's read
// quota: one full snapshot at start, then per-category polling of recently
// changed vehicles only. Polling stops entirely while no one is looking at
// the map and resumes with an immediate catch-up refresh.

use crate::firestore::TransitStore;
use crate::map_queries;
use crate::transit_models::{LiveMapCache, StopCache, VehicleCategory, current_timestamp};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

pub type SharedCache = Arc<Mutex<LiveMapCache>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub bus_period: Duration,
    pub metro_period: Duration,
    /// How far back a `lastPing` may be and still count as "recently changed".
    pub update_lookback: chrono::Duration,
    pub stop_cache_path: Option<PathBuf>,
    pub project_id: String,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            bus_period: Duration::from_secs(5),
            metro_period: Duration::from_secs(12),
            update_lookback: chrono::Duration::seconds(60),
            stop_cache_path: None,
            project_id: String::new(),
        }
    }
}

struct PollTimers {
    bus: Interval,
    metro: Interval,
}

impl PollTimers {
    /// First tick lands one full period from now.
    fn start(config: &RefreshConfig) -> Self {
        let now = Instant::now();
        let mut bus = time::interval_at(now + config.bus_period, config.bus_period);
        let mut metro = time::interval_at(now + config.metro_period, config.metro_period);
        bus.set_missed_tick_behavior(MissedTickBehavior::Delay);
        metro.set_missed_tick_behavior(MissedTickBehavior::Delay);
        PollTimers { bus, metro }
    }
}

enum LoopEvent {
    Tick(VehicleCategory),
    VisibilityChanged,
    Shutdown,
}

pub struct LiveMapRefresher {
    store: Arc<dyn TransitStore>,
    cache: SharedCache,
    config: RefreshConfig,
}

impl LiveMapRefresher {
    pub fn new(store: Arc<dyn TransitStore>, cache: SharedCache, config: RefreshConfig) -> Self {
        LiveMapRefresher { store, cache, config }
    }

    pub fn cache(&self) -> SharedCache {
        self.cache.clone()
    }

    fn with_cache<R>(&self, f: impl FnOnce(&mut LiveMapCache) -> R) -> Option<R> {
        match self.cache.lock() {
            Ok(mut cache) => Some(f(&mut cache)),
            Err(e) => {
                log::error!("❌ Failed to lock live map cache: {}", e);
                None
            }
        }
    }

    /// Full snapshot of both categories plus stop ETAs.
    pub async fn load_initial(&self) {
        log::info!("📡 Loading full vehicle snapshot...");
        futures::join!(
            self.load_full(VehicleCategory::Bus),
            self.load_full(VehicleCategory::Metro),
            self.refresh_etas(),
        );
    }

    pub async fn load_full(&self, category: VehicleCategory) {
        match self.store.fetch_all_vehicles(category).await {
            Ok(vehicles) => {
                let received = vehicles.len();
                let vehicles = map_queries::dedup_by_id(vehicles);
                if vehicles.len() < received {
                    log::warn!(
                        "⚠️  {} snapshot repeated ids, kept {} of {} records",
                        category.label(),
                        vehicles.len(),
                        received
                    );
                }
                log::info!("   ✓ Loaded {} {} vehicles", vehicles.len(), category.label());
                self.with_cache(|cache| {
                    *cache.vehicles_mut(category) = vehicles;
                    cache.mark_updated(category);
                });
            }
            Err(e) => log::warn!("⚠️  Could not load {} vehicles ({})", category.label(), e),
        }
    }

    /// Merges recently changed vehicles into the current snapshot. A failed
    /// fetch leaves the snapshot untouched.
    pub async fn refresh_updated(&self, category: VehicleCategory) {
        let since = Utc::now() - self.config.update_lookback;

        match self.store.fetch_updated_vehicles(category, since).await {
            Ok(updates) => {
                let received = updates.len();
                let replaced = self
                    .with_cache(|cache| {
                        let replaced = map_queries::merge_by_id(cache.vehicles_mut(category), updates);
                        cache.mark_updated(category);
                        replaced
                    })
                    .unwrap_or_default();
                log::debug!(
                    "🔄 {} refresh: {} updates received, {} markers moved",
                    category.label(),
                    received,
                    replaced
                );
            }
            Err(e) => log::warn!("⚠️  {} refresh failed, keeping last snapshot ({})", category.label(), e),
        }
    }

    pub async fn refresh_etas(&self) {
        match self.store.fetch_stop_etas().await {
            Ok(etas) => {
                self.with_cache(|cache| {
                    cache.stop_etas = etas;
                    cache.last_eta_update = Some(current_timestamp());
                });
            }
            Err(e) => log::warn!("⚠️  Could not refresh stop ETAs ({})", e),
        }
    }

    /// Both categories and ETAs, concurrently.
    pub async fn refresh_now(&self) {
        futures::join!(
            self.refresh_updated(VehicleCategory::Bus),
            self.refresh_updated(VehicleCategory::Metro),
            self.refresh_etas(),
        );
    }

    /// Stops are reference data: read once per session, with a disk cache in
    /// front of the store when a cache path is configured.
    pub async fn load_stops(&self) {
        if let Some(path) = &self.config.stop_cache_path {
            if let Some(cached) = StopCache::load_from(path, &self.config.project_id, StopCache::MAX_AGE_DAYS) {
                self.with_cache(|cache| {
                    cache.stops = cached.stops;
                    cache.stops_loaded_at = Some(cached.cached_at);
                });
                return;
            }
        }

        match self.store.fetch_bus_stops().await {
            Ok(stops) => {
                log::info!("   ✓ Loaded {} bus stops", stops.len());
                if let Some(path) = &self.config.stop_cache_path {
                    if let Err(e) = StopCache::new(stops.clone(), &self.config.project_id).save_to(path) {
                        log::warn!("⚠️  Could not save stop cache ({})", e);
                    }
                }
                self.with_cache(|cache| {
                    cache.stops = stops;
                    cache.stops_loaded_at = Some(current_timestamp());
                });
            }
            Err(e) => log::warn!("⚠️  Could not load bus stops ({})", e),
        }
    }

    async fn on_visibility(&self, visibility: Visibility) -> Option<PollTimers> {
        match visibility {
            Visibility::Visible => {
                log::info!("👀 Map visible, catching up and resuming polling");
                self.refresh_now().await;
                Some(PollTimers::start(&self.config))
            }
            Visibility::Hidden => {
                log::info!("💤 Map hidden, polling paused");
                None
            }
        }
    }

    /// Polls until the visibility sender is dropped.
    pub async fn run(&self, mut visibility: watch::Receiver<Visibility>) {
        let mut current = *visibility.borrow_and_update();
        let mut timers = match current {
            Visibility::Visible => Some(PollTimers::start(&self.config)),
            Visibility::Hidden => None,
        };

        log::info!(
            "🔄 Polling every {}s (bus) / {}s (metro)",
            self.config.bus_period.as_secs_f32(),
            self.config.metro_period.as_secs_f32()
        );

        loop {
            let event = match timers.as_mut() {
                Some(t) => tokio::select! {
                    _ = t.bus.tick() => LoopEvent::Tick(VehicleCategory::Bus),
                    _ = t.metro.tick() => LoopEvent::Tick(VehicleCategory::Metro),
                    changed = visibility.changed() => match changed {
                        Ok(()) => LoopEvent::VisibilityChanged,
                        Err(_) => LoopEvent::Shutdown,
                    },
                },
                None => match visibility.changed().await {
                    Ok(()) => LoopEvent::VisibilityChanged,
                    Err(_) => LoopEvent::Shutdown,
                },
            };

            match event {
                LoopEvent::Tick(category) => self.refresh_updated(category).await,
                LoopEvent::VisibilityChanged => {
                    // only a real hidden/visible flip pauses or catches up
                    let next = *visibility.borrow_and_update();
                    if next != current {
                        current = next;
                        timers = self.on_visibility(next).await;
                    }
                }
                LoopEvent::Shutdown => break,
            }
        }

        log::info!("🛑 Refresh loop stopped");
    }
}

// The snapshot store. Holds one static snapshot and one realtime snapshot
// behind independent guards and keeps both fresh from background tasks.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Result, WhereError};
use crate::gtfs_static::load_static_snapshot;
use crate::models::{RealtimeSnapshot, ServiceAlert, StaticSnapshot, TripUpdate, Vehicle};
use crate::realtime::{self, FeedFetcher, HttpFetcher};

/// What happened to one realtime feed during a refresh cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedOutcome {
    #[default]
    NotConfigured,
    Updated(usize),
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RealtimeCycle {
    /// The cycle as a whole ran out of time; nothing was committed.
    pub deadline_exceeded: bool,
    pub trip_updates: FeedOutcome,
    pub vehicles: FeedOutcome,
    pub alerts: FeedOutcome,
}

pub struct Manager {
    config: Config,
    static_data: RwLock<Arc<StaticSnapshot>>,
    realtime_data: RwLock<RealtimeSnapshot>,
    fetcher: Arc<dyn FeedFetcher>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

// Writers only ever store whole values, so a poisoned guard still holds a
// consistent snapshot.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Run one fetch under its own deadline. `None` when the feed is not configured.
async fn bounded<T>(
    deadline: Duration,
    fetch: Option<impl Future<Output = Result<T>>>,
) -> Option<Result<T>> {
    let fetch = fetch?;
    Some(match time::timeout(deadline, fetch).await {
        Ok(result) => result,
        Err(_) => Err(WhereError::Timeout(deadline)),
    })
}

/// Log a failed feed and keep its previous data.
fn settle<T>(feed: &'static str, result: Option<Result<Vec<T>>>) -> (FeedOutcome, Option<Vec<T>>) {
    match result {
        None => (FeedOutcome::NotConfigured, None),
        Some(Ok(list)) => (FeedOutcome::Updated(list.len()), Some(list)),
        Some(Err(e)) if e.is_timeout() => {
            info!(feed, error = %e, "realtime fetch timed out, keeping previous data");
            (FeedOutcome::Failed, None)
        }
        Some(Err(e)) => {
            warn!(feed, error = %e, "realtime fetch failed, keeping previous data");
            (FeedOutcome::Failed, None)
        }
    }
}

impl Manager {
    /// Build a store around an already loaded static snapshot. No background
    /// work is started; see [`Manager::start`].
    pub fn new(config: Config, static_snapshot: Arc<StaticSnapshot>, fetcher: Arc<dyn FeedFetcher>) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            static_data: RwLock::new(static_snapshot),
            realtime_data: RwLock::new(RealtimeSnapshot::default()),
            fetcher,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub async fn initialize(config: Config) -> Result<Arc<Self>> {
        let fetcher = Arc::new(HttpFetcher::new(&config.realtime, config.realtime_fetch_timeout)?);
        Self::initialize_with_fetcher(config, fetcher).await
    }

    /// Load the static feed (fatal on failure), take one bounded realtime
    /// snapshot if realtime feeds are configured, then start refreshing.
    pub async fn initialize_with_fetcher(config: Config, fetcher: Arc<dyn FeedFetcher>) -> Result<Arc<Self>> {
        config.validate()?;

        info!(source = ?config.static_source, "loading static GTFS feed");
        let snapshot = load_static_snapshot(&config.static_source, config.static_download_timeout).await?;
        let manager = Self::new(config, Arc::new(snapshot), fetcher);

        if manager.config.realtime.is_enabled() {
            let cycle = manager
                .refresh_realtime(manager.config.initial_realtime_timeout)
                .await;
            info!(?cycle, "initial realtime load finished");
        }

        manager.start().await;
        Ok(manager)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ------------------------------------------------------------------
    // Read accessors. Guards are held only long enough to clone an Arc.
    // ------------------------------------------------------------------

    pub fn static_snapshot(&self) -> Arc<StaticSnapshot> {
        read(&self.static_data).clone()
    }

    pub fn realtime_snapshot(&self) -> RealtimeSnapshot {
        read(&self.realtime_data).clone()
    }

    pub fn realtime_vehicles(&self) -> Arc<Vec<Vehicle>> {
        read(&self.realtime_data).vehicles.clone()
    }

    pub fn realtime_trips(&self) -> Arc<Vec<TripUpdate>> {
        read(&self.realtime_data).trip_updates.clone()
    }

    pub fn realtime_alerts(&self) -> Arc<Vec<ServiceAlert>> {
        read(&self.realtime_data).alerts.clone()
    }

    // ------------------------------------------------------------------
    // Writers. Every mutation is a whole-value replacement.
    // ------------------------------------------------------------------

    pub fn replace_static_snapshot(&self, snapshot: Arc<StaticSnapshot>) {
        *write(&self.static_data) = snapshot;
    }

    /// Publish whichever realtime lists are given under one acquisition;
    /// `None` keeps the current list.
    pub fn publish_realtime(
        &self,
        vehicles: Option<Vec<Vehicle>>,
        trip_updates: Option<Vec<TripUpdate>>,
        alerts: Option<Vec<ServiceAlert>>,
    ) {
        let vehicles = vehicles.map(Arc::new);
        let trip_updates = trip_updates.map(Arc::new);
        let alerts = alerts.map(Arc::new);

        let mut guard = write(&self.realtime_data);
        if let Some(vehicles) = vehicles {
            guard.vehicles = vehicles;
        }
        if let Some(trip_updates) = trip_updates {
            guard.trip_updates = trip_updates;
        }
        if let Some(alerts) = alerts {
            guard.alerts = alerts;
        }
    }

    // ------------------------------------------------------------------
    // Refresh cycles
    // ------------------------------------------------------------------

    /// Fetch and parse the static feed again. A failure leaves the current
    /// snapshot in place.
    pub async fn refresh_static(&self) -> bool {
        match load_static_snapshot(&self.config.static_source, self.config.static_download_timeout).await {
            Ok(snapshot) => {
                let counts = snapshot.counts();
                self.replace_static_snapshot(Arc::new(snapshot));
                info!(trips = counts.trips, stops = counts.stops, "static snapshot replaced");
                true
            }
            Err(e) => {
                warn!(error = %e, "static refresh failed, keeping previous snapshot");
                false
            }
        }
    }

    /// One realtime cycle: all configured feeds are fetched concurrently,
    /// each under its own deadline, and each successful feed is committed
    /// on its own. If `cycle_timeout` elapses first nothing is committed.
    pub async fn refresh_realtime(&self, cycle_timeout: Duration) -> RealtimeCycle {
        let rt = &self.config.realtime;
        let fetch_timeout = self.config.realtime_fetch_timeout;
        let fetcher = self.fetcher.as_ref();

        let trip_updates = bounded(
            fetch_timeout,
            rt.trip_updates_url
                .as_deref()
                .map(|url| realtime::fetch_trip_updates(fetcher, url)),
        );
        let vehicles = bounded(
            fetch_timeout,
            rt.vehicle_positions_url
                .as_deref()
                .map(|url| realtime::fetch_vehicle_positions(fetcher, url)),
        );
        let alerts = bounded(
            fetch_timeout,
            rt.alerts_url
                .as_deref()
                .map(|url| realtime::fetch_alerts(fetcher, url)),
        );

        let joined = time::timeout(cycle_timeout, async {
            tokio::join!(trip_updates, vehicles, alerts)
        })
        .await;

        let Ok((trip_updates, vehicles, alerts)) = joined else {
            info!(?cycle_timeout, "realtime cycle ran out of time, nothing committed");
            return RealtimeCycle {
                deadline_exceeded: true,
                ..Default::default()
            };
        };

        let (trip_updates_outcome, trip_updates) = settle("trip_updates", trip_updates);
        let (vehicles_outcome, vehicles) = settle("vehicle_positions", vehicles);
        let (alerts_outcome, alerts) = settle("alerts", alerts);

        self.publish_realtime(vehicles, trip_updates, alerts);

        let cycle = RealtimeCycle {
            deadline_exceeded: false,
            trip_updates: trip_updates_outcome,
            vehicles: vehicles_outcome,
            alerts: alerts_outcome,
        };
        debug!(?cycle, "realtime cycle finished");
        cycle
    }

    // ------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------

    /// Spawn the refresh tasks the configuration calls for: static refresh
    /// for remote feeds, realtime refresh when realtime URLs are set. Does
    /// nothing if the tasks are already running or shutdown was requested.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() || *self.shutdown_tx.borrow() {
            debug!("refresh tasks already started or shut down");
            return;
        }

        if self.config.static_source.is_remote() {
            tasks.push(self.spawn_periodic(
                "static",
                self.config.static_refresh_interval,
                |manager| async move {
                    manager.refresh_static().await;
                },
            ));
        }

        if self.config.realtime.is_enabled() {
            let cycle_timeout = self.config.realtime_cycle_timeout();
            tasks.push(self.spawn_periodic(
                "realtime",
                self.config.realtime_refresh_interval,
                move |manager| async move {
                    manager.refresh_realtime(cycle_timeout).await;
                },
            ));
        }
    }

    /// A loop that checks the shutdown signal first on every tick, then runs
    /// one refresh. The refresh itself is abandoned if shutdown arrives.
    fn spawn_periodic<F, Fut>(self: &Arc<Self>, name: &'static str, period: Duration, refresh: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Manager>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<Manager> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(task = name, ?period, "refresh task started");
            loop {
                if *shutdown.borrow() {
                    break;
                }

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }

                let Some(manager) = weak.upgrade() else {
                    break;
                };

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = refresh(manager) => {}
                }
            }
            info!(task = name, "refresh task stopped");
        })
    }

    /// Signal every background task and wait for all of them to exit.
    /// Calling it again, or concurrently, is a no-op once tasks are gone.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "refresh task panicked");
                }
            }
        }
    }
}

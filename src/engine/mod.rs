//! # Simulation Engine
//!
//! Owns the plant's electrical state and advances it one configured interval
//! per tick.
//!
//! ## Concurrency
//!
//! - State is published through a `watch` channel. The engine is the only
//!   sender; readers clone the latest value and never see a half-written
//!   state.
//! - Configuration sits behind a `parking_lot::RwLock`. All writers go through
//!   [`SimulationEngine::update_config`], which holds the upgradable lock for
//!   the whole read-modify-validate-write so concurrent register writes cannot
//!   interleave.
//! - The irradiance fetch is the only suspension point in a tick and is bounded
//!   by a timeout. Nothing on the read path waits for it.

pub mod power;

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{IrradianceSample, PlantConfig, PlantState, PlantStatus, ValidationError};
use crate::irradiance::{AdapterError, IrradianceSource};
use crate::store::ParameterStore;

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("power model produced a non-finite value at {irradiance_w_m2} W/m²")]
    NonFinitePower { irradiance_w_m2: f64 },
    #[error("plant clock overflowed")]
    ClockOverflow,
}

/// Tick-local state, only touched by whoever is currently ticking
struct Ticker {
    rng: StdRng,
    seed: Option<u64>,
    clock: DateTime<Utc>,
}

impl Ticker {
    fn new(seed: Option<u64>, clock: DateTime<Utc>) -> Self {
        Self {
            rng: rng_for(seed),
            seed,
            clock,
        }
    }

    fn reseed(&mut self, seed: Option<u64>) {
        if seed != self.seed {
            self.rng = rng_for(seed);
            self.seed = seed;
        }
    }

    fn advance(&mut self, interval: Duration) -> Result<DateTime<Utc>, EngineError> {
        let step = chrono::Duration::from_std(interval).map_err(|_| EngineError::ClockOverflow)?;
        self.clock = self
            .clock
            .checked_add_signed(step)
            .ok_or(EngineError::ClockOverflow)?;
        Ok(self.clock)
    }
}

fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub struct SimulationEngine {
    source: Arc<dyn IrradianceSource>,
    config: RwLock<PlantConfig>,
    store: Option<Arc<dyn ParameterStore>>,
    state: watch::Sender<PlantState>,
    ticker: Mutex<Ticker>,
    halted: AtomicBool,
    force_weather: bool,
    fetch_timeout: Duration,
}

impl SimulationEngine {
    pub fn new(
        config: PlantConfig,
        source: Arc<dyn IrradianceSource>,
    ) -> Result<Self, ValidationError> {
        config.check_bounds()?;

        let now = Utc::now();
        let (state, _) = watch::channel(PlantState::initial(now));

        Ok(Self {
            source,
            ticker: Mutex::new(Ticker::new(config.weather_seed, now)),
            config: RwLock::new(config),
            store: None,
            state,
            halted: AtomicBool::new(false),
            force_weather: false,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        })
    }

    /// Persist accepted reconfigurations to `store`
    pub fn with_store(mut self, store: Arc<dyn ParameterStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Apply weather noise for this run regardless of the configured flag.
    /// The override is never written back to the store.
    pub fn with_forced_weather(mut self, force: bool) -> Self {
        self.force_weather = force;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Start the plant clock at a fixed instant instead of now
    pub fn with_start_time(mut self, at: DateTime<Utc>) -> Self {
        self.ticker.get_mut().clock = at;
        self.state.send_replace(PlantState::initial(at));
        self
    }

    /// Copy of the latest published state
    pub fn snapshot(&self) -> PlantState {
        self.state.borrow().clone()
    }

    /// Receiver notified after every published state
    pub fn subscribe(&self) -> watch::Receiver<PlantState> {
        self.state.subscribe()
    }

    pub fn config(&self) -> PlantConfig {
        self.config.read().clone()
    }

    /// Whether ticks apply weather noise, counting the per-run override
    pub fn simulates_weather(&self) -> bool {
        self.force_weather || self.config.read().simulate_weather
    }

    /// True between `stop()` and `start()`
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Validate and replace the configuration; applies from the next tick
    pub fn reconfigure(&self, config: PlantConfig) -> Result<PlantConfig, ValidationError> {
        self.update_config(|current| *current = config)
    }

    /// Single serialized entry point for configuration changes.
    ///
    /// `apply` edits a copy of the current configuration. The copy is only
    /// installed if it passes bounds validation; otherwise the held
    /// configuration is left untouched.
    pub fn update_config<F>(&self, apply: F) -> Result<PlantConfig, ValidationError>
    where
        F: FnOnce(&mut PlantConfig),
    {
        let guard = self.config.upgradable_read();
        let mut next = guard.clone();
        apply(&mut next);
        next.check_bounds()?;

        if *guard == next {
            return Ok(next);
        }

        let mut write = RwLockUpgradableReadGuard::upgrade(guard);
        *write = next.clone();
        // readers may proceed while we persist, other writers still wait
        let _guard = RwLockWriteGuard::downgrade_to_upgradable(write);

        info!(
            panel_count = next.panel_count,
            rated_capacity_per_panel_w = next.rated_capacity_per_panel_w,
            derate = next.derate,
            simulate_weather = next.simulate_weather,
            tick_interval_ms = next.tick_interval_ms,
            fault_threshold = next.fault_threshold,
            "plant reconfigured"
        );

        if let Some(store) = &self.store {
            if let Err(e) = next.persist(store.as_ref()) {
                warn!(error = %e, "failed to persist plant parameters");
            }
        }

        Ok(next)
    }

    /// Halt ticking. Energy is retained, output drops to zero.
    pub fn stop(&self) {
        self.state.send_modify(|state| {
            self.halted.store(true, Ordering::SeqCst);
            state.status = PlantStatus::Stopped;
            state.power_w = 0.0;
        });
        info!("plant stopped");
    }

    /// Resume ticking after `stop()`; the plant reports Running after the
    /// next successful sample.
    pub fn start(&self) {
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("plant started");
        }
    }

    /// Advance the plant by one configured interval
    pub async fn tick(&self) -> PlantState {
        if self.is_halted() {
            return self.snapshot();
        }

        let mut ticker = self.ticker.lock().await;
        let config = self.config();
        ticker.reseed(config.weather_seed);

        let previous = self.snapshot();
        let next = match ticker.advance(config.tick_interval()) {
            Err(e) => {
                error!(error = %e, "tick failed, forcing fault");
                faulted(&previous)
            }
            Ok(now) => match self.fetch_sample(now).await {
                Ok(sample) => {
                    let noise = if config.simulate_weather || self.force_weather {
                        power::weather_noise(&mut ticker.rng)
                    } else {
                        1.0
                    };
                    advance(&previous, &config, sample, noise).unwrap_or_else(|e| {
                        error!(error = %e, "tick failed, forcing fault");
                        faulted(&previous)
                    })
                }
                Err(e) => failed(&previous, &config, e),
            },
        };

        let published = self.state.send_if_modified(|current| {
            if self.halted.load(Ordering::SeqCst) {
                return false;
            }
            *current = next.clone();
            true
        });

        if published && previous.status != next.status {
            match next.status {
                PlantStatus::Fault => warn!(
                    failures = next.consecutive_failures,
                    "plant entered fault state"
                ),
                status => info!(from = %previous.status, to = %status, "plant status changed"),
            }
        }

        self.snapshot()
    }

    async fn fetch_sample(&self, at: DateTime<Utc>) -> Result<IrradianceSample, AdapterError> {
        let value = tokio::time::timeout(self.fetch_timeout, self.source.irradiance())
            .await
            .map_err(|_| AdapterError::Timeout(self.fetch_timeout.as_millis() as u64))??;

        IrradianceSample::new(value, at).ok_or(AdapterError::InvalidValue(value))
    }

    /// Tick on the configured interval until `shutdown` fires. A tick in
    /// progress when shutdown fires is allowed to finish.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut period = self.config().tick_interval();
        let mut interval = ticking_interval(period);

        info!(
            source = %self.source.describe(),
            interval_ms = period.as_millis() as u64,
            "simulation loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let state = self.tick().await;
            debug!(
                power_w = state.power_w,
                energy_wh = state.energy_wh,
                irradiance_w_m2 = state.irradiance_w_m2,
                status = %state.status,
                "tick"
            );

            let configured = self.config().tick_interval();
            if configured != period {
                period = configured;
                interval = ticking_interval(period);
            }
        }

        info!("simulation loop stopped");
    }
}

fn ticking_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn advance(
    previous: &PlantState,
    config: &PlantConfig,
    sample: IrradianceSample,
    noise: f64,
) -> Result<PlantState, EngineError> {
    let power_w = power::instantaneous_power_w(config, sample.value_w_m2, noise).ok_or(
        EngineError::NonFinitePower {
            irradiance_w_m2: sample.value_w_m2,
        },
    )?;

    Ok(PlantState {
        power_w,
        energy_wh: previous.energy_wh + power_w * config.interval_hours(),
        status: PlantStatus::Running,
        irradiance_w_m2: sample.value_w_m2,
        updated_at: sample.taken_at,
        tick_count: previous.tick_count + 1,
        consecutive_failures: 0,
    })
}

fn failed(previous: &PlantState, config: &PlantConfig, err: AdapterError) -> PlantState {
    let failures = previous.consecutive_failures.saturating_add(1);
    warn!(
        error = %err,
        failures,
        threshold = config.fault_threshold,
        "irradiance unavailable"
    );

    let mut next = PlantState {
        tick_count: previous.tick_count + 1,
        consecutive_failures: failures,
        ..previous.clone()
    };
    if failures >= config.fault_threshold {
        next.status = PlantStatus::Fault;
        next.power_w = 0.0;
    }
    next
}

fn faulted(previous: &PlantState) -> PlantState {
    PlantState {
        status: PlantStatus::Fault,
        power_w: 0.0,
        tick_count: previous.tick_count + 1,
        ..previous.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irradiance::MockIrradianceSource;
    use crate::store::{MemoryParameterStore, ParamValue};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::Sequence;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::VecDeque;

    fn reference_plant() -> PlantConfig {
        PlantConfig {
            panel_count: 10,
            rated_capacity_per_panel_w: 300.0,
            derate: 0.9,
            tick_interval_ms: 1000,
            ..Default::default()
        }
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 12, 0, 0).unwrap()
    }

    fn engine_with(config: PlantConfig, source: impl IrradianceSource + 'static) -> SimulationEngine {
        SimulationEngine::new(config, Arc::new(source))
            .unwrap()
            .with_start_time(start_time())
    }

    fn constant(value: f64) -> MockIrradianceSource {
        let mut source = MockIrradianceSource::new();
        source.expect_irradiance().returning(move || Ok(value));
        source
    }

    /// Plays back a fixed list of readings, then repeats the last one
    struct Scripted(SyncMutex<VecDeque<Option<f64>>>);

    impl Scripted {
        fn new(readings: impl IntoIterator<Item = Option<f64>>) -> Self {
            Self(SyncMutex::new(readings.into_iter().collect()))
        }
    }

    #[async_trait]
    impl IrradianceSource for Scripted {
        async fn irradiance(&self) -> Result<f64, AdapterError> {
            let mut readings = self.0.lock();
            let reading = if readings.len() > 1 {
                readings.pop_front().flatten()
            } else {
                readings.front().copied().flatten()
            };
            reading.ok_or_else(|| AdapterError::Request("scripted outage".to_string()))
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped_with_zero_energy() {
        let engine = engine_with(reference_plant(), constant(500.0));
        let state = engine.snapshot();

        assert_eq!(state.status, PlantStatus::Stopped);
        assert_eq!(state.energy_wh, 0.0);
        assert_eq!(state.updated_at, start_time());
    }

    #[tokio::test]
    async fn test_half_sun_scenario() {
        let engine = engine_with(reference_plant(), constant(500.0));
        let state = engine.tick().await;

        assert!((state.power_w - 1350.0).abs() < 1e-9);
        assert_eq!(state.status, PlantStatus::Running);
        assert!((state.energy_wh - 0.375).abs() < 1e-9);
        assert_eq!(state.irradiance_w_m2, 500.0);
        assert_eq!(state.updated_at, start_time() + chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_over_irradiance_clamps_to_rated_total() {
        let engine = engine_with(reference_plant(), constant(1200.0));
        let state = engine.tick().await;
        assert_eq!(state.power_w, 2700.0);
    }

    #[tokio::test]
    async fn test_zero_irradiance_is_not_a_fault() {
        let engine = engine_with(reference_plant(), constant(0.0));
        for _ in 0..5 {
            engine.tick().await;
        }

        let state = engine.snapshot();
        assert_eq!(state.power_w, 0.0);
        assert_eq!(state.status, PlantStatus::Running);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_three_failures_fault_then_one_success_recovers() {
        let mut source = MockIrradianceSource::new();
        let mut seq = Sequence::new();
        source
            .expect_irradiance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(800.0));
        source
            .expect_irradiance()
            .times(3)
            .in_sequence(&mut seq)
            .returning(|| Err(AdapterError::Request("connection refused".to_string())));
        source
            .expect_irradiance()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(600.0));

        let engine = engine_with(reference_plant(), source);

        assert_eq!(engine.tick().await.status, PlantStatus::Running);
        assert_eq!(engine.tick().await.status, PlantStatus::Running);
        let second = engine.tick().await;
        assert_eq!(second.status, PlantStatus::Running);
        assert_eq!(second.consecutive_failures, 2);

        let faulted = engine.tick().await;
        assert_eq!(faulted.status, PlantStatus::Fault);
        assert_eq!(faulted.power_w, 0.0);
        assert_eq!(faulted.consecutive_failures, 3);

        let recovered = engine.tick().await;
        assert_eq!(recovered.status, PlantStatus::Running);
        assert_eq!(recovered.consecutive_failures, 0);
        assert!((recovered.power_w - 1620.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failures_do_not_fabricate_a_reading() {
        let engine = engine_with(reference_plant(), Scripted::new([Some(700.0), None]));
        let before = engine.tick().await;
        let after = engine.tick().await;

        assert_eq!(after.irradiance_w_m2, before.irradiance_w_m2);
        assert_eq!(after.energy_wh, before.energy_wh);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.tick_count, before.tick_count + 1);
    }

    #[tokio::test]
    async fn test_configurable_fault_threshold() {
        let config = PlantConfig {
            fault_threshold: 1,
            ..reference_plant()
        };
        let engine = engine_with(config, Scripted::new([None]));
        assert_eq!(engine.tick().await.status, PlantStatus::Fault);
    }

    #[tokio::test]
    async fn test_negative_reading_counts_as_failure() {
        let engine = engine_with(reference_plant(), constant(-20.0));
        let state = engine.tick().await;
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.status, PlantStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_source_times_out_as_failure() {
        struct Stalled;

        #[async_trait]
        impl IrradianceSource for Stalled {
            async fn irradiance(&self) -> Result<f64, AdapterError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(900.0)
            }

            fn describe(&self) -> String {
                "stalled".to_string()
            }
        }

        let engine = SimulationEngine::new(reference_plant(), Arc::new(Stalled))
            .unwrap()
            .with_fetch_timeout(Duration::from_millis(200));

        let state = engine.tick().await;
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_energy_monotonic_while_running_and_frozen_while_stopped() {
        let readings = [
            Some(0.0),
            Some(350.0),
            None,
            Some(1000.0),
            Some(1400.0),
            None,
            None,
            None,
            Some(20.0),
            Some(640.0),
        ];
        let engine = engine_with(reference_plant(), Scripted::new(readings));

        let mut last = engine.snapshot().energy_wh;
        for _ in 0..readings.len() {
            let state = engine.tick().await;
            assert!(state.energy_wh >= last);
            last = state.energy_wh;
        }

        engine.stop();
        let stopped = engine.snapshot();
        assert_eq!(stopped.status, PlantStatus::Stopped);
        assert_eq!(stopped.power_w, 0.0);
        assert_eq!(stopped.energy_wh, last);

        for _ in 0..3 {
            let state = engine.tick().await;
            assert_eq!(state.energy_wh, last);
            assert_eq!(state.status, PlantStatus::Stopped);
        }

        engine.start();
        let resumed = engine.tick().await;
        assert_eq!(resumed.status, PlantStatus::Running);
        assert!(resumed.energy_wh > last);
    }

    #[tokio::test]
    async fn test_reconfigure_applies_to_future_ticks_only() {
        let engine = engine_with(reference_plant(), constant(500.0));
        let first = engine.tick().await;

        engine
            .reconfigure(PlantConfig {
                panel_count: 20,
                ..reference_plant()
            })
            .unwrap();
        assert_eq!(engine.snapshot().energy_wh, first.energy_wh);

        let second = engine.tick().await;
        assert!((second.power_w - 2700.0).abs() < 1e-9);
        assert!((second.energy_wh - (first.energy_wh + 0.75)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_reconfigure_leaves_config_untouched() {
        let engine = engine_with(reference_plant(), constant(500.0));
        let result = engine.reconfigure(PlantConfig {
            derate: 1.3,
            ..reference_plant()
        });

        assert!(result.is_err());
        assert_eq!(engine.config(), reference_plant());
    }

    #[tokio::test]
    async fn test_reconfigure_persists_to_store() {
        let store = Arc::new(MemoryParameterStore::new());
        let engine = engine_with(reference_plant(), constant(500.0)).with_store(store.clone());

        engine
            .update_config(|config| config.panel_count = 64)
            .unwrap();

        assert_eq!(store.get("panel_count"), Some(ParamValue::Int(64)));
    }

    #[tokio::test]
    async fn test_weather_noise_is_reproducible_with_seed() {
        let config = PlantConfig {
            simulate_weather: true,
            weather_seed: Some(2024),
            ..reference_plant()
        };
        let a = engine_with(config.clone(), constant(700.0));
        let b = engine_with(config.clone(), constant(700.0));

        let mut saw_variation = false;
        for _ in 0..50 {
            let pa = a.tick().await.power_w;
            let pb = b.tick().await.power_w;
            assert_eq!(pa, pb);
            assert!(pa >= 0.0 && pa <= config.rated_total_w());
            if (pa - 1890.0).abs() > 1e-6 {
                saw_variation = true;
            }
        }
        assert!(saw_variation);
    }

    #[tokio::test]
    async fn test_forced_weather_is_not_persisted() {
        let store = Arc::new(MemoryParameterStore::new());
        let config = PlantConfig {
            weather_seed: Some(7),
            ..reference_plant()
        };
        let engine = engine_with(config, constant(700.0))
            .with_store(store.clone())
            .with_forced_weather(true);
        assert!(engine.simulates_weather());
        assert!(!engine.config().simulate_weather);

        let mut saw_variation = false;
        for _ in 0..20 {
            if (engine.tick().await.power_w - 1890.0).abs() > 1e-6 {
                saw_variation = true;
            }
        }
        assert!(saw_variation);

        engine
            .update_config(|config| config.panel_count = 12)
            .unwrap();
        assert_eq!(store.get("simulate_weather"), Some(ParamValue::Bool(false)));
    }

    #[tokio::test]
    async fn test_subscribers_see_each_tick() {
        let engine = engine_with(reference_plant(), constant(500.0));
        let mut rx = engine.subscribe();

        engine.tick().await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, PlantStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let engine = Arc::new(engine_with(
            PlantConfig {
                tick_interval_ms: 100,
                ..reference_plant()
            },
            FixedSource,
        ));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(550)).await;
        let ticks = engine.snapshot().tick_count;
        assert!((4..=6).contains(&ticks), "unexpected tick count {ticks}");

        shutdown.cancel();
        handle.await.unwrap();

        let frozen = engine.snapshot().tick_count;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(engine.snapshot().tick_count, frozen);
    }

    struct FixedSource;

    #[async_trait]
    impl IrradianceSource for FixedSource {
        async fn irradiance(&self) -> Result<f64, AdapterError> {
            Ok(500.0)
        }

        fn describe(&self) -> String {
            "fixed".to_string()
        }
    }
}

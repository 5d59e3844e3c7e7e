//! Load Testing Suite
//!
//! Verifies the simulator under concurrent Modbus traffic:
//! - Many clients polling telemetry while the plant ticks
//! - Register writes racing with reads and ticks
//! - Tick cadence while the irradiance source is slow
//!
//! Key Performance Requirements:
//! - Register reads stay well under 100 ms while a tick waits on the source
//! - 50 concurrent clients are served without errors
//! - Concurrent writers never leave a half-applied configuration

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_modbus::prelude::*;
use tokio_util::sync::CancellationToken;

use solar_plant_sim::domain::{PlantConfig, PlantStatus};
use solar_plant_sim::engine::SimulationEngine;
use solar_plant_sim::irradiance::{AdapterError, IrradianceSource};
use solar_plant_sim::registers::RegisterMap;
use solar_plant_sim::server::{ServerSettings, TelemetryServer};

/// Source with a fixed network-like delay
struct DelayedSource {
    delay: Duration,
    value: f64,
}

#[async_trait]
impl IrradianceSource for DelayedSource {
    async fn irradiance(&self) -> Result<f64, AdapterError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.value)
    }

    fn describe(&self) -> String {
        format!("delayed {:?}", self.delay)
    }
}

async fn start_plant(
    delay: Duration,
    tick_interval_ms: u64,
) -> (SocketAddr, Arc<SimulationEngine>, CancellationToken) {
    let engine = Arc::new(
        SimulationEngine::new(
            PlantConfig {
                tick_interval_ms,
                ..Default::default()
            },
            Arc::new(DelayedSource { delay, value: 650.0 }),
        )
        .unwrap(),
    );
    let registers = Arc::new(RegisterMap::new(engine.clone()).unwrap());
    let server = TelemetryServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        registers,
        ServerSettings::default(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    tokio::spawn(server.serve(shutdown.clone()));
    tokio::spawn(engine.clone().run(shutdown.clone()));

    (addr, engine, shutdown)
}

/// Test: Read latency while ticks block on a slow source
///
/// 50 concurrent clients poll the telemetry block while every tick spends
/// 400 ms waiting for irradiance.
#[tokio::test]
#[ignore] // Ignore by default as this is a slow test
async fn test_read_latency_under_slow_source() {
    let (addr, _engine, shutdown) = start_plant(Duration::from_millis(400), 100).await;

    let latencies = Arc::new(RwLock::new(Vec::new()));
    let mut clients = JoinSet::new();

    for i in 0..50u64 {
        let latencies = Arc::clone(&latencies);
        clients.spawn(async move {
            let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
            for _ in 0..20 {
                let start = Instant::now();
                let words = ctx.read_holding_registers(0, 11).await.unwrap();
                latencies.write().await.push(start.elapsed());
                assert_eq!(words.len(), 11);

                tokio::time::sleep(Duration::from_millis(20 + i % 20)).await;
            }
        });
    }

    while let Some(result) = clients.join_next().await {
        result.unwrap();
    }
    shutdown.cancel();

    let measurements = latencies.read().await;
    let max_latency = measurements.iter().max().unwrap();
    let avg_latency: Duration = measurements.iter().sum::<Duration>() / measurements.len() as u32;

    println!(
        "Register read latency - Max: {:?}, Avg: {:?}",
        max_latency, avg_latency
    );

    assert!(
        max_latency < &Duration::from_millis(100),
        "Read latency exceeded 100ms: {:?}",
        max_latency
    );
}

/// Test: Concurrent writers and readers
///
/// Writers race to set whole parameter blocks; every block read back must
/// be one that some writer actually sent.
#[tokio::test]
#[ignore] // Ignore by default as this is a slow test
async fn test_concurrent_block_writes_are_atomic() {
    let (addr, engine, shutdown) = start_plant(Duration::from_millis(5), 10).await;

    // panel count, rating hi/lo, derate
    let blocks: Vec<[u16; 4]> = (1..=10u16)
        .map(|i| [i * 10, 0, 1000 + i * 100, 500 + i * 40])
        .collect();

    let mut tasks = JoinSet::new();
    for (i, block) in blocks.iter().copied().enumerate() {
        tasks.spawn(async move {
            let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
            for _ in 0..50 {
                ctx.write_multiple_registers(100, &block).await.unwrap();
                tokio::time::sleep(Duration::from_millis(1 + i as u64)).await;
            }
        });
    }

    for _ in 0..10 {
        let blocks = blocks.clone();
        tasks.spawn(async move {
            let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
            for _ in 0..100 {
                let words = ctx.read_holding_registers(100, 4).await.unwrap();
                let read: [u16; 4] = [words[0], words[1], words[2], words[3]];
                assert!(
                    read == [10, 0, 3000, 900] || blocks.contains(&read),
                    "torn parameter block {:?}",
                    read
                );
            }
        });
    }

    while let Some(result) = tasks.join_next().await {
        result.unwrap();
    }
    shutdown.cancel();

    assert!(engine.config().check_bounds().is_ok());
}

/// Test: Tick cadence and energy accounting under client load
#[tokio::test]
#[ignore] // Ignore by default as this is a slow test
async fn test_ticks_continue_under_client_load() {
    let (addr, engine, shutdown) = start_plant(Duration::from_millis(1), 50).await;

    let mut clients = JoinSet::new();
    for _ in 0..25 {
        clients.spawn(async move {
            let mut ctx = tcp::connect_slave(addr, Slave(1)).await.unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            let mut reads = 0u32;
            while Instant::now() < deadline {
                ctx.read_holding_registers(0, 11).await.unwrap();
                reads += 1;
            }
            reads
        });
    }

    let mut total_reads = 0u32;
    while let Some(result) = clients.join_next().await {
        total_reads += result.unwrap();
    }
    shutdown.cancel();

    let state = engine.snapshot();
    println!(
        "Served {} reads, {} ticks, {:.3} Wh",
        total_reads, state.tick_count, state.energy_wh
    );

    assert_eq!(state.status, PlantStatus::Running);
    // 2 s at 50 ms per tick, allowing for scheduling jitter
    assert!(state.tick_count >= 25, "only {} ticks", state.tick_count);

    // 650 W/m² on the default plant is 1755 W
    let expected = 1755.0 * state.tick_count as f64 * 50.0 / 3_600_000.0;
    assert!((state.energy_wh - expected).abs() < 1e-6);
}

// Run orchestration: resolve the mode, open the pool, pin streams to
// sockets, spawn producers and demultiplexers, and collect completion.
use anyhow::{Context, Result};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{ConfigError, DriverConfig};
use crate::counters::{Counters, CountersSnapshot};
use crate::demux::{StreamLane, VerifyLane, run_demux};
use crate::plan::Planner;
use crate::pool::{ConnectionId, ConnectionPool};
use crate::producer::{MessageParams, StreamProducer, run_delete, run_insert, run_query};
use crate::samples::{SampleGen, ValueMode};
use crate::shard::StreamAssigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Insert,
    Query,
    QueryVerify,
    Delete,
}

impl Mode {
    pub fn verifies(self) -> bool {
        matches!(self, Mode::QueryVerify)
    }
}

/// Totals and verdicts for a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub points_sent: u64,
    pub points_received: u64,
    pub points_verified: u64,
    pub elapsed_nanos: u128,
    pub verification: Option<VerificationReport>,
}

#[derive(Debug)]
pub struct VerificationReport {
    pub per_stream: Vec<(Uuid, bool)>,
    pub pass: bool,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.verification.as_ref().is_none_or(|report| report.pass)
    }
}

/// Read-only view of every stream's current planner position, printed by the
/// interrupt handler.
#[derive(Clone)]
pub struct ProgressSnapshot {
    cursors: Vec<(Uuid, Arc<AtomicI64>)>,
}

impl ProgressSnapshot {
    pub fn lines(&self) -> Vec<String> {
        self.cursors
            .iter()
            .map(|(uuid, cursor)| format!("{}: {}", uuid, cursor.load(Ordering::Relaxed)))
            .collect()
    }
}

#[derive(Debug)]
pub struct Driver {
    config: DriverConfig,
    mode: Mode,
    window: usize,
}

impl Driver {
    pub fn new(config: DriverConfig, mode: Mode) -> Result<Self, ConfigError> {
        let mut window = config.max_concurrent_messages;
        if mode.verifies() {
            // Replay consumes the stream RNG at response time, so responses
            // must arrive in send order.
            if window > 1 {
                warn!("MAX_CONCURRENT_MESSAGES is always 1 when verifying responses");
                window = 1;
            }
            if config.perm_seed != 0 && !config.deterministic_kv {
                return Err(ConfigError::VerifyNeedsSequential);
            }
        }
        Ok(Self {
            config,
            mode,
            window,
        })
    }

    pub async fn run(self) -> Result<RunReport> {
        let pool = ConnectionPool::connect(&self.config.db_addrs, self.config.tcp_connections)
            .await
            .context("open connection pool")?;

        match self.mode {
            Mode::Delete => self.run_delete_mode(pool).await,
            _ => self.run_windowed(pool).await,
        }
    }

    async fn run_delete_mode(self, pool: ConnectionPool) -> Result<RunReport> {
        let config = &self.config;
        let mut assigner = StreamAssigner::new(config.num_servers, config.tcp_connections);
        let (done_tx, done_rx) = mpsc::channel(config.num_streams);
        let started = Instant::now();

        for (index, uuid) in config.uuids.iter().enumerate() {
            let id = assigner.assign(uuid);
            let conn = pool.get(id);
            conn.add_producer();
            spawn_fatal(run_delete(
                index as u64,
                *uuid,
                config.first_time,
                config.end_time(),
                conn,
                done_tx.clone(),
            ));
        }
        drop(done_tx);

        wait_for_streams(&pool, done_rx, config.num_streams).await?;
        let elapsed = started.elapsed().as_nanos();
        self.finish(CountersSnapshot::default(), elapsed, None)
    }

    async fn run_windowed(self, pool: ConnectionPool) -> Result<RunReport> {
        let config = &self.config;
        let value_mode = if config.deterministic_kv {
            ValueMode::Deterministic
        } else {
            ValueMode::Stochastic
        };
        let params = MessageParams {
            points_per_message: config.points_per_message,
            nanos_between_points: config.nanos_between_points,
            end_time: config.end_time(),
        };
        let counters = Arc::new(Counters::default());
        let mut planner = Planner::new(
            config.perm_seed,
            config.first_time,
            config.points_per_message,
            config.nanos_between_points,
            config.total_records,
        );
        let mut seed_rng = ChaCha8Rng::seed_from_u64(config.rand_seed as u64);
        let mut assigner = StreamAssigner::new(config.num_servers, config.tcp_connections);
        let (done_tx, done_rx) = mpsc::channel(config.num_streams);

        let mut lanes: HashMap<ConnectionId, HashMap<u64, StreamLane>> = HashMap::new();
        let mut verdicts: Vec<(Uuid, Arc<AtomicBool>)> = Vec::new();
        let mut cursors: Vec<(Uuid, Arc<AtomicI64>)> = Vec::new();
        let started = Instant::now();

        for (index, uuid) in config.uuids.iter().enumerate() {
            let schedule = planner.schedule();
            let stream_seed = seed_rng.next_u64();
            let id = assigner.assign(uuid);
            let conn = pool.get(id);
            conn.add_producer();

            let cursor = Arc::new(AtomicI64::new(config.first_time));
            cursors.push((*uuid, Arc::clone(&cursor)));
            let producer = StreamProducer {
                tag: index as u64,
                uuid: *uuid,
                schedule,
                cursor,
            };
            let (credit_tx, credit_rx) = mpsc::channel(self.window);
            match self.mode {
                Mode::Insert => {
                    spawn_fatal(run_insert(
                        producer,
                        params,
                        SampleGen::new(value_mode, config.max_time_random_offset),
                        ChaCha8Rng::seed_from_u64(stream_seed),
                        conn,
                        credit_tx,
                        done_tx.clone(),
                        Arc::clone(&counters),
                    ));
                }
                Mode::Query | Mode::QueryVerify => {
                    spawn_fatal(run_query(
                        producer,
                        params,
                        conn,
                        credit_tx,
                        done_tx.clone(),
                        Arc::clone(&counters),
                    ));
                }
                Mode::Delete => unreachable!("delete mode has its own path"),
            }

            let verify = self.mode.verifies().then(|| {
                let pass = Arc::new(AtomicBool::new(true));
                verdicts.push((*uuid, Arc::clone(&pass)));
                VerifyLane {
                    generator: SampleGen::new(value_mode, config.max_time_random_offset),
                    rng: ChaCha8Rng::seed_from_u64(stream_seed),
                    curr_time: config.first_time,
                    partial: 0,
                    pass,
                }
            });
            lanes.entry(id).or_default().insert(
                index as u64,
                StreamLane {
                    credits: credit_rx,
                    verify,
                },
            );
        }
        drop(done_tx);
        info!("finished generating insert/query order");

        let mut demuxes = Vec::with_capacity(lanes.len());
        for (id, conn_lanes) in lanes {
            demuxes.push(spawn_fatal(run_demux(
                pool.get(id),
                conn_lanes,
                config.nanos_between_points,
                Arc::clone(&counters),
            )));
        }

        let reporter = tokio::spawn(report_loop(Arc::clone(&counters)));
        let interrupter = tokio::spawn(interrupt_dump(ProgressSnapshot { cursors }));

        wait_for_streams(&pool, done_rx, config.num_streams).await?;
        for demux in demuxes {
            demux.await.context("join demultiplexer")?;
        }
        let elapsed = started.elapsed().as_nanos();
        reporter.abort();
        interrupter.abort();

        let verification = self.mode.verifies().then(|| {
            let per_stream: Vec<(Uuid, bool)> = verdicts
                .iter()
                .map(|(uuid, pass)| (*uuid, pass.load(Ordering::Relaxed)))
                .collect();
            let pass = per_stream.iter().all(|(_, pass)| *pass);
            VerificationReport { per_stream, pass }
        });
        self.finish(counters.snapshot(), elapsed, verification)
    }

    fn finish(
        &self,
        totals: CountersSnapshot,
        elapsed_nanos: u128,
        verification: Option<VerificationReport>,
    ) -> Result<RunReport> {
        if self.mode != Mode::Delete {
            println!("Sent {}, Received {}", totals.points_sent, totals.points_received);
        }
        match &verification {
            Some(report) => {
                println!(
                    "{} points are verified to be correct",
                    totals.points_verified
                );
                for (uuid, pass) in &report.per_stream {
                    println!("{}: {}", uuid, if *pass { "PASS" } else { "FAIL" });
                }
                if report.pass {
                    println!("All points were verified to be correct. Test PASSes.");
                } else {
                    println!("Some points were found to be incorrect. Test FAILs.");
                }
            }
            None => println!("Finished"),
        }
        let total_points = self.config.total_records as u128 * self.config.num_streams as u128;
        println!("Total time: {elapsed_nanos} nanoseconds for {total_points} points");
        println!(
            "Average: {} nanoseconds per point (floored to integer value)",
            elapsed_nanos / total_points
        );
        Ok(RunReport {
            points_sent: totals.points_sent,
            points_received: totals.points_received,
            points_verified: totals.points_verified,
            elapsed_nanos,
            verification,
        })
    }
}

/// Wait for one done signal per stream, releasing each connection's producer
/// refcount and shutting the connection down when it reaches zero.
async fn wait_for_streams(
    pool: &ConnectionPool,
    mut done_rx: mpsc::Receiver<ConnectionId>,
    num_streams: usize,
) -> Result<()> {
    for _ in 0..num_streams {
        let id = done_rx
            .recv()
            .await
            .context("stream finished without a done signal")?;
        let conn = pool.get(id);
        if conn.release_producer() == 0 {
            conn.begin_shutdown();
            info!(
                server = id.server,
                conn = id.conn,
                peer = conn.peer(),
                "closed connection"
            );
        }
    }
    Ok(())
}

/// Any task-level error is fatal for the whole run: log it and exit
/// non-zero rather than hanging the completion protocol.
fn spawn_fatal<F>(task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = task.await {
            error!("fatal error: {err:#}");
            std::process::exit(1);
        }
    })
}

async fn report_loop(counters: Arc<Counters>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    // The first tick fires immediately; skip it so the first report covers a
    // full second.
    interval.tick().await;
    let mut previous = CountersSnapshot::default();
    loop {
        interval.tick().await;
        let snapshot = counters.snapshot();
        let delta = snapshot.since(&previous);
        println!("Sent {}, Received {}", delta.points_sent, delta.points_received);
        previous = snapshot;
    }
}

async fn interrupt_dump(progress: ProgressSnapshot) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    println!("\nDetected ^C. Abruptly ending program...");
    println!(
        "The following are the start times of the messages that are currently being inserted/queried:"
    );
    for line in progress.lines() {
        println!("{line}");
    }
    std::process::exit(0);
}

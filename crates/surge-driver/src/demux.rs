// Response demultiplexer: one task per connection, routing framed responses
// to the per-stream in-flight windows and optionally verifying record
// payloads against a replayed generator.
use anyhow::{Context, Result, bail};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use surge_wire::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;

use crate::counters::Counters;
use crate::pool::Connection;
use crate::samples::SampleGen;

/// Expected-sample replay state for one stream under verification.
///
/// Holds the stream's RNG for the whole run: replay consumes draws at
/// response time, which is why verification forces a window of one.
pub struct VerifyLane {
    pub generator: SampleGen,
    pub rng: ChaCha8Rng,
    /// Next expected grid timestamp; starts at the stream's first time.
    pub curr_time: i64,
    /// Records accumulated from non-final parts of the current answer.
    pub partial: u32,
    pub pass: Arc<AtomicBool>,
}

/// The receive side of one stream.
pub struct StreamLane {
    pub credits: mpsc::Receiver<u32>,
    pub verify: Option<VerifyLane>,
}

/// Read responses until every stream on this connection has been fully
/// answered.
///
/// The exit condition is producer-refcount zero plus drained credit lanes;
/// the driver's shutdown signal wakes an idle read so the check reruns. The
/// frame reader is cancel-safe, so racing it against the signal cannot lose
/// a partially received frame.
pub async fn run_demux(
    conn: Arc<Connection>,
    mut lanes: HashMap<u64, StreamLane>,
    nanos_between_points: i64,
    counters: Arc<Counters>,
) -> Result<()> {
    let mut shutdown = conn.subscribe_shutdown();
    let mut reader = conn.acquire_reader().await;
    loop {
        if conn.active_producers() == 0 && lanes.values().all(|lane| lane.credits.is_empty()) {
            break;
        }
        let frame = tokio::select! {
            biased;
            result = reader.next_frame() => result.context("receive response")?,
            _ = shutdown.changed() => continue,
        };
        let response = Response::decode(frame).context("decode response")?;
        let lane = lanes
            .get_mut(&response.echo_tag)
            .with_context(|| format!("response for unknown echo tag {}", response.echo_tag))?;

        // Only the final part of an answer consumes an in-flight credit.
        let mut credit = None;
        if response.final_part {
            let count = lane
                .credits
                .recv()
                .await
                .context("final response with no request outstanding")?;
            counters.add_received(u64::from(count));
            credit = Some(count);
        }
        if response.status != StatusCode::Ok {
            bail!("server returned status {}", response.status);
        }
        if let Some(verify) = lane.verify.as_mut() {
            check_records(verify, &response, credit, nanos_between_points, &counters);
        }
    }
    debug!(id = ?conn.id(), "demultiplexer drained");
    Ok(())
}

fn check_records(
    verify: &mut VerifyLane,
    response: &Response,
    credit: Option<u32>,
    nanos_between_points: i64,
    counters: &Counters,
) {
    let received = response.records.len() as u32;
    if response.final_part {
        let expected = credit.unwrap_or(0);
        if verify.partial + received != expected {
            println!(
                "Expected {} points in query response, but got {} points instead.",
                expected,
                verify.partial + received
            );
            verify.pass.store(false, Ordering::Relaxed);
        }
        verify.partial = 0;
    } else {
        verify.partial += received;
    }
    for record in &response.records {
        let expected = verify
            .generator
            .next_record(verify.curr_time, &mut verify.rng);
        if expected.time == record.time && expected.value == record.value {
            counters.add_verified(1);
        } else {
            println!(
                "Expected ({}, {}), got ({}, {})",
                expected.time, expected.value, record.time, record.value
            );
            verify.pass.store(false, Ordering::Relaxed);
        }
        verify.curr_time += nanos_between_points;
    }
}

// Per-stream producers: walk the planned message order, acquire an in-flight
// credit per request, and write frames through the connection's serializer.
use anyhow::{Context, Result, bail};
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use surge_wire::{Request, Response, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::counters::Counters;
use crate::plan::points_in_message;
use crate::pool::{Connection, ConnectionId};
use crate::samples::SampleGen;

/// Shape shared by every message on every stream.
#[derive(Debug, Clone, Copy)]
pub struct MessageParams {
    pub points_per_message: u32,
    pub nanos_between_points: i64,
    pub end_time: i64,
}

/// The sending side of one stream.
pub struct StreamProducer {
    /// Echo tag; equal to the stream's declaration index.
    pub tag: u64,
    pub uuid: Uuid,
    /// Ordered message start-times from the planner.
    pub schedule: Vec<i64>,
    /// Progress snapshot read by the interrupt dump.
    pub cursor: Arc<AtomicI64>,
}

pub async fn run_insert(
    stream: StreamProducer,
    params: MessageParams,
    mut generator: SampleGen,
    mut rng: ChaCha8Rng,
    conn: Arc<Connection>,
    credits: mpsc::Sender<u32>,
    done: mpsc::Sender<ConnectionId>,
    counters: Arc<Counters>,
) -> Result<()> {
    for &start in &stream.schedule {
        stream.cursor.store(start, Ordering::Relaxed);
        let count = points_in_message(
            start,
            params.end_time,
            params.nanos_between_points,
            params.points_per_message,
        );
        // Backpressure point: blocks while the in-flight window is full.
        credits
            .send(count)
            .await
            .context("in-flight window closed")?;

        let mut records = Vec::with_capacity(count as usize);
        let mut grid = start;
        for _ in 0..count {
            records.push(generator.next_record(grid, &mut rng));
            grid += params.nanos_between_points;
        }
        let frame = Request::InsertValues {
            echo_tag: stream.tag,
            uuid: stream.uuid,
            sync: false,
            records,
        }
        .encode()
        .context("encode insert request")?;
        conn.send_frame(&frame).await.context("send insert request")?;
        counters.add_sent(u64::from(count));
    }
    debug!(tag = stream.tag, "stream finished sending");
    done.send(conn.id()).await.context("done channel closed")?;
    Ok(())
}

pub async fn run_query(
    stream: StreamProducer,
    params: MessageParams,
    conn: Arc<Connection>,
    credits: mpsc::Sender<u32>,
    done: mpsc::Sender<ConnectionId>,
    counters: Arc<Counters>,
) -> Result<()> {
    for &start in &stream.schedule {
        stream.cursor.store(start, Ordering::Relaxed);
        let count = points_in_message(
            start,
            params.end_time,
            params.nanos_between_points,
            params.points_per_message,
        );
        credits
            .send(count)
            .await
            .context("in-flight window closed")?;

        let frame = Request::QueryStandardValues {
            echo_tag: stream.tag,
            uuid: stream.uuid,
            start_time: start,
            end_time: start + i64::from(count) * params.nanos_between_points,
            version: 0,
        }
        .encode()
        .context("encode query request")?;
        conn.send_frame(&frame).await.context("send query request")?;
        counters.add_sent(u64::from(count));
    }
    debug!(tag = stream.tag, "stream finished sending");
    done.send(conn.id()).await.context("done channel closed")?;
    Ok(())
}

/// Delete one stream's whole time range: a single request, a single
/// response. Streams sharing the socket may receive each other's responses;
/// only the status matters here, so any one response settles the call.
pub async fn run_delete(
    tag: u64,
    uuid: Uuid,
    start_time: i64,
    end_time: i64,
    conn: Arc<Connection>,
    done: mpsc::Sender<ConnectionId>,
) -> Result<()> {
    let frame = Request::DeleteValues {
        echo_tag: tag,
        uuid,
        start_time,
        end_time,
    }
    .encode()
    .context("encode delete request")?;
    conn.send_frame(&frame).await.context("send delete request")?;

    let frame = {
        let mut reader = conn.acquire_reader().await;
        reader.next_frame().await.context("receive delete response")?
    };
    let response = Response::decode(frame).context("decode delete response")?;
    if response.status != StatusCode::Ok {
        bail!("server returned status {}", response.status);
    }
    debug!(tag, "stream deleted");
    done.send(conn.id()).await.context("done channel closed")?;
    Ok(())
}

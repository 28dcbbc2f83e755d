// End-to-end driver runs against an in-process TCP server speaking the
// surge wire format.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use surge_driver::frame_io::{FrameReader, write_frame};
use surge_driver::samples::sine_value;
use surge_driver::{Driver, DriverConfig, Mode};
use surge_wire::{Record, Request, Response, StatusCode};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Clone)]
struct ServerBehavior {
    /// Grid step used to synthesize query answers.
    nanos_between_points: i64,
    /// Delay before each answer; lets requests pile up to the window limit.
    response_delay: Duration,
    /// Split query answers longer than this into a non-final + final pair.
    split_records_over: Option<usize>,
    /// Corrupt the first record ever served for this echo tag.
    corrupt_first_record_of_tag: Option<u64>,
}

impl Default for ServerBehavior {
    fn default() -> Self {
        Self {
            nanos_between_points: 1000,
            response_delay: Duration::ZERO,
            split_records_over: None,
            corrupt_first_record_of_tag: None,
        }
    }
}

#[derive(Default)]
struct ServerStats {
    insert_frames: Mutex<Vec<(u64, Vec<Record>)>>,
    delete_frames: Mutex<Vec<(Uuid, i64, i64)>>,
    outstanding: Mutex<HashMap<u64, i64>>,
    max_outstanding: Mutex<i64>,
}

struct MockServer {
    addr: String,
    stats: Arc<ServerStats>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MockServer {
    async fn start(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let stats = Arc::new(ServerStats::default());
        let accept_task = tokio::spawn(accept_loop(listener, behavior, Arc::clone(&stats)));
        Self {
            addr,
            stats,
            accept_task,
        }
    }

    fn insert_frames(&self) -> Vec<(u64, Vec<Record>)> {
        self.stats.insert_frames.lock().expect("lock").clone()
    }

    fn delete_frames(&self) -> Vec<(Uuid, i64, i64)> {
        self.stats.delete_frames.lock().expect("lock").clone()
    }

    fn max_outstanding(&self) -> i64 {
        *self.stats.max_outstanding.lock().expect("lock")
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, behavior: ServerBehavior, stats: Arc<ServerStats>) {
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(serve_conn(socket, behavior.clone(), Arc::clone(&stats)));
    }
}

async fn serve_conn(socket: TcpStream, behavior: ServerBehavior, stats: Arc<ServerStats>) {
    let (read, write) = socket.into_split();
    let (response_tx, response_rx) = mpsc::unbounded_channel::<(u64, Vec<Response>)>();
    let writer_task = tokio::spawn(write_loop(
        write,
        response_rx,
        behavior.response_delay,
        Arc::clone(&stats),
    ));

    let mut reader = FrameReader::new(read);
    let mut served_records: HashMap<u64, u64> = HashMap::new();
    loop {
        // EOF here is the driver dropping its pool at the end of the run.
        let Ok(frame) = reader.next_frame().await else {
            break;
        };
        let request = Request::decode(frame).expect("decode request");
        let tag = request.echo_tag();
        {
            let mut outstanding = stats.outstanding.lock().expect("lock");
            let entry = outstanding.entry(tag).or_default();
            *entry += 1;
            let mut max = stats.max_outstanding.lock().expect("lock");
            *max = (*max).max(*entry);
        }

        let responses = match request {
            Request::InsertValues {
                echo_tag, records, ..
            } => {
                stats
                    .insert_frames
                    .lock()
                    .expect("lock")
                    .push((echo_tag, records));
                vec![Response {
                    echo_tag,
                    status: StatusCode::Ok,
                    final_part: true,
                    records: vec![],
                }]
            }
            Request::QueryStandardValues {
                echo_tag,
                start_time,
                end_time,
                ..
            } => {
                let index = served_records.entry(echo_tag).or_default();
                let first_for_tag = *index == 0;
                let mut records = Vec::new();
                let mut time = start_time;
                while time < end_time {
                    records.push(Record {
                        time,
                        value: sine_value(*index),
                    });
                    *index += 1;
                    time += behavior.nanos_between_points;
                }
                if behavior.corrupt_first_record_of_tag == Some(echo_tag)
                    && first_for_tag
                    && !records.is_empty()
                {
                    records[0].value += 1.0;
                }
                match behavior.split_records_over {
                    Some(threshold) if records.len() > threshold => {
                        let tail = records.split_off(threshold);
                        vec![
                            Response {
                                echo_tag,
                                status: StatusCode::Ok,
                                final_part: false,
                                records,
                            },
                            Response {
                                echo_tag,
                                status: StatusCode::Ok,
                                final_part: true,
                                records: tail,
                            },
                        ]
                    }
                    _ => vec![Response {
                        echo_tag,
                        status: StatusCode::Ok,
                        final_part: true,
                        records,
                    }],
                }
            }
            Request::DeleteValues {
                echo_tag,
                uuid,
                start_time,
                end_time,
            } => {
                stats
                    .delete_frames
                    .lock()
                    .expect("lock")
                    .push((uuid, start_time, end_time));
                vec![Response {
                    echo_tag,
                    status: StatusCode::Ok,
                    final_part: true,
                    records: vec![],
                }]
            }
        };
        if response_tx.send((tag, responses)).is_err() {
            break;
        }
    }
    drop(response_tx);
    let _ = writer_task.await;
}

async fn write_loop(
    mut write: OwnedWriteHalf,
    mut response_rx: mpsc::UnboundedReceiver<(u64, Vec<Response>)>,
    delay: Duration,
    stats: Arc<ServerStats>,
) {
    while let Some((tag, responses)) = response_rx.recv().await {
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        for response in responses {
            let frame = response.encode().expect("encode response");
            if write_frame(&mut write, &frame).await.is_err() {
                return;
            }
        }
        let mut outstanding = stats.outstanding.lock().expect("lock");
        *outstanding.get_mut(&tag).expect("tag tracked") -= 1;
    }
}

fn uuid_with_first_byte(first: u8, salt: u8) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[0] = first;
    bytes[15] = salt;
    Uuid::from_bytes(bytes)
}

fn base_config(addrs: Vec<String>, uuids: Vec<Uuid>) -> DriverConfig {
    DriverConfig {
        total_records: 10,
        tcp_connections: 1,
        points_per_message: 4,
        nanos_between_points: 1000,
        num_servers: addrs.len(),
        num_streams: uuids.len(),
        first_time: 0,
        rand_seed: 42,
        perm_seed: 0,
        max_concurrent_messages: 2,
        max_time_random_offset: 0,
        deterministic_kv: true,
        db_addrs: addrs,
        uuids,
    }
}

#[tokio::test]
async fn insert_run_sends_the_planned_frames() {
    let server = MockServer::start(ServerBehavior::default()).await;
    let config = base_config(
        vec![server.addr.clone()],
        vec![uuid_with_first_byte(0, 1)],
    );
    let driver = Driver::new(config, Mode::Insert).expect("driver");
    let report = driver.run().await.expect("run");

    assert_eq!(report.points_sent, 10);
    assert_eq!(report.points_received, 10);
    assert!(report.success());

    let frames = server.insert_frames();
    let counts: Vec<usize> = frames.iter().map(|(_, records)| records.len()).collect();
    assert_eq!(counts, vec![4, 4, 2]);

    // Sequential order: frames walk the grid and the sine table in lockstep.
    let all: Vec<Record> = frames.into_iter().flat_map(|(_, records)| records).collect();
    for (index, record) in all.iter().enumerate() {
        assert_eq!(record.time, index as i64 * 1000);
        assert_eq!(record.value, sine_value(index as u64));
    }
}

#[tokio::test]
async fn shuffled_insert_covers_the_same_grid() {
    let server = MockServer::start(ServerBehavior::default()).await;
    let mut config = base_config(
        vec![server.addr.clone()],
        vec![uuid_with_first_byte(0, 1)],
    );
    config.perm_seed = 7;
    let driver = Driver::new(config, Mode::Insert).expect("driver");
    let report = driver.run().await.expect("run");
    assert_eq!(report.points_sent, 10);
    assert_eq!(report.points_received, 10);

    // Start times are a permutation of the grid; only the 8000-offset
    // message is truncated.
    let mut seen: Vec<(i64, usize)> = server
        .insert_frames()
        .into_iter()
        .map(|(_, records)| (records[0].time, records.len()))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![(0, 4), (4000, 4), (8000, 2)]);
}

#[tokio::test]
async fn query_verify_passes_on_faithful_replay() {
    let server = MockServer::start(ServerBehavior {
        nanos_between_points: 100,
        // Long answers arrive as a non-final part followed by the final.
        split_records_over: Some(2),
        ..ServerBehavior::default()
    })
    .await;
    let mut config = base_config(
        vec![server.addr.clone()],
        vec![uuid_with_first_byte(0, 1), uuid_with_first_byte(0, 2)],
    );
    config.total_records = 6;
    config.points_per_message = 3;
    config.nanos_between_points = 100;
    config.first_time = 1000;
    config.max_concurrent_messages = 5; // forced down to 1 by verification

    let driver = Driver::new(config, Mode::QueryVerify).expect("driver");
    let report = driver.run().await.expect("run");

    assert_eq!(report.points_sent, 12);
    assert_eq!(report.points_received, 12);
    assert_eq!(report.points_verified, 12);
    let verification = report.verification.expect("verification report");
    assert!(verification.pass);
    assert_eq!(verification.per_stream.len(), 2);
    assert!(verification.per_stream.iter().all(|(_, pass)| *pass));
}

#[tokio::test]
async fn corrupted_response_fails_only_that_stream() {
    let server = MockServer::start(ServerBehavior {
        nanos_between_points: 100,
        corrupt_first_record_of_tag: Some(0),
        ..ServerBehavior::default()
    })
    .await;
    let mut config = base_config(
        vec![server.addr.clone()],
        vec![uuid_with_first_byte(0, 1), uuid_with_first_byte(0, 2)],
    );
    config.total_records = 6;
    config.points_per_message = 3;
    config.nanos_between_points = 100;
    config.first_time = 1000;
    config.max_concurrent_messages = 1;

    let driver = Driver::new(config, Mode::QueryVerify).expect("driver");
    let report = driver.run().await.expect("run");

    // The mismatch marks the run failed but never stops it: every response
    // is still consumed and counted.
    assert_eq!(report.points_received, 12);
    assert_eq!(report.points_verified, 11);
    assert!(!report.success());
    let verification = report.verification.expect("verification report");
    assert!(!verification.pass);
    let verdicts: Vec<bool> = verification
        .per_stream
        .iter()
        .map(|(_, pass)| *pass)
        .collect();
    assert_eq!(verdicts, vec![false, true]);
}

#[tokio::test]
async fn delete_fans_out_by_uuid_shard() {
    let server_a = MockServer::start(ServerBehavior::default()).await;
    let server_b = MockServer::start(ServerBehavior::default()).await;
    let uuids = vec![
        uuid_with_first_byte(0, 1),
        uuid_with_first_byte(1, 2),
        uuid_with_first_byte(2, 3),
    ];
    let mut config = base_config(
        vec![server_a.addr.clone(), server_b.addr.clone()],
        uuids.clone(),
    );
    config.total_records = 6;
    config.nanos_between_points = 100;
    config.first_time = 1000;

    let driver = Driver::new(config, Mode::Delete).expect("driver");
    let report = driver.run().await.expect("run");
    assert!(report.success());

    // First byte mod 2 pins streams 0 and 2 to the first server.
    let frames_a = server_a.delete_frames();
    let frames_b = server_b.delete_frames();
    assert_eq!(frames_a.len(), 2);
    assert_eq!(frames_b.len(), 1);
    let mut deleted_a: Vec<Uuid> = frames_a.iter().map(|(uuid, _, _)| *uuid).collect();
    deleted_a.sort();
    assert_eq!(deleted_a, vec![uuids[0], uuids[2]]);
    assert_eq!(frames_b[0].0, uuids[1]);
    for (_, start, end) in frames_a.iter().chain(frames_b.iter()) {
        assert_eq!(*start, 1000);
        assert_eq!(*end, 1600);
    }
}

#[tokio::test]
async fn in_flight_window_is_never_exceeded() {
    let server = MockServer::start(ServerBehavior {
        response_delay: Duration::from_millis(5),
        ..ServerBehavior::default()
    })
    .await;
    let mut config = base_config(
        vec![server.addr.clone()],
        vec![uuid_with_first_byte(0, 1)],
    );
    config.total_records = 64;
    config.points_per_message = 4;
    config.max_concurrent_messages = 2;

    let driver = Driver::new(config, Mode::Insert).expect("driver");
    let report = driver.run().await.expect("run");

    assert_eq!(report.points_sent, 64);
    assert_eq!(report.points_received, 64);
    assert!(server.max_outstanding() <= 2, "window overrun");
}

#[tokio::test]
async fn streams_sharing_connections_all_drain() {
    let server = MockServer::start(ServerBehavior::default()).await;
    let uuids = vec![
        uuid_with_first_byte(0, 1),
        uuid_with_first_byte(0, 2),
        uuid_with_first_byte(0, 3),
        uuid_with_first_byte(0, 4),
    ];
    let mut config = base_config(vec![server.addr.clone()], uuids);
    config.tcp_connections = 2;
    config.max_concurrent_messages = 3;

    let driver = Driver::new(config, Mode::Insert).expect("driver");
    let report = driver.run().await.expect("run");

    // Four streams of ten points each, every credit returned.
    assert_eq!(report.points_sent, 40);
    assert_eq!(report.points_received, 40);
    assert_eq!(server.insert_frames().len(), 12);
}

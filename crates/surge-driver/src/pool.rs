// TCP connection pool: every socket is opened up front, then shared by the
// streams pinned to it for the whole run.
use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use surge_wire::Frame;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tracing::{debug, info};

use crate::frame_io::{FrameReader, write_frame};

/// Identifies one socket in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub server: usize,
    pub conn: usize,
}

/// One pooled socket.
///
/// Several producers may share a connection, so the write half sits behind a
/// serializer that keeps frames whole on the wire. The read half is wrapped
/// in a [`FrameReader`]; the demultiplexer holds its lock for the lifetime of
/// the run, while the delete path locks it once per response.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: Mutex<OwnedWriteHalf>,
    reader: Arc<Mutex<FrameReader<OwnedReadHalf>>>,
    producers: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl Connection {
    async fn dial(addr: &str, id: ConnectionId) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let (read, write) = stream.into_split();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            id,
            peer: addr.to_string(),
            writer: Mutex::new(write),
            reader: Arc::new(Mutex::new(FrameReader::new(read))),
            producers: AtomicUsize::new(0),
            shutdown_tx,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    pub async fn acquire_reader(&self) -> OwnedMutexGuard<FrameReader<OwnedReadHalf>> {
        Arc::clone(&self.reader).lock_owned().await
    }

    pub fn add_producer(&self) {
        self.producers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns how many producers are still using the connection.
    pub fn release_producer(&self) -> usize {
        self.producers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn active_producers(&self) -> usize {
        self.producers.load(Ordering::SeqCst)
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Wake the connection's demultiplexer so it can drain and exit.
    /// Idempotent; the driver calls it exactly once, when the producer
    /// refcount reaches zero.
    pub fn begin_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}

pub struct ConnectionPool {
    connections: Vec<Vec<Arc<Connection>>>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("servers", &self.connections.len())
            .finish()
    }
}

impl ConnectionPool {
    /// Open `per_server` sockets to each address. Any dial failure aborts
    /// the whole pool; the driver never runs with a partial pool.
    pub async fn connect(db_addrs: &[String], per_server: usize) -> Result<Self> {
        let mut connections = Vec::with_capacity(db_addrs.len());
        for (server, addr) in db_addrs.iter().enumerate() {
            info!(server, addr = %addr, "creating connections");
            let mut server_conns = Vec::with_capacity(per_server);
            for conn in 0..per_server {
                let connection = Connection::dial(addr, ConnectionId { server, conn }).await?;
                debug!(server, conn, "created connection");
                server_conns.push(Arc::new(connection));
            }
            connections.push(server_conns);
        }
        info!("finished creating connections");
        Ok(Self { connections })
    }

    pub fn get(&self, id: ConnectionId) -> Arc<Connection> {
        Arc::clone(&self.connections[id.server][id.conn])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        self.connections.iter().flatten()
    }
}

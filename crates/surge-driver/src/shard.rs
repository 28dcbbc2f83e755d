// Stream-to-socket placement: a stream is pinned to one server by its UUID
// and round-robined over that server's connections in declaration order.
use crate::pool::ConnectionId;
use uuid::Uuid;

pub fn server_for(uuid: &Uuid, num_servers: usize) -> usize {
    uuid.as_bytes()[0] as usize % num_servers
}

/// Assigns streams to connections in declaration order.
pub struct StreamAssigner {
    tcp_connections: usize,
    stream_counts: Vec<usize>,
}

impl StreamAssigner {
    pub fn new(num_servers: usize, tcp_connections: usize) -> Self {
        Self {
            tcp_connections,
            stream_counts: vec![0; num_servers],
        }
    }

    pub fn assign(&mut self, uuid: &Uuid) -> ConnectionId {
        let server = server_for(uuid, self.stream_counts.len());
        let conn = self.stream_counts[server] % self.tcp_connections;
        self.stream_counts[server] += 1;
        ConnectionId { server, conn }
    }
}

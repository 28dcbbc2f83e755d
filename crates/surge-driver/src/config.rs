// Load configuration: a flat YAML mapping of case-sensitive keys, validated
// into a typed struct before any socket is opened.
use std::collections::BTreeMap;
use uuid::Uuid;

/// Jitter offsets above 2^53 are not exactly representable as f64, which
/// would make replayed timestamps drift from the ones the producer sent.
pub const MAX_TIME_OFFSET_CAP: i64 = 1 << 53;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not parse config file: {0}")]
    Parse(String),
    #[error("could not read {0} from config file")]
    Missing(String),
    #[error("could not parse {key} value {value:?} as {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: &'static str,
    },
    #[error("{0} must be positive")]
    NotPositive(&'static str),
    #[error("MAX_TIME_RANDOM_OFFSET must be nonnegative")]
    OffsetNegative,
    #[error("MAX_TIME_RANDOM_OFFSET must be less than NANOS_BETWEEN_POINTS")]
    OffsetTooWide,
    #[error("MAX_TIME_RANDOM_OFFSET is too large: the maximum value is 2^53")]
    OffsetTooLarge,
    #[error("the number of specified DB_ADDRs must equal NUM_SERVERS")]
    ServerCountMismatch,
    #[error("the number of specified UUIDs must equal NUM_STREAMS")]
    StreamCountMismatch,
    #[error("invalid UUID {0:?}")]
    InvalidUuid(String),
    #[error("PERM_SEED must be 0 when verifying nondeterministic responses")]
    VerifyNeedsSequential,
}

/// Fully validated run configuration.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub total_records: i64,
    pub tcp_connections: usize,
    pub points_per_message: u32,
    pub nanos_between_points: i64,
    pub num_servers: usize,
    pub num_streams: usize,
    pub first_time: i64,
    pub rand_seed: i64,
    pub perm_seed: i64,
    pub max_concurrent_messages: usize,
    pub max_time_random_offset: i64,
    pub deterministic_kv: bool,
    pub db_addrs: Vec<String>,
    pub uuids: Vec<Uuid>,
}

impl DriverConfig {
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let map: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(contents).map_err(|err| ConfigError::Parse(err.to_string()))?;

        let total_records = get_i64(&map, "TOTAL_RECORDS")?;
        let tcp_connections = get_i64(&map, "TCP_CONNECTIONS")?;
        let points_per_message = get_i64(&map, "POINTS_PER_MESSAGE")?;
        let nanos_between_points = get_i64(&map, "NANOS_BETWEEN_POINTS")?;
        let num_servers = get_i64(&map, "NUM_SERVERS")?;
        let num_streams = get_i64(&map, "NUM_STREAMS")?;
        let first_time = get_i64(&map, "FIRST_TIME")?;
        let rand_seed = get_i64(&map, "RAND_SEED")?;
        let perm_seed = get_i64(&map, "PERM_SEED")?;
        let max_concurrent_messages = get_i64(&map, "MAX_CONCURRENT_MESSAGES")?;
        let max_time_random_offset = get_i64(&map, "MAX_TIME_RANDOM_OFFSET")?;
        let deterministic_kv = get_string(&map, "DETERMINISTIC_KV")? == "true";

        require_positive(total_records, "TOTAL_RECORDS")?;
        require_positive(tcp_connections, "TCP_CONNECTIONS")?;
        require_positive(points_per_message, "POINTS_PER_MESSAGE")?;
        require_positive(nanos_between_points, "NANOS_BETWEEN_POINTS")?;
        require_positive(num_servers, "NUM_SERVERS")?;
        require_positive(num_streams, "NUM_STREAMS")?;
        require_positive(max_concurrent_messages, "MAX_CONCURRENT_MESSAGES")?;
        if max_time_random_offset < 0 {
            return Err(ConfigError::OffsetNegative);
        }
        if max_time_random_offset >= nanos_between_points {
            return Err(ConfigError::OffsetTooWide);
        }
        if max_time_random_offset > MAX_TIME_OFFSET_CAP {
            return Err(ConfigError::OffsetTooLarge);
        }
        let points_per_message =
            u32::try_from(points_per_message).map_err(|_| ConfigError::Invalid {
                key: "POINTS_PER_MESSAGE".into(),
                value: points_per_message.to_string(),
                expected: "u32",
            })?;

        let num_servers = num_servers as usize;
        let num_streams = num_streams as usize;

        // Addresses and stream ids use numbered keys; the declared counts
        // must match the keys actually present, with nothing left over.
        let mut db_addrs = Vec::with_capacity(num_servers);
        for index in 1..=num_servers {
            let key = format!("DB_ADDR{index}");
            let addr = get_string(&map, &key).map_err(|_| ConfigError::ServerCountMismatch)?;
            db_addrs.push(addr);
        }
        if map.contains_key(&format!("DB_ADDR{}", num_servers + 1)) {
            return Err(ConfigError::ServerCountMismatch);
        }

        let mut uuids = Vec::with_capacity(num_streams);
        for index in 1..=num_streams {
            let key = format!("UUID{index}");
            let text = get_string(&map, &key).map_err(|_| ConfigError::StreamCountMismatch)?;
            let uuid = Uuid::parse_str(&text).map_err(|_| ConfigError::InvalidUuid(text))?;
            uuids.push(uuid);
        }
        if map.contains_key(&format!("UUID{}", num_streams + 1)) {
            return Err(ConfigError::StreamCountMismatch);
        }

        Ok(Self {
            total_records,
            tcp_connections: tcp_connections as usize,
            points_per_message,
            nanos_between_points,
            num_servers,
            num_streams,
            first_time,
            rand_seed,
            perm_seed,
            max_concurrent_messages: max_concurrent_messages as usize,
            max_time_random_offset,
            deterministic_kv,
            db_addrs,
            uuids,
        })
    }

    /// Exclusive upper bound of every stream's sample time range.
    pub fn end_time(&self) -> i64 {
        self.first_time
            .saturating_add(self.total_records.saturating_mul(self.nanos_between_points))
    }
}

fn get_scalar<'a>(
    map: &'a BTreeMap<String, serde_yaml::Value>,
    key: &str,
) -> Result<&'a serde_yaml::Value, ConfigError> {
    map.get(key).ok_or_else(|| ConfigError::Missing(key.into()))
}

fn get_string(map: &BTreeMap<String, serde_yaml::Value>, key: &str) -> Result<String, ConfigError> {
    let value = get_scalar(map, key)?;
    match value {
        serde_yaml::Value::String(text) => Ok(text.clone()),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        serde_yaml::Value::Bool(flag) => Ok(flag.to_string()),
        other => Err(ConfigError::Invalid {
            key: key.into(),
            value: format!("{other:?}"),
            expected: "string",
        }),
    }
}

fn get_i64(map: &BTreeMap<String, serde_yaml::Value>, key: &str) -> Result<i64, ConfigError> {
    let text = get_string(map, key)?;
    text.parse::<i64>().map_err(|_| ConfigError::Invalid {
        key: key.into(),
        value: text,
        expected: "int64",
    })
}

fn require_positive(value: i64, key: &'static str) -> Result<(), ConfigError> {
    if value <= 0 {
        return Err(ConfigError::NotPositive(key));
    }
    Ok(())
}

// Wire format for the surge load driver: length-delimited request and
// response frames for a time-series database RPC.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

pub const MAGIC: u32 = 0x53524731;
pub const VERSION: u16 = 1;
/// Envelope bytes preceding every payload: magic, version, flags, length.
pub const HEADER_LEN: usize = 12;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
    #[error("unknown status code {0}")]
    UnknownStatus(u16),
}

/// Validate an envelope prefix and return its flags and payload length.
///
/// Streaming readers call this on a buffered prefix to learn how many more
/// bytes to wait for; `input` must hold at least [`HEADER_LEN`] bytes. The
/// magic and version are protocol constants, so they are checked here and
/// never surfaced.
pub fn parse_header(input: &[u8]) -> Result<(u16, usize)> {
    if input.len() < HEADER_LEN {
        return Err(Error::Incomplete);
    }
    let mut prefix = &input[..HEADER_LEN];
    match (prefix.get_u32(), prefix.get_u16()) {
        (MAGIC, VERSION) => {}
        (MAGIC, version) => return Err(Error::UnsupportedVersion(version)),
        _ => return Err(Error::InvalidMagic),
    }
    let flags = prefix.get_u16();
    let length = prefix.get_u32() as usize;
    Ok((flags, length))
}

/// One length-delimited message envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(flags: u16, payload: Bytes) -> Result<Self> {
        // The length field is a u32 on the wire.
        if u32::try_from(payload.len()).is_err() {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self { flags, payload })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(MAGIC);
        buf.put_u16(VERSION);
        buf.put_u16(self.flags);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        let (flags, length) = parse_header(&input)?;
        if input.len() < HEADER_LEN + length {
            return Err(Error::Incomplete);
        }
        let payload = input.slice(HEADER_LEN..HEADER_LEN + length);
        Ok(Self { flags, payload })
    }
}

const KIND_INSERT_VALUES: u8 = 0x01;
const KIND_QUERY_STANDARD_VALUES: u8 = 0x02;
const KIND_DELETE_VALUES: u8 = 0x03;
const KIND_RESPONSE: u8 = 0x81;

/// Server status carried on every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    InvalidRequest,
    NoSuchStream,
    InternalError,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::InvalidRequest => 1,
            StatusCode::NoSuchStream => 2,
            StatusCode::InternalError => 3,
        }
    }

    pub fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(StatusCode::Ok),
            1 => Ok(StatusCode::InvalidRequest),
            2 => Ok(StatusCode::NoSuchStream),
            3 => Ok(StatusCode::InternalError),
            other => Err(Error::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::InvalidRequest => "INVALID_REQUEST",
            StatusCode::NoSuchStream => "NO_SUCH_STREAM",
            StatusCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(name)
    }
}

/// One timestamped sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub time: i64,
    pub value: f64,
}

impl Record {
    const LEN: usize = 16;

    fn encode(&self, buf: &mut BytesMut) {
        buf.extend_from_slice(&self.time.to_be_bytes());
        buf.extend_from_slice(&self.value.to_bits().to_be_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let time = buf.get_i64();
        let value = f64::from_bits(buf.get_u64());
        Ok(Self { time, value })
    }
}

/// Request messages sent by the driver.
///
/// ```
/// use surge_wire::Request;
/// use uuid::Uuid;
///
/// let request = Request::QueryStandardValues {
///     echo_tag: 7,
///     uuid: Uuid::nil(),
///     start_time: 0,
///     end_time: 4000,
///     version: 0,
/// };
/// let frame = request.encode().expect("encode");
/// let decoded = Request::decode(frame).expect("decode");
/// assert_eq!(decoded, request);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    InsertValues {
        echo_tag: u64,
        uuid: Uuid,
        sync: bool,
        records: Vec<Record>,
    },
    QueryStandardValues {
        echo_tag: u64,
        uuid: Uuid,
        start_time: i64,
        end_time: i64,
        version: u64,
    },
    DeleteValues {
        echo_tag: u64,
        uuid: Uuid,
        start_time: i64,
        end_time: i64,
    },
}

impl Request {
    pub fn echo_tag(&self) -> u64 {
        match self {
            Request::InsertValues { echo_tag, .. }
            | Request::QueryStandardValues { echo_tag, .. }
            | Request::DeleteValues { echo_tag, .. } => *echo_tag,
        }
    }

    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::with_capacity(64);
        match self {
            Request::InsertValues {
                echo_tag,
                uuid,
                sync,
                records,
            } => {
                buf.extend_from_slice(&[KIND_INSERT_VALUES]);
                buf.extend_from_slice(&echo_tag.to_be_bytes());
                buf.extend_from_slice(uuid.as_bytes());
                buf.extend_from_slice(&[u8::from(*sync)]);
                buf.extend_from_slice(&(records.len() as u32).to_be_bytes());
                for record in records {
                    record.encode(&mut buf);
                }
            }
            Request::QueryStandardValues {
                echo_tag,
                uuid,
                start_time,
                end_time,
                version,
            } => {
                buf.extend_from_slice(&[KIND_QUERY_STANDARD_VALUES]);
                buf.extend_from_slice(&echo_tag.to_be_bytes());
                buf.extend_from_slice(uuid.as_bytes());
                buf.extend_from_slice(&start_time.to_be_bytes());
                buf.extend_from_slice(&end_time.to_be_bytes());
                buf.extend_from_slice(&version.to_be_bytes());
            }
            Request::DeleteValues {
                echo_tag,
                uuid,
                start_time,
                end_time,
            } => {
                buf.extend_from_slice(&[KIND_DELETE_VALUES]);
                buf.extend_from_slice(&echo_tag.to_be_bytes());
                buf.extend_from_slice(uuid.as_bytes());
                buf.extend_from_slice(&start_time.to_be_bytes());
                buf.extend_from_slice(&end_time.to_be_bytes());
            }
        }
        Frame::new(0, buf.freeze())
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let mut buf = frame.payload;
        if buf.remaining() < 1 {
            return Err(Error::Incomplete);
        }
        let kind = buf.get_u8();
        match kind {
            KIND_INSERT_VALUES => {
                let echo_tag = get_u64(&mut buf)?;
                let uuid = get_uuid(&mut buf)?;
                if buf.remaining() < 1 {
                    return Err(Error::Incomplete);
                }
                let sync = buf.get_u8() != 0;
                let records = decode_records(&mut buf)?;
                Ok(Request::InsertValues {
                    echo_tag,
                    uuid,
                    sync,
                    records,
                })
            }
            KIND_QUERY_STANDARD_VALUES => {
                let echo_tag = get_u64(&mut buf)?;
                let uuid = get_uuid(&mut buf)?;
                let start_time = get_i64(&mut buf)?;
                let end_time = get_i64(&mut buf)?;
                let version = get_u64(&mut buf)?;
                Ok(Request::QueryStandardValues {
                    echo_tag,
                    uuid,
                    start_time,
                    end_time,
                    version,
                })
            }
            KIND_DELETE_VALUES => {
                let echo_tag = get_u64(&mut buf)?;
                let uuid = get_uuid(&mut buf)?;
                let start_time = get_i64(&mut buf)?;
                let end_time = get_i64(&mut buf)?;
                Ok(Request::DeleteValues {
                    echo_tag,
                    uuid,
                    start_time,
                    end_time,
                })
            }
            other => Err(Error::UnknownKind(other)),
        }
    }
}

/// Response message sent by the server. Multi-part answers carry
/// `final_part = false` on every part except the last.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub echo_tag: u64,
    pub status: StatusCode,
    pub final_part: bool,
    pub records: Vec<Record>,
}

impl Response {
    pub fn encode(&self) -> Result<Frame> {
        let mut buf = BytesMut::with_capacity(16 + self.records.len() * Record::LEN);
        buf.extend_from_slice(&[KIND_RESPONSE]);
        buf.extend_from_slice(&self.echo_tag.to_be_bytes());
        buf.extend_from_slice(&self.status.as_u16().to_be_bytes());
        buf.extend_from_slice(&[u8::from(self.final_part)]);
        buf.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        for record in &self.records {
            record.encode(&mut buf);
        }
        Frame::new(0, buf.freeze())
    }

    pub fn decode(frame: Frame) -> Result<Self> {
        let mut buf = frame.payload;
        if buf.remaining() < 1 {
            return Err(Error::Incomplete);
        }
        let kind = buf.get_u8();
        if kind != KIND_RESPONSE {
            return Err(Error::UnknownKind(kind));
        }
        let echo_tag = get_u64(&mut buf)?;
        if buf.remaining() < 3 {
            return Err(Error::Incomplete);
        }
        let status = StatusCode::from_u16(buf.get_u16())?;
        let final_part = buf.get_u8() != 0;
        let records = decode_records(&mut buf)?;
        Ok(Self {
            echo_tag,
            status,
            final_part,
            records,
        })
    }
}

fn get_u64(buf: &mut Bytes) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(Error::Incomplete);
    }
    Ok(buf.get_u64())
}

fn get_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(Error::Incomplete);
    }
    Ok(buf.get_i64())
}

fn get_uuid(buf: &mut Bytes) -> Result<Uuid> {
    if buf.remaining() < 16 {
        return Err(Error::Incomplete);
    }
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

fn decode_records(buf: &mut Bytes) -> Result<Vec<Record>> {
    if buf.remaining() < 4 {
        return Err(Error::Incomplete);
    }
    let count = buf.get_u32() as usize;
    // The declared count must fit in the payload we actually have.
    if buf.remaining() < count * Record::LEN {
        return Err(Error::Incomplete);
    }
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(Record::decode(buf)?);
    }
    Ok(records)
}

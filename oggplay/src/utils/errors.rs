#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err);
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Page CRC mismatch at offset {offset}: read {read:#010X}, calculated {calculated:#010X}")]
    CrcMismatch {
        offset: u64,
        read: u32,
        calculated: u32,
    },

    #[error("Unsupported page structure version {version} at offset {offset}")]
    UnsupportedVersion { offset: u64, version: u8 },

    #[error("Skipped {0} bytes of garbage before the next capture pattern")]
    LostSync(usize),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Page sequence gap on stream {serial:#010X}: expected {expected}, got {found}")]
    SequenceGap {
        serial: u32,
        expected: u32,
        found: u32,
    },

    #[error("Dropped orphaned continuation data on stream {0:#010X}")]
    OrphanedContinuation(u32),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HeaderError {
    #[error("Header packet too short: {actual} bytes, need {needed}")]
    Truncated { needed: usize, actual: usize },

    #[error("Unexpected header packet type {found:#04X}, expected {expected:#04X}")]
    UnexpectedPacketType { found: u8, expected: u8 },

    #[error("Missing header signature \"{0}\"")]
    BadSignature(&'static str),

    #[error("Unsupported {codec} version {version}")]
    UnsupportedVersion { codec: &'static str, version: String },

    #[error("Invalid {codec} header field {field}: {value}")]
    InvalidField {
        codec: &'static str,
        field: &'static str,
        value: i64,
    },

    #[error("Framing bit not set in {0} header")]
    FramingBit(&'static str),

    #[error("Data packet arrived before the {0} headers were complete")]
    PrematureData(&'static str),

    #[error("Header bit reader failure: {0}")]
    Read(String),
}

impl From<std::io::Error> for HeaderError {
    fn from(e: std::io::Error) -> Self {
        HeaderError::Read(e.to_string())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("No decoder available for {0}")]
    Unsupported(&'static str),

    #[error("Decoder rejected packet {packet_no}: {reason}")]
    Rejected { packet_no: u64, reason: String },

    #[error("Duplicate frame requested before any picture was decoded")]
    NoReferenceFrame,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SeekError {
    #[error("A seek is already in progress")]
    InProgress,

    #[error("Cannot seek before metadata is loaded")]
    NotLoaded,

    #[error("Cannot bisect a non-seekable stream")]
    NotSeekable,

    #[error("Invalid seek target {0}")]
    InvalidTarget(f64),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport reported an error: {0}")]
    Reported(String),

    #[error("Transport I/O failure: {0}")]
    Io(String),
}

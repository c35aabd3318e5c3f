use std::io;

/// Logs `$err` at `$level`, or returns it when `$level` is at or above the
/// configured `$state.fail_level`.
#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err.into());
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

/// Error taxonomy shared by demuxers, muxers and bitstream filters.
#[derive(thiserror::Error, Debug)]
pub enum FormatError {
    #[error("Invalid data: {0}")]
    DataInvalid(String),

    #[error("End of stream")]
    Eof,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Allocation failed")]
    NoMemory,

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl FormatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::DataInvalid(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn params(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Whether a box or frame level failure can be skipped over.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::DataInvalid(_) | Self::Unsupported(_))
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

/// Errors raised by the byte-stream reader and writer.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    #[error("Unexpected end of input at {0}")]
    Eof(u64),

    #[error("Read aborted")]
    Aborted,

    #[error("Sink does not support seeking")]
    NotSeekable,

    #[error("Seek out of range: {0}")]
    OutOfRange(u64),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<IoError> for FormatError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Eof(_) => FormatError::Eof,
            IoError::Aborted => FormatError::Aborted,
            IoError::NotSeekable => {
                FormatError::InvalidParameters("sink does not support seeking".into())
            }
            IoError::OutOfRange(pos) => {
                FormatError::InvalidParameters(format!("seek out of range: {pos}"))
            }
            IoError::Io(e) => FormatError::Io(e),
        }
    }
}

impl From<io::Error> for FormatError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => FormatError::Eof,
            io::ErrorKind::OutOfMemory => FormatError::NoMemory,
            _ => FormatError::Io(err),
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("Packet slot {0} released twice")]
    DoubleFree(u32),

    #[error("Packet slot {0} does not belong to this pool")]
    ForeignSlot(u32),
}

impl From<PoolError> for FormatError {
    fn from(err: PoolError) -> Self {
        FormatError::InvalidParameters(err.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BoxError {
    #[error("Box '{kind}' at {start} declares size {size} smaller than its header")]
    SizeTooSmall { kind: String, start: u64, size: u64 },

    #[error("Box '{kind}' at {start} overran its declared size by {overrun} bytes")]
    Overrun { kind: String, start: u64, overrun: u64 },

    #[error("Box '{kind}' has unsupported version {version}")]
    UnsupportedVersion { kind: String, version: u8 },

    #[error("Box '{kind}' references unknown track {track_id}")]
    UnknownTrack { kind: String, track_id: u32 },
}

impl From<BoxError> for FormatError {
    fn from(err: BoxError) -> Self {
        match err {
            BoxError::UnsupportedVersion { .. } => FormatError::Unsupported(err.to_string()),
            _ => FormatError::DataInvalid(err.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum BsfError {
    #[error("No ADTS sync word found in {0} bytes")]
    SyncNotFound(usize),

    #[error("ADTS frame length {0} is shorter than its header")]
    FrameTooShort(usize),

    #[error("NAL unit length {length} exceeds remaining {remaining} bytes")]
    NaluOverrun { length: usize, remaining: usize },

    #[error("Missing codec extradata for {0}")]
    MissingExtradata(&'static str),

    #[error("Filter does not accept codec {0}")]
    UnsupportedCodec(String),
}

impl From<BsfError> for FormatError {
    fn from(err: BsfError) -> Self {
        match err {
            BsfError::UnsupportedCodec(_) => FormatError::Unsupported(err.to_string()),
            _ => FormatError::DataInvalid(err.to_string()),
        }
    }
}

use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser as ClapParser, Subcommand, ValueEnum};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\navformat ",
    env!("AVFORMAT_VERSION"),
    "\nbuilt ",
    env!("BUILD_TIMESTAMP"),
);

#[derive(Debug, ClapParser)]
#[command(
    name         = env!("CARGO_PKG_NAME"),
    version      = env!("CARGO_PKG_VERSION"),
    long_version = LONG_VERSION,
    author       = env!("CARGO_PKG_AUTHORS"),
    about        = "Tools for probing, dumping and remuxing media containers",
    long_about   = None,
)]
pub struct Cli {
    /// Set the log level
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub loglevel: LogLevel,

    /// Treat warnings as fatal errors (fail on first warning).
    #[arg(long, global = true)]
    pub strict: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Plain)]
    pub log_format: LogFormat,

    /// Show progress bars during operations.
    #[arg(long, global = true)]
    pub progress: bool,

    /// Choose an operation to perform.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Level at which recoverable input errors abort.
    pub fn fail_level(&self) -> log::Level {
        if self.strict {
            log::Level::Warn
        } else {
            log::Level::Error
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print container and stream information
    Info(InfoArgs),

    /// Print one line per demuxed packet
    Packets(PacketsArgs),

    /// Copy streams into another container
    Remux(RemuxArgs),
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Input file (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Report format.
    #[arg(long, value_enum, default_value_t = OutputKind::Text)]
    pub output: OutputKind,

    /// Skip stream analysis and report header values only.
    #[arg(long)]
    pub fast: bool,
}

#[derive(Debug, Args)]
pub struct PacketsArgs {
    /// Input file (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Only list packets of this stream.
    #[arg(long, value_name = "INDEX")]
    pub stream: Option<usize>,

    /// Stop after this many packets.
    #[arg(long, value_name = "COUNT")]
    pub limit: Option<u64>,

    /// Seek to this time in milliseconds before listing.
    #[arg(long, value_name = "MS")]
    pub seek: Option<i64>,

    /// Line format.
    #[arg(long, value_enum, default_value_t = OutputKind::Text)]
    pub output: OutputKind,
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("nalu_format").args(["annexb", "avcc"])))]
pub struct RemuxArgs {
    /// Input file (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Output file (use "-" for stdout).
    #[arg(value_name = "OUTPUT")]
    pub output: PathBuf,

    /// Output container, guessed from the output extension when omitted.
    #[arg(long, value_enum)]
    pub format: Option<ContainerFormat>,

    /// Rewrite H.264/HEVC/VVC packets with start codes.
    #[arg(long)]
    pub annexb: bool,

    /// Rewrite H.264/HEVC/VVC packets with length prefixes.
    #[arg(long)]
    pub avcc: bool,

    /// Only copy these streams (repeatable).
    #[arg(long = "stream", value_name = "INDEX")]
    pub streams: Vec<usize>,

    /// MP4: write fragments instead of a single movie box.
    #[arg(long)]
    pub fragmented: bool,

    /// MP4: put the movie box before the media data.
    #[arg(long)]
    pub fast_start: bool,

    /// WAV: always write an RF64 header.
    #[arg(long)]
    pub rf64: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    /// Disable logging output.
    Off,
    /// No output except errors.
    Error,
    /// Show warnings and errors.
    Warn,
    /// Show info, warnings and errors (default).
    Info,
    /// Show debug, info, warnings and errors.
    Debug,
    /// Show all log messages including trace.
    Trace,
}

impl LogLevel {
    /// Convert LogLevel to log::LevelFilter
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Colorized human-readable text.
    Plain,
    /// Structured JSON per log record.
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum OutputKind {
    /// Aligned human-readable text.
    Text,
    /// YAML document.
    Yaml,
    /// JSON document (one object per line for packets).
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum ContainerFormat {
    /// RIFF WAVE, RF64 when large.
    Wav,
    /// ISO base media file.
    Mp4,
    /// Raw AAC with ADTS headers.
    Adts,
    /// MPEG transport stream.
    Mpegts,
    /// Flash video.
    Flv,
}

impl ContainerFormat {
    pub fn muxer_name(self) -> &'static str {
        match self {
            ContainerFormat::Wav => "wav",
            ContainerFormat::Mp4 => "mp4",
            ContainerFormat::Adts => "adts",
            ContainerFormat::Mpegts => "mpegts",
            ContainerFormat::Flv => "flv",
        }
    }
}

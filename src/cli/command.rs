use std::path::PathBuf;

use clap::{Args, Parser as ClapParser, Subcommand, ValueEnum};

#[derive(Debug, ClapParser)]
#[command(
    name         = env!("CARGO_PKG_NAME"),
    version      = env!("CARGO_PKG_VERSION"),
    long_version = concat!(
        env!("CARGO_PKG_VERSION"),
        "\noggplay ", env!("OGGPLAY_VERSION"),
        "\ngit ", env!("VERGEN_GIT_DESCRIBE"),
        "\nbuilt ", env!("BUILD_TIMESTAMP"),
    ),
    author       = env!("CARGO_PKG_AUTHORS"),
    about        = "Tools for inspecting, seeking and extracting Ogg media streams",
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
    /// Level at which container anomalies abort the command.
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
    /// Print stream information
    Info(InfoArgs),

    /// Seek to a time and report how the position was found.
    Seek(SeekArgs),

    /// Copy every page of one logical stream into a new file.
    Extract(ExtractArgs),
}

#[derive(Debug, Args)]
pub struct InfoArgs {
    /// Input Ogg file (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Report format.
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Stop after the headers instead of scanning the whole input.
    #[arg(long)]
    pub headers_only: bool,
}

#[derive(Debug, Args)]
pub struct SeekArgs {
    /// Input Ogg file.
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Seek target in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub time: f64,

    /// Read the end of the file for its duration when it has no index.
    #[arg(long)]
    pub probe_duration: bool,

    /// Bytes requested per transport read.
    #[arg(long, value_name = "BYTES", default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// Report format.
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,
}

#[derive(Debug, Args)]
pub struct ExtractArgs {
    /// Input Ogg file (use "-" for stdin).
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// Serial number of the stream, decimal or 0x-prefixed hex.
    #[arg(long, value_name = "SERIAL", value_parser = parse_serial)]
    pub serial: u32,

    /// Output file.
    #[arg(long, short, value_name = "PATH")]
    pub output: PathBuf,
}

fn parse_serial(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.map_err(|e| format!("invalid serial \"{s}\": {e}"))
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

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum ReportFormat {
    /// Aligned human-readable text.
    Text,
    /// YAML document.
    Yaml,
}

#[test]
fn serials_parse_in_both_radixes() {
    assert_eq!(parse_serial("1234"), Ok(1234));
    assert_eq!(parse_serial("0x7E01"), Ok(0x7E01));
    assert!(parse_serial("0xZZ").is_err());
}

#[test]
fn long_version_carries_build_metadata() {
    use clap::CommandFactory;

    let version = Cli::command().render_long_version();
    assert!(version.contains(concat!("git ", env!("VERGEN_GIT_DESCRIBE"))));
    assert!(version.contains(concat!("oggplay ", env!("OGGPLAY_VERSION"))));
}

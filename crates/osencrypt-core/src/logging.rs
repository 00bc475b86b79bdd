//! Process-wide logger for the osencrypt binaries. Records go to stderr as
//! JSON lines carrying the PID, since the daemon and the deferred cleanup
//! jobs it schedules share one journal.

use env_logger::fmt::Formatter;
use env_logger::Env;
use log::Record;
use serde_json::json;
use std::env;
use std::io::{self, Write};
use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

const FORMAT_ENV: &str = "OSENCRYPT_LOG_FORMAT";
const LEVEL_ENV: &str = "OSENCRYPT_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Plain,
}

impl LogFormat {
    /// Anything but `plain`/`text` keeps JSON.
    fn from_setting(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("plain") | Some("text") => LogFormat::Plain,
            _ => LogFormat::Json,
        }
    }
}

/// `RUST_LOG` wins, then `OSENCRYPT_LOG_LEVEL`, then the binary's default.
pub fn init(default_level: &str) {
    let _ = INIT.get_or_init(|| configure(default_level));
}

fn configure(default_level: &str) {
    let fallback = fallback_filter(env::var(LEVEL_ENV).ok().as_deref(), default_level);
    let format = LogFormat::from_setting(env::var(FORMAT_ENV).ok().as_deref());

    let mut builder = env_logger::Builder::from_env(Env::default().default_filter_or(fallback));
    match format {
        LogFormat::Json => builder.format(json_line),
        LogFormat::Plain => builder.format(plain_line),
    };

    if let Err(err) = builder.try_init() {
        eprintln!("failed to initialize logger: {err}");
    }
}

fn fallback_filter(configured: Option<&str>, default_level: &str) -> String {
    configured
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or(default_level)
        .to_string()
}

fn json_line(buf: &mut Formatter, record: &Record) -> io::Result<()> {
    let payload = json!({
        "timestamp": buf.timestamp().to_string(),
        "level": record.level().as_str().to_ascii_lowercase(),
        "target": record.target(),
        "pid": std::process::id(),
        "message": record.args().to_string(),
    });
    writeln!(buf, "{payload}")
}

fn plain_line(buf: &mut Formatter, record: &Record) -> io::Result<()> {
    writeln!(
        buf,
        "{} {:<5} [{}] {}: {}",
        buf.timestamp(),
        record.level(),
        std::process::id(),
        record.target(),
        record.args()
    )
}

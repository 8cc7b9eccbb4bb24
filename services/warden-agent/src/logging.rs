//! Log sink setup
//!
//! The subscriber is installed once, after the configuration has loaded,
//! because the level and sink come from the configuration. Anything worth
//! saying before that point goes into a [`StartupBuffer`] and is replayed
//! once the subscriber exists.

use anyhow::{anyhow, Context, Result};
use std::io;
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn, Level, Metadata};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;
use warden_core::{AgentConfiguration, LogLevel, LogSink};

/// Lines kept before the subscriber exists.
pub const STARTUP_BUFFER_LINES: usize = 16;

/// Rotated files kept next to the active one.
pub const RETAINED_LOG_FILES: usize = 3;

pub const SYSLOG_SOCKET: &str = "/dev/log";

/// Target for replayed startup lines, which are all produced by the app module.
pub const STARTUP_TARGET: &str = "warden_agent::app";

const SYSLOG_IDENT: &str = "warden-agent";

/// LOG_USER
const SYSLOG_FACILITY: u8 = 1;

#[derive(Debug, Default)]
pub struct StartupBuffer {
    lines: Vec<(Level, String)>,
    dropped: usize,
}

impl StartupBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&mut self, line: impl Into<String>) {
        self.push(Level::INFO, line.into());
    }

    pub fn warn(&mut self, line: impl Into<String>) {
        self.push(Level::WARN, line.into());
    }

    fn push(&mut self, level: Level, line: String) {
        if self.lines.len() < STARTUP_BUFFER_LINES {
            self.lines.push((level, line));
        } else {
            self.dropped += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter(|(level, _)| *level == Level::WARN)
            .map(|(_, line)| line.as_str())
            .collect()
    }

    /// Replay through the installed subscriber, attributed to startup.
    pub fn flush(self) {
        for (level, line) in self.lines {
            if level == Level::WARN {
                warn!(target: STARTUP_TARGET, "{}", line);
            } else {
                info!(target: STARTUP_TARGET, "{}", line);
            }
        }
        if self.dropped > 0 {
            warn!(
                target: STARTUP_TARGET,
                "{} startup log line(s) were dropped", self.dropped
            );
        }
    }
}

/// Keeps the non-blocking file writer alive. Dropping it flushes pending lines.
#[derive(Debug)]
pub struct LogGuard {
    _worker: Option<WorkerGuard>,
}

pub fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
    }
}

/// Relative log paths live next to the executable.
pub fn resolve_log_path(log_file: &Path, base_dir: &Path) -> PathBuf {
    if log_file.is_absolute() {
        log_file.to_path_buf()
    } else {
        base_dir.join(log_file)
    }
}

/// Install the global subscriber for the configured level and sink.
pub fn init(
    config: &AgentConfiguration,
    base_dir: &Path,
    startup: &mut StartupBuffer,
) -> Result<LogGuard> {
    // RUST_LOG refines the configured level.
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter(config.log_level()).into())
        .from_env_lossy();

    let log_path = resolve_log_path(config.log_file(), base_dir);

    match config.log_sink() {
        LogSink::Stdout => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stdout)
                .try_init()
                .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;
            Ok(LogGuard { _worker: None })
        }
        LogSink::File => init_file(filter, &log_path),
        LogSink::Syslog => match SyslogWriter::connect(Path::new(SYSLOG_SOCKET)) {
            Ok(writer) => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .without_time()
                    .with_target(false)
                    .try_init()
                    .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;
                Ok(LogGuard { _worker: None })
            }
            Err(e) => {
                startup.warn(format!(
                    "Syslog unavailable ({e}), logging to {} instead",
                    log_path.display()
                ));
                init_file(filter, &log_path)
            }
        },
    }
}

fn init_file(filter: EnvFilter, path: &Path) -> Result<LogGuard> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "agent.log".to_string());

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;

    let appender = RollingBuilder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(file_name)
        .max_log_files(RETAINED_LOG_FILES)
        .build(&dir)
        .with_context(|| format!("failed to open log file in {}", dir.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {e}"))?;

    Ok(LogGuard {
        _worker: Some(guard),
    })
}

/// RFC 3164 severity for a tracing level.
pub fn syslog_severity(level: &Level) -> u8 {
    match *level {
        Level::ERROR => 3,
        Level::WARN => 4,
        Level::INFO => 6,
        Level::DEBUG | Level::TRACE => 7,
    }
}

/// One RFC 3164 datagram, without hostname as local sockets expect.
pub fn format_syslog_line(severity: u8, timestamp: &str, pid: u32, message: &str) -> String {
    let priority = SYSLOG_FACILITY * 8 + severity;
    format!(
        "<{priority}>{timestamp} {SYSLOG_IDENT}[{pid}]: {}",
        message.trim_end()
    )
}

/// Sends each formatted event as one datagram to the local syslog socket.
#[derive(Debug)]
pub struct SyslogWriter {
    #[cfg(unix)]
    socket: std::os::unix::net::UnixDatagram,
}

impl SyslogWriter {
    #[cfg(unix)]
    pub fn connect(path: &Path) -> io::Result<Self> {
        let socket = std::os::unix::net::UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Self { socket })
    }

    #[cfg(not(unix))]
    pub fn connect(_path: &Path) -> io::Result<Self> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no local syslog socket on this platform",
        ))
    }
}

impl<'a> MakeWriter<'a> for SyslogWriter {
    type Writer = SyslogLine<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogLine::new(self, &Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogLine::new(self, meta.level())
    }
}

/// Buffers one event and sends it when dropped.
pub struct SyslogLine<'a> {
    target: &'a SyslogWriter,
    severity: u8,
    buf: Vec<u8>,
}

impl<'a> SyslogLine<'a> {
    fn new(target: &'a SyslogWriter, level: &Level) -> Self {
        Self {
            target,
            severity: syslog_severity(level),
            buf: Vec::new(),
        }
    }
}

impl io::Write for SyslogLine<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogLine<'_> {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let timestamp = chrono::Local::now().format("%b %e %H:%M:%S").to_string();
        let line = format_syslog_line(
            self.severity,
            &timestamp,
            std::process::id(),
            &String::from_utf8_lossy(&self.buf),
        );
        #[cfg(unix)]
        {
            // Nowhere left to report a failed log write.
            let _ = self.target.socket.send(line.as_bytes());
        }
        #[cfg(not(unix))]
        {
            let _ = (self.target, line);
        }
    }
}

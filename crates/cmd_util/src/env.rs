use std::{
    env,
    fmt::Debug,
    fs::File,
    io,
    path::PathBuf,
    str::FromStr,
    sync::LazyLock,
};

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    Layer,
    fmt::format::format,
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Read `name` from the environment, parsing it as `T`. Unset or unparseable
/// values fall back to `default`.
pub fn env_config<T: Debug + FromStr>(name: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    let var_s = match env::var(name) {
        Ok(s) => s,
        Err(env::VarError::NotPresent) => return default,
        Err(env::VarError::NotUnicode(..)) => {
            tracing::warn!("Invalid value for {name}, falling back to {default:?}.");
            return default;
        },
    };
    parse_override(name, &var_s, default)
}

fn parse_override<T: Debug + FromStr>(name: &str, var_s: &str, default: T) -> T
where
    <T as FromStr>::Err: Debug,
{
    match T::from_str(var_s) {
        Ok(v) => {
            tracing::info!("Overriding {name} to {v:?} from environment");
            v
        },
        Err(e) => {
            tracing::warn!("Invalid value {var_s} for {name}, falling back to {default:?}: {e:?}");
            default
        },
    }
}

/// Optional file that receives a copy of every log line, e.g.
/// `PANEL_TRACE_FILE=panel.log`.
static PANEL_TRACE_FILE: LazyLock<Option<File>> = LazyLock::new(|| {
    let path = PathBuf::from(env::var_os("PANEL_TRACE_FILE")?);
    match File::create(&path) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("Could not create trace file {}: {e}", path.display());
            None
        },
    }
});

/// Line format for terminal logs, chosen with `LOG_FORMAT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format {other:?}"),
        }
    }
}

/// Keeps the `PANEL_TRACE_FILE` writer flushing. Drop it last.
pub struct TracingGuard {
    _file_writer: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs logging for the `convex-panel` binary: warnings and up on stderr
/// unless `RUST_LOG` says otherwise, plus a debug-level copy in
/// `PANEL_TRACE_FILE` when set.
pub fn config_tool() -> TracingGuard {
    let log_format = env_config("LOG_FORMAT", LogFormat::Compact);
    let terminal = tracing_subscriber::fmt::layer()
        .with_ansi(env::var_os("NO_COLOR").is_none())
        .with_writer(io::stderr);
    let terminal = match log_format {
        LogFormat::Compact => terminal.event_format(format().compact()).boxed(),
        LogFormat::Pretty => terminal.event_format(format().pretty()).boxed(),
        LogFormat::Json => terminal.event_format(format().json()).boxed(),
    };
    let terminal = terminal
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.as_str())),
        )
        .boxed();
    let mut layers = vec![terminal];

    let file_writer = PANEL_TRACE_FILE.as_ref().map(|file| {
        let (writer, guard) = tracing_appender::non_blocking(file);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::from_default_env().add_directive(Level::DEBUG.into()))
                .boxed(),
        );
        guard
    });
    tracing_subscriber::registry().with(layers).init();

    TracingGuard {
        _file_writer: file_writer,
    }
}

/// Routes logs through the test harness's captured output. Safe to call from
/// every test.
pub fn config_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        LogFormat,
        parse_override,
    };

    #[test]
    fn test_parse_override() {
        assert_eq!(parse_override("PANEL_PAGE_SIZE", "25", 50usize), 25);
        assert_eq!(parse_override("PANEL_PAGE_SIZE", "lots", 50usize), 50);
        assert!(parse_override("FLAG", "true", false));
        assert_eq!(
            Duration::from_millis(parse_override("BACKOFF_MS", "-1", 1000u64)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_log_format_override() {
        assert_eq!(
            parse_override("LOG_FORMAT", "JSON", LogFormat::Compact),
            LogFormat::Json
        );
        assert_eq!(
            parse_override("LOG_FORMAT", "pretty", LogFormat::Compact),
            LogFormat::Pretty
        );
        assert_eq!(
            parse_override("LOG_FORMAT", "xml", LogFormat::Compact),
            LogFormat::Compact
        );
    }
}

use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing_chrome::{ChromeLayerBuilder, FlushGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const FILTER_VAR: &str = "RUST_LOG";
const CHROME_VAR: &str = "FADE_TRACE_CHROME";
const DEFAULT_FILTER: &str = "info";

/// Held until [`flush_chrome_trace`]; dropping it writes the trace file.
static CHROME_GUARD: Mutex<Option<FlushGuard>> = Mutex::new(None);

/// Subscriber settings read from the process environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceOptions {
    /// `EnvFilter` directive, `info` when `RUST_LOG` is unset or blank.
    pub filter: String,
    /// Destination of a `chrome://tracing` profile, from `FADE_TRACE_CHROME`.
    pub chrome_trace: Option<PathBuf>,
}

impl TraceOptions {
    pub fn from_env() -> Result<Self, InitError> {
        Self::from_lookup(|key| std::env::var_os(key))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self, InitError> {
        let read = |key: &'static str| -> Result<Option<String>, InitError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => {
                    let text = raw.into_string().map_err(|_| InitError::NotUnicode(key))?;
                    let text = text.trim();
                    Ok((!text.is_empty()).then(|| text.to_string()))
                }
            }
        };
        Ok(TraceOptions {
            filter: read(FILTER_VAR)?.unwrap_or_else(|| DEFAULT_FILTER.to_string()),
            chrome_trace: read(CHROME_VAR)?.map(PathBuf::from),
        })
    }
}

/// Installs the global subscriber: human-readable events on stderr plus an
/// optional chrome profile. Fails if a subscriber is already installed.
pub fn init_tracing() -> Result<(), InitError> {
    init_with(TraceOptions::from_env()?)
}

pub fn init_with(options: TraceOptions) -> Result<(), InitError> {
    let filter = EnvFilter::try_new(&options.filter).map_err(|source| InitError::Filter {
        directive: options.filter.clone(),
        message: source.to_string(),
    })?;
    let events = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal());
    let (chrome, guard) = match options.chrome_trace.as_ref() {
        Some(path) => {
            let (layer, guard) = ChromeLayerBuilder::new()
                .file(path)
                .include_args(true)
                .build();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    Registry::default()
        .with(filter)
        .with(events)
        .with(chrome)
        .try_init()
        .map_err(|_| InitError::AlreadyInitialised)?;
    if let Ok(mut slot) = CHROME_GUARD.lock() {
        *slot = guard;
    }
    if let Some(path) = options.chrome_trace.as_ref() {
        tracing::debug!(path = %path.display(), "chrome trace enabled");
    }
    Ok(())
}

/// Writes out the chrome profile, if one is being recorded. Later calls do
/// nothing.
pub fn flush_chrome_trace() {
    let guard = match CHROME_GUARD.lock() {
        Ok(mut slot) => slot.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    };
    drop(guard);
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialised,
    #[error("{0} is not valid unicode")]
    NotUnicode(&'static str),
    #[error("invalid log filter `{directive}`: {message}")]
    Filter { directive: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn options(vars: &[(&str, &str)]) -> Result<TraceOptions, InitError> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), OsString::from(value)))
            .collect();
        TraceOptions::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn unset_environment_logs_at_info_without_profile() {
        let options = options(&[]).unwrap();
        assert_eq!(options.filter, "info");
        assert_eq!(options.chrome_trace, None);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let options = options(&[("RUST_LOG", "  "), ("FADE_TRACE_CHROME", "")]).unwrap();
        assert_eq!(options.filter, "info");
        assert_eq!(options.chrome_trace, None);
    }

    #[test]
    fn variables_are_trimmed() {
        let options = options(&[
            ("RUST_LOG", " fade_unlearn=debug "),
            ("FADE_TRACE_CHROME", "trace.json\n"),
        ])
        .unwrap();
        assert_eq!(options.filter, "fade_unlearn=debug");
        assert_eq!(options.chrome_trace, Some(PathBuf::from("trace.json")));
    }

    #[test]
    fn malformed_filter_is_rejected_before_install() {
        let err = init_with(TraceOptions {
            filter: "fade_unlearn=loud".into(),
            chrome_trace: None,
        })
        .unwrap_err();
        assert!(matches!(err, InitError::Filter { ref directive, .. } if directive == "fade_unlearn=loud"));
    }

    #[test]
    fn flushing_without_a_profile_is_a_no_op() {
        flush_chrome_trace();
        flush_chrome_trace();
    }
}

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced to whoever configures the monitor.
///
/// Nothing on the instrumentation callback path returns these: inconsistent
/// event streams are clamped and counted instead.
#[derive(Error, Debug)]
pub enum MonitorError {
    /// A field pattern did not compile. The previously active pattern stays in effect.
    #[error("invalid {which} pattern {pattern:?}: {source}")]
    InvalidPattern {
        which: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("cannot read fields file '{path}': {source}")]
    FieldsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed field definition on line {line}: {detail}")]
    MalformedFieldDef { line: usize, detail: String },

    #[error("invalid value {value:?} for {key}")]
    InvalidConfig { key: &'static str, value: String },

    /// The analysis thread has already been wrapped up.
    #[error("analysis has been stopped")]
    SchedulerStopped,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MonitorError>;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to read telemetry log {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("detector stopped before a completion signal arrived")]
    Stopped,
    #[error("detector already started for {path}")]
    AlreadyStarted { path: PathBuf },
}

/// Failure to decode one buffered telemetry object.
///
/// Produced internally by the stream parser and deliberately not surfaced:
/// the offending object is dropped and parsing resumes at the next
/// top-level object.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryParseError {
    #[error("buffered telemetry object is not valid json: {source}")]
    InvalidJson {
        #[source]
        source: serde_json::Error,
    },
}

//! Pipeline error taxonomy.
//!
//! Infrastructure failures (SQLite, I/O, encoding) travel as `anyhow::Error`.
//! `SortError` names the pipeline-level categories callers branch on.

use thiserror::Error;

use crate::BinColor;

#[derive(Debug, Error)]
pub enum SortError {
    /// Malformed or missing detector output. Recovered locally as "no detections".
    #[error("detection backend error: {0}")]
    DetectionBackend(String),

    /// Frame source failure. Ends the current session.
    #[error("capture error: {0}")]
    Capture(String),

    /// Every classification source was exhausted.
    #[error("no bin known for '{0}'")]
    UnknownClassification(String),

    /// Sorting hardware could not be reached. Dispatch degrades to simulation.
    #[error("actuator unavailable: {0}")]
    ActuatorUnavailable(String),

    /// Operator input rejected before any side effect.
    #[error("invalid input: {0}")]
    InvalidUserInput(String),

    /// A learn request would shadow or overwrite an existing mapping.
    #[error("'{class_name}' is already mapped to {existing}")]
    ConflictingMapping {
        class_name: String,
        existing: BinColor,
    },
}

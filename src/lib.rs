//! Smart Bin sorting kernel
//!
//! This crate turns camera frames into physical sort commands for a three-bin
//! waste station, and learns unknown objects from a human operator.
//!
//! # Architecture
//!
//! Per frame the pipeline runs:
//!
//! 1. **Detect**: a `DetectorBackend` produces a backend-specific `RawDetectorOutput`.
//! 2. **Normalize**: `detect::normalize` turns it into `DetectionRecord`s (never fails).
//! 3. **Debounce**: `ConsensusTrigger` decides *when* to act (N consecutive matches + cooldown).
//! 4. **Confirm** (learning mode): `CorrectionLearningLoop` asks the operator and feeds the
//!    training corpus.
//! 5. **Resolve**: `ClassificationResolver` maps the class to a bin (static table, learned
//!    store, then the operator).
//! 6. **Dispatch**: `SortOrchestrator` sends one command to the actuator and appends a
//!    `SortEvent` to the history.
//!
//! # Module Structure
//!
//! - `frame`, `ingest`: frame type and capture sources
//! - `detect`: backends, raw output shapes, normalization
//! - `trigger`, `classify`, `learning`, `orchestrator`: the decision pipeline
//! - `prompt`: human-in-the-loop questions (console or queued for the API)
//! - `storage`: learned mappings and sort history
//! - `actuator`: sorting hardware channel
//! - `runtime`, `api`, `config`, `ui`: daemon plumbing

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub mod actuator;
pub mod api;
pub mod classify;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod learning;
pub mod orchestrator;
pub mod prompt;
pub mod runtime;
pub mod storage;
pub mod trigger;
pub mod ui;

pub use actuator::{SimulatedActuator, SortActuator};
pub use classify::{static_bin_for, ClassificationResolver, STATIC_BIN_MAPPING};
pub use detect::{
    normalize, try_normalize, BackendRegistry, BoundingBox, DetectionRecord, DetectorBackend,
    RawDetectorOutput, StubBackend,
};
pub use error::SortError;
pub use frame::Frame;
pub use ingest::{CameraConfig, CameraSource, FrameSource};
pub use learning::{
    CorrectionLearningLoop, FilesystemCorpus, NormalizedBox, TrainingCorpus, TrainingSample,
};
pub use orchestrator::{OrchestratorSettings, SortOrchestrator};
pub use prompt::{Confirmation, HumanPrompt, PromptAnswer, PromptBroker};
pub use runtime::{OperatorCommand, Session};
pub use storage::{
    ClassificationStore, InMemoryClassificationStore, PutOutcome, SharedStore,
    SqliteClassificationStore,
};
pub use trigger::{ConsensusTrigger, TriggerSettings, TriggerState};

// -------------------- Timestamps --------------------

/// Wall-clock instant with millisecond resolution.
///
/// Pipeline components never read the clock themselves; callers inject `now`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp {
    pub epoch_ms: u64,
}

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp { epoch_ms: 0 };

    pub fn now() -> Result<Self> {
        let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
        Ok(Self {
            epoch_ms: elapsed.as_millis() as u64,
        })
    }

    pub fn from_millis(epoch_ms: u64) -> Self {
        Self { epoch_ms }
    }

    pub fn from_secs(epoch_s: u64) -> Self {
        Self {
            epoch_ms: epoch_s.saturating_mul(1000),
        }
    }

    /// Time elapsed since `earlier`; zero when `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.epoch_ms.saturating_sub(earlier.epoch_ms))
    }

    pub fn checked_add(self, delta: Duration) -> Option<Self> {
        let delta_ms = u64::try_from(delta.as_millis()).ok()?;
        self.epoch_ms.checked_add(delta_ms).map(Self::from_millis)
    }

    /// Local-time stamp used in artifact names (`20240131_174501`).
    pub fn file_stamp(self) -> String {
        use chrono::TimeZone;
        match chrono::Local.timestamp_millis_opt(self.epoch_ms as i64) {
            chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
                dt.format("%Y%m%d_%H%M%S").to_string()
            }
            chrono::LocalResult::None => format!("{}", self.epoch_ms / 1000),
        }
    }

    /// UTC, second precision (`2024-01-31T17:45:01Z`).
    pub fn to_rfc3339(self) -> String {
        match chrono::DateTime::from_timestamp_millis(self.epoch_ms as i64) {
            Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            None => format!("{}ms", self.epoch_ms),
        }
    }
}

// -------------------- Bins --------------------

/// One of the three physical bins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinColor {
    /// Recyclables.
    Yellow,
    /// Organic waste.
    Green,
    /// General waste.
    Brown,
}

impl BinColor {
    pub const ALL: [BinColor; 3] = [BinColor::Yellow, BinColor::Green, BinColor::Brown];

    pub fn as_str(self) -> &'static str {
        match self {
            BinColor::Yellow => "yellow",
            BinColor::Green => "green",
            BinColor::Brown => "brown",
        }
    }
}

impl fmt::Display for BinColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BinColor {
    type Err = SortError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "yellow" => Ok(BinColor::Yellow),
            "green" => Ok(BinColor::Green),
            "brown" => Ok(BinColor::Brown),
            other => Err(SortError::InvalidUserInput(format!(
                "'{}' is not a bin (expected yellow, green or brown)",
                other
            ))),
        }
    }
}

// -------------------- Records --------------------

/// Where a classification entry comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySource {
    Static,
    Learned,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationEntry {
    pub class_name: String,
    pub bin_color: BinColor,
    pub source: EntrySource,
}

/// One dispatched sort action. Append-only history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortEvent {
    pub class_name: String,
    pub bin_color: BinColor,
    pub timestamp: Timestamp,
}

/// Per-bin summary of the sort history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinStatus {
    pub bin_color: BinColor,
    pub sorted_count: u64,
    pub last_sorted_at: Option<Timestamp>,
}

/// Canonical form of a class name used for store keys and corpus folders.
///
/// Trims, lower-cases and collapses whitespace runs into a single `_`.
pub fn normalize_class_name(raw: &str) -> String {
    raw.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

/// Normalize a class name that came from a person and check that it can be
/// used as a store key and as a single corpus folder name.
///
/// Rejects empty names, path separators and names starting with `.`.
pub fn validate_class_name(raw: &str) -> Result<String, SortError> {
    let name = normalize_class_name(raw);
    if name.is_empty() {
        return Err(SortError::InvalidUserInput(
            "class name must not be empty".to_string(),
        ));
    }
    if name.contains(|c: char| matches!(c, '/' | '\\' | '\0')) || name.starts_with('.') {
        return Err(SortError::InvalidUserInput(format!(
            "class name '{}' is not a plain name",
            name
        )));
    }
    Ok(name)
}

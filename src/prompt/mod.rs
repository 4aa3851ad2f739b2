//! Human-in-the-loop questions.
//!
//! The pipeline asks two kinds of question: "which bin does X go in?" and
//! "is this detection right?". Both block the frame loop until answered.
//! `PromptBroker` queues them for an external front-end and waits on a
//! channel (with optional timeout and cancellation); `ConsolePrompt` asks on
//! the terminal.

mod broker;
mod console;

use serde::{Deserialize, Serialize};

use crate::error::SortError;
use crate::BinColor;

pub use broker::{PendingPrompt, PromptBroker, PromptKind};
pub use console::ConsolePrompt;

/// Operator verdict on a detection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    Accept,
    /// The detection was wrong; carries the operator's class name as typed.
    Correct(String),
    Skip,
}

/// Answer delivered to a queued prompt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PromptAnswer {
    Bin { bin_color: String },
    Accept,
    Correct { class_name: String },
    Skip,
}

/// Source of operator answers.
pub trait HumanPrompt: Send + Sync {
    /// Ask which bin `class_name` belongs in.
    ///
    /// `Ok(None)` means the operator declined (or the wait timed out or was
    /// cancelled). Unusable answers are `SortError::InvalidUserInput`.
    fn ask_bin(&self, class_name: &str) -> Result<Option<BinColor>, SortError>;

    /// Ask the operator to confirm or correct a detected class.
    fn confirm_detection(&self, class_name: &str) -> Result<Confirmation, SortError>;
}

/// Prompt that never reaches a human: every question is declined.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeclinePrompt;

impl HumanPrompt for DeclinePrompt {
    fn ask_bin(&self, class_name: &str) -> Result<Option<BinColor>, SortError> {
        log::info!("no operator available to classify '{}'", class_name);
        Ok(None)
    }

    fn confirm_detection(&self, _class_name: &str) -> Result<Confirmation, SortError> {
        Ok(Confirmation::Skip)
    }
}

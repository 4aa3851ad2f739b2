//! Temporal consensus over per-frame detections.
//!
//! A sort fires only after `min_detections` consecutive frames agree on the top
//! class, and never within `cooldown` of the previous trigger. The cooldown is
//! checked first and suppresses the whole update: frames seen while cooling
//! down neither advance nor reset the consensus counter.

use std::time::Duration;

use crate::detect::DetectionRecord;
use crate::Timestamp;

pub const DEFAULT_MIN_DETECTIONS: u32 = 3;
pub const DEFAULT_AUTO_SORT_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriggerSettings {
    pub min_detections: u32,
    pub cooldown: Duration,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            min_detections: DEFAULT_MIN_DETECTIONS,
            cooldown: DEFAULT_AUTO_SORT_DELAY,
        }
    }
}

/// Debounce state. `Default` is the initial (and post-reset) state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TriggerState {
    pub last_class: Option<String>,
    pub consecutive_count: u32,
    pub last_trigger_time: Timestamp,
}

impl TriggerState {
    /// Pure transition: returns the next state and the record to act on, if any.
    pub fn advance(
        mut self,
        detections: &[DetectionRecord],
        now: Timestamp,
        settings: &TriggerSettings,
    ) -> (Self, Option<DetectionRecord>) {
        let Some(best) = best_detection(detections) else {
            return (self, None);
        };

        if now.saturating_duration_since(self.last_trigger_time) < settings.cooldown {
            return (self, None);
        }

        if self.last_class.as_deref() == Some(best.class_name.as_str()) {
            self.consecutive_count = self.consecutive_count.saturating_add(1);
        } else {
            self.last_class = Some(best.class_name.clone());
            self.consecutive_count = 1;
        }

        if self.consecutive_count >= settings.min_detections {
            self.consecutive_count = 0;
            self.last_trigger_time = now;
            return (self, Some(best.clone()));
        }
        (self, None)
    }
}

/// Highest-confidence record; the first one wins ties.
pub fn best_detection(detections: &[DetectionRecord]) -> Option<&DetectionRecord> {
    detections.iter().fold(None, |best: Option<&DetectionRecord>, candidate| match best {
        Some(current) if current.confidence >= candidate.confidence => Some(current),
        _ => Some(candidate),
    })
}

/// Owns a `TriggerState` for one detection session.
#[derive(Clone, Debug, Default)]
pub struct ConsensusTrigger {
    settings: TriggerSettings,
    state: TriggerState,
}

impl ConsensusTrigger {
    pub fn new(settings: TriggerSettings) -> Self {
        Self {
            settings,
            state: TriggerState::default(),
        }
    }

    /// Feed one frame's detections. Returns the record to act on, if consensus fired.
    pub fn update(&mut self, detections: &[DetectionRecord], now: Timestamp) -> Option<DetectionRecord> {
        let state = std::mem::take(&mut self.state);
        let (next, fired) = state.advance(detections, now, &self.settings);
        self.state = next;
        if let Some(record) = &fired {
            log::debug!(
                "ConsensusTrigger: fired on '{}' ({:.2})",
                record.class_name,
                record.confidence
            );
        }
        fired
    }

    /// Back to the initial state, cooldown included.
    pub fn reset(&mut self) {
        self.state = TriggerState::default();
    }

    pub fn state(&self) -> &TriggerState {
        &self.state
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// Progress line for status displays, e.g. `plastic (2/3)`.
    pub fn progress(&self) -> Option<String> {
        self.state.last_class.as_ref().map(|class| {
            format!(
                "{} ({}/{})",
                class, self.state.consecutive_count, self.settings.min_detections
            )
        })
    }
}

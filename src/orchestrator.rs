//! Per-frame pipeline: detect, debounce, confirm, resolve, dispatch.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::actuator::SortActuator;
use crate::classify::ClassificationResolver;
use crate::detect::{try_normalize, BackendRegistry, DetectionRecord};
use crate::frame::Frame;
use crate::learning::CorrectionLearningLoop;
use crate::storage::SharedStore;
use crate::trigger::{best_detection, ConsensusTrigger, TriggerSettings};
use crate::{normalize_class_name, BinColor, BinStatus, ClassificationEntry, SortEvent, Timestamp};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.6;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrchestratorSettings {
    /// Ask the operator to confirm every candidate before sorting it.
    pub learning_mode: bool,
    /// Detections below this confidence are ignored.
    pub min_confidence: f32,
    pub trigger: TriggerSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            learning_mode: true,
            min_confidence: DEFAULT_CONFIDENCE_THRESHOLD,
            trigger: TriggerSettings::default(),
        }
    }
}

/// Drives one detection session.
///
/// Frames are processed strictly in order. Operator prompts (confirmation,
/// unknown classes) block `process_frame` until answered.
pub struct SortOrchestrator {
    settings: OrchestratorSettings,
    detectors: BackendRegistry,
    trigger: ConsensusTrigger,
    resolver: Arc<ClassificationResolver>,
    learning: CorrectionLearningLoop,
    actuator: Box<dyn SortActuator>,
    last_detections: Vec<DetectionRecord>,
    /// Most recent frame that had something in view, with its best detection.
    last_tracked: Option<(Frame, DetectionRecord)>,
}

impl SortOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        detectors: BackendRegistry,
        resolver: Arc<ClassificationResolver>,
        learning: CorrectionLearningLoop,
        actuator: Box<dyn SortActuator>,
    ) -> Self {
        log::info!(
            "SortOrchestrator: actuator={} learning_mode={} min_detections={} cooldown={:?}",
            actuator.name(),
            settings.learning_mode,
            settings.trigger.min_detections,
            settings.trigger.cooldown
        );
        Self {
            trigger: ConsensusTrigger::new(settings.trigger),
            settings,
            detectors,
            resolver,
            learning,
            actuator,
            last_detections: Vec::new(),
            last_tracked: None,
        }
    }

    /// Run one frame through the pipeline.
    ///
    /// Returns the dispatched event, if this frame caused a sort. Detector
    /// failures are logged and treated as an empty frame; store failures are
    /// errors.
    pub fn process_frame(&mut self, frame: &Frame, now: Timestamp) -> Result<Option<SortEvent>> {
        let detections = self.detect(frame);
        let candidate = self.trigger.update(&detections, now);
        if let Some(tracked) = candidate.as_ref().or_else(|| best_detection(&detections)) {
            self.last_tracked = Some((frame.clone(), tracked.clone()));
        }
        self.last_detections = detections;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        log::info!(
            "SortOrchestrator: consensus on '{}' ({:.2})",
            candidate.class_name,
            candidate.confidence
        );

        let class_name = if self.settings.learning_mode {
            match self.learning.confirm(frame, &candidate) {
                Some(class_name) => class_name,
                None => return Ok(None),
            }
        } else {
            candidate.class_name
        };
        self.resolve_and_dispatch(&class_name, now)
    }

    /// Sort the best detection of the most recent frame, skipping consensus
    /// and confirmation.
    pub fn force_sort(&mut self, now: Timestamp) -> Result<Option<SortEvent>> {
        let Some(best) = best_detection(&self.last_detections).cloned() else {
            log::info!("SortOrchestrator: force sort requested with nothing in view");
            return Ok(None);
        };
        log::info!("SortOrchestrator: force sorting '{}'", best.class_name);
        self.resolve_and_dispatch(&best.class_name, now)
    }

    /// Clear the consensus state.
    pub fn reset(&mut self) {
        self.trigger.reset();
        log::info!("SortOrchestrator: detection state reset");
    }

    /// Re-run confirmation on the last tracked detection, triggered or not,
    /// and learn the confirmed mapping. Never sorts. Returns the confirmed
    /// class name.
    pub fn correct_last(&mut self) -> Result<Option<String>> {
        let Some((frame, candidate)) = self.last_tracked.as_ref() else {
            log::info!("SortOrchestrator: nothing to correct yet");
            return Ok(None);
        };
        let Some(class_name) = self.learning.confirm(frame, candidate) else {
            return Ok(None);
        };
        match self.resolver.resolve(&class_name, true)? {
            Some(bin) => log::info!("SortOrchestrator: '{}' belongs in {}", class_name, bin),
            None => log::info!("SortOrchestrator: '{}' left unclassified", class_name),
        }
        Ok(Some(class_name))
    }

    fn detect(&mut self, frame: &Frame) -> Vec<DetectionRecord> {
        let raw = match self.detectors.infer(frame) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!("SortOrchestrator: detector failed: {:#}", err);
                return Vec::new();
            }
        };
        let detections = match try_normalize(&raw) {
            Ok(detections) => detections,
            Err(err) => {
                log::warn!("SortOrchestrator: {}", err);
                return Vec::new();
            }
        };
        detections
            .into_iter()
            .filter(|d| d.confidence >= self.settings.min_confidence)
            .collect()
    }

    fn resolve_and_dispatch(&mut self, class_name: &str, now: Timestamp) -> Result<Option<SortEvent>> {
        let Some(bin) = self.resolver.resolve(class_name, true)? else {
            log::info!("SortOrchestrator: no bin for '{}', not sorting", class_name);
            return Ok(None);
        };
        self.dispatch(class_name, bin, now).map(Some)
    }

    fn dispatch(&mut self, class_name: &str, bin: BinColor, now: Timestamp) -> Result<SortEvent> {
        // The controller never acknowledges, so a failed write still counts as issued.
        if let Err(err) = self.actuator.send(bin) {
            log::error!("SortOrchestrator: actuator error: {:#}", err);
        }
        let event = SortEvent {
            class_name: normalize_class_name(class_name),
            bin_color: bin,
            timestamp: now,
        };
        self.store()
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .append_sort_event(&event)?;
        log::info!("SortOrchestrator: sorted '{}' into {}", event.class_name, bin);
        Ok(event)
    }

    fn store(&self) -> &SharedStore {
        self.resolver.store()
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn trigger(&self) -> &ConsensusTrigger {
        &self.trigger
    }

    pub fn resolver(&self) -> &Arc<ClassificationResolver> {
        &self.resolver
    }

    pub fn last_detections(&self) -> &[DetectionRecord] {
        &self.last_detections
    }

    pub fn history(&self, limit: usize) -> Result<Vec<SortEvent>> {
        self.store()
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .recent_sort_events(limit)
    }

    pub fn entries(&self) -> Result<Vec<ClassificationEntry>> {
        self.resolver.entries()
    }

    pub fn bin_status(&self) -> Result<Vec<BinStatus>> {
        self.store()
            .lock()
            .map_err(|_| anyhow!("classification store lock poisoned"))?
            .bin_status()
    }
}

//! Operator confirmation and training-data capture.
//!
//! In learning mode every triggered candidate is shown to the operator, who
//! accepts it, corrects the class name, or skips it. Accepted and corrected
//! detections become `TrainingSample`s in a `TrainingCorpus`.

mod corpus;

use std::sync::Arc;

pub use corpus::{
    FilesystemCorpus, NormalizedBox, SampleArtifact, TrainingCorpus, TrainingSample, ERRORS_DIR,
};

use crate::detect::DetectionRecord;
use crate::frame::Frame;
use crate::validate_class_name;
use crate::prompt::{Confirmation, HumanPrompt};

pub struct CorrectionLearningLoop {
    prompt: Arc<dyn HumanPrompt>,
    corpus: Box<dyn TrainingCorpus>,
}

impl CorrectionLearningLoop {
    pub fn new(prompt: Arc<dyn HumanPrompt>, corpus: Box<dyn TrainingCorpus>) -> Self {
        Self { prompt, corpus }
    }

    /// Ask the operator about `candidate` and record training samples.
    ///
    /// Returns the class name to act on: the candidate's own class when
    /// accepted, the normalized replacement when corrected, `None` when
    /// skipped or when the answer is unusable. Corpus write failures are
    /// logged; they do not change the operator's decision.
    pub fn confirm(&mut self, frame: &Frame, candidate: &DetectionRecord) -> Option<String> {
        let confirmation = match self.prompt.confirm_detection(&candidate.class_name) {
            Ok(confirmation) => confirmation,
            Err(err) => {
                log::warn!("CorrectionLearningLoop: {}", err);
                return None;
            }
        };
        let bbox = NormalizedBox::from_pixels(&candidate.bbox, frame.width, frame.height);

        match confirmation {
            Confirmation::Accept => {
                let sample = TrainingSample {
                    class_name: candidate.class_name.clone(),
                    image: frame,
                    bbox,
                    label_correct: true,
                    timestamp: frame.captured_at,
                };
                if let Err(err) = self.corpus.write_sample(&sample) {
                    log::error!("CorrectionLearningLoop: failed to save sample: {:#}", err);
                }
                Some(candidate.class_name.clone())
            }
            Confirmation::Correct(raw) => {
                let corrected = match validate_class_name(&raw) {
                    Ok(corrected) => corrected,
                    Err(err) => {
                        log::warn!("CorrectionLearningLoop: correction ignored: {}", err);
                        return None;
                    }
                };
                log::info!(
                    "CorrectionLearningLoop: '{}' corrected to '{}'",
                    candidate.class_name,
                    corrected
                );
                self.record_correction(frame, candidate, &corrected, bbox);
                Some(corrected)
            }
            Confirmation::Skip => {
                log::info!("CorrectionLearningLoop: '{}' skipped", candidate.class_name);
                None
            }
        }
    }

    /// Writes the corrected sample and the rejected original as a pair.
    fn record_correction(
        &mut self,
        frame: &Frame,
        candidate: &DetectionRecord,
        corrected: &str,
        bbox: Option<NormalizedBox>,
    ) {
        let good = TrainingSample {
            class_name: corrected.to_string(),
            image: frame,
            bbox: None,
            label_correct: true,
            timestamp: frame.captured_at,
        };
        let first = match self.corpus.write_sample(&good) {
            Ok(artifact) => artifact,
            Err(err) => {
                log::error!("CorrectionLearningLoop: failed to save sample: {:#}", err);
                return;
            }
        };

        let bad = TrainingSample {
            class_name: candidate.class_name.clone(),
            image: frame,
            bbox,
            label_correct: false,
            timestamp: frame.captured_at,
        };
        if let Err(err) = self.corpus.write_sample(&bad) {
            log::error!("CorrectionLearningLoop: failed to save error sample: {:#}", err);
            if let Some(artifact) = first {
                if let Err(err) = self.corpus.discard(&artifact) {
                    log::error!(
                        "CorrectionLearningLoop: could not roll back {}: {:#}",
                        artifact.image_path.display(),
                        err
                    );
                }
            }
        }
    }
}

use std::collections::VecDeque;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{RawDetectorOutput, TableRow};
use crate::frame::Frame;

/// Classes the hashing stub picks from when none are configured.
pub const DEFAULT_STUB_CLASSES: &[&str] = &["plastic_bottle", "cardboard", "banana_peel", "tissue"];

/// Stub backend for testing and demos.
///
/// In hashing mode it derives a class and confidence from the frame pixels,
/// so identical frames always produce the same detection. In scripted mode it
/// replays queued outputs and reports an empty table once the script runs out.
pub struct StubBackend {
    mode: StubMode,
}

enum StubMode {
    Hashed { classes: Vec<String> },
    Scripted(VecDeque<RawDetectorOutput>),
}

impl StubBackend {
    pub fn new() -> Self {
        Self::with_classes(DEFAULT_STUB_CLASSES.iter().map(|c| c.to_string()).collect())
    }

    pub fn with_classes(classes: Vec<String>) -> Self {
        Self {
            mode: StubMode::Hashed { classes },
        }
    }

    pub fn scripted<I: IntoIterator<Item = RawDetectorOutput>>(outputs: I) -> Self {
        Self {
            mode: StubMode::Scripted(outputs.into_iter().collect()),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn infer(&mut self, frame: &Frame) -> Result<RawDetectorOutput> {
        match &mut self.mode {
            StubMode::Scripted(queue) => Ok(queue.pop_front().unwrap_or_else(RawDetectorOutput::empty)),
            StubMode::Hashed { classes } => {
                if classes.is_empty() {
                    return Ok(RawDetectorOutput::empty());
                }
                let digest: [u8; 32] = Sha256::digest(frame.pixels()).into();
                let name = classes[digest[0] as usize % classes.len()].clone();
                let confidence = 0.6 + (digest[1] as f32 / 255.0) * 0.4;
                let (w, h) = (frame.width as f32, frame.height as f32);
                Ok(RawDetectorOutput::Table(vec![TableRow {
                    name,
                    confidence,
                    xmin: w * 0.25,
                    ymin: h * 0.25,
                    xmax: w * 0.75,
                    ymax: h * 0.75,
                }]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn hashed_mode_is_deterministic_per_frame() {
        let mut backend = StubBackend::new();
        let a = Frame::solid(16, 16, [200, 10, 10], Timestamp::EPOCH).unwrap();
        let b = Frame::solid(16, 16, [200, 10, 10], Timestamp::from_secs(5)).unwrap();

        let first = backend.infer(&a).unwrap();
        let second = backend.infer(&b).unwrap();
        assert_eq!(first, second);

        let RawDetectorOutput::Table(rows) = first else {
            panic!("stub should emit a table");
        };
        assert_eq!(rows.len(), 1);
        assert!(DEFAULT_STUB_CLASSES.contains(&rows[0].name.as_str()));
        assert!((0.6..=1.0).contains(&rows[0].confidence));
        assert_eq!(rows[0].xmin, 4.0);
        assert_eq!(rows[0].xmax, 12.0);
    }

    #[test]
    fn scripted_mode_replays_then_goes_quiet() {
        let mut backend = StubBackend::scripted(vec![RawDetectorOutput::Missing]);
        let frame = Frame::solid(2, 2, [0, 0, 0], Timestamp::EPOCH).unwrap();
        assert_eq!(backend.infer(&frame).unwrap(), RawDetectorOutput::Missing);
        assert_eq!(backend.infer(&frame).unwrap(), RawDetectorOutput::empty());
    }
}

use anyhow::Result;

use crate::detect::result::RawDetectorOutput;
use crate::frame::Frame;

/// Object detector backend.
///
/// Backends are opaque: they accept a frame and return whatever shape their
/// model emits. Normalization happens downstream, so a backend never has to
/// agree with another on output layout.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on a frame.
    ///
    /// Errors are treated as detection backend failures: logged, and the frame
    /// counts as having no detections.
    fn infer(&mut self, frame: &Frame) -> Result<RawDetectorOutput>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

//! Training corpus on the local filesystem.
//!
//! Layout:
//!
//! ```text
//! <root>/<class>/ok_<class>_<stamp>_<seq>.jpg          confirmed samples
//! <root>/<class>/ok_<class>_<stamp>_<seq>.txt          YOLO label (when bbox + class id known)
//! <root>/_errors/<class>/err_<class>_<stamp>_<seq>.jpg rejected detections
//! ```

use anyhow::{anyhow, Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use crate::detect::BoundingBox;
use crate::frame::Frame;
use crate::{normalize_class_name, Timestamp};

pub const ERRORS_DIR: &str = "_errors";

/// Box center and size as fractions of the frame, each in `0..=1`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizedBox {
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl NormalizedBox {
    pub fn from_pixels(bbox: &BoundingBox, frame_width: u32, frame_height: u32) -> Option<Self> {
        if frame_width == 0 || frame_height == 0 {
            return None;
        }
        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let x1 = bbox.x1.clamp(0.0, fw);
        let x2 = bbox.x2.clamp(0.0, fw);
        let y1 = bbox.y1.clamp(0.0, fh);
        let y2 = bbox.y2.clamp(0.0, fh);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self {
            x_center: ((x1 + x2) / 2.0) / fw,
            y_center: ((y1 + y2) / 2.0) / fh,
            width: (x2 - x1) / fw,
            height: (y2 - y1) / fh,
        })
    }
}

/// One labeled image destined for retraining.
#[derive(Clone, Debug)]
pub struct TrainingSample<'a> {
    pub class_name: String,
    pub image: &'a Frame,
    pub bbox: Option<NormalizedBox>,
    pub label_correct: bool,
    pub timestamp: Timestamp,
}

/// Files produced for one sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleArtifact {
    pub image_path: PathBuf,
    pub label_path: Option<PathBuf>,
}

/// Sink for training samples.
pub trait TrainingCorpus: Send {
    /// Write one sample. `Ok(None)` when the corpus is not collecting.
    fn write_sample(&mut self, sample: &TrainingSample<'_>) -> Result<Option<SampleArtifact>>;

    /// Remove a previously written sample (used to roll back partial corrections).
    fn discard(&mut self, artifact: &SampleArtifact) -> Result<()>;
}

pub struct FilesystemCorpus {
    root: PathBuf,
    class_ids: Vec<String>,
    enabled: bool,
    seq: u64,
}

impl FilesystemCorpus {
    /// `class_ids` lists model class names by id; it is used for YOLO label files.
    pub fn new<P: Into<PathBuf>>(root: P, class_ids: Vec<String>) -> Self {
        Self {
            root: root.into(),
            class_ids,
            enabled: true,
            seq: 0,
        }
    }

    /// Corpus that logs samples instead of writing them.
    pub fn disabled<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            enabled: false,
            ..Self::new(root, Vec::new())
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn class_id(&self, class_name: &str) -> Option<usize> {
        self.class_ids
            .iter()
            .position(|name| normalize_class_name(name) == class_name)
    }

    fn folder_for(&self, class_name: &str, correct: bool) -> PathBuf {
        if correct {
            self.root.join(class_name)
        } else {
            self.root.join(ERRORS_DIR).join(class_name)
        }
    }

    /// Reserve a fresh `<base>.jpg` path; the sequence skips names already on disk.
    fn create_image_file(&mut self, folder: &Path, prefix: &str) -> Result<(fs::File, PathBuf)> {
        loop {
            self.seq += 1;
            let path = folder.join(format!("{}_{:04}.jpg", prefix, self.seq));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((file, path)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(anyhow!(err)).with_context(|| format!("create {}", path.display()))
                }
            }
        }
    }
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>> {
    let rgb = frame.to_rgb_image()?;
    let mut buf = Cursor::new(Vec::new());
    rgb.write_to(&mut buf, image::ImageFormat::Jpeg)
        .context("encode training image")?;
    Ok(buf.into_inner())
}

impl TrainingCorpus for FilesystemCorpus {
    fn write_sample(&mut self, sample: &TrainingSample<'_>) -> Result<Option<SampleArtifact>> {
        let class_name = normalize_class_name(&sample.class_name);
        if class_name.is_empty() {
            return Err(anyhow!("training sample needs a class name"));
        }
        if !self.enabled {
            log::info!(
                "TrainingCorpus: image saving disabled, dropping sample for '{}'",
                class_name
            );
            return Ok(None);
        }

        let jpeg = encode_jpeg(sample.image)?;
        let folder = self.folder_for(&class_name, sample.label_correct);
        fs::create_dir_all(&folder).with_context(|| format!("create {}", folder.display()))?;

        let prefix = format!(
            "{}_{}_{}",
            if sample.label_correct { "ok" } else { "err" },
            class_name,
            sample.timestamp.file_stamp()
        );
        let (mut file, image_path) = self.create_image_file(&folder, &prefix)?;
        if let Err(err) = file.write_all(&jpeg) {
            let _ = fs::remove_file(&image_path);
            return Err(anyhow!(err)).with_context(|| format!("write {}", image_path.display()));
        }

        let label_path = match (sample.bbox, self.class_id(&class_name)) {
            (Some(bbox), Some(class_id)) => {
                let path = image_path.with_extension("txt");
                let line = format!(
                    "{} {:.6} {:.6} {:.6} {:.6}\n",
                    class_id, bbox.x_center, bbox.y_center, bbox.width, bbox.height
                );
                if let Err(err) = fs::write(&path, line) {
                    let _ = fs::remove_file(&image_path);
                    return Err(anyhow!(err)).with_context(|| format!("write {}", path.display()));
                }
                Some(path)
            }
            _ => None,
        };

        log::info!(
            "TrainingCorpus: saved {} ({})",
            image_path.display(),
            if sample.label_correct { "correct" } else { "error" }
        );
        Ok(Some(SampleArtifact {
            image_path,
            label_path,
        }))
    }

    fn discard(&mut self, artifact: &SampleArtifact) -> Result<()> {
        fs::remove_file(&artifact.image_path)
            .with_context(|| format!("remove {}", artifact.image_path.display()))?;
        if let Some(label) = &artifact.label_path {
            fs::remove_file(label).with_context(|| format!("remove {}", label.display()))?;
        }
        Ok(())
    }
}

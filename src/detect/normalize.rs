//! Raw detector output to `DetectionRecord`s.

use crate::detect::result::{BoundingBox, DetectionRecord, RawDetectorOutput};
use crate::error::SortError;

/// Columns every flat-array row must carry: `x1 y1 x2 y2 confidence class_id`.
pub const MIN_FLAT_STRIDE: usize = 6;

/// Normalize without ever failing.
///
/// Malformed output is logged as a `DetectionBackend` error and yields no
/// detections, so a bad inference never stops the frame loop.
pub fn normalize(raw: &RawDetectorOutput) -> Vec<DetectionRecord> {
    match try_normalize(raw) {
        Ok(records) => records,
        Err(err) => {
            log::warn!("DetectionNormalizer: {}", err);
            Vec::new()
        }
    }
}

/// Normalize, reporting malformed output instead of hiding it.
///
/// Confidences are clamped to `0..=1`; boxes with non-positive width or height
/// are dropped. An empty list is a valid "nothing seen" result.
pub fn try_normalize(raw: &RawDetectorOutput) -> Result<Vec<DetectionRecord>, SortError> {
    match raw {
        RawDetectorOutput::Missing => Err(SortError::DetectionBackend(
            "detector returned no result".to_string(),
        )),
        RawDetectorOutput::Table(rows) => {
            let mut out = Vec::with_capacity(rows.len());
            for (idx, row) in rows.iter().enumerate() {
                let name = row.name.trim();
                if name.is_empty() {
                    return Err(SortError::DetectionBackend(format!(
                        "table row {} has an empty class name",
                        idx
                    )));
                }
                let coords = [row.xmin, row.ymin, row.xmax, row.ymax];
                out.extend(build_record(name.to_string(), row.confidence, coords, idx)?);
            }
            Ok(out)
        }
        RawDetectorOutput::FlatArray {
            values,
            stride,
            names,
        } => {
            if *stride < MIN_FLAT_STRIDE {
                return Err(SortError::DetectionBackend(format!(
                    "flat array stride {} is below {}",
                    stride, MIN_FLAT_STRIDE
                )));
            }
            if values.len() % stride != 0 {
                return Err(SortError::DetectionBackend(format!(
                    "flat array of {} values is not a multiple of stride {}",
                    values.len(),
                    stride
                )));
            }
            let mut out = Vec::with_capacity(values.len() / stride);
            for (idx, row) in values.chunks_exact(*stride).enumerate() {
                let class_id = flat_class_id(row[5], idx)?;
                let class_name = class_name_for(class_id, names.as_deref());
                out.extend(build_record(
                    class_name,
                    row[4],
                    [row[0], row[1], row[2], row[3]],
                    idx,
                )?);
            }
            Ok(out)
        }
        RawDetectorOutput::Boxes { boxes, names } => {
            let mut out = Vec::with_capacity(boxes.len());
            for (idx, raw_box) in boxes.iter().enumerate() {
                let class_name = class_name_for(raw_box.class_id, names.as_deref());
                out.extend(build_record(class_name, raw_box.confidence, raw_box.xyxy, idx)?);
            }
            Ok(out)
        }
    }
}

fn build_record(
    class_name: String,
    confidence: f32,
    coords: [f32; 4],
    idx: usize,
) -> Result<Option<DetectionRecord>, SortError> {
    if !confidence.is_finite() || coords.iter().any(|v| !v.is_finite()) {
        return Err(SortError::DetectionBackend(format!(
            "row {} contains non-finite values",
            idx
        )));
    }
    let Some(bbox) = BoundingBox::new(coords[0], coords[1], coords[2], coords[3]) else {
        log::debug!(
            "DetectionNormalizer: dropping degenerate box for '{}' (row {})",
            class_name,
            idx
        );
        return Ok(None);
    };
    Ok(Some(DetectionRecord {
        class_name,
        confidence: confidence.clamp(0.0, 1.0),
        bbox,
    }))
}

fn flat_class_id(value: f32, idx: usize) -> Result<u32, SortError> {
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u32::MAX as f32 {
        return Err(SortError::DetectionBackend(format!(
            "row {} has invalid class id {}",
            idx, value
        )));
    }
    Ok(value as u32)
}

fn class_name_for(class_id: u32, names: Option<&[String]>) -> String {
    names
        .and_then(|names| names.get(class_id as usize))
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| class_id.to_string())
}

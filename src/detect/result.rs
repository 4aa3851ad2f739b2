/// Canonical detection seen by the rest of the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionRecord {
    pub class_name: String,
    /// Always within `0.0..=1.0`.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Axis-aligned box in pixel coordinates with `x1 < x2` and `y1 < y2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Returns `None` for non-finite coordinates or non-positive width/height.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
        let finite = [x1, y1, x2, y2].iter().all(|v| v.is_finite());
        if !finite || x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Self { x1, y1, x2, y2 })
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Backend-specific detector output, before normalization.
///
/// Backends differ in how they expose boxes; normalization matches on this
/// exhaustively so every shape is handled in one place.
#[derive(Clone, Debug, PartialEq)]
pub enum RawDetectorOutput {
    /// Named rows, one per box (dataframe-style exports).
    Table(Vec<TableRow>),
    /// Row-major numeric matrix. Each row starts with
    /// `[x1, y1, x2, y2, confidence, class_id]`; extra columns are ignored.
    FlatArray {
        values: Vec<f32>,
        stride: usize,
        names: Option<Vec<String>>,
    },
    /// Structured boxes carrying numeric class ids.
    Boxes {
        boxes: Vec<RawBox>,
        names: Option<Vec<String>>,
    },
    /// The backend produced no result object at all.
    Missing,
}

impl RawDetectorOutput {
    pub fn empty() -> Self {
        RawDetectorOutput::Table(Vec::new())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableRow {
    pub name: String,
    pub confidence: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RawBox {
    pub class_id: u32,
    pub confidence: f32,
    pub xyxy: [f32; 4],
}

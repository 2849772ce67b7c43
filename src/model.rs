//! Collaborator capabilities consumed by the single-object tracker.

use std::collections::BTreeMap;

use nalgebra as na;

use crate::error::{Error, Result};
use crate::geometry::{BBox, Point, Size};
use crate::occlusion::DepthHistogram;

/// Single-channel image, `rows x cols` = height x width.
pub type Frame = na::DMatrix<f32>;

/// Feature channels extracted from one window.
pub type Features = Vec<na::DMatrix<f32>>;

/// Image channel identifier. The first modality in order is the primary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Modality {
    Color,
    Depth,
}

/// Co-registered frames of one tick, keyed by modality.
#[derive(Debug, Clone, Default)]
pub struct Frames {
    frames: BTreeMap<Modality, Frame>,
}

impl Frames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rgbd(color: Frame, depth: Frame) -> Self {
        let mut frames = Self::new();
        frames.insert(Modality::Color, color);
        frames.insert(Modality::Depth, depth);
        frames
    }

    pub fn insert(&mut self, modality: Modality, frame: Frame) {
        self.frames.insert(modality, frame);
    }

    pub fn get(&self, modality: Modality) -> Result<&Frame> {
        self.frames
            .get(&modality)
            .ok_or(Error::MissingModality(modality))
    }

    pub fn modalities(&self) -> impl Iterator<Item = Modality> + '_ {
        self.frames.keys().copied()
    }

    pub fn primary(&self) -> Option<Modality> {
        self.frames.keys().next().copied()
    }

    /// `(cols, rows)` of the primary frame.
    pub fn dimensions(&self) -> Option<(usize, usize)> {
        self.frames.values().next().map(|f| (f.ncols(), f.nrows()))
    }
}

/// New geometry produced by a scale estimate. Applied as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleChange {
    pub target_size: Size,
    pub window_size: Size,
    /// Desired filter response over the window.
    pub filter_response: na::DMatrix<f32>,
    /// Per-pixel weighting mask over the window.
    pub cosine_window: na::DMatrix<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectResult {
    pub position: Point,
    /// Peak response in `[0, 1]`.
    pub response: f32,
}

pub trait FeatureExtractor: Send + Sync {
    fn features(&self, frame: &Frame, window: &BBox) -> Result<Features>;
}

/// Owns the fusion policy between modalities.
pub trait FeatureChannelProcessor: Send + Sync {
    fn combine_features(&self, features: BTreeMap<Modality, Features>)
        -> BTreeMap<Modality, Features>;

    fn combine_positions(&self, positions: &BTreeMap<Modality, Point>) -> Point;
}

pub trait AppearanceModel: Send + Sync {
    fn init(&mut self, frame: &Frame, features: &Features, position: Point) -> Result<()>;

    fn detect(
        &self,
        frame: &Frame,
        features: &Features,
        position: Point,
        target_depth: f32,
        target_std: f32,
    ) -> Result<DetectResult>;

    fn update(&mut self, frame: &Frame, features: &Features, position: Point) -> Result<()>;

    fn apply_scale_change(&mut self, change: &ScaleChange);
}

pub trait DepthOcclusionModel: Send + Sync {
    fn init(&mut self, frame: &Frame, bbox: &BBox);

    /// Re-samples the histogram at `bbox`; returns the object bin index.
    fn update(&mut self, frame: &Frame, bbox: &BBox) -> usize;

    fn histogram(&self) -> &DepthHistogram;

    fn target_depth(&self) -> f32;

    fn target_std(&self) -> f32;
}

pub trait ScaleEstimator: Send + Sync {
    /// Resets the estimator at `bbox` and returns the initial geometry.
    fn init(&mut self, frame: &Frame, bbox: &BBox) -> ScaleChange;

    /// Returns new geometry only when the scale changed.
    fn update(&mut self, frame: &Frame, window: &BBox) -> Option<ScaleChange>;

    fn scale_factor(&self) -> f32;
}

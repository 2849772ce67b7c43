//! Simple, deterministic implementations of every collaborator capability.
//!
//! These are not correlation filters: the appearance model is a normalized
//! cross-correlation template search and features are raw, mean-removed pixel
//! patches. They are enough to drive the trackers end to end.

use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::sync::Arc;

use nalgebra as na;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::{window_shape, BBox, Point, Size};
use crate::model::{
    AppearanceModel, DepthOcclusionModel, DetectResult, FeatureChannelProcessor,
    FeatureExtractor, Features, Frame, Modality, ScaleChange, ScaleEstimator,
};
use crate::occlusion::{DepthHistogram, OcclusionKwargs};
use crate::timing::TimingObserver;
use crate::tracker::SingleObjectTracker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineKwargs {
    /// Template interpolation factor of `TemplateModel::update`.
    pub learning_rate: f32,
    /// Largest shift, in pixels, searched by `TemplateModel::detect`.
    pub search_radius: usize,
    /// Search window = target size * (1 + padding).
    pub padding: f32,
    /// Depth units covered by one histogram bin.
    pub bin_width: f32,
    /// Readings above this are treated as invalid; 16-bit sensor range.
    pub max_depth: f32,
    pub scale_step: f32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl Default for BaselineKwargs {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            search_radius: 4,
            padding: 1.5,
            bin_width: 100.,
            max_depth: DEFAULT_MAX_DEPTH,
            scale_step: 0.1,
            min_scale: 0.5,
            max_scale: 2.0,
        }
    }
}

pub const DEFAULT_MAX_DEPTH: f32 = 65535.;

/// Color + depth tracker assembled from the baseline collaborators.
pub fn single_object_tracker(
    kwargs: &BaselineKwargs,
    occlusion: OcclusionKwargs,
    timings: Arc<dyn TimingObserver>,
) -> SingleObjectTracker {
    let mut models: BTreeMap<Modality, Box<dyn AppearanceModel>> = BTreeMap::new();
    for modality in [Modality::Color, Modality::Depth] {
        models.insert(
            modality,
            Box::new(TemplateModel::new(kwargs.learning_rate, kwargs.search_radius)),
        );
    }

    SingleObjectTracker::new(
        Arc::new(PatchExtractor),
        Arc::new(IndependentChannels),
        Box::new(DepthBinSegmenter::new(kwargs.bin_width, kwargs.max_depth)),
        Box::new(
            DepthScaleEstimator::new(
                kwargs.padding,
                kwargs.scale_step,
                kwargs.min_scale,
                kwargs.max_scale,
            )
            .with_max_depth(kwargs.max_depth),
        ),
        models,
    )
    .with_kwargs(occlusion)
    .with_timings(timings)
}

fn sample(frame: &Frame, row: i64, col: i64) -> f32 {
    let r = row.max(0).min(frame.nrows() as i64 - 1) as usize;
    let c = col.max(0).min(frame.ncols() as i64 - 1) as usize;
    frame[(r, c)]
}

/// Mean-removed pixel patch over the window; borders are replicated.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchExtractor;

impl FeatureExtractor for PatchExtractor {
    fn features(&self, frame: &Frame, window: &BBox) -> Result<Features> {
        if frame.is_empty() {
            return Err(Error::FeatureExtraction("empty frame".to_string()));
        }

        let (rows, cols) = window_shape(&window.size());
        let x0 = window.x.round() as i64;
        let y0 = window.y.round() as i64;

        let mut patch =
            na::DMatrix::from_fn(rows, cols, |r, c| sample(frame, y0 + r as i64, x0 + c as i64));
        let mean = patch.mean();
        patch.add_scalar_mut(-mean);

        Ok(vec![patch])
    }
}

fn mean_position(positions: &BTreeMap<Modality, Point>) -> Point {
    if positions.is_empty() {
        return Point::origin();
    }

    let sum = positions
        .values()
        .fold(na::Vector2::zeros(), |acc, p| acc + p.coords);
    Point::from(sum / positions.len() as f32)
}

/// Keeps one channel set per modality; positions are averaged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IndependentChannels;

impl FeatureChannelProcessor for IndependentChannels {
    fn combine_features(
        &self,
        features: BTreeMap<Modality, Features>,
    ) -> BTreeMap<Modality, Features> {
        features
    }

    fn combine_positions(&self, positions: &BTreeMap<Modality, Point>) -> Point {
        mean_position(positions)
    }
}

/// Stacks every modality's channels under the primary modality.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConcatenatedChannels;

impl FeatureChannelProcessor for ConcatenatedChannels {
    fn combine_features(
        &self,
        features: BTreeMap<Modality, Features>,
    ) -> BTreeMap<Modality, Features> {
        let primary = match features.keys().next() {
            Some(m) => *m,
            None => return features,
        };
        let stacked = features.into_values().flatten().collect::<Vec<_>>();

        BTreeMap::from([(primary, stacked)])
    }

    fn combine_positions(&self, positions: &BTreeMap<Modality, Point>) -> Point {
        mean_position(positions)
    }
}

/// Normalized cross-correlation template matcher.
#[derive(Debug, Clone)]
pub struct TemplateModel {
    learning_rate: f32,
    search_radius: usize,
    window: Option<(usize, usize)>,
    template: Option<Features>,
}

impl TemplateModel {
    pub fn new(learning_rate: f32, search_radius: usize) -> Self {
        Self {
            learning_rate,
            search_radius,
            window: None,
            template: None,
        }
    }

    /// Correlation of the template with `features` displaced by `(dx, dy)`,
    /// over the overlapping region.
    fn correlate(template: &Features, features: &Features, dx: i64, dy: i64) -> f64 {
        let mut cross = 0.;
        let mut tt = 0.;
        let mut ff = 0.;

        for (t, f) in template.iter().zip(features.iter()) {
            let (rows, cols) = (t.nrows() as i64, t.ncols() as i64);
            for r in 0i64.max(-dy)..rows.min(rows - dy) {
                for c in 0i64.max(-dx)..cols.min(cols - dx) {
                    let a = t[(r as usize, c as usize)] as f64;
                    let b = f[((r + dy) as usize, (c + dx) as usize)] as f64;
                    cross += a * b;
                    tt += a * a;
                    ff += b * b;
                }
            }
        }

        let norm = (tt * ff).sqrt();
        if norm <= f64::EPSILON {
            return 0.;
        }
        cross / norm
    }

    fn check_shape(template: &Features, features: &Features) -> Result<()> {
        let expected = template.first().map(|t| t.shape()).unwrap_or((0, 0));
        let matches = template.len() == features.len()
            && template
                .iter()
                .zip(features.iter())
                .all(|(t, f)| t.shape() == f.shape());

        if matches {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected,
                actual: features.first().map(|f| f.shape()).unwrap_or((0, 0)),
            })
        }
    }
}

impl AppearanceModel for TemplateModel {
    fn init(&mut self, _frame: &Frame, features: &Features, _position: Point) -> Result<()> {
        self.template = Some(features.clone());
        Ok(())
    }

    fn detect(
        &self,
        _frame: &Frame,
        features: &Features,
        position: Point,
        _target_depth: f32,
        _target_std: f32,
    ) -> Result<DetectResult> {
        let template = self.template.as_ref().ok_or(Error::NotInitialized)?;
        Self::check_shape(template, features)?;

        let radius = self.search_radius as i64;
        let mut best = (0, 0, Self::correlate(template, features, 0, 0));
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let s = Self::correlate(template, features, dx, dy);
                if s > best.2 + 1e-6 {
                    best = (dx, dy, s);
                }
            }
        }

        Ok(DetectResult {
            position: Point::new(position.x + best.0 as f32, position.y + best.1 as f32),
            response: best.2.max(0.).min(1.) as f32,
        })
    }

    fn update(&mut self, _frame: &Frame, features: &Features, _position: Point) -> Result<()> {
        let rate = self.learning_rate;
        let resized = self
            .window
            .map(|w| features.first().map(|f| f.shape()) != Some(w))
            .unwrap_or(false);

        let blend = !resized
            && self
                .template
                .as_ref()
                .map(|t| Self::check_shape(t, features).is_ok())
                .unwrap_or(false);

        match self.template.as_mut() {
            Some(template) if blend => {
                for (t, f) in template.iter_mut().zip(features.iter()) {
                    *t = &*t * (1. - rate) + f * rate;
                }
            }
            _ => self.template = Some(features.clone()),
        }

        Ok(())
    }

    fn apply_scale_change(&mut self, change: &ScaleChange) {
        self.window = Some(window_shape(&change.window_size));
    }
}

/// Finite readings in `(0, max_depth]` inside `bbox`.
fn valid_depths(frame: &Frame, bbox: &BBox, max_depth: f32) -> Vec<f32> {
    let r0 = bbox.y.max(0.).floor() as usize;
    let c0 = bbox.x.max(0.).floor() as usize;
    let r1 = (bbox.bottom().ceil().max(0.) as usize).min(frame.nrows());
    let c1 = (bbox.right().ceil().max(0.) as usize).min(frame.ncols());

    let mut out = Vec::new();
    for r in r0..r1 {
        for c in c0..c1 {
            let d = frame[(r, c)];
            if d.is_finite() && d > 0. && d <= max_depth {
                out.push(d);
            }
        }
    }
    out
}

fn median(values: &[f32]) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    Some(sorted[sorted.len() / 2])
}

fn mean_std(values: &[f32]) -> (f32, f32) {
    if values.is_empty() {
        return (0., 0.);
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    (mean, var.sqrt())
}

/// Fixed-width depth histogram; the object bin follows the target depth.
#[derive(Debug, Clone)]
pub struct DepthBinSegmenter {
    bin_width: f32,
    max_depth: f32,
    histogram: DepthHistogram,
    target_depth: f32,
    target_std: f32,
}

impl DepthBinSegmenter {
    pub fn new(bin_width: f32, max_depth: f32) -> Self {
        Self {
            bin_width: bin_width.max(f32::EPSILON),
            max_depth: max_depth.max(0.),
            histogram: DepthHistogram::default(),
            target_depth: 0.,
            target_std: 0.,
        }
    }

    /// Bin index, never past the bin holding `max_depth`.
    fn bin_of(&self, depth: f32) -> usize {
        (depth.min(self.max_depth) / self.bin_width).floor().max(0.) as usize
    }

    /// At least `min_len` bins, so the object bin always exists.
    fn build(&self, depths: &[f32], min_len: usize) -> DepthHistogram {
        let len = depths
            .iter()
            .map(|d| self.bin_of(*d) + 1)
            .max()
            .unwrap_or(0)
            .max(min_len);
        let mut bins = vec![0.; len];
        for d in depths {
            bins[self.bin_of(*d)] += 1.;
        }
        DepthHistogram::new(bins)
    }
}

impl DepthOcclusionModel for DepthBinSegmenter {
    fn init(&mut self, frame: &Frame, bbox: &BBox) {
        let depths = valid_depths(frame, bbox, self.max_depth);
        let (_, std) = mean_std(&depths);

        self.target_depth = median(&depths).unwrap_or(0.);
        self.target_std = std;
        self.histogram = self.build(&depths, self.bin_of(self.target_depth) + 1);
    }

    fn update(&mut self, frame: &Frame, bbox: &BBox) -> usize {
        let depths = valid_depths(frame, bbox, self.max_depth);
        let object_bin = self.bin_of(self.target_depth);
        self.histogram = self.build(&depths, object_bin + 1);

        let lo = object_bin.saturating_sub(1) as f32 * self.bin_width;
        let hi = (object_bin + 2) as f32 * self.bin_width;
        let near = depths
            .into_iter()
            .filter(|d| *d >= lo && *d < hi)
            .collect::<Vec<_>>();
        if !near.is_empty() {
            let (mean, std) = mean_std(&near);
            self.target_depth = mean;
            self.target_std = std;
        }

        object_bin
    }

    fn histogram(&self) -> &DepthHistogram {
        &self.histogram
    }

    fn target_depth(&self) -> f32 {
        self.target_depth
    }

    fn target_std(&self) -> f32 {
        self.target_std
    }
}

pub fn hann_window(rows: usize, cols: usize) -> na::DMatrix<f32> {
    fn hann(n: usize, i: usize) -> f32 {
        if n <= 1 {
            1.
        } else {
            0.5 - 0.5 * (2. * PI * i as f32 / (n - 1) as f32).cos()
        }
    }

    na::DMatrix::from_fn(rows, cols, |r, c| hann(rows, r) * hann(cols, c))
}

pub fn gaussian_response(rows: usize, cols: usize, sigma: f32) -> na::DMatrix<f32> {
    let sigma = sigma.max(f32::EPSILON);
    let (cy, cx) = ((rows / 2) as f32, (cols / 2) as f32);

    na::DMatrix::from_fn(rows, cols, |r, c| {
        let d2 = (r as f32 - cy).powi(2) + (c as f32 - cx).powi(2);
        (-0.5 * d2 / (sigma * sigma)).exp()
    })
}

/// Scale from the ratio of initial to current target depth, quantized to
/// `step`.
#[derive(Debug, Clone)]
pub struct DepthScaleEstimator {
    padding: f32,
    step: f32,
    min_scale: f32,
    max_scale: f32,
    max_depth: f32,
    initial_size: Size,
    initial_depth: Option<f32>,
    scale: f32,
}

impl DepthScaleEstimator {
    pub fn new(padding: f32, step: f32, min_scale: f32, max_scale: f32) -> Self {
        Self {
            padding,
            step: step.max(f32::EPSILON),
            min_scale,
            max_scale,
            max_depth: DEFAULT_MAX_DEPTH,
            initial_size: Size::zeros(),
            initial_depth: None,
            scale: 1.,
        }
    }

    pub fn with_max_depth(mut self, max_depth: f32) -> Self {
        self.max_depth = max_depth;
        self
    }

    fn geometry(&self) -> ScaleChange {
        let target_size = self.initial_size * self.scale;
        let window_size = target_size * (1. + self.padding);
        let (rows, cols) = window_shape(&window_size);
        let sigma = (target_size.x * target_size.y).max(0.).sqrt() * 0.1;

        ScaleChange {
            target_size,
            window_size,
            filter_response: gaussian_response(rows, cols, sigma),
            cosine_window: hann_window(rows, cols),
        }
    }
}

impl ScaleEstimator for DepthScaleEstimator {
    fn init(&mut self, frame: &Frame, bbox: &BBox) -> ScaleChange {
        self.initial_size = bbox.size();
        self.initial_depth = median(&valid_depths(frame, bbox, self.max_depth));
        self.scale = 1.;
        self.geometry()
    }

    fn update(&mut self, frame: &Frame, window: &BBox) -> Option<ScaleChange> {
        let initial = self.initial_depth?;
        let target = BBox::from_center_size(window.center(), self.initial_size * self.scale);
        let current = median(&valid_depths(frame, &target, self.max_depth))?;

        let raw = initial / current;
        let quantized = ((raw / self.step).round() * self.step)
            .max(self.min_scale)
            .min(self.max_scale);

        if (quantized - self.scale).abs() < self.step / 2. {
            return None;
        }

        self.scale = quantized;
        Some(self.geometry())
    }

    fn scale_factor(&self) -> f32 {
        self.scale
    }
}

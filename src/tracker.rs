use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use nalgebra as na;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::geometry::{clamp_center, BBox, Point, Size};
use crate::model::{
    AppearanceModel, DepthOcclusionModel, FeatureChannelProcessor, FeatureExtractor, Features,
    Frames, Modality, ScaleChange, ScaleEstimator,
};
use crate::occlusion::{OcclusionKwargs, OcclusionSignals};
use crate::timing::{timed, NoopTimings, Stage, TimingObserver};

/// Modality whose frame drives the depth histogram and the scale estimate.
const DEPTH: Modality = Modality::Depth;

/// Per-target view used by the lifecycle manager.
pub trait Tracker: Send {
    /// Locates the target near `bbox` in the new frames.
    fn detect(&mut self, frames: &Frames, bbox: &BBox) -> Result<BBox>;

    /// Appearance similarity of the target with `bbox`, in `[0, 1]`. No state
    /// changes.
    fn score(&self, frames: &Frames, bbox: &BBox) -> Result<f32>;

    /// Adapts the appearance model to the target at `bbox`.
    fn update(&mut self, frames: &Frames, bbox: &BBox) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetGeometry {
    pub position: Point,
    pub target_size: Size,
    pub window_size: Size,
    pub filter_response: na::DMatrix<f32>,
    pub cosine_window: na::DMatrix<f32>,
    pub initial_size: Size,
    pub scale_factor: f32,
}

impl TargetGeometry {
    fn new(bbox: &BBox, change: &ScaleChange, scale_factor: f32) -> Self {
        Self {
            position: bbox.center(),
            target_size: change.target_size,
            window_size: change.window_size,
            filter_response: change.filter_response.clone(),
            cosine_window: change.cosine_window.clone(),
            initial_size: bbox.size(),
            scale_factor,
        }
    }

    fn apply(&mut self, change: &ScaleChange) {
        self.target_size = change.target_size;
        self.window_size = change.window_size;
        self.filter_response = change.filter_response.clone();
        self.cosine_window = change.cosine_window.clone();
    }

    /// Size of the box reported by `detect`.
    pub fn scaled_size(&self) -> Size {
        self.initial_size * self.scale_factor
    }
}

/// Tracks one target with one appearance model per fused modality channel and
/// depth-based occlusion signals.
pub struct SingleObjectTracker {
    kwargs: OcclusionKwargs,
    extractor: Arc<dyn FeatureExtractor>,
    processor: Arc<dyn FeatureChannelProcessor>,
    depth: Box<dyn DepthOcclusionModel>,
    scale: Box<dyn ScaleEstimator>,
    models: BTreeMap<Modality, Box<dyn AppearanceModel>>,
    geometry: Option<TargetGeometry>,
    signals: OcclusionSignals,
    timings: Arc<dyn TimingObserver>,
}

impl SingleObjectTracker {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        processor: Arc<dyn FeatureChannelProcessor>,
        depth: Box<dyn DepthOcclusionModel>,
        scale: Box<dyn ScaleEstimator>,
        models: BTreeMap<Modality, Box<dyn AppearanceModel>>,
    ) -> Self {
        Self {
            kwargs: OcclusionKwargs::default(),
            extractor,
            processor,
            depth,
            scale,
            models,
            geometry: None,
            signals: OcclusionSignals::default(),
            timings: Arc::new(NoopTimings),
        }
    }

    pub fn with_kwargs(mut self, kwargs: OcclusionKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_timings(mut self, timings: Arc<dyn TimingObserver>) -> Self {
        self.timings = timings;
        self
    }

    pub fn geometry(&self) -> Option<&TargetGeometry> {
        self.geometry.as_ref()
    }

    /// Signals computed by the last `detect`. They do not gate its result.
    pub fn occlusion(&self) -> &OcclusionSignals {
        &self.signals
    }

    pub fn init(&mut self, frames: &Frames, bbox: &BBox) -> Result<()> {
        let depth_frame = frames.get(DEPTH)?;
        self.depth.init(depth_frame, bbox);
        let change = self.scale.init(depth_frame, bbox);

        self.geometry = Some(TargetGeometry::new(bbox, &change, self.scale.scale_factor()));
        for model in self.models.values_mut() {
            model.apply_scale_change(&change);
        }
        self.signals = OcclusionSignals::default();

        let position = bbox.center();
        let features = self.fused_features(frames, position)?;
        for (modality, f) in features.iter() {
            let frame = frames.get(*modality)?;
            model_mut(&mut self.models, *modality)?.init(frame, f, position)?;
        }

        debug!("initialised target at {:?}", bbox);
        Ok(())
    }

    /// Appearance response of the primary fused channel at `position`.
    pub fn score(&self, frames: &Frames, position: Point) -> Result<f32> {
        let features = self.fused_features(frames, position)?;
        let (modality, f) = features
            .iter()
            .next()
            .ok_or_else(|| Error::AppearanceModel("no fused feature channel".to_string()))?;

        let result = model(&self.models, *modality)?.detect(
            frames.get(*modality)?,
            f,
            position,
            self.depth.target_depth(),
            self.depth.target_std(),
        )?;

        Ok(result.response.max(0.).min(1.))
    }

    pub fn detect(&mut self, frames: &Frames, position: Point) -> Result<BBox> {
        let features = timed(self.timings.as_ref(), Stage::FeatureExtraction, || {
            self.fused_features(frames, position)
        })?;

        let (positions, responses) = timed(self.timings.as_ref(), Stage::AppearanceDetect, || {
            let mut positions = BTreeMap::new();
            let mut responses = Vec::with_capacity(features.len());

            for (modality, f) in features.iter() {
                let result = model(&self.models, *modality)?.detect(
                    frames.get(*modality)?,
                    f,
                    position,
                    self.depth.target_depth(),
                    self.depth.target_std(),
                )?;
                positions.insert(*modality, result.position);
                responses.push(result.response);
            }

            Ok::<_, Error>((positions, responses))
        })?;

        let estimate = self.processor.combine_positions(&positions);
        let scale_factor = self.scale.scale_factor();
        let size = self.geometry_or_err()?.initial_size * scale_factor;

        let (cols, rows) = frames
            .dimensions()
            .ok_or(Error::MissingModality(Modality::Color))?;
        let estimate = clamp_center(estimate, size, cols, rows);
        let bbox = BBox::from_center_size(estimate, size);

        let depth_frame = frames.get(DEPTH)?;
        let depth = &mut self.depth;
        let bin = timed(self.timings.as_ref(), Stage::DepthUpdate, || {
            depth.update(depth_frame, &bbox)
        });

        let max_response = responses
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map(|r| r.0)
            .unwrap_or(0.);
        self.signals = OcclusionSignals::evaluate(
            &self.kwargs,
            self.depth.histogram(),
            bin,
            max_response as f64,
        );

        if self.signals.occluded {
            debug!(
                "target at {:?} looks occluded (ratio {:.2}, response {:.2})",
                bbox, self.signals.occluder_ratio, max_response
            );
        }

        if let Some(geometry) = self.geometry.as_mut() {
            geometry.position = estimate;
            geometry.scale_factor = scale_factor;
        }

        trace!("detect {:?} -> {:?}", position, bbox);
        Ok(bbox)
    }

    pub fn update(&mut self, frames: &Frames, position: Point) -> Result<()> {
        let window = BBox::from_center_size(position, self.geometry_or_err()?.window_size);
        let depth_frame = frames.get(DEPTH)?;

        let scale = &mut self.scale;
        let change = timed(self.timings.as_ref(), Stage::ScaleUpdate, || {
            scale.update(depth_frame, &window)
        });
        if let Some(change) = change {
            debug!(
                "scale changed to {:.2}, target size {:?}",
                self.scale.scale_factor(),
                change.target_size
            );
            self.apply_scale_change(&change);
        }

        let features = timed(self.timings.as_ref(), Stage::FeatureExtraction, || {
            self.fused_features(frames, position)
        })?;

        let models = &mut self.models;
        timed(self.timings.as_ref(), Stage::ModelUpdate, || {
            for (modality, f) in features.iter() {
                model_mut(models, *modality)?.update(frames.get(*modality)?, f, position)?;
            }
            Ok::<_, Error>(())
        })?;

        let scale_factor = self.scale.scale_factor();
        if let Some(geometry) = self.geometry.as_mut() {
            geometry.position = position;
            geometry.scale_factor = scale_factor;
        }

        Ok(())
    }

    /// Replaces target size, window size, filter response and cosine window
    /// in one step, here and in every appearance model.
    pub fn apply_scale_change(&mut self, change: &ScaleChange) {
        if let Some(geometry) = self.geometry.as_mut() {
            geometry.apply(change);
        }
        for model in self.models.values_mut() {
            model.apply_scale_change(change);
        }
    }

    fn geometry_or_err(&self) -> Result<&TargetGeometry> {
        self.geometry.as_ref().ok_or(Error::NotInitialized)
    }

    /// Extracts weighted features for every modality in parallel, then fuses
    /// them once all extractions are done.
    fn fused_features(
        &self,
        frames: &Frames,
        position: Point,
    ) -> Result<BTreeMap<Modality, Features>> {
        let geometry = self.geometry_or_err()?;
        let window = BBox::from_center_size(position, geometry.window_size);
        let cosine_window = &geometry.cosine_window;
        let extractor = &self.extractor;

        let modalities = frames.modalities().collect::<Vec<_>>();
        let extracted = modalities
            .par_iter()
            .map(|&modality| -> Result<(Modality, Features)> {
                let mut features = extractor.features(frames.get(modality)?, &window)?;
                weight_features(&mut features, cosine_window)?;
                Ok((modality, features))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(self.processor.combine_features(extracted))
    }
}

impl Tracker for SingleObjectTracker {
    fn detect(&mut self, frames: &Frames, bbox: &BBox) -> Result<BBox> {
        SingleObjectTracker::detect(self, frames, bbox.center())
    }

    fn score(&self, frames: &Frames, bbox: &BBox) -> Result<f32> {
        SingleObjectTracker::score(self, frames, bbox.center())
    }

    fn update(&mut self, frames: &Frames, bbox: &BBox) -> Result<()> {
        SingleObjectTracker::update(self, frames, bbox.center())
    }
}

fn model<'a>(
    models: &'a BTreeMap<Modality, Box<dyn AppearanceModel>>,
    modality: Modality,
) -> Result<&'a dyn AppearanceModel> {
    models
        .get(&modality)
        .map(|m| m.as_ref())
        .ok_or_else(|| Error::AppearanceModel(format!("no model for {:?}", modality)))
}

fn model_mut(
    models: &mut BTreeMap<Modality, Box<dyn AppearanceModel>>,
    modality: Modality,
) -> Result<&mut Box<dyn AppearanceModel>> {
    models
        .get_mut(&modality)
        .ok_or_else(|| Error::AppearanceModel(format!("no model for {:?}", modality)))
}

/// Multiplies every channel by the cosine window.
fn weight_features(features: &mut Features, cosine_window: &na::DMatrix<f32>) -> Result<()> {
    for channel in features.iter_mut() {
        if channel.shape() != cosine_window.shape() {
            return Err(Error::ShapeMismatch {
                expected: cosine_window.shape(),
                actual: channel.shape(),
            });
        }
        channel.component_mul_assign(cosine_window);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use approx::assert_relative_eq;

    use crate::baseline::IndependentChannels;
    use crate::geometry::window_shape;
    use crate::model::{DetectResult, Frame};
    use crate::occlusion::DepthHistogram;

    fn change(target: Size) -> ScaleChange {
        let window_size = target * 2.;
        let (rows, cols) = window_shape(&window_size);
        ScaleChange {
            target_size: target,
            window_size,
            filter_response: na::DMatrix::zeros(rows, cols),
            cosine_window: na::DMatrix::from_element(rows, cols, 1.),
        }
    }

    struct OnesExtractor;

    impl FeatureExtractor for OnesExtractor {
        fn features(&self, _frame: &Frame, window: &BBox) -> Result<Features> {
            let (rows, cols) = window_shape(&window.size());
            Ok(vec![na::DMatrix::from_element(rows, cols, 1.)])
        }
    }

    #[derive(Default)]
    struct Calls {
        scale_changes: AtomicUsize,
        updates: AtomicUsize,
    }

    struct ShiftModel {
        shift: (f32, f32),
        response: f32,
        fail: bool,
        calls: Arc<Calls>,
    }

    impl AppearanceModel for ShiftModel {
        fn init(&mut self, _frame: &Frame, _features: &Features, _position: Point) -> Result<()> {
            Ok(())
        }

        fn detect(
            &self,
            _frame: &Frame,
            _features: &Features,
            position: Point,
            _target_depth: f32,
            _target_std: f32,
        ) -> Result<DetectResult> {
            if self.fail {
                return Err(Error::AppearanceModel("broken".to_string()));
            }
            Ok(DetectResult {
                position: Point::new(position.x + self.shift.0, position.y + self.shift.1),
                response: self.response,
            })
        }

        fn update(&mut self, _frame: &Frame, _features: &Features, _position: Point) -> Result<()> {
            self.calls.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn apply_scale_change(&mut self, _change: &ScaleChange) {
            self.calls.scale_changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedDepth {
        histogram: DepthHistogram,
        bin: usize,
    }

    impl DepthOcclusionModel for FixedDepth {
        fn init(&mut self, _frame: &Frame, _bbox: &BBox) {}

        fn update(&mut self, _frame: &Frame, _bbox: &BBox) -> usize {
            self.bin
        }

        fn histogram(&self) -> &DepthHistogram {
            &self.histogram
        }

        fn target_depth(&self) -> f32 {
            1000.
        }

        fn target_std(&self) -> f32 {
            10.
        }
    }

    struct ScriptedScale {
        scale: f32,
        next: Option<(f32, ScaleChange)>,
    }

    impl ScaleEstimator for ScriptedScale {
        fn init(&mut self, _frame: &Frame, bbox: &BBox) -> ScaleChange {
            self.scale = 1.;
            change(bbox.size())
        }

        fn update(&mut self, _frame: &Frame, _window: &BBox) -> Option<ScaleChange> {
            let (scale, change) = self.next.take()?;
            self.scale = scale;
            Some(change)
        }

        fn scale_factor(&self) -> f32 {
            self.scale
        }
    }

    struct Setup {
        shifts: [(f32, f32); 2],
        response: f32,
        fail: bool,
        histogram: Vec<f64>,
        bin: usize,
        next_scale: Option<(f32, ScaleChange)>,
    }

    impl Default for Setup {
        fn default() -> Self {
            Self {
                shifts: [(0., 0.), (0., 0.)],
                response: 0.9,
                fail: false,
                histogram: vec![0., 0., 100.],
                bin: 2,
                next_scale: None,
            }
        }
    }

    fn build(setup: Setup) -> (SingleObjectTracker, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let mut models: BTreeMap<Modality, Box<dyn AppearanceModel>> = BTreeMap::new();
        for (modality, shift) in [Modality::Color, Modality::Depth].iter().zip(setup.shifts) {
            models.insert(
                *modality,
                Box::new(ShiftModel {
                    shift,
                    response: setup.response,
                    fail: setup.fail,
                    calls: calls.clone(),
                }),
            );
        }

        let tracker = SingleObjectTracker::new(
            Arc::new(OnesExtractor),
            Arc::new(IndependentChannels),
            Box::new(FixedDepth {
                histogram: DepthHistogram::from(setup.histogram),
                bin: setup.bin,
            }),
            Box::new(ScriptedScale {
                scale: 1.,
                next: setup.next_scale,
            }),
            models,
        );

        (tracker, calls)
    }

    fn frames() -> Frames {
        Frames::rgbd(Frame::zeros(100, 100), Frame::zeros(100, 100))
    }

    #[test]
    fn test_detect_fuses_positions() {
        let (mut tracker, _) = build(Setup {
            shifts: [(2., 0.), (4., -2.)],
            ..Default::default()
        });
        let frames = frames();
        let bbox = BBox::new(40., 40., 10., 10.);

        tracker.init(&frames, &bbox).unwrap();
        let out = tracker.detect(&frames, bbox.center()).unwrap();

        assert_eq!(out, BBox::new(43., 39., 10., 10.));
        assert_eq!(tracker.geometry().unwrap().position, Point::new(48., 44.));
        assert!(!tracker.occlusion().occluded);
    }

    #[test]
    fn test_detect_keeps_box_inside_frame() {
        let (mut tracker, _) = build(Setup {
            shifts: [(8., 0.), (8., 0.)],
            ..Default::default()
        });
        let frames = frames();
        let bbox = BBox::new(88., 40., 10., 10.);

        tracker.init(&frames, &bbox).unwrap();
        let out = tracker.detect(&frames, bbox.center()).unwrap();

        assert_relative_eq!(out.right(), 100.);
        assert_relative_eq!(out.x, 90.);
    }

    #[test]
    fn test_occlusion_signals_do_not_gate_detect() {
        let (mut tracker, _) = build(Setup {
            response: 0.1,
            histogram: vec![40., 40., 20.],
            ..Default::default()
        });
        let frames = frames();
        let bbox = BBox::new(40., 40., 10., 10.);

        tracker.init(&frames, &bbox).unwrap();
        let out = tracker.detect(&frames, bbox.center()).unwrap();
        let signals = tracker.occlusion();

        assert_eq!(out, bbox);
        assert!(signals.occluded);
        assert!(!signals.visible);
        assert_eq!(signals.object_bin, 2);
        assert_relative_eq!(signals.occluder_ratio, 0.8);
    }

    #[test]
    fn test_scale_change_reaches_models() {
        let (mut tracker, calls) = build(Setup {
            next_scale: Some((2., change(Size::new(20., 20.)))),
            ..Default::default()
        });
        let frames = frames();
        let bbox = BBox::new(40., 40., 10., 10.);

        tracker.init(&frames, &bbox).unwrap();
        assert_eq!(calls.scale_changes.load(Ordering::SeqCst), 2);

        tracker.update(&frames, bbox.center()).unwrap();
        assert_eq!(calls.scale_changes.load(Ordering::SeqCst), 4);
        assert_eq!(calls.updates.load(Ordering::SeqCst), 2);

        let geometry = tracker.geometry().unwrap();
        assert_eq!(geometry.window_size, Size::new(40., 40.));
        assert_eq!(geometry.cosine_window.shape(), (40, 40));

        let out = tracker.detect(&frames, bbox.center()).unwrap();
        assert_eq!(out, BBox::new(35., 35., 20., 20.));
    }

    #[test]
    fn test_score_does_not_move_target() {
        let (mut tracker, _) = build(Setup {
            shifts: [(5., 5.), (5., 5.)],
            response: 1.5,
            ..Default::default()
        });
        let frames = frames();
        let bbox = BBox::new(40., 40., 10., 10.);

        tracker.init(&frames, &bbox).unwrap();
        let before = tracker.geometry().cloned();
        let score = Tracker::score(&tracker, &frames, &BBox::new(10., 10., 10., 10.)).unwrap();

        assert_relative_eq!(score, 1.);
        assert_eq!(tracker.geometry().cloned(), before);
    }

    #[test]
    fn test_uninitialized() {
        let (mut tracker, _) = build(Setup::default());

        assert!(matches!(
            tracker.detect(&frames(), Point::new(5., 5.)),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            tracker.update(&frames(), Point::new(5., 5.)),
            Err(Error::NotInitialized)
        ));
    }

    #[test]
    fn test_failures_propagate() {
        let (mut tracker, _) = build(Setup {
            fail: true,
            ..Default::default()
        });
        let bbox = BBox::new(40., 40., 10., 10.);
        tracker.init(&frames(), &bbox).unwrap();

        assert!(matches!(
            tracker.detect(&frames(), bbox.center()),
            Err(Error::AppearanceModel(_))
        ));

        let (mut tracker, _) = build(Setup::default());
        tracker.init(&frames(), &bbox).unwrap();

        let mut color_only = Frames::new();
        color_only.insert(Modality::Color, Frame::zeros(100, 100));
        assert!(matches!(
            tracker.detect(&color_only, bbox.center()),
            Err(Error::MissingModality(Modality::Depth))
        ));
    }
}

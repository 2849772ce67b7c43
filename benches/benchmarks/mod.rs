use std::sync::Arc;

use criterion::{criterion_group, Criterion};
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use sortr::baseline::{single_object_tracker, BaselineKwargs};
use sortr::occlusion::OcclusionKwargs;
use sortr::timing::NoopTimings;
use sortr::{BBox, Frame, Frames, MultiObjectTracker, Result, Tracker};

fn frames(rng: &mut StdRng, offset: usize) -> Frames {
    let texture = Uniform::new(0f32, 255.);
    let mut color = Frame::from_fn(120, 120, |_, _| rng.sample(&texture) * 0.25);
    let mut depth = Frame::from_element(120, 120, 3000.);

    for (x0, y0) in [(20 + offset, 30), (80 - offset, 70)] {
        for r in y0..y0 + 16 {
            for c in x0..x0 + 16 {
                color[(r, c)] = ((r * 31 + c * 17) % 255) as f32;
                depth[(r, c)] = 1000.;
            }
        }
    }

    Frames::rgbd(color, depth)
}

pub fn step(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(0);
    let sequence = (0..2).map(|i| frames(&mut rng, i)).collect::<Vec<_>>();

    c.bench_function("step 2", |b| {
        b.iter(|| {
            let mut mot = MultiObjectTracker::new(
                |frames: &Frames, bbox: &BBox| -> Result<Box<dyn Tracker>> {
                    let mut tracker = single_object_tracker(
                        &BaselineKwargs::default(),
                        OcclusionKwargs::default(),
                        Arc::new(NoopTimings),
                    );
                    tracker.init(frames, bbox)?;
                    Ok(Box::new(tracker))
                },
            );

            for (i, frames) in sequence.iter().enumerate() {
                let detections = [
                    BBox::new((20 + i) as f32, 30., 16., 16.),
                    BBox::new((80 - i) as f32, 70., 16., 16.),
                ];
                mot.step(frames, &detections);
            }
        })
    });
}

criterion_group!(benches, step);

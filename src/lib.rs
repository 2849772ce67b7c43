//! RGB-D multi-target tracking.
//!
//! [`tracker::SingleObjectTracker`] follows one target across co-registered
//! color and depth frames and reports depth-histogram occlusion signals.
//! [`lifecycle::MultiObjectTracker`] keeps a population of such trackers,
//! matches them to per-frame detections by IoU, suspends the ones it loses and
//! reacquires them by appearance.

pub mod assignment;
pub mod baseline;
pub mod config;
pub mod error;
pub mod geometry;
pub mod lifecycle;
pub mod metrics;
pub mod model;
pub mod occlusion;
pub mod timing;
pub mod tracker;

pub use config::SortrKwargs;
pub use error::{Error, Result};
pub use geometry::BBox;
pub use lifecycle::{MultiObjectTracker, Track, TrackId, TrackState, TrackerFactory};
pub use model::{Frame, Frames, Modality};
pub use tracker::{SingleObjectTracker, Tracker};

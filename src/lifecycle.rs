//! Track lifecycle: Active and Suspended pools, IoU assignment, appearance
//! reacquisition and spawning of new identities.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::assignment::{
    match_by_cost_matrix, similarity_cost, AssignmentKwargs, AssignmentSolver, HungarianSolver,
};
use crate::error::Result;
use crate::geometry::BBox;
use crate::metrics::iou;
use crate::model::Frames;
use crate::timing::{timed, NoopTimings, Stage, TimingObserver};
use crate::tracker::Tracker;

/// Process-lifetime track identity. The first allocated id is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub bbox: BBox,
    pub state: TrackState,
}

/// Builds a tracker and initialises it at `bbox`.
pub trait TrackerFactory: Send + Sync {
    fn create(&self, frames: &Frames, bbox: &BBox) -> Result<Box<dyn Tracker>>;
}

impl<F> TrackerFactory for F
where
    F: Fn(&Frames, &BBox) -> Result<Box<dyn Tracker>> + Send + Sync,
{
    fn create(&self, frames: &Frames, bbox: &BBox) -> Result<Box<dyn Tracker>> {
        self(frames, bbox)
    }
}

/// Bounds on the Suspended pool. Unbounded unless set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuspensionKwargs {
    /// Suspended tracks older than this many ticks are destroyed.
    pub max_age: Option<u64>,
    /// Pool size cap; the longest-suspended tracks go first.
    pub max_pool: Option<usize>,
}

struct ActiveTrack {
    bbox: BBox,
    tracker: Box<dyn Tracker>,
}

struct SuspendedTrack {
    since: u64,
    /// Last box the track was emitted at; not used for matching.
    last_bbox: BBox,
    tracker: Box<dyn Tracker>,
}

pub struct MultiObjectTracker {
    factory: Box<dyn TrackerFactory>,
    solver: Box<dyn AssignmentSolver>,
    assignment: AssignmentKwargs,
    suspension: SuspensionKwargs,
    active: BTreeMap<TrackId, ActiveTrack>,
    suspended: BTreeMap<TrackId, SuspendedTrack>,
    last_id: u64,
    tick: u64,
    timings: Arc<dyn TimingObserver>,
}

impl MultiObjectTracker {
    pub fn new<F: TrackerFactory + 'static>(factory: F) -> Self {
        Self {
            factory: Box::new(factory),
            solver: Box::new(HungarianSolver),
            assignment: AssignmentKwargs::default(),
            suspension: SuspensionKwargs::default(),
            active: BTreeMap::new(),
            suspended: BTreeMap::new(),
            last_id: 0,
            tick: 0,
            timings: Arc::new(NoopTimings),
        }
    }

    pub fn with_solver<S: AssignmentSolver + 'static>(mut self, solver: S) -> Self {
        self.solver = Box::new(solver);
        self
    }

    pub fn with_assignment(mut self, kwargs: AssignmentKwargs) -> Self {
        self.assignment = kwargs;
        self
    }

    pub fn with_suspension(mut self, kwargs: SuspensionKwargs) -> Self {
        self.suspension = kwargs;
        self
    }

    pub fn with_timings(mut self, timings: Arc<dyn TimingObserver>) -> Self {
        self.timings = timings;
        self
    }

    /// Number of completed `step` calls.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn active_tracks(&self) -> Vec<Track> {
        self.active
            .iter()
            .map(|(id, t)| Track {
                id: *id,
                bbox: t.bbox,
                state: TrackState::Active,
            })
            .collect()
    }

    pub fn suspended_ids(&self) -> Vec<TrackId> {
        self.suspended.keys().copied().collect()
    }

    /// Suspended tracks at the box they were last emitted at.
    pub fn suspended_tracks(&self) -> Vec<Track> {
        self.suspended
            .iter()
            .map(|(id, t)| Track {
                id: *id,
                bbox: t.last_bbox,
                state: TrackState::Suspended,
            })
            .collect()
    }

    /// Advances every track by one frame set and returns the tracks with a
    /// fresh detection this tick, ordered by id.
    pub fn step(&mut self, frames: &Frames, detections: &[BBox]) -> Vec<Track> {
        self.tick += 1;
        let mut emitted = Vec::new();

        let located = self.detect_active(frames);
        let unassigned = self.assign_primary(frames, detections, located, &mut emitted);
        let unassigned = self.reacquire(frames, detections, unassigned, &mut emitted);
        self.evict();
        self.spawn(frames, detections, unassigned, &mut emitted);

        debug!(
            "tick {}: {} emitted, {} active, {} suspended",
            self.tick,
            emitted.len(),
            self.active.len(),
            self.suspended.len()
        );

        emitted.sort_by_key(|t: &Track| t.id);
        emitted
    }

    /// Runs every active tracker's `detect` in parallel. Failures are logged
    /// and come back as `None`.
    fn detect_active(&mut self, frames: &Frames) -> Vec<(TrackId, Option<BBox>)> {
        let active = &mut self.active;

        let mut located = timed(self.timings.as_ref(), Stage::TrackDetect, || {
            active
                .par_iter_mut()
                .map(|(id, track)| match track.tracker.detect(frames, &track.bbox) {
                    Ok(bbox) => (*id, Some(bbox)),
                    Err(e) => {
                        warn!("track {} failed to detect: {}", id, e);
                        (*id, None)
                    }
                })
                .collect::<Vec<_>>()
        });

        located.sort_by_key(|(id, _)| *id);
        located
    }

    /// Matches located tracks to detections by IoU. Matched tracks move to
    /// their detection and are emitted, the rest are suspended. Returns the
    /// indices of the detections left over.
    fn assign_primary(
        &mut self,
        frames: &Frames,
        detections: &[BBox],
        located: Vec<(TrackId, Option<BBox>)>,
        emitted: &mut Vec<Track>,
    ) -> Vec<usize> {
        let (rows, failed): (Vec<_>, Vec<_>) = located.into_iter().partition(|(_, b)| b.is_some());
        let rows = rows
            .into_iter()
            .filter_map(|(id, b)| b.map(|b| (id, b)))
            .collect::<Vec<_>>();

        let matching = timed(self.timings.as_ref(), Stage::PrimaryAssignment, || {
            match_by_cost_matrix(
                self.solver.as_ref(),
                rows.len(),
                detections.len(),
                self.assignment.primary,
                |r, c| similarity_cost(iou(&detections[c], &rows[r].1)),
            )
        });

        for a in matching.accepted.iter() {
            let id = rows[a.row].0;
            let bbox = detections[a.col];

            if let Some(track) = self.active.get_mut(&id) {
                if let Err(e) = track.tracker.update(frames, &bbox) {
                    warn!("track {} failed to update: {}", id, e);
                }
                track.bbox = bbox;
                emitted.push(Track {
                    id,
                    bbox,
                    state: TrackState::Active,
                });
            }
        }

        let lost = matching
            .unmatched_rows
            .iter()
            .map(|&r| rows[r].0)
            .chain(failed.into_iter().map(|(id, _)| id));
        for id in lost {
            if let Some(track) = self.active.remove(&id) {
                info!("suspending track {}", id);
                self.suspended.insert(
                    id,
                    SuspendedTrack {
                        since: self.tick,
                        last_bbox: track.bbox,
                        tracker: track.tracker,
                    },
                );
            }
        }

        debug!(
            "primary assignment: {} matched, {} detections left",
            matching.accepted.len(),
            matching.unmatched_cols.len()
        );

        matching.unmatched_cols
    }

    /// Scores suspended tracks against the leftover detections and
    /// reactivates the accepted ones. Returns the detections still unclaimed.
    fn reacquire(
        &mut self,
        frames: &Frames,
        detections: &[BBox],
        unassigned: Vec<usize>,
        emitted: &mut Vec<Track>,
    ) -> Vec<usize> {
        if self.suspended.is_empty() || unassigned.is_empty() {
            return unassigned;
        }

        let ids = self.suspended_ids();
        let suspended = &self.suspended;

        let matching = timed(self.timings.as_ref(), Stage::Reacquisition, || {
            match_by_cost_matrix(
                self.solver.as_ref(),
                ids.len(),
                unassigned.len(),
                self.assignment.reacquire,
                |r, c| {
                    let bbox = &detections[unassigned[c]];
                    let score = match suspended.get(&ids[r]) {
                        Some(track) => track.tracker.score(frames, bbox).unwrap_or_else(|e| {
                            warn!("track {} failed to score: {}", ids[r], e);
                            0.
                        }),
                        None => 0.,
                    };
                    similarity_cost(score)
                },
            )
        });

        for a in matching.accepted.iter() {
            let id = ids[a.row];
            let bbox = detections[unassigned[a.col]];

            if let Some(mut track) = self.suspended.remove(&id) {
                if let Err(e) = track.tracker.update(frames, &bbox) {
                    warn!("track {} failed to update: {}", id, e);
                }
                info!("reactivating track {} at {:?}", id, bbox);
                self.active.insert(
                    id,
                    ActiveTrack {
                        bbox,
                        tracker: track.tracker,
                    },
                );
                emitted.push(Track {
                    id,
                    bbox,
                    state: TrackState::Active,
                });
            }
        }

        matching
            .unmatched_cols
            .into_iter()
            .map(|c| unassigned[c])
            .collect()
    }

    fn evict(&mut self) {
        if let Some(max_age) = self.suspension.max_age {
            let tick = self.tick;
            self.suspended.retain(|id, track| {
                let keep = tick - track.since <= max_age;
                if !keep {
                    info!("evicting track {} after {} ticks", id, tick - track.since);
                }
                keep
            });
        }

        if let Some(max_pool) = self.suspension.max_pool {
            while self.suspended.len() > max_pool {
                let oldest = self
                    .suspended
                    .iter()
                    .min_by_key(|(id, track)| (track.since, **id))
                    .map(|(id, _)| *id);

                match oldest {
                    Some(id) => {
                        info!("evicting track {} from a full pool", id);
                        self.suspended.remove(&id);
                    }
                    None => break,
                }
            }
        }
    }

    fn spawn(
        &mut self,
        frames: &Frames,
        detections: &[BBox],
        unassigned: Vec<usize>,
        emitted: &mut Vec<Track>,
    ) {
        let factory = &self.factory;
        let created = timed(self.timings.as_ref(), Stage::Spawn, || {
            unassigned
                .into_iter()
                .filter_map(|c| {
                    let bbox = detections[c];
                    match factory.create(frames, &bbox) {
                        Ok(tracker) => Some((bbox, tracker)),
                        Err(e) => {
                            warn!("dropping detection {:?}: {}", bbox, e);
                            None
                        }
                    }
                })
                .collect::<Vec<_>>()
        });

        for (bbox, tracker) in created {
            self.last_id += 1;
            let id = TrackId(self.last_id);

            info!("new track {} at {:?}", id, bbox);
            self.active.insert(id, ActiveTrack { bbox, tracker });
            emitted.push(Track {
                id,
                bbox,
                state: TrackState::Active,
            });
        }
    }
}

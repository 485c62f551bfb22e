// THEORY:
// The `trajectory` module is the memory of the tracking layer. A
// `TrajectoryStore` maps every identity ever observed to its ordered history,
// one `TrackSample` per frame from the frame it was first seen.
//
// Key architectural principles:
// 1.  **Explicit Absence**: a frame in which a known identity was not detected is
//     recorded as `TrackEntry::Absent`, never as a gap. "Not seen this frame" and
//     "absent marker" are therefore the same thing, and renderers only ever have
//     to handle one representation.
// 2.  **Temporal Order**: samples carry their frame index and are only appended,
//     so history order is frame order. This survives eviction.
// 3.  **Identity Permanence**: identities are never removed. A lost object stays
//     `Missing` until it is detected again. Only old samples may be evicted, and
//     only when a `RetentionPolicy` asks for it.
// 4.  **Deterministic Traversal**: trajectories are kept in first-seen order so
//     rendering, plotting and the diagnostic dump are reproducible.

use crate::core_modules::detection::{Point, ShapeKind};
use crate::core_modules::identity::ObjectKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One history entry: a position, or the absent sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackEntry {
    Seen(Point),
    Absent,
}

impl TrackEntry {
    pub fn position(&self) -> Option<Point> {
        match self {
            TrackEntry::Seen(p) => Some(*p),
            TrackEntry::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSample {
    pub frame: u64,
    pub entry: TrackEntry,
}

/// Per-identity state. `Unseen` is implicit: an unseen identity has no trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackState {
    Active,
    Missing,
}

/// The state change caused by recording one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackTransition {
    /// Unseen -> Active
    Started,
    /// Active -> Active
    Continued,
    /// Active -> Missing
    Lost,
    /// Missing -> Missing
    StillMissing,
    /// Missing -> Active
    Resumed,
}

/// How much history each trajectory keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    #[default]
    Unbounded,
    /// Ring buffer: keep at most this many samples per identity.
    MaxSamples(usize),
    /// Keep samples from the most recent this-many frames.
    MaxAge(u64),
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RetentionPolicy::MaxSamples(0) => Err("retention max_samples must be at least 1".to_string()),
            RetentionPolicy::MaxAge(0) => Err("retention max_age must be at least 1 frame".to_string()),
            _ => Ok(()),
        }
    }
}

/// The history of a single identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    key: ObjectKey,
    state: TrackState,
    first_frame: u64,
    samples: VecDeque<TrackSample>,
    /// Samples dropped by the retention policy so far.
    evicted: u64,
}

impl Trajectory {
    fn new(key: ObjectKey, frame: u64, position: Point) -> Self {
        let mut samples = VecDeque::new();
        samples.push_back(TrackSample {
            frame,
            entry: TrackEntry::Seen(position),
        });
        Self {
            key,
            state: TrackState::Active,
            first_frame: frame,
            samples,
            evicted: 0,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// The frame the identity was first observed in, even if that sample was evicted.
    pub fn first_frame(&self) -> u64 {
        self.first_frame
    }

    pub fn samples(&self) -> impl Iterator<Item = &TrackSample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Positions in order, `None` for absent entries.
    pub fn positions(&self) -> impl Iterator<Item = Option<Point>> + '_ {
        self.samples.iter().map(|s| s.entry.position())
    }

    pub fn latest(&self) -> Option<&TrackSample> {
        self.samples.back()
    }

    /// The most recent real position.
    pub fn last_seen(&self) -> Option<Point> {
        self.samples.iter().rev().find_map(|s| s.entry.position())
    }

    /// Last known position at every Seen -> Absent transition, with the frame of the absence.
    pub fn missing_markers(&self) -> Vec<(u64, Point)> {
        let mut markers = Vec::new();
        let mut previous: Option<TrackEntry> = None;
        for sample in &self.samples {
            if let (TrackEntry::Absent, Some(TrackEntry::Seen(p))) = (sample.entry, previous) {
                markers.push((sample.frame, p));
            }
            previous = Some(sample.entry);
        }
        markers
    }

    fn record(&mut self, sample: TrackSample, retention: RetentionPolicy) -> TrackTransition {
        let transition = match (self.state, sample.entry) {
            (TrackState::Active, TrackEntry::Seen(_)) => TrackTransition::Continued,
            (TrackState::Active, TrackEntry::Absent) => TrackTransition::Lost,
            (TrackState::Missing, TrackEntry::Seen(_)) => TrackTransition::Resumed,
            (TrackState::Missing, TrackEntry::Absent) => TrackTransition::StillMissing,
        };
        self.state = match sample.entry {
            TrackEntry::Seen(_) => TrackState::Active,
            TrackEntry::Absent => TrackState::Missing,
        };
        self.samples.push_back(sample);
        self.apply_retention(sample.frame, retention);
        transition
    }

    fn apply_retention(&mut self, current_frame: u64, retention: RetentionPolicy) {
        // The newest sample is always kept.
        match retention {
            RetentionPolicy::Unbounded => {}
            RetentionPolicy::MaxSamples(max) => {
                while self.samples.len() > max.max(1) {
                    self.samples.pop_front();
                    self.evicted += 1;
                }
            }
            RetentionPolicy::MaxAge(age) => {
                while self.samples.len() > 1
                    && self
                        .samples
                        .front()
                        .is_some_and(|s| s.frame + age <= current_frame)
                {
                    self.samples.pop_front();
                    self.evicted += 1;
                }
            }
        }
    }
}

/// Identity -> history for one shape kind, in first-seen order.
#[derive(Debug, Clone)]
pub struct TrajectoryStore {
    kind: ShapeKind,
    retention: RetentionPolicy,
    trajectories: Vec<Trajectory>,
    index: HashMap<ObjectKey, usize>,
}

impl TrajectoryStore {
    pub fn new(kind: ShapeKind, retention: RetentionPolicy) -> Self {
        Self {
            kind,
            retention,
            trajectories: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn kind(&self) -> ShapeKind {
        self.kind
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.index.contains_key(&key)
    }

    pub fn get(&self, key: ObjectKey) -> Option<&Trajectory> {
        self.index.get(&key).map(|&i| &self.trajectories[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.trajectories.iter().map(|t| t.key)
    }

    /// Records a detection of `key` at `frame`, creating the trajectory on first sight.
    pub fn observe(&mut self, key: ObjectKey, frame: u64, position: Point) -> TrackTransition {
        match self.index.get(&key) {
            Some(&i) => self.trajectories[i].record(
                TrackSample {
                    frame,
                    entry: TrackEntry::Seen(position),
                },
                self.retention,
            ),
            None => {
                self.index.insert(key, self.trajectories.len());
                self.trajectories.push(Trajectory::new(key, frame, position));
                TrackTransition::Started
            }
        }
    }

    /// Records that a known identity was not detected at `frame`.
    /// Unknown keys are ignored: an identity cannot go missing before it was seen.
    pub fn mark_absent(&mut self, key: ObjectKey, frame: u64) -> Option<TrackTransition> {
        let &i = self.index.get(&key)?;
        Some(self.trajectories[i].record(
            TrackSample {
                frame,
                entry: TrackEntry::Absent,
            },
            self.retention,
        ))
    }

    /// `{ "<key>": [[x, y], null, ...] }` with `null` for absent entries.
    pub fn dump(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .trajectories
            .iter()
            .map(|t| {
                let positions: Vec<serde_json::Value> = t
                    .positions()
                    .map(|p| match p {
                        Some(p) => serde_json::json!([p.x, p.y]),
                        None => serde_json::Value::Null,
                    })
                    .collect();
                (t.key.to_string(), serde_json::Value::Array(positions))
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

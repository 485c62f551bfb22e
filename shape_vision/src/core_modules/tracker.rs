// THEORY:
// The `tracker` module is the heart of the Identity Layer. Its responsibility is
// to add "object permanence" to the system: it takes the stateless list of
// `Detection`s from a single frame and associates each one with an identity
// that was (or will be) seen in other frames.
//
// This module solves the "data association problem" with a key lookup instead
// of a geometric search: every detection is reduced to an `ObjectKey` by the
// configured `IdentityStrategy`, and detections with equal keys are the same
// object.
//
// Lifecycle handled here, per identity:
// - **Birth**: a key not yet in the store starts a new trajectory.
// - **Tracking**: a known key gets the new position appended.
// - **Occlusion**: every known key without a detection this frame gets an
//   explicit `Absent` sample. Identities never die; they can resume at any time.
//
// The assigner owns the frame counter, so samples it writes are always in
// strictly increasing frame order.

use crate::core_modules::detection::{Detection, Point};
use crate::core_modules::identity::{ColorKey, IdentityStrategy, ObjectKey};
use crate::core_modules::trajectory::{TrackTransition, TrajectoryStore};
use std::collections::HashMap;
use tracing::debug;

/// Same-key detections whose centers are at most this far apart (per axis) are
/// one outline reported twice, e.g. the outer and hole border of one edge loop.
const DUPLICATE_DISTANCE: i32 = 4;

/// What one call to [`IdentityAssigner::assign`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameAssignment {
    pub frame: u64,
    /// The key of every input detection, in input order (including collisions).
    pub keys: Vec<ObjectKey>,
    pub started: Vec<ObjectKey>,
    pub resumed: Vec<ObjectKey>,
    pub lost: Vec<ObjectKey>,
    /// Detections not recorded because an earlier detection this frame had the same key
    /// somewhere else in the frame.
    pub collisions: usize,
    /// Detections not recorded because they repeat an earlier detection of the same key
    /// at the same place.
    pub duplicates: usize,
}

/// Maps detections to identities and writes them into a `TrajectoryStore`.
pub struct IdentityAssigner {
    strategy: Box<dyn IdentityStrategy>,
    next_frame: u64,
    total_collisions: u64,
}

impl Default for IdentityAssigner {
    fn default() -> Self {
        Self::new(ColorKey::exact())
    }
}

impl IdentityAssigner {
    pub fn new(strategy: impl IdentityStrategy + 'static) -> Self {
        Self {
            strategy: Box::new(strategy),
            next_frame: 0,
            total_collisions: 0,
        }
    }

    /// Number of frames assigned so far, which is also the index of the next one.
    pub fn frames(&self) -> u64 {
        self.next_frame
    }

    pub fn total_collisions(&self) -> u64 {
        self.total_collisions
    }

    /// Assigns this frame's detections to identities and updates the store.
    pub fn assign(&mut self, store: &mut TrajectoryStore, detections: &[Detection]) -> FrameAssignment {
        let frame = self.next_frame;
        let mut assignment = FrameAssignment {
            frame,
            ..Default::default()
        };

        // --- 1. Key Derivation ---
        assignment.keys = detections.iter().map(|d| self.strategy.derive_key(d)).collect();

        // --- 2. Observation ---
        // One sample per identity per frame: the first detection of a key wins.
        let mut seen: HashMap<ObjectKey, Point> = HashMap::with_capacity(detections.len());
        for (detection, &key) in detections.iter().zip(&assignment.keys) {
            if let Some(&kept) = seen.get(&key) {
                if is_duplicate(kept, detection.position) {
                    assignment.duplicates += 1;
                } else {
                    assignment.collisions += 1;
                    debug!(
                        frame,
                        key = key.value(),
                        kind = detection.kind.label(),
                        "key collision in frame, keeping first detection"
                    );
                }
                continue;
            }
            seen.insert(key, detection.position);
            match store.observe(key, frame, detection.position) {
                TrackTransition::Started => assignment.started.push(key),
                TrackTransition::Resumed => assignment.resumed.push(key),
                _ => {}
            }
        }

        // --- 3. Absence ---
        let unseen: Vec<ObjectKey> = store.keys().filter(|k| !seen.contains_key(k)).collect();
        for key in unseen {
            if let Some(TrackTransition::Lost) = store.mark_absent(key, frame) {
                assignment.lost.push(key);
            }
        }

        self.total_collisions += assignment.collisions as u64;
        self.next_frame += 1;
        assignment
    }

    /// Consumes the next frame index without touching the store. Every
    /// trajectory keeps a gap at that frame instead of a sample.
    pub fn skip(&mut self) -> u64 {
        let frame = self.next_frame;
        self.next_frame += 1;
        frame
    }
}

fn is_duplicate(a: Point, b: Point) -> bool {
    (a.x - b.x).abs() <= DUPLICATE_DISTANCE && (a.y - b.y).abs() <= DUPLICATE_DISTANCE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detection::{Color, Extent, Point, ShapeKind};
    use crate::core_modules::trajectory::{RetentionPolicy, TrackEntry};

    fn circle(x: i32, y: i32, color: Color) -> Detection {
        Detection {
            kind: ShapeKind::Circle,
            position: Point::new(x, y),
            extent: Extent::Radius(12),
            color,
        }
    }

    fn store() -> TrajectoryStore {
        TrajectoryStore::new(ShapeKind::Circle, RetentionPolicy::Unbounded)
    }

    const RED: Color = Color::new(255, 0, 0);
    const BLUE: Color = Color::new(0, 0, 255);

    #[test]
    fn same_color_across_frames_is_one_identity() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        let n = 6;
        for i in 0..n {
            assigner.assign(&mut store, &[circle(10 + i, 20, RED)]);
        }

        assert_eq!(store.len(), 1);
        let trajectory = store.get(ObjectKey::from_color(RED)).expect("tracked");
        assert_eq!(trajectory.len(), n as usize);
        let frames: Vec<u64> = trajectory.samples().map(|s| s.frame).collect();
        assert!(frames.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(frames, (0..n as u64).collect::<Vec<_>>());
    }

    #[test]
    fn missing_frame_records_absent_and_keeps_neighbours() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        let k = 3;
        for i in 0..6 {
            let detections = if i == k { vec![] } else { vec![circle(10 * i, 5, RED)] };
            let assignment = assigner.assign(&mut store, &detections);
            if i == k {
                assert_eq!(assignment.lost, vec![ObjectKey::from_color(RED)]);
            }
            if i == k + 1 {
                assert_eq!(assignment.resumed, vec![ObjectKey::from_color(RED)]);
            }
        }

        let entries: Vec<TrackEntry> = store
            .get(ObjectKey::from_color(RED))
            .expect("tracked")
            .samples()
            .map(|s| s.entry)
            .collect();
        assert_eq!(entries.len(), 6);
        assert_eq!(entries[k as usize], TrackEntry::Absent);
        assert_eq!(entries[k as usize - 1], TrackEntry::Seen(Point::new(20, 5)));
        assert_eq!(entries[k as usize + 1], TrackEntry::Seen(Point::new(40, 5)));
    }

    #[test]
    fn identities_first_seen_later_start_at_their_own_frame() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        assigner.assign(&mut store, &[circle(0, 0, RED)]);
        let assignment = assigner.assign(&mut store, &[circle(0, 0, RED), circle(50, 50, BLUE)]);

        assert_eq!(assignment.started, vec![ObjectKey::from_color(BLUE)]);
        let blue = store.get(ObjectKey::from_color(BLUE)).expect("tracked");
        assert_eq!(blue.first_frame(), 1);
        assert_eq!(blue.len(), 1);
    }

    #[test]
    fn same_key_at_the_same_place_is_a_duplicate_not_a_collision() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        let assignment = assigner.assign(&mut store, &[circle(40, 40, RED), circle(41, 39, RED)]);

        assert_eq!(assignment.duplicates, 1);
        assert_eq!(assignment.collisions, 0);
        assert_eq!(assigner.total_collisions(), 0);
        assert_eq!(store.get(ObjectKey::from_color(RED)).expect("tracked").len(), 1);
    }

    #[test]
    fn skipped_frames_leave_a_gap_and_keep_the_counter_aligned() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        assigner.assign(&mut store, &[circle(0, 0, RED)]);
        assert_eq!(assigner.skip(), 1);
        let assignment = assigner.assign(&mut store, &[circle(5, 0, RED)]);

        assert_eq!(assignment.frame, 2);
        assert_eq!(assigner.frames(), 3);
        let frames: Vec<u64> = store
            .get(ObjectKey::from_color(RED))
            .expect("tracked")
            .samples()
            .map(|s| s.frame)
            .collect();
        assert_eq!(frames, vec![0, 2]);
    }

    #[test]
    fn same_key_twice_in_a_frame_is_a_collision() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        let assignment = assigner.assign(&mut store, &[circle(1, 1, RED), circle(90, 90, RED)]);

        assert_eq!(assignment.collisions, 1);
        assert_eq!(assignment.keys.len(), 2);
        assert_eq!(assigner.total_collisions(), 1);
        let trajectory = store.get(ObjectKey::from_color(RED)).expect("tracked");
        assert_eq!(trajectory.last_seen(), Some(Point::new(1, 1)));
        assert_eq!(trajectory.len(), 1);
    }

    #[test]
    fn empty_frames_before_any_detection_leave_the_store_empty() {
        let mut assigner = IdentityAssigner::default();
        let mut store = store();
        for _ in 0..3 {
            assigner.assign(&mut store, &[]);
        }
        assert!(store.is_empty());
        assert_eq!(assigner.frames(), 3);
    }

    struct SingleIdentity;

    impl IdentityStrategy for SingleIdentity {
        fn derive_key(&self, _detection: &Detection) -> ObjectKey {
            ObjectKey::from_color(Color::new(1, 1, 1))
        }
    }

    #[test]
    fn strategy_is_pluggable() {
        let mut assigner = IdentityAssigner::new(SingleIdentity);
        let mut store = store();
        assigner.assign(&mut store, &[circle(0, 0, RED)]);
        assigner.assign(&mut store, &[circle(5, 0, BLUE)]);

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(ObjectKey::from_color(Color::new(1, 1, 1))).map(|t| t.len()), Some(2));
    }
}

//! Remote participants ("ghosts") rebuilt from replicated samples.
//!
//! Each ghost keeps a short, time-ordered buffer of samples stamped with the
//! estimated server send time. Rendering happens a fixed delay behind the
//! estimated server clock so there is usually a sample on either side to
//! interpolate between; past the newest sample the ghost is extrapolated for
//! a bounded time and then held.

use std::collections::VecDeque;

use glam::Vec3;
use rustc_hash::FxHashMap;
use warren_net::MovementState;

/// Timing parameters for [`EntityReplicator`].
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatorConfig {
    /// Render delay behind the estimated server clock (ms).
    pub interpolation_delay_ms: f64,
    /// Samples older than this relative to the newest are dropped (ms).
    pub retention_ms: f64,
    /// Maximum extrapolation past the newest sample (ms).
    pub max_extrapolation_ms: f64,
    /// Ghosts without a sample for longer than this are removed (local ms).
    pub despawn_timeout_ms: u64,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            interpolation_delay_ms: 150.0,
            retention_ms: 2_000.0,
            max_extrapolation_ms: 250.0,
            despawn_timeout_ms: 2_000,
        }
    }
}

/// One replicated observation of a ghost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// Estimated server send time (ms).
    pub t: f64,
    /// Position.
    pub pos: Vec3,
    /// Movement state.
    pub state: MovementState,
    /// Rotation in degrees, when in ball state.
    pub rotation: Option<f32>,
    /// Frozen flag.
    pub frozen: bool,
}

/// Where and how to draw a ghost.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    /// Position.
    pub pos: Vec3,
    /// Movement state.
    pub state: MovementState,
    /// Rotation in degrees.
    pub rotation: Option<f32>,
    /// Frozen flag.
    pub frozen: bool,
}

impl From<&Sample> for Pose {
    fn from(s: &Sample) -> Self {
        Self {
            pos: s.pos,
            state: s.state,
            rotation: s.rotation,
            frozen: s.frozen,
        }
    }
}

/// A ghost removed for silence.
#[derive(Debug, Clone, PartialEq)]
pub struct Despawned {
    /// Ghost identifier.
    pub id: String,
    /// Last rendered (or last sampled) position.
    pub position: Vec3,
    /// Whether the position passed the visibility check, i.e. the cosmetic
    /// despawn effect should play.
    pub visible: bool,
}

#[derive(Debug, Clone)]
struct Ghost {
    samples: VecDeque<Sample>,
    last_heard_ms: u64,
    last_pose: Option<Pose>,
}

impl Ghost {
    fn insert(&mut self, sample: Sample, retention_ms: f64) {
        // Roster ages can place a sample before ones already buffered.
        let index = self.samples.partition_point(|s| s.t < sample.t);
        match self.samples.get_mut(index) {
            Some(existing) if existing.t == sample.t => *existing = sample,
            _ => self.samples.insert(index, sample),
        }

        if let Some(newest) = self.samples.back().map(|s| s.t) {
            while self
                .samples
                .front()
                .is_some_and(|s| s.t < newest - retention_ms)
            {
                self.samples.pop_front();
            }
        }
    }

    fn pose(&self) -> Option<Pose> {
        self.last_pose.or_else(|| self.samples.back().map(Pose::from))
    }

    fn position(&self) -> Option<Vec3> {
        self.pose().map(|p| p.pos)
    }
}

/// Per-ghost sample buffers with interpolation, extrapolation, and despawn.
#[derive(Debug, Clone, Default)]
pub struct EntityReplicator {
    config: ReplicatorConfig,
    ghosts: FxHashMap<String, Ghost>,
}

impl EntityReplicator {
    /// Create an empty replicator.
    pub fn new(config: ReplicatorConfig) -> Self {
        Self {
            config,
            ghosts: FxHashMap::default(),
        }
    }

    /// Timing parameters.
    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Buffer a sample for `id`, received at local time `local_ms`.
    ///
    /// Returns `true` if this created the ghost.
    pub fn push_sample(&mut self, id: &str, sample: Sample, local_ms: u64) -> bool {
        let retention = self.config.retention_ms;
        let mut created = false;
        let ghost = self.ghosts.entry(id.to_string()).or_insert_with(|| {
            created = true;
            Ghost {
                samples: VecDeque::new(),
                last_heard_ms: local_ms,
                last_pose: None,
            }
        });
        ghost.insert(sample, retention);
        ghost.last_heard_ms = local_ms;
        if created {
            tracing::debug!(id, "Ghost spawned");
        }
        created
    }

    /// Render time for a local clock reading and clock offset.
    pub fn render_time(&self, local_ms: u64, offset_ms: f64) -> f64 {
        local_ms as f64 + offset_ms - self.config.interpolation_delay_ms
    }

    /// Pose of `id` at server time `render_time`.
    pub fn pose_at(&self, id: &str, render_time: f64) -> Option<Pose> {
        let ghost = self.ghosts.get(id)?;
        sample_buffer(&ghost.samples, render_time, self.config.max_extrapolation_ms)
    }

    /// Compute every ghost's pose at `render_time` and remember it for
    /// despawn effects.
    pub fn render(&mut self, render_time: f64) -> Vec<(String, Pose)> {
        let max_extrapolation = self.config.max_extrapolation_ms;
        let mut out = Vec::with_capacity(self.ghosts.len());
        for (id, ghost) in &mut self.ghosts {
            if let Some(pose) = sample_buffer(&ghost.samples, render_time, max_extrapolation) {
                ghost.last_pose = Some(pose);
                out.push((id.clone(), pose));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Remove ghosts silent for longer than the despawn timeout.
    ///
    /// `is_visible` decides whether the cosmetic effect should play for the
    /// ghost's last position.
    pub fn despawn_expired(
        &mut self,
        local_ms: u64,
        is_visible: impl Fn(Vec3) -> bool,
    ) -> Vec<Despawned> {
        let timeout = self.config.despawn_timeout_ms;
        let expired: Vec<String> = self
            .ghosts
            .iter()
            .filter(|(_, g)| local_ms.saturating_sub(g.last_heard_ms) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(ghost) = self.ghosts.remove(&id) {
                let position = ghost.position().unwrap_or(Vec3::ZERO);
                let visible = ghost.position().is_some() && is_visible(position);
                tracing::debug!(id = %id, visible, "Ghost despawned");
                out.push(Despawned {
                    id,
                    position,
                    visible,
                });
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Last known poses of ghosts matching `predicate`, sorted by id.
    ///
    /// The pose is the last rendered one, or the newest sample for a ghost
    /// that has not been rendered yet.
    pub fn ghosts_matching(
        &self,
        mut predicate: impl FnMut(&str, &Pose) -> bool,
    ) -> Vec<(String, Pose)> {
        let mut out: Vec<_> = self
            .ghosts
            .iter()
            .filter_map(|(id, g)| g.pose().map(|p| (id, p)))
            .filter(|(id, p)| predicate(id, p))
            .map(|(id, p)| (id.clone(), p))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Whether a ghost exists.
    pub fn contains(&self, id: &str) -> bool {
        self.ghosts.contains_key(id)
    }

    /// Buffered samples for a ghost, oldest first.
    pub fn samples(&self, id: &str) -> Option<&VecDeque<Sample>> {
        self.ghosts.get(id).map(|g| &g.samples)
    }

    /// Number of ghosts.
    pub fn len(&self) -> usize {
        self.ghosts.len()
    }

    /// Whether there are no ghosts.
    pub fn is_empty(&self) -> bool {
        self.ghosts.is_empty()
    }

    /// Drop a ghost without a despawn effect.
    pub fn remove(&mut self, id: &str) -> bool {
        self.ghosts.remove(id).is_some()
    }

    /// Drop every ghost without despawn effects.
    pub fn clear(&mut self) {
        self.ghosts.clear();
    }
}

/// Interpolate, extrapolate, or hold a sample buffer at `render_time`.
pub fn sample_buffer(
    samples: &VecDeque<Sample>,
    render_time: f64,
    max_extrapolation_ms: f64,
) -> Option<Pose> {
    let first = samples.front()?;
    let last = samples.back()?;

    if samples.len() == 1 || render_time <= first.t {
        return Some(Pose::from(first));
    }

    if render_time >= last.t {
        return Some(extrapolate(samples, render_time, max_extrapolation_ms));
    }

    // First sample strictly after render_time; the one before brackets it.
    let upper = samples.partition_point(|s| s.t <= render_time);
    let b = &samples[upper];
    let a = &samples[upper - 1];
    Some(interpolate(a, b, render_time))
}

fn interpolate(a: &Sample, b: &Sample, render_time: f64) -> Pose {
    let span = b.t - a.t;
    let alpha = if span > 0.0 {
        ((render_time - a.t) / span).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let closer = if render_time - a.t <= b.t - render_time {
        a
    } else {
        b
    };

    let rotation = match (a.rotation, b.rotation) {
        (Some(ra), Some(rb)) => Some(lerp_angle(ra, rb, alpha as f32)),
        _ => closer.rotation,
    };

    Pose {
        pos: a.pos.lerp(b.pos, alpha as f32),
        state: closer.state,
        rotation,
        frozen: closer.frozen,
    }
}

fn extrapolate(samples: &VecDeque<Sample>, render_time: f64, max_ms: f64) -> Pose {
    let last = &samples[samples.len() - 1];
    let mut pose = Pose::from(last);
    if samples.len() < 2 {
        return pose;
    }

    let prev = &samples[samples.len() - 2];
    let dt = last.t - prev.t;
    if dt <= 0.0 {
        return pose;
    }
    let velocity = (last.pos - prev.pos) / dt as f32;
    let ahead = (render_time - last.t).clamp(0.0, max_ms);
    pose.pos = last.pos + velocity * ahead as f32;
    pose
}

/// Interpolate between two angles in degrees along the shortest arc.
/// The result is normalized to `[0, 360)`.
pub fn lerp_angle(from: f32, to: f32, alpha: f32) -> f32 {
    let delta = (to - from + 540.0).rem_euclid(360.0) - 180.0;
    (from + delta * alpha).rem_euclid(360.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(t: f64, x: f32) -> Sample {
        Sample {
            t,
            pos: Vec3::new(x, 0.0, 0.0),
            state: MovementState::Upright,
            rotation: None,
            frozen: false,
        }
    }

    fn buffer(samples: &[Sample]) -> VecDeque<Sample> {
        samples.iter().copied().collect()
    }

    #[test]
    fn test_interpolates_midpoint_exactly() {
        let buf = buffer(&[sample(0.0, 0.0), sample(100.0, 1.0)]);
        let pose = sample_buffer(&buf, 50.0, 250.0).unwrap();
        assert_eq!(pose.pos.x, 0.5);
    }

    #[test]
    fn test_extrapolation_is_capped() {
        let buf = buffer(&[sample(-100.0, 0.0), sample(0.0, 1.0)]);
        // 0.01 units/ms, capped at 250ms past the last sample.
        let pose = sample_buffer(&buf, 1_000.0, 250.0).unwrap();
        assert!((pose.pos.x - 3.5).abs() < 1e-4, "got {}", pose.pos.x);

        let uncapped = sample_buffer(&buf, 100.0, 250.0).unwrap();
        assert!((uncapped.pos.x - 2.0).abs() < 1e-4, "got {}", uncapped.pos.x);
    }

    #[test]
    fn test_single_sample_rendered_directly() {
        let buf = buffer(&[sample(500.0, 7.0)]);
        for t in [0.0, 500.0, 10_000.0] {
            assert_eq!(sample_buffer(&buf, t, 250.0).unwrap().pos.x, 7.0);
        }
    }

    #[test]
    fn test_before_first_sample_holds_first() {
        let buf = buffer(&[sample(100.0, 1.0), sample(200.0, 2.0)]);
        assert_eq!(sample_buffer(&buf, 0.0, 250.0).unwrap().pos.x, 1.0);
    }

    #[test]
    fn test_discrete_state_from_closer_sample() {
        let a = sample(0.0, 0.0);
        let b = Sample {
            state: MovementState::Ball,
            frozen: true,
            ..sample(100.0, 1.0)
        };
        let buf = buffer(&[a, b]);

        let early = sample_buffer(&buf, 30.0, 250.0).unwrap();
        assert_eq!(early.state, MovementState::Upright);
        assert!(!early.frozen);

        let late = sample_buffer(&buf, 70.0, 250.0).unwrap();
        assert_eq!(late.state, MovementState::Ball);
        assert!(late.frozen);
    }

    #[test]
    fn test_rotation_takes_shortest_arc() {
        assert!((lerp_angle(350.0, 10.0, 0.5) - 0.0).abs() < 1e-3);
        assert!((lerp_angle(10.0, 350.0, 0.5) - 0.0).abs() < 1e-3);
        assert!((lerp_angle(0.0, 90.0, 0.5) - 45.0).abs() < 1e-3);
        assert!((lerp_angle(170.0, 190.0, 0.25) - 175.0).abs() < 1e-3);
    }

    #[test]
    fn test_rotation_interpolated_in_buffer() {
        let a = Sample {
            rotation: Some(340.0),
            state: MovementState::Ball,
            ..sample(0.0, 0.0)
        };
        let b = Sample {
            rotation: Some(20.0),
            state: MovementState::Ball,
            ..sample(100.0, 0.0)
        };
        let pose = sample_buffer(&buffer(&[a, b]), 50.0, 250.0).unwrap();
        assert!(pose.rotation.unwrap().abs() < 1e-3);
    }

    #[test]
    fn test_out_of_order_samples_are_sorted() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("ghost-01", sample(200.0, 2.0), 0);
        r.push_sample("ghost-01", sample(100.0, 1.0), 0);
        r.push_sample("ghost-01", sample(300.0, 3.0), 0);
        let ts: Vec<f64> = r.samples("ghost-01").unwrap().iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![100.0, 200.0, 300.0]);
    }

    #[test]
    fn test_retention_drops_old_samples() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("ghost-01", sample(0.0, 0.0), 0);
        r.push_sample("ghost-01", sample(1_000.0, 1.0), 0);
        r.push_sample("ghost-01", sample(2_500.0, 2.0), 0);
        let ts: Vec<f64> = r.samples("ghost-01").unwrap().iter().map(|s| s.t).collect();
        assert_eq!(ts, vec![1_000.0, 2_500.0]);
    }

    #[test]
    fn test_render_time_subtracts_delay() {
        let r = EntityReplicator::new(ReplicatorConfig::default());
        assert_eq!(r.render_time(1_000, 500.0), 1_350.0);
    }

    #[test]
    fn test_despawn_after_silence() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        assert!(r.push_sample("ghost-01", sample(0.0, 1.0), 0));
        assert!(r.push_sample("ghost-02", sample(0.0, 2.0), 1_500));

        assert!(r.despawn_expired(2_000, |_| true).is_empty());

        let gone = r.despawn_expired(2_001, |_| true);
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].id, "ghost-01");
        assert!(gone[0].visible);
        assert!(!r.contains("ghost-01"));
        assert!(r.ghosts_matching(|_, _| true).iter().all(|(id, _)| id != "ghost-01"));
        assert!(r.contains("ghost-02"));
    }

    #[test]
    fn test_despawn_effect_only_when_visible() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("ghost-01", sample(0.0, 50.0), 0);
        r.render(0.0);
        let gone = r.despawn_expired(10_000, |p| p.x < 10.0);
        assert_eq!(gone.len(), 1);
        assert!(!gone[0].visible);
        assert_eq!(gone[0].position.x, 50.0);
    }

    #[test]
    fn test_ghosts_matching_filters_on_position() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("ghost-a", sample(0.0, 1.0), 0);
        r.push_sample("ghost-b", sample(0.0, 5.0), 0);
        let near = r.ghosts_matching(|_, p| p.pos.x < 3.0);
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].0, "ghost-a");
        assert_eq!(near[0].1.pos, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_ghosts_matching_sees_movement_state() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("walker", sample(0.0, 1.0), 0);
        r.push_sample(
            "roller",
            Sample {
                state: MovementState::Ball,
                rotation: Some(90.0),
                ..sample(0.0, 2.0)
            },
            0,
        );

        let hazardous = r.ghosts_matching(|_, p| p.state == MovementState::Ball && !p.frozen);
        assert_eq!(hazardous.len(), 1);
        assert_eq!(hazardous[0].0, "roller");
        assert_eq!(hazardous[0].1.rotation, Some(90.0));

        // A rendered pose replaces the raw sample.
        r.render(0.0);
        let frozen = r.ghosts_matching(|_, p| p.frozen);
        assert!(frozen.is_empty());
    }

    #[test]
    fn test_render_returns_all_ghosts_sorted() {
        let mut r = EntityReplicator::new(ReplicatorConfig::default());
        r.push_sample("b-ghost", sample(0.0, 1.0), 0);
        r.push_sample("a-ghost", sample(0.0, 2.0), 0);
        let poses = r.render(10.0);
        assert_eq!(poses.len(), 2);
        assert_eq!(poses[0].0, "a-ghost");
    }
}

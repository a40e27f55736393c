//! Seeded GPS walker: noisy fixes along a waypoint path.
//!
//! The walker moves in local planar meters around an anchor coordinate
//! (east = x, north = y), the same flat-earth frame the grid uses, and adds
//! Gaussian receiver noise clamped to a maximum radius.

use geoquest_core::geo_grid::METERS_PER_DEGREE;
use geoquest_core::Coordinate;
use nalgebra::Vector2;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal, NormalError};

/// Walker parameters.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Walking speed (default: 1.4 m/s)
    pub speed_mps: f64,

    /// Standard deviation of fix noise per axis (default: 2.0 m)
    pub noise_std_meters: f64,

    /// Noise vectors longer than this are scaled down to it (default: 6.0 m)
    pub max_noise_meters: f64,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            speed_mps: 1.4,
            noise_std_meters: 2.0,
            max_noise_meters: 6.0,
        }
    }
}

pub struct GpsWalker {
    anchor: Coordinate,
    meters_per_degree_lng: f64,
    config: WalkerConfig,
    waypoints: Vec<Vector2<f64>>,
    next_waypoint: usize,
    position: Vector2<f64>,
    noise: Normal<f64>,
    rng: ChaCha8Rng,
}

impl GpsWalker {
    /// Starts at the first waypoint. `waypoints` are meters east/north of `anchor`.
    pub fn new(
        anchor: Coordinate,
        waypoints: Vec<Vector2<f64>>,
        config: WalkerConfig,
        rng: ChaCha8Rng,
    ) -> Result<Self, NormalError> {
        let position = waypoints.first().copied().unwrap_or_else(Vector2::zeros);
        let noise = Normal::new(0.0, config.noise_std_meters)?;
        Ok(Self {
            anchor,
            meters_per_degree_lng: METERS_PER_DEGREE * anchor.lat.to_radians().cos(),
            config,
            waypoints,
            next_waypoint: 1,
            position,
            noise,
            rng,
        })
    }

    /// A walker that never moves, only jitters.
    pub fn stationary(
        at: Vector2<f64>,
        anchor: Coordinate,
        config: WalkerConfig,
        rng: ChaCha8Rng,
    ) -> Result<Self, NormalError> {
        Self::new(anchor, vec![at], config, rng)
    }

    /// True position, meters from the anchor.
    pub fn position(&self) -> Vector2<f64> {
        self.position
    }

    /// Waypoints reached so far, counting the start.
    pub fn waypoints_reached(&self) -> usize {
        self.next_waypoint
    }

    pub fn finished(&self) -> bool {
        self.next_waypoint >= self.waypoints.len()
    }

    /// Advances the true position by `dt_secs` of walking.
    pub fn step(&mut self, dt_secs: f64) {
        let mut budget = self.config.speed_mps * dt_secs;
        while budget > 0.0 && !self.finished() {
            let target = self.waypoints[self.next_waypoint];
            let to_target = target - self.position;
            let remaining = to_target.norm();
            if remaining <= budget {
                self.position = target;
                self.next_waypoint += 1;
                budget -= remaining;
            } else {
                self.position += to_target * (budget / remaining);
                budget = 0.0;
            }
        }
    }

    /// A noisy fix of the current position.
    pub fn fix(&mut self) -> Coordinate {
        let mut noise = Vector2::new(self.noise.sample(&mut self.rng), self.noise.sample(&mut self.rng));
        let length = noise.norm();
        if length > self.config.max_noise_meters {
            noise *= self.config.max_noise_meters / length;
        }
        self.to_coordinate(self.position + noise)
    }

    /// Converts local meters to a coordinate.
    pub fn to_coordinate(&self, local: Vector2<f64>) -> Coordinate {
        Coordinate::new(
            self.anchor.lat + local.y / METERS_PER_DEGREE,
            self.anchor.lng + local.x / self.meters_per_degree_lng,
        )
    }

    /// Random point inside the axis-aligned box `[-half, half]²`.
    pub fn random_point(rng: &mut ChaCha8Rng, half_extent: f64) -> Vector2<f64> {
        Vector2::new(
            rng.gen_range(-half_extent..=half_extent),
            rng.gen_range(-half_extent..=half_extent),
        )
    }
}

#![deny(warnings)]

//! Race time model and track catalog for Rally.
//!
//! The time model is a closed-form, single-leg computation:
//! - Durability and acceleration each scale speed by a factor in [0.5, 1]
//! - A uniform draw from the variability range perturbs the result
//! - The track factor scales for terrain
//!
//! Randomness is always injected, so seeded generators give reproducible races.

mod track;

pub use track::TrackCatalog;

use rally_core::{Car, ValidationError, Variability};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

pub use rally_core::DEFAULT_DISTANCE_KM;

/// Floor on effective speed (km/h) to keep times bounded.
pub const MIN_EFFECTIVE_SPEED_KMH: f64 = 50.0;

/// The car attributes that feed the time model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarPerformance {
    pub speed_kmh: f64,
    pub durability: f64,
    pub acceleration: f64,
}

impl From<&Car> for CarPerformance {
    fn from(c: &Car) -> Self {
        Self {
            speed_kmh: c.speed_kmh,
            durability: c.durability,
            acceleration: c.acceleration,
        }
    }
}

/// Multiplier in [0.5, 1] for a normalized attribute, clamped to [0,1] first.
pub fn performance_multiplier(attribute: f64) -> f64 {
    0.5 + 0.5 * attribute.clamp(0.0, 1.0)
}

/// Effective speed in km/h for a given draw, floored at [`MIN_EFFECTIVE_SPEED_KMH`].
pub fn effective_speed(perf: &CarPerformance, track_factor: f64, draw: f64) -> f64 {
    let raw = perf.speed_kmh
        * performance_multiplier(perf.durability)
        * performance_multiplier(perf.acceleration)
        * draw
        * track_factor;
    raw.max(MIN_EFFECTIVE_SPEED_KMH)
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn validate_inputs(
    perf: &CarPerformance,
    track_factor: f64,
    distance_km: f64,
) -> Result<(), ValidationError> {
    if !(perf.durability.is_finite() && perf.acceleration.is_finite()) {
        return Err(ValidationError::NonFinite);
    }
    if !perf.speed_kmh.is_finite() || perf.speed_kmh <= 0.0 {
        return Err(ValidationError::NonPositiveSpeed(perf.speed_kmh));
    }
    if !distance_km.is_finite() || distance_km <= 0.0 {
        return Err(ValidationError::NonPositiveDistance(distance_km));
    }
    if !track_factor.is_finite() || track_factor <= 0.0 {
        return Err(ValidationError::InvalidTrackFactor(track_factor));
    }
    Ok(())
}

/// Finish time in minutes for a fixed random draw.
///
/// `minutes = round(60 * distance / effective_speed, 3)`.
///
/// Example:
/// let perf = CarPerformance { speed_kmh: 200.0, durability: 1.0, acceleration: 1.0 };
/// assert_eq!(time_with_draw(&perf, 1.0, 100.0, 1.0).unwrap(), 30.0);
pub fn time_with_draw(
    perf: &CarPerformance,
    track_factor: f64,
    distance_km: f64,
    draw: f64,
) -> Result<f64, ValidationError> {
    validate_inputs(perf, track_factor, distance_km)?;
    if !draw.is_finite() || draw <= 0.0 {
        return Err(ValidationError::InvalidVariability { lo: draw, hi: draw });
    }
    let speed = effective_speed(perf, track_factor, draw);
    Ok(round3(60.0 * distance_km / speed))
}

/// Finish time in minutes with a draw taken uniformly from `variability`.
///
/// All parameters are validated before the generator is touched, so an
/// invalid call never advances `rng`.
pub fn race_time_minutes<R: Rng>(
    perf: &CarPerformance,
    track_factor: f64,
    distance_km: f64,
    variability: Variability,
    rng: &mut R,
) -> Result<f64, ValidationError> {
    validate_inputs(perf, track_factor, distance_km)?;
    variability.validate()?;
    let draw: f64 = rng.gen_range(variability.lo..=variability.hi);
    let minutes = time_with_draw(perf, track_factor, distance_km, draw)?;
    trace!(draw, minutes, "timed car");
    Ok(minutes)
}

/// Deterministic generator for a seed, or an entropy-seeded one.
pub fn race_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    }
}

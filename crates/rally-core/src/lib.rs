#![deny(warnings)]

//! Core domain models and invariants for Rally.
//!
//! This crate defines serializable types shared by the simulation, the
//! settlement engine and the store, together with validation helpers that
//! guard every input before it reaches a mutation.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default race distance in kilometres.
pub const DEFAULT_DISTANCE_KM: f64 = 100.0;

/// Upper bound on the random time multiplier.
pub const MAX_VARIABILITY: f64 = 10.0;

/// Store-assigned identifier of a team.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TeamId(pub i64);

/// Store-assigned identifier of a car.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CarId(pub i64);

/// Store-assigned identifier of a race.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RaceId(pub i64);

impl fmt::Display for TeamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for CarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for RaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// A racing team with its members and money.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: TeamId,
    /// Unique team name.
    pub name: String,
    pub members: Vec<String>,
    /// Budget in USD. May go negative; no floor is enforced.
    pub budget_usd: Decimal,
}

/// A registered car. Immutable once stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Car {
    pub id: CarId,
    pub name: String,
    /// Owning team; unassigned cars never race.
    pub team_id: Option<TeamId>,
    /// Baseline speed in km/h (> 0).
    pub speed_kmh: f64,
    /// Normalized durability in [0,1].
    pub durability: f64,
    /// Normalized acceleration in [0,1].
    pub acceleration: f64,
}

/// A car joined with the name of its owning team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarEntry {
    pub car: Car,
    pub team_name: Option<String>,
}

/// A race on a single track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub id: RaceId,
    pub track_name: String,
    /// Set exactly once, at settlement.
    pub winner_team_id: Option<TeamId>,
    pub created_at: Option<NaiveDateTime>,
}

/// One car's outcome in a settled race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceResult {
    pub car_id: CarId,
    /// Finish time in minutes, rounded to three decimals.
    pub time_minutes: f64,
    /// 1-based, unique and contiguous per race.
    pub position: u32,
}

/// A stored result joined with car and team details.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceResultRow {
    pub result_id: i64,
    pub race_id: RaceId,
    pub car_id: CarId,
    pub car_name: Option<String>,
    pub team_id: Option<TeamId>,
    pub team_name: Option<String>,
    pub time_minutes: f64,
    pub position: u32,
}

/// Registration request for a team.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTeam {
    pub name: String,
    pub members: Vec<String>,
    pub budget_usd: Decimal,
}

/// Registration request for a car.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCar {
    pub name: String,
    pub team_id: Option<TeamId>,
    pub speed_kmh: f64,
    pub durability: f64,
    pub acceleration: f64,
}

/// A track with its terrain speed factor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    /// Multiplier on effective speed, in (0, 1].
    pub factor: f64,
    #[serde(default)]
    pub description: String,
}

/// Bounds of the uniform random speed perturbation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variability {
    pub lo: f64,
    pub hi: f64,
}

impl Default for Variability {
    fn default() -> Self {
        Self { lo: 0.95, hi: 1.05 }
    }
}

impl Variability {
    /// A degenerate range that always draws `factor`.
    pub fn fixed(factor: f64) -> Self {
        Self {
            lo: factor,
            hi: factor,
        }
    }

    /// Require finite bounds with `0 < lo <= hi` and a finite width.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.lo.is_finite() && self.hi.is_finite() && (self.hi - self.lo).is_finite())
            || self.lo <= 0.0
            || self.lo > self.hi
            || self.hi > MAX_VARIABILITY
        {
            return Err(ValidationError::InvalidVariability {
                lo: self.lo,
                hi: self.hi,
            });
        }
        Ok(())
    }
}

/// Race defaults and catalog extensions, usually loaded from YAML.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    /// Fee charged to every participating team.
    pub participation_fee: Decimal,
    /// Prize credited to the winning team.
    pub prize: Decimal,
    pub distance_km: f64,
    pub variability: Variability,
    /// Seed for deterministic races; entropy-seeded when absent.
    pub rng_seed: Option<u64>,
    /// Extra tracks added to the built-in catalog.
    pub tracks: Vec<Track>,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            participation_fee: Decimal::new(1000, 0),
            prize: Decimal::new(5000, 0),
            distance_km: DEFAULT_DISTANCE_KM,
            variability: Variability::default(),
            rng_seed: None,
            tracks: Vec::new(),
        }
    }
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// Track name is not in the catalog.
    #[error("unknown track: {0}")]
    UnknownTrack(String),
    /// No team-owned car is available to race.
    #[error("no eligible cars")]
    NoEligibleCars,
    /// Car speed must be strictly positive.
    #[error("speed must be > 0, got {0}")]
    NonPositiveSpeed(f64),
    /// Race distance must be strictly positive.
    #[error("distance must be > 0, got {0}")]
    NonPositiveDistance(f64),
    /// Track factor must be within (0, 1] for catalog entries and > 0 for timing.
    #[error("invalid track factor: {0}")]
    InvalidTrackFactor(f64),
    /// Variability bounds must satisfy 0 < lo <= hi <= MAX_VARIABILITY.
    #[error("invalid variability range [{lo}, {hi}]")]
    InvalidVariability { lo: f64, hi: f64 },
    /// Numeric field must be finite.
    #[error("non-finite numeric value encountered")]
    NonFinite,
    /// Fee, prize or starting budget must be non-negative.
    #[error("negative monetary value is invalid")]
    NegativeMoney,
    /// Money is stored in whole cents.
    #[error("monetary value {0} has more than two decimal places")]
    SubCentMoney(Decimal),
    /// A required name was blank.
    #[error("{0} name is required")]
    BlankName(&'static str),
}

/// Validate a team registration.
pub fn validate_new_team(t: &NewTeam) -> Result<(), ValidationError> {
    if t.name.trim().is_empty() {
        return Err(ValidationError::BlankName("team"));
    }
    if t.budget_usd < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    require_whole_cents(t.budget_usd)
}

/// Validate a car registration.
pub fn validate_new_car(c: &NewCar) -> Result<(), ValidationError> {
    if c.name.trim().is_empty() {
        return Err(ValidationError::BlankName("car"));
    }
    if !(c.speed_kmh.is_finite() && c.durability.is_finite() && c.acceleration.is_finite()) {
        return Err(ValidationError::NonFinite);
    }
    if c.speed_kmh <= 0.0 {
        return Err(ValidationError::NonPositiveSpeed(c.speed_kmh));
    }
    Ok(())
}

/// Validate a catalog track.
pub fn validate_track(t: &Track) -> Result<(), ValidationError> {
    if t.name.trim().is_empty() {
        return Err(ValidationError::BlankName("track"));
    }
    if !t.factor.is_finite() || t.factor <= 0.0 || t.factor > 1.0 {
        return Err(ValidationError::InvalidTrackFactor(t.factor));
    }
    Ok(())
}

fn require_whole_cents(amount: Decimal) -> Result<(), ValidationError> {
    if amount.normalize().scale() > 2 {
        return Err(ValidationError::SubCentMoney(amount));
    }
    Ok(())
}

/// Validate the money moved by one race. Amounts must be non-negative whole cents.
pub fn validate_race_money(fee: Decimal, prize: Decimal) -> Result<(), ValidationError> {
    if fee < Decimal::ZERO || prize < Decimal::ZERO {
        return Err(ValidationError::NegativeMoney);
    }
    require_whole_cents(fee)?;
    require_whole_cents(prize)
}

/// Validate a full race configuration, including its extra tracks.
pub fn validate_race_config(cfg: &RaceConfig) -> Result<(), ValidationError> {
    validate_race_money(cfg.participation_fee, cfg.prize)?;
    if !cfg.distance_km.is_finite() || cfg.distance_km <= 0.0 {
        return Err(ValidationError::NonPositiveDistance(cfg.distance_km));
    }
    cfg.variability.validate()?;
    for t in &cfg.tracks {
        validate_track(t)?;
    }
    Ok(())
}

/// Split a comma-separated member list, dropping blanks.
pub fn parse_members(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Inverse of [`parse_members`].
pub fn join_members(members: &[String]) -> String {
    members.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn car(name: &str, speed: f64) -> NewCar {
        NewCar {
            name: name.to_string(),
            team_id: Some(TeamId(1)),
            speed_kmh: speed,
            durability: 0.85,
            acceleration: 0.9,
        }
    }

    #[test]
    fn blank_names_rejected() {
        let t = NewTeam {
            name: "  ".into(),
            members: vec![],
            budget_usd: Decimal::new(10_000, 0),
        };
        assert_eq!(validate_new_team(&t), Err(ValidationError::BlankName("team")));
        assert_eq!(
            validate_new_car(&car("", 200.0)),
            Err(ValidationError::BlankName("car"))
        );
    }

    #[test]
    fn car_speed_must_be_positive() {
        assert!(validate_new_car(&car("Rocket", 220.0)).is_ok());
        assert_eq!(
            validate_new_car(&car("Brick", 0.0)),
            Err(ValidationError::NonPositiveSpeed(0.0))
        );
        assert_eq!(
            validate_new_car(&car("Ghost", f64::NAN)),
            Err(ValidationError::NonFinite)
        );
    }

    #[test]
    fn variability_bounds() {
        assert!(Variability::default().validate().is_ok());
        assert!(Variability::fixed(1.0).validate().is_ok());
        assert!(Variability { lo: 1.1, hi: 1.0 }.validate().is_err());
        assert!(Variability { lo: 0.0, hi: 1.0 }.validate().is_err());
        assert!(Variability { lo: 0.9, hi: f64::INFINITY }.validate().is_err());
        assert_eq!(
            Variability { lo: 1.0, hi: f64::MAX }.validate(),
            Err(ValidationError::InvalidVariability { lo: 1.0, hi: f64::MAX })
        );
        assert!(Variability { lo: 0.5, hi: MAX_VARIABILITY }.validate().is_ok());
    }

    #[test]
    fn race_money_non_negative() {
        assert!(validate_race_money(Decimal::ZERO, Decimal::ZERO).is_ok());
        assert_eq!(
            validate_race_money(Decimal::new(-1, 0), Decimal::ZERO),
            Err(ValidationError::NegativeMoney)
        );
    }

    #[test]
    fn race_money_whole_cents() {
        assert!(validate_race_money(Decimal::new(25050, 2), Decimal::new(5_000_000, 3)).is_ok());
        assert_eq!(
            validate_race_money(Decimal::new(5, 3), Decimal::ZERO),
            Err(ValidationError::SubCentMoney(Decimal::new(5, 3)))
        );
        assert_eq!(
            validate_race_money(Decimal::ZERO, Decimal::new(125, 3)),
            Err(ValidationError::SubCentMoney(Decimal::new(125, 3)))
        );
        let t = NewTeam {
            name: "Red".into(),
            members: vec![],
            budget_usd: Decimal::new(10_0001, 3),
        };
        assert_eq!(
            validate_new_team(&t),
            Err(ValidationError::SubCentMoney(Decimal::new(10_0001, 3)))
        );
    }

    #[test]
    fn track_factor_range() {
        let mut t = Track {
            name: "Ice Lake".into(),
            factor: 0.8,
            description: String::new(),
        };
        assert!(validate_track(&t).is_ok());
        t.factor = 1.2;
        assert_eq!(validate_track(&t), Err(ValidationError::InvalidTrackFactor(1.2)));
    }

    #[test]
    fn members_split_and_trimmed() {
        let m = parse_members(" Alice, Bob ,,Carol ");
        assert_eq!(m, vec!["Alice", "Bob", "Carol"]);
        assert_eq!(join_members(&m), "Alice,Bob,Carol");
        assert!(parse_members("").is_empty());
    }

    #[test]
    fn config_from_partial_yaml() {
        let yaml = "prize: 7500\nrng_seed: 7\ntracks:\n  - name: Ice Lake\n    factor: 0.85\n";
        let cfg: RaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.prize, Decimal::new(7500, 0));
        assert_eq!(cfg.participation_fee, Decimal::new(1000, 0));
        assert_eq!(cfg.rng_seed, Some(7));
        assert_eq!(cfg.tracks.len(), 1);
        validate_race_config(&cfg).unwrap();
    }

    #[test]
    fn race_serializes_without_winner() {
        let r = Race {
            id: RaceId(3),
            track_name: "Forest Run".into(),
            winner_team_id: None,
            created_at: None,
        };
        let s = serde_json::to_string(&r).unwrap();
        let back: Race = serde_json::from_str(&s).unwrap();
        assert_eq!(back, r);
    }

    proptest! {
        #[test]
        fn valid_variability_accepted(lo in 0.01f64..2.0, span in 0.0f64..1.0) {
            let v = Variability { lo, hi: lo + span };
            prop_assert!(v.validate().is_ok());
        }
    }
}

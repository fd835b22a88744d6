#![deny(warnings)]

//! Race settlement engine.
//!
//! One call to [`settle_race`] runs a single race end to end:
//! - picks every team-owned car as an entrant
//! - times each entrant on the chosen track
//! - ranks by time, earliest roster entry winning ties
//! - persists results, winner, fees and prize in one atomic group
//!
//! Validation happens before the store is written to; once the atomic group
//! starts, any failure rolls the whole race back.

use persistence::{expect_rows, PersistenceError, RallyDb};
use rally_core::{
    validate_race_money, CarEntry, CarId, RaceConfig, RaceId, RaceResult, Team, TeamId,
    ValidationError, Variability, DEFAULT_DISTANCE_KM,
};
use rally_sim::{race_time_minutes, CarPerformance, TrackCatalog};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by a settlement attempt.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Bad input; nothing was written.
    #[error("invalid race: {0}")]
    Validation(#[from] ValidationError),
    /// The atomic group failed and was rolled back.
    #[error("settlement failed: {0}")]
    Persistence(#[from] PersistenceError),
}

/// Parameters of one race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceRequest {
    pub track_name: String,
    /// Charged to every team with a car in the race.
    pub participation_fee: Decimal,
    /// Credited to the winning team.
    pub prize: Decimal,
    pub distance_km: f64,
    pub variability: Variability,
}

impl RaceRequest {
    pub fn new(track_name: impl Into<String>, participation_fee: Decimal, prize: Decimal) -> Self {
        Self {
            track_name: track_name.into(),
            participation_fee,
            prize,
            distance_km: DEFAULT_DISTANCE_KM,
            variability: Variability::default(),
        }
    }

    /// Request using the money, distance and variability from `cfg`.
    pub fn from_config(track_name: impl Into<String>, cfg: &RaceConfig) -> Self {
        Self {
            track_name: track_name.into(),
            participation_fee: cfg.participation_fee,
            prize: cfg.prize,
            distance_km: cfg.distance_km,
            variability: cfg.variability,
        }
    }
}

/// A car taking part in a race, with its owning team.
#[derive(Clone, Debug, PartialEq)]
pub struct Entrant {
    pub car_id: CarId,
    pub car_name: String,
    pub team_id: TeamId,
    pub team_name: Option<String>,
    pub performance: CarPerformance,
}

/// One line of the final classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Standing {
    pub position: u32,
    pub car_id: CarId,
    pub car_name: String,
    pub team_id: TeamId,
    pub team_name: Option<String>,
    pub time_minutes: f64,
}

/// What a successful settlement wrote.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceOutcome {
    pub race_id: RaceId,
    pub track_name: String,
    pub winner_team_id: TeamId,
    pub winner_team_name: Option<String>,
    pub standings: Vec<Standing>,
    /// Number of teams charged the participation fee.
    pub teams_charged: u64,
    pub participation_fee: Decimal,
    pub prize: Decimal,
}

/// A team's budget around one race.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BudgetChange {
    pub team_id: TeamId,
    pub team_name: String,
    pub before: Decimal,
    pub after: Decimal,
    pub delta: Decimal,
}

/// Settlement outcome plus per-team budget movement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaceReport {
    pub outcome: RaceOutcome,
    pub budgets: Vec<BudgetChange>,
}

/// Keep the cars that belong to a team, in roster order.
pub fn eligible_roster(cars: &[CarEntry]) -> Vec<Entrant> {
    cars.iter()
        .filter_map(|e| {
            e.car.team_id.map(|team_id| Entrant {
                car_id: e.car.id,
                car_name: e.car.name.clone(),
                team_id,
                team_name: e.team_name.clone(),
                performance: CarPerformance::from(&e.car),
            })
        })
        .collect()
}

/// Sort timed entrants into positions 1..N. The sort is stable, so equal
/// times keep roster order.
pub fn rank_standings(mut timed: Vec<(Entrant, f64)>) -> Vec<Standing> {
    timed.sort_by(|a, b| a.1.total_cmp(&b.1));
    timed
        .into_iter()
        .zip(1u32..)
        .map(|((e, time_minutes), position)| Standing {
            position,
            car_id: e.car_id,
            car_name: e.car_name,
            team_id: e.team_id,
            team_name: e.team_name,
            time_minutes,
        })
        .collect()
}

/// Time every entrant once and rank them. Pure apart from the RNG.
pub fn run_heat<R: Rng>(
    roster: &[Entrant],
    track_factor: f64,
    distance_km: f64,
    variability: Variability,
    rng: &mut R,
) -> Result<Vec<Standing>, ValidationError> {
    let mut timed = Vec::with_capacity(roster.len());
    for e in roster {
        let t = race_time_minutes(&e.performance, track_factor, distance_km, variability, rng)?;
        debug!(car_id = e.car_id.0, team_id = e.team_id.0, minutes = t, "car finished");
        timed.push((e.clone(), t));
    }
    Ok(rank_standings(timed))
}

/// Per-team before/after budgets, sorted by team name.
///
/// Teams missing from `after` are reported with a zero balance.
pub fn budget_changes(before: &[Team], after: &[Team]) -> Vec<BudgetChange> {
    let mut rows: Vec<BudgetChange> = before
        .iter()
        .map(|t| {
            let now = after
                .iter()
                .find(|a| a.id == t.id)
                .map(|a| a.budget_usd)
                .unwrap_or(Decimal::ZERO);
            BudgetChange {
                team_id: t.id,
                team_name: t.name.clone(),
                before: t.budget_usd,
                after: now,
                delta: now - t.budget_usd,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.team_name.cmp(&b.team_name));
    rows
}

/// Run one race and settle it atomically.
pub async fn settle_race<R: Rng>(
    db: &RallyDb,
    catalog: &TrackCatalog,
    req: &RaceRequest,
    rng: &mut R,
) -> Result<RaceOutcome, SettlementError> {
    validate_race_money(req.participation_fee, req.prize)?;
    let track = catalog.require(&req.track_name)?.clone();

    let cars = db.list_cars_with_team_info().await?;
    let roster = eligible_roster(&cars);
    if roster.is_empty() {
        warn!(track = %track.name, cars = cars.len(), "race aborted: no eligible cars");
        return Err(ValidationError::NoEligibleCars.into());
    }

    let standings = run_heat(&roster, track.factor, req.distance_km, req.variability, rng)?;
    let (winner, winner_name) = match standings.first() {
        Some(s) => (s.team_id, s.team_name.clone()),
        None => return Err(ValidationError::NoEligibleCars.into()),
    };
    let teams: BTreeSet<TeamId> = roster.iter().map(|e| e.team_id).collect();
    let expected_debits = teams.len() as u64;
    let results: Vec<RaceResult> = standings
        .iter()
        .map(|s| RaceResult {
            car_id: s.car_id,
            time_minutes: s.time_minutes,
            position: s.position,
        })
        .collect();
    let expected_results = results.len() as u64;

    let fee = req.participation_fee;
    let prize = req.prize;
    let track_name = track.name.clone();
    let settled = db
        .run_atomically(move |scope| {
            Box::pin(async move {
                let race_id = scope.create_race(&track_name).await?;
                let written = scope.insert_race_results(race_id, &results).await?;
                expect_rows("insert_race_results", expected_results, written)?;
                let n = scope.set_race_winner(race_id, winner).await?;
                expect_rows("set_race_winner", 1, n)?;
                let charged = scope.debit_teams_with_cars(fee).await?;
                expect_rows("debit_teams_with_cars", expected_debits, charged)?;
                let n = scope.credit_team(winner, prize).await?;
                if n == 0 {
                    return Err(PersistenceError::MissingTarget {
                        what: "team",
                        id: winner.0,
                    });
                }
                Ok::<_, PersistenceError>((race_id, charged))
            })
        })
        .await;

    let (race_id, teams_charged) = match settled {
        Ok(v) => v,
        Err(e) => {
            warn!(track = %track.name, error = %e, "race rolled back");
            return Err(e.into());
        }
    };
    info!(
        race_id = race_id.0,
        track = %track.name,
        winner = winner.0,
        cars = standings.len(),
        teams_charged,
        "race settled"
    );
    Ok(RaceOutcome {
        race_id,
        track_name: track.name,
        winner_team_id: winner,
        winner_team_name: winner_name,
        standings,
        teams_charged,
        participation_fee: fee,
        prize,
    })
}

/// [`settle_race`] plus a before/after budget snapshot of every team.
pub async fn settle_race_with_report<R: Rng>(
    db: &RallyDb,
    catalog: &TrackCatalog,
    req: &RaceRequest,
    rng: &mut R,
) -> Result<RaceReport, SettlementError> {
    let before = db.list_teams().await?;
    let outcome = settle_race(db, catalog, req, rng).await?;
    let after = db.list_teams().await?;
    Ok(RaceReport {
        outcome,
        budgets: budget_changes(&before, &after),
    })
}

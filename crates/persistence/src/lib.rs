#![deny(warnings)]

//! Persistence layer: SQLite store for teams, cars, races and results.
//!
//! Reads and single-row registrations go straight through the pool. Grouped
//! writes go through an [`AtomicScope`], either opened explicitly with
//! [`RallyDb::begin`] or managed by [`RallyDb::run_atomically`].

mod scope;

pub use scope::{AtomicScope, BoxFuture};

use chrono::NaiveDateTime;
use rally_core::{
    join_members, parse_members, validate_new_car, validate_new_team, Car, CarEntry, CarId,
    NewCar, NewTeam, Race, RaceId, RaceResultRow, Team, TeamId, ValidationError,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    /// Team names are unique.
    #[error("team name already taken: {0}")]
    DuplicateTeam(String),
    /// A mutation target that must exist was absent.
    #[error("{what} {id} not found")]
    MissingTarget { what: &'static str, id: i64 },
    /// A grouped write touched a different number of rows than required.
    #[error("{op}: expected {expected} rows, touched {actual}")]
    UnexpectedRowCount {
        op: &'static str,
        expected: u64,
        actual: u64,
    },
    /// Amount does not fit in i64 cents.
    #[error("monetary value out of range: {0}")]
    MoneyOverflow(Decimal),
}

/// Returns the default SQLite URL used for local saves.
pub fn default_sqlite_url() -> &'static str {
    "sqlite://./saves/rally.db"
}

/// Convert a USD amount to whole cents, rounding to two decimals first.
pub fn decimal_to_cents_i64(d: Decimal) -> Option<i64> {
    d.round_dp(2).checked_mul(Decimal::ONE_HUNDRED)?.to_i64()
}

pub fn cents_to_decimal(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub(crate) fn decimal_to_cents(d: Decimal) -> Result<i64, PersistenceError> {
    decimal_to_cents_i64(d).ok_or(PersistenceError::MoneyOverflow(d))
}

/// Fail unless a grouped write touched exactly `expected` rows.
pub fn expect_rows(op: &'static str, expected: u64, actual: u64) -> Result<(), PersistenceError> {
    if expected != actual {
        return Err(PersistenceError::UnexpectedRowCount {
            op,
            expected,
            actual,
        });
    }
    Ok(())
}

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS teams (
        team_id INTEGER PRIMARY KEY AUTOINCREMENT,
        team_name TEXT NOT NULL UNIQUE,
        members TEXT NOT NULL DEFAULT '',
        budget_cents INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS cars (
        car_id INTEGER PRIMARY KEY AUTOINCREMENT,
        car_name TEXT NOT NULL,
        team_id INTEGER REFERENCES teams(team_id),
        speed REAL NOT NULL,
        durability REAL NOT NULL,
        acceleration REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS races (
        race_id INTEGER PRIMARY KEY AUTOINCREMENT,
        track_name TEXT NOT NULL,
        winner_team_id INTEGER REFERENCES teams(team_id),
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS race_results (
        result_id INTEGER PRIMARY KEY AUTOINCREMENT,
        race_id INTEGER NOT NULL REFERENCES races(race_id),
        car_id INTEGER NOT NULL REFERENCES cars(car_id),
        time_taken REAL NOT NULL,
        position INTEGER NOT NULL,
        UNIQUE (race_id, position),
        UNIQUE (race_id, car_id)
    )",
];

fn team_from_row(row: &SqliteRow) -> Result<Team, sqlx::Error> {
    let members: String = row.try_get("members")?;
    Ok(Team {
        id: TeamId(row.try_get("team_id")?),
        name: row.try_get("team_name")?,
        members: parse_members(&members),
        budget_usd: cents_to_decimal(row.try_get("budget_cents")?),
    })
}

fn car_entry_from_row(row: &SqliteRow) -> Result<CarEntry, sqlx::Error> {
    let team_id: Option<i64> = row.try_get("team_id")?;
    Ok(CarEntry {
        car: Car {
            id: CarId(row.try_get("car_id")?),
            name: row.try_get("car_name")?,
            team_id: team_id.map(TeamId),
            speed_kmh: row.try_get("speed")?,
            durability: row.try_get("durability")?,
            acceleration: row.try_get("acceleration")?,
        },
        team_name: row.try_get("team_name")?,
    })
}

fn race_from_row(row: &SqliteRow) -> Result<Race, sqlx::Error> {
    let winner: Option<i64> = row.try_get("winner_team_id")?;
    let created: Option<String> = row.try_get("created_at")?;
    Ok(Race {
        id: RaceId(row.try_get("race_id")?),
        track_name: row.try_get("track_name")?,
        winner_team_id: winner.map(TeamId),
        created_at: created
            .and_then(|s| NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S").ok()),
    })
}

fn result_from_row(row: &SqliteRow) -> Result<RaceResultRow, sqlx::Error> {
    let team_id: Option<i64> = row.try_get("team_id")?;
    Ok(RaceResultRow {
        result_id: row.try_get("result_id")?,
        race_id: RaceId(row.try_get("race_id")?),
        car_id: CarId(row.try_get("car_id")?),
        car_name: row.try_get("car_name")?,
        team_id: team_id.map(TeamId),
        team_name: row.try_get("team_name")?,
        time_minutes: row.try_get("time_taken")?,
        position: row.try_get("position")?,
    })
}

/// Handle to the rally database.
#[derive(Clone, Debug)]
pub struct RallyDb {
    pool: SqlitePool,
}

impl RallyDb {
    /// Open (creating if needed) the database at `url` and ensure tables exist.
    pub async fn connect(url: &str) -> Result<Self, PersistenceError> {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"));
        if let Some(path) = path.filter(|p| !p.starts_with(":memory:")) {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
        }
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        info!(url, "rally store opened");
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs.
    ///
    /// Limited to one connection that is never recycled, since each SQLite
    /// memory connection is a separate database.
    pub async fn in_memory() -> Result<Self, PersistenceError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create missing tables. Existing tables are left untouched.
    pub async fn init_schema(&self) -> Result<(), PersistenceError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open an atomic write scope.
    pub async fn begin(&self) -> Result<AtomicScope, PersistenceError> {
        Ok(AtomicScope::new(self.pool.begin().await?))
    }

    /// Run `block` inside one transaction: commit if it returns `Ok`, roll
    /// back otherwise. The block's error is returned unchanged.
    ///
    /// Example:
    /// db.run_atomically(|scope| Box::pin(async move {
    ///     let race = scope.create_race("Forest Run").await?;
    ///     Ok::<_, PersistenceError>(race)
    /// })).await?;
    pub async fn run_atomically<T, E, F>(&self, block: F) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut AtomicScope) -> BoxFuture<'s, Result<T, E>>,
        E: From<PersistenceError>,
    {
        let mut scope = self.begin().await?;
        let outcome = block(&mut scope).await;
        match outcome {
            Ok(value) => {
                scope.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = scope.rollback().await {
                    warn!(error = %rb, "rollback failed; transaction dropped");
                }
                Err(e)
            }
        }
    }

    /// Register a team. Names are unique.
    pub async fn add_team(&self, team: &NewTeam) -> Result<TeamId, PersistenceError> {
        validate_new_team(team)?;
        let name = team.name.trim();
        let budget = decimal_to_cents(team.budget_usd)?;
        let res = sqlx::query("INSERT INTO teams (team_name, members, budget_cents) VALUES (?, ?, ?)")
            .bind(name)
            .bind(join_members(&team.members))
            .bind(budget)
            .execute(&self.pool)
            .await;
        match res {
            Ok(done) => {
                let id = TeamId(done.last_insert_rowid());
                info!(team_id = id.0, name, "team registered");
                Ok(id)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(PersistenceError::DuplicateTeam(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT team_id, team_name, members, budget_cents FROM teams ORDER BY team_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let teams = rows.iter().map(team_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(teams)
    }

    pub async fn team_by_name(&self, name: &str) -> Result<Option<Team>, PersistenceError> {
        let row = sqlx::query(
            "SELECT team_id, team_name, members, budget_cents FROM teams WHERE team_name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let found = row.as_ref().map(team_from_row).transpose()?;
        Ok(found)
    }

    pub async fn team_budget(&self, team_id: TeamId) -> Result<Option<Decimal>, PersistenceError> {
        let cents: Option<i64> =
            sqlx::query_scalar("SELECT budget_cents FROM teams WHERE team_id = ?")
                .bind(team_id.0)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cents.map(cents_to_decimal))
    }

    /// Add `delta` (possibly negative) to a team's budget. Returns rows touched.
    pub async fn update_team_budget_delta(
        &self,
        team_id: TeamId,
        delta: Decimal,
    ) -> Result<u64, PersistenceError> {
        let cents = decimal_to_cents(delta)?;
        let n = sqlx::query("UPDATE teams SET budget_cents = budget_cents + ? WHERE team_id = ?")
            .bind(cents)
            .bind(team_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(n)
    }

    /// Register a car. An owning team, when given, must exist.
    pub async fn add_car(&self, car: &NewCar) -> Result<CarId, PersistenceError> {
        validate_new_car(car)?;
        if let Some(team_id) = car.team_id {
            if self.team_budget(team_id).await?.is_none() {
                return Err(PersistenceError::MissingTarget {
                    what: "team",
                    id: team_id.0,
                });
            }
        }
        let id = sqlx::query(
            "INSERT INTO cars (car_name, team_id, speed, durability, acceleration) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(car.name.trim())
        .bind(car.team_id.map(|t| t.0))
        .bind(car.speed_kmh)
        .bind(car.durability)
        .bind(car.acceleration)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        info!(car_id = id, name = car.name.trim(), "car registered");
        Ok(CarId(id))
    }

    /// All cars with their owning team's name, ordered by id.
    pub async fn list_cars_with_team_info(&self) -> Result<Vec<CarEntry>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT c.car_id, c.car_name, c.team_id, t.team_name, c.speed, c.durability, c.acceleration \
             FROM cars c LEFT JOIN teams t ON c.team_id = t.team_id \
             ORDER BY c.car_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let cars = rows.iter().map(car_entry_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(cars)
    }

    pub async fn race(&self, race_id: RaceId) -> Result<Option<Race>, PersistenceError> {
        let row = sqlx::query(
            "SELECT race_id, track_name, winner_team_id, created_at FROM races WHERE race_id = ?",
        )
        .bind(race_id.0)
        .fetch_optional(&self.pool)
        .await?;
        let found = row.as_ref().map(race_from_row).transpose()?;
        Ok(found)
    }

    pub async fn list_races(&self) -> Result<Vec<Race>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT race_id, track_name, winner_team_id, created_at FROM races ORDER BY race_id",
        )
        .fetch_all(&self.pool)
        .await?;
        let races = rows.iter().map(race_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(races)
    }

    /// Results of one race with car and team details, best position first.
    pub async fn get_race_results(
        &self,
        race_id: RaceId,
    ) -> Result<Vec<RaceResultRow>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT rr.result_id, rr.race_id, rr.car_id, c.car_name, c.team_id, t.team_name, \
                    rr.time_taken, rr.position \
             FROM race_results rr \
             LEFT JOIN cars c ON rr.car_id = c.car_id \
             LEFT JOIN teams t ON c.team_id = t.team_id \
             WHERE rr.race_id = ? \
             ORDER BY rr.position ASC",
        )
        .bind(race_id.0)
        .fetch_all(&self.pool)
        .await?;
        let results = rows.iter().map(result_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(results)
    }
}

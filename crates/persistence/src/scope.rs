//! Atomic write scope: one SQLite transaction behind an explicit handle.

use crate::{decimal_to_cents, PersistenceError};
use rally_core::{RaceId, RaceResult, TeamId};
use rust_decimal::Decimal;
use sqlx::{Sqlite, Transaction};
use std::future::Future;
use std::pin::Pin;
use tracing::debug;

/// Boxed future returned by [`crate::RallyDb::run_atomically`] blocks.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Handle for a group of writes that land together or not at all.
///
/// Dropping the scope without [`commit`](Self::commit) rolls the group back.
pub struct AtomicScope {
    tx: Transaction<'static, Sqlite>,
}

impl AtomicScope {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self { tx }
    }

    /// Insert a race on `track_name` with no winner yet.
    pub async fn create_race(&mut self, track_name: &str) -> Result<RaceId, PersistenceError> {
        let id = sqlx::query("INSERT INTO races (track_name) VALUES (?)")
            .bind(track_name)
            .execute(&mut *self.tx)
            .await?
            .last_insert_rowid();
        debug!(race_id = id, track_name, "race created");
        Ok(RaceId(id))
    }

    /// Bulk insert results for one race. Returns rows written.
    pub async fn insert_race_results(
        &mut self,
        race_id: RaceId,
        results: &[RaceResult],
    ) -> Result<u64, PersistenceError> {
        let mut written = 0;
        for r in results {
            written += sqlx::query(
                "INSERT INTO race_results (race_id, car_id, time_taken, position) VALUES (?, ?, ?, ?)",
            )
            .bind(race_id.0)
            .bind(r.car_id.0)
            .bind(r.time_minutes)
            .bind(r.position)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        }
        debug!(race_id = race_id.0, written, "race results inserted");
        Ok(written)
    }

    /// Record the winner of a race that has none yet. Returns 0 if already set.
    pub async fn set_race_winner(
        &mut self,
        race_id: RaceId,
        winner: TeamId,
    ) -> Result<u64, PersistenceError> {
        let n = sqlx::query(
            "UPDATE races SET winner_team_id = ? WHERE race_id = ? AND winner_team_id IS NULL",
        )
            .bind(winner.0)
            .bind(race_id.0)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(n)
    }

    /// Charge `fee` to every team that owns at least one car.
    pub async fn debit_teams_with_cars(&mut self, fee: Decimal) -> Result<u64, PersistenceError> {
        let cents = decimal_to_cents(fee)?;
        let n = sqlx::query(
            "UPDATE teams SET budget_cents = budget_cents - ? \
             WHERE team_id IN (SELECT DISTINCT team_id FROM cars WHERE team_id IS NOT NULL)",
        )
        .bind(cents)
        .execute(&mut *self.tx)
        .await?
        .rows_affected();
        debug!(fee_cents = cents, teams = n, "participation fee debited");
        Ok(n)
    }

    pub async fn credit_team(
        &mut self,
        team_id: TeamId,
        amount: Decimal,
    ) -> Result<u64, PersistenceError> {
        let cents = decimal_to_cents(amount)?;
        let n = sqlx::query("UPDATE teams SET budget_cents = budget_cents + ? WHERE team_id = ?")
            .bind(cents)
            .bind(team_id.0)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        debug!(team_id = team_id.0, amount_cents = cents, "team credited");
        Ok(n)
    }

    pub async fn commit(self) -> Result<(), PersistenceError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn rollback(self) -> Result<(), PersistenceError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

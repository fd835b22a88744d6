#![deny(warnings)]

//! Headless CLI for registering teams and cars and running rally races.

use anyhow::{anyhow, bail, Context, Result};
use persistence::{default_sqlite_url, RallyDb};
use rally_core::{parse_members, validate_race_config, NewCar, NewTeam, RaceConfig, RaceId};
use rally_runtime::{settle_race_with_report, RaceRequest};
use rally_sim::{race_rng, TrackCatalog};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: rally [--db URL] [--config FILE] <command>
  tracks
  teams
  team-add --name N [--members \"A,B\"] [--budget 10000]
  cars
  car-add --name N [--team NAME] [--speed 220] [--durability 0.85] [--acceleration 0.90]
  race --track T [--fee F] [--prize P] [--seed S] [--json]
  races
  results --race ID";

#[derive(Debug, PartialEq)]
enum Command {
    Tracks,
    Teams,
    TeamAdd {
        name: String,
        members: String,
        budget: Decimal,
    },
    Cars,
    CarAdd {
        name: String,
        team: Option<String>,
        speed: f64,
        durability: f64,
        acceleration: f64,
    },
    Race {
        track: String,
        fee: Option<Decimal>,
        prize: Option<Decimal>,
        seed: Option<u64>,
        json: bool,
    },
    Races,
    Results {
        race: i64,
    },
}

#[derive(Debug, PartialEq)]
struct Args {
    db: Option<String>,
    config: Option<PathBuf>,
    command: Command,
}

fn parse_value<T>(opts: &BTreeMap<String, String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    opts.get(key)
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| anyhow!("invalid --{key} value {v:?}: {e}"))
        })
        .transpose()
}

fn required(opts: &BTreeMap<String, String>, key: &str) -> Result<String> {
    opts.get(key)
        .cloned()
        .ok_or_else(|| anyhow!("missing --{key}\n{USAGE}"))
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args> {
    let mut db = None;
    let mut config = None;
    let mut command: Option<String> = None;
    let mut opts: BTreeMap<String, String> = BTreeMap::new();
    let mut json = false;
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--db" => db = it.next(),
            "--config" => config = it.next().map(PathBuf::from),
            "--json" => json = true,
            flag if flag.starts_with("--") => {
                let value = it
                    .next()
                    .ok_or_else(|| anyhow!("{flag} expects a value"))?;
                opts.insert(flag.trim_start_matches("--").to_string(), value);
            }
            other if command.is_none() => command = Some(other.to_string()),
            other => bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }

    let command = match command.as_deref() {
        Some("tracks") => Command::Tracks,
        Some("teams") => Command::Teams,
        Some("team-add") => Command::TeamAdd {
            name: required(&opts, "name")?,
            members: opts.get("members").cloned().unwrap_or_default(),
            budget: parse_value(&opts, "budget")?.unwrap_or(Decimal::new(10_000, 0)),
        },
        Some("cars") => Command::Cars,
        Some("car-add") => Command::CarAdd {
            name: required(&opts, "name")?,
            team: opts.get("team").cloned(),
            speed: parse_value(&opts, "speed")?.unwrap_or(220.0),
            durability: parse_value(&opts, "durability")?.unwrap_or(0.85),
            acceleration: parse_value(&opts, "acceleration")?.unwrap_or(0.90),
        },
        Some("race") => Command::Race {
            track: required(&opts, "track")?,
            fee: parse_value(&opts, "fee")?,
            prize: parse_value(&opts, "prize")?,
            seed: parse_value(&opts, "seed")?,
            json,
        },
        Some("races") => Command::Races,
        Some("results") => Command::Results {
            race: parse_value(&opts, "race")?
                .ok_or_else(|| anyhow!("missing --race\n{USAGE}"))?,
        },
        Some(other) => bail!("unknown command {other:?}\n{USAGE}"),
        None => bail!("{USAGE}"),
    };
    Ok(Args {
        db,
        config,
        command,
    })
}

fn load_config(path: Option<&PathBuf>) -> Result<RaceConfig> {
    let cfg: RaceConfig = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)
                .with_context(|| format!("reading config {}", p.display()))?;
            serde_yaml::from_str(&text).with_context(|| format!("parsing config {}", p.display()))?
        }
        None => RaceConfig::default(),
    };
    validate_race_config(&cfg)?;
    Ok(cfg)
}

async fn print_results(db: &RallyDb, race: RaceId) -> Result<()> {
    let rows = db.get_race_results(race).await?;
    if rows.is_empty() {
        println!("No results for race {race}.");
        return Ok(());
    }
    println!("Race {race} results (minutes, lower is better)");
    println!("{:>3}  {:<20} {:<20} {:>10}", "POS", "CAR", "TEAM", "TIME");
    for r in rows {
        println!(
            "{:>3}  {:<20} {:<20} {:>10.3}",
            r.position,
            r.car_name.unwrap_or_default(),
            r.team_name.unwrap_or_default(),
            r.time_minutes
        );
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let cfg = load_config(args.config.as_ref())?;
    let mut catalog = TrackCatalog::builtin();
    catalog.extend(cfg.tracks.clone())?;

    if args.command == Command::Tracks {
        for t in catalog.tracks() {
            println!("{:<16} factor {:.2}  {}", t.name, t.factor, t.description);
        }
        return Ok(());
    }

    let url = args
        .db
        .or_else(|| std::env::var("RALLY_DB_URL").ok())
        .unwrap_or_else(|| default_sqlite_url().to_string());
    let db = RallyDb::connect(&url).await?;

    match args.command {
        Command::Tracks => {}
        Command::Teams => {
            println!("{:>4}  {:<20} {:>12}  MEMBERS", "ID", "TEAM", "BUDGET");
            for t in db.list_teams().await? {
                println!(
                    "{:>4}  {:<20} {:>12}  {}",
                    t.id,
                    t.name,
                    t.budget_usd,
                    t.members.join(", ")
                );
            }
        }
        Command::TeamAdd {
            name,
            members,
            budget,
        } => {
            let id = db
                .add_team(&NewTeam {
                    name: name.clone(),
                    members: parse_members(&members),
                    budget_usd: budget,
                })
                .await?;
            println!("Team '{}' added (ID {id}).", name.trim());
        }
        Command::Cars => {
            println!(
                "{:>4}  {:<20} {:<20} {:>7} {:>5} {:>5}",
                "ID", "CAR", "TEAM", "SPEED", "DUR", "ACC"
            );
            for e in db.list_cars_with_team_info().await? {
                println!(
                    "{:>4}  {:<20} {:<20} {:>7.1} {:>5.2} {:>5.2}",
                    e.car.id,
                    e.car.name,
                    e.team_name.unwrap_or_else(|| "-".into()),
                    e.car.speed_kmh,
                    e.car.durability,
                    e.car.acceleration
                );
            }
        }
        Command::CarAdd {
            name,
            team,
            speed,
            durability,
            acceleration,
        } => {
            let team_id = match team {
                Some(t) => Some(
                    db.team_by_name(&t)
                        .await?
                        .ok_or_else(|| anyhow!("no team named {t:?}"))?
                        .id,
                ),
                None => None,
            };
            let id = db
                .add_car(&NewCar {
                    name: name.clone(),
                    team_id,
                    speed_kmh: speed,
                    durability,
                    acceleration,
                })
                .await?;
            println!("Car '{}' added (ID {id}).", name.trim());
        }
        Command::Race {
            track,
            fee,
            prize,
            seed,
            json,
        } => {
            let mut req = RaceRequest::from_config(track, &cfg);
            if let Some(fee) = fee {
                req.participation_fee = fee;
            }
            if let Some(prize) = prize {
                req.prize = prize;
            }
            let mut rng = race_rng(seed.or(cfg.rng_seed));
            let report = settle_race_with_report(&db, &catalog, &req, &mut rng).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            let out = &report.outcome;
            println!(
                "Race {} finished! Winner: {}",
                out.race_id,
                out.winner_team_name.as_deref().unwrap_or("?")
            );
            print_results(&db, out.race_id).await?;
            println!();
            println!("Budgets (before/after race)");
            println!("{:<20} {:>12} {:>12} {:>10}", "TEAM", "BEFORE", "AFTER", "DELTA");
            for b in &report.budgets {
                println!(
                    "{:<20} {:>12} {:>12} {:>10}",
                    b.team_name, b.before, b.after, b.delta
                );
            }
        }
        Command::Races => {
            for r in db.list_races().await? {
                println!(
                    "{:>4}  {:<16} winner {:<6} {}",
                    r.id,
                    r.track_name,
                    r.winner_team_id
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "-".into()),
                    r.created_at.map(|d| d.to_string()).unwrap_or_default()
                );
            }
        }
        Command::Results { race } => print_results(&db, RaceId(race)).await?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logging setup
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    info!(command = ?args.command, "starting rally CLI");
    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn race_command_with_overrides() {
        let a = args(&["--db", "sqlite::memory:", "race", "--track", "Desert Loop", "--fee", "250.50", "--seed", "7", "--json"]).unwrap();
        assert_eq!(a.db.as_deref(), Some("sqlite::memory:"));
        assert_eq!(
            a.command,
            Command::Race {
                track: "Desert Loop".into(),
                fee: Some(Decimal::new(25050, 2)),
                prize: None,
                seed: Some(7),
                json: true,
            }
        );
    }

    #[test]
    fn car_add_defaults_match_form() {
        let a = args(&["car-add", "--name", "Rocket", "--team", "Red"]).unwrap();
        assert_eq!(
            a.command,
            Command::CarAdd {
                name: "Rocket".into(),
                team: Some("Red".into()),
                speed: 220.0,
                durability: 0.85,
                acceleration: 0.90,
            }
        );
    }

    #[test]
    fn team_add_default_budget() {
        let a = args(&["team-add", "--name", "Red", "--members", "Alice,Bob"]).unwrap();
        assert_eq!(
            a.command,
            Command::TeamAdd {
                name: "Red".into(),
                members: "Alice,Bob".into(),
                budget: Decimal::new(10_000, 0),
            }
        );
    }

    #[test]
    fn bad_input_rejected() {
        assert!(args(&[]).is_err());
        assert!(args(&["fly"]).is_err());
        assert!(args(&["race"]).is_err());
        assert!(args(&["results", "--race", "abc"]).is_err());
        assert!(args(&["team-add", "--name"]).is_err());
    }

    #[test]
    fn missing_config_uses_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, RaceConfig::default());
    }
}

use std::path::PathBuf;

use crate::planner::PriorityOrder;

const DEFAULT_DB_NAME: &str = "cadence.db";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub block_minutes: i64,
    pub granularity_minutes: i64,
    // Lets test environments plan next week before the weekend
    pub gate_bypass: bool,
    pub priority: PriorityOrder,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_NAME),
            block_minutes: 60,
            granularity_minutes: 30,
            gate_bypass: false,
            priority: PriorityOrder::RatingFirst,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let db_path = match lookup("CADENCE_DB") {
            Some(path) => PathBuf::from(path),
            None => default_db_path(),
        };

        let block_minutes = parse_minutes(lookup("CADENCE_BLOCK_MINUTES"), "CADENCE_BLOCK_MINUTES")
            .unwrap_or(defaults.block_minutes);
        let granularity_minutes = parse_minutes(
            lookup("CADENCE_GRANULARITY_MINUTES"),
            "CADENCE_GRANULARITY_MINUTES",
        )
        .unwrap_or(defaults.granularity_minutes);

        let gate_bypass = lookup("CADENCE_GATE_BYPASS")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        let priority = match lookup("CADENCE_PRIORITY") {
            Some(v) => PriorityOrder::from_str(&v).unwrap_or_else(|| {
                log::warn!("Unknown CADENCE_PRIORITY '{}', using rating order", v);
                defaults.priority
            }),
            None => defaults.priority,
        };

        Self {
            db_path,
            block_minutes,
            granularity_minutes,
            gate_bypass,
            priority,
        }
    }
}

fn parse_minutes(raw: Option<String>, key: &str) -> Option<i64> {
    let raw = raw?;
    match raw.trim().parse::<i64>() {
        Ok(minutes) if minutes > 0 => Some(minutes),
        _ => {
            log::warn!("Ignoring invalid {}='{}'", key, raw);
            None
        }
    }
}

fn default_db_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cadence");

    std::fs::create_dir_all(&config_dir).ok();
    config_dir.join(DEFAULT_DB_NAME)
}

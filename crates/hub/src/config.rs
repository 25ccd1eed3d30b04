//! TOML config file loading, validation, and database seeding for devices.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::clock::CalendarZone;
use crate::db::Db;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub topics: TopicConfig,
    /// Fixed offset such as `"+07:00"` defining the calendar day. Host local
    /// time when absent.
    pub utc_offset: Option<String>,
    /// How long a published command's attribution waits for its ACK.
    #[serde(default = "default_pending_ttl")]
    pub pending_command_ttl_sec: u64,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicConfig {
    #[serde(default = "default_sensor_topic")]
    pub sensors: String,
    #[serde(default = "default_ack_topic")]
    pub acks: String,
    #[serde(default = "default_command_topic")]
    pub commands: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
}

fn default_sensor_topic() -> String {
    "home/sensors".to_string()
}

fn default_ack_topic() -> String {
    "home/devices/ack".to_string()
}

fn default_command_topic() -> String {
    "home/devices/set".to_string()
}

fn default_pending_ttl() -> u64 {
    120
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            sensors: default_sensor_topic(),
            acks: default_ack_topic(),
            commands: default_command_topic(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topics: TopicConfig::default(),
            utc_offset: None,
            pending_command_ttl_sec: default_pending_ttl(),
            devices: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_topics(&mut errors);
        self.validate_devices(&mut errors);

        if let Err(e) = self.calendar_zone() {
            errors.push(e.to_string());
        }
        if self.pending_command_ttl_sec == 0 {
            errors.push("pending_command_ttl_sec must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    pub fn calendar_zone(&self) -> Result<CalendarZone> {
        CalendarZone::from_config(self.utc_offset.as_deref())
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        let mut seen: HashSet<&str> = HashSet::new();

        for (label, topic) in [("sensors", &t.sensors), ("acks", &t.acks), ("commands", &t.commands)] {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{label} is empty"));
                continue;
            }
            if topic.contains(['+', '#']) {
                errors.push(format!("topics.{label} '{topic}' must not contain wildcards"));
            }
            if !seen.insert(topic.as_str()) {
                errors.push(format!("topics.{label} '{topic}' is used by another topic"));
            }
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let name = d.name.trim();
            if name.is_empty() {
                errors.push(format!("devices[{i}]: name is empty"));
            } else if !seen.insert(name) {
                errors.push(format!("device '{name}': duplicate name"));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Seed configured devices that are not yet in the database. Existing rows
/// keep their state.
pub async fn apply(config: &Config, db: &Db, today: NaiveDate) -> Result<()> {
    let mut created = 0;
    for d in &config.devices {
        let name = d.name.trim();
        if db
            .seed_device(name, today)
            .await
            .with_context(|| format!("failed to seed device '{name}'"))?
        {
            created += 1;
        }
    }

    tracing::info!(
        devices = config.devices.len(),
        created,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;

    fn assert_validation_err(toml_src: &str, needle: &str) {
        let err = parse(toml_src).unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing '{needle}', got: {msg}"
        );
    }

    #[test]
    fn parse_full_config() {
        let cfg = parse(
            r#"
            utc_offset = "+07:00"
            pending_command_ttl_sec = 30

            [topics]
            sensors = "room/sensors"
            acks = "room/ack"
            commands = "room/set"

            [[devices]]
            name = "fan"

            [[devices]]
            name = "light"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.topics.sensors, "room/sensors");
        assert_eq!(cfg.topics.acks, "room/ack");
        assert_eq!(cfg.topics.commands, "room/set");
        assert_eq!(cfg.pending_command_ttl_sec, 30);
        assert_eq!(cfg.devices.len(), 2);
        assert!(matches!(cfg.calendar_zone().unwrap(), CalendarZone::Fixed(_)));
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.topics, TopicConfig::default());
        assert_eq!(cfg.pending_command_ttl_sec, 120);
        assert!(cfg.devices.is_empty());
        assert_eq!(cfg.calendar_zone().unwrap(), CalendarZone::Local);
    }

    #[test]
    fn parse_partial_topics() {
        let cfg = parse("[topics]\nsensors = \"x/sensors\"\n").unwrap();
        assert_eq!(cfg.topics.sensors, "x/sensors");
        assert_eq!(cfg.topics.acks, "home/devices/ack");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load("/definitely/not/here/config.toml").unwrap();
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn empty_topic_rejected() {
        assert_validation_err("[topics]\nacks = \"\"\n", "topics.acks is empty");
    }

    #[test]
    fn wildcard_topic_rejected() {
        assert_validation_err("[topics]\nsensors = \"home/+/sensors\"\n", "wildcards");
        assert_validation_err("[topics]\nacks = \"home/#\"\n", "wildcards");
    }

    #[test]
    fn duplicate_topics_rejected() {
        assert_validation_err(
            "[topics]\nsensors = \"a\"\nacks = \"a\"\n",
            "used by another topic",
        );
    }

    #[test]
    fn empty_device_name_rejected() {
        assert_validation_err("[[devices]]\nname = \" \"\n", "devices[0]: name is empty");
    }

    #[test]
    fn duplicate_device_rejected() {
        assert_validation_err(
            "[[devices]]\nname = \"fan\"\n[[devices]]\nname = \"fan\"\n",
            "duplicate name",
        );
    }

    #[test]
    fn bad_offset_rejected() {
        assert_validation_err("utc_offset = \"seven\"\n", "invalid utc_offset");
    }

    #[test]
    fn zero_ttl_rejected() {
        assert_validation_err("pending_command_ttl_sec = 0\n", "must be positive");
    }

    #[test]
    fn reports_every_violation() {
        let err = parse(
            "pending_command_ttl_sec = 0\n[topics]\nacks = \"\"\n[[devices]]\nname = \"\"\n",
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("3 errors"));
    }

    #[tokio::test]
    async fn apply_seeds_devices_once() {
        let db = test_db().await;
        let cfg = parse("[[devices]]\nname = \"fan\"\n[[devices]]\nname = \"light\"\n").unwrap();
        let today: NaiveDate = "2025-10-03".parse().unwrap();

        apply(&cfg, &db, today).await.unwrap();
        apply(&cfg, &db, today).await.unwrap();

        let names: Vec<String> = db.list_devices().await.unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["fan", "light"]);
    }
}

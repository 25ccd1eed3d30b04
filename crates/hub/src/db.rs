use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::fmt;
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceStatus {
    On,
    Off,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "ON",
            Self::Off => "OFF",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Reading {
    pub id: i64,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub illuminance: Option<f64>,
    pub precipitation: Option<f64>,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub illuminance: Option<f64>,
    pub precipitation: Option<f64>,
    pub measured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Device {
    pub id: i64,
    pub name: String,
    pub status: DeviceStatus,
    pub usage_seconds_today: i64,
    pub usage_date: NaiveDate,
    pub last_state_changed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ActionEntry {
    pub id: i64,
    pub device_id: i64,
    pub status: DeviceStatus,
    pub action_by: String,
    pub time: DateTime<Utc>,
}

/// How an ACK or command names its device. Lookup prefers `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: Option<i64>,
    pub name: Option<String>,
}

impl DeviceIdentity {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.name.as_deref().map_or(true, |n| n.trim().is_empty())
    }
}

/// Everything one accepted transition writes.
#[derive(Debug, Clone, PartialEq)]
pub struct StateCommit {
    pub device_id: i64,
    pub status: DeviceStatus,
    pub usage_seconds_today: i64,
    pub usage_date: NaiveDate,
    pub changed_at: DateTime<Utc>,
    pub action_by: String,
}

const DEVICE_COLUMNS: &str =
    "id, name, status, usage_seconds_today, usage_date, last_state_changed_at";
const READING_COLUMNS: &str =
    "id, temperature, humidity, illuminance, precipitation, measured_at";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/iot-hub/iot-hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is its own database, so keep exactly
        // one connection alive for the lifetime of the pool.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Device store
    // ----------------------------

    /// Insert a device in the OFF state unless one with this name exists.
    /// Returns whether a row was created.
    pub async fn seed_device(&self, name: &str, today: NaiveDate) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO devices (name, status, usage_seconds_today, usage_date)
            VALUES (?, 'OFF', 0, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(today)
        .execute(&self.pool)
        .await
        .with_context(|| format!("seed_device failed name={name}"))?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        sqlx::query_as::<_, Device>(&format!("SELECT {DEVICE_COLUMNS} FROM devices ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .context("list_devices failed")
    }

    pub async fn device_by_id(&self, id: i64) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("device_by_id failed")
    }

    pub async fn device_by_name(&self, name: &str) -> Result<Option<Device>> {
        sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .context("device_by_name failed")
    }

    /// Resolve by id first, falling back to name.
    pub async fn resolve_device(&self, identity: &DeviceIdentity) -> Result<Option<Device>> {
        if let Some(id) = identity.id {
            if let Some(dev) = self.device_by_id(id).await? {
                return Ok(Some(dev));
            }
        }
        match identity.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => self.device_by_name(name).await,
            _ => Ok(None),
        }
    }

    /// Persist a transition and its audit row atomically. Returns the
    /// post-commit device and the appended history entry.
    pub async fn commit_transition(&self, c: &StateCommit) -> Result<(Device, ActionEntry)> {
        let mut tx = self.pool.begin().await.context("begin transition failed")?;

        let device = sqlx::query_as::<_, Device>(&format!(
            r#"
            UPDATE devices
            SET status = ?, usage_seconds_today = ?, usage_date = ?, last_state_changed_at = ?
            WHERE id = ?
            RETURNING {DEVICE_COLUMNS}
            "#
        ))
        .bind(c.status)
        .bind(c.usage_seconds_today)
        .bind(c.usage_date)
        .bind(c.changed_at)
        .bind(c.device_id)
        .fetch_optional(&mut *tx)
        .await
        .context("update device failed")?
        .with_context(|| format!("device {} vanished during transition", c.device_id))?;

        let entry = sqlx::query_as::<_, ActionEntry>(
            r#"
            INSERT INTO action_history (device_id, status, action_by, time)
            VALUES (?, ?, ?, ?)
            RETURNING id, device_id, status, action_by, time
            "#,
        )
        .bind(c.device_id)
        .bind(c.status)
        .bind(&c.action_by)
        .bind(c.changed_at)
        .fetch_one(&mut *tx)
        .await
        .context("insert action_history failed")?;

        tx.commit().await.context("commit transition failed")?;
        Ok((device, entry))
    }

    // ----------------------------
    // Action log
    // ----------------------------

    pub async fn action_history(&self, limit: i64) -> Result<Vec<ActionEntry>> {
        sqlx::query_as::<_, ActionEntry>(
            r#"
            SELECT id, device_id, status, action_by, time
            FROM action_history
            ORDER BY time DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("action_history failed")
    }

    #[cfg(test)]
    pub async fn history_for_device(&self, device_id: i64) -> Result<Vec<ActionEntry>> {
        sqlx::query_as::<_, ActionEntry>(
            r#"
            SELECT id, device_id, status, action_by, time
            FROM action_history
            WHERE device_id = ?
            ORDER BY id
            "#,
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await
        .context("history_for_device failed")
    }

    // ----------------------------
    // Reading store
    // ----------------------------

    pub async fn insert_reading(&self, r: &NewReading) -> Result<Reading> {
        sqlx::query_as::<_, Reading>(&format!(
            r#"
            INSERT INTO readings (temperature, humidity, illuminance, precipitation, measured_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING {READING_COLUMNS}
            "#
        ))
        .bind(r.temperature)
        .bind(r.humidity)
        .bind(r.illuminance)
        .bind(r.precipitation)
        .bind(r.measured_at)
        .fetch_one(&self.pool)
        .await
        .context("insert_reading failed")
    }

    pub async fn latest_reading(&self) -> Result<Option<Reading>> {
        sqlx::query_as::<_, Reading>(&format!(
            "SELECT {READING_COLUMNS} FROM readings ORDER BY measured_at DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await
        .context("latest_reading failed")
    }

    /// Newest first, optionally bounded by `[from, to]` on `measured_at`.
    pub async fn readings(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Reading>> {
        sqlx::query_as::<_, Reading>(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE (?1 IS NULL OR measured_at >= ?1)
              AND (?2 IS NULL OR measured_at <= ?2)
            ORDER BY measured_at DESC, id DESC
            LIMIT ?3
            "#
        ))
        .bind(from)
        .bind(to)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("readings failed")
    }

    /// Oldest first, half-open `[start, end)`.
    pub async fn readings_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        sqlx::query_as::<_, Reading>(&format!(
            r#"
            SELECT {READING_COLUMNS}
            FROM readings
            WHERE measured_at >= ? AND measured_at < ?
            ORDER BY measured_at, id
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("readings_between failed")
    }
}

#[cfg(test)]
impl Db {
    /// Run raw SQL against the pool, e.g. to install failure triggers.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        sqlx::query(sql).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
pub async fn test_db() -> Db {
    let db = Db::connect("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    db
}

use chrono::{DateTime, Utc};
use tracing::instrument;

use strider_core::{Identity, RouteStep};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_time, parse_time};

const TABLE: &str = "users";

/// Last committed state of one simulated user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserRecord {
    pub identity: Identity,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub stayed_at: Option<DateTime<Utc>>,
    pub battery: Option<f64>,
    /// Set while a route run owns this identity.
    pub walking: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserRecord {
    /// Both coordinates, if the user has an active position.
    pub fn position(&self) -> Option<RouteStep> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(RouteStep::new(lat, lng)),
            _ => None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }
}

/// A partial write. `None` fields leave the stored value untouched.
#[derive(Clone, Debug, Default)]
pub struct UserUpdate {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub stayed_at: Option<DateTime<Utc>>,
    pub battery: Option<f64>,
    pub walking: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl UserUpdate {
    pub fn position(mut self, step: RouteStep) -> Self {
        self.latitude = Some(step.lat);
        self.longitude = Some(step.lng);
        self
    }

    pub fn stayed_at(mut self, t: DateTime<Utc>) -> Self {
        self.stayed_at = Some(t);
        self
    }

    pub fn battery(mut self, level: f64) -> Self {
        self.battery = Some(level);
        self
    }

    pub fn walking(mut self, walking: bool) -> Self {
        self.walking = Some(walking);
        self
    }

    pub fn expires_at(mut self, t: Option<DateTime<Utc>>) -> Self {
        self.expires_at = t;
        self
    }
}

/// Persistence contract the engine depends on.
///
/// Implementations must apply every method as a single-key atomic write.
pub trait UserStore: Send + Sync {
    /// Coalescing upsert: only the `Some` fields of `update` are written.
    fn save(&self, identity: &Identity, update: &UserUpdate) -> Result<(), StoreError>;

    fn get(&self, identity: &Identity) -> Result<Option<UserRecord>, StoreError>;

    /// Every record that has both coordinates set.
    fn list_positioned(&self) -> Result<Vec<UserRecord>, StoreError>;

    /// Clear position, stayed-at and expiry so the record is no longer
    /// reconciled. Walking records are left alone.
    fn expire(&self, identity: &Identity) -> Result<bool, StoreError>;

    fn mark_walking(&self, identity: &Identity, walking: bool) -> Result<(), StoreError> {
        self.save(identity, &UserUpdate::default().walking(walking))
    }
}

/// SQLite-backed [`UserStore`].
#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Number of rows currently flagged as walking.
    pub fn count_walking(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 =
                conn.query_row("SELECT COUNT(*) FROM users WHERE walking = 1", [], |row| row.get(0))?;
            Ok(n.max(0) as u64)
        })
    }

    /// Clear the walking flag on every row. Used at startup: no run survives
    /// a restart, so any flag still set belongs to a crashed process.
    #[instrument(skip(self))]
    pub fn clear_stale_walking(&self) -> Result<usize, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("UPDATE users SET walking = 0 WHERE walking = 1", [])?;
            Ok(n)
        })
    }
}

const SELECT_COLUMNS: &str =
    "SELECT identity, latitude, longitude, stayed_at, battery_level, walking, expires_at FROM users";

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<UserRecord, StoreError> {
    let identity: String = row_helpers::get(row, 0, TABLE, "identity")?;
    let stayed_at: Option<String> = row_helpers::get(row, 3, TABLE, "stayed_at")?;
    let expires_at: Option<String> = row_helpers::get(row, 6, TABLE, "expires_at")?;
    Ok(UserRecord {
        identity: Identity::new(identity),
        latitude: row_helpers::get(row, 1, TABLE, "latitude")?,
        longitude: row_helpers::get(row, 2, TABLE, "longitude")?,
        stayed_at: parse_time(stayed_at, TABLE, "stayed_at")?,
        battery: row_helpers::get(row, 4, TABLE, "battery_level")?,
        walking: row_helpers::get(row, 5, TABLE, "walking")?,
        expires_at: parse_time(expires_at, TABLE, "expires_at")?,
    })
}

impl UserStore for UserRepo {
    #[instrument(skip(self, update), fields(identity = %identity))]
    fn save(&self, identity: &Identity, update: &UserUpdate) -> Result<(), StoreError> {
        let now = format_time(&Utc::now());
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (identity, latitude, longitude, stayed_at, battery_level, walking, expires_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, 0), ?7, ?8)
                 ON CONFLICT (identity) DO UPDATE SET
                    latitude = COALESCE(?2, users.latitude),
                    longitude = COALESCE(?3, users.longitude),
                    stayed_at = COALESCE(?4, users.stayed_at),
                    battery_level = COALESCE(?5, users.battery_level),
                    walking = COALESCE(?6, users.walking),
                    expires_at = COALESCE(?7, users.expires_at),
                    updated_at = ?8",
                rusqlite::params![
                    identity.expose(),
                    update.latitude,
                    update.longitude,
                    update.stayed_at.as_ref().map(format_time),
                    update.battery,
                    update.walking,
                    update.expires_at.as_ref().map(format_time),
                    now,
                ],
            )?;
            Ok(())
        })
    }

    #[instrument(skip(self), fields(identity = %identity))]
    fn get(&self, identity: &Identity) -> Result<Option<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE identity = ?1"))?;
            let mut rows = stmt.query([identity.expose()])?;
            match rows.next()? {
                Some(row) => row_to_record(row).map(Some),
                None => Ok(None),
            }
        })
    }

    #[instrument(skip(self))]
    fn list_positioned(&self) -> Result<Vec<UserRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_COLUMNS} WHERE latitude IS NOT NULL AND longitude IS NOT NULL ORDER BY identity"
            ))?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
            Ok(out)
        })
    }

    #[instrument(skip(self), fields(identity = %identity))]
    fn expire(&self, identity: &Identity) -> Result<bool, StoreError> {
        let now = format_time(&Utc::now());
        self.db.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users
                 SET latitude = NULL, longitude = NULL, stayed_at = NULL, expires_at = NULL, updated_at = ?2
                 WHERE identity = ?1 AND walking = 0",
                rusqlite::params![identity.expose(), now],
            )?;
            Ok(n > 0)
        })
    }
}

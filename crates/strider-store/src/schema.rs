/// SQL DDL for the strider user store.
pub const SCHEMA_VERSION: u32 = 1;

/// One row per simulated user. `walking` mirrors the in-process walking set
/// so a crashed run is still visible to the reconciler after restart.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    identity TEXT PRIMARY KEY,
    latitude REAL,
    longitude REAL,
    stayed_at TEXT,
    battery_level REAL,
    walking INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_users_walking ON users(walking);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;

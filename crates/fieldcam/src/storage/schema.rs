//! `SQLite` schema for the capture catalog.

/// One row per persisted image.
pub const CREATE_IMAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sequence INTEGER NOT NULL UNIQUE,
    captured_at TEXT NOT NULL,
    time_source TEXT NOT NULL,
    session TEXT NOT NULL,
    file_name TEXT NOT NULL,
    fix_validity TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    satellites INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// Eviction deletes by session.
pub const CREATE_SESSION_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_images_session ON images(session)
";

/// Status queries order by capture time.
pub const CREATE_CAPTURED_AT_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_images_captured_at ON images(captured_at DESC)
";

/// Key-value table holding the schema version.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Base schema (version 1), in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_IMAGES_TABLE,
    CREATE_SESSION_INDEX,
    CREATE_CAPTURED_AT_INDEX,
    CREATE_METADATA_TABLE,
];

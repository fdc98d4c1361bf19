use rusqlite::Connection;

/// Idempotent table creation. Vectors are JSON arrays, `marked_at` and
/// `created_at` are UTC milliseconds, `date`/`time` are deployment-local text.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS registered_embeddings (
    identity_id INTEGER PRIMARY KEY,
    vector      TEXT NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS visitors (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    visitor_id       TEXT NOT NULL UNIQUE,
    handle           TEXT NOT NULL UNIQUE,
    vector           TEXT NOT NULL,
    appearance_count INTEGER NOT NULL DEFAULT 1,
    created_at       INTEGER NOT NULL,
    claimed          INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attendance (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    registered_id   INTEGER,
    visitor_id      TEXT,
    marked_at       INTEGER NOT NULL,
    date            TEXT NOT NULL,
    time            TEXT NOT NULL,
    detection_count INTEGER NOT NULL DEFAULT 1,
    distance        REAL,
    CHECK ((registered_id IS NULL) <> (visitor_id IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_attendance_registered ON attendance(registered_id, marked_at);
CREATE INDEX IF NOT EXISTS idx_attendance_visitor ON attendance(visitor_id, marked_at);
CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date, time);
";

pub(crate) fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

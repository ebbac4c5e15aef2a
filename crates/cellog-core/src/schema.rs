//! SQLite schema for the cell event log

/// Schema version for migrations
pub const SCHEMA_VERSION: u32 = 1;

/// SQLite schema definition
pub struct Schema;

impl Schema {
    /// Get the complete schema SQL
    pub fn create_tables() -> &'static str {
        r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Event log. AUTOINCREMENT keeps counters strictly increasing and never
-- reused, even across deletes and reopens.
CREATE TABLE IF NOT EXISTS events (
    counter INTEGER PRIMARY KEY AUTOINCREMENT,
    log_type TEXT NOT NULL,
    pallet TEXT NOT NULL,
    location_name TEXT NOT NULL,
    location_num INTEGER NOT NULL,
    program TEXT NOT NULL,
    start_of_cycle INTEGER NOT NULL,
    end_time TEXT NOT NULL,
    result TEXT NOT NULL,
    end_of_route INTEGER NOT NULL,
    elapsed_ms INTEGER,
    active_ms INTEGER NOT NULL,
    foreign_id TEXT,
    original_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_time ON events(end_time);
CREATE INDEX IF NOT EXISTS idx_events_pallet ON events(pallet, counter);
CREATE INDEX IF NOT EXISTS idx_events_type ON events(log_type);
CREATE INDEX IF NOT EXISTS idx_events_foreign ON events(foreign_id);

-- Material snapshots per event, resolved from the registry at write time.
CREATE TABLE IF NOT EXISTS event_material (
    counter INTEGER NOT NULL REFERENCES events(counter),
    material_id INTEGER NOT NULL,
    job_unique TEXT NOT NULL,
    part_name TEXT NOT NULL,
    process INTEGER NOT NULL,
    num_processes INTEGER NOT NULL,
    face TEXT NOT NULL,
    serial TEXT,
    workorder TEXT
);

CREATE INDEX IF NOT EXISTS idx_evtmat_counter ON event_material(counter);
CREATE INDEX IF NOT EXISTS idx_evtmat_material ON event_material(material_id);
CREATE INDEX IF NOT EXISTS idx_evtmat_serial ON event_material(serial);
CREATE INDEX IF NOT EXISTS idx_evtmat_workorder ON event_material(workorder);
CREATE INDEX IF NOT EXISTS idx_evtmat_unique ON event_material(job_unique);

-- Free-form key/value sidecar per event.
CREATE TABLE IF NOT EXISTS event_details (
    counter INTEGER NOT NULL REFERENCES events(counter),
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (counter, key)
);

-- Per-tool usage attached to machine-cycle end events.
CREATE TABLE IF NOT EXISTS event_tools (
    counter INTEGER NOT NULL REFERENCES events(counter),
    tool TEXT NOT NULL,
    use_ms INTEGER NOT NULL,
    total_use_ms INTEGER NOT NULL,
    life_ms INTEGER NOT NULL,
    tool_change INTEGER NOT NULL,
    PRIMARY KEY (counter, tool)
);

-- Tool-pocket snapshots captured at machine-cycle start and end, kept for
-- audit and mid-cycle change detection.
CREATE TABLE IF NOT EXISTS tool_snapshots (
    counter INTEGER NOT NULL REFERENCES events(counter),
    pocket INTEGER NOT NULL,
    tool TEXT NOT NULL,
    use_ms INTEGER NOT NULL,
    life_ms INTEGER NOT NULL,
    PRIMARY KEY (counter, pocket, tool)
);

-- Material identity registry. AUTOINCREMENT: ids are never reused.
CREATE TABLE IF NOT EXISTS material_details (
    material_id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_unique TEXT,
    part_name TEXT,
    num_processes INTEGER NOT NULL,
    serial TEXT,
    workorder TEXT
);

CREATE INDEX IF NOT EXISTS idx_matdetails_serial ON material_details(serial);
CREATE INDEX IF NOT EXISTS idx_matdetails_workorder ON material_details(workorder);
CREATE INDEX IF NOT EXISTS idx_matdetails_unique ON material_details(job_unique);

-- Routing path per (material, process).
CREATE TABLE IF NOT EXISTS material_paths (
    material_id INTEGER NOT NULL,
    process INTEGER NOT NULL,
    path INTEGER NOT NULL,
    PRIMARY KEY (material_id, process)
);

-- Queue placement. The primary key on material_id enforces that a material
-- occupies at most one queue at a time.
CREATE TABLE IF NOT EXISTS queue_entries (
    material_id INTEGER PRIMARY KEY,
    queue TEXT NOT NULL,
    position INTEGER NOT NULL,
    add_time TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_pos ON queue_entries(queue, position);

-- Inspection sampling counters. last_signal NULL means never signaled.
CREATE TABLE IF NOT EXISTS inspection_counters (
    counter TEXT PRIMARY KEY,
    val INTEGER NOT NULL,
    last_signal TEXT
);

-- Pending next-piece inspection requests, consumed by the next material
-- seen at the station.
CREATE TABLE IF NOT EXISTS next_piece_inspections (
    station_kind TEXT NOT NULL,
    station_num INTEGER NOT NULL,
    inspection_type TEXT NOT NULL,
    PRIMARY KEY (station_kind, station_num, inspection_type)
);
"#
    }

    /// Get migration SQL for a specific version
    pub fn migration(from_version: u32, to_version: u32) -> Option<&'static str> {
        match (from_version, to_version) {
            // Add migrations here as the schema evolves
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_sql_valid() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(Schema::create_tables()).unwrap();
        // All logical tables exist
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (
                    'schema_version', 'events', 'event_material', 'event_details',
                    'event_tools', 'tool_snapshots', 'material_details',
                    'material_paths', 'queue_entries', 'inspection_counters',
                    'next_piece_inspections')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 11);
    }

    #[test]
    fn test_no_migrations_yet() {
        assert!(Schema::migration(0, 1).is_none());
    }
}

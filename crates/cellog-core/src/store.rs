//! Append and query operations on the event tables.
//!
//! Every function here runs against a caller-supplied connection; mutations
//! are invoked inside the engine's transaction so a failure anywhere rolls
//! back the whole logical operation and consumes no persisted counter.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::Result;
use crate::material;
use crate::types::{
    fmt_time, parse_time, EventMaterial, LogEntry, LogType, ToolSnapshot, ToolUse,
    DETAIL_INVALIDATED,
};

/// WHERE fragment excluding soft-deleted entries.
pub(crate) const VALID_FILTER: &str =
    "counter NOT IN (SELECT counter FROM event_details WHERE key = 'PalletCycleInvalidated')";

// MARK: - Append

/// A log entry to be appended; the store assigns the counter.
#[derive(Debug, Clone)]
pub(crate) struct NewEntry {
    pub material: Vec<EventMaterial>,
    pub pallet: String,
    pub log_type: LogType,
    pub location_name: String,
    pub location_num: i32,
    pub program: String,
    pub start_of_cycle: bool,
    pub end_time: DateTime<Utc>,
    pub result: String,
    pub end_of_route: bool,
    pub elapsed: Option<Duration>,
    pub active: Duration,
    pub details: HashMap<String, String>,
    pub tools: BTreeMap<String, ToolUse>,
    pub pockets: Vec<ToolSnapshot>,
    pub foreign_id: Option<String>,
    pub original_message: Option<String>,
}

impl NewEntry {
    pub(crate) fn new(log_type: LogType, pallet: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            material: Vec::new(),
            pallet: pallet.into(),
            log_type,
            location_name: String::new(),
            location_num: 0,
            program: String::new(),
            start_of_cycle: false,
            end_time: time,
            result: String::new(),
            end_of_route: false,
            elapsed: None,
            active: Duration::zero(),
            details: HashMap::new(),
            tools: BTreeMap::new(),
            pockets: Vec::new(),
            foreign_id: None,
            original_message: None,
        }
    }
}

/// Append one entry: insert the event row plus its material snapshots,
/// details, tool-use rows, and pocket snapshot, and return the hydrated
/// [`LogEntry`]. Serials and workorders are resolved from the identity
/// registry here, at write time.
pub(crate) fn append(conn: &Connection, entry: NewEntry) -> Result<LogEntry> {
    conn.execute(
        r#"
        INSERT INTO events
            (log_type, pallet, location_name, location_num, program, start_of_cycle,
             end_time, result, end_of_route, elapsed_ms, active_ms, foreign_id, original_message)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
        params![
            entry.log_type.to_string(),
            entry.pallet,
            entry.location_name,
            entry.location_num,
            entry.program,
            entry.start_of_cycle,
            fmt_time(entry.end_time),
            entry.result,
            entry.end_of_route,
            entry.elapsed.map(|d| d.num_milliseconds()),
            entry.active.num_milliseconds(),
            entry.foreign_id,
            entry.original_message,
        ],
    )?;
    let counter = conn.last_insert_rowid();

    let mut material = Vec::with_capacity(entry.material.len());
    for m in &entry.material {
        let snap = material::snapshot(conn, m)?;
        conn.execute(
            r#"
            INSERT INTO event_material
                (counter, material_id, job_unique, part_name, process, num_processes, face, serial, workorder)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                counter,
                snap.material_id,
                snap.job_unique,
                snap.part_name,
                snap.process,
                snap.num_processes,
                snap.face,
                snap.serial,
                snap.workorder,
            ],
        )?;
        material.push(snap);
    }

    for (key, value) in &entry.details {
        conn.execute(
            "INSERT OR REPLACE INTO event_details (counter, key, value) VALUES (?1, ?2, ?3)",
            params![counter, key, value],
        )?;
    }

    for (tool, tu) in &entry.tools {
        conn.execute(
            r#"
            INSERT INTO event_tools (counter, tool, use_ms, total_use_ms, life_ms, tool_change)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                counter,
                tool,
                tu.use_during_cycle.num_milliseconds(),
                tu.total_use_at_end_of_cycle.num_milliseconds(),
                tu.configured_life.num_milliseconds(),
                tu.tool_change_occurred,
            ],
        )?;
    }

    for p in &entry.pockets {
        conn.execute(
            r#"
            INSERT OR REPLACE INTO tool_snapshots (counter, pocket, tool, use_ms, life_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                counter,
                p.pocket,
                p.tool,
                p.current_use.num_milliseconds(),
                p.tool_life.num_milliseconds(),
            ],
        )?;
    }

    Ok(LogEntry {
        counter,
        material,
        pallet: entry.pallet,
        log_type: entry.log_type,
        location_name: entry.location_name,
        location_num: entry.location_num,
        program: entry.program,
        start_of_cycle: entry.start_of_cycle,
        end_time: entry.end_time,
        result: entry.result,
        end_of_route: entry.end_of_route,
        elapsed: entry.elapsed,
        active: entry.active,
        details: entry.details,
        tools: entry.tools,
        foreign_id: entry.foreign_id,
        original_message: entry.original_message,
    })
}

// MARK: - Hydration

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LogEntry> {
    let log_type_str: String = row.get(1)?;
    let end_time_str: String = row.get(7)?;
    let elapsed_ms: Option<i64> = row.get(10)?;
    let active_ms: i64 = row.get(11)?;

    Ok(LogEntry {
        counter: row.get(0)?,
        material: Vec::new(),
        log_type: log_type_str.parse().unwrap_or(LogType::GeneralMessage),
        pallet: row.get(2)?,
        location_name: row.get(3)?,
        location_num: row.get(4)?,
        program: row.get(5)?,
        start_of_cycle: row.get(6)?,
        end_time: parse_time(&end_time_str),
        result: row.get(8)?,
        end_of_route: row.get(9)?,
        elapsed: elapsed_ms.map(Duration::milliseconds),
        active: Duration::milliseconds(active_ms),
        details: HashMap::new(),
        tools: BTreeMap::new(),
        foreign_id: row.get(12)?,
        original_message: row.get(13)?,
    })
}

const EVENT_COLUMNS: &str = "counter, log_type, pallet, location_name, location_num, program, \
     start_of_cycle, end_time, result, end_of_route, elapsed_ms, active_ms, \
     foreign_id, original_message";

/// Query events with a custom WHERE clause and hydrate each entry's
/// materials, details, and tool rows.
pub(crate) fn query_entries(
    conn: &Connection,
    where_clause: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<LogEntry>> {
    let sql = format!(
        "SELECT {} FROM events WHERE {} ORDER BY counter",
        EVENT_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut entries = stmt
        .query_map(params, row_to_entry)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    for entry in &mut entries {
        hydrate(conn, entry)?;
    }
    Ok(entries)
}

fn hydrate(conn: &Connection, entry: &mut LogEntry) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT material_id, job_unique, part_name, process, num_processes, face, serial, workorder
         FROM event_material WHERE counter = ?1 ORDER BY rowid",
    )?;
    entry.material = stmt
        .query_map([entry.counter], |row| {
            Ok(crate::types::LogMaterial {
                material_id: row.get(0)?,
                job_unique: row.get(1)?,
                part_name: row.get(2)?,
                process: row.get(3)?,
                num_processes: row.get(4)?,
                face: row.get(5)?,
                serial: row.get(6)?,
                workorder: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare("SELECT key, value FROM event_details WHERE counter = ?1")?;
    entry.details = stmt
        .query_map([entry.counter], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<HashMap<_, _>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT tool, use_ms, total_use_ms, life_ms, tool_change
         FROM event_tools WHERE counter = ?1",
    )?;
    entry.tools = stmt
        .query_map([entry.counter], |row| {
            Ok((
                row.get::<_, String>(0)?,
                ToolUse {
                    use_during_cycle: Duration::milliseconds(row.get(1)?),
                    total_use_at_end_of_cycle: Duration::milliseconds(row.get(2)?),
                    configured_life: Duration::milliseconds(row.get(3)?),
                    tool_change_occurred: row.get(4)?,
                },
            ))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

    Ok(())
}

// MARK: - Reads

pub(crate) fn entry_by_counter(conn: &Connection, counter: i64) -> Result<Option<LogEntry>> {
    Ok(query_entries(conn, "counter = ?1", &[&counter])?
        .into_iter()
        .next())
}

pub(crate) fn entries_by_counters(conn: &Connection, counters: &[i64]) -> Result<Vec<LogEntry>> {
    if counters.is_empty() {
        return Ok(Vec::new());
    }
    let list = counters
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    query_entries(conn, &format!("counter IN ({})", list), &[])
}

pub(crate) fn entries_between(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    query_entries(
        conn,
        "end_time > ?1 AND end_time <= ?2",
        &[&fmt_time(start), &fmt_time(end)],
    )
}

pub(crate) fn entries_after_counter(conn: &Connection, counter: i64) -> Result<Vec<LogEntry>> {
    query_entries(conn, "counter > ?1", &[&counter])
}

pub(crate) fn entries_for_material(conn: &Connection, material_ids: &[i64]) -> Result<Vec<LogEntry>> {
    if material_ids.is_empty() {
        return Ok(Vec::new());
    }
    let list = material_ids
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",");
    query_entries(
        conn,
        &format!(
            "counter IN (SELECT counter FROM event_material WHERE material_id IN ({}))",
            list
        ),
        &[],
    )
}

pub(crate) fn entries_for_serial(conn: &Connection, serial: &str) -> Result<Vec<LogEntry>> {
    query_entries(
        conn,
        "counter IN (SELECT counter FROM event_material WHERE serial = ?1)",
        &[&serial],
    )
}

pub(crate) fn entries_for_workorder(conn: &Connection, workorder: &str) -> Result<Vec<LogEntry>> {
    query_entries(
        conn,
        "counter IN (SELECT counter FROM event_material WHERE workorder = ?1)",
        &[&workorder],
    )
}

pub(crate) fn entries_for_job_unique(conn: &Connection, unique: &str) -> Result<Vec<LogEntry>> {
    query_entries(
        conn,
        "counter IN (SELECT counter FROM event_material WHERE job_unique = ?1)",
        &[&unique],
    )
}

/// Counter of the most recent PalletCycle entry for a pallet, if any.
pub(crate) fn last_pallet_cycle_counter(conn: &Connection, pallet: &str) -> Result<Option<i64>> {
    let max: Option<i64> = conn.query_row(
        "SELECT MAX(counter) FROM events WHERE pallet = ?1 AND log_type = 'PalletCycle'",
        [pallet],
        |row| row.get(0),
    )?;
    Ok(max)
}

/// Entries since the last PalletCycle for this pallet, excluding
/// invalidated ones. This is the "current pallet cycle" view.
pub(crate) fn current_pallet_log(conn: &Connection, pallet: &str) -> Result<Vec<LogEntry>> {
    let boundary = last_pallet_cycle_counter(conn, pallet)?.unwrap_or(0);
    query_entries(
        conn,
        &format!("pallet = ?1 AND counter > ?2 AND {}", VALID_FILTER),
        &[&pallet, &boundary],
    )
}

pub(crate) fn last_pallet_cycle_time(
    conn: &Connection,
    pallet: &str,
) -> Result<Option<DateTime<Utc>>> {
    let time: Option<String> = conn.query_row(
        "SELECT MAX(end_time) FROM events WHERE pallet = ?1 AND log_type = 'PalletCycle'",
        [pallet],
        |row| row.get(0),
    )?;
    Ok(time.map(|s| parse_time(&s)))
}

/// First and last event timestamps ever recorded for a pallet.
pub(crate) fn pallet_time_range(
    conn: &Connection,
    pallet: &str,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let range: (Option<String>, Option<String>) = conn.query_row(
        "SELECT MIN(end_time), MAX(end_time) FROM events WHERE pallet = ?1",
        [pallet],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match range {
        (Some(first), Some(last)) => Ok(Some((parse_time(&first), parse_time(&last)))),
        _ => Ok(None),
    }
}

pub(crate) fn max_log_date(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let time: Option<String> =
        conn.query_row("SELECT MAX(end_time) FROM events", [], |row| row.get(0))?;
    Ok(time.map(|s| parse_time(&s)))
}

pub(crate) fn max_foreign_id(conn: &Connection) -> Result<Option<String>> {
    let id: Option<String> = conn.query_row(
        "SELECT MAX(foreign_id) FROM events WHERE foreign_id IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(id)
}

pub(crate) fn foreign_id_for_counter(conn: &Connection, counter: i64) -> Result<Option<String>> {
    let id: Option<Option<String>> = conn
        .query_row(
            "SELECT foreign_id FROM events WHERE counter = ?1",
            [counter],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id.flatten())
}

pub(crate) fn most_recent_entry_for_foreign_id(
    conn: &Connection,
    foreign_id: &str,
) -> Result<Option<LogEntry>> {
    Ok(query_entries(conn, "foreign_id = ?1", &[&foreign_id])?.pop())
}

/// Adapter-side idempotent-insert check: does an entry with this exact
/// time/pallet/type/location already exist?
pub(crate) fn cycle_exists(
    conn: &Connection,
    time: DateTime<Utc>,
    pallet: &str,
    log_type: LogType,
    location_name: &str,
    location_num: i32,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        r#"
        SELECT COUNT(*) FROM events
        WHERE end_time = ?1 AND pallet = ?2 AND log_type = ?3
          AND location_name = ?4 AND location_num = ?5
        "#,
        params![
            fmt_time(time),
            pallet,
            log_type.to_string(),
            location_name,
            location_num
        ],
    |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Mark an entry invalidated (soft delete) and zero its active time.
/// Only [`crate::corrections`] calls this.
pub(crate) fn invalidate_entry(conn: &Connection, counter: i64) -> Result<()> {
    conn.execute(
        "UPDATE events SET active_ms = 0 WHERE counter = ?1",
        [counter],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO event_details (counter, key, value) VALUES (?1, ?2, '1')",
        params![counter, DETAIL_INVALIDATED],
    )?;
    Ok(())
}

/// Load the tool-pocket snapshot stored with an entry.
pub(crate) fn pocket_snapshot(conn: &Connection, counter: i64) -> Result<Vec<ToolSnapshot>> {
    let mut stmt = conn.prepare(
        "SELECT pocket, tool, use_ms, life_ms FROM tool_snapshots WHERE counter = ?1 ORDER BY pocket",
    )?;
    let snaps = stmt
        .query_map([counter], |row| {
            Ok(ToolSnapshot {
                pocket: row.get(0)?,
                tool: row.get(1)?,
                current_use: Duration::milliseconds(row.get(2)?),
                tool_life: Duration::milliseconds(row.get(3)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(snaps)
}

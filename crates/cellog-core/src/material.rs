//! Material identity registry.
//!
//! Allocates material ids (monotonic, never reused) and tracks each
//! material's job assignment, serial, workorder, and per-process routing
//! path. Castings are materials with no job assignment yet.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CellogError, Result};
use crate::types::{EventMaterial, LogMaterial, MaterialDetails};

/// Allocate a fresh material id bound to a job.
pub(crate) fn allocate(
    conn: &Connection,
    job_unique: Option<&str>,
    part_name: &str,
    num_processes: i32,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO material_details (job_unique, part_name, num_processes) VALUES (?1, ?2, ?3)",
        params![job_unique, part_name, num_processes],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Allocate a fresh material id for an unassigned casting.
pub(crate) fn allocate_casting(conn: &Connection, casting: &str) -> Result<i64> {
    allocate(conn, None, casting, 1)
}

/// Partial update: `None` fields are left unchanged.
pub(crate) fn set_details(
    conn: &Connection,
    material_id: i64,
    job_unique: Option<&str>,
    part_name: Option<&str>,
    num_processes: Option<i32>,
) -> Result<()> {
    let changed = conn.execute(
        r#"
        UPDATE material_details SET
            job_unique = COALESCE(?2, job_unique),
            part_name = COALESCE(?3, part_name),
            num_processes = COALESCE(?4, num_processes)
        WHERE material_id = ?1
        "#,
        params![material_id, job_unique, part_name, num_processes],
    )?;
    if changed == 0 {
        return Err(CellogError::NotFound(format!("material {}", material_id)));
    }
    Ok(())
}

/// Record the routing path the material took for a process.
pub(crate) fn record_path(conn: &Connection, material_id: i64, process: i32, path: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO material_paths (material_id, process, path) VALUES (?1, ?2, ?3)",
        params![material_id, process, path],
    )?;
    Ok(())
}

/// Last-write-wins serial assignment; an empty string clears it.
pub(crate) fn set_serial(conn: &Connection, material_id: i64, serial: &str) -> Result<()> {
    let value = if serial.is_empty() { None } else { Some(serial) };
    let changed = conn.execute(
        "UPDATE material_details SET serial = ?2 WHERE material_id = ?1",
        params![material_id, value],
    )?;
    if changed == 0 {
        return Err(CellogError::NotFound(format!("material {}", material_id)));
    }
    Ok(())
}

/// Last-write-wins workorder assignment; an empty string clears it.
pub(crate) fn set_workorder(conn: &Connection, material_id: i64, workorder: &str) -> Result<()> {
    let value = if workorder.is_empty() {
        None
    } else {
        Some(workorder)
    };
    let changed = conn.execute(
        "UPDATE material_details SET workorder = ?2 WHERE material_id = ?1",
        params![material_id, value],
    )?;
    if changed == 0 {
        return Err(CellogError::NotFound(format!("material {}", material_id)));
    }
    Ok(())
}

fn row_to_details(row: &rusqlite::Row<'_>) -> rusqlite::Result<MaterialDetails> {
    Ok(MaterialDetails {
        material_id: row.get(0)?,
        job_unique: row.get(1)?,
        part_name: row.get(2)?,
        num_processes: row.get(3)?,
        serial: row.get(4)?,
        workorder: row.get(5)?,
        paths: BTreeMap::new(),
    })
}

fn load_paths(conn: &Connection, details: &mut MaterialDetails) -> Result<()> {
    let mut stmt =
        conn.prepare("SELECT process, path FROM material_paths WHERE material_id = ?1")?;
    details.paths = stmt
        .query_map([details.material_id], |row| {
            Ok((row.get::<_, i32>(0)?, row.get::<_, i32>(1)?))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(())
}

const DETAIL_COLUMNS: &str =
    "material_id, job_unique, part_name, num_processes, serial, workorder";

/// Look up one material with its recorded paths.
pub(crate) fn details(conn: &Connection, material_id: i64) -> Result<Option<MaterialDetails>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {} FROM material_details WHERE material_id = ?1",
                DETAIL_COLUMNS
            ),
            [material_id],
            row_to_details,
        )
        .optional()?;
    match found {
        Some(mut d) => {
            load_paths(conn, &mut d)?;
            Ok(Some(d))
        }
        None => Ok(None),
    }
}

fn details_where(conn: &Connection, where_clause: &str, param: &str) -> Result<Vec<MaterialDetails>> {
    let sql = format!(
        "SELECT {} FROM material_details WHERE {} ORDER BY material_id",
        DETAIL_COLUMNS, where_clause
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map([param], row_to_details)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);
    for d in &mut rows {
        load_paths(conn, d)?;
    }
    Ok(rows)
}

pub(crate) fn by_serial(conn: &Connection, serial: &str) -> Result<Vec<MaterialDetails>> {
    details_where(conn, "serial = ?1", serial)
}

pub(crate) fn by_workorder(conn: &Connection, workorder: &str) -> Result<Vec<MaterialDetails>> {
    details_where(conn, "workorder = ?1", workorder)
}

pub(crate) fn by_job_unique(conn: &Connection, unique: &str) -> Result<Vec<MaterialDetails>> {
    details_where(conn, "job_unique = ?1", unique)
}

/// Return queued castings to stock: clear the job assignment, reset the part
/// name to the casting name, and delete recorded paths.
pub(crate) fn mark_castings_unallocated(
    conn: &Connection,
    material_ids: &[i64],
    casting: &str,
) -> Result<()> {
    for &id in material_ids {
        conn.execute(
            "UPDATE material_details SET job_unique = NULL, part_name = ?2 WHERE material_id = ?1",
            params![id, casting],
        )?;
        conn.execute("DELETE FROM material_paths WHERE material_id = ?1", [id])?;
    }
    Ok(())
}

/// Claim exactly `count` unassigned castings from a queue (in queue order)
/// and bind them to a job. All-or-nothing: if fewer than `count` match,
/// nothing is claimed and the result is empty.
#[allow(clippy::too_many_arguments)]
pub(crate) fn allocate_castings_in_queue(
    conn: &Connection,
    queue: &str,
    casting: &str,
    job_unique: &str,
    part_name: &str,
    proc1_path: i32,
    num_processes: i32,
    count: usize,
) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT q.material_id FROM queue_entries q
        JOIN material_details m ON m.material_id = q.material_id
        WHERE q.queue = ?1 AND m.part_name = ?2 AND m.job_unique IS NULL
        ORDER BY q.position
        LIMIT ?3
        "#,
    )?;
    let ids = stmt
        .query_map(params![queue, casting, count as i64], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    drop(stmt);

    if ids.len() < count {
        return Ok(Vec::new());
    }

    for &id in &ids {
        set_details(conn, id, Some(job_unique), Some(part_name), Some(num_processes))?;
        record_path(conn, id, 1, proc1_path)?;
    }
    Ok(ids)
}

/// Resolve the registry snapshot for a material reference at write time.
/// Unregistered (ephemeral/negative) ids resolve to an empty snapshot.
pub(crate) fn snapshot(conn: &Connection, m: &EventMaterial) -> Result<LogMaterial> {
    match details(conn, m.material_id)? {
        Some(d) => Ok(LogMaterial {
            material_id: m.material_id,
            job_unique: d.job_unique.unwrap_or_default(),
            part_name: d.part_name.unwrap_or_default(),
            process: m.process,
            num_processes: d.num_processes,
            face: m.face.clone(),
            serial: d.serial,
            workorder: d.workorder,
        }),
        None => Ok(LogMaterial {
            material_id: m.material_id,
            job_unique: String::new(),
            part_name: String::new(),
            process: m.process,
            num_processes: m.process.max(1),
            face: m.face.clone(),
            serial: None,
            workorder: None,
        }),
    }
}

//! Corrective edits to already-committed history.
//!
//! The log is append-only with exactly two sanctioned exceptions, both in
//! this module, both running inside the caller's transaction:
//!
//! * [`swap_material`] rewrites the material references on the current
//!   pallet cycle's entries in place, keeping their counters. Consumers
//!   must not assume a counter's material set is immutable.
//! * [`invalidate_pallet_cycle`] soft-deletes entries: they stay
//!   retrievable by counter and time but are tagged invalidated, excluded
//!   from current-pallet-cycle reconstructions, and read with zero active
//!   time.
//!
//! Every edit also appends a normal summary entry (SwapMaterialOnPallet or
//! InvalidateCycle) so the edit itself is visible in the log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::{CellogError, Result};
use crate::material;
use crate::queues;
use crate::store::{self, NewEntry, VALID_FILTER};
use crate::types::{
    EventMaterial, LogEntry, LogType, DETAIL_EDITED_COUNTERS, DETAIL_OPERATOR,
};

/// Outcome of a material swap: entries rewritten in place plus the entries
/// appended to describe the edit.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapResult {
    /// Entries whose material references were rewritten, re-read after the
    /// edit. Counters are unchanged.
    pub changed_log_entries: Vec<LogEntry>,
    /// Newly appended entries: the swap summary and any queue moves.
    pub new_log_entries: Vec<LogEntry>,
}

/// Replace `old_id` with `new_id` on every entry of the pallet's current
/// (not-yet-cycled) log.
///
/// Fails with `Conflict` when the old material is not on the current cycle,
/// has no recorded path for the process being swapped, or the new material
/// is already bound to a different job. An unassigned new material inherits
/// the old one's job, part, process count, and recorded paths. The old
/// material is re-queued for its prior process, into the queue the new
/// material vacated or into `quarantine_queue`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn swap_material(
    conn: &Connection,
    pallet: &str,
    old_id: i64,
    new_id: i64,
    operator: Option<&str>,
    quarantine_queue: Option<&str>,
    now: DateTime<Utc>,
) -> Result<SwapResult> {
    let cycle = store::current_pallet_log(conn, pallet)?;
    let counters: Vec<i64> = cycle
        .iter()
        .filter(|e| e.material.iter().any(|m| m.material_id == old_id))
        .map(|e| e.counter)
        .collect();
    if counters.is_empty() {
        return Err(CellogError::Conflict(format!(
            "material {} not found in current cycle of pallet {}",
            old_id, pallet
        )));
    }
    let process = cycle
        .iter()
        .flat_map(|e| &e.material)
        .filter(|m| m.material_id == old_id)
        .map(|m| m.process)
        .max()
        .unwrap_or(1);

    let old = material::details(conn, old_id)?
        .ok_or_else(|| CellogError::NotFound(format!("material {}", old_id)))?;
    if !old.paths.contains_key(&process) {
        return Err(CellogError::Conflict(format!(
            "material {} has no recorded path for process {}",
            old_id, process
        )));
    }

    let new = material::details(conn, new_id)?
        .ok_or_else(|| CellogError::NotFound(format!("material {}", new_id)))?;
    match (&new.job_unique, &old.job_unique) {
        (Some(nj), Some(oj)) if nj != oj => {
            return Err(CellogError::Conflict(format!(
                "material {} is assigned to job {}, not {}",
                new_id, nj, oj
            )));
        }
        (None, _) => {
            material::set_details(
                conn,
                new_id,
                old.job_unique.as_deref(),
                old.part_name.as_deref(),
                Some(old.num_processes),
            )?;
        }
        _ => {}
    }
    for (&proc, &path) in &old.paths {
        material::record_path(conn, new_id, proc, path)?;
    }

    // The queue the new material is about to vacate, noted before any moves
    let vacated = queues::find_queue(conn, new_id)?.map(|(q, _, _)| q);

    let list = counters
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",");
    conn.execute(
        &format!(
            "UPDATE event_material SET material_id = ?1, serial = ?2, workorder = ?3
             WHERE material_id = ?4 AND counter IN ({})",
            list
        ),
        params![new_id, new.serial, new.workorder, old_id],
    )?;

    let mut new_entries = Vec::new();
    let mut e = NewEntry::new(LogType::SwapMaterialOnPallet, pallet, now);
    e.material.push(EventMaterial::new(old_id, process));
    e.material.push(EventMaterial::new(new_id, process));
    e.result = format!("Replace {} with {} on pallet {}", old_id, new_id, pallet);
    if let Some(op) = operator {
        e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
    }
    new_entries.push(store::append(conn, e)?);

    new_entries.extend(queues::remove_from_all_queues(
        conn,
        &EventMaterial::new(new_id, process - 1),
        operator,
        now,
    )?);
    if let Some(queue) = vacated.as_deref().or(quarantine_queue) {
        new_entries.extend(queues::add_to_queue(
            conn,
            &EventMaterial::new(old_id, process - 1),
            queue,
            -1,
            operator,
            "SwapMaterial",
            now,
        )?);
    }

    Ok(SwapResult {
        changed_log_entries: store::entries_by_counters(conn, &counters)?,
        new_log_entries: new_entries,
    })
}

/// Soft-delete every valid queue/load/machine entry for a material at one
/// process and append an InvalidateCycle summary listing the affected
/// counters. When `put_in_queue` is given, every material touched by the
/// invalidated entries is queued there for the prior process unless already
/// in that queue. Returns the newly appended entries.
pub(crate) fn invalidate_pallet_cycle(
    conn: &Connection,
    material_id: i64,
    process: i32,
    put_in_queue: Option<&str>,
    operator: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(&format!(
        r#"
        SELECT DISTINCT e.counter FROM events e
        JOIN event_material m ON m.counter = e.counter
        WHERE m.material_id = ?1 AND m.process = ?2
          AND e.log_type IN ('AddToQueue', 'RemoveFromQueue', 'LoadUnload', 'MachineCycle')
          AND e.{}
        "#,
        VALID_FILTER
    ))?;
    let counters = stmt
        .query_map(params![material_id, process], |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    drop(stmt);
    if counters.is_empty() {
        return Err(CellogError::NotFound(format!(
            "no valid cycle entries for material {} process {}",
            material_id, process
        )));
    }

    let affected = store::entries_by_counters(conn, &counters)?;
    let mut affected_ids: Vec<i64> = affected
        .iter()
        .flat_map(|e| &e.material)
        .map(|m| m.material_id)
        .filter(|&id| id > 0)
        .collect();
    affected_ids.sort_unstable();
    affected_ids.dedup();

    for &counter in &counters {
        store::invalidate_entry(conn, counter)?;
    }

    let mut new_entries = Vec::new();
    let mut e = NewEntry::new(LogType::InvalidateCycle, "", now);
    for &id in &affected_ids {
        e.material.push(EventMaterial::new(id, process - 1));
    }
    e.result = "Invalidate all events in cycle".to_string();
    e.details.insert(
        DETAIL_EDITED_COUNTERS.to_string(),
        counters
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );
    if let Some(op) = operator {
        e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
    }
    new_entries.push(store::append(conn, e)?);

    if let Some(queue) = put_in_queue {
        for &id in &affected_ids {
            if !queues::is_in_queue(conn, id, queue)? {
                new_entries.extend(queues::add_to_queue(
                    conn,
                    &EventMaterial::new(id, process - 1),
                    queue,
                    -1,
                    operator,
                    "InvalidateCycle",
                    now,
                )?);
            }
        }
    }
    Ok(new_entries)
}

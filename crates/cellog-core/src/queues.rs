//! FIFO/positional queue engine.
//!
//! Positions within one queue are dense and 0-based after every mutation,
//! and a material occupies at most one queue at a time (enforced by the
//! primary key on `queue_entries`). Every placement change emits
//! AddToQueue/RemoveFromQueue log entries.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::{self, NewEntry};
use crate::types::{
    fmt_time, parse_time, EventMaterial, LogEntry, LogType, QueuedMaterial, DETAIL_OPERATOR,
};

/// The queue row a material currently occupies, if any.
pub(crate) fn find_queue(conn: &Connection, material_id: i64) -> Result<Option<(String, i32, DateTime<Utc>)>> {
    let row = conn
        .query_row(
            "SELECT queue, position, add_time FROM queue_entries WHERE material_id = ?1",
            [material_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i32>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;
    Ok(row.map(|(q, p, t)| (q, p, parse_time(&t))))
}

pub(crate) fn is_in_queue(conn: &Connection, material_id: i64, queue: &str) -> Result<bool> {
    Ok(matches!(find_queue(conn, material_id)?, Some((q, _, _)) if q == queue))
}

/// Remove a material from every queue it occupies, closing position gaps
/// and emitting one RemoveFromQueue entry per removed row. A material not
/// currently queued yields an empty result.
pub(crate) fn remove_from_all_queues(
    conn: &Connection,
    mat: &EventMaterial,
    operator: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    let mut entries = Vec::new();
    while let Some((queue, position, add_time)) = find_queue(conn, mat.material_id)? {
        conn.execute(
            "DELETE FROM queue_entries WHERE material_id = ?1",
            [mat.material_id],
        )?;
        conn.execute(
            "UPDATE queue_entries SET position = position - 1 WHERE queue = ?1 AND position > ?2",
            params![queue, position],
        )?;

        let mut e = NewEntry::new(LogType::RemoveFromQueue, "", now);
        e.material.push(mat.clone());
        e.location_name = queue;
        e.location_num = position;
        e.elapsed = Some(now - add_time);
        if let Some(op) = operator {
            e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
        }
        entries.push(store::append(conn, e)?);
    }
    Ok(entries)
}

/// Place a material into a queue at `position` (clamped to the end; negative
/// appends unconditionally), first removing it from any queue it currently
/// occupies. Returns the remove entries (if any) followed by the add entry.
#[allow(clippy::too_many_arguments)]
pub(crate) fn add_to_queue(
    conn: &Connection,
    mat: &EventMaterial,
    queue: &str,
    position: i32,
    operator: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    let mut entries = remove_from_all_queues(conn, mat, operator, now)?;

    let count: i32 = conn.query_row(
        "SELECT COUNT(*) FROM queue_entries WHERE queue = ?1",
        [queue],
        |row| row.get(0),
    )?;
    let pos = if position < 0 { count } else { position.min(count) };

    conn.execute(
        "UPDATE queue_entries SET position = position + 1 WHERE queue = ?1 AND position >= ?2",
        params![queue, pos],
    )?;
    conn.execute(
        "INSERT INTO queue_entries (material_id, queue, position, add_time) VALUES (?1, ?2, ?3, ?4)",
        params![mat.material_id, queue, pos, fmt_time(now)],
    )?;

    let mut e = NewEntry::new(LogType::AddToQueue, "", now);
    e.material.push(mat.clone());
    e.location_name = queue.to_string();
    e.location_num = pos;
    e.program = reason.to_string();
    if let Some(op) = operator {
        e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
    }
    entries.push(store::append(conn, e)?);
    Ok(entries)
}

fn row_to_queued(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedMaterial> {
    let add_time: String = row.get(3)?;
    Ok(QueuedMaterial {
        material_id: row.get(0)?,
        queue: row.get(1)?,
        position: row.get(2)?,
        add_time: parse_time(&add_time),
        job_unique: row.get(4)?,
        part_name: row.get(5)?,
        num_processes: row.get::<_, Option<i32>>(6)?.unwrap_or(1),
    })
}

const QUEUED_SELECT: &str = r#"
    SELECT q.material_id, q.queue, q.position, q.add_time,
           m.job_unique, m.part_name, m.num_processes
    FROM queue_entries q
    LEFT JOIN material_details m ON m.material_id = q.material_id
"#;

/// Contents of one queue, ordered by position.
pub(crate) fn in_queue(conn: &Connection, queue: &str) -> Result<Vec<QueuedMaterial>> {
    let sql = format!("{} WHERE q.queue = ?1 ORDER BY q.position", QUEUED_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([queue], row_to_queued)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Contents of every queue, ordered by (queue, position).
pub(crate) fn in_all_queues(conn: &Connection) -> Result<Vec<QueuedMaterial>> {
    let sql = format!("{} ORDER BY q.queue, q.position", QUEUED_SELECT);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], row_to_queued)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// One plus the highest process with a valid completed load/machine cycle or
/// queue placement for this material, or `None` if it has no such history.
pub(crate) fn next_process_for_queued_material(
    conn: &Connection,
    material_id: i64,
) -> Result<Option<i32>> {
    let sql = format!(
        r#"
        SELECT MAX(m.process) FROM event_material m
        JOIN events e ON e.counter = m.counter
        WHERE m.material_id = ?1
          AND (e.log_type = 'AddToQueue'
               OR (e.log_type IN ('LoadUnload', 'MachineCycle') AND e.start_of_cycle = 0))
          AND e.{}
        "#,
        store::VALID_FILTER
    );
    let max: Option<i32> = conn.query_row(&sql, [material_id], |row| row.get(0))?;
    Ok(max.map(|p| p + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::material;
    use crate::schema::Schema;
    use chrono::{Duration, TimeZone};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(Schema::create_tables()).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap()
    }

    fn positions(conn: &Connection, queue: &str) -> Vec<(i64, i32)> {
        in_queue(conn, queue)
            .unwrap()
            .into_iter()
            .map(|q| (q.material_id, q.position))
            .collect()
    }

    fn mat(conn: &Connection, process: i32) -> EventMaterial {
        let id = material::allocate(conn, Some("J1"), "P1", 2).unwrap();
        EventMaterial::new(id, process)
    }

    #[test]
    fn test_append_and_positions_stay_dense() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        let b = mat(&conn, 1);
        let c = mat(&conn, 1);

        add_to_queue(&conn, &a, "buf", -1, None, "", now()).unwrap();
        add_to_queue(&conn, &b, "buf", -1, None, "", now()).unwrap();
        // Insert ahead of everything
        add_to_queue(&conn, &c, "buf", 0, None, "", now()).unwrap();

        assert_eq!(
            positions(&conn, "buf"),
            vec![(c.material_id, 0), (a.material_id, 1), (b.material_id, 2)]
        );

        // Removing the middle closes the gap
        remove_from_all_queues(&conn, &a, None, now()).unwrap();
        assert_eq!(
            positions(&conn, "buf"),
            vec![(c.material_id, 0), (b.material_id, 1)]
        );
    }

    #[test]
    fn test_position_beyond_length_clamps_to_end() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        let b = mat(&conn, 1);
        add_to_queue(&conn, &a, "buf", -1, None, "", now()).unwrap();
        let entries = add_to_queue(&conn, &b, "buf", 50, None, "", now()).unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].location_num, 1);
        assert_eq!(
            positions(&conn, "buf"),
            vec![(a.material_id, 0), (b.material_id, 1)]
        );
    }

    #[test]
    fn test_single_queue_membership() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        add_to_queue(&conn, &a, "buf", -1, None, "", now()).unwrap();

        // Adding to a second queue removes from the first
        let entries = add_to_queue(&conn, &a, "other", -1, None, "", now()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].log_type, LogType::RemoveFromQueue);
        assert_eq!(entries[0].location_name, "buf");
        assert_eq!(entries[1].log_type, LogType::AddToQueue);
        assert_eq!(entries[1].location_name, "other");

        assert!(positions(&conn, "buf").is_empty());
        assert_eq!(positions(&conn, "other"), vec![(a.material_id, 0)]);
    }

    #[test]
    fn test_remove_not_queued_is_empty_not_error() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        let entries = remove_from_all_queues(&conn, &a, None, now()).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_remove_records_time_in_queue() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        add_to_queue(&conn, &a, "buf", -1, None, "", now()).unwrap();

        let later = now() + Duration::minutes(42);
        let entries = remove_from_all_queues(&conn, &a, Some("pat"), later).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].elapsed, Some(Duration::minutes(42)));
        assert_eq!(entries[0].details.get(DETAIL_OPERATOR).unwrap(), "pat");
    }

    #[test]
    fn test_next_process_from_history() {
        let conn = test_conn();
        let a = mat(&conn, 1);

        assert_eq!(
            next_process_for_queued_material(&conn, a.material_id).unwrap(),
            None
        );

        // A completed load for process 1
        let mut e = NewEntry::new(LogType::LoadUnload, "3", now());
        e.material.push(a.clone());
        e.start_of_cycle = false;
        e.result = "LOAD".to_string();
        store::append(&conn, e).unwrap();

        assert_eq!(
            next_process_for_queued_material(&conn, a.material_id).unwrap(),
            Some(2)
        );

        // A load *start* for process 2 does not count
        let mut e = NewEntry::new(LogType::LoadUnload, "3", now());
        e.material.push(EventMaterial::new(a.material_id, 2));
        e.start_of_cycle = true;
        store::append(&conn, e).unwrap();
        assert_eq!(
            next_process_for_queued_material(&conn, a.material_id).unwrap(),
            Some(2)
        );
    }

    #[test]
    fn test_in_all_queues_ordering() {
        let conn = test_conn();
        let a = mat(&conn, 1);
        let b = mat(&conn, 1);
        let c = mat(&conn, 1);
        add_to_queue(&conn, &b, "beta", -1, None, "", now()).unwrap();
        add_to_queue(&conn, &a, "alpha", -1, None, "", now()).unwrap();
        add_to_queue(&conn, &c, "beta", -1, None, "", now()).unwrap();

        let all: Vec<(String, i32)> = in_all_queues(&conn)
            .unwrap()
            .into_iter()
            .map(|q| (q.queue, q.position))
            .collect();
        assert_eq!(
            all,
            vec![
                ("alpha".to_string(), 0),
                ("beta".to_string(), 0),
                ("beta".to_string(), 1)
            ]
        );
    }
}

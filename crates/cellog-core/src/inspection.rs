//! Inspection sampling decision engine.
//!
//! Decisions are self-describing: prior Inspection/InspectionForce log
//! entries *are* the durable decision state, reconstructed on demand via
//! the material index. Counters keyed by the expanded path template live in
//! their own table and persist indefinitely.

use chrono::{DateTime, Duration, Utc};
use rand::{Rng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::store::{self, NewEntry};
use crate::types::{
    fmt_time, parse_time, ActualPath, EventMaterial, InspectionDecision, LogEntry, LogType,
    NextPieceStation, PathInspection, Stop, DETAIL_ACTUAL_PATH, DETAIL_INSPECTION_TYPE,
};

// MARK: - Counters

pub(crate) fn load_counter(
    conn: &Connection,
    name: &str,
) -> Result<Option<(i32, Option<DateTime<Utc>>)>> {
    let row = conn
        .query_row(
            "SELECT val, last_signal FROM inspection_counters WHERE counter = ?1",
            [name],
            |row| Ok((row.get::<_, i32>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(v, t)| (v, t.map(|s| parse_time(&s)))))
}

pub(crate) fn save_counter(
    conn: &Connection,
    name: &str,
    value: i32,
    last_signal: Option<DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO inspection_counters (counter, val, last_signal) VALUES (?1, ?2, ?3)",
        params![name, value, last_signal.map(fmt_time)],
    )?;
    Ok(())
}

// MARK: - Template expansion

/// Expand a counter template against the material's actual path. Replaces
/// `%palN%`, `%loadN%`, `%unloadN%` and `%statN,K%` (K is the 1-based index
/// of the machine stop within process N). Pure function.
pub fn expand_inspection_counter(template: &str, paths: &[ActualPath]) -> String {
    let mut out = template.to_string();
    for p in paths {
        out = out.replace(&format!("%pal{}%", p.process), &p.pallet);
        out = out.replace(&format!("%load{}%", p.process), &p.load_station.to_string());
        out = out.replace(
            &format!("%unload{}%", p.process),
            &p.unload_station.to_string(),
        );
        for (i, stop) in p.stops.iter().enumerate() {
            out = out.replace(
                &format!("%stat{},{}%", p.process, i + 1),
                &stop.station_num.to_string(),
            );
        }
    }
    out
}

// MARK: - Actual path

/// Reconstruct the route a material actually took, per process, from its
/// own valid log entries.
pub(crate) fn actual_paths(conn: &Connection, material_id: i64) -> Result<Vec<ActualPath>> {
    use std::collections::BTreeMap;

    let mut by_process: BTreeMap<i32, ActualPath> = BTreeMap::new();
    for entry in store::entries_for_material(conn, &[material_id])? {
        if entry.is_invalidated() {
            continue;
        }
        for m in &entry.material {
            if m.material_id != material_id {
                continue;
            }
            let path = by_process.entry(m.process).or_insert_with(|| ActualPath {
                material_id,
                process: m.process,
                pallet: String::new(),
                load_station: 0,
                unload_station: 0,
                stops: Vec::new(),
            });
            if path.pallet.is_empty() && !entry.pallet.is_empty() {
                path.pallet = entry.pallet.clone();
            }
            match entry.log_type {
                LogType::LoadUnload if entry.result == "LOAD" => {
                    if path.load_station == 0 {
                        path.load_station = entry.location_num;
                    }
                }
                LogType::LoadUnload if entry.result == "UNLOAD" => {
                    path.unload_station = entry.location_num;
                }
                LogType::MachineCycle if entry.start_of_cycle => {
                    path.stops.push(Stop {
                        station_group: entry.location_name.clone(),
                        station_num: entry.location_num,
                    });
                }
                _ => {}
            }
        }
    }
    Ok(by_process.into_values().collect())
}

// MARK: - Decisions

/// Reconstruct every sampling decision previously recorded for a material.
pub(crate) fn lookup_decisions(
    conn: &Connection,
    material_id: i64,
) -> Result<Vec<InspectionDecision>> {
    let entries = store::query_entries(
        conn,
        "log_type IN ('Inspection', 'InspectionForce')
         AND counter IN (SELECT counter FROM event_material WHERE material_id = ?1)",
        &[&material_id],
    )?;
    Ok(entries
        .into_iter()
        .map(|e| InspectionDecision {
            material_id,
            inspection_type: e
                .details
                .get(DETAIL_INSPECTION_TYPE)
                .cloned()
                .unwrap_or_default(),
            counter: e.program.clone(),
            inspect: e.result == "true",
            forced: e.log_type == LogType::InspectionForce,
            create_time: e.end_time,
        })
        .collect())
}

/// Run the sampling state machine for each inspection rule and record one
/// Inspection entry per newly made decision. Rules with a binding prior
/// decision (any unforced decision, or any "inspect") are skipped, which
/// makes repeated calls idempotent.
pub(crate) fn make_decisions(
    conn: &Connection,
    rng: &mut dyn RngCore,
    material_id: i64,
    process: i32,
    inspections: &[PathInspection],
    now: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    let prior = lookup_decisions(conn, material_id)?;
    let paths = actual_paths(conn, material_id)?;
    let path_json = serde_json::to_string(&paths)?;

    let mut entries = Vec::new();
    for insp in inspections {
        let binding = prior
            .iter()
            .filter(|d| d.inspection_type == insp.inspection_type)
            .any(|d| !d.forced || d.inspect);
        if binding {
            continue;
        }

        let counter_key = expand_inspection_counter(&insp.counter, &paths);
        let (mut value, mut last_signal) = match load_counter(conn, &counter_key)? {
            Some(state) => state,
            None => {
                // Fresh counters start at a random phase so cells brought up
                // together do not all signal in lockstep.
                let initial = if insp.max_val > 1 {
                    rng.gen_range(0..insp.max_val)
                } else {
                    0
                };
                (initial, None)
            }
        };

        let mut inspect = false;
        if insp.max_val > 0 {
            value += 1;
            if value >= insp.max_val {
                inspect = true;
                value = 0;
            }
        } else if insp.random_freq > 0.0 {
            inspect = rng.gen::<f64>() < insp.random_freq;
        }

        if insp.time_interval > Duration::zero() {
            if let Some(last) = last_signal {
                if last + insp.time_interval < now {
                    inspect = true;
                }
            }
        }

        // The interval clock always starts somewhere
        if inspect || last_signal.is_none() {
            last_signal = Some(now);
        }
        save_counter(conn, &counter_key, value, last_signal)?;

        let mut e = NewEntry::new(LogType::Inspection, "", now);
        e.material.push(EventMaterial::new(material_id, process));
        e.location_name = "Inspect".to_string();
        e.program = counter_key;
        e.result = inspect.to_string();
        e.details
            .insert(DETAIL_INSPECTION_TYPE.to_string(), insp.inspection_type.clone());
        e.details
            .insert(DETAIL_ACTUAL_PATH.to_string(), path_json.clone());
        entries.push(store::append(conn, e)?);
    }
    Ok(entries)
}

/// Record an operator/rule override, bypassing the sampling state machine.
pub(crate) fn force(
    conn: &Connection,
    mat: &EventMaterial,
    inspection_type: &str,
    inspect: bool,
    now: DateTime<Utc>,
) -> Result<LogEntry> {
    let mut e = NewEntry::new(LogType::InspectionForce, "", now);
    e.material.push(mat.clone());
    e.location_name = "Inspect".to_string();
    e.result = inspect.to_string();
    e.details
        .insert(DETAIL_INSPECTION_TYPE.to_string(), inspection_type.to_string());
    store::append(conn, e)
}

// MARK: - Next-piece inspections

/// Request that the next material seen at a station be force-inspected.
pub(crate) fn set_next_piece(
    conn: &Connection,
    station: NextPieceStation,
    inspection_type: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO next_piece_inspections (station_kind, station_num, inspection_type)
         VALUES (?1, ?2, ?3)",
        params![station.station.to_string(), station.num, inspection_type],
    )?;
    Ok(())
}

/// Consume any pending next-piece requests for a station, emitting a forced
/// inspect decision for each.
pub(crate) fn check_next_piece(
    conn: &Connection,
    station: NextPieceStation,
    mat: &EventMaterial,
    now: DateTime<Utc>,
) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT inspection_type FROM next_piece_inspections
         WHERE station_kind = ?1 AND station_num = ?2",
    )?;
    let types = stmt
        .query_map(params![station.station.to_string(), station.num], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    drop(stmt);

    let mut entries = Vec::new();
    for ty in &types {
        entries.push(force(conn, mat, ty, true, now)?);
    }
    if !types.is_empty() {
        conn.execute(
            "DELETE FROM next_piece_inspections WHERE station_kind = ?1 AND station_num = ?2",
            params![station.station.to_string(), station.num],
        )?;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use crate::types::StationKind;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(Schema::create_tables()).unwrap();
        conn
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap()
    }

    fn path(process: i32, pallet: &str) -> ActualPath {
        ActualPath {
            material_id: 1,
            process,
            pallet: pallet.to_string(),
            load_station: 2,
            unload_station: 3,
            stops: vec![
                Stop {
                    station_group: "MC".to_string(),
                    station_num: 4,
                },
                Stop {
                    station_group: "MC".to_string(),
                    station_num: 7,
                },
            ],
        }
    }

    fn count_rule(ty: &str, max_val: i32) -> PathInspection {
        PathInspection {
            inspection_type: ty.to_string(),
            counter: "CMM,P%pal1%,S%stat1,1%".to_string(),
            max_val,
            random_freq: 0.0,
            time_interval: Duration::zero(),
        }
    }

    #[test]
    fn test_expand_counter_all_placeholders() {
        let expanded = expand_inspection_counter(
            "%pal1%-%load1%-%unload1%-%stat1,1%-%stat1,2%-%pal2%",
            &[path(1, "6"), path(2, "9")],
        );
        assert_eq!(expanded, "6-2-3-4-7-9");
    }

    #[test]
    fn test_expand_counter_leaves_unknown_placeholders() {
        let expanded = expand_inspection_counter("%pal3%", &[path(1, "6")]);
        assert_eq!(expanded, "%pal3%");
    }

    #[test]
    fn test_count_based_signals_every_max_val() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(7);

        // Distinct materials share the counter; after the first signal the
        // counter resets to 0 and then signals exactly every 3rd piece.
        let mut signals = Vec::new();
        for mat in 1..=10_i64 {
            let made = make_decisions(&conn, &mut rng, mat, 1, &[count_rule("CMM", 3)], now())
                .unwrap();
            assert_eq!(made.len(), 1);
            signals.push(made[0].result == "true");
        }

        let first = signals.iter().position(|s| *s).expect("some signal");
        assert!(first < 3, "random phase keeps first signal within max_val");
        for (i, s) in signals.iter().enumerate().skip(first + 1) {
            assert_eq!(*s, (i - first) % 3 == 0);
        }
    }

    #[test]
    fn test_idempotent_per_material() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(1);

        let first = make_decisions(&conn, &mut rng, 5, 1, &[count_rule("CMM", 3)], now()).unwrap();
        assert_eq!(first.len(), 1);

        // Second call with no new force in between is a no-op
        let second = make_decisions(&conn, &mut rng, 5, 1, &[count_rule("CMM", 3)], now()).unwrap();
        assert!(second.is_empty());
        assert_eq!(lookup_decisions(&conn, 5).unwrap().len(), 1);
    }

    #[test]
    fn test_forced_dont_inspect_does_not_bind() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(1);

        force(&conn, &EventMaterial::new(5, 1), "CMM", false, now()).unwrap();
        let made = make_decisions(&conn, &mut rng, 5, 1, &[count_rule("CMM", 3)], now()).unwrap();
        assert_eq!(made.len(), 1);

        // A forced "inspect" does bind
        force(&conn, &EventMaterial::new(6, 1), "CMM", true, now()).unwrap();
        let made = make_decisions(&conn, &mut rng, 6, 1, &[count_rule("CMM", 3)], now()).unwrap();
        assert!(made.is_empty());
    }

    #[test]
    fn test_frequency_rule_extremes() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(3);
        let always = PathInspection {
            inspection_type: "VIS".to_string(),
            counter: "VIS".to_string(),
            max_val: 0,
            random_freq: 1.0,
            time_interval: Duration::zero(),
        };
        let made = make_decisions(&conn, &mut rng, 1, 1, &[always], now()).unwrap();
        assert_eq!(made[0].result, "true");

        let never = PathInspection {
            inspection_type: "VIS2".to_string(),
            counter: "VIS2".to_string(),
            max_val: 0,
            random_freq: 0.0,
            time_interval: Duration::zero(),
        };
        let made = make_decisions(&conn, &mut rng, 2, 1, &[never], now()).unwrap();
        assert_eq!(made[0].result, "false");
    }

    #[test]
    fn test_time_interval_escalates() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(3);

        let rule = PathInspection {
            inspection_type: "CMM".to_string(),
            counter: "slowcounter".to_string(),
            max_val: 1000,
            random_freq: 0.0,
            time_interval: Duration::hours(1),
        };

        // Counter last signaled two hours ago
        save_counter(&conn, "slowcounter", 0, Some(now() - Duration::hours(2))).unwrap();

        let made = make_decisions(&conn, &mut rng, 1, 1, &[rule], now()).unwrap();
        assert_eq!(made[0].result, "true");

        let (_, last) = load_counter(&conn, "slowcounter").unwrap().unwrap();
        assert_eq!(last, Some(now()));
    }

    #[test]
    fn test_interval_clock_starts_on_first_decision() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(11);

        make_decisions(&conn, &mut rng, 1, 1, &[count_rule("CMM", 1000)], now()).unwrap();
        let key = expand_inspection_counter("CMM,P%pal1%,S%stat1,1%", &[]);
        let (_, last) = load_counter(&conn, &key).unwrap().unwrap();
        assert_eq!(last, Some(now()), "never-signaled counter gets a start time");
    }

    #[test]
    fn test_next_piece_consumed_once() {
        let conn = test_conn();
        let station = NextPieceStation {
            station: StationKind::Machine,
            num: 2,
        };
        set_next_piece(&conn, station, "CMM").unwrap();

        let mat = EventMaterial::new(9, 1);
        let made = check_next_piece(&conn, station, &mat, now()).unwrap();
        assert_eq!(made.len(), 1);
        assert_eq!(made[0].log_type, LogType::InspectionForce);
        assert_eq!(made[0].result, "true");

        // Consumed: the next material sees nothing
        let made = check_next_piece(&conn, station, &EventMaterial::new(10, 1), now()).unwrap();
        assert!(made.is_empty());
    }

    #[test]
    fn test_decisions_reconstructed_from_log() {
        let conn = test_conn();
        let mut rng = StdRng::seed_from_u64(2);

        make_decisions(&conn, &mut rng, 3, 1, &[count_rule("CMM", 2)], now()).unwrap();
        force(&conn, &EventMaterial::new(3, 1), "VIS", true, now()).unwrap();

        let decisions = lookup_decisions(&conn, 3).unwrap();
        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].inspection_type, "CMM");
        assert!(!decisions[0].forced);
        assert_eq!(decisions[1].inspection_type, "VIS");
        assert!(decisions[1].forced);
        assert!(decisions[1].inspect);
    }
}

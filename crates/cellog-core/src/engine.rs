//! The [`CellLog`] engine facade.
//!
//! One `CellLog` owns the database connection and serializes every
//! operation behind a single lock. Each mutating call runs as one
//! transaction: lock, begin, run, commit, unlock, then notify observers
//! with each produced entry in creation order. A failure anywhere rolls
//! the whole operation back and nothing is notified.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rusqlite::Connection;
use tracing::debug;

use crate::config::CellogConfig;
use crate::corrections::{self, SwapResult};
use crate::error::{CellogError, Result};
use crate::inspection;
use crate::material;
use crate::queues;
use crate::schema::{Schema, SCHEMA_VERSION};
use crate::store::{self, NewEntry};
use crate::tools;
use crate::types::{
    EventMaterial, InspectionDecision, LogEntry, LogType, MaterialDetails, NextPieceStation,
    PathInspection, QueuedMaterial, StationKind, ToolSnapshot, DETAIL_INSPECTION_TYPE,
    DETAIL_NOTE, DETAIL_OPERATOR,
};

/// Result strings reserved for load/unload cycles; manual work at a
/// load/unload station must use a different operation name.
const RESULT_LOAD: &str = "LOAD";
const RESULT_UNLOAD: &str = "UNLOAD";

type Observer = Box<dyn Fn(&LogEntry) + Send + Sync>;

struct Inner {
    conn: Connection,
    rng: Box<dyn RngCore + Send>,
}

/// The cell event log engine.
pub struct CellLog {
    inner: Mutex<Inner>,
    observers: Mutex<Vec<Observer>>,
    config: CellogConfig,
}

impl CellLog {
    /// Open or create a file-backed log.
    pub fn open(path: impl AsRef<Path>, config: CellogConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, config)
    }

    /// Open an in-memory log, primarily for tests.
    pub fn open_in_memory(config: CellogConfig) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: CellogConfig) -> Result<Self> {
        initialize(&conn)?;
        Ok(Self {
            inner: Mutex::new(Inner {
                conn,
                rng: Box::new(StdRng::from_entropy()),
            }),
            observers: Mutex::new(Vec::new()),
            config,
        })
    }

    /// Replace the sampling RNG, letting tests run deterministically.
    pub fn set_rng(&self, rng: Box<dyn RngCore + Send>) {
        self.lock_inner().rng = rng;
    }

    /// Register a callback invoked once per committed entry, after the
    /// commit and outside the engine lock, in entry-creation order.
    pub fn on_new_entry(&self, callback: impl Fn(&LogEntry) + Send + Sync + 'static) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one mutating operation: lock, transaction, commit, notify.
    fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &mut dyn RngCore) -> Result<(T, Vec<LogEntry>)>,
    {
        let (value, produced) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let tx = inner.conn.transaction()?;
            let out = f(&tx, inner.rng.as_mut())?;
            tx.commit()?;
            out
        };
        for entry in &produced {
            self.notify(entry);
        }
        Ok(value)
    }

    /// Mutation whose return value is exactly the produced entries.
    fn with_tx_entries<F>(&self, f: F) -> Result<Vec<LogEntry>>
    where
        F: FnOnce(&rusqlite::Transaction<'_>, &mut dyn RngCore) -> Result<Vec<LogEntry>>,
    {
        self.with_tx(|tx, rng| {
            let entries = f(tx, rng)?;
            Ok((entries.clone(), entries))
        })
    }

    fn with_tx_entry<F>(&self, f: F) -> Result<LogEntry>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<NewEntry>,
    {
        self.with_tx(|tx, _| {
            let entry = store::append(tx, f(tx)?)?;
            Ok((entry.clone(), vec![entry]))
        })
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let guard = self.lock_inner();
        f(&guard.conn)
    }

    fn notify(&self, entry: &LogEntry) {
        let observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer(entry);
        }
    }

    // MARK: - Load/unload stations

    pub fn record_load_start(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        debug!(pallet, lul_num, "record load start");
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.start_of_cycle = true;
            e.result = RESULT_LOAD.to_string();
            Ok(e)
        })
    }

    pub fn record_load_end(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        time: DateTime<Utc>,
        elapsed: Duration,
        active: Duration,
    ) -> Result<Vec<LogEntry>> {
        debug!(pallet, lul_num, "record load end");
        self.with_tx_entries(|tx, _| {
            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.result = RESULT_LOAD.to_string();
            e.elapsed = Some(elapsed);
            e.active = active;
            let mut entries = vec![store::append(tx, e)?];

            let station = NextPieceStation {
                station: StationKind::LoadUnload,
                num: lul_num,
            };
            for m in mats {
                entries.extend(inspection::check_next_piece(tx, station, m, time)?);
            }
            Ok(entries)
        })
    }

    pub fn record_unload_start(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        debug!(pallet, lul_num, "record unload start");
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.start_of_cycle = true;
            e.result = RESULT_UNLOAD.to_string();
            Ok(e)
        })
    }

    /// Record the end of an unload cycle. Materials present in `queues` are
    /// appended to their target queue after the unload entry; `end_of_route`
    /// is set when every unloaded material finished its final process.
    #[allow(clippy::too_many_arguments)]
    pub fn record_unload_end(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        time: DateTime<Utc>,
        elapsed: Duration,
        active: Duration,
        queues: Option<&HashMap<i64, String>>,
    ) -> Result<Vec<LogEntry>> {
        debug!(pallet, lul_num, "record unload end");
        self.with_tx_entries(|tx, _| {
            let mut end_of_route = !mats.is_empty();
            for m in mats {
                let num_processes = material::details(tx, m.material_id)?
                    .map(|d| d.num_processes)
                    .unwrap_or(m.process);
                end_of_route &= m.process >= num_processes;
            }

            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.result = RESULT_UNLOAD.to_string();
            e.end_of_route = end_of_route;
            e.elapsed = Some(elapsed);
            e.active = active;
            let mut entries = vec![store::append(tx, e)?];

            if let Some(map) = queues {
                for m in mats {
                    if let Some(queue) = map.get(&m.material_id) {
                        entries.extend(queues::add_to_queue(
                            tx, m, queue, -1, None, "Unloaded", time,
                        )?);
                    }
                }
            }
            Ok(entries)
        })
    }

    /// Record manual work performed at a load/unload station. The reserved
    /// operation names `LOAD` and `UNLOAD` are rejected.
    pub fn record_manual_work_start(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        operation: &str,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        check_manual_operation(operation)?;
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.start_of_cycle = true;
            e.result = operation.to_string();
            Ok(e)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_manual_work_end(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        lul_num: i32,
        operation: &str,
        time: DateTime<Utc>,
        elapsed: Duration,
        active: Duration,
    ) -> Result<LogEntry> {
        check_manual_operation(operation)?;
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::LoadUnload, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "L/U".to_string();
            e.location_num = lul_num;
            e.result = operation.to_string();
            e.elapsed = Some(elapsed);
            e.active = active;
            Ok(e)
        })
    }

    // MARK: - Machine cycles

    #[allow(clippy::too_many_arguments)]
    pub fn record_machine_start(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        station_group: &str,
        station_num: i32,
        program: &str,
        time: DateTime<Utc>,
        pockets: &[ToolSnapshot],
        extra_details: &HashMap<String, String>,
    ) -> Result<LogEntry> {
        debug!(pallet, station_group, station_num, program, "record machine start");
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::MachineCycle, pallet, time);
            e.material = mats.to_vec();
            e.location_name = station_group.to_string();
            e.location_num = station_num;
            e.program = program.to_string();
            e.start_of_cycle = true;
            e.details = extra_details.clone();
            e.pockets = pockets.to_vec();
            Ok(e)
        })
    }

    /// Record the end of a machine cycle. The pocket snapshot taken at the
    /// matching machine-start within the current pallet cycle is diffed
    /// against `pockets` into the entry's per-tool usage.
    #[allow(clippy::too_many_arguments)]
    pub fn record_machine_end(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        station_group: &str,
        station_num: i32,
        program: &str,
        time: DateTime<Utc>,
        elapsed: Duration,
        active: Duration,
        pockets: &[ToolSnapshot],
        extra_details: &HashMap<String, String>,
    ) -> Result<Vec<LogEntry>> {
        debug!(pallet, station_group, station_num, program, "record machine end");
        self.with_tx_entries(|tx, _| {
            let start_counter = store::current_pallet_log(tx, pallet)?
                .into_iter()
                .filter(|e| {
                    e.log_type == LogType::MachineCycle
                        && e.start_of_cycle
                        && e.location_name == station_group
                        && e.location_num == station_num
                })
                .map(|e| e.counter)
                .last();

            let mut e = NewEntry::new(LogType::MachineCycle, pallet, time);
            e.material = mats.to_vec();
            e.location_name = station_group.to_string();
            e.location_num = station_num;
            e.program = program.to_string();
            e.elapsed = Some(elapsed);
            e.active = active;
            e.details = extra_details.clone();
            e.pockets = pockets.to_vec();
            if let Some(counter) = start_counter {
                let start = store::pocket_snapshot(tx, counter)?;
                e.tools = tools::diff_snapshots(&start, pockets);
            }
            let mut entries = vec![store::append(tx, e)?];

            let station = NextPieceStation {
                station: StationKind::Machine,
                num: station_num,
            };
            for m in mats {
                entries.extend(inspection::check_next_piece(tx, station, m, time)?);
            }
            Ok(entries)
        })
    }

    // MARK: - Pallet movement

    pub fn record_pallet_arrive_stocker(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        stocker_num: i32,
        time: DateTime<Utc>,
        wait_for_machine: bool,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::PalletInStocker, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "Stocker".to_string();
            e.location_num = stocker_num;
            e.start_of_cycle = true;
            e.result = stocker_result(wait_for_machine);
            Ok(e)
        })
    }

    pub fn record_pallet_depart_stocker(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        stocker_num: i32,
        time: DateTime<Utc>,
        wait_for_machine: bool,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|tx| {
            let mut e = NewEntry::new(LogType::PalletInStocker, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "Stocker".to_string();
            e.location_num = stocker_num;
            e.result = stocker_result(wait_for_machine);
            e.elapsed = elapsed_since_arrive(tx, pallet, LogType::PalletInStocker, time)?;
            Ok(e)
        })
    }

    pub fn record_pallet_arrive_rotary_inbound(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        station_group: &str,
        station_num: i32,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::PalletOnRotaryInbound, pallet, time);
            e.material = mats.to_vec();
            e.location_name = station_group.to_string();
            e.location_num = station_num;
            e.start_of_cycle = true;
            Ok(e)
        })
    }

    /// Record a pallet leaving a rotary inbound table, either rotating into
    /// the worktable or returning to the cart.
    #[allow(clippy::too_many_arguments)]
    pub fn record_pallet_depart_rotary_inbound(
        &self,
        mats: &[EventMaterial],
        pallet: &str,
        station_group: &str,
        station_num: i32,
        time: DateTime<Utc>,
        rotate_into_worktable: bool,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|tx| {
            let mut e = NewEntry::new(LogType::PalletOnRotaryInbound, pallet, time);
            e.material = mats.to_vec();
            e.location_name = station_group.to_string();
            e.location_num = station_num;
            e.result = if rotate_into_worktable {
                "RotateIntoWorktable".to_string()
            } else {
                "LeaveMachine".to_string()
            };
            e.elapsed = elapsed_since_arrive(tx, pallet, LogType::PalletOnRotaryInbound, time)?;
            Ok(e)
        })
    }

    /// Close one pallet cycle. Everything recorded for the pallet after
    /// this entry belongs to the next cycle.
    pub fn complete_pallet_cycle(
        &self,
        pallet: &str,
        time: DateTime<Utc>,
        foreign_id: Option<&str>,
    ) -> Result<LogEntry> {
        debug!(pallet, "complete pallet cycle");
        self.with_tx_entry(|tx| {
            let mut e = NewEntry::new(LogType::PalletCycle, pallet, time);
            e.result = "PalletCycle".to_string();
            e.elapsed = store::last_pallet_cycle_time(tx, pallet)?.map(|last| time - last);
            e.foreign_id = foreign_id.map(String::from);
            Ok(e)
        })
    }

    // MARK: - Marks, orders, results

    /// Record a serial marked on a material: updates the registry and emits
    /// a PartMark entry.
    pub fn record_serial_for_material_id(
        &self,
        mat: &EventMaterial,
        serial: &str,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx(|tx, _| {
            material::set_serial(tx, mat.material_id, serial)?;
            let mut e = NewEntry::new(LogType::PartMark, "", time);
            e.material.push(mat.clone());
            e.location_name = "Mark".to_string();
            e.result = serial.to_string();
            let entry = store::append(tx, e)?;
            Ok((entry.clone(), vec![entry]))
        })
    }

    /// Assign a workorder to a material: updates the registry and emits an
    /// OrderAssignment entry.
    pub fn record_workorder_for_material_id(
        &self,
        mat: &EventMaterial,
        workorder: &str,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx(|tx, _| {
            material::set_workorder(tx, mat.material_id, workorder)?;
            let mut e = NewEntry::new(LogType::OrderAssignment, "", time);
            e.material.push(mat.clone());
            e.location_name = "Order".to_string();
            e.result = workorder.to_string();
            let entry = store::append(tx, e)?;
            Ok((entry.clone(), vec![entry]))
        })
    }

    pub fn record_finalized_workorder(
        &self,
        workorder: &str,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::FinalizeWorkorder, "", time);
            e.location_name = "FinalizeWorkorder".to_string();
            e.result = workorder.to_string();
            Ok(e)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_inspection_completed(
        &self,
        mat: &EventMaterial,
        inspection_num: i32,
        inspection_type: &str,
        success: bool,
        extra_details: &HashMap<String, String>,
        elapsed: Duration,
        active: Duration,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::InspectionResult, "", time);
            e.material.push(mat.clone());
            e.location_name = "InspectionComplete".to_string();
            e.location_num = inspection_num;
            e.program = inspection_type.to_string();
            e.result = success.to_string();
            e.elapsed = Some(elapsed);
            e.active = active;
            e.details = extra_details.clone();
            e.details
                .insert(DETAIL_INSPECTION_TYPE.to_string(), inspection_type.to_string());
            Ok(e)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_wash_completed(
        &self,
        mat: &EventMaterial,
        wash_num: i32,
        extra_details: &HashMap<String, String>,
        elapsed: Duration,
        active: Duration,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::Wash, "", time);
            e.material.push(mat.clone());
            e.location_name = "Wash".to_string();
            e.location_num = wash_num;
            e.elapsed = Some(elapsed);
            e.active = active;
            e.details = extra_details.clone();
            Ok(e)
        })
    }

    /// Flag a material for quarantine. Material currently riding a pallet
    /// gets a SignalQuarantine entry (the unload handler acts on it);
    /// material not on a pallet moves straight into the configured
    /// quarantine queue.
    pub fn signal_material_for_quarantine(
        &self,
        mat: &EventMaterial,
        operator: Option<&str>,
        reason: &str,
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        debug!(material_id = mat.material_id, "signal quarantine");
        let quarantine = self.config.quarantine_queue.clone();
        self.with_tx_entries(|tx, _| {
            if let Some(pallet) = pallet_holding_material(tx, mat.material_id)? {
                let mut e = NewEntry::new(LogType::SignalQuarantine, pallet, time);
                e.material.push(mat.clone());
                e.location_name = "QuarantineAfterUnload".to_string();
                e.result = reason.to_string();
                if let Some(op) = operator {
                    e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
                }
                return Ok(vec![store::append(tx, e)?]);
            }
            let queue = quarantine.as_deref().ok_or_else(|| {
                CellogError::InvalidArgument(
                    "material is not on a pallet and no quarantine queue is configured"
                        .to_string(),
                )
            })?;
            queues::add_to_queue(tx, mat, queue, -1, operator, reason, time)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_general_message(
        &self,
        mats: &[EventMaterial],
        program: &str,
        result: &str,
        pallet: &str,
        time: DateTime<Utc>,
        foreign_id: Option<&str>,
        original_message: Option<&str>,
        extra_details: &HashMap<String, String>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::GeneralMessage, pallet, time);
            e.material = mats.to_vec();
            e.location_name = "Message".to_string();
            e.program = program.to_string();
            e.result = result.to_string();
            e.foreign_id = foreign_id.map(String::from);
            e.original_message = original_message.map(String::from);
            e.details = extra_details.clone();
            Ok(e)
        })
    }

    pub fn record_operator_notes(
        &self,
        mat: &EventMaterial,
        notes: &str,
        operator: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx_entry(|_| {
            let mut e = NewEntry::new(LogType::GeneralMessage, "", time);
            e.material.push(mat.clone());
            e.location_name = "Message".to_string();
            e.program = "OperatorNotes".to_string();
            e.result = "Operator Notes".to_string();
            e.details.insert(DETAIL_NOTE.to_string(), notes.to_string());
            if let Some(op) = operator {
                e.details.insert(DETAIL_OPERATOR.to_string(), op.to_string());
            }
            Ok(e)
        })
    }

    // MARK: - Queues

    pub fn record_add_material_to_queue(
        &self,
        mat: &EventMaterial,
        queue: &str,
        position: i32,
        operator: Option<&str>,
        reason: &str,
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        debug!(material_id = mat.material_id, queue, position, "add to queue");
        self.with_tx_entries(|tx, _| {
            queues::add_to_queue(tx, mat, queue, position, operator, reason, time)
        })
    }

    pub fn record_remove_material_from_all_queues(
        &self,
        mat: &EventMaterial,
        operator: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        debug!(material_id = mat.material_id, "remove from queues");
        self.with_tx_entries(|tx, _| queues::remove_from_all_queues(tx, mat, operator, time))
    }

    pub fn material_in_queue(&self, queue: &str) -> Result<Vec<QueuedMaterial>> {
        self.read(|conn| queues::in_queue(conn, queue))
    }

    pub fn material_in_all_queues(&self) -> Result<Vec<QueuedMaterial>> {
        self.read(queues::in_all_queues)
    }

    pub fn next_process_for_queued_material(&self, material_id: i64) -> Result<Option<i32>> {
        self.read(|conn| queues::next_process_for_queued_material(conn, material_id))
    }

    // MARK: - Material registry

    pub fn allocate_material_id(
        &self,
        job_unique: &str,
        part_name: &str,
        num_processes: i32,
    ) -> Result<i64> {
        self.with_tx(|tx, _| {
            let id = material::allocate(tx, Some(job_unique), part_name, num_processes)?;
            Ok((id, Vec::new()))
        })
    }

    pub fn allocate_casting(&self, casting: &str) -> Result<i64> {
        self.with_tx(|tx, _| Ok((material::allocate_casting(tx, casting)?, Vec::new())))
    }

    pub fn set_material_details(
        &self,
        material_id: i64,
        job_unique: Option<&str>,
        part_name: Option<&str>,
        num_processes: Option<i32>,
    ) -> Result<()> {
        self.with_tx(|tx, _| {
            material::set_details(tx, material_id, job_unique, part_name, num_processes)?;
            Ok(((), Vec::new()))
        })
    }

    pub fn record_path_for_process(&self, material_id: i64, process: i32, path: i32) -> Result<()> {
        self.with_tx(|tx, _| {
            material::record_path(tx, material_id, process, path)?;
            Ok(((), Vec::new()))
        })
    }

    pub fn material_details(&self, material_id: i64) -> Result<Option<MaterialDetails>> {
        self.read(|conn| material::details(conn, material_id))
    }

    pub fn materials_by_serial(&self, serial: &str) -> Result<Vec<MaterialDetails>> {
        self.read(|conn| material::by_serial(conn, serial))
    }

    pub fn materials_by_workorder(&self, workorder: &str) -> Result<Vec<MaterialDetails>> {
        self.read(|conn| material::by_workorder(conn, workorder))
    }

    pub fn materials_by_job_unique(&self, unique: &str) -> Result<Vec<MaterialDetails>> {
        self.read(|conn| material::by_job_unique(conn, unique))
    }

    pub fn mark_castings_unallocated(&self, material_ids: &[i64], casting: &str) -> Result<()> {
        self.with_tx(|tx, _| {
            material::mark_castings_unallocated(tx, material_ids, casting)?;
            Ok(((), Vec::new()))
        })
    }

    /// Claim exactly `count` unassigned castings from a queue and bind them
    /// to a job, all-or-nothing. An empty result means fewer than `count`
    /// matching castings were queued and nothing was claimed.
    #[allow(clippy::too_many_arguments)]
    pub fn allocate_castings_in_queue(
        &self,
        queue: &str,
        casting: &str,
        job_unique: &str,
        part_name: &str,
        proc1_path: i32,
        num_processes: i32,
        count: usize,
    ) -> Result<Vec<i64>> {
        self.with_tx(|tx, _| {
            let ids = material::allocate_castings_in_queue(
                tx,
                queue,
                casting,
                job_unique,
                part_name,
                proc1_path,
                num_processes,
                count,
            )?;
            Ok((ids, Vec::new()))
        })
    }

    // MARK: - Inspections

    pub fn make_inspection_decisions(
        &self,
        material_id: i64,
        process: i32,
        inspections: &[PathInspection],
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        debug!(material_id, process, "make inspection decisions");
        self.with_tx_entries(|tx, rng| {
            inspection::make_decisions(tx, rng, material_id, process, inspections, time)
        })
    }

    pub fn force_inspection(
        &self,
        mat: &EventMaterial,
        inspection_type: &str,
        inspect: bool,
        time: DateTime<Utc>,
    ) -> Result<LogEntry> {
        self.with_tx(|tx, _| {
            let entry = inspection::force(tx, mat, inspection_type, inspect, time)?;
            Ok((entry.clone(), vec![entry]))
        })
    }

    /// Request a forced inspection of the next material seen at a station.
    pub fn next_piece_inspection(
        &self,
        station: NextPieceStation,
        inspection_type: &str,
    ) -> Result<()> {
        self.with_tx(|tx, _| {
            inspection::set_next_piece(tx, station, inspection_type)?;
            Ok(((), Vec::new()))
        })
    }

    pub fn check_material_for_next_piece_inspection(
        &self,
        station: NextPieceStation,
        mat: &EventMaterial,
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        self.with_tx_entries(|tx, _| inspection::check_next_piece(tx, station, mat, time))
    }

    pub fn lookup_inspection_decisions(&self, material_id: i64) -> Result<Vec<InspectionDecision>> {
        self.read(|conn| inspection::lookup_decisions(conn, material_id))
    }

    // MARK: - Corrective edits

    pub fn swap_material_in_current_pallet_cycle(
        &self,
        pallet: &str,
        old_material_id: i64,
        new_material_id: i64,
        operator: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<SwapResult> {
        debug!(pallet, old_material_id, new_material_id, "swap material");
        let quarantine = self.config.quarantine_queue.clone();
        self.with_tx(|tx, _| {
            let result = corrections::swap_material(
                tx,
                pallet,
                old_material_id,
                new_material_id,
                operator,
                quarantine.as_deref(),
                time,
            )?;
            let produced = result.new_log_entries.clone();
            Ok((result, produced))
        })
    }

    pub fn invalidate_pallet_cycle(
        &self,
        material_id: i64,
        process: i32,
        put_material_in_queue: Option<&str>,
        operator: Option<&str>,
        time: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        debug!(material_id, process, "invalidate pallet cycle");
        self.with_tx_entries(|tx, _| {
            corrections::invalidate_pallet_cycle(
                tx,
                material_id,
                process,
                put_material_in_queue,
                operator,
                time,
            )
        })
    }

    // MARK: - Log reads

    pub fn entry_for_counter(&self, counter: i64) -> Result<Option<LogEntry>> {
        self.read(|conn| store::entry_by_counter(conn, counter))
    }

    pub fn entries_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_between(conn, start, end))
    }

    pub fn entries_after_counter(&self, counter: i64) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_after_counter(conn, counter))
    }

    pub fn entries_for_material(&self, material_ids: &[i64]) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_for_material(conn, material_ids))
    }

    pub fn entries_for_serial(&self, serial: &str) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_for_serial(conn, serial))
    }

    pub fn entries_for_workorder(&self, workorder: &str) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_for_workorder(conn, workorder))
    }

    pub fn entries_for_job_unique(&self, unique: &str) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::entries_for_job_unique(conn, unique))
    }

    pub fn current_pallet_log(&self, pallet: &str) -> Result<Vec<LogEntry>> {
        self.read(|conn| store::current_pallet_log(conn, pallet))
    }

    pub fn last_pallet_cycle_time(&self, pallet: &str) -> Result<Option<DateTime<Utc>>> {
        self.read(|conn| store::last_pallet_cycle_time(conn, pallet))
    }

    pub fn pallet_time_range(
        &self,
        pallet: &str,
    ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        self.read(|conn| store::pallet_time_range(conn, pallet))
    }

    pub fn max_log_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.read(store::max_log_date)
    }

    pub fn max_foreign_id(&self) -> Result<Option<String>> {
        self.read(store::max_foreign_id)
    }

    pub fn foreign_id_for_counter(&self, counter: i64) -> Result<Option<String>> {
        self.read(|conn| store::foreign_id_for_counter(conn, counter))
    }

    pub fn most_recent_entry_for_foreign_id(&self, foreign_id: &str) -> Result<Option<LogEntry>> {
        self.read(|conn| store::most_recent_entry_for_foreign_id(conn, foreign_id))
    }

    pub fn cycle_exists(
        &self,
        time: DateTime<Utc>,
        pallet: &str,
        log_type: LogType,
        location_name: &str,
        location_num: i32,
    ) -> Result<bool> {
        self.read(|conn| {
            store::cycle_exists(conn, time, pallet, log_type, location_name, location_num)
        })
    }
}

// MARK: - Helpers

fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(Schema::create_tables())?;

    let version: Option<u32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    match version {
        None => {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        Some(v) if v > SCHEMA_VERSION => {
            return Err(CellogError::Storage(format!(
                "database schema version {} is newer than supported version {}",
                v, SCHEMA_VERSION
            )));
        }
        Some(v) if v < SCHEMA_VERSION => {
            for to in (v + 1)..=SCHEMA_VERSION {
                if let Some(sql) = Schema::migration(to - 1, to) {
                    conn.execute_batch(sql)?;
                }
            }
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [SCHEMA_VERSION],
            )?;
        }
        Some(_) => {}
    }
    Ok(())
}

fn check_manual_operation(operation: &str) -> Result<()> {
    if operation == RESULT_LOAD || operation == RESULT_UNLOAD {
        return Err(CellogError::InvalidArgument(format!(
            "operation name {} is reserved for load/unload cycles",
            operation
        )));
    }
    Ok(())
}

fn stocker_result(wait_for_machine: bool) -> String {
    if wait_for_machine {
        "WaitForMachine".to_string()
    } else {
        "Travel".to_string()
    }
}

/// Elapsed time since the matching arrive entry for this pallet, if one
/// exists.
fn elapsed_since_arrive(
    conn: &Connection,
    pallet: &str,
    log_type: LogType,
    now: DateTime<Utc>,
) -> Result<Option<Duration>> {
    let arrive = store::query_entries(
        conn,
        "pallet = ?1 AND log_type = ?2 AND start_of_cycle = 1",
        &[&pallet, &log_type.to_string()],
    )?
    .pop();
    Ok(arrive.map(|e| now - e.end_time))
}

/// The pallet whose current (not-yet-cycled) log contains this material,
/// if any.
fn pallet_holding_material(conn: &Connection, material_id: i64) -> Result<Option<String>> {
    let last_on_pallet = store::entries_for_material(conn, &[material_id])?
        .into_iter()
        .rev()
        .find(|e| !e.pallet.is_empty() && !e.is_invalidated());
    let Some(entry) = last_on_pallet else {
        return Ok(None);
    };
    let boundary = store::last_pallet_cycle_counter(conn, &entry.pallet)?.unwrap_or(0);
    if entry.counter > boundary {
        Ok(Some(entry.pallet))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn log() -> CellLog {
        CellLog::open_in_memory(CellogConfig::default()).unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_observers_notified_in_creation_order() {
        let log = log();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        log.on_new_entry(move |e| seen2.lock().unwrap().push(e.counter));

        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        let mat = EventMaterial::new(id, 1);
        log.record_add_material_to_queue(&mat, "buf", -1, None, "", now())
            .unwrap();
        let entries = log
            .record_add_material_to_queue(&mat, "other", -1, None, "", now())
            .unwrap();

        let counters: Vec<i64> = entries.iter().map(|e| e.counter).collect();
        let seen = seen.lock().unwrap();
        // remove-then-add from the second call, after the first add
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1..], counters[..]);
    }

    #[test]
    fn test_failed_operation_notifies_nothing() {
        let log = log();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        log.on_new_entry(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

        let err = log
            .record_serial_for_material_id(&EventMaterial::new(99, 1), "S1", now())
            .unwrap_err();
        assert!(matches!(err, CellogError::NotFound(_)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_work_rejects_reserved_names() {
        let log = log();
        for reserved in ["LOAD", "UNLOAD"] {
            let err = log
                .record_manual_work_start(&[], "1", 1, reserved, now())
                .unwrap_err();
            assert!(matches!(err, CellogError::InvalidArgument(_)));
        }
        log.record_manual_work_start(&[], "1", 1, "Deburr", now())
            .unwrap();
    }

    #[test]
    fn test_unload_end_auto_queues_and_flags_end_of_route() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 2).unwrap();

        // Process 1 of 2: queued, not end of route
        let mut map = HashMap::new();
        map.insert(id, "transfer".to_string());
        let entries = log
            .record_unload_end(
                &[EventMaterial::new(id, 1)],
                "3",
                1,
                now(),
                Duration::minutes(2),
                Duration::minutes(1),
                Some(&map),
            )
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].end_of_route);
        assert_eq!(entries[1].log_type, LogType::AddToQueue);
        assert_eq!(entries[1].location_name, "transfer");
        assert_eq!(log.material_in_queue("transfer").unwrap().len(), 1);

        // Final process: end of route
        let entries = log
            .record_unload_end(
                &[EventMaterial::new(id, 2)],
                "3",
                1,
                now(),
                Duration::minutes(2),
                Duration::minutes(1),
                None,
            )
            .unwrap();
        assert!(entries[0].end_of_route);
    }

    #[test]
    fn test_machine_end_diffs_tools_from_start_snapshot() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        let mats = [EventMaterial::new(id, 1)];
        let start_pockets = [ToolSnapshot {
            pocket: 1,
            tool: "T1".to_string(),
            current_use: Duration::minutes(10),
            tool_life: Duration::minutes(100),
        }];
        let end_pockets = [ToolSnapshot {
            pocket: 1,
            tool: "T1".to_string(),
            current_use: Duration::minutes(40),
            tool_life: Duration::minutes(100),
        }];
        let details = HashMap::new();

        log.record_machine_start(&mats, "3", "MC", 2, "prog1", now(), &start_pockets, &details)
            .unwrap();
        let entries = log
            .record_machine_end(
                &mats,
                "3",
                "MC",
                2,
                "prog1",
                now() + Duration::minutes(30),
                Duration::minutes(30),
                Duration::minutes(28),
                &end_pockets,
                &details,
            )
            .unwrap();

        let t1 = entries[0].tools.get("T1").unwrap();
        assert_eq!(t1.use_during_cycle, Duration::minutes(30));
        assert_eq!(t1.total_use_at_end_of_cycle, Duration::minutes(40));
        assert!(!t1.tool_change_occurred);
    }

    #[test]
    fn test_stocker_depart_carries_elapsed_since_arrive() {
        let log = log();
        log.record_pallet_arrive_stocker(&[], "5", 3, now(), true)
            .unwrap();
        let depart = log
            .record_pallet_depart_stocker(&[], "5", 3, now() + Duration::minutes(7), true)
            .unwrap();
        assert_eq!(depart.elapsed, Some(Duration::minutes(7)));
        assert_eq!(depart.result, "WaitForMachine");
    }

    #[test]
    fn test_pallet_cycle_resets_current_log() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        log.record_load_start(&[EventMaterial::new(id, 1)], "4", 1, now())
            .unwrap();
        assert_eq!(log.current_pallet_log("4").unwrap().len(), 1);

        let cycle = log
            .complete_pallet_cycle("4", now() + Duration::hours(1), Some("FID-9"))
            .unwrap();
        assert_eq!(cycle.log_type, LogType::PalletCycle);
        assert!(log.current_pallet_log("4").unwrap().is_empty());
        assert_eq!(
            log.last_pallet_cycle_time("4").unwrap(),
            Some(now() + Duration::hours(1))
        );
        assert_eq!(log.max_foreign_id().unwrap().as_deref(), Some("FID-9"));
    }

    #[test]
    fn test_serial_and_workorder_update_registry_and_log() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        let mat = EventMaterial::new(id, 1);

        let mark = log.record_serial_for_material_id(&mat, "S500", now()).unwrap();
        assert_eq!(mark.log_type, LogType::PartMark);
        assert_eq!(mark.result, "S500");
        // Snapshot resolved after the registry update
        assert_eq!(mark.material[0].serial.as_deref(), Some("S500"));

        log.record_workorder_for_material_id(&mat, "W77", now()).unwrap();
        let d = log.material_details(id).unwrap().unwrap();
        assert_eq!(d.serial.as_deref(), Some("S500"));
        assert_eq!(d.workorder.as_deref(), Some("W77"));
        assert_eq!(log.entries_for_serial("S500").unwrap().len(), 1);
    }

    #[test]
    fn test_quarantine_on_pallet_vs_queued() {
        let log = CellLog::open_in_memory(CellogConfig::with_quarantine_queue("quarantine"))
            .unwrap();
        let on_pallet = log.allocate_material_id("J1", "P1", 1).unwrap();
        log.record_load_start(&[EventMaterial::new(on_pallet, 1)], "2", 1, now())
            .unwrap();

        let entries = log
            .signal_material_for_quarantine(
                &EventMaterial::new(on_pallet, 1),
                Some("pat"),
                "scratch",
                now(),
            )
            .unwrap();
        assert_eq!(entries[0].log_type, LogType::SignalQuarantine);
        assert_eq!(entries[0].pallet, "2");

        let queued = log.allocate_material_id("J1", "P1", 1).unwrap();
        let entries = log
            .signal_material_for_quarantine(&EventMaterial::new(queued, 1), None, "", now())
            .unwrap();
        assert_eq!(entries.last().unwrap().log_type, LogType::AddToQueue);
        assert!(log
            .material_in_queue("quarantine")
            .unwrap()
            .iter()
            .any(|q| q.material_id == queued));
    }

    #[test]
    fn test_quarantine_off_pallet_requires_configured_queue() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        let err = log
            .signal_material_for_quarantine(&EventMaterial::new(id, 1), None, "", now())
            .unwrap_err();
        assert!(matches!(err, CellogError::InvalidArgument(_)));
    }

    #[test]
    fn test_next_piece_consumed_at_load_end() {
        let log = log();
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        log.next_piece_inspection(
            NextPieceStation {
                station: StationKind::LoadUnload,
                num: 1,
            },
            "CMM",
        )
        .unwrap();

        let entries = log
            .record_load_end(
                &[EventMaterial::new(id, 1)],
                "2",
                1,
                now(),
                Duration::minutes(1),
                Duration::minutes(1),
            )
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].log_type, LogType::InspectionForce);

        let decisions = log.lookup_inspection_decisions(id).unwrap();
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].inspect && decisions[0].forced);
    }

    #[test]
    fn test_swap_through_engine_notifies_new_entries_only() {
        let log = log();
        let old = log.allocate_material_id("J1", "P1", 2).unwrap();
        log.record_path_for_process(old, 1, 1).unwrap();
        log.record_load_end(
            &[EventMaterial::new(old, 1)],
            "3",
            1,
            now(),
            Duration::minutes(1),
            Duration::minutes(1),
        )
        .unwrap();
        let new = log.allocate_casting("blank").unwrap();
        log.record_add_material_to_queue(&EventMaterial::new(new, 0), "raw", -1, None, "", now())
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        log.on_new_entry(move |e| seen2.lock().unwrap().push(e.counter));

        let result = log
            .swap_material_in_current_pallet_cycle("3", old, new, None, now())
            .unwrap();
        assert_eq!(result.changed_log_entries.len(), 1);
        assert_eq!(result.changed_log_entries[0].material[0].material_id, new);

        let seen = seen.lock().unwrap();
        let new_counters: Vec<i64> = result.new_log_entries.iter().map(|e| e.counter).collect();
        assert_eq!(*seen, new_counters);
    }

    #[test]
    fn test_deterministic_inspections_with_seeded_rng(){
        let log = log();
        log.set_rng(Box::new(StdRng::seed_from_u64(42)));
        let rule = PathInspection {
            inspection_type: "CMM".to_string(),
            counter: "fixed".to_string(),
            max_val: 0,
            random_freq: 1.0,
            time_interval: Duration::zero(),
        };
        let id = log.allocate_material_id("J1", "P1", 1).unwrap();
        let entries = log
            .make_inspection_decisions(id, 1, &[rule], now())
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, "true");
    }
}

// ==========================================
// 模式化排产系统 - 排程结果仓储
// ==========================================
// 职责: solved_schedule / task_assignment / sequence_reservation 读写
// 红线: 保存排程为单事务 (排程 + 分配 + 预留 + 实例状态)
// 红线: 排程记录写入后不修改，新求解生成新记录
// ==========================================

use crate::db::{init_schema, open_sqlite_connection};
use crate::domain::schedule::{
    ObjectiveValues, PhaseResult, SequenceReservation, SolvedSchedule, TaskAssignment,
};
use crate::domain::types::{InstanceStatus, SolveStatus};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_types::{format_datetime, parse_datetime, parse_enum};
use crate::repository::traits::ScheduleStore;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use tracing::{debug, instrument};

/// 排程摘要
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSummary {
    pub schedule_id: String,
    pub pattern_id: String,
    pub status: SolveStatus,
    pub objectives: ObjectiveValues,
    pub instance_count: usize,
    pub solve_time_seconds: f64,
    pub created_at: NaiveDateTime,
}

// ==========================================
// ScheduleRepository
// ==========================================
pub struct ScheduleRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ScheduleRepository {
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 保存排程 (单事务)
    ///
    /// # 说明
    /// 参与实例必须存在且处于 PENDING / SCHEDULED，保存后置为 SCHEDULED
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.schedule_id, pattern_id = %schedule.pattern_id))]
    pub fn insert(&self, schedule: &SolvedSchedule) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO solved_schedule
                (schedule_id, pattern_id, instance_ids_json, origin, status, solve_time_seconds,
                 total_lateness_minutes, makespan_minutes, total_cost_cents, phase_results_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                schedule.schedule_id,
                schedule.pattern_id,
                serde_json::to_string(&schedule.instance_ids)?,
                format_datetime(&schedule.origin),
                schedule.status.to_string(),
                schedule.solve_time_seconds,
                schedule.objectives.total_lateness_minutes,
                schedule.objectives.makespan_minutes,
                schedule.objectives.total_cost_cents,
                serde_json::to_string(&schedule.phase_results)?,
                format_datetime(&schedule.created_at)
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO task_assignment
                    (schedule_id, instance_id, task_id, mode_id, machine_id,
                     start_minute, end_minute, start_time, end_time)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for a in &schedule.assignments {
                stmt.execute(params![
                    schedule.schedule_id,
                    a.instance_id,
                    a.task_id,
                    a.mode_id,
                    a.machine_id,
                    a.start_minute,
                    a.end_minute,
                    format_datetime(&a.start_time(schedule.origin)),
                    format_datetime(&a.end_time(schedule.origin))
                ])?;
            }

            let mut stmt = tx.prepare(
                r#"
                INSERT INTO sequence_reservation
                    (schedule_id, sequence_id, instance_id, task_id, start_minute, end_minute)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )?;
            for r in &schedule.reservations {
                stmt.execute(params![
                    schedule.schedule_id,
                    r.sequence_id,
                    r.instance_id,
                    r.task_id,
                    r.start_minute,
                    r.end_minute
                ])?;
            }

            // 实例状态 → SCHEDULED
            for instance_id in &schedule.instance_ids {
                let updated = tx.execute(
                    r#"
                    UPDATE job_instance SET status = ?1, updated_at = datetime('now')
                    WHERE instance_id = ?2 AND status IN ('PENDING', 'SCHEDULED')
                    "#,
                    params![InstanceStatus::Scheduled.to_string(), instance_id],
                )?;
                if updated == 0 {
                    let current: Option<String> = tx
                        .query_row(
                            "SELECT status FROM job_instance WHERE instance_id = ?1",
                            params![instance_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    return Err(match current {
                        Some(from) => RepositoryError::InvalidStateTransition {
                            from,
                            to: InstanceStatus::Scheduled.to_string(),
                        },
                        None => RepositoryError::not_found("JobInstance", instance_id),
                    });
                }
            }
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        debug!(
            assignment_count = schedule.assignments.len(),
            reservation_count = schedule.reservations.len(),
            "排程已保存"
        );
        Ok(())
    }

    /// 按ID查询排程
    pub fn find_by_id(&self, schedule_id: &str) -> RepositoryResult<Option<SolvedSchedule>> {
        let conn = self.get_conn()?;

        let header = conn
            .query_row(
                r#"
                SELECT pattern_id, instance_ids_json, origin, status, solve_time_seconds,
                       total_lateness_minutes, makespan_minutes, total_cost_cents,
                       phase_results_json, created_at
                FROM solved_schedule WHERE schedule_id = ?1
                "#,
                params![schedule_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        ObjectiveValues {
                            total_lateness_minutes: row.get(5)?,
                            makespan_minutes: row.get(6)?,
                            total_cost_cents: row.get(7)?,
                        },
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                    ))
                },
            )
            .optional()?;
        let Some((pattern_id, ids_json, origin, status, solve_time, objectives, phases_json, created_at)) =
            header
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            r#"
            SELECT instance_id, task_id, mode_id, machine_id, start_minute, end_minute
            FROM task_assignment WHERE schedule_id = ?1
            ORDER BY instance_id, task_id
            "#,
        )?;
        let assignments = stmt
            .query_map(params![schedule_id], |row| {
                Ok(TaskAssignment {
                    instance_id: row.get(0)?,
                    task_id: row.get(1)?,
                    mode_id: row.get(2)?,
                    machine_id: row.get(3)?,
                    start_minute: row.get(4)?,
                    end_minute: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT sequence_id, instance_id, task_id, start_minute, end_minute
            FROM sequence_reservation WHERE schedule_id = ?1
            ORDER BY sequence_id, start_minute, instance_id
            "#,
        )?;
        let reservations = stmt
            .query_map(params![schedule_id], |row| {
                Ok(SequenceReservation {
                    sequence_id: row.get(0)?,
                    instance_id: row.get(1)?,
                    task_id: row.get(2)?,
                    start_minute: row.get(3)?,
                    end_minute: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(SolvedSchedule {
            schedule_id: schedule_id.to_string(),
            pattern_id,
            instance_ids: serde_json::from_str(&ids_json)?,
            origin: parse_datetime("origin", &origin)?,
            status: parse_enum("status", &status)?,
            solve_time_seconds: solve_time,
            objectives,
            assignments,
            reservations,
            phase_results: serde_json::from_str::<Vec<PhaseResult>>(&phases_json)?,
            created_at: parse_datetime("created_at", &created_at)?,
        }))
    }

    /// 模式最近的排程 (按创建时间倒序)
    pub fn list_by_pattern(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<ScheduleSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT schedule_id, pattern_id, status, total_lateness_minutes, makespan_minutes,
                   total_cost_cents, instance_ids_json, solve_time_seconds, created_at
            FROM solved_schedule
            WHERE pattern_id = ?1
            ORDER BY created_at DESC, schedule_id
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![pattern_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    ObjectiveValues {
                        total_lateness_minutes: row.get(3)?,
                        makespan_minutes: row.get(4)?,
                        total_cost_cents: row.get(5)?,
                    },
                    row.get::<_, String>(6)?,
                    row.get::<_, f64>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(schedule_id, pattern_id, status, objectives, ids_json, solve_time, created_at)| {
                let ids: Vec<String> = serde_json::from_str(&ids_json)?;
                Ok(ScheduleSummary {
                    schedule_id,
                    pattern_id,
                    status: parse_enum("status", &status)?,
                    objectives,
                    instance_count: ids.len(),
                    solve_time_seconds: solve_time,
                    created_at: parse_datetime("created_at", &created_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ScheduleStore for ScheduleRepository {
    async fn store_solved_schedule(&self, schedule: &SolvedSchedule) -> RepositoryResult<()> {
        self.insert(schedule)
    }

    async fn load_solved_schedule(&self, schedule_id: &str) -> RepositoryResult<SolvedSchedule> {
        self.find_by_id(schedule_id)?
            .ok_or_else(|| RepositoryError::not_found("SolvedSchedule", schedule_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instance::JobInstance;
    use crate::domain::pattern::{Machine, Pattern, PatternTask, TaskMode};
    use crate::domain::schedule::ObjectiveLock;
    use crate::domain::types::SolvePhase;
    use crate::repository::pattern_repo::PatternRepository;
    use chrono::NaiveDate;

    fn origin() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap()
    }

    fn setup() -> (PatternRepository, ScheduleRepository) {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));

        let patterns = PatternRepository::from_connection(conn.clone());
        patterns.upsert_machine(&Machine::new("M1", "Bench", 6_000)).unwrap();
        patterns
            .save_pattern(
                &Pattern::new("P1", "Single").with_task(
                    PatternTask::new("t", 1).with_mode(TaskMode::new("t-m1", "M1", 30)),
                ),
            )
            .unwrap();
        for id in ["J1", "J2"] {
            patterns.insert_instance(&JobInstance::new(id, "P1", origin())).unwrap();
        }
        (patterns, ScheduleRepository::from_connection(conn))
    }

    fn schedule(instance_ids: &[&str]) -> SolvedSchedule {
        let assignments = instance_ids
            .iter()
            .enumerate()
            .map(|(i, id)| TaskAssignment {
                instance_id: id.to_string(),
                task_id: "t".to_string(),
                mode_id: "t-m1".to_string(),
                machine_id: "M1".to_string(),
                start_minute: i as i64 * 30,
                end_minute: (i as i64 + 1) * 30,
            })
            .collect();
        SolvedSchedule {
            schedule_id: uuid::Uuid::new_v4().to_string(),
            pattern_id: "P1".to_string(),
            instance_ids: instance_ids.iter().map(|s| s.to_string()).collect(),
            origin: origin(),
            status: SolveStatus::Optimal,
            solve_time_seconds: 0.125,
            objectives: ObjectiveValues {
                total_lateness_minutes: 90,
                makespan_minutes: 60,
                total_cost_cents: 6_000,
            },
            assignments,
            reservations: vec![SequenceReservation {
                sequence_id: "Opto".to_string(),
                instance_id: "J1".to_string(),
                task_id: "t".to_string(),
                start_minute: -2,
                end_minute: 31,
            }],
            phase_results: vec![PhaseResult {
                phase: SolvePhase::Lateness,
                status: SolveStatus::Optimal,
                objective_value: Some(90),
                elapsed_seconds: 0.05,
                locked: Some(ObjectiveLock::Exact(90)),
            }],
            created_at: origin(),
        }
    }

    #[test]
    fn test_store_and_reload_round_trip() {
        let (patterns, repo) = setup();
        let original = schedule(&["J1", "J2"]);
        repo.insert(&original).unwrap();

        let loaded = repo.find_by_id(&original.schedule_id).unwrap().unwrap();
        assert_eq!(loaded.sorted_assignments(), original.sorted_assignments());
        assert_eq!(loaded.reservations, original.reservations);
        assert_eq!(loaded.phase_results, original.phase_results);
        assert_eq!(loaded.objectives, original.objectives);
        assert_eq!(loaded.instance_ids, original.instance_ids);

        assert_eq!(
            patterns.find_instance("J1").unwrap().unwrap().status,
            InstanceStatus::Scheduled
        );
    }

    #[test]
    fn test_store_rolls_back_on_unknown_instance() {
        let (patterns, repo) = setup();
        let bad = schedule(&["J1", "GHOST"]);

        assert!(matches!(repo.insert(&bad), Err(RepositoryError::NotFound { .. })));
        assert!(repo.find_by_id(&bad.schedule_id).unwrap().is_none());
        assert_eq!(
            patterns.find_instance("J1").unwrap().unwrap().status,
            InstanceStatus::Pending
        );
    }

    #[test]
    fn test_completed_instance_cannot_be_rescheduled() {
        let (patterns, repo) = setup();
        patterns.update_instance_status("J2", InstanceStatus::Scheduled).unwrap();
        patterns.update_instance_status("J2", InstanceStatus::InProgress).unwrap();
        patterns.update_instance_status("J2", InstanceStatus::Completed).unwrap();

        assert!(matches!(
            repo.insert(&schedule(&["J2"])),
            Err(RepositoryError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_list_by_pattern() {
        let (_patterns, repo) = setup();
        repo.insert(&schedule(&["J1"])).unwrap();
        repo.insert(&schedule(&["J1", "J2"])).unwrap();

        let summaries = repo.list_by_pattern("P1", 10).unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().any(|s| s.instance_count == 2));
        assert_eq!(repo.list_by_pattern("P1", 1).unwrap().len(), 1);
    }
}

// ==========================================
// 模式化排产系统 - 模式/主数据仓储
// ==========================================
// 职责: machine / pattern(+任务/模式/前序/换型) / sequence_resource / job_instance
// 红线: Repository 不含业务逻辑，模式合法性由 PatternCompiler 校验
// 约束: 所有查询使用参数化
// ==========================================

use crate::db::{init_schema, open_sqlite_connection};
use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern, PatternTask, Precedence, SetupTimeEntry, TaskMode};
use crate::domain::resource::SequenceResource;
use crate::domain::types::{InstanceStatus, ResourceType};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_types::{format_datetime, parse_datetime, parse_enum};
use crate::repository::traits::PatternSource;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// 模式摘要 (列表展示)
#[derive(Debug, Clone, PartialEq)]
pub struct PatternSummary {
    pub pattern_id: String,
    pub name: String,
    pub version: i32,
    pub task_count: i64,
    pub baseline_performance_seconds: Option<f64>,
}

// ==========================================
// PatternRepository
// ==========================================
pub struct PatternRepository {
    conn: Arc<Mutex<Connection>>,
}

impl PatternRepository {
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

    // ==========================================
    // 设备
    // ==========================================

    pub fn upsert_machine(&self, machine: &Machine) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO machine (machine_id, name, cost_per_hour_cents)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(machine_id) DO UPDATE SET
                name = excluded.name,
                cost_per_hour_cents = excluded.cost_per_hour_cents
            "#,
            params![machine.machine_id, machine.name, machine.cost_per_hour_cents],
        )?;
        Ok(())
    }

    pub fn list_machines(&self) -> RepositoryResult<Vec<Machine>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT machine_id, name, cost_per_hour_cents FROM machine ORDER BY machine_id",
        )?;
        let machines = stmt
            .query_map([], |row| {
                Ok(Machine {
                    machine_id: row.get(0)?,
                    name: row.get(1)?,
                    cost_per_hour_cents: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(machines)
    }

    // ==========================================
    // 模式
    // ==========================================

    /// 保存模式 (整体替换子表, 单事务)
    pub fn save_pattern(&self, pattern: &Pattern) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let parameters_json = if pattern.solver_parameters.is_null() {
            None
        } else {
            Some(serde_json::to_string(&pattern.solver_parameters)?)
        };

        tx.execute(
            r#"
            INSERT INTO pattern (pattern_id, name, version, solver_parameters_json, baseline_performance_seconds)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(pattern_id) DO UPDATE SET
                name = excluded.name,
                version = excluded.version,
                solver_parameters_json = excluded.solver_parameters_json,
                baseline_performance_seconds = COALESCE(excluded.baseline_performance_seconds, pattern.baseline_performance_seconds),
                updated_at = datetime('now')
            "#,
            params![
                pattern.pattern_id,
                pattern.name,
                pattern.version,
                parameters_json,
                pattern.baseline_performance_seconds
            ],
        )?;

        for table in ["task_mode", "pattern_task", "pattern_precedence", "setup_time"] {
            tx.execute(
                &format!("DELETE FROM {} WHERE pattern_id = ?1", table),
                params![pattern.pattern_id],
            )?;
        }

        for task in &pattern.tasks {
            tx.execute(
                r#"
                INSERT INTO pattern_task
                    (pattern_id, task_id, name, position, department, sequence_id, min_operators, max_operators)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    pattern.pattern_id,
                    task.task_id,
                    task.name,
                    task.position,
                    task.department,
                    task.sequence_id,
                    task.min_operators,
                    task.max_operators
                ],
            )?;
            for (order, mode) in task.modes.iter().enumerate() {
                tx.execute(
                    r#"
                    INSERT INTO task_mode
                        (pattern_id, task_id, mode_id, machine_id, duration_minutes, setup_cost_cents, mode_order)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    "#,
                    params![
                        pattern.pattern_id,
                        task.task_id,
                        mode.mode_id,
                        mode.machine_id,
                        mode.duration_minutes,
                        mode.setup_cost_cents,
                        order as i64
                    ],
                )?;
            }
        }

        for p in &pattern.precedences {
            tx.execute(
                r#"
                INSERT INTO pattern_precedence (pattern_id, before_task_id, after_task_id, min_lag_minutes)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![pattern.pattern_id, p.before_task_id, p.after_task_id, p.min_lag_minutes],
            )?;
        }

        for s in &pattern.setup_times {
            tx.execute(
                r#"
                INSERT INTO setup_time (pattern_id, from_task_id, to_task_id, machine_id, setup_time_minutes)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![
                    pattern.pattern_id,
                    s.from_task_id,
                    s.to_task_id,
                    s.machine_id,
                    s.setup_time_minutes
                ],
            )?;
        }

        tx.commit()
            .map_err(|e| RepositoryError::DatabaseTransactionError(e.to_string()))?;

        debug!(
            pattern_id = %pattern.pattern_id,
            task_count = pattern.tasks.len(),
            "模式已保存"
        );
        Ok(())
    }

    /// 按ID查询模式
    ///
    /// # 返回
    /// - Ok(Some(Pattern)): 模式及全部子表
    /// - Ok(None): 不存在
    pub fn find_pattern(&self, pattern_id: &str) -> RepositoryResult<Option<Pattern>> {
        let conn = self.get_conn()?;

        let header = conn
            .query_row(
                r#"
                SELECT name, version, solver_parameters_json, baseline_performance_seconds
                FROM pattern WHERE pattern_id = ?1
                "#,
                params![pattern_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i32>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((name, version, parameters_json, baseline)) = header else {
            return Ok(None);
        };

        let solver_parameters = match parameters_json {
            Some(raw) => serde_json::from_str::<JsonValue>(&raw)?,
            None => JsonValue::Null,
        };

        // 执行模式 (按 mode_order)
        let mut modes_by_task: HashMap<String, Vec<TaskMode>> = HashMap::new();
        {
            let mut stmt = conn.prepare(
                r#"
                SELECT task_id, mode_id, machine_id, duration_minutes, setup_cost_cents
                FROM task_mode WHERE pattern_id = ?1
                ORDER BY task_id, mode_order, mode_id
                "#,
            )?;
            let rows = stmt.query_map(params![pattern_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TaskMode {
                        mode_id: row.get(1)?,
                        machine_id: row.get(2)?,
                        duration_minutes: row.get(3)?,
                        setup_cost_cents: row.get(4)?,
                    },
                ))
            })?;
            for row in rows {
                let (task_id, mode) = row?;
                modes_by_task.entry(task_id).or_default().push(mode);
            }
        }

        let mut stmt = conn.prepare(
            r#"
            SELECT task_id, name, position, department, sequence_id, min_operators, max_operators
            FROM pattern_task WHERE pattern_id = ?1
            ORDER BY position, task_id
            "#,
        )?;
        let tasks = stmt
            .query_map(params![pattern_id], |row| {
                Ok(PatternTask {
                    task_id: row.get(0)?,
                    name: row.get(1)?,
                    position: row.get(2)?,
                    department: row.get(3)?,
                    sequence_id: row.get(4)?,
                    min_operators: row.get(5)?,
                    max_operators: row.get(6)?,
                    modes: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|mut task| {
                task.modes = modes_by_task.remove(&task.task_id).unwrap_or_default();
                task
            })
            .collect();

        let mut stmt = conn.prepare(
            r#"
            SELECT before_task_id, after_task_id, min_lag_minutes
            FROM pattern_precedence WHERE pattern_id = ?1
            ORDER BY before_task_id, after_task_id
            "#,
        )?;
        let precedences = stmt
            .query_map(params![pattern_id], |row| {
                Ok(Precedence {
                    before_task_id: row.get(0)?,
                    after_task_id: row.get(1)?,
                    min_lag_minutes: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            r#"
            SELECT from_task_id, to_task_id, machine_id, setup_time_minutes
            FROM setup_time WHERE pattern_id = ?1
            ORDER BY from_task_id, to_task_id, machine_id
            "#,
        )?;
        let setup_times = stmt
            .query_map(params![pattern_id], |row| {
                Ok(SetupTimeEntry {
                    from_task_id: row.get(0)?,
                    to_task_id: row.get(1)?,
                    machine_id: row.get(2)?,
                    setup_time_minutes: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(Pattern {
            pattern_id: pattern_id.to_string(),
            name,
            version,
            tasks,
            precedences,
            setup_times,
            solver_parameters,
            baseline_performance_seconds: baseline,
        }))
    }

    pub fn list_patterns(&self) -> RepositoryResult<Vec<PatternSummary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT p.pattern_id, p.name, p.version, COUNT(t.task_id), p.baseline_performance_seconds
            FROM pattern p
            LEFT JOIN pattern_task t ON t.pattern_id = p.pattern_id
            GROUP BY p.pattern_id
            ORDER BY p.pattern_id
            "#,
        )?;
        let summaries = stmt
            .query_map([], |row| {
                Ok(PatternSummary {
                    pattern_id: row.get(0)?,
                    name: row.get(1)?,
                    version: row.get(2)?,
                    task_count: row.get(3)?,
                    baseline_performance_seconds: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(summaries)
    }

    // ==========================================
    // 序列资源
    // ==========================================

    pub fn upsert_sequence_resource(&self, resource: &SequenceResource) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO sequence_resource
                (sequence_id, name, capacity, max_concurrent_jobs, resource_type,
                 setup_minutes, teardown_minutes, window_start_minute, window_end_minute, is_active)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(sequence_id) DO UPDATE SET
                name = excluded.name,
                capacity = excluded.capacity,
                max_concurrent_jobs = excluded.max_concurrent_jobs,
                resource_type = excluded.resource_type,
                setup_minutes = excluded.setup_minutes,
                teardown_minutes = excluded.teardown_minutes,
                window_start_minute = excluded.window_start_minute,
                window_end_minute = excluded.window_end_minute,
                is_active = excluded.is_active
            "#,
            params![
                resource.sequence_id,
                resource.name,
                resource.capacity,
                resource.max_concurrent_jobs,
                resource.resource_type.to_string(),
                resource.setup_minutes,
                resource.teardown_minutes,
                resource.window_start_minute,
                resource.window_end_minute,
                resource.is_active
            ],
        )?;
        Ok(())
    }

    pub fn list_sequence_resources(&self, active_only: bool) -> RepositoryResult<Vec<SequenceResource>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT sequence_id, name, capacity, max_concurrent_jobs, resource_type,
                   setup_minutes, teardown_minutes, window_start_minute, window_end_minute, is_active
            FROM sequence_resource
            WHERE (?1 = 0 OR is_active = 1)
            ORDER BY sequence_id
            "#,
        )?;
        let rows = stmt
            .query_map(params![active_only], |row| {
                Ok((
                    row.get::<_, String>(4)?,
                    SequenceResource {
                        sequence_id: row.get(0)?,
                        name: row.get(1)?,
                        capacity: row.get(2)?,
                        max_concurrent_jobs: row.get(3)?,
                        resource_type: ResourceType::Exclusive, // 下方按列值覆盖
                        setup_minutes: row.get(5)?,
                        teardown_minutes: row.get(6)?,
                        window_start_minute: row.get(7)?,
                        window_end_minute: row.get(8)?,
                        is_active: row.get(9)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(raw_type, mut resource)| {
                resource.resource_type = parse_enum("resource_type", &raw_type)?;
                Ok(resource)
            })
            .collect()
    }

    // ==========================================
    // 作业实例
    // ==========================================

    pub fn insert_instance(&self, instance: &JobInstance) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO job_instance (instance_id, pattern_id, due_date, priority, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                instance.instance_id,
                instance.pattern_id,
                format_datetime(&instance.due_date),
                instance.priority,
                instance.status.to_string()
            ],
        )?;
        Ok(())
    }

    pub fn find_instance(&self, instance_id: &str) -> RepositoryResult<Option<JobInstance>> {
        let conn = self.get_conn()?;
        let row = conn
            .query_row(
                r#"
                SELECT instance_id, pattern_id, due_date, priority, status
                FROM job_instance WHERE instance_id = ?1
                "#,
                params![instance_id],
                raw_instance,
            )
            .optional()?;
        row.map(RawInstance::into_domain).transpose()
    }

    /// 可排产实例 (PENDING / SCHEDULED), 交期升序
    pub fn list_schedulable_instances(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<JobInstance>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT instance_id, pattern_id, due_date, priority, status
            FROM job_instance
            WHERE pattern_id = ?1 AND status IN ('PENDING', 'SCHEDULED')
            ORDER BY due_date, priority DESC, instance_id
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![pattern_id, limit as i64], raw_instance)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawInstance::into_domain).collect()
    }

    /// 更新实例状态 (校验状态流转)
    pub fn update_instance_status(&self, instance_id: &str, status: InstanceStatus) -> RepositoryResult<()> {
        let current = self
            .find_instance(instance_id)?
            .ok_or_else(|| RepositoryError::not_found("JobInstance", instance_id))?;
        if !transition_allowed(current.status, status) {
            return Err(RepositoryError::InvalidStateTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            });
        }

        let conn = self.get_conn()?;
        conn.execute(
            "UPDATE job_instance SET status = ?1, updated_at = datetime('now') WHERE instance_id = ?2",
            params![status.to_string(), instance_id],
        )?;
        Ok(())
    }
}

/// 实例状态流转规则
pub fn transition_allowed(from: InstanceStatus, to: InstanceStatus) -> bool {
    use InstanceStatus::*;
    matches!(
        (from, to),
        (Pending, Scheduled)
            | (Scheduled, Scheduled)
            | (Scheduled, Pending)
            | (Scheduled, InProgress)
            | (InProgress, Completed)
            | (Pending, Cancelled)
            | (Scheduled, Cancelled)
            | (InProgress, Cancelled)
    )
}

struct RawInstance {
    instance_id: String,
    pattern_id: String,
    due_date: String,
    priority: i32,
    status: String,
}

impl RawInstance {
    fn into_domain(self) -> RepositoryResult<JobInstance> {
        Ok(JobInstance {
            due_date: parse_datetime("due_date", &self.due_date)?,
            status: parse_enum("status", &self.status)?,
            instance_id: self.instance_id,
            pattern_id: self.pattern_id,
            priority: self.priority,
        })
    }
}

fn raw_instance(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawInstance> {
    Ok(RawInstance {
        instance_id: row.get(0)?,
        pattern_id: row.get(1)?,
        due_date: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
    })
}

#[async_trait]
impl PatternSource for PatternRepository {
    async fn load_pattern(&self, pattern_id: &str) -> RepositoryResult<Pattern> {
        self.find_pattern(pattern_id)?
            .ok_or_else(|| RepositoryError::not_found("Pattern", pattern_id))
    }

    async fn load_machines(&self) -> RepositoryResult<Vec<Machine>> {
        self.list_machines()
    }

    async fn load_instances(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<JobInstance>> {
        self.list_schedulable_instances(pattern_id, limit)
    }

    async fn load_instances_by_ids(&self, instance_ids: &[String]) -> RepositoryResult<Vec<JobInstance>> {
        instance_ids
            .iter()
            .map(|id| {
                let instance = self
                    .find_instance(id)?
                    .ok_or_else(|| RepositoryError::not_found("JobInstance", id))?;
                if !instance.status.is_schedulable() {
                    return Err(RepositoryError::InvalidStateTransition {
                        from: instance.status.to_string(),
                        to: InstanceStatus::Scheduled.to_string(),
                    });
                }
                Ok(instance)
            })
            .collect()
    }

    async fn load_sequence_resources(&self, active_only: bool) -> RepositoryResult<Vec<SequenceResource>> {
        self.list_sequence_resources(active_only)
    }
}

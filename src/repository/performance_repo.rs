// ==========================================
// 模式化排产系统 - 性能历史仓储
// ==========================================
// 职责: pattern_performance_history 只追加写入 + 模式基线读写
// ==========================================

use crate::db::{init_schema, open_sqlite_connection};
use crate::domain::performance::PerformanceRecord;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::sql_types::{format_datetime, parse_datetime};
use crate::repository::traits::PerformanceStore;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};

pub struct PerformanceRepository {
    conn: Arc<Mutex<Connection>>,
}

impl PerformanceRepository {
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

    pub fn find_baseline(&self, pattern_id: &str) -> RepositoryResult<Option<f64>> {
        let conn = self.get_conn()?;
        let baseline = conn
            .query_row(
                "SELECT baseline_performance_seconds FROM pattern WHERE pattern_id = ?1",
                params![pattern_id],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::not_found("Pattern", pattern_id))?;
        Ok(baseline)
    }

    pub fn update_baseline(&self, pattern_id: &str, seconds: f64) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            r#"
            UPDATE pattern SET baseline_performance_seconds = ?1, updated_at = datetime('now')
            WHERE pattern_id = ?2
            "#,
            params![seconds, pattern_id],
        )?;
        if updated == 0 {
            return Err(RepositoryError::not_found("Pattern", pattern_id));
        }
        Ok(())
    }

    pub fn insert(&self, record: &PerformanceRecord) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            r#"
            INSERT INTO pattern_performance_history
                (record_id, pattern_id, solve_time_seconds, instance_count, speedup_factor,
                 baseline_seconds, degradation_percent, is_regression, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                record.record_id,
                record.pattern_id,
                record.solve_time_seconds,
                record.instance_count,
                record.speedup_factor,
                record.baseline_seconds,
                record.degradation_percent,
                record.is_regression,
                format_datetime(&record.recorded_at)
            ],
        )?;
        Ok(())
    }

    pub fn list_recent(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<PerformanceRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT record_id, pattern_id, solve_time_seconds, instance_count, speedup_factor,
                   baseline_seconds, degradation_percent, is_regression, recorded_at
            FROM pattern_performance_history
            WHERE pattern_id = ?1
            ORDER BY recorded_at DESC, rowid DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt
            .query_map(params![pattern_id, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, bool>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(record_id, pattern_id, solve, count, speedup, baseline, degradation, regression, at)| {
                    Ok(PerformanceRecord {
                        record_id,
                        pattern_id,
                        solve_time_seconds: solve,
                        instance_count: count,
                        speedup_factor: speedup,
                        baseline_seconds: baseline,
                        degradation_percent: degradation,
                        is_regression: regression,
                        recorded_at: parse_datetime("recorded_at", &at)?,
                    })
                },
            )
            .collect()
    }
}

#[async_trait]
impl PerformanceStore for PerformanceRepository {
    async fn baseline(&self, pattern_id: &str) -> RepositoryResult<Option<f64>> {
        self.find_baseline(pattern_id)
    }

    async fn set_baseline(&self, pattern_id: &str, seconds: f64) -> RepositoryResult<()> {
        self.update_baseline(pattern_id, seconds)
    }

    async fn append(&self, record: &PerformanceRecord) -> RepositoryResult<()> {
        self.insert(record)
    }

    async fn history(&self, pattern_id: &str, limit: usize) -> RepositoryResult<Vec<PerformanceRecord>> {
        self.list_recent(pattern_id, limit)
    }
}

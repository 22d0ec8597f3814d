// ==========================================
// 模式化排产系统 - 性能埋点
// ==========================================
// 职责: SQL 计数/慢 SQL 告警 + 操作耗时 Guard
// 日志 target: perf / slow_sql
// 环境变量:
// - PATTERN_APS_PERF_SQL=1      强制开启 SQL trace
// - PATTERN_APS_SLOW_SQL_MS=50  慢 SQL 阈值（毫秒）
// ==========================================

use rusqlite::Connection;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const PERF_SQL_ENV: &str = "PATTERN_APS_PERF_SQL";
pub const SLOW_SQL_MS_ENV: &str = "PATTERN_APS_SLOW_SQL_MS";

static PERF_SQL_ENABLED: AtomicBool = AtomicBool::new(false);
static SLOW_SQL_THRESHOLD_MS: AtomicU64 = AtomicU64::new(0);

thread_local! {
    static PERF_DEPTH: Cell<u32> = Cell::new(0);
    static SQL_COUNT: Cell<u64> = Cell::new(0);
    static SLOW_SQL_COUNT: Cell<u64> = Cell::new(0);
}

// ==========================================
// PerfSqlConfig - SQL 埋点开关
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfSqlConfig {
    pub enabled: bool,
    pub slow_sql_ms: u64,
}

impl PerfSqlConfig {
    /// 从环境变量读取（Debug 默认开启，Release 默认关闭）
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(PERF_SQL_ENV).ok().as_deref(),
            std::env::var(SLOW_SQL_MS_ENV).ok().as_deref(),
        )
    }

    fn from_values(enabled: Option<&str>, slow_ms: Option<&str>) -> Self {
        let enabled = match enabled {
            Some(v) => is_true(v),
            None => cfg!(debug_assertions),
        };
        let slow_sql_ms = slow_ms
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(if cfg!(debug_assertions) { 50 } else { 200 });
        Self { enabled, slow_sql_ms }
    }
}

fn is_true(v: &str) -> bool {
    matches!(
        v.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn truncate_sql(sql: &str, max_len: usize) -> String {
    let s = sql.trim().replace('\n', " ");
    if s.chars().count() <= max_len {
        return s;
    }
    let head: String = s.chars().take(max_len).collect();
    format!("{}…", head)
}

/// 安装 SQLite 语句 trace/profile（用于 SQL 计数 + 慢查询日志）
pub fn install_sqlite_tracing(conn: &mut Connection) {
    let config = PerfSqlConfig::from_env();
    PERF_SQL_ENABLED.store(config.enabled, Ordering::Relaxed);

    if !config.enabled {
        // 复用连接时清理残留 callback
        conn.trace(None);
        conn.profile(None);
        return;
    }

    SLOW_SQL_THRESHOLD_MS.store(config.slow_sql_ms, Ordering::Relaxed);
    conn.trace(Some(sql_trace_callback));
    conn.profile(Some(sql_profile_callback));
}

fn guard_active() -> bool {
    PERF_DEPTH.with(|d| d.get() > 0)
}

fn sql_trace_callback(_sql: &str) {
    if !PERF_SQL_ENABLED.load(Ordering::Relaxed) || !guard_active() {
        return;
    }
    SQL_COUNT.with(|c| c.set(c.get().saturating_add(1)));
}

fn sql_profile_callback(sql: &str, duration: Duration) {
    if !PERF_SQL_ENABLED.load(Ordering::Relaxed) {
        return;
    }

    let ms = duration.as_millis() as u64;
    let threshold = SLOW_SQL_THRESHOLD_MS.load(Ordering::Relaxed);
    if threshold == 0 || ms < threshold {
        return;
    }

    tracing::warn!(
        target: "slow_sql",
        duration_ms = ms,
        sql = %truncate_sql(sql, 420),
        "慢 SQL"
    );
    if guard_active() {
        SLOW_SQL_COUNT.with(|c| c.set(c.get().saturating_add(1)));
    }
}

/// 性能统计 Guard：drop 时记录 elapsed_ms + SQL 语句数 + 慢 SQL 数
///
/// ```ignore
/// let _perf = pattern_aps::perf::PerfGuard::new("load_pattern");
/// ```
pub struct PerfGuard {
    op: &'static str,
    start: Instant,
    sql_start: u64,
    slow_sql_start: u64,
}

impl PerfGuard {
    pub fn new(op: &'static str) -> Self {
        PERF_DEPTH.with(|d| d.set(d.get().saturating_add(1)));
        Self {
            op,
            start: Instant::now(),
            sql_start: SQL_COUNT.with(|c| c.get()),
            slow_sql_start: SLOW_SQL_COUNT.with(|c| c.get()),
        }
    }

    /// 当前已耗时（秒）
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Drop for PerfGuard {
    fn drop(&mut self) {
        let sql_count = SQL_COUNT.with(|c| c.get()).saturating_sub(self.sql_start);
        let slow_sql_count = SLOW_SQL_COUNT
            .with(|c| c.get())
            .saturating_sub(self.slow_sql_start);

        tracing::info!(
            target: "perf",
            op = self.op,
            elapsed_ms = self.start.elapsed().as_millis() as u64,
            sql_count,
            slow_sql_count,
            "done"
        );

        PERF_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
    }
}

// ==========================================
// 模式化排产系统 - 命令行入口
// ==========================================
// 子命令: init-db / seed-demo / compile / solve / history
// 数据库路径: --db > PATTERN_APS_DB_PATH > 用户数据目录
// ==========================================

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use clap::{Parser, Subcommand};
use pattern_aps::config::ConfigManager;
use pattern_aps::db::{get_default_db_path, init_schema, open_sqlite_connection, DB_PATH_ENV};
use pattern_aps::demo::seed_demo_scenario;
use pattern_aps::engine::{
    CancellationFlag, EngineError, ScheduleOrchestrator, ScheduleRepositories, SolveRequest,
};
use pattern_aps::repository::PatternRepository;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Parser)]
#[command(name = "pattern-aps")]
#[command(about = "Pattern-compiled hierarchical scheduling engine", long_about = None)]
#[command(version)]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, env = DB_PATH_ENV)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Seed the demo pattern, machines and instances
    SeedDemo {
        /// Time origin (YYYY-MM-DD HH:MM), defaults to now
        #[arg(long, value_parser = parse_origin)]
        origin: Option<NaiveDateTime>,
    },
    /// Compile a pattern and print its summary
    Compile {
        /// Pattern ID
        pattern_id: String,
    },
    /// Solve all schedulable instances of a pattern
    Solve {
        /// Pattern ID
        pattern_id: String,
        /// Time origin (YYYY-MM-DD HH:MM), defaults to now
        #[arg(long, value_parser = parse_origin)]
        origin: Option<NaiveDateTime>,
        /// Restrict to these instance IDs (comma separated)
        #[arg(long, value_delimiter = ',')]
        instances: Vec<String>,
        /// Overall time budget in seconds
        #[arg(long)]
        budget: Option<f64>,
        /// Solver parameter overrides as a JSON object
        #[arg(long)]
        params: Option<String>,
        /// Also solve the flat model to measure the speedup factor
        #[arg(long)]
        compare_legacy: bool,
    },
    /// Show recent performance records of a pattern
    History {
        /// Pattern ID
        pattern_id: String,
        /// Number of records
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

fn parse_origin(raw: &str) -> Result<NaiveDateTime, String> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .map_err(|e| format!("无法解析时间原点 '{}': {}", raw, e))
}

fn default_origin() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

fn open_database(db_path: &str) -> Result<Arc<Mutex<Connection>>> {
    let mut conn = open_sqlite_connection(db_path)
        .with_context(|| format!("无法打开数据库: {}", db_path))?;
    pattern_aps::perf::install_sqlite_tracing(&mut conn);
    init_schema(&conn).context("建表失败")?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn build_orchestrator(conn: Arc<Mutex<Connection>>) -> Result<ScheduleOrchestrator> {
    let settings = ConfigManager::from_connection(conn.clone())
        .and_then(|config| config.load_solver_settings())
        .map_err(|e| EngineError::Config(e.to_string()))?;
    let repos = ScheduleRepositories::from_connection(conn);
    Ok(ScheduleOrchestrator::new(repos, settings))
}

#[tokio::main]
async fn main() -> Result<()> {
    pattern_aps::logging::init();

    let cli = Cli::parse();
    let db_path = cli.db.unwrap_or_else(get_default_db_path);
    info!(db_path = %db_path, version = pattern_aps::VERSION, "{}", pattern_aps::APP_NAME);

    let conn = open_database(&db_path)?;

    match cli.command {
        Commands::InitDb => {
            println!("数据库已就绪: {}", db_path);
        }
        Commands::SeedDemo { origin } => {
            let origin = origin.unwrap_or_else(default_origin);
            seed_demo_scenario(&PatternRepository::from_connection(conn), origin)?;
            println!("演示场景已写入 (origin = {})", origin);
        }
        Commands::Compile { pattern_id } => {
            let orchestrator = build_orchestrator(conn)?;
            let compiled = orchestrator.compile_pattern(&pattern_id).await?;
            let topo: Vec<&str> = compiled
                .topo_order
                .iter()
                .map(|&i| compiled.tasks[i].task_id.as_str())
                .collect();
            let summary = serde_json::json!({
                "pattern_id": compiled.pattern_id,
                "pattern_version": compiled.pattern_version,
                "version_hash": format!("{:016x}", compiled.version_hash),
                "task_count": compiled.task_count(),
                "edge_count": compiled.edges.len(),
                "topological_order": topo,
                "critical_path_minutes": compiled.critical_path_minutes(),
                "parameters": compiled.default_parameters.to_engine_json(),
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Solve {
            pattern_id,
            origin,
            instances,
            budget,
            params,
            compare_legacy,
        } => {
            let orchestrator = build_orchestrator(conn)?;

            let mut request = SolveRequest::new(&pattern_id, origin.unwrap_or_else(default_origin))
                .with_compare_legacy(compare_legacy);
            if !instances.is_empty() {
                request = request.with_instances(instances);
            }
            if let Some(seconds) = budget {
                request = request.with_time_budget(seconds);
            }
            if let Some(raw) = params {
                let overrides: serde_json::Value =
                    serde_json::from_str(&raw).context("--params 不是合法 JSON")?;
                request = request.with_overrides(overrides);
            }

            let cancel = CancellationFlag::new();
            let ctrl_c_flag = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    ctrl_c_flag.cancel();
                }
            });

            let report = orchestrator.solve(&request, &cancel).await?;
            let schedule = &report.schedule;

            println!("schedule_id: {}", schedule.schedule_id);
            println!("status:      {}", schedule.status);
            println!(
                "objectives:  lateness={} makespan={} cost={}",
                schedule.objectives.total_lateness_minutes,
                schedule.objectives.makespan_minutes,
                schedule.objectives.total_cost_cents
            );
            println!("solve_time:  {:.3}s", schedule.solve_time_seconds);
            if let Some(speedup) = report.speedup_factor {
                println!("speedup:     {:.2}x", speedup);
            }
            if report.is_regression() {
                println!("WARNING: 求解耗时超过基线阈值");
            }
            for a in schedule.sorted_assignments() {
                println!(
                    "  {:<12} {:<12} {:<8} [{:>5}, {:>5})",
                    a.instance_id, a.task_id, a.machine_id, a.start_minute, a.end_minute
                );
            }
        }
        Commands::History { pattern_id, limit } => {
            let orchestrator = build_orchestrator(conn)?;
            let history = orchestrator.performance_history(&pattern_id, limit).await?;
            println!("Records ({})", history.len());
            for r in history {
                println!(
                    "  {} | {:.3}s | baseline {:.3}s | {:+.1}% | {}",
                    r.recorded_at,
                    r.solve_time_seconds,
                    r.baseline_seconds,
                    r.degradation_percent,
                    if r.is_regression { "REGRESSION" } else { "ok" }
                );
            }
        }
    }

    Ok(())
}

// ==========================================
// 日志系统初始化
// ==========================================
// 使用 tracing 和 tracing-subscriber
// 支持环境变量配置日志级别与输出格式
// ==========================================

use tracing_subscriber::{fmt, EnvFilter};

/// 日志输出格式环境变量（text / json）
pub const LOG_FORMAT_ENV: &str = "PATTERN_APS_LOG_FORMAT";

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// 初始化日志系统
///
/// # 环境变量
/// - RUST_LOG: 日志级别过滤器（默认: info）
///   例如: RUST_LOG=debug 或 RUST_LOG=pattern_aps::engine=trace
/// - PATTERN_APS_LOG_FORMAT=json: 输出结构化 JSON 行（便于采集求解阶段字段）
///
/// # 示例
/// ```no_run
/// use pattern_aps::logging;
/// logging::init();
/// ```
pub fn init() {
    let json = std::env::var(LOG_FORMAT_ENV)
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // 重复初始化时忽略（CLI 子命令可能多次调用）
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(default_filter())
            .with_target(true)
            .with_current_span(true)
            .try_init()
    } else {
        fmt()
            .with_env_filter(default_filter())
            .with_target(true)
            .with_thread_ids(false)
            .with_line_number(true)
            .try_init()
    };
}

/// 初始化测试环境的日志系统
///
/// 使用更详细的日志级别，便于调试
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

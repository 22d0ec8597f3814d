// ==========================================
// 模式化排产系统 - 演示场景种子数据
// ==========================================
// 场景: 3 个实例 × 2 个任务, 2 台设备 ($120/h, $60/h)
// prep (M1, 1 分钟) → test (M1 或 M2, 2 分钟, 工装费 $7)
// 交期: A +4, B +5, C +5 (相对时间原点, 分钟)
// 期望三级目标: 拖期 0 / 完工 5 / 成本 3500 分
// ==========================================

use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern, PatternTask, Precedence, TaskMode};
use crate::repository::{PatternRepository, RepositoryResult};
use chrono::{Duration, NaiveDateTime};
use tracing::info;

pub const DEMO_PATTERN_ID: &str = "P-QA";

pub fn demo_machines() -> Vec<Machine> {
    vec![
        Machine::new("M1", "Fast bench", 12_000),
        Machine::new("M2", "Slow bench", 6_000),
    ]
}

pub fn demo_pattern() -> Pattern {
    Pattern::new(DEMO_PATTERN_ID, "QA flow")
        .with_task(
            PatternTask::new("prep", 1)
                .with_department("QA")
                .with_mode(TaskMode::new("prep-m1", "M1", 1)),
        )
        .with_task(
            PatternTask::new("test", 2)
                .with_department("QA")
                .with_mode(TaskMode::new("test-m1", "M1", 2).with_setup_cost(700))
                .with_mode(TaskMode::new("test-m2", "M2", 2).with_setup_cost(700)),
        )
        .with_precedence(Precedence::new("prep", "test"))
}

pub fn demo_instances(origin: NaiveDateTime) -> Vec<JobInstance> {
    [("A", 4), ("B", 5), ("C", 5)]
        .into_iter()
        .map(|(id, due)| JobInstance::new(id, DEMO_PATTERN_ID, origin + Duration::minutes(due)))
        .collect()
}

/// 写入演示场景 (设备 + 模式 + 实例)
///
/// 实例已存在时返回 UniqueConstraintViolation
pub fn seed_demo_scenario(repo: &PatternRepository, origin: NaiveDateTime) -> RepositoryResult<()> {
    for machine in demo_machines() {
        repo.upsert_machine(&machine)?;
    }
    repo.save_pattern(&demo_pattern())?;
    for instance in demo_instances(origin) {
        repo.insert_instance(&instance)?;
    }
    info!(pattern_id = DEMO_PATTERN_ID, %origin, "演示场景已写入");
    Ok(())
}

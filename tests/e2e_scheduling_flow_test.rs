// ==========================================
// 完整排产流程端到端测试
// ==========================================
// 职责: 验证 加载 → 编译 → 展开 → 预留 → 求解 → 存储 → 性能跟踪 全链路
// ==========================================

mod test_helpers;

use chrono::Duration;
use pattern_aps::config::config_keys;
use pattern_aps::config::ConfigManager;
use pattern_aps::demo::DEMO_PATTERN_ID;
use pattern_aps::domain::{
    InstanceStatus, JobInstance, Machine, Pattern, PatternTask, Precedence, SequenceResource,
    SolveStatus, TaskMode,
};
use pattern_aps::engine::{
    CancellationFlag, CompileError, EngineError, ExpansionError, ReservationError, SolveError,
    SolveRequest,
};
use pattern_aps::repository::RepositoryError;
use std::sync::Arc;
use test_helpers::*;

// ==========================================
// 测试辅助函数
// ==========================================

/// 第二个模式: cut (M1, 2 分钟) → polish (M2, 1 分钟)
fn seed_cut_pattern(conn: &Arc<std::sync::Mutex<rusqlite::Connection>>) {
    let repo = pattern_repo(conn);
    repo.upsert_machine(&Machine::new("M1", "Fast bench", 12_000)).unwrap();
    repo.upsert_machine(&Machine::new("M2", "Slow bench", 6_000)).unwrap();
    repo.save_pattern(
        &Pattern::new("P-CUT", "Cut and polish")
            .with_task(PatternTask::new("cut", 1).with_mode(TaskMode::new("cut-m1", "M1", 2)))
            .with_task(PatternTask::new("polish", 2).with_mode(TaskMode::new("polish-m2", "M2", 1)))
            .with_precedence(Precedence::new("cut", "polish")),
    )
    .unwrap();
    for (id, due) in [("J1", 10), ("J2", 10)] {
        repo.insert_instance(&JobInstance::new(id, "P-CUT", origin() + Duration::minutes(due)))
            .unwrap();
    }
}

// ==========================================
// 主流程
// ==========================================

#[tokio::test]
async fn test_scenario_solve_store_and_track() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let orchestrator = orchestrator(&conn);
    let request = SolveRequest::new(DEMO_PATTERN_ID, origin());
    let report = orchestrator
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap();

    let schedule = &report.schedule;
    assert_eq!(schedule.status, SolveStatus::Optimal);
    assert_eq!(schedule.objectives.as_triple(), (0, 5, 3500));
    assert_eq!(schedule.assignments.len(), 6);
    assert_eq!(schedule.phase_results.len(), 3);

    // 目标值与分配一致
    assert_eq!(schedule.max_completion(), schedule.objectives.makespan_minutes);
    let lateness: i64 = [("A", 4), ("B", 5), ("C", 5)]
        .iter()
        .map(|(id, due)| (schedule.completion_of(id).unwrap() - due).max(0))
        .sum();
    assert_eq!(lateness, schedule.objectives.total_lateness_minutes);

    // 存储 → 重新加载
    let reloaded = orchestrator.load_schedule(&schedule.schedule_id).await.unwrap();
    assert_eq!(reloaded.sorted_assignments(), schedule.sorted_assignments());
    assert_eq!(reloaded.objectives, schedule.objectives);
    assert_eq!(reloaded.status, schedule.status);

    for id in ["A", "B", "C"] {
        let instance = pattern_repo(&conn).find_instance(id).unwrap().unwrap();
        assert_eq!(instance.status, InstanceStatus::Scheduled);
    }

    // 首次求解成为基线
    let record = report.performance.as_ref().unwrap();
    assert_eq!(record.pattern_id, DEMO_PATTERN_ID);
    assert_eq!(record.instance_count, 3);
    assert_eq!(record.degradation_percent, 0.0);
    assert!(!report.is_regression());
    assert_eq!(report.speedup_factor, None);
    assert_eq!(
        performance_repo(&conn).find_baseline(DEMO_PATTERN_ID).unwrap(),
        Some(record.solve_time_seconds)
    );
}

#[tokio::test]
async fn test_repeated_solves_are_idempotent() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let orchestrator = orchestrator(&conn);
    let request = SolveRequest::new(DEMO_PATTERN_ID, origin());
    let cancel = CancellationFlag::new();

    let first = orchestrator.solve(&request, &cancel).await.unwrap();
    let second = orchestrator.solve(&request, &cancel).await.unwrap();

    assert_eq!(first.schedule.objectives, second.schedule.objectives);
    assert_ne!(first.schedule.schedule_id, second.schedule.schedule_id);
    assert_eq!(orchestrator.cache().len(), 1);

    let history = orchestrator
        .performance_history(DEMO_PATTERN_ID, 10)
        .await
        .unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(schedule_repo(&conn).list_by_pattern(DEMO_PATTERN_ID, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_instance_subset_and_overrides() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let request = SolveRequest::new(DEMO_PATTERN_ID, origin())
        .with_instances(vec!["A".to_string()])
        .with_overrides(serde_json::json!({"search_strategy": "depth_first", "custom_flag": 3}))
        .with_time_budget(5.0);
    let report = orchestrator(&conn)
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap();

    // 单实例: prep M1 [0,1) + test M2 [1,3) → 成本 200 + 900
    assert_eq!(report.schedule.instance_ids, vec!["A".to_string()]);
    assert_eq!(report.schedule.objectives.as_triple(), (0, 3, 1100));

    let untouched = pattern_repo(&conn).find_instance("B").unwrap().unwrap();
    assert_eq!(untouched.status, InstanceStatus::Pending);
}

#[tokio::test]
async fn test_settings_loaded_from_config_kv() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let config = ConfigManager::from_connection(conn.clone()).unwrap();
    config.set_global_config_value(config_keys::INSTANCE_LIMIT, "2").unwrap();
    config.set_global_config_value(config_keys::TIME_BUDGET_SECONDS, "5").unwrap();

    let orchestrator = orchestrator_from_config(&conn);
    assert_eq!(orchestrator.settings().instance_limit, 2);

    // 交期最早的两个实例: A (+4), B (+5)
    let report = orchestrator
        .solve(&SolveRequest::new(DEMO_PATTERN_ID, origin()), &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(report.schedule.instance_ids, vec!["A".to_string(), "B".to_string()]);
}

#[tokio::test]
async fn test_compare_legacy_reports_speedup() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let request = SolveRequest::new(DEMO_PATTERN_ID, origin()).with_compare_legacy(true);
    let report = orchestrator(&conn)
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap();

    let speedup = report.speedup_factor.unwrap();
    assert!(speedup > 0.0);
    assert_eq!(report.performance.unwrap().speedup_factor, Some(speedup));
    assert_eq!(report.schedule.objectives.as_triple(), (0, 5, 3500));
}

#[tokio::test]
async fn test_concurrent_batches() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);
    seed_cut_pattern(&conn);

    let orchestrator = orchestrator(&conn);
    let requests = vec![
        SolveRequest::new(DEMO_PATTERN_ID, origin()),
        SolveRequest::new("P-CUT", origin()),
        SolveRequest::new("P-MISSING", origin()),
    ];
    let results = orchestrator
        .solve_batches(&requests, &CancellationFlag::new())
        .await;

    assert_eq!(results.len(), 3);
    assert_eq!(
        results[0].as_ref().unwrap().schedule.objectives.as_triple(),
        (0, 5, 3500)
    );
    // cut J1 [0,2) J2 [2,4); polish J1 [2,3) J2 [4,5)
    // 成本: 2×(400) + 2×(100)
    assert_eq!(
        results[1].as_ref().unwrap().schedule.objectives.as_triple(),
        (0, 5, 1000)
    );
    assert!(matches!(
        results[2],
        Err(EngineError::Repository(RepositoryError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_compile_pattern_uses_cache() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let orchestrator = orchestrator(&conn);
    let a = orchestrator.compile_pattern(DEMO_PATTERN_ID).await.unwrap();
    let b = orchestrator.compile_pattern(DEMO_PATTERN_ID).await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.task_count(), 2);
}

// ==========================================
// 校验失败: 求解前抛出, 不写入任何结果
// ==========================================

#[tokio::test]
async fn test_cyclic_pattern_rejected_before_solving() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let repo = pattern_repo(&conn);
    let mut pattern = repo.find_pattern(DEMO_PATTERN_ID).unwrap().unwrap();
    pattern.precedences.push(Precedence::new("test", "prep"));
    repo.save_pattern(&pattern).unwrap();

    let err = orchestrator(&conn)
        .solve(&SolveRequest::new(DEMO_PATTERN_ID, origin()), &CancellationFlag::new())
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert!(matches!(err, EngineError::Compile(CompileError::CycleDetected { .. })));
    assert!(schedule_repo(&conn).list_by_pattern(DEMO_PATTERN_ID, 10).unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_exclusive_resource_rejected() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let mut bay = SequenceResource::exclusive("Bay");
    bay.capacity = 2;
    bay.max_concurrent_jobs = 2;
    pattern_repo(&conn).upsert_sequence_resource(&bay).unwrap();

    let err = orchestrator(&conn)
        .solve(&SolveRequest::new(DEMO_PATTERN_ID, origin()), &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Reservation(ReservationError::InvalidResource { .. })
    ));
}

#[tokio::test]
async fn test_no_schedulable_instances() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let request = SolveRequest::new(DEMO_PATTERN_ID, origin()).with_instances(Vec::new());
    let err = orchestrator(&conn)
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Expansion(ExpansionError::NoInstancesProvided { .. })
    ));
}

#[tokio::test]
async fn test_requested_instances_are_validated() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);
    seed_cut_pattern(&conn);
    let orchestrator = orchestrator(&conn);

    // 不存在的实例不会被静默丢弃
    let request = SolveRequest::new(DEMO_PATTERN_ID, origin())
        .with_instances(vec!["A".to_string(), "X".to_string()]);
    let err = orchestrator
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Repository(RepositoryError::NotFound { ref id, .. }) if id == "X"
    ));

    // 属于其他模式的实例
    let request = SolveRequest::new(DEMO_PATTERN_ID, origin())
        .with_instances(vec!["A".to_string(), "J1".to_string()]);
    let err = orchestrator
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Expansion(ExpansionError::UnknownPattern { ref instance_id, ref found, .. })
            if instance_id == "J1" && found == "P-CUT"
    ));

    assert!(schedule_repo(&conn).list_by_pattern(DEMO_PATTERN_ID, 10).unwrap().is_empty());
    let a = pattern_repo(&conn).find_instance("A").unwrap().unwrap();
    assert_eq!(a.status, InstanceStatus::Pending);
}

#[tokio::test]
async fn test_requested_instances_not_cut_by_instance_limit() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let config = ConfigManager::from_connection(conn.clone()).unwrap();
    config.set_global_config_value(config_keys::INSTANCE_LIMIT, "1").unwrap();
    let orchestrator = orchestrator_from_config(&conn);

    // 默认选取受上限约束, 显式列出的 C 不受影响
    let request = SolveRequest::new(DEMO_PATTERN_ID, origin())
        .with_instances(vec!["A".to_string(), "C".to_string()]);
    let report = orchestrator
        .solve(&request, &CancellationFlag::new())
        .await
        .unwrap();
    assert_eq!(report.schedule.instance_ids, vec!["A".to_string(), "C".to_string()]);
}

#[tokio::test]
async fn test_cancelled_request_stores_nothing() {
    let (_tmp, db_path) = create_test_db().unwrap();
    let conn = open_shared(&db_path);
    seed_scenario(&conn);

    let cancel = CancellationFlag::new();
    cancel.cancel();
    let err = orchestrator(&conn)
        .solve(&SolveRequest::new(DEMO_PATTERN_ID, origin()), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Solve(SolveError::Cancelled { .. })));
    assert!(schedule_repo(&conn).list_by_pattern(DEMO_PATTERN_ID, 10).unwrap().is_empty());
    let a = pattern_repo(&conn).find_instance("A").unwrap().unwrap();
    assert_eq!(a.status, InstanceStatus::Pending);
}

// ==========================================
// 求解层测试
// ==========================================
// 基准场景: 3 个实例 × 2 个任务, 2 台设备 ($120/h, $60/h)
// prep (M1, 1 分钟) → test (M1 或 M2, 2 分钟, 工装费 $7)
// 交期: A +4, B +5, C +5
// ==========================================

use super::*;
use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern, PatternTask, Precedence, SetupTimeEntry, TaskMode};
use crate::domain::resource::SequenceResource;
use crate::domain::schedule::ObjectiveLock;
use crate::domain::types::SolvePhase;
use crate::engine::compiler::PatternCompiler;
use crate::engine::error::SolveError;
use crate::engine::expander::{CompiledProblem, InstanceExpander, LegacyExpander};
use crate::engine::reservation::{ReservationConstraintSet, SequenceReservationManager};
use crate::engine::solver::model::{check_feasible, evaluate};
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use std::time::Duration;

fn origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
}

fn machines() -> Vec<Machine> {
    vec![
        Machine::new("M1", "Fast bench", 12_000),
        Machine::new("M2", "Slow bench", 6_000),
    ]
}

fn scenario_pattern() -> Pattern {
    Pattern::new("P-QA", "QA flow")
        .with_task(PatternTask::new("prep", 1).with_mode(TaskMode::new("prep-m1", "M1", 1)))
        .with_task(
            PatternTask::new("test", 2)
                .with_mode(TaskMode::new("test-m1", "M1", 2).with_setup_cost(700))
                .with_mode(TaskMode::new("test-m2", "M2", 2).with_setup_cost(700)),
        )
        .with_precedence(Precedence::new("prep", "test"))
}

fn instances() -> Vec<JobInstance> {
    vec![
        JobInstance::new("A", "P-QA", origin() + ChronoDuration::minutes(4)),
        JobInstance::new("B", "P-QA", origin() + ChronoDuration::minutes(5)),
        JobInstance::new("C", "P-QA", origin() + ChronoDuration::minutes(5)),
    ]
}

fn expand(pattern: &Pattern, jobs: &[JobInstance]) -> Arc<CompiledProblem> {
    let compiled = Arc::new(PatternCompiler::new().compile(pattern, &machines()).unwrap());
    Arc::new(InstanceExpander::new().expand(compiled, jobs, origin()).unwrap())
}

fn problem_for(pattern: &Pattern) -> Arc<CompiledProblem> {
    expand(pattern, &instances())
}

fn reservations_for(problem: &CompiledProblem, resources: &[SequenceResource]) -> Arc<ReservationConstraintSet> {
    Arc::new(
        SequenceReservationManager::new()
            .build(problem, resources)
            .unwrap(),
    )
}

fn solver() -> HierarchicalSolver {
    HierarchicalSolver::new(Arc::new(BranchAndBoundEngine::new()))
}

async fn solve(
    problem: Arc<CompiledProblem>,
    reservations: Arc<ReservationConstraintSet>,
) -> Result<crate::domain::schedule::SolvedSchedule, SolveError> {
    solver()
        .solve(
            problem,
            reservations,
            Duration::from_secs(10),
            &SolverParameters::default(),
            &CancellationFlag::new(),
        )
        .await
}

// ==========================================
// 单元: 取消标志 / 可行性校验
// ==========================================

#[test]
fn test_cancellation_flag_child_inherits_parent() {
    let parent = CancellationFlag::new();
    let child = parent.child();

    child.cancel();
    assert!(child.is_cancelled());
    assert!(!parent.is_cancelled());

    let other = parent.child();
    parent.cancel();
    assert!(other.is_cancelled());
}

#[test]
fn test_check_feasible_detects_machine_overlap() {
    let problem = problem_for(&scenario_pattern());
    let reservations = ReservationConstraintSet::default();
    let slot = |mode_idx, start, end| SlotAssignment { mode_idx, start, end };

    // slot = 实例 × 2 + 任务; 三个 prep 都放在 M1 的 [0, 1)
    let overlapping = Assignment {
        slots: vec![
            slot(0, 0, 1),
            slot(1, 1, 3),
            slot(0, 0, 1),
            slot(1, 3, 5),
            slot(0, 0, 1),
            slot(0, 3, 5),
        ],
    };
    assert!(check_feasible(&problem, &reservations, &overlapping).is_err());

    let valid = Assignment {
        slots: vec![
            slot(0, 0, 1),
            slot(1, 1, 3),
            slot(0, 1, 2),
            slot(1, 3, 5),
            slot(0, 2, 3),
            slot(0, 3, 5),
        ],
    };
    assert!(check_feasible(&problem, &reservations, &valid).is_ok());

    let values = evaluate(&problem, &valid);
    assert_eq!(values.as_triple(), (0, 5, 3500));
}

#[test]
fn test_check_feasible_detects_precedence_violation() {
    let problem = problem_for(&scenario_pattern());
    let reservations = ReservationConstraintSet::default();
    let slot = |mode_idx, start, end| SlotAssignment { mode_idx, start, end };

    let early_test = Assignment {
        slots: vec![
            slot(0, 0, 1),
            slot(1, 0, 2), // test 在 prep 结束前开始
            slot(0, 1, 2),
            slot(1, 2, 4),
            slot(0, 2, 3),
            slot(0, 3, 5),
        ],
    };
    let err = check_feasible(&problem, &reservations, &early_test).unwrap_err();
    assert!(err.contains("前序"));
}

#[test]
fn test_model_description_shape() {
    let problem = problem_for(&scenario_pattern());
    let model = SolverModel::new(problem, Arc::new(ReservationConstraintSet::default()), SolvePhase::Makespan)
        .with_lock(SolvePhase::Lateness, ObjectiveLock::Exact(0));
    let description = ModelDescription::from_model(&model, &SolverParameters::default());

    assert_eq!(description.intervals.len(), 6);
    assert_eq!(description.intervals[1].modes.len(), 2);
    assert_eq!(description.intervals[1].modes[1].machine_id, "M2");
    assert_eq!(description.precedences.len(), 3);
    assert_eq!(description.due_dates[0].due_offset, 4);
    assert_eq!(description.locks.len(), 1);

    let json = serde_json::to_value(&description).unwrap();
    assert_eq!(json["objective"], "MAKESPAN");
    assert_eq!(json["parameters"]["worker_count"], 1);
    assert_eq!(json["locks"][0]["lock"]["kind"], "EXACT");
}

// ==========================================
// 引擎: 单目标
// ==========================================

#[tokio::test]
async fn test_engine_unconstrained_makespan() {
    let problem = problem_for(&scenario_pattern());
    let model = SolverModel::new(problem, Arc::new(ReservationConstraintSet::default()), SolvePhase::Makespan);

    let outcome = BranchAndBoundEngine::new()
        .solve(model, SolverParameters::default(), CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, SolveStatus::Optimal);
    assert_eq!(outcome.objective_value, Some(5));
    assert!(outcome.assignment.is_some());
}

#[tokio::test]
async fn test_engine_respects_precancelled_flag() {
    let problem = problem_for(&scenario_pattern());
    let model = SolverModel::new(problem, Arc::new(ReservationConstraintSet::default()), SolvePhase::Lateness);
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let outcome = BranchAndBoundEngine::new()
        .solve(model, SolverParameters::default(), cancel)
        .await
        .unwrap();

    assert_eq!(outcome.status, SolveStatus::Timeout);
    assert!(outcome.assignment.is_none());
}

#[tokio::test]
async fn test_search_strategies_agree_on_optimum() {
    for strategy in [
        crate::config::SearchStrategy::Automatic,
        crate::config::SearchStrategy::FixedOrder,
        crate::config::SearchStrategy::DepthFirst,
    ] {
        let problem = problem_for(&scenario_pattern());
        let model = SolverModel::new(problem, Arc::new(ReservationConstraintSet::default()), SolvePhase::Cost);
        let parameters = SolverParameters {
            search_strategy: strategy,
            ..SolverParameters::default()
        };

        let outcome = BranchAndBoundEngine::new()
            .solve(model, parameters, CancellationFlag::new())
            .await
            .unwrap();
        // 无锁时最便宜: 三个 test 全部放在 M2
        assert_eq!(outcome.objective_value, Some(600 + 3 * 900), "{:?}", strategy);
    }
}

// ==========================================
// 分层求解
// ==========================================

#[tokio::test]
async fn test_scenario_three_phases() {
    let problem = problem_for(&scenario_pattern());
    let schedule = solve(problem.clone(), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();

    assert_eq!(schedule.status, SolveStatus::Optimal);
    assert_eq!(schedule.objectives.as_triple(), (0, 5, 3500));
    assert_eq!(schedule.assignments.len(), 6);
    assert_eq!(schedule.phase_results.len(), 3);
    assert_eq!(schedule.phase_results[0].locked, Some(ObjectiveLock::Exact(0)));
    assert_eq!(schedule.phase_results[1].locked, Some(ObjectiveLock::Exact(5)));
    assert_eq!(schedule.phase_results[2].locked, Some(ObjectiveLock::Exact(3500)));

    // 汇总值与逐实例数据一致
    let lateness: i64 = problem
        .instances
        .iter()
        .map(|inst| (schedule.completion_of(&inst.instance_id).unwrap() - inst.due_offset_minutes).max(0))
        .sum();
    assert_eq!(lateness, schedule.objectives.total_lateness_minutes);
    assert_eq!(schedule.max_completion(), schedule.objectives.makespan_minutes);

    // 恰好一个 test 在 M1 上
    let on_m1 = schedule
        .assignments
        .iter()
        .filter(|a| a.task_id == "test" && a.machine_id == "M1")
        .count();
    assert_eq!(on_m1, 1);
}

#[tokio::test]
async fn test_repeated_solves_are_idempotent() {
    let first = solve(problem_for(&scenario_pattern()), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();
    let second = solve(problem_for(&scenario_pattern()), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();

    assert_eq!(first.objectives, second.objectives);
    assert_ne!(first.schedule_id, second.schedule_id);
}

#[tokio::test]
async fn test_changeover_time_and_cost() {
    // 单设备: cut (2 分钟) → polish (1 分钟); polish 之后换到另一实例的 cut 需 3 分钟
    let pattern = Pattern::new("P-CUT", "Cut and polish")
        .with_task(PatternTask::new("cut", 1).with_mode(TaskMode::new("cut-m1", "M1", 2)))
        .with_task(PatternTask::new("polish", 2).with_mode(TaskMode::new("polish-m1", "M1", 1)))
        .with_precedence(Precedence::new("cut", "polish"))
        .with_setup(SetupTimeEntry::new("polish", "cut", "M1", 3))
        .with_setup(SetupTimeEntry::new("cut", "polish", "M1", 1));
    let jobs = vec![
        JobInstance::new("J1", "P-CUT", origin() + ChronoDuration::minutes(3)),
        JobInstance::new("J2", "P-CUT", origin() + ChronoDuration::minutes(20)),
    ];
    let problem = expand(&pattern, &jobs);

    let schedule = solve(problem, Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();

    // J1 必须先完成; J2 的 cut 紧跟 J1 的 polish → 换型 3 分钟 ($120/h 计 600 分)
    assert_eq!(schedule.objectives.as_triple(), (0, 9, 1800));
    let j2_cut = schedule
        .assignments
        .iter()
        .find(|a| a.instance_id == "J2" && a.task_id == "cut")
        .unwrap();
    assert_eq!(j2_cut.start_minute, 6);
}

#[tokio::test]
async fn test_same_instance_adjacency_has_no_changeover() {
    // prep → test 同实例相邻不计换型, 最优解不变
    let pattern = scenario_pattern().with_setup(SetupTimeEntry::new("prep", "test", "M1", 1));
    let schedule = solve(problem_for(&pattern), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();

    assert_eq!(schedule.objectives.as_triple(), (0, 5, 3500));
}

#[tokio::test]
async fn test_exclusive_resource_serializes_tasks() {
    let pattern = Pattern {
        tasks: scenario_pattern()
            .tasks
            .into_iter()
            .map(|t| if t.task_id == "test" { t.with_sequence("Bay") } else { t })
            .collect(),
        ..scenario_pattern()
    };
    let problem = problem_for(&pattern);
    let reservations = reservations_for(&problem, &[SequenceResource::exclusive("Bay")]);

    let schedule = solve(problem, reservations).await.unwrap();

    assert_eq!(schedule.objectives.as_triple(), (2, 7, 3300));
    assert_eq!(schedule.reservations.len(), 3);

    let mut windows: Vec<_> = schedule
        .reservations
        .iter()
        .map(|r| (r.start_minute, r.end_minute))
        .collect();
    windows.sort();
    for pair in windows.windows(2) {
        assert!(pair[1].0 >= pair[0].1);
    }
}

#[tokio::test]
async fn test_window_too_tight_is_infeasible() {
    let pattern = Pattern {
        tasks: scenario_pattern()
            .tasks
            .into_iter()
            .map(|t| if t.task_id == "test" { t.with_sequence("Bay") } else { t })
            .collect(),
        ..scenario_pattern()
    };
    let problem = problem_for(&pattern);
    // 单个 test 放得下, 三个放不下
    let bay = SequenceResource::exclusive("Bay").with_window(0, Some(6));
    let reservations = reservations_for(&problem, &[bay]);

    let err = solve(problem, reservations).await.unwrap_err();
    assert!(matches!(
        err,
        SolveError::Infeasible { phase: SolvePhase::Lateness, ref instance_ids, .. } if instance_ids.len() == 3
    ));
}

#[tokio::test]
async fn test_cancelled_before_first_phase() {
    let cancel = CancellationFlag::new();
    cancel.cancel();

    let err = solver()
        .solve(
            problem_for(&scenario_pattern()),
            Arc::new(ReservationConstraintSet::default()),
            Duration::from_secs(10),
            &SolverParameters::default(),
            &cancel,
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SolveError::Cancelled { phase: SolvePhase::Lateness, .. }));
}

#[tokio::test]
async fn test_legacy_problem_same_objectives() {
    let pattern = scenario_pattern().with_setup(SetupTimeEntry::new("prep", "test", "M1", 1));
    let legacy = LegacyExpander::new()
        .expand(&pattern, &machines(), &instances(), origin())
        .unwrap();
    let legacy = solve(Arc::new(legacy), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();
    let compiled = solve(problem_for(&pattern), Arc::new(ReservationConstraintSet::default()))
        .await
        .unwrap();

    assert_eq!(legacy.objectives, compiled.objectives);
}

// ==========================================
// 阶段降级 / 超时
// ==========================================

/// 拖期阶段只报告可行 (不声明最优)
struct FeasibleOnlyLateness {
    inner: BranchAndBoundEngine,
}

#[async_trait]
impl ConstraintSolver for FeasibleOnlyLateness {
    fn name(&self) -> &str {
        "feasible_only_lateness"
    }

    async fn solve(
        &self,
        model: SolverModel,
        parameters: SolverParameters,
        cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome> {
        let phase = model.objective;
        let mut outcome = self.inner.solve(model, parameters, cancel).await?;
        if phase == SolvePhase::Lateness {
            outcome.status = SolveStatus::Feasible;
        }
        Ok(outcome)
    }
}

/// 永不返回的引擎
struct StallingEngine;

#[async_trait]
impl ConstraintSolver for StallingEngine {
    fn name(&self) -> &str {
        "stalling"
    }

    async fn solve(
        &self,
        _model: SolverModel,
        _parameters: SolverParameters,
        _cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(EngineOutcome::without_solution(SolveStatus::Timeout, 0))
    }
}

#[tokio::test]
async fn test_feasible_phase_downgrades_lock() {
    let solver = HierarchicalSolver::new(Arc::new(FeasibleOnlyLateness {
        inner: BranchAndBoundEngine::new(),
    }));
    let schedule = solver
        .solve(
            problem_for(&scenario_pattern()),
            Arc::new(ReservationConstraintSet::default()),
            Duration::from_secs(10),
            &SolverParameters::default(),
            &CancellationFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(schedule.phase_results[0].status, SolveStatus::Feasible);
    assert_eq!(schedule.phase_results[0].locked, Some(ObjectiveLock::AtMost(0)));
    assert_eq!(schedule.status, SolveStatus::Feasible);
    assert_eq!(schedule.objectives.as_triple(), (0, 5, 3500));
}

#[tokio::test]
async fn test_stalled_engine_yields_no_solution() {
    let solver = HierarchicalSolver::new(Arc::new(StallingEngine));
    let err = solver
        .solve(
            problem_for(&scenario_pattern()),
            Arc::new(ReservationConstraintSet::default()),
            Duration::from_millis(300),
            &SolverParameters::default(),
            &CancellationFlag::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SolveError::NoSolutionFound { ref instance_ids, .. } if instance_ids.len() == 3));
}

/// 完工阶段报告超时但带回当前最好解
struct MakespanTimesOut {
    inner: BranchAndBoundEngine,
}

#[async_trait]
impl ConstraintSolver for MakespanTimesOut {
    fn name(&self) -> &str {
        "makespan_times_out"
    }

    async fn solve(
        &self,
        model: SolverModel,
        parameters: SolverParameters,
        cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome> {
        let phase = model.objective;
        let mut outcome = self.inner.solve(model, parameters, cancel).await?;
        if phase == SolvePhase::Makespan {
            outcome.status = SolveStatus::Timeout;
        }
        Ok(outcome)
    }
}

/// 拖期阶段正常求解, 之后无视锁把全部任务串行排到 M1 上并声称最优
struct LockIgnoringEngine {
    inner: BranchAndBoundEngine,
}

impl LockIgnoringEngine {
    fn serial_on_m1(problem: &CompiledProblem) -> Assignment {
        let pattern = &problem.pattern;
        let mut order: Vec<usize> = (0..problem.slots.len()).collect();
        order.sort_by_key(|&s| {
            let task_idx = problem.slots[s].task_idx;
            let topo = pattern.topo_order.iter().position(|&t| t == task_idx);
            (topo, s)
        });

        let mut slots = vec![
            SlotAssignment {
                mode_idx: 0,
                start: 0,
                end: 0,
            };
            problem.slots.len()
        ];
        let mut cursor = 0;
        for s in order {
            let task = &pattern.tasks[problem.slots[s].task_idx];
            let mode_idx = task
                .modes
                .iter()
                .position(|m| pattern.machines[m.machine_idx].machine_id == "M1")
                .unwrap();
            let end = cursor + task.modes[mode_idx].duration_minutes;
            slots[s] = SlotAssignment {
                mode_idx,
                start: cursor,
                end,
            };
            cursor = end;
        }
        Assignment { slots }
    }
}

#[async_trait]
impl ConstraintSolver for LockIgnoringEngine {
    fn name(&self) -> &str {
        "lock_ignoring"
    }

    async fn solve(
        &self,
        model: SolverModel,
        parameters: SolverParameters,
        cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome> {
        if model.objective == SolvePhase::Lateness {
            return self.inner.solve(model, parameters, cancel).await;
        }
        let assignment = Self::serial_on_m1(&model.problem);
        let value = evaluate(&model.problem, &assignment).value_of(model.objective);
        Ok(EngineOutcome {
            status: SolveStatus::Optimal,
            objective_value: Some(value),
            assignment: Some(assignment),
            nodes_explored: 0,
        })
    }
}

#[tokio::test]
async fn test_makespan_timeout_keeps_bound_and_runs_cost_phase() {
    let solver = HierarchicalSolver::new(Arc::new(MakespanTimesOut {
        inner: BranchAndBoundEngine::new(),
    }));
    let schedule = solver
        .solve(
            problem_for(&scenario_pattern()),
            Arc::new(ReservationConstraintSet::default()),
            Duration::from_secs(10),
            &SolverParameters::default(),
            &CancellationFlag::new(),
        )
        .await
        .unwrap();

    let phases: Vec<_> = schedule.phase_results.iter().map(|r| r.phase).collect();
    assert_eq!(phases, SolvePhase::ORDER.to_vec());

    assert_eq!(schedule.phase_results[0].status, SolveStatus::Optimal);
    assert_eq!(schedule.phase_results[0].locked, Some(ObjectiveLock::Exact(0)));

    // 超时但有解 → 降级为上界锁, 后续阶段照常执行
    assert_eq!(schedule.phase_results[1].status, SolveStatus::Timeout);
    assert_eq!(schedule.phase_results[1].locked, Some(ObjectiveLock::AtMost(5)));

    assert_eq!(schedule.phase_results[2].status, SolveStatus::Optimal);
    assert_eq!(schedule.phase_results[2].locked, Some(ObjectiveLock::Exact(3500)));

    assert_eq!(schedule.status, SolveStatus::Feasible);
    assert_eq!(schedule.objectives.as_triple(), (0, 5, 3500));
}

#[tokio::test]
async fn test_solution_violating_locked_lateness_is_rejected() {
    let problem = problem_for(&scenario_pattern());

    // 串行解本身满足全部硬约束, 只是拖期变差
    let serial = LockIgnoringEngine::serial_on_m1(&problem);
    assert!(check_feasible(&problem, &ReservationConstraintSet::default(), &serial).is_ok());
    assert!(evaluate(&problem, &serial).total_lateness_minutes > 0);

    let solver = HierarchicalSolver::new(Arc::new(LockIgnoringEngine {
        inner: BranchAndBoundEngine::new(),
    }));
    let err = solver
        .solve(
            problem,
            Arc::new(ReservationConstraintSet::default()),
            Duration::from_secs(10),
            &SolverParameters::default(),
            &CancellationFlag::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SolveError::EngineFailure { phase: SolvePhase::Makespan, .. }
    ));
}

// ==========================================
// 模式化排产系统 - 分层多目标求解
// ==========================================
// 职责: 拖期 → 完工 → 成本 三阶段依次求解, 逐阶段锁定目标
// 锁定规则:
// - OPTIMAL → objective == value
// - FEASIBLE / TIMEOUT 且有解 → objective <= value (降级)
// - TIMEOUT 且无解 → 不加锁
// 红线: 任一阶段 INFEASIBLE → 整体失败, 不产出排程
// 红线: 最终目标值一律按最终赋值重新计算
// 红线: 引擎返回的解必须满足全部已锁定目标, 否则按引擎异常处理
// ==========================================

use crate::config::SolverParameters;
use crate::domain::schedule::{ObjectiveLock, PhaseResult, SolvedSchedule};
use crate::domain::types::{SolvePhase, SolveStatus};
use crate::engine::error::SolveError;
use crate::engine::expander::CompiledProblem;
use crate::engine::reservation::ReservationConstraintSet;
use crate::engine::solver::model::{
    check_feasible, evaluate, to_reservations, to_task_assignments, Assignment, SolverModel,
};
use crate::engine::solver::{CancellationFlag, ConstraintSolver, EngineOutcome};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// 默认阶段时间占比 (拖期 / 完工 / 成本)
pub const DEFAULT_PHASE_FRACTIONS: [f64; 3] = [0.4, 0.3, 0.3];

// 单阶段最短时限, 避免占比为 0 时下发非法参数
const MIN_PHASE_SECONDS: f64 = 0.001;

// 超时守卫在阶段预算之外的余量
const TIMEOUT_SLACK_RATIO: f64 = 1.1;
const TIMEOUT_SLACK: Duration = Duration::from_millis(250);

// ==========================================
// HierarchicalSolver
// ==========================================
pub struct HierarchicalSolver {
    engine: Arc<dyn ConstraintSolver>,
    phase_fractions: [f64; 3],
}

impl HierarchicalSolver {
    /// 创建分层求解器
    ///
    /// # 参数
    /// - engine: 单目标求解引擎
    pub fn new(engine: Arc<dyn ConstraintSolver>) -> Self {
        Self {
            engine,
            phase_fractions: DEFAULT_PHASE_FRACTIONS,
        }
    }

    pub fn with_phase_fractions(mut self, fractions: [f64; 3]) -> Self {
        self.phase_fractions = fractions;
        self
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// 三阶段求解
    ///
    /// # 参数
    /// - problem: 已展开的问题
    /// - reservations: 序列资源约束
    /// - time_budget: 总时间预算 (按阶段占比切分)
    /// - parameters: 生效的求解参数 (单阶段时限取 min(参数, 阶段预算))
    /// - cancel: 取消标志 (阶段之间检查, 同时下发给引擎)
    ///
    /// # 返回
    /// - Ok(SolvedSchedule): 全部阶段最优 → OPTIMAL, 否则 FEASIBLE
    /// - Err(SolveError): 不可行 / 无解 / 取消 / 引擎异常
    #[instrument(skip_all, fields(
        pattern_id = %problem.pattern_id(),
        instance_count = problem.instances.len(),
        budget_seconds = time_budget.as_secs_f64()
    ))]
    pub async fn solve(
        &self,
        problem: Arc<CompiledProblem>,
        reservations: Arc<ReservationConstraintSet>,
        time_budget: Duration,
        parameters: &SolverParameters,
        cancel: &CancellationFlag,
    ) -> Result<SolvedSchedule, SolveError> {
        let started = Instant::now();
        let pattern_id = problem.pattern_id().to_string();

        let mut locks: Vec<(SolvePhase, ObjectiveLock)> = Vec::new();
        let mut incumbent: Option<Assignment> = None;
        let mut phase_results: Vec<PhaseResult> = Vec::with_capacity(SolvePhase::ORDER.len());

        for (phase, fraction) in SolvePhase::ORDER.into_iter().zip(self.phase_fractions) {
            if cancel.is_cancelled() {
                warn!(phase = %phase, "求解在阶段开始前被取消");
                return Err(SolveError::Cancelled {
                    pattern_id,
                    phase,
                });
            }

            // ==========================================
            // 1. 阶段预算与参数
            // ==========================================
            let budget = time_budget.mul_f64(fraction.max(0.0));
            let mut phase_parameters = parameters.clone();
            phase_parameters.time_limit_seconds = parameters
                .time_limit_seconds
                .min(budget.as_secs_f64())
                .max(MIN_PHASE_SECONDS);

            let model = SolverModel {
                problem: problem.clone(),
                reservations: reservations.clone(),
                objective: phase,
                locks: locks.clone(),
                hint: incumbent.clone(),
            };

            // ==========================================
            // 2. 调用引擎 (超时守卫)
            // ==========================================
            let phase_cancel = cancel.child();
            let guard = budget.mul_f64(TIMEOUT_SLACK_RATIO) + TIMEOUT_SLACK;
            let phase_started = Instant::now();

            let outcome = match tokio::time::timeout(
                guard,
                self.engine
                    .solve(model, phase_parameters, phase_cancel.clone()),
            )
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    return Err(SolveError::EngineFailure {
                        pattern_id,
                        phase,
                        message: e.to_string(),
                    })
                }
                Err(_) => {
                    phase_cancel.cancel();
                    warn!(
                        phase = %phase,
                        guard_seconds = guard.as_secs_f64(),
                        "阶段超出时间预算, 按超时处理"
                    );
                    EngineOutcome::without_solution(SolveStatus::Timeout, 0)
                }
            };
            let elapsed_seconds = phase_started.elapsed().as_secs_f64();

            // ==========================================
            // 3. 结果处理与加锁
            // ==========================================
            let (status, objective_value, locked) = match (outcome.status, outcome.assignment) {
                (SolveStatus::Infeasible, _) => {
                    warn!(phase = %phase, "阶段不可行, 终止求解");
                    return Err(SolveError::Infeasible {
                        pattern_id,
                        instance_ids: problem.instance_ids(),
                        phase,
                    });
                }
                (status, Some(assignment)) => {
                    if let Err(reason) = check_feasible(&problem, &reservations, &assignment) {
                        return Err(SolveError::EngineFailure {
                            pattern_id,
                            phase,
                            message: format!("引擎返回的解不满足约束: {}", reason),
                        });
                    }
                    let values = evaluate(&problem, &assignment);
                    if let Some((locked_phase, lock)) = locks
                        .iter()
                        .find(|(p, lock)| !lock.admits(values.value_of(*p)))
                    {
                        return Err(SolveError::EngineFailure {
                            pattern_id,
                            phase,
                            message: format!(
                                "引擎返回的解违反已锁定目标: {} = {}, 锁 {:?}",
                                locked_phase,
                                values.value_of(*locked_phase),
                                lock
                            ),
                        });
                    }
                    let value = values.value_of(phase);
                    let (status, lock) = if status == SolveStatus::Optimal {
                        (SolveStatus::Optimal, ObjectiveLock::Exact(value))
                    } else {
                        (status, ObjectiveLock::AtMost(value))
                    };
                    locks.push((phase, lock));
                    incumbent = Some(assignment);
                    (status, Some(value), Some(lock))
                }
                (status, None) => {
                    warn!(phase = %phase, status = %status, "阶段未得到解, 不加锁");
                    (SolveStatus::Timeout, None, None)
                }
            };

            info!(
                phase = %phase,
                status = %status,
                objective = ?objective_value,
                lock = ?locked,
                nodes = outcome.nodes_explored,
                elapsed_seconds,
                "阶段求解完成"
            );

            phase_results.push(PhaseResult {
                phase,
                status,
                objective_value,
                elapsed_seconds,
                locked,
            });
        }

        // ==========================================
        // 4. 组装排程
        // ==========================================
        let Some(assignment) = incumbent else {
            return Err(SolveError::NoSolutionFound {
                pattern_id,
                instance_ids: problem.instance_ids(),
            });
        };

        let status = if phase_results.iter().all(|r| r.status == SolveStatus::Optimal) {
            SolveStatus::Optimal
        } else {
            SolveStatus::Feasible
        };
        let objectives = evaluate(&problem, &assignment);

        let schedule = SolvedSchedule {
            schedule_id: Uuid::new_v4().to_string(),
            pattern_id,
            instance_ids: problem.instance_ids(),
            origin: problem.origin,
            status,
            solve_time_seconds: started.elapsed().as_secs_f64(),
            objectives,
            assignments: to_task_assignments(&problem, &assignment),
            reservations: to_reservations(&problem, &reservations, &assignment),
            phase_results,
            created_at: chrono::Local::now().naive_local(),
        };

        info!(
            schedule_id = %schedule.schedule_id,
            status = %schedule.status,
            lateness = objectives.total_lateness_minutes,
            makespan = objectives.makespan_minutes,
            cost = objectives.total_cost_cents,
            solve_time_seconds = schedule.solve_time_seconds,
            "分层求解完成"
        );
        Ok(schedule)
    }
}

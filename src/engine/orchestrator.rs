// ==========================================
// 模式化排产系统 - 引擎编排器
// ==========================================
// 主流程: 加载 → 编译(缓存) → 展开 → 预留 → 分层求解 → 存储 → 性能跟踪
// 红线: 校验类错误在调用求解引擎前抛出
// 红线: 性能跟踪失败只告警，不影响已存储的排程
// 并发: 多个独立请求通过 join_all 并发执行，仅共享只读编译缓存
// ==========================================

use crate::config::{SolverParameters, SolverSettings};
use crate::domain::instance::JobInstance;
use crate::domain::pattern::{Machine, Pattern};
use crate::domain::performance::PerformanceRecord;
use crate::domain::resource::SequenceResource;
use crate::domain::schedule::SolvedSchedule;
use crate::engine::cache::CompiledPatternCache;
use crate::engine::compiler::{CompiledPattern, PatternCompiler};
use crate::engine::error::EngineResult;
use crate::engine::expander::{CompiledProblem, InstanceExpander, LegacyExpander};
use crate::engine::performance::PerformanceTracker;
use crate::engine::repositories::ScheduleRepositories;
use crate::engine::reservation::SequenceReservationManager;
use crate::engine::solver::{
    BranchAndBoundEngine, CancellationFlag, ConstraintSolver, HierarchicalSolver,
};
use crate::perf::PerfGuard;
use chrono::NaiveDateTime;
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

// ==========================================
// SolveRequest - 单次求解请求
// ==========================================
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub pattern_id: String,
    pub origin: NaiveDateTime,                 // 时间原点
    pub instance_ids: Option<Vec<String>>,     // None: 全部可排产实例
    pub parameter_overrides: JsonValue,        // 请求级参数覆写 (叠加在模式默认值上)
    pub time_budget_seconds: Option<f64>,      // None: 使用全局配置
    pub compare_legacy: Option<bool>,          // None: 使用全局配置
}

impl SolveRequest {
    pub fn new(pattern_id: &str, origin: NaiveDateTime) -> Self {
        Self {
            pattern_id: pattern_id.to_string(),
            origin,
            instance_ids: None,
            parameter_overrides: JsonValue::Null,
            time_budget_seconds: None,
            compare_legacy: None,
        }
    }

    pub fn with_instances(mut self, instance_ids: Vec<String>) -> Self {
        self.instance_ids = Some(instance_ids);
        self
    }

    pub fn with_overrides(mut self, overrides: JsonValue) -> Self {
        self.parameter_overrides = overrides;
        self
    }

    pub fn with_time_budget(mut self, seconds: f64) -> Self {
        self.time_budget_seconds = Some(seconds);
        self
    }

    pub fn with_compare_legacy(mut self, compare: bool) -> Self {
        self.compare_legacy = Some(compare);
        self
    }
}

// ==========================================
// SolveReport - 求解结果报告
// ==========================================
#[derive(Debug, Clone)]
pub struct SolveReport {
    pub schedule: SolvedSchedule,
    pub performance: Option<PerformanceRecord>, // None: 性能记录写入失败
    pub speedup_factor: Option<f64>,
}

impl SolveReport {
    pub fn is_regression(&self) -> bool {
        self.performance
            .as_ref()
            .map(|p| p.is_regression)
            .unwrap_or(false)
    }
}

// 已加载的求解输入
struct LoadedInputs {
    pattern: Pattern,
    machines: Vec<Machine>,
    instances: Vec<JobInstance>,
    resources: Vec<SequenceResource>,
}

// ==========================================
// ScheduleOrchestrator - 引擎编排器
// ==========================================
pub struct ScheduleOrchestrator {
    repos: ScheduleRepositories,
    settings: SolverSettings,
    compiler: PatternCompiler,
    expander: InstanceExpander,
    legacy: LegacyExpander,
    reservation_manager: SequenceReservationManager,
    solver: HierarchicalSolver,
    tracker: PerformanceTracker,
    cache: Arc<CompiledPatternCache>,
}

impl ScheduleOrchestrator {
    /// 创建编排器 (内置分支定界引擎)
    ///
    /// # 参数
    /// - repos: 仓储集合
    /// - settings: 全局求解配置
    pub fn new(repos: ScheduleRepositories, settings: SolverSettings) -> Self {
        Self::with_engine(repos, settings, Arc::new(BranchAndBoundEngine::new()))
    }

    /// 使用指定求解引擎创建编排器
    pub fn with_engine(
        repos: ScheduleRepositories,
        settings: SolverSettings,
        engine: Arc<dyn ConstraintSolver>,
    ) -> Self {
        let tracker = PerformanceTracker::new(repos.performance_store.clone())
            .with_threshold(settings.regression_threshold_pct);
        let solver =
            HierarchicalSolver::new(engine).with_phase_fractions(settings.phase_fractions);

        Self {
            repos,
            compiler: PatternCompiler::new(),
            expander: InstanceExpander::new(),
            legacy: LegacyExpander::new(),
            reservation_manager: SequenceReservationManager::new(),
            solver,
            tracker,
            cache: Arc::new(CompiledPatternCache::new()),
            settings,
        }
    }

    /// 与其他编排器共享编译缓存
    pub fn with_cache(mut self, cache: Arc<CompiledPatternCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<CompiledPatternCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &PerformanceTracker {
        &self.tracker
    }

    /// 只编译不求解 (经由缓存)
    #[instrument(skip(self))]
    pub async fn compile_pattern(&self, pattern_id: &str) -> EngineResult<Arc<CompiledPattern>> {
        let source = self.repos.pattern_source();
        let pattern = source.load_pattern(pattern_id).await?;
        let machines = source.load_machines().await?;
        Ok(self.cache.get_or_compile(&self.compiler, &pattern, &machines)?)
    }

    /// 执行一次完整求解
    ///
    /// # 参数
    /// - request: 求解请求
    /// - cancel: 取消标志 (阶段间检查，并下传给求解引擎)
    ///
    /// # 返回
    /// - Ok(SolveReport): 已存储的排程 + 性能记录
    /// - Err(EngineError): 校验失败 / 求解失败 / 存储失败
    #[instrument(skip(self, request, cancel), fields(pattern_id = %request.pattern_id))]
    pub async fn solve(
        &self,
        request: &SolveRequest,
        cancel: &CancellationFlag,
    ) -> EngineResult<SolveReport> {
        let _perf = PerfGuard::new("solve_request");

        // ==========================================
        // 1. 加载输入
        // ==========================================
        let inputs = self.load_inputs(request).await?;
        info!(
            instance_count = inputs.instances.len(),
            task_count = inputs.pattern.tasks.len(),
            resource_count = inputs.resources.len(),
            "开始求解"
        );

        // ==========================================
        // 2. 编译 (缓存) + 参数
        // ==========================================
        let compiled = self
            .cache
            .get_or_compile(&self.compiler, &inputs.pattern, &inputs.machines)?;
        let parameters = compiled
            .default_parameters
            .with_overrides(&request.parameter_overrides)?;
        let budget = self.time_budget(request);

        // ==========================================
        // 3. 展开 + 预留 + 分层求解
        // ==========================================
        let started = Instant::now();
        let problem = self
            .expander
            .expand(compiled.clone(), &inputs.instances, request.origin)?;
        let schedule = self
            .solve_problem(problem, &inputs.resources, budget, &parameters, cancel)
            .await?;
        let pattern_seconds = started.elapsed().as_secs_f64();

        // ==========================================
        // 4. 扁平建模对比 (可选)
        // ==========================================
        let speedup_factor = if request.compare_legacy.unwrap_or(self.settings.compare_legacy) {
            self.measure_speedup(&inputs, request.origin, budget, &parameters, cancel, pattern_seconds)
                .await
        } else {
            None
        };

        // ==========================================
        // 5. 存储 + 性能跟踪
        // ==========================================
        self.repos
            .schedule_store()
            .store_solved_schedule(&schedule)
            .await?;

        let performance = match self
            .tracker
            .record(
                &schedule.pattern_id,
                schedule.solve_time_seconds,
                schedule.instance_ids.len(),
                speedup_factor,
            )
            .await
        {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, schedule_id = %schedule.schedule_id, "性能记录写入失败");
                None
            }
        };

        info!(
            schedule_id = %schedule.schedule_id,
            status = %schedule.status,
            lateness = schedule.objectives.total_lateness_minutes,
            makespan = schedule.objectives.makespan_minutes,
            cost = schedule.objectives.total_cost_cents,
            solve_time_seconds = schedule.solve_time_seconds,
            "求解完成"
        );

        Ok(SolveReport {
            schedule,
            performance,
            speedup_factor,
        })
    }

    /// 并发执行多个独立请求
    ///
    /// 结果顺序与请求顺序一致; 单个请求失败不影响其他请求
    pub async fn solve_batches(
        &self,
        requests: &[SolveRequest],
        cancel: &CancellationFlag,
    ) -> Vec<EngineResult<SolveReport>> {
        info!(request_count = requests.len(), "并发求解批次");
        join_all(requests.iter().map(|request| self.solve(request, cancel))).await
    }

    pub async fn load_schedule(&self, schedule_id: &str) -> EngineResult<SolvedSchedule> {
        Ok(self
            .repos
            .schedule_store()
            .load_solved_schedule(schedule_id)
            .await?)
    }

    pub async fn performance_history(
        &self,
        pattern_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<PerformanceRecord>> {
        Ok(self.tracker.history(pattern_id, limit).await?)
    }

    async fn load_inputs(&self, request: &SolveRequest) -> EngineResult<LoadedInputs> {
        let source = self.repos.pattern_source();
        let pattern = source.load_pattern(&request.pattern_id).await?;
        let machines = source.load_machines().await?;
        // 显式指定的实例全部加载, 模式归属由展开器校验; instance_limit 只作用于默认选取
        let instances = match &request.instance_ids {
            Some(ids) => source.load_instances_by_ids(ids).await?,
            None => {
                source
                    .load_instances(&request.pattern_id, self.settings.instance_limit)
                    .await?
            }
        };
        let resources = source.load_sequence_resources(true).await?;

        Ok(LoadedInputs {
            pattern,
            machines,
            instances,
            resources,
        })
    }

    async fn solve_problem(
        &self,
        problem: CompiledProblem,
        resources: &[SequenceResource],
        budget: Duration,
        parameters: &SolverParameters,
        cancel: &CancellationFlag,
    ) -> EngineResult<SolvedSchedule> {
        let reservations = self.reservation_manager.build(&problem, resources)?;
        let schedule = self
            .solver
            .solve(
                Arc::new(problem),
                Arc::new(reservations),
                budget,
                parameters,
                cancel,
            )
            .await?;
        Ok(schedule)
    }

    // 加速比 = 扁平建模耗时 / 模式化耗时 (均含展开 + 预留 + 求解)
    async fn measure_speedup(
        &self,
        inputs: &LoadedInputs,
        origin: NaiveDateTime,
        budget: Duration,
        parameters: &SolverParameters,
        cancel: &CancellationFlag,
        pattern_seconds: f64,
    ) -> Option<f64> {
        let started = Instant::now();
        let problem = match self
            .legacy
            .expand(&inputs.pattern, &inputs.machines, &inputs.instances, origin)
        {
            Ok(problem) => problem,
            Err(e) => {
                warn!(error = %e, "扁平建模展开失败，跳过加速比");
                return None;
            }
        };

        if let Err(e) = self
            .solve_problem(problem, &inputs.resources, budget, parameters, &cancel.child())
            .await
        {
            warn!(error = %e, "扁平建模求解失败，跳过加速比");
            return None;
        }

        let legacy_seconds = started.elapsed().as_secs_f64();
        let speedup = legacy_seconds / pattern_seconds.max(f64::EPSILON);
        debug!(legacy_seconds, pattern_seconds, speedup, "加速比测量完成");
        Some(speedup)
    }

    fn time_budget(&self, request: &SolveRequest) -> Duration {
        let seconds = request
            .time_budget_seconds
            .filter(|s| *s > 0.0 && s.is_finite())
            .unwrap_or(self.settings.time_budget_seconds);
        Duration::from_secs_f64(seconds.clamp(0.001, 1e9))
    }
}

// ==========================================
// 模式化排产系统 - 引擎层
// ==========================================
// 职责: 模式编译、实例展开、序列资源预留、分层求解、性能跟踪
// 红线: Engine 不拼 SQL, 数据读写全部经由 repository 接口
// 红线: 校验类错误在调用求解引擎之前抛出
// ==========================================

pub mod cache;
pub mod compiler;
pub mod error;
pub mod expander;
pub mod orchestrator;
pub mod performance;
pub mod repositories;
pub mod reservation;
pub mod solver;

// 重导出核心引擎
pub use cache::CompiledPatternCache;
pub use compiler::{CompiledEdge, CompiledMode, CompiledPattern, CompiledTask, PatternCompiler};
pub use error::{
    CompileError, EngineError, EngineResult, ExpansionError, ReservationError, SolveError,
};
pub use expander::{
    CompiledProblem, InstanceExpander, InstanceSlot, LegacyExpander, LegacyExpansionError,
    ProblemInstance, SetupSource, SlotPrecedence,
};
pub use orchestrator::{ScheduleOrchestrator, SolveReport, SolveRequest};
pub use performance::PerformanceTracker;
pub use repositories::ScheduleRepositories;
pub use reservation::{ReservationConstraintSet, ReservationGroup, SequenceReservationManager};
pub use solver::{
    Assignment, BranchAndBoundEngine, CancellationFlag, ConstraintSolver, EngineOutcome,
    HierarchicalSolver, ModelDescription, SlotAssignment, SolverModel,
};

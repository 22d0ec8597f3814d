// ==========================================
// 模式化排产系统 - 引擎层错误类型
// ==========================================
// 职责: 编译/展开/预留/求解各阶段的错误分类
// 红线: 校验类错误均为致命错误，在调用求解引擎前抛出，不自动重试
// 红线: 每个错误都携带 pattern_id / instance_ids / phase 以便复现
// 工具: thiserror 派生宏
// ==========================================

use crate::config::ParameterError;
use crate::domain::types::SolvePhase;
use crate::repository::RepositoryError;
use thiserror::Error;

// ==========================================
// CompileError - 模式编译错误
// ==========================================
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("模式不含任何任务: pattern_id={pattern_id}")]
    EmptyPattern { pattern_id: String },

    #[error("任务缺少执行模式: pattern_id={pattern_id}, task_id={task_id}")]
    MissingMode { pattern_id: String, task_id: String },

    #[error("执行模式非法: pattern_id={pattern_id}, task_id={task_id}, mode_id={mode_id}: {reason}")]
    InvalidMode {
        pattern_id: String,
        task_id: String,
        mode_id: String,
        reason: String,
    },

    #[error("任务ID重复: pattern_id={pattern_id}, task_id={task_id}")]
    DuplicateTask { pattern_id: String, task_id: String },

    #[error("前序约束引用了模式外的任务: pattern_id={pattern_id}, task_id={task_id}")]
    UnknownTask { pattern_id: String, task_id: String },

    #[error("前序约束自环: pattern_id={pattern_id}, task_id={task_id}")]
    SelfPrecedence { pattern_id: String, task_id: String },

    #[error("前序约束非法: pattern_id={pattern_id}, {before_task_id}->{after_task_id}: {reason}")]
    InvalidPrecedence {
        pattern_id: String,
        before_task_id: String,
        after_task_id: String,
        reason: String,
    },

    #[error("前序约束存在环: pattern_id={pattern_id}, tasks={tasks:?}")]
    CycleDetected { pattern_id: String, tasks: Vec<String> },

    #[error("换型时间条目非法: pattern_id={pattern_id}, {from_task_id}->{to_task_id}@{machine_id}: {reason}")]
    InvalidSetupEntry {
        pattern_id: String,
        from_task_id: String,
        to_task_id: String,
        machine_id: String,
        reason: String,
    },

    #[error("操作工人数上下限非法: pattern_id={pattern_id}, task_id={task_id}, min={min}, max={max}")]
    InvalidOperatorBounds {
        pattern_id: String,
        task_id: String,
        min: i32,
        max: i32,
    },

    #[error("未知设备: pattern_id={pattern_id}, task_id={task_id}, machine_id={machine_id}")]
    UnknownMachine {
        pattern_id: String,
        task_id: String,
        machine_id: String,
    },

    #[error("求解参数非法: pattern_id={pattern_id}: {source}")]
    InvalidParameters {
        pattern_id: String,
        #[source]
        source: ParameterError,
    },
}

// ==========================================
// ExpansionError - 实例展开错误
// ==========================================
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpansionError {
    #[error("未提供任何作业实例: pattern_id={pattern_id}")]
    NoInstancesProvided { pattern_id: String },

    #[error("实例引用的模式不匹配: instance_id={instance_id}, expected={expected}, found={found}")]
    UnknownPattern {
        instance_id: String,
        expected: String,
        found: String,
    },

    #[error("实例ID重复: pattern_id={pattern_id}, instance_id={instance_id}")]
    DuplicateInstance {
        pattern_id: String,
        instance_id: String,
    },
}

// ==========================================
// ReservationError - 序列资源预留错误
// ==========================================
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReservationError {
    #[error("序列资源定义非法: sequence_id={sequence_id}: {reason}")]
    InvalidResource { sequence_id: String, reason: String },

    #[error("任务绑定了不存在或未启用的序列资源: pattern_id={pattern_id}, task_id={task_id}, sequence_id={sequence_id}")]
    UnknownSequenceResource {
        pattern_id: String,
        task_id: String,
        sequence_id: String,
    },

    #[error("序列资源无法满足: pattern_id={pattern_id}, task_id={task_id}, sequence_id={sequence_id}: {reason}")]
    ResourceUnsatisfiable {
        pattern_id: String,
        task_id: String,
        sequence_id: String,
        reason: String,
    },
}

// ==========================================
// SolveError - 求解错误
// ==========================================
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("问题不可行: pattern_id={pattern_id}, phase={phase}, instances={instance_ids:?}")]
    Infeasible {
        pattern_id: String,
        instance_ids: Vec<String>,
        phase: SolvePhase,
    },

    #[error("所有阶段均未得到可行解: pattern_id={pattern_id}, instances={instance_ids:?}")]
    NoSolutionFound {
        pattern_id: String,
        instance_ids: Vec<String>,
    },

    #[error("求解已取消: pattern_id={pattern_id}, phase={phase}")]
    Cancelled { pattern_id: String, phase: SolvePhase },

    #[error("求解引擎异常: pattern_id={pattern_id}, phase={phase}: {message}")]
    EngineFailure {
        pattern_id: String,
        phase: SolvePhase,
        message: String,
    },
}

// ==========================================
// EngineError - 引擎层统一错误
// ==========================================
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Expansion(#[from] ExpansionError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Solve(#[from] SolveError),

    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("配置读取失败: {0}")]
    Config(String),
}

impl EngineError {
    /// 是否为求解前的校验类错误
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Compile(_)
                | EngineError::Expansion(_)
                | EngineError::Reservation(_)
                | EngineError::Parameter(_)
        )
    }
}

/// Result 类型别名
pub type EngineResult<T> = Result<T, EngineError>;

// ==========================================
// 模式化排产系统 - 求解层
// ==========================================
// 职责: 约束求解引擎接口 (ConstraintSolver) + 分层多目标求解
// 红线: 引擎只看到 SolverModel，不读写数据库
// 红线: 所有引擎必须响应取消标志与时间上限
// ==========================================

pub mod branch_bound;
pub mod hierarchical;
pub mod model;

#[cfg(test)]
mod tests;

use crate::config::SolverParameters;
use crate::domain::types::SolveStatus;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use branch_bound::BranchAndBoundEngine;
pub use hierarchical::HierarchicalSolver;
pub use model::{Assignment, ModelDescription, SlotAssignment, SolverModel};

// ==========================================
// EngineOutcome - 单次引擎调用结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutcome {
    pub status: SolveStatus,
    pub objective_value: Option<i64>,
    pub assignment: Option<Assignment>,
    pub nodes_explored: u64,
}

impl EngineOutcome {
    /// 无解结果 (不可行 / 超时)
    pub fn without_solution(status: SolveStatus, nodes_explored: u64) -> Self {
        Self {
            status,
            objective_value: None,
            assignment: None,
            nodes_explored,
        }
    }
}

// ==========================================
// CancellationFlag - 协作式取消
// ==========================================
// 子标志继承父标志: 父取消 → 子可见; 子取消 → 父不受影响
#[derive(Debug, Clone)]
pub struct CancellationFlag {
    chain: Vec<Arc<AtomicBool>>,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    pub fn child(&self) -> Self {
        let mut chain = self.chain.clone();
        chain.push(Arc::new(AtomicBool::new(false)));
        Self { chain }
    }

    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| flag.load(Ordering::SeqCst))
    }
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// ConstraintSolver Trait
// ==========================================
// 单目标求解引擎; 锁定的前序目标以约束形式出现在模型中
#[async_trait]
pub trait ConstraintSolver: Send + Sync {
    /// 引擎名称 (日志用)
    fn name(&self) -> &str;

    /// 求解单阶段模型
    ///
    /// # 返回
    /// - Ok(EngineOutcome): 状态 + 目标值 + 赋值
    /// - Err: 引擎内部异常
    async fn solve(
        &self,
        model: SolverModel,
        parameters: SolverParameters,
        cancel: CancellationFlag,
    ) -> anyhow::Result<EngineOutcome>;
}

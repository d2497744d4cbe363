//! 运行时错误.

use thiserror::Error;

use crate::engine::EngineError;

/// PK 建模流程的错误.
///
/// 配置类错误 (ROI, 数据缺失, 维度, 空选区, 选项) 在派发工作线程之前同步产生;
/// 工作线程错误在所有线程结束后以 [`PkError::Worker`] 汇报.
#[derive(Debug, Error)]
pub enum PkError {
    /// 主数据不是 4D.
    #[error("data must be 4D for DCE PK modelling (got {ndim}D)")]
    EmptyInput {
        /// 实际维度.
        ndim: usize,
    },

    /// 主数据没有任何时间点.
    #[error("data has no time points")]
    NoTimePoints,

    /// 掩膜中没有任何被选中的体素.
    #[error("Pk Modelling - no unmasked data found!")]
    EmptySelection,

    /// 两个数组的空间形状不一致.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// 期望形状.
        expected: Vec<usize>,
        /// 实际形状.
        found: Vec<usize>,
    },

    /// 指定的 ROI 不存在.
    #[error("Specified ROI not found: {0}")]
    RoiNotFound(String),

    /// 数据存储中没有主数据.
    #[error("No data loaded")]
    NoMainData,

    /// 数据存储中没有指定名称的数据.
    #[error("data not found: {0}")]
    DataNotFound(String),

    /// 缺少必需的运行选项.
    #[error("missing required option `{0}`")]
    MissingOption(&'static str),

    /// 运行选项取值非法.
    #[error("invalid option `{name}`: {reason}")]
    InvalidOption {
        /// 选项名.
        name: &'static str,
        /// 原因.
        reason: String,
    },

    /// 某个工作线程失败.
    #[error(transparent)]
    Worker(#[from] WorkerFailure),

    /// 运行被取消, 部分结果已丢弃.
    #[error("run cancelled")]
    Cancelled,

    /// 流程状态不允许该操作.
    #[error("process is not in a state to {0}")]
    InvalidState(&'static str),

    /// 名称写入 npz 后会以另一种角色读回.
    #[error("name `{0}` cannot be stored in an npz archive")]
    ReservedName(String),

    /// 读取 npz 归档错误.
    #[error(transparent)]
    ReadNpz(#[from] ndarray_npy::ReadNpzError),

    /// 写入 npz 归档错误.
    #[error(transparent)]
    WriteNpz(#[from] ndarray_npy::WriteNpzError),

    /// 底层 I/O 错误.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 配置文件解析错误.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// PK 建模流程运行时结果.
pub type PkResult<T> = Result<T, PkError>;

/// 单个工作线程的失败, 保留原始原因.
#[derive(Debug, Clone, Error)]
#[error("worker {worker_id} failed: {cause}")]
pub struct WorkerFailure {
    /// 工作线程编号.
    pub worker_id: usize,

    /// 原始原因.
    #[source]
    pub cause: WorkerFailureCause,
}

/// 工作线程失败原因.
#[derive(Debug, Clone, Error)]
pub enum WorkerFailureCause {
    /// 拟合引擎返回错误.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// 拟合引擎 panic. 参数为 panic 信息.
    #[error("engine panicked: {0}")]
    Panicked(String),

    /// 分配到的体素分区为空.
    #[error("Pk Modelling - no unmasked data found!")]
    EmptyPartition,

    /// 引擎返回的结果形状与输入不符.
    #[error("engine returned {what} with shape {found:?}, expected {expected:?}")]
    BadOutput {
        /// 哪一项输出.
        what: &'static str,
        /// 期望形状.
        expected: Vec<usize>,
        /// 实际形状.
        found: Vec<usize>,
    },
}

//! 外部拟合引擎契约.
//!
//! 非线性曲线拟合算法本身不在本 crate 内实现. 本模块只描述调度器与引擎之间的窄接口:
//!
//! 1. 引擎由 [`EngineFactory`] 按工作线程各自创建, 输入仅为纯数据 [`EngineInput`];
//! 2. 依次调用 `set_bounds`, `set_parameters`, `initialize`;
//! 3. 反复调用 `run(chunk_size)`, 直到所有体素都被消费. 引擎内部维护游标,
//!   状态跨调用累积, 因此调用必须严格顺序进行;
//! 4. 最后读取残差, 拟合曲线和参数矩阵.

use std::fmt;

use ndarray::{Array1, Array2};
use thiserror::Error;

use crate::consts::{DEFAULT_LOWER_BOUNDS, DEFAULT_UPPER_BOUNDS, PARAM_COUNT};

/// 拟合引擎错误.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    message: String,
}

impl EngineError {
    /// 以错误信息构造.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// 错误信息.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 拟合引擎运行时结果.
pub type EngineResult<T> = Result<T, EngineError>;

/// 药代动力学模型选择. 编号与宿主程序保持一致.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ModelChoice {
    /// 临床: Tofts 模型 + Orton AIF (第三类), 带 offset.
    ClinicalToftsOffset = 1,

    /// 临床: Tofts 模型 + Orton AIF (第三类), 不带 offset.
    ClinicalTofts = 2,

    /// 临床前: Tofts 模型 + 双指数 AIF (Heilmann).
    PreclinicalTofts = 3,

    /// 临床前: 扩展 Tofts 模型 + 双指数 AIF (Heilmann).
    PreclinicalExtendedTofts = 4,
}

impl ModelChoice {
    /// 宿主程序使用的整数编号.
    #[inline]
    pub const fn code(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for ModelChoice {
    type Error = i64;

    /// 未知编号原样返回.
    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::ClinicalToftsOffset),
            2 => Ok(Self::ClinicalTofts),
            3 => Ok(Self::PreclinicalTofts),
            4 => Ok(Self::PreclinicalExtendedTofts),
            other => Err(other),
        }
    }
}

impl fmt::Display for ModelChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClinicalToftsOffset => "Clinical: Tofts / Orton AIF, with offset",
            Self::ClinicalTofts => "Clinical: Tofts / Orton AIF, no offset",
            Self::PreclinicalTofts => "Preclinical: Tofts / biexponential AIF",
            Self::PreclinicalExtendedTofts => "Preclinical: extended Tofts / biexponential AIF",
        };
        f.write_str(s)
    }
}

/// 参数上下界, 依次为 Ktrans, ve, offset, vp.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds {
    /// 上界.
    pub upper: [f64; PARAM_COUNT],

    /// 下界.
    pub lower: [f64; PARAM_COUNT],
}

impl Default for Bounds {
    fn default() -> Self {
        Self {
            upper: DEFAULT_UPPER_BOUNDS,
            lower: DEFAULT_LOWER_BOUNDS,
        }
    }
}

/// 以引擎单位 (秒) 表示的采集参数.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AcquisitionParams {
    /// T1 弛豫率.
    pub r1: f64,

    /// T2 弛豫率.
    pub r2: f64,

    /// 翻转角.
    pub flip_angle: f64,

    /// 重复时间, 秒.
    pub tr_seconds: f64,

    /// 回波时间, 秒.
    pub te_seconds: f64,

    /// 剂量.
    pub dose: f64,
}

/// 构造拟合引擎所需的纯数据输入. 每个工作线程独占一份.
#[derive(Clone, Debug)]
pub struct EngineInput {
    /// 采样时间轴, 分钟.
    pub time_minutes: Array1<f64>,

    /// 归一化后的体素信号, 形状为 (n, t).
    pub voxels: Array2<f64>,

    /// 与 `voxels` 逐行对应的 T10 值.
    pub t10: Array1<f64>,
}

impl EngineInput {
    /// 体素个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.voxels.nrows()
    }

    /// 是否没有体素.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 时间点个数.
    #[inline]
    pub fn time_points(&self) -> usize {
        self.voxels.ncols()
    }
}

/// 外部非线性拟合引擎.
///
/// 实现方不需要是 `Sync`, 也不需要可重入: 调度器保证同一实例只在一个线程中被顺序调用.
pub trait FittingEngine {
    /// 初始化优化器内部状态. 不支持 `model` 时返回 `Err`.
    fn initialize(&mut self, model: ModelChoice, injection_time_minutes: f64)
        -> EngineResult<String>;

    /// 设置参数上下界.
    fn set_bounds(&mut self, upper: [f64; PARAM_COUNT], lower: [f64; PARAM_COUNT]);

    /// 设置采集参数.
    fn set_parameters(&mut self, params: &AcquisitionParams);

    /// 从内部游标处继续处理 `chunk_size` 个体素, 返回该段日志.
    fn run(&mut self, chunk_size: usize) -> EngineResult<String>;

    /// 残差, 长度为 n. 仅在所有块处理完毕后有效.
    fn residual(&self) -> EngineResult<Array1<f64>>;

    /// 拟合曲线, 形状为 (n, t). 仅在所有块处理完毕后有效.
    fn fitted_curve(&self) -> EngineResult<Array2<f64>>;

    /// 参数矩阵, 形状为 (n, 4). 仅在所有块处理完毕后有效.
    fn parameters(&self) -> EngineResult<Array2<f64>>;
}

/// 按工作线程创建拟合引擎.
pub trait EngineFactory: Send + Sync {
    /// 由 `input` 创建一个新的引擎实例.
    fn create(&self, input: EngineInput) -> EngineResult<Box<dyn FittingEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn(EngineInput) -> EngineResult<Box<dyn FittingEngine>> + Send + Sync,
{
    #[inline]
    fn create(&self, input: EngineInput) -> EngineResult<Box<dyn FittingEngine>> {
        self(input)
    }
}

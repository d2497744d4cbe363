//! 工作线程: 以纯数据任务驱动一个私有拟合引擎, 返回显式的成功/失败结果.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use ndarray::{Array1, Array2};

use super::progress::ProgressSender;
use crate::consts::{PARAM_COUNT, START_PROGRESS};
use crate::engine::{AcquisitionParams, Bounds, EngineFactory, EngineInput, FittingEngine, ModelChoice};
use crate::error::{WorkerFailure, WorkerFailureCause};

/// 分块方案. 所有块的大小之和恰为体素总数.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ChunkPlan {
    total: usize,
    chunk_size: usize,
    steps: usize,
}

impl ChunkPlan {
    /// 将 `total` 个体素划分为约 `chunks` 块.
    ///
    /// 块大小为 `max(1, round(total / chunks))` (银行家舍入), 最后一块取余量.
    pub fn new(total: usize, chunks: usize) -> Self {
        let chunks = chunks.max(1);
        let chunk_size = ((total as f64 / chunks as f64).round_ties_even() as usize).max(1);
        let steps = total.div_ceil(chunk_size);
        Self {
            total,
            chunk_size,
            steps,
        }
    }

    /// 每块体素数 (最后一块可能更少).
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// 块数 S.
    #[inline]
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// 依次给出每一块的大小.
    pub fn sizes(&self) -> impl ExactSizeIterator<Item = usize> + '_ {
        (0..self.steps).map(move |i| {
            let start = i * self.chunk_size;
            self.chunk_size.min(self.total - start)
        })
    }

    /// 开始处理第 `i` 块之前应当发出的进度. 第 0 块不发出进度.
    #[inline]
    pub fn progress_before(&self, i: usize) -> Option<f64> {
        (i > 0).then(|| i as f64 / self.steps as f64 * 100.0)
    }
}

/// 取消标记. 在块与块之间检查.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// 新建未取消的标记.
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// 是否已请求取消.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 不依赖体素数据的拟合配置.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FitSettings {
    /// 模型.
    pub model: ModelChoice,

    /// 注射时间, 分钟.
    pub injection_time_minutes: f64,

    /// 参数上下界.
    pub bounds: Bounds,

    /// 采集参数 (秒).
    pub acquisition: AcquisitionParams,

    /// 目标块数.
    pub chunks: usize,
}

/// 一个工作线程的不可变输入包.
#[derive(Clone, Debug)]
pub struct FitTask {
    /// 工作线程编号, 也是分区序号.
    pub worker_id: usize,

    /// 引擎输入.
    pub input: EngineInput,

    /// 拟合配置.
    pub settings: FitSettings,
}

/// 工作线程成功时的输出.
#[derive(Clone, Debug)]
pub struct FitOutput {
    /// 参数矩阵 (n, 4).
    pub parameters: Array2<f64>,

    /// 残差 (n).
    pub residual: Array1<f64>,

    /// 拟合曲线 (n, t).
    pub fitted_curve: Array2<f64>,

    /// 引擎日志.
    pub log: String,
}

/// 工作线程结果.
#[derive(Clone, Debug)]
pub enum WorkerOutcome {
    /// 成功.
    Succeeded {
        /// 工作线程编号.
        worker_id: usize,
        /// 输出.
        output: FitOutput,
    },

    /// 失败, 保留原始原因.
    Failed(WorkerFailure),

    /// 在完成前被取消.
    Cancelled {
        /// 工作线程编号.
        worker_id: usize,
    },
}

impl WorkerOutcome {
    /// 工作线程编号.
    pub fn worker_id(&self) -> usize {
        match self {
            Self::Succeeded { worker_id, .. } | Self::Cancelled { worker_id } => *worker_id,
            Self::Failed(f) => f.worker_id,
        }
    }

    /// 是否成功.
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

/// 执行一个拟合任务. 引擎的任何错误都在此处被捕获并转换为 [`WorkerOutcome::Failed`].
pub fn run_task(
    task: FitTask,
    factory: &dyn EngineFactory,
    progress: &ProgressSender,
    cancel: &CancelToken,
) -> WorkerOutcome {
    let worker_id = task.worker_id;
    match drive(task, factory, progress, cancel) {
        Ok(Some(output)) => WorkerOutcome::Succeeded { worker_id, output },
        Ok(None) => WorkerOutcome::Cancelled { worker_id },
        Err(cause) => WorkerOutcome::Failed(WorkerFailure { worker_id, cause }),
    }
}

/// 返回 `Ok(None)` 表示被取消.
fn drive(
    task: FitTask,
    factory: &dyn EngineFactory,
    progress: &ProgressSender,
    cancel: &CancelToken,
) -> Result<Option<FitOutput>, WorkerFailureCause> {
    let FitTask {
        worker_id,
        input,
        settings,
    } = task;
    if input.is_empty() {
        return Err(WorkerFailureCause::EmptyPartition);
    }
    let (n, t) = (input.len(), input.time_points());

    let mut engine = factory.create(input)?;
    engine.set_bounds(settings.bounds.upper, settings.bounds.lower);
    engine.set_parameters(&settings.acquisition);
    let mut log = engine.initialize(settings.model, settings.injection_time_minutes)?;

    let plan = ChunkPlan::new(n, settings.chunks);
    debug!("worker {worker_id}: number of voxels per step: {}", plan.chunk_size());
    debug!("worker {worker_id}: number of steps: {}", plan.steps());

    progress.send(START_PROGRESS);
    for (i, size) in plan.sizes().enumerate() {
        if cancel.is_cancelled() {
            debug!("worker {worker_id}: cancelled before chunk {i}");
            return Ok(None);
        }
        if let Some(p) = plan.progress_before(i) {
            progress.send(p);
        }
        log += &engine.run(size)?;
    }

    let output = collect(engine.as_ref(), n, t, log)?;
    progress.send(100.0);
    Ok(Some(output))
}

/// 读取引擎输出并检查形状.
fn collect(
    engine: &dyn FittingEngine,
    n: usize,
    t: usize,
    log: String,
) -> Result<FitOutput, WorkerFailureCause> {
    let residual = engine.residual()?;
    let fitted_curve = engine.fitted_curve()?;
    let parameters = engine.parameters()?;

    check_shape("residual", &[n], residual.shape())?;
    check_shape("fitted curve", &[n, t], fitted_curve.shape())?;
    check_shape("parameters", &[n, PARAM_COUNT], parameters.shape())?;

    Ok(FitOutput {
        parameters,
        residual,
        fitted_curve,
        log,
    })
}

#[inline]
fn check_shape(
    what: &'static str,
    expected: &[usize],
    found: &[usize],
) -> Result<(), WorkerFailureCause> {
    if expected == found {
        Ok(())
    } else {
        Err(WorkerFailureCause::BadOutput {
            what,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_plan_sizes_sum_to_total() {
        for total in 1..200 {
            for chunks in 1..8 {
                let plan = ChunkPlan::new(total, chunks);
                assert_eq!(plan.sizes().sum::<usize>(), total, "{total} / {chunks}");
                assert_eq!(plan.sizes().len(), plan.steps());
                assert!(plan.sizes().all(|s| s >= 1 && s <= plan.chunk_size()));
            }
        }
    }

    #[test]
    fn test_chunk_plan_rounding() {
        // 4 / 5 = 0.8 -> 1
        assert_eq!(ChunkPlan::new(4, 5).chunk_size(), 1);
        assert_eq!(ChunkPlan::new(4, 5).steps(), 4);
        // 2.5 -> 2 (银行家舍入)
        assert_eq!(ChunkPlan::new(25, 10).chunk_size(), 2);
        assert_eq!(ChunkPlan::new(25, 10).steps(), 13);
        // 13 / 5 = 2.6 -> 3, 余量 1 单独成块.
        let plan = ChunkPlan::new(13, 5);
        assert_eq!(plan.sizes().collect::<Vec<_>>(), [3, 3, 3, 3, 1]);
        assert_eq!(ChunkPlan::new(10_000, 5).sizes().collect::<Vec<_>>(), [2000; 5]);
    }

    #[test]
    fn test_progress_before() {
        let plan = ChunkPlan::new(10, 5);
        let p: Vec<_> = (0..plan.steps()).map(|i| plan.progress_before(i)).collect();
        assert_eq!(p, [None, Some(20.0), Some(40.0), Some(60.0), Some(80.0)]);
    }

    #[test]
    fn test_cancel_token_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}

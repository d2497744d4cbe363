//! 分块派发: 将体素划分为若干互不相交的分区, 每个分区由一个工作线程和一个私有拟合引擎处理.
//!
//! 工作线程之间没有共享可变状态, 仅通过各自的进度通道与消费者通信.
//! 分区内的各块严格顺序处理; 分区之间没有顺序保证, 所有线程结束后再统一汇合.

use std::any::Any;
use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use ndarray::{concatenate, s, Array1, ArrayView1, ArrayView2, Axis};

use crate::engine::{EngineFactory, EngineInput};
use crate::error::{PkError, PkResult, WorkerFailure, WorkerFailureCause};

mod progress;
mod worker;

pub use progress::{progress_channel, Progress, ProgressReceiver, ProgressSender};
pub use worker::{
    run_task, CancelToken, ChunkPlan, FitOutput, FitSettings, FitTask, WorkerOutcome,
};

/// 将 `total` 行划分为至多 `workers` 个连续的, 大小相差不超过 1 的非空区间.
pub fn partition(total: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.clamp(1, total.max(1));
    let (base, extra) = (total / workers, total % workers);
    let mut start = 0;
    (0..workers)
        .map(|i| {
            let len = base + usize::from(i < extra);
            let r = start..start + len;
            start += len;
            r
        })
        .filter(|r| !r.is_empty())
        .collect()
}

/// 按分区构造各工作线程的任务.
///
/// `time_minutes` 为公共时间轴, `voxels` 与 `t10` 逐行对应.
pub fn build_tasks(
    time_minutes: ArrayView1<f64>,
    voxels: ArrayView2<f64>,
    t10: ArrayView1<f64>,
    settings: FitSettings,
    workers: usize,
) -> Vec<FitTask> {
    assert_eq!(voxels.nrows(), t10.len(), "T10 个数与体素个数不一致");
    partition(voxels.nrows(), workers)
        .into_iter()
        .enumerate()
        .map(|(worker_id, rows)| FitTask {
            worker_id,
            input: EngineInput {
                time_minutes: time_minutes.to_owned(),
                voxels: voxels.slice(s![rows.clone(), ..]).to_owned(),
                t10: t10.slice(s![rows]).to_owned(),
            },
            settings,
        })
        .collect()
}

/// 启动所有任务. 每个任务一个线程, 返回运行句柄.
pub fn spawn(tasks: Vec<FitTask>, factory: Arc<dyn EngineFactory>) -> PkResult<RunHandle> {
    let cancel = CancelToken::new();
    let mut workers = Vec::with_capacity(tasks.len());

    for task in tasks {
        let worker_id = task.worker_id;
        let (tx, rx) = progress_channel(worker_id);
        let factory = Arc::clone(&factory);
        let token = cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("pk-worker-{worker_id}"))
            .spawn(move || run_task(task, factory.as_ref(), &tx, &token))
            .map_err(|e| {
                // 已启动的线程在下一个块边界退出.
                cancel.cancel();
                e
            })?;
        workers.push(WorkerSlot {
            worker_id,
            handle,
            progress: rx,
            latest: 0.0,
        });
    }
    debug!("spawned {} pk workers", workers.len());

    Ok(RunHandle { workers, cancel })
}

#[derive(Debug)]
struct WorkerSlot {
    worker_id: usize,
    handle: JoinHandle<WorkerOutcome>,
    progress: ProgressReceiver,
    latest: f64,
}

/// 一次运行中所有工作线程的句柄.
#[derive(Debug)]
pub struct RunHandle {
    workers: Vec<WorkerSlot>,
    cancel: CancelToken,
}

impl RunHandle {
    /// 工作线程个数.
    #[inline]
    pub fn worker_len(&self) -> usize {
        self.workers.len()
    }

    /// 非阻塞轮询. 取走每个线程的最新进度, 返回所有线程的平均完成比例 (`0.0..=1.0`).
    ///
    /// 自上次轮询以来没有任何新进度时返回 `None`.
    pub fn poll_progress(&mut self) -> Option<f64> {
        let mut changed = false;
        for slot in self.workers.iter_mut() {
            if let Some(p) = slot.progress.drain_latest() {
                slot.latest = p.percent;
                changed = true;
            }
        }
        if !changed || self.workers.is_empty() {
            return None;
        }
        let sum: f64 = self.workers.iter().map(|s| s.latest).sum();
        Some(sum / self.workers.len() as f64 / 100.0)
    }

    /// 是否所有工作线程都已结束.
    pub fn is_finished(&self) -> bool {
        self.workers.iter().all(|s| s.handle.is_finished())
    }

    /// 请求所有工作线程在下一个块边界停止.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 获得取消标记的一份拷贝.
    #[inline]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 等待所有工作线程结束, 按工作线程编号顺序返回结果.
    ///
    /// 线程 panic 会被转换为 [`WorkerFailureCause::Panicked`].
    pub fn join(mut self) -> Vec<WorkerOutcome> {
        std::mem::take(&mut self.workers)
            .into_iter()
            .map(|slot| {
                let worker_id = slot.worker_id;
                slot.handle.join().unwrap_or_else(|payload| {
                    let msg = panic_message(payload.as_ref());
                    warn!("pk worker {worker_id} panicked: {msg}");
                    WorkerOutcome::Failed(WorkerFailure {
                        worker_id,
                        cause: WorkerFailureCause::Panicked(msg),
                    })
                })
            })
            .collect()
    }
}

/// 丢弃句柄时取消仍在运行的工作线程, 线程本身不被等待.
impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.workers.is_empty() && !self.is_finished() {
            debug!("run handle dropped, cancelling {} workers", self.workers.len());
            self.cancel.cancel();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 所有分区的合并输出.
#[derive(Clone, Debug)]
pub struct MergedOutput {
    /// 按分区顺序拼接的结果.
    pub output: FitOutput,

    /// 参与合并的工作线程数.
    pub workers: usize,
}

/// 合并所有工作线程的结果.
///
/// 只要有一个线程失败就返回第一个失败 (按编号); 没有失败但有被取消的线程时返回
/// [`PkError::Cancelled`]. 部分结果会被丢弃.
pub fn merge(mut outcomes: Vec<WorkerOutcome>) -> PkResult<MergedOutput> {
    outcomes.sort_by_key(WorkerOutcome::worker_id);

    let mut outputs = Vec::with_capacity(outcomes.len());
    let mut cancelled = false;
    for outcome in outcomes {
        match outcome {
            WorkerOutcome::Succeeded { output, .. } => outputs.push(output),
            WorkerOutcome::Failed(f) => return Err(PkError::Worker(f)),
            WorkerOutcome::Cancelled { .. } => cancelled = true,
        }
    }
    if cancelled {
        return Err(PkError::Cancelled);
    }
    if outputs.is_empty() {
        return Err(PkError::EmptySelection);
    }

    let workers = outputs.len();
    if workers == 1 {
        if let Some(output) = outputs.pop() {
            return Ok(MergedOutput { output, workers });
        }
    }

    let params: Vec<_> = outputs.iter().map(|o| o.parameters.view()).collect();
    let residuals: Vec<_> = outputs.iter().map(|o| o.residual.view()).collect();
    let curves: Vec<_> = outputs.iter().map(|o| o.fitted_curve.view()).collect();
    let shape_err = |e: ndarray::ShapeError| PkError::InvalidOption {
        name: "workers",
        reason: format!("cannot merge worker outputs: {e}"),
    };

    let output = FitOutput {
        parameters: concatenate(Axis(0), &params).map_err(shape_err)?,
        residual: concatenate(Axis(0), &residuals).map_err(shape_err)?,
        fitted_curve: concatenate(Axis(0), &curves).map_err(shape_err)?,
        log: outputs.iter().map(|o| o.log.as_str()).collect(),
    };
    Ok(MergedOutput { output, workers })
}

/// 构造以分钟为单位的采样时间轴: `i * dt / 60`.
pub fn time_axis_minutes(time_points: usize, sampling_interval: f64) -> Array1<f64> {
    Array1::from_shape_fn(time_points, |i| i as f64 * sampling_interval / 60.0)
}

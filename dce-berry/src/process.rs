//! PK 建模流程: 选取体素, 归一化, 派发拟合任务, 汇合并重建参数图.
//!
//! 一次运行的生命周期:
//!
//! ```text
//! Idle --start--> Running --finish--> Succeeded | Failed | Cancelled
//! ```
//!
//! 配置类错误在 `start` 中同步返回, 此时不会启动任何工作线程.
//! 只有全部工作线程成功时 `finish` 才会向数据存储写入结果.

use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use ndarray::Array1;

use crate::config::{RunConfig, RunOptions};
use crate::consts::names;
use crate::data::{roi_to_mask, select_voxels, VoxelSelection};
use crate::dispatch::{self, build_tasks, time_axis_minutes, FitTask, RunHandle};
use crate::engine::EngineFactory;
use crate::error::{PkError, PkResult};
use crate::normalize::normalize;
use crate::reconstruct::{reconstruct, ParameterMaps, ThresholdConfig};
use crate::store::DataStore;

/// 流程状态.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum ProcessStatus {
    /// 尚未运行.
    #[default]
    Idle,

    /// 工作线程运行中.
    Running,

    /// 上一次运行成功, 结果已写入.
    Succeeded,

    /// 上一次运行失败.
    Failed,

    /// 上一次运行被取消.
    Cancelled,
}

/// 派发前准备好的全部输入.
#[derive(Debug)]
pub struct Prepared {
    /// 选区.
    pub selection: VoxelSelection,

    /// 逐体素基线.
    pub baseline: Array1<f64>,

    /// 各工作线程任务.
    pub tasks: Vec<FitTask>,

    /// 归一化日志.
    pub log: String,
}

/// 在派发之前完成所有同步检查与数据准备.
///
/// # 错误
///
/// 1. 没有主数据: [`PkError::NoMainData`];
/// 2. 指定的 ROI 不存在: [`PkError::RoiNotFound`];
/// 3. T10 图不存在: [`PkError::DataNotFound`];
/// 4. 维度, 形状或空选区错误见 [`select_voxels`].
pub fn prepare<S: DataStore + ?Sized>(store: &S, config: &RunConfig) -> PkResult<Prepared> {
    let main = store.main_data().ok_or(PkError::NoMainData)?;
    let roi = match config.roi.as_deref() {
        Some(name) => Some(
            store
                .roi(name)
                .ok_or_else(|| PkError::RoiNotFound(name.to_string()))?,
        ),
        None => store.current_roi(),
    };
    let mask = roi.map(roi_to_mask);

    let selection = select_voxels(main, mask.as_ref().map(|m| m.view()))?;
    debug!(
        "selected {} of {} voxels",
        selection.len(),
        selection.mask().len()
    );

    let t10 = store
        .data(&config.t10)
        .ok_or_else(|| PkError::DataNotFound(config.t10.clone()))?;
    let t10 = selection.gather(t10)?;

    let norm = normalize(
        selection.voxels(),
        config.injection_time,
        config.sampling_interval,
    );
    let time = time_axis_minutes(selection.time_points(), config.sampling_interval);
    let tasks = build_tasks(
        time.view(),
        norm.enhancement.view(),
        t10.view(),
        config.fit_settings(),
        config.workers,
    );

    Ok(Prepared {
        selection,
        baseline: norm.baseline,
        tasks,
        log: norm.log,
    })
}

#[derive(Debug)]
struct ActiveRun {
    selection: VoxelSelection,
    baseline: Array1<f64>,
    config: RunConfig,
    handle: RunHandle,
}

/// PK 建模流程.
#[derive(Debug, Default)]
pub struct PkModellingProcess {
    status: ProcessStatus,
    log: String,
    active: Option<ActiveRun>,
}

impl PkModellingProcess {
    /// 新建空闲流程.
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前状态.
    #[inline]
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// 累积的运行日志.
    #[inline]
    pub fn log(&self) -> &str {
        &self.log
    }

    /// 检查选项, 准备数据并启动工作线程.
    ///
    /// 出错时状态置为 [`ProcessStatus::Failed`], 不会启动任何线程.
    pub fn start<S: DataStore + ?Sized>(
        &mut self,
        store: &S,
        options: &RunOptions,
        factory: Arc<dyn EngineFactory>,
    ) -> PkResult<()> {
        if self.status == ProcessStatus::Running {
            return Err(PkError::InvalidState("start"));
        }
        self.log.clear();

        match Self::launch(store, options, factory) {
            Ok((run, log)) => {
                info!(
                    "pk modelling started: {} voxels, {} workers, model `{}`",
                    run.selection.len(),
                    run.handle.worker_len(),
                    run.config.model
                );
                self.log.push_str(&log);
                self.active = Some(run);
                self.status = ProcessStatus::Running;
                Ok(())
            }
            Err(e) => {
                error!("pk modelling not started: {e}");
                self.status = ProcessStatus::Failed;
                Err(e)
            }
        }
    }

    fn launch<S: DataStore + ?Sized>(
        store: &S,
        options: &RunOptions,
        factory: Arc<dyn EngineFactory>,
    ) -> PkResult<(ActiveRun, String)> {
        let config = options.validate()?;
        let Prepared {
            selection,
            baseline,
            tasks,
            log,
        } = prepare(store, &config)?;
        let handle = dispatch::spawn(tasks, factory)?;
        Ok((
            ActiveRun {
                selection,
                baseline,
                config,
                handle,
            },
            log,
        ))
    }

    /// 非阻塞地获取所有工作线程的平均进度 (`0.0..=1.0`). 没有新进度时返回 `None`.
    pub fn poll_progress(&mut self) -> Option<f64> {
        self.active.as_mut()?.handle.poll_progress()
    }

    /// 是否所有工作线程都已结束. 没有运行时返回 `true`.
    pub fn is_finished(&self) -> bool {
        self.active.as_ref().map_or(true, |r| r.handle.is_finished())
    }

    /// 请求所有工作线程在下一个块边界停止. 之后仍需调用 [`Self::finish`].
    pub fn cancel(&self) {
        if let Some(run) = self.active.as_ref() {
            warn!("pk modelling cancel requested");
            run.handle.cancel();
        }
    }

    /// 等待所有工作线程结束, 合并并重建结果.
    ///
    /// 全部成功时将 6 个输出写入 `store` (Ktrans 成为当前数据); 否则不写入任何内容.
    pub fn finish<S: DataStore + ?Sized>(&mut self, store: &mut S) -> PkResult<ParameterMaps> {
        let run = self.active.take().ok_or(PkError::InvalidState("finish"))?;
        let ActiveRun {
            selection,
            baseline,
            config,
            handle,
        } = run;

        let result = dispatch::merge(handle.join()).map(|merged| {
            self.log.push_str(&merged.output.log);
            let maps = reconstruct(
                &selection,
                merged.output.parameters.view(),
                merged.output.residual.view(),
                merged.output.fitted_curve.view(),
                baseline.view(),
                ThresholdConfig {
                    percentile: config.threshold_percentile,
                },
            );
            publish(store, &maps, &config);
            maps
        });

        self.status = match &result {
            Ok(_) => ProcessStatus::Succeeded,
            Err(PkError::Cancelled) => ProcessStatus::Cancelled,
            Err(_) => ProcessStatus::Failed,
        };
        match &result {
            Ok(maps) => info!(
                "pk modelling finished: ktrans threshold {:.4}, kep threshold {:.4}",
                maps.ktrans_threshold, maps.kep_threshold
            ),
            Err(e) => error!("pk modelling failed: {e}"),
        }
        result
    }

    /// 启动并阻塞等待运行结束. 每次有新进度时调用 `on_progress`.
    pub fn run_blocking<S, F>(
        &mut self,
        store: &mut S,
        options: &RunOptions,
        factory: Arc<dyn EngineFactory>,
        mut on_progress: F,
    ) -> PkResult<ParameterMaps>
    where
        S: DataStore + ?Sized,
        F: FnMut(f64),
    {
        self.start(&*store, options, factory)?;
        let interval = self
            .active
            .as_ref()
            .map(|r| r.config.poll_interval)
            .unwrap_or_default();

        loop {
            let finished = self.is_finished();
            if let Some(p) = self.poll_progress() {
                on_progress(p);
            }
            if finished {
                break;
            }
            thread::sleep(interval);
        }
        self.finish(store)
    }
}

/// 将参数图写入数据存储.
fn publish<S: DataStore + ?Sized>(store: &mut S, maps: &ParameterMaps, config: &RunConfig) {
    let volumes = [
        (names::KTRANS, &maps.ktrans),
        (names::VE, &maps.ve),
        (names::KEP, &maps.kep),
        (names::OFFSET, &maps.offset),
        (names::VP, &maps.vp),
    ];
    for (base, vol) in volumes {
        let make_current = base == names::KTRANS;
        store.add_data(vol.clone().into_dyn(), &config.output_name(base), make_current);
    }
    store.add_data(
        maps.model_curves.clone().into_dyn(),
        &config.output_name(names::MODEL_CURVES),
        false,
    );
}

//! 基线归一化: 将原始信号转换为相对增强曲线.

use log::debug;
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::consts::EPSILON;

/// 归一化结果. 基线在本次运行期间固定不变, 重建时需要用它还原信号.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// 参与基线计算的前导时间点个数 K.
    pub baseline_points: usize,

    /// 逐体素基线, 长度为 N.
    pub baseline: Array1<f64>,

    /// 增强曲线 `raw / (baseline + ε) - 1`, 形状为 (N, T).
    pub enhancement: Array2<f64>,

    /// 面向用户的日志信息.
    pub log: String,
}

/// 基线时间点个数 `K = 1 + floor(tinj / dt)`, 并截断到 `[1, time_points]`.
///
/// `dt` 必须为正.
pub fn baseline_points(injection_time: f64, sampling_interval: f64, time_points: usize) -> usize {
    debug_assert!(sampling_interval > 0.0);
    let k = 1 + (injection_time / sampling_interval).floor().max(0.0) as usize;
    k.clamp(1, time_points.max(1))
}

/// 对每一行求前 `k` 列的均值.
pub fn baseline(voxels: ArrayView2<f64>, k: usize) -> Array1<f64> {
    voxels.slice(s![.., ..k]).sum_axis(Axis(1)) / k as f64
}

/// 按 `baseline` 逐行归一化 `voxels`: `v / (b + ε) - 1`.
pub fn enhancement(voxels: ArrayView2<f64>, baseline: ArrayView1<f64>) -> Array2<f64> {
    assert_eq!(voxels.nrows(), baseline.len(), "基线个数与体素个数不一致");
    let mut out = voxels.to_owned();

    let zip = Zip::from(out.rows_mut()).and(&baseline);
    #[cfg(feature = "rayon")]
    zip.par_for_each(|mut row, &b| row.mapv_inplace(|v| v / (b + EPSILON) - 1.0));
    #[cfg(not(feature = "rayon"))]
    zip.for_each(|mut row, &b| row.mapv_inplace(|v| v / (b + EPSILON) - 1.0));
    out
}

/// 完整的归一化流程: 计算 K 和基线, 生成增强曲线.
pub fn normalize(
    voxels: ArrayView2<f64>,
    injection_time: f64,
    sampling_interval: f64,
) -> Normalized {
    let k = baseline_points(injection_time, sampling_interval, voxels.ncols());
    debug!("baseline normalisation over {k} leading time points");
    let log = format!("First {k} time points used for baseline normalisation\n");

    let baseline = baseline(voxels, k);
    let enhancement = enhancement(voxels, baseline.view());
    Normalized {
        baseline_points: k,
        baseline,
        enhancement,
        log,
    }
}

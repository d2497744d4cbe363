//! 结果重建: 把原始拟合输出映射回完整体空间, 并施加生理学截断, 派生参数和百分位阈值.

use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, Zip};
use ordered_float::OrderedFloat;

use crate::consts::{ParamColumn, EPSILON, PARAM_CLAMP, PARAM_COUNT};
use crate::data::VoxelSelection;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::slice::ParallelSliceMut;
    }
}

/// 上截断: `v < limit` 时保留原值, 否则 (包括 NaN) 为 `limit`.
#[inline]
pub fn clamp_upper(v: f64, limit: f64) -> f64 {
    if v < limit {
        v
    } else {
        limit
    }
}

/// 由已截断的 Ktrans 和 ve 计算 kep.
///
/// `Ktrans / (ve + ε)`, NaN 或无穷置 0, 负值置 0, 再上截断到 2.0.
#[inline]
pub fn kep(ktrans: f64, ve: f64) -> f64 {
    let k = ktrans / (ve + EPSILON);
    let k = if k.is_finite() { k.max(0.0) } else { 0.0 };
    clamp_upper(k, PARAM_CLAMP)
}

/// 线性插值百分位数, 与常见数值库的默认算法一致.
///
/// `q` 取值 `0.0..=100.0`. `values` 为空时返回 `None`.
pub fn percentile<'a, I>(values: I, q: f64) -> Option<f64>
where
    I: IntoIterator<Item = &'a f64>,
{
    let mut v: Vec<OrderedFloat<f64>> = values.into_iter().copied().map(OrderedFloat).collect();
    if v.is_empty() {
        return None;
    }
    #[cfg(feature = "rayon")]
    v.par_sort_unstable();
    #[cfg(not(feature = "rayon"))]
    v.sort_unstable();

    let rank = q.clamp(0.0, 100.0) / 100.0 * (v.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let (a, b) = (v[lo].0, v[hi].0);
    let frac = rank - lo as f64;
    if lo == hi || a == b {
        return Some(a);
    }
    // 端点为无穷时插值没有意义, 取较近的端点.
    if !a.is_finite() || !b.is_finite() {
        return Some(if frac < 0.5 { a } else { b });
    }
    Some(a + (b - a) * frac)
}

/// 将 `volume` 中大于其第 `q` 百分位数的值截断为该百分位数. 返回阈值.
pub fn threshold_at_percentile(volume: &mut Array3<f64>, q: f64) -> Option<f64> {
    let p = percentile(volume.iter(), q)?;
    volume.mapv_inplace(|v| if v > p { p } else { v });
    Some(p)
}

/// 重建使用的阈值配置.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ThresholdConfig {
    /// Ktrans 与 kep 的离群百分位, `0.0..=100.0`.
    pub percentile: f64,
}

/// 重建得到的所有参数图.
#[derive(Debug, Clone)]
pub struct ParameterMaps {
    /// Ktrans, 已截断并施加百分位阈值.
    pub ktrans: Array3<f64>,

    /// ve, `0.0..=2.0`.
    pub ve: Array3<f64>,

    /// kep, 已截断并施加百分位阈值.
    pub kep: Array3<f64>,

    /// offset, 不截断.
    pub offset: Array3<f64>,

    /// vp, 不截断.
    pub vp: Array3<f64>,

    /// 还原到原始信号尺度的模型曲线, 4D.
    pub model_curves: Array4<f64>,

    /// 拟合残差. 不发布到数据存储.
    pub residual: Array3<f64>,

    /// Ktrans 实际使用的百分位阈值.
    pub ktrans_threshold: f64,

    /// kep 实际使用的百分位阈值.
    pub kep_threshold: f64,
}

/// 把增强曲线还原为信号: `(curve + 1) * baseline`.
pub fn restore_signal(curves: ArrayView2<f64>, baseline: ArrayView1<f64>) -> Array2<f64> {
    assert_eq!(curves.nrows(), baseline.len(), "基线个数与曲线个数不一致");
    let mut out = curves.to_owned();
    let zip = Zip::from(out.rows_mut()).and(&baseline);
    #[cfg(feature = "rayon")]
    zip.par_for_each(|mut row, &b| row.mapv_inplace(|v| (v + 1.0) * b));
    #[cfg(not(feature = "rayon"))]
    zip.for_each(|mut row, &b| row.mapv_inplace(|v| (v + 1.0) * b));
    out
}

/// 由原始拟合输出重建参数图.
///
/// `parameters` 形状为 (N, 4), `residual` 长度为 N, `fitted_curve` 形状为 (N, T),
/// `baseline` 长度为 N, 均与 `selection` 的行一一对应. 形状不符时程序 panic.
pub fn reconstruct(
    selection: &VoxelSelection,
    parameters: ArrayView2<f64>,
    residual: ArrayView1<f64>,
    fitted_curve: ArrayView2<f64>,
    baseline: ArrayView1<f64>,
    config: ThresholdConfig,
) -> ParameterMaps {
    assert_eq!(parameters.dim(), (selection.len(), PARAM_COUNT), "参数矩阵形状不符");

    let column = |c: ParamColumn| parameters.column(c.index());
    let ktrans: Array1<f64> = column(ParamColumn::Ktrans).mapv(|v| clamp_upper(v, PARAM_CLAMP));
    let ve: Array1<f64> = column(ParamColumn::Ve).mapv(|v| clamp_upper(v, PARAM_CLAMP).max(0.0));

    let mut ktrans = selection.scatter(ktrans.view());
    let ve = selection.scatter(ve.view());
    // 掩膜外 0 / (0 + ε) = 0, 可以直接在整个体上计算.
    let mut kep = Zip::from(&ktrans).and(&ve).map_collect(|&k, &v| kep(k, v));

    let offset = selection.scatter(column(ParamColumn::Offset));
    let vp = selection.scatter(column(ParamColumn::Vp));
    let residual = selection.scatter(residual);

    let signal = restore_signal(fitted_curve, baseline);
    let model_curves = selection.scatter_curves(signal.view());

    // 体非空, 百分位数总是存在.
    let ktrans_threshold = threshold_at_percentile(&mut ktrans, config.percentile).unwrap_or(0.0);
    let kep_threshold = threshold_at_percentile(&mut kep, config.percentile).unwrap_or(0.0);

    ParameterMaps {
        ktrans,
        ve,
        kep,
        offset,
        vp,
        model_curves,
        residual,
        ktrans_threshold,
        kep_threshold,
    }
}

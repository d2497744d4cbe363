//! 体素选取 (向量化) 与逆映射.
//!
//! 4D 体数据按 `(x, y, z, t)` 组织. 选取的体素按空间轴的行优先线性下标升序排列,
//! 该顺序是平铺表示与体表示之间所有下标对应关系的唯一依据,
//! 选取和重建必须使用同一份 [`VoxelSelection`].

use itertools::Itertools;
use ndarray::{Array1, Array2, Array3, Array4, ArrayView1, ArrayView2, ArrayView3, ArrayViewD, Axis, Ix3, Ix4};

use crate::error::{PkError, PkResult};
use crate::Idx3d;

/// 从 4D 体数据中选出的体素集合, 以及回到体空间所需的掩膜信息.
#[derive(Debug, Clone)]
pub struct VoxelSelection {
    shape: Idx3d,
    time_points: usize,
    mask: Vec<bool>,
    positions: Vec<usize>,
    voxels: Array2<f64>,
}

/// 将整数 ROI 转换为布尔掩膜. 非零即选中.
#[inline]
pub fn roi_to_mask(roi: ArrayView3<u8>) -> Array3<bool> {
    roi.mapv(|v| v != 0)
}

/// 从 4D 体数据 `volume` 中选出 `mask` 为 `true` 的体素.
///
/// `mask` 为 `None` 时选中所有体素.
///
/// # 错误
///
/// 1. `volume` 不是 4D 时返回 [`PkError::EmptyInput`];
/// 2. 时间轴长度为 0 时返回 [`PkError::NoTimePoints`];
/// 3. `mask` 与 `volume` 的空间形状不一致时返回 [`PkError::ShapeMismatch`];
/// 4. 没有任何体素被选中时返回 [`PkError::EmptySelection`].
pub fn select_voxels(
    volume: ArrayViewD<f64>,
    mask: Option<ArrayView3<bool>>,
) -> PkResult<VoxelSelection> {
    let ndim = volume.ndim();
    let volume = volume
        .into_dimensionality::<Ix4>()
        .map_err(|_| PkError::EmptyInput { ndim })?;
    let (x, y, z, t) = volume.dim();
    if t == 0 {
        return Err(PkError::NoTimePoints);
    }
    let shape = (x, y, z);

    let mask: Vec<bool> = match mask {
        Some(m) => {
            if m.dim() != shape {
                return Err(PkError::ShapeMismatch {
                    expected: vec![x, y, z],
                    found: m.shape().to_vec(),
                });
            }
            // `iter` 按逻辑行优先序遍历, 与内存布局无关.
            m.iter().copied().collect()
        }
        None => vec![true; x * y * z],
    };

    let positions: Vec<usize> = mask.iter().positions(|&m| m).collect();
    if positions.is_empty() {
        return Err(PkError::EmptySelection);
    }

    let mut voxels = Array2::<f64>::zeros((positions.len(), t));
    let selected = volume
        .lanes(Axis(3))
        .into_iter()
        .zip(mask.iter())
        .filter_map(|(lane, &m)| m.then_some(lane));
    for (mut row, lane) in voxels.rows_mut().into_iter().zip(selected) {
        row.assign(&lane);
    }

    Ok(VoxelSelection {
        shape,
        time_points: t,
        mask,
        positions,
        voxels,
    })
}

impl VoxelSelection {
    /// 选中的体素个数 N.
    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// 是否为空. 由构造保证总是 `false`.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// 空间形状 `(x, y, z)`.
    #[inline]
    pub fn shape(&self) -> Idx3d {
        self.shape
    }

    /// 时间点个数 T.
    #[inline]
    pub fn time_points(&self) -> usize {
        self.time_points
    }

    /// 平铺后的掩膜, 长度为 `x * y * z`.
    #[inline]
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// 选中体素的行优先线性下标, 严格升序.
    #[inline]
    pub fn positions(&self) -> &[usize] {
        &self.positions
    }

    /// 体素信号矩阵, 形状为 (N, T).
    #[inline]
    pub fn voxels(&self) -> ArrayView2<'_, f64> {
        self.voxels.view()
    }

    /// 按同一掩膜从 3D 数据 (如 T10 图) 中取出对应体素值.
    ///
    /// 如果 `data` 不是与本选区空间形状一致的 3D 数组, 返回 [`PkError::ShapeMismatch`].
    pub fn gather(&self, data: ArrayViewD<f64>) -> PkResult<Array1<f64>> {
        let (x, y, z) = self.shape;
        let found = data.shape().to_vec();
        let data = data
            .into_dimensionality::<Ix3>()
            .ok()
            .filter(|d| d.dim() == self.shape)
            .ok_or_else(|| PkError::ShapeMismatch {
                expected: vec![x, y, z],
                found,
            })?;

        Ok(data
            .iter()
            .zip(self.mask.iter())
            .filter_map(|(&v, &m)| m.then_some(v))
            .collect())
    }

    /// 将长度为 N 的逐体素值散布回完整的空间形状. 掩膜外的位置为 0.
    ///
    /// `values` 长度必须为 N, 否则程序 panic.
    pub fn scatter(&self, values: ArrayView1<f64>) -> Array3<f64> {
        assert_eq!(values.len(), self.len(), "逐体素值个数与选区不一致");
        let mut out = Array3::<f64>::zeros(self.shape);
        out.iter_mut()
            .zip(self.mask.iter())
            .filter_map(|(o, &m)| m.then_some(o))
            .zip(values.iter())
            .for_each(|(o, &v)| *o = v);
        out
    }

    /// 将形状为 (N, T) 的逐体素曲线散布回完整的 4D 形状. 掩膜外的曲线全为 0.
    ///
    /// `curves` 形状必须为 (N, T), 否则程序 panic.
    pub fn scatter_curves(&self, curves: ArrayView2<f64>) -> Array4<f64> {
        assert_eq!(curves.dim(), (self.len(), self.time_points), "曲线形状与选区不一致");
        let (x, y, z) = self.shape;
        let mut out = Array4::<f64>::zeros((x, y, z, self.time_points));
        let lanes = out
            .lanes_mut(Axis(3))
            .into_iter()
            .zip(self.mask.iter())
            .filter_map(|(lane, &m)| m.then_some(lane));
        for (mut lane, row) in lanes.zip(curves.rows()) {
            lane.assign(&row);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn ramp_volume(shape: (usize, usize, usize, usize)) -> Array4<f64> {
        Array4::from_shape_fn(shape, |(i, j, k, l)| {
            (i * 1000 + j * 100 + k * 10 + l) as f64
        })
    }

    #[test]
    fn test_rejects_non_4d() {
        let v = Array::<f64, _>::zeros(IxDyn(&[2, 2, 2]));
        let err = select_voxels(v.view(), None).unwrap_err();
        assert!(matches!(err, PkError::EmptyInput { ndim: 3 }));
    }

    #[test]
    fn test_rejects_empty_time_axis() {
        let v = Array::<f64, _>::zeros(IxDyn(&[2, 2, 1, 0]));
        let err = select_voxels(v.view(), None).unwrap_err();
        assert!(matches!(err, PkError::NoTimePoints));
    }

    #[test]
    fn test_rejects_empty_selection() {
        let v = ramp_volume((2, 2, 1, 3)).into_dyn();
        let mask = Array3::from_elem((2, 2, 1), false);
        let err = select_voxels(v.view(), Some(mask.view())).unwrap_err();
        assert!(matches!(err, PkError::EmptySelection));
    }

    #[test]
    fn test_rejects_mask_shape_mismatch() {
        let v = ramp_volume((2, 2, 1, 3)).into_dyn();
        let mask = Array3::from_elem((2, 1, 1), true);
        let err = select_voxels(v.view(), Some(mask.view())).unwrap_err();
        assert!(matches!(err, PkError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_row_order_follows_flat_index() {
        let v = ramp_volume((2, 3, 2, 4));
        let mask = Array3::from_shape_fn((2, 3, 2), |(i, j, k)| (i + j + k) % 2 == 0);
        let sel = select_voxels(v.view().into_dyn(), Some(mask.view())).unwrap();

        assert_eq!(sel.len(), mask.iter().filter(|m| **m).count());
        assert!(sel.positions().windows(2).all(|w| w[0] < w[1]));

        for (row, &p) in sel.voxels().rows().into_iter().zip(sel.positions()) {
            let (i, j, k) = (p / 6, (p / 2) % 3, p % 2);
            assert!(mask[(i, j, k)]);
            assert_eq!(row, v.slice(ndarray::s![i, j, k, ..]));
        }
    }

    #[test]
    fn test_scatter_gather_round_trip() {
        let v = ramp_volume((3, 2, 2, 5));
        let mask = Array3::from_shape_fn((3, 2, 2), |(i, j, _)| i != j);
        let sel = select_voxels(v.view().into_dyn(), Some(mask.view())).unwrap();

        let curves = sel.scatter_curves(sel.voxels());
        for ((idx, &m), lane) in mask.indexed_iter().zip(curves.lanes(Axis(3))) {
            let (i, j, k) = idx;
            if m {
                assert_eq!(lane, v.slice(ndarray::s![i, j, k, ..]));
            } else {
                assert!(lane.iter().all(|x| *x == 0.0));
            }
        }

        let first = v.index_axis(Axis(3), 0).to_owned();
        let gathered = sel.gather(first.view().into_dyn()).unwrap();
        let back = sel.scatter(gathered.view());
        for (idx, &m) in mask.indexed_iter() {
            let expected = if m { first[idx] } else { 0.0 };
            assert_eq!(back[idx], expected);
        }
    }

    #[test]
    fn test_default_mask_selects_all() {
        let v = ramp_volume((2, 2, 2, 2)).into_dyn();
        let sel = select_voxels(v.view(), None).unwrap();
        assert_eq!(sel.len(), 8);
        assert_eq!(sel.positions(), &[0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_roi_to_mask() {
        let roi = Array3::from_shape_vec((1, 2, 2), vec![0u8, 1, 2, 0]).unwrap();
        let mask = roi_to_mask(roi.view());
        assert_eq!(mask.iter().copied().collect::<Vec<_>>(), [false, true, true, false]);
    }
}

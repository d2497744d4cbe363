//! 通用常量.

/// 基线归一化与 kep 计算中防止除零的加性项.
pub const EPSILON: f64 = 0.001;

/// Ktrans, ve 和 kep 的生理学上限. 超过该值的估计会被截断为该值.
pub const PARAM_CLAMP: f64 = 2.0;

/// 默认将体素列表划分为多少个顺序执行的块.
pub const DEFAULT_CHUNKS: usize = 5;

/// 默认工作线程数.
pub const DEFAULT_WORKERS: usize = 1;

/// 进度轮询的默认间隔, 以毫秒为单位.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// 默认的辅助 T1 图 (T10) 数据名.
pub const DEFAULT_T10_NAME: &str = "T10";

/// 拟合参数数量: Ktrans, ve, offset, vp.
pub const PARAM_COUNT: usize = 4;

/// 拟合参数上界, 依次为 Ktrans, ve, offset, vp.
pub const DEFAULT_UPPER_BOUNDS: [f64; PARAM_COUNT] = [10.0, 1.0, 0.5, 0.5];

/// 拟合参数下界, 依次为 Ktrans, ve, offset, vp.
pub const DEFAULT_LOWER_BOUNDS: [f64; PARAM_COUNT] = [0.0, 0.05, -0.5, 0.0];

/// 工作线程开始时发出的第一个进度值 (百分比).
pub const START_PROGRESS: f64 = 1.0;

/// 输出数据名.
pub mod names {
    /// Ktrans 参数图.
    pub const KTRANS: &str = "ktrans";

    /// ve 参数图.
    pub const VE: &str = "ve";

    /// kep 参数图.
    pub const KEP: &str = "kep";

    /// offset 参数图.
    pub const OFFSET: &str = "offset";

    /// vp 参数图.
    pub const VP: &str = "vp";

    /// 重建后的模型信号曲线 (4D).
    pub const MODEL_CURVES: &str = "model_curves";

    /// 按给定后缀拼接输出名. 后缀为空时原样返回 `base`.
    #[inline]
    pub fn with_suffix(base: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            base.to_string()
        } else {
            format!("{base}_{suffix}")
        }
    }
}

/// 拟合参数矩阵的列.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParamColumn {
    /// 血浆到组织的转运速率.
    Ktrans = 0,

    /// 血管外细胞外间隙体积分数.
    Ve = 1,

    /// 时间曲线基线偏移.
    Offset = 2,

    /// 血浆体积分数.
    Vp = 3,
}

impl ParamColumn {
    /// 列下标.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::names::*;

    #[test]
    fn test_with_suffix() {
        assert_eq!(with_suffix(KTRANS, ""), "ktrans");
        assert_eq!(with_suffix(MODEL_CURVES, "run2"), "model_curves_run2");
    }
}

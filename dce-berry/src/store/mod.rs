//! 数据存储: 主 4D 数据, 命名的辅助数据与 ROI.

use std::collections::BTreeMap;

use ndarray::{Array3, ArrayD, ArrayView3, ArrayViewD};

mod npz;

pub use npz::{load_npz, save_npz};

/// 建模流程读写的数据存储.
///
/// 数据按名称索引. 主数据是 PK 建模的输入, ROI 为整数标签体, 非零即选中.
pub trait DataStore {
    /// 主数据.
    fn main_data(&self) -> Option<ArrayViewD<'_, f64>>;

    /// 按名称获取 ROI.
    fn roi(&self, name: &str) -> Option<ArrayView3<'_, u8>>;

    /// 当前 ROI.
    fn current_roi(&self) -> Option<ArrayView3<'_, u8>>;

    /// 按名称获取数据.
    fn data(&self, name: &str) -> Option<ArrayViewD<'_, f64>>;

    /// 写入数据 `name`. 同名数据会被替换. `make_current` 为 `true` 时将其设为当前数据.
    fn add_data(&mut self, data: ArrayD<f64>, name: &str, make_current: bool);
}

/// 内存中的数据存储.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: BTreeMap<String, ArrayD<f64>>,
    rois: BTreeMap<String, Array3<u8>>,
    main: Option<String>,
    current_data: Option<String>,
    current_roi: Option<String>,
}

impl MemoryStore {
    /// 新建空存储.
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入数据 `name` 并将其设为主数据.
    pub fn set_main(&mut self, data: ArrayD<f64>, name: &str) {
        self.data.insert(name.to_string(), data);
        self.main = Some(name.to_string());
    }

    /// 写入 ROI `name`. `make_current` 为 `true` 时将其设为当前 ROI.
    pub fn add_roi(&mut self, roi: Array3<u8>, name: &str, make_current: bool) {
        self.rois.insert(name.to_string(), roi);
        if make_current {
            self.current_roi = Some(name.to_string());
        }
    }

    /// 主数据名.
    #[inline]
    pub fn main_name(&self) -> Option<&str> {
        self.main.as_deref()
    }

    /// 当前数据名.
    #[inline]
    pub fn current_data_name(&self) -> Option<&str> {
        self.current_data.as_deref()
    }

    /// 当前 ROI 名.
    #[inline]
    pub fn current_roi_name(&self) -> Option<&str> {
        self.current_roi.as_deref()
    }

    /// 所有数据名, 按字典序.
    pub fn data_names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    /// 所有 ROI 名, 按字典序.
    pub fn roi_names(&self) -> impl Iterator<Item = &str> {
        self.rois.keys().map(String::as_str)
    }

    /// 数据个数 (不含 ROI).
    #[inline]
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// 移除数据 `name`, 返回被移除的数组.
    pub fn remove_data(&mut self, name: &str) -> Option<ArrayD<f64>> {
        let removed = self.data.remove(name)?;
        if self.main.as_deref() == Some(name) {
            self.main = None;
        }
        if self.current_data.as_deref() == Some(name) {
            self.current_data = None;
        }
        Some(removed)
    }
}

impl DataStore for MemoryStore {
    fn main_data(&self) -> Option<ArrayViewD<'_, f64>> {
        self.main.as_deref().and_then(|name| self.data(name))
    }

    fn roi(&self, name: &str) -> Option<ArrayView3<'_, u8>> {
        self.rois.get(name).map(|r| r.view())
    }

    fn current_roi(&self) -> Option<ArrayView3<'_, u8>> {
        self.current_roi.as_deref().and_then(|name| self.roi(name))
    }

    fn data(&self, name: &str) -> Option<ArrayViewD<'_, f64>> {
        self.data.get(name).map(|d| d.view())
    }

    fn add_data(&mut self, data: ArrayD<f64>, name: &str, make_current: bool) {
        self.data.insert(name.to_string(), data);
        if make_current {
            self.current_data = Some(name.to_string());
        }
    }
}

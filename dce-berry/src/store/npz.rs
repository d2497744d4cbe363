//! npz 归档读写. 归档中的数组名决定其在存储中的角色.

use std::fs::File;
use std::path::Path;

use log::{debug, info};
use ndarray::{Ix3, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};

use super::{DataStore, MemoryStore};
use crate::error::{PkError, PkResult};

/// 名称以此开头的数组作为 ROI 读取.
pub const ROI_PREFIX: &str = "roi";

/// 作为主数据读取的数组名.
pub const MAIN_NAME: &str = "main";

fn strip_npy(name: &str) -> &str {
    name.strip_suffix(".npy").unwrap_or(name)
}

/// 从 npz 归档读取数据存储.
///
/// 名称以 `roi` 开头的数组按 `u8` 3D 标签读取, 第一个 ROI 成为当前 ROI;
/// 名为 `main` 的数组成为主数据; 其余数组按 `f64` 读取.
pub fn load_npz<P: AsRef<Path>>(path: P) -> PkResult<MemoryStore> {
    let file = File::open(path.as_ref())?;
    let mut npz = NpzReader::new(file)?;
    let mut store = MemoryStore::new();

    for entry in npz.names()? {
        let name = strip_npy(&entry).to_string();
        if name.starts_with(ROI_PREFIX) {
            let roi = npz.by_name::<OwnedRepr<u8>, Ix3>(&entry)?;
            let make_current = store.current_roi_name().is_none();
            store.add_roi(roi, &name, make_current);
        } else {
            let data = npz.by_name::<OwnedRepr<f64>, IxDyn>(&entry)?;
            if name == MAIN_NAME {
                store.set_main(data, &name);
            } else {
                store.add_data(data, &name, false);
            }
        }
        debug!("loaded `{name}` from {}", path.as_ref().display());
    }
    info!(
        "loaded {} data and {} ROIs from {}",
        store.data_len(),
        store.roi_names().count(),
        path.as_ref().display()
    );
    Ok(store)
}

/// 检查存储中的名称在写入后能否按原角色读回.
fn check_names(store: &MemoryStore) -> PkResult<()> {
    for name in store.data.keys() {
        if store.main_name() == Some(name.as_str()) {
            continue;
        }
        if name == MAIN_NAME || name.starts_with(ROI_PREFIX) {
            return Err(PkError::ReservedName(name.clone()));
        }
    }
    match store.rois.keys().find(|name| !name.starts_with(ROI_PREFIX)) {
        Some(name) => Err(PkError::ReservedName(name.clone())),
        None => Ok(()),
    }
}

/// 将数据存储写入 npz 归档. 主数据以 `main` 为名写入.
///
/// 非主数据不能名为 `main` 或以 `roi` 开头, ROI 必须以 `roi` 开头,
/// 否则返回 [`PkError::ReservedName`], 且不会创建文件.
pub fn save_npz<P: AsRef<Path>>(store: &MemoryStore, path: P) -> PkResult<()> {
    check_names(store)?;
    let mut npz = NpzWriter::new(File::create(path.as_ref())?);
    for (name, d) in store.data.iter() {
        let key = if store.main_name() == Some(name.as_str()) {
            MAIN_NAME
        } else {
            name.as_str()
        };
        npz.add_array(key, d)?;
    }
    for (name, roi) in store.rois.iter() {
        npz.add_array(name.as_str(), roi)?;
    }
    npz.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, ArrayD};

    #[test]
    fn test_npz_store() {
        let path = std::env::temp_dir().join(format!("dce-berry-store-{}.npz", std::process::id()));

        let mut store = MemoryStore::new();
        let main = ArrayD::from_shape_fn(IxDyn(&[2, 1, 1, 3]), |i| i[3] as f64 + i[0] as f64);
        store.set_main(main.clone(), "dce");
        store.add_data(ArrayD::from_elem(IxDyn(&[2, 1, 1]), 1.5), "T10", false);
        store.add_roi(Array3::from_elem((2, 1, 1), 1), "roi", true);
        save_npz(&store, &path).unwrap();

        let loaded = load_npz(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.main_name(), Some(MAIN_NAME));
        assert_eq!(loaded.main_data().unwrap(), main.view());
        assert_eq!(loaded.data("T10").unwrap().shape(), [2, 1, 1]);
        assert_eq!(loaded.current_roi_name(), Some("roi"));
        assert_eq!(loaded.current_roi().unwrap().sum(), 2);
    }

    #[test]
    fn test_save_rejects_ambiguous_names() {
        let path =
            std::env::temp_dir().join(format!("dce-berry-names-{}.npz", std::process::id()));
        let base = || {
            let mut store = MemoryStore::new();
            store.set_main(ArrayD::zeros(IxDyn(&[1, 1, 1, 2])), "dce");
            store
        };

        let mut store = base();
        store.add_data(ArrayD::zeros(IxDyn(&[1, 1, 1])), "roi_ktrans", false);
        assert!(matches!(
            save_npz(&store, &path),
            Err(PkError::ReservedName(name)) if name == "roi_ktrans"
        ));

        let mut store = base();
        store.add_data(ArrayD::zeros(IxDyn(&[1, 1, 1])), MAIN_NAME, false);
        assert!(matches!(save_npz(&store, &path), Err(PkError::ReservedName(_))));

        let mut store = base();
        store.add_roi(Array3::ones((1, 1, 1)), "tumour", true);
        assert!(matches!(
            save_npz(&store, &path),
            Err(PkError::ReservedName(name)) if name == "tumour"
        ));
        assert!(!path.exists());

        // 主数据本身名为 `main` 时可以写入.
        let mut store = MemoryStore::new();
        store.set_main(ArrayD::zeros(IxDyn(&[1, 1, 1, 2])), MAIN_NAME);
        save_npz(&store, &path).unwrap();
        let loaded = load_npz(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded.main_name(), Some(MAIN_NAME));
        assert_eq!(loaded.data_len(), 1);
    }
}

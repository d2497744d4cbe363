#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! DCE-MRI 4D 体数据逐体素药代动力学 (PK) 建模的调度与重建.
//!
//! 非线性拟合算法本身由外部引擎 ([`engine::FittingEngine`]) 提供.
//! 本 crate 负责其余部分:
//!
//! 1. 按 ROI 从 4D 体数据中选出体素并展平为 (N, T) 矩阵 ([`data`]);
//! 2. 以注射前的时间点为基线做归一化 ([`normalize`]);
//! 3. 把体素划分给若干工作线程, 每个线程按块顺序驱动一个私有引擎, 并通过有损的
//!   单槽位通道汇报进度 ([`dispatch`]);
//! 4. 把拟合结果放回体空间, 施加生理学截断, 计算 kep 和百分位阈值 ([`reconstruct`]);
//! 5. 成功时把参数图写回数据存储 ([`store`], [`process`]).
//!
//! # 注意
//!
//! 1. 选取与重建必须使用同一份 [`data::VoxelSelection`], 体素顺序为空间轴的行优先序.
//! 2. 只要有一个工作线程失败, 整次运行失败, 不会写入任何部分结果.
//! 3. 内部不变量被破坏时程序会直接 panic, 而不会导致内存错误.
//!
//! # Features
//!
//! - `rayon`: 归一化, 信号还原和百分位排序使用多线程.
//! - `serde`: 从 JSON 读取 [`config::RunOptions`].

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

pub mod consts;
pub mod error;

pub mod config;
pub mod engine;

/// 体素选取与逆映射.
pub mod data;

pub mod dispatch;
pub mod normalize;
pub mod reconstruct;

pub mod process;
pub mod store;

pub mod prelude;

pub use error::{PkError, PkResult, WorkerFailure, WorkerFailureCause};
pub use process::{PkModellingProcess, ProcessStatus};

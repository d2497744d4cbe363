//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::Idx3d;

pub use crate::config::{RunConfig, RunOptions};
pub use crate::consts::names;
pub use crate::data::{roi_to_mask, select_voxels, VoxelSelection};
pub use crate::dispatch::{CancelToken, RunHandle, WorkerOutcome};
pub use crate::engine::{
    AcquisitionParams, Bounds, EngineError, EngineFactory, EngineInput, EngineResult,
    FittingEngine, ModelChoice,
};
pub use crate::error::{PkError, PkResult};
pub use crate::process::{PkModellingProcess, ProcessStatus};
pub use crate::reconstruct::ParameterMaps;
pub use crate::store::{load_npz, save_npz, DataStore, MemoryStore};

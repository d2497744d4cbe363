//! 集成测试公共工具: 可编排的桩拟合引擎与测试数据.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dce_berry::prelude::*;
use ndarray::{Array1, Array2, Array3, ArrayD, IxDyn};

/// 打开日志. 多次调用无副作用.
pub fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

/// 桩引擎的行为.
#[derive(Clone, Debug, Default)]
pub struct Script {
    /// 每个体素的 ve, offset, vp. Ktrans 取该体素的 T10 值.
    pub row: [f64; 3],

    /// 在第 k 块 (从 0 开始) 返回错误.
    pub fail_on_chunk: Option<usize>,

    /// 在第 k 块 panic.
    pub panic_on_chunk: Option<usize>,

    /// 拒绝的模型.
    pub reject_model: Option<ModelChoice>,

    /// 每块耗时.
    pub delay: Duration,
}

/// 记录所有引擎调用的工厂.
#[derive(Debug, Default)]
pub struct StubFactory {
    pub script: Script,
    pub created: AtomicUsize,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl StubFactory {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl EngineFactory for StubFactory {
    fn create(&self, input: EngineInput) -> EngineResult<Box<dyn FittingEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubEngine {
            input,
            script: self.script.clone(),
            cursor: 0,
            chunk: 0,
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct StubEngine {
    input: EngineInput,
    script: Script,
    cursor: usize,
    chunk: usize,
    calls: Arc<Mutex<Vec<String>>>,
}

impl StubEngine {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn finished(&self) -> EngineResult<()> {
        if self.cursor == self.input.len() {
            Ok(())
        } else {
            Err(EngineError::new("results requested before all voxels were fitted"))
        }
    }
}

impl FittingEngine for StubEngine {
    fn initialize(&mut self, model: ModelChoice, injection_time_minutes: f64) -> EngineResult<String> {
        self.record(format!("initialize {} {injection_time_minutes}", model.code()));
        if self.script.reject_model == Some(model) {
            return Err(EngineError::new(format!("unsupported model {model}")));
        }
        Ok(format!("stub engine: {model}\n"))
    }

    fn set_bounds(&mut self, upper: [f64; 4], lower: [f64; 4]) {
        self.record(format!("set_bounds {upper:?} {lower:?}"));
    }

    fn set_parameters(&mut self, params: &AcquisitionParams) {
        self.record(format!("set_parameters tr={} te={}", params.tr_seconds, params.te_seconds));
    }

    fn run(&mut self, chunk_size: usize) -> EngineResult<String> {
        let chunk = self.chunk;
        self.chunk += 1;
        self.record(format!("run {chunk_size}"));
        thread::sleep(self.script.delay);

        if self.script.panic_on_chunk == Some(chunk) {
            panic!("stub engine exploded at chunk {chunk}");
        }
        if self.script.fail_on_chunk == Some(chunk) {
            return Err(EngineError::new(format!("optimiser diverged at chunk {chunk}")));
        }
        if self.cursor + chunk_size > self.input.len() {
            return Err(EngineError::new("chunk past end of input"));
        }
        self.cursor += chunk_size;
        Ok(format!("fitted {chunk_size} voxels\n"))
    }

    fn residual(&self) -> EngineResult<Array1<f64>> {
        self.finished()?;
        Ok(Array1::from_elem(self.input.len(), 0.25))
    }

    fn fitted_curve(&self) -> EngineResult<Array2<f64>> {
        self.finished()?;
        Ok(self.input.voxels.clone())
    }

    fn parameters(&self) -> EngineResult<Array2<f64>> {
        self.finished()?;
        let [ve, offset, vp] = self.script.row;
        Ok(Array2::from_shape_fn((self.input.len(), 4), |(i, j)| match j {
            0 => self.input.t10[i],
            1 => ve,
            2 => offset,
            _ => vp,
        }))
    }
}

/// 合成信号, 每个体素不同且随时间缓慢上升.
pub fn signal(x: usize, y: usize, z: usize, t: usize) -> f64 {
    100.0 + (x * 100 + y * 10 + z) as f64 + t as f64
}

/// 构造带主数据 `dce` 与 `T10` 图的存储. `t10` 给出每个体素的 T10 值.
pub fn store<F>(shape: (usize, usize, usize, usize), t10: F) -> MemoryStore
where
    F: Fn((usize, usize, usize)) -> f64,
{
    let (x, y, z, t) = shape;
    let mut s = MemoryStore::new();
    s.set_main(
        ArrayD::from_shape_fn(IxDyn(&[x, y, z, t]), |i| signal(i[0], i[1], i[2], i[3])),
        "dce",
    );
    s.add_data(Array3::from_shape_fn((x, y, z), t10).into_dyn(), "T10", false);
    s
}

/// 一组完整的运行选项.
pub fn options() -> RunOptions {
    RunOptions {
        r1: Some(3.7),
        r2: Some(4.8),
        dt: Some(1.0),
        tinj: Some(2.0),
        tr: Some(4.108),
        te: Some(1.832),
        fa: Some(12.0),
        ve_thresh: Some(100.0),
        model: Some(1),
        poll_interval_ms: Some(1),
        ..Default::default()
    }
}

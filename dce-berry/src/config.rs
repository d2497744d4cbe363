//! 运行配置.
//!
//! [`RunOptions`] 是未经检查的原始选项, 所有字段都可以缺省;
//! [`RunOptions::validate`] 在派发任何工作线程之前一次性完成检查并填充默认值,
//! 得到 [`RunConfig`].

use std::time::Duration;

use crate::consts::*;
use crate::dispatch::FitSettings;
use crate::engine::{AcquisitionParams, Bounds, ModelChoice};
use crate::error::{PkError, PkResult};

#[cfg(feature = "serde")]
use serde::Deserialize;

/// 原始运行选项. 键名与宿主程序一致 (如 `ve-thresh`).
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize))]
#[cfg_attr(feature = "serde", serde(default, rename_all = "kebab-case", deny_unknown_fields))]
pub struct RunOptions {
    /// ROI 名称. 缺省时使用数据存储的当前 ROI; 没有当前 ROI 时选中全部体素.
    pub roi: Option<String>,

    /// 输出名后缀.
    pub suffix: Option<String>,

    /// T1 弛豫率.
    pub r1: Option<f64>,

    /// T2 弛豫率.
    pub r2: Option<f64>,

    /// 采样间隔, 秒.
    pub dt: Option<f64>,

    /// 注射时间, 秒.
    pub tinj: Option<f64>,

    /// 重复时间, 毫秒.
    pub tr: Option<f64>,

    /// 回波时间, 毫秒.
    pub te: Option<f64>,

    /// 翻转角.
    pub fa: Option<f64>,

    /// Ktrans/kep 离群阈值百分位, `0..=100`.
    pub ve_thresh: Option<f64>,

    /// 剂量, 缺省为 0.
    pub dose: Option<f64>,

    /// 模型编号, `1..=4`.
    pub model: Option<i64>,

    /// 辅助 T1 图名称, 缺省为 `T10`.
    pub t10: Option<String>,

    /// 工作线程数, 缺省为 1.
    pub workers: Option<usize>,

    /// 每个工作线程的目标块数, 缺省为 5.
    pub chunks: Option<usize>,

    /// 参数上界.
    pub upper_bounds: Option<[f64; PARAM_COUNT]>,

    /// 参数下界.
    pub lower_bounds: Option<[f64; PARAM_COUNT]>,

    /// 进度轮询间隔, 毫秒.
    pub poll_interval_ms: Option<u64>,
}

/// 经过检查的运行配置.
#[derive(Clone, Debug, PartialEq)]
pub struct RunConfig {
    /// ROI 名称.
    pub roi: Option<String>,

    /// 输出名后缀 (不含下划线).
    pub suffix: String,

    /// 采样间隔, 秒.
    pub sampling_interval: f64,

    /// 注射时间, 秒.
    pub injection_time: f64,

    /// 离群阈值百分位.
    pub threshold_percentile: f64,

    /// 模型.
    pub model: ModelChoice,

    /// 引擎单位的采集参数.
    pub acquisition: AcquisitionParams,

    /// 参数上下界.
    pub bounds: Bounds,

    /// 辅助 T1 图名称.
    pub t10: String,

    /// 工作线程数.
    pub workers: usize,

    /// 每个工作线程的目标块数.
    pub chunks: usize,

    /// 进度轮询间隔.
    pub poll_interval: Duration,
}

fn required(v: Option<f64>, name: &'static str) -> PkResult<f64> {
    let v = v.ok_or(PkError::MissingOption(name))?;
    finite(v, name)
}

fn finite(v: f64, name: &'static str) -> PkResult<f64> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err(invalid(name, format!("{v} is not finite")))
    }
}

#[inline]
fn invalid(name: &'static str, reason: impl Into<String>) -> PkError {
    PkError::InvalidOption {
        name,
        reason: reason.into(),
    }
}

impl RunOptions {
    /// 从 JSON 字符串读取.
    #[cfg(feature = "serde")]
    pub fn from_json_str(s: &str) -> PkResult<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// 从 JSON 文件读取.
    #[cfg(feature = "serde")]
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> PkResult<Self> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// 检查必需字段和取值范围, 填充默认值.
    pub fn validate(&self) -> PkResult<RunConfig> {
        let r1 = required(self.r1, "r1")?;
        let r2 = required(self.r2, "r2")?;
        let dt = required(self.dt, "dt")?;
        let tinj = required(self.tinj, "tinj")?;
        let tr = required(self.tr, "tr")?;
        let te = required(self.te, "te")?;
        let fa = required(self.fa, "fa")?;
        let thresh = required(self.ve_thresh, "ve-thresh")?;
        let code = self.model.ok_or(PkError::MissingOption("model"))?;
        let dose = finite(self.dose.unwrap_or(0.0), "dose")?;

        if dt <= 0.0 {
            return Err(invalid("dt", "sampling interval must be positive"));
        }
        if tinj < 0.0 {
            return Err(invalid("tinj", "injection time must not be negative"));
        }
        if !(0.0..=100.0).contains(&thresh) {
            return Err(invalid("ve-thresh", format!("{thresh} is not a percentile in 0..=100")));
        }
        let model = ModelChoice::try_from(code)
            .map_err(|c| invalid("model", format!("unrecognised model choice {c}")))?;

        let bounds = Bounds {
            upper: self.upper_bounds.unwrap_or(DEFAULT_UPPER_BOUNDS),
            lower: self.lower_bounds.unwrap_or(DEFAULT_LOWER_BOUNDS),
        };
        let bad_bounds = bounds
            .lower
            .iter()
            .zip(bounds.upper.iter())
            .any(|(l, u)| !l.is_finite() || !u.is_finite() || l > u);
        if bad_bounds {
            return Err(invalid("bounds", format!("{bounds:?}")));
        }

        let workers = self.workers.unwrap_or(DEFAULT_WORKERS);
        if workers == 0 {
            return Err(invalid("workers", "at least one worker is required"));
        }
        let chunks = self.chunks.unwrap_or(DEFAULT_CHUNKS);
        if chunks == 0 {
            return Err(invalid("chunks", "at least one chunk is required"));
        }

        Ok(RunConfig {
            roi: self.roi.clone(),
            suffix: self.suffix.clone().unwrap_or_default(),
            sampling_interval: dt,
            injection_time: tinj,
            threshold_percentile: thresh,
            model,
            acquisition: AcquisitionParams {
                r1,
                r2,
                flip_angle: fa,
                tr_seconds: tr / 1000.0,
                te_seconds: te / 1000.0,
                dose,
            },
            bounds,
            t10: self.t10.clone().unwrap_or_else(|| DEFAULT_T10_NAME.to_string()),
            workers: workers.min(num_cpus::get().max(1) * 4),
            chunks,
            poll_interval: Duration::from_millis(
                self.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
        })
    }
}

impl RunConfig {
    /// 注射时间, 分钟.
    #[inline]
    pub fn injection_time_minutes(&self) -> f64 {
        self.injection_time / 60.0
    }

    /// 不依赖体素数据的拟合配置.
    pub fn fit_settings(&self) -> FitSettings {
        FitSettings {
            model: self.model,
            injection_time_minutes: self.injection_time_minutes(),
            bounds: self.bounds,
            acquisition: self.acquisition,
            chunks: self.chunks,
        }
    }

    /// 输出名: `base` 加上后缀.
    #[inline]
    pub fn output_name(&self, base: &str) -> String {
        names::with_suffix(base, &self.suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn complete() -> RunOptions {
        RunOptions {
            r1: Some(3.7),
            r2: Some(4.8),
            dt: Some(12.0),
            tinj: Some(60.0),
            tr: Some(4.108),
            te: Some(1.832),
            fa: Some(12.0),
            ve_thresh: Some(99.8),
            model: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_defaults_and_units() {
        let cfg = complete().validate().unwrap();
        assert_eq!(cfg.suffix, "");
        assert_eq!(cfg.acquisition.dose, 0.0);
        assert!((cfg.acquisition.tr_seconds - 0.004108).abs() < 1e-12);
        assert!((cfg.acquisition.te_seconds - 0.001832).abs() < 1e-12);
        assert_eq!(cfg.injection_time_minutes(), 1.0);
        assert_eq!(cfg.model, ModelChoice::ClinicalToftsOffset);
        assert_eq!(cfg.bounds, Bounds::default());
        assert_eq!(cfg.t10, "T10");
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.chunks, 5);
        assert_eq!(cfg.poll_interval, Duration::from_millis(100));
        assert_eq!(cfg.output_name(names::KTRANS), "ktrans");
    }

    #[test]
    fn test_missing_required_fields() {
        let mut o = complete();
        o.ve_thresh = None;
        assert!(matches!(o.validate(), Err(PkError::MissingOption("ve-thresh"))));

        let mut o = complete();
        o.model = None;
        assert!(matches!(o.validate(), Err(PkError::MissingOption("model"))));

        assert!(matches!(
            RunOptions::default().validate(),
            Err(PkError::MissingOption("r1"))
        ));
    }

    #[test]
    fn test_invalid_values() {
        let cases: [(fn(&mut RunOptions), &str); 6] = [
            (|o| o.dt = Some(0.0), "dt"),
            (|o| o.tinj = Some(-1.0), "tinj"),
            (|o| o.ve_thresh = Some(101.0), "ve-thresh"),
            (|o| o.model = Some(9), "model"),
            (|o| o.workers = Some(0), "workers"),
            (|o| o.upper_bounds = Some([0.0; PARAM_COUNT]), "bounds"),
        ];
        for (edit, expected) in cases {
            let mut o = complete();
            edit(&mut o);
            match o.validate() {
                Err(PkError::InvalidOption { name, .. }) => assert_eq!(name, expected),
                other => panic!("{expected}: unexpected {other:?}"),
            }
        }

        let mut o = complete();
        o.r1 = Some(f64::NAN);
        assert!(matches!(o.validate(), Err(PkError::InvalidOption { name: "r1", .. })));
    }

    #[test]
    fn test_suffix() {
        let mut o = complete();
        o.suffix = Some("b".into());
        let cfg = o.validate().unwrap();
        assert_eq!(cfg.output_name(names::MODEL_CURVES), "model_curves_b");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_from_json() {
        let o = RunOptions::from_json_str(
            r#"{"r1": 3.7, "r2": 4.8, "dt": 12, "tinj": 60, "tr": 4.108, "te": 1.832,
                "fa": 12, "ve-thresh": 99.8, "model": 1, "roi": "tumour", "dose": 0.1}"#,
        )
        .unwrap();
        assert_eq!(o.ve_thresh, Some(99.8));
        assert_eq!(o.roi.as_deref(), Some("tumour"));
        let cfg = o.validate().unwrap();
        assert_eq!(cfg.acquisition.dose, 0.1);

        assert!(RunOptions::from_json_str(r#"{"unknown": 1}"#).is_err());
    }
}

//! 端到端推理管线.
//!
//! 单次调用按 加载 -> 规范化 -> 滑窗推理 -> 逆投影 -> 定量 -> 写出
//! 的固定次序执行, 任一阶段出错都会中止本次调用并把错误原样上抛;
//! 不存在跨调用共享的可变状态, 每次调用都从零开始.

use crate::data::{MrScan, NiftiHeaderAttr, OpenVolumeError};
use crate::infer::{self, CancelToken, InferConfig, InferError, InferReport};
use crate::model::PatchModel;
use crate::orient::{self, OrientationError};
use crate::project;
use crate::quantify::{self, FatQuantification, QuantifyError};
use crate::writer::{self, WriteError};
use log::{info, warn};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// 单次管线调用的全部输入.
///
/// 请求不可变, 每次调用独立创建; 结果通过返回值传出, 不存在
/// 被调用方写回的共享会话状态.
#[derive(Clone, Debug)]
pub struct PipelineRequest {
    /// 输入体积 (`.nii`/`.nii.gz`) 路径.
    pub volume_path: PathBuf,

    /// 预测文件输出目录.
    pub output_dir: PathBuf,

    /// 滑窗推理配置.
    pub infer: InferConfig,
}

impl PipelineRequest {
    /// 以默认推理配置构建请求.
    pub fn new<P: Into<PathBuf>>(volume_path: P, output_dir: P) -> Self {
        Self {
            volume_path: volume_path.into(),
            output_dir: output_dir.into(),
            infer: InferConfig::default(),
        }
    }
}

/// 单次管线调用的结果.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// 定量结果.
    pub quantification: FatQuantification,

    /// 推理统计报告.
    pub report: InferReport,

    /// 预测文件的最终路径.
    pub label_path: PathBuf,
}

/// 管线错误: 各阶段错误的汇总.
#[derive(Debug)]
pub enum PipelineError {
    /// 加载体积失败.
    Load(OpenVolumeError),

    /// 方向规范化失败.
    Orientation(OrientationError),

    /// 滑窗推理失败.
    Infer(InferError),

    /// 定量失败.
    Quantify(QuantifyError),

    /// 预测写出失败.
    Write(WriteError),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load(e) => write!(f, "load: {e}"),
            Self::Orientation(e) => write!(f, "orientation: {e}"),
            Self::Infer(e) => write!(f, "inference: {e}"),
            Self::Quantify(e) => write!(f, "quantification: {e}"),
            Self::Write(e) => write!(f, "write: {e}"),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Load(e) => Some(e),
            Self::Orientation(e) => Some(e),
            Self::Infer(e) => Some(e),
            Self::Quantify(e) => Some(e),
            Self::Write(e) => Some(e),
        }
    }
}

impl From<OpenVolumeError> for PipelineError {
    #[inline]
    fn from(e: OpenVolumeError) -> Self {
        Self::Load(e)
    }
}

impl From<OrientationError> for PipelineError {
    #[inline]
    fn from(e: OrientationError) -> Self {
        Self::Orientation(e)
    }
}

impl From<InferError> for PipelineError {
    #[inline]
    fn from(e: InferError) -> Self {
        Self::Infer(e)
    }
}

impl From<QuantifyError> for PipelineError {
    #[inline]
    fn from(e: QuantifyError) -> Self {
        Self::Quantify(e)
    }
}

impl From<WriteError> for PipelineError {
    #[inline]
    fn from(e: WriteError) -> Self {
        Self::Write(e)
    }
}

/// 执行一次完整管线.
///
/// 推理阶段遇到 [`InferError::OutOfMemory`] 时以减半的 batch 重试,
/// 直到 batch 为 1 仍失败才向上返回; 其余错误不做重试.
pub fn run(
    req: &PipelineRequest,
    model: &dyn PatchModel,
    cancel: &CancelToken,
) -> Result<PipelineOutcome, PipelineError> {
    info!("加载体积: {}", req.volume_path.display());
    let scan = MrScan::open(&req.volume_path)?;

    let (canonical, frame) = orient::canonicalize(&scan)?;
    info!("方向规范化完成, 规范形状 {:?}", canonical.dim());

    let mut cfg = req.infer;
    let (aggregated, report) = loop {
        match infer::sliding_window(canonical.view(), model, &cfg, cancel) {
            Ok(done) => break done,
            Err(InferError::OutOfMemory { batch }) if cfg.batch > 1 => {
                cfg.batch = (cfg.batch / 2).max(1);
                warn!("batch {batch} 内存不足, 以 batch {} 重试", cfg.batch);
            }
            Err(e) => return Err(e.into()),
        }
    };
    info!(
        "推理完成: {} 个 patch, 耗时 {}",
        report.patches,
        report.human_duration()
    );

    let label = project::project(&aggregated, &frame, &scan);
    let quantification = quantify::quantify(label.data(), scan.pix_dim())?;
    let label_path = writer::write_prediction(&label, &req.volume_path, &req.output_dir)?;
    info!("预测已写出: {}", label_path.display());

    Ok(PipelineOutcome {
        quantification,
        report,
        label_path,
    })
}

/// 在后台线程执行的管线任务柄.
pub struct PipelineTask {
    handle: JoinHandle<Result<PipelineOutcome, PipelineError>>,
    cancel: CancelToken,
}

impl PipelineTask {
    /// 请求取消. 推理引擎在相邻 patch 批之间响应.
    #[inline]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 取消令牌副本.
    #[inline]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// 任务是否已结束?
    #[inline]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// 等待任务结束并取回结果.
    ///
    /// 管线线程 panic 时, 此处同样 panic.
    pub fn join(self) -> Result<PipelineOutcome, PipelineError> {
        self.handle.join().expect("管线线程异常终止")
    }
}

/// 在交互线程之外执行管线, 立即返回任务柄.
///
/// `model` 只读共享: 加载一次后可被多次调用复用.
pub fn spawn(req: PipelineRequest, model: Arc<dyn PatchModel>) -> PipelineTask {
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let handle = thread::spawn(move || run(&req, model.as_ref(), &worker_cancel));
    PipelineTask { handle, cancel }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::class::*;
    use crate::model::{ModelError, PointwiseHead};
    use ndarray::{arr1, arr2, Array3};
    use nifti::writer::WriterOptions;
    use std::path::Path;

    /// 把合成扫描写成 nii 文件, 返回其路径.
    fn write_scan(dir: &Path, name: &str, scan: &MrScan) -> PathBuf {
        let path = dir.join(name);
        let data = scan.data().permuted_axes([2, 1, 0]);
        WriterOptions::new(&path)
            .reference_header(scan.header())
            .write_nifti(&data)
            .unwrap();
        path
    }

    /// 强度 10 判 VAT, 强度 2 判 SAT, 零强度判背景的线性头.
    fn head(patch: crate::Idx3d) -> PointwiseHead {
        PointwiseHead::from_parts(
            arr2(&[[0.0], [1.0], [0.5]]),
            arr1(&[0.0, -5.0, -0.25]),
            patch,
        )
    }

    /// 合成扫描: (8, 8, 8), 前 6 个体素强度 10, 接着 3 个强度 2.
    fn sample_scan() -> MrScan {
        let mut data = Array3::<f32>::zeros((8, 8, 8));
        for (i, v) in data.iter_mut().enumerate() {
            if i < 6 {
                *v = 10.0;
            } else if i < 9 {
                *v = 2.0;
            }
        }
        MrScan::fake(data, [1.0, 1.0, 1.0])
    }

    fn request(dir: &Path, volume: PathBuf) -> PipelineRequest {
        let mut req = PipelineRequest::new(volume, dir.to_owned());
        req.infer = InferConfig {
            patch: (4, 4, 4),
            stride: (4, 4, 4),
            batch: 2,
            classes: 3,
        };
        req
    }

    #[test]
    fn test_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let scan = sample_scan();
        let volume = write_scan(dir.path(), "case1.nii", &scan);
        let req = request(dir.path(), volume);

        let outcome = run(&req, &head((4, 4, 4)), &CancelToken::new()).unwrap();
        // 体素 1mm 各向同性: 6 VAT + 3 SAT 体素.
        assert!((outcome.quantification.vat_cm3 - 0.006).abs() < 1e-9);
        assert!((outcome.quantification.sat_cm3 - 0.003).abs() < 1e-9);
        assert!((outcome.quantification.ratio - 2.0).abs() < 1e-9);
        assert_eq!(outcome.label_path.file_name().unwrap(), "case1_pred.nii");

        let label = crate::FatLabel::open(&outcome.label_path).unwrap();
        assert_eq!(label.count(FAT_VAT), 6);
        assert_eq!(label.count(FAT_SAT), 3);
        assert_eq!(label.numeric_statistics().iter().sum::<usize>(), 512);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let scan = sample_scan();
        let volume = write_scan(dir.path(), "case1.nii", &scan);
        let req = request(dir.path(), volume);
        let model = head((4, 4, 4));

        let first = run(&req, &model, &CancelToken::new()).unwrap();
        let second = run(&req, &model, &CancelToken::new()).unwrap();
        assert_eq!(first.quantification, second.quantification);
        assert_eq!(first.label_path, second.label_path);
    }

    #[test]
    fn test_zero_sat_aborts_before_write() {
        let dir = tempfile::tempdir().unwrap();
        // 全部强度 10: 只有 VAT, SAT 为零.
        let mut data = Array3::<f32>::zeros((4, 4, 4));
        data.fill(10.0);
        let scan = MrScan::fake(data, [1.0, 1.0, 1.0]);
        let volume = write_scan(dir.path(), "allvat.nii", &scan);
        let req = request(dir.path(), volume);

        let e = run(&req, &head((4, 4, 4)), &CancelToken::new()).unwrap_err();
        assert!(matches!(e, PipelineError::Quantify(QuantifyError::SatVolumeZero)));
        // 定量失败时不产出预测文件.
        assert!(!dir.path().join("allvat_pred.nii").exists());
    }

    #[test]
    fn test_oom_backoff() {
        use crate::model::PatchModel;
        use ndarray::{Array5, ArrayView5};
        use std::sync::atomic::{AtomicUsize, Ordering};

        /// batch 大于 1 时报内存不足的网络.
        struct Flaky {
            inner: PointwiseHead,
            attempts: AtomicUsize,
        }

        impl PatchModel for Flaky {
            fn in_channels(&self) -> usize {
                self.inner.in_channels()
            }

            fn class_count(&self) -> usize {
                self.inner.class_count()
            }

            fn patch_shape(&self) -> crate::Idx3d {
                self.inner.patch_shape()
            }

            fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                if batch.dim().0 > 1 {
                    return Err(ModelError::OutOfMemory {
                        batch: batch.dim().0,
                    });
                }
                self.inner.forward(batch)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let scan = sample_scan();
        let volume = write_scan(dir.path(), "case1.nii", &scan);
        let req = request(dir.path(), volume);

        let model = Flaky {
            inner: head((4, 4, 4)),
            attempts: AtomicUsize::new(0),
        };
        let outcome = run(&req, &model, &CancelToken::new()).unwrap();
        assert!((outcome.quantification.ratio - 2.0).abs() < 1e-9);
        assert!(model.attempts.load(Ordering::Relaxed) > 8);
    }

    #[test]
    fn test_spawn_and_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let scan = sample_scan();
        let volume = write_scan(dir.path(), "case1.nii", &scan);
        let req = request(dir.path(), volume);

        // 预先取消: 任务应以 Cancelled 结束.
        let task = spawn(req.clone(), Arc::new(head((4, 4, 4))));
        task.cancel();
        match task.join() {
            Err(PipelineError::Infer(InferError::Cancelled)) => {}
            // 若推理先于取消完成, 结果也必须是完整的.
            Ok(outcome) => assert!((outcome.quantification.ratio - 2.0).abs() < 1e-9),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

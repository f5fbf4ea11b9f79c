//! 滑窗推理与重叠聚合.
//!
//! 把规范化体积平铺成固定形状的 patch 窗口, 分批交给网络前向传播,
//! 再把重叠 patch 的逐类输出按等权平均聚合成整体概率体积.
//! 平铺调度是确定性的完全覆盖: 每一维起点按步长推进, 最后一个起点
//! 被收拢到体积边缘, 因此不存在越界填充, 也不存在漏掉的体素.

use crate::consts::{self, IN_CHANNELS};
use crate::model::{ModelError, PatchModel};
use crate::Idx3d;
use itertools::iproduct;
use ndarray::{s, Array3, Array4, Array5, ArrayView3, ArrayView4, Axis, Zip};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};
        use rayon::iter::IntoParallelRefIterator;
    }
}

/// 协作式取消令牌.
///
/// 推理引擎在相邻 patch 批之间检查该令牌; 触发后当次调用以
/// [`InferError::Cancelled`] 终止, 已完成 patch 的数值不受影响.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// 创建未触发的令牌.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消.
    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// 是否已请求取消?
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// 滑窗推理配置.
#[derive(Copy, Clone, Debug)]
pub struct InferConfig {
    /// patch 窗口形状, 按 (z, h, w) 顺序.
    pub patch: Idx3d,

    /// 相邻 patch 起点间步长, 按 (z, h, w) 顺序.
    /// 每一维必须满足 `0 < stride <= patch`.
    pub stride: Idx3d,

    /// 单次前向传播的 patch 个数. 必须至少为 1.
    pub batch: usize,

    /// 配置的输出类别数.
    pub classes: usize,
}

impl Default for InferConfig {
    #[inline]
    fn default() -> Self {
        Self {
            patch: consts::DEFAULT_PATCH,
            stride: consts::DEFAULT_STRIDE,
            batch: consts::DEFAULT_SW_BATCH,
            classes: consts::NUM_CLASSES,
        }
    }
}

impl InferConfig {
    /// 配置自身是否自洽?
    fn is_valid(&self) -> bool {
        let (pz, ph, pw) = self.patch;
        let (sz, sh, sw) = self.stride;
        self.batch >= 1
            && self.classes >= 1
            && (1..=pz).contains(&sz)
            && (1..=ph).contains(&sh)
            && (1..=pw).contains(&sw)
    }
}

/// 推理错误.
#[derive(Debug)]
pub enum InferError {
    /// 网络声明的通道数/类别数/窗口形状与配置不符.
    ModelMismatch(String),

    /// patch 窗口在某一维大于体积本身, 无法贴边平铺.
    PatchExceedsVolume {
        /// 配置的窗口形状.
        patch: Idx3d,
        /// 体积形状.
        volume: Idx3d,
    },

    /// 设备内存不足. 调用方可用更小的 batch 重试.
    OutOfMemory {
        /// 失败时的 batch 大小.
        batch: usize,
    },

    /// 推理被取消.
    Cancelled,

    /// 网络前向传播失败.
    Forward(String),
}

impl From<ModelError> for InferError {
    fn from(e: ModelError) -> Self {
        match e {
            ModelError::OutOfMemory { batch } => Self::OutOfMemory { batch },
            ModelError::Forward(msg) => Self::Forward(msg),
        }
    }
}

impl fmt::Display for InferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelMismatch(msg) => write!(f, "model mismatch: {msg}"),
            Self::PatchExceedsVolume { patch, volume } => {
                write!(f, "patch {patch:?} exceeds volume {volume:?}")
            }
            Self::OutOfMemory { batch } => {
                write!(f, "out of device memory at batch size {batch}")
            }
            Self::Cancelled => write!(f, "inference cancelled"),
            Self::Forward(msg) => write!(f, "forward pass failed: {msg}"),
        }
    }
}

impl std::error::Error for InferError {}

/// 单维起点序列: 按步长推进, 最后一个起点收拢到 `dim - patch`.
fn axis_origins(dim: usize, patch: usize, stride: usize) -> Vec<usize> {
    debug_assert!(patch <= dim);
    debug_assert!((1..=patch).contains(&stride));
    let mut ans: Vec<usize> = (0..)
        .map(|i| i * stride)
        .take_while(|o| o + patch < dim)
        .collect();
    ans.push(dim - patch);
    ans
}

/// patch 平铺调度: 对体积的确定性完全覆盖.
#[derive(Clone, Debug)]
pub struct PatchGrid {
    origins: Vec<Idx3d>,
    patch: Idx3d,
}

impl PatchGrid {
    /// 生成对形状为 `volume` 的体积的完全覆盖.
    ///
    /// 每个体素保证被至少一个 patch 覆盖; 边界体素由贴边收拢的
    /// 最后一个 patch 覆盖, 不做越界填充, 也不丢弃余数.
    pub fn cover(volume: Idx3d, patch: Idx3d, stride: Idx3d) -> Result<Self, InferError> {
        let (dz, dh, dw) = volume;
        let (pz, ph, pw) = patch;
        if pz > dz || ph > dh || pw > dw {
            return Err(InferError::PatchExceedsVolume { patch, volume });
        }
        let zs = axis_origins(dz, pz, stride.0);
        let hs = axis_origins(dh, ph, stride.1);
        let ws = axis_origins(dw, pw, stride.2);
        let origins = iproduct!(zs, hs, ws).collect();
        Ok(Self { origins, patch })
    }

    /// 全部 patch 起点, 按 (z, h, w) 字典序.
    #[inline]
    pub fn origins(&self) -> &[Idx3d] {
        &self.origins
    }

    /// patch 窗口形状.
    #[inline]
    pub fn patch(&self) -> Idx3d {
        self.patch
    }

    /// patch 个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// 调度是否为空? (完全覆盖调度恒非空.)
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// 聚合后的整体逐类概率体积, 形状 `(class, z, h, w)`.
///
/// 每个体素的值是所有覆盖它的 patch 输出的等权平均,
/// 与 patch 处理顺序无关.
#[derive(Debug, Clone)]
pub struct AggregatedPrediction {
    probs: Array4<f32>,
}

impl AggregatedPrediction {
    /// 概率体积视图.
    #[inline]
    pub fn probs(&self) -> ArrayView4<'_, f32> {
        self.probs.view()
    }

    /// 取出概率体积.
    #[inline]
    pub fn into_probs(self) -> Array4<f32> {
        self.probs
    }

    /// 类别数.
    #[inline]
    pub fn class_count(&self) -> usize {
        self.probs.dim().0
    }

    /// 空间形状 (z, h, w).
    #[inline]
    pub fn spatial_shape(&self) -> Idx3d {
        let (_, z, h, w) = self.probs.dim();
        (z, h, w)
    }
}

/// 单次滑窗推理的统计报告.
#[derive(Debug, Clone)]
pub struct InferReport {
    /// 平铺 + 前向传播全程的墙钟耗时.
    pub duration: Duration,

    /// 处理的 patch 总数.
    pub patches: usize,

    /// 前向传播批次数.
    pub batches: usize,
}

impl InferReport {
    /// 人类可读的耗时描述.
    #[inline]
    pub fn human_duration(&self) -> String {
        format_elapsed(self.duration.as_secs_f64())
    }
}

/// 将推理耗时 (秒) 格式化为人类可读形式.
///
/// 60 秒以内显示 `"{sec} seconds:{msec:.2} milliseconds"`,
/// 否则显示 `"{min} minutes,{sec} seconds"` (秒数四舍五入).
pub fn format_elapsed(secs: f64) -> String {
    assert!(secs.is_finite() && secs >= 0.0);
    if secs < 60.0 {
        let sec = secs as u64;
        let msec = (secs % 1.0) * 1000.0;
        format!("{sec} seconds:{msec:.2} milliseconds")
    } else {
        let min = (secs / 60.0) as u64;
        let sec = (secs % 60.0).round() as u64;
        format!("{min} minutes,{sec} seconds")
    }
}

/// 把 `chunk` 中各 patch 的输入窗口填充到 batch 张量.
fn fill_batch(
    input: &mut Array5<f32>,
    canonical: &ArrayView3<'_, f32>,
    chunk: &[Idx3d],
    patch: Idx3d,
) {
    let (pz, ph, pw) = patch;

    #[cfg(feature = "rayon")]
    input
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(chunk.par_iter())
        .for_each(|(mut slot, &(z, h, w))| {
            slot.index_axis_mut(Axis(0), 0)
                .assign(&canonical.slice(s![z..z + pz, h..h + ph, w..w + pw]));
        });

    #[cfg(not(feature = "rayon"))]
    for (mut slot, &(z, h, w)) in input.axis_iter_mut(Axis(0)).zip(chunk.iter()) {
        slot.index_axis_mut(Axis(0), 0)
            .assign(&canonical.slice(s![z..z + pz, h..h + ph, w..w + pw]));
    }
}

/// 按给定起点序列执行平铺推理与聚合. `origins` 的顺序不影响结果.
fn aggregate_over(
    canonical: ArrayView3<'_, f32>,
    model: &dyn PatchModel,
    origins: &[Idx3d],
    cfg: &InferConfig,
    cancel: &CancelToken,
) -> Result<(AggregatedPrediction, usize), InferError> {
    let (dz, dh, dw) = canonical.dim();
    let (pz, ph, pw) = cfg.patch;
    let classes = cfg.classes;

    let mut sum = Array4::<f32>::zeros((classes, dz, dh, dw));
    let mut hits = Array3::<u32>::zeros((dz, dh, dw));
    let mut batches = 0usize;

    for chunk in origins.chunks(cfg.batch) {
        if cancel.is_cancelled() {
            return Err(InferError::Cancelled);
        }

        let mut input = Array5::<f32>::zeros((chunk.len(), IN_CHANNELS, pz, ph, pw));
        fill_batch(&mut input, &canonical, chunk, cfg.patch);

        let output = model.forward(input.view())?;
        if output.dim() != (chunk.len(), classes, pz, ph, pw) {
            return Err(InferError::ModelMismatch(format!(
                "forward output shape {:?} does not match (n={}, c={classes}, {pz}, {ph}, {pw})",
                output.dim(),
                chunk.len()
            )));
        }

        for (slot, &(z, h, w)) in chunk.iter().enumerate() {
            let mut acc = sum.slice_mut(s![.., z..z + pz, h..h + ph, w..w + pw]);
            acc += &output.slice(s![slot, .., .., .., ..]);
            let mut cnt = hits.slice_mut(s![z..z + pz, h..h + ph, w..w + pw]);
            cnt.mapv_inplace(|c| c + 1);
        }
        batches += 1;
    }

    // 完全覆盖调度下, 每个体素都至少有一个贡献.
    debug_assert!(hits.iter().all(|&c| c >= 1));

    // 等权平均: 每个体素除以覆盖它的 patch 个数.
    for mut chan in sum.axis_iter_mut(Axis(0)) {
        Zip::from(&mut chan).and(&hits).for_each(|p, &n| {
            *p /= n as f32;
        });
    }

    Ok((AggregatedPrediction { probs: sum }, batches))
}

/// 对规范化体积执行滑窗推理.
///
/// 返回聚合后的整体逐类概率体积与统计报告. 聚合规则是等权平均,
/// 结果与 patch 处理顺序无关; batch 大小只影响吞吐, 不影响数值.
///
/// # 错误
///
/// 1. 网络声明与配置不符时返回 [`InferError::ModelMismatch`];
/// 2. 体积在某一维小于 patch 窗口时返回 [`InferError::PatchExceedsVolume`];
/// 3. 设备内存不足时返回 [`InferError::OutOfMemory`], 可减小 batch 重试;
/// 4. `cancel` 触发后返回 [`InferError::Cancelled`].
///
/// 配置自身不自洽 (如步长为零) 属于编程错误, 直接 panic.
pub fn sliding_window(
    canonical: ArrayView3<'_, f32>,
    model: &dyn PatchModel,
    cfg: &InferConfig,
    cancel: &CancelToken,
) -> Result<(AggregatedPrediction, InferReport), InferError> {
    assert!(cfg.is_valid(), "滑窗推理配置不自洽: {cfg:?}");

    if model.in_channels() != IN_CHANNELS {
        return Err(InferError::ModelMismatch(format!(
            "model declares {} input channels, pipeline feeds {IN_CHANNELS}",
            model.in_channels()
        )));
    }
    if model.class_count() != cfg.classes {
        return Err(InferError::ModelMismatch(format!(
            "model declares {} classes, config expects {}",
            model.class_count(),
            cfg.classes
        )));
    }
    if model.patch_shape() != cfg.patch {
        return Err(InferError::ModelMismatch(format!(
            "model window {:?} differs from configured patch {:?}",
            model.patch_shape(),
            cfg.patch
        )));
    }

    let start = Instant::now();
    let grid = PatchGrid::cover(canonical.dim(), cfg.patch, cfg.stride)?;
    log::debug!("滑窗调度: {} 个 patch, batch {}", grid.len(), cfg.batch);

    let (aggregated, batches) = aggregate_over(canonical, model, grid.origins(), cfg, cancel)?;
    let report = InferReport {
        duration: start.elapsed(),
        patches: grid.len(),
        batches,
    };
    Ok((aggregated, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, Array5, ArrayView5};

    /// 输出只取决于类别的常量网络: 类别 c 处处输出 (c + 1) / 10.
    struct ConstModel {
        patch: Idx3d,
        classes: usize,
    }

    impl PatchModel for ConstModel {
        fn in_channels(&self) -> usize {
            1
        }

        fn class_count(&self) -> usize {
            self.classes
        }

        fn patch_shape(&self) -> Idx3d {
            self.patch
        }

        fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
            let (n, _, pz, ph, pw) = batch.dim();
            let mut out = Array5::<f32>::zeros((n, self.classes, pz, ph, pw));
            for c in 0..self.classes {
                out.index_axis_mut(Axis(1), c)
                    .fill((c as f32 + 1.0) / 10.0);
            }
            Ok(out)
        }
    }

    /// 输出等于输入强度乘 (类别 + 1) 的网络: 聚合平均应精确还原该值.
    struct EchoModel {
        patch: Idx3d,
        classes: usize,
    }

    impl PatchModel for EchoModel {
        fn in_channels(&self) -> usize {
            1
        }

        fn class_count(&self) -> usize {
            self.classes
        }

        fn patch_shape(&self) -> Idx3d {
            self.patch
        }

        fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
            let (n, _, pz, ph, pw) = batch.dim();
            let mut out = Array5::<f32>::zeros((n, self.classes, pz, ph, pw));
            for b in 0..n {
                for c in 0..self.classes {
                    let x = batch.slice(s![b, 0, .., .., ..]);
                    let mut y = out.slice_mut(s![b, c, .., .., ..]);
                    y.assign(&x);
                    y.mapv_inplace(|v| v * (c as f32 + 1.0));
                }
            }
            Ok(out)
        }
    }

    /// 永远报告内存不足的网络.
    struct OomModel {
        patch: Idx3d,
    }

    impl PatchModel for OomModel {
        fn in_channels(&self) -> usize {
            1
        }

        fn class_count(&self) -> usize {
            3
        }

        fn patch_shape(&self) -> Idx3d {
            self.patch
        }

        fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
            Err(ModelError::OutOfMemory {
                batch: batch.dim().0,
            })
        }
    }

    fn cfg(patch: Idx3d, stride: Idx3d, batch: usize) -> InferConfig {
        InferConfig {
            patch,
            stride,
            batch,
            classes: 3,
        }
    }

    fn ramp(shape: Idx3d) -> Array3<f32> {
        let mut cnt = -1.0f32;
        Array3::from_shape_simple_fn(shape, || {
            cnt += 1.0;
            cnt
        })
    }

    #[test]
    fn test_axis_origins() {
        assert_eq!(axis_origins(10, 4, 4), vec![0, 4, 6]);
        assert_eq!(axis_origins(8, 4, 4), vec![0, 4]);
        assert_eq!(axis_origins(9, 4, 4), vec![0, 4, 5]);
        assert_eq!(axis_origins(4, 4, 2), vec![0]);
        assert_eq!(axis_origins(5, 4, 1), vec![0, 1]);
    }

    #[test]
    fn test_grid_full_coverage() {
        let grid = PatchGrid::cover((5, 7, 9), (2, 3, 4), (2, 2, 3)).unwrap();
        let mut hits = Array3::<u32>::zeros((5, 7, 9));
        for &(z, h, w) in grid.origins() {
            let mut v = hits.slice_mut(s![z..z + 2, h..h + 3, w..w + 4]);
            v.mapv_inplace(|c| c + 1);
        }
        assert!(hits.iter().all(|&c| c >= 1));
    }

    #[test]
    fn test_grid_patch_too_large() {
        assert!(matches!(
            PatchGrid::cover((4, 4, 4), (8, 4, 4), (1, 1, 1)),
            Err(InferError::PatchExceedsVolume { .. })
        ));
    }

    #[test]
    fn test_uniform_average_of_constant_model() {
        // 常量网络的聚合结果必须处处等于常量本身,
        // 这同时证明了每个体素都被至少一个 patch 覆盖.
        let model = ConstModel {
            patch: (2, 2, 2),
            classes: 3,
        };
        let canonical = ramp((4, 5, 6));
        let (agg, report) = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 2, 2), (2, 2, 2), 4),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(agg.spatial_shape(), (4, 5, 6));
        assert_eq!(agg.class_count(), 3);
        assert!(report.patches >= 1 && report.batches >= 1);
        for c in 0..3 {
            let expected = (c as f32 + 1.0) / 10.0;
            for &p in agg.probs().index_axis(Axis(0), c).iter() {
                assert!((p - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_average_reconstructs_echo_model() {
        // EchoModel 对每个覆盖 patch 输出同一体素值, 等权平均应精确还原.
        let model = EchoModel {
            patch: (2, 3, 3),
            classes: 3,
        };
        let canonical = ramp((4, 7, 8));
        let (agg, _) = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 3, 3), (1, 2, 2), 3),
            &CancelToken::new(),
        )
        .unwrap();

        for c in 0..3 {
            let chan = agg.probs().index_axis(Axis(0), c).to_owned();
            for (idx, &v) in chan.indexed_iter() {
                let expected = canonical[idx] * (c as f32 + 1.0);
                assert!(
                    (v - expected).abs() < 1e-3,
                    "class {c} at {idx:?}: {v} vs {expected}"
                );
            }
        }
    }

    #[test]
    fn test_order_independence() {
        // 起点顺序打乱后, 聚合结果只允许浮点累加级别的差异.
        let model = EchoModel {
            patch: (2, 2, 2),
            classes: 3,
        };
        let canonical = ramp((4, 5, 5));
        let config = cfg((2, 2, 2), (1, 1, 1), 2);
        let grid = PatchGrid::cover(canonical.dim(), config.patch, config.stride).unwrap();

        let (fwd, _) = aggregate_over(
            canonical.view(),
            &model,
            grid.origins(),
            &config,
            &CancelToken::new(),
        )
        .unwrap();

        let mut reversed: Vec<Idx3d> = grid.origins().to_vec();
        reversed.reverse();
        let (rev, _) = aggregate_over(
            canonical.view(),
            &model,
            &reversed,
            &config,
            &CancelToken::new(),
        )
        .unwrap();

        for (a, b) in fwd.probs().iter().zip(rev.probs().iter()) {
            assert!((a - b).abs() <= 1e-3 * a.abs().max(1.0));
        }
    }

    #[test]
    fn test_batch_size_has_no_effect() {
        let model = EchoModel {
            patch: (2, 2, 2),
            classes: 3,
        };
        let canonical = ramp((4, 4, 4));
        let one = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 2, 2), (1, 1, 1), 1),
            &CancelToken::new(),
        )
        .unwrap()
        .0;
        let many = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 2, 2), (1, 1, 1), 5),
            &CancelToken::new(),
        )
        .unwrap()
        .0;
        assert_eq!(one.probs(), many.probs());
    }

    #[test]
    fn test_model_mismatch() {
        let model = ConstModel {
            patch: (2, 2, 2),
            classes: 3,
        };
        let canonical = ramp((4, 4, 4));

        // 窗口不一致.
        let e = sliding_window(
            canonical.view(),
            &model,
            &cfg((4, 4, 4), (2, 2, 2), 1),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(e, InferError::ModelMismatch(_)));

        // 类别数不一致.
        let mut c = cfg((2, 2, 2), (2, 2, 2), 1);
        c.classes = 4;
        let e = sliding_window(canonical.view(), &model, &c, &CancelToken::new()).unwrap_err();
        assert!(matches!(e, InferError::ModelMismatch(_)));
    }

    #[test]
    fn test_out_of_memory_surfaced() {
        let model = OomModel { patch: (2, 2, 2) };
        let canonical = ramp((4, 4, 4));
        let e = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 2, 2), (2, 2, 2), 4),
            &CancelToken::new(),
        )
        .unwrap_err();
        assert!(matches!(e, InferError::OutOfMemory { batch: 4 }));
    }

    #[test]
    fn test_cancellation() {
        let model = ConstModel {
            patch: (2, 2, 2),
            classes: 3,
        };
        let canonical = ramp((4, 4, 4));
        let cancel = CancelToken::new();
        cancel.cancel();
        let e = sliding_window(
            canonical.view(),
            &model,
            &cfg((2, 2, 2), (2, 2, 2), 1),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(e, InferError::Cancelled));
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(45.678), "45 seconds:678.00 milliseconds");
        assert_eq!(format_elapsed(125.0), "2 minutes,5 seconds");
        assert_eq!(format_elapsed(0.0), "0 seconds:0.00 milliseconds");
        assert_eq!(format_elapsed(60.0), "1 minutes,0 seconds");
    }
}

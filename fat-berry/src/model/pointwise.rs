//! 逐体素线性基线网络.

use super::{Checkpoint, CheckpointError, ModelError, PatchModel};
use crate::consts::{IN_CHANNELS, NUM_CLASSES};
use crate::Idx3d;
use ndarray::{s, Array1, Array2, Array5, ArrayView5, Axis, Ix1, Ix2};

/// 逐体素线性分类头.
///
/// 对每个体素独立计算 `score[c] = sum_i weight[c][i] * x[i] + bias[c]`,
/// 再沿类别轴做 softmax 得到逐类概率. 该网络不含任何空间上下文,
/// 仅用作推理管线与检查点加载的参考实现和联调基线; 生产网络通过
/// [`PatchModel`] 接口从外部接入.
pub struct PointwiseHead {
    /// (class, in_channel).
    weight: Array2<f32>,

    /// (class,).
    bias: Array1<f32>,

    patch: Idx3d,
}

impl PointwiseHead {
    /// 检查点中线性头权重的参数名.
    pub const WEIGHT: &'static str = "head.weight";

    /// 检查点中线性头偏置的参数名.
    pub const BIAS: &'static str = "head.bias";

    /// 从检查点绑定参数. `patch` 为推理时使用的窗口形状.
    pub fn from_checkpoint(ckpt: &mut Checkpoint, patch: Idx3d) -> Result<Self, CheckpointError> {
        let weight = ckpt
            .parameter_with_shape(Self::WEIGHT, &[NUM_CLASSES, IN_CHANNELS])?
            .into_dimensionality::<Ix2>()
            .expect("形状已校验");
        let bias = ckpt
            .parameter_with_shape(Self::BIAS, &[NUM_CLASSES])?
            .into_dimensionality::<Ix1>()
            .expect("形状已校验");
        Ok(Self {
            weight,
            bias,
            patch,
        })
    }

    /// 直接从权重构建 (实验用). `weight` 与 `bias` 的类别数必须一致, 否则 panic.
    pub fn from_parts(weight: Array2<f32>, bias: Array1<f32>, patch: Idx3d) -> Self {
        assert_eq!(weight.nrows(), bias.len());
        assert!(weight.nrows() >= 1 && weight.ncols() >= 1);
        Self {
            weight,
            bias,
            patch,
        }
    }
}

impl PatchModel for PointwiseHead {
    #[inline]
    fn in_channels(&self) -> usize {
        self.weight.ncols()
    }

    #[inline]
    fn class_count(&self) -> usize {
        self.weight.nrows()
    }

    #[inline]
    fn patch_shape(&self) -> Idx3d {
        self.patch
    }

    fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError> {
        let (n, cin, pz, ph, pw) = batch.dim();
        if cin != self.in_channels() {
            return Err(ModelError::Forward(format!(
                "input has {cin} channels, head expects {}",
                self.in_channels()
            )));
        }

        let classes = self.class_count();
        let mut out = Array5::<f32>::zeros((n, classes, pz, ph, pw));
        for b in 0..n {
            for c in 0..classes {
                let mut score = out.slice_mut(s![b, c, .., .., ..]);
                score.fill(self.bias[c]);
                for ci in 0..cin {
                    let w = self.weight[[c, ci]];
                    let x = batch.slice(s![b, ci, .., .., ..]);
                    score.zip_mut_with(&x, |sc, &v| *sc += w * v);
                }
            }
        }

        // 沿类别轴做数值稳定的 softmax.
        for b in 0..n {
            let mut scores = out.index_axis_mut(Axis(0), b);
            for z in 0..pz {
                for h in 0..ph {
                    for w in 0..pw {
                        let mut lane = scores.slice_mut(s![.., z, h, w]);
                        let max = lane.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                        lane.mapv_inplace(|v| (v - max).exp());
                        let sum: f32 = lane.iter().sum();
                        lane.mapv_inplace(|v| v / sum);
                    }
                }
            }
        }
        Ok(out)
    }
}

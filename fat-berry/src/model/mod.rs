//! 分割网络抽象与检查点加载.
//!
//! 网络对本 crate 是不透明的: 只要实现 [`PatchModel`], 任何体积分割
//! 网络都可以接入滑窗推理引擎. crate 自带一个逐体素线性基线
//! ([`PointwiseHead`]) 作为该接口与检查点加载的参考实现.

use crate::Idx3d;
use ndarray::{Array5, ArrayView5};
use std::fmt;

mod checkpoint;
mod pointwise;

pub use checkpoint::{Checkpoint, CheckpointError};
pub use pointwise::PointwiseHead;

/// 批量前向传播错误.
#[derive(Debug)]
pub enum ModelError {
    /// 设备内存不足, 无法容纳当前 batch. 调用方可用更小的 batch 重试.
    OutOfMemory {
        /// 失败时的 batch 大小.
        batch: usize,
    },

    /// 前向传播内部错误.
    Forward(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { batch } => {
                write!(f, "out of device memory at batch size {batch}")
            }
            Self::Forward(msg) => write!(f, "forward pass failed: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

/// 以固定 patch 窗口为输入的体积分割网络.
///
/// 网络被视为不透明纯函数: 输入 `(n, in_channels, pz, ph, pw)` 张量,
/// 输出同空间形状的逐类概率张量 `(n, class_count, pz, ph, pw)`.
/// 进入推理模式后参数只读, 同一实例可被并发调用.
pub trait PatchModel: Send + Sync {
    /// 输入通道数.
    fn in_channels(&self) -> usize;

    /// 输出类别数.
    fn class_count(&self) -> usize;

    /// 固定输入窗口形状, 按 (z, h, w) 顺序.
    fn patch_shape(&self) -> Idx3d;

    /// 批量前向传播.
    ///
    /// 实现必须保证 batch 维大小与输出空间形状与输入一致.
    fn forward(&self, batch: ArrayView5<'_, f32>) -> Result<Array5<f32>, ModelError>;
}

//! 预测投影与离散化.
//!
//! 先把聚合概率体积沿规范化的逆变换送回原生方向 (纯索引双射,
//! 无插值), 再逐体素离散化为类别标签, 得到与原始扫描形状和方向
//! 完全一致的标签体积.

use crate::data::{FatLabel, MrScan, NiftiHeaderAttr};
use crate::infer::AggregatedPrediction;
use crate::orient::CanonicalFrame;
use ndarray::{Array3, ArrayView4};

/// 沿类别轴取 argmax, 并列时取类别 id 最小者.
///
/// 输入形状 `(class, z, h, w)`, 类别数必须在 `1..=256` 内, 否则 panic.
pub fn argmax_classes(probs: ArrayView4<'_, f32>) -> Array3<u8> {
    let (classes, z, h, w) = probs.dim();
    assert!((1..=256).contains(&classes));

    let mut ans = Array3::<u8>::zeros((z, h, w));
    for ((zz, hh, ww), label) in ans.indexed_iter_mut() {
        let mut best = 0usize;
        let mut best_p = probs[[0, zz, hh, ww]];
        for c in 1..classes {
            let p = probs[[c, zz, hh, ww]];
            // 严格大于: 并列时保留更小的类别 id.
            if p > best_p {
                best = c;
                best_p = p;
            }
        }
        *label = best as u8;
    }
    ans
}

/// 将聚合概率体积投影回原生方向并离散化为标签体积.
///
/// `frame` 必须是规范化 `scan` 时记录的同一帧, 否则 panic.
/// 返回的标签体积携带原始扫描的 header, 与其逐体素对齐.
pub fn project(
    aggregated: &AggregatedPrediction,
    frame: &CanonicalFrame,
    scan: &MrScan,
) -> FatLabel {
    assert_eq!(frame.src_shape(), scan.shape(), "规范化帧与扫描不匹配");

    let native = frame.invert_channels(aggregated.probs());
    let label = argmax_classes(native.view());
    debug_assert_eq!(label.dim(), scan.shape());

    FatLabel::from_parts(scan.header(), label)
}

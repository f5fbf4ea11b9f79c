//! 体积定量.
//!
//! 把标签体积的体素计数换算为物理体积 (立方厘米) 与 VAT/SAT 比值.
//! 换算依赖体素的物理分辨率: `voxel_mm3 = sz * sh * sw`,
//! `cm3 = count * voxel_mm3 / 1000`.

use crate::consts::class::*;
use crate::data::{FatLabel, NiftiHeaderAttr};
use ndarray::ArrayView3;
use std::fmt;

/// 内部保留的小数位数.
const INTERNAL_DECIMALS: i32 = 4;

/// 定量错误.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum QuantifyError {
    /// SAT 体积为零, VAT/SAT 比值无定义.
    ///
    /// 该情况应转人工质检处理, 而不是让比值变成 inf/NaN.
    SatVolumeZero,
}

impl fmt::Display for QuantifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SatVolumeZero => write!(f, "SAT volume is zero, VAT/SAT ratio is undefined"),
        }
    }
}

impl std::error::Error for QuantifyError {}

/// 一次管线调用的定量结果. 体积单位为立方厘米, 内部保留四位小数.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FatQuantification {
    /// 内脏脂肪体积 (cm³).
    pub vat_cm3: f64,

    /// 皮下脂肪体积 (cm³).
    pub sat_cm3: f64,

    /// VAT/SAT 体积比.
    pub ratio: f64,
}

/// 展示时保留两位小数.
impl fmt::Display for FatQuantification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VAT (cm³): {:.2}, SAT (cm³): {:.2}, VAT/SAT: {:.2}",
            self.vat_cm3, self.sat_cm3, self.ratio
        )
    }
}

/// 四舍五入到 `decimals` 位小数.
fn round_to(v: f64, decimals: i32) -> f64 {
    let k = 10f64.powi(decimals);
    (v * k).round() / k
}

/// 由标签体积与体素分辨率计算定量结果.
///
/// `pix_dim` 按 (z, h, w) 顺序, 单位毫米, 必须全为正, 否则 panic.
///
/// # 错误
///
/// SAT 体积为零时返回 [`QuantifyError::SatVolumeZero`].
pub fn quantify(
    label: ArrayView3<'_, u8>,
    pix_dim: [f64; 3],
) -> Result<FatQuantification, QuantifyError> {
    assert!(pix_dim.iter().all(|d| d.is_finite() && *d > 0.0));
    let voxel_mm3: f64 = pix_dim.iter().product();

    let mut vat = 0usize;
    let mut sat = 0usize;
    for &p in label.iter() {
        if is_vat(p) {
            vat += 1;
        } else if is_sat(p) {
            sat += 1;
        }
    }

    // mm3 -> cm3.
    let vat_cm3 = round_to(vat as f64 * voxel_mm3 / 1000.0, INTERNAL_DECIMALS);
    let sat_cm3 = round_to(sat as f64 * voxel_mm3 / 1000.0, INTERNAL_DECIMALS);
    if sat_cm3 == 0.0 {
        return Err(QuantifyError::SatVolumeZero);
    }

    Ok(FatQuantification {
        vat_cm3,
        sat_cm3,
        ratio: round_to(vat_cm3 / sat_cm3, INTERNAL_DECIMALS),
    })
}

/// 便捷入口: 直接从 [`FatLabel`] 读取标签数据与体素分辨率.
#[inline]
pub fn quantify_label(label: &FatLabel) -> Result<FatQuantification, QuantifyError> {
    quantify(label.data(), label.pix_dim())
}

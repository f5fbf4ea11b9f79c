//! 通用常量.

use crate::Idx3d;

/// 分割类别体素值.
pub mod class {
    /// 背景的体素值.
    pub const FAT_BACKGROUND: u8 = 0;

    /// 内脏脂肪 (visceral adipose tissue) 的体素值.
    pub const FAT_VAT: u8 = 1;

    /// 皮下脂肪 (subcutaneous adipose tissue) 的体素值.
    pub const FAT_SAT: u8 = 2;

    /// 体素是否是内脏脂肪?
    #[inline]
    pub const fn is_vat(p: u8) -> bool {
        matches!(p, FAT_VAT)
    }

    /// 体素是否是皮下脂肪?
    #[inline]
    pub const fn is_sat(p: u8) -> bool {
        matches!(p, FAT_SAT)
    }

    /// 体素是否是背景?
    #[inline]
    pub const fn is_background(p: u8) -> bool {
        matches!(p, FAT_BACKGROUND)
    }

    /// 体素是否是任意一种脂肪?
    #[inline]
    pub const fn is_fat(p: u8) -> bool {
        matches!(p, FAT_VAT | FAT_SAT)
    }
}

/// 分割类别总数 (背景 + VAT + SAT).
pub const NUM_CLASSES: usize = 3;

/// 网络输入通道数. 腹部 MR 为单模态.
pub const IN_CHANNELS: usize = 1;

/// 默认滑窗 patch 窗口形状, 按内部 (z, h, w) 顺序.
pub const DEFAULT_PATCH: Idx3d = (32, 64, 64);

/// 默认滑窗步长, 相邻 patch 在每一维重叠窗口的 25%.
pub const DEFAULT_STRIDE: Idx3d = (24, 48, 48);

/// 默认单次前向传播的 patch 批大小.
pub const DEFAULT_SW_BATCH: usize = 4;

//! 切片视图与持久化存储.

use crate::consts::class::*;
use crate::Idx2d;
use image::ImageResult;
use ndarray::ArrayView2;
use std::path::Path;

/// 单通道黑色.
const BLACK: u8 = 0b_0000_0000;

/// 单通道灰色.
const GRAY: u8 = 0b_1000_0000;

/// 单通道白色.
const WHITE: u8 = 0b_1111_1111;

/// 灰度显示窗口, 包含窗位 (window level) 和窗宽 (window width).
///
/// MR 强度没有统一标度, 所以窗口一般由扫描自身的强度范围构建.
/// 该窗口是只读的. 若要修改窗口参数, 你应该创建新的实例.
#[derive(Copy, Clone, Debug)]
pub struct VisWindow {
    level: f32,
    width: f32,
}

impl VisWindow {
    /// 构建显示窗口.
    ///
    /// `level` 和 `width` 必须在合理范围内, 否则返回 `None`.
    pub fn new(level: f32, width: f32) -> Option<VisWindow> {
        if (-1e5..=1e5).contains(&level) && 0.0 < width && width <= 1e5 {
            Some(Self { level, width })
        } else {
            None
        }
    }

    /// 由强度区间 `[min, max]` 构建显示窗口. 区间必须非空, 否则返回 `None`.
    #[inline]
    pub fn from_range(min: f32, max: f32) -> Option<VisWindow> {
        Self::new((min + max) / 2.0, max - min)
    }

    /// 窗下限.
    #[inline]
    pub fn lower_bound(&self) -> f32 {
        self.level - self.width / 2.0
    }

    /// 窗上限.
    #[inline]
    pub fn upper_bound(&self) -> f32 {
        self.level + self.width / 2.0
    }

    /// 窗位.
    #[inline]
    pub fn level(&self) -> f32 {
        self.level
    }

    /// 窗宽.
    #[inline]
    pub fn width(&self) -> f32 {
        self.width
    }

    /// 求在当前窗口设置下, 强度 `v` 对应的灰度图像素整数值 (0 <= value <= 255).
    ///
    /// 如果 `v` 无意义 (如 inf, NaN), 则返回 `None`.
    pub fn eval(&self, v: f32) -> Option<u8> {
        if !v.is_finite() {
            return None;
        }
        let lb = self.lower_bound();
        if v <= lb {
            Some(u8::MIN)
        } else if v >= self.upper_bound() {
            Some(u8::MAX)
        } else {
            // 255, not 256.
            Some((((v - lb) / self.width()) * 255.0) as u8)
        }
    }
}

/// 表明一个可以通过 **可视化友好** 模式持久化存储的图像对象.
///
/// 对于仅存在 0, 1, 2 体素值的标签切片, 保存时会映射到肉眼较易区分的灰度.
pub trait ImgWriteVis {
    /// 按照一定的可视化规则将图片保存到 `path` 路径.
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 表明一个可以通过 **按原样** 模式持久化存储的图像对象.
pub trait ImgWriteRaw {
    /// 按原样将图片保存到 `path` 路径.
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()>;
}

/// 使标签像素更有利于单通道可视化.
#[inline]
fn pretty(label: u8) -> u8 {
    match label {
        // 背景为黑色
        FAT_BACKGROUND => BLACK,

        // 内脏脂肪为白色
        FAT_VAT => WHITE,

        // 皮下脂肪为灰色
        FAT_SAT => GRAY,

        any_else => panic!("只允许图像存在 0, 1, 2 标签, 但发现了 `{any_else}`"),
    }
}

/// 3D MR 扫描 z 空间的单张水平切片视图.
#[derive(Copy, Clone, Debug)]
pub struct ScanSlice<'a>(ArrayView2<'a, f32>);

impl<'a> ScanSlice<'a> {
    #[inline]
    pub(crate) fn new(view: ArrayView2<'a, f32>) -> Self {
        Self(view)
    }

    /// 切片形状 (h, w).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.0.dim()
    }

    /// 获取 `idx` 处的强度. 越界时返回 `None`.
    #[inline]
    pub fn get(&self, idx: Idx2d) -> Option<&f32> {
        self.0.get(idx)
    }

    /// 获取带二维索引的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> impl Iterator<Item = (Idx2d, &f32)> {
        self.0.indexed_iter()
    }

    /// 用 `window` 规范化后将切片保存为灰度图.
    pub fn save_windowed<P: AsRef<Path>>(&self, window: VisWindow, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &v) in self.indexed_iter() {
            let gray = window.eval(v).unwrap_or(u8::MIN);
            buf.put_pixel(w as u32, h as u32, image::Luma([gray]));
        }
        buf.save(path)
    }
}

/// 3D 脂肪标签 z 空间的单张水平切片视图.
#[derive(Copy, Clone, Debug)]
pub struct LabelSlice<'a>(ArrayView2<'a, u8>);

impl<'a> LabelSlice<'a> {
    #[inline]
    pub(crate) fn new(view: ArrayView2<'a, u8>) -> Self {
        Self(view)
    }

    /// 切片形状 (h, w).
    #[inline]
    pub fn shape(&self) -> Idx2d {
        self.0.dim()
    }

    /// 获取 `idx` 处的标签. 越界时返回 `None`.
    #[inline]
    pub fn get(&self, idx: Idx2d) -> Option<&u8> {
        self.0.get(idx)
    }

    /// 获取带二维索引的迭代器.
    #[inline]
    pub fn indexed_iter(&self) -> impl Iterator<Item = (Idx2d, &u8)> {
        self.0.indexed_iter()
    }

    /// 获取切片中值为 `label` 的像素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.0.iter().filter(|p| **p == label).count()
    }
}

/// 会将背景/VAT/SAT 像素分别映射为黑色/白色/灰色. 不允许其他颜色.
impl ImgWriteVis for LabelSlice<'_> {
    fn save<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.indexed_iter() {
            buf.put_pixel(w as u32, h as u32, image::Luma([pretty(pix)]));
        }
        buf.save(path)
    }
}

/// 按原样存储.
impl ImgWriteRaw for LabelSlice<'_> {
    fn save_raw<P: AsRef<Path>>(&self, path: P) -> ImageResult<()> {
        let (height, width) = self.shape();
        let mut buf = image::GrayImage::new(width as u32, height as u32);
        for ((h, w), &pix) in self.indexed_iter() {
            buf.put_pixel(w as u32, h as u32, image::Luma([pix]));
        }
        buf.save(path)
    }
}

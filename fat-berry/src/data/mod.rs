use std::fmt;
use std::ops::Index;
use std::path::Path;

use ndarray::{Array3, ArrayView, Axis, Ix3};
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::consts::class::*;
use crate::{Idx2d, Idx3d};

mod slice;

pub use slice::{ImgWriteRaw, ImgWriteVis, LabelSlice, ScanSlice, VisWindow};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 将 (W, H, z) 转换成 (z, H, W). 以后均按照该模式访问.
#[inline]
fn get_shape_from_header(h: &NiftiHeader) -> Idx3d {
    // [W, H, z]. 体素个数数组.
    let [_, w, h, z, ..] = h.dim;
    (z as usize, h as usize, w as usize)
}

/// 打开 nii 体积错误.
#[derive(Debug)]
pub enum OpenVolumeError {
    /// 底层 nifti 读取错误.
    Nifti(nifti::NiftiError),

    /// 体素分辨率缺失或非正. 参数按 (z, h, w) 顺序, 单位毫米.
    NonPositiveSpacing([f64; 3]),
}

impl fmt::Display for OpenVolumeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nifti(e) => write!(f, "nifti read error: {e}"),
            Self::NonPositiveSpacing(d) => {
                write!(f, "voxel spacing must be positive, got {d:?} mm")
            }
        }
    }
}

impl std::error::Error for OpenVolumeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nifti(e) => Some(e),
            Self::NonPositiveSpacing(_) => None,
        }
    }
}

impl From<nifti::NiftiError> for OpenVolumeError {
    #[inline]
    fn from(e: nifti::NiftiError) -> Self {
        Self::Nifti(e)
    }
}

/// 3D nii 文件 header 的共用属性和部分通用操作.
pub trait NiftiHeaderAttr {
    /// 获取 header 部分.
    fn header(&self) -> &NiftiHeader;

    /// 获取数据形状大小.
    #[inline]
    fn shape(&self) -> Idx3d {
        get_shape_from_header(self.header())
    }

    /// 获取数据水平切片形状大小.
    #[inline]
    fn slice_shape(&self) -> Idx2d {
        let (_, h, w) = self.shape();
        (h, w)
    }

    /// 获取水平切片个数.
    #[inline]
    fn len_z(&self) -> usize {
        self.shape().0
    }

    /// 获取数据体素个数.
    #[inline]
    fn size(&self) -> usize {
        let (z, h, w) = self.shape();
        z * h * w
    }

    /// 检查索引是否合法.
    #[inline]
    fn check(&self, (z0, h0, w0): &Idx3d) -> bool {
        let (z, h, w) = self.shape();
        *z0 < z && *h0 < h && *w0 < w
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 分别代表空间 (相邻切片方向),
    /// 高 (自然图像的垂直方向), 宽 (自然图像的水平方向).
    #[inline]
    fn pix_dim(&self) -> [f64; 3] {
        let [_, w, h, z, ..] = self.header().pixdim;
        [z as f64, h as f64, w as f64]
    }

    /// 获取 width 方向 (自然 2D 图像的水平方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn width_mm(&self) -> f64 {
        self.header().pixdim[1] as f64
    }

    /// 获取 height 方向 (自然 2D 图像的垂直方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn height_mm(&self) -> f64 {
        self.header().pixdim[2] as f64
    }

    /// 获取空间方向 (相邻 2D 切片的方向) 体素分辨率, 以毫米为单位.
    #[inline]
    fn z_mm(&self) -> f64 {
        self.header().pixdim[3] as f64
    }

    /// 体素分辨率在三个维度上是否是各向同的?
    #[inline]
    fn is_isotropic(&self) -> bool {
        let [z, h, w] = self.pix_dim();
        z == h && z == w
    }

    /// 体素分辨率是否全部为正且有限?
    #[inline]
    fn spacing_is_valid(&self) -> bool {
        self.pix_dim().iter().all(|d| d.is_finite() && *d > 0.0)
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 获取水平切片方向的像素实际面积值, 以平方毫米为单位.
    #[inline]
    fn slice_pixel(&self) -> f64 {
        self.pix_dim().iter().skip(1).product()
    }
}

/// 构建合成数据用的最小 header. `shape` 按 (z, h, w), `pix_dim` 按 (w, h, z).
fn fake_header(shape: Idx3d, pix_dim: [f32; 3]) -> BoxedHeader {
    let mut header = Box::<NiftiHeader>::default();
    let (z, h, w) = shape;
    header.dim = [3, w as u16, h as u16, z as u16, 1, 1, 1, 1];
    let [pw, ph, pz] = pix_dim;
    header.pixdim = [1.0, pw, ph, pz, 0.0, 0.0, 0.0, 0.0];
    // 双方向编码均缺省: 方向解析退回 pixdim 对角阵 (RAS 恒等).
    header.sform_code = 0;
    header.qform_code = 0;
    header.intent_name[..4].copy_from_slice(b"fake");
    header
}

/// nii 格式 3D MR 扫描, 包括 header 和强度数据. 强度值以 `f32` 保存.
///
/// 该结构是管线的输入端: 创建后只读, 生命期覆盖单次管线调用.
#[derive(Debug, Clone)]
pub struct MrScan {
    header: BoxedHeader,
    data: Array3<f32>,
}

impl NiftiHeaderAttr for MrScan {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for MrScan {
    type Output = f32;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl MrScan {
    /// 打开 nii 文件格式的 3D MR 扫描. `path` 为 nii 文件的本地路径.
    ///
    /// 除底层读取错误外, 体素分辨率缺失或非正也是加载错误.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OpenVolumeError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W].
        // hint: 原第一维向下增长, 原第二维向右增长.
        let data = obj
            .into_volume()
            .into_ndarray::<f32>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data =
            Array3::<f32>::from_shape_vec(get_shape_from_header(&header), data.into_raw_vec())
                .unwrap();

        let ans = Self { header, data };
        if !ans.spacing_is_valid() {
            return Err(OpenVolumeError::NonPositiveSpacing(ans.pix_dim()));
        }
        Ok(ans)
    }

    /// 根据裸强度数据直接创建实体.
    ///
    /// # 参数
    ///
    /// 1. `data` 按内部惯例以 (z, h, w) 格式组织;
    /// 2. `pix_dim` 按 nifti header 惯例以 (w, h, z) 格式存储, 必须全为正.
    ///
    /// # 注意
    ///
    /// 该方法可能会创建不一致的实体, 因此你应仅将其用于实验目的.
    pub fn fake(data: Array3<f32>, pix_dim: [f32; 3]) -> Self {
        assert!(pix_dim.iter().all(|d| *d > 0.0));
        let header = fake_header(data.dim(), pix_dim);
        Self { header, data }
    }

    /// 直接创建数据. `header` 必须与 `data` 的 (z, h, w) 形状一致, 否则 panic.
    pub fn fake_with_header(header: &NiftiHeader, data: Array3<f32>) -> Self {
        assert_eq!(get_shape_from_header(header), data.dim());
        let mut header = Box::new(header.clone());
        header.intent_name[..4].copy_from_slice(b"fake");
        Self { header, data }
    }

    /// 判断该结构是否是由 `fake_*` 方法手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 获取 3D 扫描 z 空间的第 `z_index` 层切片视图.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, z_index: usize) -> ScanSlice<'_> {
        ScanSlice::new(self.data.index_axis(Axis(0), z_index))
    }

    /// 获取能按升序迭代 3D 扫描水平切片的迭代器.
    #[inline]
    pub fn slice_iter(&self) -> impl ExactSizeIterator<Item = ScanSlice<'_>> {
        self.data.axis_iter(Axis(0)).map(ScanSlice::new)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, f32, Ix3> {
        self.data.view()
    }

    /// 扫描强度的最小值与最大值. 空扫描返回 `None`.
    pub fn intensity_range(&self) -> Option<(f32, f32)> {
        let mut it = self.data.iter().copied().filter(|v| v.is_finite());
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
    }
}

/// nii 格式 3D 脂肪标签, 包括 header 和离散类别数据. 标签值以 `u8` 保存.
///
/// 体素值只允许 0 (背景), 1 (VAT), 2 (SAT).
#[derive(Debug, Clone)]
pub struct FatLabel {
    header: BoxedHeader,
    data: Array3<u8>,
}

impl NiftiHeaderAttr for FatLabel {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }
}

impl Index<Idx3d> for FatLabel {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl FatLabel {
    /// 打开 nii 文件格式的 3D 脂肪标签. `path` 为 nii 文件的本地路径.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OpenVolumeError> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = Box::new(obj.header().clone());

        // [W, H, z] -> [z, H, W]
        let data = obj
            .into_volume()
            .into_ndarray::<u8>()?
            .permuted_axes([2, 1, 0].as_slice());

        // The nature of nifti data field layout.
        debug_assert!(data.is_standard_layout());

        // 该操作不会生成 `Err`, 可直接 unwrap.
        let data =
            Array3::<u8>::from_shape_vec(get_shape_from_header(&header), data.into_raw_vec())
                .unwrap();

        let ans = Self { header, data };
        if !ans.spacing_is_valid() {
            return Err(OpenVolumeError::NonPositiveSpacing(ans.pix_dim()));
        }
        Ok(ans)
    }

    /// 由 header 与 (z, h, w) 格式的标签数据直接创建实体.
    ///
    /// `header` 的 dim 必须与 `data` 形状一致, 否则 panic.
    /// `data` 的体素值必须为 0, 1 或 2, 否则下游行为未定义.
    pub fn from_parts(header: &NiftiHeader, data: Array3<u8>) -> Self {
        assert_eq!(get_shape_from_header(header), data.dim());
        Self {
            header: Box::new(header.clone()),
            data,
        }
    }

    /// 根据裸标签数据直接创建实体 (实验用).
    ///
    /// `data` 按 (z, h, w) 格式组织, `pix_dim` 按 (w, h, z) 格式存储.
    pub fn fake(data: Array3<u8>, pix_dim: [f32; 3]) -> Self {
        assert!(pix_dim.iter().all(|d| *d > 0.0));
        let header = fake_header(data.dim(), pix_dim);
        Self { header, data }
    }

    /// 获取 3D 标签 z 空间的第 `z_index` 层切片视图.
    ///
    /// 当 `z_index` 越界时 panic.
    #[inline]
    pub fn slice_at(&self, z_index: usize) -> LabelSlice<'_> {
        LabelSlice::new(self.data.index_axis(Axis(0), z_index))
    }

    /// 获取能按升序迭代 3D 标签水平切片的迭代器.
    #[inline]
    pub fn slice_iter(&self) -> impl ExactSizeIterator<Item = LabelSlice<'_>> {
        self.data.axis_iter(Axis(0)).map(LabelSlice::new)
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView<'_, u8, Ix3> {
        self.data.view()
    }

    /// 获取 3D 标签中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 获取标签的基本统计信息.
    ///
    /// 统计信息格式为: \[背景体素数, VAT 体素数, SAT 体素数\].
    /// 该操作不会统计任何其他体素信息.
    pub fn numeric_statistics(&self) -> [usize; 3] {
        let mut ans = [0; 3];
        for pixel in self.data.iter().filter(|p| **p <= FAT_SAT) {
            ans[*pixel as usize] += 1;
        }
        ans
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn test_fake_scan_attrs() {
        let data = Array3::<f32>::zeros((4, 6, 8));
        let scan = MrScan::fake(data, [2.0, 3.0, 5.0]);
        assert!(scan.is_faked());
        assert_eq!(scan.shape(), (4, 6, 8));
        assert_eq!(scan.slice_shape(), (6, 8));
        assert_eq!(scan.len_z(), 4);
        assert_eq!(scan.size(), 4 * 6 * 8);
        assert_eq!(scan.pix_dim(), [5.0, 3.0, 2.0]);
        assert!((scan.voxel() - 30.0).abs() < 1e-12);
        assert!(!scan.is_isotropic());
        assert!(scan.spacing_is_valid());
    }

    #[test]
    fn test_label_statistics() {
        let mut data = Array3::<u8>::zeros((2, 3, 3));
        data[(0, 0, 0)] = FAT_VAT;
        data[(0, 0, 1)] = FAT_VAT;
        data[(1, 2, 2)] = FAT_SAT;
        let label = FatLabel::fake(data, [1.0, 1.0, 1.0]);

        assert_eq!(label.count(FAT_VAT), 2);
        assert_eq!(label.count(FAT_SAT), 1);
        assert_eq!(label.numeric_statistics(), [15, 2, 1]);

        // 类别计数之和等于总体素数.
        assert_eq!(label.numeric_statistics().iter().sum::<usize>(), label.size());
    }

    #[test]
    fn test_slice_access() {
        let mut data = Array3::<u8>::zeros((2, 2, 2));
        data[(1, 0, 1)] = FAT_SAT;
        let label = FatLabel::fake(data, [1.0, 1.0, 1.0]);

        assert_eq!(label.slice_at(0).count(FAT_SAT), 0);
        assert_eq!(label.slice_at(1).count(FAT_SAT), 1);
        assert_eq!(label.slice_iter().len(), 2);
    }
}

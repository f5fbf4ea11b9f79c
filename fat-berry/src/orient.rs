//! 体积方向规范化.
//!
//! 从 nifti header 解析三个数据轴的世界方向编码, 构建把任意方向体积
//! 映射到固定 RAS 规范方向的置换/翻转双射, 并记录精确逆变换.
//! 整个过程是纯索引操作, 不做任何重采样或插值, 因此下游体素计数
//! 可以逐位往返.

use crate::data::{MrScan, NiftiHeaderAttr};
use crate::Idx3d;
use ndarray::{Array3, Array4, ArrayView3, ArrayView4, Axis};
use nifti::NiftiHeader;
use std::fmt;

/// 单个数据轴的方向编码: `(世界轴, 是否沿正向递增)`.
///
/// 世界轴 0/1/2 分别代表 Right/Anterior/Superior.
pub type AxisCode = (usize, bool);

/// 方向规范化错误.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OrientationError {
    /// 方向矩阵第 `n` 列退化 (全零或非有限), 对应数据轴的方向无法解析.
    ZeroColumn(usize),

    /// 多个数据轴映射到同一个世界轴 `n`, 方向矩阵退化.
    DuplicateAxis(usize),
}

impl fmt::Display for OrientationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroColumn(n) => write!(f, "direction matrix column {n} is degenerate"),
            Self::DuplicateAxis(n) => {
                write!(f, "multiple data axes map to the same world axis {n}")
            }
        }
    }
}

impl std::error::Error for OrientationError {}

/// 从 header 提取 3x3 方向矩阵 (文件轴 -> RAS 世界轴).
///
/// 优先使用 sform 行矩阵, 其次是 qform 四元数; 两者编码均缺省时
/// 退回 pixdim 对角阵 (即 RAS 恒等方向).
fn direction_matrix(header: &NiftiHeader) -> [[f64; 3]; 3] {
    if header.sform_code > 0 {
        let rows = [&header.srow_x, &header.srow_y, &header.srow_z];
        let mut m = [[0.0; 3]; 3];
        for (i, row) in rows.iter().enumerate() {
            for j in 0..3 {
                m[i][j] = row[j] as f64;
            }
        }
        m
    } else if header.qform_code > 0 {
        let (b, c, d) = (
            header.quatern_b as f64,
            header.quatern_c as f64,
            header.quatern_d as f64,
        );
        let a = (1.0 - b * b - c * c - d * d).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let r = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        let mut m = [[0.0; 3]; 3];
        for i in 0..3 {
            for j in 0..3 {
                let scale = header.pixdim[j + 1] as f64;
                let scale = if j == 2 { scale * qfac } else { scale };
                m[i][j] = r[i][j] * scale;
            }
        }
        m
    } else {
        let mut m = [[0.0; 3]; 3];
        for j in 0..3 {
            m[j][j] = header.pixdim[j + 1] as f64;
        }
        m
    }
}

/// 解析文件轴顺序 (i, j, k) 的三个数据轴方向编码.
fn file_axis_codes(header: &NiftiHeader) -> Result<[AxisCode; 3], OrientationError> {
    let m = direction_matrix(header);
    let mut codes = [(0usize, true); 3];
    let mut taken = [false; 3];
    for j in 0..3 {
        let col = [m[0][j], m[1][j], m[2][j]];
        let (mut dominant, mut best) = (0usize, 0.0f64);
        for (i, v) in col.iter().enumerate() {
            if v.abs() > best {
                dominant = i;
                best = v.abs();
            }
        }
        if best == 0.0 || !best.is_finite() {
            return Err(OrientationError::ZeroColumn(j));
        }
        if taken[dominant] {
            return Err(OrientationError::DuplicateAxis(dominant));
        }
        taken[dominant] = true;
        codes[j] = (dominant, col[dominant] > 0.0);
    }
    Ok(codes)
}

/// 解析内部存储 (z, h, w) 顺序的三个数据轴方向编码.
///
/// 存储轴 a 对应文件轴 2 - a.
pub fn axis_codes(header: &NiftiHeader) -> Result<[AxisCode; 3], OrientationError> {
    let f = file_axis_codes(header)?;
    Ok([f[2], f[1], f[0]])
}

/// 规范化帧: 把原生 (z, h, w) 数组映射到 RAS 规范方向的置换/翻转双射,
/// 及其精确逆变换.
///
/// 规范方向下, 存储轴 0/1/2 分别沿 Superior/Anterior/Right 方向递增,
/// 即文件轴顺序的 "RAS". 正反变换都是纯索引操作, 应用正变换后再应用
/// 逆变换可逐位还原原数组.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanonicalFrame {
    /// `perm[d]` = 规范轴 d 的数据来自源数组的哪个存储轴.
    perm: [usize; 3],

    /// 规范轴 d 上是否需要反转索引方向.
    flip: [bool; 3],

    /// 源数组形状 (z, h, w).
    src_shape: Idx3d,
}

impl CanonicalFrame {
    /// 由 header 与源形状构建规范化帧.
    pub fn from_header(header: &NiftiHeader, src_shape: Idx3d) -> Result<Self, OrientationError> {
        Ok(Self::from_codes(axis_codes(header)?, src_shape))
    }

    /// 由存储轴方向编码构建规范化帧.
    ///
    /// `codes` 必须恰好覆盖三个世界轴, 否则 panic
    /// (从 [`axis_codes`] 得到的编码总是满足该条件).
    pub fn from_codes(codes: [AxisCode; 3], src_shape: Idx3d) -> Self {
        // 规范存储轴 0/1/2 的目标世界轴: Superior/Anterior/Right.
        const TARGET: [usize; 3] = [2, 1, 0];

        let mut perm = [0usize; 3];
        let mut flip = [false; 3];
        for d in 0..3 {
            let s = codes
                .iter()
                .position(|&(axis, _)| axis == TARGET[d])
                .expect("方向编码必须恰好覆盖三个世界轴");
            perm[d] = s;
            flip[d] = !codes[s].1;
        }
        Self {
            perm,
            flip,
            src_shape,
        }
    }

    /// 源数组形状 (z, h, w).
    #[inline]
    pub fn src_shape(&self) -> Idx3d {
        self.src_shape
    }

    /// 规范化后的数组形状.
    #[inline]
    pub fn canonical_shape(&self) -> Idx3d {
        let s = [self.src_shape.0, self.src_shape.1, self.src_shape.2];
        (s[self.perm[0]], s[self.perm[1]], s[self.perm[2]])
    }

    /// 该帧是否为恒等变换?
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.perm == [0, 1, 2] && self.flip == [false; 3]
    }

    /// 施加正变换, 返回规范方向下的新数组.
    ///
    /// `src` 形状必须等于 [`Self::src_shape`], 否则 panic.
    pub fn apply<T: Clone>(&self, src: ArrayView3<'_, T>) -> Array3<T> {
        assert_eq!(src.dim(), self.src_shape, "输入形状与规范化帧不一致");
        let mut v = src.permuted_axes(self.perm);
        for (d, &f) in self.flip.iter().enumerate() {
            if f {
                v.invert_axis(Axis(d));
            }
        }
        v.as_standard_layout().to_owned()
    }

    /// 施加逆变换, 精确还原源方向下的数组.
    ///
    /// `canonical` 形状必须等于 [`Self::canonical_shape`], 否则 panic.
    pub fn invert<T: Clone>(&self, canonical: ArrayView3<'_, T>) -> Array3<T> {
        assert_eq!(
            canonical.dim(),
            self.canonical_shape(),
            "输入形状与规范化帧不一致"
        );
        // 先还原翻转, 再做逆置换.
        let mut v = canonical;
        for (d, &f) in self.flip.iter().enumerate() {
            if f {
                v.invert_axis(Axis(d));
            }
        }
        let mut inv = [0usize; 3];
        for (d, &s) in self.perm.iter().enumerate() {
            inv[s] = d;
        }
        v.permuted_axes(inv).to_owned()
    }

    /// 对带类别通道的 `(c, z, h, w)` 体积施加逆变换, 通道轴保持不动.
    ///
    /// 空间形状必须等于 [`Self::canonical_shape`], 否则 panic.
    pub fn invert_channels<T: Clone>(&self, canonical: ArrayView4<'_, T>) -> Array4<T> {
        let (_, z, h, w) = canonical.dim();
        assert_eq!(
            (z, h, w),
            self.canonical_shape(),
            "输入空间形状与规范化帧不一致"
        );
        let mut v = canonical;
        for (d, &f) in self.flip.iter().enumerate() {
            if f {
                v.invert_axis(Axis(d + 1));
            }
        }
        let mut inv = [0usize; 4];
        for (d, &s) in self.perm.iter().enumerate() {
            inv[s + 1] = d + 1;
        }
        v.permuted_axes(inv).to_owned()
    }
}

/// 将扫描规范化到 RAS 方向, 返回规范方向数组与可逆的规范化帧.
pub fn canonicalize(scan: &MrScan) -> Result<(Array3<f32>, CanonicalFrame), OrientationError> {
    let frame = CanonicalFrame::from_header(scan.header(), scan.shape())?;
    let canonical = frame.apply(scan.data());
    Ok((canonical, frame))
}

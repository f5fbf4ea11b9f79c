//! 人工质检记录.
//!
//! 评审会话逐切片为 VAT 与 SAT 分割质量打 1~5 分, 并为每种组织给出
//! 最终 Pass/Fail 判定. 记录以单行 CSV 持久化, 其表头与数据行格式是
//! 下游统计工具依赖的稳定契约:
//!
//! ```text
//! file_name,vat_final,sat_final,slice_vat_0,slice_sat_0,slice_vat_1,...
//! case3.nii,Pass,Fail,0,3,5,4,...
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// 单张切片的 1~5 评分. 0 代表未评分.
pub type SliceRating = u8;

/// 单种组织的质检终判.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FinalCheck {
    /// 分割质量可接受.
    Pass,

    /// 分割质量不可接受.
    Fail,
}

impl FinalCheck {
    /// CSV 中的字面表示.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "Pass",
            Self::Fail => "Fail",
        }
    }
}

/// 一次人工质检会话的完整记录.
#[derive(Clone, Debug)]
pub struct QualityRecord {
    volume_file_name: String,
    slice_vat: Vec<SliceRating>,
    slice_sat: Vec<SliceRating>,
    final_vat: Option<FinalCheck>,
    final_sat: Option<FinalCheck>,
}

impl QualityRecord {
    /// 创建全部未评分的记录.
    ///
    /// `volume_path` 是原始扫描路径 (CSV 只记录其文件名),
    /// `len_z` 是水平切片个数.
    pub fn new(volume_path: &Path, len_z: usize) -> Self {
        let volume_file_name = volume_path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            volume_file_name,
            slice_vat: vec![0; len_z],
            slice_sat: vec![0; len_z],
            final_vat: None,
            final_sat: None,
        }
    }

    /// 水平切片个数.
    #[inline]
    pub fn len_z(&self) -> usize {
        self.slice_vat.len()
    }

    /// 为第 `z` 张切片的 VAT 分割打分.
    ///
    /// `rating` 必须在 1..=5 内且 `z` 不越界, 否则 panic.
    pub fn rate_vat(&mut self, z: usize, rating: SliceRating) {
        assert!((1..=5).contains(&rating), "评分 `{rating}` 越界");
        self.slice_vat[z] = rating;
    }

    /// 为第 `z` 张切片的 SAT 分割打分.
    ///
    /// `rating` 必须在 1..=5 内且 `z` 不越界, 否则 panic.
    pub fn rate_sat(&mut self, z: usize, rating: SliceRating) {
        assert!((1..=5).contains(&rating), "评分 `{rating}` 越界");
        self.slice_sat[z] = rating;
    }

    /// 第 `z` 张切片的 VAT 评分. 0 代表未评分.
    #[inline]
    pub fn vat_rating(&self, z: usize) -> SliceRating {
        self.slice_vat[z]
    }

    /// 第 `z` 张切片的 SAT 评分. 0 代表未评分.
    #[inline]
    pub fn sat_rating(&self, z: usize) -> SliceRating {
        self.slice_sat[z]
    }

    /// 记录 VAT 终判.
    #[inline]
    pub fn set_final_vat(&mut self, check: FinalCheck) {
        self.final_vat = Some(check);
    }

    /// 记录 SAT 终判.
    #[inline]
    pub fn set_final_sat(&mut self, check: FinalCheck) {
        self.final_sat = Some(check);
    }

    /// VAT 终判.
    #[inline]
    pub fn final_vat(&self) -> Option<FinalCheck> {
        self.final_vat
    }

    /// SAT 终判.
    #[inline]
    pub fn final_sat(&self) -> Option<FinalCheck> {
        self.final_sat
    }

    /// 由预测文件路径导出质检 CSV 路径.
    ///
    /// 规则: 去掉 `.nii`/`.nii.gz` 扩展名与 `_pred` 后缀, 追加
    /// `_quality_check.csv`, 目录与预测文件相同. 文件名无法解析时
    /// 返回 `None`.
    pub fn csv_path(mask_path: &Path) -> Option<PathBuf> {
        let name = mask_path.file_name()?.to_str()?;
        let stem = name
            .strip_suffix(".nii.gz")
            .or_else(|| name.strip_suffix(".nii"))?;
        let stem = stem.strip_suffix("_pred").unwrap_or(stem);
        Some(mask_path.with_file_name(format!("{stem}_quality_check.csv")))
    }

    /// 把记录写成 CSV 文本.
    pub fn write_into<W: Write>(&self, w: &mut W) -> io::Result<()> {
        // 表头.
        write!(w, "file_name,vat_final,sat_final")?;
        for i in 0..self.len_z() {
            write!(w, ",slice_vat_{i},slice_sat_{i}")?;
        }
        writeln!(w)?;

        // 数据行.
        write!(w, "{}", self.volume_file_name)?;
        for check in [self.final_vat, self.final_sat] {
            write!(w, ",{}", check.map(|c| c.as_str()).unwrap_or(""))?;
        }
        for i in 0..self.len_z() {
            write!(w, ",{},{}", self.slice_vat[i], self.slice_sat[i])?;
        }
        writeln!(w)
    }

    /// 把记录保存为 `mask_path` 旁的质检 CSV, 返回其路径.
    pub fn save_csv(&self, mask_path: &Path) -> io::Result<PathBuf> {
        let path = Self::csv_path(mask_path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "无法从预测文件名导出质检文件名")
        })?;
        let mut w = BufWriter::new(File::create(&path)?);
        self.write_into(&mut w)?;
        w.flush()?;
        Ok(path)
    }
}

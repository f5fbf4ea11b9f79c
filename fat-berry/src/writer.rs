//! 预测标签体积的持久化写出.
//!
//! 标签体积携带原始扫描的 header 写出, 因此任何查看器把预测叠加到
//! 原扫描上时都能逐体素对齐. 写出遵循 "临时文件 + 重命名" 纪律:
//! 任何失败都不会留下半成品目标文件.

use crate::data::{FatLabel, NiftiHeaderAttr};
use nifti::writer::WriterOptions;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// 写出错误.
#[derive(Debug)]
pub enum WriteError {
    /// 输出目录不存在或不是目录.
    NotADirectory(PathBuf),

    /// 输入体积文件名无法解析 (不是 `.nii` / `.nii.gz`).
    BadVolumeName(PathBuf),

    /// 底层 nifti 写出错误.
    Nifti(nifti::NiftiError),

    /// 重命名临时文件等底层 I/O 错误.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotADirectory(p) => write!(f, "`{}` is not a directory", p.display()),
            Self::BadVolumeName(p) => {
                write!(f, "`{}` is not a nii/nii.gz file name", p.display())
            }
            Self::Nifti(e) => write!(f, "nifti write error: {e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nifti(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// 拆分 nifti 文件名: `"case3.nii.gz"` -> `("case3", "nii.gz")`.
fn split_nifti_name(file_name: &str) -> Option<(&str, &str)> {
    if let Some(stem) = file_name.strip_suffix(".nii.gz") {
        Some((stem, "nii.gz"))
    } else {
        file_name.strip_suffix(".nii").map(|stem| (stem, "nii"))
    }
}

/// 由输入体积路径导出预测文件路径: `<out_dir>/<stem>_pred.<ext>`.
///
/// 扩展名沿用输入体积 (`.nii` 或 `.nii.gz`).
pub fn predicted_path(volume_path: &Path, out_dir: &Path) -> Result<PathBuf, WriteError> {
    let name = volume_path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| WriteError::BadVolumeName(volume_path.to_owned()))?;
    let (stem, ext) = split_nifti_name(name)
        .ok_or_else(|| WriteError::BadVolumeName(volume_path.to_owned()))?;
    Ok(out_dir.join(format!("{stem}_pred.{ext}")))
}

/// 把标签体积按其 header 写出到 `dest`.
///
/// 先写入同目录下的隐藏临时文件 (保留扩展名后缀以维持压缩判定),
/// 成功后原子重命名到 `dest`.
pub fn write_label(label: &FatLabel, dest: &Path) -> Result<(), WriteError> {
    let dir = dest
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .map(Path::to_owned)
        .unwrap_or_else(|| PathBuf::from("."));
    if !dir.is_dir() {
        return Err(WriteError::NotADirectory(dir));
    }
    let file_name = dest
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| WriteError::BadVolumeName(dest.to_owned()))?;
    let tmp = dir.join(format!(".tmp_{file_name}"));

    // 内部 (z, h, w) -> nifti 惯例 (w, h, z).
    let data = label.data().permuted_axes([2, 1, 0]);
    let written = WriterOptions::new(&tmp)
        .reference_header(label.header())
        .write_nifti(&data);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(WriteError::Nifti(e));
    }

    fs::rename(&tmp, dest).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        WriteError::Io(e)
    })
}

/// 组合入口: 导出命名并写出, 返回预测文件的最终路径.
pub fn write_prediction(
    label: &FatLabel,
    volume_path: &Path,
    out_dir: &Path,
) -> Result<PathBuf, WriteError> {
    let dest = predicted_path(volume_path, out_dir)?;
    write_label(label, &dest)?;
    Ok(dest)
}

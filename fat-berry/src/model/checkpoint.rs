//! 模型检查点加载.
//!
//! 检查点是以参数名为键的 npz 档案. 分布式训练导出的参数名带有
//! 字面 `module.` 前缀, 加载时统一去除后再按名绑定.

use ndarray::{ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, ReadNpzError};
use std::fmt;
use std::fs::File;
use std::path::Path;

/// 分布式训练导出时附加在参数名前的字面前缀.
const DISTRIBUTED_PREFIX: &str = "module.";

/// 打开/绑定模型检查点错误.
#[derive(Debug)]
pub enum CheckpointError {
    /// 底层 I/O 错误.
    Io(std::io::Error),

    /// npz 档案读取错误.
    Npz(ReadNpzError),

    /// 去除 `module.` 前缀后仍然找不到所需参数.
    MissingParameter(String),

    /// 参数形状与网络配置不一致.
    ShapeMismatch {
        /// 参数名 (去前缀后).
        name: String,
        /// 网络配置要求的形状.
        expected: Vec<usize>,
        /// 档案中的实际形状.
        actual: Vec<usize>,
    },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "checkpoint io error: {e}"),
            Self::Npz(e) => write!(f, "checkpoint archive error: {e}"),
            Self::MissingParameter(name) => {
                write!(f, "required parameter `{name}` missing from checkpoint")
            }
            Self::ShapeMismatch {
                name,
                expected,
                actual,
            } => write!(
                f,
                "parameter `{name}` has shape {actual:?}, expected {expected:?}"
            ),
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Npz(e) => Some(e),
            _ => None,
        }
    }
}

/// 模型检查点档案.
///
/// 打开时为所有条目建立 "去前缀参数名 -> 档案原始条目名" 的索引,
/// 之后按去前缀名读取参数张量.
pub struct Checkpoint {
    reader: NpzReader<File>,

    /// (去前缀参数名, 档案内原始条目名).
    names: Vec<(String, String)>,
}

/// 规范化档案条目名: 去掉可选的 `.npy` 后缀与 `module.` 前缀.
fn logical_name(raw: &str) -> &str {
    let name = raw.strip_suffix(".npy").unwrap_or(raw);
    name.strip_prefix(DISTRIBUTED_PREFIX).unwrap_or(name)
}

impl Checkpoint {
    /// 打开检查点档案并建立参数名索引.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let file = File::open(path.as_ref()).map_err(CheckpointError::Io)?;
        let mut reader = NpzReader::new(file).map_err(CheckpointError::Npz)?;
        let names = reader
            .names()
            .map_err(CheckpointError::Npz)?
            .into_iter()
            .map(|raw| (logical_name(&raw).to_owned(), raw))
            .collect();
        Ok(Self { reader, names })
    }

    /// 所有 (去前缀后的) 参数名.
    #[inline]
    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|(name, _)| name.as_str())
    }

    /// 档案中的参数个数.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// 档案是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 按去前缀参数名读取参数张量.
    pub fn parameter(&mut self, name: &str) -> Result<ArrayD<f32>, CheckpointError> {
        let raw = self
            .names
            .iter()
            .find(|(logical, _)| logical == name)
            .map(|(_, raw)| raw.clone())
            .ok_or_else(|| CheckpointError::MissingParameter(name.to_owned()))?;
        self.reader
            .by_name::<OwnedRepr<f32>, IxDyn>(&raw)
            .map_err(CheckpointError::Npz)
    }

    /// 按名读取参数张量, 并校验其形状.
    pub fn parameter_with_shape(
        &mut self,
        name: &str,
        expected: &[usize],
    ) -> Result<ArrayD<f32>, CheckpointError> {
        let arr = self.parameter(name)?;
        if arr.shape() != expected {
            return Err(CheckpointError::ShapeMismatch {
                name: name.to_owned(),
                expected: expected.to_vec(),
                actual: arr.shape().to_vec(),
            });
        }
        Ok(arr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};
    use ndarray_npy::NpzWriter;

    /// 写一个带 `module.` 前缀的迷你检查点.
    fn sample_checkpoint(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("model.npz");
        let mut npz = NpzWriter::new(std::fs::File::create(&path).unwrap());
        npz.add_array("module.head.weight", &arr2(&[[1.0f32], [2.0], [3.0]]))
            .unwrap();
        npz.add_array("module.head.bias", &arr1(&[0.5f32, -0.5, 0.0]))
            .unwrap();
        npz.finish().unwrap();
        path
    }

    #[test]
    fn test_prefix_stripping() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpoint::open(sample_checkpoint(dir.path())).unwrap();
        let mut names: Vec<&str> = ckpt.parameter_names().collect();
        names.sort_unstable();
        assert_eq!(names, ["head.bias", "head.weight"]);
        assert_eq!(ckpt.len(), 2);
    }

    #[test]
    fn test_parameter_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = Checkpoint::open(sample_checkpoint(dir.path())).unwrap();

        let weight = ckpt.parameter_with_shape("head.weight", &[3, 1]).unwrap();
        assert_eq!(weight.shape(), [3, 1]);
        assert_eq!(weight[[2, 0]], 3.0);

        match ckpt.parameter("head.gamma") {
            Err(CheckpointError::MissingParameter(name)) => assert_eq!(name, "head.gamma"),
            other => panic!("unexpected: {other:?}"),
        }

        match ckpt.parameter_with_shape("head.bias", &[4]) {
            Err(CheckpointError::ShapeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, vec![4]);
                assert_eq!(actual, vec![3]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}

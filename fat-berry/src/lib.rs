#![warn(missing_docs)] // <= 合适时移除它.

//! 核心库. 提供腹部 3D MR nii 扫描的内脏脂肪 (VAT) / 皮下脂肪 (SAT)
//! 自动分割推理管线与体积定量功能.
//!
//! 管线按以下阶段顺序执行, 每次调用独立创建全部中间状态:
//!
//! 1. 加载 nii 体积 ([`MrScan`]), 校验体素分辨率;
//! 2. 方向规范化到 RAS ([`orient`]), 纯索引双射, 记录精确逆变换;
//! 3. 滑窗推理 ([`infer`]), 重叠 patch 输出按等权平均聚合;
//! 4. 逆投影与离散化 ([`project`]), 得到与原扫描逐体素对齐的标签体积;
//! 5. 体积定量 ([`quantify`]) 与预测文件写出 ([`writer`]).
//!
//! # 注意
//!
//! 1. 分割网络本身被当作不透明纯函数 (张量 -> 逐类概率张量) 通过
//!   [`model::PatchModel`] 接入, 本 crate 不包含网络结构与训练功能.
//! 2. 在非期望情况下 (索引越界等编程错误), 程序会直接 panic,
//!   而不会导致内存错误. As what Rust promises.
//!
//! # 开发计划
//!
//! ### 方向规范化与逆变换 ✅
//!
//! 从 nifti header 的 sform/qform 解析轴方向编码, 构建到 RAS
//! 的置换/翻转双射. 实现位于 `fat-berry/src/orient.rs`.
//!
//! ### 滑窗平铺调度与重叠聚合 ✅
//!
//! 确定性的完全覆盖调度 (边界 patch 贴边收拢), 等权平均聚合,
//! 结果与 patch 处理顺序无关. 实现位于 `fat-berry/src/infer.rs`.
//!
//! ### 检查点加载 ✅
//!
//! npz 档案按参数名索引, 自动去除分布式训练的 `module.` 前缀.
//! 实现位于 `fat-berry/src/model/checkpoint.rs`.
//!
//! ### 体积定量 ✅
//!
//! 体素计数经体素物理体积换算为立方厘米, SAT 为零时显式报错.
//! 实现位于 `fat-berry/src/quantify.rs`.
//!
//! ### 预测写出 ✅
//!
//! 按原始 header 写出, 临时文件 + 重命名, 不留半成品.
//! 实现位于 `fat-berry/src/writer.rs`.
//!
//! ### 人工质检记录 ✅
//!
//! 逐切片评分与终判的 CSV 契约. 实现位于 `fat-berry/src/quality.rs`.
//!
//! ### 管线编排 ✅
//!
//! 不可变请求 -> 结果的纯函数式调用, 支持后台线程与协作式取消.
//! 实现位于 `fat-berry/src/pipeline.rs`.

/// 二维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx2d = (usize, usize);

/// 三维索引, 同时也可一定程度上用作非负整数向量.
pub type Idx3d = (usize, usize, usize);

/// 3D MR nii 文件基础数据结构.
mod data;

pub use data::{
    FatLabel, ImgWriteRaw, ImgWriteVis, LabelSlice, MrScan, NiftiHeaderAttr, OpenVolumeError,
    ScanSlice, VisWindow,
};

pub mod consts;

pub mod infer;
pub mod model;
pub mod orient;
pub mod pipeline;
pub mod project;
pub mod quality;
pub mod quantify;
pub mod writer;

pub mod prelude;

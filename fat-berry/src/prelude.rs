//! 🍇欢迎光临🍑
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{
    FatLabel, ImgWriteRaw, ImgWriteVis, LabelSlice, MrScan, NiftiHeaderAttr, OpenVolumeError,
    ScanSlice, VisWindow,
};

pub use crate::consts::class::{FAT_BACKGROUND, FAT_SAT, FAT_VAT};
pub use crate::consts::{DEFAULT_PATCH, DEFAULT_STRIDE, DEFAULT_SW_BATCH, IN_CHANNELS, NUM_CLASSES};

pub use crate::infer::{
    AggregatedPrediction, CancelToken, InferConfig, InferError, InferReport, PatchGrid,
};
pub use crate::model::{Checkpoint, CheckpointError, ModelError, PatchModel, PointwiseHead};
pub use crate::orient::{canonicalize, CanonicalFrame, OrientationError};
pub use crate::pipeline::{self, PipelineError, PipelineOutcome, PipelineRequest, PipelineTask};
pub use crate::project::project;
pub use crate::quality::{FinalCheck, QualityRecord};
pub use crate::quantify::{quantify, quantify_label, FatQuantification, QuantifyError};
pub use crate::writer::{predicted_path, write_prediction, WriteError};

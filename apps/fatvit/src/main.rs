//! FatViT: 腹部 VAT/SAT 自动分割命令行前端.
//!
//! ```text
//! fatvit <volume.nii[.gz]> <checkpoint.npz> <output-dir> [--quality]
//! ```
//!
//! 加载检查点与输入体积, 在后台线程执行完整推理管线, 打印定量结果
//! 与耗时, 并把预测体积写入输出目录. 指定 `--quality` 时还会在预测
//! 文件旁生成一份空白 (未评分) 的质检 CSV, 供评审会话填写.

use fat_berry::model::{Checkpoint, PointwiseHead};
use fat_berry::pipeline::{self, PipelineRequest};
use fat_berry::prelude::*;
use fat_berry::quality::QualityRecord;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

struct Args {
    volume: PathBuf,
    checkpoint: PathBuf,
    output_dir: PathBuf,
    quality: bool,
}

fn parse_args() -> Option<Args> {
    let mut plain = Vec::new();
    let mut quality = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--quality" => quality = true,
            _ => plain.push(PathBuf::from(arg)),
        }
    }
    let [volume, checkpoint, output_dir]: [PathBuf; 3] = plain.try_into().ok()?;
    Some(Args {
        volume,
        checkpoint,
        output_dir,
        quality,
    })
}

fn main() -> ExitCode {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .ok();

    let Some(args) = parse_args() else {
        eprintln!("usage: fatvit <volume.nii[.gz]> <checkpoint.npz> <output-dir> [--quality]");
        return ExitCode::FAILURE;
    };

    let mut ckpt = match Checkpoint::open(&args.checkpoint) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading checkpoint: {e}");
            return ExitCode::FAILURE;
        }
    };
    let model = match PointwiseHead::from_checkpoint(&mut ckpt, DEFAULT_PATCH) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Error binding model parameters: {e}");
            return ExitCode::FAILURE;
        }
    };

    let req = PipelineRequest::new(args.volume.clone(), args.output_dir.clone());
    let task = pipeline::spawn(req, Arc::new(model));

    let outcome = match task.join() {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("Error during prediction: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("{}", outcome.quantification);
    println!("Inference time: {}", outcome.report.human_duration());
    println!("Prediction: {}", outcome.label_path.display());

    if args.quality {
        let scan = match MrScan::open(&args.volume) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Error reloading volume for quality record: {e}");
                return ExitCode::FAILURE;
            }
        };
        let record = QualityRecord::new(&args.volume, scan.len_z());
        match record.save_csv(&outcome.label_path) {
            Ok(path) => println!("Quality check record: {}", path.display()),
            Err(e) => {
                eprintln!("Error writing quality record: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

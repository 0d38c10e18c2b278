// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU64, Ordering},
};

use chrono::{Datelike, Local};
use image::RgbImage;
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{RgbNhwcFrame, ToRgbImage},
  model::DetectResult,
  output::{
    Render,
    draw::{Draw, DrawDetectionOnFrame, Record},
  },
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 保存方式：画框后的图像，或原始图像加文本记录
pub enum RecordMode {
  Draw(Draw),
  Record(Record),
}

impl RecordMode {
  fn save(
    &self,
    path: &Path,
    frame: &RgbNhwcFrame,
    result: &DetectResult,
  ) -> Result<(), DirectoryRecordOutputError> {
    match self {
      RecordMode::Draw(draw) => {
        let image: RgbImage = draw.draw_detection(frame, result);
        image.save(path)?;
      }
      RecordMode::Record(record) => {
        frame.to_rgb_image().save(path)?;
        record.record(result, path)?;
      }
    }
    Ok(())
  }
}

/// 按日期分目录保存有检测结果的帧
///
/// `folder:///var/lib/relay/frames?always&record`
///
/// - `always`：没有检测结果的帧也保存
/// - `record`：保存原始帧，并在同名 `.txt` 中写入检测结果
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  mode: RecordMode,
  frame_counter: AtomicU64,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let mode = if uri.query_pairs().any(|(k, _)| k == "record") {
      RecordMode::Record(Record)
    } else {
      RecordMode::Draw(Draw::default())
    };

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      mode,
      frame_counter: AtomicU64::new(0),
      always,
    })
  }
}

impl DirectoryRecordOutput {
  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Local::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    let id = self.frame_counter.fetch_add(1, Ordering::Relaxed) + 1;
    Ok(directory.join(format!("{}-{:06}.png", now.format("%H-%M-%S"), id)))
  }
}

impl Render<RgbNhwcFrame, DetectResult> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbNhwcFrame, result: &DetectResult) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }
    let path = self.frame_path()?;
    self.mode.save(&path, frame, result)?;
    debug!("保存帧到: {}", path.display());
    Ok(())
  }
}

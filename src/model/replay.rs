// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放模型
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

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::RgbNhwcFrame,
  model::{Model, RawDetections},
};

#[derive(Error, Debug)]
pub enum ReplayModelError {
  #[error("模型路径必须使用 {0} 方案")]
  SchemeMismatch(&'static str),
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("回放文件解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("回放文件中没有任何记录")]
  Empty,
  #[error("输入帧为空")]
  EmptyFrame,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplayFile {
  Single(RawDetections),
  Sequence(Vec<RawDetections>),
}

/// 回放预先录制的模型输出
///
/// 每次推理按顺序返回一条记录，到末尾后从头循环。
/// 文件内容可以是单个 `{"boxes": [...], "scores": [...]}` 对象，也可以是它们的数组。
pub struct ReplayModel {
  entries: Vec<RawDetections>,
  cursor: AtomicUsize,
}

impl FromUrlWithScheme for ReplayModel {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayModel {
  type Error = ReplayModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ReplayModelError::SchemeMismatch(Self::SCHEME));
    }

    info!("加载回放文件: {}", url.path());
    let content = std::fs::read_to_string(url.path())?;
    Self::from_json(&content)
  }
}

impl ReplayModel {
  pub fn from_json(content: &str) -> Result<Self, ReplayModelError> {
    let entries = match serde_json::from_str::<ReplayFile>(content)? {
      ReplayFile::Single(entry) => vec![entry],
      ReplayFile::Sequence(entries) => entries,
    };
    Self::from_entries(entries)
  }

  pub fn from_entries(entries: Vec<RawDetections>) -> Result<Self, ReplayModelError> {
    if entries.is_empty() {
      return Err(ReplayModelError::Empty);
    }
    debug!("回放记录数量: {}", entries.len());
    Ok(Self {
      entries,
      cursor: AtomicUsize::new(0),
    })
  }
}

impl Model for ReplayModel {
  type Input = RgbNhwcFrame;
  type Output = RawDetections;
  type Error = ReplayModelError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    if input.height() == 0 || input.width() == 0 {
      return Err(ReplayModelError::EmptyFrame);
    }
    let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.entries.len();
    Ok(self.entries[index].clone())
  }
}

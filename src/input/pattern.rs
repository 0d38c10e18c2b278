// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/pattern.rs - 合成测试图样输入
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

use std::time::Duration;

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, query_value};

const DEFAULT_WIDTH: usize = 640;
const DEFAULT_HEIGHT: usize = 480;

#[derive(Error, Debug)]
pub enum PatternInputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的图样尺寸 {width}x{height}")]
  InvalidShape { width: usize, height: usize },
}

/// 合成摄像头：逐帧平移的渐变图样
///
/// `pattern://?width=640&height=480&fps=30&limit=100`，`fps` 缺省时不节流。
pub struct PatternInput {
  height: usize,
  width: usize,
  interval: Option<Duration>,
  remaining: Option<usize>,
  index: usize,
}

impl FromUrlWithScheme for PatternInput {
  const SCHEME: &'static str = "pattern";
}

impl FromUrl for PatternInput {
  type Error = PatternInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(PatternInputError::SchemeMismatch);
    }

    let width = query_value(url, "width").unwrap_or(DEFAULT_WIDTH);
    let height = query_value(url, "height").unwrap_or(DEFAULT_HEIGHT);
    let mut input = Self::new(height, width)?;
    input.interval = query_value::<u32>(url, "fps")
      .filter(|fps| *fps > 0)
      .map(|fps| Duration::from_secs(1) / fps);
    input.remaining = query_value(url, "limit");

    info!("合成图样输入: {}x{}", width, height);
    Ok(input)
  }
}

impl PatternInput {
  pub fn new(height: usize, width: usize) -> Result<Self, PatternInputError> {
    if height == 0 || width == 0 {
      return Err(PatternInputError::InvalidShape { width, height });
    }

    Ok(Self {
      height,
      width,
      interval: None,
      remaining: None,
      index: 0,
    })
  }

  pub fn with_limit(mut self, limit: Option<usize>) -> Self {
    self.remaining = limit;
    self
  }

  fn render(&self) -> RgbNhwcFrame {
    let mut frame = RgbNhwcFrame::with_shape(self.height, self.width);
    let (height, width) = (self.height, self.width);
    let shift = self.index % width;
    for (pixel_index, pixel) in frame.as_mut().chunks_exact_mut(3).enumerate() {
      let y = pixel_index / width;
      let x = pixel_index % width;
      pixel[0] = (((x + shift) % width) * 255 / width) as u8;
      pixel[1] = (y * 255 / height) as u8;
      pixel[2] = (self.index % 256) as u8;
    }
    frame
  }
}

impl Iterator for PatternInput {
  type Item = RgbNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(remaining) = self.remaining.as_mut() {
      if *remaining == 0 {
        return None;
      }
      *remaining -= 1;
    }

    if let Some(interval) = self.interval {
      std::thread::sleep(interval);
    }

    let frame = self.render();
    self.index = self.index.wrapping_add(1);
    Some(frame)
  }
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/log_output.rs - 无界面日志输出
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

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, frame::RgbNhwcFrame, model::DetectResult, output::Render,
};

#[derive(Error, Debug)]
pub enum LogOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 不显示画面，只把检测结果写进日志
pub struct LogOutput {
  frames: AtomicUsize,
  last_count: AtomicUsize,
}

impl FromUrlWithScheme for LogOutput {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogOutput {
  type Error = LogOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(LogOutputError::SchemeMismatch);
    }
    Ok(Self::default())
  }
}

impl Default for LogOutput {
  fn default() -> Self {
    Self {
      frames: AtomicUsize::new(0),
      last_count: AtomicUsize::new(usize::MAX),
    }
  }
}

impl Render<RgbNhwcFrame, DetectResult> for LogOutput {
  type Error = LogOutputError;

  fn render_result(&self, frame: &RgbNhwcFrame, result: &DetectResult) -> Result<(), Self::Error> {
    let index = self.frames.fetch_add(1, Ordering::Relaxed);
    let previous = self.last_count.swap(result.len(), Ordering::Relaxed);

    if previous != result.len() {
      info!("帧 {}: 检测到 {} 个对象", index, result.len());
      for item in result.iter() {
        info!(
          "  - {:.2}% at (y {:.3}, x {:.3}) - (y {:.3}, x {:.3})",
          item.score * 100.0,
          item.bbox.y_min,
          item.bbox.x_min,
          item.bbox.y_max,
          item.bbox.x_max
        );
      }
    } else {
      debug!(
        "帧 {} ({}x{}): {} 个对象",
        index,
        frame.width(),
        frame.height(),
        result.len()
      );
    }
    Ok(())
  }
}

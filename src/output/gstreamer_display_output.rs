// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/gstreamer_display_output.rs - GStreamer 显示输出
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

//! # GStreamer 显示输出模块
//!
//! 显示协作方的 GStreamer 实现：把标注后的帧推入 `appsrc`。
//!
//! ## URL 格式
//!
//! - `gst://display?fps=15`：窗口显示
//! - `gst://file/path/to/output.mp4?fps=15`：编码保存为 MP4
//!
//! 帧尺寸在收到第一帧时确定，之后的帧必须保持相同尺寸。

use std::sync::{
  OnceLock,
  atomic::{AtomicU64, Ordering},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, query_value,
  frame::RgbNhwcFrame,
  model::DetectResult,
  output::{
    Render,
    draw::{Draw, DrawDetectionOnFrame},
  },
};

const DEFAULT_FPS: u64 = 15;

#[derive(Error, Debug)]
pub enum GStreamerDisplayOutputError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("Failed to get appsrc element")]
  AppSrcNotFound,
  #[error("Failed to convert element to appsrc")]
  AppSrcConversionFailed,
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("Frame shape changed from {expected:?} to {actual:?}")]
  ShapeChanged {
    expected: (usize, usize),
    actual: (usize, usize),
  },
}

pub struct GStreamerDisplayOutput {
  pipeline: gst::Pipeline,
  appsrc: gst_app::AppSrc,
  fps: u64,
  shape: OnceLock<(usize, usize)>,
  frame_count: AtomicU64,
  draw: Draw,
}

impl FromUrlWithScheme for GStreamerDisplayOutput {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerDisplayOutput {
  type Error = GStreamerDisplayOutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerDisplayOutputError::SchemeMismatch);
    }

    let fps = query_value::<u64>(url, "fps")
      .filter(|fps| *fps > 0)
      .unwrap_or(DEFAULT_FPS);

    let sink = match url.host_str() {
      Some("display") => String::from("autovideosink sync=false"),
      Some("file") => format!(
        "video/x-raw,format=I420 ! x264enc speed-preset=fast tune=zerolatency ! h264parse ! mp4mux ! filesink location={}",
        url.path()
      ),
      _ => return Err(GStreamerDisplayOutputError::SchemeMismatch),
    };

    gst::init()?;

    let pipeline_desc = format!("appsrc name=src is-live=true ! videoconvert ! {}", sink);
    info!("GStreamer output pipeline: {}", pipeline_desc);

    let pipeline = gst::parse::launch(&pipeline_desc)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| {
        GStreamerDisplayOutputError::PipelineError("Failed to create pipeline".to_string())
      })?;

    let appsrc = pipeline
      .by_name("src")
      .ok_or(GStreamerDisplayOutputError::AppSrcNotFound)?
      .downcast::<gst_app::AppSrc>()
      .map_err(|_| GStreamerDisplayOutputError::AppSrcConversionFailed)?;
    appsrc.set_format(gst::Format::Time);

    Ok(GStreamerDisplayOutput {
      pipeline,
      appsrc,
      fps,
      shape: OnceLock::new(),
      frame_count: AtomicU64::new(0),
      draw: Draw::default(),
    })
  }
}

impl GStreamerDisplayOutput {
  fn ensure_started(&self, shape: (usize, usize)) -> Result<(), GStreamerDisplayOutputError> {
    let mut first = false;
    let locked = *self.shape.get_or_init(|| {
      first = true;
      shape
    });
    if locked != shape {
      return Err(GStreamerDisplayOutputError::ShapeChanged {
        expected: locked,
        actual: shape,
      });
    }
    if first {
      let (height, width) = shape;
      let caps = gst::Caps::builder("video/x-raw")
        .field("format", "RGB")
        .field("width", width as i32)
        .field("height", height as i32)
        .field("framerate", gst::Fraction::new(self.fps as i32, 1))
        .build();
      self.appsrc.set_caps(Some(&caps));
      self.pipeline.set_state(gst::State::Playing)?;
      info!("GStreamer output started: {}x{} @ {} fps", width, height, self.fps);
    }
    Ok(())
  }

  fn push_frame(&self, data: Vec<u8>) -> Result<(), GStreamerDisplayOutputError> {
    let index = self.frame_count.fetch_add(1, Ordering::Relaxed);
    let duration = 1_000_000_000 / self.fps;

    let mut buffer = gst::Buffer::from_mut_slice(data);
    if let Some(buffer_ref) = buffer.get_mut() {
      buffer_ref.set_pts(gst::ClockTime::from_nseconds(index * duration));
      buffer_ref.set_duration(gst::ClockTime::from_nseconds(duration));
    }

    self.appsrc.push_buffer(buffer).map_err(|e| {
      GStreamerDisplayOutputError::PipelineError(format!("Failed to push buffer: {:?}", e))
    })?;
    Ok(())
  }
}

impl Drop for GStreamerDisplayOutput {
  fn drop(&mut self) {
    if self.shape.get().is_some() {
      let _ = self.appsrc.end_of_stream();
      // 等待 EOS 传到 filesink，保证文件尾完整
      std::thread::sleep(std::time::Duration::from_millis(100));
    }
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer output pipeline: {}", e);
    }
    info!(
      "GStreamer output closed, {} frames pushed",
      self.frame_count.load(Ordering::Relaxed)
    );
  }
}

impl Render<RgbNhwcFrame, DetectResult> for GStreamerDisplayOutput {
  type Error = GStreamerDisplayOutputError;

  fn render_result(&self, frame: &RgbNhwcFrame, result: &DetectResult) -> Result<(), Self::Error> {
    self.ensure_started(frame.shape())?;
    let drawn: RgbNhwcFrame = self.draw.draw_detection(frame, result);
    self.push_frame(drawn.into_vec())
  }
}

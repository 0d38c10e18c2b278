// 该文件是 Shanan （山南西风） 项目的一部分。
// src/frame.rs - NHWC 帧定义
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

use image::{ImageBuffer, Rgb, RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::input::AsNhwcFrame;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 行优先、通道交错的 RGB 帧（H × W × 3）
///
/// 形状在运行时确定，数据布局与推理请求的像素载荷一致。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbNhwcFrame {
  height: usize,
  width: usize,
  data: Box<[u8]>,
}

impl RgbNhwcFrame {
  pub fn with_shape(height: usize, width: usize) -> Self {
    let size = RGB_CHANNELS * height * width;
    Self {
      height,
      width,
      data: vec![0u8; size].into_boxed_slice(),
    }
  }

  pub fn from_raw(height: usize, width: usize, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = RGB_CHANNELS * height * width;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }

    Ok(Self {
      height,
      width,
      data: data.into_boxed_slice(),
    })
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  /// (高, 宽)
  pub fn shape(&self) -> (usize, usize) {
    (self.height, self.width)
  }

  pub fn into_vec(self) -> Vec<u8> {
    self.data.into_vec()
  }

  /// 缩放到指定尺寸，返回新帧
  pub fn resize(&self, width: u32, height: u32) -> RgbNhwcFrame {
    let image = self.to_rgb_image();
    let resized = image::imageops::resize(&image, width, height, FilterType::Triangle);
    RgbNhwcFrame::from_rgb_image(&resized)
  }
}

impl AsMut<[u8]> for RgbNhwcFrame {
  fn as_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }
}

impl AsNhwcFrame for RgbNhwcFrame {
  fn as_nhwc(&self) -> &[u8] {
    &self.data
  }
}

pub trait ToRgbImage {
  fn to_rgb_image(&self) -> RgbImage;
}

pub trait FromRgbImage {
  fn from_rgb_image(image: &RgbImage) -> Self;
}

impl ToRgbImage for RgbNhwcFrame {
  fn to_rgb_image(&self) -> RgbImage {
    let width = self.width as u32;
    let height = self.height as u32;
    let data = self.as_nhwc();

    ImageBuffer::from_fn(width, height, |x, y| {
      let idx = (y as usize * self.width + x as usize) * RGB_CHANNELS;
      Rgb([data[idx], data[idx + 1], data[idx + 2]])
    })
  }
}

impl FromRgbImage for RgbNhwcFrame {
  fn from_rgb_image(image: &RgbImage) -> Self {
    let (width, height) = image.dimensions();
    // RgbImage 的底层缓冲区本身就是 HWC 布局
    Self {
      height: height as usize,
      width: width as usize,
      data: image.as_raw().clone().into_boxed_slice(),
    }
  }
}

impl FromRgbImage for RgbImage {
  fn from_rgb_image(image: &RgbImage) -> Self {
    image.clone()
  }
}

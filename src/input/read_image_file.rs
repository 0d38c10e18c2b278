// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/read_image_file.rs - 图像文件输入
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

use image::ImageReader;
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FromRgbImage, RgbNhwcFrame},
  query_value,
};

#[derive(Error, Debug)]
pub enum ImageFileInputError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 静态摄像头：反复产出同一张图片
///
/// `image:///path/to/picture.jpg?limit=N`，`limit` 缺省时不限帧数。
pub struct ImageFileInput {
  frame: RgbNhwcFrame,
  remaining: Option<usize>,
}

impl FromUrlWithScheme for ImageFileInput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileInput {
  type Error = ImageFileInputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileInputError::SchemaMismatch);
    }

    let path = url.path();
    let image = ImageReader::open(path)?.decode()?.to_rgb8();
    info!(
      "图像输入已打开: {} ({}x{})",
      path,
      image.width(),
      image.height()
    );

    Ok(ImageFileInput {
      frame: RgbNhwcFrame::from_rgb_image(&image),
      remaining: query_value(url, "limit"),
    })
  }
}

impl ImageFileInput {
  pub fn from_frame(frame: RgbNhwcFrame, limit: Option<usize>) -> Self {
    Self {
      frame,
      remaining: limit,
    }
  }
}

impl Iterator for ImageFileInput {
  type Item = RgbNhwcFrame;

  fn next(&mut self) -> Option<Self::Item> {
    if let Some(remaining) = self.remaining.as_mut() {
      if *remaining == 0 {
        return None;
      }
      *remaining -= 1;
    }
    Some(self.frame.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::input::AsNhwcFrame;
  use image::{Rgb, RgbImage};

  #[test]
  fn replays_the_same_frame_until_limit() {
    let frame = RgbNhwcFrame::with_shape(2, 2);
    let input = ImageFileInput::from_frame(frame.clone(), Some(3));
    let frames: Vec<_> = input.collect();
    assert_eq!(frames.len(), 3);
    assert!(frames.iter().all(|f| *f == frame));
  }

  #[test]
  fn loads_image_from_url() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("still.png");
    RgbImage::from_pixel(5, 3, Rgb([10, 20, 30]))
      .save(&path)
      .unwrap();

    let url = Url::from_file_path(&path).unwrap();
    let mut url = Url::parse(&url.as_str().replacen("file", "image", 1)).unwrap();
    url.set_query(Some("limit=1"));

    let mut input = ImageFileInput::from_url(&url).unwrap();
    let frame = input.next().unwrap();
    assert_eq!(frame.shape(), (3, 5));
    assert_eq!(&frame.as_nhwc()[..3], &[10, 20, 30]);
    assert!(input.next().is_none());
  }
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use image::{Rgb, RgbImage};
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};

use crate::{
  frame::{FromRgbImage, ToRgbImage},
  model::{BoundingBox, DetectResult},
};

const BOX_THICKNESS: u32 = 2;
const BOX_COLOR: [u8; 3] = [0, 255, 0]; // 绿色

pub struct Draw {
  thickness: u32,
  color: [u8; 3],
}

impl Default for Draw {
  fn default() -> Self {
    Self {
      thickness: BOX_THICKNESS,
      color: BOX_COLOR,
    }
  }
}

impl Draw {
  // 边框从 (x_min·W, y_min·H) 画到 (x_max·W, y_max·H)
  fn draw_bbox(&self, image: &mut RgbImage, bbox: &BoundingBox) {
    if image.width() == 0 || image.height() == 0 || !bbox.is_valid() {
      return;
    }
    let (w, h) = (image.width() as f32, image.height() as f32);
    let (max_x, max_y) = (image.width() as i32 - 1, image.height() as i32 - 1);

    let x_min = ((bbox.x_min * w).floor() as i32).clamp(0, max_x);
    let y_min = ((bbox.y_min * h).floor() as i32).clamp(0, max_y);
    let x_max = ((bbox.x_max * w).ceil() as i32).clamp(0, max_x);
    let y_max = ((bbox.y_max * h).ceil() as i32).clamp(0, max_y);

    if x_min >= x_max || y_min >= y_max {
      return;
    }

    for t in 0..self.thickness as i32 {
      let width = x_max - x_min - 2 * t + 1;
      let height = y_max - y_min - 2 * t + 1;
      if width <= 0 || height <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(width as u32, height as u32);
      draw_hollow_rect_mut(image, rect, Rgb(self.color));
    }
  }

  pub fn draw_detections_on_image(&self, image: &mut RgbImage, result: &DetectResult) {
    for item in result.iter() {
      self.draw_bbox(image, &item.bbox);
    }
  }
}

pub trait DrawDetectionOnFrame<FromFrame, ToFrame> {
  fn draw_detection(&self, frame: &FromFrame, result: &DetectResult) -> ToFrame;
}

impl<FromFrame: ToRgbImage, ToFrame: FromRgbImage> DrawDetectionOnFrame<FromFrame, ToFrame>
  for Draw
{
  fn draw_detection(&self, frame: &FromFrame, result: &DetectResult) -> ToFrame {
    let mut image = frame.to_rgb_image();
    self.draw_detections_on_image(&mut image, result);
    ToFrame::from_rgb_image(&image)
  }
}

/// 以文本形式记录检测结果，每行 `score, y_min, x_min, y_max, x_max`
pub struct Record;

impl Record {
  pub fn format(result: &DetectResult) -> String {
    result
      .iter()
      .map(|item| {
        format!(
          "{:.4}, {:.4}, {:.4}, {:.4}, {:.4}",
          item.score, item.bbox.y_min, item.bbox.x_min, item.bbox.y_max, item.bbox.x_max
        )
      })
      .collect::<Vec<_>>()
      .join("\n")
  }

  pub fn record(&self, result: &DetectResult, path: &std::path::Path) -> Result<(), std::io::Error> {
    std::fs::write(path.with_extension("txt"), Self::format(result))
  }
}

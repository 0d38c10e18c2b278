// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// 模型单次输出的框/分数上限
pub const MAX_MODEL_DETECTIONS: usize = 100;

pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 归一化边界框，坐标顺序为 (y_min, x_min, y_max, x_max)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub y_min: f32,
  pub x_min: f32,
  pub y_max: f32,
  pub x_max: f32,
}

impl BoundingBox {
  pub fn new(y_min: f32, x_min: f32, y_max: f32, x_max: f32) -> Self {
    Self {
      y_min,
      x_min,
      y_max,
      x_max,
    }
  }

  pub fn from_array(raw: [f32; 4]) -> Self {
    Self::new(raw[0], raw[1], raw[2], raw[3])
  }

  pub fn to_array(&self) -> [f32; 4] {
    [self.y_min, self.x_min, self.y_max, self.x_max]
  }

  pub fn is_valid(&self) -> bool {
    self.to_array().iter().all(|v| v.is_finite())
      && self.y_min <= self.y_max
      && self.x_min <= self.x_max
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectItem {
  pub score: f32,
  pub bbox: BoundingBox,
}

/// 一帧的检测结果，按模型给出的顺序排列
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, DetectItem> {
    self.items.iter()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 一次推理周期的结果：成功的检测结果或失败原因
pub type InferenceResult = Result<DetectResult, InferenceError>;

/// 模型原始输出：框与分数按位置一一对应
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDetections {
  pub boxes: Vec<[f32; 4]>,
  pub scores: Vec<f32>,
}

mod local;
mod replay;
pub use self::local::LocalDetector;
pub use self::replay::{ReplayModel, ReplayModelError};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bbox_validity() {
    assert!(BoundingBox::new(0.1, 0.1, 0.5, 0.5).is_valid());
    assert!(BoundingBox::new(0.0, 0.0, 0.0, 0.0).is_valid());
    assert!(!BoundingBox::new(0.6, 0.1, 0.5, 0.5).is_valid());
    assert!(!BoundingBox::new(0.1, 0.6, 0.5, 0.5).is_valid());
    assert!(!BoundingBox::new(f32::NAN, 0.1, 0.5, 0.5).is_valid());
  }

  #[test]
  fn bbox_array_order() {
    let bbox = BoundingBox::from_array([0.1, 0.2, 0.3, 0.4]);
    assert_eq!(bbox.y_min, 0.1);
    assert_eq!(bbox.x_min, 0.2);
    assert_eq!(bbox.y_max, 0.3);
    assert_eq!(bbox.x_max, 0.4);
    assert_eq!(bbox.to_array(), [0.1, 0.2, 0.3, 0.4]);
  }
}

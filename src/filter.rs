// 该文件是 Shanan （山南西风） 项目的一部分。
// src/filter.rs - 检测结果置信度过滤
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

use std::str::FromStr;

use tracing::warn;

use crate::model::{BoundingBox, DetectItem, DetectResult, RawDetections};

pub const DEFAULT_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
  /// 保留所有超过阈值的框
  #[default]
  All,
  /// 单目标跟踪：只保留模型顺序中第一个超过阈值的框（不是分数最高的框）
  FirstMatch,
}

impl FromStr for FilterMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "all" => Ok(FilterMode::All),
      "first" | "first-match" => Ok(FilterMode::FirstMatch),
      other => Err(format!("未知的过滤模式: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionFilter {
  pub threshold: f32,
  pub mode: FilterMode,
}

impl Default for DetectionFilter {
  fn default() -> Self {
    Self {
      threshold: DEFAULT_THRESHOLD,
      mode: FilterMode::All,
    }
  }
}

impl DetectionFilter {
  pub fn new(threshold: f32, mode: FilterMode) -> Self {
    Self { threshold, mode }
  }

  pub fn apply(&self, raw: &RawDetections) -> DetectResult {
    match self.mode {
      FilterMode::All => filter_detections(&raw.boxes, &raw.scores, self.threshold),
      FilterMode::FirstMatch => first_match(&raw.boxes, &raw.scores, self.threshold)
        .map(|item| DetectResult::from(vec![item]))
        .unwrap_or_default(),
    }
  }
}

fn accepted_pairs<'a>(
  boxes: &'a [[f32; 4]],
  scores: &'a [f32],
  threshold: f32,
) -> impl Iterator<Item = DetectItem> + 'a {
  if boxes.len() != scores.len() {
    warn!(
      "框数量 {} 与分数数量 {} 不一致，只处理公共前缀",
      boxes.len(),
      scores.len()
    );
  }

  boxes
    .iter()
    .zip(scores.iter())
    .filter(move |(_, score)| **score > threshold)
    .filter_map(|(raw, score)| {
      let bbox = BoundingBox::from_array(*raw);
      if bbox.is_valid() {
        Some(DetectItem {
          score: *score,
          bbox,
        })
      } else {
        warn!("丢弃无效边界框: {:?} (分数 {:.3})", raw, score);
        None
      }
    })
}

/// 保留分数严格大于阈值的所有框，保持模型原有顺序
pub fn filter_detections(boxes: &[[f32; 4]], scores: &[f32], threshold: f32) -> DetectResult {
  accepted_pairs(boxes, scores, threshold)
    .collect::<Vec<_>>()
    .into()
}

/// 返回模型顺序中第一个分数严格大于阈值的框
pub fn first_match(boxes: &[[f32; 4]], scores: &[f32], threshold: f32) -> Option<DetectItem> {
  accepted_pairs(boxes, scores, threshold).next()
}

#[cfg(test)]
mod tests {
  use super::*;

  const BOXES: [[f32; 4]; 4] = [
    [0.0, 0.0, 0.2, 0.2],
    [0.1, 0.1, 0.5, 0.5],
    [0.2, 0.2, 0.9, 0.9],
    [0.3, 0.3, 0.4, 0.4],
  ];

  #[test]
  fn keeps_scores_strictly_above_threshold_in_model_order() {
    let scores = [0.3, 0.6, 0.5, 0.95];
    let result = filter_detections(&BOXES, &scores, 0.5);
    let kept: Vec<_> = result.iter().map(|item| item.score).collect();
    assert_eq!(kept, vec![0.6, 0.95]);
    assert_eq!(result.items[0].bbox, BoundingBox::from_array(BOXES[1]));
    assert_eq!(result.items[1].bbox, BoundingBox::from_array(BOXES[3]));
  }

  #[test]
  fn score_equal_to_threshold_is_excluded() {
    let result = filter_detections(&BOXES[..1], &[0.5], 0.5);
    assert!(result.is_empty());
  }

  #[test]
  fn does_not_rerank() {
    let scores = [0.7, 0.99, 0.0, 0.0];
    let result = filter_detections(&BOXES, &scores, 0.5);
    assert_eq!(result.items[0].score, 0.7);
    assert_eq!(result.items[1].score, 0.99);
  }

  #[test]
  fn first_match_returns_first_not_best() {
    let scores = [0.2, 0.6, 0.99, 0.8];
    let item = first_match(&BOXES, &scores, 0.5).unwrap();
    assert_eq!(item.score, 0.6);
    assert_eq!(item.bbox, BoundingBox::from_array(BOXES[1]));
  }

  #[test]
  fn first_match_none_when_nothing_passes() {
    assert!(first_match(&BOXES, &[0.1, 0.2, 0.3, 0.5], 0.5).is_none());
  }

  #[test]
  fn nan_scores_never_pass() {
    let result = filter_detections(&BOXES[..1], &[f32::NAN], 0.5);
    assert!(result.is_empty());
  }

  #[test]
  fn invalid_boxes_are_dropped() {
    let boxes = [[0.9, 0.0, 0.1, 1.0], [0.0, 0.0, 1.0, 1.0]];
    let result = filter_detections(&boxes, &[0.9, 0.8], 0.5);
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].score, 0.8);
  }

  #[test]
  fn mismatched_lengths_use_common_prefix() {
    let result = filter_detections(&BOXES, &[0.9, 0.9], 0.5);
    assert_eq!(result.len(), 2);
  }

  #[test]
  fn filter_modes() {
    let raw = RawDetections {
      boxes: BOXES.to_vec(),
      scores: vec![0.9, 0.8, 0.1, 0.7],
    };
    assert_eq!(DetectionFilter::default().apply(&raw).len(), 3);

    let first = DetectionFilter::new(0.5, FilterMode::FirstMatch).apply(&raw);
    assert_eq!(first.len(), 1);
    assert_eq!(first.items[0].score, 0.9);

    assert_eq!("first".parse::<FilterMode>(), Ok(FilterMode::FirstMatch));
    assert_eq!("all".parse::<FilterMode>(), Ok(FilterMode::All));
    assert!("best".parse::<FilterMode>().is_err());
  }
}

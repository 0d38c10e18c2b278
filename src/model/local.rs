// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/local.rs - 进程内检测器（模型 + 置信度过滤）
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

use tracing::debug;

use crate::{
  error::InferenceError,
  filter::DetectionFilter,
  frame::RgbNhwcFrame,
  model::{DetectResult, MAX_MODEL_DETECTIONS, Model, RawDetections},
};

/// 把不透明模型与置信度过滤组合成一个检测器
///
/// 推理服务端用它处理请求；客户端的本地推理模式也直接使用它。
pub struct LocalDetector<M> {
  model: M,
  filter: DetectionFilter,
}

impl<M> LocalDetector<M> {
  pub fn new(model: M, filter: DetectionFilter) -> Self {
    Self { model, filter }
  }

  pub fn filter(&self) -> &DetectionFilter {
    &self.filter
  }
}

impl<M, E> Model for LocalDetector<M>
where
  M: Model<Input = RgbNhwcFrame, Output = RawDetections, Error = E>,
  E: std::fmt::Display,
{
  type Input = RgbNhwcFrame;
  type Output = DetectResult;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let raw = self
      .model
      .infer(input)
      .map_err(|e| InferenceError::ModelFailure(e.to_string()))?;

    if raw.boxes.len() > MAX_MODEL_DETECTIONS || raw.scores.len() > MAX_MODEL_DETECTIONS {
      return Err(InferenceError::ModelFailure(format!(
        "模型输出超过上限 {}: {} 个框, {} 个分数",
        MAX_MODEL_DETECTIONS,
        raw.boxes.len(),
        raw.scores.len()
      )));
    }

    let result = self.filter.apply(&raw);
    debug!(
      "原始输出 {} 个框，过滤后保留 {} 个",
      raw.boxes.len(),
      result.len()
    );
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::filter::FilterMode;

  struct FixedModel(Result<RawDetections, String>);

  impl Model for FixedModel {
    type Input = RgbNhwcFrame;
    type Output = RawDetections;
    type Error = String;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      self.0.clone()
    }
  }

  #[test]
  fn filters_model_output() {
    let model = FixedModel(Ok(RawDetections {
      boxes: vec![[0.1, 0.1, 0.5, 0.5], [0.0, 0.0, 1.0, 1.0]],
      scores: vec![0.9, 0.3],
    }));
    let detector = LocalDetector::new(model, DetectionFilter::default());
    let result = detector.infer(&RgbNhwcFrame::with_shape(4, 4)).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].score, 0.9);
  }

  #[test]
  fn model_errors_become_model_failures() {
    let detector = LocalDetector::new(
      FixedModel(Err("session crashed".into())),
      DetectionFilter::new(0.5, FilterMode::FirstMatch),
    );
    let err = detector.infer(&RgbNhwcFrame::with_shape(1, 1)).unwrap_err();
    assert_eq!(err, InferenceError::ModelFailure("session crashed".into()));
  }

  #[test]
  fn oversized_model_output_is_rejected() {
    let model = FixedModel(Ok(RawDetections {
      boxes: vec![[0.0, 0.0, 1.0, 1.0]; MAX_MODEL_DETECTIONS + 1],
      scores: vec![0.9; MAX_MODEL_DETECTIONS + 1],
    }));
    let detector = LocalDetector::new(model, DetectionFilter::default());
    let err = detector.infer(&RgbNhwcFrame::with_shape(1, 1)).unwrap_err();
    assert!(matches!(err, InferenceError::ModelFailure(_)));
  }
}

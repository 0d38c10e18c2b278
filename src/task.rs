// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 采集/渲染任务
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
  },
  time::{Duration, Instant},
};

use anyhow::{anyhow, bail};
use tracing::{debug, info, warn};

use crate::{
  error::InferenceError,
  frame::RgbNhwcFrame,
  model::{DetectResult, Model},
  output::Render,
  scheduler::{SchedulerStats, SingleSlotScheduler},
};

pub trait Task<I, M, O>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M, output: O) -> Result<Self::Output, Self::Error>;
}

/// 取第一帧，同步推理一次并渲染
pub struct OneShotTask;

impl<
  F,
  D,
  ME: std::error::Error + Sync + Send + 'static,
  RE: std::fmt::Display,
  I: Iterator<Item = F>,
  M: Model<Input = F, Output = D, Error = ME>,
  O: Render<F, D, Error = RE>,
> Task<I, M, O> for OneShotTask
{
  type Output = D;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let frame = input.next().ok_or_else(|| anyhow!("没有输入帧"))?;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let result = model.infer(&frame)?;
    info!("推理完成，耗时: {:.2?}", now.elapsed());
    if let Err(e) = output.render_result(&frame, &result) {
      warn!("渲染失败: {}", e);
    }

    Ok(result)
  }
}

/// 实时循环的运行统计
#[derive(Debug, Clone, Default)]
pub struct TaskSummary {
  pub frames: usize,
  pub render_failures: usize,
  pub scheduler: SchedulerStats,
  pub latest: Option<Arc<DetectResult>>,
}

/// 采集/渲染循环
///
/// 每一帧都提交给单槽调度器（槽位忙时丢弃），然后用最近一次完成的检测结果
/// 渲染当前帧。推理在工作线程中进行，循环本身从不等待网络。
#[derive(Default, Debug)]
pub struct LiveTask {
  frame_number: Option<usize>,
  inference_size: Option<(u32, u32)>,
  deadline: Option<Duration>,
  shutdown: Option<Arc<AtomicBool>>,
}

impl LiveTask {
  /// 处理 N 帧后退出
  pub fn with_frame_number(mut self, frame_number: Option<usize>) -> Self {
    self.frame_number = frame_number;
    self
  }

  /// 提交推理前缩放到 (宽, 高)，渲染仍使用原始帧
  pub fn with_inference_size(mut self, inference_size: Option<(u32, u32)>) -> Self {
    self.inference_size = inference_size;
    self
  }

  pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
    self.deadline = deadline;
    self
  }

  pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
    self.shutdown = Some(shutdown);
    self
  }

  fn should_stop(&self, frames: usize) -> bool {
    if self.frame_number.is_some_and(|n| frames >= n) {
      info!("达到指定帧数 {}, 退出任务循环", frames);
      return true;
    }
    if self
      .shutdown
      .as_ref()
      .is_some_and(|flag| flag.load(Ordering::SeqCst))
    {
      warn!("中断信号接收，退出任务循环");
      return true;
    }
    false
  }
}

impl<I, M, O> Task<I, M, O> for LiveTask
where
  I: Iterator<Item = RgbNhwcFrame>,
  M: Model<Input = RgbNhwcFrame, Output = DetectResult, Error = InferenceError>
    + Send
    + Sync
    + 'static,
  O: Render<RgbNhwcFrame, DetectResult>,
  O::Error: std::fmt::Display,
{
  type Output = TaskSummary;
  type Error = anyhow::Error;

  fn run_task(self, mut input: I, model: M, output: O) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let mut scheduler = SingleSlotScheduler::new(model).with_deadline(self.deadline);
    let empty = DetectResult::empty();
    let mut shape = None;
    let mut summary = TaskSummary::default();

    while !self.should_stop(summary.frames) {
      let frame = input
        .next()
        .ok_or_else(|| anyhow!("输入在第 {} 帧后无法继续提供图像", summary.frames))?;

      match shape {
        None => {
          info!("会话帧尺寸: {}x{}", frame.width(), frame.height());
          shape = Some(frame.shape());
        }
        Some(locked) if locked != frame.shape() => {
          bail!(
            "输入帧尺寸从 {:?} 变为 {:?}",
            locked,
            frame.shape()
          );
        }
        Some(_) => {}
      }
      summary.frames += 1;

      let submitted = match self.inference_size {
        Some((width, height)) if scheduler.is_idle() => {
          scheduler.offer(&frame.resize(width, height))
        }
        _ => scheduler.offer(&frame),
      };

      let latest = scheduler.poll();
      let result = latest.as_deref().unwrap_or(&empty);
      debug!(
        "第 {} 帧: 提交 {}, 绘制 {} 个对象",
        summary.frames,
        submitted,
        result.len()
      );

      if let Err(e) = output.render_result(&frame, result) {
        summary.render_failures += 1;
        warn!("渲染第 {} 帧失败: {}", summary.frames, e);
      }
    }

    summary.scheduler = scheduler.stats();
    summary.latest = scheduler.latest();
    let stats = &summary.scheduler;
    info!(
      "任务完成: {} 帧, 提交 {}, 丢弃 {}, 完成 {}, 失败 {}, 超时 {}, 过期 {}",
      summary.frames,
      stats.submitted,
      stats.dropped,
      stats.completed,
      stats.failed,
      stats.timed_out,
      stats.stale
    );
    Ok(summary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoundingBox, DetectItem};
  use std::{
    sync::Mutex,
    thread,
  };

  struct InstantModel {
    seen_shapes: Arc<Mutex<Vec<(usize, usize)>>>,
  }

  impl InstantModel {
    fn new() -> (Self, Arc<Mutex<Vec<(usize, usize)>>>) {
      let seen = Arc::new(Mutex::new(Vec::new()));
      (
        Self {
          seen_shapes: seen.clone(),
        },
        seen,
      )
    }
  }

  impl Model for InstantModel {
    type Input = RgbNhwcFrame;
    type Output = DetectResult;
    type Error = InferenceError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      self.seen_shapes.lock().unwrap().push(input.shape());
      Ok(DetectResult::from(vec![DetectItem {
        score: 0.9,
        bbox: BoundingBox::new(0.25, 0.25, 0.75, 0.75),
      }]))
    }
  }

  #[derive(Clone, Default)]
  struct Recorder {
    rendered: Arc<Mutex<Vec<usize>>>,
    fail: bool,
  }

  impl Render<RgbNhwcFrame, DetectResult> for Recorder {
    type Error = String;

    fn render_result(&self, _frame: &RgbNhwcFrame, result: &DetectResult) -> Result<(), String> {
      self.rendered.lock().unwrap().push(result.len());
      if self.fail {
        Err("display unplugged".to_string())
      } else {
        Ok(())
      }
    }
  }

  fn paced_frames(height: usize, width: usize) -> impl Iterator<Item = RgbNhwcFrame> {
    std::iter::repeat_with(move || {
      thread::sleep(Duration::from_millis(1));
      RgbNhwcFrame::with_shape(height, width)
    })
  }

  #[test]
  fn renders_every_frame_with_latest_result() {
    let (model, _) = InstantModel::new();
    let output = Recorder::default();
    let summary = LiveTask::default()
      .with_frame_number(Some(200))
      .run_task(paced_frames(4, 4), model, output.clone())
      .unwrap();

    let rendered = output.rendered.lock().unwrap();
    assert_eq!(summary.frames, 200);
    assert_eq!(rendered.len(), 200);
    assert!(rendered.iter().all(|count| *count <= 1));
    assert_eq!(*rendered.last().unwrap(), 1);
    assert!(summary.scheduler.completed >= 1);
    assert_eq!(
      summary.scheduler.submitted + summary.scheduler.dropped,
      200
    );
    assert_eq!(summary.latest.unwrap().len(), 1);
  }

  #[test]
  fn downscales_only_the_inference_copy() {
    let (model, seen) = InstantModel::new();
    LiveTask::default()
      .with_frame_number(Some(20))
      .with_inference_size(Some((4, 2)))
      .run_task(paced_frames(8, 16), model, Recorder::default())
      .unwrap();

    let seen = seen.lock().unwrap();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|shape| *shape == (2, 4)));
  }

  #[test]
  fn camera_failure_is_fatal() {
    let (model, _) = InstantModel::new();
    let input = std::iter::repeat(RgbNhwcFrame::with_shape(2, 2)).take(3);
    let err = LiveTask::default()
      .with_frame_number(Some(10))
      .run_task(input, model, Recorder::default())
      .unwrap_err();
    assert!(err.to_string().contains('3'));
  }

  #[test]
  fn shape_change_is_fatal() {
    let (model, _) = InstantModel::new();
    let input = vec![
      RgbNhwcFrame::with_shape(2, 2),
      RgbNhwcFrame::with_shape(2, 3),
    ];
    assert!(
      LiveTask::default()
        .run_task(input.into_iter(), model, Recorder::default())
        .is_err()
    );
  }

  #[test]
  fn display_failures_do_not_stop_the_loop() {
    let (model, _) = InstantModel::new();
    let output = Recorder {
      fail: true,
      ..Default::default()
    };
    let summary = LiveTask::default()
      .with_frame_number(Some(5))
      .run_task(paced_frames(2, 2), model, output)
      .unwrap();
    assert_eq!(summary.frames, 5);
    assert_eq!(summary.render_failures, 5);
  }

  #[test]
  fn shutdown_flag_stops_the_loop() {
    let (model, _) = InstantModel::new();
    let shutdown = Arc::new(AtomicBool::new(true));
    let summary = LiveTask::default()
      .with_shutdown(shutdown)
      .run_task(paced_frames(2, 2), model, Recorder::default())
      .unwrap();
    assert_eq!(summary.frames, 0);
  }

  #[test]
  fn one_shot_returns_the_result() {
    let (model, _) = InstantModel::new();
    let output = Recorder::default();
    let result = OneShotTask
      .run_task(
        std::iter::once(RgbNhwcFrame::with_shape(2, 2)),
        model,
        output.clone(),
      )
      .unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(*output.rendered.lock().unwrap(), vec![1]);
  }
}

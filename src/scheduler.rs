// 该文件是 Shanan （山南西风） 项目的一部分。
// src/scheduler.rs - 单槽异步调度器
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

//! # 单槽异步调度器
//!
//! 任意时刻最多只有一个推理调用在执行。槽位被占用时新帧直接丢弃，不排队；
//! 完成的结果通过通道交回，由 [`SingleSlotScheduler::poll`] 非阻塞地取出并发布到
//! [`LatestDetection`]。渲染端只读最新结果，永远不等待网络。
//!
//! 状态机：`Idle → Submitted → (完成 | 失败 | 超时放弃) → Idle`。
//!
//! 超时放弃的任务线程无法被强行终止，它会继续占用模型直到自行返回。在此之前
//! [`SingleSlotScheduler::offer`] 拒绝新任务，因此同一时刻最多只有一个推理调用在执行；
//! 期限需要同时下推到模型本身（例如客户端的套接字超时），被放弃的线程才会尽快结束。

use std::{
  sync::{Arc, RwLock},
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, warn};

use crate::{
  error::{FailureKind, InferenceError},
  frame::RgbNhwcFrame,
  model::{DetectResult, InferenceResult, Model},
};

/// 最近一次成功完成的检测结果
///
/// 只有调度器写入，其他线程可以克隆句柄只读访问。
#[derive(Debug, Clone, Default)]
pub struct LatestDetection {
  inner: Arc<RwLock<Option<Arc<DetectResult>>>>,
}

impl LatestDetection {
  pub fn get(&self) -> Option<Arc<DetectResult>> {
    match self.inner.read() {
      Ok(guard) => guard.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  fn publish(&self, result: DetectResult) {
    let value = Some(Arc::new(result));
    match self.inner.write() {
      Ok(mut guard) => *guard = value,
      Err(poisoned) => *poisoned.into_inner() = value,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
  Idle,
  Submitted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
  /// 实际提交的任务数
  pub submitted: u64,
  /// 槽位忙时被丢弃的帧数
  pub dropped: u64,
  /// 成功并发布的结果数
  pub completed: u64,
  pub failed: u64,
  /// 超过期限被放弃，或客户端报告超时的任务数
  pub timed_out: u64,
  /// 序号过期而被丢弃的结果数
  pub stale: u64,
}

struct Completion {
  seq: u64,
  result: InferenceResult,
  elapsed: Duration,
}

struct Job {
  seq: u64,
  started: Instant,
  handle: JoinHandle<()>,
}

pub struct SingleSlotScheduler<M> {
  model: Arc<M>,
  deadline: Option<Duration>,
  /// 已分配的最大序号
  dispatched_seq: u64,
  /// 已发布结果的序号
  published_seq: u64,
  job: Option<Job>,
  /// 超过期限被放弃、但尚未返回的任务
  orphan: Option<Job>,
  completion_tx: Sender<Completion>,
  completion_rx: Receiver<Completion>,
  latest: LatestDetection,
  last_error: Option<InferenceError>,
  stats: SchedulerStats,
}

impl<M> SingleSlotScheduler<M>
where
  M: Model<Input = RgbNhwcFrame, Output = DetectResult, Error = InferenceError>
    + Send
    + Sync
    + 'static,
{
  pub fn new(model: M) -> Self {
    let (completion_tx, completion_rx) = crossbeam_channel::unbounded();
    Self {
      model: Arc::new(model),
      deadline: None,
      dispatched_seq: 0,
      published_seq: 0,
      job: None,
      orphan: None,
      completion_tx,
      completion_rx,
      latest: LatestDetection::default(),
      last_error: None,
      stats: SchedulerStats::default(),
    }
  }

  /// 任务超过 `deadline` 仍未完成时放弃它并释放槽位
  pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
    self.deadline = deadline;
    self
  }

  /// 当前任务的状态，被放弃的任务不计入
  pub fn state(&self) -> SlotState {
    if self.job.is_some() {
      SlotState::Submitted
    } else {
      SlotState::Idle
    }
  }

  /// 下一次 `offer` 是否会被接受
  pub fn is_idle(&self) -> bool {
    self.state() == SlotState::Idle
      && self
        .orphan
        .as_ref()
        .is_none_or(|job| job.handle.is_finished())
  }

  pub fn stats(&self) -> SchedulerStats {
    self.stats
  }

  /// 最近一次失败的原因，成功后清空
  pub fn last_error(&self) -> Option<&InferenceError> {
    self.last_error.as_ref()
  }

  pub fn latest(&self) -> Option<Arc<DetectResult>> {
    self.latest.get()
  }

  pub fn latest_handle(&self) -> LatestDetection {
    self.latest.clone()
  }

  /// 槽位空闲时复制帧并在工作线程中开始推理，返回 `true`；否则丢弃该帧
  pub fn offer(&mut self, frame: &RgbNhwcFrame) -> bool {
    if self.job.is_some() || self.orphan_running() {
      self.stats.dropped += 1;
      return false;
    }

    let seq = self.dispatched_seq + 1;
    let model = self.model.clone();
    let tx = self.completion_tx.clone();
    let frame = frame.clone();

    let spawned = thread::Builder::new()
      .name(format!("inference-slot-{}", seq))
      .spawn(move || {
        let start = Instant::now();
        let result = model.infer(&frame);
        // 调度器已被销毁时接收端关闭，结果直接丢弃
        let _ = tx.send(Completion {
          seq,
          result,
          elapsed: start.elapsed(),
        });
      });

    match spawned {
      Ok(handle) => {
        self.dispatched_seq = seq;
        self.stats.submitted += 1;
        self.job = Some(Job {
          seq,
          started: Instant::now(),
          handle,
        });
        debug!("提交推理任务 #{}", seq);
        true
      }
      Err(e) => {
        warn!("无法启动推理线程: {}", e);
        self.stats.failed += 1;
        false
      }
    }
  }

  /// 取出已完成的结果并更新槽位状态，返回当前的最新检测结果，不阻塞
  pub fn poll(&mut self) -> Option<Arc<DetectResult>> {
    self.drain_completions();
    self.orphan_running();

    let (expired, finished) = match &self.job {
      Some(job) => (
        self
          .deadline
          .is_some_and(|deadline| job.started.elapsed() > deadline),
        job.handle.is_finished(),
      ),
      None => (false, false),
    };

    if expired {
      if let Some(job) = self.job.take() {
        warn!(
          "推理任务 #{} 超过期限 {:?}，放弃等待",
          job.seq,
          job.started.elapsed()
        );
        self.stats.timed_out += 1;
        self.last_error = Some(InferenceError::Timeout);
        self.orphan = Some(job);
      }
    } else if finished {
      // 线程先发送再退出，结束后再取一次
      self.drain_completions();
      if let Some(job) = self.job.take() {
        let reason = match job.handle.join() {
          Ok(()) => "工作线程未返回结果".to_string(),
          Err(_) => "工作线程崩溃".to_string(),
        };
        warn!("推理任务 #{} 失败: {}", job.seq, reason);
        self.stats.failed += 1;
        self.last_error = Some(InferenceError::ModelFailure(reason));
      }
    }

    self.latest()
  }

  /// 被放弃的任务是否仍在运行，已结束的顺便回收
  fn orphan_running(&mut self) -> bool {
    let finished = match &self.orphan {
      Some(job) => job.handle.is_finished(),
      None => return false,
    };
    if !finished {
      return true;
    }

    if let Some(job) = self.orphan.take() {
      if job.handle.join().is_err() {
        warn!("已放弃的推理任务 #{} 的工作线程崩溃", job.seq);
      }
      debug!("已放弃的推理任务 #{} 结束", job.seq);
    }
    false
  }

  fn drain_completions(&mut self) {
    loop {
      match self.completion_rx.try_recv() {
        Ok(completion) => self.complete(completion),
        Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
      }
    }
  }

  fn complete(&mut self, completion: Completion) {
    let Completion {
      seq,
      result,
      elapsed,
    } = completion;

    let current = self.job.as_ref().is_some_and(|job| job.seq == seq);
    if current {
      self.job = None;
    }

    // 只接受槽位中当前任务的结果，且序号必须是已分配的最大值并新于已发布的结果
    if !current || seq != self.dispatched_seq || seq <= self.published_seq {
      debug!("丢弃过期的推理结果 #{} (耗时 {:?})", seq, elapsed);
      self.stats.stale += 1;
      return;
    }

    match result {
      Ok(detections) => {
        debug!(
          "推理任务 #{} 完成: {} 个对象, 耗时 {:?}",
          seq,
          detections.len(),
          elapsed
        );
        self.published_seq = seq;
        self.latest.publish(detections);
        self.last_error = None;
        self.stats.completed += 1;
      }
      Err(e) => {
        warn!("推理任务 #{} 失败 ({:?}): {}", seq, e.kind(), e);
        if e.kind() == FailureKind::Timeout {
          self.stats.timed_out += 1;
        } else {
          self.stats.failed += 1;
        }
        self.last_error = Some(e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    input::AsNhwcFrame,
    model::{BoundingBox, DetectItem},
  };
  use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
  };

  /// 按帧首字节选择结果通道，测试可以控制每个任务何时完成
  struct GatedModel {
    gates: HashMap<u8, Receiver<InferenceResult>>,
  }

  impl GatedModel {
    fn new(keys: &[u8]) -> (Self, HashMap<u8, Sender<InferenceResult>>) {
      let mut gates = HashMap::new();
      let mut senders = HashMap::new();
      for key in keys {
        let (tx, rx) = crossbeam_channel::unbounded();
        gates.insert(*key, rx);
        senders.insert(*key, tx);
      }
      (Self { gates }, senders)
    }
  }

  impl Model for GatedModel {
    type Input = RgbNhwcFrame;
    type Output = DetectResult;
    type Error = InferenceError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      let key = input.as_nhwc()[0];
      match self.gates.get(&key) {
        Some(gate) => gate
          .recv()
          .unwrap_or(Err(InferenceError::ConnectionClosed)),
        None => Err(InferenceError::ModelFailure(format!("no gate {}", key))),
      }
    }
  }

  fn frame(key: u8) -> RgbNhwcFrame {
    let mut frame = RgbNhwcFrame::with_shape(2, 2);
    frame.as_mut()[0] = key;
    frame
  }

  fn detections(score: f32) -> DetectResult {
    DetectResult::from(vec![DetectItem {
      score,
      bbox: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
    }])
  }

  fn poll_until<M, F>(scheduler: &mut SingleSlotScheduler<M>, mut done: F)
  where
    M: Model<Input = RgbNhwcFrame, Output = DetectResult, Error = InferenceError>
      + Send
      + Sync
      + 'static,
    F: FnMut(&SingleSlotScheduler<M>) -> bool,
  {
    let start = Instant::now();
    while !done(scheduler) {
      assert!(start.elapsed() < Duration::from_secs(5), "condition never reached");
      scheduler.poll();
      thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn second_offer_is_dropped_until_completion() {
    let (model, gates) = GatedModel::new(&[1]);
    let mut scheduler = SingleSlotScheduler::new(model);

    assert!(scheduler.latest().is_none());
    assert!(scheduler.offer(&frame(1)));
    assert_eq!(scheduler.state(), SlotState::Submitted);
    assert!(!scheduler.offer(&frame(1)));
    assert_eq!(scheduler.stats().dropped, 1);
    assert!(scheduler.poll().is_none());

    gates[&1].send(Ok(detections(0.9))).unwrap();
    poll_until(&mut scheduler, |s| s.is_idle());

    assert_eq!(scheduler.latest().unwrap().items[0].score, 0.9);
    assert!(scheduler.offer(&frame(1)));
    gates[&1].send(Ok(detections(0.8))).unwrap();
    poll_until(&mut scheduler, |s| s.is_idle());

    let stats = scheduler.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.completed, 2);
    assert_eq!(scheduler.latest().unwrap().items[0].score, 0.8);
  }

  #[test]
  fn failure_keeps_previous_result() {
    let (model, gates) = GatedModel::new(&[1]);
    let mut scheduler = SingleSlotScheduler::new(model);
    let handle = scheduler.latest_handle();

    scheduler.offer(&frame(1));
    gates[&1].send(Ok(detections(0.7))).unwrap();
    poll_until(&mut scheduler, |s| s.is_idle());

    scheduler.offer(&frame(1));
    gates[&1]
      .send(Err(InferenceError::Unreachable("refused".into())))
      .unwrap();
    poll_until(&mut scheduler, |s| s.is_idle());

    assert_eq!(handle.get().unwrap().items[0].score, 0.7);
    assert_eq!(
      scheduler.last_error().map(InferenceError::kind),
      Some(FailureKind::ConnectionFailure)
    );
    assert_eq!(scheduler.stats().failed, 1);
    assert!(scheduler.offer(&frame(1)));
  }

  #[test]
  fn deadline_frees_slot_and_discards_late_result() {
    let (model, gates) = GatedModel::new(&[1, 2]);
    let mut scheduler =
      SingleSlotScheduler::new(model).with_deadline(Some(Duration::from_millis(200)));

    assert!(scheduler.offer(&frame(1)));
    poll_until(&mut scheduler, |s| s.state() == SlotState::Idle);
    assert_eq!(scheduler.stats().timed_out, 1);
    assert_eq!(scheduler.last_error(), Some(&InferenceError::Timeout));

    // 被放弃的任务仍在运行，新帧不能启动第二个调用
    assert!(!scheduler.is_idle());
    assert!(!scheduler.offer(&frame(2)));
    assert_eq!(scheduler.stats().dropped, 1);

    // 旧任务迟到的结果被丢弃
    gates[&1].send(Ok(detections(0.99))).unwrap();
    poll_until(&mut scheduler, |s| s.stats().stale == 1 && s.is_idle());
    assert!(scheduler.latest().is_none());

    assert!(scheduler.offer(&frame(2)));
    gates[&2].send(Ok(detections(0.6))).unwrap();
    poll_until(&mut scheduler, |s| s.stats().completed == 1);
    assert_eq!(scheduler.latest().unwrap().items[0].score, 0.6);
    assert_eq!(scheduler.stats().submitted, 2);
  }

  /// 记录同时执行的推理调用数的峰值
  struct SlowModel {
    delay: Duration,
    running: AtomicUsize,
    peak: Arc<AtomicUsize>,
  }

  impl Model for SlowModel {
    type Input = RgbNhwcFrame;
    type Output = DetectResult;
    type Error = InferenceError;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      thread::sleep(self.delay);
      self.running.fetch_sub(1, Ordering::SeqCst);
      Ok(detections(0.5))
    }
  }

  #[test]
  fn deadline_never_runs_two_calls_at_once() {
    let peak = Arc::new(AtomicUsize::new(0));
    let model = SlowModel {
      delay: Duration::from_millis(150),
      running: AtomicUsize::new(0),
      peak: peak.clone(),
    };
    let mut scheduler =
      SingleSlotScheduler::new(model).with_deadline(Some(Duration::from_millis(20)));

    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(500) {
      scheduler.offer(&frame(0));
      scheduler.poll();
      thread::sleep(Duration::from_millis(5));
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let stats = scheduler.stats();
    // 每次调用 150 ms，500 ms 内最多启动 4 次
    assert!(stats.submitted <= 4, "submitted {}", stats.submitted);
    assert!(stats.dropped > 0);
    assert!(scheduler.latest().is_none());
  }

  struct PanickingModel;

  impl Model for PanickingModel {
    type Input = RgbNhwcFrame;
    type Output = DetectResult;
    type Error = InferenceError;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      panic!("model crashed");
    }
  }

  #[test]
  fn panicking_worker_is_a_failed_cycle() {
    let mut scheduler = SingleSlotScheduler::new(PanickingModel);
    assert!(scheduler.offer(&frame(0)));
    poll_until(&mut scheduler, |s| s.is_idle());
    assert_eq!(scheduler.stats().failed, 1);
    assert!(matches!(
      scheduler.last_error(),
      Some(InferenceError::ModelFailure(_))
    ));
    assert!(scheduler.latest().is_none());
  }
}

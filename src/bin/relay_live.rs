// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/relay_live.rs - 实时采集、异步推理与显示
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
  thread,
  time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shanan_relay::{
  FromUrl,
  client::InferenceClient,
  error::InferenceError,
  filter::{DetectionFilter, FilterMode},
  frame::RgbNhwcFrame,
  input::InputWrapper,
  model::{DetectResult, LocalDetector, Model, ReplayModel},
  output::OutputWrapper,
  task::{LiveTask, Task},
};

/// 实时循环：采集帧，异步提交推理，用最新结果标注并显示
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源，例如 gst://camera/dev/video0?width=640&height=480
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 gst://display 或 folder:///var/lib/relay/frames
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 推理服务地址，例如 tcp://127.0.0.1:8765?timeout_ms=2000
  #[arg(long, value_name = "SERVER", conflicts_with = "model")]
  pub server: Option<Url>,
  /// 本地推理模型地址，不经过网络
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 本地推理的置信度阈值
  #[arg(long, value_name = "THRESHOLD", default_value_t = 0.5)]
  pub confidence: f32,
  /// 本地推理的过滤模式
  #[arg(long, value_name = "MODE", default_value = "all")]
  pub mode: FilterMode,
  /// 单次推理期限（毫秒），超时后放弃该任务，0 表示不限制
  #[arg(long, value_name = "MILLIS", default_value_t = 0)]
  pub deadline_ms: u64,
  /// 提交推理前缩放的宽度
  #[arg(long, value_name = "WIDTH", requires = "inference_height")]
  pub inference_width: Option<u32>,
  /// 提交推理前缩放的高度
  #[arg(long, value_name = "HEIGHT", requires = "inference_width")]
  pub inference_height: Option<u32>,
  /// 处理帧数，0 表示不限制
  #[arg(long, value_name = "FRAME_NUMBER", default_value_t = 0)]
  pub frame_number: usize,
}

fn run<M>(args: &Args, model: M, shutdown: Arc<AtomicBool>) -> Result<()>
where
  M: Model<Input = RgbNhwcFrame, Output = DetectResult, Error = InferenceError>
    + Send
    + Sync
    + 'static,
{
  let input = InputWrapper::from_url(&args.input).context("打开输入失败")?;
  let output = OutputWrapper::from_url(&args.output).context("打开输出失败")?;

  let task = LiveTask::default()
    .with_frame_number((args.frame_number > 0).then_some(args.frame_number))
    .with_inference_size(args.inference_width.zip(args.inference_height))
    .with_deadline((args.deadline_ms > 0).then(|| Duration::from_millis(args.deadline_ms)))
    .with_shutdown(shutdown);

  let summary = task.run_task(input, model, output)?;
  info!(
    "共处理 {} 帧，渲染失败 {} 次",
    summary.frames, summary.render_failures
  );
  Ok(())
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出: {}", args.output);

  let shutdown = Arc::new(AtomicBool::new(false));
  {
    let shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，准备退出...");
      shutdown.store(true, Ordering::SeqCst);
      // 采集端可能阻塞在取帧上
      thread::spawn(|| {
        thread::sleep(Duration::from_secs(30));
        warn!("强制退出程序");
        std::process::exit(1);
      });
    })
    .context("无法设置 Ctrl-C 处理函数")?;
  }

  match (&args.server, &args.model) {
    (Some(server), _) => {
      info!("推理服务: {}", server);
      let mut client = InferenceClient::from_url(server)?;
      if args.deadline_ms > 0 {
        // 被放弃的调用要在期限附近自行结束，槽位才能重新可用
        client = client.with_timeout_at_most(Duration::from_millis(args.deadline_ms));
      }
      run(&args, client, shutdown)
    }
    (None, Some(model)) => {
      info!("本地推理模型: {}", model);
      let model = ReplayModel::from_url(model).context("加载模型失败")?;
      let detector = LocalDetector::new(model, DetectionFilter::new(args.confidence, args.mode));
      run(&args, detector, shutdown)
    }
    (None, None) => bail!("需要指定 --server 或 --model"),
  }
}

// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/relay_oneshot.rs - 单帧同步推理
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

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use url::Url;

use shanan_relay::{
  FromUrl,
  client::InferenceClient,
  filter::{DetectionFilter, FilterMode},
  input::InputWrapper,
  model::{DetectResult, LocalDetector, ReplayModel},
  output::OutputWrapper,
  task::{OneShotTask, Task},
};

/// 取一帧，同步请求一次推理，以 JSON 打印检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 推理服务地址
  #[arg(long, value_name = "SERVER", conflicts_with = "model")]
  pub server: Option<Url>,
  /// 本地推理模型地址
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 本地推理的置信度阈值
  #[arg(long, value_name = "THRESHOLD", default_value_t = 0.5)]
  pub confidence: f32,
  /// 本地推理的过滤模式
  #[arg(long, value_name = "MODE", default_value = "all")]
  pub mode: FilterMode,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("输出: {}", args.output);

  let input = InputWrapper::from_url(&args.input).context("打开输入失败")?;
  let output = OutputWrapper::from_url(&args.output).context("打开输出失败")?;

  let result: DetectResult = match (&args.server, &args.model) {
    (Some(server), _) => OneShotTask.run_task(input, InferenceClient::from_url(server)?, output)?,
    (None, Some(model)) => {
      let model = ReplayModel::from_url(model).context("加载模型失败")?;
      let detector = LocalDetector::new(model, DetectionFilter::new(args.confidence, args.mode));
      OneShotTask.run_task(input, detector, output)?
    }
    (None, None) => bail!("需要指定 --server 或 --model"),
  };

  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}

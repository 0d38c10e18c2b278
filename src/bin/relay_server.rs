// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/relay_server.rs - 推理服务程序
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

use std::sync::{
  Arc,
  atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use url::Url;

use shanan_relay::{
  FromUrl,
  filter::{DetectionFilter, FilterMode},
  model::{LocalDetector, ReplayModel},
  server::{InferenceServer, ServerConfig},
};

/// 推理服务：每个连接接收一帧，返回过滤后的检测结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型地址，例如 replay:///var/lib/relay/detections.json
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 监听地址
  #[arg(long, value_name = "LISTEN", default_value = "tcp://0.0.0.0:8765")]
  pub listen: Url,
  /// 置信度阈值 (0.0 - 1.0)，严格大于才保留
  #[arg(long, value_name = "THRESHOLD", default_value_t = 0.5)]
  pub confidence: f32,
  /// 过滤模式：all 保留全部，first 只保留第一个
  #[arg(long, value_name = "MODE", default_value = "all")]
  pub mode: FilterMode,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型地址: {}", args.model);
  info!("监听地址: {}", args.listen);
  info!("置信度阈值: {}, 过滤模式: {:?}", args.confidence, args.mode);

  let stop = Arc::new(AtomicBool::new(false));
  {
    let stop = stop.clone();
    ctrlc::set_handler(move || {
      warn!("收到中断信号，准备退出...");
      stop.store(true, Ordering::SeqCst);
    })
    .context("无法设置 Ctrl-C 处理函数")?;
  }

  let model = ReplayModel::from_url(&args.model).context("加载模型失败")?;
  let detector = LocalDetector::new(model, DetectionFilter::new(args.confidence, args.mode));
  let config = ServerConfig::from_url(&args.listen)?;
  let server = InferenceServer::bind(config, detector).context("绑定监听地址失败")?;

  server.serve(&stop)?;
  Ok(())
}

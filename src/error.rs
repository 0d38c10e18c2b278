// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 推理错误分类
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

use std::io;

use thiserror::Error;

/// 一次推理周期的失败原因
///
/// 所有变体在调度器边界都是可恢复的：失败的周期不会修改最新检测结果。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
  #[error("推理服务不可达: {0}")]
  Unreachable(String),
  #[error("连接在消息完整之前关闭")]
  ConnectionClosed,
  #[error("消息格式错误: {0}")]
  MalformedMessage(String),
  #[error("推理超时")]
  Timeout,
  #[error("模型错误: {0}")]
  ModelFailure(String),
}

/// 错误大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
  ConnectionFailure,
  ProtocolError,
  Timeout,
  ModelFailure,
}

impl InferenceError {
  pub fn kind(&self) -> FailureKind {
    match self {
      InferenceError::Unreachable(_) | InferenceError::ConnectionClosed => {
        FailureKind::ConnectionFailure
      }
      InferenceError::MalformedMessage(_) => FailureKind::ProtocolError,
      InferenceError::Timeout => FailureKind::Timeout,
      InferenceError::ModelFailure(_) => FailureKind::ModelFailure,
    }
  }
}

impl From<io::Error> for InferenceError {
  fn from(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => InferenceError::Timeout,
      io::ErrorKind::UnexpectedEof => InferenceError::ConnectionClosed,
      io::ErrorKind::InvalidData => InferenceError::MalformedMessage(err.to_string()),
      _ => InferenceError::Unreachable(err.to_string()),
    }
  }
}

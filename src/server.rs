// 该文件是 Shanan （山南西风） 项目的一部分。
// src/server.rs - 推理服务端
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

//! # 推理服务端
//!
//! 顺序接受连接，每个连接处理一条请求：解码帧、调用检测器、编码响应。
//! 单个连接上的错误只记录日志，不会中断接受循环。
//! 格式错误的请求以类别为格式错误的失败帧回应，检测器错误和帧尺寸不一致以模型错误回应。
//!
//! URL 格式：`tcp://0.0.0.0:8765?width=160&height=120&timeout_ms=5000`

use std::{
  io::{self, BufReader},
  net::{SocketAddr, TcpListener, TcpStream},
  sync::atomic::{AtomicBool, Ordering},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  client::DEFAULT_PORT,
  codec::{self, CodecError},
  error::InferenceError,
  frame::RgbNhwcFrame,
  model::{DetectResult, InferenceResult, Model},
  query_value,
};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum ServerError {
  #[error("URI 方案不匹配: 期望 'tcp', 实际 '{0}'")]
  SchemeMismatch(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] io::Error),
}

/// 服务端监听地址与会话参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
  pub bind: String,
  /// 固定的会话帧尺寸 (高, 宽)，`None` 表示接受任意尺寸
  pub shape: Option<(usize, usize)>,
  pub timeout: Option<Duration>,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      bind: format!("0.0.0.0:{}", DEFAULT_PORT),
      shape: None,
      timeout: None,
    }
  }
}

impl FromUrlWithScheme for ServerConfig {
  const SCHEME: &'static str = "tcp";
}

impl FromUrl for ServerConfig {
  type Error = ServerError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ServerError::SchemeMismatch(url.scheme().to_string()));
    }
    let host = url.host_str().unwrap_or("0.0.0.0");
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let width = query_value::<usize>(url, "width");
    let height = query_value::<usize>(url, "height");
    let timeout = query_value::<u64>(url, "timeout_ms")
      .filter(|ms| *ms > 0)
      .map(Duration::from_millis);

    Ok(ServerConfig {
      bind: format!("{}:{}", host, port),
      shape: height.zip(width),
      timeout,
    })
  }
}

pub struct InferenceServer<D> {
  listener: TcpListener,
  detector: D,
  config: ServerConfig,
}

impl<D> InferenceServer<D>
where
  D: Model<Input = RgbNhwcFrame, Output = DetectResult, Error = InferenceError>,
{
  pub fn bind(config: ServerConfig, detector: D) -> Result<Self, ServerError> {
    let listener = TcpListener::bind(&config.bind)?;
    info!("推理服务监听于 {}", listener.local_addr()?);
    Ok(Self {
      listener,
      detector,
      config,
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
    Ok(self.listener.local_addr()?)
  }

  /// 接受并处理一个连接
  pub fn handle_next(&self) -> Result<(), ServerError> {
    let (stream, peer) = self.listener.accept()?;
    debug!("接受连接: {}", peer);
    self.handle_connection(stream)
  }

  /// 循环处理连接，直到 `stop` 被置位
  pub fn serve(&self, stop: &AtomicBool) -> Result<(), ServerError> {
    self.listener.set_nonblocking(true)?;
    let mut served = 0usize;

    while !stop.load(Ordering::SeqCst) {
      match self.listener.accept() {
        Ok((stream, peer)) => {
          debug!("接受连接: {}", peer);
          stream.set_nonblocking(false)?;
          if let Err(e) = self.handle_connection(stream) {
            warn!("处理来自 {} 的请求失败: {}", peer, e);
          }
          served += 1;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
          std::thread::sleep(ACCEPT_POLL_INTERVAL);
        }
        Err(e) => warn!("接受连接失败: {}", e),
      }
    }

    info!("推理服务停止，共处理 {} 个连接", served);
    Ok(())
  }

  pub fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
    stream.set_read_timeout(self.config.timeout)?;
    stream.set_write_timeout(self.config.timeout)?;

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let frame = match codec::read_request(&mut reader) {
      Ok(frame) => frame,
      Err(CodecError::MalformedMessage(msg)) => {
        warn!("请求格式错误: {}", msg);
        let failure = Err(InferenceError::MalformedMessage(msg));
        codec::write_response(&mut writer, &failure)?;
        return Ok(());
      }
      Err(CodecError::ConnectionClosed) => {
        warn!("请求未完整到达，连接已关闭");
        return Ok(());
      }
      Err(CodecError::Io(e)) => return Err(e.into()),
    };

    let start = Instant::now();
    let result = self.process(&frame);
    match &result {
      Ok(detections) => debug!(
        "处理 {}x{} 帧: {} 个对象, 耗时 {:?}",
        frame.width(),
        frame.height(),
        detections.len(),
        start.elapsed()
      ),
      Err(e) => warn!("推理失败: {}", e),
    }

    codec::write_response(&mut writer, &result)?;
    Ok(())
  }

  fn process(&self, frame: &RgbNhwcFrame) -> InferenceResult {
    if let Some(shape) = self.config.shape {
      if frame.shape() != shape {
        return Err(InferenceError::ModelFailure(format!(
          "帧尺寸 {:?} 与会话尺寸 {:?} 不一致",
          frame.shape(),
          shape
        )));
      }
    }
    self.detector.infer(frame)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    client::InferenceClient,
    filter::DetectionFilter,
    model::{LocalDetector, RawDetections},
  };
  use std::{
    io::{Read, Write},
    sync::Arc,
    thread,
  };

  struct FixedModel(RawDetections);

  impl Model for FixedModel {
    type Input = RgbNhwcFrame;
    type Output = RawDetections;
    type Error = String;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      Ok(self.0.clone())
    }
  }

  fn local_server(shape: Option<(usize, usize)>) -> InferenceServer<LocalDetector<FixedModel>> {
    let raw = RawDetections {
      boxes: vec![[0.1, 0.1, 0.5, 0.5], [0.2, 0.2, 0.6, 0.6]],
      scores: vec![0.9, 0.3],
    };
    let config = ServerConfig {
      bind: "127.0.0.1:0".to_string(),
      shape,
      timeout: Some(Duration::from_secs(5)),
    };
    InferenceServer::bind(
      config,
      LocalDetector::new(FixedModel(raw), DetectionFilter::default()),
    )
    .unwrap()
  }

  #[test]
  fn parses_url() {
    let config =
      ServerConfig::from_url(&Url::parse("tcp://127.0.0.1?width=160&height=120").unwrap())
        .unwrap();
    assert_eq!(config.bind, "127.0.0.1:8765");
    assert_eq!(config.shape, Some((120, 160)));
    assert_eq!(config.timeout, None);

    let config = ServerConfig::from_url(&Url::parse("tcp://0.0.0.0:9000?width=160").unwrap())
      .unwrap();
    assert_eq!(config.shape, None);
  }

  #[test]
  fn serves_filtered_detections() {
    let server = local_server(None);
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.handle_next().unwrap());

    let client = InferenceClient::new(addr.to_string());
    let result = client.call(&RgbNhwcFrame::with_shape(4, 4)).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.items[0].score, 0.9);
    handle.join().unwrap();
  }

  #[test]
  fn shape_mismatch_is_reported() {
    let server = local_server(Some((4, 4)));
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.handle_next().unwrap());

    let client = InferenceClient::new(addr.to_string());
    let err = client.call(&RgbNhwcFrame::with_shape(2, 2)).unwrap_err();
    assert!(matches!(err, InferenceError::ModelFailure(_)));
    handle.join().unwrap();
  }

  #[test]
  fn malformed_request_gets_failure_response() {
    let server = local_server(None);
    let addr = server.local_addr().unwrap();
    let handle = thread::spawn(move || server.handle_next().unwrap());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&[0, 0, 0, 0, 0, 0, 0, 4]).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    // 格式错误带类别返回，客户端不会把它当成模型错误
    match codec::decode_response(&response).unwrap() {
      Err(err @ InferenceError::MalformedMessage(_)) => {
        assert_eq!(err.kind(), crate::error::FailureKind::ProtocolError)
      }
      other => panic!("unexpected response: {:?}", other),
    }
    handle.join().unwrap();
  }

  #[test]
  fn serve_stops_on_flag() {
    let server = local_server(None);
    let addr = server.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
      let stop = stop.clone();
      thread::spawn(move || server.serve(&stop))
    };

    let client = InferenceClient::new(addr.to_string());
    for _ in 0..3 {
      assert!(client.call(&RgbNhwcFrame::with_shape(2, 2)).is_ok());
    }
    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap().unwrap();
  }
}

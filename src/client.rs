// 该文件是 Shanan （山南西风） 项目的一部分。
// src/client.rs - 推理客户端
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

//! # 推理客户端
//!
//! 每次调用打开一个新连接，发送一条请求，读取一条响应，然后关闭连接。
//! 调用是阻塞的，应在调度器的工作线程中执行，不能放在渲染线程上。
//!
//! ```no_run
//! use shanan_relay::{FromUrl, client::InferenceClient, frame::RgbNhwcFrame};
//! use url::Url;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = InferenceClient::from_url(&Url::parse("tcp://127.0.0.1:8765?timeout_ms=2000")?)?;
//! let result = client.call(&RgbNhwcFrame::with_shape(120, 160));
//! # Ok(())
//! # }
//! ```

use std::{
  io::BufReader,
  net::{TcpStream, ToSocketAddrs},
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, codec,
  error::InferenceError,
  frame::RgbNhwcFrame,
  model::{DetectResult, InferenceResult, Model},
  query_value,
};

/// 推理服务默认端口
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Error, Debug)]
pub enum ClientConfigError {
  #[error("URI 方案不匹配: 期望 'tcp', 实际 '{0}'")]
  SchemeMismatch(String),
  #[error("URI 缺少主机名")]
  MissingHost,
}

/// 一次请求一个连接的推理客户端
#[derive(Debug, Clone)]
pub struct InferenceClient {
  address: String,
  timeout: Option<Duration>,
}

impl FromUrlWithScheme for InferenceClient {
  const SCHEME: &'static str = "tcp";
}

impl FromUrl for InferenceClient {
  type Error = ClientConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ClientConfigError::SchemeMismatch(url.scheme().to_string()));
    }
    let host = url.host_str().ok_or(ClientConfigError::MissingHost)?;
    let port = url.port().unwrap_or(DEFAULT_PORT);
    let timeout = query_value::<u64>(url, "timeout_ms")
      .filter(|ms| *ms > 0)
      .map(Duration::from_millis);

    Ok(Self::new(format!("{}:{}", host, port)).with_timeout(timeout))
  }
}

impl InferenceClient {
  pub fn new(address: impl Into<String>) -> Self {
    Self {
      address: address.into(),
      timeout: None,
    }
  }

  /// 连接、读、写各自的超时；`None` 表示无限等待
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.timeout = timeout;
    self
  }

  /// 把超时收紧到不超过 `limit`，调度器放弃的调用因此也会在期限附近返回
  pub fn with_timeout_at_most(mut self, limit: Duration) -> Self {
    self.timeout = Some(self.timeout.map_or(limit, |timeout| timeout.min(limit)));
    self
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  fn connect(&self) -> Result<TcpStream, InferenceError> {
    let Some(timeout) = self.timeout else {
      return Ok(TcpStream::connect(&self.address)?);
    };

    let mut last_error = None;
    for addr in self.address.to_socket_addrs()? {
      match TcpStream::connect_timeout(&addr, timeout) {
        Ok(stream) => {
          stream.set_read_timeout(Some(timeout))?;
          stream.set_write_timeout(Some(timeout))?;
          return Ok(stream);
        }
        Err(e) => last_error = Some(e),
      }
    }

    Err(match last_error {
      Some(e) => InferenceError::from(e),
      None => InferenceError::Unreachable(format!("无法解析地址 {}", self.address)),
    })
  }

  fn round_trip(&self, frame: &RgbNhwcFrame) -> InferenceResult {
    let mut stream = self.connect()?;
    codec::write_request(&mut stream, frame)?;
    let mut reader = BufReader::new(stream);
    codec::read_response(&mut reader)?
  }

  /// 发送一帧并等待一条响应，传输层失败以 `Err` 返回，不重试
  pub fn call(&self, frame: &RgbNhwcFrame) -> InferenceResult {
    let start = Instant::now();
    let result = self.round_trip(frame);
    match &result {
      Ok(detections) => debug!(
        "推理请求 {}x{} 完成: {} 个对象, 耗时 {:?}",
        frame.width(),
        frame.height(),
        detections.len(),
        start.elapsed()
      ),
      Err(e) => debug!("推理请求失败 ({:?}): {}, 耗时 {:?}", e.kind(), e, start.elapsed()),
    }
    result
  }
}

impl Model for InferenceClient {
  type Input = RgbNhwcFrame;
  type Output = DetectResult;
  type Error = InferenceError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.call(input)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    error::FailureKind,
    model::{BoundingBox, DetectItem},
  };
  use std::{
    io::{Read, Write},
    net::TcpListener,
    thread,
  };

  fn stub_server(response: Vec<u8>) -> (u16, thread::JoinHandle<RgbNhwcFrame>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
      let (mut stream, _) = listener.accept().unwrap();
      let frame = codec::read_request(&mut stream).unwrap();
      stream.write_all(&response).unwrap();
      frame
    });
    (port, handle)
  }

  #[test]
  fn parses_url() {
    let client =
      InferenceClient::from_url(&Url::parse("tcp://inference.local?timeout_ms=250").unwrap())
        .unwrap();
    assert_eq!(client.address(), "inference.local:8765");
    assert_eq!(client.timeout(), Some(Duration::from_millis(250)));

    let client = InferenceClient::from_url(&Url::parse("tcp://10.0.0.2:9000").unwrap()).unwrap();
    assert_eq!(client.address(), "10.0.0.2:9000");
    assert_eq!(client.timeout(), None);

    assert!(matches!(
      InferenceClient::from_url(&Url::parse("udp://10.0.0.2:9000").unwrap()),
      Err(ClientConfigError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn timeout_cap_only_tightens() {
    let limit = Duration::from_millis(300);
    let unbounded = InferenceClient::new("127.0.0.1:8765").with_timeout_at_most(limit);
    assert_eq!(unbounded.timeout(), Some(limit));

    let looser = InferenceClient::new("127.0.0.1:8765")
      .with_timeout(Some(Duration::from_secs(2)))
      .with_timeout_at_most(limit);
    assert_eq!(looser.timeout(), Some(limit));

    let tighter = InferenceClient::new("127.0.0.1:8765")
      .with_timeout(Some(Duration::from_millis(100)))
      .with_timeout_at_most(limit);
    assert_eq!(tighter.timeout(), Some(Duration::from_millis(100)));
  }

  #[test]
  fn round_trip_against_stub() {
    let expected = DetectResult::from(vec![DetectItem {
      score: 0.9,
      bbox: BoundingBox::new(0.1, 0.2, 0.3, 0.4),
    }]);
    let (port, handle) = stub_server(codec::encode_response(&Ok(expected.clone())));

    let client = InferenceClient::new(format!("127.0.0.1:{}", port));
    let mut frame = RgbNhwcFrame::with_shape(2, 3);
    frame.as_mut()[0] = 42;
    assert_eq!(client.call(&frame), Ok(expected));
    assert_eq!(handle.join().unwrap(), frame);
  }

  #[test]
  fn remote_failure_passes_through() {
    let failure = Err(InferenceError::ModelFailure("npu busy".to_string()));
    let (port, handle) = stub_server(codec::encode_response(&failure));

    let client = InferenceClient::new(format!("127.0.0.1:{}", port));
    assert_eq!(client.call(&RgbNhwcFrame::with_shape(1, 1)), failure);
    handle.join().unwrap();
  }

  #[test]
  fn refused_connection_is_unreachable() {
    let port = {
      let listener = TcpListener::bind("127.0.0.1:0").unwrap();
      listener.local_addr().unwrap().port()
    };
    let client = InferenceClient::new(format!("127.0.0.1:{}", port))
      .with_timeout(Some(Duration::from_millis(500)));
    let err = client.call(&RgbNhwcFrame::with_shape(1, 1)).unwrap_err();
    assert_eq!(err.kind(), FailureKind::ConnectionFailure);
  }

  #[test]
  fn silent_server_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
      let (mut stream, _) = listener.accept().unwrap();
      let mut sink = Vec::new();
      let _ = stream.read_to_end(&mut sink);
    });

    let client = InferenceClient::new(format!("127.0.0.1:{}", port))
      .with_timeout(Some(Duration::from_millis(100)));
    assert_eq!(
      client.call(&RgbNhwcFrame::with_shape(1, 1)),
      Err(InferenceError::Timeout)
    );
    drop(client);
    handle.join().unwrap();
  }
}

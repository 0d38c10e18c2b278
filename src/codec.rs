// 该文件是 Shanan （山南西风） 项目的一部分。
// src/codec.rs - 推理请求/响应的二进制编解码
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

//! # 传输编解码
//!
//! 每个连接上每个方向只有一条消息。
//!
//! 请求：
//!
//! ```text
//! u32 BE 高度 | u32 BE 宽度 | 高度 × 宽度 × 3 字节 RGB（行优先、通道交错）
//! ```
//!
//! 响应：
//!
//! ```text
//! u32 BE 数量 N | N × (f32 LE y_min, x_min, y_max, x_max, score)
//! ```
//!
//! 数量为 `0xFFFF_FFFF` 时表示远端失败：
//!
//! ```text
//! u32 BE 0xFFFF_FFFF | u8 类别 | u32 BE 长度 L (1..=4096) | L 字节 UTF-8 原因
//! ```
//!
//! 类别 `0` 为模型错误，`1` 为请求格式错误。该标记与按有符号数解读的数量 `-1`
//! 位模式相同，因此失败帧必须完整且原因非空，否则整条响应按格式错误处理；
//! 其他最高位为 1 的数量（负数）一律超过上限，同样是格式错误。

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::{
  error::InferenceError,
  frame::{RGB_CHANNELS, RgbNhwcFrame},
  input::AsNhwcFrame,
  model::{BoundingBox, DetectItem, DetectResult, InferenceResult},
};

pub const MAX_FRAME_DIMENSION: u32 = 16384;
pub const MAX_RESPONSE_DETECTIONS: u32 = 1024;
pub const MAX_FAILURE_REASON_LEN: u32 = 4096;
pub const FAILURE_MARKER: u32 = u32::MAX;
pub const FAILURE_KIND_MODEL: u8 = 0;
pub const FAILURE_KIND_MALFORMED: u8 = 1;

const DEFAULT_FAILURE_REASON: &str = "未知错误";

const RECORD_FLOATS: usize = 5;
const RECORD_SIZE: usize = RECORD_FLOATS * 4;

#[derive(Error, Debug)]
pub enum CodecError {
  #[error("消息格式错误: {0}")]
  MalformedMessage(String),
  #[error("连接在消息完整之前关闭")]
  ConnectionClosed,
  #[error("I/O 错误: {0}")]
  Io(io::Error),
}

impl From<io::Error> for CodecError {
  fn from(err: io::Error) -> Self {
    match err.kind() {
      io::ErrorKind::UnexpectedEof => CodecError::ConnectionClosed,
      _ => CodecError::Io(err),
    }
  }
}

impl From<CodecError> for InferenceError {
  fn from(err: CodecError) -> Self {
    match err {
      CodecError::MalformedMessage(msg) => InferenceError::MalformedMessage(msg),
      CodecError::ConnectionClosed => InferenceError::ConnectionClosed,
      CodecError::Io(e) => InferenceError::from(e),
    }
  }
}

fn malformed(msg: impl Into<String>) -> CodecError {
  CodecError::MalformedMessage(msg.into())
}

fn read_u32_be<R: Read>(reader: &mut R) -> Result<u32, CodecError> {
  let mut buf = [0u8; 4];
  reader.read_exact(&mut buf)?;
  Ok(u32::from_be_bytes(buf))
}

fn ensure_consumed(rest: &[u8]) -> Result<(), CodecError> {
  if rest.is_empty() {
    Ok(())
  } else {
    Err(malformed(format!("消息末尾多出 {} 字节", rest.len())))
  }
}

pub fn write_request<W: Write>(writer: &mut W, frame: &RgbNhwcFrame) -> io::Result<()> {
  writer.write_all(&(frame.height() as u32).to_be_bytes())?;
  writer.write_all(&(frame.width() as u32).to_be_bytes())?;
  writer.write_all(frame.as_nhwc())?;
  writer.flush()
}

pub fn read_request<R: Read>(reader: &mut R) -> Result<RgbNhwcFrame, CodecError> {
  let height = read_u32_be(reader)?;
  let width = read_u32_be(reader)?;

  if height == 0 || width == 0 {
    return Err(malformed(format!("无效的帧尺寸 {}x{}", width, height)));
  }
  if height > MAX_FRAME_DIMENSION || width > MAX_FRAME_DIMENSION {
    return Err(malformed(format!(
      "帧尺寸 {}x{} 超过上限 {}",
      width, height, MAX_FRAME_DIMENSION
    )));
  }

  let (height, width) = (height as usize, width as usize);
  let expected = height * width * RGB_CHANNELS;
  // 按实际到达的数据增长缓冲区，不按头部声明一次性分配
  let mut data = Vec::new();
  reader.by_ref().take(expected as u64).read_to_end(&mut data)?;
  if data.len() < expected {
    return Err(CodecError::ConnectionClosed);
  }

  RgbNhwcFrame::from_raw(height, width, data).map_err(|e| malformed(e.to_string()))
}

pub fn encode_request(frame: &RgbNhwcFrame) -> Vec<u8> {
  let mut bytes = Vec::with_capacity(8 + frame.as_nhwc().len());
  bytes.extend_from_slice(&(frame.height() as u32).to_be_bytes());
  bytes.extend_from_slice(&(frame.width() as u32).to_be_bytes());
  bytes.extend_from_slice(frame.as_nhwc());
  bytes
}

pub fn decode_request(bytes: &[u8]) -> Result<RgbNhwcFrame, CodecError> {
  let mut rest = bytes;
  let frame = read_request(&mut rest)?;
  ensure_consumed(rest)?;
  Ok(frame)
}

pub fn write_response<W: Write>(writer: &mut W, result: &InferenceResult) -> io::Result<()> {
  writer.write_all(&encode_response(result))?;
  writer.flush()
}

pub fn read_response<R: Read>(reader: &mut R) -> Result<InferenceResult, CodecError> {
  let count = read_u32_be(reader)?;

  if count == FAILURE_MARKER {
    return read_failure(reader).map(Err);
  }

  if count > MAX_RESPONSE_DETECTIONS {
    return Err(malformed(format!(
      "检测数量 {} 超过上限 {}",
      count, MAX_RESPONSE_DETECTIONS
    )));
  }

  let mut items = Vec::with_capacity(count as usize);
  let mut record = [0u8; RECORD_SIZE];
  for index in 0..count {
    reader.read_exact(&mut record)?;
    let mut values = [0f32; RECORD_FLOATS];
    for (value, chunk) in values.iter_mut().zip(record.chunks_exact(4)) {
      *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    let bbox = BoundingBox::new(values[0], values[1], values[2], values[3]);
    let score = values[4];
    if !bbox.is_valid() || !score.is_finite() {
      return Err(malformed(format!(
        "第 {} 条记录无效: {:?}, 分数 {}",
        index, bbox, score
      )));
    }
    items.push(DetectItem { score, bbox });
  }

  Ok(Ok(DetectResult::from(items)))
}

/// 失败帧的剩余部分，任何截断都视为格式错误
fn read_failure<R: Read>(reader: &mut R) -> Result<InferenceError, CodecError> {
  let truncated = |err: io::Error| match err.kind() {
    io::ErrorKind::UnexpectedEof => malformed("失败响应不完整"),
    _ => CodecError::Io(err),
  };

  let mut kind = [0u8; 1];
  reader.read_exact(&mut kind).map_err(truncated)?;
  let mut len = [0u8; 4];
  reader.read_exact(&mut len).map_err(truncated)?;
  let len = u32::from_be_bytes(len);
  if len == 0 || len > MAX_FAILURE_REASON_LEN {
    return Err(malformed(format!("失败原因长度 {} 无效", len)));
  }

  let mut reason = vec![0u8; len as usize];
  reader.read_exact(&mut reason).map_err(truncated)?;
  let reason = String::from_utf8(reason).map_err(|_| malformed("失败原因不是合法的 UTF-8"))?;

  match kind[0] {
    FAILURE_KIND_MODEL => Ok(InferenceError::ModelFailure(reason)),
    FAILURE_KIND_MALFORMED => Ok(InferenceError::MalformedMessage(reason)),
    other => Err(malformed(format!("未知的失败类别 {}", other))),
  }
}

pub fn encode_response(result: &InferenceResult) -> Vec<u8> {
  match result {
    Ok(detections) => {
      let mut bytes = Vec::with_capacity(4 + detections.len() * RECORD_SIZE);
      bytes.extend_from_slice(&(detections.len() as u32).to_be_bytes());
      for item in detections.iter() {
        for value in item.bbox.to_array() {
          bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes.extend_from_slice(&item.score.to_le_bytes());
      }
      bytes
    }
    Err(err) => {
      let (kind, reason) = match err {
        InferenceError::ModelFailure(reason) => (FAILURE_KIND_MODEL, reason.clone()),
        InferenceError::MalformedMessage(reason) => (FAILURE_KIND_MALFORMED, reason.clone()),
        other => (FAILURE_KIND_MODEL, other.to_string()),
      };
      let reason = match truncate_utf8(&reason, MAX_FAILURE_REASON_LEN as usize) {
        "" => DEFAULT_FAILURE_REASON,
        reason => reason,
      };
      let mut bytes = Vec::with_capacity(9 + reason.len());
      bytes.extend_from_slice(&FAILURE_MARKER.to_be_bytes());
      bytes.push(kind);
      bytes.extend_from_slice(&(reason.len() as u32).to_be_bytes());
      bytes.extend_from_slice(reason.as_bytes());
      bytes
    }
  }
}

pub fn decode_response(bytes: &[u8]) -> Result<InferenceResult, CodecError> {
  let mut rest = bytes;
  let result = read_response(&mut rest)?;
  ensure_consumed(rest)?;
  Ok(result)
}

fn truncate_utf8(text: &str, max: usize) -> &str {
  if text.len() <= max {
    return text;
  }
  let mut end = max;
  while !text.is_char_boundary(end) {
    end -= 1;
  }
  &text[..end]
}

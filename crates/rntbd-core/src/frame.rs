//! # frame 模块说明
//!
//! ## 角色定位（Why）
//! - 把令牌序列组装为带长度前缀的请求/响应帧，并在字节流上按帧切分；
//! - 切分阶段只需识别“是否携带负载”，其余字段按令牌类型跳过，保证前向兼容。
//!
//! ## 线格式（What）
//! - 请求帧：`u32 header_len | u16 resource | u16 operation | guid activity | tokens`；
//! - 响应帧：`u32 header_len | u32 status | guid activity | tokens`；
//! - `header_len` 包含自身 4 字节；帧头中 `PAYLOAD_PRESENT = 1` 时追加
//!   `u32 payload_len | payload`；
//! - 所有整数均为小端。
//!
//! ## 风险提示（Trade-offs）
//! - [`FrameDecoder`] 对帧头与负载分别施加 `max_frame_len` 上限，防止异常长度导致无界缓冲；
//! - 解码器缓存已解析的帧总长，避免负载尚未到齐时重复扫描帧头。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CodecError, TransportError};
use crate::header::{TokenStream, context, request, response};
use crate::operation::{OperationType, ResourceType, status};
use crate::record::CorrelationId;
use crate::token::{Guid, TokenType, TokenValue, ensure_remaining, read_token_header};

/// 固定前缀长度：长度字段 4 + 类型/状态 4 + activity id 16。
pub const FRAME_PREFIX_LEN: usize = 24;

/// 当前实现协商的协议版本。
pub const PROTOCOL_VERSION: u32 = 1;

/// 请求帧。
#[derive(Clone, Debug, PartialEq)]
pub struct RequestFrame {
    pub resource_type: ResourceType,
    pub operation_type: OperationType,
    pub activity_id: Guid,
    pub headers: TokenStream,
    pub payload: Option<Bytes>,
}

impl RequestFrame {
    pub fn new(resource_type: ResourceType, operation_type: OperationType, activity_id: Guid) -> Self {
        Self {
            resource_type,
            operation_type,
            activity_id,
            headers: TokenStream::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// 帧头中的关联 ID。
    pub fn correlation_id(&self) -> Result<CorrelationId, CodecError> {
        self.headers
            .u64(request::TRANSPORT_REQUEST_ID)?
            .map(CorrelationId::from_raw)
            .ok_or(CodecError::MissingToken {
                id: request::TRANSPORT_REQUEST_ID,
            })
    }

    /// 编码为完整帧；`PAYLOAD_PRESENT` 由负载是否存在决定，调用方写入的值会被覆盖。
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut headers = self.headers.clone();
        set_payload_marker(&mut headers, request::PAYLOAD_PRESENT, self.payload.is_some());
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            |buf| {
                buf.put_u16_le(self.resource_type.id());
                buf.put_u16_le(self.operation_type.id());
            },
            self.activity_id,
            &headers,
            self.payload.as_ref(),
        )?;
        Ok(buf.freeze())
    }

    /// 从一个完整帧解码。
    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        let header_len = read_header_len(&frame)?;
        let mut header = frame.split_to(header_len);
        header.advance(4);
        let resource_type = ResourceType::from_id(header.get_u16_le());
        let operation_type = OperationType::from_id(header.get_u16_le());
        let activity_id = Guid::read(&mut header)?;
        let headers = TokenStream::decode(header)?;
        let payload = read_payload(&headers, request::PAYLOAD_PRESENT, &mut frame)?;
        Ok(Self {
            resource_type,
            operation_type,
            activity_id,
            headers,
            payload,
        })
    }
}

/// 响应帧。
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseFrame {
    pub status: u32,
    pub activity_id: Guid,
    pub headers: TokenStream,
    pub payload: Option<Bytes>,
}

impl ResponseFrame {
    pub fn new(status: u32, activity_id: Guid) -> Self {
        Self {
            status,
            activity_id,
            headers: TokenStream::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// 服务端回显的关联 ID；缺失时视为协议错误。
    pub fn correlation_id(&self) -> Result<CorrelationId, CodecError> {
        self.headers
            .u64(response::TRANSPORT_REQUEST_ID)?
            .map(CorrelationId::from_raw)
            .ok_or(CodecError::MissingToken {
                id: response::TRANSPORT_REQUEST_ID,
            })
    }

    pub fn sub_status(&self) -> Result<u32, CodecError> {
        Ok(self.headers.u32(response::SUB_STATUS)?.unwrap_or(0))
    }

    pub fn is_success(&self) -> bool {
        status::is_success(self.status)
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut headers = self.headers.clone();
        set_payload_marker(&mut headers, response::PAYLOAD_PRESENT, self.payload.is_some());
        let mut buf = BytesMut::new();
        encode_frame(
            &mut buf,
            |buf| buf.put_u32_le(self.status),
            self.activity_id,
            &headers,
            self.payload.as_ref(),
        )?;
        Ok(buf.freeze())
    }

    pub fn decode(mut frame: Bytes) -> Result<Self, CodecError> {
        let header_len = read_header_len(&frame)?;
        let mut header = frame.split_to(header_len);
        header.advance(4);
        let status = header.get_u32_le();
        let activity_id = Guid::read(&mut header)?;
        let headers = TokenStream::decode(header)?;
        let payload = read_payload(&headers, response::PAYLOAD_PRESENT, &mut frame)?;
        Ok(Self {
            status,
            activity_id,
            headers,
            payload,
        })
    }

    /// 只解出关联 ID，其余帧头字段按类型宽度跳过、不物化。
    pub fn peek_correlation_id(frame: &Bytes) -> Result<CorrelationId, CodecError> {
        let header_len = read_header_len(frame)?;
        TokenStream::decode_filtered(
            frame.slice(FRAME_PREFIX_LEN..header_len),
            &[response::TRANSPORT_REQUEST_ID],
        )?
        .u64(response::TRANSPORT_REQUEST_ID)?
        .map(CorrelationId::from_raw)
        .ok_or(CodecError::MissingToken {
            id: response::TRANSPORT_REQUEST_ID,
        })
    }

    /// 把非成功响应转换为协议级错误。
    pub fn into_store_error(self) -> TransportError {
        let sub_status = self.sub_status().unwrap_or(0);
        let message = self
            .headers
            .str(response::SERVER_MESSAGE)
            .ok()
            .flatten()
            .unwrap_or_default()
            .to_owned();
        TransportError::Store {
            status: self.status,
            sub_status,
            activity_id: self.activity_id,
            message,
        }
    }
}

/// 通道建立后的首个请求：声明协议版本与客户端身份。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextRequest {
    pub activity_id: Guid,
    pub protocol_version: u32,
    pub client_version: String,
    pub user_agent: String,
}

impl ContextRequest {
    pub fn new(activity_id: Guid, user_agent: impl Into<String>) -> Self {
        Self {
            activity_id,
            protocol_version: PROTOCOL_VERSION,
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            user_agent: user_agent.into(),
        }
    }

    pub fn to_frame(&self) -> RequestFrame {
        let mut frame = RequestFrame::new(
            ResourceType::Connection,
            OperationType::Connection,
            self.activity_id,
        );
        frame
            .headers
            .push(
                context::PROTOCOL_VERSION,
                TokenValue::ULong(self.protocol_version),
            )
            .push(
                context::CLIENT_VERSION,
                TokenValue::SmallString(self.client_version.clone()),
            )
            .push(
                context::USER_AGENT,
                TokenValue::SmallString(self.user_agent.clone()),
            );
        frame
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        self.to_frame().encode()
    }

    /// 服务端视角的解析，测试替身与诊断工具使用。
    pub fn from_frame(frame: &RequestFrame) -> Result<Self, CodecError> {
        Ok(Self {
            activity_id: frame.activity_id,
            protocol_version: frame
                .headers
                .u32(context::PROTOCOL_VERSION)?
                .ok_or(CodecError::MissingToken {
                    id: context::PROTOCOL_VERSION,
                })?,
            client_version: frame
                .headers
                .str(context::CLIENT_VERSION)?
                .unwrap_or_default()
                .to_owned(),
            user_agent: frame
                .headers
                .str(context::USER_AGENT)?
                .unwrap_or_default()
                .to_owned(),
        })
    }
}

/// 上下文协商的响应。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextResponse {
    pub status: u32,
    pub activity_id: Guid,
    pub protocol_version: u32,
    pub server_agent: String,
    pub server_version: String,
    pub message: String,
}

impl ContextResponse {
    /// 服务端接受协商时的响应。
    pub fn accepted(activity_id: Guid, server_agent: impl Into<String>) -> Self {
        Self {
            status: status::OK,
            activity_id,
            protocol_version: PROTOCOL_VERSION,
            server_agent: server_agent.into(),
            server_version: String::new(),
            message: String::new(),
        }
    }

    pub fn to_frame(&self) -> ResponseFrame {
        let mut frame = ResponseFrame::new(self.status, self.activity_id);
        frame
            .headers
            .push(
                context::PROTOCOL_VERSION,
                TokenValue::ULong(self.protocol_version),
            )
            .push(
                context::SERVER_AGENT,
                TokenValue::SmallString(self.server_agent.clone()),
            )
            .push(
                context::SERVER_VERSION,
                TokenValue::SmallString(self.server_version.clone()),
            );
        if !self.message.is_empty() {
            frame
                .headers
                .push(response::SERVER_MESSAGE, TokenValue::String(self.message.clone()));
        }
        frame
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        self.to_frame().encode()
    }

    pub fn from_frame(frame: &ResponseFrame) -> Result<Self, CodecError> {
        Ok(Self {
            status: frame.status,
            activity_id: frame.activity_id,
            protocol_version: frame.headers.u32(context::PROTOCOL_VERSION)?.unwrap_or(0),
            server_agent: frame
                .headers
                .str(context::SERVER_AGENT)?
                .unwrap_or_default()
                .to_owned(),
            server_version: frame
                .headers
                .str(context::SERVER_VERSION)?
                .unwrap_or_default()
                .to_owned(),
            message: frame
                .headers
                .str(response::SERVER_MESSAGE)?
                .unwrap_or_default()
                .to_owned(),
        })
    }

    /// 非成功状态转换为协商失败。
    pub fn into_result(self) -> Result<Self, TransportError> {
        if status::is_success(self.status) {
            Ok(self)
        } else {
            Err(TransportError::ContextNegotiation {
                status: self.status,
                message: self.message,
            })
        }
    }
}

/// 字节流上的增量分帧器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - TCP 只保证字节有序，帧边界需由长度前缀恢复；
/// - 负载是否存在写在帧头令牌里，分帧器必须能跳过任意未知令牌找到该标记。
///
/// ## 逻辑 (How)
/// - 先读取 `header_len` 并校验上下限；
/// - 帧头完整后扫描 `PAYLOAD_PRESENT`，必要时再读 `payload_len`；
/// - 计算出的帧总长缓存在 `pending_len` 中，直到整帧到齐后一次性 `split_to`。
///
/// ## 契约 (What)
/// - `decode` 返回 `Ok(Some(frame))` 时 `frame` 为包含帧头与负载段的完整帧；
/// - 返回 `Ok(None)` 表示需要更多字节；
/// - 长度越界或帧头令牌非法时返回 [`CodecError`]，调用方应关闭通道。
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_len: usize,
    pending_len: Option<usize>,
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            pending_len: None,
        }
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
        let total = match self.pending_len {
            Some(total) => total,
            None => match self.measure(buf)? {
                Some(total) => {
                    self.pending_len = Some(total);
                    total
                }
                None => return Ok(None),
            },
        };
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        self.pending_len = None;
        Ok(Some(buf.split_to(total).freeze()))
    }

    fn measure(&self, buf: &mut BytesMut) -> Result<Option<usize>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let header_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        self.check_len(header_len, FRAME_PREFIX_LEN)?;
        if buf.len() < header_len {
            buf.reserve(header_len - buf.len());
            return Ok(None);
        }
        let tokens = Bytes::copy_from_slice(&buf[FRAME_PREFIX_LEN..header_len]);
        if !payload_marked(tokens)? {
            return Ok(Some(header_len));
        }
        if buf.len() < header_len + 4 {
            return Ok(None);
        }
        let at = header_len;
        let payload_len =
            u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
        let total = header_len
            .checked_add(4)
            .and_then(|len| len.checked_add(payload_len))
            .unwrap_or(usize::MAX);
        self.check_len(total, FRAME_PREFIX_LEN)?;
        Ok(Some(total))
    }

    fn check_len(&self, len: usize, min: usize) -> Result<(), CodecError> {
        if len < min || len > self.max_frame_len {
            Err(CodecError::FrameLength {
                len,
                min,
                max: self.max_frame_len,
            })
        } else {
            Ok(())
        }
    }
}

/// 扫描帧头令牌寻找负载标记，其余令牌按类型跳过。
fn payload_marked(mut tokens: Bytes) -> Result<bool, CodecError> {
    // 请求与响应的负载标记共用 0x0000。
    while tokens.has_remaining() {
        let (id, ty) = read_token_header(&mut tokens)?;
        if id == request::PAYLOAD_PRESENT && ty == TokenType::Byte {
            ensure_remaining(&tokens, 1)?;
            return Ok(tokens.get_u8() != 0);
        }
        ty.skip_value(&mut tokens)?;
    }
    Ok(false)
}

fn set_payload_marker(headers: &mut TokenStream, id: u16, present: bool) {
    headers.remove(id);
    if present {
        headers.push(id, TokenValue::Byte(1));
    }
}

fn encode_frame(
    buf: &mut BytesMut,
    put_kind: impl FnOnce(&mut BytesMut),
    activity_id: Guid,
    headers: &TokenStream,
    payload: Option<&Bytes>,
) -> Result<(), CodecError> {
    let header_len = FRAME_PREFIX_LEN + headers.encoded_len();
    let header_len_u32 = u32::try_from(header_len).map_err(|_| CodecError::FrameLength {
        len: header_len,
        min: FRAME_PREFIX_LEN,
        max: u32::MAX as usize,
    })?;
    buf.reserve(header_len + payload.map_or(0, |p| 4 + p.len()));
    buf.put_u32_le(header_len_u32);
    put_kind(buf);
    buf.put_slice(activity_id.as_bytes());
    headers.encode(buf)?;
    if let Some(payload) = payload {
        let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameLength {
            len: payload.len(),
            min: 0,
            max: u32::MAX as usize,
        })?;
        buf.put_u32_le(len);
        buf.put_slice(payload);
    }
    Ok(())
}

fn read_header_len(frame: &Bytes) -> Result<usize, CodecError> {
    ensure_remaining(frame, 4)?;
    let header_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if header_len < FRAME_PREFIX_LEN {
        return Err(CodecError::FrameLength {
            len: header_len,
            min: FRAME_PREFIX_LEN,
            max: frame.len(),
        });
    }
    ensure_remaining(frame, header_len)?;
    Ok(header_len)
}

fn read_payload(
    headers: &TokenStream,
    marker: u16,
    rest: &mut Bytes,
) -> Result<Option<Bytes>, CodecError> {
    if headers.u8(marker)?.unwrap_or(0) == 0 {
        return Ok(None);
    }
    ensure_remaining(rest, 4)?;
    let len = rest.get_u32_le() as usize;
    ensure_remaining(rest, len)?;
    Ok(Some(rest.split_to(len)))
}

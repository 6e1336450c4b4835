//! 帧头字段标识与令牌序列。
//!
//! # 教案式说明
//! - **意图 (Why)**：请求/响应帧头是一串令牌，调用方只关心其中少数字段（关联 ID、子状态、
//!   负载标记）；其余字段必须能够被安全跳过，才能与更新版本的服务端互通；
//! - **契约 (What)**：[`TokenStream`] 保持线上顺序，按字段标识查询时返回首个匹配项；
//!   [`TokenStream::decode_filtered`] 只物化调用方关心的字段，响应路径先用它取出关联 ID，
//!   确认有在途请求后才完整解码；
//! - **权衡 (Trade-offs)**：查询为线性扫描，帧头字段通常不超过几十个，线性扫描比哈希表
//!   更省分配。

use bytes::{Buf, Bytes, BytesMut};

use crate::error::CodecError;
use crate::token::{Guid, Token, TokenType, TokenValue, read_token_header};

/// 请求帧头字段标识。
pub mod request {
    /// `Byte`：1 表示帧头后跟随负载段。
    pub const PAYLOAD_PRESENT: u16 = 0x0000;
    /// `String`：副本路径。
    pub const REPLICA_PATH: u16 = 0x0001;
    /// `String`：会话令牌。
    pub const SESSION_TOKEN: u16 = 0x0009;
    /// `ULongLong`：通道内关联 ID。
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0050;
}

/// 响应帧头字段标识。
pub mod response {
    /// `Byte`：1 表示帧头后跟随负载段。
    pub const PAYLOAD_PRESENT: u16 = 0x0000;
    /// `LongLong`：日志序列号。
    pub const LSN: u16 = 0x0013;
    /// `ULong`：服务端子状态码。
    pub const SUB_STATUS: u16 = 0x001C;
    /// `ULongLong`：回显请求的关联 ID。
    pub const TRANSPORT_REQUEST_ID: u16 = 0x0035;
    /// `String`：服务端错误描述。
    pub const SERVER_MESSAGE: u16 = 0x0041;
}

/// 上下文协商字段标识（请求与响应共用编号空间，`0x0000` 留给负载标记）。
pub mod context {
    /// `ULong`：协议版本。
    pub const PROTOCOL_VERSION: u16 = 0x0001;
    /// `SmallString`：客户端版本。
    pub const CLIENT_VERSION: u16 = 0x0002;
    /// `SmallString`：客户端 UA。
    pub const USER_AGENT: u16 = 0x0003;
    /// `SmallString`：服务端 Agent。
    pub const SERVER_AGENT: u16 = 0x0004;
    /// `SmallString`：服务端版本。
    pub const SERVER_VERSION: u16 = 0x0005;
}

/// 有序令牌集合。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字段；同一标识重复写入时保留首个，查询语义与服务端一致。
    pub fn push(&mut self, id: u16, value: TokenValue) -> &mut Self {
        self.tokens.push(Token::new(id, value));
        self
    }

    /// Builder 风格的 [`push`](Self::push)。
    pub fn with(mut self, id: u16, value: TokenValue) -> Self {
        self.push(id, value);
        self
    }

    /// 移除给定标识的全部字段，返回是否移除过。
    pub fn remove(&mut self, id: u16) -> bool {
        let before = self.tokens.len();
        self.tokens.retain(|token| token.id() != id);
        before != self.tokens.len()
    }

    pub fn get(&self, id: u16) -> Option<&TokenValue> {
        self.tokens
            .iter()
            .find(|token| token.id() == id)
            .map(Token::value)
    }

    pub fn contains(&self, id: u16) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }

    /// 读取 `Byte` 字段。
    pub fn u8(&self, id: u16) -> Result<Option<u8>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::Byte(v)) => Ok(Some(*v)),
            Some(other) => Err(mismatch(id, TokenType::Byte, other)),
        }
    }

    /// 读取 `ULong` 字段，兼容 `UShort`/`Byte` 的窄编码。
    pub fn u32(&self, id: u16) -> Result<Option<u32>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::ULong(v)) => Ok(Some(*v)),
            Some(TokenValue::UShort(v)) => Ok(Some(u32::from(*v))),
            Some(TokenValue::Byte(v)) => Ok(Some(u32::from(*v))),
            Some(other) => Err(mismatch(id, TokenType::ULong, other)),
        }
    }

    /// 读取 `ULongLong` 字段，兼容 `ULong` 的窄编码。
    pub fn u64(&self, id: u16) -> Result<Option<u64>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::ULongLong(v)) => Ok(Some(*v)),
            Some(TokenValue::ULong(v)) => Ok(Some(u64::from(*v))),
            Some(other) => Err(mismatch(id, TokenType::ULongLong, other)),
        }
    }

    pub fn i64(&self, id: u16) -> Result<Option<i64>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::LongLong(v)) => Ok(Some(*v)),
            Some(TokenValue::Long(v)) => Ok(Some(i64::from(*v))),
            Some(other) => Err(mismatch(id, TokenType::LongLong, other)),
        }
    }

    /// 读取任一字符串宽度的字段。
    pub fn str(&self, id: u16) -> Result<Option<&str>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(
                TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s),
            ) => Ok(Some(s.as_str())),
            Some(other) => Err(mismatch(id, TokenType::String, other)),
        }
    }

    pub fn bytes(&self, id: u16) -> Result<Option<&Bytes>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b)) => {
                Ok(Some(b))
            }
            Some(other) => Err(mismatch(id, TokenType::Bytes, other)),
        }
    }

    pub fn guid(&self, id: u16) -> Result<Option<Guid>, CodecError> {
        match self.get(id) {
            None => Ok(None),
            Some(TokenValue::Guid(g)) => Ok(Some(*g)),
            Some(other) => Err(mismatch(id, TokenType::Guid, other)),
        }
    }

    pub fn encoded_len(&self) -> usize {
        self.tokens.iter().map(Token::encoded_len).sum()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.reserve(self.encoded_len());
        for token in &self.tokens {
            token.encode(buf)?;
        }
        Ok(())
    }

    /// 消费整个缓冲并解码全部令牌。
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let mut tokens = Vec::new();
        while buf.has_remaining() {
            tokens.push(Token::decode(&mut buf)?);
        }
        Ok(Self { tokens })
    }

    /// 只保留 `wanted` 中列出的字段，其余按类型宽度直接跳过。
    pub fn decode_filtered(mut buf: Bytes, wanted: &[u16]) -> Result<Self, CodecError> {
        let mut tokens = Vec::new();
        while buf.has_remaining() {
            let mut cursor = buf.clone();
            let (id, ty) = read_token_header(&mut cursor)?;
            if wanted.contains(&id) {
                tokens.push(Token::decode(&mut buf)?);
            } else {
                ty.skip_value(&mut cursor)?;
                buf = cursor;
            }
        }
        Ok(Self { tokens })
    }
}

impl FromIterator<Token> for TokenStream {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

fn mismatch(id: u16, expected: TokenType, actual: &TokenValue) -> CodecError {
    CodecError::TokenTypeMismatch {
        id,
        expected,
        actual: actual.token_type(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> TokenStream {
        TokenStream::new()
            .with(request::TRANSPORT_REQUEST_ID, TokenValue::ULongLong(9))
            .with(request::REPLICA_PATH, TokenValue::String("/replica/1".into()))
            .with(0x0777, TokenValue::ULongBytes(Bytes::from_static(b"future")))
            .with(request::PAYLOAD_PRESENT, TokenValue::Byte(1))
    }

    #[test]
    fn filtered_decode_skips_unrequested_fields() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf).unwrap();
        let decoded = TokenStream::decode_filtered(
            buf.freeze(),
            &[request::TRANSPORT_REQUEST_ID, request::PAYLOAD_PRESENT],
        )
        .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.u64(request::TRANSPORT_REQUEST_ID).unwrap(), Some(9));
        assert_eq!(decoded.u8(request::PAYLOAD_PRESENT).unwrap(), Some(1));
        assert!(!decoded.contains(0x0777));
    }

    #[test]
    fn typed_accessor_reports_mismatch() {
        let stream = sample();
        let err = stream.u64(request::REPLICA_PATH).unwrap_err();
        assert!(matches!(
            err,
            CodecError::TokenTypeMismatch {
                id: request::REPLICA_PATH,
                expected: TokenType::ULongLong,
                actual: TokenType::String,
            }
        ));
    }

    #[test]
    fn remove_drops_every_occurrence() {
        let mut stream = sample().with(request::REPLICA_PATH, TokenValue::String("dup".into()));
        assert!(stream.remove(request::REPLICA_PATH));
        assert!(!stream.contains(request::REPLICA_PATH));
        assert!(!stream.remove(request::REPLICA_PATH));
    }

    fn any_value() -> impl Strategy<Value = TokenValue> {
        prop_oneof![
            any::<u8>().prop_map(TokenValue::Byte),
            any::<u32>().prop_map(TokenValue::ULong),
            any::<i64>().prop_map(TokenValue::LongLong),
            any::<[u8; 16]>().prop_map(|raw| TokenValue::Guid(Guid::from_bytes(raw))),
            "[a-z]{0,40}".prop_map(TokenValue::SmallString),
            proptest::collection::vec(any::<u8>(), 0..300)
                .prop_map(|v| TokenValue::Bytes(Bytes::from(v))),
        ]
    }

    proptest! {
        #[test]
        fn full_decode_preserves_order_and_values(
            fields in proptest::collection::vec((any::<u16>(), any_value()), 0..12)
        ) {
            let stream: TokenStream = fields
                .into_iter()
                .map(|(id, value)| Token::new(id, value))
                .collect();
            let mut buf = BytesMut::new();
            stream.encode(&mut buf).unwrap();
            prop_assert_eq!(buf.len(), stream.encoded_len());
            let decoded = TokenStream::decode(buf.freeze()).unwrap();
            prop_assert_eq!(decoded, stream);
        }
    }
}

//! # token 模块说明
//!
//! ## 角色定位（Why）
//! - RNTBD 帧头与上下文协商中的每个字段都以“标识 + 类型 + 值”的令牌形式出现；
//! - 解码端依赖类型标识推导值长度，从而可以跳过不关心或未来新增的字段（前向兼容）。
//!
//! ## 契约（What）
//! - [`TokenType::id`] 与 [`TokenType::from_id`] 是互逆的全函数；未知标识映射为
//!   [`TokenType::Invalid`]，绝不 panic；
//! - [`Token`] 为不可变值类型，只持有自身的字节或标量。
//!
//! ## 线格式（How）
//! - 单个令牌：`u16 header id | u8 type id | value`，全部小端；
//! - 变长值按类型携带 `u8`/`u16`/`u32` 长度前缀。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/// 令牌的线上类型。
///
/// # 教案式注释
/// - **意图 (Why)**：类型标识决定值的编码宽度，解码端无需理解字段语义即可跳过；
/// - **契约 (What)**：每个变体拥有稳定的 `u8` 标识，`Invalid` 仅作为未知标识的兜底，
///   不可被编码到线上；
/// - **风险 (Trade-offs)**：新增类型需要同步更新 `from_id` 与 `value_len`，否则旧版本解码器
///   会把它视为 `Invalid` 并中止帧解析。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenType {
    Byte,
    UShort,
    ULong,
    Long,
    ULongLong,
    LongLong,
    Guid,
    SmallString,
    String,
    ULongString,
    SmallBytes,
    Bytes,
    ULongBytes,
    Float,
    Double,
    Invalid,
}

impl TokenType {
    /// 全部可编码的类型，按线上标识升序排列。
    pub const ALL: [TokenType; 15] = [
        TokenType::Byte,
        TokenType::UShort,
        TokenType::ULong,
        TokenType::Long,
        TokenType::ULongLong,
        TokenType::LongLong,
        TokenType::Guid,
        TokenType::SmallString,
        TokenType::String,
        TokenType::ULongString,
        TokenType::SmallBytes,
        TokenType::Bytes,
        TokenType::ULongBytes,
        TokenType::Float,
        TokenType::Double,
    ];

    /// 返回线上类型标识。
    pub const fn id(self) -> u8 {
        match self {
            TokenType::Byte => 0x00,
            TokenType::UShort => 0x01,
            TokenType::ULong => 0x02,
            TokenType::Long => 0x03,
            TokenType::ULongLong => 0x04,
            TokenType::LongLong => 0x05,
            TokenType::Guid => 0x06,
            TokenType::SmallString => 0x07,
            TokenType::String => 0x08,
            TokenType::ULongString => 0x09,
            TokenType::SmallBytes => 0x0A,
            TokenType::Bytes => 0x0B,
            TokenType::ULongBytes => 0x0C,
            TokenType::Float => 0x0D,
            TokenType::Double => 0x0E,
            TokenType::Invalid => 0xFF,
        }
    }

    /// 由线上标识还原类型；未登记的标识返回 [`TokenType::Invalid`]。
    pub const fn from_id(id: u8) -> TokenType {
        match id {
            0x00 => TokenType::Byte,
            0x01 => TokenType::UShort,
            0x02 => TokenType::ULong,
            0x03 => TokenType::Long,
            0x04 => TokenType::ULongLong,
            0x05 => TokenType::LongLong,
            0x06 => TokenType::Guid,
            0x07 => TokenType::SmallString,
            0x08 => TokenType::String,
            0x09 => TokenType::ULongString,
            0x0A => TokenType::SmallBytes,
            0x0B => TokenType::Bytes,
            0x0C => TokenType::ULongBytes,
            0x0D => TokenType::Float,
            0x0E => TokenType::Double,
            _ => TokenType::Invalid,
        }
    }

    /// 定长类型的值宽度；变长类型返回 `None`。
    pub const fn fixed_len(self) -> Option<usize> {
        match self {
            TokenType::Byte => Some(1),
            TokenType::UShort => Some(2),
            TokenType::ULong | TokenType::Long | TokenType::Float => Some(4),
            TokenType::ULongLong | TokenType::LongLong | TokenType::Double => Some(8),
            TokenType::Guid => Some(16),
            _ => None,
        }
    }

    /// 变长类型的长度前缀宽度（字节数）；定长与非法类型返回 `None`。
    const fn length_prefix(self) -> Option<usize> {
        match self {
            TokenType::SmallString | TokenType::SmallBytes => Some(1),
            TokenType::String | TokenType::Bytes => Some(2),
            TokenType::ULongString | TokenType::ULongBytes => Some(4),
            _ => None,
        }
    }

    /// 在不解析内容的前提下跳过一个值，用于过滤不关心的令牌。
    pub(crate) fn skip_value(self, buf: &mut Bytes) -> Result<(), CodecError> {
        let len = self.value_len(buf)?;
        ensure_remaining(buf, len)?;
        buf.advance(len);
        Ok(())
    }

    /// 计算当前游标处值的总长度（不含长度前缀时会先消费前缀）。
    fn value_len(self, buf: &mut Bytes) -> Result<usize, CodecError> {
        if let Some(len) = self.fixed_len() {
            return Ok(len);
        }
        match self.length_prefix() {
            Some(1) => {
                ensure_remaining(buf, 1)?;
                Ok(buf.get_u8() as usize)
            }
            Some(2) => {
                ensure_remaining(buf, 2)?;
                Ok(buf.get_u16_le() as usize)
            }
            Some(_) => {
                ensure_remaining(buf, 4)?;
                Ok(buf.get_u32_le() as usize)
            }
            None => Err(CodecError::InvalidTokenType { type_id: self.id() }),
        }
    }
}

/// 16 字节 GUID，按线上顺序原样保存。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// 全零 GUID。
    pub const NIL: Guid = Guid([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_le_bytes())
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub(crate) fn read(buf: &mut Bytes) -> Result<Self, CodecError> {
        ensure_remaining(buf, 16)?;
        let mut raw = [0u8; 16];
        buf.copy_to_slice(&mut raw);
        Ok(Self(raw))
    }
}

impl core::fmt::Display for Guid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (index, byte) in self.0.iter().enumerate() {
            if matches!(index, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 令牌携带的值，变体与 [`TokenType`] 一一对应（`Invalid` 除外）。
#[derive(Clone, Debug, PartialEq)]
pub enum TokenValue {
    Byte(u8),
    UShort(u16),
    ULong(u32),
    Long(i32),
    ULongLong(u64),
    LongLong(i64),
    Guid(Guid),
    SmallString(String),
    String(String),
    ULongString(String),
    SmallBytes(Bytes),
    Bytes(Bytes),
    ULongBytes(Bytes),
    Float(f32),
    Double(f64),
}

impl TokenValue {
    /// 值对应的线上类型。
    pub fn token_type(&self) -> TokenType {
        match self {
            TokenValue::Byte(_) => TokenType::Byte,
            TokenValue::UShort(_) => TokenType::UShort,
            TokenValue::ULong(_) => TokenType::ULong,
            TokenValue::Long(_) => TokenType::Long,
            TokenValue::ULongLong(_) => TokenType::ULongLong,
            TokenValue::LongLong(_) => TokenType::LongLong,
            TokenValue::Guid(_) => TokenType::Guid,
            TokenValue::SmallString(_) => TokenType::SmallString,
            TokenValue::String(_) => TokenType::String,
            TokenValue::ULongString(_) => TokenType::ULongString,
            TokenValue::SmallBytes(_) => TokenType::SmallBytes,
            TokenValue::Bytes(_) => TokenType::Bytes,
            TokenValue::ULongBytes(_) => TokenType::ULongBytes,
            TokenValue::Float(_) => TokenType::Float,
            TokenValue::Double(_) => TokenType::Double,
        }
    }

    /// 编码后的值长度（含长度前缀，不含令牌头）。
    pub fn encoded_len(&self) -> usize {
        let ty = self.token_type();
        if let Some(len) = ty.fixed_len() {
            return len;
        }
        let prefix = ty.length_prefix().unwrap_or(0);
        let body = match self {
            TokenValue::SmallString(s) | TokenValue::String(s) | TokenValue::ULongString(s) => {
                s.len()
            }
            TokenValue::SmallBytes(b) | TokenValue::Bytes(b) | TokenValue::ULongBytes(b) => {
                b.len()
            }
            _ => 0,
        };
        prefix + body
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            TokenValue::Byte(v) => buf.put_u8(*v),
            TokenValue::UShort(v) => buf.put_u16_le(*v),
            TokenValue::ULong(v) => buf.put_u32_le(*v),
            TokenValue::Long(v) => buf.put_i32_le(*v),
            TokenValue::ULongLong(v) => buf.put_u64_le(*v),
            TokenValue::LongLong(v) => buf.put_i64_le(*v),
            TokenValue::Guid(v) => buf.put_slice(v.as_bytes()),
            TokenValue::SmallString(s) => put_prefixed(buf, TokenType::SmallString, s.as_bytes())?,
            TokenValue::String(s) => put_prefixed(buf, TokenType::String, s.as_bytes())?,
            TokenValue::ULongString(s) => put_prefixed(buf, TokenType::ULongString, s.as_bytes())?,
            TokenValue::SmallBytes(b) => put_prefixed(buf, TokenType::SmallBytes, b)?,
            TokenValue::Bytes(b) => put_prefixed(buf, TokenType::Bytes, b)?,
            TokenValue::ULongBytes(b) => put_prefixed(buf, TokenType::ULongBytes, b)?,
            TokenValue::Float(v) => buf.put_f32_le(*v),
            TokenValue::Double(v) => buf.put_f64_le(*v),
        }
        Ok(())
    }

    fn decode(ty: TokenType, buf: &mut Bytes) -> Result<TokenValue, CodecError> {
        if let Some(len) = ty.fixed_len() {
            ensure_remaining(buf, len)?;
        }
        let value = match ty {
            TokenType::Byte => TokenValue::Byte(buf.get_u8()),
            TokenType::UShort => TokenValue::UShort(buf.get_u16_le()),
            TokenType::ULong => TokenValue::ULong(buf.get_u32_le()),
            TokenType::Long => TokenValue::Long(buf.get_i32_le()),
            TokenType::ULongLong => TokenValue::ULongLong(buf.get_u64_le()),
            TokenType::LongLong => TokenValue::LongLong(buf.get_i64_le()),
            TokenType::Guid => TokenValue::Guid(Guid::read(buf)?),
            TokenType::Float => TokenValue::Float(buf.get_f32_le()),
            TokenType::Double => TokenValue::Double(buf.get_f64_le()),
            TokenType::SmallString => TokenValue::SmallString(take_string(ty, buf)?),
            TokenType::String => TokenValue::String(take_string(ty, buf)?),
            TokenType::ULongString => TokenValue::ULongString(take_string(ty, buf)?),
            TokenType::SmallBytes => TokenValue::SmallBytes(take_bytes(ty, buf)?),
            TokenType::Bytes => TokenValue::Bytes(take_bytes(ty, buf)?),
            TokenType::ULongBytes => TokenValue::ULongBytes(take_bytes(ty, buf)?),
            TokenType::Invalid => {
                return Err(CodecError::InvalidTokenType {
                    type_id: ty.id(),
                });
            }
        };
        Ok(value)
    }
}

/// 帧头中的单个字段。
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    id: u16,
    value: TokenValue,
}

impl Token {
    pub fn new(id: u16, value: TokenValue) -> Self {
        Self { id, value }
    }

    /// 字段标识（帧头内语义编号）。
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn token_type(&self) -> TokenType {
        self.value.token_type()
    }

    pub fn value(&self) -> &TokenValue {
        &self.value
    }

    /// 令牌在线上的完整长度。
    pub fn encoded_len(&self) -> usize {
        3 + self.value.encoded_len()
    }

    /// 写入 `id | type | value`。
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.reserve(self.encoded_len());
        buf.put_u16_le(self.id);
        buf.put_u8(self.token_type().id());
        self.value.encode(buf)
    }

    /// 从游标处读取一个完整令牌。
    pub fn decode(buf: &mut Bytes) -> Result<Token, CodecError> {
        let (id, ty) = read_token_header(buf)?;
        let value = TokenValue::decode(ty, buf)?;
        Ok(Token { id, value })
    }
}

/// 读取令牌头 `u16 id | u8 type`。
pub(crate) fn read_token_header(buf: &mut Bytes) -> Result<(u16, TokenType), CodecError> {
    ensure_remaining(buf, 3)?;
    let id = buf.get_u16_le();
    let type_id = buf.get_u8();
    match TokenType::from_id(type_id) {
        TokenType::Invalid => Err(CodecError::InvalidTokenType { type_id }),
        ty => Ok((id, ty)),
    }
}

pub(crate) fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn put_prefixed(buf: &mut BytesMut, ty: TokenType, body: &[u8]) -> Result<(), CodecError> {
    let len = body.len();
    match ty.length_prefix() {
        Some(1) => buf.put_u8(u8::try_from(len).map_err(|_| too_long(ty, len))?),
        Some(2) => buf.put_u16_le(u16::try_from(len).map_err(|_| too_long(ty, len))?),
        Some(_) => buf.put_u32_le(u32::try_from(len).map_err(|_| too_long(ty, len))?),
        None => return Err(CodecError::InvalidTokenType { type_id: ty.id() }),
    }
    buf.put_slice(body);
    Ok(())
}

fn too_long(ty: TokenType, len: usize) -> CodecError {
    CodecError::ValueTooLong {
        token_type: ty,
        len,
    }
}

fn take_bytes(ty: TokenType, buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = ty.value_len(buf)?;
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

fn take_string(ty: TokenType, buf: &mut Bytes) -> Result<String, CodecError> {
    let raw = take_bytes(ty, buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn every_type_round_trips_through_its_id() {
        for ty in TokenType::ALL {
            assert_eq!(TokenType::from_id(ty.id()), ty, "{ty:?}");
        }
        assert_eq!(TokenType::from_id(TokenType::Invalid.id()), TokenType::Invalid);
    }

    #[test]
    fn ids_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for ty in TokenType::ALL {
            assert!(seen.insert(ty.id()), "duplicate id for {ty:?}");
        }
    }

    proptest! {
        #[test]
        fn unmapped_ids_decode_as_invalid(id in 0x0Fu8..=0xFF) {
            prop_assert_eq!(TokenType::from_id(id), TokenType::Invalid);
        }
    }

    #[test]
    fn small_string_rejects_oversized_value() {
        let token = Token::new(7, TokenValue::SmallString("x".repeat(256)));
        let mut buf = BytesMut::new();
        let err = token.encode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::ValueTooLong {
                token_type: TokenType::SmallString,
                len: 256
            }
        ));
    }

    #[test]
    fn decode_reports_truncated_value() {
        let mut buf = BytesMut::new();
        Token::new(1, TokenValue::ULongLong(42))
            .encode(&mut buf)
            .unwrap();
        let mut frozen = buf.freeze().slice(..6);
        assert!(matches!(
            Token::decode(&mut frozen),
            Err(CodecError::Truncated { needed: 8, .. })
        ));
    }

    #[test]
    fn invalid_type_on_the_wire_is_rejected() {
        let mut raw = Bytes::from_static(&[0x01, 0x00, 0x42, 0x00]);
        assert!(matches!(
            Token::decode(&mut raw),
            Err(CodecError::InvalidTokenType { type_id: 0x42 })
        ));
    }

    #[test]
    fn guid_display_uses_dashed_groups() {
        let guid = Guid::from_bytes([0xab; 16]);
        assert_eq!(guid.to_string(), "abababab-abab-abab-abab-abababababab");
    }
}

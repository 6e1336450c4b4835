//! 操作类型与资源类型。
//!
//! 只登记直连核心需要区分的子集；完整的操作码集合属于上层文档 API。

/// 请求的操作类型。
///
/// # 教案式注释
/// - **意图 (Why)**：过期分类的核心输入是“操作是否幂等”，因此操作类型必须随请求记录
///   一起保存；
/// - **契约 (What)**：[`is_read_only`](Self::is_read_only) 对读类操作返回真；未知线上标识
///   解码为 [`OperationType::Invalid`]，其语义按非幂等处理。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationType {
    Connection,
    Create,
    Patch,
    Read,
    ReadFeed,
    Delete,
    Replace,
    ExecuteJavaScript,
    Query,
    Head,
    HeadFeed,
    Upsert,
    Batch,
    Invalid,
}

impl OperationType {
    pub const fn id(self) -> u16 {
        match self {
            OperationType::Connection => 0x0000,
            OperationType::Create => 0x0001,
            OperationType::Patch => 0x0002,
            OperationType::Read => 0x0003,
            OperationType::ReadFeed => 0x0004,
            OperationType::Delete => 0x0005,
            OperationType::Replace => 0x0006,
            OperationType::ExecuteJavaScript => 0x0008,
            OperationType::Query => 0x000F,
            OperationType::Head => 0x0012,
            OperationType::HeadFeed => 0x0013,
            OperationType::Upsert => 0x0014,
            OperationType::Batch => 0x0025,
            OperationType::Invalid => 0xFFFF,
        }
    }

    pub const fn from_id(id: u16) -> Self {
        match id {
            0x0000 => OperationType::Connection,
            0x0001 => OperationType::Create,
            0x0002 => OperationType::Patch,
            0x0003 => OperationType::Read,
            0x0004 => OperationType::ReadFeed,
            0x0005 => OperationType::Delete,
            0x0006 => OperationType::Replace,
            0x0008 => OperationType::ExecuteJavaScript,
            0x000F => OperationType::Query,
            0x0012 => OperationType::Head,
            0x0013 => OperationType::HeadFeed,
            0x0014 => OperationType::Upsert,
            0x0025 => OperationType::Batch,
            _ => OperationType::Invalid,
        }
    }

    /// 是否为只读（幂等）操作。
    pub const fn is_read_only(self) -> bool {
        matches!(
            self,
            OperationType::Read
                | OperationType::ReadFeed
                | OperationType::Query
                | OperationType::Head
                | OperationType::HeadFeed
        )
    }
}

/// 请求作用的资源类型。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Connection,
    Database,
    Collection,
    Document,
    StoredProcedure,
    PartitionKeyRange,
    Invalid,
}

impl ResourceType {
    pub const fn id(self) -> u16 {
        match self {
            ResourceType::Connection => 0x0000,
            ResourceType::Database => 0x0001,
            ResourceType::Collection => 0x0002,
            ResourceType::Document => 0x0003,
            ResourceType::StoredProcedure => 0x0007,
            ResourceType::PartitionKeyRange => 0x0016,
            ResourceType::Invalid => 0xFFFF,
        }
    }

    pub const fn from_id(id: u16) -> Self {
        match id {
            0x0000 => ResourceType::Connection,
            0x0001 => ResourceType::Database,
            0x0002 => ResourceType::Collection,
            0x0003 => ResourceType::Document,
            0x0007 => ResourceType::StoredProcedure,
            0x0016 => ResourceType::PartitionKeyRange,
            _ => ResourceType::Invalid,
        }
    }
}

/// 响应状态码的常用取值。
pub mod status {
    pub const OK: u32 = 200;
    pub const CREATED: u32 = 201;
    pub const NO_CONTENT: u32 = 204;
    pub const NOT_MODIFIED: u32 = 304;
    pub const BAD_REQUEST: u32 = 400;
    pub const NOT_FOUND: u32 = 404;
    pub const REQUEST_TIMEOUT: u32 = 408;
    pub const CONFLICT: u32 = 409;
    pub const GONE: u32 = 410;
    pub const PRECONDITION_FAILED: u32 = 412;
    pub const TOO_MANY_REQUESTS: u32 = 429;
    pub const RETRY_WITH: u32 = 449;
    pub const INTERNAL_SERVER_ERROR: u32 = 500;
    pub const SERVICE_UNAVAILABLE: u32 = 503;

    /// 2xx 与 304 视为成功响应。
    pub const fn is_success(status: u32) -> bool {
        (status >= 200 && status < 300) || status == NOT_MODIFIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_family_is_idempotent_and_mutations_are_not() {
        for op in [
            OperationType::Read,
            OperationType::ReadFeed,
            OperationType::Query,
            OperationType::Head,
            OperationType::HeadFeed,
        ] {
            assert!(op.is_read_only(), "{op:?}");
        }
        for op in [
            OperationType::Create,
            OperationType::Upsert,
            OperationType::Replace,
            OperationType::Delete,
            OperationType::Patch,
            OperationType::Batch,
            OperationType::ExecuteJavaScript,
            OperationType::Invalid,
        ] {
            assert!(!op.is_read_only(), "{op:?}");
        }
    }

    #[test]
    fn unknown_ids_map_to_invalid() {
        assert_eq!(OperationType::from_id(0x4242), OperationType::Invalid);
        assert_eq!(ResourceType::from_id(0x4242), ResourceType::Invalid);
        assert_eq!(
            OperationType::from_id(OperationType::Upsert.id()),
            OperationType::Upsert
        );
    }

    #[test]
    fn not_modified_counts_as_success() {
        assert!(status::is_success(status::NOT_MODIFIED));
        assert!(status::is_success(status::CREATED));
        assert!(!status::is_success(status::GONE));
    }
}

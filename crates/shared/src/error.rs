//! 统一错误处理模块
//!
//! 定义基础设施层共享的错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum OrderError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== Kafka 错误 ====================
    #[error("Kafka 错误: {0}")]
    Kafka(String),

    // ==================== 配置与序列化 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    #[error("序列化失败: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==================== 外部服务错误 ====================
    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, OrderError>;

impl OrderError {
    /// 是否为可重试错误
    ///
    /// 只有基础设施层的瞬时故障才值得本地重试，序列化错误重试也不会成功。
    /// 数据库拒绝数据本身（数据异常、约束冲突）时同样不重试。
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db_err)) => !db_err
                .code()
                .is_some_and(|code| is_data_rejection(&code)),
            Self::Database(_) | Self::Kafka(_) | Self::ExternalServiceTimeout { .. } => true,
            _ => false,
        }
    }
}

/// SQLSTATE 22 类（数据异常，如超长、数值越界）与 23 类（完整性约束冲突）
fn is_data_rejection(sqlstate: &str) -> bool {
    sqlstate.starts_with("22") || sqlstate.starts_with("23")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable() {
        let db_err = OrderError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let kafka_err = OrderError::Kafka("broker 不可达".to_string());
        assert!(kafka_err.is_retryable());

        let timeout = OrderError::ExternalServiceTimeout {
            service: "payment".to_string(),
        };
        assert!(timeout.is_retryable());

        assert!(!OrderError::Internal("磁盘已满".to_string()).is_retryable());

        let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!OrderError::Serialization(serde_err).is_retryable());
    }

    #[test]
    fn test_data_rejection_sqlstates() {
        // 22001 string_data_right_truncation, 22003 numeric_value_out_of_range
        assert!(is_data_rejection("22001"));
        assert!(is_data_rejection("22003"));
        // 23505 unique_violation
        assert!(is_data_rejection("23505"));
        // 40001 serialization_failure, 57P01 admin_shutdown 可重试
        assert!(!is_data_rejection("40001"));
        assert!(!is_data_rejection("57P01"));
    }
}

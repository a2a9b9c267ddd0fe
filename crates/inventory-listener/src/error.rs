//! 库存监听服务错误类型

use event_pipeline::HandlerError;

/// 库存领域错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    /// 单元可能由尚未处理的上游事件创建，稍后重试可能成功
    #[error("库存单元不存在: {0}")]
    UnitNotFound(String),

    #[error("无效的库存单元编号: {0:?}")]
    InvalidUnitNumber(String),

    #[error("无效的商品数据: sku={sku} - {message}")]
    InvalidProduct { sku: String, message: String },

    #[error("库存存储不可用: {0}")]
    StoreUnavailable(String),
}

/// 载荷或领域数据本身有问题的错误重试无意义，归为永久失败
impl From<InventoryError> for HandlerError {
    fn from(err: InventoryError) -> Self {
        match err {
            InventoryError::UnitNotFound(_) | InventoryError::StoreUnavailable(_) => {
                HandlerError::transient(err)
            }
            InventoryError::InvalidUnitNumber(_) | InventoryError::InvalidProduct { .. } => {
                HandlerError::permanent(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            InventoryError::UnitNotFound("W1".to_string()).to_string(),
            "库存单元不存在: W1"
        );
        assert_eq!(
            InventoryError::InvalidUnitNumber(" ".to_string()).to_string(),
            "无效的库存单元编号: \" \""
        );
        assert_eq!(
            InventoryError::InvalidProduct {
                sku: "SKU-1".to_string(),
                message: "数量不能为负数".to_string(),
            }
            .to_string(),
            "无效的商品数据: sku=SKU-1 - 数量不能为负数"
        );
    }

    #[test]
    fn test_handler_error_classification() {
        let err: HandlerError = InventoryError::UnitNotFound("W1".to_string()).into();
        assert!(err.is_retryable());

        let err: HandlerError = InventoryError::StoreUnavailable("连接池耗尽".to_string()).into();
        assert!(err.is_retryable());

        let err: HandlerError = InventoryError::InvalidUnitNumber(String::new()).into();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "无效的库存单元编号: \"\"");
    }
}

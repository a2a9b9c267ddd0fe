//! 库存用例

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use event_pipeline::{HandlerError, UseCase};
use tracing::{debug, info};

use crate::error::InventoryError;
use crate::store::{InventoryRepository, Product, Unit, UnitStatus};

// ---------------------------------------------------------------------------
// MarkUnitUnsuitable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkUnitUnsuitableCommand {
    pub unit_number: String,
    pub reason: Option<String>,
}

/// 将库存单元标记为不可用
///
/// 幂等：单元已是不可用状态时直接返回，重复投递不会覆盖原因与时间。
pub struct MarkUnitUnsuitable {
    repository: Arc<dyn InventoryRepository>,
}

impl MarkUnitUnsuitable {
    pub fn new(repository: Arc<dyn InventoryRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl UseCase<MarkUnitUnsuitableCommand> for MarkUnitUnsuitable {
    type Output = Unit;

    async fn execute(&self, input: MarkUnitUnsuitableCommand) -> Result<Unit, HandlerError> {
        let mut unit = self
            .repository
            .find_unit(&input.unit_number)
            .await?
            .ok_or_else(|| InventoryError::UnitNotFound(input.unit_number.clone()))?;

        if unit.status == UnitStatus::Unsuitable {
            debug!(unit_number = %unit.unit_number, "单元已是不可用状态，跳过");
            return Ok(unit);
        }

        unit.status = UnitStatus::Unsuitable;
        unit.reason = input.reason;
        unit.updated_at = Utc::now();
        self.repository.save_unit(unit.clone()).await?;

        info!(
            unit_number = %unit.unit_number,
            reason = ?unit.reason,
            "库存单元已标记为不可用"
        );
        Ok(unit)
    }
}

// ---------------------------------------------------------------------------
// ImportProducts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductImport {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
}

/// 批量导入商品
pub struct ImportProducts {
    repository: Arc<dyn InventoryRepository>,
}

impl ImportProducts {
    pub fn new(repository: Arc<dyn InventoryRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl UseCase<Vec<ProductImport>> for ImportProducts {
    type Output = usize;

    async fn execute(&self, input: Vec<ProductImport>) -> Result<usize, HandlerError> {
        if input.is_empty() {
            return Ok(0);
        }

        let imported_at = Utc::now();
        let products = input
            .into_iter()
            .map(|item| Product {
                sku: item.sku,
                name: item.name,
                quantity: item.quantity,
                imported_at,
            })
            .collect();

        let written = self.repository.upsert_products(products).await?;
        info!(count = written, "商品导入完成");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryInventory, MockInventoryRepository};

    fn command(unit_number: &str) -> MarkUnitUnsuitableCommand {
        MarkUnitUnsuitableCommand {
            unit_number: unit_number.to_string(),
            reason: Some("外包装破损".to_string()),
        }
    }

    #[tokio::test]
    async fn test_mark_unit_unsuitable() {
        let inventory = Arc::new(InMemoryInventory::new());
        inventory.register_unit("W1");
        let use_case = MarkUnitUnsuitable::new(inventory.clone());

        let unit = tokio_test::assert_ok!(use_case.execute(command("W1")).await);

        assert_eq!(unit.status, UnitStatus::Unsuitable);
        assert_eq!(inventory.unit("W1").unwrap().reason.as_deref(), Some("外包装破损"));
    }

    #[tokio::test]
    async fn test_mark_unit_unsuitable_is_idempotent() {
        let mut repository = MockInventoryRepository::new();
        repository.expect_find_unit().returning(|number| {
            Ok(Some(Unit {
                status: UnitStatus::Unsuitable,
                ..Unit::available(number)
            }))
        });
        repository.expect_save_unit().never();

        let use_case = MarkUnitUnsuitable::new(Arc::new(repository));
        let unit = use_case.execute(command("W1")).await.unwrap();

        assert_eq!(unit.status, UnitStatus::Unsuitable);
    }

    #[tokio::test]
    async fn test_unknown_unit_is_transient() {
        let use_case = MarkUnitUnsuitable::new(Arc::new(InMemoryInventory::new()));

        let err = tokio_test::assert_err!(use_case.execute(command("W404")).await);

        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "库存单元不存在: W404");
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let mut repository = MockInventoryRepository::new();
        repository
            .expect_find_unit()
            .returning(|_| Err(InventoryError::StoreUnavailable("连接超时".to_string())));

        let use_case = MarkUnitUnsuitable::new(Arc::new(repository));
        let err = use_case.execute(command("W1")).await.unwrap_err();

        assert_eq!(err, HandlerError::Transient("库存存储不可用: 连接超时".to_string()));
    }

    #[tokio::test]
    async fn test_import_products() {
        let inventory = Arc::new(InMemoryInventory::new());
        let use_case = ImportProducts::new(inventory.clone());

        let written = use_case
            .execute(vec![
                ProductImport {
                    sku: "SKU-1".to_string(),
                    name: "托盘".to_string(),
                    quantity: 3,
                },
                ProductImport {
                    sku: "SKU-2".to_string(),
                    name: "纸箱".to_string(),
                    quantity: 10,
                },
            ])
            .await
            .unwrap();

        assert_eq!(written, 2);
        assert_eq!(inventory.product("SKU-2").unwrap().quantity, 10);
    }

    #[tokio::test]
    async fn test_import_empty_batch_skips_store() {
        let mut repository = MockInventoryRepository::new();
        repository.expect_upsert_products().never();

        let use_case = ImportProducts::new(Arc::new(repository));
        assert_eq!(use_case.execute(Vec::new()).await.unwrap(), 0);
    }
}

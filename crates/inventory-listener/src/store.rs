//! 库存存储
//!
//! 用例只依赖 [`InventoryRepository`]；服务内置的 [`InMemoryInventory`]
//! 基于 DashMap，多个 worker 并发读写时按 key 分段加锁。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::InventoryError;

/// 库存单元状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Available,
    Unsuitable,
}

/// 库存单元
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unit {
    pub unit_number: String,
    pub status: UnitStatus,
    /// 标记为不可用的原因
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    pub fn available(unit_number: impl Into<String>) -> Self {
        Self {
            unit_number: unit_number.into(),
            status: UnitStatus::Available,
            reason: None,
            updated_at: Utc::now(),
        }
    }
}

/// 商品
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub sku: String,
    pub name: String,
    pub quantity: u32,
    pub imported_at: DateTime<Utc>,
}

/// 库存仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InventoryRepository: Send + Sync {
    async fn find_unit(&self, unit_number: &str) -> Result<Option<Unit>, InventoryError>;
    async fn save_unit(&self, unit: Unit) -> Result<(), InventoryError>;
    /// 按 sku 覆盖写入，返回写入条数
    async fn upsert_products(&self, products: Vec<Product>) -> Result<usize, InventoryError>;
}

/// 内存库存
#[derive(Default)]
pub struct InMemoryInventory {
    units: DashMap<String, Unit>,
    products: DashMap<String, Product>,
}

impl InMemoryInventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个可用单元
    pub fn register_unit(&self, unit_number: &str) {
        self.units
            .insert(unit_number.to_string(), Unit::available(unit_number));
    }

    pub fn unit(&self, unit_number: &str) -> Option<Unit> {
        self.units.get(unit_number).map(|u| u.value().clone())
    }

    pub fn product(&self, sku: &str) -> Option<Product> {
        self.products.get(sku).map(|p| p.value().clone())
    }

    pub fn product_count(&self) -> usize {
        self.products.len()
    }
}

#[async_trait]
impl InventoryRepository for InMemoryInventory {
    async fn find_unit(&self, unit_number: &str) -> Result<Option<Unit>, InventoryError> {
        Ok(self.unit(unit_number))
    }

    async fn save_unit(&self, unit: Unit) -> Result<(), InventoryError> {
        self.units.insert(unit.unit_number.clone(), unit);
        Ok(())
    }

    async fn upsert_products(&self, products: Vec<Product>) -> Result<usize, InventoryError> {
        let count = products.len();
        for product in products {
            self.products.insert(product.sku.clone(), product);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product(sku: &str, quantity: u32) -> Product {
        Product {
            sku: sku.to_string(),
            name: format!("商品 {sku}"),
            quantity,
            imported_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_register_and_find_unit() {
        let inventory = InMemoryInventory::new();
        inventory.register_unit("W1");

        let unit = inventory.find_unit("W1").await.unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Available);
        assert!(inventory.find_unit("W2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_overwrites_by_sku() {
        let inventory = InMemoryInventory::new();

        let written = inventory
            .upsert_products(vec![product("SKU-1", 5), product("SKU-2", 1)])
            .await
            .unwrap();
        assert_eq!(written, 2);

        inventory.upsert_products(vec![product("SKU-1", 9)]).await.unwrap();
        assert_eq!(inventory.product_count(), 2);
        assert_eq!(inventory.product("SKU-1").unwrap().quantity, 9);
    }
}

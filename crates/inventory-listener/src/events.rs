//! 库存相关事件载荷与用例输入映射

use serde::{Deserialize, Serialize};

use crate::error::InventoryError;
use crate::use_cases::{MarkUnitUnsuitableCommand, ProductImport};

/// Kafka Topic 名称常量
pub mod topics {
    pub const UNIT_UNSUITABLE: &str = "UnitUnsuitable";
    pub const PRODUCTS_IMPORTED: &str = "ProductsImported";
}

/// `UnitUnsuitable` 事件载荷
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitUnsuitablePayload {
    pub unit_number: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// `ProductsImported` 事件载荷中的单个商品，整个载荷为该类型的数组
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedProductPayload {
    pub sku: String,
    pub name: String,
    pub quantity: i64,
}

pub fn to_mark_unsuitable(
    payload: &UnitUnsuitablePayload,
) -> Result<MarkUnitUnsuitableCommand, InventoryError> {
    let unit_number = payload.unit_number.trim();
    if unit_number.is_empty() {
        return Err(InventoryError::InvalidUnitNumber(payload.unit_number.clone()));
    }

    Ok(MarkUnitUnsuitableCommand {
        unit_number: unit_number.to_string(),
        reason: payload
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from),
    })
}

/// 整批校验，任一商品不合法则整批拒绝
pub fn to_product_imports(
    payload: &[ImportedProductPayload],
) -> Result<Vec<ProductImport>, InventoryError> {
    payload
        .iter()
        .map(|item| {
            let invalid = |message: &str| InventoryError::InvalidProduct {
                sku: item.sku.clone(),
                message: message.to_string(),
            };

            if item.sku.trim().is_empty() {
                return Err(invalid("sku 不能为空"));
            }
            let quantity = u32::try_from(item.quantity).map_err(|_| invalid("数量超出范围"))?;

            Ok(ProductImport {
                sku: item.sku.trim().to_string(),
                name: item.name.clone(),
                quantity,
            })
        })
        .collect()
}

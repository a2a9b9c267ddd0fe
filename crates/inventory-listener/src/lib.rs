//! 库存事件监听服务
//!
//! 消费 `UnitUnsuitable` 与 `ProductsImported` 事件并更新库存。

pub mod error;
pub mod events;
pub mod listeners;
pub mod store;
pub mod use_cases;

//! 库存监听器集成测试
//!
//! 以内存消息源驱动真实的监听器装配，验证单对象与数组两种载荷的完整链路。

use std::sync::Arc;
use std::time::Duration;

use event_pipeline::test_utils::{
    InMemorySource, RecordingCommitter, RecordingPublisher, envelope_json, fast_listener_config,
    raw_record,
};
use inventory_listener::events::topics;
use inventory_listener::listeners::{ListenerPorts, products_imported_pump, unit_unsuitable_pump};
use inventory_listener::store::{InMemoryInventory, UnitStatus};
use pipeline_shared::config::AckMode;
use serde_json::json;
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(5);

struct Ports {
    source: Arc<InMemorySource>,
    committer: Arc<RecordingCommitter>,
    publisher: Arc<RecordingPublisher>,
}

impl Ports {
    fn new() -> Self {
        Self {
            source: Arc::new(InMemorySource::new()),
            committer: Arc::new(RecordingCommitter::new()),
            publisher: Arc::new(RecordingPublisher::new()),
        }
    }

    fn listener_ports(&self) -> ListenerPorts {
        ListenerPorts {
            source: self.source.clone(),
            committer: self.committer.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

// ============================================================================
// UnitUnsuitable
// ============================================================================

#[tokio::test]
async fn test_unit_unsuitable_updates_inventory() {
    let inventory = Arc::new(InMemoryInventory::new());
    inventory.register_unit("W1");
    let ports = Ports::new();

    let pump = unit_unsuitable_pump(
        fast_listener_config(topics::UNIT_UNSUITABLE, AckMode::Manual),
        ports.listener_ports(),
        inventory.clone(),
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pump.run(rx));

    let raw = envelope_json(
        "UnitUnsuitable",
        json!({ "unitNumber": "W1", "reason": "外包装破损" }),
    );
    ports.source.push(raw_record(topics::UNIT_UNSUITABLE, 0, 0, &raw));

    assert!(ports.committer.wait_for(1, WAIT).await);
    let unit = inventory.unit("W1").unwrap();
    assert_eq!(unit.status, UnitStatus::Unsuitable);
    assert_eq!(unit.reason.as_deref(), Some("外包装破损"));
    assert!(ports.publisher.published().is_empty());

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_unit_is_retried_then_dead_lettered() {
    let inventory = Arc::new(InMemoryInventory::new());
    let ports = Ports::new();

    let pump = unit_unsuitable_pump(
        fast_listener_config(topics::UNIT_UNSUITABLE, AckMode::Manual),
        ports.listener_ports(),
        inventory,
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pump.run(rx));

    let raw = envelope_json("UnitUnsuitable", json!({ "unitNumber": "W404" }));
    let mut record = raw_record(topics::UNIT_UNSUITABLE, 0, 0, &raw);
    record.key = Some("W404".to_string());
    ports.source.push(record);

    assert!(ports.committer.wait_for(1, WAIT).await);
    let published = ports.publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, "UnitUnsuitableDLQ");
    assert_eq!(published[0].key.as_deref(), Some("W404"));

    let dead_letters = ports.publisher.dead_letters();
    assert_eq!(dead_letters[0].message, raw);
    assert_eq!(dead_letters[0].error, "库存单元不存在: W404");

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_blank_unit_number_is_dead_lettered_as_permanent() {
    let inventory = Arc::new(InMemoryInventory::new());
    let ports = Ports::new();

    let pump = unit_unsuitable_pump(
        fast_listener_config(topics::UNIT_UNSUITABLE, AckMode::Manual),
        ports.listener_ports(),
        inventory,
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pump.run(rx));

    let raw = envelope_json("UnitUnsuitable", json!({ "unitNumber": "  " }));
    ports.source.push(raw_record(topics::UNIT_UNSUITABLE, 0, 0, &raw));

    assert!(ports.committer.wait_for(1, WAIT).await);
    let dead_letters = ports.publisher.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert!(dead_letters[0].error.starts_with("载荷映射失败"));

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// ProductsImported
// ============================================================================

#[tokio::test]
async fn test_products_imported_list_payload() {
    let inventory = Arc::new(InMemoryInventory::new());
    let ports = Ports::new();

    let pump = products_imported_pump(
        fast_listener_config(topics::PRODUCTS_IMPORTED, AckMode::Manual),
        ports.listener_ports(),
        inventory.clone(),
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pump.run(rx));

    let raw = envelope_json(
        "ProductsImported",
        json!([
            { "sku": "SKU-1", "name": "托盘", "quantity": 3 },
            { "sku": "SKU-2", "name": "纸箱", "quantity": 10 }
        ]),
    );
    ports.source.push(raw_record(topics::PRODUCTS_IMPORTED, 0, 0, &raw));

    assert!(ports.committer.wait_for(1, WAIT).await);
    assert_eq!(inventory.product_count(), 2);
    assert_eq!(inventory.product("SKU-1").unwrap().quantity, 3);
    assert!(ports.publisher.published().is_empty());

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_products_imported_rejects_non_array_payload() {
    let inventory = Arc::new(InMemoryInventory::new());
    let ports = Ports::new();

    let pump = products_imported_pump(
        fast_listener_config(topics::PRODUCTS_IMPORTED, AckMode::Manual),
        ports.listener_ports(),
        inventory.clone(),
    )
    .unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(pump.run(rx));

    let raw = envelope_json("ProductsImported", json!({ "sku": "SKU-1" }));
    ports.source.push(raw_record(topics::PRODUCTS_IMPORTED, 0, 0, &raw));

    assert!(ports.committer.wait_for(1, WAIT).await);
    let dead_letters = ports.publisher.dead_letters();
    assert_eq!(dead_letters.len(), 1);
    assert!(dead_letters[0].error.starts_with("事件载荷与目标类型不兼容"));
    assert_eq!(inventory.product_count(), 0);

    shutdown.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

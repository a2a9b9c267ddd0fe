//! 监听器装配
//!
//! 每个监听器只需声明载荷解码器、输入映射函数与用例，
//! 解码、重试、死信与确认全部由通用管道完成。

use std::sync::Arc;

use event_pipeline::{
    ConsumerPump, EnvelopeCodec, PayloadDecoder, RecordCommitter, RecordPublisher, RecordSource,
    UseCaseInvoker,
};
use pipeline_shared::config::ListenerConfig;
use pipeline_shared::error::PipelineError;

use crate::events::{
    ImportedProductPayload, UnitUnsuitablePayload, to_mark_unsuitable, to_product_imports,
};
use crate::store::{InventoryRepository, Unit};
use crate::use_cases::{ImportProducts, MarkUnitUnsuitable};

/// 配置文件中 `[listeners.<name>]` 的名称
pub const UNIT_UNSUITABLE_LISTENER: &str = "unit_unsuitable";
pub const PRODUCTS_IMPORTED_LISTENER: &str = "products_imported";

/// 监听器依赖的 broker 端口
pub struct ListenerPorts {
    pub source: Arc<dyn RecordSource>,
    pub committer: Arc<dyn RecordCommitter>,
    pub publisher: Arc<dyn RecordPublisher>,
}

/// `UnitUnsuitable` 监听器：单个对象载荷
pub fn unit_unsuitable_pump(
    config: ListenerConfig,
    ports: ListenerPorts,
    repository: Arc<dyn InventoryRepository>,
) -> Result<ConsumerPump<UnitUnsuitablePayload, Unit>, PipelineError> {
    let invoker = UseCaseInvoker::new(
        to_mark_unsuitable,
        Arc::new(MarkUnitUnsuitable::new(repository)),
    );

    ConsumerPump::new(
        UNIT_UNSUITABLE_LISTENER,
        config,
        ports.source,
        ports.committer,
        ports.publisher,
        EnvelopeCodec::new(PayloadDecoder::json()),
        invoker,
    )
}

/// `ProductsImported` 监听器：商品数组载荷
pub fn products_imported_pump(
    config: ListenerConfig,
    ports: ListenerPorts,
    repository: Arc<dyn InventoryRepository>,
) -> Result<ConsumerPump<Vec<ImportedProductPayload>, usize>, PipelineError> {
    let invoker = UseCaseInvoker::new(
        |items: &Vec<ImportedProductPayload>| to_product_imports(items),
        Arc::new(ImportProducts::new(repository)),
    );

    ConsumerPump::new(
        PRODUCTS_IMPORTED_LISTENER,
        config,
        ports.source,
        ports.committer,
        ports.publisher,
        EnvelopeCodec::new(PayloadDecoder::<ImportedProductPayload>::json().list()),
        invoker,
    )
}

//! 业务用例调用适配
//!
//! 把解码后的载荷映射为用例输入并执行用例。映射失败说明载荷本身有问题，
//! 重试不会改变结果，因此一律归为永久失败。用例内部的 panic 与返回的错误
//! 同等对待，默认可重试。

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::HandlerError;

/// 业务用例
///
/// 返回 [`HandlerError::Transient`] 的失败会被重试，
/// [`HandlerError::Permanent`] 直接进入死信。
#[async_trait]
pub trait UseCase<I: Send + 'static>: Send + Sync {
    type Output: Send;

    async fn execute(&self, input: I) -> Result<Self::Output, HandlerError>;
}

type InvokeFn<T, O> = dyn Fn(&T) -> BoxFuture<'static, Result<O, HandlerError>> + Send + Sync;

/// 用例调用器，由每个监听器在构造时提供映射函数和用例
pub struct UseCaseInvoker<T, O> {
    call: Arc<InvokeFn<T, O>>,
}

impl<T, O> Clone for UseCaseInvoker<T, O> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
        }
    }
}

impl<T, O> UseCaseInvoker<T, O>
where
    T: Send + Sync + 'static,
    O: Send + 'static,
{
    /// 由"载荷 -> 用例输入"映射函数与用例组合
    pub fn new<I, U, M, E>(mapper: M, use_case: Arc<U>) -> Self
    where
        I: Send + 'static,
        U: UseCase<I, Output = O> + 'static,
        M: Fn(&T) -> Result<I, E> + Send + Sync + 'static,
        E: Display,
    {
        let call = move |payload: &T| -> BoxFuture<'static, Result<O, HandlerError>> {
            match mapper(payload) {
                Ok(input) => {
                    let use_case = use_case.clone();
                    async move { use_case.execute(input).await }.boxed()
                }
                Err(e) => {
                    let err = HandlerError::permanent(format!("载荷映射失败: {e}"));
                    futures::future::ready(Err(err)).boxed()
                }
            }
        };

        Self {
            call: Arc::new(call),
        }
    }

    /// 直接以异步函数作为用例
    pub fn from_fn<F, Fut>(handler: F) -> Self
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    {
        Self {
            call: Arc::new(move |payload: &T| handler(payload.clone()).boxed()),
        }
    }

    /// 调用一次用例
    ///
    /// 用例内部的 panic 被捕获并转换为瞬时失败，不会拖垮工作线程。
    pub async fn invoke(&self, payload: &T) -> Result<O, HandlerError> {
        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.call)(payload))) {
            Ok(future) => future,
            Err(panic) => return Err(panicked(panic)),
        };

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(panicked(panic)),
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知原因".to_string());
    HandlerError::transient(format!("业务处理发生 panic: {message}"))
}

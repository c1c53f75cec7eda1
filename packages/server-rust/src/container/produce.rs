//! Constructor results.
//!
//! A constructor returns a [`Produce`] describing the values it yields and
//! what should happen to them besides being cached: cleanup closures become
//! closer modules, and values marked with [`Produce::as_module`] join the
//! module registry.

use std::any::{type_name, Any, TypeId};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::module::{Capability, CloserProvider, Module};

pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Static description of the values a constructor yields.
pub trait Outputs: Send + 'static {
    /// Type ids and names, in tuple order.
    fn types() -> Vec<(TypeId, &'static str)>;

    /// Type-erased values, in tuple order.
    fn into_values(self) -> Vec<Value>;
}

/// Extends an output tuple by one element.
pub trait Append<U> {
    type Output;

    fn append(self, extra: U) -> Self::Output;
}

macro_rules! impl_outputs {
    ($($t:ident . $idx:tt),+) => {
        impl<$($t: Send + Sync + 'static),+> Outputs for ($($t,)+) {
            fn types() -> Vec<(TypeId, &'static str)> {
                vec![$((TypeId::of::<$t>(), type_name::<$t>())),+]
            }

            fn into_values(self) -> Vec<Value> {
                vec![$(Arc::new(self.$idx) as Value),+]
            }
        }
    };
}

impl_outputs!(A.0);
impl_outputs!(A.0, B.1);
impl_outputs!(A.0, B.1, C.2);
impl_outputs!(A.0, B.1, C.2, D.3);
impl_outputs!(A.0, B.1, C.2, D.3, E.4);

impl<A, U> Append<U> for (A,) {
    type Output = (A, U);

    fn append(self, extra: U) -> Self::Output {
        (self.0, extra)
    }
}

impl<A, B, U> Append<U> for (A, B) {
    type Output = (A, B, U);

    fn append(self, extra: U) -> Self::Output {
        (self.0, self.1, extra)
    }
}

impl<A, B, C, U> Append<U> for (A, B, C) {
    type Output = (A, B, C, U);

    fn append(self, extra: U) -> Self::Output {
        (self.0, self.1, self.2, extra)
    }
}

impl<A, B, C, D, U> Append<U> for (A, B, C, D) {
    type Output = (A, B, C, D, U);

    fn append(self, extra: U) -> Self::Output {
        (self.0, self.1, self.2, self.3, extra)
    }
}

/// Values that can be viewed as a module.
pub trait AsModule {
    fn as_module(&self) -> Arc<dyn Module>;
}

impl<M: Module> AsModule for Arc<M> {
    fn as_module(&self) -> Arc<dyn Module> {
        Arc::clone(self) as Arc<dyn Module>
    }
}

impl AsModule for Arc<dyn Module> {
    fn as_module(&self) -> Arc<dyn Module> {
        Arc::clone(self)
    }
}

/// Builder returned by constructors.
///
/// ```ignore
/// Produce::new(pool.clone())
///     .with_cleanup(move || async move { pool.close().await; Ok(()) })
///     .also(PoolStats::default())
/// ```
pub struct Produce<O: Outputs> {
    pub(crate) outputs: O,
    pub(crate) modules: Vec<Arc<dyn Module>>,
}

impl<T: Send + Sync + 'static> Produce<(T,)> {
    /// Yields a single value.
    pub fn new(value: T) -> Self {
        Self {
            outputs: (value,),
            modules: Vec::new(),
        }
    }
}

impl<T: AsModule + Send + Sync + 'static> Produce<(T,)> {
    /// Adds the produced value to the module registry.
    #[must_use]
    pub fn as_module(mut self) -> Self {
        let module = self.outputs.0.as_module();
        self.modules.push(module);
        self
    }
}

impl<O: Outputs> Produce<O> {
    /// Yields several values at once (the out-struct form).
    pub fn many(outputs: O) -> Self {
        Self {
            outputs,
            modules: Vec::new(),
        }
    }

    /// Adds one more produced value.
    pub fn also<U>(self, extra: U) -> Produce<<O as Append<U>>::Output>
    where
        O: Append<U>,
        <O as Append<U>>::Output: Outputs,
    {
        Produce {
            outputs: self.outputs.append(extra),
            modules: self.modules,
        }
    }

    /// Registers a cleanup that runs when the application shuts down.
    #[must_use]
    pub fn with_cleanup<F, Fut>(mut self, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let label = type_name::<O>();
        self.modules.push(Arc::new(CleanupModule::new(label, cleanup)));
        self
    }

    /// Registers an arbitrary extra module alongside the produced values.
    #[must_use]
    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }
}

// ---------------------------------------------------------------------------
// CleanupModule
// ---------------------------------------------------------------------------

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Closer module wrapping a one-shot cleanup closure.
pub struct CleanupModule {
    name: String,
    cleanup: Mutex<Option<Cleanup>>,
}

impl CleanupModule {
    pub fn new<F, Fut>(owner: &str, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: format!("cleanup({owner})"),
            cleanup: Mutex::new(Some(Box::new(move || cleanup().boxed()))),
        }
    }
}

impl Module for CleanupModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(self: Arc<Self>) -> Vec<Capability> {
        vec![Capability::Closer(self)]
    }
}

#[async_trait]
impl CloserProvider for CleanupModule {
    async fn close(&self) -> anyhow::Result<()> {
        let cleanup = self.cleanup.lock().take();
        match cleanup {
            Some(f) => f().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outputs_list_types_in_order() {
        let types = <(u8, String)>::types();
        assert_eq!(types[0].0, TypeId::of::<u8>());
        assert_eq!(types[1].0, TypeId::of::<String>());
    }

    #[test]
    fn also_appends_values() {
        let produce = Produce::new(1u8).also("x".to_string()).also(2u64);
        let values = produce.outputs.into_values();
        assert_eq!(values.len(), 3);
        assert_eq!(values[2].downcast_ref::<u64>(), Some(&2));
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let produce = Produce::new(0u8).with_cleanup(|| async { Ok(()) });
        assert_eq!(produce.modules.len(), 1);
        let module = Arc::clone(&produce.modules[0]);
        assert!(module.name().starts_with("cleanup("));
        let caps = module.capabilities();
        let Capability::Closer(closer) = &caps[0] else {
            panic!("cleanup module must be a closer");
        };
        closer.close().await.unwrap();
        closer.close().await.unwrap();
    }
}

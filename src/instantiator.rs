//! Instantiation of dummy and signature values.
//!
//! The capture protocol needs placeholder values of a given type: dummies
//! returned from recorded calls, and random "signature" values that let the
//! recorder tell matcher placeholders apart from literal arguments.

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Produces instances of types the engine cannot build on its own.
pub trait InstanceFactory: Send + Sync {
    /// Return an instance of `ty`, or `None` to let other factories try.
    fn instantiate(&self, ty: &ValueType) -> Option<Value>;
}

impl<F> InstanceFactory for F
where
    F: Fn(&ValueType) -> Option<Value> + Send + Sync,
{
    fn instantiate(&self, ty: &ValueType) -> Option<Value> {
        self(ty)
    }
}

/// Factory answering only for one type.
pub fn type_factory<F>(filter: ValueType, factory: F) -> impl InstanceFactory
where
    F: Fn() -> Value + Send + Sync,
{
    move |ty: &ValueType| (*ty == filter).then(&factory)
}

/// Identifier of a registered instance factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactoryId(pub u64);

/// Value synthesis used by the recorder and by relaxed mocks.
pub trait Instantiator: Send + Sync {
    /// Build an instance of `ty` if possible.
    fn instantiate(&self, ty: &ValueType) -> Option<Value>;

    /// An arbitrary value of `ty`, falling back to `or_instantiate`.
    fn any_value(&self, ty: &ValueType, or_instantiate: &dyn Fn() -> Value) -> Value {
        self.instantiate(ty).unwrap_or_else(or_instantiate)
    }

    /// A random value of `ty`, distinct from literals with high probability.
    fn signature_value(&self, ty: &ValueType) -> Value;

    /// Whether values of `ty` compare by value rather than identity.
    fn is_passed_by_value(&self, ty: &ValueType) -> bool;

    /// Structural equality.
    fn deep_equals(&self, a: &Value, b: &Value) -> bool;

    /// Register a factory consulted before the built-in defaults.
    fn register_factory(&self, factory: Arc<dyn InstanceFactory>) -> FactoryId;

    /// Remove a previously registered factory.
    fn unregister_factory(&self, id: FactoryId) -> Result<()>;
}

/// Instantiator backed by registered factories and built-in defaults.
#[derive(Default)]
pub struct DefaultInstantiator {
    factories: Mutex<Vec<(FactoryId, Arc<dyn InstanceFactory>)>>,
    next_id: AtomicU64,
}

impl DefaultInstantiator {
    /// Create an instantiator without registered factories.
    pub fn new() -> Self {
        Self::default()
    }

    fn default_value(ty: &ValueType) -> Option<Value> {
        match ty {
            ValueType::Unit => Some(Value::Null),
            ValueType::Bool => Some(Value::Bool(false)),
            ValueType::Int => Some(Value::Int(0)),
            ValueType::Float => Some(Value::Float(0.0)),
            ValueType::Str => Some(Value::Str(String::new())),
            ValueType::List => Some(Value::List(Vec::new())),
            ValueType::Mock(_) | ValueType::Any => None,
        }
    }
}

impl Instantiator for DefaultInstantiator {
    fn instantiate(&self, ty: &ValueType) -> Option<Value> {
        let factories = self.factories.lock().clone();
        factories
            .iter()
            .rev()
            .find_map(|(_, factory)| factory.instantiate(ty))
            .or_else(|| Self::default_value(ty))
    }

    fn signature_value(&self, ty: &ValueType) -> Value {
        let mut rng = rand::thread_rng();
        match ty {
            ValueType::Unit => Value::Null,
            ValueType::Bool => Value::Bool(rng.gen()),
            ValueType::Int | ValueType::Any => Value::Int(rng.gen()),
            ValueType::Float => Value::Float(rng.gen::<f64>() * 1e12),
            ValueType::Str => Value::Str(format!("sig-{:016x}", rng.gen::<u64>())),
            ValueType::List => Value::List(vec![Value::Str(format!("sig-{:016x}", rng.gen::<u64>()))]),
            // Mock signatures are fresh mocks, created by the session
            ValueType::Mock(_) => Value::Int(rng.gen()),
        }
    }

    fn is_passed_by_value(&self, ty: &ValueType) -> bool {
        !ty.is_mock()
    }

    fn deep_equals(&self, a: &Value, b: &Value) -> bool {
        a == b
    }

    fn register_factory(&self, factory: Arc<dyn InstanceFactory>) -> FactoryId {
        let id = FactoryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.factories.lock().push((id, factory));
        debug!(factory = id.0, "Instance factory registered");
        id
    }

    fn unregister_factory(&self, id: FactoryId) -> Result<()> {
        let mut factories = self.factories.lock();
        let before = factories.len();
        factories.retain(|(fid, _)| *fid != id);
        if factories.len() == before {
            return Err(Error::FactoryNotRegistered(id.0));
        }
        debug!(factory = id.0, "Instance factory unregistered");
        Ok(())
    }
}

/// Scoped registration of an instance factory.
///
/// The factory is unregistered when the guard is dropped; failures during
/// that release are logged and never propagated.
pub struct FactoryRegistration {
    id: FactoryId,
    instantiator: Arc<dyn Instantiator>,
    released: bool,
}

impl FactoryRegistration {
    pub(crate) fn new(instantiator: Arc<dyn Instantiator>, factory: Arc<dyn InstanceFactory>) -> Self {
        let id = instantiator.register_factory(factory);
        Self {
            id,
            instantiator,
            released: false,
        }
    }

    /// Identifier of the registered factory.
    pub fn id(&self) -> FactoryId {
        self.id
    }

    /// Unregister now, reporting failures to the caller.
    pub fn unregister(mut self) -> Result<()> {
        self.released = true;
        self.instantiator.unregister_factory(self.id)
    }
}

impl Drop for FactoryRegistration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.instantiator.unregister_factory(self.id) {
            warn!(factory = self.id.0, error = %e, "Failed to unregister instance factory");
        }
    }
}

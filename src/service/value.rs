//! # Value injection between services.
//!
//! A provider publishes values through a [`Consumer`] while it is UP; dependents
//! read them through a [`Supplier`]. Values are cleared when the provider stops.
//!
//! ```text
//! builder.provides::<Pool>([db])  ──► Consumer<Pool> ──accept()──► slot(db)
//! builder.requires::<Pool>(db)    ──► Supplier<Pool> ──get()─────► slot(db)
//! ```
//!
//! [`Value`] is a small tagged union for configuration-style values that may be
//! fixed, lazily computed once, looked up from a provider, or combined.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;

use crate::core::ServiceRegistry;

use super::name::ServiceName;

type AnyValue = Arc<dyn Any + Send + Sync>;

/// Storage cell for one provided name.
#[derive(Default)]
pub(crate) struct ValueSlot {
    value: RwLock<Option<AnyValue>>,
}

impl ValueSlot {
    pub(crate) fn get(&self) -> Option<AnyValue> {
        self.value.read().clone()
    }

    pub(crate) fn set(&self, value: AnyValue) {
        *self.value.write() = Some(value);
    }

    pub(crate) fn clear(&self) {
        *self.value.write() = None;
    }
}

/// Read side: the value provided under a dependency name.
pub struct Supplier<V> {
    name: ServiceName,
    registry: Weak<ServiceRegistry>,
    _marker: PhantomData<fn() -> V>,
}

impl<V: Clone + Send + Sync + 'static> Supplier<V> {
    pub(crate) fn new(name: ServiceName, registry: Weak<ServiceRegistry>) -> Self {
        Self {
            name,
            registry,
            _marker: PhantomData,
        }
    }

    /// The current value, `None` while no provider is UP or the type differs.
    pub fn get(&self) -> Option<V> {
        let registry = self.registry.upgrade()?;
        let value = registry.provided_value(&self.name)?;
        value.downcast_ref::<V>().cloned()
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }
}

impl<V> Clone for Supplier<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            registry: self.registry.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V> fmt::Debug for Supplier<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supplier").field("name", &self.name).finish()
    }
}

/// Write side: publishes a value under every name given to `provides`.
pub struct Consumer<V> {
    slots: Vec<Arc<ValueSlot>>,
    _marker: PhantomData<fn(V)>,
}

impl<V: Send + Sync + 'static> Consumer<V> {
    pub(crate) fn new(slots: Vec<Arc<ValueSlot>>) -> Self {
        Self {
            slots,
            _marker: PhantomData,
        }
    }

    /// Publishes `value`; call from `Service::start`.
    pub fn accept(&self, value: V) {
        let value: AnyValue = Arc::new(value);
        for slot in &self.slots {
            slot.set(Arc::clone(&value));
        }
    }

    /// Withdraws the value.
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.clear();
        }
    }
}

impl<V> Clone for Consumer<V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
            _marker: PhantomData,
        }
    }
}

/// Lazily computed value, evaluated at most once successfully.
pub struct CachedValue<T> {
    cell: Arc<OnceLock<T>>,
    init: Arc<dyn Fn() -> Option<T> + Send + Sync>,
}

/// Values folded into one.
pub struct CompositeValue<T> {
    parts: Vec<Value<T>>,
    combine: Arc<dyn Fn(Vec<T>) -> T + Send + Sync>,
}

/// # A value that may be fixed, lazy, looked up or combined.
///
/// ```
/// use svcgraph::Value;
///
/// let port = Value::immediate(8080u16);
/// let doubled = Value::composite(vec![port.clone(), port], |ports| ports.iter().sum());
/// assert_eq!(doubled.get(), Some(16160));
/// ```
pub enum Value<T> {
    Immediate(T),
    Cached(CachedValue<T>),
    Lookup(Supplier<T>),
    Composite(CompositeValue<T>),
}

impl<T: Clone + Send + Sync + 'static> Value<T> {
    pub fn immediate(value: T) -> Self {
        Value::Immediate(value)
    }

    /// Computes on first successful `get`, then returns the cached result.
    pub fn cached<F>(init: F) -> Self
    where
        F: Fn() -> Option<T> + Send + Sync + 'static,
    {
        Value::Cached(CachedValue {
            cell: Arc::new(OnceLock::new()),
            init: Arc::new(init),
        })
    }

    pub fn lookup(supplier: Supplier<T>) -> Self {
        Value::Lookup(supplier)
    }

    /// Resolves every part, then combines them; `None` if any part is missing.
    pub fn composite<F>(parts: Vec<Value<T>>, combine: F) -> Self
    where
        F: Fn(Vec<T>) -> T + Send + Sync + 'static,
    {
        Value::Composite(CompositeValue {
            parts,
            combine: Arc::new(combine),
        })
    }

    pub fn get(&self) -> Option<T> {
        match self {
            Value::Immediate(v) => Some(v.clone()),
            Value::Cached(c) => {
                if let Some(v) = c.cell.get() {
                    return Some(v.clone());
                }
                let computed = (c.init)()?;
                Some(c.cell.get_or_init(|| computed).clone())
            }
            Value::Lookup(s) => s.get(),
            Value::Composite(c) => {
                let resolved = c.parts.iter().map(Value::get).collect::<Option<Vec<T>>>()?;
                Some((c.combine)(resolved))
            }
        }
    }
}

impl<T: Clone> Clone for Value<T> {
    fn clone(&self) -> Self {
        match self {
            Value::Immediate(v) => Value::Immediate(v.clone()),
            Value::Cached(c) => Value::Cached(CachedValue {
                cell: Arc::clone(&c.cell),
                init: Arc::clone(&c.init),
            }),
            Value::Lookup(s) => Value::Lookup(s.clone()),
            Value::Composite(c) => Value::Composite(CompositeValue {
                parts: c.parts.clone(),
                combine: Arc::clone(&c.combine),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cached_value_is_computed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = Value::cached(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(String::from("ready"))
        });
        let copy = value.clone();

        assert_eq!(value.get().as_deref(), Some("ready"));
        assert_eq!(copy.get().as_deref(), Some("ready"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_value_retries_until_available() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let value = Value::cached(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            (n > 0).then_some(n)
        });

        assert_eq!(value.get(), None);
        assert_eq!(value.get(), Some(1));
        assert_eq!(value.get(), Some(1));
    }

    #[test]
    fn composite_needs_every_part() {
        let missing: Value<u32> = Value::cached(|| None);
        let sum = Value::composite(vec![Value::immediate(1), missing], |v| v.iter().sum());
        assert_eq!(sum.get(), None);
    }

    #[test]
    fn consumer_writes_every_alias_slot() {
        let a = Arc::new(ValueSlot::default());
        let b = Arc::new(ValueSlot::default());
        let consumer = Consumer::<u8>::new(vec![Arc::clone(&a), Arc::clone(&b)]);

        consumer.accept(3);
        assert_eq!(a.get().and_then(|v| v.downcast_ref::<u8>().copied()), Some(3));
        assert_eq!(b.get().and_then(|v| v.downcast_ref::<u8>().copied()), Some(3));

        consumer.clear();
        assert!(a.get().is_none());
    }
}

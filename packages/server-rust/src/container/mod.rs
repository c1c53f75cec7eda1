//! Lazy dependency container.
//!
//! Constructors are registered up front and run on first demand. Each
//! constructor receives a [`FromContainer`] argument (usually a tuple of
//! [`Inject`], [`Optional`] and [`Group`] markers) and returns a
//! [`Produce`] that lists the values it yields. Results are cached by type,
//! so every constructor runs at most once.
//!
//! Construction happens under one re-entrant lock: a constructor may resolve
//! its own dependencies recursively, but two threads never build at the same
//! time. Cycles are reported as [`ContainerError::Cycle`] instead of
//! deadlocking.
//!
//! Bootstrap failures are programming errors, so [`Container::invoke`] and
//! [`Container::provide`] panic; the `try_` variants return the error.

pub mod inject;
pub mod produce;

use std::any::{type_name, Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::ReentrantMutex;
use tracing::debug;

use crate::module::{Module, ModuleRegistry};

pub use inject::{FromContainer, Group, Inject, Optional};
pub use produce::{Append, AsModule, CleanupModule, Outputs, Produce};

use produce::Value;

/// Construction errors. Fatal at bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("no constructor provides {type_name}")]
    Missing { type_name: &'static str },
    #[error("{type_name} is already provided")]
    Duplicate { type_name: &'static str },
    #[error("dependency cycle: {path}")]
    Cycle { path: String },
    #[error("constructing {type_name}: {source}")]
    Constructor {
        type_name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

type Ctor = Arc<dyn Fn(&Container) -> Result<Built, ContainerError> + Send + Sync>;
type Decorator = Arc<dyn Fn(Value, &Container) -> Result<Value, ContainerError> + Send + Sync>;

/// Type-erased constructor result.
struct Built {
    values: Vec<Value>,
    modules: Vec<Arc<dyn Module>>,
}

struct ProviderSlot {
    ctor: Ctor,
    outputs: Vec<(TypeId, &'static str)>,
    eager: bool,
}

struct GroupSlot {
    name: &'static str,
    ctors: Vec<Ctor>,
    built: Option<Vec<Value>>,
}

#[derive(Default)]
struct State {
    providers: Vec<ProviderSlot>,
    by_type: HashMap<TypeId, usize>,
    values: HashMap<TypeId, Value>,
    groups: HashMap<TypeId, GroupSlot>,
    decorators: HashMap<TypeId, Vec<Decorator>>,
    resolving: Vec<&'static str>,
}

/// The dependency graph plus the module registry it feeds.
pub struct Container {
    state: ReentrantMutex<RefCell<State>>,
    registry: ModuleRegistry,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    /// Creates an empty container. The module registry itself is supplied,
    /// so constructors can inject it.
    #[must_use]
    pub fn new() -> Self {
        let container = Self {
            state: ReentrantMutex::new(RefCell::new(State::default())),
            registry: ModuleRegistry::new(),
        };
        container.supply(container.registry.clone());
        container
    }

    /// The registry that `as_module` values and cleanups are added to.
    #[must_use]
    pub fn modules(&self) -> ModuleRegistry {
        self.registry.clone()
    }

    /// Registers a module directly.
    pub fn add_module(&self, module: Arc<dyn Module>) {
        self.registry.register(module);
    }

    /// Registers an already-built value.
    ///
    /// # Panics
    ///
    /// Panics if `T` is already provided.
    pub fn supply<T: Send + Sync + 'static>(&self, value: T) -> &Self {
        if let Err(e) = self.try_supply(value) {
            panic!("keel: supply failed: {e}");
        }
        self
    }

    /// Fallible form of [`supply`](Self::supply).
    ///
    /// # Errors
    ///
    /// [`ContainerError::Duplicate`] if `T` is already provided.
    pub fn try_supply<T: Send + Sync + 'static>(&self, value: T) -> Result<(), ContainerError> {
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let id = TypeId::of::<T>();
        if st.by_type.contains_key(&id) || st.values.contains_key(&id) {
            return Err(ContainerError::Duplicate {
                type_name: type_name::<T>(),
            });
        }
        st.values.insert(id, Arc::new(value));
        Ok(())
    }

    /// Registers a lazy constructor.
    ///
    /// # Panics
    ///
    /// Panics if any output type is already provided.
    pub fn provide<D, O, F>(&self, ctor: F) -> &Self
    where
        D: FromContainer,
        O: Outputs,
        F: Fn(D) -> anyhow::Result<Produce<O>> + Send + Sync + 'static,
    {
        if let Err(e) = self.register(ctor, false) {
            panic!("keel: provide failed: {e}");
        }
        self
    }

    /// Fallible form of [`provide`](Self::provide).
    ///
    /// # Errors
    ///
    /// [`ContainerError::Duplicate`] if any output type is already provided.
    pub fn try_provide<D, O, F>(&self, ctor: F) -> Result<(), ContainerError>
    where
        D: FromContainer,
        O: Outputs,
        F: Fn(D) -> anyhow::Result<Produce<O>> + Send + Sync + 'static,
    {
        self.register(ctor, false)
    }

    /// Registers a constructor that [`build_modules`](Self::build_modules)
    /// runs eagerly, so the modules it yields are discovered even if nothing
    /// depends on them.
    ///
    /// # Panics
    ///
    /// Panics if any output type is already provided.
    pub fn provide_module<D, O, F>(&self, ctor: F) -> &Self
    where
        D: FromContainer,
        O: Outputs,
        F: Fn(D) -> anyhow::Result<Produce<O>> + Send + Sync + 'static,
    {
        if let Err(e) = self.register(ctor, true) {
            panic!("keel: provide failed: {e}");
        }
        self
    }

    fn register<D, O, F>(&self, ctor: F, eager: bool) -> Result<(), ContainerError>
    where
        D: FromContainer,
        O: Outputs,
        F: Fn(D) -> anyhow::Result<Produce<O>> + Send + Sync + 'static,
    {
        let outputs = O::types();
        let primary = outputs.first().map_or("()", |(_, n)| *n);
        let erased: Ctor = Arc::new(move |c: &Container| {
            let deps = D::from_container(c)?;
            let produce = ctor(deps).map_err(|source| ContainerError::Constructor {
                type_name: primary,
                source,
            })?;
            Ok(Built {
                values: produce.outputs.into_values(),
                modules: produce.modules,
            })
        });

        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        for (id, name) in &outputs {
            if st.by_type.contains_key(id) || st.values.contains_key(id) {
                return Err(ContainerError::Duplicate { type_name: *name });
            }
        }
        let idx = st.providers.len();
        for (id, _) in &outputs {
            st.by_type.insert(*id, idx);
        }
        st.providers.push(ProviderSlot {
            ctor: erased,
            outputs,
            eager,
        });
        Ok(())
    }

    /// Contributes one value to the group of `T`.
    pub fn provide_into<D, T, F>(&self, ctor: F) -> &Self
    where
        D: FromContainer,
        T: Send + Sync + 'static,
        F: Fn(D) -> anyhow::Result<Produce<(T,)>> + Send + Sync + 'static,
    {
        let erased: Ctor = Arc::new(move |c: &Container| {
            let deps = D::from_container(c)?;
            let produce = ctor(deps).map_err(|source| ContainerError::Constructor {
                type_name: type_name::<T>(),
                source,
            })?;
            Ok(Built {
                values: produce.outputs.into_values(),
                modules: produce.modules,
            })
        });
        let guard = self.state.lock();
        let mut st = guard.borrow_mut();
        let slot = st.groups.entry(TypeId::of::<T>()).or_insert_with(|| GroupSlot {
            name: type_name::<T>(),
            ctors: Vec::new(),
            built: None,
        });
        slot.ctors.push(erased);
        slot.built = None;
        self
    }

    /// Wraps the value of an already-provided type.
    ///
    /// Applied immediately if `T` is already built, otherwise when it is.
    ///
    /// # Panics
    ///
    /// Panics if `T` is not provided or the decorator fails.
    pub fn decorate<D, T, F>(&self, decorator: F) -> &Self
    where
        D: FromContainer,
        T: Clone + Send + Sync + 'static,
        F: Fn(T, D) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        if let Err(e) = self.try_decorate(decorator) {
            panic!("keel: decorate failed: {e}");
        }
        self
    }

    /// Fallible form of [`decorate`](Self::decorate).
    ///
    /// # Errors
    ///
    /// [`ContainerError::Missing`] if `T` is not provided, or the decorator's
    /// error if it runs immediately and fails.
    pub fn try_decorate<D, T, F>(&self, decorator: F) -> Result<(), ContainerError>
    where
        D: FromContainer,
        T: Clone + Send + Sync + 'static,
        F: Fn(T, D) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let erased: Decorator = Arc::new(move |value: Value, c: &Container| {
            let current = value
                .downcast_ref::<T>()
                .cloned()
                .ok_or(ContainerError::Missing {
                    type_name: type_name::<T>(),
                })?;
            let deps = D::from_container(c)?;
            let next = decorator(current, deps).map_err(|source| ContainerError::Constructor {
                type_name: type_name::<T>(),
                source,
            })?;
            Ok(Arc::new(next) as Value)
        });

        let id = TypeId::of::<T>();
        let guard = self.state.lock();
        let existing = {
            let mut st = guard.borrow_mut();
            if !st.by_type.contains_key(&id) && !st.values.contains_key(&id) {
                return Err(ContainerError::Missing {
                    type_name: type_name::<T>(),
                });
            }
            let existing = st.values.get(&id).cloned();
            if existing.is_none() {
                st.decorators.entry(id).or_default().push(Arc::clone(&erased));
            }
            existing
        };
        if let Some(value) = existing {
            let decorated = erased(value, self)?;
            guard.borrow_mut().values.insert(id, decorated);
        }
        Ok(())
    }

    /// Resolves a value by type, constructing it and its dependencies on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError`] if `T` or any dependency cannot be built.
    pub fn resolve<T: Clone + Send + Sync + 'static>(&self) -> Result<T, ContainerError> {
        let value = self.resolve_value(TypeId::of::<T>(), type_name::<T>())?;
        value
            .downcast_ref::<T>()
            .cloned()
            .ok_or(ContainerError::Missing {
                type_name: type_name::<T>(),
            })
    }

    /// Resolves every contribution to the group of `T`. An unknown group is
    /// empty.
    ///
    /// # Errors
    ///
    /// Returns the first contributor's construction error.
    pub fn resolve_group<T: Clone + Send + Sync + 'static>(&self) -> Result<Vec<T>, ContainerError> {
        let id = TypeId::of::<T>();
        let guard = self.state.lock();
        let (name, ctors) = {
            let mut st = guard.borrow_mut();
            let Some(slot) = st.groups.get(&id) else {
                return Ok(Vec::new());
            };
            if let Some(built) = &slot.built {
                return Ok(built
                    .iter()
                    .filter_map(|v| v.downcast_ref::<T>().cloned())
                    .collect());
            }
            let name = slot.name;
            let ctors = slot.ctors.clone();
            if st.resolving.contains(&name) {
                return Err(cycle_error(&st.resolving, name));
            }
            st.resolving.push(name);
            (name, ctors)
        };

        let mut values = Vec::with_capacity(ctors.len());
        let mut modules = Vec::new();
        let mut failure = None;
        for ctor in ctors {
            match ctor(self) {
                Ok(built) => {
                    values.extend(built.values);
                    modules.extend(built.modules);
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        guard.borrow_mut().resolving.pop();
        if let Some(e) = failure {
            return Err(e);
        }

        for module in modules {
            self.registry.register(module);
        }
        let typed = values
            .iter()
            .filter_map(|v| v.downcast_ref::<T>().cloned())
            .collect();
        if let Some(slot) = guard.borrow_mut().groups.get_mut(&id) {
            slot.built = Some(values);
        }
        debug!(group = name, "group resolved");
        Ok(typed)
    }

    fn resolve_value(&self, id: TypeId, name: &'static str) -> Result<Value, ContainerError> {
        let guard = self.state.lock();
        let (ctor, outputs) = {
            let mut st = guard.borrow_mut();
            if let Some(v) = st.values.get(&id) {
                return Ok(Arc::clone(v));
            }
            let Some(&idx) = st.by_type.get(&id) else {
                return Err(ContainerError::Missing { type_name: name });
            };
            let slot = &st.providers[idx];
            let ctor = Arc::clone(&slot.ctor);
            let outputs = slot.outputs.clone();
            let primary = outputs.first().map_or(name, |(_, n)| *n);
            if st.resolving.contains(&primary) {
                return Err(cycle_error(&st.resolving, primary));
            }
            st.resolving.push(primary);
            (ctor, outputs)
        };

        let result = ctor(self);
        guard.borrow_mut().resolving.pop();
        let built = result?;
        debug!(provider = outputs.first().map_or(name, |(_, n)| *n), "constructed");

        // Nothing is cached unless every output survives its decorators.
        let mut decorated = Vec::with_capacity(outputs.len());
        for ((out_id, _), value) in outputs.iter().zip(built.values) {
            let decorators = guard
                .borrow()
                .decorators
                .get(out_id)
                .cloned()
                .unwrap_or_default();
            let mut value = value;
            for decorate in decorators {
                value = decorate(value, self)?;
            }
            decorated.push((*out_id, value));
        }
        guard.borrow_mut().values.extend(decorated);
        for module in built.modules {
            self.registry.register(module);
        }

        let value = guard.borrow().values.get(&id).cloned();
        value.ok_or(ContainerError::Missing { type_name: name })
    }

    /// Runs every constructor registered with
    /// [`provide_module`](Self::provide_module) that has not run yet.
    ///
    /// # Errors
    ///
    /// Returns the first construction error.
    pub fn build_modules(&self) -> Result<(), ContainerError> {
        let guard = self.state.lock();
        let pending: Vec<(TypeId, &'static str)> = {
            let st = guard.borrow();
            st.providers
                .iter()
                .filter(|p| p.eager)
                .filter_map(|p| p.outputs.first().copied())
                .filter(|(id, _)| !st.values.contains_key(id))
                .collect()
        };
        for (id, name) in pending {
            self.resolve_value(id, name)?;
        }
        Ok(())
    }

    /// Resolves `D` and calls `f` with it.
    ///
    /// # Panics
    ///
    /// Panics if `D` cannot be resolved; bootstrap failures are fatal.
    pub fn invoke<D: FromContainer, R>(&self, f: impl FnOnce(D) -> R) -> R {
        match self.try_invoke(f) {
            Ok(r) => r,
            Err(e) => panic!("keel: invoke failed: {e}"),
        }
    }

    /// Fallible form of [`invoke`](Self::invoke).
    ///
    /// # Errors
    ///
    /// Returns the resolution error.
    pub fn try_invoke<D: FromContainer, R>(&self, f: impl FnOnce(D) -> R) -> Result<R, ContainerError> {
        let deps = D::from_container(self)?;
        Ok(f(deps))
    }

    /// Fills a parameter struct from the graph.
    ///
    /// # Panics
    ///
    /// Panics if any field cannot be resolved.
    #[must_use]
    pub fn populate<S: FromContainer>(&self) -> S {
        self.invoke(|s: S| s)
    }

    /// Fallible form of [`populate`](Self::populate).
    ///
    /// # Errors
    ///
    /// Returns the resolution error.
    pub fn try_populate<S: FromContainer>(&self) -> Result<S, ContainerError> {
        S::from_container(self)
    }
}

fn cycle_error(stack: &[&'static str], repeated: &'static str) -> ContainerError {
    let mut path: Vec<&str> = stack.to_vec();
    path.push(repeated);
    ContainerError::Cycle {
        path: path.join(" -> "),
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.state.lock();
        let st = guard.borrow();
        f.debug_struct("Container")
            .field("providers", &st.providers.len())
            .field("built", &st.values.len())
            .field("groups", &st.groups.len())
            .field("modules", &self.registry.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

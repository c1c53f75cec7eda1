//! Constructor parameters.
//!
//! Anything implementing [`FromContainer`] can be a constructor argument.
//! Tuples of markers cover the common case; a hand-written struct that
//! implements the trait plays the role of a parameter object.

use std::any::type_name;
use std::ops::Deref;

use super::{Container, ContainerError};

/// Resolves a value from the container.
pub trait FromContainer: Sized {
    /// # Errors
    ///
    /// Returns [`ContainerError`] when a required dependency is missing,
    /// cyclic, or its constructor fails.
    fn from_container(container: &Container) -> Result<Self, ContainerError>;
}

/// Required dependency.
#[derive(Debug, Clone)]
pub struct Inject<T>(pub T);

impl<T> Inject<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Inject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Clone + Send + Sync + 'static> FromContainer for Inject<T> {
    fn from_container(container: &Container) -> Result<Self, ContainerError> {
        container.resolve::<T>().map(Inject)
    }
}

/// Dependency that may be absent.
///
/// Only a missing `T` yields `None`; failures further down the graph still
/// surface as errors.
#[derive(Debug, Clone)]
pub struct Optional<T>(pub Option<T>);

impl<T> Optional<T> {
    pub fn into_inner(self) -> Option<T> {
        self.0
    }
}

impl<T> Deref for Optional<T> {
    type Target = Option<T>;

    fn deref(&self) -> &Option<T> {
        &self.0
    }
}

impl<T: Clone + Send + Sync + 'static> FromContainer for Optional<T> {
    fn from_container(container: &Container) -> Result<Self, ContainerError> {
        match container.resolve::<T>() {
            Ok(v) => Ok(Optional(Some(v))),
            Err(ContainerError::Missing { type_name: missing }) if missing == type_name::<T>() => {
                Ok(Optional(None))
            }
            Err(e) => Err(e),
        }
    }
}

/// Every value contributed to the group of `T`, in contribution order.
#[derive(Debug, Clone)]
pub struct Group<T>(pub Vec<T>);

impl<T> Group<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for Group<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Clone + Send + Sync + 'static> FromContainer for Group<T> {
    fn from_container(container: &Container) -> Result<Self, ContainerError> {
        container.resolve_group::<T>().map(Group)
    }
}

impl FromContainer for () {
    fn from_container(_: &Container) -> Result<Self, ContainerError> {
        Ok(())
    }
}

macro_rules! impl_from_container_tuple {
    ($($t:ident),+) => {
        impl<$($t: FromContainer),+> FromContainer for ($($t,)+) {
            fn from_container(container: &Container) -> Result<Self, ContainerError> {
                Ok(($($t::from_container(container)?,)+))
            }
        }
    };
}

impl_from_container_tuple!(A);
impl_from_container_tuple!(A, B);
impl_from_container_tuple!(A, B, C);
impl_from_container_tuple!(A, B, C, D);
impl_from_container_tuple!(A, B, C, D, E);
impl_from_container_tuple!(A, B, C, D, E, F);
impl_from_container_tuple!(A, B, C, D, E, F, G);
impl_from_container_tuple!(A, B, C, D, E, F, G, H);

//! Live-tunable values shared between a component and its operators.
//!
//! A [`Tunable`] lets an operator retune a running limiter (window, threshold) without
//! rebuilding it. Reads are lock-free via `ArcSwap` (default `arc-swap` feature); with
//! `tunable-rwlock`, or without `arc-swap`, a `RwLock` is used instead.

use crate::error::ConfigError;
use std::sync::Arc;

#[cfg(any(feature = "tunable-rwlock", not(feature = "arc-swap")))]
use std::sync::{PoisonError, RwLock};

#[cfg(all(feature = "arc-swap", not(feature = "tunable-rwlock")))]
use arc_swap::ArcSwap;

type Validator<T> = Arc<dyn Fn(&T) -> Result<(), ConfigError> + Send + Sync>;

/// Shared, validated, live-updatable value. Clones observe the same value.
pub struct Tunable<T> {
    #[cfg(all(feature = "arc-swap", not(feature = "tunable-rwlock")))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(any(feature = "tunable-rwlock", not(feature = "arc-swap")))]
    inner: Arc<RwLock<Arc<T>>>,
    validator: Option<Validator<T>>,
}

impl<T> Clone for Tunable<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), validator: self.validator.clone() }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Tunable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunable").field("value", &self.snapshot()).finish()
    }
}

impl<T> Tunable<T> {
    /// Wrap an initial value with no validation on updates.
    pub fn new(value: T) -> Self {
        Self { inner: Self::cell(value), validator: None }
    }

    /// Wrap an initial value; every later [`try_set`](Self::try_set) must pass `validator`.
    pub fn validated<F>(value: T, validator: F) -> Result<Self, ConfigError>
    where
        F: Fn(&T) -> Result<(), ConfigError> + Send + Sync + 'static,
    {
        validator(&value)?;
        Ok(Self { inner: Self::cell(value), validator: Some(Arc::new(validator)) })
    }

    /// Validate later updates without re-checking the current value.
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&T) -> Result<(), ConfigError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    #[cfg(all(feature = "arc-swap", not(feature = "tunable-rwlock")))]
    fn cell(value: T) -> Arc<ArcSwap<T>> {
        Arc::new(ArcSwap::from_pointee(value))
    }

    #[cfg(any(feature = "tunable-rwlock", not(feature = "arc-swap")))]
    fn cell(value: T) -> Arc<RwLock<Arc<T>>> {
        Arc::new(RwLock::new(Arc::new(value)))
    }

    /// Snapshot the current value.
    #[cfg(all(feature = "arc-swap", not(feature = "tunable-rwlock")))]
    pub fn snapshot(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value.
    #[cfg(any(feature = "tunable-rwlock", not(feature = "arc-swap")))]
    pub fn snapshot(&self) -> Arc<T> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the value after validation; the previous value is kept on error.
    pub fn try_set(&self, value: T) -> Result<(), ConfigError> {
        if let Some(validate) = &self.validator {
            validate(&value)?;
        }
        #[cfg(all(feature = "arc-swap", not(feature = "tunable-rwlock")))]
        self.inner.store(Arc::new(value));
        #[cfg(any(feature = "tunable-rwlock", not(feature = "arc-swap")))]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
        Ok(())
    }
}

impl<T: Copy> Tunable<T> {
    /// Copy out the current value.
    pub fn get(&self) -> T {
        *self.snapshot()
    }
}

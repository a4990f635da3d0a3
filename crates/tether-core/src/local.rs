//! Run-local variables
//!
//! A [`RunVar`] holds one value per run of a runtime, shared by every task of
//! that run and discarded when the run ends.

use crate::runtime;
use crate::{Error, Result};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

/// Variable scoped to a single run
pub struct RunVar<T> {
    id: u64,
    name: &'static str,
    default: Option<T>,
}

/// Restores a [`RunVar`] to the value it had before a `set`
pub struct RunVarToken<T> {
    var: u64,
    previous: Option<T>,
}

impl<T: Clone + 'static> RunVar<T> {
    /// Variable without a default
    pub fn new(name: &'static str) -> Self {
        Self {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            name,
            default: None,
        }
    }

    /// Variable that reads as `default` until set
    pub fn with_default(name: &'static str, default: T) -> Self {
        Self {
            default: Some(default),
            ..Self::new(name)
        }
    }

    /// Variable name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Current value in this run
    pub fn get(&self) -> Result<T> {
        let value = runtime::with_core(|core| {
            core.locals
                .get(&self.id)
                .and_then(|v| v.downcast_ref::<T>())
                .cloned()
        })?;
        value
            .or_else(|| self.default.clone())
            .ok_or(Error::RunVarUnset(self.name))
    }

    /// Set the value for the rest of this run; the token undoes it
    pub fn set(&self, value: T) -> Result<RunVarToken<T>> {
        let previous = runtime::with_core(|core| {
            core.locals
                .insert(self.id, Box::new(value) as Box<dyn Any>)
                .and_then(|v| v.downcast::<T>().ok())
                .map(|v| *v)
        })?;
        Ok(RunVarToken { var: self.id, previous })
    }

    /// Restore the value from before the `set` that produced `token`
    pub fn reset(&self, token: RunVarToken<T>) -> Result<()> {
        if token.var != self.id {
            return Err(Error::TokenMismatch(self.name));
        }
        let replaced = runtime::with_core(|core| match token.previous {
            Some(previous) => core.locals.insert(self.id, Box::new(previous)),
            None => core.locals.remove(&self.id),
        })?;
        // Values may own runtime resources; drop them unborrowed
        drop(replaced);
        Ok(())
    }
}

impl<T> std::fmt::Debug for RunVar<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunVar({})", self.name)
    }
}

impl<T> std::fmt::Debug for RunVarToken<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunVarToken").field("var", &self.var).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_outside_runtime() {
        let var: RunVar<u32> = RunVar::with_default("answer", 42);
        assert!(matches!(var.get(), Err(Error::NoRuntime)));
        assert!(matches!(var.set(1), Err(Error::NoRuntime)));
        assert_eq!(var.name(), "answer");
    }
}

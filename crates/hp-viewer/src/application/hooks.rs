//! Named pre-commit layout hooks.
//!
//! A protocol may name a hook in `callbacks.on_layout_change`.  Before a grid
//! layout change is scheduled the controller runs that hook; returning
//! `Err(Vetoed)` cancels the change with no state mutation.

use std::collections::HashMap;
use std::fmt;

use hp_core::GridLayout;
use thiserror::Error;
use tracing::warn;

/// A hook's permission to continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proceed;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("layout change vetoed by '{hook}': {reason}")]
pub struct Vetoed {
    pub hook: String,
    pub reason: String,
}

/// What a hook is asked to approve.
#[derive(Debug, Clone, PartialEq)]
pub struct LayoutChange {
    pub protocol_id: Option<String>,
    pub from: GridLayout,
    pub to: GridLayout,
    pub is_hanging_protocol_layout: bool,
}

pub type LayoutHook = Box<dyn Fn(&LayoutChange) -> Result<Proceed, Vetoed> + Send + Sync>;

#[derive(Default)]
pub struct LayoutHookRegistry {
    hooks: HashMap<String, LayoutHook>,
}

impl fmt::Debug for LayoutHookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.hooks.keys().collect();
        names.sort();
        f.debug_struct("LayoutHookRegistry").field("hooks", &names).finish()
    }
}

impl LayoutHookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the hook called `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, hook: F)
    where
        F: Fn(&LayoutChange) -> Result<Proceed, Vetoed> + Send + Sync + 'static,
    {
        self.hooks.insert(name.into(), Box::new(hook));
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.hooks.remove(name).is_some()
    }

    /// Runs hook `name`.  A name with no registered hook proceeds.
    ///
    /// # Errors
    ///
    /// Returns the hook's [`Vetoed`] unchanged.
    pub fn run(&self, name: &str, change: &LayoutChange) -> Result<Proceed, Vetoed> {
        match self.hooks.get(name) {
            Some(hook) => hook(change),
            None => {
                warn!(hook = name, "layout hook is not registered; proceeding");
                Ok(Proceed)
            }
        }
    }
}

/// Hook named by the built-in `mpr` protocol.
pub const MPR_LAYOUT_GUARD: &str = "mprLayoutGuard";

/// Most viewports an MPR layout can usefully show.
const MPR_MAX_VIEWPORTS: usize = 3;

/// Registers the hooks the built-in protocols refer to.
pub fn register_builtin_hooks(registry: &mut LayoutHookRegistry) {
    registry.register(MPR_LAYOUT_GUARD, |change: &LayoutChange| {
        if change.to.capacity() > MPR_MAX_VIEWPORTS {
            return Err(Vetoed {
                hook: MPR_LAYOUT_GUARD.to_string(),
                reason: format!("MPR cannot be shown in a {} grid", change.to),
            });
        }
        Ok(Proceed)
    });
}

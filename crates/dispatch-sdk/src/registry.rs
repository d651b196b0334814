// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process-wide function registry.
//!
//! Maps stable wire names to implementations and their calling conventions.
//! The registry is populated during startup and then frozen; after that it is
//! shared immutably with the run loop, so concurrent lookups take no lock.
//! Renaming a registered function breaks compatibility with in-flight
//! executions; wire names are build artifacts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::durable::coroutine::ProgramResolver;
use crate::durable::program::Program;
use crate::error::{ErrorValue, Result, SdkError};
use crate::types::Call;
use crate::value::Value;

/// Calling convention of a registered function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Runs to completion in a single request; cannot suspend.
    OneShot,
    /// Durable coroutine; may suspend on awaits and be resumed.
    Coroutine,
}

type OneShotFn = dyn Fn(Value) -> std::result::Result<Value, ErrorValue> + Send + Sync;

#[derive(Clone)]
enum FunctionEntry {
    OneShot(Arc<OneShotFn>),
    Coroutine(Arc<Program>),
}

/// A registered function: wire name, calling convention, entry point.
#[derive(Clone)]
pub struct FunctionDescriptor {
    name: String,
    entry: FunctionEntry,
}

impl FunctionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FunctionKind {
        match self.entry {
            FunctionEntry::OneShot(_) => FunctionKind::OneShot,
            FunctionEntry::Coroutine(_) => FunctionKind::Coroutine,
        }
    }

    pub(crate) fn one_shot(&self) -> Option<&Arc<OneShotFn>> {
        match &self.entry {
            FunctionEntry::OneShot(f) => Some(f),
            FunctionEntry::Coroutine(_) => None,
        }
    }

    pub(crate) fn program(&self) -> Option<&Arc<Program>> {
        match &self.entry {
            FunctionEntry::Coroutine(p) => Some(p),
            FunctionEntry::OneShot(_) => None,
        }
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}

/// Registry of local functions.
#[derive(Debug, Default)]
pub struct Registry {
    endpoint: String,
    functions: HashMap<String, FunctionDescriptor>,
    frozen: bool,
}

impl Registry {
    /// Create a registry for functions served at the given endpoint URL.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            functions: HashMap::new(),
            frozen: false,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Register a synchronous one-shot function.
    pub fn register_one_shot<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Value) -> std::result::Result<Value, ErrorValue> + Send + Sync + 'static,
    {
        let name = name.into();
        self.check_writable(&name)?;
        if self.functions.contains_key(&name) {
            return Err(SdkError::Registration(format!(
                "function {:?} is already registered",
                name
            )));
        }
        info!(function = %name, "registering one-shot function");
        self.functions.insert(
            name.clone(),
            FunctionDescriptor {
                name,
                entry: FunctionEntry::OneShot(Arc::new(f)),
            },
        );
        Ok(())
    }

    /// Register a durable coroutine. The program's name is its wire name.
    ///
    /// Re-registering the identical program (same fingerprint) is a no-op;
    /// registering a different program under a taken name is an error.
    pub fn register_coroutine(&mut self, program: Program) -> Result<()> {
        let name = program.name().to_string();
        self.check_writable(&name)?;
        if let Some(existing) = self.functions.get(&name) {
            match existing.program() {
                Some(p) if p.fingerprint() == program.fingerprint() => return Ok(()),
                _ => {
                    return Err(SdkError::Registration(format!(
                        "function {:?} is already registered with a different definition",
                        name
                    )))
                }
            }
        }
        info!(function = %name, version = %program.version(), "registering durable function");
        self.functions.insert(
            name.clone(),
            FunctionDescriptor {
                name,
                entry: FunctionEntry::Coroutine(Arc::new(program)),
            },
        );
        Ok(())
    }

    fn check_writable(&self, name: &str) -> Result<()> {
        if self.frozen {
            return Err(SdkError::Registration(format!(
                "cannot register {:?}: the registry is frozen after startup",
                name
            )));
        }
        Ok(())
    }

    /// Seal the registry. Lookups after this point are lock-free reads;
    /// further registration fails.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Look up a function by wire name.
    pub fn lookup(&self, name: &str) -> Result<&FunctionDescriptor> {
        self.functions
            .get(name)
            .ok_or_else(|| SdkError::NotFound(name.to_string()))
    }

    /// Handle used to build calls to a registered function and dispatch
    /// top-level executions of it.
    pub fn handle(&self, name: &str) -> Result<FunctionHandle> {
        let descriptor = self.lookup(name)?;
        Ok(FunctionHandle {
            name: descriptor.name.clone(),
            endpoint: self.endpoint.clone(),
        })
    }
}

impl ProgramResolver for Registry {
    fn resolve(&self, name: &str) -> Option<Arc<Program>> {
        self.functions.get(name).and_then(|d| d.program().cloned())
    }
}

/// Handle on a registered function, detached from the registry borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionHandle {
    name: String,
    endpoint: String,
}

impl FunctionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Build a call to this function with the provided input.
    pub fn call(&self, input: Value) -> Call {
        Call::new(self.name.clone(), input).with_endpoint(self.endpoint.clone())
    }
}

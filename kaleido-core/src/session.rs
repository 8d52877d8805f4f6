//! Compilation-unit session.
//!
//! Every top-level form becomes its own unit: it is lowered in a fresh
//! context, handed to the execution engine, and then kept, evaluated or
//! released depending on what kind of form it was.

use std::collections::{BTreeSet, HashMap};

use crate::ast::{ANONYMOUS_FUNCTION, Item, Prototype};
use crate::builtins::find_builtin;
use crate::codegen::{OperatorTable, PrototypeTable, lower};
use crate::error::{JitError, SessionError};
use crate::ir::DataLayout;
use crate::jit::{ExecutionEngine, UnitHandle};
use crate::parser::Parser;

/// What happens when a function that is already provided is defined again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedefinitionPolicy {
    /// Replace the definition and release the old unit. Units that were
    /// linked against the old body keep calling it.
    #[default]
    Legacy,
    /// Refuse the redefinition while any other live definition calls the
    /// function.
    Strict,
}

#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub redefinition: RedefinitionPolicy,
}

/// Result of processing one top-level form. `ir` is the printed unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Defined { name: String, ir: String },
    Declared { name: String, ir: String },
    Evaluated { value: f64, ir: String },
}

impl Outcome {
    pub fn ir(&self) -> &str {
        match self {
            Outcome::Defined { ir, .. }
            | Outcome::Declared { ir, .. }
            | Outcome::Evaluated { ir, .. } => ir,
        }
    }
}

pub struct Session<E: ExecutionEngine> {
    engine: E,
    config: SessionConfig,
    data_layout: DataLayout,
    prototypes: PrototypeTable,
    operators: OperatorTable,
    /// Unit currently providing each named function.
    providers: HashMap<String, UnitHandle>,
    /// Callee name to the provided functions whose bodies call it.
    callers: HashMap<String, BTreeSet<String>>,
    next_unit: u64,
}

impl<E: ExecutionEngine> Session<E> {
    pub fn new(engine: E, config: SessionConfig) -> Self {
        let data_layout = engine.data_layout();
        Session {
            engine,
            config,
            data_layout,
            prototypes: PrototypeTable::default(),
            operators: OperatorTable::default(),
            providers: HashMap::new(),
            callers: HashMap::new(),
            next_unit: 0,
        }
    }

    pub fn prototypes(&self) -> &PrototypeTable {
        &self.prototypes
    }

    pub fn is_provided(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn drain_output(&mut self) -> Vec<u8> {
        self.engine.drain_output()
    }

    /// Lowers, submits and (for bare expressions) evaluates one form.
    ///
    /// Parse and lowering failures leave the session as it was. A
    /// [`SessionError::Jit`] means the engine is unusable.
    pub fn process(&mut self, item: Item) -> Result<Outcome, SessionError> {
        match &item {
            Item::Function(function) if !function.is_anonymous() => {
                self.check_redefinition(function.name())?;
            }
            Item::Extern(proto) => self.check_host_signature(proto)?,
            Item::Function(_) => {}
        }

        let module_name = format!("unit{}", self.next_unit);
        self.next_unit += 1;
        let module = lower(
            &item,
            &module_name,
            self.data_layout,
            &mut self.prototypes,
            &self.operators,
        )?;
        let ir = module.to_string();
        let callees: Vec<String> = module
            .called_declarations()
            .into_iter()
            .map(|function| function.name.clone())
            .collect();

        let handle = self.engine.add_module(module)?;

        match item {
            Item::Function(function) if function.is_anonymous() => {
                let value = self
                    .engine
                    .lookup(ANONYMOUS_FUNCTION)
                    .and_then(|symbol| self.engine.call(&symbol));
                self.engine.remove(handle)?;
                Ok(Outcome::Evaluated { value: value?, ir })
            }
            Item::Function(function) => {
                let name = function.proto.name;
                self.record_callees(&name, callees);
                if let Some(previous) = self.providers.insert(name.clone(), handle) {
                    self.engine.remove(previous)?;
                }
                Ok(Outcome::Defined { name, ir })
            }
            Item::Extern(proto) => {
                self.engine.remove(handle)?;
                Ok(Outcome::Declared {
                    name: proto.name,
                    ir,
                })
            }
        }
    }

    /// Parses and processes every form in `source`, stopping at the first
    /// error.
    pub fn eval_source(&mut self, source: &str) -> Result<Vec<Outcome>, SessionError> {
        let mut parser = Parser::for_str(source);
        let mut outcomes = Vec::new();
        while let Some(item) = parser.parse_top_level()? {
            outcomes.push(self.process(item)?);
        }
        Ok(outcomes)
    }

    /// Releases every provided unit. All units are released even if one
    /// fails; the first failure is returned.
    pub fn close(mut self) -> Result<(), JitError> {
        let mut first_error = None;
        for (_, handle) in self.providers.drain() {
            if let Err(err) = self.engine.remove(handle) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn check_redefinition(&self, name: &str) -> Result<(), SessionError> {
        if self.config.redefinition != RedefinitionPolicy::Strict || !self.is_provided(name) {
            return Ok(());
        }
        let dependents: Vec<String> = self
            .callers
            .get(name)
            .into_iter()
            .flatten()
            .filter(|caller| caller.as_str() != name)
            .cloned()
            .collect();
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(SessionError::RedefinitionRefused {
                name: name.to_string(),
                dependents,
            })
        }
    }

    /// An `extern` for a host builtin must match its arity, unless a
    /// definition of the same name shadows the builtin.
    fn check_host_signature(&self, proto: &Prototype) -> Result<(), SessionError> {
        match find_builtin(&proto.name) {
            Some(builtin) if builtin.arity != proto.arity() && !self.is_provided(&proto.name) => {
                Err(SessionError::HostSignature {
                    name: proto.name.clone(),
                    expected: builtin.arity,
                    found: proto.arity(),
                })
            }
            _ => Ok(()),
        }
    }

    fn record_callees(&mut self, caller: &str, callees: Vec<String>) {
        for callers in self.callers.values_mut() {
            callers.remove(caller);
        }
        self.callers.retain(|_, callers| !callers.is_empty());
        for callee in callees {
            self.callers
                .entry(callee)
                .or_default()
                .insert(caller.to_string());
        }
    }
}

//! Execution engine.
//!
//! The session talks to the engine only through [`ExecutionEngine`]:
//! submit a unit, get a [`UnitHandle`] back, release it later, and
//! resolve compiled symbols by name. [`WasmJit`] is the stock
//! implementation on top of `wasm-encoder` and `wasmi`.

use std::collections::HashMap;

use wasmi::{Caller, Engine, Func, FuncType, Linker, Module as WasmModule, Store, Val, ValType};

use crate::builtins::{BUILTINS, BuiltinKind};
use crate::codegen_wasm::{IMPORT_MODULE, emit_module};
use crate::error::JitError;
use crate::ir::{DataLayout, Module};

/// Owned, move-only ticket for one submitted unit.
///
/// Only engines in this crate issue handles, and releasing a unit consumes
/// its handle, so a unit cannot be released twice.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct UnitHandle {
    id: u64,
}

impl UnitHandle {
    pub(crate) fn new(id: u64) -> Self {
        UnitHandle { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub trait ExecutionEngine {
    /// A resolved, callable function.
    type Symbol;

    fn data_layout(&self) -> DataLayout;

    /// Compiles and links one unit. Its definitions become resolvable by
    /// name, taking precedence over earlier units defining the same name.
    fn add_module(&mut self, module: Module) -> Result<UnitHandle, JitError>;

    /// Releases a unit. Names it provided resolve to the previous provider
    /// again, if any.
    fn remove(&mut self, handle: UnitHandle) -> Result<(), JitError>;

    fn lookup(&self, name: &str) -> Result<Self::Symbol, JitError>;

    /// Invokes a zero-argument symbol.
    fn call(&mut self, symbol: &Self::Symbol) -> Result<f64, JitError>;

    /// Takes everything the program wrote through the host runtime.
    fn drain_output(&mut self) -> Vec<u8>;
}

/// Store data. Deferred imports read the provider table at call time, so
/// it lives here rather than on [`WasmJit`].
#[derive(Debug, Default)]
struct HostState {
    output: Vec<u8>,
    host: HashMap<&'static str, Func>,
    /// Providers per name, most recent last.
    symbols: HashMap<String, Vec<(u64, Func)>>,
}

impl HostState {
    fn resolve(&self, name: &str) -> Option<Func> {
        self.symbols
            .get(name)
            .and_then(|providers| providers.last())
            .map(|&(_, func)| func)
            .or_else(|| self.host.get(name).copied())
    }
}

#[derive(Debug, Clone)]
pub struct WasmSymbol {
    pub name: String,
    func: Func,
}

struct Unit {
    exports: Vec<String>,
}

/// JIT that turns each unit into its own wasm instance.
///
/// An import that already has a provider is bound when the unit is
/// instantiated, so a caller keeps calling the body it was linked against
/// even after that body's unit has been removed. An import with no
/// provider yet is bound to a deferred stub that looks the name up on
/// every call and traps only if it is still missing, which is what makes
/// `extern` forward declarations and mutual recursion work.
///
/// wasmi cannot free an instance from a live store, so every instance,
/// including those of removed and anonymous units, stays allocated until
/// the `WasmJit` is dropped.
pub struct WasmJit {
    engine: Engine,
    store: Store<HostState>,
    units: HashMap<u64, Unit>,
    next_unit: u64,
}

impl WasmJit {
    pub fn new() -> Self {
        let engine = Engine::default();
        let mut store = Store::new(&engine, HostState::default());
        let host = BUILTINS
            .iter()
            .map(|builtin| (builtin.name, host_function(&mut store, builtin.kind)))
            .collect();
        store.data_mut().host = host;
        WasmJit {
            engine,
            store,
            units: HashMap::new(),
            next_unit: 0,
        }
    }

    /// Number of units currently loaded.
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn resolve(&self, name: &str) -> Option<Func> {
        self.store.data().resolve(name)
    }
}

impl Default for WasmJit {
    fn default() -> Self {
        WasmJit::new()
    }
}

impl ExecutionEngine for WasmJit {
    type Symbol = WasmSymbol;

    fn data_layout(&self) -> DataLayout {
        DataLayout::WASM32
    }

    fn add_module(&mut self, module: Module) -> Result<UnitHandle, JitError> {
        if module.data_layout != self.data_layout() {
            return Err(JitError::Compile(format!(
                "unit `{}` targets data layout `{}`",
                module.name, module.data_layout.description
            )));
        }

        let artifact = emit_module(&module)?;
        let wasm = WasmModule::new(&self.engine, &artifact.bytes)
            .map_err(|err| JitError::Compile(err.to_string()))?;

        let mut linker = Linker::<HostState>::new(&self.engine);
        for name in &artifact.imports {
            let func = match self.resolve(name) {
                Some(func) => func,
                None => {
                    let arity = module
                        .get_function(name)
                        .map(|function| function.arity())
                        .ok_or_else(|| JitError::UnresolvedSymbol(name.clone()))?;
                    deferred_import(&mut self.store, name, arity)
                }
            };
            linker
                .define(IMPORT_MODULE, name, func)
                .map_err(|err| JitError::Link {
                    name: name.clone(),
                    message: err.to_string(),
                })?;
        }

        let instance = linker
            .instantiate(&mut self.store, &wasm)
            .map_err(|err| JitError::Instantiate(err.to_string()))?
            .start(&mut self.store)
            .map_err(|err| JitError::Instantiate(err.to_string()))?;

        let id = self.next_unit;
        self.next_unit += 1;

        for name in &artifact.exports {
            let func = instance
                .get_func(&self.store, name)
                .ok_or_else(|| JitError::SymbolNotFound(name.clone()))?;
            self.store
                .data_mut()
                .symbols
                .entry(name.clone())
                .or_default()
                .push((id, func));
        }
        self.units.insert(
            id,
            Unit {
                exports: artifact.exports,
            },
        );

        Ok(UnitHandle::new(id))
    }

    /// Unpublishes the unit's exports. The instance itself stays in the
    /// store, since stale callers may still reach it.
    fn remove(&mut self, handle: UnitHandle) -> Result<(), JitError> {
        let id = handle.id();
        let unit = self.units.remove(&id).ok_or(JitError::UnknownUnit(id))?;
        let symbols = &mut self.store.data_mut().symbols;
        for name in unit.exports {
            if let Some(providers) = symbols.get_mut(&name) {
                providers.retain(|&(unit, _)| unit != id);
                if providers.is_empty() {
                    symbols.remove(&name);
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> Result<WasmSymbol, JitError> {
        let func = self
            .resolve(name)
            .ok_or_else(|| JitError::SymbolNotFound(name.to_string()))?;
        Ok(WasmSymbol {
            name: name.to_string(),
            func,
        })
    }

    fn call(&mut self, symbol: &WasmSymbol) -> Result<f64, JitError> {
        let typed = symbol
            .func
            .typed::<(), f64>(&self.store)
            .map_err(|err| JitError::Signature {
                name: symbol.name.clone(),
                message: err.to_string(),
            })?;
        typed
            .call(&mut self.store, ())
            .map_err(|err| JitError::Trap(err.to_string()))
    }

    fn drain_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.store.data_mut().output)
    }
}

/// Import stub for a name nobody provides yet.
fn deferred_import(store: &mut Store<HostState>, name: &str, arity: usize) -> Func {
    let ty = FuncType::new(vec![ValType::F64; arity], [ValType::F64]);
    let name = name.to_string();
    Func::new(
        &mut *store,
        ty,
        move |mut caller: Caller<'_, HostState>,
              params: &[Val],
              results: &mut [Val]|
              -> Result<(), wasmi::Error> {
            let target = caller.data().resolve(&name).ok_or_else(|| {
                wasmi::Error::new(JitError::UnresolvedSymbol(name.clone()).to_string())
            })?;
            target.call(&mut caller, params, results)
        },
    )
}

fn host_function(store: &mut Store<HostState>, kind: BuiltinKind) -> Func {
    match kind {
        BuiltinKind::PutChar | BuiltinKind::PrintDouble => Func::wrap(
            &mut *store,
            move |mut caller: Caller<'_, HostState>, value: f64| -> f64 {
                let bytes = kind.render(value);
                caller.data_mut().output.extend_from_slice(&bytes);
                0.0
            },
        ),
        BuiltinKind::Pow => Func::wrap(&mut *store, move |x: f64, y: f64| -> f64 {
            kind.eval(&[x, y]).unwrap_or_default()
        }),
        _ => Func::wrap(&mut *store, move |x: f64| -> f64 {
            kind.eval(&[x]).unwrap_or_default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{OperatorTable, PrototypeTable, lower};
    use crate::parser::parse_program;

    struct Harness {
        jit: WasmJit,
        prototypes: PrototypeTable,
        operators: OperatorTable,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                jit: WasmJit::new(),
                prototypes: PrototypeTable::default(),
                operators: OperatorTable::default(),
            }
        }

        fn submit(&mut self, source: &str) -> Vec<UnitHandle> {
            parse_program(source)
                .expect("parse")
                .iter()
                .map(|item| {
                    let module = lower(
                        item,
                        "test",
                        self.jit.data_layout(),
                        &mut self.prototypes,
                        &self.operators,
                    )
                    .expect("lower");
                    self.jit.add_module(module).expect("add module")
                })
                .collect()
        }

        fn eval(&mut self, source: &str) -> f64 {
            let handles = self.submit(source);
            let symbol = self.jit.lookup(crate::ast::ANONYMOUS_FUNCTION).expect("lookup");
            let value = self.jit.call(&symbol).expect("call");
            for handle in handles {
                self.jit.remove(handle).expect("remove");
            }
            value
        }
    }

    #[test]
    fn evaluates_arithmetic() {
        let mut harness = Harness::new();
        assert_eq!(harness.eval("1+2*3-4"), 3.0);
    }

    #[test]
    fn calls_across_units() {
        let mut harness = Harness::new();
        harness.submit("def foo(x) x*2");
        assert_eq!(harness.eval("foo(21)"), 42.0);
    }

    #[test]
    fn runs_recursive_fib() {
        let mut harness = Harness::new();
        harness.submit("def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)");
        assert_eq!(harness.eval("fib(10)"), 55.0);
    }

    #[test]
    fn comparison_is_zero_or_one() {
        let mut harness = Harness::new();
        assert_eq!(harness.eval("1 < 2"), 1.0);
        assert_eq!(harness.eval("2 < 1"), 0.0);
    }

    #[test]
    fn host_library_writes_output() {
        let mut harness = Harness::new();
        harness.submit("extern printd(x) extern putchard(c)");
        assert_eq!(harness.eval("for i = 1, i < 3 in printd(i)"), 0.0);
        harness.eval("putchard(72)");
        assert_eq!(harness.jit.drain_output(), b"1.000000\n2.000000\nH".to_vec());
        assert!(harness.jit.drain_output().is_empty());
    }

    #[test]
    fn math_builtins_are_linked() {
        let mut harness = Harness::new();
        harness.submit("extern sqrt(x) extern pow(x y)");
        assert_eq!(harness.eval("sqrt(16) + pow(2, 3)"), 12.0);
    }

    #[test]
    fn removing_a_unit_restores_previous_provider() {
        let mut harness = Harness::new();
        harness.submit("def f() 1");
        let newer = harness.submit("def f() 2");
        assert_eq!(harness.eval("f()"), 2.0);
        for handle in newer {
            harness.jit.remove(handle).expect("remove");
        }
        assert_eq!(harness.eval("f()"), 1.0);
    }

    #[test]
    fn stale_callers_keep_old_body() {
        let mut harness = Harness::new();
        let old = harness.submit("def f() 1");
        harness.submit("def g() f()");
        harness.submit("def f() 2");
        for handle in old {
            harness.jit.remove(handle).expect("remove");
        }
        assert_eq!(harness.eval("g()"), 1.0);
        assert_eq!(harness.eval("f()"), 2.0);
    }

    #[test]
    fn calling_a_declared_but_undefined_function_traps() {
        let mut harness = Harness::new();
        harness.submit("extern missing(x)");
        harness.submit("missing(1)");
        let symbol = harness.jit.lookup(crate::ast::ANONYMOUS_FUNCTION).expect("lookup");
        match harness.jit.call(&symbol) {
            Err(JitError::Trap(message)) => assert!(message.contains("missing")),
            other => panic!("expected a trap, got {other:?}"),
        }
    }

    #[test]
    fn forward_declaration_allows_mutual_recursion() {
        let mut harness = Harness::new();
        harness.submit("extern odd(n)");
        harness.submit("def even(n) if n < 1 then 1 else odd(n-1)");
        harness.submit("def odd(n) if n < 1 then 0 else even(n-1)");
        assert_eq!(harness.eval("even(4)"), 1.0);
        assert_eq!(harness.eval("even(3)"), 0.0);
    }

    #[test]
    fn deferred_import_follows_the_latest_provider() {
        let mut harness = Harness::new();
        harness.submit("extern later()");
        harness.submit("def early() later() + 1");
        harness.submit("def later() 10");
        assert_eq!(harness.eval("early()"), 11.0);
        harness.submit("def later() 20");
        assert_eq!(harness.eval("early()"), 21.0);
    }

    #[test]
    fn handles_are_unique_per_unit() {
        let mut harness = Harness::new();
        let first = harness.submit("def a() 1");
        let second = harness.submit("def b() 2");
        assert_ne!(first[0].id(), second[0].id());
        let id = first[0].id();
        for handle in first {
            harness.jit.remove(handle).expect("remove");
        }
        assert_eq!(
            harness.jit.remove(UnitHandle::new(id)).unwrap_err(),
            JitError::UnknownUnit(id)
        );
    }

    #[test]
    fn unknown_symbol_lookup_fails() {
        let harness = Harness::new();
        assert_eq!(
            harness.jit.lookup("nothing").unwrap_err(),
            JitError::SymbolNotFound("nothing".to_string())
        );
    }

    #[test]
    fn anonymous_units_do_not_accumulate() {
        let mut harness = Harness::new();
        harness.eval("1");
        harness.eval("2");
        assert_eq!(harness.jit.unit_count(), 0);
        assert!(harness.jit.lookup(crate::ast::ANONYMOUS_FUNCTION).is_err());
        assert!(harness.jit.store.data().symbols.is_empty());
    }
}

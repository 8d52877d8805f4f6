//! Lowering from the AST into SSA IR.
//!
//! A [`LoweringContext`] is single-use: it lowers exactly one top-level
//! form into a fresh [`Module`], which the session then hands to the
//! execution engine as one compilation unit.

use std::collections::HashMap;

use crate::ast::{Expr, Function, Item, Prototype};
use crate::error::LoweringError;
use crate::ir::{self, BinOp, BlockId, DataLayout, FCmpPred, InstKind, Module, Terminator, Value};

/// How a binary operator literal is lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryLowering {
    Add,
    Sub,
    Mul,
    /// `fcmp ult`, then widened to 0.0 / 1.0.
    LessThan,
}

/// Operator literal to lowering. Built once per session, never mutated.
#[derive(Debug, Clone)]
pub struct OperatorTable {
    entries: HashMap<&'static str, BinaryLowering>,
}

impl Default for OperatorTable {
    fn default() -> Self {
        let entries = [
            ("+", BinaryLowering::Add),
            ("-", BinaryLowering::Sub),
            ("*", BinaryLowering::Mul),
            ("<", BinaryLowering::LessThan),
        ];
        OperatorTable {
            entries: entries.into_iter().collect(),
        }
    }
}

impl OperatorTable {
    pub fn get(&self, op: &str) -> Option<BinaryLowering> {
        self.entries.get(op).copied()
    }
}

/// Session-wide function signatures, keyed by name. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct PrototypeTable {
    entries: HashMap<String, Prototype>,
}

impl PrototypeTable {
    pub fn get(&self, name: &str) -> Option<&Prototype> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Returns the entry that was replaced, if any.
    pub fn insert(&mut self, proto: Prototype) -> Option<Prototype> {
        self.entries.insert(proto.name.clone(), proto)
    }

    /// Puts back what `insert` replaced.
    pub fn restore(&mut self, name: &str, previous: Option<Prototype>) {
        match previous {
            Some(proto) => {
                self.entries.insert(name.to_string(), proto);
            }
            None => {
                self.entries.remove(name);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct LoweringContext<'s> {
    module: Module,
    prototypes: &'s mut PrototypeTable,
    operators: &'s OperatorTable,
    /// Locals in scope: parameters plus any loop variables.
    named_values: HashMap<String, Value>,
    function: usize,
    block: BlockId,
}

impl<'s> LoweringContext<'s> {
    pub fn new(
        module_name: &str,
        data_layout: DataLayout,
        prototypes: &'s mut PrototypeTable,
        operators: &'s OperatorTable,
    ) -> Self {
        LoweringContext {
            module: Module::new(module_name, data_layout),
            prototypes,
            operators,
            named_values: HashMap::new(),
            function: 0,
            block: BlockId(0),
        }
    }

    /// Lowers one top-level form and returns the finished unit.
    pub fn lower_item(mut self, item: &Item) -> Result<Module, LoweringError> {
        match item {
            Item::Extern(proto) => {
                self.prototypes.insert(proto.clone());
                self.lower_prototype(proto);
            }
            Item::Function(function) => self.lower_function(function)?,
        }
        Ok(self.module)
    }

    /// Declares `proto` in the unit. Idempotent per name.
    fn lower_prototype(&mut self, proto: &Prototype) -> usize {
        match self.module.function_index(&proto.name) {
            Some(index) => index,
            None => self
                .module
                .add_function(ir::Function::declare(&proto.name, proto.params.clone())),
        }
    }

    /// Finds `name` in this unit, declaring it from the session table if
    /// only a signature is known.
    fn get_proto(&mut self, name: &str) -> Option<usize> {
        if let Some(index) = self.module.function_index(name) {
            return Some(index);
        }
        let proto = self.prototypes.get(name)?.clone();
        Some(self.lower_prototype(&proto))
    }

    fn lower_function(&mut self, function: &Function) -> Result<(), LoweringError> {
        let name = function.name();
        let previous = self.prototypes.insert(function.proto.clone());
        let result = self.lower_function_body(function);
        if result.is_err() {
            self.prototypes.restore(name, previous);
        }
        result
    }

    fn lower_function_body(&mut self, function: &Function) -> Result<(), LoweringError> {
        let name = function.name();
        let index = self
            .get_proto(name)
            .ok_or_else(|| LoweringError::UnknownFunction(name.to_string()))?;

        self.function = index;
        self.block = self.func_mut().append_block("entry");

        self.named_values.clear();
        for (position, param) in function.proto.params.iter().enumerate() {
            self.named_values
                .insert(param.clone(), Value::Param(position as u32));
        }

        let lowered = self.lower_expr(&function.body).and_then(|ret| {
            self.terminate(Terminator::Ret(ret));
            self.module
                .function(index)
                .verify(&self.module)
                .map_err(|source| LoweringError::Malformed {
                    name: name.to_string(),
                    source,
                })
        });

        if lowered.is_err() {
            self.module.erase_function(index);
        }
        lowered
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<Value, LoweringError> {
        match expr {
            Expr::Number(value) => Ok(Value::Const(*value)),
            Expr::Variable(name) => self
                .named_values
                .get(name)
                .copied()
                .ok_or_else(|| LoweringError::UnboundVariable(name.clone())),
            Expr::Binary { op, lhs, rhs } => self.lower_binary(op, lhs, rhs),
            Expr::Call { callee, args } => self.lower_call(callee, args),
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(cond, then_branch, else_branch),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => self.lower_for(var, start, end, step.as_deref(), body),
        }
    }

    fn lower_binary(&mut self, op: &str, lhs: &Expr, rhs: &Expr) -> Result<Value, LoweringError> {
        let lhs = self.lower_expr(lhs)?;
        let rhs = self.lower_expr(rhs)?;

        let lowering = self
            .operators
            .get(op)
            .ok_or_else(|| LoweringError::UnsupportedOperator(op.to_string()))?;

        let value = match lowering {
            BinaryLowering::Add => self.emit(InstKind::Binary { op: BinOp::FAdd, lhs, rhs }, "addtmp"),
            BinaryLowering::Sub => self.emit(InstKind::Binary { op: BinOp::FSub, lhs, rhs }, "subtmp"),
            BinaryLowering::Mul => self.emit(InstKind::Binary { op: BinOp::FMul, lhs, rhs }, "multmp"),
            BinaryLowering::LessThan => {
                let cmp = self.emit(
                    InstKind::FCmp {
                        pred: FCmpPred::Ult,
                        lhs,
                        rhs,
                    },
                    "cmptmp",
                );
                self.emit(InstKind::UiToFp(cmp), "booltmp")
            }
        };
        Ok(value)
    }

    fn lower_call(&mut self, callee: &str, args: &[Expr]) -> Result<Value, LoweringError> {
        let index = self
            .get_proto(callee)
            .ok_or_else(|| LoweringError::UnknownFunction(callee.to_string()))?;

        let expected = self.module.function(index).arity();
        if expected != args.len() {
            return Err(LoweringError::ArityMismatch {
                name: callee.to_string(),
                expected,
                found: args.len(),
            });
        }

        let args = args
            .iter()
            .map(|arg| self.lower_expr(arg))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.emit(
            InstKind::Call {
                callee: callee.to_string(),
                args,
            },
            "calltmp",
        ))
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_branch: &Expr,
        else_branch: &Expr,
    ) -> Result<Value, LoweringError> {
        let cond = self.lower_expr(cond)?;
        let cond = self.emit(
            InstKind::FCmp {
                pred: FCmpPred::One,
                lhs: cond,
                rhs: Value::Const(0.0),
            },
            "ifcond",
        );

        let then_block = self.func_mut().append_block("then");
        let else_block = self.func_mut().create_block("else");
        let merge_block = self.func_mut().create_block("ifcont");

        self.terminate(Terminator::CondBr {
            cond,
            then_dest: then_block,
            else_dest: else_block,
        });

        // Nested control flow may move the insertion point, so each arm's
        // phi edge comes from wherever the arm ended.
        self.block = then_block;
        let then_value = self.lower_expr(then_branch)?;
        self.terminate(Terminator::Br(merge_block));
        let then_end = self.block;

        self.func_mut().insert_block(else_block);
        self.block = else_block;
        let else_value = self.lower_expr(else_branch)?;
        self.terminate(Terminator::Br(merge_block));
        let else_end = self.block;

        self.func_mut().insert_block(merge_block);
        self.block = merge_block;
        Ok(self.emit(
            InstKind::Phi {
                incoming: vec![(then_value, then_end), (else_value, else_end)],
            },
            "iftmp",
        ))
    }

    fn lower_for(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<Value, LoweringError> {
        let start = self.lower_expr(start)?;
        let preheader = self.block;

        let loop_block = self.func_mut().create_block("loop");
        self.terminate(Terminator::Br(loop_block));
        self.func_mut().insert_block(loop_block);
        self.block = loop_block;

        let current = self.emit(
            InstKind::Phi {
                incoming: vec![(start, preheader)],
            },
            var,
        );

        let shadowed = self.named_values.insert(var.to_string(), current);
        let result = self.lower_loop_tail(var, current, loop_block, end, step, body);
        match shadowed {
            Some(outer) => {
                self.named_values.insert(var.to_string(), outer);
            }
            None => {
                self.named_values.remove(var);
            }
        }
        result?;

        Ok(Value::Const(0.0))
    }

    /// Body, increment and exit test of a `for` loop. The exit test sees
    /// the loop variable already advanced by `step`.
    fn lower_loop_tail(
        &mut self,
        var: &str,
        current: Value,
        loop_block: BlockId,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<(), LoweringError> {
        self.lower_expr(body)?;

        let step = match step {
            Some(step) => self.lower_expr(step)?,
            None => Value::Const(1.0),
        };
        let next = self.emit(
            InstKind::Binary {
                op: BinOp::FAdd,
                lhs: current,
                rhs: step,
            },
            "nextvar",
        );
        self.named_values.insert(var.to_string(), next);

        let end = self.lower_expr(end)?;
        let end_cond = self.emit(
            InstKind::FCmp {
                pred: FCmpPred::One,
                lhs: end,
                rhs: Value::Const(0.0),
            },
            "loopcond",
        );

        let loop_end = self.block;
        let after_block = self.func_mut().create_block("afterloop");
        self.terminate(Terminator::CondBr {
            cond: end_cond,
            then_dest: loop_block,
            else_dest: after_block,
        });
        self.func_mut().add_incoming(current, next, loop_end);

        self.func_mut().insert_block(after_block);
        self.block = after_block;
        Ok(())
    }

    fn func_mut(&mut self) -> &mut ir::Function {
        self.module.function_mut(self.function)
    }

    fn emit(&mut self, kind: InstKind, name: &str) -> Value {
        let block = self.block;
        self.func_mut().push(block, kind, name)
    }

    fn terminate(&mut self, terminator: Terminator) {
        let block = self.block;
        self.func_mut().terminate(block, terminator);
    }
}

/// Lowers `item` in a fresh context.
pub fn lower(
    item: &Item,
    module_name: &str,
    data_layout: DataLayout,
    prototypes: &mut PrototypeTable,
    operators: &OperatorTable,
) -> Result<Module, LoweringError> {
    LoweringContext::new(module_name, data_layout, prototypes, operators).lower_item(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Type;
    use crate::parser::parse_program;

    fn lower_source(source: &str, prototypes: &mut PrototypeTable) -> Result<Module, LoweringError> {
        let items = parse_program(source).expect("parse");
        let operators = OperatorTable::default();
        let mut last = None;
        for item in &items {
            last = Some(lower(item, "test", DataLayout::WASM32, prototypes, &operators)?);
        }
        Ok(last.expect("at least one form"))
    }

    #[test]
    fn lowers_definition_and_registers_prototype() {
        let mut prototypes = PrototypeTable::default();
        let module = lower_source("def foo(x) x*2", &mut prototypes).expect("lower");
        assert!(prototypes.contains("foo"));
        let function = module.get_function("foo").expect("defined");
        assert!(!function.is_declaration());
        assert_eq!(module.verify(), Ok(()));
    }

    #[test]
    fn comparison_widens_to_double() {
        let mut prototypes = PrototypeTable::default();
        let module = lower_source("1 < 2", &mut prototypes).expect("lower");
        let function = module.get_function(crate::ast::ANONYMOUS_FUNCTION).expect("anon");
        let kinds: Vec<_> = function.insts().iter().map(|inst| inst.ty()).collect();
        assert_eq!(kinds, vec![Type::I1, Type::Double]);
    }

    #[test]
    fn unbound_variable_fails_and_rolls_back() {
        let mut prototypes = PrototypeTable::default();
        let err = lower_source("def foo(x) y", &mut prototypes).unwrap_err();
        assert_eq!(err, LoweringError::UnboundVariable("y".to_string()));
        assert!(!prototypes.contains("foo"));
    }

    #[test]
    fn failed_redefinition_keeps_previous_prototype() {
        let mut prototypes = PrototypeTable::default();
        lower_source("def foo(x) x", &mut prototypes).expect("first");
        lower_source("def foo(a b) c", &mut prototypes).unwrap_err();
        assert_eq!(prototypes.get("foo").map(Prototype::arity), Some(1));
    }

    #[test]
    fn unknown_function_leaves_table_unchanged() {
        let mut prototypes = PrototypeTable::default();
        let err = lower_source("nope(1)", &mut prototypes).unwrap_err();
        assert_eq!(err, LoweringError::UnknownFunction("nope".to_string()));
        assert!(prototypes.is_empty());
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let mut prototypes = PrototypeTable::default();
        lower_source("def foo(x) x", &mut prototypes).expect("define");
        let err = lower_source("foo(1, 2)", &mut prototypes).unwrap_err();
        assert_eq!(
            err,
            LoweringError::ArityMismatch {
                name: "foo".to_string(),
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn unsupported_operator_is_rejected() {
        let mut prototypes = PrototypeTable::default();
        let item = Item::Function(Function::anonymous(Expr::binary(
            "/",
            Expr::Number(1.0),
            Expr::Number(2.0),
        )));
        let err = lower(
            &item,
            "test",
            DataLayout::WASM32,
            &mut prototypes,
            &OperatorTable::default(),
        )
        .unwrap_err();
        assert_eq!(err, LoweringError::UnsupportedOperator("/".to_string()));
    }

    #[test]
    fn extern_declares_without_body() {
        let mut prototypes = PrototypeTable::default();
        let module = lower_source("extern sin(x)", &mut prototypes).expect("lower");
        assert!(module.get_function("sin").is_some_and(ir::Function::is_declaration));
        assert!(prototypes.contains("sin"));
    }

    #[test]
    fn calls_declare_known_prototypes_in_new_unit() {
        let mut prototypes = PrototypeTable::default();
        lower_source("def foo(x) x", &mut prototypes).expect("define");
        let module = lower_source("foo(3)", &mut prototypes).expect("call");
        assert!(module.get_function("foo").is_some_and(ir::Function::is_declaration));
        assert_eq!(module.called_declarations().len(), 1);
    }

    #[test]
    fn recursion_uses_the_function_being_defined() {
        let mut prototypes = PrototypeTable::default();
        let module = lower_source(
            "def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)",
            &mut prototypes,
        )
        .expect("lower");
        assert_eq!(module.functions().len(), 1);
        assert_eq!(module.verify(), Ok(()));
        let text = module.to_string();
        assert!(text.contains("phi double"));
        assert!(text.contains("call double @fib"));
    }

    #[test]
    fn loop_variable_is_scoped_to_the_loop() {
        let mut prototypes = PrototypeTable::default();
        let err = lower_source("def f(n) (for i = 0, i < n in i) + i", &mut prototypes).unwrap_err();
        assert_eq!(err, LoweringError::UnboundVariable("i".to_string()));
    }

    #[test]
    fn loop_restores_shadowed_parameter() {
        let mut prototypes = PrototypeTable::default();
        let module = lower_source("def f(i) (for i = 0, i < 3 in i) + i", &mut prototypes)
            .expect("lower");
        let function = module.get_function("f").expect("defined");
        let last = function.insts().last().expect("has instructions");
        assert_eq!(
            last.kind,
            InstKind::Binary {
                op: BinOp::FAdd,
                lhs: Value::Const(0.0),
                rhs: Value::Param(0),
            }
        );
    }

    #[test]
    fn lowering_twice_gives_identical_units() {
        let mut prototypes = PrototypeTable::default();
        let first = lower_source("def g(x) for i = 1, i < x in x", &mut prototypes).expect("first");
        let second = lower_source("def g(x) for i = 1, i < x in x", &mut prototypes).expect("second");
        assert_eq!(first, second);
    }
}

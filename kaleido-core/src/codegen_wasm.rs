//! WASM backend.
//!
//! Translates one verified IR [`Module`] into a wasm binary using
//! `wasm-encoder`. Declarations that a definition calls become imports
//! from the `env` module; every definition is exported under its own
//! name.
//!
//! Arbitrary SSA control flow is emitted as a dispatch loop: a `pc` local
//! selects the next basic block through a `br_table`, and each block ends
//! by storing its successor into `pc` and branching back to the loop
//! header. Phi nodes become locals written on the incoming edges.

use std::collections::HashMap;

use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function as WasmFunction,
    FunctionSection, ImportSection, Instruction, Module as WasmModule, TypeSection, ValType,
};

use crate::error::BackendError;
use crate::ir::{BinOp, BlockId, FCmpPred, Function, InstKind, Module, Terminator, Type, Value};

/// Module name used for every import.
pub const IMPORT_MODULE: &str = "env";

const MAX_LOCALS: u32 = 50_000;

/// Result of lowering one unit to wasm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WasmArtifact {
    pub bytes: Vec<u8>,
    /// Names imported from [`IMPORT_MODULE`], in function index order.
    pub imports: Vec<String>,
    pub exports: Vec<String>,
}

pub fn emit_module(module: &Module) -> Result<WasmArtifact, BackendError> {
    module.verify()?;

    let imported: Vec<&Function> = module.called_declarations();
    let defined: Vec<&Function> = module.definitions().collect();

    let mut indices: HashMap<&str, u32> = HashMap::new();
    for (index, function) in imported.iter().chain(defined.iter()).enumerate() {
        indices.insert(function.name.as_str(), index as u32);
    }

    // One signature per arity: (f64 x n) -> f64.
    let mut types = TypeSection::new();
    let mut type_by_arity: HashMap<usize, u32> = HashMap::new();
    for function in imported.iter().chain(defined.iter()) {
        let arity = function.arity();
        if !type_by_arity.contains_key(&arity) {
            let type_index = types.len();
            types
                .ty()
                .function(std::iter::repeat_n(ValType::F64, arity), [ValType::F64]);
            type_by_arity.insert(arity, type_index);
        }
    }

    let mut imports = ImportSection::new();
    for function in &imported {
        imports.import(
            IMPORT_MODULE,
            &function.name,
            EntityType::Function(type_by_arity[&function.arity()]),
        );
    }

    let mut functions = FunctionSection::new();
    let mut exports = ExportSection::new();
    let mut code = CodeSection::new();
    for function in &defined {
        functions.function(type_by_arity[&function.arity()]);
        exports.export(&function.name, ExportKind::Func, indices[function.name.as_str()]);
        let body = FunctionEmitter::new(function, &indices)?.emit();
        code.function(&body);
    }

    let mut wasm = WasmModule::new();
    wasm.section(&types);
    wasm.section(&imports);
    wasm.section(&functions);
    wasm.section(&exports);
    wasm.section(&code);

    Ok(WasmArtifact {
        bytes: wasm.finish(),
        imports: imported.iter().map(|function| function.name.clone()).collect(),
        exports: defined.iter().map(|function| function.name.clone()).collect(),
    })
}

struct FunctionEmitter<'a> {
    function: &'a Function,
    indices: &'a HashMap<&'a str, u32>,
    body: WasmFunction,
    /// Local holding the index (in layout order) of the next block.
    pc: u32,
    /// Local of instruction 0; instruction `n` lives at `inst_base + n`.
    inst_base: u32,
    positions: HashMap<BlockId, u32>,
}

impl<'a> FunctionEmitter<'a> {
    fn new(function: &'a Function, indices: &'a HashMap<&'a str, u32>) -> Result<Self, BackendError> {
        let params = function.arity() as u32;
        let insts = function.insts().len() as u32;
        let total = params + 1 + insts;
        if total > MAX_LOCALS {
            return Err(BackendError::TooManyLocals(MAX_LOCALS));
        }

        let locals = std::iter::once(ValType::I32).chain(function.insts().iter().map(|inst| {
            match inst.ty() {
                Type::Double => ValType::F64,
                Type::I1 => ValType::I32,
            }
        }));

        let positions = function
            .layout()
            .iter()
            .enumerate()
            .map(|(position, &id)| (id, position as u32))
            .collect();

        Ok(FunctionEmitter {
            function,
            indices,
            body: WasmFunction::new_with_locals_types(locals),
            pc: params,
            inst_base: params + 1,
            positions,
        })
    }

    fn emit(mut self) -> WasmFunction {
        let function = self.function;
        let layout = function.layout();
        let count = layout.len() as u32;

        if count == 1 {
            self.emit_block(layout[0]);
            self.op(Instruction::End);
            return self.body;
        }

        self.op(Instruction::Loop(BlockType::Empty));
        for _ in 0..count {
            self.op(Instruction::Block(BlockType::Empty));
        }
        self.op(Instruction::LocalGet(self.pc));
        let targets: Vec<u32> = (0..count).collect();
        self.op(Instruction::BrTable(targets.into(), 0));

        for (position, &id) in layout.iter().enumerate() {
            self.op(Instruction::End);
            self.emit_block(id);
            // Labels between this block's code and the loop header.
            let depth = count - 1 - position as u32;
            if !matches!(function.block(id).terminator, Some(Terminator::Ret(_))) {
                self.op(Instruction::Br(depth));
            }
        }

        self.op(Instruction::End);
        self.op(Instruction::Unreachable);
        self.op(Instruction::End);
        self.body
    }

    fn emit_block(&mut self, id: BlockId) {
        let function = self.function;
        let block = function.block(id);
        for &inst_id in &block.insts {
            let inst = function.inst(inst_id);
            match &inst.kind {
                InstKind::Phi { .. } => continue,
                InstKind::Binary { op, lhs, rhs } => {
                    self.value(*lhs);
                    self.value(*rhs);
                    self.op(match op {
                        BinOp::FAdd => Instruction::F64Add,
                        BinOp::FSub => Instruction::F64Sub,
                        BinOp::FMul => Instruction::F64Mul,
                    });
                }
                InstKind::FCmp {
                    pred: FCmpPred::Ult,
                    lhs,
                    rhs,
                } => {
                    // ult holds when the operands are unordered, so negate `ge`.
                    self.value(*lhs);
                    self.value(*rhs);
                    self.op(Instruction::F64Ge);
                    self.op(Instruction::I32Eqz);
                }
                InstKind::FCmp {
                    pred: FCmpPred::One,
                    lhs,
                    rhs,
                } => {
                    self.value(*lhs);
                    self.value(*rhs);
                    self.op(Instruction::F64Lt);
                    self.value(*lhs);
                    self.value(*rhs);
                    self.op(Instruction::F64Gt);
                    self.op(Instruction::I32Or);
                }
                InstKind::UiToFp(operand) => {
                    self.value(*operand);
                    self.op(Instruction::F64ConvertI32U);
                }
                InstKind::Call { callee, args } => {
                    for arg in args {
                        self.value(*arg);
                    }
                    self.op(Instruction::Call(self.indices[callee.as_str()]));
                }
            }
            self.op(Instruction::LocalSet(self.inst_base + inst_id.0));
        }

        match block.terminator {
            Some(Terminator::Br(dest)) => self.jump(id, dest),
            Some(Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            }) => {
                self.value(cond);
                self.op(Instruction::If(BlockType::Empty));
                self.jump(id, then_dest);
                self.op(Instruction::Else);
                self.jump(id, else_dest);
                self.op(Instruction::End);
            }
            Some(Terminator::Ret(value)) => {
                self.value(value);
                self.op(Instruction::Return);
            }
            // Rejected by the verifier.
            None => self.op(Instruction::Unreachable),
        }
    }

    /// Performs the phi copies for the edge `from -> dest` and selects
    /// `dest` as the next block.
    fn jump(&mut self, from: BlockId, dest: BlockId) {
        let function = self.function;
        let mut targets = Vec::new();
        for &inst_id in &function.block(dest).insts {
            let InstKind::Phi { incoming } = &function.inst(inst_id).kind else {
                break;
            };
            if let Some((value, _)) = incoming.iter().find(|(_, pred)| *pred == from) {
                // All incoming values are read before any phi is written.
                self.value(*value);
                targets.push(self.inst_base + inst_id.0);
            }
        }
        for local in targets.into_iter().rev() {
            self.op(Instruction::LocalSet(local));
        }

        self.op(Instruction::I32Const(self.positions[&dest] as i32));
        self.op(Instruction::LocalSet(self.pc));
    }

    fn value(&mut self, value: Value) {
        let instruction = match value {
            Value::Const(number) => Instruction::F64Const(number.into()),
            Value::Param(index) => Instruction::LocalGet(index),
            Value::Inst(id) => Instruction::LocalGet(self.inst_base + id.0),
        };
        self.op(instruction);
    }

    fn op(&mut self, instruction: Instruction<'_>) {
        self.body.instruction(&instruction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{OperatorTable, PrototypeTable, lower};
    use crate::ir::DataLayout;
    use crate::parser::parse_program;

    fn emit_source(source: &str) -> WasmArtifact {
        let mut prototypes = PrototypeTable::default();
        let operators = OperatorTable::default();
        let mut artifact = None;
        for item in parse_program(source).expect("parse") {
            let module = lower(&item, "test", DataLayout::WASM32, &mut prototypes, &operators)
                .expect("lower");
            artifact = Some(emit_module(&module).expect("emit"));
        }
        let artifact = artifact.expect("at least one form");
        wasmparser::validate(&artifact.bytes).expect("valid wasm");
        artifact
    }

    #[test]
    fn straight_line_function_is_exported() {
        let artifact = emit_source("def double(x) x*2");
        assert_eq!(artifact.exports, vec!["double".to_string()]);
        assert!(artifact.imports.is_empty());
    }

    #[test]
    fn recursive_conditional_validates() {
        let artifact = emit_source("def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)");
        assert_eq!(artifact.exports, vec!["fib".to_string()]);
        assert!(artifact.imports.is_empty());
    }

    #[test]
    fn loop_with_extern_call_imports_callee() {
        let artifact = emit_source("extern printd(x) def count(n) for i = 1, i < n in printd(i)");
        assert_eq!(artifact.imports, vec!["printd".to_string()]);
        assert_eq!(artifact.exports, vec!["count".to_string()]);
    }

    #[test]
    fn nested_control_flow_validates() {
        emit_source(
            "def f(a b) if a < b then (for i = 0, i < a in if i < 1 then i else b) else a*b",
        );
    }

    #[test]
    fn anonymous_expression_calls_previous_definition() {
        let artifact = emit_source("def foo(x) x*2 foo(21)");
        assert_eq!(artifact.imports, vec!["foo".to_string()]);
        assert_eq!(artifact.exports, vec![crate::ast::ANONYMOUS_FUNCTION.to_string()]);
    }

    #[test]
    fn bare_extern_produces_empty_module() {
        let artifact = emit_source("extern sin(x)");
        assert!(artifact.imports.is_empty());
        assert!(artifact.exports.is_empty());
    }

    #[test]
    fn unverified_module_is_rejected() {
        let mut module = Module::new("test", DataLayout::WASM32);
        let mut function = Function::declare("f", Vec::new());
        function.append_block("entry");
        module.add_function(function);
        assert!(matches!(
            emit_module(&module),
            Err(BackendError::Unverified(_))
        ));
    }
}

//! SSA intermediate representation.
//!
//! The shape follows LLVM closely: a module holds functions, a function
//! holds basic blocks, and control flow merges through `phi`
//! instructions. Blocks live in an arena and are placed into the
//! function's layout separately, so a block can be created before the
//! code that jumps to it is emitted.

use std::collections::HashSet;
use std::fmt;

use crate::error::IrError;

/// Target facts the lowering engine needs from the execution backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataLayout {
    pub pointer_width: u32,
    pub description: &'static str,
}

impl DataLayout {
    pub const WASM32: DataLayout = DataLayout {
        pointer_width: 32,
        description: "e-m:e-p:32:32-i64:64-n32:64-S128",
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Double,
    I1,
}

impl Type {
    pub fn name(self) -> &'static str {
        match self {
            Type::Double => "double",
            Type::I1 => "i1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Const(f64),
    Param(u32),
    Inst(InstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    FAdd,
    FSub,
    FMul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FCmpPred {
    /// Unordered or less than.
    Ult,
    /// Ordered and not equal.
    One,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Binary { op: BinOp, lhs: Value, rhs: Value },
    FCmp { pred: FCmpPred, lhs: Value, rhs: Value },
    /// `i1` to `double`, yielding 0.0 or 1.0.
    UiToFp(Value),
    Call { callee: String, args: Vec<Value> },
    Phi { incoming: Vec<(Value, BlockId)> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub kind: InstKind,
    pub name: String,
    pub block: BlockId,
}

impl Inst {
    pub fn ty(&self) -> Type {
        match self.kind {
            InstKind::FCmp { .. } => Type::I1,
            _ => Type::Double,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstKind::Phi { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        then_dest: BlockId,
        else_dest: BlockId,
    },
    Ret(Value),
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Terminator::Br(dest) => vec![dest],
            Terminator::CondBr {
                then_dest,
                else_dest,
                ..
            } => vec![then_dest, else_dest],
            Terminator::Ret(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
    pub terminator: Option<Terminator>,
}

/// A function definition, or a bare declaration when it has no blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
    insts: Vec<Inst>,
}

impl Function {
    pub fn declare(name: impl Into<String>, params: Vec<String>) -> Self {
        Function {
            name: name.into(),
            params,
            blocks: Vec::new(),
            layout: Vec::new(),
            insts: Vec::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Creates a block that is not yet part of the layout.
    pub fn create_block(&mut self, name: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.to_string(),
            insts: Vec::new(),
            terminator: None,
        });
        id
    }

    pub fn insert_block(&mut self, id: BlockId) {
        if !self.layout.contains(&id) {
            self.layout.push(id);
        }
    }

    pub fn append_block(&mut self, name: &str) -> BlockId {
        let id = self.create_block(name);
        self.insert_block(id);
        id
    }

    pub fn push(&mut self, block: BlockId, kind: InstKind, name: &str) -> Value {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(Inst {
            kind,
            name: name.to_string(),
            block,
        });
        self.blocks[block.0 as usize].insts.push(id);
        Value::Inst(id)
    }

    /// Adds an incoming edge to a phi. Ignored for anything else.
    pub fn add_incoming(&mut self, phi: Value, value: Value, from: BlockId) {
        if let Value::Inst(id) = phi {
            if let Some(Inst {
                kind: InstKind::Phi { incoming },
                ..
            }) = self.insts.get_mut(id.0 as usize)
            {
                incoming.push((value, from));
            }
        }
    }

    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        self.blocks[block.0 as usize].terminator = Some(terminator);
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    pub fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn value_type(&self, value: Value) -> Type {
        match value {
            Value::Const(_) | Value::Param(_) => Type::Double,
            Value::Inst(id) => self.inst(id).ty(),
        }
    }

    pub fn predecessors(&self, id: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&pred| {
                self.block(pred)
                    .terminator
                    .is_some_and(|term| term.successors().contains(&id))
            })
            .collect()
    }

    /// Checks structural well-formedness against the module's
    /// declarations.
    pub fn verify(&self, module: &Module) -> Result<(), IrError> {
        if self.is_declaration() {
            return Ok(());
        }

        for (index, block) in self.blocks.iter().enumerate() {
            if !self.layout.contains(&BlockId(index as u32)) {
                return Err(IrError::DetachedBlock {
                    block: block.name.clone(),
                });
            }
        }

        for &id in &self.layout {
            let block = self.block(id);
            let Some(terminator) = block.terminator else {
                return Err(IrError::MissingTerminator {
                    block: block.name.clone(),
                });
            };
            if terminator
                .successors()
                .iter()
                .any(|dest| !self.layout.contains(dest))
            {
                return Err(IrError::DanglingBranch);
            }

            let mut seen_non_phi = false;
            for &inst_id in &block.insts {
                let inst = self.inst(inst_id);
                if inst.is_phi() {
                    if seen_non_phi {
                        return Err(IrError::MisplacedPhi {
                            block: block.name.clone(),
                        });
                    }
                    self.verify_phi(id, inst)?;
                } else {
                    seen_non_phi = true;
                    self.verify_inst(inst, module)?;
                }
            }

            match terminator {
                Terminator::CondBr { cond, .. } => self.expect_operand(cond, Type::I1)?,
                Terminator::Ret(value) => self.expect_operand(value, Type::Double)?,
                Terminator::Br(_) => {}
            }
        }
        Ok(())
    }

    fn verify_phi(&self, block: BlockId, inst: &Inst) -> Result<(), IrError> {
        let InstKind::Phi { incoming } = &inst.kind else {
            return Ok(());
        };
        let preds: HashSet<BlockId> = self.predecessors(block).into_iter().collect();
        let sources: HashSet<BlockId> = incoming.iter().map(|(_, from)| *from).collect();
        if incoming.len() != preds.len() || sources != preds {
            return Err(IrError::PhiPredecessorMismatch {
                block: self.block(block).name.clone(),
            });
        }
        for (value, _) in incoming {
            self.expect_operand(*value, Type::Double)?;
        }
        Ok(())
    }

    fn verify_inst(&self, inst: &Inst, module: &Module) -> Result<(), IrError> {
        match &inst.kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::FCmp { lhs, rhs, .. } => {
                self.expect_operand(*lhs, Type::Double)?;
                self.expect_operand(*rhs, Type::Double)
            }
            InstKind::UiToFp(value) => self.expect_operand(*value, Type::I1),
            InstKind::Call { callee, args } => {
                let decl = module
                    .get_function(callee)
                    .ok_or_else(|| IrError::UndeclaredCallee(callee.clone()))?;
                if decl.arity() != args.len() {
                    return Err(IrError::CallArity {
                        name: callee.clone(),
                        expected: decl.arity(),
                        found: args.len(),
                    });
                }
                args.iter()
                    .try_for_each(|arg| self.expect_operand(*arg, Type::Double))
            }
            InstKind::Phi { .. } => Ok(()),
        }
    }

    fn expect_operand(&self, value: Value, expected: Type) -> Result<(), IrError> {
        match value {
            Value::Param(index) if index as usize >= self.params.len() => {
                return Err(IrError::ParameterOutOfRange(index));
            }
            Value::Inst(id) if id.0 as usize >= self.insts.len() => {
                return Err(IrError::UnplacedValue(id.0));
            }
            _ => {}
        }
        let found = self.value_type(value);
        if found != expected {
            return Err(IrError::TypeMismatch {
                expected: expected.name(),
                found: found.name(),
            });
        }
        Ok(())
    }

    fn block_label(&self, id: BlockId) -> String {
        if id.0 == 0 {
            self.block(id).name.clone()
        } else {
            format!("{}{}", self.block(id).name, id.0)
        }
    }

    fn value_text(&self, value: Value) -> String {
        match value {
            Value::Const(number) => format!("{number:?}"),
            Value::Param(index) => match self.params.get(index as usize) {
                Some(name) => format!("%{name}"),
                None => format!("%arg{index}"),
            },
            Value::Inst(id) => format!("%{}{}", self.inst(id).name, id.0),
        }
    }

    fn signature_text(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|param| format!("double %{param}"))
            .collect();
        format!("double @{}({})", self.name, params.join(", "))
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_declaration() {
            return writeln!(f, "declare {}", self.signature_text());
        }

        writeln!(f, "define {} {{", self.signature_text())?;
        for (position, &id) in self.layout.iter().enumerate() {
            if position > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", self.block_label(id))?;
            let block = self.block(id);
            for &inst_id in &block.insts {
                let inst = self.inst(inst_id);
                let value = self.value_text(Value::Inst(inst_id));
                let text = match &inst.kind {
                    InstKind::Binary { op, lhs, rhs } => {
                        let mnemonic = match op {
                            BinOp::FAdd => "fadd",
                            BinOp::FSub => "fsub",
                            BinOp::FMul => "fmul",
                        };
                        format!(
                            "{mnemonic} double {}, {}",
                            self.value_text(*lhs),
                            self.value_text(*rhs)
                        )
                    }
                    InstKind::FCmp { pred, lhs, rhs } => {
                        let pred = match pred {
                            FCmpPred::Ult => "ult",
                            FCmpPred::One => "one",
                        };
                        format!(
                            "fcmp {pred} double {}, {}",
                            self.value_text(*lhs),
                            self.value_text(*rhs)
                        )
                    }
                    InstKind::UiToFp(operand) => {
                        format!("uitofp i1 {} to double", self.value_text(*operand))
                    }
                    InstKind::Call { callee, args } => {
                        let args: Vec<String> = args
                            .iter()
                            .map(|arg| format!("double {}", self.value_text(*arg)))
                            .collect();
                        format!("call double @{callee}({})", args.join(", "))
                    }
                    InstKind::Phi { incoming } => {
                        let edges: Vec<String> = incoming
                            .iter()
                            .map(|(value, from)| {
                                format!("[ {}, %{} ]", self.value_text(*value), self.block_label(*from))
                            })
                            .collect();
                        format!("phi double {}", edges.join(", "))
                    }
                };
                writeln!(f, "  {value} = {text}")?;
            }
            match block.terminator {
                Some(Terminator::Br(dest)) => writeln!(f, "  br label %{}", self.block_label(dest))?,
                Some(Terminator::CondBr {
                    cond,
                    then_dest,
                    else_dest,
                }) => writeln!(
                    f,
                    "  br i1 {}, label %{}, label %{}",
                    self.value_text(cond),
                    self.block_label(then_dest),
                    self.block_label(else_dest)
                )?,
                Some(Terminator::Ret(value)) => {
                    writeln!(f, "  ret double {}", self.value_text(value))?
                }
                None => {}
            }
        }
        writeln!(f, "}}")
    }
}

/// One compilation unit's worth of IR.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub data_layout: DataLayout,
    functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>, data_layout: DataLayout) -> Self {
        Module {
            name: name.into(),
            data_layout,
            functions: Vec::new(),
        }
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|function| function.name == name)
    }

    pub fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|function| function.name == name)
    }

    pub fn function(&self, index: usize) -> &Function {
        &self.functions[index]
    }

    pub fn function_mut(&mut self, index: usize) -> &mut Function {
        &mut self.functions[index]
    }

    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    /// Removes a function entirely; used to roll back a failed definition.
    pub fn erase_function(&mut self, index: usize) -> Function {
        self.functions.remove(index)
    }

    /// Functions with a body.
    pub fn definitions(&self) -> impl Iterator<Item = &Function> {
        self.functions.iter().filter(|function| !function.is_declaration())
    }

    /// Declared functions that some definition actually calls.
    pub fn called_declarations(&self) -> Vec<&Function> {
        let called: HashSet<&str> = self
            .definitions()
            .flat_map(|function| function.insts().iter())
            .filter_map(|inst| match &inst.kind {
                InstKind::Call { callee, .. } => Some(callee.as_str()),
                _ => None,
            })
            .collect();
        self.functions
            .iter()
            .filter(|function| function.is_declaration() && called.contains(function.name.as_str()))
            .collect()
    }

    pub fn verify(&self) -> Result<(), IrError> {
        let mut names = HashSet::new();
        for function in &self.functions {
            if !names.insert(function.name.as_str()) {
                return Err(IrError::DuplicateFunction(function.name.clone()));
            }
        }
        self.functions
            .iter()
            .try_for_each(|function| function.verify(self))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        writeln!(f, "target datalayout = \"{}\"", self.data_layout.description)?;
        for function in &self.functions {
            writeln!(f)?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}

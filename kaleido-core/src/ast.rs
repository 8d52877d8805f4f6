//! Abstract syntax tree for Kaleido.
//!
//! Every node owns its children exclusively. A `Prototype` is a plain
//! value; anything that needs a signature later re-resolves it by name
//! through the session's prototype table.

/// Name given to the synthetic function wrapping a bare top-level
/// expression. Not a valid identifier, so user code cannot call it.
pub const ANONYMOUS_FUNCTION: &str = "__anon_expr";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        /// Defaults to `1.0` when absent.
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
}

impl Expr {
    pub fn binary(op: impl Into<String>, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op: op.into(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(callee: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Call {
            callee: callee.into(),
            args,
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Expr::Variable(name.into())
    }
}

/// A function signature: name plus ordered parameter names. Every
/// parameter and the result are `f64`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prototype {
    pub name: String,
    pub params: Vec<String>,
}

impl Prototype {
    pub fn new(name: impl Into<String>, params: Vec<String>) -> Self {
        Prototype {
            name: name.into(),
            params,
        }
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub proto: Prototype,
    pub body: Expr,
}

impl Function {
    /// Wraps a bare expression into the zero-argument anonymous function.
    pub fn anonymous(body: Expr) -> Self {
        Function {
            proto: Prototype::new(ANONYMOUS_FUNCTION, Vec::new()),
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.proto.name
    }

    pub fn is_anonymous(&self) -> bool {
        self.proto.name == ANONYMOUS_FUNCTION
    }
}

/// One top-level form.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Extern(Prototype),
    Function(Function),
}

//! Host runtime library.
//!
//! Functions listed here can be called after a matching `extern`
//! declaration without any Kaleido definition. This module only
//! describes them; the execution engine turns each descriptor into a
//! host function and links it into units that import the name.

/// What a builtin computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinKind {
    Sin,
    Cos,
    Tan,
    Sqrt,
    Exp,
    Log,
    Fabs,
    Floor,
    Pow,
    /// Writes the argument, truncated to a byte, to the output buffer.
    PutChar,
    /// Writes the argument as `%f` plus a newline to the output buffer.
    PrintDouble,
}

impl BuiltinKind {
    /// Evaluates a pure math builtin. Output builtins return `None`.
    pub fn eval(self, args: &[f64]) -> Option<f64> {
        let x = args.first().copied().unwrap_or_default();
        let value = match self {
            BuiltinKind::Sin => x.sin(),
            BuiltinKind::Cos => x.cos(),
            BuiltinKind::Tan => x.tan(),
            BuiltinKind::Sqrt => x.sqrt(),
            BuiltinKind::Exp => x.exp(),
            BuiltinKind::Log => x.ln(),
            BuiltinKind::Fabs => x.abs(),
            BuiltinKind::Floor => x.floor(),
            BuiltinKind::Pow => x.powf(args.get(1).copied().unwrap_or_default()),
            BuiltinKind::PutChar | BuiltinKind::PrintDouble => return None,
        };
        Some(value)
    }

    /// Bytes an output builtin writes for `value`.
    pub fn render(self, value: f64) -> Vec<u8> {
        match self {
            BuiltinKind::PutChar => vec![value as u8],
            BuiltinKind::PrintDouble => format!("{value:.6}\n").into_bytes(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinDescriptor {
    /// Name as written in an `extern` declaration.
    pub name: &'static str,
    pub arity: usize,
    pub kind: BuiltinKind,
}

pub const BUILTINS: &[BuiltinDescriptor] = &[
    BuiltinDescriptor {
        name: "sin",
        arity: 1,
        kind: BuiltinKind::Sin,
    },
    BuiltinDescriptor {
        name: "cos",
        arity: 1,
        kind: BuiltinKind::Cos,
    },
    BuiltinDescriptor {
        name: "tan",
        arity: 1,
        kind: BuiltinKind::Tan,
    },
    BuiltinDescriptor {
        name: "sqrt",
        arity: 1,
        kind: BuiltinKind::Sqrt,
    },
    BuiltinDescriptor {
        name: "exp",
        arity: 1,
        kind: BuiltinKind::Exp,
    },
    BuiltinDescriptor {
        name: "log",
        arity: 1,
        kind: BuiltinKind::Log,
    },
    BuiltinDescriptor {
        name: "fabs",
        arity: 1,
        kind: BuiltinKind::Fabs,
    },
    BuiltinDescriptor {
        name: "floor",
        arity: 1,
        kind: BuiltinKind::Floor,
    },
    BuiltinDescriptor {
        name: "pow",
        arity: 2,
        kind: BuiltinKind::Pow,
    },
    BuiltinDescriptor {
        name: "putchard",
        arity: 1,
        kind: BuiltinKind::PutChar,
    },
    BuiltinDescriptor {
        name: "printd",
        arity: 1,
        kind: BuiltinKind::PrintDouble,
    },
];

/// Look up a builtin by its extern name.
///
/// The search is linear because the table is small.
pub fn find_builtin(name: &str) -> Option<&'static BuiltinDescriptor> {
    BUILTINS.iter().find(|builtin| builtin.name == name)
}

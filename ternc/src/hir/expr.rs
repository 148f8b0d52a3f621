//! HIR expressions.
//!
//! Expressions live in a per-module [`ExprArena`] and are referenced by
//! [`ExprId`]. Ids are stable: every analysis result (sites, temporaries,
//! owners) is keyed by them.

use super::{DefId, SymbolId, TypeId};
use crate::span::Span;
use std::fmt;

/// Stable identity of an expression node within a module.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

impl fmt::Debug for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExprId({})", self.0)
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// A literal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Literal {
    Unit,
    Bool(bool),
    Int(i32),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Short-circuit conjunction.
    And,
    /// Short-circuit disjunction.
    Or,
}

impl BinOp {
    pub fn is_short_circuit(self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

/// A pattern in a `let` or `match` arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Wildcard,
    Bind(SymbolId),
    Literal(Literal),
    Tuple(Vec<Pattern>),
}

impl Pattern {
    /// Every symbol this pattern binds, in left-to-right order.
    pub fn bindings(&self) -> Vec<SymbolId> {
        let mut out = Vec::new();
        self.collect_bindings(&mut out);
        out
    }

    fn collect_bindings(&self, out: &mut Vec<SymbolId>) {
        match self {
            Pattern::Bind(sym) => out.push(*sym),
            Pattern::Tuple(items) => items.iter().for_each(|p| p.collect_bindings(out)),
            Pattern::Wildcard | Pattern::Literal(_) => {}
        }
    }

    /// Whether the pattern matches every value.
    pub fn is_irrefutable(&self) -> bool {
        match self {
            Pattern::Wildcard | Pattern::Bind(_) => true,
            Pattern::Literal(_) => false,
            Pattern::Tuple(items) => items.iter().all(Pattern::is_irrefutable),
        }
    }
}

/// A statement inside a block.
#[derive(Debug, Clone)]
pub enum Stmt {
    Let { pattern: Pattern, init: ExprId },
    Expr(ExprId),
}

/// The target of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// A statically known function, or an effect for `perform` calls.
    Def(DefId),
    /// A computed callee (closure value).
    Expr(ExprId),
}

#[derive(Debug, Clone)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub guard: Option<ExprId>,
    pub body: ExprId,
}

/// One clause of a handle construct.
#[derive(Debug, Clone)]
pub struct HandlerClause {
    pub effect: DefId,
    /// Declaration position of the operation within the effect.
    pub op: u32,
    /// Bindings for the operation's positional arguments.
    pub params: Vec<SymbolId>,
    /// The resumption binding, if the clause accepts one.
    pub resume: Option<SymbolId>,
    pub body: ExprId,
    pub span: Span,
}

/// The kind of expression.
#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Local(SymbolId),
    Block {
        stmts: Vec<Stmt>,
        tail: Option<ExprId>,
    },
    Assign {
        target: SymbolId,
        value: ExprId,
    },
    If {
        cond: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
    },
    Match {
        scrutinee: ExprId,
        arms: Vec<MatchArm>,
    },
    While {
        cond: ExprId,
        body: ExprId,
    },
    Loop {
        body: ExprId,
    },
    Break {
        value: Option<ExprId>,
    },
    Continue,
    Return {
        value: Option<ExprId>,
    },
    Tuple(Vec<ExprId>),
    /// A call. Whether it performs, calls something effectful, or is pure
    /// is a typing fact looked up in [`CallFacts`](super::CallFacts).
    Call {
        callee: Callee,
        args: Vec<ExprId>,
    },
    Binary {
        op: BinOp,
        lhs: ExprId,
        rhs: ExprId,
    },
    Unary {
        op: UnOp,
        operand: ExprId,
    },
    /// A closure. `ty` is its function type; the effect row selects the
    /// calling convention.
    Lambda {
        params: Vec<SymbolId>,
        body: ExprId,
        ty: TypeId,
    },
    Handle {
        body: ExprId,
        clauses: Vec<HandlerClause>,
        finally: Option<ExprId>,
    },
    /// `resume(value)` inside a `Resume`-kind clause.
    Resume {
        binding: SymbolId,
        value: Option<ExprId>,
    },
    /// `tail(value)` inside a `Tail`-kind clause.
    TailResume {
        binding: SymbolId,
        value: Option<ExprId>,
    },
    /// An object literal of a structural type. Fields may appear in any
    /// order; they are evaluated in source order.
    Object {
        ty: TypeId,
        fields: Vec<(String, ExprId)>,
    },
    /// Field access on a value of structural type `ty`.
    Field {
        base: ExprId,
        ty: TypeId,
        name: String,
    },
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

/// Arena of all expressions of one module.
#[derive(Debug, Clone, Default)]
pub struct ExprArena {
    exprs: Vec<Expr>,
}

impl ExprArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, kind: ExprKind, span: Span) -> ExprId {
        let id = ExprId(self.exprs.len() as u32);
        self.exprs.push(Expr { kind, span });
        id
    }

    pub fn get(&self, id: ExprId) -> Option<&Expr> {
        self.exprs.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_bindings_in_order() {
        let pat = Pattern::Tuple(vec![
            Pattern::Bind(SymbolId::new(2)),
            Pattern::Wildcard,
            Pattern::Tuple(vec![Pattern::Bind(SymbolId::new(0))]),
        ]);
        assert_eq!(pat.bindings(), vec![SymbolId::new(2), SymbolId::new(0)]);
        assert!(pat.is_irrefutable());
        assert!(!Pattern::Tuple(vec![Pattern::Literal(Literal::Int(1))]).is_irrefutable());
    }
}

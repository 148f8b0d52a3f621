//! High-level Intermediate Representation (HIR) consumed by the back end.
//!
//! Parsing, name resolution and type inference are done by the front end.
//! This crate receives their result through this module:
//!
//! 1. **Typed signatures** - function types with parameter, return and
//!    effect-row types, interned in a program-wide [`TypeTable`]
//! 2. **A symbol table** - every local and parameter as a [`SymbolId`]
//! 3. **An expression graph** - statements, expressions and patterns with
//!    stable [`ExprId`] identities
//! 4. **Call facts** - the typing layer's classification of each call as
//!    pure, a `perform`, or an effectful call
//!
//! # HIR Structure
//!
//! - [`Program`] - every module plus the shared type table
//! - [`Module`] - items, expressions, symbols and facts of one module
//! - [`Item`] - functions and effect declarations
//!
//! Every lookup helper returns a fatal [`CompileError`] when a fact is
//! missing: the front end is expected to hand over a complete graph.

pub mod build;
pub mod def;
pub mod expr;
pub mod item;
pub mod ty;

pub use def::{DefId, SymbolId};
pub use expr::{
    BinOp, Callee, Expr, ExprArena, ExprId, ExprKind, HandlerClause, Literal, MatchArm, Pattern,
    Stmt, UnOp,
};
pub use item::{EffectDecl, FnDecl, Item, OpDecl, Param, Visibility};
pub use ty::{FieldTy, NominalDef, PrimitiveTy, TypeId, TypeKind, TypeParamId, TypeTable};

use crate::diagnostics::ErrorCode;
use crate::error::{CompileError, CompileResult};
use crate::span::Span;
use std::collections::HashMap;

/// The typing layer's classification of a call expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallKind {
    /// A call to a function with an empty effect row.
    Pure,
    /// Direct invocation of an effect operation, with the type arguments
    /// that instantiate the effect's and the operation's type parameters
    /// (effect parameters first).
    Perform {
        effect: DefId,
        op: u32,
        type_args: Vec<TypeId>,
    },
    /// A call to a function with a non-empty effect row.
    Effectful,
}

impl CallKind {
    /// Whether the call can suspend.
    pub fn is_site(&self) -> bool {
        !matches!(self, CallKind::Pure)
    }
}

/// Call classifications keyed by call expression.
#[derive(Debug, Clone, Default)]
pub struct CallFacts {
    kinds: HashMap<ExprId, CallKind>,
}

impl CallFacts {
    pub fn insert(&mut self, call: ExprId, kind: CallKind) {
        self.kinds.insert(call, kind);
    }

    pub fn get(&self, call: ExprId) -> Option<&CallKind> {
        self.kinds.get(&call)
    }

    /// Every perform fact, sorted by call expression for determinism.
    pub fn performs(&self) -> Vec<(ExprId, DefId, u32, &[TypeId])> {
        let mut out: Vec<_> = self
            .kinds
            .iter()
            .filter_map(|(expr, kind)| match kind {
                CallKind::Perform {
                    effect,
                    op,
                    type_args,
                } => Some((*expr, *effect, *op, type_args.as_slice())),
                _ => None,
            })
            .collect();
        out.sort_by_key(|(expr, ..)| *expr);
        out
    }
}

/// Names of the symbols of one module, indexed by [`SymbolId`].
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    names: Vec<String>,
}

impl SymbolTable {
    pub fn declare(&mut self, name: impl Into<String>) -> SymbolId {
        let id = SymbolId::new(self.names.len() as u32);
        self.names.push(name.into());
        id
    }

    pub fn name(&self, sym: SymbolId) -> Option<&str> {
        self.names.get(sym.index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One compiled module.
#[derive(Debug, Clone)]
pub struct Module {
    pub package: String,
    pub name: String,
    pub items: Vec<Item>,
    pub exprs: ExprArena,
    pub symbols: SymbolTable,
    pub facts: CallFacts,
}

impl Module {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
            items: Vec::new(),
            exprs: ExprArena::new(),
            symbols: SymbolTable::default(),
            facts: CallFacts::default(),
        }
    }

    /// `package/module`, the prefix of fallback effect ids and owner names.
    pub fn path(&self) -> String {
        format!("{}/{}", self.package, self.name)
    }

    pub fn expr(&self, id: ExprId) -> CompileResult<&Expr> {
        self.exprs.get(id).ok_or_else(|| {
            CompileError::new(
                ErrorCode::MissingNode,
                format!("expression {id} is missing from module {}", self.path()),
                Span::dummy(),
            )
        })
    }

    pub fn call_kind(&self, call: ExprId) -> CompileResult<&CallKind> {
        match self.facts.get(call) {
            Some(kind) => Ok(kind),
            None => Err(CompileError::new(
                ErrorCode::MissingCallFact,
                format!("call {call} has no effect classification"),
                self.exprs.get(call).map(|e| e.span).unwrap_or_default(),
            )),
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &FnDecl> {
        self.items.iter().filter_map(Item::as_fn)
    }

    pub fn effects(&self) -> impl Iterator<Item = &EffectDecl> {
        self.items.iter().filter_map(Item::as_effect)
    }
}

/// The whole program handed to the back end.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub modules: Vec<Module>,
    pub types: TypeTable,
}

impl Program {
    pub fn ty(&self, id: TypeId) -> CompileResult<&TypeKind> {
        self.types.get(id).ok_or_else(|| {
            CompileError::new(
                ErrorCode::MissingType,
                format!("type {id:?} has no descriptor"),
                Span::dummy(),
            )
        })
    }

    /// Find a function declaration anywhere in the program.
    pub fn function(&self, def: DefId) -> Option<(&Module, &FnDecl)> {
        self.modules
            .iter()
            .find_map(|m| m.functions().find(|f| f.def == def).map(|f| (m, f)))
    }

    /// Find an effect declaration anywhere in the program.
    pub fn effect(&self, def: DefId) -> Option<(&Module, &EffectDecl)> {
        self.modules
            .iter()
            .find_map(|m| m.effects().find(|e| e.def == def).map(|e| (m, e)))
    }

    /// Whether a function type uses the effectful (outcome-returning)
    /// convention.
    pub fn is_effectful(&self, signature: TypeId) -> CompileResult<bool> {
        match self.ty(signature)? {
            TypeKind::Function { effects, .. } => Ok(!effects.is_empty()),
            other => Err(CompileError::new(
                ErrorCode::MissingType,
                format!("expected a function type, found {other:?}"),
                Span::dummy(),
            )),
        }
    }
}

//! HIR items: functions and effect declarations.

use super::{DefId, ExprId, SymbolId, TypeId, TypeParamId};
use crate::span::Span;
use tern_abi::ResumeKind;

/// Item visibility, as decided by the (out of scope) visibility checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Visibility {
    #[default]
    Private,
    /// Visible to other modules of the same package.
    Package,
    Public,
}

impl Visibility {
    /// Whether the item can be seen outside its own module.
    pub fn is_package_visible(self) -> bool {
        !matches!(self, Visibility::Private)
    }
}

/// A function parameter.
#[derive(Debug, Clone)]
pub struct Param {
    pub symbol: SymbolId,
    pub ty: TypeId,
}

/// A function declaration.
#[derive(Debug, Clone)]
pub struct FnDecl {
    pub def: DefId,
    pub name: String,
    pub params: Vec<Param>,
    /// The function type (parameters, return type, effect row).
    pub signature: TypeId,
    pub body: ExprId,
    /// Whether the artifact exports an entry point for this function.
    pub exported: bool,
    pub span: Span,
}

/// An operation of an effect.
#[derive(Debug, Clone)]
pub struct OpDecl {
    pub name: String,
    pub type_params: Vec<TypeParamId>,
    pub params: Vec<TypeId>,
    pub ret: TypeId,
    pub resume_kind: ResumeKind,
}

impl OpDecl {
    pub fn is_generic(&self) -> bool {
        !self.type_params.is_empty()
    }
}

/// An effect declaration. The op id of an operation is its index in `ops`.
#[derive(Debug, Clone)]
pub struct EffectDecl {
    pub def: DefId,
    pub name: String,
    /// An explicit, build-stable identifier string.
    pub explicit_id: Option<String>,
    pub visibility: Visibility,
    pub type_params: Vec<TypeParamId>,
    pub ops: Vec<OpDecl>,
    pub span: Span,
}

/// A top-level item.
#[derive(Debug, Clone)]
pub enum Item {
    Fn(FnDecl),
    Effect(EffectDecl),
}

impl Item {
    pub fn def(&self) -> DefId {
        match self {
            Item::Fn(f) => f.def,
            Item::Effect(e) => e.def,
        }
    }

    pub fn as_fn(&self) -> Option<&FnDecl> {
        match self {
            Item::Fn(f) => Some(f),
            Item::Effect(_) => None,
        }
    }

    pub fn as_effect(&self) -> Option<&EffectDecl> {
        match self {
            Item::Effect(e) => Some(e),
            Item::Fn(_) => None,
        }
    }
}

//! Definition identifiers for HIR.
//!
//! Two kinds of identifiers reach this crate from name resolution:
//! - [`DefId`] - program-wide identifier for items (functions, effects, nominal types)
//! - [`SymbolId`] - module-wide identifier for local variables and parameters

use std::fmt;

/// A program-wide identifier for a definition.
///
/// DefIds are assigned by the front end and stay stable through
/// compilation. They are unique across every module of a [`Program`].
///
/// [`Program`]: super::Program
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefId {
    pub index: u32,
}

impl DefId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefId({})", self.index)
    }
}

impl fmt::Display for DefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "def{}", self.index)
    }
}

/// A local variable or parameter, unique within one module.
///
/// Liveness sets are sets of symbols, so the symbol count of a module
/// bounds every fixed-point iteration over them.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId {
    pub index: u32,
}

impl SymbolId {
    pub const fn new(index: u32) -> Self {
        Self { index }
    }

    pub const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({})", self.index)
    }
}

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.index)
    }
}

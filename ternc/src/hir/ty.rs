//! Type descriptors consumed from the typing layer.
//!
//! Types are interned in one [`TypeTable`] shared by every module of a
//! program, so structurally equal descriptors get equal [`TypeId`]s and
//! signature hashes computed in different modules agree.
//!
//! Nothing here performs inference. The compiler only reads types to hash
//! operation signatures, to find the effect row of a function, and to
//! order the fields of structural objects.

use super::DefId;
use std::collections::HashMap;
use std::fmt;

/// An interned type descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeId({})", self.0)
    }
}

/// A generic type parameter, unique across the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeParamId(pub u32);

/// Primitive types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTy {
    Unit,
    Bool,
    /// 32-bit signed integer.
    Int,
    Float,
    Str,
}

impl PrimitiveTy {
    /// Stable tag used in signature hashing.
    pub fn hash_tag(self) -> u8 {
        match self {
            PrimitiveTy::Unit => 0,
            PrimitiveTy::Bool => 1,
            PrimitiveTy::Int => 2,
            PrimitiveTy::Float => 3,
            PrimitiveTy::Str => 4,
        }
    }
}

/// A structural field: name and type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldTy {
    pub name: String,
    pub ty: TypeId,
}

/// The shape of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Primitive(PrimitiveTy),
    /// A named type; its definition lives in [`TypeTable::nominal`].
    Nominal { def: DefId, args: Vec<TypeId> },
    /// An anonymous record. Field order is the runtime slot order.
    Structural { fields: Vec<FieldTy> },
    /// A function type with its effect row. An empty row means the
    /// function is pure and uses the value-returning convention.
    Function {
        params: Vec<TypeId>,
        ret: TypeId,
        effects: Vec<DefId>,
    },
    Union(Vec<TypeId>),
    Intersection(Vec<TypeId>),
    FixedArray { elem: TypeId, len: u32 },
    Param(TypeParamId),
}

/// Definition of a nominal type.
#[derive(Debug, Clone)]
pub struct NominalDef {
    pub def: DefId,
    pub name: String,
    pub params: Vec<TypeParamId>,
    /// The underlying descriptor, which may refer back to `def`.
    pub body: TypeId,
}

/// Program-wide type arena.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    kinds: Vec<TypeKind>,
    interned: HashMap<TypeKind, TypeId>,
    nominals: HashMap<DefId, NominalDef>,
}

impl TypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a descriptor, returning the existing id for an equal one.
    pub fn intern(&mut self, kind: TypeKind) -> TypeId {
        if let Some(&id) = self.interned.get(&kind) {
            return id;
        }
        let id = TypeId(self.kinds.len() as u32);
        self.kinds.push(kind.clone());
        self.interned.insert(kind, id);
        id
    }

    pub fn get(&self, id: TypeId) -> Option<&TypeKind> {
        self.kinds.get(id.0 as usize)
    }

    pub fn define_nominal(&mut self, nominal: NominalDef) {
        self.nominals.insert(nominal.def, nominal);
    }

    pub fn nominal(&self, def: DefId) -> Option<&NominalDef> {
        self.nominals.get(&def)
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    // Shorthands used by front ends and tests.

    pub fn primitive(&mut self, prim: PrimitiveTy) -> TypeId {
        self.intern(TypeKind::Primitive(prim))
    }

    pub fn int(&mut self) -> TypeId {
        self.primitive(PrimitiveTy::Int)
    }

    pub fn bool(&mut self) -> TypeId {
        self.primitive(PrimitiveTy::Bool)
    }

    pub fn unit(&mut self) -> TypeId {
        self.primitive(PrimitiveTy::Unit)
    }

    pub fn function(&mut self, params: Vec<TypeId>, ret: TypeId, effects: Vec<DefId>) -> TypeId {
        self.intern(TypeKind::Function {
            params,
            ret,
            effects,
        })
    }

    pub fn structural(&mut self, fields: &[(&str, TypeId)]) -> TypeId {
        self.intern(TypeKind::Structural {
            fields: fields
                .iter()
                .map(|(name, ty)| FieldTy {
                    name: (*name).to_string(),
                    ty: *ty,
                })
                .collect(),
        })
    }

    pub fn param(&mut self, param: TypeParamId) -> TypeId {
        self.intern(TypeKind::Param(param))
    }

    /// The effect row of a function type, or `None` for non-function types.
    pub fn effect_row(&self, id: TypeId) -> Option<&[DefId]> {
        match self.get(id)? {
            TypeKind::Function { effects, .. } => Some(effects),
            _ => None,
        }
    }

    /// Slot index of a named field of a structural type.
    pub fn field_index(&self, id: TypeId, name: &str) -> Option<u32> {
        match self.get(id)? {
            TypeKind::Structural { fields } => {
                fields.iter().position(|f| f.name == name).map(|i| i as u32)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let mut types = TypeTable::new();
        let a = types.int();
        let b = types.int();
        assert_eq!(a, b);
        let f1 = types.function(vec![a], a, vec![]);
        let f2 = types.function(vec![b], b, vec![]);
        assert_eq!(f1, f2);
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn test_field_index_follows_declaration_order() {
        let mut types = TypeTable::new();
        let int = types.int();
        let b = types.bool();
        let point = types.structural(&[("y", int), ("x", int), ("ok", b)]);
        assert_eq!(types.field_index(point, "x"), Some(1));
        assert_eq!(types.field_index(point, "z"), None);
        assert_eq!(types.field_index(int, "x"), None);
    }
}

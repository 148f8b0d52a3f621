//! Structural signature hashing for effect operations.
//!
//! Two instantiations of the same operation are distinct table entries
//! exactly when their substituted parameter and return types differ. The
//! hash is computed over type *structure*, never over [`TypeId`]s, so it
//! agrees across modules and builds:
//!
//! - nominal types hash their name, arguments and expanded body
//! - structural types hash field names and field types in order
//! - union and intersection members are order-insensitive (member hashes
//!   are sorted before combining)
//! - function types hash parameters, return type and the effect ids of
//!   their row (sorted)
//!
//! A nominal type that refers back to itself while being expanded hashes
//! a recursion marker carrying the distance to the enclosing expansion,
//! so `List<T> = (T, List<T>)` terminates and equal recursive shapes still
//! hash equal.

use std::collections::HashMap;

use tern_abi::{EffectId, Fnv1a};

use super::registry::effect_identity;
use crate::diagnostics::ErrorCode;
use crate::error::{CompileError, CompileResult};
use crate::hir::{DefId, OpDecl, Program, TypeId, TypeKind, TypeParamId};
use crate::span::Span;

/// Bound on substitution depth. Only a malformed substitution that maps
/// a parameter to a type containing itself can reach it.
const MAX_DEPTH: usize = 512;

mod tag {
    pub const PRIMITIVE: u8 = 1;
    pub const NOMINAL: u8 = 2;
    pub const STRUCTURAL: u8 = 3;
    pub const FUNCTION: u8 = 4;
    pub const UNION: u8 = 5;
    pub const INTERSECTION: u8 = 6;
    pub const FIXED_ARRAY: u8 = 7;
    pub const PARAM: u8 = 8;
    pub const RECURSION: u8 = 0xff;
}

/// Hashes type structure under a type-parameter substitution.
pub struct SignatureHasher<'p> {
    program: &'p Program,
    subst: HashMap<TypeParamId, TypeId>,
    expanding: Vec<DefId>,
    depth: usize,
}

impl<'p> SignatureHasher<'p> {
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            subst: HashMap::new(),
            expanding: Vec::new(),
            depth: 0,
        }
    }

    /// Substitute `args` for `params` pairwise.
    pub fn with_substitution(mut self, params: &[TypeParamId], args: &[TypeId]) -> Self {
        self.subst
            .extend(params.iter().copied().zip(args.iter().copied()));
        self
    }

    /// The 32-bit signature hash of an operation: arity, parameters, return.
    pub fn op_signature(&mut self, op: &OpDecl) -> CompileResult<u32> {
        let mut h = Fnv1a::new();
        h.update_u32(op.params.len() as u32);
        for &param in &op.params {
            h.update_u64(self.hash_type(param)?);
        }
        h.update_u64(self.hash_type(op.ret)?);
        Ok(h.finish_u32())
    }

    /// The 64-bit structural hash of one type.
    pub fn hash_type(&mut self, ty: TypeId) -> CompileResult<u64> {
        if self.depth >= MAX_DEPTH {
            return Err(crate::ice_err!(
                Span::dummy(),
                "type substitution does not terminate";
                "type" => ty
            ));
        }
        self.depth += 1;
        let result = self.hash_kind(ty);
        self.depth -= 1;
        result
    }

    fn hash_kind(&mut self, ty: TypeId) -> CompileResult<u64> {
        let program = self.program;
        let mut h = Fnv1a::new();
        match program.ty(ty)? {
            TypeKind::Primitive(prim) => {
                h.update_u8(tag::PRIMITIVE);
                h.update_u8(prim.hash_tag());
            }
            TypeKind::Nominal { def, args } => {
                if let Some(pos) = self.expanding.iter().rposition(|d| d == def) {
                    h.update_u8(tag::RECURSION);
                    h.update_u32((self.expanding.len() - pos) as u32);
                    return Ok(h.finish());
                }
                let nominal = program.types.nominal(*def).ok_or_else(|| {
                    CompileError::new(
                        ErrorCode::MissingType,
                        format!("nominal type {def} has no definition"),
                        Span::dummy(),
                    )
                })?;
                h.update_u8(tag::NOMINAL);
                h.update_str(&nominal.name);
                h.update_u32(args.len() as u32);
                for &arg in args {
                    h.update_u64(self.hash_type(arg)?);
                }

                // Expand the body with the nominal's own parameters bound.
                let saved: Vec<_> = nominal
                    .params
                    .iter()
                    .map(|p| (*p, self.subst.get(p).copied()))
                    .collect();
                for (param, arg) in nominal.params.iter().zip(args) {
                    self.subst.insert(*param, *arg);
                }
                self.expanding.push(*def);
                let body = self.hash_type(nominal.body);
                self.expanding.pop();
                for (param, previous) in saved {
                    match previous {
                        Some(prev) => self.subst.insert(param, prev),
                        None => self.subst.remove(&param),
                    };
                }
                h.update_u64(body?);
            }
            TypeKind::Structural { fields } => {
                h.update_u8(tag::STRUCTURAL);
                h.update_u32(fields.len() as u32);
                for field in fields {
                    h.update_str(&field.name);
                    h.update_u64(self.hash_type(field.ty)?);
                }
            }
            TypeKind::Function {
                params,
                ret,
                effects,
            } => {
                h.update_u8(tag::FUNCTION);
                h.update_u32(params.len() as u32);
                for &param in params {
                    h.update_u64(self.hash_type(param)?);
                }
                h.update_u64(self.hash_type(*ret)?);
                let mut ids = effects
                    .iter()
                    .map(|&effect| effect_identity(program, effect).map(|(id, _)| id))
                    .collect::<CompileResult<Vec<EffectId>>>()?;
                ids.sort();
                ids.dedup();
                h.update_u32(ids.len() as u32);
                for id in ids {
                    h.update_u64(id.raw());
                }
            }
            TypeKind::Union(members) => {
                h.update_u8(tag::UNION);
                self.hash_members(&mut h, members)?;
            }
            TypeKind::Intersection(members) => {
                h.update_u8(tag::INTERSECTION);
                self.hash_members(&mut h, members)?;
            }
            TypeKind::FixedArray { elem, len } => {
                h.update_u8(tag::FIXED_ARRAY);
                h.update_u64(self.hash_type(*elem)?);
                h.update_u32(*len);
            }
            TypeKind::Param(param) => match self.subst.get(param).copied() {
                Some(arg) => return self.hash_type(arg),
                None => {
                    h.update_u8(tag::PARAM);
                    h.update_u32(param.0);
                }
            },
        }
        Ok(h.finish())
    }

    fn hash_members(&mut self, h: &mut Fnv1a, members: &[TypeId]) -> CompileResult<()> {
        let mut hashes = members
            .iter()
            .map(|&m| self.hash_type(m))
            .collect::<CompileResult<Vec<_>>>()?;
        hashes.sort_unstable();
        hashes.dedup();
        h.update_u32(hashes.len() as u32);
        for hash in hashes {
            h.update_u64(hash);
        }
        Ok(())
    }
}

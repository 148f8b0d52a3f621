//! Effect identity registry.
//!
//! The registry is an explicit build artifact threaded through the
//! compilation of every module and finalized once:
//!
//! ```text
//! EffectRegistry::new()
//!     -> register_module(m1) -> register_module(m2) -> ...
//!     -> finalize() -> FinalRegistry (immutable, dense op indices)
//! ```
//!
//! Each effect gets a 64-bit FNV-1a hash of its identifier string: the
//! explicit id when one is declared, `package/module/Name` otherwise. Each
//! operation instantiation is keyed by `(effect hash, op id, signature
//! hash)`. `finalize` sorts the deduplicated keys and numbers them
//! `0..N`, so indices depend only on the *set* of keys, never on the order
//! modules were registered in.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tern_abi::{EffectId, ResumeKind};
use tracing::{debug, trace};

use super::signature::SignatureHasher;
use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::error::{CompileError, CompileResult};
use crate::hir::{DefId, EffectDecl, ExprId, Module, OpDecl, Program, TypeId};
use crate::span::Span;

/// The sort key of one operation instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpKey {
    pub effect: EffectId,
    pub op_id: u32,
    pub signature_hash: u32,
}

/// A registered effect declaration.
#[derive(Debug, Clone)]
pub struct EffectInfo {
    pub def: DefId,
    pub id: EffectId,
    /// The identifier string the id was hashed from.
    pub label: String,
    pub ops: Vec<OpDecl>,
    pub span: Span,
}

impl EffectInfo {
    pub fn op(&self, op_id: u32) -> CompileResult<&OpDecl> {
        self.ops.get(op_id as usize).ok_or_else(|| {
            CompileError::new(
                ErrorCode::UnknownOperation,
                format!("effect `{}` has no operation #{op_id}", self.label),
                self.span,
            )
        })
    }
}

/// Compute an effect's id and label from its declaration.
pub fn effect_identity(program: &Program, def: DefId) -> CompileResult<(EffectId, String)> {
    let (module, decl) = program.effect(def).ok_or_else(|| {
        CompileError::new(
            ErrorCode::UnresolvedEffect,
            format!("{def} is not an effect declaration"),
            Span::dummy(),
        )
    })?;
    let label = identifier(module, decl);
    Ok((EffectId::from_identifier(&label), label))
}

fn identifier(module: &Module, decl: &EffectDecl) -> String {
    match &decl.explicit_id {
        Some(id) => id.clone(),
        None => format!("{}/{}", module.path(), decl.name),
    }
}

/// Resume kind and name of an operation, kept per table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OpMeta {
    resume_kind: ResumeKind,
    name: String,
}

/// Key of a `perform` instantiation before hashing.
type Instantiation = (DefId, u32, Vec<TypeId>);

/// Accumulates effect declarations and instantiations across modules.
#[derive(Debug, Default)]
pub struct EffectRegistry {
    effects: BTreeMap<DefId, EffectInfo>,
    /// Which declaration owns each effect id.
    owners: HashMap<EffectId, DefId>,
    ops: BTreeMap<OpKey, OpMeta>,
    instantiations: HashMap<Instantiation, OpKey>,
    warned: BTreeSet<DefId>,
    diagnostics: Vec<Diagnostic>,
    strict_ids: bool,
}

impl EffectRegistry {
    pub fn new(config: &CompilerConfig) -> Self {
        Self {
            strict_ids: config.strict_effect_ids,
            ..Self::default()
        }
    }

    /// Register one module's declarations and every `perform` it contains.
    ///
    /// Performs may name effects declared in other modules; those are
    /// registered on first use.
    pub fn register_module(&mut self, program: &Program, module: &Module) -> CompileResult<()> {
        debug!(module = %module.path(), "registering effects");
        for decl in module.effects() {
            self.register_effect(program, decl.def)?;
            let info = self.effect(decl.def)?.clone();
            if !decl.type_params.is_empty() {
                continue;
            }
            for (op_id, op) in info.ops.iter().enumerate() {
                if !op.is_generic() {
                    self.instantiate(program, decl.def, op_id as u32, &[])?;
                }
            }
        }
        for (call, effect, op, type_args) in module.facts.performs() {
            trace!(%call, %effect, op, "perform instantiation");
            self.instantiate(program, effect, op, type_args)
                .map_err(|e| with_span(e, module, call))?;
        }
        Ok(())
    }

    fn register_effect(&mut self, program: &Program, def: DefId) -> CompileResult<()> {
        if self.effects.contains_key(&def) {
            return Ok(());
        }
        let (module, decl) = program.effect(def).ok_or_else(|| {
            CompileError::new(
                ErrorCode::UnresolvedEffect,
                format!("{def} is not an effect declaration"),
                Span::dummy(),
            )
        })?;
        let label = identifier(module, decl);
        if decl.explicit_id.is_none() && decl.visibility.is_package_visible() {
            self.missing_id(decl, &label)?;
        }
        let id = EffectId::from_identifier(&label);
        if let Some(&other) = self.owners.get(&id) {
            let first = self.effect(other)?.span;
            return Err(CompileError::new(
                ErrorCode::DuplicateEffectId,
                format!("effect `{}` has id `{label}` ({id}), already used by {other}", decl.name),
                decl.span,
            )
            .with_note(first, "first declared here"));
        }
        self.owners.insert(id, def);
        debug!(effect = %label, %id, "effect identity");
        self.effects.insert(
            def,
            EffectInfo {
                def,
                id,
                label,
                ops: decl.ops.clone(),
                span: decl.span,
            },
        );
        Ok(())
    }

    fn missing_id(&mut self, decl: &EffectDecl, label: &str) -> CompileResult<()> {
        if !self.warned.insert(decl.def) {
            return Ok(());
        }
        let message = format!(
            "effect `{}` is visible outside its module but has no explicit id; using `{label}`",
            decl.name
        );
        if self.strict_ids {
            return Err(CompileError::new(ErrorCode::MissingEffectId, message, decl.span));
        }
        self.diagnostics.push(
            Diagnostic::warning(message, decl.span).with_error_code(ErrorCode::MissingEffectId),
        );
        Ok(())
    }

    fn effect(&self, def: DefId) -> CompileResult<&EffectInfo> {
        self.effects.get(&def).ok_or_else(|| {
            CompileError::new(
                ErrorCode::UnresolvedEffect,
                format!("{def} is not a registered effect"),
                Span::dummy(),
            )
        })
    }

    /// Record one instantiation of `effect.op` and return its key.
    pub fn instantiate(
        &mut self,
        program: &Program,
        effect: DefId,
        op_id: u32,
        type_args: &[TypeId],
    ) -> CompileResult<OpKey> {
        let cache_key = (effect, op_id, type_args.to_vec());
        if let Some(key) = self.instantiations.get(&cache_key) {
            return Ok(*key);
        }
        self.register_effect(program, effect)?;
        let (effect_params, info) = {
            let (_, decl) = program.effect(effect).ok_or_else(|| {
                CompileError::new(
                    ErrorCode::UnresolvedEffect,
                    format!("{effect} is not an effect declaration"),
                    Span::dummy(),
                )
            })?;
            (decl.type_params.clone(), self.effect(effect)?)
        };
        let op = info.op(op_id)?;
        let expected = effect_params.len() + op.type_params.len();
        if type_args.len() != expected {
            return Err(CompileError::new(
                ErrorCode::UnknownOperation,
                format!(
                    "`{}.{}` takes {expected} type arguments, found {}",
                    info.label,
                    op.name,
                    type_args.len()
                ),
                info.span,
            ));
        }
        let params: Vec<_> = effect_params.iter().chain(&op.type_params).copied().collect();
        let signature_hash = SignatureHasher::new(program)
            .with_substitution(&params, type_args)
            .op_signature(op)?;
        let key = OpKey {
            effect: info.id,
            op_id,
            signature_hash,
        };
        let meta = OpMeta {
            resume_kind: op.resume_kind,
            name: op.name.clone(),
        };
        let span = info.span;
        self.record_op(key, meta, span)?;
        self.instantiations.insert(cache_key, key);
        Ok(key)
    }

    /// Keep one name and resume kind per key; a disagreeing entry is fatal.
    fn record_op(&mut self, key: OpKey, meta: OpMeta, span: Span) -> CompileResult<()> {
        match self.ops.get(&key) {
            Some(existing) if *existing != meta => Err(CompileError::new(
                ErrorCode::DuplicateEffectId,
                format!(
                    "operation #{} of effect {} is both `{}` ({}) and `{}` ({})",
                    key.op_id,
                    key.effect,
                    existing.name,
                    existing.resume_kind,
                    meta.name,
                    meta.resume_kind
                ),
                span,
            )),
            Some(_) => Ok(()),
            None => {
                self.ops.insert(key, meta);
                Ok(())
            }
        }
    }

    /// Number the collected instantiations.
    pub fn finalize(self) -> FinalRegistry {
        let ops: Vec<(OpKey, OpMeta)> = self.ops.into_iter().collect();
        let index = ops
            .iter()
            .enumerate()
            .map(|(i, (key, _))| (*key, i as u32))
            .collect();
        debug!(ops = ops.len(), effects = self.effects.len(), "effect registry finalized");
        FinalRegistry {
            effects: self.effects,
            ops,
            index,
            instantiations: self.instantiations,
            diagnostics: self.diagnostics,
        }
    }
}

fn with_span(mut err: CompileError, module: &Module, call: ExprId) -> CompileError {
    if err.span.is_dummy() {
        if let Some(expr) = module.exprs.get(call) {
            err.span = expr.span;
        }
    }
    err
}

/// A resolved `perform` target.
#[derive(Debug, Clone)]
pub struct ResolvedOp {
    pub key: OpKey,
    pub op_index: u32,
    pub resume_kind: ResumeKind,
    pub arity: usize,
}

/// The immutable, numbered registry.
#[derive(Debug)]
pub struct FinalRegistry {
    effects: BTreeMap<DefId, EffectInfo>,
    /// Sorted by key; the position is the op index.
    ops: Vec<(OpKey, OpMeta)>,
    index: HashMap<OpKey, u32>,
    instantiations: HashMap<Instantiation, OpKey>,
    diagnostics: Vec<Diagnostic>,
}

impl FinalRegistry {
    pub fn effect(&self, def: DefId) -> CompileResult<&EffectInfo> {
        self.effects.get(&def).ok_or_else(|| {
            CompileError::new(
                ErrorCode::UnresolvedEffect,
                format!("{def} is not a registered effect"),
                Span::dummy(),
            )
        })
    }

    pub fn effects(&self) -> impl Iterator<Item = &EffectInfo> {
        self.effects.values()
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn op_index(&self, key: &OpKey) -> Option<u32> {
        self.index.get(key).copied()
    }

    /// Every key in index order with its resume kind and op name.
    pub fn entries(&self) -> impl Iterator<Item = (u32, &OpKey, ResumeKind, &str)> {
        self.ops
            .iter()
            .enumerate()
            .map(|(i, (key, meta))| (i as u32, key, meta.resume_kind, meta.name.as_str()))
    }

    /// Resolve a `perform` registered during collection.
    pub fn resolve(&self, effect: DefId, op_id: u32, type_args: &[TypeId]) -> CompileResult<ResolvedOp> {
        let key = self
            .instantiations
            .get(&(effect, op_id, type_args.to_vec()))
            .copied()
            .ok_or_else(|| {
                crate::ice_err!(
                    Span::dummy(),
                    "perform was not registered before finalization";
                    "effect" => effect,
                    "op" => op_id
                )
            })?;
        let op_index = self.op_index(&key).ok_or_else(|| {
            crate::ice_err!(Span::dummy(), "registered key has no index"; "key" => key)
        })?;
        let op = self.effect(effect)?.op(op_id)?;
        Ok(ResolvedOp {
            key,
            op_index,
            resume_kind: op.resume_kind,
            arity: op.params.len(),
        })
    }

    /// Warnings produced during collection.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

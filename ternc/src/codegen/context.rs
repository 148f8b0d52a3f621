//! Code generation context.
//!
//! The context owns the target module under construction and everything
//! shared by the per-owner emitters: the runtime record types, the runtime
//! helper functions, the function memo and the trap map.
//!
//! Owner functions are declared lazily the first time anything refers to
//! them (a call, a closure, a handler frame or a continuation) and are
//! memoized by owner name. A name enters the `building` set while its body
//! is emitted, so an owner that refers to itself gets the memoized index
//! instead of a second declaration.

use std::collections::{HashMap, HashSet};

use super::abi::{AbiTypes, OwnerSig};
use super::body::BodyEmitter;
use super::exports;
use super::runtime::RuntimeFuncs;
use crate::analysis::OwnerRef;
use crate::config::CompilerConfig;
use crate::error::CompileResult;
use crate::hir::DefId;
use crate::ice_err;
use crate::mir::{MirBody, TrapKind};
use crate::span::Span;
use crate::target::{FuncBuilder, FuncIdx, Heap, Instr, Module, TypeIdx};

/// Functions generated for one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerFuncs {
    /// Entry point with the owner's calling convention.
    pub entry: FuncIdx,
    /// State-machine body shared by the entry and the continuation.
    pub body: FuncIdx,
}

/// One `unreachable` the generated code may execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapSite {
    pub function: String,
    pub kind: TrapKind,
    pub span: Span,
    pub detail: String,
}

/// Every trap site of an artifact, for annotating runtime traps.
#[derive(Debug, Clone, Default)]
pub struct TrapMap {
    sites: Vec<TrapSite>,
}

impl TrapMap {
    pub fn push(&mut self, site: TrapSite) {
        self.sites.push(site);
    }

    pub fn sites(&self) -> &[TrapSite] {
        &self.sites
    }

    pub fn for_function<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a TrapSite> + 'a {
        self.sites.iter().filter(move |s| s.function == function)
    }

    pub fn of_kind(&self, kind: TrapKind) -> impl Iterator<Item = &TrapSite> {
        self.sites.iter().filter(move |s| s.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

/// An exported entry point callable by the host with i32 arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedEntry {
    pub name: String,
    pub arity: usize,
    pub effectful: bool,
}

/// The code generation context.
pub struct CodegenContext<'a> {
    pub(super) config: &'a CompilerConfig,
    pub(super) module: Module,
    pub(super) abi: AbiTypes,
    pub(super) rt: RuntimeFuncs,
    pub(super) traps: TrapMap,
    functions: HashMap<DefId, OwnerSig>,
    funcs: HashMap<String, OwnerFuncs>,
    conts: HashMap<String, FuncIdx>,
    building: HashSet<String>,
    next_label: i32,
    exported: Vec<ExportedEntry>,
}

impl<'a> CodegenContext<'a> {
    /// Create a context with the runtime types and helpers in place.
    pub fn new(config: &'a CompilerConfig) -> CompileResult<Self> {
        let mut module = Module::new(config.memory_pages());
        let abi = AbiTypes::declare(&mut module);
        let rt = RuntimeFuncs::declare(&mut module, &abi)?;
        let mut cx = Self {
            config,
            module,
            abi,
            rt,
            traps: TrapMap::default(),
            functions: HashMap::new(),
            funcs: HashMap::new(),
            conts: HashMap::new(),
            building: HashSet::new(),
            next_label: 1,
            exported: Vec::new(),
        };
        super::runtime::define(&mut cx)?;
        exports::define_boundary(&mut cx)?;
        Ok(cx)
    }

    /// Make a function's signature known to callers in any module.
    pub fn register_function(&mut self, def: DefId, sig: OwnerSig) {
        self.functions.insert(def, sig);
    }

    pub fn function_sig(&self, def: DefId) -> CompileResult<&OwnerSig> {
        self.functions
            .get(&def)
            .ok_or_else(|| ice_err!(Span::dummy(), "call to an unregistered function"; "def" => def))
    }

    /// Entry and body functions of an owner, declared on first use.
    pub fn owner_funcs(&mut self, sig: &OwnerSig) -> OwnerFuncs {
        if let Some(funcs) = self.funcs.get(&sig.name) {
            return *funcs;
        }
        let entry_ty = sig.entry_type(&mut self.module);
        let body_ty = sig.body_type(&mut self.module);
        let funcs = OwnerFuncs {
            entry: self.module.declare_func(sig.name.clone(), entry_ty),
            body: self.module.declare_func(format!("{}$body", sig.name), body_ty),
        };
        tracing::trace!(owner = %sig.name, entry = funcs.entry, "declared owner functions");
        self.funcs.insert(sig.name.clone(), funcs);
        funcs
    }

    /// The continuation function of an effectful owner, declared on first use.
    pub fn cont_func(&mut self, sig: &OwnerSig) -> FuncIdx {
        if let Some(&idx) = self.conts.get(&sig.name) {
            return idx;
        }
        let idx = self
            .module
            .declare_func(format!("{}$k", sig.name), self.abi.cont_fn);
        self.conts.insert(sig.name.clone(), idx);
        idx
    }

    /// A fresh correlation label for a handler installation.
    pub fn fresh_label(&mut self) -> i32 {
        let label = self.next_label;
        self.next_label += 1;
        label
    }

    pub fn trap(&mut self, function: &str, kind: TrapKind, span: Span, detail: impl Into<String>) {
        self.traps.push(TrapSite {
            function: function.to_string(),
            kind,
            span,
            detail: detail.into(),
        });
    }

    /// Emit every owner of one function.
    pub fn emit_function(&mut self, bodies: &[MirBody]) -> CompileResult<()> {
        let owners: HashMap<OwnerRef, OwnerSig> = bodies
            .iter()
            .map(|body| (body.owner, sig_of(body)))
            .collect();
        for body in bodies {
            let sig = sig_of(body);
            if !self.building.insert(sig.name.clone()) {
                return Err(ice_err!(body.span, "owner emitted twice"; "owner" => sig.name));
            }
            let funcs = self.owner_funcs(&sig);
            let emitted = BodyEmitter::new(self, body, &sig, &owners).emit(funcs);
            self.building.remove(&sig.name);
            emitted?;
            self.emit_entry(&sig, funcs)?;
            if sig.convention.is_effectful() && body.has_sites() {
                self.emit_cont(&sig, funcs)?;
            }
        }
        Ok(())
    }

    /// `entry(inputs..) = body(0, null, null, inputs..)`
    fn emit_entry(&mut self, sig: &OwnerSig, funcs: OwnerFuncs) -> CompileResult<()> {
        let inputs = sig.inputs();
        let mut f = FuncBuilder::new(inputs);
        f.emit(Instr::I32Const(0))
            .emit(Instr::RefNull(Heap::Any))
            .emit(Instr::RefNull(Heap::Any));
        for i in 0..inputs {
            f.emit(Instr::LocalGet(i as u32));
        }
        f.emit(Instr::Call(funcs.body));
        let (locals, body) = f.finish();
        self.module.define(funcs.entry, locals, body)
    }

    /// `k(env, resume) = body(1, env, resume, null..)`
    fn emit_cont(&mut self, sig: &OwnerSig, funcs: OwnerFuncs) -> CompileResult<()> {
        let k = self.cont_func(sig);
        let mut f = FuncBuilder::new(2);
        f.emit(Instr::I32Const(1))
            .emit(Instr::LocalGet(0))
            .emit(Instr::LocalGet(1));
        for _ in 0..sig.inputs() {
            f.emit(Instr::RefNull(Heap::Any));
        }
        f.emit(Instr::Call(funcs.body));
        let (locals, body) = f.finish();
        self.module.define(k, locals, body)
    }

    /// Export an i32-argument wrapper of a top-level function.
    pub fn export_function(&mut self, def: DefId, export_name: &str) -> CompileResult<()> {
        let sig = self.function_sig(def)?.clone();
        let funcs = self.owner_funcs(&sig);
        exports::define_wrapper(self, &sig, funcs, export_name)?;
        self.exported.push(ExportedEntry {
            name: export_name.to_string(),
            arity: sig.arity,
            effectful: sig.convention.is_effectful(),
        });
        Ok(())
    }

    /// Attach a custom section.
    pub fn add_custom(&mut self, name: &str, data: Vec<u8>) {
        self.module.add_custom(name, data);
    }

    pub fn finish(self) -> CompileResult<(Module, TrapMap, Vec<ExportedEntry>)> {
        self.module.check_complete()?;
        Ok((self.module, self.traps, self.exported))
    }

    // ========================================================================
    // Instruction helpers
    // ========================================================================

    /// Read field `field` of struct type `ty` from the `anyref` on the stack.
    pub(super) fn get(&self, ty: TypeIdx, field: u32) -> [Instr; 2] {
        [Instr::RefCast(Heap::Concrete(ty)), Instr::StructGet(ty, field)]
    }

    pub(super) fn cast(&self, ty: TypeIdx) -> Instr {
        Instr::RefCast(Heap::Concrete(ty))
    }
}

/// The signature of an already lowered owner.
pub fn sig_of(body: &MirBody) -> OwnerSig {
    OwnerSig {
        name: body.name.clone(),
        kind: body.owner.into(),
        convention: body.convention,
        arity: body.params.len(),
    }
}

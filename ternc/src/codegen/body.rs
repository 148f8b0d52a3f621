//! State-machine emission for one owner body.
//!
//! Every owner becomes one body function whose control is a loop over
//! numbered states:
//!
//! ```text
//! state b            MIR block b                      (0 <= b < M)
//! state M + 2s       check the outcome of site s
//! state M + 2s + 1   re-enter site s from its continuation
//! ```
//!
//! The `next` local selects the state; every state ends by setting `next`
//! and branching back to the loop head, or by returning. On entry the body
//! either binds its inputs and starts at block 0, or (when called through
//! the owner's continuation function) starts at the re-entry state of the
//! site recorded in the environment.
//!
//! ```text
//! loop @L
//!   block b_{n-1} .. block b_0
//!     block dflt
//!       br_table b_0 .. b_{n-1} (next) default dflt
//!     end
//!     unreachable
//!   end  ;; state 0
//!   ...
//! end
//! ```

use std::collections::HashMap;

use tern_abi::layout::{closure, frame, outcome, request, site_env};
use tern_abi::ResumeKind;

use super::abi::{closure_call_type, OwnerKind, OwnerSig};
use super::context::{CodegenContext, OwnerFuncs};
use crate::analysis::{Convention, OwnerRef, SiteKind};
use crate::error::CompileResult;
use crate::ice_err;
use crate::mir::{
    BasicBlockId, BinOp, CallTarget, ClauseFrame, Constant, LocalId, MirBody, Operand, PerformOp,
    Rvalue, SiteInfo, StatementKind, SuspendAction, TerminatorKind, TrapKind, UnOp,
};
use crate::span::Span;
use crate::target::{BlockType, FuncBuilder, Heap, Instr, Label, ValType};

/// Body parameters preceding the entry inputs.
const STARTED: u32 = 0;
const KENV: u32 = 1;
const RESUME: u32 = 2;
const FIXED_PARAMS: u32 = 3;

/// Where a site's value goes once the outcome is a value.
#[derive(Debug, Clone, Copy)]
struct SiteTarget {
    dest: LocalId,
    resume: BasicBlockId,
}

/// Emits the body function of one owner.
pub struct BodyEmitter<'e, 'a> {
    cx: &'e mut CodegenContext<'a>,
    body: &'e MirBody,
    sig: &'e OwnerSig,
    owners: &'e HashMap<OwnerRef, OwnerSig>,
    f: FuncBuilder,
    inputs: u32,
    next: u32,
    o: u32,
    t: u32,
    t2: u32,
    head: Label,
    targets: HashMap<u32, SiteTarget>,
}

impl<'e, 'a> BodyEmitter<'e, 'a> {
    pub fn new(
        cx: &'e mut CodegenContext<'a>,
        body: &'e MirBody,
        sig: &'e OwnerSig,
        owners: &'e HashMap<OwnerRef, OwnerSig>,
    ) -> Self {
        let inputs = sig.inputs() as u32;
        let mut f = FuncBuilder::new((FIXED_PARAMS + inputs) as usize);
        for _ in &body.locals {
            f.local(ValType::AnyRef);
        }
        let next = f.local(ValType::I32);
        let o = f.local(ValType::AnyRef);
        let t = f.local(ValType::AnyRef);
        let t2 = f.local(ValType::AnyRef);
        let head = f.label();

        let mut targets = HashMap::new();
        for bb in &body.basic_blocks {
            if let Some(term) = &bb.terminator {
                if let TerminatorKind::Suspend {
                    site, dest, resume, ..
                } = &term.kind
                {
                    targets.insert(
                        *site,
                        SiteTarget {
                            dest: *dest,
                            resume: *resume,
                        },
                    );
                }
            }
        }

        Self {
            cx,
            body,
            sig,
            owners,
            f,
            inputs,
            next,
            o,
            t,
            t2,
            head,
            targets,
        }
    }

    fn effectful(&self) -> bool {
        self.body.convention.is_effectful()
    }

    fn block_count(&self) -> u32 {
        self.body.basic_blocks.len() as u32
    }

    fn check_state(&self, site: u32) -> u32 {
        self.block_count() + 2 * site
    }

    fn input(&self, i: u32) -> u32 {
        FIXED_PARAMS + i
    }

    fn local(&self, id: LocalId) -> u32 {
        FIXED_PARAMS + self.inputs + id.0
    }

    fn ice(&self, message: &str) -> crate::error::CompileError {
        ice_err!(self.body.span, message; "owner" => self.body.name.clone())
    }

    fn trap(&mut self, kind: TrapKind, span: Span, detail: impl Into<String>) {
        let name = self.body.name.clone();
        self.cx.trap(&name, kind, span, detail);
        self.f.emit(Instr::Unreachable);
    }

    /// Emit the whole body function and define it.
    pub fn emit(mut self, funcs: OwnerFuncs) -> CompileResult<()> {
        if self.targets.len() != self.body.sites.len() {
            return Err(self.ice("site table disagrees with the suspension terminators"));
        }
        let states = self.block_count() + 2 * self.body.sites.len() as u32;
        tracing::debug!(
            owner = %self.body.name,
            blocks = self.block_count(),
            sites = self.body.sites.len(),
            states,
            "emitting owner body"
        );

        self.prologue()?;

        let labels: Vec<Label> = (0..states).map(|_| self.f.label()).collect();
        let dflt = self.f.label();
        self.f.emit(Instr::Loop(self.head, BlockType::Empty));
        for label in labels.iter().rev() {
            self.f.emit(Instr::Block(*label, BlockType::Empty));
        }
        self.f
            .emit(Instr::Block(dflt, BlockType::Empty))
            .emit(Instr::LocalGet(self.next))
            .emit(Instr::BrTable(labels.clone(), dflt))
            .emit(Instr::End);
        self.trap(TrapKind::UnknownSite, self.body.span, "state index out of range");

        for state in 0..states {
            self.f.emit(Instr::End);
            let m = self.block_count();
            if state < m {
                self.emit_block(BasicBlockId(state))?;
            } else {
                let site = (state - m) / 2;
                let body = self.body;
                let info = body
                    .sites
                    .get(site as usize)
                    .ok_or_else(|| self.ice("state without a site"))?;
                if (state - m) % 2 == 0 {
                    self.emit_check(info)?;
                } else {
                    self.emit_reentry(info)?;
                }
            }
        }
        self.f.emit(Instr::End).emit(Instr::Unreachable);

        let f = std::mem::replace(&mut self.f, FuncBuilder::new(0));
        let (locals, instrs) = f.finish();
        self.cx.module.define(funcs.body, locals, instrs)
    }

    // ========================================================================
    // Entry
    // ========================================================================

    fn prologue(&mut self) -> CompileResult<()> {
        let resumable = self.effectful() && self.body.has_sites();
        if resumable {
            let reentry_base = self.block_count() as i32 + 1;
            let started = self.f.label();
            self.f
                .emit(Instr::LocalGet(STARTED))
                .emit(Instr::If(started, BlockType::Empty))
                .emit(Instr::LocalGet(KENV))
                .extend(self.cx.get(self.cx.abi.site_env, site_env::SITE))
                .emit(Instr::I32Const(2))
                .emit(Instr::I32Mul)
                .emit(Instr::I32Const(reentry_base))
                .emit(Instr::I32Add)
                .emit(Instr::LocalSet(self.next))
                .emit(Instr::Else);
            self.bind_inputs()?;
            self.f
                .emit(Instr::I32Const(0))
                .emit(Instr::LocalSet(self.next))
                .emit(Instr::End);
        } else {
            self.bind_inputs()?;
            self.f
                .emit(Instr::I32Const(0))
                .emit(Instr::LocalSet(self.next));
        }
        Ok(())
    }

    fn set_local(&mut self, local: LocalId) {
        let idx = self.local(local);
        self.f.emit(Instr::LocalSet(idx));
    }

    /// Copy slot `j` of the `$Slots` array in `source` into each local.
    fn bind_slots(&mut self, source: u32, locals: &[LocalId]) {
        let slots = self.cx.abi.slots;
        for (j, local) in locals.iter().enumerate() {
            self.f
                .emit(Instr::LocalGet(source))
                .emit(self.cx.cast(slots))
                .emit(Instr::I32Const(j as i32))
                .emit(Instr::ArrayGet(slots));
            self.set_local(*local);
        }
    }

    fn bind_inputs(&mut self) -> CompileResult<()> {
        let body = self.body;
        let effectful = u32::from(self.effectful());
        let param_base = match self.sig.kind {
            OwnerKind::Function => {
                if effectful == 1 {
                    self.f.emit(Instr::LocalGet(self.input(0)));
                    self.set_local(body.frame);
                }
                effectful
            }
            OwnerKind::Lambda => {
                self.bind_slots(self.input(0), &body.captures);
                if effectful == 1 {
                    self.f.emit(Instr::LocalGet(self.input(1)));
                    self.set_local(body.frame);
                }
                1 + effectful
            }
            OwnerKind::HandleBody => {
                self.f.emit(Instr::LocalGet(self.input(0)));
                self.set_local(body.frame);
                self.bind_slots(self.input(1), &body.captures);
                return Ok(());
            }
            OwnerKind::Clause => {
                let self_frame = body.self_frame.ok_or_else(|| self.ice("clause without a self frame"))?;
                let req = body.request.ok_or_else(|| self.ice("clause without a request"))?;
                self.f.emit(Instr::LocalGet(self.input(0)));
                self.set_local(self_frame);
                self.bind_slots(self.input(1), &body.captures);
                self.f.emit(Instr::LocalGet(self.input(2)));
                self.set_local(req);
                self.f
                    .emit(Instr::LocalGet(self.input(0)))
                    .emit(Instr::Call(self.cx.rt.outer));
                self.set_local(body.frame);
                self.f
                    .emit(Instr::LocalGet(self.input(2)))
                    .extend(self.cx.get(self.cx.abi.request, request::ARGS))
                    .emit(Instr::LocalSet(self.t));
                self.bind_slots(self.t, &body.params);
                return Ok(());
            }
        };
        for (i, param) in body.params.iter().enumerate() {
            self.f.emit(Instr::LocalGet(self.input(param_base + i as u32)));
            self.set_local(*param);
        }
        Ok(())
    }

    // ========================================================================
    // Blocks
    // ========================================================================

    fn goto(&mut self, state: u32) {
        self.f
            .emit(Instr::I32Const(state as i32))
            .emit(Instr::LocalSet(self.next))
            .emit(Instr::Br(self.head));
    }

    fn emit_block(&mut self, id: BasicBlockId) -> CompileResult<()> {
        let body = self.body;
        let block = body
            .block(id)
            .ok_or_else(|| self.ice("state for a missing block"))?;
        for stmt in &block.statements {
            match &stmt.kind {
                StatementKind::Assign(local, rvalue) => {
                    self.rvalue(rvalue)?;
                    self.set_local(*local);
                }
                StatementKind::TailBump => {
                    self.guard()?;
                    self.f.emit(Instr::Call(self.cx.rt.tail_bump));
                }
                StatementKind::TailCheck => {
                    self.guard()?;
                    self.f.emit(Instr::Call(self.cx.rt.tail_check));
                }
            }
        }
        let term = block
            .terminator
            .as_ref()
            .ok_or_else(|| self.ice("unterminated block reached code generation"))?;
        match &term.kind {
            TerminatorKind::Goto { target } => self.goto(target.0),
            TerminatorKind::SwitchBool {
                cond,
                then_block,
                else_block,
            } => {
                let l = self.f.label();
                self.operand(*cond);
                self.f
                    .emit(Instr::Call(self.cx.rt.unbox_int))
                    .emit(Instr::If(l, BlockType::Empty))
                    .emit(Instr::I32Const(then_block.0 as i32))
                    .emit(Instr::LocalSet(self.next))
                    .emit(Instr::Else)
                    .emit(Instr::I32Const(else_block.0 as i32))
                    .emit(Instr::LocalSet(self.next))
                    .emit(Instr::End)
                    .emit(Instr::Br(self.head));
            }
            TerminatorKind::Return(value) => {
                if self.effectful() {
                    self.f.emit(Instr::I32Const(outcome::VALUE));
                    self.operand(*value);
                    self.f.emit(Instr::StructNew(self.cx.abi.outcome));
                } else {
                    self.operand(*value);
                }
                self.f.emit(Instr::Return);
            }
            TerminatorKind::Trap(kind) => {
                self.trap(*kind, term.span, format!("{id}"));
            }
            TerminatorKind::Suspend { site, action, .. } => {
                tracing::trace!(owner = %body.name, site, %action, "emitting suspension");
                self.action(action, term.span)?;
                self.f.emit(Instr::LocalSet(self.o));
                self.goto(self.check_state(*site));
            }
        }
        Ok(())
    }

    /// Push the guard of the clause's request.
    fn guard(&mut self) -> CompileResult<()> {
        let req = self.body.request.ok_or_else(|| self.ice("tail guard outside a clause"))?;
        self.f
            .emit(Instr::LocalGet(self.local(req)))
            .extend(self.cx.get(self.cx.abi.request, request::GUARD));
        Ok(())
    }

    // ========================================================================
    // Values
    // ========================================================================

    fn operand(&mut self, op: Operand) {
        match op {
            Operand::Copy(local) => {
                self.f.emit(Instr::LocalGet(self.local(local)));
            }
            Operand::Const(Constant::Unit) => {
                self.f.emit(Instr::RefNull(Heap::Any));
            }
            Operand::Const(Constant::Bool(b)) => {
                self.f
                    .emit(Instr::I32Const(i32::from(b)))
                    .emit(Instr::StructNew(self.cx.abi.int));
            }
            Operand::Const(Constant::Int(n)) => {
                self.f
                    .emit(Instr::I32Const(n))
                    .emit(Instr::StructNew(self.cx.abi.int));
            }
        }
    }

    fn slots(&mut self, items: &[Operand]) {
        for item in items {
            self.operand(*item);
        }
        self.f
            .emit(Instr::ArrayNewFixed(self.cx.abi.slots, items.len() as u32));
    }

    fn unboxed(&mut self, op: Operand) {
        match op {
            Operand::Const(Constant::Int(n)) => {
                self.f.emit(Instr::I32Const(n));
            }
            Operand::Const(Constant::Bool(b)) => {
                self.f.emit(Instr::I32Const(i32::from(b)));
            }
            _ => {
                self.operand(op);
                self.f.emit(Instr::Call(self.cx.rt.unbox_int));
            }
        }
    }

    fn rvalue(&mut self, rvalue: &Rvalue) -> CompileResult<()> {
        match rvalue {
            Rvalue::Use(op) => self.operand(*op),
            Rvalue::BinaryOp(op, a, b) => {
                self.unboxed(*a);
                self.unboxed(*b);
                self.f.emit(match op {
                    BinOp::Add => Instr::I32Add,
                    BinOp::Sub => Instr::I32Sub,
                    BinOp::Mul => Instr::I32Mul,
                    BinOp::Div => Instr::I32DivS,
                    BinOp::Rem => Instr::I32RemS,
                    BinOp::Eq => Instr::I32Eq,
                    BinOp::Ne => Instr::I32Ne,
                    BinOp::Lt => Instr::I32LtS,
                    BinOp::Le => Instr::I32LeS,
                    BinOp::Gt => Instr::I32GtS,
                    BinOp::Ge => Instr::I32GeS,
                });
                self.f.emit(Instr::Call(self.cx.rt.box_int));
            }
            Rvalue::UnaryOp(UnOp::Neg, a) => {
                self.f.emit(Instr::I32Const(0));
                self.unboxed(*a);
                self.f
                    .emit(Instr::I32Sub)
                    .emit(Instr::Call(self.cx.rt.box_int));
            }
            Rvalue::UnaryOp(UnOp::Not, a) => {
                self.unboxed(*a);
                self.f
                    .emit(Instr::I32Eqz)
                    .emit(Instr::Call(self.cx.rt.box_int));
            }
            Rvalue::Aggregate(items) => self.slots(items),
            Rvalue::Project { base, index } => {
                let slots = self.cx.abi.slots;
                self.operand(*base);
                self.f
                    .emit(self.cx.cast(slots))
                    .emit(Instr::I32Const(*index as i32))
                    .emit(Instr::ArrayGet(slots));
            }
            Rvalue::Closure { owner, captures } => {
                let sig = self.owner_sig(*owner)?;
                let funcs = self.cx.owner_funcs(&sig);
                self.f.emit(Instr::RefFunc(funcs.entry));
                self.slots(captures);
                self.f.emit(Instr::StructNew(self.cx.abi.closure));
            }
            Rvalue::PureCall { target, args } => {
                self.call(target, args, Convention::Pure)?;
            }
            Rvalue::Marker => {
                self.f
                    .emit(Instr::I32Const(0))
                    .emit(Instr::StructNew(self.cx.abi.int));
            }
        }
        Ok(())
    }

    fn owner_sig(&self, owner: OwnerRef) -> CompileResult<OwnerSig> {
        self.owners
            .get(&owner)
            .cloned()
            .ok_or_else(|| ice_err!(self.body.span, "reference to an owner of another function";
                "owner" => owner, "from" => self.body.name.clone()))
    }

    /// Call `target` with the given convention. Effectful calls leave an
    /// outcome on the stack, pure calls a value.
    fn call(&mut self, target: &CallTarget, args: &[Operand], convention: Convention) -> CompileResult<()> {
        let effectful = convention.is_effectful();
        match target {
            CallTarget::Function(def) => {
                let sig = self.cx.function_sig(*def)?.clone();
                if sig.convention != convention {
                    return Err(ice_err!(self.body.span, "call convention disagrees with the callee";
                        "callee" => sig.name, "expected" => convention));
                }
                let funcs = self.cx.owner_funcs(&sig);
                if effectful {
                    self.f.emit(Instr::LocalGet(self.local(self.body.frame)));
                }
                for arg in args {
                    self.operand(*arg);
                }
                self.f.emit(Instr::Call(funcs.entry));
            }
            CallTarget::Closure(callee) => {
                let abi = self.cx.abi;
                let ty = closure_call_type(&mut self.cx.module, convention, args.len());
                self.operand(*callee);
                self.f.emit(Instr::LocalSet(self.t2));
                self.f
                    .emit(Instr::LocalGet(self.t2))
                    .extend(self.cx.get(abi.closure, closure::ENV));
                if effectful {
                    self.f.emit(Instr::LocalGet(self.local(self.body.frame)));
                }
                for arg in args {
                    self.operand(*arg);
                }
                self.f
                    .emit(Instr::LocalGet(self.t2))
                    .extend(self.cx.get(abi.closure, closure::FUNC))
                    .emit(Instr::RefCast(Heap::Concrete(ty)))
                    .emit(Instr::CallRef(ty));
            }
        }
        Ok(())
    }

    // ========================================================================
    // Suspension actions
    // ========================================================================

    /// Emit `action`, leaving its outcome on the stack.
    fn action(&mut self, action: &SuspendAction, span: Span) -> CompileResult<()> {
        match action {
            SuspendAction::Perform { op, args, direct } => {
                self.slots(args);
                self.f.emit(Instr::LocalSet(self.t2));
                match direct {
                    Some(direct) => {
                        let sig = self.owner_sig(direct.owner)?;
                        let funcs = self.cx.owner_funcs(&sig);
                        self.f.emit(Instr::LocalGet(self.local(self.body.frame)));
                        for _ in 0..direct.depth {
                            self.f.extend(self.cx.get(self.cx.abi.frame, frame::PREV));
                        }
                        self.f.emit(Instr::LocalSet(self.t));
                        self.invoke_clause(op, Some(funcs))?;
                    }
                    None => self.perform_dynamic(op)?,
                }
            }
            SuspendAction::Call { target, args } => {
                self.call(target, args, Convention::Effectful)?;
            }
            SuspendAction::Handle {
                marker,
                clauses,
                body,
                body_captures,
            } => self.handle(*marker, clauses, *body, body_captures, span)?,
            SuspendAction::Resume { value } => {
                let self_frame = self
                    .body
                    .self_frame
                    .ok_or_else(|| self.ice("resumption outside a clause"))?;
                let req = self.body.request.ok_or_else(|| self.ice("resumption outside a clause"))?;
                let abi = self.cx.abi;
                let (self_frame, req) = (self.local(self_frame), self.local(req));
                self.f
                    .emit(Instr::LocalGet(self_frame))
                    .extend(self.cx.get(abi.frame, frame::MARKER))
                    .emit(Instr::LocalGet(req))
                    .extend(self.cx.get(abi.request, request::CONT));
                self.operand(*value);
                self.f
                    .emit(Instr::Call(self.cx.rt.resume))
                    .emit(Instr::Call(self.cx.rt.dispatch));
            }
        }
        Ok(())
    }

    /// Push a request for `op` with arguments from `t2`. `handle` and
    /// `target` come from the frame in `t`, or are 0 and null.
    fn request(&mut self, op: &PerformOp, from_frame: bool, with_guard: bool) {
        let abi = self.cx.abi;
        self.f
            .emit(Instr::I32Const(op.effect.hi() as i32))
            .emit(Instr::I32Const(op.effect.lo() as i32))
            .emit(Instr::I32Const(op.op_id as i32))
            .emit(Instr::I32Const(op.op_index as i32))
            .emit(Instr::I32Const(op.resume_kind.as_u32() as i32));
        if from_frame {
            self.f
                .emit(Instr::LocalGet(self.t))
                .extend(self.cx.get(abi.frame, frame::LABEL))
                .emit(Instr::LocalGet(self.t));
        } else {
            self.f
                .emit(Instr::I32Const(0))
                .emit(Instr::RefNull(Heap::Any));
        }
        self.f
            .emit(Instr::LocalGet(self.t2))
            .emit(Instr::RefNull(Heap::Any));
        if with_guard {
            self.f
                .emit(Instr::I32Const(1))
                .emit(Instr::I32Const(0))
                .emit(Instr::StructNew(abi.guard));
        } else {
            self.f.emit(Instr::RefNull(Heap::Any));
        }
        self.f.emit(Instr::StructNew(abi.request));
    }

    /// Call the clause of the frame in `t` in place.
    fn invoke_clause(&mut self, op: &PerformOp, direct: Option<OwnerFuncs>) -> CompileResult<()> {
        let abi = self.cx.abi;
        self.f
            .emit(Instr::LocalGet(self.t))
            .emit(Instr::LocalGet(self.t))
            .extend(self.cx.get(abi.frame, frame::CLAUSE_ENV));
        self.request(op, true, op.resume_kind.is_tail());
        match direct {
            Some(funcs) => {
                self.f.emit(Instr::Call(funcs.entry));
            }
            None => {
                self.f
                    .emit(Instr::LocalGet(self.t))
                    .extend(self.cx.get(abi.frame, frame::CLAUSE))
                    .emit(Instr::RefCast(Heap::Concrete(abi.clause_fn)))
                    .emit(Instr::CallRef(abi.clause_fn));
            }
        }
        Ok(())
    }

    fn perform_dynamic(&mut self, op: &PerformOp) -> CompileResult<()> {
        let abi = self.cx.abi;
        self.f
            .emit(Instr::LocalGet(self.local(self.body.frame)))
            .emit(Instr::I32Const(op.effect.hi() as i32))
            .emit(Instr::I32Const(op.effect.lo() as i32))
            .emit(Instr::I32Const(op.op_id as i32))
            .emit(Instr::Call(self.cx.rt.find_frame))
            .emit(Instr::LocalSet(self.t));

        match op.resume_kind {
            ResumeKind::Tail => {
                let missing = self.f.label();
                self.f
                    .emit(Instr::LocalGet(self.t))
                    .emit(Instr::RefIsNull)
                    .emit(Instr::If(missing, BlockType::Value(ValType::AnyRef)))
                    .emit(Instr::I32Const(outcome::EFFECT));
                self.request(op, false, true);
                self.f
                    .emit(Instr::StructNew(abi.outcome))
                    .emit(Instr::Else);
                self.invoke_clause(op, None)?;
                self.f.emit(Instr::End);
            }
            ResumeKind::Resume => {
                // The handle token is the frame's label, or 0 for the host.
                self.f.emit(Instr::I32Const(outcome::EFFECT));
                let hosted = self.f.label();
                self.f
                    .emit(Instr::I32Const(op.effect.hi() as i32))
                    .emit(Instr::I32Const(op.effect.lo() as i32))
                    .emit(Instr::I32Const(op.op_id as i32))
                    .emit(Instr::I32Const(op.op_index as i32))
                    .emit(Instr::I32Const(op.resume_kind.as_u32() as i32))
                    .emit(Instr::LocalGet(self.t))
                    .emit(Instr::RefIsNull)
                    .emit(Instr::If(hosted, BlockType::Value(ValType::I32)))
                    .emit(Instr::I32Const(0))
                    .emit(Instr::Else)
                    .emit(Instr::LocalGet(self.t))
                    .extend(self.cx.get(abi.frame, frame::LABEL))
                    .emit(Instr::End)
                    .emit(Instr::LocalGet(self.t))
                    .emit(Instr::LocalGet(self.t2))
                    .emit(Instr::RefNull(Heap::Any))
                    .emit(Instr::RefNull(Heap::Any))
                    .emit(Instr::StructNew(abi.request))
                    .emit(Instr::StructNew(abi.outcome));
            }
        }
        Ok(())
    }

    fn handle(
        &mut self,
        marker: LocalId,
        clauses: &[ClauseFrame],
        body: OwnerRef,
        body_captures: &[Operand],
        span: Span,
    ) -> CompileResult<()> {
        let abi = self.cx.abi;
        let label = self.cx.fresh_label();
        tracing::trace!(owner = %self.body.name, label, clauses = clauses.len(), "installing handler");

        self.f
            .emit(Instr::LocalGet(self.local(self.body.frame)))
            .emit(Instr::LocalSet(self.t));
        let marker = self.local(marker);
        for clause in clauses {
            let sig = self.owner_sig(clause.owner)?;
            let funcs = self.cx.owner_funcs(&sig);
            let tail = clause.resume_kind.is_tail();
            self.f
                .emit(Instr::LocalGet(self.t))
                .emit(Instr::I32Const(clause.effect.hi() as i32))
                .emit(Instr::I32Const(clause.effect.lo() as i32))
                .emit(Instr::I32Const(clause.op_id as i32))
                .emit(Instr::I32Const(clause.resume_kind.as_u32() as i32))
                .emit(Instr::RefFunc(funcs.entry));
            self.slots(&clause.captures);
            self.f
                .emit(Instr::I32Const(i32::from(tail)))
                .emit(Instr::I32Const(label))
                .emit(Instr::LocalGet(marker))
                .emit(Instr::StructNew(abi.frame))
                .emit(Instr::LocalSet(self.t));
        }

        let body_sig = self.owner_sig(body)?;
        if body_sig.kind != OwnerKind::HandleBody {
            return Err(ice_err!(span, "handle site body is not a handle body"; "owner" => body_sig.name));
        }
        let funcs = self.cx.owner_funcs(&body_sig);
        self.f
            .emit(Instr::LocalGet(marker))
            .emit(Instr::LocalGet(self.t));
        self.slots(body_captures);
        self.f
            .emit(Instr::Call(funcs.entry))
            .emit(Instr::Call(self.cx.rt.dispatch));
        Ok(())
    }

    // ========================================================================
    // Site states
    // ========================================================================

    fn emit_check(&mut self, site: &SiteInfo) -> CompileResult<()> {
        let abi = self.cx.abi;
        let target = *self
            .targets
            .get(&site.order)
            .ok_or_else(|| self.ice("site without a suspension terminator"))?;

        let done = self.f.label();
        self.f
            .emit(Instr::LocalGet(self.o))
            .extend(self.cx.get(abi.outcome, outcome::TAG))
            .emit(Instr::I32Const(outcome::VALUE))
            .emit(Instr::I32Eq)
            .emit(Instr::If(done, BlockType::Empty))
            .emit(Instr::LocalGet(self.o))
            .extend(self.cx.get(abi.outcome, outcome::PAYLOAD));
        self.set_local(target.dest);
        self.goto(target.resume.0);
        self.f.emit(Instr::End);

        if !self.effectful() {
            self.trap(
                TrapKind::EffectInPureOwner,
                site.span,
                format!("site {} ({})", site.order, site.kind),
            );
            return Ok(());
        }

        // Suspend: rewrap the request with this owner's continuation.
        let k = self.cx.cont_func(self.sig);
        let frame_local = self.local(self.body.frame);
        self.f
            .emit(Instr::LocalGet(self.o))
            .extend(self.cx.get(abi.outcome, outcome::PAYLOAD))
            .emit(Instr::RefFunc(k))
            .emit(Instr::I32Const(site.order as i32))
            .emit(Instr::LocalGet(frame_local))
            .emit(Instr::LocalGet(self.o))
            .extend(self.cx.get(abi.outcome, outcome::PAYLOAD))
            .extend(self.cx.get(abi.request, request::CONT));
        for local in &site.saved {
            self.f.emit(Instr::LocalGet(self.local(*local)));
        }
        self.f
            .emit(Instr::ArrayNewFixed(abi.slots, site.saved.len() as u32))
            .emit(Instr::StructNew(abi.site_env))
            .emit(Instr::I32Const(site.order as i32))
            .emit(Instr::StructNew(abi.cont))
            .emit(Instr::Call(self.cx.rt.rewrap))
            .emit(Instr::Return);
        Ok(())
    }

    fn emit_reentry(&mut self, site: &SiteInfo) -> CompileResult<()> {
        if !self.effectful() {
            self.trap(
                TrapKind::UnknownSite,
                site.span,
                format!("pure owner re-entered at site {}", site.order),
            );
            return Ok(());
        }
        let abi = self.cx.abi;
        self.f
            .emit(Instr::LocalGet(KENV))
            .extend(self.cx.get(abi.site_env, site_env::SLOTS))
            .emit(Instr::LocalSet(self.t));
        self.bind_slots(self.t, &site.saved);
        self.f
            .emit(Instr::LocalGet(KENV))
            .extend(self.cx.get(abi.site_env, site_env::FRAME));
        self.set_local(self.body.frame);

        match site.kind {
            SiteKind::Handle => {
                let marker = self.handle_marker(site)?;
                self.f.emit(Instr::LocalGet(self.local(marker)));
            }
            SiteKind::Resume => {
                let self_frame = self
                    .body
                    .self_frame
                    .ok_or_else(|| self.ice("resume site outside a clause"))?;
                self.f
                    .emit(Instr::LocalGet(self.local(self_frame)))
                    .extend(self.cx.get(abi.frame, frame::MARKER));
            }
            SiteKind::Perform | SiteKind::EffectfulCall => {}
        }
        self.f
            .emit(Instr::LocalGet(KENV))
            .extend(self.cx.get(abi.site_env, site_env::INNER))
            .emit(Instr::LocalGet(RESUME))
            .emit(Instr::Call(self.cx.rt.resume));
        if matches!(site.kind, SiteKind::Handle | SiteKind::Resume) {
            self.f.emit(Instr::Call(self.cx.rt.dispatch));
        }
        self.f.emit(Instr::LocalSet(self.o));
        self.goto(self.check_state(site.order));
        Ok(())
    }

    /// The marker local of the handle site `site`.
    fn handle_marker(&self, site: &SiteInfo) -> CompileResult<LocalId> {
        self.body
            .basic_blocks
            .iter()
            .filter_map(|bb| bb.terminator.as_ref())
            .find_map(|term| match &term.kind {
                TerminatorKind::Suspend {
                    site: s,
                    action: SuspendAction::Handle { marker, .. },
                    ..
                } if *s == site.order => Some(*marker),
                _ => None,
            })
            .ok_or_else(|| self.ice("handle site without a marker"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;
    use crate::hir::DefId;
    use crate::mir::{Statement, Terminator};

    fn term(kind: TerminatorKind) -> Terminator {
        Terminator {
            kind,
            span: Span::dummy(),
        }
    }

    /// `fn add1(x) = x + 1`, pure.
    fn pure_body() -> MirBody {
        let mut body = MirBody::new(
            OwnerRef::Function(DefId::new(0)),
            "app/main::add1".into(),
            Convention::Pure,
            Span::dummy(),
        );
        let x = body.new_local(crate::mir::LocalKind::Param, Some("x".into()), Span::dummy());
        body.params.push(x);
        let sum = body.new_temp(Span::dummy());
        body.push_statement(
            BasicBlockId::ENTRY,
            Statement {
                kind: StatementKind::Assign(
                    sum,
                    Rvalue::BinaryOp(BinOp::Add, Operand::Copy(x), Operand::Const(Constant::Int(1))),
                ),
                span: Span::dummy(),
            },
        );
        body.set_terminator(BasicBlockId::ENTRY, term(TerminatorKind::Return(Operand::Copy(sum))));
        body
    }

    #[test]
    fn test_pure_body_has_no_continuation() {
        let config = CompilerConfig::default();
        let mut cx = CodegenContext::new(&config).unwrap();
        let body = pure_body();
        let sig = super::super::context::sig_of(&body);
        cx.register_function(DefId::new(0), sig);
        cx.emit_function(std::slice::from_ref(&body)).unwrap();
        let (module, _, _) = cx.finish().unwrap();
        let has = |name: &str| module.funcs.iter().any(|f| f.name == name);
        assert!(has("app/main::add1$body"));
        assert!(!has("app/main::add1$k"));
        assert!(module.render_text().contains("call $rt_box"));
    }

    #[test]
    fn test_perform_site_rewraps_with_continuation() {
        let config = CompilerConfig::default();
        let mut cx = CodegenContext::new(&config).unwrap();
        let mut body = MirBody::new(
            OwnerRef::Function(DefId::new(1)),
            "app/main::ask".into(),
            Convention::Effectful,
            Span::dummy(),
        );
        let dest = body.new_temp(Span::dummy());
        let resume = body.new_block();
        body.sites.push(SiteInfo {
            order: 0,
            expr: crate::hir::ExprId(0),
            kind: SiteKind::Perform,
            saved: Vec::new(),
            span: Span::dummy(),
        });
        body.set_terminator(
            BasicBlockId::ENTRY,
            term(TerminatorKind::Suspend {
                site: 0,
                action: SuspendAction::Perform {
                    op: PerformOp {
                        effect: tern_abi::EffectId::from_identifier("app/main/Ask"),
                        op_id: 7,
                        op_index: 0,
                        resume_kind: ResumeKind::Resume,
                    },
                    args: vec![],
                    direct: None,
                },
                dest,
                resume,
            }),
        );
        body.set_terminator(resume, term(TerminatorKind::Return(Operand::Copy(dest))));
        let sig = super::super::context::sig_of(&body);
        cx.register_function(DefId::new(1), sig);
        cx.emit_function(std::slice::from_ref(&body)).unwrap();
        let (module, traps, _) = cx.finish().unwrap();

        let text = module.render_text();
        assert!(text.contains("call $rt_find_frame"));
        assert!(text.contains("call $rt_rewrap"));
        assert!(text.contains("ref.func $app/main::ask$k"));
        assert_eq!(traps.for_function("app/main::ask").count(), 1);
        assert_eq!(traps.of_kind(TrapKind::UnknownSite).count(), 1);
    }
}

//! # HIR to MIR Lowering
//!
//! Each owner is lowered on its own, using the liveness result of the
//! analysis pass:
//!
//! - Nested expressions become flat statements over temporaries
//! - `if`, `match`, `&&`/`||` and loops become explicit CFG edges
//! - Every suspension site becomes a `Suspend` terminator whose resume
//!   block continues the evaluation, with the site's saved locals recorded
//!   on the body
//!
//! ## Example Lowering
//!
//! ```text
//! // HIR
//! let y = perform Io.read(x); y + x
//!
//! // MIR
//! bb0:
//!     _3 = _1
//!     _2 = suspend site0 perform #0(_3) -> bb1    // site0 saves [_1]
//! bb1:
//!     _4 = _2
//!     _5 = _1
//!     _6 = Add(_4, _5)
//!     return _6
//! ```
//!
//! Expressions the analysis marked as temporaries are copied into a
//! dedicated local as soon as they are evaluated, so sites later in the
//! same operand list can save and restore them.

use std::collections::HashMap;

use tern_abi::ResumeKind;

use super::body::{LocalKind, MirBody, SiteInfo};
use super::types::{
    BasicBlockId, BinOp, CallTarget, ClauseFrame, Constant, DirectClause, LocalId, Operand,
    PerformOp, Rvalue, Statement, StatementKind, SuspendAction, Terminator, TerminatorKind,
    TrapKind, UnOp,
};
use crate::analysis::{AnalyzedOwner, FunctionAnalysis, OwnerRef};
use crate::config::CompilerConfig;
use crate::diagnostics::ErrorCode;
use crate::effects::FinalRegistry;
use crate::error::{CompileError, CompileResult};
use crate::hir::{
    self, CallKind, Callee, DefId, ExprId, ExprKind, HandlerClause, Literal, Module, Pattern,
    Program, Stmt, SymbolId, TypeId, TypeKind,
};
use crate::ice_err;
use crate::span::Span;

/// Everything lowering reads besides the owner itself.
#[derive(Clone, Copy)]
pub struct LoweringCx<'a> {
    pub program: &'a Program,
    pub module: &'a Module,
    pub registry: &'a FinalRegistry,
    pub config: &'a CompilerConfig,
}

/// Lower every owner of an analyzed function, parents first.
pub fn lower_function(cx: LoweringCx<'_>, analysis: &FunctionAnalysis) -> CompileResult<Vec<MirBody>> {
    analysis
        .owners
        .iter()
        .map(|owner| OwnerLowering::new(cx, analysis, owner)?.lower())
        .collect()
}

struct LoopScope {
    break_block: BasicBlockId,
    continue_block: BasicBlockId,
    /// Destination of `break value` for `loop`.
    result: Option<LocalId>,
}

struct OwnerLowering<'a> {
    cx: LoweringCx<'a>,
    analysis: &'a FunctionAnalysis,
    owner: &'a AnalyzedOwner,
    body: MirBody,
    current: BasicBlockId,
    symbols: HashMap<SymbolId, LocalId>,
    expr_temps: HashMap<ExprId, LocalId>,
    loops: Vec<LoopScope>,
}

impl<'a> OwnerLowering<'a> {
    fn new(cx: LoweringCx<'a>, analysis: &'a FunctionAnalysis, owner: &'a AnalyzedOwner) -> CompileResult<Self> {
        let info = &owner.info;
        let body = MirBody::new(info.owner, info.name.clone(), info.convention, info.span);
        let mut this = Self {
            cx,
            analysis,
            owner,
            body,
            current: BasicBlockId::ENTRY,
            symbols: HashMap::new(),
            expr_temps: HashMap::new(),
            loops: Vec::new(),
        };

        for &sym in &info.params {
            let local = this.declare(sym, LocalKind::Param);
            this.body.params.push(local);
        }
        if matches!(info.owner, OwnerRef::Function(_)) {
            if let Some(&sym) = owner.liveness.captures.first() {
                return Err(CompileError::new(
                    ErrorCode::UnknownSymbol,
                    format!(
                        "`{}` is read in `{}` before it is bound",
                        this.symbol_name(sym),
                        info.name
                    ),
                    info.span,
                ));
            }
        }
        for &sym in &owner.liveness.captures {
            let local = this.declare(sym, LocalKind::Capture);
            this.body.captures.push(local);
        }
        if let OwnerRef::Clause { handle, index } = info.owner {
            let span = info.span;
            this.body.self_frame =
                Some(this.body.new_local(LocalKind::SelfFrame, Some("self_frame".into()), span));
            this.body.request =
                Some(this.body.new_local(LocalKind::Request, Some("request".into()), span));
            let clause = this.clause(handle, index)?;
            let op = cx.registry.effect(clause.effect)?.op(clause.op)?;
            this.body.tail_clause = op.resume_kind.is_tail();
        }
        Ok(this)
    }

    fn lower(mut self) -> CompileResult<MirBody> {
        let span = self.owner.info.span;
        let value = self.lower_expr(self.owner.info.body)?;
        self.emit_return(value, span);

        for bb in &mut self.body.basic_blocks {
            if bb.terminator.is_none() {
                bb.terminator = Some(Terminator {
                    kind: TerminatorKind::Trap(TrapKind::Unreachable),
                    span,
                });
            }
        }
        self.body.sites.sort_by_key(|site| site.order);
        let expected = self.owner.liveness.sites.len();
        if self.body.sites.len() != expected
            || self.body.sites.iter().enumerate().any(|(i, s)| s.order as usize != i)
        {
            return Err(ice_err!(span, "lowered sites disagree with liveness";
                "owner" => self.owner.info.owner,
                "lowered" => self.body.sites.len(),
                "expected" => expected));
        }
        tracing::debug!(
            owner = %self.body.name,
            blocks = self.body.basic_blocks.len(),
            locals = self.body.locals.len(),
            sites = self.body.sites.len(),
            "lowered owner"
        );
        Ok(self.body)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn symbol_name(&self, sym: SymbolId) -> String {
        self.cx
            .module
            .symbols
            .name(sym)
            .map(str::to_string)
            .unwrap_or_else(|| sym.to_string())
    }

    fn declare(&mut self, sym: SymbolId, kind: LocalKind) -> LocalId {
        let name = self.symbol_name(sym);
        let local = self.body.new_local(kind, Some(name), self.owner.info.span);
        self.symbols.insert(sym, local);
        local
    }

    fn local_for(&mut self, sym: SymbolId) -> LocalId {
        match self.symbols.get(&sym) {
            Some(&local) => local,
            None => self.declare(sym, LocalKind::Var),
        }
    }

    fn temp_for(&mut self, expr: ExprId) -> LocalId {
        if let Some(&local) = self.expr_temps.get(&expr) {
            return local;
        }
        let span = self.span_of(expr);
        let local = self.body.new_temp(span);
        self.expr_temps.insert(expr, local);
        local
    }

    fn span_of(&self, expr: ExprId) -> Span {
        self.cx.module.exprs.get(expr).map(|e| e.span).unwrap_or_default()
    }

    fn clause(&self, handle: ExprId, index: u32) -> CompileResult<&'a HandlerClause> {
        let module: &'a Module = self.cx.module;
        match &module.expr(handle)?.kind {
            ExprKind::Handle { clauses, .. } => clauses
                .get(index as usize)
                .ok_or_else(|| ice_err!(self.span_of(handle), "clause index out of range"; "index" => index)),
            _ => Err(ice_err!(self.span_of(handle), "clause owner is not a handle"; "expr" => handle)),
        }
    }

    fn push(&mut self, kind: StatementKind, span: Span) {
        self.body.push_statement(self.current, Statement { kind, span });
    }

    fn assign(&mut self, local: LocalId, rvalue: Rvalue, span: Span) {
        self.push(StatementKind::Assign(local, rvalue), span);
    }

    /// Assign an rvalue to a fresh temporary.
    fn temp(&mut self, rvalue: Rvalue, span: Span) -> Operand {
        let local = self.body.new_temp(span);
        self.assign(local, rvalue, span);
        Operand::Copy(local)
    }

    fn terminate(&mut self, kind: TerminatorKind, span: Span) {
        self.body.set_terminator(self.current, Terminator { kind, span });
    }

    fn goto(&mut self, target: BasicBlockId, span: Span) {
        self.terminate(TerminatorKind::Goto { target }, span);
    }

    /// Continue lowering in a fresh block nothing jumps to.
    fn start_dead_block(&mut self) {
        self.current = self.body.new_block();
    }

    fn emit_return(&mut self, value: Operand, span: Span) {
        if self.body.tail_clause {
            self.push(StatementKind::TailCheck, span);
        }
        self.terminate(TerminatorKind::Return(value), span);
    }

    fn capture_operands(&mut self, owner: OwnerRef) -> CompileResult<Vec<Operand>> {
        let analysis: &'a FunctionAnalysis = self.analysis;
        let nested = analysis
            .owner(owner)
            .ok_or_else(|| ice_err!(self.owner.info.span, "nested owner was not analyzed"; "owner" => owner))?;
        Ok(nested
            .liveness
            .captures
            .iter()
            .map(|&sym| Operand::Copy(self.local_for(sym)))
            .collect())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn lower_opt(&mut self, expr: Option<ExprId>) -> CompileResult<Operand> {
        match expr {
            Some(e) => self.lower_expr(e),
            None => Ok(Operand::UNIT),
        }
    }

    /// Lower an expression, materializing it into its temporary when a
    /// later site needs its value.
    fn lower_expr(&mut self, expr: ExprId) -> CompileResult<Operand> {
        let value = self.lower_expr_inner(expr)?;
        if self.owner.liveness.temp_exprs.contains(&expr) {
            let temp = self.temp_for(expr);
            if value != Operand::Copy(temp) {
                let span = self.span_of(expr);
                self.assign(temp, Rvalue::Use(value), span);
            }
            return Ok(Operand::Copy(temp));
        }
        Ok(value)
    }

    fn lower_expr_inner(&mut self, expr: ExprId) -> CompileResult<Operand> {
        let module: &'a Module = self.cx.module;
        let node = module.expr(expr)?;
        let span = node.span;
        match &node.kind {
            ExprKind::Literal(lit) => Ok(Operand::Const(constant(*lit))),
            ExprKind::Local(sym) => {
                // Copied so later assignments in the same expression cannot
                // change an already evaluated operand.
                let local = self.local_for(*sym);
                Ok(self.temp(Rvalue::Use(Operand::Copy(local)), span))
            }
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { pattern, init } => {
                            let value = self.lower_expr(*init)?;
                            if !pattern.is_irrefutable() {
                                let fail = self.trap_block(TrapKind::NoMatch, span);
                                self.test_pattern(pattern, value, fail, span)?;
                            }
                            self.bind_pattern(pattern, value, span);
                        }
                        Stmt::Expr(e) => {
                            self.lower_expr(*e)?;
                        }
                    }
                }
                self.lower_opt(*tail)
            }
            ExprKind::Assign { target, value } => {
                let value = self.lower_expr(*value)?;
                let local = self.local_for(*target);
                self.assign(local, Rvalue::Use(value), span);
                Ok(Operand::UNIT)
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.lower_if(*cond, *then_branch, *else_branch, span),
            ExprKind::Match { scrutinee, arms } => self.lower_match(*scrutinee, arms, span),
            ExprKind::While { cond, body } => self.lower_loop(Some(*cond), *body, span),
            ExprKind::Loop { body } => self.lower_loop(None, *body, span),
            ExprKind::Break { value } => {
                let value = self.lower_opt(*value)?;
                let scope = self
                    .loops
                    .last()
                    .ok_or_else(|| ice_err!(span, "break outside a loop"; "expr" => expr))?;
                let (target, result) = (scope.break_block, scope.result);
                if let Some(result) = result {
                    self.assign(result, Rvalue::Use(value), span);
                }
                self.goto(target, span);
                self.start_dead_block();
                Ok(Operand::UNIT)
            }
            ExprKind::Continue => {
                let target = self
                    .loops
                    .last()
                    .map(|scope| scope.continue_block)
                    .ok_or_else(|| ice_err!(span, "continue outside a loop"; "expr" => expr))?;
                self.goto(target, span);
                self.start_dead_block();
                Ok(Operand::UNIT)
            }
            ExprKind::Return { value } => {
                let value = self.lower_opt(*value)?;
                self.emit_return(value, span);
                self.start_dead_block();
                Ok(Operand::UNIT)
            }
            ExprKind::Tuple(items) => {
                let values = self.lower_list(items)?;
                Ok(self.temp(Rvalue::Aggregate(values), span))
            }
            ExprKind::Call { callee, args } => self.lower_call(expr, *callee, args, span),
            ExprKind::Binary { op, lhs, rhs } => match BinOp::from_hir(*op) {
                Some(bin) => {
                    let a = self.lower_expr(*lhs)?;
                    let b = self.lower_expr(*rhs)?;
                    Ok(self.temp(Rvalue::BinaryOp(bin, a, b), span))
                }
                None => self.lower_short_circuit(*op, *lhs, *rhs, span),
            },
            ExprKind::Unary { op, operand } => {
                let value = self.lower_expr(*operand)?;
                let op = match op {
                    hir::UnOp::Neg => UnOp::Neg,
                    hir::UnOp::Not => UnOp::Not,
                };
                Ok(self.temp(Rvalue::UnaryOp(op, value), span))
            }
            ExprKind::Lambda { .. } => {
                let owner = OwnerRef::Lambda(expr);
                let captures = self.capture_operands(owner)?;
                Ok(self.temp(Rvalue::Closure { owner, captures }, span))
            }
            ExprKind::Handle {
                clauses, finally, ..
            } => self.lower_handle(expr, clauses, *finally, span),
            ExprKind::Resume { value, .. } => {
                let value = self.lower_opt(*value)?;
                let dest = self.body.new_temp(span);
                self.suspend(expr, SuspendAction::Resume { value }, dest, span)?;
                Ok(Operand::Copy(dest))
            }
            ExprKind::TailResume { value, .. } => {
                let value = self.lower_opt(*value)?;
                self.push(StatementKind::TailBump, span);
                Ok(value)
            }
            ExprKind::Object { ty, fields } => self.lower_object(*ty, fields, span),
            ExprKind::Field { base, ty, name } => {
                let base = self.lower_expr(*base)?;
                let index = self.cx.program.types.field_index(*ty, name).ok_or_else(|| {
                    CompileError::new(
                        ErrorCode::MissingType,
                        format!("type {ty:?} has no field `{name}`"),
                        span,
                    )
                })?;
                Ok(self.temp(Rvalue::Project { base, index }, span))
            }
        }
    }

    fn lower_list(&mut self, items: &[ExprId]) -> CompileResult<Vec<Operand>> {
        items.iter().map(|&item| self.lower_expr(item)).collect()
    }

    fn lower_if(
        &mut self,
        cond: ExprId,
        then_branch: ExprId,
        else_branch: Option<ExprId>,
        span: Span,
    ) -> CompileResult<Operand> {
        let cond = self.lower_expr(cond)?;
        let result = self.body.new_temp(span);
        let then_block = self.body.new_block();
        let else_block = self.body.new_block();
        let join = self.body.new_block();
        self.terminate(
            TerminatorKind::SwitchBool {
                cond,
                then_block,
                else_block,
            },
            span,
        );

        self.current = then_block;
        let value = self.lower_expr(then_branch)?;
        self.assign(result, Rvalue::Use(value), span);
        self.goto(join, span);

        self.current = else_block;
        let value = self.lower_opt(else_branch)?;
        self.assign(result, Rvalue::Use(value), span);
        self.goto(join, span);

        self.current = join;
        Ok(Operand::Copy(result))
    }

    fn lower_short_circuit(&mut self, op: hir::BinOp, lhs: ExprId, rhs: ExprId, span: Span) -> CompileResult<Operand> {
        let lhs = self.lower_expr(lhs)?;
        let result = self.body.new_temp(span);
        let eval_rhs = self.body.new_block();
        let short = self.body.new_block();
        let join = self.body.new_block();
        let (then_block, else_block, short_value) = match op {
            hir::BinOp::And => (eval_rhs, short, false),
            _ => (short, eval_rhs, true),
        };
        self.terminate(
            TerminatorKind::SwitchBool {
                cond: lhs,
                then_block,
                else_block,
            },
            span,
        );

        self.current = eval_rhs;
        let value = self.lower_expr(rhs)?;
        self.assign(result, Rvalue::Use(value), span);
        self.goto(join, span);

        self.current = short;
        self.assign(
            result,
            Rvalue::Use(Operand::Const(Constant::Bool(short_value))),
            span,
        );
        self.goto(join, span);

        self.current = join;
        Ok(Operand::Copy(result))
    }

    fn lower_match(&mut self, scrutinee: ExprId, arms: &[hir::MatchArm], span: Span) -> CompileResult<Operand> {
        let value = self.lower_expr(scrutinee)?;
        let result = self.body.new_temp(span);
        let join = self.body.new_block();

        for arm in arms {
            let next = self.body.new_block();
            self.test_pattern(&arm.pattern, value, next, span)?;
            self.bind_pattern(&arm.pattern, value, span);
            if let Some(guard) = arm.guard {
                let cond = self.lower_expr(guard)?;
                let body_block = self.body.new_block();
                self.terminate(
                    TerminatorKind::SwitchBool {
                        cond,
                        then_block: body_block,
                        else_block: next,
                    },
                    span,
                );
                self.current = body_block;
            }
            let arm_value = self.lower_expr(arm.body)?;
            self.assign(result, Rvalue::Use(arm_value), span);
            self.goto(join, span);
            self.current = next;
        }
        self.terminate(TerminatorKind::Trap(TrapKind::NoMatch), span);

        self.current = join;
        Ok(Operand::Copy(result))
    }

    fn lower_loop(&mut self, cond: Option<ExprId>, body: ExprId, span: Span) -> CompileResult<Operand> {
        let head = self.body.new_block();
        let exit = self.body.new_block();
        let result = match cond {
            Some(_) => None,
            None => Some(self.body.new_temp(span)),
        };
        self.goto(head, span);
        self.current = head;

        if let Some(cond) = cond {
            let cond = self.lower_expr(cond)?;
            let body_block = self.body.new_block();
            self.terminate(
                TerminatorKind::SwitchBool {
                    cond,
                    then_block: body_block,
                    else_block: exit,
                },
                span,
            );
            self.current = body_block;
        }

        self.loops.push(LoopScope {
            break_block: exit,
            continue_block: head,
            result,
        });
        let lowered = self.lower_expr(body);
        self.loops.pop();
        lowered?;
        self.goto(head, span);

        self.current = exit;
        Ok(result.map(Operand::Copy).unwrap_or(Operand::UNIT))
    }

    fn lower_call(&mut self, expr: ExprId, callee: Callee, args: &[ExprId], span: Span) -> CompileResult<Operand> {
        let module: &'a Module = self.cx.module;
        match module.call_kind(expr)? {
            CallKind::Pure => {
                let target = self.call_target(callee, false, span)?;
                let args = self.lower_list(args)?;
                Ok(self.temp(Rvalue::PureCall { target, args }, span))
            }
            CallKind::Effectful => {
                let target = self.call_target(callee, true, span)?;
                let args = self.lower_list(args)?;
                let dest = self.body.new_temp(span);
                self.suspend(expr, SuspendAction::Call { target, args }, dest, span)?;
                Ok(Operand::Copy(dest))
            }
            CallKind::Perform {
                effect,
                op,
                type_args,
            } => {
                let resolved = self.cx.registry.resolve(*effect, *op, type_args)?;
                if resolved.arity != args.len() {
                    return Err(CompileError::new(
                        ErrorCode::UnknownOperation,
                        format!(
                            "operation #{op} takes {} arguments, {} given",
                            resolved.arity,
                            args.len()
                        ),
                        span,
                    ));
                }
                let args = self.lower_list(args)?;
                let op = PerformOp {
                    effect: resolved.key.effect,
                    op_id: resolved.key.op_id,
                    op_index: resolved.op_index,
                    resume_kind: resolved.resume_kind,
                };
                let direct = self.direct_clause(*effect, op.op_id, op.resume_kind)?;
                let dest = self.body.new_temp(span);
                self.suspend(expr, SuspendAction::Perform { op, args, direct }, dest, span)?;
                Ok(Operand::Copy(dest))
            }
        }
    }

    /// The callee of a call, checking a static callee against the call's
    /// classification.
    fn call_target(&mut self, callee: Callee, effectful: bool, span: Span) -> CompileResult<CallTarget> {
        match callee {
            Callee::Def(def) => {
                self.check_callee(def, effectful, span)?;
                Ok(CallTarget::Function(def))
            }
            Callee::Expr(e) => Ok(CallTarget::Closure(self.lower_expr(e)?)),
        }
    }

    fn check_callee(&self, def: DefId, effectful: bool, span: Span) -> CompileResult<()> {
        let program = self.cx.program;
        let (_, func) = program.function(def).ok_or_else(|| {
            CompileError::new(
                ErrorCode::UnresolvedCallee,
                format!("{def} does not resolve to a function"),
                span,
            )
        })?;
        if program.is_effectful(func.signature)? != effectful {
            let expected = if effectful { "effectful" } else { "pure" };
            return Err(CompileError::new(
                ErrorCode::ConventionMismatch,
                format!("call to `{}` is classified {expected}", func.name),
                span,
            ));
        }
        Ok(())
    }

    /// A tail clause of the handle construct whose body this owner is.
    fn direct_clause(&self, effect: DefId, op_id: u32, kind: ResumeKind) -> CompileResult<Option<DirectClause>> {
        if !self.cx.config.direct_tail_calls || !kind.is_tail() {
            return Ok(None);
        }
        let OwnerRef::HandleBody(handle) = self.owner.info.owner else {
            return Ok(None);
        };
        let module: &'a Module = self.cx.module;
        let ExprKind::Handle { clauses, .. } = &module.expr(handle)?.kind else {
            return Ok(None);
        };
        let found = clauses
            .iter()
            .position(|clause| clause.effect == effect && clause.op == op_id);
        Ok(found.map(|index| DirectClause {
            owner: OwnerRef::Clause {
                handle,
                index: index as u32,
            },
            depth: (clauses.len() - 1 - index) as u32,
        }))
    }

    fn lower_handle(
        &mut self,
        expr: ExprId,
        clauses: &[HandlerClause],
        finally: Option<ExprId>,
        span: Span,
    ) -> CompileResult<Operand> {
        let marker = self.body.new_local(LocalKind::Marker, Some("marker".into()), span);
        self.assign(marker, Rvalue::Marker, span);

        let mut frames = Vec::with_capacity(clauses.len());
        for (index, clause) in clauses.iter().enumerate() {
            let owner = OwnerRef::Clause {
                handle: expr,
                index: index as u32,
            };
            let info = self.cx.registry.effect(clause.effect)?;
            let op = info.op(clause.op)?;
            frames.push(ClauseFrame {
                owner,
                effect: info.id,
                op_id: clause.op,
                resume_kind: op.resume_kind,
                captures: self.capture_operands(owner)?,
            });
        }
        let body = OwnerRef::HandleBody(expr);
        let body_captures = self.capture_operands(body)?;

        let dest = if self.owner.liveness.temp_exprs.contains(&expr) {
            self.temp_for(expr)
        } else {
            self.body.new_temp(span)
        };
        self.suspend(
            expr,
            SuspendAction::Handle {
                marker,
                clauses: frames,
                body,
                body_captures,
            },
            dest,
            span,
        )?;
        if let Some(finally) = finally {
            self.lower_expr(finally)?;
        }
        Ok(Operand::Copy(dest))
    }

    fn lower_object(&mut self, ty: TypeId, fields: &[(String, ExprId)], span: Span) -> CompileResult<Operand> {
        let program = self.cx.program;
        let slot_count = match program.ty(ty)? {
            TypeKind::Structural { fields } => fields.len(),
            other => {
                return Err(CompileError::new(
                    ErrorCode::MissingType,
                    format!("object literal of non-structural type {other:?}"),
                    span,
                ))
            }
        };
        let mut slots = vec![None; slot_count];
        for (name, value) in fields {
            let value = self.lower_expr(*value)?;
            let index = program.types.field_index(ty, name).ok_or_else(|| {
                CompileError::new(
                    ErrorCode::MissingType,
                    format!("type {ty:?} has no field `{name}`"),
                    span,
                )
            })?;
            slots[index as usize] = Some(value);
        }
        let slots = slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| {
                slot.ok_or_else(|| {
                    CompileError::new(
                        ErrorCode::MissingType,
                        format!("object literal leaves field #{i} of {ty:?} uninitialized"),
                        span,
                    )
                })
            })
            .collect::<CompileResult<Vec<_>>>()?;
        Ok(self.temp(Rvalue::Aggregate(slots), span))
    }

    // ========================================================================
    // Sites
    // ========================================================================

    fn suspend(&mut self, expr: ExprId, action: SuspendAction, dest: LocalId, span: Span) -> CompileResult<()> {
        let liveness = &self.owner.liveness;
        let site = liveness
            .site(expr)
            .ok_or_else(|| ice_err!(span, "suspension without an analyzed site"; "expr" => expr))?;

        let mut saved: Vec<LocalId> = Vec::new();
        let mut save = |local: LocalId| {
            if !saved.contains(&local) {
                saved.push(local);
            }
        };
        for &sym in &site.live_after {
            save(self.local_for(sym));
        }
        for &temp in &site.temps {
            save(self.temp_for(temp));
        }
        if let SuspendAction::Handle { marker, .. } = &action {
            save(*marker);
        }
        if let Some(self_frame) = self.body.self_frame {
            save(self_frame);
        }
        if let Some(request) = self.body.request {
            save(request);
        }

        tracing::trace!(owner = %self.body.name, site = site.order, saved = saved.len(), "suspend");
        let resume = self.body.new_block();
        self.body.sites.push(SiteInfo {
            order: site.order,
            expr,
            kind: site.kind,
            saved,
            span,
        });
        self.terminate(
            TerminatorKind::Suspend {
                site: site.order,
                action,
                dest,
                resume,
            },
            span,
        );
        self.current = resume;
        Ok(())
    }

    // ========================================================================
    // Patterns
    // ========================================================================

    fn trap_block(&mut self, kind: TrapKind, span: Span) -> BasicBlockId {
        let block = self.body.new_block();
        self.body.set_terminator(
            block,
            Terminator {
                kind: TerminatorKind::Trap(kind),
                span,
            },
        );
        block
    }

    /// Branch to `fail` unless `value` matches `pattern`.
    fn test_pattern(&mut self, pattern: &Pattern, value: Operand, fail: BasicBlockId, span: Span) -> CompileResult<()> {
        match pattern {
            Pattern::Wildcard | Pattern::Bind(_) | Pattern::Literal(Literal::Unit) => Ok(()),
            Pattern::Literal(lit) => {
                let cond = self.temp(
                    Rvalue::BinaryOp(BinOp::Eq, value, Operand::Const(constant(*lit))),
                    span,
                );
                let next = self.body.new_block();
                self.terminate(
                    TerminatorKind::SwitchBool {
                        cond,
                        then_block: next,
                        else_block: fail,
                    },
                    span,
                );
                self.current = next;
                Ok(())
            }
            Pattern::Tuple(items) => {
                for (index, item) in items.iter().enumerate() {
                    if item.is_irrefutable() {
                        continue;
                    }
                    let elem = self.temp(
                        Rvalue::Project {
                            base: value,
                            index: index as u32,
                        },
                        span,
                    );
                    self.test_pattern(item, elem, fail, span)?;
                }
                Ok(())
            }
        }
    }

    fn bind_pattern(&mut self, pattern: &Pattern, value: Operand, span: Span) {
        match pattern {
            Pattern::Bind(sym) => {
                let local = self.local_for(*sym);
                self.assign(local, Rvalue::Use(value), span);
            }
            Pattern::Tuple(items) => {
                for (index, item) in items.iter().enumerate() {
                    if item.bindings().is_empty() {
                        continue;
                    }
                    let elem = self.temp(
                        Rvalue::Project {
                            base: value,
                            index: index as u32,
                        },
                        span,
                    );
                    self.bind_pattern(item, elem, span);
                }
            }
            Pattern::Wildcard | Pattern::Literal(_) => {}
        }
    }
}

fn constant(lit: Literal) -> Constant {
    match lit {
        Literal::Unit => Constant::Unit,
        Literal::Bool(b) => Constant::Bool(b),
        Literal::Int(n) => Constant::Int(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::analyze_function;
    use crate::effects::EffectRegistry;
    use crate::hir::build::{ModuleBuilder, ProgramBuilder};
    use crate::hir::OpDecl;

    fn lower(program: &Program, def: DefId, config: &CompilerConfig) -> CompileResult<Vec<MirBody>> {
        let mut registry = EffectRegistry::new(config);
        for module in &program.modules {
            registry.register_module(program, module)?;
        }
        let registry = registry.finalize();
        let (module, func) = program.function(def).unwrap();
        let analysis = analyze_function(program, module, func)?;
        let cx = LoweringCx {
            program,
            module,
            registry: &registry,
            config,
        };
        lower_function(cx, &analysis)
    }

    fn suspends(body: &MirBody) -> Vec<&SuspendAction> {
        body.basic_blocks
            .iter()
            .filter_map(|bb| match &bb.terminator {
                Some(Terminator {
                    kind: TerminatorKind::Suspend { action, .. },
                    ..
                }) => Some(action),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_perform_saves_live_params() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = m.effect("Io", vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)]);
        let x = m.symbol("x");
        let y = m.symbol("y");
        let x1 = m.local(x);
        let read = m.perform(io, 0, vec![x1]);
        let y1 = m.local(y);
        let x2 = m.local(x);
        let sum = m.add(y1, x2);
        let body = m.block(vec![ModuleBuilder::let_(y, read)], Some(sum));
        let def = m.function("f", vec![(x, int)], int, vec![io], body);
        m.finish();
        let program = b.finish();

        let bodies = lower(&program, def, &CompilerConfig::default()).unwrap();
        assert_eq!(bodies.len(), 1);
        let body = &bodies[0];
        assert!(body.is_complete());
        assert_eq!(body.sites.len(), 1);
        assert_eq!(body.sites[0].saved, body.params);
        assert_eq!(body.local(body.params[0]).unwrap().kind, LocalKind::Param);
        match suspends(body)[..] {
            [SuspendAction::Perform { op, args, direct }] => {
                assert_eq!(op.op_index, 0);
                assert_eq!(args.len(), 1);
                assert!(direct.is_none());
            }
            ref other => panic!("unexpected suspends: {other:?}"),
        }
    }

    #[test]
    fn test_tail_clause_bumps_and_checks() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let ask = m.effect("Ask", vec![OpDecl::simple("ask", vec![], int, ResumeKind::Tail)]);
        let k = m.symbol("k");
        let seven = m.int(7);
        let clause_body = m.tail(k, Some(seven));
        let perform = m.perform(ask, 0, vec![]);
        let handle = m.handle(
            perform,
            vec![ModuleBuilder::clause(ask, 0, vec![], Some(k), clause_body)],
            None,
        );
        let def = m.function("main", vec![], int, vec![], handle);
        m.finish();
        let program = b.finish();

        let bodies = lower(&program, def, &CompilerConfig::default()).unwrap();
        let clause = bodies
            .iter()
            .find(|b| matches!(b.owner, OwnerRef::Clause { .. }))
            .unwrap();
        assert!(clause.tail_clause);
        assert_eq!(clause.tail_bumps(), 1);
        assert!(clause.self_frame.is_some() && clause.request.is_some());
        let checks = clause
            .basic_blocks
            .iter()
            .flat_map(|bb| &bb.statements)
            .filter(|s| matches!(s.kind, StatementKind::TailCheck))
            .count();
        assert_eq!(checks, 1);

        let body = bodies
            .iter()
            .find(|b| b.owner == OwnerRef::HandleBody(handle))
            .unwrap();
        match suspends(body)[..] {
            [SuspendAction::Perform { direct: Some(direct), .. }] => {
                assert_eq!(direct.owner, OwnerRef::Clause { handle, index: 0 });
                assert_eq!(direct.depth, 0);
            }
            ref other => panic!("unexpected suspends: {other:?}"),
        }

        let config = CompilerConfig::builder().direct_tail_calls(false).build().unwrap();
        let bodies = lower(&program, def, &config).unwrap();
        let body = bodies
            .iter()
            .find(|b| b.owner == OwnerRef::HandleBody(handle))
            .unwrap();
        assert!(matches!(
            suspends(body)[..],
            [SuspendAction::Perform { direct: None, .. }]
        ));
    }

    #[test]
    fn test_handle_site_saves_marker() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = m.effect("Io", vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)]);
        let outer = m.effect("Outer", vec![OpDecl::simple("log", vec![int], int, ResumeKind::Resume)]);
        let one = m.int(1);
        let read = m.perform(io, 0, vec![one]);
        let handle = m.handle(read, vec![], None);
        let def = m.function("f", vec![], int, vec![io, outer], handle);
        m.finish();
        let program = b.finish();

        let bodies = lower(&program, def, &CompilerConfig::default()).unwrap();
        let root = &bodies[0];
        let marker = root
            .locals
            .iter()
            .find(|l| l.kind == LocalKind::Marker)
            .unwrap()
            .id;
        assert_eq!(root.sites[0].saved, vec![marker]);
    }

    #[test]
    fn test_pure_fact_must_match_callee() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = m.effect("Io", vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)]);
        let one = m.int(1);
        let read = m.perform(io, 0, vec![one]);
        let callee = m.function("reader", vec![], int, vec![io], read);
        let call = m.call(callee, vec![]);
        let def = m.function("main", vec![], int, vec![], call);
        m.finish();
        let program = b.finish();

        let err = lower(&program, def, &CompilerConfig::default()).unwrap_err();
        assert_eq!(err.code, Some(ErrorCode::ConventionMismatch));
    }

    #[test]
    fn test_match_lowers_to_switches() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let x = m.symbol("x");
        let scrutinee = m.local(x);
        let ten = m.int(10);
        let twenty = m.int(20);
        let arms = vec![
            hir::MatchArm {
                pattern: Pattern::Literal(Literal::Int(1)),
                guard: None,
                body: ten,
            },
            hir::MatchArm {
                pattern: Pattern::Wildcard,
                guard: None,
                body: twenty,
            },
        ];
        let body = m.match_(scrutinee, arms);
        let def = m.function("f", vec![(x, int)], int, vec![], body);
        m.finish();
        let program = b.finish();

        let bodies = lower(&program, def, &CompilerConfig::default()).unwrap();
        let body = &bodies[0];
        assert!(body.sites.is_empty());
        let traps = body
            .basic_blocks
            .iter()
            .filter(|bb| {
                matches!(
                    bb.terminator,
                    Some(Terminator {
                        kind: TerminatorKind::Trap(TrapKind::NoMatch),
                        ..
                    })
                )
            })
            .count();
        assert_eq!(traps, 1);
        assert!(body.to_string().contains("Eq("));
    }
}

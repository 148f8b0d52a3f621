//! Backward liveness over one owner.
//!
//! The analyzer walks an owner body from its exit towards its entry,
//! computing the symbols live at each point. At every suspension site it
//! records the live-after set and the operand temporaries that must survive
//! the suspension; the continuation of that site restores exactly these.
//!
//! Nested owners (lambdas, handle bodies, clauses) are analyzed first; here
//! they contribute only their captures, which are read when the closure or
//! frame is built.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::owners::{OwnerInfo, OwnerRef};
use super::sites::{forward_order, site_kind, Site, SiteIndex, SiteKind};
use crate::error::CompileResult;
use crate::hir::{Callee, ExprId, ExprKind, Module, Stmt, SymbolId};
use crate::ice_err;
use crate::span::Span;

pub type LiveSet = BTreeSet<SymbolId>;

/// Liveness result of one owner.
#[derive(Debug, Clone)]
pub struct OwnerLiveness {
    /// Symbols live at owner entry.
    pub live_in: LiveSet,
    /// Entry live set minus parameters: the values the owner's creator
    /// must provide.
    pub captures: Vec<SymbolId>,
    /// Sites in forward evaluation order; `sites[i].order == i`.
    pub sites: Vec<Site>,
    /// Expressions whose values are held in a temporary across a site.
    pub temp_exprs: BTreeSet<ExprId>,
}

impl OwnerLiveness {
    pub fn site(&self, expr: ExprId) -> Option<&Site> {
        self.sites.iter().find(|s| s.expr == expr)
    }
}

#[derive(Debug)]
struct RawSite {
    kind: SiteKind,
    live_after: LiveSet,
    temps: Vec<ExprId>,
}

#[derive(Debug)]
struct LoopCtx {
    break_live: LiveSet,
    continue_live: LiveSet,
}

/// Per-owner analyzer state.
pub struct LivenessAnalyzer<'a> {
    module: &'a Module,
    /// Captures of already analyzed nested owners.
    nested: &'a HashMap<OwnerRef, Vec<SymbolId>>,
    span: Span,
    bound: usize,
    recording: bool,
    temps: Vec<ExprId>,
    loops: Vec<LoopCtx>,
    raw_sites: BTreeMap<ExprId, RawSite>,
    temp_exprs: BTreeSet<ExprId>,
    index: SiteIndex,
}

impl<'a> LivenessAnalyzer<'a> {
    pub fn new(module: &'a Module, nested: &'a HashMap<OwnerRef, Vec<SymbolId>>) -> Self {
        Self {
            module,
            nested,
            span: Span::dummy(),
            bound: module.symbols.len() + 2,
            recording: true,
            temps: Vec::new(),
            loops: Vec::new(),
            raw_sites: BTreeMap::new(),
            temp_exprs: BTreeSet::new(),
            index: SiteIndex::default(),
        }
    }

    /// Analyze one owner. The analyzer is consumed; use a fresh one per
    /// owner.
    pub fn analyze_owner(mut self, owner: &OwnerInfo) -> CompileResult<OwnerLiveness> {
        self.span = owner.span;
        let live_in = self.analyze(owner.body, LiveSet::new())?;
        let captures: Vec<SymbolId> = live_in
            .iter()
            .copied()
            .filter(|sym| !owner.params.contains(sym))
            .collect();

        let order = forward_order(self.module, owner.body)?;
        let mut sites = Vec::with_capacity(order.len());
        for (position, expr) in order.into_iter().enumerate() {
            let raw = self.raw_sites.remove(&expr).ok_or_else(|| {
                ice_err!(self.span, "site was never reached by liveness";
                    "owner" => owner.owner, "expr" => expr)
            })?;
            sites.push(Site {
                expr,
                kind: raw.kind,
                order: position as u32,
                live_after: raw.live_after,
                temps: raw.temps,
            });
        }
        if let Some(expr) = self.raw_sites.keys().next() {
            return Err(ice_err!(self.span, "liveness recorded a site outside the owner";
                "owner" => owner.owner, "expr" => *expr));
        }

        tracing::debug!(
            owner = %owner.name,
            sites = sites.len(),
            captures = captures.len(),
            temps = self.temp_exprs.len(),
            "analyzed owner"
        );
        Ok(OwnerLiveness {
            live_in,
            captures,
            sites,
            temp_exprs: self.temp_exprs,
        })
    }

    fn contains_site(&mut self, expr: ExprId) -> CompileResult<bool> {
        self.index.contains_site(self.module, expr)
    }

    fn record(&mut self, expr: ExprId, kind: SiteKind, live_after: &LiveSet) {
        if !self.recording {
            return;
        }
        tracing::trace!(%expr, %kind, live = live_after.len(), temps = self.temps.len(), "site");
        self.raw_sites.insert(
            expr,
            RawSite {
                kind,
                live_after: live_after.clone(),
                temps: self.temps.clone(),
            },
        );
    }

    fn nested_captures(&self, owner: OwnerRef) -> CompileResult<&'a [SymbolId]> {
        self.nested
            .get(&owner)
            .map(Vec::as_slice)
            .ok_or_else(|| ice_err!(self.span, "nested owner analyzed out of order"; "owner" => owner))
    }

    fn analyze_opt(&mut self, expr: Option<ExprId>, out: LiveSet) -> CompileResult<LiveSet> {
        match expr {
            Some(e) => self.analyze(e, out),
            None => Ok(out),
        }
    }

    /// Live set before `expr`, given the live set after it.
    fn analyze(&mut self, expr: ExprId, out: LiveSet) -> CompileResult<LiveSet> {
        let module = self.module;
        let kind = &module.expr(expr)?.kind;
        match kind {
            ExprKind::Literal(_) => Ok(out),
            ExprKind::Local(sym) => {
                let mut live = out;
                live.insert(*sym);
                Ok(live)
            }
            ExprKind::Block { stmts, tail } => {
                let mut live = self.analyze_opt(*tail, out)?;
                for stmt in stmts.iter().rev() {
                    live = match stmt {
                        Stmt::Let { pattern, init } => {
                            for sym in pattern.bindings() {
                                live.remove(&sym);
                            }
                            self.analyze(*init, live)?
                        }
                        Stmt::Expr(e) => self.analyze(*e, live)?,
                    };
                }
                Ok(live)
            }
            ExprKind::Assign { target, value } => {
                let mut live = out;
                live.remove(target);
                self.analyze(*value, live)
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let mut live = self.analyze(*then_branch, out.clone())?;
                live.extend(self.analyze_opt(*else_branch, out)?);
                self.analyze(*cond, live)
            }
            ExprKind::Match { scrutinee, arms } => {
                // Falling off the last arm traps.
                let mut next = LiveSet::new();
                for arm in arms.iter().rev() {
                    let body_in = self.analyze(arm.body, out.clone())?;
                    let mut tested = match arm.guard {
                        Some(guard) => {
                            let mut guard_out = body_in;
                            guard_out.extend(next.iter().copied());
                            if self.contains_site(guard)? {
                                self.temp_exprs.insert(*scrutinee);
                                self.temps.push(*scrutinee);
                                let live = self.analyze(guard, guard_out);
                                self.temps.pop();
                                live?
                            } else {
                                self.analyze(guard, guard_out)?
                            }
                        }
                        None => body_in,
                    };
                    for sym in arm.pattern.bindings() {
                        tested.remove(&sym);
                    }
                    tested.extend(next);
                    next = tested;
                }
                self.analyze(*scrutinee, next)
            }
            ExprKind::While { cond, body } => self.analyze_loop(out, Some(*cond), *body),
            ExprKind::Loop { body } => self.analyze_loop(out, None, *body),
            ExprKind::Break { value } => {
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| ice_err!(self.span, "break outside a loop"; "expr" => expr))?;
                let after = ctx.break_live.clone();
                self.analyze_opt(*value, after)
            }
            ExprKind::Continue => {
                let ctx = self
                    .loops
                    .last()
                    .ok_or_else(|| ice_err!(self.span, "continue outside a loop"; "expr" => expr))?;
                Ok(ctx.continue_live.clone())
            }
            ExprKind::Return { value } => self.analyze_opt(*value, LiveSet::new()),
            ExprKind::Tuple(items) => self.analyze_ordered(items, out),
            ExprKind::Call { callee, args } => {
                if let Some(kind) = site_kind(module, expr)? {
                    self.record(expr, kind, &out);
                }
                let mut operands = Vec::with_capacity(args.len() + 1);
                if let Callee::Expr(e) = callee {
                    operands.push(*e);
                }
                operands.extend(args.iter().copied());
                self.analyze_ordered(&operands, out)
            }
            ExprKind::Binary { op, lhs, rhs } => {
                if op.is_short_circuit() {
                    let mut live = self.analyze(*rhs, out.clone())?;
                    live.extend(out);
                    self.analyze(*lhs, live)
                } else {
                    self.analyze_ordered(&[*lhs, *rhs], out)
                }
            }
            ExprKind::Unary { operand, .. } => self.analyze(*operand, out),
            ExprKind::Lambda { .. } => {
                let mut live = out;
                live.extend(self.nested_captures(OwnerRef::Lambda(expr))?.iter().copied());
                Ok(live)
            }
            ExprKind::Handle {
                clauses, finally, ..
            } => {
                let after_site = match finally {
                    Some(f) if self.contains_site(*f)? => {
                        self.temp_exprs.insert(expr);
                        self.temps.push(expr);
                        let live = self.analyze(*f, out);
                        self.temps.pop();
                        live?
                    }
                    Some(f) => self.analyze(*f, out)?,
                    None => out,
                };
                self.record(expr, SiteKind::Handle, &after_site);
                let mut live = after_site;
                live.extend(self.nested_captures(OwnerRef::HandleBody(expr))?.iter().copied());
                for index in 0..clauses.len() as u32 {
                    let clause = OwnerRef::Clause {
                        handle: expr,
                        index,
                    };
                    live.extend(self.nested_captures(clause)?.iter().copied());
                }
                Ok(live)
            }
            ExprKind::Resume { value, .. } => {
                self.record(expr, SiteKind::Resume, &out);
                self.analyze_opt(*value, out)
            }
            ExprKind::TailResume { value, .. } => self.analyze_opt(*value, out),
            ExprKind::Object { fields, .. } => {
                let operands: Vec<ExprId> = fields.iter().map(|(_, e)| *e).collect();
                self.analyze_ordered(&operands, out)
            }
            ExprKind::Field { base, .. } => self.analyze(*base, out),
        }
    }

    /// Operands evaluated left to right. While analyzing an operand that
    /// contains a site, every earlier operand is a live temporary.
    fn analyze_ordered(&mut self, operands: &[ExprId], out: LiveSet) -> CompileResult<LiveSet> {
        let mut live = out;
        for j in (0..operands.len()).rev() {
            if j > 0 && self.contains_site(operands[j])? {
                let earlier = &operands[..j];
                self.temp_exprs.extend(earlier.iter().copied());
                self.temps.extend(earlier.iter().copied());
                let result = self.analyze(operands[j], live);
                self.temps.truncate(self.temps.len() - j);
                live = result?;
            } else {
                live = self.analyze(operands[j], live)?;
            }
        }
        Ok(live)
    }

    /// Fixed point over a loop. `cond` is `Some` for `while`.
    ///
    /// Each pass can only grow the head set and the head set is bounded by
    /// the module's symbols, so more than `symbol_count + 2` passes means
    /// the transfer functions are not monotone.
    fn analyze_loop(&mut self, out: LiveSet, cond: Option<ExprId>, body: ExprId) -> CompileResult<LiveSet> {
        let recording = self.recording;
        self.recording = false;
        let mut head = LiveSet::new();
        let mut passes = 0usize;
        loop {
            let next = match self.loop_pass(&out, &head, cond, body) {
                Ok(next) => next,
                Err(err) => {
                    self.recording = recording;
                    return Err(err);
                }
            };
            if next == head {
                break;
            }
            head = next;
            passes += 1;
            if passes > self.bound {
                self.recording = recording;
                return Err(ice_err!(self.span, "loop liveness did not converge";
                    "body" => body, "passes" => passes, "bound" => self.bound));
            }
        }
        self.recording = recording;
        if recording {
            self.loop_pass(&out, &head, cond, body)?;
        }
        Ok(head)
    }

    fn loop_pass(
        &mut self,
        out: &LiveSet,
        head: &LiveSet,
        cond: Option<ExprId>,
        body: ExprId,
    ) -> CompileResult<LiveSet> {
        self.loops.push(LoopCtx {
            break_live: out.clone(),
            continue_live: head.clone(),
        });
        let result = self.analyze(body, head.clone()).and_then(|body_in| match cond {
            Some(cond) => {
                let mut after_cond = body_in;
                after_cond.extend(out.iter().copied());
                self.analyze(cond, after_cond)
            }
            None => Ok(body_in),
        });
        self.loops.pop();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::owners::discover;
    use crate::hir::build::{ModuleBuilder, ProgramBuilder};
    use crate::hir::{BinOp, DefId, MatchArm, OpDecl, Pattern, Program};
    use tern_abi::ResumeKind;

    fn analyze_all(program: &Program, def: DefId) -> Vec<(OwnerInfo, OwnerLiveness)> {
        let (module, func) = program.function(def).unwrap();
        let owners = discover(program, module, func).unwrap();
        let mut nested = HashMap::new();
        let mut out = Vec::new();
        for info in owners.iter().rev() {
            let liveness = LivenessAnalyzer::new(module, &nested).analyze_owner(info).unwrap();
            nested.insert(info.owner, liveness.captures.clone());
            out.push((info.clone(), liveness));
        }
        out.reverse();
        out
    }

    fn io_effect(m: &mut ModuleBuilder<'_>) -> DefId {
        let int = m.types().int();
        m.effect("Io", vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)])
    }

    #[test]
    fn test_live_after_site_contains_later_reads() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let x = m.symbol("x");
        let y = m.symbol("y");
        let one = m.int(1);
        let perform = m.perform(io, 0, vec![one]);
        let x_ref = m.local(x);
        let y_ref = m.local(y);
        let sum = m.add(x_ref, y_ref);
        let body = m.block(vec![ModuleBuilder::let_(y, perform)], Some(sum));
        let def = m.function("f", vec![(x, int)], int, vec![io], body);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        let (_, live) = &result[0];
        assert_eq!(live.sites.len(), 1);
        assert_eq!(live.sites[0].kind, SiteKind::Perform);
        assert_eq!(live.sites[0].live_after, LiveSet::from([x]));
        assert!(live.captures.is_empty());
        assert_eq!(live.live_in, LiveSet::from([x]));
    }

    #[test]
    fn test_earlier_arguments_become_temps() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let x = m.symbol("x");
        let x_ref = m.local(x);
        let x_plus = m.add(x_ref, x_ref);
        let one = m.int(1);
        let first = m.perform(io, 0, vec![one]);
        let two = m.int(2);
        let second = m.perform(io, 0, vec![two]);
        let tuple = m.tuple(vec![x_plus, first, second]);
        let def = m.function("f", vec![(x, int)], int, vec![io], tuple);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        let (_, live) = &result[0];
        let orders: Vec<_> = live.sites.iter().map(|s| s.expr).collect();
        assert_eq!(orders, vec![first, second]);
        assert_eq!(live.sites[0].temps, vec![x_plus]);
        assert_eq!(live.sites[1].temps, vec![x_plus, first]);
        assert_eq!(live.temp_exprs, BTreeSet::from([x_plus, first]));
        // x itself is dead after the first operand.
        assert!(live.sites[0].live_after.is_empty());
    }

    #[test]
    fn test_while_liveness_reaches_fixed_point() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let i = m.symbol("i");
        let acc = m.symbol("acc");
        let limit = m.symbol("limit");

        let i_ref = m.local(i);
        let limit_ref = m.local(limit);
        let cond = m.binary(BinOp::Lt, i_ref, limit_ref);
        let i_ref2 = m.local(i);
        let read = m.perform(io, 0, vec![i_ref2]);
        let acc_ref = m.local(acc);
        let acc_sum = m.add(acc_ref, read);
        let set_acc = m.assign(acc, acc_sum);
        let i_ref3 = m.local(i);
        let one = m.int(1);
        let inc = m.add(i_ref3, one);
        let set_i = m.assign(i, inc);
        let body = m.block(vec![Stmt::Expr(set_acc), Stmt::Expr(set_i)], None);
        let lp = m.while_(cond, body);
        let acc_out = m.local(acc);
        let zero = m.int(0);
        let zero2 = m.int(0);
        let fn_body = m.block(
            vec![
                ModuleBuilder::let_(i, zero),
                ModuleBuilder::let_(acc, zero2),
                Stmt::Expr(lp),
            ],
            Some(acc_out),
        );
        let def = m.function("sum", vec![(limit, int)], int, vec![io], fn_body);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        let (_, live) = &result[0];
        assert_eq!(live.sites.len(), 1);
        let site = &live.sites[0];
        // acc is read as a temp, i and limit on the back edge.
        assert_eq!(site.live_after, LiveSet::from([i, limit]));
        assert_eq!(site.temps, vec![acc_ref]);
    }

    #[test]
    fn test_lambda_and_handle_captures() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let base = m.symbol("base");
        let offset = m.symbol("offset");
        let v = m.symbol("v");
        let k = m.symbol("k");

        // Clause: resume(v + offset)
        let v_ref = m.local(v);
        let off_ref = m.local(offset);
        let arg = m.add(v_ref, off_ref);
        let clause_body = m.resume(k, Some(arg));

        // Body: perform read(base)
        let base_ref = m.local(base);
        let perform = m.perform(io, 0, vec![base_ref]);
        let handle = m.handle(
            perform,
            vec![ModuleBuilder::clause(io, 0, vec![v], Some(k), clause_body)],
            None,
        );
        let def = m.function("f", vec![(base, int), (offset, int)], int, vec![], handle);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        assert_eq!(result.len(), 3);
        let (_, root) = &result[0];
        let (_, body) = &result[1];
        let (_, clause) = &result[2];
        assert_eq!(body.captures, vec![base]);
        assert_eq!(clause.captures, vec![offset]);
        assert_eq!(clause.sites[0].kind, SiteKind::Resume);
        assert_eq!(root.live_in, LiveSet::from([base, offset]));
        assert_eq!(root.sites[0].kind, SiteKind::Handle);
        assert!(root.sites[0].live_after.is_empty());
    }

    #[test]
    fn test_guard_site_keeps_scrutinee() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let x = m.symbol("x");
        let n = m.symbol("n");

        let scrutinee = m.local(x);
        let n_ref = m.local(n);
        let guard_read = m.perform(io, 0, vec![n_ref]);
        let zero = m.int(0);
        let guard = m.binary(BinOp::Gt, guard_read, zero);
        let n_body = m.local(n);
        let other = m.int(7);
        let arms = vec![
            MatchArm {
                pattern: Pattern::Bind(n),
                guard: Some(guard),
                body: n_body,
            },
            MatchArm {
                pattern: Pattern::Wildcard,
                guard: None,
                body: other,
            },
        ];
        let body = m.match_(scrutinee, arms);
        let def = m.function("f", vec![(x, int)], int, vec![io], body);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        let (_, live) = &result[0];
        let site = &live.sites[0];
        assert_eq!(site.expr, guard_read);
        assert_eq!(site.temps, vec![scrutinee]);
        assert_eq!(site.live_after, LiveSet::from([n]));
        assert!(live.temp_exprs.contains(&scrutinee));
    }

    #[test]
    fn test_finally_keeps_handle_result() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = io_effect(&mut m);
        let one = m.int(1);
        let body = m.perform(io, 0, vec![one]);
        let two = m.int(2);
        let cleanup = m.perform(io, 0, vec![two]);
        let handle = m.handle(body, vec![], Some(cleanup));
        let def = m.function("f", vec![], int, vec![io], handle);
        m.finish();
        let program = b.finish();

        let result = analyze_all(&program, def);
        let (_, live) = &result[0];
        assert_eq!(live.sites.len(), 2);
        assert_eq!(live.sites[0].expr, handle);
        assert!(live.sites[0].temps.is_empty());
        assert_eq!(live.sites[1].expr, cleanup);
        assert_eq!(live.sites[1].temps, vec![handle]);
    }
}

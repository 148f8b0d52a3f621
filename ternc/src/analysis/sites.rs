//! Suspension sites.
//!
//! A site is an expression at which the current owner may stop and hand
//! an `Effect` outcome to its caller:
//!
//! | Kind | Expression |
//! |------|------------|
//! | `Perform` | call classified as a direct operation invocation |
//! | `EffectfulCall` | call of a function or closure with a non-empty effect row |
//! | `Handle` | a handle construct (its body or clauses may propagate) |
//! | `Resume` | `resume v` inside a `Resume`-kind clause |
//!
//! Site order is the forward evaluation order within the owner and is the
//! resume discriminator stored in every site environment.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use crate::error::CompileResult;
use crate::hir::{CallKind, Callee, ExprId, ExprKind, Module, Stmt, SymbolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SiteKind {
    Perform,
    EffectfulCall,
    Handle,
    Resume,
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SiteKind::Perform => "perform",
            SiteKind::EffectfulCall => "effectful-call",
            SiteKind::Handle => "handle",
            SiteKind::Resume => "resume",
        })
    }
}

/// One suspension site of an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub expr: ExprId,
    pub kind: SiteKind,
    /// Dense position in forward evaluation order.
    pub order: u32,
    /// Symbols read after the site resumes.
    pub live_after: BTreeSet<SymbolId>,
    /// Already-evaluated operand values that must survive the suspension,
    /// outermost first.
    pub temps: Vec<ExprId>,
}

/// Classify an expression as a site.
pub fn site_kind(module: &Module, expr: ExprId) -> CompileResult<Option<SiteKind>> {
    Ok(match &module.expr(expr)?.kind {
        ExprKind::Call { .. } => match module.call_kind(expr)? {
            CallKind::Pure => None,
            CallKind::Perform { .. } => Some(SiteKind::Perform),
            CallKind::Effectful => Some(SiteKind::EffectfulCall),
        },
        ExprKind::Handle { .. } => Some(SiteKind::Handle),
        ExprKind::Resume { .. } => Some(SiteKind::Resume),
        _ => None,
    })
}

/// Sub-expressions evaluated by the current owner, in evaluation order.
///
/// Lambda bodies, handle bodies and clause bodies belong to other owners
/// and are excluded; a handle's `finally` is included.
pub fn evaluated_children(kind: &ExprKind) -> Vec<ExprId> {
    match kind {
        ExprKind::Literal(_)
        | ExprKind::Local(_)
        | ExprKind::Continue
        | ExprKind::Lambda { .. } => Vec::new(),
        ExprKind::Block { stmts, tail } => stmts
            .iter()
            .map(|stmt| match stmt {
                Stmt::Let { init, .. } => *init,
                Stmt::Expr(e) => *e,
            })
            .chain(*tail)
            .collect(),
        ExprKind::Assign { value, .. } => vec![*value],
        ExprKind::If {
            cond,
            then_branch,
            else_branch,
        } => std::iter::once(*cond)
            .chain(std::iter::once(*then_branch))
            .chain(*else_branch)
            .collect(),
        ExprKind::Match { scrutinee, arms } => {
            let mut out = vec![*scrutinee];
            for arm in arms {
                out.extend(arm.guard);
                out.push(arm.body);
            }
            out
        }
        ExprKind::While { cond, body } => vec![*cond, *body],
        ExprKind::Loop { body } => vec![*body],
        ExprKind::Break { value }
        | ExprKind::Return { value }
        | ExprKind::Resume { value, .. }
        | ExprKind::TailResume { value, .. } => value.iter().copied().collect(),
        ExprKind::Tuple(items) => items.clone(),
        ExprKind::Call { callee, args } => {
            let mut out = Vec::with_capacity(args.len() + 1);
            if let Callee::Expr(e) = callee {
                out.push(*e);
            }
            out.extend(args.iter().copied());
            out
        }
        ExprKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
        ExprKind::Unary { operand, .. } => vec![*operand],
        ExprKind::Handle { finally, .. } => finally.iter().copied().collect(),
        ExprKind::Object { fields, .. } => fields.iter().map(|(_, e)| *e).collect(),
        ExprKind::Field { base, .. } => vec![*base],
    }
}

/// Every site of an owner body in forward evaluation order.
///
/// Operands come before the site that consumes them; a handle's own site
/// comes before the sites of its `finally`.
pub fn forward_order(module: &Module, body: ExprId) -> CompileResult<Vec<ExprId>> {
    let mut out = Vec::new();
    collect_forward(module, body, &mut out)?;
    Ok(out)
}

fn collect_forward(module: &Module, expr: ExprId, out: &mut Vec<ExprId>) -> CompileResult<()> {
    let kind = &module.expr(expr)?.kind;
    let is_handle = matches!(kind, ExprKind::Handle { .. });
    if is_handle {
        out.push(expr);
    }
    for child in evaluated_children(kind) {
        collect_forward(module, child, out)?;
    }
    if !is_handle && site_kind(module, expr)?.is_some() {
        out.push(expr);
    }
    Ok(())
}

/// Memoized "does this expression contain a site of the current owner".
#[derive(Debug, Default)]
pub struct SiteIndex {
    memo: HashMap<ExprId, bool>,
}

impl SiteIndex {
    pub fn contains_site(&mut self, module: &Module, expr: ExprId) -> CompileResult<bool> {
        if let Some(&known) = self.memo.get(&expr) {
            return Ok(known);
        }
        let mut found = site_kind(module, expr)?.is_some();
        if !found {
            for child in evaluated_children(&module.expr(expr)?.kind) {
                if self.contains_site(module, child)? {
                    found = true;
                    break;
                }
            }
        }
        self.memo.insert(expr, found);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::build::{ModuleBuilder, ProgramBuilder};
    use crate::hir::OpDecl;
    use tern_abi::ResumeKind;

    #[test]
    fn test_forward_order_is_post_order() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = m.effect(
            "Io",
            vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)],
        );
        let zero = m.int(0);
        let inner = m.perform(io, 0, vec![zero]);
        let outer = m.perform(io, 0, vec![inner]);
        let one = m.int(1);
        let other = m.perform(io, 0, vec![one]);
        let sum = m.add(outer, other);
        m.finish();
        let program = b.finish();
        let module = &program.modules[0];

        assert_eq!(forward_order(module, sum).unwrap(), vec![inner, outer, other]);
        let mut index = SiteIndex::default();
        assert!(index.contains_site(module, sum).unwrap());
        assert!(!index.contains_site(module, one).unwrap());
    }

    #[test]
    fn test_handle_site_precedes_finally() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let io = m.effect(
            "Io",
            vec![OpDecl::simple("read", vec![int], int, ResumeKind::Resume)],
        );
        let zero = m.int(0);
        let in_body = m.perform(io, 0, vec![zero]);
        let one = m.int(1);
        let in_finally = m.perform(io, 0, vec![one]);
        let handle = m.handle(in_body, vec![], Some(in_finally));
        let _ = ModuleBuilder::let_;
        m.finish();
        let program = b.finish();
        let module = &program.modules[0];

        // The body belongs to the handle-body owner.
        assert_eq!(forward_order(module, handle).unwrap(), vec![handle, in_finally]);
    }
}

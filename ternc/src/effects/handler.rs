//! # Handler Clause Checks
//!
//! Static properties of handle constructs, checked once per function
//! before any owner is analyzed:
//!
//! - every clause names a declared operation, at most once per construct,
//!   and binds exactly the operation's arguments
//! - `resume` appears only in `Resume`-kind clauses and `tail` only in
//!   `Tail`-kind clauses, always on the binding of the innermost clause
//! - a `Resume`-kind continuation is resumed at most once on any path and
//!   never inside a loop of the clause body (continuations are one-shot)
//! - `return`, `break` and `continue` never leave a handle body or a clause
//!   body, since both are compiled as separate functions
//!
//! The number of `tail` calls is *not* checked here: a `Tail` clause that
//! tails zero or two times is a dynamic property, enforced by the tail
//! guard trap.
//!
//! ## Path counting
//!
//! Resumptions are counted per path, not per occurrence: sequential
//! sub-expressions add up, alternative branches (`if`, `match` arms) take
//! the maximum. Divergence is not modeled, so a resume followed by an
//! early `return` still counts toward later resumes on the same path.

use std::collections::HashMap;

use tern_abi::ResumeKind;
use tracing::trace;

use crate::diagnostics::ErrorCode;
use crate::error::{CompileError, CompileResult};
use crate::hir::{
    Callee, ExprId, ExprKind, FnDecl, HandlerClause, Module, Program, Stmt, SymbolId,
};
use crate::span::Span;

/// What kind of compiled function the checker is currently inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerKind {
    Function,
    Lambda,
    HandleBody,
    Clause,
}

#[derive(Debug, Clone, Copy)]
struct ClauseCtx {
    binding: Option<SymbolId>,
    kind: ResumeKind,
}

#[derive(Debug, Clone, Copy)]
struct Owner {
    kind: OwnerKind,
    clause: Option<ClauseCtx>,
    loops: u32,
}

/// Check every function of a module.
pub fn check_module(program: &Program, module: &Module) -> CompileResult<()> {
    for func in module.functions() {
        check_function(program, module, func)?;
    }
    Ok(())
}

/// Check one function body, including every nested owner.
pub fn check_function(program: &Program, module: &Module, func: &FnDecl) -> CompileResult<()> {
    trace!(function = %func.name, "checking handler clauses");
    let mut checker = ClauseChecker {
        program,
        module,
        owners: vec![Owner {
            kind: OwnerKind::Function,
            clause: None,
            loops: 0,
        }],
    };
    checker.walk(func.body).map(|_| ())
}

struct ClauseChecker<'a> {
    program: &'a Program,
    module: &'a Module,
    owners: Vec<Owner>,
}

impl ClauseChecker<'_> {
    fn span(&self, expr: ExprId) -> Span {
        self.module.exprs.get(expr).map(|e| e.span).unwrap_or_default()
    }

    fn top(&mut self) -> CompileResult<&mut Owner> {
        self.owners
            .last_mut()
            .ok_or_else(|| crate::ice_err!(Span::dummy(), "clause checker lost its owner"))
    }

    fn in_owner<T>(
        &mut self,
        owner: Owner,
        f: impl FnOnce(&mut Self) -> CompileResult<T>,
    ) -> CompileResult<T> {
        self.owners.push(owner);
        let result = f(self);
        self.owners.pop();
        result
    }

    fn in_loop(&mut self, body: impl FnOnce(&mut Self) -> CompileResult<usize>) -> CompileResult<usize> {
        self.top()?.loops += 1;
        let result = body(self);
        self.top()?.loops -= 1;
        result
    }

    fn walk_all(&mut self, exprs: &[ExprId]) -> CompileResult<usize> {
        let mut total = 0;
        for &e in exprs {
            total += self.walk(e)?;
        }
        Ok(total)
    }

    fn walk_opt(&mut self, expr: Option<ExprId>) -> CompileResult<usize> {
        match expr {
            Some(e) => self.walk(e),
            None => Ok(0),
        }
    }

    /// Walk `expr`, returning the largest number of resumptions of the
    /// current clause's continuation on any path through it.
    fn walk(&mut self, expr: ExprId) -> CompileResult<usize> {
        let module = self.module;
        let span = self.span(expr);
        match &module.expr(expr)?.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) => Ok(0),
            ExprKind::Block { stmts, tail } => {
                let mut total = 0;
                for stmt in stmts {
                    total += match stmt {
                        Stmt::Let { init, .. } => self.walk(*init)?,
                        Stmt::Expr(e) => self.walk(*e)?,
                    };
                }
                Ok(total + self.walk_opt(*tail)?)
            }
            ExprKind::Assign { value, .. } => self.walk(*value),
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let c = self.walk(*cond)?;
                let t = self.walk(*then_branch)?;
                let e = self.walk_opt(*else_branch)?;
                Ok(c + t.max(e))
            }
            ExprKind::Match { scrutinee, arms } => {
                let s = self.walk(*scrutinee)?;
                // A failed guard falls through to later arms, so guards
                // are sequential; bodies are alternatives.
                let mut guards = 0;
                let mut widest = 0;
                for arm in arms {
                    guards += self.walk_opt(arm.guard)?;
                    widest = widest.max(guards + self.walk(arm.body)?);
                }
                Ok(s + widest.max(guards))
            }
            ExprKind::While { cond, body } => {
                let (cond, body) = (*cond, *body);
                self.in_loop(|this| Ok(this.walk(cond)? + this.walk(body)?))
            }
            ExprKind::Loop { body } => {
                let body = *body;
                self.in_loop(|this| this.walk(body))
            }
            ExprKind::Break { value } => {
                let n = self.walk_opt(*value)?;
                self.check_jump(span, "break")?;
                Ok(n)
            }
            ExprKind::Continue => {
                self.check_jump(span, "continue")?;
                Ok(0)
            }
            ExprKind::Return { value } => {
                let n = self.walk_opt(*value)?;
                let kind = self.top()?.kind;
                if matches!(kind, OwnerKind::HandleBody | OwnerKind::Clause) {
                    return Err(CompileError::new(
                        ErrorCode::EscapingControlFlow,
                        "`return` cannot leave a handle body or handler clause",
                        span,
                    ));
                }
                Ok(n)
            }
            ExprKind::Tuple(items) => self.walk_all(items),
            ExprKind::Call { callee, args } => {
                let callee = match callee {
                    Callee::Expr(e) => self.walk(*e)?,
                    Callee::Def(_) => 0,
                };
                Ok(callee + self.walk_all(args)?)
            }
            ExprKind::Binary { lhs, rhs, .. } => Ok(self.walk(*lhs)? + self.walk(*rhs)?),
            ExprKind::Unary { operand, .. } => self.walk(*operand),
            ExprKind::Lambda { body, .. } => {
                let body = *body;
                self.in_owner(
                    Owner {
                        kind: OwnerKind::Lambda,
                        clause: None,
                        loops: 0,
                    },
                    |this| this.walk(body),
                )?;
                Ok(0)
            }
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                let body = *body;
                self.in_owner(
                    Owner {
                        kind: OwnerKind::HandleBody,
                        clause: None,
                        loops: 0,
                    },
                    |this| this.walk(body),
                )?;
                self.check_clauses(clauses, span)?;
                self.walk_opt(*finally)
            }
            ExprKind::Resume { binding, value } => {
                let n = self.walk_opt(*value)?;
                self.check_resumption(*binding, ResumeKind::Resume, span)?;
                Ok(n + 1)
            }
            ExprKind::TailResume { binding, value } => {
                let n = self.walk_opt(*value)?;
                self.check_resumption(*binding, ResumeKind::Tail, span)?;
                // Tail counts are a runtime property.
                Ok(n)
            }
            ExprKind::Object { fields, .. } => {
                let mut total = 0;
                for (_, value) in fields {
                    total += self.walk(*value)?;
                }
                Ok(total)
            }
            ExprKind::Field { base, .. } => self.walk(*base),
        }
    }

    fn check_jump(&mut self, span: Span, what: &str) -> CompileResult<()> {
        let owner = *self.top()?;
        if owner.loops > 0 {
            return Ok(());
        }
        let message = match owner.kind {
            OwnerKind::HandleBody | OwnerKind::Clause => {
                format!("`{what}` cannot leave a handle body or handler clause")
            }
            OwnerKind::Function | OwnerKind::Lambda => format!("`{what}` outside of a loop"),
        };
        Err(CompileError::new(ErrorCode::EscapingControlFlow, message, span))
    }

    fn check_clauses(&mut self, clauses: &[HandlerClause], span: Span) -> CompileResult<()> {
        let program = self.program;
        let mut seen = HashMap::new();
        for clause in clauses {
            let (_, effect) = program.effect(clause.effect).ok_or_else(|| {
                CompileError::new(
                    ErrorCode::UnresolvedEffect,
                    format!("handler clause names {} which is not an effect", clause.effect),
                    clause_span(clause, span),
                )
            })?;
            let op = effect.ops.get(clause.op as usize).ok_or_else(|| {
                CompileError::new(
                    ErrorCode::UnknownOperation,
                    format!("effect `{}` has no operation #{}", effect.name, clause.op),
                    clause_span(clause, span),
                )
            })?;
            if let Some(first) = seen.insert((clause.effect, clause.op), clause_span(clause, span)) {
                return Err(CompileError::new(
                    ErrorCode::DuplicateClause,
                    format!("`{}.{}` is handled twice", effect.name, op.name),
                    clause_span(clause, span),
                )
                .with_note(first, "first handled here"));
            }
            if clause.params.len() != op.params.len() {
                return Err(CompileError::new(
                    ErrorCode::UnknownOperation,
                    format!(
                        "clause for `{}.{}` binds {} arguments, the operation takes {}",
                        effect.name,
                        op.name,
                        clause.params.len(),
                        op.params.len()
                    ),
                    clause_span(clause, span),
                ));
            }

            let body = clause.body;
            let resumes = self.in_owner(
                Owner {
                    kind: OwnerKind::Clause,
                    clause: Some(ClauseCtx {
                        binding: clause.resume,
                        kind: op.resume_kind,
                    }),
                    loops: 0,
                },
                |this| this.walk(body),
            )?;
            if resumes > 1 {
                return Err(CompileError::new(
                    ErrorCode::MultipleResumes,
                    format!(
                        "clause for `{}.{}` may resume its continuation {resumes} times",
                        effect.name, op.name
                    ),
                    clause_span(clause, span),
                ));
            }
        }
        Ok(())
    }

    fn check_resumption(&mut self, binding: SymbolId, used: ResumeKind, span: Span) -> CompileResult<()> {
        let owner = *self.top()?;
        let name = self.module.symbols.name(binding).unwrap_or("?").to_string();
        let clause = match owner.clause {
            Some(clause) if clause.binding == Some(binding) => clause,
            _ => {
                let foreign = self
                    .owners
                    .iter()
                    .any(|o| o.clause.is_some_and(|c| c.binding == Some(binding)));
                let (code, message) = if foreign {
                    (
                        ErrorCode::ForeignResumeBinding,
                        format!("`{name}` belongs to an enclosing clause and cannot be used here"),
                    )
                } else {
                    (
                        ErrorCode::ResumeOutsideClause,
                        format!("`{name}` is not the resumption of a handler clause"),
                    )
                };
                return Err(CompileError::new(code, message, span));
            }
        };
        match (clause.kind, used) {
            (ResumeKind::Resume, ResumeKind::Tail) => Err(CompileError::new(
                ErrorCode::TailInResumeClause,
                "cannot return tail from a resume-kind clause",
                span,
            )),
            (ResumeKind::Tail, ResumeKind::Resume) => Err(CompileError::new(
                ErrorCode::ResumeInTailClause,
                "tail-kind clause must return tail, not resume",
                span,
            )),
            (ResumeKind::Resume, ResumeKind::Resume) if owner.loops > 0 => Err(CompileError::new(
                ErrorCode::ResumeInLoop,
                format!("`{name}` is resumed inside a loop"),
                span,
            )),
            _ => Ok(()),
        }
    }
}

fn clause_span(clause: &HandlerClause, construct: Span) -> Span {
    if clause.span.is_dummy() {
        construct
    } else {
        clause.span
    }
}

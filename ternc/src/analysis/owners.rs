//! Owner discovery.
//!
//! An *owner* is one unit of generated code with its own locals, sites and
//! continuation function: a function body, a lambda body, the body thunk
//! of a handle construct, or one handler clause. Discovery walks a
//! function in evaluation order and returns every owner it contains,
//! parents before children.

use std::fmt;

use crate::error::CompileResult;
use crate::hir::{
    Callee, DefId, ExprId, ExprKind, FnDecl, Module, Program, Stmt, SymbolId, TypeId,
};
use crate::span::Span;

/// Identity of an owner within its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OwnerRef {
    Function(DefId),
    Lambda(ExprId),
    /// The protected body of the handle construct at this expression.
    HandleBody(ExprId),
    /// Clause `index` of the handle construct at `handle`.
    Clause { handle: ExprId, index: u32 },
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerRef::Function(def) => write!(f, "fn {def}"),
            OwnerRef::Lambda(e) => write!(f, "lambda {e}"),
            OwnerRef::HandleBody(e) => write!(f, "handle body {e}"),
            OwnerRef::Clause { handle, index } => write!(f, "clause {index} of {handle}"),
        }
    }
}

/// How an owner returns to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// Returns the value itself. Used by functions and lambdas with an
    /// empty effect row; an `Effect` outcome reaching one is a trap.
    Pure,
    /// Returns an `Outcome`.
    Effectful,
}

impl Convention {
    pub fn is_effectful(self) -> bool {
        matches!(self, Convention::Effectful)
    }
}

/// One discovered owner.
#[derive(Debug, Clone)]
pub struct OwnerInfo {
    pub owner: OwnerRef,
    pub parent: Option<OwnerRef>,
    /// Stable, module-qualified name; also the memoization key of the
    /// generated functions.
    pub name: String,
    pub body: ExprId,
    pub params: Vec<SymbolId>,
    pub convention: Convention,
    pub span: Span,
}

/// Discover every owner of one function.
pub fn discover(program: &Program, module: &Module, func: &FnDecl) -> CompileResult<Vec<OwnerInfo>> {
    let convention = convention_of(program, func.signature)?;
    let root = OwnerInfo {
        owner: OwnerRef::Function(func.def),
        parent: None,
        name: function_name(module, func),
        body: func.body,
        params: func.params.iter().map(|p| p.symbol).collect(),
        convention,
        span: func.span,
    };
    let mut discovery = Discovery {
        program,
        module,
        found: Vec::new(),
    };
    let (owner, name, body) = (root.owner, root.name.clone(), root.body);
    discovery.found.push(root);
    discovery.walk(body, owner, &name)?;
    Ok(discovery.found)
}

/// `package/module::name`, the owner name of a top-level function.
pub fn function_name(module: &Module, func: &FnDecl) -> String {
    format!("{}::{}", module.path(), func.name)
}

pub fn convention_of(program: &Program, signature: TypeId) -> CompileResult<Convention> {
    Ok(if program.is_effectful(signature)? {
        Convention::Effectful
    } else {
        Convention::Pure
    })
}

struct Discovery<'a> {
    program: &'a Program,
    module: &'a Module,
    found: Vec<OwnerInfo>,
}

impl Discovery<'_> {
    fn walk(&mut self, expr: ExprId, owner: OwnerRef, name: &str) -> CompileResult<()> {
        let module = self.module;
        let node = module.expr(expr)?;
        match &node.kind {
            ExprKind::Literal(_) | ExprKind::Local(_) | ExprKind::Continue => {}
            ExprKind::Block { stmts, tail } => {
                for stmt in stmts {
                    match stmt {
                        Stmt::Let { init, .. } => self.walk(*init, owner, name)?,
                        Stmt::Expr(e) => self.walk(*e, owner, name)?,
                    }
                }
                self.walk_opt(*tail, owner, name)?;
            }
            ExprKind::Assign { value, .. } => self.walk(*value, owner, name)?,
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.walk(*cond, owner, name)?;
                self.walk(*then_branch, owner, name)?;
                self.walk_opt(*else_branch, owner, name)?;
            }
            ExprKind::Match { scrutinee, arms } => {
                self.walk(*scrutinee, owner, name)?;
                for arm in arms {
                    self.walk_opt(arm.guard, owner, name)?;
                    self.walk(arm.body, owner, name)?;
                }
            }
            ExprKind::While { cond, body } => {
                self.walk(*cond, owner, name)?;
                self.walk(*body, owner, name)?;
            }
            ExprKind::Loop { body } => self.walk(*body, owner, name)?,
            ExprKind::Break { value } | ExprKind::Return { value } => {
                self.walk_opt(*value, owner, name)?
            }
            ExprKind::Tuple(items) => {
                for &item in items {
                    self.walk(item, owner, name)?;
                }
            }
            ExprKind::Call { callee, args } => {
                if let Callee::Expr(e) = callee {
                    self.walk(*e, owner, name)?;
                }
                for &arg in args {
                    self.walk(arg, owner, name)?;
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.walk(*lhs, owner, name)?;
                self.walk(*rhs, owner, name)?;
            }
            ExprKind::Unary { operand, .. } => self.walk(*operand, owner, name)?,
            ExprKind::Lambda { params, body, ty } => {
                let child = OwnerRef::Lambda(expr);
                let child_name = format!("{name}$lambda{}", expr.0);
                self.found.push(OwnerInfo {
                    owner: child,
                    parent: Some(owner),
                    name: child_name.clone(),
                    body: *body,
                    params: params.clone(),
                    convention: convention_of(self.program, *ty)?,
                    span: node.span,
                });
                self.walk(*body, child, &child_name)?;
            }
            ExprKind::Handle {
                body,
                clauses,
                finally,
            } => {
                let base = format!("{name}$handle{}", expr.0);
                let child = OwnerRef::HandleBody(expr);
                self.found.push(OwnerInfo {
                    owner: child,
                    parent: Some(owner),
                    name: base.clone(),
                    body: *body,
                    params: Vec::new(),
                    convention: Convention::Effectful,
                    span: node.span,
                });
                self.walk(*body, child, &base)?;
                for (index, clause) in clauses.iter().enumerate() {
                    let child = OwnerRef::Clause {
                        handle: expr,
                        index: index as u32,
                    };
                    let child_name = format!("{base}$clause{index}");
                    self.found.push(OwnerInfo {
                        owner: child,
                        parent: Some(owner),
                        name: child_name.clone(),
                        body: clause.body,
                        params: clause.params.clone(),
                        convention: Convention::Effectful,
                        span: if clause.span.is_dummy() { node.span } else { clause.span },
                    });
                    self.walk(clause.body, child, &child_name)?;
                }
                self.walk_opt(*finally, owner, name)?;
            }
            ExprKind::Resume { value, .. } | ExprKind::TailResume { value, .. } => {
                self.walk_opt(*value, owner, name)?
            }
            ExprKind::Object { fields, .. } => {
                for (_, value) in fields {
                    self.walk(*value, owner, name)?;
                }
            }
            ExprKind::Field { base, .. } => self.walk(*base, owner, name)?,
        }
        Ok(())
    }

    fn walk_opt(&mut self, expr: Option<ExprId>, owner: OwnerRef, name: &str) -> CompileResult<()> {
        match expr {
            Some(e) => self.walk(e, owner, name),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::build::{ModuleBuilder, ProgramBuilder};
    use crate::hir::OpDecl;
    use tern_abi::ResumeKind;

    #[test]
    fn test_discovery_names_and_conventions() {
        let mut b = ProgramBuilder::new();
        let mut m = b.module("app", "main");
        let int = m.types().int();
        let ask = m.effect("Ask", vec![OpDecl::simple("ask", vec![], int, ResumeKind::Tail)]);
        let pure_fn = m.types().function(vec![], int, vec![]);

        let one = m.int(1);
        let lam = m.lambda(vec![], one, pure_fn);
        let k = m.symbol("k");
        let two = m.int(2);
        let clause = m.tail(k, Some(two));
        let perform = m.perform(ask, 0, vec![]);
        let handle = m.handle(
            perform,
            vec![ModuleBuilder::clause(ask, 0, vec![], Some(k), clause)],
            None,
        );
        let body = m.tuple(vec![lam, handle]);
        let def = m.function("main", vec![], int, vec![], body);
        m.finish();
        let program = b.finish();
        let module = &program.modules[0];
        let (_, func) = program.function(def).unwrap();

        let owners = discover(&program, module, func).unwrap();
        let names: Vec<_> = owners.iter().map(|o| o.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                "app/main::main".to_string(),
                format!("app/main::main$lambda{}", lam.0),
                format!("app/main::main$handle{}", handle.0),
                format!("app/main::main$handle{}$clause0", handle.0),
            ]
        );
        assert_eq!(owners[0].convention, Convention::Pure);
        assert_eq!(owners[1].convention, Convention::Pure);
        assert_eq!(owners[2].convention, Convention::Effectful);
        assert_eq!(owners[3].parent, Some(OwnerRef::Function(def)));
    }
}

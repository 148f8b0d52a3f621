//! Programmatic HIR construction.
//!
//! Front ends lower their syntax trees through these builders; tests use
//! them to assemble small programs without a parser.
//!
//! ```rust
//! use ternc::hir::build::ProgramBuilder;
//! use ternc::hir::OpDecl;
//! use tern_abi::ResumeKind;
//!
//! let mut program = ProgramBuilder::new();
//! let mut m = program.module("app", "main");
//! let int = m.types().int();
//! let ask = m.effect("Ask", vec![OpDecl::simple("ask", vec![], int, ResumeKind::Tail)]);
//! let call = m.perform(ask, 0, vec![]);
//! m.function("main", vec![], int, vec![ask], call);
//! m.finish();
//! let program = program.finish();
//! assert_eq!(program.modules.len(), 1);
//! ```

use super::*;
use tern_abi::ResumeKind;

impl OpDecl {
    /// A non-generic operation.
    pub fn simple(name: &str, params: Vec<TypeId>, ret: TypeId, resume_kind: ResumeKind) -> Self {
        Self {
            name: name.to_string(),
            type_params: Vec::new(),
            params,
            ret,
            resume_kind,
        }
    }
}

/// Builds a [`Program`] with program-unique [`DefId`]s.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    types: TypeTable,
    modules: Vec<Module>,
    next_def: u32,
    next_type_param: u32,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.types
    }

    pub fn fresh_def(&mut self) -> DefId {
        let def = DefId::new(self.next_def);
        self.next_def += 1;
        def
    }

    pub fn fresh_type_param(&mut self) -> TypeParamId {
        let param = TypeParamId(self.next_type_param);
        self.next_type_param += 1;
        param
    }

    /// Start a module; it is added to the program by [`ModuleBuilder::finish`].
    pub fn module(&mut self, package: &str, name: &str) -> ModuleBuilder<'_> {
        ModuleBuilder {
            module: Module::new(package, name),
            program: self,
        }
    }

    pub fn finish(self) -> Program {
        Program {
            modules: self.modules,
            types: self.types,
        }
    }
}

/// Builds one [`Module`].
pub struct ModuleBuilder<'p> {
    program: &'p mut ProgramBuilder,
    module: Module,
}

impl ModuleBuilder<'_> {
    pub fn types(&mut self) -> &mut TypeTable {
        &mut self.program.types
    }

    pub fn fresh_def(&mut self) -> DefId {
        self.program.fresh_def()
    }

    pub fn fresh_type_param(&mut self) -> TypeParamId {
        self.program.fresh_type_param()
    }

    pub fn symbol(&mut self, name: &str) -> SymbolId {
        self.module.symbols.declare(name)
    }

    /// Allocate an expression. Each node gets a distinct synthetic span.
    pub fn expr(&mut self, kind: ExprKind) -> ExprId {
        let n = self.module.exprs.len();
        self.module.exprs.alloc(kind, Span::new(n, n + 1))
    }

    pub fn finish(self) {
        self.program.modules.push(self.module);
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Declare a private effect without an explicit id.
    pub fn effect(&mut self, name: &str, ops: Vec<OpDecl>) -> DefId {
        let def = self.fresh_def();
        self.effect_decl(EffectDecl {
            def,
            name: name.to_string(),
            explicit_id: None,
            visibility: Visibility::Private,
            type_params: Vec::new(),
            ops,
            span: Span::dummy(),
        });
        def
    }

    pub fn effect_decl(&mut self, decl: EffectDecl) {
        self.module.items.push(Item::Effect(decl));
    }

    /// Define a function. `effects` is its effect row.
    pub fn function(
        &mut self,
        name: &str,
        params: Vec<(SymbolId, TypeId)>,
        ret: TypeId,
        effects: Vec<DefId>,
        body: ExprId,
    ) -> DefId {
        let def = self.fresh_def();
        self.define_function(def, name, params, ret, effects, body, false);
        def
    }

    /// Define a function with an exported entry point.
    pub fn export_function(
        &mut self,
        name: &str,
        params: Vec<(SymbolId, TypeId)>,
        ret: TypeId,
        effects: Vec<DefId>,
        body: ExprId,
    ) -> DefId {
        let def = self.fresh_def();
        self.define_function(def, name, params, ret, effects, body, true);
        def
    }

    /// Define a function under a previously reserved id (for recursion).
    #[allow(clippy::too_many_arguments)]
    pub fn define_function(
        &mut self,
        def: DefId,
        name: &str,
        params: Vec<(SymbolId, TypeId)>,
        ret: TypeId,
        effects: Vec<DefId>,
        body: ExprId,
        exported: bool,
    ) {
        let param_tys = params.iter().map(|(_, ty)| *ty).collect();
        let signature = self.types().function(param_tys, ret, effects);
        let span = self.module.exprs.get(body).map(|e| e.span).unwrap_or_default();
        self.module.items.push(Item::Fn(FnDecl {
            def,
            name: name.to_string(),
            params: params
                .into_iter()
                .map(|(symbol, ty)| Param { symbol, ty })
                .collect(),
            signature,
            body,
            exported,
            span,
        }));
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    pub fn int(&mut self, value: i32) -> ExprId {
        self.expr(ExprKind::Literal(Literal::Int(value)))
    }

    pub fn bool(&mut self, value: bool) -> ExprId {
        self.expr(ExprKind::Literal(Literal::Bool(value)))
    }

    pub fn unit(&mut self) -> ExprId {
        self.expr(ExprKind::Literal(Literal::Unit))
    }

    pub fn local(&mut self, sym: SymbolId) -> ExprId {
        self.expr(ExprKind::Local(sym))
    }

    pub fn block(&mut self, stmts: Vec<Stmt>, tail: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::Block { stmts, tail })
    }

    /// `let sym = init;`
    pub fn let_(sym: SymbolId, init: ExprId) -> Stmt {
        Stmt::Let {
            pattern: Pattern::Bind(sym),
            init,
        }
    }

    pub fn assign(&mut self, target: SymbolId, value: ExprId) -> ExprId {
        self.expr(ExprKind::Assign { target, value })
    }

    pub fn if_(&mut self, cond: ExprId, then_branch: ExprId, else_branch: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::If {
            cond,
            then_branch,
            else_branch,
        })
    }

    pub fn match_(&mut self, scrutinee: ExprId, arms: Vec<MatchArm>) -> ExprId {
        self.expr(ExprKind::Match { scrutinee, arms })
    }

    pub fn while_(&mut self, cond: ExprId, body: ExprId) -> ExprId {
        self.expr(ExprKind::While { cond, body })
    }

    pub fn loop_(&mut self, body: ExprId) -> ExprId {
        self.expr(ExprKind::Loop { body })
    }

    pub fn break_(&mut self, value: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::Break { value })
    }

    pub fn continue_(&mut self) -> ExprId {
        self.expr(ExprKind::Continue)
    }

    pub fn return_(&mut self, value: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::Return { value })
    }

    pub fn tuple(&mut self, items: Vec<ExprId>) -> ExprId {
        self.expr(ExprKind::Tuple(items))
    }

    pub fn binary(&mut self, op: BinOp, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.expr(ExprKind::Binary { op, lhs, rhs })
    }

    pub fn add(&mut self, lhs: ExprId, rhs: ExprId) -> ExprId {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn unary(&mut self, op: UnOp, operand: ExprId) -> ExprId {
        self.expr(ExprKind::Unary { op, operand })
    }

    /// A call classified by the given fact.
    pub fn call_with(&mut self, callee: Callee, args: Vec<ExprId>, kind: CallKind) -> ExprId {
        let call = self.expr(ExprKind::Call { callee, args });
        self.module.facts.insert(call, kind);
        call
    }

    /// A call to a pure function.
    pub fn call(&mut self, def: DefId, args: Vec<ExprId>) -> ExprId {
        self.call_with(Callee::Def(def), args, CallKind::Pure)
    }

    /// A call to an effectful function.
    pub fn call_effectful(&mut self, def: DefId, args: Vec<ExprId>) -> ExprId {
        self.call_with(Callee::Def(def), args, CallKind::Effectful)
    }

    /// `perform Effect.op(args)` on a non-generic operation.
    pub fn perform(&mut self, effect: DefId, op: u32, args: Vec<ExprId>) -> ExprId {
        self.perform_generic(effect, op, args, Vec::new())
    }

    pub fn perform_generic(
        &mut self,
        effect: DefId,
        op: u32,
        args: Vec<ExprId>,
        type_args: Vec<TypeId>,
    ) -> ExprId {
        self.call_with(
            Callee::Def(effect),
            args,
            CallKind::Perform {
                effect,
                op,
                type_args,
            },
        )
    }

    pub fn lambda(&mut self, params: Vec<SymbolId>, body: ExprId, ty: TypeId) -> ExprId {
        self.expr(ExprKind::Lambda { params, body, ty })
    }

    pub fn handle(
        &mut self,
        body: ExprId,
        clauses: Vec<HandlerClause>,
        finally: Option<ExprId>,
    ) -> ExprId {
        self.expr(ExprKind::Handle {
            body,
            clauses,
            finally,
        })
    }

    /// A clause for `effect.op(params)` with resumption binding `resume`.
    pub fn clause(
        effect: DefId,
        op: u32,
        params: Vec<SymbolId>,
        resume: Option<SymbolId>,
        body: ExprId,
    ) -> HandlerClause {
        HandlerClause {
            effect,
            op,
            params,
            resume,
            body,
            span: Span::dummy(),
        }
    }

    pub fn resume(&mut self, binding: SymbolId, value: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::Resume { binding, value })
    }

    pub fn tail(&mut self, binding: SymbolId, value: Option<ExprId>) -> ExprId {
        self.expr(ExprKind::TailResume { binding, value })
    }

    pub fn object(&mut self, ty: TypeId, fields: Vec<(&str, ExprId)>) -> ExprId {
        let fields = fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        self.expr(ExprKind::Object { ty, fields })
    }

    pub fn field(&mut self, base: ExprId, ty: TypeId, name: &str) -> ExprId {
        self.expr(ExprKind::Field {
            base,
            ty,
            name: name.to_string(),
        })
    }
}

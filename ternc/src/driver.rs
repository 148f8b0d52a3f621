//! The whole-program compiler.
//!
//! ## Pipeline
//!
//! ```text
//! 1. Check handler clauses of every function
//! 2. Register effects and perform instantiations, then finalize numbering
//! 3. Declare every top-level function's signature
//! 4. Analyze, lower and emit each function
//! 5. Export entry points and embed the effect table
//! 6. Encode the module
//! ```
//!
//! Any error aborts the build; there is no partial artifact.

use std::collections::HashSet;

use tern_abi::layout::names;
use tern_abi::EffectTable;

use crate::analysis::{analyze_module, convention_of, function_name};
use crate::codegen::{CodegenContext, ExportedEntry, OwnerKind, OwnerSig, TrapMap};
use crate::config::CompilerConfig;
use crate::diagnostics::{Diagnostic, ErrorCode};
use crate::effects::{self, EffectRegistry};
use crate::error::{CompileError, CompileResult};
use crate::hir::{FnDecl, PrimitiveTy, Program, TypeKind};
use crate::mir::{lower_function, LoweringCx};
use crate::target::{self, Module};

/// A compiled program.
#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    /// The encoded module.
    pub bytes: Vec<u8>,
    /// The effect table embedded in the `tern.effects` section.
    pub table: EffectTable,
    pub exports: Vec<ExportedEntry>,
    pub traps: TrapMap,
    /// Warnings produced while compiling.
    pub diagnostics: Vec<Diagnostic>,
    module: Module,
}

impl CompiledArtifact {
    /// Stable textual listing of the generated module.
    pub fn render_text(&self) -> String {
        self.module.render_text()
    }

    pub fn module(&self) -> &Module {
        &self.module
    }
}

/// Compiles a [`Program`] into one artifact.
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    config: CompilerConfig,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    pub fn compile(&self, program: &Program) -> CompileResult<CompiledArtifact> {
        let _span = tracing::info_span!("compile", modules = program.modules.len()).entered();

        for module in &program.modules {
            effects::check_module(program, module)?;
        }

        let mut registry = EffectRegistry::new(&self.config);
        for module in &program.modules {
            registry.register_module(program, module)?;
        }
        let registry = registry.finalize();

        let mut cx = CodegenContext::new(&self.config)?;
        for module in &program.modules {
            for func in module.functions() {
                let sig = OwnerSig {
                    name: function_name(module, func),
                    kind: OwnerKind::Function,
                    convention: convention_of(program, func.signature)?,
                    arity: func.params.len(),
                };
                cx.register_function(func.def, sig);
            }
        }

        for module in &program.modules {
            let lowering = LoweringCx {
                program,
                module,
                registry: &registry,
                config: &self.config,
            };
            for analysis in analyze_module(program, module)? {
                let bodies = lower_function(lowering, &analysis)?;
                cx.emit_function(&bodies)?;
            }
        }

        let mut export_names: HashSet<String> = [
            names::OUTCOME_STATUS,
            names::OUTCOME_CONTINUATION,
            names::RESUME,
            names::EXCHANGE_LEN,
            names::MEMORY,
        ]
        .into_iter()
        .map(String::from)
        .collect();
        for module in &program.modules {
            for func in module.functions().filter(|f| f.exported) {
                check_export(program, func)?;
                if !export_names.insert(func.name.clone()) {
                    return Err(CompileError::new(
                        ErrorCode::UnsupportedExport,
                        format!("export name `{}` is already taken", func.name),
                        func.span,
                    ));
                }
                cx.export_function(func.def, &func.name)?;
            }
        }

        let table = effects::build_table(&registry);
        cx.add_custom(
            names::EFFECT_SECTION,
            effects::section_bytes(&registry, self.config.table_version),
        );

        let (module, traps, exports) = cx.finish()?;
        let bytes = target::encode(&module)?;
        tracing::info!(
            bytes = bytes.len(),
            ops = registry.op_count(),
            exports = exports.len(),
            traps = traps.len(),
            "compiled program"
        );
        Ok(CompiledArtifact {
            bytes,
            table,
            exports,
            traps,
            diagnostics: registry.diagnostics().to_vec(),
            module,
        })
    }
}

/// Exported functions take host integers and booleans only.
fn check_export(program: &Program, func: &FnDecl) -> CompileResult<()> {
    for param in &func.params {
        match program.ty(param.ty)? {
            TypeKind::Primitive(PrimitiveTy::Int | PrimitiveTy::Bool) => {}
            other => {
                return Err(CompileError::new(
                    ErrorCode::UnsupportedExport,
                    format!(
                        "exported function `{}` takes a parameter of type {other:?}; only Int and Bool cross the host boundary",
                        func.name
                    ),
                    func.span,
                ))
            }
        }
    }
    Ok(())
}

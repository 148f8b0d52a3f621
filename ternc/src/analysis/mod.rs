//! # Site & Liveness Analysis
//!
//! Splits every function into owners and computes, per owner, the
//! suspension sites and the state live across each of them.
//!
//! ## Module Structure
//!
//! - [`owners`] - owner discovery and naming
//! - [`sites`] - site classification and forward site order
//! - [`liveness`] - backward liveness with operand temporaries
//!
//! ## Order of Analysis
//!
//! Owners are analyzed children first. A parent only needs the captures of
//! its nested lambdas, handle bodies and clauses, which are read when the
//! closure or handler frame is built.

pub mod liveness;
pub mod owners;
pub mod sites;

use std::collections::HashMap;

pub use liveness::{LiveSet, LivenessAnalyzer, OwnerLiveness};
pub use owners::{convention_of, discover, function_name, Convention, OwnerInfo, OwnerRef};
pub use sites::{Site, SiteKind};

use crate::error::CompileResult;
use crate::hir::{FnDecl, Module, Program};

/// One owner with its analysis result.
#[derive(Debug, Clone)]
pub struct AnalyzedOwner {
    pub info: OwnerInfo,
    pub liveness: OwnerLiveness,
}

impl AnalyzedOwner {
    pub fn has_sites(&self) -> bool {
        !self.liveness.sites.is_empty()
    }
}

/// Analysis of one function: its owners in discovery order (parents first).
#[derive(Debug, Clone)]
pub struct FunctionAnalysis {
    pub owners: Vec<AnalyzedOwner>,
    index: HashMap<OwnerRef, usize>,
}

impl FunctionAnalysis {
    pub fn owner(&self, owner: OwnerRef) -> Option<&AnalyzedOwner> {
        self.index.get(&owner).map(|&i| &self.owners[i])
    }

    pub fn root(&self) -> Option<&AnalyzedOwner> {
        self.owners.first()
    }
}

/// Analyze one function. Handler clause checks must already have passed.
pub fn analyze_function(program: &Program, module: &Module, func: &FnDecl) -> CompileResult<FunctionAnalysis> {
    let infos = discover(program, module, func)?;
    let mut nested = HashMap::new();
    let mut analyzed: Vec<Option<OwnerLiveness>> = vec![None; infos.len()];
    for (i, info) in infos.iter().enumerate().rev() {
        let liveness = LivenessAnalyzer::new(module, &nested).analyze_owner(info)?;
        nested.insert(info.owner, liveness.captures.clone());
        analyzed[i] = Some(liveness);
    }

    let mut owners = Vec::with_capacity(infos.len());
    let mut index = HashMap::with_capacity(infos.len());
    for (info, liveness) in infos.into_iter().zip(analyzed) {
        if let Some(liveness) = liveness {
            index.insert(info.owner, owners.len());
            owners.push(AnalyzedOwner { info, liveness });
        }
    }
    Ok(FunctionAnalysis { owners, index })
}

/// Analyze every function of a module, in declaration order.
pub fn analyze_module(program: &Program, module: &Module) -> CompileResult<Vec<FunctionAnalysis>> {
    let _span = tracing::debug_span!("analyze", module = %module.path()).entered();
    module
        .functions()
        .map(|func| analyze_function(program, module, func))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::build::{ModuleBuilder, ProgramBuilder};
    use crate::hir::OpDecl;
    use tern_abi::ResumeKind;

    #[test]
    fn test_function_analysis_indexes_owners() {
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
        m.function("main", vec![], int, vec![], handle);
        m.finish();
        let program = b.finish();

        let analyses = analyze_module(&program, &program.modules[0]).unwrap();
        assert_eq!(analyses.len(), 1);
        let analysis = &analyses[0];
        assert_eq!(analysis.owners.len(), 3);
        let body = analysis.owner(OwnerRef::HandleBody(handle)).unwrap();
        assert!(body.has_sites());
        let clause = analysis
            .owner(OwnerRef::Clause { handle, index: 0 })
            .unwrap();
        // `tail` is not a suspension point.
        assert!(!clause.has_sites());
        assert_eq!(analysis.root().unwrap().liveness.sites[0].kind, SiteKind::Handle);
    }
}

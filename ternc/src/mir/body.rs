//! # MIR Owner Bodies
//!
//! One [`MirBody`] per owner. Besides the control-flow graph a body
//! records how the owner is entered (its convention and the locals bound
//! by the entry prologue) and, for every suspension site, which locals the
//! site's environment saves.
//!
//! ## Local Roles
//!
//! | Kind | Bound by |
//! |------|----------|
//! | `Param` | entry arguments (clause parameters: the request's argument bundle) |
//! | `Capture` | the closure, handle-body or clause environment |
//! | `Frame` | the handler chain visible to the owner |
//! | `SelfFrame`, `Request` | clause entry only |
//! | `Var`, `Temp`, `Marker` | statements |

use std::collections::HashMap;
use std::fmt;

use super::types::{
    BasicBlockData, BasicBlockId, LocalId, Statement, StatementKind, Terminator, TerminatorKind,
};
use crate::analysis::{Convention, OwnerRef, SiteKind};
use crate::hir::ExprId;
use crate::span::Span;

/// The kind of a local variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalKind {
    Param,
    Capture,
    Var,
    Temp,
    Frame,
    SelfFrame,
    Request,
    Marker,
}

/// A local variable in MIR.
#[derive(Debug, Clone)]
pub struct MirLocal {
    pub id: LocalId,
    pub kind: LocalKind,
    /// Source name, for listings.
    pub name: Option<String>,
    pub span: Span,
}

/// A suspension site of a body.
#[derive(Debug, Clone)]
pub struct SiteInfo {
    /// Dense discriminator, equal to the site's position in `sites`.
    pub order: u32,
    pub expr: ExprId,
    pub kind: SiteKind,
    /// Locals stored in the site environment's slots, in slot order.
    pub saved: Vec<LocalId>,
    pub span: Span,
}

/// A MIR owner body.
#[derive(Debug, Clone)]
pub struct MirBody {
    pub owner: OwnerRef,
    /// Stable owner name; prefix of every generated function name.
    pub name: String,
    pub convention: Convention,
    /// Positional parameters, in entry order.
    pub params: Vec<LocalId>,
    /// Captured locals, in environment slot order.
    pub captures: Vec<LocalId>,
    pub frame: LocalId,
    pub self_frame: Option<LocalId>,
    pub request: Option<LocalId>,
    /// Whether the owner is a clause of a tail-kind operation.
    pub tail_clause: bool,
    pub locals: Vec<MirLocal>,
    pub basic_blocks: Vec<BasicBlockData>,
    pub sites: Vec<SiteInfo>,
    pub span: Span,
}

impl MirBody {
    pub fn new(owner: OwnerRef, name: String, convention: Convention, span: Span) -> Self {
        let mut body = Self {
            owner,
            name,
            convention,
            params: Vec::new(),
            captures: Vec::new(),
            frame: LocalId(0),
            self_frame: None,
            request: None,
            tail_clause: false,
            locals: Vec::new(),
            basic_blocks: Vec::new(),
            sites: Vec::new(),
            span,
        };
        body.frame = body.new_local(LocalKind::Frame, Some("frame".into()), span);
        body.new_block();
        body
    }

    /// Allocate a new local and return its ID.
    pub fn new_local(&mut self, kind: LocalKind, name: Option<String>, span: Span) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(MirLocal {
            id,
            kind,
            name,
            span,
        });
        id
    }

    pub fn new_temp(&mut self, span: Span) -> LocalId {
        self.new_local(LocalKind::Temp, None, span)
    }

    pub fn local(&self, id: LocalId) -> Option<&MirLocal> {
        self.locals.get(id.index())
    }

    /// Allocate a new basic block and return its ID.
    pub fn new_block(&mut self) -> BasicBlockId {
        let id = BasicBlockId(self.basic_blocks.len() as u32);
        self.basic_blocks.push(BasicBlockData::default());
        id
    }

    pub fn block(&self, id: BasicBlockId) -> Option<&BasicBlockData> {
        self.basic_blocks.get(id.index())
    }

    pub fn blocks(&self) -> impl Iterator<Item = (BasicBlockId, &BasicBlockData)> {
        self.basic_blocks
            .iter()
            .enumerate()
            .map(|(i, bb)| (BasicBlockId(i as u32), bb))
    }

    pub fn push_statement(&mut self, block: BasicBlockId, stmt: Statement) {
        if let Some(bb) = self.basic_blocks.get_mut(block.index()) {
            bb.statements.push(stmt);
        }
    }

    pub fn set_terminator(&mut self, block: BasicBlockId, term: Terminator) {
        if let Some(bb) = self.basic_blocks.get_mut(block.index()) {
            bb.terminator = Some(term);
        }
    }

    /// Check if all blocks are terminated.
    pub fn is_complete(&self) -> bool {
        self.basic_blocks.iter().all(BasicBlockData::is_terminated)
    }

    pub fn has_sites(&self) -> bool {
        !self.sites.is_empty()
    }

    /// The block each site resumes into, indexed by site order.
    pub fn resume_blocks(&self) -> HashMap<u32, BasicBlockId> {
        let mut out = HashMap::new();
        for bb in &self.basic_blocks {
            if let Some(Terminator {
                kind: TerminatorKind::Suspend { site, resume, .. },
                ..
            }) = &bb.terminator
            {
                out.insert(*site, *resume);
            }
        }
        out
    }

    /// Compute predecessors for all blocks.
    pub fn predecessors(&self) -> HashMap<BasicBlockId, Vec<BasicBlockId>> {
        let mut preds: HashMap<_, Vec<_>> = HashMap::new();
        for (id, _) in self.blocks() {
            preds.insert(id, Vec::new());
        }
        for (id, block) in self.blocks() {
            for succ in block.successors() {
                preds.entry(succ).or_default().push(id);
            }
        }
        preds
    }

    /// Whether `target` is reachable from the entry block or from a site's
    /// resume block.
    pub fn is_reachable(&self, target: BasicBlockId) -> bool {
        let mut visited = vec![false; self.basic_blocks.len()];
        let mut worklist = vec![BasicBlockId::ENTRY];
        worklist.extend(self.resume_blocks().into_values());

        while let Some(bb) = worklist.pop() {
            if bb == target {
                return true;
            }
            if visited[bb.index()] {
                continue;
            }
            visited[bb.index()] = true;
            if let Some(block) = self.block(bb) {
                worklist.extend(block.successors().into_iter().filter(|s| !visited[s.index()]));
            }
        }
        false
    }

    /// Number of `tail_bump` statements, for listings and tests.
    pub fn tail_bumps(&self) -> usize {
        self.basic_blocks
            .iter()
            .flat_map(|bb| &bb.statements)
            .filter(|stmt| matches!(stmt.kind, StatementKind::TailBump))
            .count()
    }
}

impl fmt::Display for MirBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "body {} ({:?}) {{", self.name, self.convention)?;
        for local in &self.locals {
            match &local.name {
                Some(name) => writeln!(f, "    let {}: {:?} // {name}", local.id, local.kind)?,
                None => writeln!(f, "    let {}: {:?}", local.id, local.kind)?,
            }
        }
        for site in &self.sites {
            write!(f, "    site{} {} saves [", site.order, site.kind)?;
            for (i, local) in site.saved.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{local}")?;
            }
            writeln!(f, "]")?;
        }
        for (id, block) in self.blocks() {
            writeln!(f, "    {id}: {{")?;
            for stmt in &block.statements {
                writeln!(f, "        {stmt};")?;
            }
            match &block.terminator {
                Some(term) => writeln!(f, "        {term};")?,
                None => writeln!(f, "        <unterminated>;")?,
            }
            writeln!(f, "    }}")?;
        }
        writeln!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::DefId;
    use crate::mir::types::{Operand, SuspendAction};

    #[test]
    fn test_new_body_has_frame_and_entry() {
        let body = MirBody::new(
            OwnerRef::Function(DefId::new(0)),
            "app/main::f".into(),
            Convention::Effectful,
            Span::dummy(),
        );
        assert_eq!(body.frame, LocalId(0));
        assert_eq!(body.basic_blocks.len(), 1);
        assert!(!body.is_complete());
    }

    #[test]
    fn test_resume_blocks_are_reachable() {
        let mut body = MirBody::new(
            OwnerRef::Function(DefId::new(0)),
            "app/main::f".into(),
            Convention::Effectful,
            Span::dummy(),
        );
        let dest = body.new_temp(Span::dummy());
        let resume = body.new_block();
        let dead = body.new_block();
        body.set_terminator(
            BasicBlockId::ENTRY,
            Terminator {
                kind: TerminatorKind::Suspend {
                    site: 0,
                    action: SuspendAction::Resume { value: Operand::UNIT },
                    dest,
                    resume,
                },
                span: Span::dummy(),
            },
        );
        body.set_terminator(
            resume,
            Terminator {
                kind: TerminatorKind::Return(Operand::Copy(dest)),
                span: Span::dummy(),
            },
        );
        assert_eq!(body.resume_blocks().get(&0), Some(&resume));
        assert!(body.is_reachable(resume));
        assert!(!body.is_reachable(dead));
        assert_eq!(body.predecessors()[&resume], vec![BasicBlockId::ENTRY]);
    }
}

//! # Core MIR Types
//!
//! ## Type Hierarchy
//!
//! ```text
//! MirBody
//! └── BasicBlockData
//!     ├── Vec<Statement>
//!     │   └── StatementKind
//!     │       ├── Assign(Local, Rvalue)
//!     │       ├── TailBump
//!     │       └── TailCheck
//!     └── Terminator
//!         └── TerminatorKind
//!             ├── Goto { target }
//!             ├── SwitchBool { cond, then_block, else_block }
//!             ├── Return(Operand)
//!             ├── Trap(TrapKind)
//!             └── Suspend { site, action, dest, resume }
//! ```
//!
//! Every local holds one source value (a nullable reference at run time),
//! so locals carry a role instead of a type.

use std::fmt;

use tern_abi::{EffectId, ResumeKind};

use crate::analysis::OwnerRef;
use crate::hir::DefId;
use crate::span::Span;

// ============================================================================
// Locals and Blocks
// ============================================================================

/// A local of one MIR body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "_{}", self.0)
    }
}

/// A unique identifier for a basic block within a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BasicBlockId(pub u32);

impl BasicBlockId {
    /// The entry block ID (always 0).
    pub const ENTRY: BasicBlockId = BasicBlockId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BasicBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A basic block: statements followed by one terminator.
#[derive(Debug, Clone, Default)]
pub struct BasicBlockData {
    pub statements: Vec<Statement>,
    pub terminator: Option<Terminator>,
}

impl BasicBlockData {
    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }

    pub fn successors(&self) -> Vec<BasicBlockId> {
        match &self.terminator {
            Some(term) => term.successors(),
            None => Vec::new(),
        }
    }
}

// ============================================================================
// Operands and Rvalues
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    /// Represented as a null reference.
    Unit,
    Bool(bool),
    Int(i32),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Unit => write!(f, "()"),
            Constant::Bool(b) => write!(f, "{b}"),
            Constant::Int(n) => write!(f, "{n}_i32"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Copy(LocalId),
    Const(Constant),
}

impl Operand {
    pub const UNIT: Operand = Operand::Const(Constant::Unit);

    pub fn local(self) -> Option<LocalId> {
        match self {
            Operand::Copy(local) => Some(local),
            Operand::Const(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Copy(local) => write!(f, "{local}"),
            Operand::Const(c) => write!(f, "const {c}"),
        }
    }
}

/// Integer arithmetic and comparison. Short-circuit operators are lowered
/// to control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl BinOp {
    pub fn from_hir(op: crate::hir::BinOp) -> Option<Self> {
        use crate::hir::BinOp as H;
        Some(match op {
            H::Add => BinOp::Add,
            H::Sub => BinOp::Sub,
            H::Mul => BinOp::Mul,
            H::Div => BinOp::Div,
            H::Rem => BinOp::Rem,
            H::Eq => BinOp::Eq,
            H::Ne => BinOp::Ne,
            H::Lt => BinOp::Lt,
            H::Le => BinOp::Le,
            H::Gt => BinOp::Gt,
            H::Ge => BinOp::Ge,
            H::And | H::Or => return None,
        })
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// The callee of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Function(DefId),
    /// A closure value.
    Closure(Operand),
}

impl fmt::Display for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Function(def) => write!(f, "{def}"),
            CallTarget::Closure(op) => write!(f, "closure {op}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rvalue {
    Use(Operand),
    BinaryOp(BinOp, Operand, Operand),
    UnaryOp(UnOp, Operand),
    /// A tuple, object or argument bundle.
    Aggregate(Vec<Operand>),
    /// Slot `index` of an aggregate.
    Project { base: Operand, index: u32 },
    /// A closure over a lambda owner; `captures` follow the owner's capture
    /// order.
    Closure { owner: OwnerRef, captures: Vec<Operand> },
    /// A call that cannot suspend.
    PureCall { target: CallTarget, args: Vec<Operand> },
    /// A fresh identity object for one handler installation.
    Marker,
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Operand]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Rvalue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rvalue::Use(op) => write!(f, "{op}"),
            Rvalue::BinaryOp(op, a, b) => write!(f, "{op:?}({a}, {b})"),
            Rvalue::UnaryOp(op, a) => write!(f, "{op:?}({a})"),
            Rvalue::Aggregate(items) => {
                write!(f, "[")?;
                write_list(f, items)?;
                write!(f, "]")
            }
            Rvalue::Project { base, index } => write!(f, "{base}.{index}"),
            Rvalue::Closure { owner, captures } => {
                write!(f, "closure({owner}; ")?;
                write_list(f, captures)?;
                write!(f, ")")
            }
            Rvalue::PureCall { target, args } => {
                write!(f, "call {target}(")?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Rvalue::Marker => write!(f, "marker"),
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StatementKind {
    Assign(LocalId, Rvalue),
    /// `tail v`: count one tail resumption on the clause's guard.
    TailBump,
    /// Trap unless the guard saw exactly the expected tail resumptions.
    TailCheck,
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            StatementKind::Assign(local, rvalue) => write!(f, "{local} = {rvalue}"),
            StatementKind::TailBump => write!(f, "tail_bump"),
            StatementKind::TailCheck => write!(f, "tail_check"),
        }
    }
}

// ============================================================================
// Terminators
// ============================================================================

/// Why generated code traps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrapKind {
    /// No match arm accepted the scrutinee.
    NoMatch,
    /// A tail clause finished without exactly one tail resumption.
    TailGuard,
    /// A callee of a pure owner returned an effect outcome.
    EffectInPureOwner,
    /// A continuation named a site its owner does not have.
    UnknownSite,
    /// The host handed back a resume value the artifact cannot represent.
    BadResumeValue,
    /// Control reached code the lowering proved dead.
    Unreachable,
}

impl TrapKind {
    pub fn message(self) -> &'static str {
        match self {
            TrapKind::NoMatch => "no match arm accepted the value",
            TrapKind::TailGuard => "tail clause did not resume exactly once",
            TrapKind::EffectInPureOwner => "effect escaped a pure function",
            TrapKind::UnknownSite => "continuation resumed an unknown site",
            TrapKind::BadResumeValue => "host resume value is malformed",
            TrapKind::Unreachable => "unreachable code",
        }
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// A registry-resolved operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerformOp {
    pub effect: EffectId,
    pub op_id: u32,
    pub op_index: u32,
    pub resume_kind: ResumeKind,
}

/// A tail clause of the statically enclosing handle construct, reachable
/// from the body's frame by following `prev` `depth` times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectClause {
    pub owner: OwnerRef,
    pub depth: u32,
}

/// One handler frame pushed by a handle site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClauseFrame {
    pub owner: OwnerRef,
    pub effect: EffectId,
    pub op_id: u32,
    pub resume_kind: ResumeKind,
    /// Values for the clause owner's captures.
    pub captures: Vec<Operand>,
}

/// What a suspension site does before checking the outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuspendAction {
    Perform {
        op: PerformOp,
        args: Vec<Operand>,
        direct: Option<DirectClause>,
    },
    Call {
        target: CallTarget,
        args: Vec<Operand>,
    },
    Handle {
        marker: LocalId,
        clauses: Vec<ClauseFrame>,
        body: OwnerRef,
        body_captures: Vec<Operand>,
    },
    Resume {
        value: Operand,
    },
}

impl fmt::Display for SuspendAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SuspendAction::Perform { op, args, direct } => {
                write!(f, "perform #{}(", op.op_index)?;
                write_list(f, args)?;
                write!(f, ")")?;
                if let Some(direct) = direct {
                    write!(f, " direct {}", direct.owner)?;
                }
                Ok(())
            }
            SuspendAction::Call { target, args } => {
                write!(f, "call {target}(")?;
                write_list(f, args)?;
                write!(f, ")")
            }
            SuspendAction::Handle {
                marker, clauses, ..
            } => write!(f, "handle {marker} with {} clauses", clauses.len()),
            SuspendAction::Resume { value } => write!(f, "resume {value}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Terminator {
    pub kind: TerminatorKind,
    pub span: Span,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BasicBlockId> {
        match &self.kind {
            TerminatorKind::Goto { target } => vec![*target],
            TerminatorKind::SwitchBool {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            TerminatorKind::Suspend { resume, .. } => vec![*resume],
            TerminatorKind::Return(_) | TerminatorKind::Trap(_) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TerminatorKind {
    Goto {
        target: BasicBlockId,
    },
    SwitchBool {
        cond: Operand,
        then_block: BasicBlockId,
        else_block: BasicBlockId,
    },
    Return(Operand),
    Trap(TrapKind),
    /// Run `action`; on a value, store it in `dest` and continue at
    /// `resume`; on an effect, suspend at `site`.
    Suspend {
        site: u32,
        action: SuspendAction,
        dest: LocalId,
        resume: BasicBlockId,
    },
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            TerminatorKind::Goto { target } => write!(f, "goto {target}"),
            TerminatorKind::SwitchBool {
                cond,
                then_block,
                else_block,
            } => write!(f, "switch {cond} [true: {then_block}, false: {else_block}]"),
            TerminatorKind::Return(op) => write!(f, "return {op}"),
            TerminatorKind::Trap(kind) => write!(f, "trap {kind:?}"),
            TerminatorKind::Suspend {
                site,
                action,
                dest,
                resume,
            } => write!(f, "{dest} = suspend site{site} {action} -> {resume}"),
        }
    }
}

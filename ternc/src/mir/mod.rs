//! # Mid-level Intermediate Representation (MIR)
//!
//! A control-flow graph per owner, with suspension sites made explicit.
//!
//! ## Key Properties
//!
//! | Property | HIR | MIR |
//! |----------|-----|-----|
//! | Structure | Tree (nested expressions) | CFG (basic blocks) |
//! | Control flow | Implicit (if/match/loop) | Explicit edges |
//! | Temporaries | Implicit | Explicit locals |
//! | Suspension | `perform`, effectful calls, `handle`, `resume` | `Suspend` terminators |
//!
//! ## Module Structure
//!
//! - [`types`] - Core MIR types (blocks, statements, terminators)
//! - [`body`] - Owner bodies, locals and site records
//! - [`lowering`] - HIR to MIR lowering pass
//!
//! ## MIR Structure Overview
//!
//! ```text
//! MIR Body
//! ├── Locals (frame, params, captures, vars, temporaries)
//! ├── Sites (saved locals per suspension site)
//! └── Basic Blocks
//!     └── BasicBlock
//!         ├── Statements (assignments, tail guard updates)
//!         └── Terminator (goto, switch, return, trap, suspend)
//! ```

pub mod body;
pub mod lowering;
pub mod types;

pub use body::{LocalKind, MirBody, MirLocal, SiteInfo};
pub use lowering::{lower_function, LoweringCx};
pub use types::{
    BasicBlockData, BasicBlockId, BinOp, CallTarget, ClauseFrame, Constant, DirectClause, LocalId,
    Operand, PerformOp, Rvalue, Statement, StatementKind, SuspendAction, Terminator,
    TerminatorKind, TrapKind, UnOp,
};

//! Runtime support emitted into every artifact.
//!
//! The helpers below are ordinary functions of the generated module. They
//! are the only code that walks handler chains, resumes continuations or
//! touches a tail guard; the per-owner state machines call them.
//!
//! | Helper | Signature | Purpose |
//! |--------|-----------|---------|
//! | `rt_box` | `(i32) -> anyref` | box an integer or boolean |
//! | `rt_unbox` | `(anyref) -> i32` | unbox it again |
//! | `rt_find_frame` | `(frame, hi, lo, op) -> frame` | nearest matching frame, or null |
//! | `rt_outer` | `(frame) -> frame` | first frame outside the given frame's construct |
//! | `rt_resume` | `(cont, value) -> outcome` | invoke a continuation; null resumes to `Value` |
//! | `rt_dispatch` | `(marker, outcome) -> outcome` | run clauses of one construct until the outcome is not theirs |
//! | `rt_rewrap` | `(request, cont) -> outcome` | copy a request with a new continuation |
//! | `rt_tail_bump` | `(guard)` | count one tail resumption |
//! | `rt_tail_check` | `(guard)` | trap unless exactly the expected count was observed |

use tern_abi::layout::{continuation, frame, guard, names, outcome, request};

use super::abi::AbiTypes;
use super::context::CodegenContext;
use crate::error::CompileResult;
use crate::mir::TrapKind;
use crate::span::Span;
use crate::target::{BlockType, FuncBuilder, FuncIdx, Heap, Instr, Module, ValType};

/// Runtime helper names.
pub mod functions {
    pub const BOX: &str = "rt_box";
    pub const UNBOX: &str = "rt_unbox";
    pub const FIND_FRAME: &str = "rt_find_frame";
    pub const OUTER: &str = "rt_outer";
    pub const RESUME: &str = "rt_resume";
    pub const DISPATCH: &str = "rt_dispatch";
    pub const REWRAP: &str = "rt_rewrap";
    pub const TAIL_BUMP: &str = "rt_tail_bump";
    pub const TAIL_CHECK: &str = "rt_tail_check";
}

/// Indices of the host imports and runtime helpers.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeFuncs {
    pub write_scalar: FuncIdx,
    pub write_request: FuncIdx,
    pub read_scalar: FuncIdx,
    pub box_int: FuncIdx,
    pub unbox_int: FuncIdx,
    pub find_frame: FuncIdx,
    pub outer: FuncIdx,
    pub resume: FuncIdx,
    pub dispatch: FuncIdx,
    pub rewrap: FuncIdx,
    pub tail_bump: FuncIdx,
    pub tail_check: FuncIdx,
    /// Global holding the length of the last exchange record.
    pub exchange_len: u32,
}

impl RuntimeFuncs {
    /// Import the host functions and declare every helper.
    pub fn declare(module: &mut Module, abi: &AbiTypes) -> CompileResult<Self> {
        use ValType::{AnyRef, I32};
        let write_scalar_ty = module.func_type(vec![I32; 2], vec![I32]);
        let write_request_ty = module.func_type(vec![I32; 8], vec![I32]);
        let read_scalar_ty = module.func_type(vec![I32; 2], vec![I32]);
        let write_scalar = module.import_func(names::IMPORT_MODULE, names::WRITE_SCALAR, write_scalar_ty)?;
        let write_request =
            module.import_func(names::IMPORT_MODULE, names::WRITE_EFFECT_REQUEST, write_request_ty)?;
        let read_scalar = module.import_func(names::IMPORT_MODULE, names::READ_SCALAR, read_scalar_ty)?;

        let box_ty = module.func_type(vec![I32], vec![AnyRef]);
        let unbox_ty = module.func_type(vec![AnyRef], vec![I32]);
        let find_ty = module.func_type(vec![AnyRef, I32, I32, I32], vec![AnyRef]);
        let unary_ty = module.func_type(vec![AnyRef], vec![AnyRef]);
        let guard_ty = module.func_type(vec![AnyRef], vec![]);

        Ok(Self {
            write_scalar,
            write_request,
            read_scalar,
            box_int: module.declare_func(functions::BOX, box_ty),
            unbox_int: module.declare_func(functions::UNBOX, unbox_ty),
            find_frame: module.declare_func(functions::FIND_FRAME, find_ty),
            outer: module.declare_func(functions::OUTER, unary_ty),
            resume: module.declare_func(functions::RESUME, abi.cont_fn),
            dispatch: module.declare_func(functions::DISPATCH, abi.cont_fn),
            rewrap: module.declare_func(functions::REWRAP, abi.cont_fn),
            tail_bump: module.declare_func(functions::TAIL_BUMP, guard_ty),
            tail_check: module.declare_func(functions::TAIL_CHECK, guard_ty),
            exchange_len: module.add_global("exchange_len", 0),
        })
    }
}

/// Define the bodies of every helper.
pub fn define(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    let rt = cx.rt;

    // rt_box
    let mut f = FuncBuilder::new(1);
    f.emit(Instr::LocalGet(0)).emit(Instr::StructNew(abi.int));
    let (locals, body) = f.finish();
    cx.module.define(rt.box_int, locals, body)?;

    // rt_unbox
    let mut f = FuncBuilder::new(1);
    f.emit(Instr::LocalGet(0)).extend(cx.get(abi.int, 0));
    let (locals, body) = f.finish();
    cx.module.define(rt.unbox_int, locals, body)?;

    define_find_frame(cx)?;
    define_outer(cx)?;
    define_resume(cx)?;
    define_dispatch(cx)?;
    define_rewrap(cx)?;
    define_guard_helpers(cx)
}

/// Push `i32.const 1` when `marker` of the frame on `frame_local` is the
/// same object as the marker in `marker_local`.
fn same_marker(cx: &CodegenContext<'_>, f: &mut FuncBuilder, frame_local: u32, marker_local: u32) {
    f.emit(Instr::LocalGet(frame_local))
        .extend(cx.get(cx.abi.frame, frame::MARKER))
        .emit(Instr::RefCast(Heap::Eq))
        .emit(Instr::LocalGet(marker_local))
        .emit(Instr::RefCast(Heap::Eq))
        .emit(Instr::RefEq);
}

/// Return null from the current function when `local` is null.
fn return_null_if_null(f: &mut FuncBuilder, local: u32) {
    let l = f.label();
    f.emit(Instr::LocalGet(local))
        .emit(Instr::RefIsNull)
        .emit(Instr::If(l, BlockType::Empty))
        .emit(Instr::RefNull(Heap::Any))
        .emit(Instr::Return)
        .emit(Instr::End);
}

fn define_find_frame(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let fr = cx.abi.frame;
    let mut f = FuncBuilder::new(4);
    let top = f.label();
    let found = f.label();
    f.emit(Instr::Loop(top, BlockType::Empty));
    return_null_if_null(&mut f, 0);
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::EFFECT_HI))
        .emit(Instr::LocalGet(1))
        .emit(Instr::I32Eq)
        .emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::EFFECT_LO))
        .emit(Instr::LocalGet(2))
        .emit(Instr::I32Eq)
        .emit(Instr::I32And)
        .emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::OP_ID))
        .emit(Instr::LocalGet(3))
        .emit(Instr::I32Eq)
        .emit(Instr::I32And)
        .emit(Instr::If(found, BlockType::Empty))
        .emit(Instr::LocalGet(0))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::PREV))
        .emit(Instr::LocalSet(0))
        .emit(Instr::Br(top))
        .emit(Instr::End)
        .emit(Instr::Unreachable);
    let (locals, body) = f.finish();
    let idx = cx.rt.find_frame;
    cx.module.define(idx, locals, body)
}

fn define_outer(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let fr = cx.abi.frame;
    let mut f = FuncBuilder::new(1);
    let marker = f.local(ValType::AnyRef);
    let top = f.label();
    let sibling = f.label();
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::MARKER))
        .emit(Instr::LocalSet(marker))
        .emit(Instr::Loop(top, BlockType::Empty));
    return_null_if_null(&mut f, 0);
    same_marker(cx, &mut f, 0, marker);
    f.emit(Instr::If(sibling, BlockType::Empty))
        .emit(Instr::LocalGet(0))
        .extend(cx.get(fr, frame::PREV))
        .emit(Instr::LocalSet(0))
        .emit(Instr::Br(top))
        .emit(Instr::End)
        .emit(Instr::LocalGet(0))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::Unreachable);
    let (locals, body) = f.finish();
    let idx = cx.rt.outer;
    cx.module.define(idx, locals, body)
}

fn define_resume(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    let mut f = FuncBuilder::new(2);
    let direct = f.label();
    f.emit(Instr::LocalGet(0))
        .emit(Instr::RefIsNull)
        .emit(Instr::If(direct, BlockType::Empty))
        .emit(Instr::I32Const(outcome::VALUE))
        .emit(Instr::LocalGet(1))
        .emit(Instr::StructNew(abi.outcome))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(0))
        .extend(cx.get(abi.cont, continuation::ENV))
        .emit(Instr::LocalGet(1))
        .emit(Instr::LocalGet(0))
        .extend(cx.get(abi.cont, continuation::FUNC))
        .emit(Instr::RefCast(Heap::Concrete(abi.cont_fn)))
        .emit(Instr::CallRef(abi.cont_fn));
    let (locals, body) = f.finish();
    let idx = cx.rt.resume;
    cx.module.define(idx, locals, body)
}

fn define_dispatch(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    // params: marker, outcome
    let mut f = FuncBuilder::new(2);
    let req = f.local(ValType::AnyRef);
    let target = f.local(ValType::AnyRef);
    let top = f.label();
    let (not_effect, no_target, other) = (f.label(), f.label(), f.label());
    f.emit(Instr::Loop(top, BlockType::Empty))
        .emit(Instr::LocalGet(1))
        .extend(cx.get(abi.outcome, outcome::TAG))
        .emit(Instr::I32Const(outcome::EFFECT))
        .emit(Instr::I32Ne)
        .emit(Instr::If(not_effect, BlockType::Empty))
        .emit(Instr::LocalGet(1))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(1))
        .extend(cx.get(abi.outcome, outcome::PAYLOAD))
        .emit(Instr::LocalSet(req))
        .emit(Instr::LocalGet(req))
        .extend(cx.get(abi.request, request::TARGET))
        .emit(Instr::LocalSet(target))
        .emit(Instr::LocalGet(target))
        .emit(Instr::RefIsNull)
        .emit(Instr::If(no_target, BlockType::Empty))
        .emit(Instr::LocalGet(1))
        .emit(Instr::Return)
        .emit(Instr::End);
    same_marker(cx, &mut f, target, 0);
    f.emit(Instr::I32Eqz)
        .emit(Instr::If(other, BlockType::Empty))
        .emit(Instr::LocalGet(1))
        .emit(Instr::Return)
        .emit(Instr::End)
        .emit(Instr::LocalGet(target))
        .emit(Instr::LocalGet(target))
        .extend(cx.get(abi.frame, frame::CLAUSE_ENV))
        .emit(Instr::LocalGet(req))
        .emit(Instr::LocalGet(target))
        .extend(cx.get(abi.frame, frame::CLAUSE))
        .emit(Instr::RefCast(Heap::Concrete(abi.clause_fn)))
        .emit(Instr::CallRef(abi.clause_fn))
        .emit(Instr::LocalSet(1))
        .emit(Instr::Br(top))
        .emit(Instr::End)
        .emit(Instr::Unreachable);
    let (locals, body) = f.finish();
    let idx = cx.rt.dispatch;
    cx.module.define(idx, locals, body)
}

fn define_rewrap(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let abi = cx.abi;
    let mut f = FuncBuilder::new(2);
    f.emit(Instr::I32Const(outcome::EFFECT));
    for field in 0..request::FIELD_COUNT {
        if field == request::CONT {
            f.emit(Instr::LocalGet(1));
        } else {
            f.emit(Instr::LocalGet(0)).extend(cx.get(abi.request, field));
        }
    }
    f.emit(Instr::StructNew(abi.request))
        .emit(Instr::StructNew(abi.outcome));
    let (locals, body) = f.finish();
    let idx = cx.rt.rewrap;
    cx.module.define(idx, locals, body)
}

fn define_guard_helpers(cx: &mut CodegenContext<'_>) -> CompileResult<()> {
    let g = cx.abi.guard;

    let mut f = FuncBuilder::new(1);
    f.emit(Instr::LocalGet(0))
        .emit(cx.cast(g))
        .emit(Instr::LocalGet(0))
        .extend(cx.get(g, guard::OBSERVED))
        .emit(Instr::I32Const(1))
        .emit(Instr::I32Add)
        .emit(Instr::StructSet(g, guard::OBSERVED));
    let (locals, body) = f.finish();
    let idx = cx.rt.tail_bump;
    cx.module.define(idx, locals, body)?;

    let mut f = FuncBuilder::new(1);
    let mismatch = f.label();
    f.emit(Instr::LocalGet(0))
        .extend(cx.get(g, guard::EXPECTED))
        .emit(Instr::LocalGet(0))
        .extend(cx.get(g, guard::OBSERVED))
        .emit(Instr::I32Ne)
        .emit(Instr::If(mismatch, BlockType::Empty))
        .emit(Instr::Unreachable)
        .emit(Instr::End);
    let (locals, body) = f.finish();
    let idx = cx.rt.tail_check;
    cx.module.define(idx, locals, body)?;
    cx.trap(
        functions::TAIL_CHECK,
        TrapKind::TailGuard,
        Span::dummy(),
        "tail clause resumed a number of times other than once",
    );
    Ok(())
}

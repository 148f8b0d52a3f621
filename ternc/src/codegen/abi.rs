//! Runtime record types and owner signatures.
//!
//! Every record of the value ABI becomes one struct type whose field order
//! is fixed by `tern_abi::layout`. Source values are nullable `anyref`:
//! unit is null, integers and booleans are boxed in `$Int`, tuples and
//! objects are `$Slots` arrays.
//!
//! Owner entry points take only `anyref` parameters, so their function
//! types are determined by the number of inputs alone:
//!
//! | Owner | Pure inputs | Effectful inputs |
//! |-------|-------------|------------------|
//! | function | `params` | `frame, params` |
//! | lambda | `env, params` | `env, frame, params` |
//! | handle body | | `frame, env` |
//! | clause | | `self_frame, env, request` |
//!
//! The state-machine body of an owner takes `(started: i32, kenv, resume)`
//! followed by the entry inputs.

use tern_abi::layout::{closure, continuation, frame, guard, outcome, request, site_env};

use crate::target::{Field, Module, TypeDef, TypeIdx, ValType};
use crate::analysis::{Convention, OwnerRef};

/// Type indices of the runtime records and fixed function shapes.
#[derive(Debug, Clone, Copy)]
pub struct AbiTypes {
    pub int: TypeIdx,
    pub slots: TypeIdx,
    pub outcome: TypeIdx,
    pub request: TypeIdx,
    pub cont: TypeIdx,
    pub frame: TypeIdx,
    pub guard: TypeIdx,
    pub site_env: TypeIdx,
    pub closure: TypeIdx,
    /// `(env, resume) -> outcome`
    pub cont_fn: TypeIdx,
    /// `(self_frame, env, request) -> outcome`
    pub clause_fn: TypeIdx,
}

impl AbiTypes {
    pub fn declare(module: &mut Module) -> Self {
        use ValType::{AnyRef, FuncRef, I32};
        let imm = Field::imm;

        let int = module.named_type("Int", TypeDef::Struct(vec![imm(I32)]));
        let slots = module.named_type("Slots", TypeDef::Array(Field::mutable(AnyRef)));

        let mut outcome_fields = vec![imm(I32); 2];
        outcome_fields[outcome::PAYLOAD as usize] = imm(AnyRef);
        let outcome = module.named_type("Outcome", TypeDef::Struct(outcome_fields));

        let mut request_fields = vec![imm(I32); request::FIELD_COUNT as usize];
        for field in [request::TARGET, request::ARGS, request::CONT, request::GUARD] {
            request_fields[field as usize] = imm(AnyRef);
        }
        let request = module.named_type("Request", TypeDef::Struct(request_fields));

        let mut cont_fields = vec![imm(I32); 3];
        cont_fields[continuation::FUNC as usize] = imm(FuncRef);
        cont_fields[continuation::ENV as usize] = imm(AnyRef);
        let cont = module.named_type("Cont", TypeDef::Struct(cont_fields));

        let mut frame_fields = vec![imm(I32); frame::FIELD_COUNT as usize];
        for field in [frame::PREV, frame::CLAUSE_ENV, frame::MARKER] {
            frame_fields[field as usize] = imm(AnyRef);
        }
        frame_fields[frame::CLAUSE as usize] = imm(FuncRef);
        let frame = module.named_type("Frame", TypeDef::Struct(frame_fields));

        let mut guard_fields = vec![imm(I32); 2];
        guard_fields[guard::OBSERVED as usize] = Field::mutable(I32);
        let guard = module.named_type("Guard", TypeDef::Struct(guard_fields));

        let mut env_fields = vec![imm(AnyRef); 4];
        env_fields[site_env::SITE as usize] = imm(I32);
        let site_env = module.named_type("SiteEnv", TypeDef::Struct(env_fields));

        let mut closure_fields = vec![imm(AnyRef); 2];
        closure_fields[closure::FUNC as usize] = imm(FuncRef);
        let closure = module.named_type("Closure", TypeDef::Struct(closure_fields));

        let cont_fn = module.named_type(
            "ContFn",
            TypeDef::Func {
                params: vec![AnyRef; 2],
                results: vec![AnyRef],
            },
        );
        let clause_fn = module.named_type(
            "ClauseFn",
            TypeDef::Func {
                params: vec![AnyRef; 3],
                results: vec![AnyRef],
            },
        );

        Self {
            int,
            slots,
            outcome,
            request,
            cont,
            frame,
            guard,
            site_env,
            closure,
            cont_fn,
            clause_fn,
        }
    }
}

/// The role of an owner, which fixes its entry inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Function,
    Lambda,
    HandleBody,
    Clause,
}

impl From<OwnerRef> for OwnerKind {
    fn from(owner: OwnerRef) -> Self {
        match owner {
            OwnerRef::Function(_) => OwnerKind::Function,
            OwnerRef::Lambda(_) => OwnerKind::Lambda,
            OwnerRef::HandleBody(_) => OwnerKind::HandleBody,
            OwnerRef::Clause { .. } => OwnerKind::Clause,
        }
    }
}

/// What callers need to know about an owner before its body is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerSig {
    pub name: String,
    pub kind: OwnerKind,
    pub convention: Convention,
    pub arity: usize,
}

impl OwnerSig {
    /// Number of `anyref` inputs of the entry point.
    pub fn inputs(&self) -> usize {
        let effectful = usize::from(self.convention.is_effectful());
        match self.kind {
            OwnerKind::Function => effectful + self.arity,
            OwnerKind::Lambda => 1 + effectful + self.arity,
            OwnerKind::HandleBody => 2,
            OwnerKind::Clause => 3,
        }
    }

    pub fn entry_type(&self, module: &mut Module) -> TypeIdx {
        module.func_type(vec![ValType::AnyRef; self.inputs()], vec![ValType::AnyRef])
    }

    pub fn body_type(&self, module: &mut Module) -> TypeIdx {
        let mut params = vec![ValType::I32, ValType::AnyRef, ValType::AnyRef];
        params.extend(std::iter::repeat(ValType::AnyRef).take(self.inputs()));
        module.func_type(params, vec![ValType::AnyRef])
    }
}

/// Function type of a closure called with the given convention and arity.
pub fn closure_call_type(module: &mut Module, convention: Convention, arity: usize) -> TypeIdx {
    let sig = OwnerSig {
        name: String::new(),
        kind: OwnerKind::Lambda,
        convention,
        arity,
    };
    sig.entry_type(module)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::DefId;

    #[test]
    fn test_record_types_follow_layout() {
        let mut module = Module::new(1);
        let abi = AbiTypes::declare(&mut module);
        match &module.types[abi.frame as usize] {
            TypeDef::Struct(fields) => {
                assert_eq!(fields.len(), frame::FIELD_COUNT as usize);
                assert_eq!(fields[frame::CLAUSE as usize].ty, ValType::FuncRef);
                assert_eq!(fields[frame::LABEL as usize].ty, ValType::I32);
                assert_eq!(fields[frame::MARKER as usize].ty, ValType::AnyRef);
            }
            other => panic!("frame is not a struct: {other:?}"),
        }
        match &module.types[abi.guard as usize] {
            TypeDef::Struct(fields) => {
                assert!(fields[guard::OBSERVED as usize].mutable);
                assert!(!fields[guard::EXPECTED as usize].mutable);
            }
            other => panic!("guard is not a struct: {other:?}"),
        }
        // Every record shape is distinct.
        let records = [
            abi.int,
            abi.slots,
            abi.outcome,
            abi.request,
            abi.cont,
            abi.frame,
            abi.guard,
            abi.site_env,
            abi.closure,
        ];
        let mut sorted = records.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), records.len());
    }

    #[test]
    fn test_owner_inputs() {
        let sig = |kind, convention, arity| OwnerSig {
            name: "f".into(),
            kind,
            convention,
            arity,
        };
        assert_eq!(sig(OwnerKind::Function, Convention::Pure, 2).inputs(), 2);
        assert_eq!(sig(OwnerKind::Function, Convention::Effectful, 2).inputs(), 3);
        assert_eq!(sig(OwnerKind::Lambda, Convention::Effectful, 1).inputs(), 3);
        assert_eq!(sig(OwnerKind::Clause, Convention::Effectful, 4).inputs(), 3);
        assert_eq!(OwnerKind::from(OwnerRef::Function(DefId::new(0))), OwnerKind::Function);
    }
}

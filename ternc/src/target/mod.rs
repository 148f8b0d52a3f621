//! # Target Module IR
//!
//! An in-memory form of the VM module the code generator emits. It mirrors
//! the binary format closely (type, import, function, memory, global,
//! export and custom sections) with two conveniences:
//!
//! - Structured control instructions carry a [`Label`] instead of a
//!   relative depth; [`encode`] resolves labels to depths.
//! - Type definitions are interned, so asking twice for the same function
//!   signature yields the same index.
//!
//! ## Module Structure
//!
//! - [`encode`] - serialization with `wasm-encoder`
//! - [`display`] - the stable text listing used by snapshot tests

pub mod display;
pub mod encode;

use std::collections::HashMap;

use crate::error::CompileResult;
use crate::ice_err;
use crate::span::Span;

pub use encode::encode;

/// Index into the type section.
pub type TypeIdx = u32;
/// Index into the function index space (imports first).
pub type FuncIdx = u32;

/// A value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    /// Nullable `anyref`.
    AnyRef,
    /// Nullable `funcref`.
    FuncRef,
}

/// A heap type used by reference instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Heap {
    Any,
    Eq,
    Func,
    Concrete(TypeIdx),
}

/// A struct field or array element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    pub ty: ValType,
    pub mutable: bool,
}

impl Field {
    pub const fn imm(ty: ValType) -> Self {
        Self { ty, mutable: false }
    }

    pub const fn mutable(ty: ValType) -> Self {
        Self { ty, mutable: true }
    }
}

/// A type section entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeDef {
    Func {
        params: Vec<ValType>,
        results: Vec<ValType>,
    },
    Struct(Vec<Field>),
    Array(Field),
}

/// Block signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
}

/// A structured control label, unique within one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

/// One instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instr {
    // Control
    Block(Label, BlockType),
    Loop(Label, BlockType),
    If(Label, BlockType),
    Else,
    End,
    Br(Label),
    BrIf(Label),
    BrTable(Vec<Label>, Label),
    Return,
    Unreachable,
    Drop,
    Call(FuncIdx),
    CallRef(TypeIdx),

    // Variables
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),

    // Numeric
    I32Const(i32),
    I32Add,
    I32Sub,
    I32Mul,
    I32DivS,
    I32RemS,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LeS,
    I32GtS,
    I32GeS,
    I32Eqz,
    I32And,
    I32Or,

    // Memory
    I32Load(u32),
    I32Store(u32),

    // References
    RefNull(Heap),
    RefIsNull,
    RefFunc(FuncIdx),
    RefEq,
    /// Cast to a nullable reference of the heap type.
    RefCast(Heap),
    /// Test for a non-null reference of the heap type.
    RefTest(Heap),

    // Aggregates
    StructNew(TypeIdx),
    StructGet(TypeIdx, u32),
    StructSet(TypeIdx, u32),
    ArrayNewFixed(TypeIdx, u32),
    ArrayGet(TypeIdx),
    ArrayLen,
}

/// An imported function.
#[derive(Debug, Clone)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub ty: TypeIdx,
}

/// A defined function. `body` is empty until the function is defined.
#[derive(Debug, Clone)]
pub struct Func {
    pub name: String,
    pub ty: TypeIdx,
    pub locals: Vec<ValType>,
    pub body: Vec<Instr>,
    pub defined: bool,
}

/// A mutable i32 global.
#[derive(Debug, Clone)]
pub struct Global {
    pub name: String,
    pub init: i32,
}

/// An export entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportKind {
    Func(FuncIdx),
    Memory,
}

#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
}

/// A custom section.
#[derive(Debug, Clone)]
pub struct Custom {
    pub name: String,
    pub data: Vec<u8>,
}

/// A complete module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<TypeDef>,
    type_index: HashMap<TypeDef, TypeIdx>,
    /// Human-readable names of interned types, for listings.
    pub type_names: HashMap<TypeIdx, String>,
    pub imports: Vec<Import>,
    pub funcs: Vec<Func>,
    pub memory_pages: u64,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub customs: Vec<Custom>,
}

impl Module {
    pub fn new(memory_pages: u64) -> Self {
        Self {
            memory_pages,
            ..Self::default()
        }
    }

    /// Intern a type definition.
    pub fn intern_type(&mut self, def: TypeDef) -> TypeIdx {
        if let Some(&idx) = self.type_index.get(&def) {
            return idx;
        }
        let idx = self.types.len() as TypeIdx;
        self.types.push(def.clone());
        self.type_index.insert(def, idx);
        idx
    }

    /// Intern a type and remember a display name for it.
    pub fn named_type(&mut self, name: &str, def: TypeDef) -> TypeIdx {
        let idx = self.intern_type(def);
        self.type_names.entry(idx).or_insert_with(|| name.to_string());
        idx
    }

    pub fn func_type(&mut self, params: Vec<ValType>, results: Vec<ValType>) -> TypeIdx {
        self.intern_type(TypeDef::Func { params, results })
    }

    pub fn func_params(&self, ty: TypeIdx) -> Option<&[ValType]> {
        match self.types.get(ty as usize)? {
            TypeDef::Func { params, .. } => Some(params),
            _ => None,
        }
    }

    /// Import a function. All imports must precede the first declaration.
    pub fn import_func(&mut self, module: &str, name: &str, ty: TypeIdx) -> CompileResult<FuncIdx> {
        if !self.funcs.is_empty() {
            return Err(ice_err!(Span::dummy(), "import after function declarations"; "name" => name));
        }
        self.imports.push(Import {
            module: module.to_string(),
            name: name.to_string(),
            ty,
        });
        Ok(self.imports.len() as FuncIdx - 1)
    }

    /// Reserve a function index; the body is supplied by [`Module::define`].
    pub fn declare_func(&mut self, name: impl Into<String>, ty: TypeIdx) -> FuncIdx {
        self.funcs.push(Func {
            name: name.into(),
            ty,
            locals: Vec::new(),
            body: Vec::new(),
            defined: false,
        });
        (self.imports.len() + self.funcs.len() - 1) as FuncIdx
    }

    pub fn func(&self, idx: FuncIdx) -> Option<&Func> {
        let local = (idx as usize).checked_sub(self.imports.len())?;
        self.funcs.get(local)
    }

    /// Name of any function in the index space.
    pub fn func_name(&self, idx: FuncIdx) -> Option<&str> {
        match self.imports.get(idx as usize) {
            Some(import) => Some(&import.name),
            None => self.func(idx).map(|f| f.name.as_str()),
        }
    }

    pub fn define(&mut self, idx: FuncIdx, locals: Vec<ValType>, body: Vec<Instr>) -> CompileResult<()> {
        let imports = self.imports.len();
        let func = (idx as usize)
            .checked_sub(imports)
            .and_then(|i| self.funcs.get_mut(i))
            .ok_or_else(|| ice_err!(Span::dummy(), "definition of an unknown function"; "index" => idx))?;
        if func.defined {
            return Err(ice_err!(Span::dummy(), "function defined twice"; "name" => func.name.clone()));
        }
        func.locals = locals;
        func.body = body;
        func.defined = true;
        Ok(())
    }

    pub fn add_global(&mut self, name: &str, init: i32) -> u32 {
        self.globals.push(Global {
            name: name.to_string(),
            init,
        });
        self.globals.len() as u32 - 1
    }

    pub fn export_func(&mut self, name: impl Into<String>, idx: FuncIdx) {
        self.exports.push(Export {
            name: name.into(),
            kind: ExportKind::Func(idx),
        });
    }

    pub fn export_memory(&mut self, name: impl Into<String>) {
        self.exports.push(Export {
            name: name.into(),
            kind: ExportKind::Memory,
        });
    }

    pub fn add_custom(&mut self, name: &str, data: Vec<u8>) {
        self.customs.push(Custom {
            name: name.to_string(),
            data,
        });
    }

    /// Every function referenced by `ref.func`, sorted and deduplicated.
    pub fn referenced_funcs(&self) -> Vec<FuncIdx> {
        let mut refs: Vec<FuncIdx> = self
            .funcs
            .iter()
            .flat_map(|f| &f.body)
            .filter_map(|instr| match instr {
                Instr::RefFunc(idx) => Some(*idx),
                _ => None,
            })
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    /// Check that every declared function received a body.
    pub fn check_complete(&self) -> CompileResult<()> {
        match self.funcs.iter().find(|f| !f.defined) {
            Some(func) => Err(ice_err!(Span::dummy(), "function declared but never defined";
                "name" => func.name.clone())),
            None => Ok(()),
        }
    }
}

/// Accumulates the body of one function, allocating locals and labels.
#[derive(Debug)]
pub struct FuncBuilder {
    param_count: u32,
    locals: Vec<ValType>,
    body: Vec<Instr>,
    next_label: u32,
}

impl FuncBuilder {
    pub fn new(param_count: usize) -> Self {
        Self {
            param_count: param_count as u32,
            locals: Vec::new(),
            body: Vec::new(),
            next_label: 0,
        }
    }

    /// Allocate a local and return its index (after the parameters).
    pub fn local(&mut self, ty: ValType) -> u32 {
        self.locals.push(ty);
        self.param_count + self.locals.len() as u32 - 1
    }

    pub fn label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.body.push(instr);
        self
    }

    pub fn extend(&mut self, instrs: impl IntoIterator<Item = Instr>) -> &mut Self {
        self.body.extend(instrs);
        self
    }

    pub fn finish(mut self) -> (Vec<ValType>, Vec<Instr>) {
        self.body.push(Instr::End);
        (self.locals, self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_types_are_interned() {
        let mut module = Module::new(1);
        let a = module.func_type(vec![ValType::AnyRef], vec![ValType::AnyRef]);
        let b = module.func_type(vec![ValType::AnyRef], vec![ValType::AnyRef]);
        let c = module.func_type(vec![ValType::I32], vec![ValType::AnyRef]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(module.types.len(), 2);
    }

    #[test]
    fn test_function_indices_follow_imports() {
        let mut module = Module::new(1);
        let ty = module.func_type(vec![], vec![ValType::I32]);
        assert_eq!(module.import_func("tern", "f", ty).unwrap(), 0);
        let g = module.declare_func("g", ty);
        assert_eq!(g, 1);
        assert_eq!(module.func_name(0), Some("f"));
        assert_eq!(module.func_name(1), Some("g"));
        assert!(module.import_func("tern", "late", ty).is_err());
        assert!(module.check_complete().is_err());
        module.define(g, vec![], vec![Instr::I32Const(1), Instr::End]).unwrap();
        assert!(module.check_complete().is_ok());
        assert!(module.define(g, vec![], vec![Instr::End]).is_err());
    }

    #[test]
    fn test_builder_locals_follow_params() {
        let mut f = FuncBuilder::new(2);
        assert_eq!(f.local(ValType::I32), 2);
        assert_eq!(f.local(ValType::AnyRef), 3);
        assert_ne!(f.label(), f.label());
        let (locals, body) = f.finish();
        assert_eq!(locals.len(), 2);
        assert_eq!(body, vec![Instr::End]);
    }
}

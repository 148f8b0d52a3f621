//! Binary encoding of a [`Module`] with `wasm-encoder`.
//!
//! Sections are written in the order the binary format requires. Functions
//! referenced by `ref.func` are listed in a declarative element segment,
//! and a name section carries every function name so traps can be mapped
//! back to owners.

use std::borrow::Cow;

use wasm_encoder::{
    AbstractHeapType, BlockType as WasmBlockType, CodeSection, ConstExpr, CustomSection,
    ElementSection, Elements, EntityType, ExportKind as WasmExportKind, ExportSection, FieldType,
    Function, FunctionSection, GlobalSection, GlobalType, HeapType, ImportSection, Instruction,
    MemArg, MemorySection, MemoryType, Module as WasmModule, NameMap, NameSection, RefType,
    StorageType, TypeSection, ValType as WasmValType,
};

use super::{BlockType, ExportKind, Field, Heap, Instr, Label, Module, TypeDef, ValType};
use crate::error::CompileResult;
use crate::ice_err;
use crate::span::Span;

/// Serialize a complete module.
pub fn encode(module: &Module) -> CompileResult<Vec<u8>> {
    module.check_complete()?;
    let mut out = WasmModule::new();

    let mut types = TypeSection::new();
    for def in &module.types {
        match def {
            TypeDef::Func { params, results } => {
                types.ty().function(
                    params.iter().map(|t| val_type(*t)).collect::<Vec<_>>(),
                    results.iter().map(|t| val_type(*t)).collect::<Vec<_>>(),
                );
            }
            TypeDef::Struct(fields) => {
                types
                    .ty()
                    .struct_(fields.iter().map(|f| field_type(*f)).collect::<Vec<_>>());
            }
            TypeDef::Array(elem) => {
                types
                    .ty()
                    .array(&StorageType::Val(val_type(elem.ty)), elem.mutable);
            }
        }
    }
    out.section(&types);

    let mut imports = ImportSection::new();
    for import in &module.imports {
        imports.import(&import.module, &import.name, EntityType::Function(import.ty));
    }
    out.section(&imports);

    let mut functions = FunctionSection::new();
    for func in &module.funcs {
        functions.function(func.ty);
    }
    out.section(&functions);

    let mut memories = MemorySection::new();
    memories.memory(MemoryType {
        minimum: module.memory_pages,
        maximum: None,
        memory64: false,
        shared: false,
        page_size_log2: None,
    });
    out.section(&memories);

    if !module.globals.is_empty() {
        let mut globals = GlobalSection::new();
        for global in &module.globals {
            globals.global(
                GlobalType {
                    val_type: WasmValType::I32,
                    mutable: true,
                    shared: false,
                },
                &ConstExpr::i32_const(global.init),
            );
        }
        out.section(&globals);
    }

    let mut exports = ExportSection::new();
    for export in &module.exports {
        match export.kind {
            ExportKind::Func(idx) => exports.export(&export.name, WasmExportKind::Func, idx),
            ExportKind::Memory => exports.export(&export.name, WasmExportKind::Memory, 0),
        };
    }
    out.section(&exports);

    let referenced = module.referenced_funcs();
    if !referenced.is_empty() {
        let mut elements = ElementSection::new();
        elements.declared(Elements::Functions(Cow::Borrowed(&referenced)));
        out.section(&elements);
    }

    let mut code = CodeSection::new();
    for func in &module.funcs {
        let mut body = Function::new_with_locals_types(func.locals.iter().map(|t| val_type(*t)));
        let mut labels: Vec<Label> = Vec::new();
        for instr in &func.body {
            let encoded = instruction(instr, &mut labels).map_err(|err| {
                ice_err!(Span::dummy(), "cannot encode instruction";
                    "function" => func.name.clone(), "error" => err)
            })?;
            body.instruction(&encoded);
        }
        code.function(&body);
    }
    out.section(&code);

    for custom in &module.customs {
        out.section(&CustomSection {
            name: Cow::Borrowed(&custom.name),
            data: Cow::Borrowed(&custom.data),
        });
    }

    let mut names = NameSection::new();
    let mut func_names = NameMap::new();
    for (idx, import) in module.imports.iter().enumerate() {
        func_names.append(idx as u32, &import.name);
    }
    for (i, func) in module.funcs.iter().enumerate() {
        func_names.append((module.imports.len() + i) as u32, &func.name);
    }
    names.functions(&func_names);
    if !module.type_names.is_empty() {
        let mut type_names = NameMap::new();
        let mut sorted: Vec<_> = module.type_names.iter().collect();
        sorted.sort();
        for (idx, name) in sorted {
            type_names.append(*idx, name);
        }
        names.types(&type_names);
    }
    out.section(&names);

    let bytes = out.finish();
    tracing::debug!(
        bytes = bytes.len(),
        types = module.types.len(),
        funcs = module.funcs.len(),
        "encoded module"
    );
    Ok(bytes)
}

fn val_type(ty: ValType) -> WasmValType {
    match ty {
        ValType::I32 => WasmValType::I32,
        ValType::AnyRef => WasmValType::Ref(RefType::ANYREF),
        ValType::FuncRef => WasmValType::Ref(RefType::FUNCREF),
    }
}

fn field_type(field: Field) -> FieldType {
    FieldType {
        element_type: StorageType::Val(val_type(field.ty)),
        mutable: field.mutable,
    }
}

fn heap_type(heap: Heap) -> HeapType {
    let abstract_ty = |ty| HeapType::Abstract { shared: false, ty };
    match heap {
        Heap::Any => abstract_ty(AbstractHeapType::Any),
        Heap::Eq => abstract_ty(AbstractHeapType::Eq),
        Heap::Func => abstract_ty(AbstractHeapType::Func),
        Heap::Concrete(idx) => HeapType::Concrete(idx),
    }
}

fn block_type(ty: BlockType) -> WasmBlockType {
    match ty {
        BlockType::Empty => WasmBlockType::Empty,
        BlockType::Value(v) => WasmBlockType::Result(val_type(v)),
    }
}

fn mem_arg(offset: u32) -> MemArg {
    MemArg {
        offset: u64::from(offset),
        align: 2,
        memory_index: 0,
    }
}

/// Relative depth of `label` from the innermost open block.
fn depth(labels: &[Label], label: Label) -> Result<u32, String> {
    labels
        .iter()
        .rev()
        .position(|l| *l == label)
        .map(|d| d as u32)
        .ok_or_else(|| format!("branch to label {} outside its block", label.0))
}

fn instruction<'a>(instr: &'a Instr, labels: &mut Vec<Label>) -> Result<Instruction<'a>, String> {
    Ok(match instr {
        Instr::Block(label, ty) => {
            labels.push(*label);
            Instruction::Block(block_type(*ty))
        }
        Instr::Loop(label, ty) => {
            labels.push(*label);
            Instruction::Loop(block_type(*ty))
        }
        Instr::If(label, ty) => {
            labels.push(*label);
            Instruction::If(block_type(*ty))
        }
        Instr::Else => Instruction::Else,
        // The function's own `end` closes no label.
        Instr::End => {
            labels.pop();
            Instruction::End
        }
        Instr::Br(label) => Instruction::Br(depth(labels, *label)?),
        Instr::BrIf(label) => Instruction::BrIf(depth(labels, *label)?),
        Instr::BrTable(targets, default) => {
            let targets = targets
                .iter()
                .map(|l| depth(labels, *l))
                .collect::<Result<Vec<_>, _>>()?;
            Instruction::BrTable(Cow::Owned(targets), depth(labels, *default)?)
        }
        Instr::Return => Instruction::Return,
        Instr::Unreachable => Instruction::Unreachable,
        Instr::Drop => Instruction::Drop,
        Instr::Call(f) => Instruction::Call(*f),
        Instr::CallRef(ty) => Instruction::CallRef(*ty),
        Instr::LocalGet(i) => Instruction::LocalGet(*i),
        Instr::LocalSet(i) => Instruction::LocalSet(*i),
        Instr::LocalTee(i) => Instruction::LocalTee(*i),
        Instr::GlobalGet(i) => Instruction::GlobalGet(*i),
        Instr::GlobalSet(i) => Instruction::GlobalSet(*i),
        Instr::I32Const(n) => Instruction::I32Const(*n),
        Instr::I32Add => Instruction::I32Add,
        Instr::I32Sub => Instruction::I32Sub,
        Instr::I32Mul => Instruction::I32Mul,
        Instr::I32DivS => Instruction::I32DivS,
        Instr::I32RemS => Instruction::I32RemS,
        Instr::I32Eq => Instruction::I32Eq,
        Instr::I32Ne => Instruction::I32Ne,
        Instr::I32LtS => Instruction::I32LtS,
        Instr::I32LeS => Instruction::I32LeS,
        Instr::I32GtS => Instruction::I32GtS,
        Instr::I32GeS => Instruction::I32GeS,
        Instr::I32Eqz => Instruction::I32Eqz,
        Instr::I32And => Instruction::I32And,
        Instr::I32Or => Instruction::I32Or,
        Instr::I32Load(offset) => Instruction::I32Load(mem_arg(*offset)),
        Instr::I32Store(offset) => Instruction::I32Store(mem_arg(*offset)),
        Instr::RefNull(heap) => Instruction::RefNull(heap_type(*heap)),
        Instr::RefIsNull => Instruction::RefIsNull,
        Instr::RefFunc(f) => Instruction::RefFunc(*f),
        Instr::RefEq => Instruction::RefEq,
        Instr::RefCast(heap) => Instruction::RefCastNullable(heap_type(*heap)),
        Instr::RefTest(heap) => Instruction::RefTestNonNull(heap_type(*heap)),
        Instr::StructNew(ty) => Instruction::StructNew(*ty),
        Instr::StructGet(ty, field) => Instruction::StructGet {
            struct_type_index: *ty,
            field_index: *field,
        },
        Instr::StructSet(ty, field) => Instruction::StructSet {
            struct_type_index: *ty,
            field_index: *field,
        },
        Instr::ArrayNewFixed(ty, len) => Instruction::ArrayNewFixed {
            array_type_index: *ty,
            array_size: *len,
        },
        Instr::ArrayGet(ty) => Instruction::ArrayGet(*ty),
        Instr::ArrayLen => Instruction::ArrayLen,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{FuncBuilder, ValType};

    #[test]
    fn test_labels_resolve_to_depths() {
        let mut labels = Vec::new();
        let outer = Label(0);
        let inner = Label(1);
        instruction(&Instr::Loop(outer, BlockType::Empty), &mut labels).unwrap();
        instruction(&Instr::Block(inner, BlockType::Empty), &mut labels).unwrap();
        assert_eq!(depth(&labels, inner), Ok(0));
        assert_eq!(depth(&labels, outer), Ok(1));
        instruction(&Instr::End, &mut labels).unwrap();
        assert!(depth(&labels, inner).is_err());
    }

    #[test]
    fn test_encoded_module_validates() {
        let mut module = Module::new(1);
        let int = module.named_type("Int", TypeDef::Struct(vec![Field::imm(ValType::I32)]));
        let ty = module.func_type(vec![ValType::I32], vec![ValType::AnyRef]);
        let f = module.declare_func("box", ty);
        let mut body = FuncBuilder::new(1);
        body.emit(Instr::LocalGet(0)).emit(Instr::StructNew(int));
        let (locals, instrs) = body.finish();
        module.define(f, locals, instrs).unwrap();
        module.export_func("box", f);
        module.export_memory("memory");

        let bytes = encode(&module).unwrap();
        let mut validator =
            wasmparser::Validator::new_with_features(wasmparser::WasmFeatures::all());
        validator.validate_all(&bytes).unwrap();
    }
}

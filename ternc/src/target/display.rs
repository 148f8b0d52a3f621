//! Stable text listing of a target module.
//!
//! The listing is not WAT; it is a compact, line-oriented rendering meant
//! for debugging and snapshot tests. Indices are printed with their names
//! where one is known, and labels keep their symbolic numbers.

use std::fmt::{self, Write};

use super::{BlockType, ExportKind, Field, Heap, Instr, Module, TypeDef, ValType};

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::AnyRef => write!(f, "anyref"),
            ValType::FuncRef => write!(f, "funcref"),
        }
    }
}

impl Module {
    fn type_label(&self, idx: u32) -> String {
        match self.type_names.get(&idx) {
            Some(name) => format!("${name}"),
            None => format!("{idx}"),
        }
    }

    fn heap_label(&self, heap: Heap) -> String {
        match heap {
            Heap::Any => "any".into(),
            Heap::Eq => "eq".into(),
            Heap::Func => "func".into(),
            Heap::Concrete(idx) => self.type_label(idx),
        }
    }

    fn func_label(&self, idx: u32) -> String {
        match self.func_name(idx) {
            Some(name) => format!("${name}"),
            None => format!("{idx}"),
        }
    }

    fn render_instr(&self, instr: &Instr) -> String {
        let block = |ty: &BlockType| match ty {
            BlockType::Empty => String::new(),
            BlockType::Value(v) => format!(" (result {v})"),
        };
        match instr {
            Instr::Block(l, ty) => format!("block @{}{}", l.0, block(ty)),
            Instr::Loop(l, ty) => format!("loop @{}{}", l.0, block(ty)),
            Instr::If(l, ty) => format!("if @{}{}", l.0, block(ty)),
            Instr::Else => "else".into(),
            Instr::End => "end".into(),
            Instr::Br(l) => format!("br @{}", l.0),
            Instr::BrIf(l) => format!("br_if @{}", l.0),
            Instr::BrTable(targets, default) => {
                let mut s = String::from("br_table");
                for t in targets {
                    let _ = write!(s, " @{}", t.0);
                }
                let _ = write!(s, " default @{}", default.0);
                s
            }
            Instr::Call(f) => format!("call {}", self.func_label(*f)),
            Instr::CallRef(t) => format!("call_ref {}", self.type_label(*t)),
            Instr::RefFunc(f) => format!("ref.func {}", self.func_label(*f)),
            Instr::RefNull(h) => format!("ref.null {}", self.heap_label(*h)),
            Instr::RefCast(h) => format!("ref.cast null {}", self.heap_label(*h)),
            Instr::RefTest(h) => format!("ref.test {}", self.heap_label(*h)),
            Instr::StructNew(t) => format!("struct.new {}", self.type_label(*t)),
            Instr::StructGet(t, i) => format!("struct.get {} {i}", self.type_label(*t)),
            Instr::StructSet(t, i) => format!("struct.set {} {i}", self.type_label(*t)),
            Instr::ArrayNewFixed(t, n) => format!("array.new_fixed {} {n}", self.type_label(*t)),
            Instr::ArrayGet(t) => format!("array.get {}", self.type_label(*t)),
            Instr::LocalGet(i) => format!("local.get {i}"),
            Instr::LocalSet(i) => format!("local.set {i}"),
            Instr::LocalTee(i) => format!("local.tee {i}"),
            Instr::GlobalGet(i) => format!("global.get {i}"),
            Instr::GlobalSet(i) => format!("global.set {i}"),
            Instr::I32Const(n) => format!("i32.const {n}"),
            Instr::I32Load(o) => format!("i32.load offset={o}"),
            Instr::I32Store(o) => format!("i32.store offset={o}"),
            other => simple_name(other).to_string(),
        }
    }

    /// Render the whole module.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let field = |f: &Field| {
            if f.mutable {
                format!("(mut {})", f.ty)
            } else {
                f.ty.to_string()
            }
        };
        let list = |items: &[ValType]| {
            items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        };

        let _ = writeln!(out, "(module");
        for (idx, def) in self.types.iter().enumerate() {
            let label = self.type_label(idx as u32);
            let _ = match def {
                TypeDef::Func { params, results } => writeln!(
                    out,
                    "  (type {label} (func (param {}) (result {})))",
                    list(params),
                    list(results)
                ),
                TypeDef::Struct(fields) => writeln!(
                    out,
                    "  (type {label} (struct {}))",
                    fields.iter().map(field).collect::<Vec<_>>().join(" ")
                ),
                TypeDef::Array(elem) => {
                    writeln!(out, "  (type {label} (array {}))", field(elem))
                }
            };
        }
        for import in &self.imports {
            let _ = writeln!(
                out,
                "  (import \"{}\" \"{}\" (func (type {})))",
                import.module,
                import.name,
                self.type_label(import.ty)
            );
        }
        let _ = writeln!(out, "  (memory {})", self.memory_pages);
        for (idx, global) in self.globals.iter().enumerate() {
            let _ = writeln!(out, "  (global {idx} ${} (mut i32) {})", global.name, global.init);
        }
        for export in &self.exports {
            let _ = match export.kind {
                ExportKind::Func(idx) => {
                    writeln!(out, "  (export \"{}\" (func {}))", export.name, self.func_label(idx))
                }
                ExportKind::Memory => writeln!(out, "  (export \"{}\" (memory 0))", export.name),
            };
        }
        for (i, func) in self.funcs.iter().enumerate() {
            let idx = (self.imports.len() + i) as u32;
            let _ = writeln!(
                out,
                "  (func {} (type {}) (locals {})",
                self.func_label(idx),
                self.type_label(func.ty),
                list(&func.locals)
            );
            let mut depth = 2usize;
            for instr in &func.body {
                if matches!(instr, Instr::End | Instr::Else) {
                    depth = depth.saturating_sub(1);
                }
                let _ = writeln!(out, "{}{}", "  ".repeat(depth), self.render_instr(instr));
                if matches!(
                    instr,
                    Instr::Block(..) | Instr::Loop(..) | Instr::If(..) | Instr::Else
                ) {
                    depth += 1;
                }
            }
            let _ = writeln!(out, "  )");
        }
        for custom in &self.customs {
            let _ = writeln!(out, "  (@custom \"{}\" {} bytes)", custom.name, custom.data.len());
        }
        out.push(')');
        out.push('\n');
        out
    }
}

fn simple_name(instr: &Instr) -> &'static str {
    match instr {
        Instr::Return => "return",
        Instr::Unreachable => "unreachable",
        Instr::Drop => "drop",
        Instr::I32Add => "i32.add",
        Instr::I32Sub => "i32.sub",
        Instr::I32Mul => "i32.mul",
        Instr::I32DivS => "i32.div_s",
        Instr::I32RemS => "i32.rem_s",
        Instr::I32Eq => "i32.eq",
        Instr::I32Ne => "i32.ne",
        Instr::I32LtS => "i32.lt_s",
        Instr::I32LeS => "i32.le_s",
        Instr::I32GtS => "i32.gt_s",
        Instr::I32GeS => "i32.ge_s",
        Instr::I32Eqz => "i32.eqz",
        Instr::I32And => "i32.and",
        Instr::I32Or => "i32.or",
        Instr::RefIsNull => "ref.is_null",
        Instr::RefEq => "ref.eq",
        Instr::ArrayLen => "array.len",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{FuncBuilder, Label};

    #[test]
    fn test_render_names_and_nesting() {
        let mut module = Module::new(1);
        let int = module.named_type("Int", TypeDef::Struct(vec![Field::imm(ValType::I32)]));
        let ty = module.func_type(vec![], vec![ValType::AnyRef]);
        let f = module.declare_func("one", ty);
        let mut body = FuncBuilder::new(0);
        let l = body.label();
        body.emit(Instr::Block(l, BlockType::Empty))
            .emit(Instr::Br(Label(0)))
            .emit(Instr::End)
            .emit(Instr::I32Const(1))
            .emit(Instr::StructNew(int));
        let (locals, instrs) = body.finish();
        module.define(f, locals, instrs).unwrap();
        module.add_global("len", 0);
        module.export_func("one", f);
        module.add_custom("tern.effects", vec![0; 12]);

        insta::assert_snapshot!(module.render_text(), @r###"
        (module
          (type $Int (struct i32))
          (type 1 (func (param ) (result anyref)))
          (memory 1)
          (global 0 $len (mut i32) 0)
          (export "one" (func $one))
          (func $one (type 1) (locals )
            block @0
              br @0
            end
            i32.const 1
            struct.new $Int
          end
          )
          (@custom "tern.effects" 12 bytes)
        )
        "###);
    }
}

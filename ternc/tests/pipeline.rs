//! End-to-end tests for the Tern compiler pipeline.
//!
//! Programs are built with the HIR builder, compiled, and then checked at
//! the artifact level: the module must validate, the embedded effect table
//! must decode to the table the compiler reports, and the exports must
//! match what the host expects.

use proptest::prelude::*;
use tern_abi::layout::names;
use tern_abi::{EffectTable, ResumeKind, TableVersion};
use ternc::hir::build::{ModuleBuilder, ProgramBuilder};
use ternc::hir::{OpDecl, Program, Stmt};
use ternc::mir::TrapKind;
use ternc::{CompiledArtifact, Compiler, CompilerConfig};

fn compile(program: &Program) -> CompiledArtifact {
    match Compiler::default().compile(program) {
        Ok(artifact) => artifact,
        Err(err) => panic!("compilation failed: {}", err.message),
    }
}

fn validate(bytes: &[u8]) {
    let mut validator = wasmparser::Validator::new_with_features(wasmparser::WasmFeatures::all());
    if let Err(err) = validator.validate_all(bytes) {
        panic!("generated module does not validate: {err}");
    }
}

fn effect_section(bytes: &[u8]) -> Vec<u8> {
    for payload in wasmparser::Parser::new(0).parse_all(bytes) {
        if let wasmparser::Payload::CustomSection(reader) = payload.unwrap() {
            if reader.name() == names::EFFECT_SECTION {
                return reader.data().to_vec();
            }
        }
    }
    panic!("no `{}` section in the module", names::EFFECT_SECTION);
}

fn export_names(bytes: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    for payload in wasmparser::Parser::new(0).parse_all(bytes) {
        if let wasmparser::Payload::ExportSection(reader) = payload.unwrap() {
            for export in reader {
                out.push(export.unwrap().name.to_string());
            }
        }
    }
    out
}

/// `main` performs `Async.await(3)` with no handler installed and adds one
/// to the answer.
fn unhandled_await() -> Program {
    let mut b = ProgramBuilder::new();
    let mut m = b.module("app", "io");
    let int = m.types().int();
    let async_ = m.effect(
        "Async",
        vec![OpDecl::simple("await", vec![int], int, ResumeKind::Resume)],
    );
    let three = m.int(3);
    let answer = m.perform(async_, 0, vec![three]);
    let one = m.int(1);
    let body = m.add(answer, one);
    m.export_function("main", vec![], int, vec![async_], body);
    m.finish();
    b.finish()
}

/// `main` handles `State.get` in place with `tail 7`.
fn handled_tail() -> Program {
    let mut b = ProgramBuilder::new();
    let mut m = b.module("app", "main");
    let int = m.types().int();
    let state = m.effect(
        "State",
        vec![OpDecl::simple("get", vec![], int, ResumeKind::Tail)],
    );
    let k = m.symbol("k");
    let seven = m.int(7);
    let clause_body = m.tail(k, Some(seven));
    let get = m.perform(state, 0, vec![]);
    let handle = m.handle(
        get,
        vec![ModuleBuilder::clause(state, 0, vec![], Some(k), clause_body)],
        None,
    );
    m.export_function("main", vec![], int, vec![], handle);
    m.finish();
    b.finish()
}

// ============================================================
// Artifact structure
// ============================================================

#[test]
fn test_unhandled_perform_builds_valid_module() {
    let artifact = compile(&unhandled_await());
    validate(&artifact.bytes);

    assert_eq!(artifact.exports.len(), 1);
    assert_eq!(artifact.exports[0].name, "main");
    assert!(artifact.exports[0].effectful);

    let exported = export_names(&artifact.bytes);
    for name in [
        "main",
        names::OUTCOME_STATUS,
        names::OUTCOME_CONTINUATION,
        names::RESUME,
        names::EXCHANGE_LEN,
        names::MEMORY,
    ] {
        assert!(exported.iter().any(|e| e == name), "missing export {name}");
    }
}

#[test]
fn test_effect_section_decodes_to_reported_table() {
    let artifact = compile(&unhandled_await());
    let decoded = EffectTable::decode(&effect_section(&artifact.bytes)).unwrap();
    assert_eq!(decoded, artifact.table);

    assert_eq!(decoded.op_count(), 1);
    let indices = decoded.resolve_suffix("Async.await");
    assert_eq!(indices, vec![0]);
    let (effect, op) = decoded.op(0).unwrap();
    assert_eq!(effect.label, "app/io/Async");
    assert_eq!(op.resume_kind, ResumeKind::Resume);
}

#[test]
fn test_version_one_table_is_embedded_when_configured() {
    let config = CompilerConfig::builder()
        .table_version(TableVersion::V1)
        .build()
        .unwrap();
    let artifact = Compiler::new(config).compile(&unhandled_await()).unwrap();
    validate(&artifact.bytes);
    let section = effect_section(&artifact.bytes);
    assert_eq!(&section[0..4], &TableVersion::V1.as_u32().to_le_bytes());
    let decoded = EffectTable::decode(&section).unwrap();
    assert_eq!(decoded.op_count(), 1);
    assert_eq!(decoded.resolve_suffix("Async.await"), vec![0]);
}

#[test]
fn test_handled_tail_stays_inside_artifact() {
    let artifact = compile(&handled_tail());
    validate(&artifact.bytes);

    // The exported function is pure to its callers; the handler is local.
    assert!(!artifact.exports[0].effectful);
    assert_eq!(artifact.table.resolve_suffix("State.get"), vec![0]);
    assert_eq!(artifact.traps.of_kind(TrapKind::TailGuard).count(), 1);

    let text = artifact.render_text();
    assert!(text.contains("$app/main::main$handle"));
    assert!(text.contains("$clause0"));
    assert!(text.contains("call $rt_dispatch"));
}

#[test]
fn test_compilation_is_deterministic() {
    let first = compile(&handled_tail());
    let second = compile(&handled_tail());
    assert_eq!(first.bytes, second.bytes);
    assert_eq!(first.render_text(), second.render_text());
}

#[test]
fn test_effectful_call_chain_validates() {
    let mut b = ProgramBuilder::new();
    let mut m = b.module("app", "main");
    let int = m.types().int();
    let ask = m.effect(
        "Ask",
        vec![OpDecl::simple("ask", vec![], int, ResumeKind::Resume)],
    );
    let x = m.symbol("x");

    let asked = m.perform(ask, 0, vec![]);
    let inner = m.function("inner", vec![], int, vec![ask], asked);

    let first = m.call_effectful(inner, vec![]);
    let x_ref = m.local(x);
    let second = m.call_effectful(inner, vec![]);
    let sum = m.add(x_ref, second);
    let body = m.block(vec![ModuleBuilder::let_(x, first)], Some(sum));
    m.export_function("outer", vec![], int, vec![ask], body);
    m.finish();

    let artifact = compile(&b.finish());
    validate(&artifact.bytes);
    let text = artifact.render_text();
    assert!(text.contains("$app/main::outer$k"));
    assert!(text.contains("$app/main::inner$k"));
}

#[test]
fn test_resume_clause_with_parameters_validates() {
    let mut b = ProgramBuilder::new();
    let mut m = b.module("app", "main");
    let int = m.types().int();
    let log = m.effect(
        "Log",
        vec![OpDecl::simple("log", vec![int], int, ResumeKind::Resume)],
    );
    let v = m.symbol("v");
    let k = m.symbol("k");
    let n = m.symbol("n");

    let v_ref = m.local(v);
    let ten = m.int(10);
    let scaled = m.add(v_ref, ten);
    let clause_body = m.resume(k, Some(scaled));

    let n_ref = m.local(n);
    let logged = m.perform(log, 0, vec![n_ref]);
    let handle = m.handle(
        logged,
        vec![ModuleBuilder::clause(log, 0, vec![v], Some(k), clause_body)],
        None,
    );
    m.export_function("run", vec![(n, int)], int, vec![], handle);
    m.finish();

    let artifact = compile(&b.finish());
    validate(&artifact.bytes);
    assert_eq!(artifact.exports[0].arity, 1);
    assert!(artifact.render_text().contains("call $rt_resume"));
}

#[test]
fn test_clause_error_aborts_build() {
    let mut b = ProgramBuilder::new();
    let mut m = b.module("app", "main");
    let int = m.types().int();
    let ask = m.effect(
        "Ask",
        vec![OpDecl::simple("ask", vec![], int, ResumeKind::Resume)],
    );
    let k = m.symbol("k");
    let one = m.int(1);
    let first = m.resume(k, Some(one));
    let two = m.int(2);
    let second = m.resume(k, Some(two));
    let clause_body = m.block(vec![Stmt::Expr(first)], Some(second));
    let asked = m.perform(ask, 0, vec![]);
    let handle = m.handle(
        asked,
        vec![ModuleBuilder::clause(ask, 0, vec![], Some(k), clause_body)],
        None,
    );
    m.export_function("main", vec![], int, vec![], handle);
    m.finish();

    let err = Compiler::default().compile(&b.finish()).unwrap_err();
    assert_eq!(err.code, Some(ternc::ErrorCode::MultipleResumes));
}

// ============================================================
// Op numbering
// ============================================================

const EFFECT_NAMES: [&str; 4] = ["Async", "Log", "State", "Random"];

/// One module per effect, each with a function performing its op, built in
/// the given order.
fn program_in_order(order: &[usize]) -> Program {
    let mut b = ProgramBuilder::new();
    for &i in order {
        let name = EFFECT_NAMES[i];
        let mut m = b.module("app", &name.to_lowercase());
        let int = m.types().int();
        let effect = m.effect(
            name,
            vec![
                OpDecl::simple("first", vec![], int, ResumeKind::Resume),
                OpDecl::simple("second", vec![int], int, ResumeKind::Tail),
            ],
        );
        let performed = m.perform(effect, 0, vec![]);
        m.function("use", vec![], int, vec![effect], performed);
        m.finish();
    }
    b.finish()
}

proptest! {
    #[test]
    fn test_op_indices_ignore_module_order(
        order in Just(vec![0usize, 1, 2, 3]).prop_shuffle()
    ) {
        let baseline = compile(&program_in_order(&[0, 1, 2, 3]));
        let shuffled = compile(&program_in_order(&order));
        prop_assert_eq!(&baseline.table, &shuffled.table);
        prop_assert_eq!(baseline.table.op_count(), 8);
        for name in EFFECT_NAMES {
            let suffix = format!("{name}.second");
            prop_assert_eq!(
                baseline.table.resolve_suffix(&suffix),
                shuffled.table.resolve_suffix(&suffix)
            );
        }
    }
}

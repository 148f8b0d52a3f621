//! Runs compiled artifacts in wasmtime.
//!
//! The three `tern` imports are served by the host crate's [`Exchange`]
//! over the instance's own memory, so a [`WasmArtifact`] can be driven by
//! [`tern_host::HostRuntime`] exactly like a production embedding.

#![allow(dead_code)]

use tern_abi::layout::names;
use tern_abi::wire::MALFORMED;
use tern_host::{Artifact, ArtifactError, Exchange};
use ternc::codegen::{TrapMap, TrapSite};
use ternc::{CompiledArtifact, CompilerConfig};
use wasmtime::{
    AnyRef, Caller, Config, Engine, Extern, Instance, Linker, Memory, Module, OwnedRooted, Store,
    Trap, Val, WasmBacktrace,
};

type Ref = OwnedRooted<AnyRef>;

/// Where the last call into the instance trapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapReport {
    pub trap: Option<Trap>,
    /// Innermost wasm function on the trapping stack.
    pub function: String,
}

pub struct WasmArtifact {
    store: Store<Exchange>,
    instance: Instance,
    memory: Memory,
    bytes: Vec<u8>,
    traps: TrapMap,
    pub last_trap: Option<TrapReport>,
}

fn engine() -> Engine {
    let mut config = Config::new();
    config.wasm_gc(true).wasm_function_references(true);
    Engine::new(&config).expect("engine with wasm-gc enabled")
}

fn memory_of(caller: &mut Caller<'_, Exchange>) -> Option<Memory> {
    caller.get_export(names::MEMORY).and_then(Extern::into_memory)
}

fn linker(engine: &Engine) -> Linker<Exchange> {
    let mut linker = Linker::new(engine);
    linker
        .func_wrap(
            names::IMPORT_MODULE,
            names::WRITE_SCALAR,
            |mut caller: Caller<'_, Exchange>, tag: i32, payload: i32| -> i32 {
                let Some(memory) = memory_of(&mut caller) else {
                    return MALFORMED;
                };
                let (data, exchange) = memory.data_and_store_mut(&mut caller);
                exchange.write_scalar(data, tag as u32, payload)
            },
        )
        .expect("link write_scalar");
    linker
        .func_wrap(
            names::IMPORT_MODULE,
            names::WRITE_EFFECT_REQUEST,
            |mut caller: Caller<'_, Exchange>,
             hi: i32,
             lo: i32,
             op_id: i32,
             op_index: i32,
             resume_kind: i32,
             handle: i32,
             argc: i32,
             args_ptr: i32|
             -> i32 {
                let Some(memory) = memory_of(&mut caller) else {
                    return MALFORMED;
                };
                let (data, exchange) = memory.data_and_store_mut(&mut caller);
                exchange.write_effect_request(
                    data,
                    hi as u32,
                    lo as u32,
                    op_id as u32,
                    op_index as u32,
                    resume_kind as u32,
                    handle as u32,
                    argc,
                    args_ptr as u32,
                )
            },
        )
        .expect("link write_effect_request");
    linker
        .func_wrap(
            names::IMPORT_MODULE,
            names::READ_SCALAR,
            |mut caller: Caller<'_, Exchange>, ptr: i32, len: i32| -> i32 {
                let Some(memory) = memory_of(&mut caller) else {
                    return MALFORMED;
                };
                let (data, exchange) = memory.data_and_store_mut(&mut caller);
                exchange.read_scalar(data, ptr as u32, len as u32)
            },
        )
        .expect("link read_scalar");
    linker
}

impl WasmArtifact {
    /// Instantiate `compiled`, built with `config`.
    pub fn new(compiled: &CompiledArtifact, config: &CompilerConfig) -> Self {
        let engine = engine();
        let module = Module::new(&engine, &compiled.bytes).expect("artifact compiles in wasmtime");
        let mut store = Store::new(&engine, Exchange::new(config.exchange_capacity as usize));
        let instance = linker(&engine)
            .instantiate(&mut store, &module)
            .expect("artifact instantiates");
        let memory = instance
            .get_memory(&mut store, names::MEMORY)
            .expect("artifact exports its memory");
        Self {
            store,
            instance,
            memory,
            bytes: compiled.bytes.clone(),
            traps: compiled.traps.clone(),
            last_trap: None,
        }
    }

    /// Trap sites registered for the function the last trap happened in.
    pub fn trap_sites(&self) -> Vec<TrapSite> {
        match &self.last_trap {
            Some(report) => self.traps.for_function(&report.function).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn trapped(&mut self, err: wasmtime::Error) -> ArtifactError {
        let function = err
            .downcast_ref::<WasmBacktrace>()
            .and_then(|trace| trace.frames().first())
            .and_then(|frame| frame.func_name())
            .unwrap_or("<unknown>")
            .to_string();
        let trap = err.downcast_ref::<Trap>().copied();
        let message = format!("{err} in `{function}`");
        self.last_trap = Some(TrapReport { trap, function });
        ArtifactError::Trap(message)
    }
}

impl Artifact for WasmArtifact {
    type Outcome = Ref;
    type Continuation = Ref;

    fn effect_table_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        for payload in wasmparser::Parser::new(0).parse_all(&self.bytes) {
            if let Ok(wasmparser::Payload::CustomSection(reader)) = payload {
                if reader.name() == names::EFFECT_SECTION {
                    return Ok(reader.data().to_vec());
                }
            }
        }
        Err(ArtifactError::MissingEffectTable)
    }

    fn call_entry(&mut self, name: &str, args: &[i32]) -> Result<Ref, ArtifactError> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| ArtifactError::MissingExport(name.to_string()))?;
        let params: Vec<Val> = args.iter().map(|&a| Val::I32(a)).collect();
        let mut results = [Val::AnyRef(None)];
        if let Err(err) = func.call(&mut self.store, &params, &mut results) {
            return Err(self.trapped(err));
        }
        let outcome = match results[0] {
            Val::AnyRef(Some(rooted)) => rooted
                .to_owned_rooted(&mut self.store)
                .map_err(|err| ArtifactError::Trap(err.to_string()))?,
            _ => return Err(ArtifactError::Trap(format!("`{name}` returned no outcome"))),
        };
        Ok(outcome)
    }

    fn outcome_status(&mut self, outcome: &Ref) -> Result<i32, ArtifactError> {
        let status = self
            .instance
            .get_typed_func::<Option<Ref>, i32>(&mut self.store, names::OUTCOME_STATUS)
            .map_err(|_| ArtifactError::MissingExport(names::OUTCOME_STATUS.into()))?;
        match status.call(&mut self.store, Some(outcome.clone())) {
            Ok(status) => Ok(status),
            Err(err) => Err(self.trapped(err)),
        }
    }

    fn outcome_continuation(&mut self, outcome: &Ref) -> Result<Option<Ref>, ArtifactError> {
        let continuation = self
            .instance
            .get_typed_func::<Option<Ref>, Option<Ref>>(&mut self.store, names::OUTCOME_CONTINUATION)
            .map_err(|_| ArtifactError::MissingExport(names::OUTCOME_CONTINUATION.into()))?;
        match continuation.call(&mut self.store, Some(outcome.clone())) {
            Ok(cont) => Ok(cont),
            Err(err) => Err(self.trapped(err)),
        }
    }

    fn resume(&mut self, cont: Ref, ptr: u32, len: u32) -> Result<Ref, ArtifactError> {
        let resume = self
            .instance
            .get_typed_func::<(Option<Ref>, i32, i32), Option<Ref>>(&mut self.store, names::RESUME)
            .map_err(|_| ArtifactError::MissingExport(names::RESUME.into()))?;
        match resume.call(&mut self.store, (Some(cont), ptr as i32, len as i32)) {
            Ok(outcome) => outcome
                .ok_or_else(|| ArtifactError::Trap(format!("`{}` returned no outcome", names::RESUME))),
            Err(err) => Err(self.trapped(err)),
        }
    }

    fn exchange_len(&mut self) -> Result<i32, ArtifactError> {
        let len = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, names::EXCHANGE_LEN)
            .map_err(|_| ArtifactError::MissingExport(names::EXCHANGE_LEN.into()))?;
        match len.call(&mut self.store, ()) {
            Ok(len) => Ok(len),
            Err(err) => Err(self.trapped(err)),
        }
    }

    fn memory(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }
}

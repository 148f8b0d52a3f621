//! An in-process artifact that follows a fixed script of effect requests.
//!
//! It behaves like a compiled artifact at the boundary: outcomes are encoded
//! through [`Exchange`]'s import implementations into its own linear memory,
//! continuations are one-shot, and a bad resume record traps.

#![allow(dead_code)]

use tern_abi::wire::tag;
use tern_abi::{EffectEntry, EffectId, EffectTable, OpEntry, ResumeKind, Scalar, TableVersion};
use tern_host::{Artifact, ArtifactError, Exchange};

/// Op indices of [`sample_table`].
pub const AWAIT: u32 = 0;
pub const SLEEP: u32 = 1;
pub const GET: u32 = 2;

pub fn sample_table() -> EffectTable {
    let op = |op_id: u32, label: &str, resume_kind| OpEntry {
        op_index: 0,
        op_id,
        resume_kind,
        signature_hash: 0x1234,
        label: label.to_string(),
    };
    EffectTable::new(vec![
        EffectEntry {
            id: EffectId::from_identifier("app/io/Async"),
            label: "app/io/Async".into(),
            ops: vec![op(0, "await", ResumeKind::Resume), op(1, "sleep", ResumeKind::Resume)],
        },
        EffectEntry {
            id: EffectId::from_identifier("app/main/State"),
            label: "app/main/State".into(),
            ops: vec![op(0, "get", ResumeKind::Tail)],
        },
    ])
}

type ArgsFn = Box<dyn Fn(&[Scalar]) -> Vec<i32> + Send>;
type FinishFn = Box<dyn Fn(&[Scalar]) -> Scalar + Send>;

struct Step {
    op_index: u32,
    args: ArgsFn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Value(Scalar),
    Effect { step: usize },
}

pub struct ScriptedArtifact {
    entry: String,
    table: EffectTable,
    steps: Vec<Step>,
    finish: FinishFn,
    exchange: Exchange,
    memory: Vec<u8>,
    last_len: i32,
    consumed: Vec<bool>,
    /// Values received through `tern_resume`, in order.
    pub resumed: Vec<Scalar>,
    pub resume_calls: usize,
}

impl ScriptedArtifact {
    /// An artifact exporting `entry` whose run ends with `finish(resumed)`.
    pub fn new(entry: &str, capacity: usize, finish: impl Fn(&[Scalar]) -> Scalar + Send + 'static) -> Self {
        Self {
            entry: entry.to_string(),
            table: sample_table(),
            steps: Vec::new(),
            finish: Box::new(finish),
            exchange: Exchange::new(capacity),
            memory: vec![0; capacity + 256],
            last_len: 0,
            consumed: Vec::new(),
            resumed: Vec::new(),
            resume_calls: 0,
        }
    }

    /// Perform `op_index` with arguments computed from the values resumed so far.
    pub fn perform(mut self, op_index: u32, args: impl Fn(&[Scalar]) -> Vec<i32> + Send + 'static) -> Self {
        self.steps.push(Step {
            op_index,
            args: Box::new(args),
        });
        self.consumed.push(false);
        self
    }

    fn advance(&self, step: usize) -> Outcome {
        if step < self.steps.len() {
            Outcome::Effect { step }
        } else {
            Outcome::Value((self.finish)(&self.resumed))
        }
    }
}

impl Artifact for ScriptedArtifact {
    type Outcome = Outcome;
    type Continuation = usize;

    fn effect_table_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(self.table.encode(TableVersion::V2))
    }

    fn call_entry(&mut self, name: &str, _args: &[i32]) -> Result<Outcome, ArtifactError> {
        if name != self.entry {
            return Err(ArtifactError::MissingExport(name.to_string()));
        }
        Ok(self.advance(0))
    }

    fn outcome_status(&mut self, outcome: &Outcome) -> Result<i32, ArtifactError> {
        let capacity = self.exchange.capacity();
        let (status, written) = match *outcome {
            Outcome::Value(value) => {
                let len = self
                    .exchange
                    .write_scalar(&mut self.memory, value.tag(), value.payload());
                (0, len)
            }
            Outcome::Effect { step } => {
                let step = &self.steps[step];
                let args = (step.args)(&self.resumed);
                for (i, a) in args.iter().enumerate() {
                    let at = capacity + 4 * i;
                    self.memory[at..at + 4].copy_from_slice(&a.to_le_bytes());
                }
                let (id, op_id, kind) = match self.table.op(step.op_index) {
                    Some((effect, op)) => (effect.id, op.op_id, op.resume_kind),
                    None => (EffectId::from_raw(0), 0, ResumeKind::Resume),
                };
                let len = self.exchange.write_effect_request(
                    &mut self.memory,
                    id.hi(),
                    id.lo(),
                    op_id,
                    step.op_index,
                    kind.as_u32(),
                    0,
                    args.len() as i32,
                    capacity as u32,
                );
                (1, len)
            }
        };
        self.last_len = written;
        Ok(if written < 0 { written } else { status })
    }

    fn outcome_continuation(&mut self, outcome: &Outcome) -> Result<Option<usize>, ArtifactError> {
        Ok(match *outcome {
            Outcome::Effect { step } => Some(step),
            Outcome::Value(_) => None,
        })
    }

    fn resume(&mut self, cont: usize, ptr: u32, len: u32) -> Result<Outcome, ArtifactError> {
        self.resume_calls += 1;
        if std::mem::replace(&mut self.consumed[cont], true) {
            return Err(ArtifactError::Trap(format!("continuation {cont} resumed twice")));
        }
        if self.exchange.read_scalar(&self.memory, ptr, len) < 0 {
            return Err(ArtifactError::Trap("bad resume record".into()));
        }
        let at = ptr as usize;
        let word = |i: usize| {
            let b = &self.memory[at + 4 * i..at + 4 * i + 4];
            u32::from_le_bytes([b[0], b[1], b[2], b[3]])
        };
        let value = match word(0) {
            tag::UNIT => Scalar::Unit,
            tag::BOOL => Scalar::Bool(word(1) != 0),
            tag::INT => Scalar::Int(word(1) as i32),
            _ => return Err(ArtifactError::Trap("unrepresentable resume value".into())),
        };
        self.resumed.push(value);
        Ok(self.advance(cont + 1))
    }

    fn exchange_len(&mut self) -> Result<i32, ArtifactError> {
        Ok(self.last_len)
    }

    fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.memory
    }
}

/// Install a test subscriber at the default host log level.
pub fn init_tracing() {
    let level = tern_host::HostConfig::default().log_level.to_level_filter();
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_test_writer()
        .try_init();
}

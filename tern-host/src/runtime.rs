//! # Dispatch Loop
//!
//! One [`HostRuntime::run`] drives one logical invocation of an artifact:
//!
//! ```text
//! call entry ──► outcome ──► status ──► 0: Completed(value)
//!                   ▲           │
//!                   │           └─► 1: decode request, check it against the table
//!                   │                   find handler ──► await action
//!                   │                   check action kind
//!                   │                   end ──► Ended(value)
//!                   │                   cancelled? ──► Aborted
//!                   └── resume(k) ◄──── write resume value
//! ```
//!
//! Runs are strictly sequential: one request is outstanding at a time, and
//! the artifact is not called again until its handler has settled. Every
//! error abandons the run; the artifact is never called again for it.

use tern_abi::wire::{EffectResult, RequestRecord};
use tern_abi::{EffectTable, Scalar};
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::artifact::Artifact;
use crate::cancellation::CancellationToken;
use crate::config::HostConfig;
use crate::continuation::{ContinuationAction, Continuations, EffectCall};
use crate::error::RunError;
use crate::exchange::Exchange;
use crate::handlers::{BoundHandlers, HandlerRegistry};

/// How a run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The entry function returned a value.
    Completed(Scalar),
    /// A handler ended the run with `end(value)`.
    Ended(Scalar),
    /// Cancellation was observed between a handler and its resumption.
    Aborted,
}

/// Statistics of the most recent run on an artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub requests: usize,
    pub resumes: usize,
}

/// Drives artifacts with a fixed set of handlers.
#[derive(Debug, Clone, Default)]
pub struct HostRuntime {
    config: HostConfig,
    handlers: HandlerRegistry,
}

impl HostRuntime {
    pub fn new(config: HostConfig, handlers: HandlerRegistry) -> Self {
        Self { config, handlers }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.handlers
    }

    /// Run `entry(args)` to completion.
    pub async fn run<A: Artifact>(
        &self,
        artifact: &mut A,
        entry: &str,
        args: &[i32],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        self.run_with_stats(artifact, entry, args, cancel)
            .await
            .map(|(outcome, _)| outcome)
    }

    /// Like [`run`](Self::run), also reporting request counts.
    pub async fn run_with_stats<A: Artifact>(
        &self,
        artifact: &mut A,
        entry: &str,
        args: &[i32],
        cancel: &CancellationToken,
    ) -> Result<(RunOutcome, RunStats), RunError> {
        let span = info_span!("tern_run", entry, args = args.len());
        async move {
            let table = EffectTable::decode(&artifact.effect_table_bytes()?)?;
            let handlers = self.handlers.bind(&table)?;
            debug!(ops = table.op_count(), handlers = handlers.len(), "bound handlers");

            let mut driver = Driver {
                artifact,
                table: &table,
                handlers: &handlers,
                exchange: Exchange::new(self.config.exchange_capacity),
                max_requests: self.config.max_requests,
                stats: RunStats::default(),
            };
            let outcome = driver.drive(entry, args, cancel).await?;
            debug!(?outcome, requests = driver.stats.requests, "run finished");
            Ok((outcome, driver.stats))
        }
        .instrument(span)
        .await
    }
}

struct Driver<'r, A: Artifact> {
    artifact: &'r mut A,
    table: &'r EffectTable,
    handlers: &'r BoundHandlers,
    exchange: Exchange,
    max_requests: Option<usize>,
    stats: RunStats,
}

impl<A: Artifact> Driver<'_, A> {
    async fn drive(
        &mut self,
        entry: &str,
        args: &[i32],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if cancel.is_cancelled() {
            return Ok(RunOutcome::Aborted);
        }
        let mut outcome = self.artifact.call_entry(entry, args)?;
        loop {
            let request = match self.read(&outcome)? {
                EffectResult::Value(value) => return Ok(RunOutcome::Completed(value)),
                EffectResult::Pending(request) => request,
            };

            self.stats.requests += 1;
            if let Some(limit) = self.max_requests {
                if self.stats.requests > limit {
                    return Err(RunError::RequestLimit { limit });
                }
            }

            let call = self.describe(&request)?;
            let handler = self
                .handlers
                .get(request.op_index)
                .ok_or_else(|| RunError::MissingHandler {
                    op_index: request.op_index,
                    op: call.name.clone(),
                })?
                .clone();
            let cont = self
                .artifact
                .outcome_continuation(&outcome)?
                .ok_or(RunError::MissingContinuation)?;

            trace!(op = %call.name, args = ?call.args, "dispatching request");
            let name = call.name.clone();
            let kind = call.resume_kind;
            let action = handler(call, Continuations::new(kind))
                .await?
                .ok_or_else(|| RunError::contract(&name, "must return a continuation call"))?;
            action
                .check(kind)
                .map_err(|message| RunError::contract(&name, message))?;

            let value = match action {
                ContinuationAction::End(value) => {
                    debug!(op = %name, %value, "handler ended the run");
                    return Ok(RunOutcome::Ended(value));
                }
                ContinuationAction::Resume(value) | ContinuationAction::Tail(value) => value,
            };

            if cancel.is_cancelled() {
                warn!(op = %name, reason = ?cancel.reason(), "run cancelled before resume");
                return Ok(RunOutcome::Aborted);
            }
            if value == Scalar::Ref {
                return Err(RunError::UnsupportedResumeValue(value));
            }

            let len = self.exchange.write_resume(self.artifact.memory_mut(), value)?;
            trace!(op = %name, %value, "resuming");
            outcome = self.artifact.resume(cont, 0, len)?;
            self.stats.resumes += 1;
        }
    }

    fn read(&mut self, outcome: &A::Outcome) -> Result<EffectResult, RunError> {
        let status = self.artifact.outcome_status(outcome)?;
        let len = if status < 0 {
            status
        } else {
            self.artifact.exchange_len()?
        };
        self.exchange.read_result(self.artifact.memory(), status, len)
    }

    /// Check a request against the table entry at its op index.
    fn describe(&self, request: &RequestRecord) -> Result<EffectCall, RunError> {
        let (effect, op) = self.table.op(request.op_index).ok_or_else(|| {
            RunError::TableMismatch(format!(
                "op index {} is outside a table of {} ops",
                request.op_index,
                self.table.op_count()
            ))
        })?;
        if effect.id != request.effect || op.op_id != request.op_id {
            return Err(RunError::TableMismatch(format!(
                "op index {} is {}.{} ({} op {}), request names {} op {}",
                request.op_index,
                effect.short_name(),
                op.label,
                effect.id,
                op.op_id,
                request.effect,
                request.op_id
            )));
        }
        if op.resume_kind != request.resume_kind {
            return Err(RunError::TableMismatch(format!(
                "{}.{} is {} in the table but {} in the request",
                effect.short_name(),
                op.label,
                op.resume_kind,
                request.resume_kind
            )));
        }
        Ok(EffectCall {
            op_index: request.op_index,
            name: format!("{}.{}", effect.short_name(), op.label),
            effect_label: effect.label.clone(),
            resume_kind: request.resume_kind,
            handle: request.handle,
            args: request.args.clone(),
        })
    }
}

//! Queue drain state machine.
//!
//! A drain pass walks the pending queue in enqueue order, replaying each
//! operation against the remote store. Exactly one pass runs at a time;
//! the state lock is released around every remote await, so local
//! mutations keep landing while a pass is in flight.

use crate::engine::EngineState;
use crate::events::{EventBus, SyncEvent};
use crate::mirror::is_temporary_id;
use crate::operation::{Action, OpToken, QueuedOperation};
use crate::reconcile::{reconcile, references_temporary};
use crate::remote::RemoteStore;
use crate::{clock::now_ms, config::SyncConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Remote calls made
    pub attempted: usize,
    /// Operations acknowledged (including NotFound treated as applied)
    pub synced: usize,
    /// Operations skipped over unresolved temporary references
    pub deferred: usize,
    /// Operations inside their backoff window or past the retry ceiling
    pub skipped: usize,
    /// Remote calls that failed
    pub failed: usize,
}

/// Backoff delay before the next attempt of an operation.
pub(crate) fn backoff_wait_ms(retry_count: u32, base_ms: u64, cap_ms: u64) -> u64 {
    let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(cap_ms)
}

fn defers_on_temporary(op: &QueuedOperation) -> bool {
    if let Some(target) = op.target_id.as_deref() {
        if is_temporary_id(target) {
            return true;
        }
    }
    let own = match op.action {
        Action::Create => op.local_record_id(),
        Action::Update | Action::Delete => None,
    };
    references_temporary(&op.payload, own)
}

/// Drives drain passes against the remote store.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<Mutex<EngineState>>,
    remote: Arc<dyn RemoteStore>,
    events: EventBus,
    config: SyncConfig,
    draining: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn new(
        state: Arc<Mutex<EngineState>>,
        remote: Arc<dyn RemoteStore>,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        Self {
            state,
            remote,
            events,
            config,
            draining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a drain pass is currently running.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Run one drain pass. A request while a pass is active is a no-op
    /// and returns an empty report.
    pub async fn drain(&self) -> DrainReport {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain requested while a pass is active");
            return DrainReport::default();
        }
        let report = self.pass().await;
        self.draining.store(false, Ordering::SeqCst);
        info!(
            attempted = report.attempted,
            synced = report.synced,
            deferred = report.deferred,
            skipped = report.skipped,
            failed = report.failed,
            "drain pass finished"
        );
        report
    }

    async fn pass(&self) -> DrainReport {
        let mut report = DrainReport::default();

        let tokens: Vec<OpToken> = {
            let guard = self.state.lock().await;
            guard
                .queue
                .list_pending()
                .into_iter()
                .map(|op| op.token)
                .collect()
        };

        for token in tokens {
            // Re-read at each step: an earlier reconciliation in this
            // pass may have rewritten this operation's references.
            let op = {
                let guard = self.state.lock().await;
                match guard.queue.get(&token) {
                    Some(op) if !op.synced => op.clone(),
                    _ => continue,
                }
            };

            if op.retry_count >= self.config.retry_ceiling {
                report.skipped += 1;
                continue;
            }
            if let Some(last) = op.last_retry_at {
                let wait = backoff_wait_ms(
                    op.retry_count,
                    self.config.backoff_base_ms,
                    self.config.backoff_cap_ms,
                );
                if now_ms() < last.saturating_add(wait) {
                    debug!(token = %op.token, wait_ms = wait, "operation inside backoff window");
                    report.skipped += 1;
                    continue;
                }
            }
            if defers_on_temporary(&op) {
                debug!(token = %op.token, "deferred, temporary reference unresolved");
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            let call = match op.action {
                Action::Create => self.remote.create(&op.collection, &op.payload).await.map(Some),
                Action::Update => match op.target_id.as_deref() {
                    Some(target) => self
                        .remote
                        .update(&op.collection, target, &op.payload)
                        .await
                        .map(|_| None),
                    None => Ok(None),
                },
                Action::Delete => match op.target_id.as_deref() {
                    Some(target) => self
                        .remote
                        .delete(&op.collection, target)
                        .await
                        .map(|_| None),
                    None => Ok(None),
                },
            };

            // A mutation against a remotely deleted record has already
            // converged; treat it as applied.
            let applied = match &call {
                Ok(_) => true,
                Err(err) => err.is_not_found() && op.action != Action::Create,
            };

            if applied {
                self.apply_success(&op, call.ok().flatten()).await;
                report.synced += 1;
            } else if let Err(err) = call {
                self.apply_failure(&op, &err).await;
                report.failed += 1;
            }
        }

        self.finish_pass().await;
        report
    }

    async fn apply_success(&self, op: &QueuedOperation, auth_id: Option<String>) {
        let mut reconciled = None;
        {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if let Err(err) = state.queue.mark_synced(&op.token) {
                warn!(token = %op.token, error = %err, "could not persist synced flag");
            }

            let mut record_id = op.local_record_id().map(str::to_string);
            if let Some(auth_id) = auth_id {
                if let Some(temp) = op.local_record_id().filter(|id| is_temporary_id(id)) {
                    match reconcile(&mut state.queue, &mut state.mirror, &op.collection, temp, &auth_id)
                    {
                        Ok(_) => reconciled = Some((temp.to_string(), auth_id.clone())),
                        Err(err) => {
                            warn!(token = %op.token, error = %err, "identifier reconciliation failed")
                        }
                    }
                }
                record_id = Some(auth_id);
            }

            if op.action != Action::Delete {
                if let Some(id) = record_id {
                    let still_pending = state.queue.references_record(&op.collection, &id);
                    if let Err(err) = state.mirror.set_pending(&op.collection, &id, still_pending) {
                        warn!(token = %op.token, error = %err, "could not persist pending flag");
                    }
                }
            }
        }

        debug!(token = %op.token, collection = %op.collection, action = ?op.action, "operation synced");
        if let Some((temporary_id, authoritative_id)) = reconciled {
            self.events.emit(SyncEvent::IdentifierReconciled {
                collection: op.collection.clone(),
                temporary_id,
                authoritative_id,
            });
        }
        self.events.emit(SyncEvent::OperationSynced {
            token: op.token.clone(),
            collection: op.collection.clone(),
        });
    }

    async fn apply_failure(&self, op: &QueuedOperation, err: &crate::remote::RemoteError) {
        let retries = {
            let mut guard = self.state.lock().await;
            if let Err(persist_err) = guard.queue.increment_retry(&op.token, now_ms()) {
                warn!(token = %op.token, error = %persist_err, "could not persist retry bookkeeping");
            }
            guard
                .queue
                .get(&op.token)
                .map(|o| o.retry_count)
                .unwrap_or(0)
        };

        if retries >= self.config.retry_ceiling {
            warn!(token = %op.token, retries, error = %err, "operation reached the retry ceiling");
            self.events.emit(SyncEvent::OperationFailed {
                token: op.token.clone(),
                collection: op.collection.clone(),
            });
        } else {
            debug!(
                token = %op.token,
                retries,
                transient = err.is_transient(),
                error = %err,
                "remote call failed, will retry"
            );
        }
    }

    async fn finish_pass(&self) {
        let now = now_ms();
        let pending = {
            let mut guard = self.state.lock().await;
            match guard.queue.cleanup(self.config.retention_ms, now) {
                Ok(purged) if purged > 0 => debug!(purged, "purged synced operations past retention"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "retention cleanup failed"),
            }
            guard.queue.pending_count(self.config.retry_ceiling)
        };
        self.events.emit(SyncEvent::QueueSizeChanged { pending });
    }
}

//! Sync scheduling: debounced, single-flight flushes of locally edited
//! entities to the remote store, with optimistic-concurrency retry.
//!
//! A local edit sends its entity key to the scheduler task; keys coalesce in
//! a pending set while the debounce deadline keeps resetting. When the
//! deadline elapses the task snapshots the set and syncs each entity
//! serially. Edits arriving mid-flush buffer in the channel and seed the next
//! pending set, so an in-flight flush is never cancelled or corrupted.

use crate::catalog::Catalog;
use crate::events::{Event, EventBus};
use crate::model::{EntityKey, EntityRecord, PreferenceSet};
use crate::remote::{PutOutcome, RemoteStore};
use crate::store::PreferenceStore;
use crate::wire;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1500);

#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Quiescence period after which pending edits are flushed.
    pub debounce: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Cached human-readable summary, refreshed best-effort after each flush.
#[derive(Clone, Debug, Serialize)]
pub struct SummarySnapshot {
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

/// Shared handles the scheduler task works against.
#[derive(Clone)]
struct SyncContext {
    store: Arc<RwLock<PreferenceStore>>,
    catalog: Arc<Catalog>,
    remote: Arc<dyn RemoteStore>,
    events: EventBus,
    syncing: Arc<AtomicBool>,
    summary: Arc<RwLock<Option<SummarySnapshot>>>,
}

/// The engine facade: owns the preference store behind a lock and drives the
/// background sync scheduler. All mutation funnels through this one owner;
/// the lock is never held across a suspension point.
pub struct PreferenceHub {
    ctx: SyncContext,
    edit_tx: mpsc::UnboundedSender<EntityKey>,
    _scheduler: tokio::task::JoinHandle<()>,
}

impl PreferenceHub {
    /// Create the hub with empty records for the family entity and every
    /// known member, and spawn the scheduler. Must be called from within a
    /// tokio runtime.
    pub fn new(
        catalog: Arc<Catalog>,
        remote: Arc<dyn RemoteStore>,
        members: impl IntoIterator<Item = String>,
        options: SyncOptions,
    ) -> Self {
        let store = Arc::new(RwLock::new(PreferenceStore::new(
            Arc::clone(&catalog),
            members,
        )));
        let ctx = SyncContext {
            store,
            catalog,
            remote,
            events: EventBus::new(),
            syncing: Arc::new(AtomicBool::new(false)),
            summary: Arc::new(RwLock::new(None)),
        };
        let (edit_tx, edit_rx) = mpsc::unbounded_channel();
        let scheduler = tokio::spawn(run_scheduler(ctx.clone(), edit_rx, options.debounce));
        Self {
            ctx,
            edit_tx,
            _scheduler: scheduler,
        }
    }

    /// Initial hydration from the remote store. On failure every known entity
    /// falls back to an empty record; the cache is never left partially
    /// populated.
    pub async fn hydrate(&self) {
        match self.ctx.remote.fetch_all().await {
            Ok(resp) => self.ctx.store.write().hydrate(&resp),
            Err(err) => {
                warn!(error = %err, "initial load failed; starting with empty records");
                self.ctx.store.write().reset_empty();
            }
        }
    }

    /// Switch the editable working set to another entity. A pure view change:
    /// no derived-state or scheduler activity.
    pub fn set_active(&self, key: EntityKey) {
        self.ctx.store.write().set_active(key.clone());
        self.ctx.events.send(Event::ActiveChanged { key });
    }

    /// Commit a mutated working set for the active entity and schedule its
    /// sync. The edit is visible locally regardless of network state.
    pub fn commit_edit(&self, prefs: PreferenceSet) {
        let key = self.ctx.store.write().commit_edit(prefs);
        let _ = self.edit_tx.send(key.clone());
        self.ctx.events.send(Event::EditCommitted { key });
    }

    /// Append a free-text note on behalf of the assistant writer. Does not
    /// schedule a sync; notes ride along on the entity's next structured one.
    pub fn append_misc_note(&self, key: &EntityKey, note: String) {
        self.ctx.store.write().append_misc_note(key, note);
    }

    pub fn active_key(&self) -> EntityKey {
        self.ctx.store.read().active_key().clone()
    }

    pub fn active_prefs(&self) -> PreferenceSet {
        self.ctx.store.read().active_prefs().clone()
    }

    /// The read-only union of every entity's selections.
    pub fn canvas(&self) -> PreferenceSet {
        self.ctx.store.read().canvas().clone()
    }

    /// The entities that selected `item` in `category`.
    pub fn entities_for(&self, category: &str, item: &str) -> BTreeSet<EntityKey> {
        self.ctx
            .store
            .read()
            .associations()
            .entities_for(category, item)
            .cloned()
            .unwrap_or_default()
    }

    pub fn record(&self, key: &EntityKey) -> Option<EntityRecord> {
        self.ctx.store.read().record(key).cloned()
    }

    pub fn is_syncing(&self) -> bool {
        self.ctx.syncing.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> Option<SummarySnapshot> {
        self.ctx.summary.read().clone()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.ctx.events.subscribe()
    }
}

async fn run_scheduler(
    ctx: SyncContext,
    mut edit_rx: mpsc::UnboundedReceiver<EntityKey>,
    debounce: Duration,
) {
    let mut pending: BTreeSet<EntityKey> = BTreeSet::new();
    let mut deadline: Option<Instant> = None;
    loop {
        let wake = deadline.unwrap_or_else(Instant::now);
        tokio::select! {
            key = edit_rx.recv() => match key {
                Some(key) => {
                    // Repeated edits coalesce; each one restarts the window.
                    pending.insert(key);
                    deadline = Some(Instant::now() + debounce);
                }
                None => break,
            },
            _ = sleep_until(wake), if deadline.is_some() => {
                deadline = None;
                let batch = std::mem::take(&mut pending);
                if !batch.is_empty() {
                    flush(&ctx, batch).await;
                }
            }
        }
    }
}

/// Sync each pending entity serially, then refresh the summary best-effort.
/// Single-flight: only the scheduler loop runs this, and it awaits completion
/// before looking at the channel again.
async fn flush(ctx: &SyncContext, batch: BTreeSet<EntityKey>) {
    ctx.syncing.store(true, Ordering::SeqCst);
    ctx.events.send(Event::SyncStarted);
    for key in batch {
        match sync_entity(ctx, &key).await {
            Ok(version) => {
                debug!(entity = %key, version, "entity synced");
                ctx.events.send(Event::EntitySynced { key, version });
            }
            Err(err) => {
                // The entity stays dirty; only its next local edit re-triggers
                // a sync attempt.
                warn!(entity = %key, error = %err, "sync failed");
                ctx.events.send(Event::SyncFailed { key });
            }
        }
    }
    refresh_summary(ctx).await;
    ctx.syncing.store(false, Ordering::SeqCst);
    ctx.events.send(Event::SyncFinished);
}

/// Push one entity's record with its cached version token. On a version
/// mismatch, accept the server's version, re-merge the authoritative misc
/// notes, and retry exactly once: last structured edit wins, notes are never
/// clobbered.
async fn sync_entity(ctx: &SyncContext, key: &EntityKey) -> Result<i64> {
    let record = snapshot_record(ctx, key);
    let content = wire::build_content(&record, &ctx.catalog)?;
    match put_record(ctx, key, content, record.version).await? {
        PutOutcome::Stored { version } => {
            ctx.store.write().set_version(key, version);
            Ok(version)
        }
        PutOutcome::Conflict(authoritative) => {
            debug!(entity = %key, version = authoritative.version, "version conflict; retrying");
            accept_conflict(ctx, key, &authoritative.content, authoritative.version);
            let record = snapshot_record(ctx, key);
            let content = wire::build_content(&record, &ctx.catalog)?;
            match put_record(ctx, key, content, authoritative.version).await? {
                PutOutcome::Stored { version } => {
                    ctx.store.write().set_version(key, version);
                    Ok(version)
                }
                PutOutcome::Conflict(again) => {
                    accept_conflict(ctx, key, &again.content, again.version);
                    Err(anyhow!("version conflict persisted after retry"))
                }
            }
        }
    }
}

fn snapshot_record(ctx: &SyncContext, key: &EntityKey) -> EntityRecord {
    ctx.store.read().record(key).cloned().unwrap_or_default()
}

/// Store the server's version token and its authoritative copy of the
/// assistant-owned notes.
fn accept_conflict(ctx: &SyncContext, key: &EntityKey, content: &serde_json::Value, version: i64) {
    let notes = wire::extract_misc_notes(content);
    let mut store = ctx.store.write();
    store.set_misc_notes(key, notes);
    store.set_version(key, version);
}

async fn put_record(
    ctx: &SyncContext,
    key: &EntityKey,
    content: serde_json::Value,
    version: i64,
) -> Result<PutOutcome> {
    match key {
        EntityKey::Everyone => ctx.remote.put_family(content, version).await,
        EntityKey::Member(id) => ctx.remote.put_member(id, content, version).await,
    }
}

async fn refresh_summary(ctx: &SyncContext) {
    match ctx.remote.fetch_summary().await {
        Ok(text) => {
            *ctx.summary.write() = Some(SummarySnapshot {
                text,
                fetched_at: Utc::now(),
            });
            ctx.events.send(Event::SummaryUpdated);
        }
        Err(err) => {
            // Best-effort: nothing to roll back.
            debug!(error = %err, "summary refresh failed");
        }
    }
}

//! The engine: command queue, settle loop, and public API.
//!
//! Every mutating call enqueues a command; `settle` drains the queue,
//! applies each command to the state store, then dispatches the journaled
//! changes to the scheduler, lifecycle, and time-watcher effects, looping
//! until the engine is quiescent. Handlers run inside the dispatch phase
//! and their own calls enqueue into the next drain, which is what gives
//! sequential API calls their batched, next-tick semantics.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use cadence_core::ctl::{EngineCtl, ModeOptions, RunOptions};
use cadence_core::error::EngineError;
use cadence_core::registry::TypeRegistry;
use cadence_core::store::{ItemPath, StateChange, StateStore};
use cadence_core::types::{
    Chain, ChainId, EventBlock, LiveEvent, LiveId, PendingMode, RunMode,
};
use cadence_stores::InMemoryStateStore;

use crate::builtins::install_builtins;
use crate::command::Command;
use crate::config::EngineConfig;
use crate::fast::{self, FastChainInfo};
use crate::lifecycle;
use crate::scheduler;
use crate::timewatch;
use crate::variables;

/// Backstop against effect loops that never quiesce.
const MAX_SETTLE_PASSES: usize = 10_000;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn relock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A first start parked on pending sub-chain values.
pub(crate) struct PendingStart {
    /// Values produced by finished sub-chains, keyed by value ID
    pub resolved: HashMap<String, Value>,
    /// Sub-chains still running
    pub outstanding: HashSet<String>,
}

/// State shared between the engine, its ctl handles, and the effects.
pub(crate) struct EngineShared {
    pub(crate) registry: TypeRegistry,
    pub(crate) store: Arc<dyn StateStore>,
    commands: Mutex<VecDeque<Command>>,
    globals: Mutex<HashMap<String, HashMap<String, Value>>>,
    resolve_value_map: Mutex<HashMap<String, LiveId>>,
    pending_starts: Mutex<HashMap<LiveId, PendingStart>>,
    watchers: Mutex<HashMap<LiveId, ItemPath>>,
    fast_chains: Mutex<HashMap<String, FastChainInfo>>,
}

impl EngineShared {
    pub(crate) fn enqueue(&self, command: Command) {
        relock(&self.commands).push_back(command);
    }

    fn pop_command(&self) -> Option<Command> {
        relock(&self.commands).pop_front()
    }

    pub(crate) fn lock_globals(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Value>>> {
        relock(&self.globals)
    }

    pub(crate) fn lock_resolve_value_map(&self) -> MutexGuard<'_, HashMap<String, LiveId>> {
        relock(&self.resolve_value_map)
    }

    pub(crate) fn lock_pending_starts(&self) -> MutexGuard<'_, HashMap<LiveId, PendingStart>> {
        relock(&self.pending_starts)
    }

    pub(crate) fn lock_watchers(&self) -> MutexGuard<'_, HashMap<LiveId, ItemPath>> {
        relock(&self.watchers)
    }

    pub(crate) fn lock_fast_chains(&self) -> MutexGuard<'_, HashMap<String, FastChainInfo>> {
        relock(&self.fast_chains)
    }

    pub(crate) fn ctl(self: &Arc<Self>) -> Arc<dyn EngineCtl> {
        Arc::new(CtlHandle {
            shared: self.clone(),
        })
    }

    /// The elapsed-time signal location for one live event.
    pub(crate) fn time_path_for(&self, live: &LiveEvent) -> Option<ItemPath> {
        live.elapsed_time_path
            .clone()
            .or_else(|| self.registry.default_elapsed_time_path().cloned())
    }

    /// Current elapsed time for one live event; a missing path or value
    /// reads as 0, which disables duration-based ending.
    pub(crate) async fn elapsed_for(&self, live: &LiveEvent) -> f64 {
        let Some(path) = self.time_path_for(live) else {
            tracing::warn!(
                error = %EngineError::MissingElapsedTime(live.id.clone()),
                "treating elapsed as 0"
            );
            return 0.0;
        };
        match self.store.item(&path).await {
            Ok(Some(value)) => value.as_f64().unwrap_or(0.0),
            Ok(None) => 0.0,
            Err(err) => {
                tracing::warn!(live_id = %live.id, error = %err, "elapsed-time read failed");
                0.0
            }
        }
    }

    /// Compute the target chain and enqueue an add. Returns the chain ID.
    async fn do_run_events(
        self: &Arc<Self>,
        blocks: Vec<EventBlock>,
        mut options: RunOptions,
    ) -> ChainId {
        if options.is_fast {
            let chain_id = options.chain_id.take().unwrap_or_else(new_id);
            self.enqueue(Command::RunFast {
                blocks,
                chain_id: chain_id.clone(),
                parent_chain_id: options.parent_chain_id,
                added_by: options.added_by,
                run_by: options.run_by,
            });
            return chain_id;
        }

        let chain_id = options
            .live_id
            .clone()
            .or(options.chain_id)
            .or_else(|| self.registry.default_chain_id().cloned())
            .unwrap_or_else(new_id);
        self.enqueue(Command::AddEvents {
            blocks,
            chain_id: chain_id.clone(),
            parent_live_id: options.live_id,
            parent_chain_id: options.parent_chain_id,
            has_priority: options.has_priority,
            added_by: options.added_by,
            run_by: options.run_by,
        });
        chain_id
    }

    async fn do_run_event(self: &Arc<Self>, mut block: EventBlock, options: RunOptions) -> LiveId {
        let live_id = block.options.live_id.clone().unwrap_or_else(new_id);
        block.options.live_id = Some(live_id.clone());
        self.do_run_events(vec![block], options).await;
        live_id
    }
}

/// `_addEvents`: create the chain on demand, instantiate live records, and
/// splice them into the queue. Colliding live IDs are parked and the
/// existing record is cancelled.
async fn apply_add_events(
    shared: &Arc<EngineShared>,
    blocks: Vec<EventBlock>,
    chain_id: ChainId,
    parent_live_id: Option<LiveId>,
    parent_chain_id: Option<ChainId>,
    has_priority: bool,
    added_by: Option<String>,
    run_by: Option<String>,
) {
    let now = chrono::Utc::now().timestamp_millis();

    let mut chain = match shared.store.chain(&chain_id).await {
        Ok(Some(chain)) => chain,
        Ok(None) => {
            let mut parent_chain = parent_chain_id;
            let mut can_auto_activate = true;
            if let Some(parent_id) = &parent_live_id {
                match shared.store.live_event(parent_id).await {
                    Ok(Some(parent)) => {
                        parent_chain = parent_chain.or(Some(parent.chain_id.clone()));
                        // sub-chains wait for their parent to leave `add`
                        can_auto_activate = parent.now_run_mode != RunMode::Add;
                    }
                    Ok(None) => {
                        tracing::warn!(
                            error = %EngineError::MissingLiveEvent(parent_id.clone()),
                            "sub-chain parent missing"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(live_id = %parent_id, error = %err, "parent lookup failed");
                    }
                }
            }
            let mut chain = Chain::new(chain_id.clone()).with_auto_activate(can_auto_activate);
            chain.parent_chain_id = parent_chain;
            chain
        }
        Err(err) => {
            tracing::warn!(chain_id = %chain_id, error = %err, "chain lookup failed; add dropped");
            return;
        }
    };

    let mut new_ids = Vec::new();
    for block in blocks {
        let def = match shared.registry.event_def(&block.group, &block.name) {
            Ok(def) => def.clone(),
            Err(err) => {
                tracing::warn!(error = %err, "event block skipped");
                continue;
            }
        };
        let live_id = block.options.live_id.clone().unwrap_or_else(new_id);

        match shared.store.live_event(&live_id).await {
            Ok(Some(_)) => {
                tracing::debug!(live_id = %live_id, "duplicate live id parked; cancelling holder");
                chain
                    .duplicate_events_to_add
                    .insert(live_id.clone(), block.clone());
                shared.enqueue(Command::SetMode {
                    live_id,
                    mode: RunMode::Cancel,
                    run_by: None,
                });
                continue;
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(live_id = %live_id, error = %err, "live lookup failed; block skipped");
                continue;
            }
        }

        let mut live = LiveEvent::new(live_id.clone(), chain.id.clone(), block.clone(), now);
        live.parent_chain_id = chain.parent_chain_id.clone();
        live.is_parallel = block.options.is_parallel.unwrap_or(def.is_parallel);
        live.duration = block.options.duration.or(def.default_duration);
        live.elapsed_time_path = block
            .options
            .time_path
            .clone()
            .or_else(|| def.default_time_path.clone());
        live.added_by = block.options.added_by.clone().or_else(|| added_by.clone());
        live.run_by = run_by.clone();

        if let Some(path) = shared.time_path_for(&live) {
            shared.lock_watchers().insert(live_id.clone(), path);
        }
        if let Err(err) = shared.store.put_live_event(live).await {
            tracing::warn!(live_id = %live_id, error = %err, "live event write failed");
            continue;
        }
        new_ids.push(live_id);
    }

    if has_priority {
        let lives = scheduler::chain_members(shared, &chain).await;
        let at = scheduler::active_prefix_len(&chain, &lives);
        let tail = chain.live_event_ids.split_off(at);
        chain.live_event_ids.extend(new_ids);
        chain.live_event_ids.extend(tail);
    } else {
        chain.live_event_ids.extend(new_ids);
    }
    if let Err(err) = shared.store.put_chain(chain).await {
        tracing::warn!(chain_id = %chain_id, error = %err, "chain write failed");
        return;
    }

    // an already-running parent waits for the sub-chain to drain
    if let Some(parent_id) = &parent_live_id {
        match shared.store.live_event(parent_id).await {
            Ok(Some(mut parent)) if parent.has_started() && !parent.is_finalized() => {
                parent.goal_end_time = Some(f64::INFINITY);
                if let Err(err) = shared.store.put_live_event(parent).await {
                    tracing::warn!(live_id = %parent_id, error = %err, "parent wait write failed");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(live_id = %parent_id, error = %err, "parent lookup failed");
            }
        }
    }
}

/// Write a run mode to one live event. Skips issued to an event that is not
/// yet activatable are parked for the scheduler instead. Stale writes (to
/// missing or finalized events) are silently dropped.
async fn apply_set_mode(
    shared: &Arc<EngineShared>,
    live_id: &str,
    mode: RunMode,
    run_by: Option<String>,
) {
    let live = match shared.store.live_event(live_id).await {
        Ok(Some(live)) => live,
        Ok(None) => {
            tracing::debug!(live_id = %live_id, mode = %mode, "stale run-mode write ignored");
            return;
        }
        Err(err) => {
            tracing::warn!(live_id = %live_id, error = %err, "live lookup failed");
            return;
        }
    };
    if live.is_finalized() {
        tracing::debug!(live_id = %live_id, mode = %mode, "run-mode write to finalized event ignored");
        return;
    }

    let mut live = live;
    if mode == RunMode::Skip
        && !live.has_started()
        && !scheduler::is_activatable_now(shared, &live).await
    {
        tracing::debug!(live_id = %live_id, "skip parked until activatable");
        live.run_mode_options_when_ready = Some(PendingMode { mode, run_by });
        if let Err(err) = shared.store.put_live_event(live).await {
            tracing::warn!(live_id = %live_id, error = %err, "park write failed");
        }
        return;
    }

    if run_by.is_some() {
        live.run_by = run_by;
    }
    if live.now_run_mode == mode {
        return;
    }
    live.now_run_mode = mode;
    if let Err(err) = shared.store.put_live_event(live).await {
        tracing::warn!(live_id = %live_id, error = %err, "run-mode write failed");
    }
}

async fn apply_chain_mode(
    shared: &Arc<EngineShared>,
    chain_id: &str,
    mode: RunMode,
    run_by: Option<String>,
) {
    // fast chains cancel through their flag map
    if mode == RunMode::Cancel && fast::cancel_fast_chain(shared, chain_id) {
        return;
    }
    let chain = match shared.store.chain(chain_id).await {
        Ok(Some(chain)) => chain,
        Ok(None) => {
            tracing::warn!(
                mode = %mode,
                error = %EngineError::MissingChain(chain_id.to_string()),
                "chain transition skipped"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(chain_id = %chain_id, error = %err, "chain lookup failed");
            return;
        }
    };
    for live_id in chain.live_event_ids {
        apply_set_mode(shared, &live_id, mode, run_by.clone()).await;
    }
}

async fn apply_for_all_before(
    shared: &Arc<EngineShared>,
    live_id: &str,
    mode: RunMode,
    run_by: Option<String>,
) {
    let live = match shared.store.live_event(live_id).await {
        Ok(Some(live)) => live,
        Ok(None) => {
            tracing::warn!(
                error = %EngineError::MissingLiveEvent(live_id.to_string()),
                "before-transition reference missing"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(live_id = %live_id, error = %err, "live lookup failed");
            return;
        }
    };
    let chain = match shared.store.chain(&live.chain_id).await {
        Ok(Some(chain)) => chain,
        Ok(None) => {
            tracing::warn!(
                error = %EngineError::MissingChain(live.chain_id.clone()),
                "before-transition chain missing"
            );
            return;
        }
        Err(err) => {
            tracing::warn!(chain_id = %live.chain_id, error = %err, "chain lookup failed");
            return;
        }
    };
    let Some(position) = chain.position_of(live_id) else {
        return;
    };
    for id in chain.live_event_ids[..position].to_vec() {
        apply_set_mode(shared, &id, mode, run_by.clone()).await;
    }
}

async fn apply_all_events_do(
    shared: &Arc<EngineShared>,
    group: Option<String>,
    mode: RunMode,
    run_by: Option<String>,
) {
    let target_group = group.map(|g| shared.registry.resolve_group(&g).to_string());
    let ids = match shared.store.live_event_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::warn!(error = %err, "live id listing failed");
            return;
        }
    };
    for id in ids {
        if let Some(target) = &target_group {
            match shared.store.live_event(&id).await {
                Ok(Some(live)) if shared.registry.resolve_group(&live.event.group) == target => {}
                _ => continue,
            }
        }
        apply_set_mode(shared, &id, mode, run_by.clone()).await;
    }
}

/// Drop a finalized record and re-admit a parked duplicate at the tail.
async fn apply_remove_live_event(shared: &Arc<EngineShared>, live_id: &str, chain_id: &str) {
    if let Err(err) = shared.store.remove_live_event(live_id).await {
        tracing::warn!(live_id = %live_id, error = %err, "record removal failed");
    }
    shared.lock_watchers().remove(live_id);
    shared.lock_pending_starts().remove(live_id);

    match shared.store.chain(chain_id).await {
        Ok(Some(mut chain)) => {
            if let Some(block) = chain.duplicate_events_to_add.remove(live_id) {
                tracing::debug!(live_id = %live_id, "re-admitting parked duplicate");
                if let Err(err) = shared.store.put_chain(chain).await {
                    tracing::warn!(chain_id = %chain_id, error = %err, "chain write failed");
                }
                shared.enqueue(Command::AddEvents {
                    blocks: vec![block],
                    chain_id: chain_id.to_string(),
                    parent_live_id: None,
                    parent_chain_id: None,
                    has_priority: false,
                    added_by: None,
                    run_by: None,
                });
            }
        }
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(chain_id = %chain_id, error = %err, "chain lookup failed");
        }
    }
}

/// Walk chain parents from `chain_id` for the nearest pending resolver and
/// hand it the value; the resolved sub-chain's remainder is cancelled.
async fn apply_resolve_value(shared: &Arc<EngineShared>, chain_id: String, value: Value) {
    let mut current = Some(chain_id.clone());
    while let Some(cid) = current {
        if lifecycle::resolve_value(shared, &cid, value.clone()) {
            shared.enqueue(Command::ChainMode {
                chain_id: cid,
                mode: RunMode::Cancel,
                run_by: None,
            });
            return;
        }
        current = match shared.store.chain(&cid).await {
            Ok(Some(chain)) => chain.parent_chain_id,
            _ => None,
        };
    }
    tracing::warn!(chain_id = %chain_id, "no pending resolver above chain");
}

async fn apply_command(shared: &Arc<EngineShared>, command: Command) {
    match command {
        Command::AddEvents {
            blocks,
            chain_id,
            parent_live_id,
            parent_chain_id,
            has_priority,
            added_by,
            run_by,
        } => {
            apply_add_events(
                shared,
                blocks,
                chain_id,
                parent_live_id,
                parent_chain_id,
                has_priority,
                added_by,
                run_by,
            )
            .await;
        }
        Command::RunFast {
            blocks,
            chain_id,
            parent_chain_id,
            added_by,
            run_by,
        } => {
            fast::run_fast(shared, blocks, chain_id, parent_chain_id, added_by, run_by, false)
                .await;
        }
        Command::SetMode {
            live_id,
            mode,
            run_by,
        } => apply_set_mode(shared, &live_id, mode, run_by).await,
        Command::ChainMode {
            chain_id,
            mode,
            run_by,
        } => apply_chain_mode(shared, &chain_id, mode, run_by).await,
        Command::ForAllBefore {
            live_id,
            mode,
            run_by,
        } => apply_for_all_before(shared, &live_id, mode, run_by).await,
        Command::AllEventsDo {
            group,
            mode,
            run_by,
        } => apply_all_events_do(shared, group, mode, run_by).await,
        Command::RemoveLiveEvent { live_id, chain_id } => {
            apply_remove_live_event(shared, &live_id, &chain_id).await;
        }
        Command::CheckEnd { live_id } => timewatch::check_goal(shared, &live_id).await,
        Command::ResolveValue { chain_id, value } => {
            apply_resolve_value(shared, chain_id, value).await;
        }
        Command::AdvanceStart { live_id } => lifecycle::try_start(shared, &live_id).await,
    }
}

/// Route one journaled change to the effects. Run-mode transitions also
/// poke the scheduler since the queue head may mean something new.
async fn dispatch_change(shared: &Arc<EngineShared>, change: StateChange) {
    match change {
        StateChange::ChainAdded { chain_id }
        | StateChange::ChainQueueChanged { chain_id }
        | StateChange::ChainAutoActivateChanged { chain_id } => {
            scheduler::on_chain_changed(shared, &chain_id).await;
        }
        StateChange::ChainRemoved { .. } => {}
        StateChange::LiveEventAdded { live_id } => {
            lifecycle::on_live_added(shared, &live_id).await;
        }
        StateChange::RunModeChanged {
            live_id,
            prev,
            mode,
        } => {
            lifecycle::on_run_mode_changed(shared, &live_id, prev, mode).await;
            if let Ok(Some(live)) = shared.store.live_event(&live_id).await {
                scheduler::on_chain_changed(shared, &live.chain_id).await;
            }
        }
        StateChange::LiveEventRemoved { .. } => {}
        StateChange::ItemChanged { path } => timewatch::on_item_changed(shared, &path).await,
    }
}

/// A serialized chain: the chain record plus its live events in queue
/// order. JSON-compatible; restore with [`Engine::import_chain`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainExport {
    pub chain: Chain,
    pub live_events: Vec<LiveEvent>,
}

/// The deferred event-orchestration engine.
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine over an in-memory state store.
    pub fn new(registry: TypeRegistry, config: EngineConfig) -> Self {
        Self::with_store(registry, config, Arc::new(InMemoryStateStore::new()))
    }

    /// Create an engine over a custom state store.
    pub fn with_store(
        mut registry: TypeRegistry,
        config: EngineConfig,
        store: Arc<dyn StateStore>,
    ) -> Self {
        registry.merge_config(config.into());
        install_builtins(&mut registry);
        tracing::info!("cadence engine initialized");
        Self {
            shared: Arc::new(EngineShared {
                registry,
                store,
                commands: Mutex::new(VecDeque::new()),
                globals: Mutex::new(HashMap::new()),
                resolve_value_map: Mutex::new(HashMap::new()),
                pending_starts: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                fast_chains: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// A shareable control handle (the same surface handlers receive).
    pub fn ctl(&self) -> Arc<dyn EngineCtl> {
        self.shared.ctl()
    }

    /// Registered types.
    pub fn registry(&self) -> &TypeRegistry {
        &self.shared.registry
    }

    /// Run one settle pass: drain the command queue, then dispatch the
    /// journaled changes. Returns whether any work happened.
    pub async fn tick(&self) -> Result<bool, EngineError> {
        let mut worked = false;
        while let Some(command) = self.shared.pop_command() {
            worked = true;
            apply_command(&self.shared, command).await;
        }
        let changes = self.shared.store.drain_changes().await?;
        if !changes.is_empty() {
            worked = true;
        }
        for change in changes {
            dispatch_change(&self.shared, change).await;
        }
        Ok(worked)
    }

    /// Settle the engine: run passes until nothing is queued and no changes
    /// remain.
    pub async fn settle(&self) -> Result<(), EngineError> {
        for _ in 0..MAX_SETTLE_PASSES {
            if !self.tick().await? {
                return Ok(());
            }
        }
        tracing::warn!("settle pass budget exhausted; state may not be quiescent");
        Ok(())
    }

    /// Write the default elapsed-time signal. Fails when no default path is
    /// configured.
    pub async fn set_elapsed_time(&self, value: f64) -> Result<(), EngineError> {
        let path = self
            .shared
            .registry
            .default_elapsed_time_path()
            .cloned()
            .ok_or_else(|| EngineError::MissingElapsedTime("default".to_string()))?;
        self.shared.store.set_item(&path, Value::from(value)).await?;
        Ok(())
    }

    /// Write a host item field.
    pub async fn set_state(&self, path: &ItemPath, value: Value) -> Result<(), EngineError> {
        self.shared.store.set_item(path, value).await?;
        Ok(())
    }

    /// Read a host item field.
    pub async fn get_state(&self, path: &ItemPath) -> Result<Option<Value>, EngineError> {
        Ok(self.shared.store.item(path).await?)
    }

    /// Snapshot one chain.
    pub async fn chain(&self, chain_id: &str) -> Result<Option<Chain>, EngineError> {
        Ok(self.shared.store.chain(chain_id).await?)
    }

    /// Snapshot one live event.
    pub async fn live_event(&self, live_id: &str) -> Result<Option<LiveEvent>, EngineError> {
        Ok(self.shared.store.live_event(live_id).await?)
    }

    /// IDs of every chain.
    pub async fn chain_ids(&self) -> Result<Vec<ChainId>, EngineError> {
        Ok(self.shared.store.chain_ids().await?)
    }

    /// IDs of every live event.
    pub async fn live_event_ids(&self) -> Result<Vec<LiveId>, EngineError> {
        Ok(self.shared.store.live_event_ids().await?)
    }

    /// Subscribe to realtime state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.shared.store.subscribe()
    }

    /// Serialize a chain and its live events in queue order.
    pub async fn export_chain(&self, chain_id: &str) -> Result<Option<ChainExport>, EngineError> {
        let Some(chain) = self.shared.store.chain(chain_id).await? else {
            return Ok(None);
        };
        let mut live_events = Vec::new();
        for live_id in &chain.live_event_ids {
            if let Some(live) = self.shared.store.live_event(live_id).await? {
                live_events.push(live);
            }
        }
        Ok(Some(ChainExport { chain, live_events }))
    }

    /// Restore a serialized chain. Handlers are not re-dispatched for the
    /// imported records; the scheduler and time watcher resume from the
    /// restored state, and a waiting parent re-derives its infinite goal
    /// from the surviving sub-chain.
    pub async fn import_chain(&self, export: ChainExport) -> Result<(), EngineError> {
        for live in export.live_events {
            if let Some(path) = self.shared.time_path_for(&live) {
                self.shared.lock_watchers().insert(live.id.clone(), path);
            }
            self.shared.store.put_live_event(live).await?;
        }
        self.shared.store.put_chain(export.chain.clone()).await?;

        for live_id in &export.chain.live_event_ids {
            let Some(mut live) = self.shared.store.live_event(live_id).await? else {
                continue;
            };
            if live.has_started() && live.goal_end_time.is_none() {
                let waiting = matches!(
                    self.shared.store.chain(&live.id).await,
                    Ok(Some(ref sub)) if !sub.is_drained()
                );
                if waiting {
                    live.goal_end_time = Some(f64::INFINITY);
                    self.shared.store.put_live_event(live).await?;
                }
            }
        }

        // imported records must not re-fire handlers
        self.shared.store.drain_changes().await?;
        scheduler::on_chain_changed(&self.shared, &export.chain.id).await;
        Ok(())
    }

    // ============ Convenience delegation to the ctl surface ============

    pub async fn run_events(&self, blocks: Vec<EventBlock>, options: RunOptions) -> ChainId {
        self.shared.do_run_events(blocks, options).await
    }

    pub async fn run_event(&self, block: EventBlock, options: RunOptions) -> LiveId {
        self.shared.do_run_event(block, options).await
    }

    pub async fn run_priority_event(&self, block: EventBlock, options: RunOptions) -> LiveId {
        let mut options = options;
        options.has_priority = true;
        self.shared.do_run_event(block, options).await
    }

    pub async fn run_priority_events(
        &self,
        blocks: Vec<EventBlock>,
        options: RunOptions,
    ) -> ChainId {
        let mut options = options;
        options.has_priority = true;
        self.shared.do_run_events(blocks, options).await
    }

    pub async fn add_sub_events(
        &self,
        live_id: &str,
        blocks: Vec<EventBlock>,
        options: RunOptions,
    ) -> ChainId {
        self.ctl().add_sub_events(live_id, blocks, options).await
    }

    pub async fn event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        self.ctl().event_do(mode, live_id, options).await;
    }

    pub async fn chain_do(&self, mode: RunMode, chain_id: &str, options: ModeOptions) {
        self.ctl().chain_do(mode, chain_id, options).await;
    }

    pub async fn chain_with_event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        self.ctl().chain_with_event_do(mode, live_id, options).await;
    }

    pub async fn do_for_all_before_event(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        self.ctl()
            .do_for_all_before_event(mode, live_id, options)
            .await;
    }

    pub async fn skip_to_event(&self, live_id: &str) {
        self.ctl().skip_to_event(live_id).await;
    }

    pub async fn cancel_up_to_event(&self, live_id: &str) {
        self.ctl().cancel_up_to_event(live_id).await;
    }

    pub async fn all_group_events_do(&self, group: &str, mode: RunMode, options: ModeOptions) {
        self.ctl().all_group_events_do(group, mode, options).await;
    }

    pub async fn all_events_do(&self, mode: RunMode, options: ModeOptions) {
        self.ctl().all_events_do(mode, options).await;
    }

    pub async fn set_variable(&self, name: &str, value: Value, scope: Option<&str>) {
        variables::set_variable(&self.shared, name, value, scope, false).await;
    }

    pub async fn get_variable(&self, name: &str, scope: Option<&str>) -> Option<Value> {
        variables::get_variable(&self.shared, name, scope, false).await
    }
}

/// The ctl handle given to handlers (and available to hosts).
struct CtlHandle {
    shared: Arc<EngineShared>,
}

#[async_trait]
impl EngineCtl for CtlHandle {
    async fn run_events(&self, blocks: Vec<EventBlock>, options: RunOptions) -> ChainId {
        self.shared.do_run_events(blocks, options).await
    }

    async fn run_event(&self, block: EventBlock, options: RunOptions) -> LiveId {
        self.shared.do_run_event(block, options).await
    }

    async fn run_priority_events(&self, blocks: Vec<EventBlock>, options: RunOptions) -> ChainId {
        let mut options = options;
        options.has_priority = true;
        self.shared.do_run_events(blocks, options).await
    }

    async fn add_sub_events(
        &self,
        live_id: &str,
        blocks: Vec<EventBlock>,
        options: RunOptions,
    ) -> ChainId {
        let mut options = options;
        options.live_id = Some(live_id.to_string());
        self.shared.do_run_events(blocks, options).await
    }

    async fn event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        self.shared.enqueue(Command::SetMode {
            live_id: live_id.to_string(),
            mode,
            run_by: options.run_by,
        });
    }

    async fn chain_do(&self, mode: RunMode, chain_id: &str, options: ModeOptions) {
        self.shared.enqueue(Command::ChainMode {
            chain_id: chain_id.to_string(),
            mode,
            run_by: options.run_by,
        });
    }

    async fn chain_with_event_do(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        // membership is read now, not at apply time
        match self.shared.store.live_event(live_id).await {
            Ok(Some(live)) => self.shared.enqueue(Command::ChainMode {
                chain_id: live.chain_id,
                mode,
                run_by: options.run_by,
            }),
            Ok(None) => {
                tracing::warn!(
                    error = %EngineError::MissingLiveEvent(live_id.to_string()),
                    "chain_with_event_do on missing live event"
                );
            }
            Err(err) => {
                tracing::warn!(live_id = %live_id, error = %err, "live lookup failed");
            }
        }
    }

    async fn do_for_all_before_event(&self, mode: RunMode, live_id: &str, options: ModeOptions) {
        self.shared.enqueue(Command::ForAllBefore {
            live_id: live_id.to_string(),
            mode,
            run_by: options.run_by,
        });
    }

    async fn skip_to_event(&self, live_id: &str) {
        self.do_for_all_before_event(RunMode::Skip, live_id, ModeOptions::default())
            .await;
    }

    async fn cancel_up_to_event(&self, live_id: &str) {
        self.do_for_all_before_event(RunMode::Cancel, live_id, ModeOptions::default())
            .await;
    }

    async fn all_group_events_do(&self, group: &str, mode: RunMode, options: ModeOptions) {
        self.shared.enqueue(Command::AllEventsDo {
            group: Some(group.to_string()),
            mode,
            run_by: options.run_by,
        });
    }

    async fn all_events_do(&self, mode: RunMode, options: ModeOptions) {
        self.shared.enqueue(Command::AllEventsDo {
            group: None,
            mode,
            run_by: options.run_by,
        });
    }

    async fn set_variable(&self, name: &str, value: Value, scope: Option<&str>, is_fast: bool) {
        variables::set_variable(&self.shared, name, value, scope, is_fast).await;
    }

    async fn get_variable(&self, name: &str, scope: Option<&str>, is_fast: bool) -> Option<Value> {
        variables::get_variable(&self.shared, name, scope, is_fast).await
    }

    async fn set_goal_end_time(&self, live_id: &str, goal: f64) {
        match self.shared.store.live_event(live_id).await {
            Ok(Some(mut live)) => {
                live.goal_end_time = Some(goal);
                if let Err(err) = self.shared.store.put_live_event(live).await {
                    tracing::warn!(live_id = %live_id, error = %err, "goal write failed");
                }
            }
            Ok(None) => {
                tracing::debug!(live_id = %live_id, "goal write to missing live event ignored");
            }
            Err(err) => {
                tracing::warn!(live_id = %live_id, error = %err, "live lookup failed");
            }
        }
    }

    async fn resolve_event_value(&self, chain_id: &str, value: Value) {
        // fast chains resolve synchronously so their loop sees the
        // cancellation flag between events
        if fast::handle_fast_return(&self.shared, chain_id, value.clone()) {
            return;
        }
        self.shared.enqueue(Command::ResolveValue {
            chain_id: chain_id.to_string(),
            value,
        });
    }

    async fn set_state(&self, path: &ItemPath, value: Value) {
        if let Err(err) = self.shared.store.set_item(path, value).await {
            tracing::warn!(path = %path, error = %err, "state write failed");
        }
    }

    async fn get_state(&self, path: &ItemPath) -> Option<Value> {
        match self.shared.store.item(path).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(path = %path, error = %err, "state read failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::ctl::LiveInfo;
    use cadence_core::registry::{EventHandler, EventTypeDef};
    use cadence_core::types::{ParamMap, ValueBlock};
    use cadence_core::value::param_f64;
    use serde_json::json;

    fn clock_path() -> ItemPath {
        ItemPath::new("clock", "main", "elapsed")
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, RunMode)>>,
        values: Mutex<Vec<Value>>,
    }

    impl Recorder {
        fn record(&self, live_id: &str, mode: RunMode) {
            relock(&self.calls).push((live_id.to_string(), mode));
        }

        fn record_value(&self, value: Value) {
            relock(&self.values).push(value);
        }

        fn calls(&self) -> Vec<(String, RunMode)> {
            relock(&self.calls).clone()
        }

        fn values(&self) -> Vec<Value> {
            relock(&self.values).clone()
        }

        fn modes_for(&self, live_id: &str) -> Vec<RunMode> {
            relock(&self.calls)
                .iter()
                .filter(|(id, _)| id == live_id)
                .map(|(_, mode)| *mode)
                .collect()
        }
    }

    /// Holds its event open for `duration` units of elapsed time.
    struct WaitFor {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EventHandler for WaitFor {
        async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
            self.recorder.record(&info.live_id, info.run_mode);
            if info.run_mode == RunMode::Start && !info.is_unfreezing() && !info.is_fast {
                if let Some(duration) = param_f64(&params, "duration") {
                    ctl.set_goal_end_time(&info.live_id, info.elapsed_time + duration)
                        .await;
                }
            }
        }
    }

    /// Fire-and-finish event that only records its dispatches.
    struct Note {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EventHandler for Note {
        async fn run(&self, _params: ParamMap, info: LiveInfo, _ctl: Arc<dyn EngineCtl>) {
            self.recorder.record(&info.live_id, info.run_mode);
        }
    }

    /// Spawns a two-step sub-chain under itself on first start.
    struct SpawnSub {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EventHandler for SpawnSub {
        async fn run(&self, _params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
            self.recorder.record(&info.live_id, info.run_mode);
            if info.run_mode == RunMode::Start && !info.is_unfreezing() {
                ctl.add_sub_events(
                    &info.live_id,
                    vec![wait_block(200.0), wait_block(200.0)],
                    RunOptions::default(),
                )
                .await;
            }
        }
    }

    /// Writes `sum = a + b` into its own chain scope.
    struct AddToScope {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EventHandler for AddToScope {
        async fn run(&self, params: ParamMap, info: LiveInfo, ctl: Arc<dyn EngineCtl>) {
            self.recorder.record(&info.live_id, info.run_mode);
            if info.run_mode == RunMode::Start && !info.is_unfreezing() {
                if let (Some(a), Some(b)) = (param_f64(&params, "a"), param_f64(&params, "b")) {
                    ctl.set_variable("sum", Value::from(a + b), Some(&info.chain_id), info.is_fast)
                        .await;
                }
            }
        }
    }

    /// Records its evaluated `amount` parameter on start.
    struct Capture {
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl EventHandler for Capture {
        async fn run(&self, params: ParamMap, info: LiveInfo, _ctl: Arc<dyn EngineCtl>) {
            self.recorder.record(&info.live_id, info.run_mode);
            if info.run_mode == RunMode::Start && !info.is_unfreezing() {
                self.recorder
                    .record_value(params.get("amount").cloned().unwrap_or(Value::Null));
            }
        }
    }

    fn build_engine(recorder: &Arc<Recorder>) -> Engine {
        let mut registry = TypeRegistry::new();
        registry.register_event_group(
            "testEvents",
            vec![
                (
                    "wait",
                    EventTypeDef::new(Arc::new(WaitFor {
                        recorder: recorder.clone(),
                    })),
                ),
                (
                    "pwait",
                    EventTypeDef::new(Arc::new(WaitFor {
                        recorder: recorder.clone(),
                    }))
                    .parallel(),
                ),
                (
                    "note",
                    EventTypeDef::new(Arc::new(Note {
                        recorder: recorder.clone(),
                    })),
                ),
                (
                    "spawn",
                    EventTypeDef::new(Arc::new(SpawnSub {
                        recorder: recorder.clone(),
                    })),
                ),
                (
                    "capture",
                    EventTypeDef::new(Arc::new(Capture {
                        recorder: recorder.clone(),
                    })),
                ),
            ],
        );
        registry.register_event_group(
            "mathEvents",
            vec![(
                "add",
                EventTypeDef::new(Arc::new(AddToScope {
                    recorder: recorder.clone(),
                })),
            )],
        );
        let config = EngineConfig::default().with_elapsed_time_path(clock_path());
        Engine::new(registry, config)
    }

    fn wait_block(duration: f64) -> EventBlock {
        EventBlock::new("test", "wait").with_params(json!({ "duration": duration }))
    }

    async fn drive(engine: &Engine, elapsed: f64) {
        engine.set_elapsed_time(elapsed).await.unwrap();
        engine.settle().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_waits_end_in_queue_order() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(500.0).with_live_id("w1"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        let w0 = engine.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Start);
        assert_eq!(w0.goal_end_time, Some(1000.0));
        let w1 = engine.live_event("w1").await.unwrap().expect("w1");
        assert_eq!(w1.now_run_mode, RunMode::Add);

        drive(&engine, 999.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_some());

        drive(&engine, 1000.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_none());
        let w1 = engine.live_event("w1").await.unwrap().expect("w1");
        assert_eq!(w1.now_run_mode, RunMode::Start);
        assert_eq!(w1.goal_end_time, Some(1500.0));

        drive(&engine, 1500.0).await;
        assert!(engine.live_event("w1").await.unwrap().is_none());

        drive(&engine, 1600.0).await;
        assert!(engine.chain(&chain_id).await.unwrap().is_none());

        // strict ordering: w1 starts only after w0 ended
        let calls = recorder.calls();
        let w0_end = calls
            .iter()
            .position(|c| c == &("w0".to_string(), RunMode::End))
            .expect("w0 end");
        let w1_start = calls
            .iter()
            .position(|c| c == &("w1".to_string(), RunMode::Start))
            .expect("w1 start");
        assert!(w0_end < w1_start);
    }

    #[tokio::test]
    async fn test_block_duration_ends_events_in_elapsed_units() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        // the duration option on the block, not a handler-driven goal
        let chain_id = engine
            .run_events(
                vec![
                    EventBlock::new("test", "note")
                        .with_live_id("d0")
                        .with_duration(800.0),
                    EventBlock::new("test", "note")
                        .with_live_id("d1")
                        .with_duration(200.0),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        // goal is elapsed + duration, with no unit scaling
        let d0 = engine.live_event("d0").await.unwrap().expect("d0");
        assert_eq!(d0.now_run_mode, RunMode::Start);
        assert_eq!(d0.goal_end_time, Some(800.0));

        drive(&engine, 799.0).await;
        assert!(engine.live_event("d0").await.unwrap().is_some());

        drive(&engine, 800.0).await;
        assert!(engine.live_event("d0").await.unwrap().is_none());
        let d1 = engine.live_event("d1").await.unwrap().expect("d1");
        assert_eq!(d1.now_run_mode, RunMode::Start);
        assert_eq!(d1.goal_end_time, Some(1000.0));

        drive(&engine, 1000.0).await;
        assert!(engine.live_event("d1").await.unwrap().is_none());
        assert!(engine.chain(&chain_id).await.unwrap().is_none());

        assert_eq!(
            recorder.modes_for("d0"),
            vec![RunMode::Add, RunMode::Start, RunMode::End]
        );
        assert_eq!(
            recorder.modes_for("d1"),
            vec![RunMode::Add, RunMode::Start, RunMode::End]
        );
    }

    #[tokio::test]
    async fn test_pause_is_transparent_to_duration() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(vec![wait_block(1000.0).with_live_id("w0")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();

        drive(&engine, 400.0).await;
        engine
            .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();

        let w0 = engine.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Pause);
        assert_eq!(w0.remaining_time, Some(600.0));
        assert_eq!(w0.run_mode_before_pause, Some(RunMode::Start));

        // the clock moving has no effect while paused
        drive(&engine, 900.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_some());

        engine
            .chain_do(RunMode::Unpause, &chain_id, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();

        let w0 = engine.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Start);
        assert_eq!(w0.goal_end_time, Some(1500.0));

        drive(&engine, 1499.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_some());
        drive(&engine, 1500.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_suspend_is_transparent_to_duration() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_events(vec![wait_block(1000.0).with_live_id("w0")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();
        drive(&engine, 250.0).await;

        engine
            .event_do(RunMode::Suspend, "w0", ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        let w0 = engine.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Suspend);
        assert_eq!(w0.remaining_time, Some(750.0));
        assert_eq!(w0.run_mode_before_suspend, Some(RunMode::Start));

        drive(&engine, 600.0).await;
        engine
            .event_do(RunMode::Unsuspend, "w0", ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        let w0 = engine.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Start);
        assert_eq!(w0.goal_end_time, Some(1350.0));
        assert!(w0.unsuspend_time.is_some());

        drive(&engine, 1350.0).await;
        assert!(engine.live_event("w0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_combine_and_string_values_evaluate_nested() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let amount = ValueBlock::new("basic", "combine")
            .with_params(json!({
                "a": 2,
                "b": ValueBlock::new("basic", "string")
                    .with_params(json!({"value": 3}))
                    .into_value(),
            }))
            .into_value();
        engine
            .run_event(
                EventBlock::new("test", "capture").with_params(json!({ "amount": amount })),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();
        assert_eq!(recorder.values(), vec![json!(5.0)]);

        let label = ValueBlock::new("basic", "combine")
            .with_params(json!({"a": "hp: ", "b": 10}))
            .into_value();
        engine
            .run_event(
                EventBlock::new("test", "capture").with_params(json!({ "amount": label })),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();
        assert_eq!(
            recorder.values(),
            vec![json!(5.0), json!("hp: 10")]
        );
    }

    #[tokio::test]
    async fn test_repeated_pause_in_one_tick_is_idempotent() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(vec![wait_block(1000.0).with_live_id("w0")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();
        drive(&engine, 400.0).await;

        engine
            .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        let once = serde_json::to_value(engine.live_event("w0").await.unwrap().unwrap()).unwrap();

        engine
            .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
            .await;
        engine
            .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        let thrice = serde_json::to_value(engine.live_event("w0").await.unwrap().unwrap()).unwrap();

        assert_eq!(once, thrice);
        assert_eq!(recorder.modes_for("w0"), vec![RunMode::Add, RunMode::Start, RunMode::Pause]);
    }

    #[tokio::test]
    async fn test_subchain_holds_parent_open_until_drained() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_event(
                EventBlock::new("test", "spawn").with_live_id("parent"),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        let parent = engine.live_event("parent").await.unwrap().expect("parent");
        assert_eq!(parent.goal_end_time, Some(f64::INFINITY));
        let sub = engine.chain("parent").await.unwrap().expect("sub-chain");
        assert_eq!(sub.live_event_ids.len(), 2);

        drive(&engine, 200.0).await;
        assert!(engine.live_event("parent").await.unwrap().is_some());

        drive(&engine, 400.0).await;
        assert!(engine.live_event("parent").await.unwrap().is_none());
        assert!(engine.chain("parent").await.unwrap().is_none());

        // the parent's end is the last dispatch
        let calls = recorder.calls();
        assert_eq!(
            calls.last(),
            Some(&("parent".to_string(), RunMode::End))
        );
    }

    #[tokio::test]
    async fn test_skip_to_event_skips_queued_head() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(1000.0).with_live_id("w1"),
                    wait_block(1000.0).with_live_id("w2"),
                ],
                RunOptions::default(),
            )
            .await;
        // issued in the same tick, before anything starts
        engine.skip_to_event("w1").await;
        engine.settle().await.unwrap();

        // w0 went add -> skip with one cleanup dispatch, never started
        assert_eq!(recorder.modes_for("w0"), vec![RunMode::Add, RunMode::Skip]);
        let w1 = engine.live_event("w1").await.unwrap().expect("w1");
        assert_eq!(w1.now_run_mode, RunMode::Start);
        let w2 = engine.live_event("w2").await.unwrap().expect("w2");
        assert_eq!(w2.now_run_mode, RunMode::Add);
    }

    #[tokio::test]
    async fn test_skip_on_queued_event_parks_until_activatable() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(500.0).with_live_id("w1"),
                    wait_block(500.0).with_live_id("w2"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        engine
            .event_do(RunMode::Skip, "w1", ModeOptions::default())
            .await;
        engine.settle().await.unwrap();

        let w1 = engine.live_event("w1").await.unwrap().expect("w1");
        assert_eq!(w1.now_run_mode, RunMode::Add);
        assert!(w1.run_mode_options_when_ready.is_some());

        drive(&engine, 1000.0).await;
        // w0 ended; the parked skip applied instead of a start
        assert_eq!(recorder.modes_for("w1"), vec![RunMode::Add, RunMode::Skip]);
        let w2 = engine.live_event("w2").await.unwrap().expect("w2");
        assert_eq!(w2.now_run_mode, RunMode::Start);
    }

    #[tokio::test]
    async fn test_cancel_up_to_event_cancels_active_and_queued() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(1000.0).with_live_id("w1"),
                    wait_block(1000.0).with_live_id("w2"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        engine.cancel_up_to_event("w2").await;
        engine.settle().await.unwrap();

        assert_eq!(
            recorder.modes_for("w0"),
            vec![RunMode::Add, RunMode::Start, RunMode::Cancel]
        );
        assert_eq!(recorder.modes_for("w1"), vec![RunMode::Add, RunMode::Cancel]);
        let w2 = engine.live_event("w2").await.unwrap().expect("w2");
        assert_eq!(w2.now_run_mode, RunMode::Start);
    }

    #[tokio::test]
    async fn test_parallel_burst_starts_together_in_queue_order() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(
                vec![
                    EventBlock::new("test", "pwait")
                        .with_params(json!({"duration": 100.0}))
                        .with_live_id("a"),
                    EventBlock::new("test", "pwait")
                        .with_params(json!({"duration": 200.0}))
                        .with_live_id("b"),
                    wait_block(50.0).with_live_id("c"),
                    wait_block(10.0).with_live_id("d"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        for id in ["a", "b", "c"] {
            assert_eq!(
                engine.live_event(id).await.unwrap().unwrap().now_run_mode,
                RunMode::Start,
                "{id} should be part of the burst"
            );
        }
        assert_eq!(
            engine.live_event("d").await.unwrap().unwrap().now_run_mode,
            RunMode::Add
        );

        // every parallel start precedes the trailing non-parallel start
        let calls = recorder.calls();
        let start_of = |id: &str| {
            calls
                .iter()
                .position(|c| c == &(id.to_string(), RunMode::Start))
                .unwrap()
        };
        assert!(start_of("a") < start_of("c"));
        assert!(start_of("b") < start_of("c"));

        drive(&engine, 50.0).await;
        assert!(engine.live_event("c").await.unwrap().is_none());
        assert_eq!(
            engine.live_event("d").await.unwrap().unwrap().now_run_mode,
            RunMode::Add
        );

        drive(&engine, 100.0).await;
        drive(&engine, 200.0).await;
        // burst drained; d runs alone now
        assert_eq!(
            engine.live_event("d").await.unwrap().unwrap().now_run_mode,
            RunMode::Start
        );
        drive(&engine, 210.0).await;
        assert!(engine.chain(&chain_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_priority_events_insert_after_active_prefix() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(1000.0).with_live_id("w1"),
                    wait_block(1000.0).with_live_id("w2"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        engine
            .run_priority_events(
                vec![
                    EventBlock::new("test", "note").with_live_id("p0"),
                    EventBlock::new("test", "note").with_live_id("p1"),
                ],
                RunOptions::in_chain(chain_id.clone()),
            )
            .await;
        engine.settle().await.unwrap();

        let chain = engine.chain(&chain_id).await.unwrap().expect("chain");
        assert_eq!(chain.live_event_ids, vec!["w0", "p0", "p1", "w1", "w2"]);
    }

    #[tokio::test]
    async fn test_get_event_value_feeds_parent_params() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let amount = ValueBlock::new("basic", "getEventValue")
            .with_params(json!({
                "events": [
                    serde_json::to_value(
                        EventBlock::new("math", "add").with_params(json!({"a": 10, "b": 5}))
                    )
                    .unwrap(),
                    serde_json::to_value(EventBlock::new("basic", "returnValue").with_params(
                        json!({
                            "value": ValueBlock::new("basic", "getVariable")
                                .with_params(json!({"name": "sum"}))
                                .into_value()
                        })
                    ))
                    .unwrap(),
                ]
            }))
            .into_value();

        let live_id = engine
            .run_event(
                EventBlock::new("test", "capture").with_params(json!({ "amount": amount })),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        assert_eq!(recorder.values(), vec![json!(15.0)]);
        // the value sub-chain is gone once resolved
        assert!(engine
            .chain(&format!("{}.amount", live_id))
            .await
            .unwrap()
            .is_none());
        assert!(engine.live_event(&live_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_event_value_without_return_resolves_null() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let amount = ValueBlock::new("basic", "getEventValue")
            .with_params(json!({
                "events": [
                    serde_json::to_value(EventBlock::new("test", "note")).unwrap(),
                ]
            }))
            .into_value();

        engine
            .run_event(
                EventBlock::new("test", "capture").with_params(json!({ "amount": amount })),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        assert_eq!(recorder.values(), vec![Value::Null]);
    }

    #[tokio::test]
    async fn test_duplicate_live_id_cancels_holder_and_readds() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(vec![wait_block(1000.0).with_live_id("L")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();

        engine
            .run_events(
                vec![EventBlock::new("test", "note").with_live_id("L")],
                RunOptions::in_chain(chain_id.clone()),
            )
            .await;
        engine.settle().await.unwrap();

        // holder cancelled, parked block re-admitted under the same id
        assert_eq!(
            recorder.modes_for("L"),
            vec![
                RunMode::Add,
                RunMode::Start,
                RunMode::Cancel,
                RunMode::Add,
                RunMode::Start,
                RunMode::End,
            ]
        );
        assert!(engine.chain(&chain_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_and_global_transitions() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_event(wait_block(1000.0).with_live_id("w0"), RunOptions::default())
            .await;
        engine
            .run_event(
                EventBlock::new("math", "add").with_live_id("m0").with_duration(500.0),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();
        assert!(engine.live_event("m0").await.unwrap().is_some());

        engine
            .all_group_events_do("math", RunMode::Cancel, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        assert!(engine.live_event("m0").await.unwrap().is_none());
        assert!(engine.live_event("w0").await.unwrap().is_some());

        engine
            .all_events_do(RunMode::Cancel, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();
        assert!(engine.live_event("w0").await.unwrap().is_none());
        assert!(engine.live_event_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chain_with_event_do_pauses_sibling_members() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_events(
                vec![
                    wait_block(1000.0).with_live_id("w0"),
                    wait_block(1000.0).with_live_id("w1"),
                ],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        engine
            .chain_with_event_do(RunMode::Pause, "w0", ModeOptions::default())
            .await;
        engine.settle().await.unwrap();

        assert_eq!(
            engine.live_event("w0").await.unwrap().unwrap().now_run_mode,
            RunMode::Pause
        );
        assert_eq!(
            engine.live_event("w1").await.unwrap().unwrap().now_run_mode,
            RunMode::Pause
        );
    }

    #[tokio::test]
    async fn test_variable_scope_walk_and_global_fallback() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(vec![wait_block(1000.0).with_live_id("w0")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();

        engine.set_variable("hp", json!(10), Some(&chain_id)).await;
        assert_eq!(
            engine.get_variable("hp", Some(&chain_id)).await,
            Some(json!(10))
        );
        assert_eq!(engine.get_variable("hp", None).await, None);

        // a non-chain scope is a global bucket
        engine.set_variable("mode", json!("night"), None).await;
        assert_eq!(engine.get_variable("mode", None).await, Some(json!("night")));
        // chain scopes fall back to the default global bucket
        assert_eq!(
            engine.get_variable("mode", Some(&chain_id)).await,
            Some(json!("night"))
        );

        // sub-chain members see ancestor chain variables
        engine
            .add_sub_events("w0", vec![wait_block(500.0)], RunOptions::default())
            .await;
        engine.settle().await.unwrap();
        assert_eq!(
            engine.get_variable("hp", Some("w0")).await,
            Some(json!(10))
        );
    }

    #[tokio::test]
    async fn test_fast_pipeline_runs_in_process() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);

        engine
            .run_events(
                vec![
                    EventBlock::new("math", "add").with_params(json!({"a": 1, "b": 2})),
                    EventBlock::new("test", "capture").with_params(json!({
                        "amount": ValueBlock::new("basic", "getVariable")
                            .with_params(json!({"name": "sum"}))
                            .into_value()
                    })),
                ],
                RunOptions::default().fast(),
            )
            .await;
        engine.settle().await.unwrap();

        assert_eq!(recorder.values(), vec![json!(3.0)]);
        // fast mode allocates no chain or live-event records
        assert!(engine.chain_ids().await.unwrap().is_empty());
        assert!(engine.live_event_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fast_get_event_value_reads_return_slot() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);

        engine
            .run_events(
                vec![EventBlock::new("test", "capture").with_params(json!({
                    "amount": ValueBlock::new("basic", "getEventValue")
                        .with_params(json!({
                            "events": [
                                serde_json::to_value(
                                    EventBlock::new("math", "add")
                                        .with_params(json!({"a": 2, "b": 3}))
                                )
                                .unwrap(),
                                serde_json::to_value(
                                    EventBlock::new("basic", "returnValue").with_params(json!({
                                        "value": ValueBlock::new("basic", "getVariable")
                                            .with_params(json!({"name": "sum"}))
                                            .into_value()
                                    }))
                                )
                                .unwrap(),
                            ]
                        }))
                        .into_value()
                }))],
                RunOptions::default().fast(),
            )
            .await;
        engine.settle().await.unwrap();

        assert_eq!(recorder.values(), vec![json!(5.0)]);
    }

    #[tokio::test]
    async fn test_export_import_resumes_paused_chain() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(vec![wait_block(1000.0).with_live_id("w0")], RunOptions::default())
            .await;
        engine.settle().await.unwrap();
        drive(&engine, 400.0).await;
        engine
            .chain_do(RunMode::Pause, &chain_id, ModeOptions::default())
            .await;
        engine.settle().await.unwrap();

        let export = engine
            .export_chain(&chain_id)
            .await
            .unwrap()
            .expect("export");
        let json = serde_json::to_string(&export).unwrap();

        let recorder2 = Arc::new(Recorder::default());
        let engine2 = build_engine(&recorder2);
        engine2.set_elapsed_time(900.0).await.unwrap();
        let restored: ChainExport = serde_json::from_str(&json).unwrap();
        engine2.import_chain(restored).await.unwrap();
        engine2.settle().await.unwrap();

        // the paused event is back with its freeze bookkeeping intact
        let w0 = engine2.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.now_run_mode, RunMode::Pause);
        assert_eq!(w0.remaining_time, Some(600.0));

        engine2
            .chain_do(RunMode::Unpause, &chain_id, ModeOptions::default())
            .await;
        engine2.settle().await.unwrap();
        let w0 = engine2.live_event("w0").await.unwrap().expect("w0");
        assert_eq!(w0.goal_end_time, Some(1500.0));

        engine2.set_elapsed_time(1500.0).await.unwrap();
        engine2.settle().await.unwrap();
        assert!(engine2.live_event("w0").await.unwrap().is_none());
        assert!(engine2.chain(&chain_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_event_types_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        let chain_id = engine
            .run_events(
                vec![EventBlock::new("nope", "missing")],
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        assert!(engine.chain(&chain_id).await.unwrap().is_none());
        assert!(engine.live_event_ids().await.unwrap().is_empty());
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_instant_event_completes_without_clock_advance() {
        let recorder = Arc::new(Recorder::default());
        let engine = build_engine(&recorder);
        drive(&engine, 0.0).await;

        engine
            .run_event(
                EventBlock::new("test", "note").with_live_id("n0"),
                RunOptions::default(),
            )
            .await;
        engine.settle().await.unwrap();

        assert!(engine.live_event("n0").await.unwrap().is_none());
        assert_eq!(
            recorder.modes_for("n0"),
            vec![RunMode::Add, RunMode::Start, RunMode::End]
        );
    }

    #[tokio::test]
    async fn test_set_elapsed_time_requires_default_path() {
        let engine = Engine::new(TypeRegistry::new(), EngineConfig::default());
        let err = engine.set_elapsed_time(1.0).await.unwrap_err();
        assert!(matches!(err, EngineError::MissingElapsedTime(_)));
    }
}

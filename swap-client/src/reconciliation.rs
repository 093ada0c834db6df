//! Event reconciliation engine.
//!
//! Merges live log subscriptions and bounded historical backfills into one
//! [`Ledger`] per binding. A binding is the pair (contract, active account);
//! every rebind bumps an epoch so that results computed for an older binding
//! are discarded instead of applied.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use serde::Serialize;
use swap_common::{
    block_seconds_to_millis, lookback_start, now_millis, short_hash, Address, LockEvent, LockKind, SwapError,
    TimestampSource,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::abi::{decode_lock_log, lock_topic};
use crate::config::{ListenMode, ReconciliationConfig};
use crate::ledger::{EntrySource, Ledger};
use crate::provider::{BlockRange, ChainLog, ChainProvider, LogQuery, ProviderResult};

const NOTIFICATION_CAPACITY: usize = 256;

/// Lifecycle of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BindingState {
    Uninitialized,
    Subscribed,
    Backfilling,
    Live,
}

#[derive(Debug)]
struct Binding {
    epoch: u64,
    account: Option<Address>,
    state: BindingState,
    latest_ticket: u64,
}

struct EngineInner {
    ledger: Ledger,
    binding: Binding,
    next_ticket: u64,
}

/// Handle of one backfill pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillTicket {
    pub epoch: u64,
    pub ticket: u64,
    /// Ledger high-water mark when the pass started
    live_since: u64,
}

/// Events gathered by one backfill pass
#[derive(Debug, Clone, Default)]
pub struct BackfillOutcome {
    pub events: Vec<LockEvent>,
    /// Kinds whose query failed even after retries
    pub degraded: Vec<LockKind>,
    /// Whether the pass ran without a block range
    pub unranged: bool,
}

/// Result of a bind or refresh
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillSummary {
    pub epoch: u64,
    /// False if a newer pass or binding superseded this one
    pub applied: bool,
    pub new_events: usize,
    pub ledger_size: usize,
    pub degraded_kinds: Vec<LockKind>,
}

pub struct ReconciliationEngine {
    provider: Arc<dyn ChainProvider>,
    contract: Address,
    config: ReconciliationConfig,

    /// Ledger and binding; every merge happens under this lock
    inner: Mutex<EngineInner>,

    /// Live subscription tasks of the current binding; held while they are
    /// replaced so overlapping refreshes never both register
    listeners: Mutex<Vec<JoinHandle<()>>>,

    notifications: broadcast::Sender<LockEvent>,
}

impl ReconciliationEngine {
    pub fn new(provider: Arc<dyn ChainProvider>, contract: Address, config: ReconciliationConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            provider,
            contract,
            config,
            inner: Mutex::new(EngineInner {
                ledger: Ledger::new(),
                binding: Binding {
                    epoch: 0,
                    account: None,
                    state: BindingState::Uninitialized,
                    latest_ticket: 0,
                },
                next_ticket: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            notifications,
        }
    }

    /// Receive every newly merged event relevant to the active account
    pub fn subscribe(&self) -> broadcast::Receiver<LockEvent> {
        self.notifications.subscribe()
    }

    pub fn contract(&self) -> Address {
        self.contract
    }

    /// Ledger sorted by timestamp descending
    pub async fn ledger(&self) -> Vec<LockEvent> {
        self.inner.lock().await.ledger.view()
    }

    pub async fn state(&self) -> BindingState {
        self.inner.lock().await.binding.state
    }

    pub async fn epoch(&self) -> u64 {
        self.inner.lock().await.binding.epoch
    }

    pub async fn active_account(&self) -> Option<Address> {
        self.inner.lock().await.binding.account
    }

    /// Start a fresh binding for `account`.
    ///
    /// The ledger is emptied before any listener or backfill of the new
    /// binding runs, so the new account never observes the previous one's
    /// entries.
    pub async fn bind(self: &Arc<Self>, account: Option<Address>) -> BackfillSummary {
        let mut listeners = self.listeners.lock().await;
        abort_all(&mut listeners);
        let epoch = {
            let mut inner = self.inner.lock().await;
            inner.binding.epoch += 1;
            inner.binding.account = account;
            inner.binding.state = BindingState::Uninitialized;
            inner.ledger.clear();
            inner.binding.epoch
        };
        info!("Binding {} started for account {:?}", epoch, account);

        let handles = self.register_listeners(epoch).await;
        listeners.extend(handles);
        drop(listeners);
        self.run_backfill().await
    }

    /// Re-register listeners and re-run the backfill.
    ///
    /// After a teardown this starts a fresh binding.
    pub async fn refresh(self: &Arc<Self>) -> BackfillSummary {
        let (epoch, state, account) = {
            let inner = self.inner.lock().await;
            (inner.binding.epoch, inner.binding.state, inner.binding.account)
        };
        if state == BindingState::Uninitialized {
            return self.bind(account).await;
        }

        debug!("Refreshing binding {}", epoch);
        let mut listeners = self.listeners.lock().await;
        abort_all(&mut listeners);
        let handles = self.register_listeners(epoch).await;
        listeners.extend(handles);
        drop(listeners);
        self.run_backfill().await
    }

    /// Drop listeners and ledger; in-flight results of the old binding become stale
    pub async fn teardown(&self) {
        abort_all(&mut *self.listeners.lock().await);
        let mut inner = self.inner.lock().await;
        inner.binding.epoch += 1;
        inner.binding.account = None;
        inner.binding.state = BindingState::Uninitialized;
        inner.ledger.clear();
        info!("Reconciliation torn down (epoch now {})", inner.binding.epoch);
    }

    /// Issue a ticket for a new backfill pass; it supersedes every earlier ticket
    pub async fn begin_backfill(&self) -> BackfillTicket {
        let mut inner = self.inner.lock().await;
        inner.next_ticket += 1;
        let ticket = inner.next_ticket;
        inner.binding.latest_ticket = ticket;
        inner.binding.state = BindingState::Backfilling;
        BackfillTicket {
            epoch: inner.binding.epoch,
            ticket,
            live_since: inner.ledger.high_water_mark(),
        }
    }

    /// Query the lookback window for every event kind.
    ///
    /// Never fails: missing block numbers fall back to an unranged query,
    /// kinds whose query keeps failing are left out.
    pub async fn collect_backfill(&self, ticket: BackfillTicket) -> BackfillOutcome {
        let mut outcome = BackfillOutcome::default();
        let range = match self.provider.block_number().await {
            Ok(head) => BlockRange::Bounded {
                from: lookback_start(head, self.config.lookback_blocks),
                to: head,
            },
            Err(e) => {
                warn!(
                    "{}",
                    SwapError::EventQueryDegraded(format!("block number unavailable ({}), using provider default window", e))
                );
                outcome.unranged = true;
                BlockRange::ProviderDefault
            }
        };
        debug!("Backfill {} of binding {} over {:?}", ticket.ticket, ticket.epoch, range);

        let mut timestamps = HashMap::new();
        for kind in LockKind::ALL {
            let logs = match self.query_kind(kind, range).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!("{}", SwapError::EventQueryDegraded(format!("{} query failed: {}", kind, e)));
                    outcome.degraded.push(kind);
                    continue;
                }
            };
            for log in logs {
                match decode_lock_log(&log, now_millis()) {
                    Ok(mut event) => {
                        self.stamp(&mut event, &mut timestamps).await;
                        outcome.events.push(event);
                    }
                    Err(e) => debug!("Skipping undecodable {} log: {}", kind, e),
                }
            }
        }
        outcome
    }

    /// Replace the ledger with a backfill result if `ticket` is still current.
    ///
    /// Returns the number of newly present events.
    pub async fn apply_backfill(&self, ticket: BackfillTicket, outcome: BackfillOutcome) -> Result<usize, SwapError> {
        let mut inner = self.inner.lock().await;
        if ticket.epoch != inner.binding.epoch || ticket.ticket != inner.binding.latest_ticket {
            return Err(SwapError::ReconciliationStale {
                epoch: ticket.epoch,
                ticket: ticket.ticket,
            });
        }

        let account = inner.binding.account;
        let mode = self.config.listen_mode;
        let BackfillOutcome { events, degraded, .. } = outcome;
        let retained: Vec<LockEvent> = events
            .into_iter()
            .filter(|event| retains(mode, account, event))
            .collect();
        // kinds this pass could not read keep what the ledger already had
        let new_events = inner.ledger.replace_with_backfill(retained, ticket.live_since, &degraded);
        inner.binding.state = BindingState::Live;
        self.notify(account, &new_events);

        info!(
            "Backfill {} applied: {} events ({} new)",
            ticket.ticket,
            inner.ledger.len(),
            new_events.len()
        );
        Ok(new_events.len())
    }

    /// Merge one live event if it still belongs to the current binding
    pub async fn ingest_live(&self, epoch: u64, event: LockEvent) -> bool {
        let mut inner = self.inner.lock().await;
        if epoch != inner.binding.epoch {
            debug!("Dropping live event of binding {} (current {})", epoch, inner.binding.epoch);
            return false;
        }
        let account = inner.binding.account;
        if !retains(self.config.listen_mode, account, &event) {
            return false;
        }
        let new_events = inner.ledger.merge(vec![event], EntrySource::Live);
        self.notify(account, &new_events);
        !new_events.is_empty()
    }

    async fn run_backfill(&self) -> BackfillSummary {
        let ticket = self.begin_backfill().await;
        let outcome = self.collect_backfill(ticket).await;
        let degraded_kinds = outcome.degraded.clone();

        let (applied, new_events) = match self.apply_backfill(ticket, outcome).await {
            Ok(count) => (true, count),
            Err(e) => {
                if e.is_user_facing() {
                    warn!("Backfill {} not applied: {}", ticket.ticket, e);
                } else {
                    debug!("{}", e);
                }
                (false, 0)
            }
        };
        BackfillSummary {
            epoch: ticket.epoch,
            applied,
            new_events,
            ledger_size: self.inner.lock().await.ledger.len(),
            degraded_kinds,
        }
    }

    async fn query_kind(&self, kind: LockKind, range: BlockRange) -> ProviderResult<Vec<ChainLog>> {
        let query = LogQuery {
            address: self.contract,
            topic0: lock_topic(kind),
            range,
        };
        let retries = match range {
            BlockRange::Bounded { .. } => self.config.ranged_query_retries,
            BlockRange::ProviderDefault => 0,
        };

        let mut attempt = 0;
        loop {
            match self.provider.logs(query.clone()).await {
                Ok(logs) => return Ok(logs),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!("{} query failed ({}), retry {}/{}", kind, e, attempt, retries);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace ingestion time with the block timestamp when the provider has one
    async fn stamp(&self, event: &mut LockEvent, cache: &mut HashMap<u64, Option<u64>>) {
        let Some(block) = event.block_number else {
            return;
        };
        let seconds = match cache.get(&block) {
            Some(seconds) => *seconds,
            None => {
                let seconds = self.provider.block_timestamp(block).await.ok().flatten();
                cache.insert(block, seconds);
                seconds
            }
        };
        if let Some(seconds) = seconds {
            event.observed_at = block_seconds_to_millis(seconds);
            event.timestamp_source = TimestampSource::Block;
        }
    }

    /// Spawn one listener per event kind; empty if the binding moved on meanwhile
    async fn register_listeners(self: &Arc<Self>, epoch: u64) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in LockKind::ALL {
            let query = LogQuery {
                address: self.contract,
                topic0: lock_topic(kind),
                range: BlockRange::ProviderDefault,
            };
            match self.provider.subscribe_logs(query).await {
                Ok(stream) => handles.push(spawn_listener(Arc::downgrade(self), epoch, kind, stream)),
                Err(e) => warn!(
                    "{}",
                    SwapError::EventQueryDegraded(format!("live {} listener unavailable: {}", kind, e))
                ),
            }
        }

        let mut inner = self.inner.lock().await;
        if inner.binding.epoch != epoch {
            abort_all(&mut handles);
            return handles;
        }
        if inner.binding.state == BindingState::Uninitialized {
            inner.binding.state = BindingState::Subscribed;
        }
        debug!("Registered {} live listeners for binding {}", handles.len(), epoch);
        handles
    }

    fn notify(&self, account: Option<Address>, events: &[LockEvent]) {
        for event in events.iter().filter(|event| is_relevant(account, event)) {
            info!("New {} event for lock {}", event.kind, short_hash(&event.lock_id));
            // no receivers is fine
            let _ = self.notifications.send(event.clone());
        }
    }
}

impl Drop for ReconciliationEngine {
    fn drop(&mut self) {
        abort_all(self.listeners.get_mut());
    }
}

fn abort_all(handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        handle.abort();
    }
}

fn spawn_listener(
    engine: Weak<ReconciliationEngine>,
    epoch: u64,
    kind: LockKind,
    mut stream: crate::provider::LogStream,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            let Some(engine) = engine.upgrade() else {
                break;
            };
            match item {
                Ok(log) => match decode_lock_log(&log, now_millis()) {
                    Ok(mut event) => {
                        engine.stamp(&mut event, &mut HashMap::new()).await;
                        engine.ingest_live(epoch, event).await;
                    }
                    Err(e) => debug!("Skipping undecodable live {} log: {}", kind, e),
                },
                Err(e) => warn!("Live {} listener error: {}", kind, e),
            }
        }
        debug!("Live {} listener of binding {} ended", kind, epoch);
    })
}

/// Whether the ledger keeps `event` under `mode`
pub fn retains(mode: ListenMode, account: Option<Address>, event: &LockEvent) -> bool {
    match (mode, account) {
        (ListenMode::Global, _) | (_, None) => true,
        (ListenMode::Auto, Some(account)) => event.involves(&account),
    }
}

/// Events are relevant to the active account, or to everyone when none is active
pub fn is_relevant(account: Option<Address>, event: &LockEvent) -> bool {
    account.map_or(true, |account| event.involves(&account))
}

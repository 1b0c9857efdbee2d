//! Consensus scheduler
//!
//! Drives the node from a fixed global tick. Each tick works out the roles
//! for the slot after the last committed block and decides what this node
//! does about it:
//!
//! - expected miner: arm the mining timer for `last + interval`
//! - committee member: arm the no-block timeout, vote for an empty block if
//!   nothing arrives
//! - sentinel: cover for a missing miner with an empty block after 8 intervals
//! - everyone: resync when the chain stalls, run housekeeping
//!
//! Incoming peer traffic is handled through [`ConsensusScheduler::on_peer_message`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use pchain_runtime::{ApplyOutcome, ChainCore, LedgerRead, SlotRoles};
use pchain_types::constants::SOFTWARE_VERSION;
use pchain_types::{
    BlockPayload, BlockRecord, BlockStatus, MinerAddition, Receipt, SignedTransaction, Transaction,
    TransactionKind,
};

use crate::broadcast::{Inbound, PeerBroadcaster};
use crate::selection::MinerSelection;
use crate::sync::{apply_synced_blocks, ChainSync, SYNC_BATCH};
use crate::timers::{TimerKind, TimerTable};
use crate::types::{PeerMessage, SchedulerConfig, SchedulerError, SchedulerState, SchedulerStatus};

/// Periodic node maintenance run at the end of every tick
#[async_trait]
pub trait Housekeeping: Send + Sync {
    async fn run(&self, last_block_index: u64);
}

/// Housekeeping that does nothing
pub struct NoHousekeeping;

#[async_trait]
impl Housekeeping for NoHousekeeping {
    async fn run(&self, _last_block_index: u64) {}
}

pub struct ConsensusScheduler {
    core: Arc<ChainCore>,
    broadcaster: Arc<dyn PeerBroadcaster>,
    sync: Arc<dyn ChainSync>,
    housekeeping: Arc<dyn Housekeeping>,
    selection: MinerSelection,
    config: SchedulerConfig,
    timers: TimerTable,
    state: RwLock<SchedulerState>,
    last_sync_ms: Mutex<Option<i64>>,
    /// When peers last accepted a sync request. Responses are only taken
    /// within `min_sync_interval_ms` of it.
    sync_requested_at: Mutex<Option<i64>>,
    /// Block index whose no-block timeout already fired
    timeout_fired_for: Mutex<Option<u64>>,
}

impl ConsensusScheduler {
    pub fn new(
        core: Arc<ChainCore>,
        broadcaster: Arc<dyn PeerBroadcaster>,
        sync: Arc<dyn ChainSync>,
        housekeeping: Arc<dyn Housekeeping>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let selection = MinerSelection::new(core.params());
        tracing::info!(
            "Scheduler ready: tick {}ms, block interval {}ms, self-commit {}",
            config.tick_ms,
            config.block_interval_ms,
            config.self_commit
        );
        Arc::new(Self {
            core,
            broadcaster,
            sync,
            housekeeping,
            selection,
            config,
            timers: TimerTable::new(),
            state: RwLock::new(SchedulerState::Idle),
            last_sync_ms: Mutex::new(None),
            sync_requested_at: Mutex::new(None),
            timeout_fired_for: Mutex::new(None),
        })
    }

    pub fn core(&self) -> &Arc<ChainCore> {
        &self.core
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: self.state(),
            is_mining: self.timers.is_live(TimerKind::Mining),
            is_waiting_block_timeout: self.timers.is_live(TimerKind::BlockReceiveTimeout),
            last_block_index: self.core.store().last_block_index(),
        }
    }

    fn set_state(&self, state: SchedulerState) {
        let mut current = self.state.write();
        if *current != state {
            tracing::debug!("Scheduler {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    /// Tick forever until `shutdown` flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.tick_ms.max(1) as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.start_miner_broadcast_clock();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!("Error in scheduler tick: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
            }
        }
        self.timers.cancel_all();
        self.set_state(SchedulerState::Idle);
    }

    /// One pass of the global clock. Housekeeping runs whatever the pass
    /// itself ends in.
    pub async fn tick(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let result = self.step().await;
        self.housekeeping.run(self.core.store().last_block_index()).await;
        result
    }

    async fn step(self: &Arc<Self>) -> Result<(), SchedulerError> {
        self.set_state(SchedulerState::RoleCheck);
        self.core.drain_submissions();
        let mut now = self.core.now();

        let Some(mut last) = self.core.last_block() else {
            tracing::info!("No blocks yet, syncing with the network");
            self.resync(now, 0).await;
            if self.is_sentinel() && !self.timers.is_live(TimerKind::Mining) {
                tracing::info!("Sentinel starting the chain");
                self.arm_mining(1, SlotRoles::default(), Duration::ZERO);
            }
            return Ok(());
        };

        let mut elapsed = now - last.timestamp;
        if elapsed > self.config.stall_after_ms() && self.sync_due(now) {
            tracing::info!("No block for {}ms, resyncing with peers", elapsed);
            self.resync(now, last.block_index).await;
            if let Some(synced) = self.core.last_block() {
                last = synced;
            }
            now = self.core.now();
            elapsed = now - last.timestamp;
        }

        let roles = self.roles();
        let next_index = last.block_index + 1;

        if elapsed < self.config.mining_window_ms() && self.should_mine(&roles) {
            self.set_state(SchedulerState::Mining);
            if !self.timers.is_live(TimerKind::Mining) {
                self.start_mining_clock(&last, roles);
            }
        } else if self.is_sentinel() && self.should_mine(&roles) {
            self.set_state(SchedulerState::Mining);
            if !self.timers.is_live(TimerKind::Mining) {
                self.start_mining_clock(&last, roles);
            }
        } else if self.is_sentinel() && elapsed > self.config.sentinel_after_ms() {
            tracing::info!("Block {} overdue by {}ms, sentinel mining empty block", next_index, elapsed);
            self.set_state(SchedulerState::SentinelFallback);
            self.sentinel_mine_empty(next_index, &roles).await?;
        } else if self.is_committee_member(&roles) {
            self.set_state(SchedulerState::CommitteeWait);
            if !self.timers.is_live(TimerKind::BlockReceiveTimeout) {
                self.start_block_receive_timeout(&last, roles);
            }
        } else {
            self.set_state(SchedulerState::AwaitingBlock);
        }
        Ok(())
    }

    fn roles(&self) -> SlotRoles {
        let ledger = self.core.store().read();
        self.selection.select(&*ledger, self.core.trust())
    }

    fn is_sentinel(&self) -> bool {
        self.core.wallet_address() == self.config.sentinel_wallet
    }

    /// Expected miner for the slot. With nobody eligible, the sentinel is.
    fn should_mine(&self, roles: &SlotRoles) -> bool {
        let me = self.core.wallet_address();
        match &roles.expected_miner {
            Some(miner) => *miner == me,
            None => me == self.config.sentinel_wallet,
        }
    }

    fn is_committee_member(&self, roles: &SlotRoles) -> bool {
        roles.committee.contains(&self.core.wallet_address())
    }

    /// Network addresses to send slot traffic to. Empty means every peer.
    fn targets(&self, roles: &SlotRoles) -> Vec<String> {
        let nodes: Vec<String> = {
            let ledger = self.core.store().read();
            roles
                .committee
                .iter()
                .filter_map(|wallet| ledger.miner(wallet).map(|m| m.network_address.clone()))
                .collect()
        };
        if nodes.len() < self.config.minimum_acceptance_votes && self.broadcaster.peers().len() > nodes.len() {
            tracing::info!("Committee not adequate, broadcasting to all peers");
            return Vec::new();
        }
        nodes
    }

    fn sync_due(&self, now: i64) -> bool {
        match *self.last_sync_ms.lock() {
            Some(at) => now - at > self.config.min_sync_interval_ms,
            None => true,
        }
    }

    async fn resync(&self, now: i64, last_block_index: u64) {
        self.set_state(SchedulerState::Syncing);
        *self.last_sync_ms.lock() = Some(now);
        match self.sync.sync_from_peers(last_block_index).await {
            Ok(_) => *self.sync_requested_at.lock() = Some(now),
            Err(e) => tracing::warn!("Sync failed, retrying on a later tick: {}", e),
        }
    }

    fn sync_pending(&self, now: i64) -> bool {
        match *self.sync_requested_at.lock() {
            Some(at) => now - at <= self.config.min_sync_interval_ms,
            None => false,
        }
    }

    async fn on_sync_response(&self, from: String, blocks: Vec<BlockPayload>) -> Result<(), SchedulerError> {
        let now = self.core.now();
        if !self.sync_pending(now) {
            tracing::debug!("Ignoring unrequested sync response from {}", from);
            return Ok(());
        }
        let applied = apply_synced_blocks(&self.core, &self.selection, blocks)?;
        if applied == SYNC_BATCH {
            self.resync(now, self.core.store().last_block_index()).await;
        }
        Ok(())
    }

    fn delay_until(&self, at_ms: i64) -> Duration {
        Duration::from_millis((at_ms - self.core.now()).max(0) as u64)
    }

    fn start_mining_clock(self: &Arc<Self>, last: &BlockRecord, roles: SlotRoles) {
        let delay = self.delay_until(last.timestamp + self.config.block_interval_ms);
        tracing::info!("Mining block {} in {}ms", last.block_index + 1, delay.as_millis());
        self.arm_mining(last.block_index + 1, roles, delay);
    }

    fn arm_mining(self: &Arc<Self>, next_index: u64, roles: SlotRoles, delay: Duration) {
        let this = self.clone();
        self.timers.arm(TimerKind::Mining, delay, async move {
            if let Err(e) = this.mine(next_index, &roles).await {
                tracing::error!("Mining block {} failed: {}", next_index, e);
            }
        });
    }

    /// Propose block `next_index` unless the chain moved on meanwhile
    pub async fn mine(&self, next_index: u64, roles: &SlotRoles) -> Result<(), SchedulerError> {
        if self.core.store().last_block_index() + 1 != next_index {
            tracing::debug!("Block {} already settled, not mining", next_index);
            return Ok(());
        }
        let targets = self.targets(roles);

        if let Some(staged) = self.staged_proposal(next_index) {
            tracing::info!("Proposal {} already staged, broadcasting it again", next_index);
            self.broadcaster.broadcast_block(&staged, &targets).await;
            self.try_commit(next_index)?;
            return Ok(());
        }

        let Some(payload) = self.core.mine(roles, self.config.self_commit)? else {
            return Ok(());
        };
        let sent = self.broadcaster.broadcast_block(&payload, &targets).await;
        tracing::info!("Broadcast block {} to {} peers", payload.index, sent);
        if !self.config.self_commit {
            self.try_commit(next_index)?;
        }
        Ok(())
    }

    /// Staged proposal for `index`, dropped if it has gone stale
    fn staged_proposal(&self, index: u64) -> Option<BlockPayload> {
        let staged = self.core.staging().proposal(index)?;
        if staged.data.timestamp < self.core.now() - self.config.stale_proposal_ms() {
            tracing::info!("Discarding stale block proposal {}", index);
            self.core.staging().discard_proposal(index);
            return None;
        }
        Some(staged)
    }

    async fn sentinel_mine_empty(&self, next_index: u64, roles: &SlotRoles) -> Result<(), SchedulerError> {
        let payload = match self.staged_proposal(next_index) {
            Some(staged) => {
                tracing::info!("Proposal {} exists, broadcasting it instead", next_index);
                staged
            }
            None => self.core.mine_empty(BlockStatus::MiningTimeout, roles)?,
        };
        self.broadcaster.broadcast_block(&payload, &[]).await;
        self.try_commit(next_index)?;
        Ok(())
    }

    fn start_block_receive_timeout(self: &Arc<Self>, last: &BlockRecord, roles: SlotRoles) {
        let next_index = last.block_index + 1;
        if *self.timeout_fired_for.lock() == Some(next_index) {
            return;
        }
        let delay = self.delay_until(last.timestamp + self.config.block_interval_ms + self.config.no_block_timeout_ms);
        tracing::info!("Committee member for block {}, no-block timeout in {}ms", next_index, delay.as_millis());

        let this = self.clone();
        self.timers.arm(TimerKind::BlockReceiveTimeout, delay, async move {
            if let Err(e) = this.on_block_receive_timeout(next_index, &roles).await {
                tracing::error!("No-block timeout for {} failed: {}", next_index, e);
            }
        });
    }

    async fn on_block_receive_timeout(&self, next_index: u64, roles: &SlotRoles) -> Result<(), SchedulerError> {
        *self.timeout_fired_for.lock() = Some(next_index);
        if self.core.store().last_block_index() >= next_index {
            return Ok(());
        }
        let receipt = self.core.empty_block_receipt(roles)?;
        let targets = self.targets(roles);
        self.broadcaster.broadcast_receipt(&receipt, &targets).await;
        self.try_commit(next_index)?;
        Ok(())
    }

    /// Commit the staged proposal for `index` once enough votes agree on it
    fn try_commit(&self, index: u64) -> Result<bool, SchedulerError> {
        if index != self.core.store().last_block_index() + 1 {
            return Ok(false);
        }
        let Some(payload) = self.core.staging().proposal(index) else {
            return Ok(false);
        };
        let voters = self.core.voters(&self.roles());
        let votes = self.core.vote_count(index, &payload.hash, &voters);
        if votes < self.config.minimum_acceptance_votes {
            tracing::debug!("Block {} has {}/{} votes", index, votes, self.config.minimum_acceptance_votes);
            return Ok(false);
        }

        match self.core.commit_payload(&payload)? {
            ApplyOutcome::Applied { .. } => {
                tracing::info!("Block {} committed with {} votes", index, votes);
                self.timers.cancel(TimerKind::BlockReceiveTimeout);
                Ok(true)
            }
            ApplyOutcome::AlreadyApplied { .. } => Ok(false),
        }
    }

    pub async fn on_peer_message(&self, inbound: Inbound) -> Result<(), SchedulerError> {
        match inbound.message {
            PeerMessage::Block(payload) => self.on_block_payload(payload).await,
            PeerMessage::Receipt(receipt) => self.on_receipt(receipt),
            PeerMessage::Transaction(tx) => {
                if let Err(e) = self.core.mempool_sender().send(tx) {
                    tracing::debug!("Dropping transaction from {}: {}", inbound.from, e);
                }
                Ok(())
            }
            PeerMessage::SyncRequest { from_index } => {
                let blocks = self.core.archived_blocks(from_index, SYNC_BATCH);
                tracing::info!("Serving {} blocks from {} to {}", blocks.len(), from_index, inbound.from);
                if !blocks.is_empty() {
                    self.broadcaster
                        .send(PeerMessage::SyncResponse { blocks }, &[inbound.from])
                        .await;
                }
                Ok(())
            }
            PeerMessage::SyncResponse { blocks } => self.on_sync_response(inbound.from, blocks).await,
        }
    }

    /// Stage a proposal from a peer, vote on it and commit if it has enough
    /// votes
    pub async fn on_block_payload(&self, payload: BlockPayload) -> Result<(), SchedulerError> {
        let last_index = self.core.store().last_block_index();
        if payload.index <= last_index {
            tracing::debug!("Ignoring block {}, already at {}", payload.index, last_index);
            return Ok(());
        }
        if payload.index > last_index + 1 {
            tracing::info!("Block {} is ahead of local tip {}", payload.index, last_index);
            let now = self.core.now();
            if self.sync_due(now) {
                self.resync(now, last_index).await;
            }
            return Ok(());
        }

        let index = payload.index;
        let receipt = self.core.accept_payload(payload)?;
        self.timers.cancel(TimerKind::BlockReceiveTimeout);
        let targets = self.targets(&self.roles());
        self.broadcaster.broadcast_receipt(&receipt, &targets).await;
        self.try_commit(index)?;
        Ok(())
    }

    /// Pool a peer's vote. Votes for the next block must come from its
    /// slot's voters.
    pub fn on_receipt(&self, receipt: Receipt) -> Result<(), SchedulerError> {
        let index = receipt.data.block_index;
        let pooled = if index == self.core.store().last_block_index() + 1 {
            let voters = self.core.voters(&self.roles());
            self.core.add_receipt(receipt, Some(voters.as_slice()))
        } else {
            self.core.add_receipt(receipt, None)
        };
        match pooled {
            Ok(true) => {
                self.try_commit(index)?;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Dropping receipt for block {}: {}", index, e),
        }
        Ok(())
    }

    /// Pool a locally submitted transaction and pass it on to peers
    pub async fn submit_transaction(&self, tx: SignedTransaction) -> Result<(), SchedulerError> {
        self.core.submit_transaction(tx.clone())?;
        self.broadcaster.broadcast_transaction(&tx).await;
        Ok(())
    }

    /// Re-announce this node as a miner, then again every 1x-2x the
    /// broadcast interval
    pub fn start_miner_broadcast_clock(self: &Arc<Self>) {
        let this = self.clone();
        self.timers.arm(TimerKind::MinerBroadcast, Duration::ZERO, async move {
            loop {
                if let Err(e) = this.broadcast_miner_update().await {
                    tracing::warn!("Could not broadcast miner update: {}", e);
                }
                tokio::time::sleep(this.next_miner_broadcast_delay()).await;
            }
        });
    }

    fn next_miner_broadcast_delay(&self) -> Duration {
        let interval = self.config.miner_broadcast_interval_ms.max(1);
        let wait = rand::thread_rng().gen_range(interval..=interval * 2);
        Duration::from_millis(wait as u64)
    }

    async fn broadcast_miner_update(&self) -> Result<(), SchedulerError> {
        let now = self.core.now();
        let update = MinerAddition {
            wallet_address: self.core.wallet_address(),
            network_address: self.config.public_address.clone(),
            broadcast_timestamp: now,
            software_version: SOFTWARE_VERSION.to_string(),
            last_block_index: self.core.store().last_block_index(),
        };
        let tx = self
            .core
            .sign_transaction(Transaction::new(TransactionKind::MinerAddition(update), 0, now));
        tracing::info!("Broadcasting miner update {}", tx.code());
        self.submit_transaction(tx).await
    }

    pub fn shutdown(&self) {
        self.timers.cancel_all();
    }
}

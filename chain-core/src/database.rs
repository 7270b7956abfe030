//! The chain database
//!
//! Owns every object the maintenance core touches, the secondary orderings
//! the sweepers iterate, the per-account balances, and the applied-operation
//! sink. All mutation funnels through per-type `create_*` / `modify_*` /
//! `remove_*` primitives that refresh the orderings and append undo records
//! to the active undo session.
//!
//! # Undo sessions
//!
//! Sessions stack. [`Database::apply_block_updates`] opens one session per
//! block: committing the outermost session discards the log, rolling back
//! applies pre-images in reverse. Inner sessions (the settle-match probe)
//! merge into their parent on commit.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::objects::{
    AccountStatistics, AssetObject, BitassetData, BitassetOptions, CallOrder, DedupeRecord,
    DynamicGlobalProperties, ForceSettlement, GlobalProperties, Htlc, LimitOrder, Proposal,
    VirtualOperation, WithdrawPermission, Witness,
};
use crate::store::Table;
use crate::sweepers::ProposalExecutor;
use crate::tickets::Ticket;
use chain_protocol::{
    AccountId, Asset, AssetId, Block, CallOrderId, DedupeId, HtlcId, LimitOrderId, Price,
    ProposalId, SettlementId, TicketId, WithdrawPermissionId, WitnessId,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Pre-image of one mutation, applied in reverse on rollback
#[derive(Debug, Clone)]
enum UndoEntry {
    Asset {
        id: AssetId,
        prior: Option<AssetObject>,
        prior_next: Option<u64>,
    },
    Bitasset {
        id: AssetId,
        prior: Option<BitassetData>,
    },
    LimitOrder {
        id: LimitOrderId,
        prior: Option<LimitOrder>,
        prior_next: Option<u64>,
    },
    CallOrder {
        id: CallOrderId,
        prior: Option<CallOrder>,
        prior_next: Option<u64>,
    },
    Settlement {
        id: SettlementId,
        prior: Option<ForceSettlement>,
        prior_next: Option<u64>,
    },
    Proposal {
        id: ProposalId,
        prior: Option<Proposal>,
        prior_next: Option<u64>,
    },
    Dedupe {
        id: DedupeId,
        prior: Option<DedupeRecord>,
        prior_next: Option<u64>,
    },
    WithdrawPermission {
        id: WithdrawPermissionId,
        prior: Option<WithdrawPermission>,
        prior_next: Option<u64>,
    },
    Htlc {
        id: HtlcId,
        prior: Option<Htlc>,
        prior_next: Option<u64>,
    },
    Ticket {
        id: TicketId,
        prior: Option<Ticket>,
        prior_next: Option<u64>,
    },
    Witness {
        id: WitnessId,
        prior: Option<Witness>,
        prior_next: Option<u64>,
    },
    AccountStats {
        id: AccountId,
        prior: Option<AccountStatistics>,
    },
    Balance {
        account: AccountId,
        asset: AssetId,
        prior: Option<i64>,
    },
    Dgp {
        prior: Box<DynamicGlobalProperties>,
    },
}

/// Handle to an open undo session
#[derive(Debug)]
pub struct UndoSession {
    undo_mark: usize,
    ops_mark: usize,
}

/// The chain state and its maintenance machinery
pub struct Database {
    config: Config,
    global_properties: GlobalProperties,
    dgp: DynamicGlobalProperties,

    assets: Table<AssetId, AssetObject>,
    bitassets: Table<AssetId, BitassetData>,
    witnesses: Table<WitnessId, Witness>,
    account_stats: Table<AccountId, AccountStatistics>,
    limit_orders: Table<LimitOrderId, LimitOrder>,
    call_orders: Table<CallOrderId, CallOrder>,
    settlements: Table<SettlementId, ForceSettlement>,
    proposals: Table<ProposalId, Proposal>,
    dedupe_records: Table<DedupeId, DedupeRecord>,
    withdraw_permissions: Table<WithdrawPermissionId, WithdrawPermission>,
    htlcs: Table<HtlcId, Htlc>,
    tickets: Table<TicketId, Ticket>,

    // secondary orderings, maintained by the put_* helpers
    pub(crate) limit_order_by_expiration: BTreeSet<(DateTime<Utc>, LimitOrderId)>,
    pub(crate) limit_order_by_price: BTreeSet<(Price, LimitOrderId)>,
    pub(crate) call_order_by_collateral: BTreeSet<(Price, CallOrderId)>,
    pub(crate) settlement_by_expiration: BTreeSet<(AssetId, DateTime<Utc>, SettlementId)>,
    pub(crate) proposal_by_expiration: BTreeSet<(DateTime<Utc>, ProposalId)>,
    pub(crate) dedupe_by_expiration: BTreeSet<(DateTime<Utc>, DedupeId)>,
    dedupe_by_trx: BTreeMap<[u8; 32], DedupeId>,
    pub(crate) withdraw_by_expiration: BTreeSet<(DateTime<Utc>, WithdrawPermissionId)>,
    pub(crate) htlc_by_expiration: BTreeSet<(DateTime<Utc>, HtlcId)>,
    pub(crate) ticket_by_next_update: BTreeSet<(DateTime<Utc>, TicketId)>,
    pub(crate) bitasset_by_feed_expiration: BTreeSet<(DateTime<Utc>, AssetId)>,
    pub(crate) bitasset_cer_pending: BTreeSet<AssetId>,

    balances: BTreeMap<(AccountId, AssetId), i64>,
    applied_ops: Vec<VirtualOperation>,

    undo_log: Vec<UndoEntry>,
    session_depth: usize,
    undo_window: u64,

    pub(crate) metrics: Option<Metrics>,
}

impl Database {
    /// Fresh database holding only the core asset.
    pub fn new(config: Config) -> Self {
        let parameters = config.parameters.clone();
        let mut db = Self {
            config,
            global_properties: GlobalProperties {
                parameters,
                active_witnesses: Vec::new(),
            },
            dgp: DynamicGlobalProperties::default(),
            assets: Table::new(),
            bitassets: Table::new(),
            witnesses: Table::new(),
            account_stats: Table::new(),
            limit_orders: Table::new(),
            call_orders: Table::new(),
            settlements: Table::new(),
            proposals: Table::new(),
            dedupe_records: Table::new(),
            withdraw_permissions: Table::new(),
            htlcs: Table::new(),
            tickets: Table::new(),
            limit_order_by_expiration: BTreeSet::new(),
            limit_order_by_price: BTreeSet::new(),
            call_order_by_collateral: BTreeSet::new(),
            settlement_by_expiration: BTreeSet::new(),
            proposal_by_expiration: BTreeSet::new(),
            dedupe_by_expiration: BTreeSet::new(),
            dedupe_by_trx: BTreeMap::new(),
            withdraw_by_expiration: BTreeSet::new(),
            htlc_by_expiration: BTreeSet::new(),
            ticket_by_next_update: BTreeSet::new(),
            bitasset_by_feed_expiration: BTreeSet::new(),
            bitasset_cer_pending: BTreeSet::new(),
            balances: BTreeMap::new(),
            applied_ops: Vec::new(),
            undo_log: Vec::new(),
            session_depth: 0,
            undo_window: 0,
            metrics: None,
        };
        let core = db.assets.allocate();
        db.assets.insert(
            core,
            AssetObject {
                id: core,
                symbol: "CORE".to_string(),
                precision: 5,
                issuer: AccountId::default(),
                options: Default::default(),
                dynamic: Default::default(),
            },
        );
        db
    }

    /// Attach a metrics collector.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Node configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Block application
    // ---------------------------------------------------------------------

    /// Apply the full per-block housekeeping cycle for an accepted block.
    ///
    /// Runs inside one undo session: any error rolls the state back to the
    /// pre-block snapshot and is returned to the caller.
    pub fn apply_block_updates(
        &mut self,
        block: &Block,
        missed_blocks: u32,
        proposals: &mut dyn ProposalExecutor,
    ) -> Result<()> {
        let session = self.start_undo_session();
        match self.apply_block_inner(block, missed_blocks, proposals) {
            Ok(()) => {
                self.commit_undo_session(session);
                if let Some(m) = &self.metrics {
                    m.blocks_total.inc();
                }
                Ok(())
            }
            Err(e) => {
                self.undo_session(session);
                Err(e)
            }
        }
    }

    fn apply_block_inner(
        &mut self,
        block: &Block,
        missed_blocks: u32,
        proposals: &mut dyn ProposalExecutor,
    ) -> Result<()> {
        self.update_global_dynamic_data(block, missed_blocks)?;
        self.update_signing_witness(block.witness, block)?;
        self.clear_expired_transactions()?;
        self.clear_expired_proposals(proposals)?;
        self.clear_expired_orders()?;
        self.update_expired_feeds()?;
        self.update_core_exchange_rates()?;
        self.update_withdraw_permissions()?;
        self.clear_expired_htlcs()?;
        self.process_tickets()?;
        self.update_last_irreversible_block()?;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Undo sessions
    // ---------------------------------------------------------------------

    /// Open a nested undo session.
    pub fn start_undo_session(&mut self) -> UndoSession {
        self.session_depth += 1;
        UndoSession {
            undo_mark: self.undo_log.len(),
            ops_mark: self.applied_ops.len(),
        }
    }

    /// Commit a session. An inner session merges into its parent; the
    /// outermost commit discards the log.
    pub fn commit_undo_session(&mut self, session: UndoSession) {
        let _ = session;
        self.session_depth = self.session_depth.saturating_sub(1);
        if self.session_depth == 0 {
            self.undo_log.clear();
        }
    }

    /// Roll a session back, restoring every pre-image in reverse order and
    /// dropping operations applied since the session opened.
    pub fn undo_session(&mut self, session: UndoSession) {
        while self.undo_log.len() > session.undo_mark {
            if let Some(entry) = self.undo_log.pop() {
                self.apply_undo(entry);
            }
        }
        self.applied_ops.truncate(session.ops_mark);
        self.session_depth = self.session_depth.saturating_sub(1);
    }

    fn record(&mut self, entry: UndoEntry) {
        if self.session_depth > 0 {
            self.undo_log.push(entry);
        }
    }

    fn apply_undo(&mut self, entry: UndoEntry) {
        match entry {
            UndoEntry::Asset {
                id,
                prior,
                prior_next,
            } => {
                self.put_asset(id, prior);
                if let Some(n) = prior_next {
                    self.assets.set_next_instance(n);
                }
            }
            UndoEntry::Bitasset { id, prior } => {
                self.put_bitasset(id, prior);
            }
            UndoEntry::LimitOrder {
                id,
                prior,
                prior_next,
            } => {
                self.put_limit_order(id, prior);
                if let Some(n) = prior_next {
                    self.limit_orders.set_next_instance(n);
                }
            }
            UndoEntry::CallOrder {
                id,
                prior,
                prior_next,
            } => {
                self.put_call_order(id, prior);
                if let Some(n) = prior_next {
                    self.call_orders.set_next_instance(n);
                }
            }
            UndoEntry::Settlement {
                id,
                prior,
                prior_next,
            } => {
                self.put_settlement(id, prior);
                if let Some(n) = prior_next {
                    self.settlements.set_next_instance(n);
                }
            }
            UndoEntry::Proposal {
                id,
                prior,
                prior_next,
            } => {
                self.put_proposal(id, prior);
                if let Some(n) = prior_next {
                    self.proposals.set_next_instance(n);
                }
            }
            UndoEntry::Dedupe {
                id,
                prior,
                prior_next,
            } => {
                self.put_dedupe(id, prior);
                if let Some(n) = prior_next {
                    self.dedupe_records.set_next_instance(n);
                }
            }
            UndoEntry::WithdrawPermission {
                id,
                prior,
                prior_next,
            } => {
                self.put_withdraw_permission(id, prior);
                if let Some(n) = prior_next {
                    self.withdraw_permissions.set_next_instance(n);
                }
            }
            UndoEntry::Htlc {
                id,
                prior,
                prior_next,
            } => {
                self.put_htlc(id, prior);
                if let Some(n) = prior_next {
                    self.htlcs.set_next_instance(n);
                }
            }
            UndoEntry::Ticket {
                id,
                prior,
                prior_next,
            } => {
                self.put_ticket(id, prior);
                if let Some(n) = prior_next {
                    self.tickets.set_next_instance(n);
                }
            }
            UndoEntry::Witness {
                id,
                prior,
                prior_next,
            } => {
                match prior {
                    Some(w) => {
                        self.witnesses.insert(id, w);
                    }
                    None => {
                        self.witnesses.remove(id);
                    }
                }
                if let Some(n) = prior_next {
                    self.witnesses.set_next_instance(n);
                }
            }
            UndoEntry::AccountStats { id, prior } => match prior {
                Some(s) => {
                    self.account_stats.insert(id, s);
                }
                None => {
                    self.account_stats.remove(id);
                }
            },
            UndoEntry::Balance {
                account,
                asset,
                prior,
            } => match prior {
                Some(v) => {
                    self.balances.insert((account, asset), v);
                }
                None => {
                    self.balances.remove(&(account, asset));
                }
            },
            UndoEntry::Dgp { prior } => {
                self.dgp = *prior;
            }
        }
    }

    // ---------------------------------------------------------------------
    // Singletons
    // ---------------------------------------------------------------------

    /// Chain-wide dynamic state.
    pub fn dynamic_global_properties(&self) -> &DynamicGlobalProperties {
        &self.dgp
    }

    /// Mutate the dynamic global properties under undo.
    pub fn modify_dgp(&mut self, f: impl FnOnce(&mut DynamicGlobalProperties)) {
        self.record(UndoEntry::Dgp {
            prior: Box::new(self.dgp.clone()),
        });
        f(&mut self.dgp);
    }

    /// Chain-wide elected state.
    pub fn global_properties(&self) -> &GlobalProperties {
        &self.global_properties
    }

    /// Replace the elected state; done by maintenance, outside any block's
    /// undo scope.
    pub fn set_global_properties(&mut self, properties: GlobalProperties) {
        self.global_properties = properties;
    }

    /// Timestamp of the head block.
    pub fn head_block_time(&self) -> DateTime<Utc> {
        self.dgp.time
    }

    /// Number of the head block.
    pub fn head_block_num(&self) -> u64 {
        self.dgp.head_block_number
    }

    /// Current size of the undo/fork window, `head - last_irreversible + 1`.
    pub fn undo_window(&self) -> u64 {
        self.undo_window
    }

    pub(crate) fn set_undo_window(&mut self, window: u64) {
        self.undo_window = window;
    }

    // ---------------------------------------------------------------------
    // Balances and applied operations
    // ---------------------------------------------------------------------

    /// Balance of an account in one asset.
    pub fn get_balance(&self, account: AccountId, asset_id: AssetId) -> Asset {
        Asset::new(
            self.balances
                .get(&(account, asset_id))
                .copied()
                .unwrap_or(0),
            asset_id,
        )
    }

    /// Credit or debit an account. Debiting below zero is an invariant
    /// violation.
    pub fn adjust_balance(&mut self, account: AccountId, delta: Asset) -> Result<()> {
        if delta.amount == 0 {
            return Ok(());
        }
        let key = (account, delta.asset_id);
        let prior = self.balances.get(&key).copied();
        let new = prior.unwrap_or(0).checked_add(delta.amount).ok_or_else(|| {
            Error::Protocol(chain_protocol::Error::Overflow(format!(
                "balance adjustment for {account}"
            )))
        })?;
        if new < 0 {
            return Err(Error::InvariantViolation(format!(
                "insufficient balance: {account} holds {} of {}",
                prior.unwrap_or(0),
                delta.asset_id
            )));
        }
        self.balances.insert(key, new);
        self.record(UndoEntry::Balance {
            account,
            asset: delta.asset_id,
            prior,
        });
        Ok(())
    }

    /// Append a virtual operation to the applied-operation sink.
    pub fn push_applied_operation(&mut self, op: VirtualOperation) {
        self.applied_ops.push(op);
    }

    /// Virtual operations accumulated since the last drain.
    pub fn applied_operations(&self) -> &[VirtualOperation] {
        &self.applied_ops
    }

    /// Take the accumulated virtual operations.
    pub fn drain_applied_operations(&mut self) -> Vec<VirtualOperation> {
        std::mem::take(&mut self.applied_ops)
    }

    // ---------------------------------------------------------------------
    // Assets and bitasset data
    // ---------------------------------------------------------------------

    fn put_asset(&mut self, id: AssetId, row: Option<AssetObject>) -> Option<AssetObject> {
        match row {
            Some(row) => self.assets.insert(id, row),
            None => self.assets.remove(id),
        }
    }

    /// Create an asset.
    pub fn create_asset(&mut self, build: impl FnOnce(AssetId) -> AssetObject) -> AssetId {
        let prior_next = self.assets.next_instance();
        let id = self.assets.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_asset(id, Some(row));
        self.record(UndoEntry::Asset {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Asset by id.
    pub fn asset(&self, id: AssetId) -> Result<&AssetObject> {
        self.assets
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Mutate an asset under undo.
    pub fn modify_asset(&mut self, id: AssetId, f: impl FnOnce(&mut AssetObject)) -> Result<()> {
        let mut row = self
            .assets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.put_asset(id, Some(row));
        self.record(UndoEntry::Asset {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All assets in id order.
    pub fn assets(&self) -> impl Iterator<Item = &AssetObject> {
        self.assets.values()
    }

    fn put_bitasset(&mut self, id: AssetId, row: Option<BitassetData>) -> Option<BitassetData> {
        match row {
            Some(row) => {
                let exp_key = (row.feed_expiration, id);
                let pending = row.need_to_update_cer();
                let old = self.bitassets.insert(id, row);
                if let Some(o) = &old {
                    self.bitasset_by_feed_expiration.remove(&(o.feed_expiration, id));
                }
                self.bitasset_by_feed_expiration.insert(exp_key);
                if pending {
                    self.bitasset_cer_pending.insert(id);
                } else {
                    self.bitasset_cer_pending.remove(&id);
                }
                old
            }
            None => {
                let old = self.bitassets.remove(id);
                if let Some(o) = &old {
                    self.bitasset_by_feed_expiration.remove(&(o.feed_expiration, id));
                    self.bitasset_cer_pending.remove(&id);
                }
                old
            }
        }
    }

    /// Attach market data to an asset, making it market-issued.
    pub fn create_bitasset(&mut self, asset_id: AssetId, options: BitassetOptions) -> Result<()> {
        if self.bitassets.contains(asset_id) {
            return Err(Error::InvariantViolation(format!(
                "{asset_id} already has bitasset data"
            )));
        }
        self.put_bitasset(asset_id, Some(BitassetData::new(asset_id, options)));
        self.record(UndoEntry::Bitasset {
            id: asset_id,
            prior: None,
        });
        Ok(())
    }

    /// Market data of a market-issued asset.
    pub fn bitasset(&self, asset_id: AssetId) -> Result<&BitassetData> {
        self.bitassets
            .get(asset_id)
            .ok_or_else(|| Error::ObjectNotFound(format!("bitasset data of {asset_id}")))
    }

    /// Market data if the asset is market-issued.
    pub fn find_bitasset(&self, asset_id: AssetId) -> Option<&BitassetData> {
        self.bitassets.get(asset_id)
    }

    /// Whether the asset's supply is created by collateralized debt.
    pub fn is_market_issued(&self, asset_id: AssetId) -> bool {
        self.bitassets.contains(asset_id)
    }

    /// Mutate market data under undo.
    pub fn modify_bitasset(
        &mut self,
        asset_id: AssetId,
        f: impl FnOnce(&mut BitassetData),
    ) -> Result<()> {
        let mut row = self
            .bitassets
            .get(asset_id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(format!("bitasset data of {asset_id}")))?;
        let prior = row.clone();
        f(&mut row);
        row.asset_id = asset_id;
        self.put_bitasset(asset_id, Some(row));
        self.record(UndoEntry::Bitasset {
            id: asset_id,
            prior: Some(prior),
        });
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Witnesses and account statistics
    // ---------------------------------------------------------------------

    /// Create a witness.
    pub fn create_witness(&mut self, build: impl FnOnce(WitnessId) -> Witness) -> WitnessId {
        let prior_next = self.witnesses.next_instance();
        let id = self.witnesses.allocate();
        let mut row = build(id);
        row.id = id;
        self.witnesses.insert(id, row);
        self.record(UndoEntry::Witness {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Witness by id.
    pub fn witness(&self, id: WitnessId) -> Result<&Witness> {
        self.witnesses
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Mutate a witness under undo.
    pub fn modify_witness(&mut self, id: WitnessId, f: impl FnOnce(&mut Witness)) -> Result<()> {
        let mut row = self
            .witnesses
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.witnesses.insert(id, row);
        self.record(UndoEntry::Witness {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// Ticket aggregates of an account, if any exist.
    pub fn account_statistics(&self, account: AccountId) -> Option<&AccountStatistics> {
        self.account_stats.get(account)
    }

    /// Mutate (creating on first touch) an account's aggregates under undo.
    pub fn modify_account_statistics(
        &mut self,
        account: AccountId,
        f: impl FnOnce(&mut AccountStatistics),
    ) {
        let prior = self.account_stats.get(account).cloned();
        let mut row = prior.clone().unwrap_or(AccountStatistics {
            owner: account,
            ..Default::default()
        });
        f(&mut row);
        row.owner = account;
        self.account_stats.insert(account, row);
        self.record(UndoEntry::AccountStats { id: account, prior });
    }

    /// All account aggregates in account order.
    pub fn all_account_statistics(&self) -> impl Iterator<Item = &AccountStatistics> {
        self.account_stats.values()
    }

    // ---------------------------------------------------------------------
    // Limit orders
    // ---------------------------------------------------------------------

    fn put_limit_order(&mut self, id: LimitOrderId, row: Option<LimitOrder>) -> Option<LimitOrder> {
        match row {
            Some(row) => {
                let exp_key = (row.expiration, id);
                let price_key = (row.sell_price, id);
                let old = self.limit_orders.insert(id, row);
                if let Some(o) = &old {
                    self.limit_order_by_expiration.remove(&(o.expiration, id));
                    self.limit_order_by_price.remove(&(o.sell_price, id));
                }
                self.limit_order_by_expiration.insert(exp_key);
                self.limit_order_by_price.insert(price_key);
                old
            }
            None => {
                let old = self.limit_orders.remove(id);
                if let Some(o) = &old {
                    self.limit_order_by_expiration.remove(&(o.expiration, id));
                    self.limit_order_by_price.remove(&(o.sell_price, id));
                }
                old
            }
        }
    }

    /// Create a limit order.
    pub fn create_limit_order(
        &mut self,
        build: impl FnOnce(LimitOrderId) -> LimitOrder,
    ) -> LimitOrderId {
        let prior_next = self.limit_orders.next_instance();
        let id = self.limit_orders.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_limit_order(id, Some(row));
        self.record(UndoEntry::LimitOrder {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Limit order by id.
    pub fn limit_order(&self, id: LimitOrderId) -> Result<&LimitOrder> {
        self.limit_orders
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Limit order by id, if it still exists.
    pub fn find_limit_order(&self, id: LimitOrderId) -> Option<&LimitOrder> {
        self.limit_orders.get(id)
    }

    /// Mutate a limit order under undo, refreshing `by_expiration` and
    /// `by_price`.
    pub fn modify_limit_order(
        &mut self,
        id: LimitOrderId,
        f: impl FnOnce(&mut LimitOrder),
    ) -> Result<()> {
        let mut row = self
            .limit_orders
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.put_limit_order(id, Some(row));
        self.record(UndoEntry::LimitOrder {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// Remove a limit order under undo.
    pub fn remove_limit_order(&mut self, id: LimitOrderId) -> Result<()> {
        let prior = self
            .put_limit_order(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::LimitOrder {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All limit orders in id order.
    pub fn limit_orders(&self) -> impl Iterator<Item = &LimitOrder> {
        self.limit_orders.values()
    }

    // ---------------------------------------------------------------------
    // Call orders
    // ---------------------------------------------------------------------

    fn put_call_order(&mut self, id: CallOrderId, row: Option<CallOrder>) -> Option<CallOrder> {
        match row {
            Some(row) => {
                let key = (row.call_price, id);
                let old = self.call_orders.insert(id, row);
                if let Some(o) = &old {
                    self.call_order_by_collateral.remove(&(o.call_price, id));
                }
                self.call_order_by_collateral.insert(key);
                old
            }
            None => {
                let old = self.call_orders.remove(id);
                if let Some(o) = &old {
                    self.call_order_by_collateral.remove(&(o.call_price, id));
                }
                old
            }
        }
    }

    /// Create a call order.
    pub fn create_call_order(
        &mut self,
        build: impl FnOnce(CallOrderId) -> CallOrder,
    ) -> CallOrderId {
        let prior_next = self.call_orders.next_instance();
        let id = self.call_orders.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_call_order(id, Some(row));
        self.record(UndoEntry::CallOrder {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Call order by id.
    pub fn call_order(&self, id: CallOrderId) -> Result<&CallOrder> {
        self.call_orders
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Mutate a call order under undo, refreshing `by_collateral`.
    pub fn modify_call_order(
        &mut self,
        id: CallOrderId,
        f: impl FnOnce(&mut CallOrder),
    ) -> Result<()> {
        let mut row = self
            .call_orders
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.put_call_order(id, Some(row));
        self.record(UndoEntry::CallOrder {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// Remove a call order under undo.
    pub fn remove_call_order(&mut self, id: CallOrderId) -> Result<()> {
        let prior = self
            .put_call_order(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::CallOrder {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All call orders in id order.
    pub fn call_orders(&self) -> impl Iterator<Item = &CallOrder> {
        self.call_orders.values()
    }

    // ---------------------------------------------------------------------
    // Force settlements
    // ---------------------------------------------------------------------

    fn put_settlement(
        &mut self,
        id: SettlementId,
        row: Option<ForceSettlement>,
    ) -> Option<ForceSettlement> {
        match row {
            Some(row) => {
                let key = (row.settlement_asset_id(), row.settlement_date, id);
                let old = self.settlements.insert(id, row);
                if let Some(o) = &old {
                    self.settlement_by_expiration.remove(&(
                        o.settlement_asset_id(),
                        o.settlement_date,
                        id,
                    ));
                }
                self.settlement_by_expiration.insert(key);
                old
            }
            None => {
                let old = self.settlements.remove(id);
                if let Some(o) = &old {
                    self.settlement_by_expiration.remove(&(
                        o.settlement_asset_id(),
                        o.settlement_date,
                        id,
                    ));
                }
                old
            }
        }
    }

    /// Create a forced settlement request.
    pub fn create_settlement(
        &mut self,
        build: impl FnOnce(SettlementId) -> ForceSettlement,
    ) -> SettlementId {
        let prior_next = self.settlements.next_instance();
        let id = self.settlements.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_settlement(id, Some(row));
        self.record(UndoEntry::Settlement {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Settlement by id.
    pub fn settlement(&self, id: SettlementId) -> Result<&ForceSettlement> {
        self.settlements
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Settlement by id, if it still exists.
    pub fn find_settlement(&self, id: SettlementId) -> Option<&ForceSettlement> {
        self.settlements.get(id)
    }

    /// Mutate a settlement under undo.
    pub fn modify_settlement(
        &mut self,
        id: SettlementId,
        f: impl FnOnce(&mut ForceSettlement),
    ) -> Result<()> {
        let mut row = self
            .settlements
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.put_settlement(id, Some(row));
        self.record(UndoEntry::Settlement {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// Remove a settlement under undo.
    pub fn remove_settlement(&mut self, id: SettlementId) -> Result<()> {
        let prior = self
            .put_settlement(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::Settlement {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All settlements in id order.
    pub fn settlements(&self) -> impl Iterator<Item = &ForceSettlement> {
        self.settlements.values()
    }

    // ---------------------------------------------------------------------
    // Proposals
    // ---------------------------------------------------------------------

    fn put_proposal(&mut self, id: ProposalId, row: Option<Proposal>) -> Option<Proposal> {
        match row {
            Some(row) => {
                let key = (row.expiration_time, id);
                let old = self.proposals.insert(id, row);
                if let Some(o) = &old {
                    self.proposal_by_expiration.remove(&(o.expiration_time, id));
                }
                self.proposal_by_expiration.insert(key);
                old
            }
            None => {
                let old = self.proposals.remove(id);
                if let Some(o) = &old {
                    self.proposal_by_expiration.remove(&(o.expiration_time, id));
                }
                old
            }
        }
    }

    /// Create a proposal.
    pub fn create_proposal(&mut self, build: impl FnOnce(ProposalId) -> Proposal) -> ProposalId {
        let prior_next = self.proposals.next_instance();
        let id = self.proposals.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_proposal(id, Some(row));
        self.record(UndoEntry::Proposal {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Proposal by id.
    pub fn proposal(&self, id: ProposalId) -> Result<&Proposal> {
        self.proposals
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Remove a proposal under undo.
    pub fn remove_proposal(&mut self, id: ProposalId) -> Result<()> {
        let prior = self
            .put_proposal(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::Proposal {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All proposals in id order.
    pub fn proposals(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.values()
    }

    // ---------------------------------------------------------------------
    // Dedupe records
    // ---------------------------------------------------------------------

    fn put_dedupe(&mut self, id: DedupeId, row: Option<DedupeRecord>) -> Option<DedupeRecord> {
        match row {
            Some(row) => {
                let exp_key = (row.expiration, id);
                let trx_id = row.trx_id;
                let old = self.dedupe_records.insert(id, row);
                if let Some(o) = &old {
                    self.dedupe_by_expiration.remove(&(o.expiration, id));
                    self.dedupe_by_trx.remove(&o.trx_id);
                }
                self.dedupe_by_expiration.insert(exp_key);
                self.dedupe_by_trx.insert(trx_id, id);
                old
            }
            None => {
                let old = self.dedupe_records.remove(id);
                if let Some(o) = &old {
                    self.dedupe_by_expiration.remove(&(o.expiration, id));
                    self.dedupe_by_trx.remove(&o.trx_id);
                }
                old
            }
        }
    }

    /// Record an included transaction for duplicate detection.
    pub fn create_dedupe_record(
        &mut self,
        build: impl FnOnce(DedupeId) -> DedupeRecord,
    ) -> DedupeId {
        let prior_next = self.dedupe_records.next_instance();
        let id = self.dedupe_records.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_dedupe(id, Some(row));
        self.record(UndoEntry::Dedupe {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Look up an included transaction by digest.
    pub fn find_transaction(&self, trx_id: &[u8; 32]) -> Option<&DedupeRecord> {
        self.dedupe_by_trx
            .get(trx_id)
            .and_then(|id| self.dedupe_records.get(*id))
    }

    /// Remove a dedupe record under undo.
    pub fn remove_dedupe_record(&mut self, id: DedupeId) -> Result<()> {
        let prior = self
            .put_dedupe(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::Dedupe {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All dedupe records in id order.
    pub fn dedupe_records(&self) -> impl Iterator<Item = &DedupeRecord> {
        self.dedupe_records.values()
    }

    // ---------------------------------------------------------------------
    // Withdraw permissions
    // ---------------------------------------------------------------------

    fn put_withdraw_permission(
        &mut self,
        id: WithdrawPermissionId,
        row: Option<WithdrawPermission>,
    ) -> Option<WithdrawPermission> {
        match row {
            Some(row) => {
                let key = (row.expiration, id);
                let old = self.withdraw_permissions.insert(id, row);
                if let Some(o) = &old {
                    self.withdraw_by_expiration.remove(&(o.expiration, id));
                }
                self.withdraw_by_expiration.insert(key);
                old
            }
            None => {
                let old = self.withdraw_permissions.remove(id);
                if let Some(o) = &old {
                    self.withdraw_by_expiration.remove(&(o.expiration, id));
                }
                old
            }
        }
    }

    /// Create a withdraw permission.
    pub fn create_withdraw_permission(
        &mut self,
        build: impl FnOnce(WithdrawPermissionId) -> WithdrawPermission,
    ) -> WithdrawPermissionId {
        let prior_next = self.withdraw_permissions.next_instance();
        let id = self.withdraw_permissions.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_withdraw_permission(id, Some(row));
        self.record(UndoEntry::WithdrawPermission {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Remove a withdraw permission under undo.
    pub fn remove_withdraw_permission(&mut self, id: WithdrawPermissionId) -> Result<()> {
        let prior = self
            .put_withdraw_permission(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::WithdrawPermission {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All withdraw permissions in id order.
    pub fn withdraw_permissions(&self) -> impl Iterator<Item = &WithdrawPermission> {
        self.withdraw_permissions.values()
    }

    // ---------------------------------------------------------------------
    // HTLCs
    // ---------------------------------------------------------------------

    fn put_htlc(&mut self, id: HtlcId, row: Option<Htlc>) -> Option<Htlc> {
        match row {
            Some(row) => {
                let key = (row.expiration, id);
                let old = self.htlcs.insert(id, row);
                if let Some(o) = &old {
                    self.htlc_by_expiration.remove(&(o.expiration, id));
                }
                self.htlc_by_expiration.insert(key);
                old
            }
            None => {
                let old = self.htlcs.remove(id);
                if let Some(o) = &old {
                    self.htlc_by_expiration.remove(&(o.expiration, id));
                }
                old
            }
        }
    }

    /// Create an HTLC.
    pub fn create_htlc(&mut self, build: impl FnOnce(HtlcId) -> Htlc) -> HtlcId {
        let prior_next = self.htlcs.next_instance();
        let id = self.htlcs.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_htlc(id, Some(row));
        self.record(UndoEntry::Htlc {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// HTLC by id.
    pub fn htlc(&self, id: HtlcId) -> Result<&Htlc> {
        self.htlcs
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Remove an HTLC under undo.
    pub fn remove_htlc(&mut self, id: HtlcId) -> Result<()> {
        let prior = self
            .put_htlc(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::Htlc {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All HTLCs in id order.
    pub fn htlcs(&self) -> impl Iterator<Item = &Htlc> {
        self.htlcs.values()
    }

    // ---------------------------------------------------------------------
    // Tickets
    // ---------------------------------------------------------------------

    fn put_ticket(&mut self, id: TicketId, row: Option<Ticket>) -> Option<Ticket> {
        match row {
            Some(row) => {
                let key = (row.next_auto_update_time, id);
                let old = self.tickets.insert(id, row);
                if let Some(o) = &old {
                    self.ticket_by_next_update.remove(&(o.next_auto_update_time, id));
                }
                self.ticket_by_next_update.insert(key);
                old
            }
            None => {
                let old = self.tickets.remove(id);
                if let Some(o) = &old {
                    self.ticket_by_next_update.remove(&(o.next_auto_update_time, id));
                }
                old
            }
        }
    }

    /// Create a stake ticket.
    pub fn create_ticket(&mut self, build: impl FnOnce(TicketId) -> Ticket) -> TicketId {
        let prior_next = self.tickets.next_instance();
        let id = self.tickets.allocate();
        let mut row = build(id);
        row.id = id;
        self.put_ticket(id, Some(row));
        self.record(UndoEntry::Ticket {
            id,
            prior: None,
            prior_next: Some(prior_next),
        });
        id
    }

    /// Ticket by id.
    pub fn ticket(&self, id: TicketId) -> Result<&Ticket> {
        self.tickets
            .get(id)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))
    }

    /// Mutate a ticket under undo, refreshing `by_next_update`.
    pub fn modify_ticket(&mut self, id: TicketId, f: impl FnOnce(&mut Ticket)) -> Result<()> {
        let mut row = self
            .tickets
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        let prior = row.clone();
        f(&mut row);
        row.id = id;
        self.put_ticket(id, Some(row));
        self.record(UndoEntry::Ticket {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// Remove a ticket under undo.
    pub fn remove_ticket(&mut self, id: TicketId) -> Result<()> {
        let prior = self
            .put_ticket(id, None)
            .ok_or_else(|| Error::ObjectNotFound(id.to_string()))?;
        self.record(UndoEntry::Ticket {
            id,
            prior: Some(prior),
            prior_next: None,
        });
        Ok(())
    }

    /// All tickets in id order.
    pub fn tickets(&self) -> impl Iterator<Item = &Ticket> {
        self.tickets.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweepers::NullProposalExecutor;
    use chain_protocol::Asset;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn limit_order(id: LimitOrderId, expiration: DateTime<Utc>) -> LimitOrder {
        LimitOrder {
            id,
            seller: AccountId(1),
            for_sale: 100,
            sell_price: Price {
                base: Asset::new(100, AssetId(1)),
                quote: Asset::new(100, AssetId::CORE),
            },
            expiration,
        }
    }

    #[test]
    fn test_undo_create_reuses_id() {
        let mut db = Database::new(Config::default());

        let session = db.start_undo_session();
        let id1 = db.create_limit_order(|id| limit_order(id, t(100)));
        db.undo_session(session);
        assert!(db.find_limit_order(id1).is_none());
        assert!(db.limit_order_by_expiration.is_empty());

        let session = db.start_undo_session();
        let id2 = db.create_limit_order(|id| limit_order(id, t(100)));
        db.commit_undo_session(session);
        assert_eq!(id1, id2);
    }

    #[test]
    fn test_undo_modify_restores_row_and_index() {
        let mut db = Database::new(Config::default());
        let id = db.create_limit_order(|id| limit_order(id, t(100)));

        let session = db.start_undo_session();
        db.modify_limit_order(id, |o| o.expiration = t(500)).unwrap();
        assert!(db.limit_order_by_expiration.contains(&(t(500), id)));
        db.undo_session(session);

        assert_eq!(db.limit_order(id).unwrap().expiration, t(100));
        assert!(db.limit_order_by_expiration.contains(&(t(100), id)));
        assert!(!db.limit_order_by_expiration.contains(&(t(500), id)));
    }

    #[test]
    fn test_inner_session_merges_into_parent() {
        let mut db = Database::new(Config::default());

        let outer = db.start_undo_session();
        let inner = db.start_undo_session();
        let id = db.create_limit_order(|id| limit_order(id, t(100)));
        db.commit_undo_session(inner);
        // the merged create must still roll back with the outer session
        db.undo_session(outer);
        assert!(db.find_limit_order(id).is_none());
    }

    #[test]
    fn test_balance_adjust_and_undo() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        db.adjust_balance(alice, Asset::new(50, AssetId::CORE)).unwrap();

        let session = db.start_undo_session();
        db.adjust_balance(alice, Asset::new(25, AssetId::CORE)).unwrap();
        assert_eq!(db.get_balance(alice, AssetId::CORE).amount, 75);
        db.undo_session(session);
        assert_eq!(db.get_balance(alice, AssetId::CORE).amount, 50);

        assert!(db
            .adjust_balance(alice, Asset::new(-60, AssetId::CORE))
            .is_err());
    }

    #[test]
    fn test_failed_block_rolls_back_everything() {
        let mut db = Database::new(Config::default());
        // no witness exists, so applying a block fails mid-cycle
        let block = Block {
            number: 1,
            previous: Default::default(),
            timestamp: t(5),
            witness: WitnessId(42),
        };
        let before = db.dynamic_global_properties().clone();
        let err = db.apply_block_updates(&block, 0, &mut NullProposalExecutor);
        assert!(err.is_err());
        let after = db.dynamic_global_properties();
        assert_eq!(before.head_block_number, after.head_block_number);
        assert_eq!(before.current_aslot, after.current_aslot);
    }

    #[test]
    fn test_dedupe_lookup_by_digest() {
        let mut db = Database::new(Config::default());
        let digest = [7u8; 32];
        db.create_dedupe_record(|id| DedupeRecord {
            id,
            trx_id: digest,
            expiration: t(100),
        });
        assert!(db.find_transaction(&digest).is_some());
        assert!(db.find_transaction(&[8u8; 32]).is_none());
    }
}

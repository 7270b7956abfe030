//! Expiration sweepers
//!
//! Each sweeper drains the front of its `by_expiration` ordering while the
//! front entry is due at the head block time, reseeking after every
//! removal. Proposal execution is delegated through [`ProposalExecutor`];
//! a failing proposal is logged and removed, never aborting the block.

use crate::database::Database;
use crate::error::Result;
use crate::objects::{Proposal, VirtualOperation};

/// Seam through which expired, fully-approved proposals are executed.
///
/// Transaction execution lives outside this core; implementations apply
/// the proposed transaction to the database and report success or failure.
pub trait ProposalExecutor {
    /// Apply the proposed transaction.
    fn execute(&mut self, db: &mut Database, proposal: &Proposal) -> Result<()>;
}

/// Executor that accepts every authorized proposal without applying
/// anything; useful for tests and replay tooling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProposalExecutor;

impl ProposalExecutor for NullProposalExecutor {
    fn execute(&mut self, _db: &mut Database, _proposal: &Proposal) -> Result<()> {
        Ok(())
    }
}

impl Database {
    /// Drop dedupe records of transactions that expired strictly before
    /// the head block time.
    ///
    /// Records must outlive their expiration by the forking window; callers
    /// guarantee that by writing records only at inclusion time.
    pub fn clear_expired_transactions(&mut self) -> Result<()> {
        let head_time = self.head_block_time();
        loop {
            let front = self.dedupe_by_expiration.iter().next().copied();
            let Some((expiration, id)) = front else { break };
            if head_time <= expiration {
                break;
            }
            self.remove_dedupe_record(id)?;
        }
        Ok(())
    }

    /// Execute or drop every proposal whose expiration has passed.
    ///
    /// Authorized proposals are pushed through the executor; a failure is
    /// logged and swallowed. The proposal is removed either way.
    pub fn clear_expired_proposals(&mut self, executor: &mut dyn ProposalExecutor) -> Result<()> {
        let head_time = self.head_block_time();
        loop {
            let front = self.proposal_by_expiration.iter().next().copied();
            let Some((expiration, id)) = front else { break };
            if expiration > head_time {
                break;
            }
            let proposal = self.proposal(id)?.clone();
            if proposal.is_authorized_to_execute() {
                if let Err(e) = executor.execute(self, &proposal) {
                    tracing::error!(
                        "Failed to apply proposed transaction {} on its expiration. \
                         Deleting it. Error: {}",
                        id,
                        e
                    );
                }
            }
            self.remove_proposal(id)?;
        }
        Ok(())
    }

    /// Remove every withdraw permission whose expiration has passed.
    pub fn update_withdraw_permissions(&mut self) -> Result<()> {
        let head_time = self.head_block_time();
        loop {
            let front = self.withdraw_by_expiration.iter().next().copied();
            let Some((expiration, id)) = front else { break };
            if expiration > head_time {
                break;
            }
            self.remove_withdraw_permission(id)?;
        }
        Ok(())
    }

    /// Refund and remove every HTLC whose time lock has expired.
    pub fn clear_expired_htlcs(&mut self) -> Result<()> {
        let head_time = self.head_block_time();
        loop {
            let front = self.htlc_by_expiration.iter().next().copied();
            let Some((expiration, id)) = front else { break };
            if expiration > head_time {
                break;
            }
            let htlc = self.htlc(id)?.clone();
            self.adjust_balance(htlc.from, htlc.amount)?;
            self.push_applied_operation(VirtualOperation::HtlcRefund {
                htlc: id,
                from: htlc.from,
                to: htlc.to,
                amount: htlc.amount,
                preimage_hash: htlc.preimage_hash,
                preimage_size: htlc.preimage_size,
            });
            self.remove_htlc(id)?;
            if let Some(m) = &self.metrics {
                m.htlc_refunds_total.inc();
            }
        }
        Ok(())
    }
}

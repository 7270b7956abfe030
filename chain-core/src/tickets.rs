//! Stake ticket processing
//!
//! Tickets lock core-asset stake for voting weight. A ticket charges
//! toward its target lock in stages, sits stable once it arrives, and
//! unwinds stage by stage when withdrawing. Forever-locked tickets decay
//! in value until their stake counts as inactive. The sweep keeps the
//! per-account aggregates and the chain-wide totals in lockstep.

use crate::database::Database;
use crate::error::Result;
use chain_protocol::{AccountId, Asset, TicketId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Seconds between charging stages
const CHARGING_STEP_SECS: i64 = 15 * 86_400;

/// Seconds between withdrawal stages and forever-lock decay steps
const DOWNGRADE_PERIOD_SECS: i64 = 180 * 86_400;

/// Lock state a ticket can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketType {
    /// Unlocked
    Liquid,
    /// Locked for 180 days
    Lock180,
    /// Locked for 360 days
    Lock360,
    /// Locked for 720 days
    Lock720,
    /// Locked forever
    LockForever,
}

impl TicketType {
    /// Voting weight per unit of stake at this lock.
    pub fn value_multiplier(self) -> i64 {
        match self {
            TicketType::Liquid => 1,
            TicketType::Lock180 => 2,
            TicketType::Lock360 => 4,
            TicketType::Lock720 => 8,
            TicketType::LockForever => 8,
        }
    }

    fn upgraded(self) -> Self {
        match self {
            TicketType::Liquid => TicketType::Lock180,
            TicketType::Lock180 => TicketType::Lock360,
            TicketType::Lock360 => TicketType::Lock720,
            TicketType::Lock720 | TicketType::LockForever => TicketType::LockForever,
        }
    }

    fn downgraded(self) -> Self {
        match self {
            TicketType::Liquid | TicketType::Lock180 => TicketType::Liquid,
            TicketType::Lock360 => TicketType::Lock180,
            TicketType::Lock720 => TicketType::Lock360,
            // a forever lock never unwinds
            TicketType::LockForever => TicketType::LockForever,
        }
    }
}

/// Lifecycle phase of a ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    /// Moving up toward the target lock
    Charging,
    /// Arrived at the target lock
    Stable,
    /// Unwinding toward liquid
    Withdrawing,
}

/// A stake ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Ticket id
    pub id: TicketId,
    /// Staking account
    pub account: AccountId,
    /// Staked amount, in the core asset
    pub amount: Asset,
    /// Lock the ticket currently sits at
    pub current_type: TicketType,
    /// Lock the ticket is heading for
    pub target_type: TicketType,
    /// Lifecycle phase
    pub status: TicketStatus,
    /// Voting weight contributed by this ticket
    pub value: i64,
    /// Time of the next automatic transition; index key of
    /// `by_next_update`
    pub next_auto_update_time: DateTime<Utc>,
}

impl Ticket {
    /// Advance the ticket one lifecycle step.
    ///
    /// Charging moves one stage toward the target and goes stable on
    /// arrival. Stable forever-locks halve their value each period until
    /// it reaches zero. Withdrawing moves one stage down; the final
    /// release of a liquid, withdrawing ticket is the sweep's job, not
    /// ours.
    pub fn auto_update(&mut self) {
        match self.status {
            TicketStatus::Charging => {
                self.current_type = self.current_type.upgraded();
                if self.current_type >= self.target_type {
                    self.current_type = self.target_type;
                    self.status = TicketStatus::Stable;
                    self.value = self.amount.amount * self.current_type.value_multiplier();
                    self.next_auto_update_time = if self.current_type == TicketType::LockForever {
                        self.next_auto_update_time + Duration::seconds(DOWNGRADE_PERIOD_SECS)
                    } else {
                        DateTime::<Utc>::MAX_UTC
                    };
                } else {
                    self.value = self.amount.amount * self.current_type.value_multiplier();
                    self.next_auto_update_time += Duration::seconds(CHARGING_STEP_SECS);
                }
            }
            TicketStatus::Stable => {
                if self.current_type == TicketType::LockForever {
                    self.value /= 2;
                    self.next_auto_update_time = if self.value == 0 {
                        DateTime::<Utc>::MAX_UTC
                    } else {
                        self.next_auto_update_time + Duration::seconds(DOWNGRADE_PERIOD_SECS)
                    };
                } else {
                    self.next_auto_update_time = DateTime::<Utc>::MAX_UTC;
                }
            }
            TicketStatus::Withdrawing => {
                self.current_type = self.current_type.downgraded();
                self.value = self.amount.amount * self.current_type.value_multiplier();
                self.next_auto_update_time += Duration::seconds(DOWNGRADE_PERIOD_SECS);
            }
        }
    }
}

/// Ids touched by one ticket sweep
#[derive(Debug, Clone, Default)]
pub struct TicketSweepResult {
    /// Tickets whose lifecycle advanced
    pub updated: BTreeSet<TicketId>,
    /// Tickets released and removed
    pub removed: BTreeSet<TicketId>,
}

impl Database {
    /// Advance every ticket whose update time has arrived.
    ///
    /// Withdrawing tickets that reached liquid return their stake to the
    /// owner and disappear. All other due tickets advance one lifecycle
    /// step, and the per-account aggregates move with them; chain-wide
    /// pool-of-burn and inactive totals are written back to the dynamic
    /// global properties once at the end.
    pub fn process_tickets(&mut self) -> Result<TicketSweepResult> {
        let head_time = self.head_block_time();
        let mut result = TicketSweepResult::default();
        let mut total_delta_pob: i64 = 0;
        let mut total_delta_inactive: i64 = 0;

        loop {
            let front = self.ticket_by_next_update.iter().next().copied();
            let Some((next_update, id)) = front else { break };
            if next_update > head_time {
                break;
            }
            let ticket = self.ticket(id)?.clone();

            if ticket.status == TicketStatus::Withdrawing
                && ticket.current_type == TicketType::Liquid
            {
                self.adjust_balance(ticket.account, ticket.amount)?;
                self.modify_account_statistics(ticket.account, |s| {
                    s.total_core_pol -= ticket.amount.amount;
                    s.total_pol_value -= ticket.value;
                });
                result.removed.insert(id);
                self.remove_ticket(id)?;
            } else {
                let old_type = ticket.current_type;
                let old_value = ticket.value;
                self.modify_ticket(id, |t| t.auto_update())?;
                result.updated.insert(id);
                let ticket = self.ticket(id)?.clone();

                let mut delta_inactive_amount: i64 = 0;
                let mut delta_forever_amount: i64 = 0;
                let mut delta_forever_value: i64 = 0;
                let mut delta_other_amount: i64 = 0;
                let mut delta_other_value: i64 = 0;

                if old_type == TicketType::LockForever {
                    // the new type is lock-forever too
                    if ticket.value == 0 {
                        total_delta_pob -= ticket.amount.amount;
                        total_delta_inactive += ticket.amount.amount;
                        delta_inactive_amount = ticket.amount.amount;
                        delta_forever_amount = -ticket.amount.amount;
                    }
                    delta_forever_value = ticket.value - old_value;
                } else if ticket.current_type == TicketType::LockForever {
                    total_delta_pob += ticket.amount.amount;
                    delta_forever_amount = ticket.amount.amount;
                    delta_forever_value = ticket.value;
                    delta_other_amount = -ticket.amount.amount;
                    delta_other_value = -old_value;
                } else {
                    delta_other_value = ticket.value - old_value;
                }

                self.modify_account_statistics(ticket.account, |s| {
                    s.total_core_inactive += delta_inactive_amount;
                    s.total_core_pob += delta_forever_amount;
                    s.total_core_pol += delta_other_amount;
                    s.total_pob_value += delta_forever_value;
                    s.total_pol_value += delta_other_value;
                });
            }
        }

        if total_delta_pob != 0 || total_delta_inactive != 0 {
            self.modify_dgp(|dgp| {
                dgp.total_pob += total_delta_pob;
                dgp.total_inactive += total_delta_inactive;
            });
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chain_protocol::AssetId;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn make_ticket(
        db: &mut Database,
        account: AccountId,
        amount: i64,
        current: TicketType,
        target: TicketType,
        status: TicketStatus,
        value: i64,
        next: DateTime<Utc>,
    ) -> TicketId {
        db.create_ticket(|id| Ticket {
            id,
            account,
            amount: Asset::new(amount, AssetId::CORE),
            current_type: current,
            target_type: target,
            status,
            value,
            next_auto_update_time: next,
        })
    }

    #[test]
    fn test_charging_reaches_target_and_stabilizes() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        let id = make_ticket(
            &mut db,
            alice,
            100,
            TicketType::Liquid,
            TicketType::Lock180,
            TicketStatus::Charging,
            100,
            t(50),
        );
        db.modify_account_statistics(alice, |s| {
            s.total_core_pol = 100;
            s.total_pol_value = 100;
        });
        db.modify_dgp(|dgp| dgp.time = t(50));

        let result = db.process_tickets().unwrap();
        assert!(result.updated.contains(&id));

        let ticket = db.ticket(id).unwrap();
        assert_eq!(ticket.current_type, TicketType::Lock180);
        assert_eq!(ticket.status, TicketStatus::Stable);
        assert_eq!(ticket.value, 200);
        assert_eq!(ticket.next_auto_update_time, DateTime::<Utc>::MAX_UTC);

        let stats = db.account_statistics(alice).unwrap();
        assert_eq!(stats.total_core_pol, 100);
        assert_eq!(stats.total_pol_value, 200);
    }

    #[test]
    fn test_withdrawing_liquid_ticket_is_released() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        let id = make_ticket(
            &mut db,
            alice,
            100,
            TicketType::Liquid,
            TicketType::Liquid,
            TicketStatus::Withdrawing,
            100,
            t(50),
        );
        db.modify_account_statistics(alice, |s| {
            s.total_core_pol = 100;
            s.total_pol_value = 100;
        });
        db.modify_dgp(|dgp| dgp.time = t(50));

        let result = db.process_tickets().unwrap();
        assert!(result.removed.contains(&id));
        assert!(db.tickets().count() == 0);
        assert_eq!(db.get_balance(alice, AssetId::CORE).amount, 100);

        let stats = db.account_statistics(alice).unwrap();
        assert_eq!(stats.total_core_pol, 0);
        assert_eq!(stats.total_pol_value, 0);
    }

    #[test]
    fn test_withdrawal_steps_down_then_releases() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        let id = make_ticket(
            &mut db,
            alice,
            100,
            TicketType::Lock180,
            TicketType::Liquid,
            TicketStatus::Withdrawing,
            200,
            t(50),
        );
        db.modify_account_statistics(alice, |s| {
            s.total_core_pol = 100;
            s.total_pol_value = 200;
        });

        // first pass steps the ticket down to liquid
        db.modify_dgp(|dgp| dgp.time = t(50));
        db.process_tickets().unwrap();
        let ticket = db.ticket(id).unwrap();
        assert_eq!(ticket.current_type, TicketType::Liquid);
        assert_eq!(ticket.value, 100);
        assert_eq!(
            db.account_statistics(alice).unwrap().total_pol_value,
            100
        );

        // the second pass, one downgrade period later, releases the stake
        db.modify_dgp(|dgp| dgp.time = t(50 + DOWNGRADE_PERIOD_SECS));
        let result = db.process_tickets().unwrap();
        assert!(result.removed.contains(&id));
        assert_eq!(db.get_balance(alice, AssetId::CORE).amount, 100);
        let stats = db.account_statistics(alice).unwrap();
        assert_eq!(stats.total_core_pol, 0);
        assert_eq!(stats.total_pol_value, 0);
    }

    #[test]
    fn test_charging_into_forever_moves_pol_to_pob() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        make_ticket(
            &mut db,
            alice,
            100,
            TicketType::Lock720,
            TicketType::LockForever,
            TicketStatus::Charging,
            800,
            t(50),
        );
        db.modify_account_statistics(alice, |s| {
            s.total_core_pol = 100;
            s.total_pol_value = 800;
        });
        db.modify_dgp(|dgp| dgp.time = t(50));

        db.process_tickets().unwrap();

        let stats = db.account_statistics(alice).unwrap();
        assert_eq!(stats.total_core_pol, 0);
        assert_eq!(stats.total_pol_value, 0);
        assert_eq!(stats.total_core_pob, 100);
        assert_eq!(stats.total_pob_value, 800);
        assert_eq!(db.dynamic_global_properties().total_pob, 100);
    }

    #[test]
    fn test_forever_ticket_decays_to_inactive() {
        let mut db = Database::new(Config::default());
        let alice = AccountId(1);
        let id = make_ticket(
            &mut db,
            alice,
            100,
            TicketType::LockForever,
            TicketType::LockForever,
            TicketStatus::Stable,
            1,
            t(50),
        );
        db.modify_account_statistics(alice, |s| {
            s.total_core_pob = 100;
            s.total_pob_value = 1;
        });
        db.modify_dgp(|dgp| {
            dgp.time = t(50);
            dgp.total_pob = 100;
        });

        db.process_tickets().unwrap();

        // the ticket lost all value: its stake moves from pob to inactive,
        // but the ticket itself is kept
        let ticket = db.ticket(id).unwrap();
        assert_eq!(ticket.value, 0);
        let stats = db.account_statistics(alice).unwrap();
        assert_eq!(stats.total_core_pob, 0);
        assert_eq!(stats.total_core_inactive, 100);
        assert_eq!(stats.total_pob_value, 0);
        let dgp = db.dynamic_global_properties();
        assert_eq!(dgp.total_pob, 0);
        assert_eq!(dgp.total_inactive, 100);
    }

    #[test]
    fn test_global_totals_match_account_sums() {
        let mut db = Database::new(Config::default());
        for i in 0..4u64 {
            make_ticket(
                &mut db,
                AccountId(i),
                50 + i as i64,
                TicketType::Lock720,
                TicketType::LockForever,
                TicketStatus::Charging,
                8 * (50 + i as i64),
                t(10 + i as i64),
            );
        }
        make_ticket(
            &mut db,
            AccountId(9),
            100,
            TicketType::LockForever,
            TicketType::LockForever,
            TicketStatus::Stable,
            1,
            t(20),
        );
        db.modify_dgp(|dgp| {
            dgp.time = t(100);
            dgp.total_pob = 100;
        });
        db.modify_account_statistics(AccountId(9), |s| {
            s.total_core_pob = 100;
            s.total_pob_value = 1;
        });

        db.process_tickets().unwrap();

        let dgp = db.dynamic_global_properties();
        let pob_sum: i64 = db.all_account_statistics().map(|s| s.total_core_pob).sum();
        let inactive_sum: i64 = db
            .all_account_statistics()
            .map(|s| s.total_core_inactive)
            .sum();
        assert_eq!(dgp.total_pob, pob_sum);
        assert_eq!(dgp.total_inactive, inactive_sum);
    }
}

//! Dynamic global state maintenance
//!
//! Applied on every accepted block: head bookkeeping, the recent-slot
//! bitmap, witness rotation accounting, signing-witness pay, and the
//! irreversibility computation.

use crate::database::Database;
use crate::error::{Error, Result};
use chain_protocol::constants::{
    PERCENT_100, RECENTLY_MISSED_COUNT_DECREMENT, RECENTLY_MISSED_COUNT_INCREMENT,
};
use chain_protocol::{Block, WitnessId};
use chrono::{DateTime, Utc};

impl Database {
    /// Update the dynamic global properties for an accepted block with
    /// `missed_blocks` empty slots before it.
    pub fn update_global_dynamic_data(&mut self, block: &Block, missed_blocks: u32) -> Result<()> {
        let block_num = block.block_num();
        let at_or_below_checkpoint = self
            .config()
            .last_checkpoint()
            .is_some_and(|cp| cp >= block_num);

        self.modify_dgp(|dgp| {
            if block_num == 1 {
                dgp.recently_missed_count = 0;
            } else if at_or_below_checkpoint {
                dgp.recently_missed_count = 0;
            } else if missed_blocks > 0 {
                dgp.recently_missed_count += RECENTLY_MISSED_COUNT_INCREMENT * missed_blocks;
            } else if dgp.recently_missed_count > RECENTLY_MISSED_COUNT_INCREMENT {
                dgp.recently_missed_count -= RECENTLY_MISSED_COUNT_DECREMENT;
            } else if dgp.recently_missed_count > 0 {
                dgp.recently_missed_count -= 1;
            }

            dgp.head_block_number = block_num;
            dgp.head_block_id = block.id();
            dgp.time = block.timestamp;
            dgp.current_witness = block.witness;
            dgp.recent_slots_filled = shift_slot_bitmap(dgp.recent_slots_filled, missed_blocks);
            dgp.current_aslot += missed_blocks as u64 + 1;
        });

        let dgp = self.dynamic_global_properties();
        let head = dgp.head_block_number;
        let irreversible = dgp.last_irreversible_block_num;
        let max = self.global_properties().parameters.max_undo_history;
        if !self.config().skip_undo_history_check && head - irreversible >= max as u64 {
            return Err(Error::UndoHistoryExceeded {
                head,
                irreversible,
                max,
            });
        }

        self.set_undo_window(head - irreversible + 1);
        Ok(())
    }

    /// Absolute time of the given future slot. Slot 0 is the head block's
    /// own slot and maps to the epoch sentinel.
    pub fn get_slot_time(&self, slot_num: u64) -> DateTime<Utc> {
        if slot_num == 0 {
            return DateTime::UNIX_EPOCH;
        }
        let interval = self.global_properties().parameters.block_interval_sec as i64;
        let dgp = self.dynamic_global_properties();

        if dgp.head_block_number == 0 {
            // genesis: the first block may be produced at any slot boundary
            // after the recorded genesis time
            return dgp.time + chrono::Duration::seconds(slot_num as i64 * interval);
        }

        let head_abs_slot = dgp.time.timestamp() / interval;
        let head_slot_time =
            DateTime::UNIX_EPOCH + chrono::Duration::seconds(head_abs_slot * interval);
        head_slot_time + chrono::Duration::seconds(slot_num as i64 * interval)
    }

    /// Number of the first slot at or after `when`, counted from the head
    /// block; zero when `when` precedes the next slot.
    pub fn get_slot_at_time(&self, when: DateTime<Utc>) -> u64 {
        let first_slot_time = self.get_slot_time(1);
        if when < first_slot_time {
            return 0;
        }
        let interval = self.global_properties().parameters.block_interval_sec as i64;
        ((when - first_slot_time).num_seconds() / interval) as u64 + 1
    }

    /// Pay and stamp the witness that signed the block.
    pub fn update_signing_witness(&mut self, witness_id: WitnessId, block: &Block) -> Result<()> {
        let new_block_aslot = self.dynamic_global_properties().current_aslot
            + self.get_slot_at_time(block.timestamp);

        let witness_pay = self
            .global_properties()
            .parameters
            .witness_pay_per_block
            .min(self.dynamic_global_properties().witness_budget);

        // fail before touching state if the witness is unknown
        self.witness(witness_id)?;

        self.modify_dgp(|dgp| {
            dgp.witness_budget -= witness_pay;
        });

        let block_num = block.block_num();
        self.modify_witness(witness_id, |w| {
            w.pay_balance += witness_pay;
            w.last_aslot = new_block_aslot;
            w.last_confirmed_block_num = block_num;
        })?;

        Ok(())
    }

    /// Advance the last irreversible block number.
    ///
    /// Takes each active witness's last confirmed block number and selects
    /// the order statistic at `(100% - threshold) * N / 100%`; the stored
    /// value only ever moves forward.
    pub fn update_last_irreversible_block(&mut self) -> Result<()> {
        let active = self.global_properties().active_witnesses.clone();
        if active.is_empty() {
            return Ok(());
        }

        let mut confirmed: Vec<u64> = Vec::with_capacity(active.len());
        for witness_id in &active {
            confirmed.push(self.witness(*witness_id)?.last_confirmed_block_num);
        }

        let threshold = self.global_properties().parameters.irreversible_threshold;
        let offset = (PERCENT_100 - threshold) as usize * confirmed.len() / PERCENT_100 as usize;

        let (_, nth, _) = confirmed.select_nth_unstable(offset);
        let new_last_irreversible = *nth;

        if new_last_irreversible > self.dynamic_global_properties().last_irreversible_block_num {
            self.modify_dgp(|dgp| {
                dgp.last_irreversible_block_num = new_last_irreversible;
            });
        }
        Ok(())
    }

    /// Set or clear the maintenance flag in `dynamic_flags`.
    pub fn update_maintenance_flag(&mut self, new_maintenance_flag: bool) {
        self.modify_dgp(|dgp| {
            let flag = crate::objects::DynamicGlobalProperties::MAINTENANCE_FLAG;
            dgp.dynamic_flags =
                (dgp.dynamic_flags & !flag) | if new_maintenance_flag { flag } else { 0 };
        });
    }
}

/// `((old << 1) | 1) << missed`, with a shift past the window clearing it.
fn shift_slot_bitmap(old: u128, missed_blocks: u32) -> u128 {
    let filled = (old << 1) | 1;
    if missed_blocks >= 128 {
        0
    } else {
        filled << missed_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::objects::{GlobalProperties, Witness};
    use chain_protocol::AccountId;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + chrono::Duration::seconds(secs)
    }

    fn db_with_witnesses(n: u64) -> (Database, Vec<WitnessId>) {
        let mut db = Database::new(Config::default());
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(db.create_witness(|id| Witness {
                id,
                witness_account: AccountId(i),
                last_aslot: 0,
                last_confirmed_block_num: 0,
                pay_balance: 0,
            }));
        }
        let mut gp = GlobalProperties::default();
        gp.active_witnesses = ids.clone();
        db.set_global_properties(gp);
        (db, ids)
    }

    fn block(number: u64, timestamp: DateTime<Utc>, witness: WitnessId) -> Block {
        Block {
            number,
            previous: Default::default(),
            timestamp,
            witness,
        }
    }

    #[test]
    fn test_slot_bitmap_no_misses() {
        let (mut db, ids) = db_with_witnesses(1);
        db.modify_dgp(|dgp| dgp.recent_slots_filled = u128::MAX);
        db.update_global_dynamic_data(&block(1, t(5), ids[0]), 0).unwrap();

        let dgp = db.dynamic_global_properties();
        assert_eq!(dgp.recent_slots_filled, (u128::MAX << 1) | 1);
        assert_eq!(dgp.recent_slots_filled & 1, 1);
        assert_eq!(dgp.current_aslot, 1);
    }

    #[test]
    fn test_slot_bitmap_with_misses() {
        let (mut db, ids) = db_with_witnesses(1);
        db.modify_dgp(|dgp| dgp.recent_slots_filled = u128::MAX);
        db.update_global_dynamic_data(&block(2, t(15), ids[0]), 2).unwrap();

        let dgp = db.dynamic_global_properties();
        assert_eq!(dgp.recent_slots_filled, ((u128::MAX << 1) | 1) << 2);
        // the two missed slots read as zero bits
        assert_eq!(dgp.recent_slots_filled & 0b111, 0b100);
        assert_eq!(dgp.current_aslot, 3);
    }

    #[test]
    fn test_popcount_tracks_filled_slots() {
        let (mut db, ids) = db_with_witnesses(1);
        let mut produced = 0u32;
        let mut num = 0;
        for (i, missed) in [0u32, 0, 2, 1, 0, 3, 0].iter().enumerate() {
            num += 1;
            db.update_global_dynamic_data(
                &block(num, t((i as i64 + 1) * 50), ids[0]),
                *missed,
            )
            .unwrap();
            produced += 1;
        }
        let filled = db.dynamic_global_properties().recent_slots_filled;
        assert_eq!(filled.count_ones(), produced);
    }

    #[test]
    fn test_recently_missed_counter() {
        let (mut db, ids) = db_with_witnesses(1);

        // block 1 always resets
        db.update_global_dynamic_data(&block(1, t(5), ids[0]), 3).unwrap();
        assert_eq!(db.dynamic_global_properties().recently_missed_count, 0);

        // misses accumulate at the increment rate
        db.update_global_dynamic_data(&block(2, t(25), ids[0]), 3).unwrap();
        assert_eq!(
            db.dynamic_global_properties().recently_missed_count,
            3 * RECENTLY_MISSED_COUNT_INCREMENT
        );

        // a filled slot decays by the decrement
        db.update_global_dynamic_data(&block(3, t(30), ids[0]), 0).unwrap();
        assert_eq!(
            db.dynamic_global_properties().recently_missed_count,
            3 * RECENTLY_MISSED_COUNT_INCREMENT - RECENTLY_MISSED_COUNT_DECREMENT
        );
    }

    #[test]
    fn test_undo_history_guard() {
        let (mut db, ids) = db_with_witnesses(1);
        db.modify_dgp(|dgp| dgp.head_block_number = 20_000);
        let result = db.update_global_dynamic_data(&block(20_001, t(5), ids[0]), 0);
        assert!(matches!(result, Err(Error::UndoHistoryExceeded { .. })));
    }

    #[test]
    fn test_undo_history_guard_skippable() {
        let mut config = Config::default();
        config.skip_undo_history_check = true;
        let mut db = Database::new(config);
        db.modify_dgp(|dgp| dgp.head_block_number = 20_000);
        let w = db.create_witness(|id| Witness {
            id,
            witness_account: AccountId(0),
            last_aslot: 0,
            last_confirmed_block_num: 0,
            pay_balance: 0,
        });
        db.update_global_dynamic_data(&block(20_001, t(5), w), 0).unwrap();
    }

    #[test]
    fn test_signing_witness_pay_capped_by_budget() {
        let (mut db, ids) = db_with_witnesses(1);
        db.modify_dgp(|dgp| dgp.witness_budget = 300);
        // pay_per_block defaults to 1000, budget only covers 300
        let b = block(1, t(5), ids[0]);
        db.update_global_dynamic_data(&b, 0).unwrap();
        db.update_signing_witness(ids[0], &b).unwrap();

        assert_eq!(db.dynamic_global_properties().witness_budget, 0);
        let w = db.witness(ids[0]).unwrap();
        assert_eq!(w.pay_balance, 300);
        assert_eq!(w.last_confirmed_block_num, 1);
    }

    #[test]
    fn test_irreversibility_order_statistic() {
        // 11 witnesses at [10,10,10,11,11,11,11,11,11,11,11], threshold 70%:
        // offset = floor(0.30 * 11) = 3, element at rank 3 is 11
        let (mut db, ids) = db_with_witnesses(11);
        for (i, id) in ids.iter().enumerate() {
            let confirmed = if i < 3 { 10 } else { 11 };
            db.modify_witness(*id, |w| w.last_confirmed_block_num = confirmed)
                .unwrap();
        }
        db.update_last_irreversible_block().unwrap();
        assert_eq!(
            db.dynamic_global_properties().last_irreversible_block_num,
            11
        );
    }

    #[test]
    fn test_irreversibility_never_regresses() {
        let (mut db, ids) = db_with_witnesses(3);
        db.modify_dgp(|dgp| dgp.last_irreversible_block_num = 50);
        for id in &ids {
            db.modify_witness(*id, |w| w.last_confirmed_block_num = 10).unwrap();
        }
        db.update_last_irreversible_block().unwrap();
        assert_eq!(
            db.dynamic_global_properties().last_irreversible_block_num,
            50
        );
    }

    #[test]
    fn test_maintenance_flag_toggles() {
        let (mut db, _) = db_with_witnesses(1);
        assert!(!db.dynamic_global_properties().maintenance_flag());
        db.update_maintenance_flag(true);
        assert!(db.dynamic_global_properties().maintenance_flag());
        db.update_maintenance_flag(false);
        assert!(!db.dynamic_global_properties().maintenance_flag());
    }

    #[test]
    fn test_slot_time_anchored_to_head() {
        let (mut db, ids) = db_with_witnesses(1);
        db.update_global_dynamic_data(&block(1, t(7), ids[0]), 0).unwrap();
        // head at t=7, interval 5: head slot floor is 5, next slot is 10
        assert_eq!(db.get_slot_time(1), t(10));
        assert_eq!(db.get_slot_at_time(t(10)), 1);
        assert_eq!(db.get_slot_at_time(t(9)), 0);
        assert_eq!(db.get_slot_at_time(t(20)), 3);
    }
}

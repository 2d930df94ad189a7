//! Read-only summary shapes for the RPC boundary. The wire layer re-wraps
//! these; consensus code never depends on them.

use serde::Serialize;

use crate::registry::QpRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct SlotSummary {
    pub slot: u32,
    pub id: u32,
    pub start_time: u32,
    pub end_time: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StakerSummary {
    pub id: u32,
    pub alias: String,
    pub owner: String,
    pub delegate: String,
    pub controller: String,
    pub manager: Option<String>,
    pub delegate_payout_pcm: u32,
    pub enabled: bool,
    pub disqualified: bool,
    pub seniority: u32,
    pub weight: u32,
    pub blocks_produced: u32,
    pub blocks_missed: u32,
    pub missed_in_row: u32,
    pub nft_id: u32,
    pub total_earned: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceSummary {
    pub key: String,
    pub balance: i64,
    pub last_claim: Option<i64>,
    pub active_count: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub version: i32,
    pub round: u32,
    pub round_seed: u32,
    pub block_height: i32,
    pub block_hash: String,
    pub in_replay: bool,
    pub should_roll_back: bool,
    pub counter_next: u32,
    pub current_slot: u32,
    pub current_block_was_produced: bool,
    pub prev_block_was_produced: bool,
    pub pico_power: u64,
    pub prev_pico_power: u64,
    pub current_pico_power: u64,
    pub queue: Vec<SlotSummary>,
    pub stakers: Vec<StakerSummary>,
    pub balances: Vec<BalanceSummary>,
}

impl QpRegistry {
    pub fn staker_summary(&self, id: u32) -> Option<StakerSummary> {
        let staker = self.staker(id)?;
        Some(StakerSummary {
            id,
            alias: staker.alias().to_string(),
            owner: staker.owner.to_hex(),
            delegate: staker.delegate.to_hex(),
            controller: staker.controller.to_hex(),
            manager: staker.manager.map(|k| k.to_hex()),
            delegate_payout_pcm: staker.delegate_payout_pcm(),
            enabled: staker.is_enabled(),
            disqualified: staker.is_disqualified(),
            seniority: self.seniority(id),
            weight: staker.weight(self.seniority(id)),
            blocks_produced: staker.blocks_produced,
            blocks_missed: staker.blocks_missed,
            missed_in_row: staker.missed_in_row,
            nft_id: staker.nft_id,
            total_earned: staker.total_earned,
        })
    }

    pub fn summary(&self) -> RegistrySummary {
        let queue = (0..self.queue().len() as u32)
            .filter_map(|slot| {
                let id = self.queue().id_for_slot(slot)?;
                let w = self.queue().window_for_slot(slot)?;
                Some(SlotSummary {
                    slot,
                    id,
                    start_time: w.start,
                    end_time: w.end,
                })
            })
            .collect();
        let stakers = self
            .stakers()
            .keys()
            .filter_map(|id| self.staker_summary(*id))
            .collect();
        let balances = self
            .balances()
            .iter()
            .map(|(key, balance)| BalanceSummary {
                key: key.to_hex(),
                balance: *balance,
                last_claim: self.last_claim_for(key),
                active_count: self.active_count_for(key),
            })
            .collect();
        RegistrySummary {
            version: 1,
            round: self.round(),
            round_seed: self.round_seed(),
            block_height: self.block_height(),
            block_hash: self.block_hash().to_string(),
            in_replay: self.is_in_replay_mode(),
            should_roll_back: self.should_rollback(),
            counter_next: self.next_id(),
            current_slot: self.queue().current_slot(),
            current_block_was_produced: self.current_block_was_produced(),
            prev_block_was_produced: self.prev_block_was_produced(),
            pico_power: self.pico_power(),
            prev_pico_power: self.pico_power_prev(),
            current_pico_power: self.pico_power_current(),
            queue,
            stakers,
            balances,
        }
    }
}

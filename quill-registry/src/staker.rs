//! Per-staker registry state: role keys, alias, payout split, lifecycle,
//! and production/miss accounting.

use std::collections::BTreeMap;

use quill_core::{Amount, CodecError, Decodable, Encodable, Reader};
use quill_crypto::{isqrt, PubKey};

use crate::alias::alias_is_valid;
use crate::bits::BitWindow;
use crate::meta::KeyAuthority;
use crate::{QP_NOOB_BLOCKS, QP_STAKER_RECENT_BLOCKS};

const STAKER_VERSION: i32 = 1;

/// Maximum delegate payout: 100% in centi-milli-percent.
pub const QP_PCM_MAX: u32 = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QpStaker {
    pub version: i32,
    pub owner: PubKey,
    pub delegate: PubKey,
    pub controller: PubKey,
    pub manager: Option<PubKey>,
    alias: String,
    /// Delegate share of each reward, in centi-milli-percent.
    pcm_delegate: u32,
    enabled: bool,
    disqualified: bool,
    pub blocks_produced: u32,
    pub blocks_missed: u32,
    /// qPoS blocks connected while this staker was registered.
    pub blocks_seen: u32,
    pub missed_in_row: u32,
    pub round_missed_current: u32,
    pub round_missed_prev: u32,
    recent: BitWindow,
    pub price_paid: Amount,
    pub total_earned: Amount,
    pub nft_id: u32,
    pub meta: BTreeMap<String, String>,
}

impl QpStaker {
    /// A one-key staker: the owner key also delegates and controls.
    pub fn new(owner: PubKey, price_paid: Amount) -> Self {
        QpStaker {
            version: STAKER_VERSION,
            owner,
            delegate: owner,
            controller: owner,
            manager: None,
            alias: String::new(),
            pcm_delegate: 0,
            enabled: true,
            disqualified: false,
            blocks_produced: 0,
            blocks_missed: 0,
            blocks_seen: 0,
            missed_in_row: 0,
            round_missed_current: 0,
            round_missed_prev: 0,
            recent: BitWindow::new(QP_STAKER_RECENT_BLOCKS),
            price_paid,
            total_earned: 0,
            nft_id: 0,
            meta: BTreeMap::new(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_alias(&mut self, alias: &str) -> bool {
        // an alias is assigned once, at purchase
        if !self.alias.is_empty() || !alias_is_valid(alias) {
            return false;
        }
        self.alias = alias.to_string();
        true
    }

    pub fn delegate_payout_pcm(&self) -> u32 {
        self.pcm_delegate
    }

    pub fn set_delegate_payout(&mut self, pcm: u32) -> bool {
        if pcm == 0 || pcm > QP_PCM_MAX {
            return false;
        }
        self.pcm_delegate = pcm;
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.disqualified
    }

    pub fn is_disabled(&self) -> bool {
        !self.enabled
    }

    pub fn is_disqualified(&self) -> bool {
        self.disqualified
    }

    pub fn is_productive(&self) -> bool {
        self.blocks_produced > 0
    }

    /// New stakers get a grace period before miss accounting can
    /// disqualify them.
    pub fn is_noob(&self) -> bool {
        self.blocks_seen < QP_NOOB_BLOCKS
    }

    pub fn enable(&mut self) -> bool {
        if self.disqualified {
            return false;
        }
        self.enabled = true;
        true
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn disqualify(&mut self) {
        self.disqualified = true;
        self.enabled = false;
    }

    pub fn saw_block(&mut self) {
        self.blocks_seen = self.blocks_seen.saturating_add(1);
    }

    /// Rotate per-round miss counters at a queue boundary.
    pub fn rotate_round(&mut self) {
        self.round_missed_prev = self.round_missed_current;
        self.round_missed_current = 0;
    }

    /// Account a produced block and split the reward between owner and
    /// delegate by the payout setting.
    pub fn produced_block(&mut self, reward: Amount) -> (Amount, Amount) {
        self.blocks_produced = self.blocks_produced.saturating_add(1);
        self.missed_in_row = 0;
        self.recent.push(true);
        self.total_earned = self.total_earned.saturating_add(reward);
        let delegate_reward = if self.delegate == self.owner {
            0
        } else {
            ((reward as i128) * (self.pcm_delegate as i128) / (QP_PCM_MAX as i128)) as Amount
        };
        (reward - delegate_reward, delegate_reward)
    }

    pub fn missed_block(&mut self) {
        self.blocks_missed = self.blocks_missed.saturating_add(1);
        self.missed_in_row = self.missed_in_row.saturating_add(1);
        self.round_missed_current = self.round_missed_current.saturating_add(1);
        self.recent.push(false);
    }

    pub fn net_blocks(&self) -> u32 {
        self.blocks_produced.saturating_sub(self.blocks_missed)
    }

    /// Scheduling weight: seniority rank compressed by the square root of
    /// net production. Frozen consensus rule.
    pub fn weight(&self, seniority: u32) -> u32 {
        let w = seniority as u64 * isqrt(self.net_blocks() as u64 + 1);
        w.min(u32::MAX as u64) as u32
    }

    pub fn should_be_disqualified(&self, max_misses: u32) -> bool {
        !self.is_noob() && self.missed_in_row > max_misses
    }

    pub fn hits_in_recent_window(&self) -> u32 {
        self.recent.count_ones()
    }

    pub fn set_meta(&mut self, key: &str, value: &str) {
        if value.is_empty() {
            self.meta.remove(key);
        } else {
            self.meta.insert(key.to_string(), value.to_string());
        }
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(|s| s.as_str())
    }

    /// Does `key` hold any of the roles in `authority` for this staker?
    pub fn key_has_authority(&self, key: &PubKey, authority: KeyAuthority) -> bool {
        (authority.permits(KeyAuthority::OWNER) && *key == self.owner)
            || (authority.permits(KeyAuthority::DELEGATE) && *key == self.delegate)
            || (authority.permits(KeyAuthority::CONTROLLER) && *key == self.controller)
            || (authority.permits(KeyAuthority::MANAGER) && Some(*key) == self.manager)
    }
}

impl Encodable for QpStaker {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.owner.encode(out);
        self.delegate.encode(out);
        self.controller.encode(out);
        self.manager.is_some().encode(out);
        if let Some(manager) = &self.manager {
            manager.encode(out);
        }
        self.alias.encode(out);
        self.pcm_delegate.encode(out);
        self.enabled.encode(out);
        self.disqualified.encode(out);
        self.blocks_produced.encode(out);
        self.blocks_missed.encode(out);
        self.blocks_seen.encode(out);
        self.missed_in_row.encode(out);
        self.round_missed_current.encode(out);
        self.round_missed_prev.encode(out);
        self.recent.encode(out);
        self.price_paid.encode(out);
        self.total_earned.encode(out);
        self.nft_id.encode(out);
        self.meta.encode(out);
    }
}

impl Decodable for QpStaker {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let version = i32::decode(r)?;
        let owner = PubKey::decode(r)?;
        let delegate = PubKey::decode(r)?;
        let controller = PubKey::decode(r)?;
        let manager = if bool::decode(r)? {
            Some(PubKey::decode(r)?)
        } else {
            None
        };
        Ok(QpStaker {
            version,
            owner,
            delegate,
            controller,
            manager,
            alias: String::decode(r)?,
            pcm_delegate: u32::decode(r)?,
            enabled: bool::decode(r)?,
            disqualified: bool::decode(r)?,
            blocks_produced: u32::decode(r)?,
            blocks_missed: u32::decode(r)?,
            blocks_seen: u32::decode(r)?,
            missed_in_row: u32::decode(r)?,
            round_missed_current: u32::decode(r)?,
            round_missed_prev: u32::decode(r)?,
            recent: BitWindow::decode(r)?,
            price_paid: Amount::decode(r)?,
            total_earned: Amount::decode(r)?,
            nft_id: u32::decode(r)?,
            meta: BTreeMap::<String, String>::decode(r)?,
        })
    }
}

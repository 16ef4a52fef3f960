//! Rebalancing Planner
//!
//! Pure function from farm state to a suggested reallocation. Share moves from
//! the lowest-APY farms to the highest-APY farms in bounded steps, and a step
//! is only taken when it lifts the blended APY by at least the configured
//! minimum.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Farm, FarmId, FULL_ALLOCATION_BPS};
use crate::error::{HarvestError, Result};
use crate::registry::blended_apy;

/// Suggested share for one active farm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTarget {
    pub farm: FarmId,
    pub apy_bps: u32,
    /// Share recorded in the registry when the plan was made
    pub current_bps: u32,
    pub target_bps: u32,
}

impl PlanTarget {
    pub fn is_change(&self) -> bool {
        self.current_bps != self.target_bps
    }

    /// Absolute share moved in or out of this farm
    pub fn shift_bps(&self) -> u32 {
        self.current_bps.abs_diff(self.target_bps)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub plan_id: Uuid,
    /// Active farms in registry order
    pub targets: Vec<PlanTarget>,
    pub current_apy: Decimal,
    pub projected_apy: Decimal,
    pub created_at: DateTime<Utc>,
}

impl RebalancePlan {
    pub fn is_noop(&self) -> bool {
        self.targets.iter().all(|target| !target.is_change())
    }

    pub fn target_for(&self, farm: &FarmId) -> Option<&PlanTarget> {
        self.targets.iter().find(|target| &target.farm == farm)
    }

    /// Targets that differ from the current share
    pub fn changes(&self) -> impl Iterator<Item = &PlanTarget> {
        self.targets.iter().filter(|target| target.is_change())
    }

    pub fn apy_gain(&self) -> Decimal {
        self.projected_apy - self.current_apy
    }
}

/// Per-farm bookkeeping while searching for shift steps
struct Slot {
    apy_bps: u32,
    share: u32,
    moved_out: u32,
    moved_in: u32,
}

/// Compute a reallocation of the active farms in `farms`.
///
/// `min_change_bps` is the blended APY gain (in bps of APY) a single step must
/// reach; `max_shift_bps` bounds how much share any one farm gains or loses.
pub fn plan(farms: &[Farm], min_change_bps: u32, max_shift_bps: u32) -> Result<RebalancePlan> {
    let active: Vec<&Farm> = farms.iter().filter(|farm| farm.active).collect();
    if active.is_empty() {
        return Err(HarvestError::EmptyRegistry);
    }
    for farm in &active {
        if farm.allocation_bps > FULL_ALLOCATION_BPS {
            return Err(HarvestError::InvalidAllocation(format!(
                "{}: {} bps exceeds {FULL_ALLOCATION_BPS}",
                farm.id, farm.allocation_bps
            )));
        }
    }

    let mut slots: Vec<Slot> = active
        .iter()
        .map(|farm| Slot {
            apy_bps: farm.apy_bps,
            share: farm.allocation_bps,
            moved_out: 0,
            moved_in: 0,
        })
        .collect();

    // Highest APY first, discovery order on ties
    let mut ranked: Vec<usize> = (0..slots.len()).collect();
    ranked.sort_by(|&a, &b| slots[b].apy_bps.cmp(&slots[a].apy_bps).then(a.cmp(&b)));

    // as recorded, before any restoration of an unsettled total
    let current_apy = blended_apy(active.iter().copied())?;
    restore_total(&mut slots, &ranked);

    let mut steps = 0usize;
    while let Some((donor, recipient, amount)) =
        find_step(&slots, &ranked, min_change_bps, max_shift_bps)
    {
        slots[donor].share -= amount;
        slots[donor].moved_out += amount;
        slots[recipient].share += amount;
        slots[recipient].moved_in += amount;
        steps += 1;
        debug!(
            from = %active[donor].id,
            to = %active[recipient].id,
            amount_bps = amount,
            "planned shift"
        );
    }

    let projected: Vec<Farm> = active
        .iter()
        .zip(&slots)
        .map(|(farm, slot)| Farm {
            allocation_bps: slot.share,
            ..(*farm).clone()
        })
        .collect();
    let projected_apy = blended_apy(&projected)?;

    let targets: Vec<PlanTarget> = active
        .iter()
        .zip(&slots)
        .map(|(farm, slot)| PlanTarget {
            farm: farm.id.clone(),
            apy_bps: farm.apy_bps,
            current_bps: farm.allocation_bps,
            target_bps: slot.share,
        })
        .collect();

    let plan = RebalancePlan {
        plan_id: Uuid::new_v4(),
        targets,
        current_apy,
        projected_apy,
        created_at: Utc::now(),
    };

    info!(
        plan_id = %plan.plan_id,
        steps,
        current_apy = %plan.current_apy,
        projected_apy = %plan.projected_apy,
        "rebalance plan computed"
    );
    Ok(plan)
}

/// Bring active shares back to exactly 100%.
///
/// A deficit goes to the best farm; an excess is taken from the lowest-APY
/// farms first.
fn restore_total(slots: &mut [Slot], ranked: &[usize]) {
    let total: u32 = slots.iter().map(|slot| slot.share).sum();

    if total < FULL_ALLOCATION_BPS {
        let best = ranked[0];
        slots[best].share += FULL_ALLOCATION_BPS - total;
    } else if total > FULL_ALLOCATION_BPS {
        let mut excess = total - FULL_ALLOCATION_BPS;
        for &index in ranked.iter().rev() {
            let taken = excess.min(slots[index].share);
            slots[index].share -= taken;
            excess -= taken;
            if excess == 0 {
                break;
            }
        }
    }
}

/// Next qualifying (donor, recipient, amount), if any
fn find_step(
    slots: &[Slot],
    ranked: &[usize],
    min_change_bps: u32,
    max_shift_bps: u32,
) -> Option<(usize, usize, u32)> {
    for &donor in ranked.iter().rev() {
        let from = &slots[donor];
        if from.moved_in > 0 || from.share == 0 || from.moved_out >= max_shift_bps {
            continue;
        }

        for &recipient in ranked {
            let to = &slots[recipient];
            if to.apy_bps <= from.apy_bps {
                break;
            }
            if to.moved_out > 0 || to.moved_in >= max_shift_bps || to.share >= FULL_ALLOCATION_BPS
            {
                continue;
            }

            let amount = from
                .share
                .min(max_shift_bps - from.moved_out)
                .min(max_shift_bps - to.moved_in)
                .min(FULL_ALLOCATION_BPS - to.share);
            if amount == 0 {
                continue;
            }

            // gain in bps of APY = amount * Δapy / 10_000
            let gain = u64::from(amount) * u64::from(to.apy_bps - from.apy_bps);
            if gain >= u64::from(min_change_bps) * u64::from(FULL_ALLOCATION_BPS) {
                return Some((donor, recipient, amount));
            }
        }
    }
    None
}

//! Farm Registry
//!
//! Holds the last known state of every discovered farm. Pure data: no I/O and
//! no locking. The owner (the desk) is the only writer; readers receive
//! [`RegistrySnapshot`]s.

pub mod apy;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::domain::{Farm, FarmId, FULL_ALLOCATION_BPS};
use crate::error::{HarvestError, Result};

/// Read-only view of the registry handed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Every known farm in discovery order, inactive ones included
    pub farms: Vec<Farm>,
    /// `None` when no farm is active
    pub blended_apy: Option<Decimal>,
    pub total_active_allocation: u32,
    pub settled: bool,
    pub taken_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self {
            farms: Vec::new(),
            blended_apy: None,
            total_active_allocation: 0,
            settled: false,
            taken_at: Utc::now(),
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &Farm> {
        self.farms.iter().filter(|farm| farm.active)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FarmRegistry {
    farms: Vec<Farm>,
    index: HashMap<FarmId, usize>,
}

impl FarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_farms(farms: impl IntoIterator<Item = Farm>) -> Result<Self> {
        let mut registry = Self::new();
        for farm in farms {
            registry.upsert(farm)?;
        }
        Ok(registry)
    }

    /// Insert a new farm or replace an existing one by identity.
    ///
    /// Returns `true` when the farm was newly discovered. Discovery order is
    /// preserved on replacement.
    pub fn upsert(&mut self, farm: Farm) -> Result<bool> {
        validate_share(&farm.id, farm.allocation_bps)?;

        match self.index.get(&farm.id) {
            Some(&slot) => {
                self.farms[slot] = farm;
                Ok(false)
            }
            None => {
                debug!(farm = %farm.id, apy_bps = farm.apy_bps, "discovered farm");
                self.index.insert(farm.id.clone(), self.farms.len());
                self.farms.push(farm);
                Ok(true)
            }
        }
    }

    pub fn get(&self, id: &FarmId) -> Option<&Farm> {
        self.index.get(id).map(|&slot| &self.farms[slot])
    }

    /// All known farms in discovery order
    pub fn farms(&self) -> &[Farm] {
        &self.farms
    }

    /// Active farms in discovery order
    pub fn list_active(&self) -> Vec<Farm> {
        self.farms.iter().filter(|farm| farm.active).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.farms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.farms.is_empty()
    }

    /// Farms are never removed; deactivation keeps their allocation history.
    pub fn deactivate(&mut self, id: &FarmId) -> Result<()> {
        let farm = self.get_mut(id)?;
        if farm.active {
            farm.active = false;
            info!(farm = %id, "farm deactivated");
        }
        Ok(())
    }

    pub fn set_allocation(&mut self, id: &FarmId, allocation_bps: u32) -> Result<()> {
        validate_share(id, allocation_bps)?;
        self.get_mut(id)?.allocation_bps = allocation_bps;
        Ok(())
    }

    pub fn set_apy(&mut self, id: &FarmId, apy_bps: u32) -> Result<()> {
        self.get_mut(id)?.apy_bps = apy_bps;
        Ok(())
    }

    pub fn total_active_allocation(&self) -> u32 {
        self.farms
            .iter()
            .filter(|farm| farm.active)
            .map(|farm| farm.allocation_bps)
            .sum()
    }

    /// Active shares sum to exactly 100%
    pub fn is_settled(&self) -> bool {
        self.total_active_allocation() == FULL_ALLOCATION_BPS
    }

    /// Σ(apy × share) / 10_000 over active farms, in basis points
    pub fn recompute_blended_apy(&self) -> Result<Decimal> {
        blended_apy(self.farms.iter())
    }

    /// Highest-APY active farm; earliest discovered wins ties
    pub fn best_farm(&self) -> Option<&Farm> {
        self.farms
            .iter()
            .filter(|farm| farm.active)
            .fold(None, |best: Option<&Farm>, farm| match best {
                Some(current) if current.apy_bps >= farm.apy_bps => Some(current),
                _ => Some(farm),
            })
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            farms: self.farms.clone(),
            blended_apy: self.recompute_blended_apy().ok(),
            total_active_allocation: self.total_active_allocation(),
            settled: self.is_settled(),
            taken_at: Utc::now(),
        }
    }

    /// Rebuild from an authoritative farm list.
    ///
    /// Farms the source no longer reports are deactivated rather than dropped.
    pub fn sync_from(&mut self, farms: Vec<Farm>) -> Result<()> {
        for farm in &farms {
            validate_share(&farm.id, farm.allocation_bps)?;
        }

        let reported: Vec<FarmId> = farms.iter().map(|farm| farm.id.clone()).collect();
        for farm in farms {
            self.upsert(farm)?;
        }

        for farm in self.farms.iter_mut() {
            if farm.active && !reported.contains(&farm.id) {
                info!(farm = %farm.id, "farm missing from authoritative state, deactivating");
                farm.active = false;
            }
        }
        Ok(())
    }

    fn get_mut(&mut self, id: &FarmId) -> Result<&mut Farm> {
        match self.index.get(id) {
            Some(&slot) => Ok(&mut self.farms[slot]),
            None => Err(HarvestError::UnknownFarm(id.to_string())),
        }
    }
}

/// Blended APY over the active farms of `farms`
pub fn blended_apy<'a>(farms: impl IntoIterator<Item = &'a Farm>) -> Result<Decimal> {
    let mut any_active = false;
    let mut weighted: u64 = 0;
    for farm in farms.into_iter().filter(|farm| farm.active) {
        any_active = true;
        weighted += farm.weighted_apy();
    }

    if !any_active {
        return Err(HarvestError::EmptyRegistry);
    }
    Ok(Decimal::from(weighted) / Decimal::from(FULL_ALLOCATION_BPS))
}

fn validate_share(id: &FarmId, allocation_bps: u32) -> Result<()> {
    if allocation_bps > FULL_ALLOCATION_BPS {
        return Err(HarvestError::InvalidAllocation(format!(
            "{id}: {allocation_bps} bps exceeds {FULL_ALLOCATION_BPS}"
        )));
    }
    Ok(())
}

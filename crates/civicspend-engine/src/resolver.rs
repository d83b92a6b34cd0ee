//! Vendor entity resolution.
//!
//! Collapses inconsistently spelled recipient names into stable vendor
//! identities. Strong identifiers (DUNS/UEI) win outright; otherwise the
//! normalised name is compared against every known vendor in identifier
//! order and the first one at or above the similarity threshold is taken.

use std::collections::HashMap;

use civicspend_core::{VendorEntity, normalize_vendor_name, similarity_ratio};
use civicspend_store::DuckStore;
use tracing::{debug, info};

use crate::EngineError;

/// Resolves recipient names to vendor identifiers for one resolution pass.
///
/// The known-vendor list is loaded once per pass and extended in place as
/// new vendors are created, so enumeration order is creation order.
pub struct VendorResolver<'a> {
    store: &'a DuckStore,
    threshold: f64,
    /// (entity, normalised canonical name), ordered by vendor id.
    known: Option<Vec<(VendorEntity, String)>>,
    /// Strong id → vendor id, seen within this pass.
    strong_ids: HashMap<String, String>,
}

impl<'a> VendorResolver<'a> {
    pub fn new(store: &'a DuckStore, threshold: f64) -> Self {
        Self {
            store,
            threshold,
            known: None,
            strong_ids: HashMap::new(),
        }
    }

    /// Resolve one name (and optional strong identifier) to a vendor id,
    /// creating a vendor entity when nothing matches.
    pub fn resolve(&mut self, name: &str, strong_id: Option<&str>) -> Result<String, EngineError> {
        let strong_id = strong_id.map(str::trim).filter(|s| !s.is_empty());

        if let Some(sid) = strong_id {
            if let Some(vendor_id) = self.strong_ids.get(sid) {
                return Ok(vendor_id.clone());
            }
            if let Some(vendor) = self.store.vendor_by_strong_id(sid)? {
                self.strong_ids.insert(sid.to_string(), vendor.vendor_id.clone());
                return Ok(vendor.vendor_id);
            }
        }

        let normalized = normalize_vendor_name(name);
        let store = self.store;
        let threshold = self.threshold;
        let known = self.known_vendors()?;

        let matched = known
            .iter()
            .find(|(_, canon)| similarity_ratio(&normalized, canon) >= threshold)
            .map(|(v, _)| v.vendor_id.clone());

        let vendor_id = match matched {
            Some(id) => {
                debug!(name, vendor_id = %id, "fuzzy match");
                id
            }
            None => {
                let entity = VendorEntity {
                    vendor_id: next_vendor_id(known),
                    canonical_name: name.to_string(),
                    strong_id: strong_id.map(String::from),
                };
                store.create_vendor(&entity)?;
                let id = entity.vendor_id.clone();
                known.push((entity, normalized));
                debug!(name, vendor_id = %id, "new vendor");
                id
            }
        };

        if let Some(sid) = strong_id {
            self.strong_ids.insert(sid.to_string(), vendor_id.clone());
        }
        Ok(vendor_id)
    }

    /// Resolve every award of a run and record its mapping. Awards that are
    /// already mapped keep their vendor. Returns the number of distinct
    /// vendors the run's awards map to.
    pub fn resolve_run(&mut self, run_id: &str) -> Result<usize, EngineError> {
        let awards = self.store.raw_awards(run_id)?;
        let existing = self.store.award_vendor_map(run_id)?;

        let mut created = 0usize;
        for award in &awards {
            if let Some(vendor_id) = existing.get(&award.award_id) {
                if let Some(sid) = award.recipient_strong_id.as_deref().map(str::trim)
                    && !sid.is_empty()
                {
                    self.strong_ids
                        .entry(sid.to_string())
                        .or_insert_with(|| vendor_id.clone());
                }
                continue;
            }
            let vendor_id = self.resolve(&award.recipient_name, award.recipient_strong_id.as_deref())?;
            self.store
                .insert_award_vendor(run_id, &award.award_id, &vendor_id)?;
            created += 1;
        }

        let vendors = self.store.run_vendor_count(run_id)?;
        info!(
            run_id,
            awards = awards.len(),
            new_mappings = created,
            vendors,
            "resolved vendors"
        );
        Ok(vendors)
    }

    fn known_vendors(&mut self) -> Result<&mut Vec<(VendorEntity, String)>, EngineError> {
        if self.known.is_none() {
            let vendors = self
                .store
                .vendors()?
                .into_iter()
                .map(|v| {
                    let canon = normalize_vendor_name(&v.canonical_name);
                    (v, canon)
                })
                .collect();
            self.known = Some(vendors);
        }
        Ok(self.known.get_or_insert_with(Vec::new))
    }
}

/// One past the highest `V`-numbered identifier in use.
fn next_vendor_id(known: &[(VendorEntity, String)]) -> String {
    let max = known
        .iter()
        .filter_map(|(v, _)| v.vendor_id.strip_prefix('V')?.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("V{:06}", max + 1)
}

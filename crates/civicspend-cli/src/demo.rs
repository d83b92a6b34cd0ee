//! Seeded synthetic award generator for demos and smoke runs.

use civicspend_core::{RawAward, YearMonth};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const VENDORS: [&str; 12] = [
    "3M Company",
    "Target Corporation",
    "Best Buy",
    "General Mills",
    "UnitedHealth Group",
    "US Bank",
    "Medtronic",
    "Land O'Lakes",
    "CHS Inc",
    "Ecolab",
    "Ameriprise Financial",
    "Xcel Energy",
];

const AGENCIES: [&str; 6] = [
    "Department of Defense",
    "Department of Health and Human Services",
    "Department of Transportation",
    "Department of Agriculture",
    "Department of Energy",
    "Department of Veterans Affairs",
];

/// Vendor that receives the injected spike.
pub const SPIKE_VENDOR: &str = VENDORS[0];

pub struct DemoOptions {
    pub awards: usize,
    pub seed: u64,
    pub start: YearMonth,
    pub months: u32,
    /// Inject a single month at roughly 10× the spike vendor's usual spend.
    pub spike: bool,
}

/// The month that carries the spike, when enabled.
pub fn spike_month(opts: &DemoOptions) -> YearMonth {
    nth_month(opts.start, opts.months / 2)
}

fn nth_month(start: YearMonth, n: u32) -> YearMonth {
    (0..n).fold(start, |ym, _| ym.succ())
}

/// Generate awards for `run_id`. The same options always give the same awards.
pub fn generate(run_id: &str, opts: &DemoOptions) -> Vec<RawAward> {
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let months = opts.months.max(1);

    // Per-vendor typical award size, fixed for the whole run.
    let bases: Vec<f64> = (0..VENDORS.len())
        .map(|_| rng.gen_range(50_000.0..750_000.0))
        .collect();

    let mut awards = Vec::with_capacity(opts.awards + 3);
    for i in 0..opts.awards {
        // Cycle vendors and months so every vendor-month is covered early on.
        let v = i % VENDORS.len();
        let m = if i < VENDORS.len() * months as usize {
            (i / VENDORS.len()) as u32
        } else {
            rng.gen_range(0..months)
        };
        let amount = bases[v] * rng.gen_range(0.8..1.2);
        awards.push(award(run_id, i, v, nth_month(opts.start, m), amount, &mut rng));
    }

    if opts.spike {
        let month = spike_month(opts);
        let typical = bases[0] * (opts.awards as f64 / (VENDORS.len() * months as usize) as f64);
        for k in 0..3 {
            let i = opts.awards + k;
            awards.push(award(run_id, i, 0, month, typical * 3.0, &mut rng));
        }
    }
    awards
}

fn award(
    run_id: &str,
    i: usize,
    vendor: usize,
    month: YearMonth,
    amount: f64,
    rng: &mut StdRng,
) -> RawAward {
    let name = VENDORS[vendor];
    // Some feeds shout, some add punctuation; both normalise away.
    let recipient_name = match rng.gen_range(0..4) {
        0 => name.to_uppercase(),
        1 => format!("{name}."),
        _ => name.to_string(),
    };
    let recipient_strong_id = rng
        .gen_bool(0.5)
        .then(|| format!("UEI{:05}", 10_000 + vendor * 7_919));
    RawAward {
        run_id: run_id.to_string(),
        award_id: format!("CONT_AWD_MN_{i:06}"),
        recipient_name,
        recipient_strong_id,
        awarding_agency: Some(AGENCIES[rng.gen_range(0..AGENCIES.len())].to_string()),
        action_date: Some(format!(
            "{:04}-{:02}-{:02}",
            month.year(),
            month.month(),
            rng.gen_range(1..=28)
        )),
        obligation_amount: (amount * 100.0).round() / 100.0,
        place_of_performance: Some("MN".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> DemoOptions {
        DemoOptions {
            awards: 200,
            seed: 42,
            start: YearMonth::new(2024, 1).unwrap(),
            months: 12,
            spike: true,
        }
    }

    #[test]
    fn deterministic_for_a_seed() {
        assert_eq!(generate("r1", &opts()), generate("r1", &opts()));
        let other = DemoOptions { seed: 7, ..opts() };
        assert_ne!(generate("r1", &opts()), generate("r1", &other));
    }

    #[test]
    fn covers_every_vendor_month_and_adds_spike() {
        let awards = generate("r1", &opts());
        assert_eq!(awards.len(), 203);

        let mut cells = std::collections::HashSet::new();
        for a in &awards {
            let name = civicspend_core::normalize_vendor_name(&a.recipient_name);
            cells.insert((name, a.month().unwrap()));
        }
        assert_eq!(cells.len(), 12 * 12);

        let spike = spike_month(&opts());
        assert_eq!(spike.to_string(), "2024-07");
        let ids: std::collections::HashSet<_> = awards.iter().map(|a| &a.award_id).collect();
        assert_eq!(ids.len(), awards.len());
    }

    #[test]
    fn no_spike_when_disabled() {
        let awards = generate("r1", &DemoOptions { spike: false, ..opts() });
        assert_eq!(awards.len(), 200);
    }
}

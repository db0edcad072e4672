use std::cmp::Ordering;
use std::collections::BTreeMap;

use expenseflow_core::{MatchProposal, TransactionId, Warning};

use crate::config::MatchConfig;

/// Why a proposal was removed before conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Veto {
    BelowFloor,
    AmountVariance,
    DateGap,
    IncompatibleCurrency,
}

/// Ranked, adjusted, filtered proposals for one expense.
#[derive(Debug, Clone, Default)]
pub struct Aggregated {
    pub proposals: Vec<MatchProposal>,
    pub vetoed: Vec<(MatchProposal, Veto)>,
}

/// Applies rank penalties and the agreement bonus to one expense's ranked
/// proposals, re-tiers them, vetoes those breaking a business rule and tags
/// the survivors with warnings.
pub fn aggregate(proposals: Vec<MatchProposal>, config: &MatchConfig) -> Aggregated {
    let mut unique: BTreeMap<TransactionId, MatchProposal> = BTreeMap::new();
    for p in proposals {
        match unique.get(&p.transaction_id) {
            Some(existing) if existing.confidence >= p.confidence => {}
            _ => {
                unique.insert(p.transaction_id, p);
            }
        }
    }
    let mut ranked: Vec<MatchProposal> = unique.into_values().collect();
    sort_descending(&mut ranked);

    for (rank, p) in ranked.iter_mut().enumerate() {
        let mut confidence = p.confidence * (1.0 - config.rank_penalty * rank as f64).max(0.0);
        if p.scores.amount > 0.95 && p.scores.date > 0.9 {
            confidence *= config.agreement_bonus;
        }
        p.set_confidence(confidence);
    }
    sort_descending(&mut ranked);

    let mut out = Aggregated::default();
    for mut p in ranked {
        if let Some(veto) = veto(&p, config) {
            out.vetoed.push((p, veto));
            continue;
        }
        attach_warnings(&mut p, config);
        out.proposals.push(p);
    }
    out
}

fn veto(p: &MatchProposal, config: &MatchConfig) -> Option<Veto> {
    if p.confidence < config.hard_floor {
        Some(Veto::BelowFloor)
    } else if p.amount_variance > config.max_amount_variance {
        Some(Veto::AmountVariance)
    } else if p.date_gap_days > config.max_date_gap_days {
        Some(Veto::DateGap)
    } else if p.cross_currency && p.scores.currency < config.min_currency_compatibility {
        Some(Veto::IncompatibleCurrency)
    } else {
        None
    }
}

fn attach_warnings(p: &mut MatchProposal, config: &MatchConfig) {
    if p.amount_variance > config.warn_amount_variance {
        p.warnings.insert(Warning::HighAmountVariance);
    }
    if p.date_gap_days > config.warn_date_gap_days {
        p.warnings.insert(Warning::LargeDateGap);
    }
    if p.cross_currency {
        p.warnings.insert(Warning::CurrencyConversion);
    }
    // Same-currency pairs need no rate, so a fallback table never affects them.
    if p.cross_currency && p.fallback_rate {
        p.warnings.insert(Warning::FallbackExchangeRate);
        p.warnings.insert(Warning::CurrencyConversion);
    }
}

fn sort_descending(proposals: &mut [MatchProposal]) {
    proposals.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then(a.transaction_id.cmp(&b.transaction_id))
    });
}

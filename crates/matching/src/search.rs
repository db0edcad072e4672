use std::collections::{BTreeMap, BTreeSet};

use expenseflow_core::BankTransaction;

use crate::similarity::WORD_MATCH_THRESHOLD;
use crate::util::{edit_similarity, normalize, significant_words};

/// Inverted index from normalised description words to positions in the
/// run's transaction pool.
#[derive(Debug, Clone, Default)]
pub struct TextIndex {
    postings: BTreeMap<String, BTreeSet<usize>>,
}

impl TextIndex {
    pub fn build(transactions: &[BankTransaction]) -> Self {
        let mut postings: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for (index, tx) in transactions.iter().enumerate() {
            let normalized = normalize(&tx.description);
            for word in significant_words(&normalized) {
                postings.entry(word.to_string()).or_default().insert(index);
            }
        }
        Self { postings }
    }

    /// Number of distinct query words each transaction shares with `query`,
    /// treating words at the fuzzy threshold as equal.
    pub fn hits(&self, query: &str) -> BTreeMap<usize, usize> {
        let normalized = normalize(query);
        let mut words: Vec<&str> = significant_words(&normalized);
        words.sort_unstable();
        words.dedup();

        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for word in words {
            let mut matched: BTreeSet<usize> = BTreeSet::new();
            for (term, positions) in &self.postings {
                if term == word || edit_similarity(term, word) >= WORD_MATCH_THRESHOLD {
                    matched.extend(positions.iter().copied());
                }
            }
            for index in matched {
                *counts.entry(index).or_default() += 1;
            }
        }
        counts
    }

    /// Orders `candidates` (pool positions, already sorted by amount
    /// closeness) for the fuzzy strategy: text hits first by hit count, then
    /// the rest in their given order, at most `limit` in total.
    pub fn rank(&self, query: &str, candidates: &[usize], limit: usize) -> Vec<usize> {
        let hits = self.hits(query);
        let mut with_hits: Vec<(usize, usize)> = candidates
            .iter()
            .enumerate()
            .filter_map(|(order, index)| hits.get(index).map(|h| (order, *h)))
            .collect();
        with_hits.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut ranked: Vec<usize> = with_hits.iter().map(|(order, _)| candidates[*order]).collect();
        ranked.extend(candidates.iter().filter(|i| !hits.contains_key(i)).copied());
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use expenseflow_core::{Currency, Money, RecordStatus, TenantId, TransactionId};
    use rust_decimal::Decimal;

    fn tx(id: i64, description: &str) -> BankTransaction {
        BankTransaction {
            id: TransactionId(id),
            tenant_id: TenantId("acme".into()),
            amount: Money::new(Decimal::new(-100, 0), Currency::new("PLN").unwrap()),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            description: description.into(),
            status: RecordStatus::Unmatched,
        }
    }

    #[test]
    fn hits_count_distinct_query_words() {
        let pool = vec![
            tx(1, "MARRIOTT HOTEL WARSAW"),
            tx(2, "HOTEL BRISTOL"),
            tx(3, "ORLEN STACJA"),
        ];
        let index = TextIndex::build(&pool);
        let hits = index.hits("Marriott hotel hotel");
        assert_eq!(hits.get(&0), Some(&2));
        assert_eq!(hits.get(&1), Some(&1));
        assert_eq!(hits.get(&2), None);
    }

    #[test]
    fn hits_tolerate_misspellings() {
        let index = TextIndex::build(&[tx(1, "STARBUCKS 123")]);
        assert_eq!(index.hits("Starbuks").get(&0), Some(&1));
    }

    #[test]
    fn rank_puts_text_hits_first_then_fills() {
        let pool = vec![tx(1, "ORLEN"), tx(2, "UBER TRIP"), tx(3, "BOLT"), tx(4, "UBER EATS TRIP")];
        let index = TextIndex::build(&pool);
        let ranked = index.rank("Uber trip", &[0, 1, 2, 3], 10);
        assert_eq!(ranked, vec![1, 3, 0, 2]);
        assert_eq!(index.rank("Uber trip", &[0, 1, 2, 3], 2), vec![1, 3]);
    }

    #[test]
    fn rank_ignores_positions_outside_candidates() {
        let pool = vec![tx(1, "UBER"), tx(2, "ORLEN")];
        let index = TextIndex::build(&pool);
        assert_eq!(index.rank("uber", &[1], 5), vec![1]);
    }
}

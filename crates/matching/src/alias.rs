use std::collections::{BTreeMap, BTreeSet};

use crate::util::{edit_similarity, normalize, significant_words};

/// Same-run cache mapping a normalised merchant name to the normalised
/// transaction descriptions that look like it. Built once per run from the
/// candidate pool and then only read.
#[derive(Debug, Clone, Default)]
pub struct MerchantAliasIndex {
    clusters: BTreeMap<String, BTreeSet<String>>,
}

impl MerchantAliasIndex {
    /// Builds clusters from (merchant, candidate description) pairs. A
    /// description joins a merchant's cluster when any fragment of it (the
    /// whole text or a window of as many words as the merchant has) reaches
    /// `threshold` similarity with the merchant.
    pub fn build<'a, I>(pairs: I, threshold: f64) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut clusters: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut seen: BTreeSet<(String, String)> = BTreeSet::new();

        for (merchant, description) in pairs {
            let m = normalize(merchant);
            let d = normalize(description);
            if m.is_empty() || d.is_empty() || !seen.insert((m.clone(), d.clone())) {
                continue;
            }
            if fragments(&d, word_count(&m))
                .iter()
                .any(|frag| edit_similarity(&m, frag) >= threshold)
            {
                clusters.entry(m).or_default().insert(d);
            }
        }

        Self { clusters }
    }

    /// Both arguments must already be normalised.
    pub fn are_aliases(&self, a: &str, b: &str) -> bool {
        self.clusters.get(a).is_some_and(|c| c.contains(b))
            || self.clusters.get(b).is_some_and(|c| c.contains(a))
    }

    #[cfg(test)]
    fn cluster(&self, merchant: &str) -> Option<&BTreeSet<String>> {
        self.clusters.get(&normalize(merchant))
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

fn word_count(s: &str) -> usize {
    significant_words(s).len().max(1)
}

fn fragments(description: &str, window: usize) -> Vec<String> {
    let words = significant_words(description);
    let mut out = vec![description.to_string()];
    if words.len() >= window {
        out.extend(words.windows(window).map(|w| w.join(" ")));
    }
    out
}

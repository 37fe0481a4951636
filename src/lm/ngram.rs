//! Discounted unigram/bigram counts estimated from a training label file.
//! The producer subtracts a fixed discount from every observed bigram count
//! before normalising and records the freed mass per predecessor, so for
//! each phone `p`: `sum_q bigrams[p][q] + discounts[p] = 1`. Serialised as a
//! JSON document with those three tables.
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::warn;

/// A discounted uni/bigram model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscountedBigram {
    /// `P(q)`, sums to one over all phones.
    pub unigrams: HashMap<String, f64>,
    /// `P(q|p)` after discounting.
    pub bigrams: HashMap<String, HashMap<String, f64>>,
    /// Mass removed from each predecessor's bigrams, redistributed over the
    /// unigrams when a pair backs off.
    pub discounts: HashMap<String, f64>,
}

impl DiscountedBigram {
    /// Loads the JSON file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening uni/bigram LM '{}'", path.display()))?;
        let lm: Self = serde_json::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing uni/bigram LM '{}'", path.display()))?;
        lm.check_normalisation();
        Ok(lm)
    }

    /// The producer guarantees the probability sums; drift here means the
    /// file was edited or produced by something else, which is worth a
    /// warning but decodes fine after row renormalisation.
    fn check_normalisation(&self) {
        let uni_total: f64 = self.unigrams.values().sum();
        if (uni_total - 1.0).abs() > 1e-3 {
            warn!("unigram probabilities sum to {}, expected 1", uni_total);
        }
        for (p, row) in &self.bigrams {
            let total: f64 =
                row.values().sum::<f64>() + self.discounts.get(p).copied().unwrap_or(0.0);
            if (total - 1.0).abs() > 1e-3 {
                warn!("bigram row '{}' plus discount sums to {}, expected 1", p, total);
            }
        }
    }

    /// `P(q|p)` under the back-off scheme: the discounted bigram when the
    /// pair was observed, otherwise the discount mass times the unigram.
    /// `None` when `p` never occurred as a predecessor at all, in which case
    /// the caller falls back to plain unigrams.
    pub fn bigram(&self, p: &str, q: &str) -> Option<f64> {
        let row = self.bigrams.get(p)?;
        Some(match row.get(q) {
            Some(&prob) => prob,
            None => self.discounts.get(p).copied().unwrap_or(0.0) * self.unigram(q),
        })
    }

    /// `P(q)`, zero for phones the training data never contained.
    pub fn unigram(&self, q: &str) -> f64 {
        self.unigrams.get(q).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "unigrams": {"aa": 0.5, "bb": 0.3, "cc": 0.2},
        "bigrams": {"aa": {"bb": 0.6, "cc": 0.3}, "bb": {"aa": 0.9}},
        "discounts": {"aa": 0.1, "bb": 0.1}
    }"#;

    fn sample() -> DiscountedBigram {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn observed_pairs_use_the_discounted_bigram() {
        let lm = sample();
        assert_eq!(lm.bigram("aa", "bb"), Some(0.6));
        assert_eq!(lm.bigram("bb", "aa"), Some(0.9));
    }

    #[test]
    fn unseen_pairs_back_off_through_the_discount() {
        let lm = sample();
        // aa never preceded aa: discount * P(aa).
        let p = lm.bigram("aa", "aa").unwrap();
        assert!((p - 0.1 * 0.5).abs() < 1e-12);
    }

    #[test]
    fn unseen_predecessor_falls_back_to_unigrams() {
        let lm = sample();
        assert_eq!(lm.bigram("cc", "aa"), None);
        assert_eq!(lm.unigram("aa"), 0.5);
        assert_eq!(lm.unigram("zz"), 0.0);
    }
}

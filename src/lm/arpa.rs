//! Parser for ARPA-MIT back-off bigram files as written by HTK's `HLStats`
//! or SRILM. The format is line oriented with `\data\`, `\1-grams:`,
//! `\2-grams:` and `\end\` section markers; probabilities are log10 and the
//! bigrams are already discounted. Querying a pair that has no explicit
//! bigram backs off to `p(q) + b(p)`.
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::info;

/// Back-off weight substituted for unigrams that don't carry one. Low enough
/// that a backed-off pair is effectively impossible.
const NO_BACKOFF: f64 = -1.0e7;

/// A unigram entry: probability and back-off weight, both log10.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unigram {
    pub log_prob: f64,
    pub backoff: f64,
}

/// An ARPA-MIT back-off bigram language model.
#[derive(Debug, Clone, Default)]
pub struct ArpaBigram {
    unigrams: HashMap<String, Unigram>,
    /// `bigrams[p][q] = log10 P(q|p)`, already discounted.
    bigrams: HashMap<String, HashMap<String, f64>>,
}

impl ArpaBigram {
    /// Parses the ARPA file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening ARPA LM '{}'", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing ARPA LM '{}'", path.display()))
    }

    /// Parses ARPA text from any reader.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut unigrams = HashMap::new();
        let mut bigrams: HashMap<String, HashMap<String, f64>> = HashMap::new();
        #[derive(PartialEq)]
        enum Section {
            Preamble,
            Unigrams,
            Bigrams,
        }
        let mut section = Section::Preamble;

        for (i, line) in reader.lines().enumerate() {
            let line = line.context("reading ARPA LM")?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line.contains("1-grams") {
                section = Section::Unigrams;
            } else if line.contains("2-grams") {
                section = Section::Bigrams;
            } else if line.starts_with("\\end\\") {
                break;
            } else if section == Section::Unigrams {
                let fields = line.split_whitespace().collect::<Vec<_>>();
                if fields.len() < 2 {
                    bail!("bad 1-gram at line {}: '{}'", i + 1, line);
                }
                let log_prob = parse_log10(fields[0], i)?;
                let backoff = match fields.get(2) {
                    Some(b) => parse_log10(b, i)?,
                    None => NO_BACKOFF,
                };
                unigrams.insert(fields[1].to_string(), Unigram { log_prob, backoff });
            } else if section == Section::Bigrams {
                let fields = line.split_whitespace().collect::<Vec<_>>();
                if fields.len() != 3 {
                    bail!("bad 2-gram at line {}: '{}'", i + 1, line);
                }
                let log_prob = parse_log10(fields[0], i)?;
                bigrams
                    .entry(fields[1].to_string())
                    .or_default()
                    .insert(fields[2].to_string(), log_prob);
            }
        }
        info!(
            "parsed {} 1-grams and {} 2-grams",
            unigrams.len(),
            bigrams.values().map(|m| m.len()).sum::<usize>()
        );
        Ok(Self { unigrams, bigrams })
    }

    /// Phones known to the model, i.e. every possible successor.
    pub fn phones(&self) -> impl Iterator<Item = &str> {
        self.unigrams.keys().map(|s| s.as_str())
    }

    /// `log10 P(q|p)`, backing off to `p(q) + b(p)` when the pair has no
    /// explicit bigram. Returns `None` if either phone is unknown.
    pub fn log_prob(&self, p: &str, q: &str) -> Option<f64> {
        if let Some(&lp) = self.bigrams.get(p).and_then(|row| row.get(q)) {
            return Some(lp);
        }
        let uni = self.unigrams.get(q)?;
        let backoff = self.unigrams.get(p)?.backoff;
        Some(uni.log_prob + backoff)
    }

    /// Replaces explicit bigrams that fall under `threshold` (log10) or
    /// under their own back-off estimate with the back-off estimate, then
    /// renormalises each predecessor's explicit row to sum to one.
    ///
    /// The reference decoder carries this pass but leaves it disabled; it is
    /// exposed behind [`crate::config::DecoderConfig::renormalise_backoff`]
    /// so runs with and without it can be compared.
    pub fn renormalise(&mut self, threshold: f64) {
        for (p, row) in self.bigrams.iter_mut() {
            let backoff = self
                .unigrams
                .get(p)
                .map(|u| u.backoff)
                .unwrap_or(NO_BACKOFF);
            let mut total = 0.0;
            for (q, log_prob) in row.iter_mut() {
                let backed_off = self
                    .unigrams
                    .get(q)
                    .map(|u| u.log_prob + backoff)
                    .unwrap_or(NO_BACKOFF);
                if *log_prob < backed_off || *log_prob < threshold {
                    *log_prob = backed_off;
                }
                total += 10f64.powf(*log_prob);
            }
            let log_total = total.log10();
            for log_prob in row.values_mut() {
                *log_prob -= log_total;
            }
        }
    }
}

fn parse_log10(token: &str, i: usize) -> anyhow::Result<f64> {
    token
        .parse::<f64>()
        .with_context(|| format!("bad log10 probability '{}' at line {}", token, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
\data\
ngram 1=3
ngram 2=3

\1-grams:
-0.5 aa -0.2
-0.7 bb -0.4
-1.0 cc

\2-grams:
-0.1 aa bb
-0.9 aa cc
-0.3 bb aa

\end\
"#;

    #[test]
    fn parses_sections_and_backs_off() {
        let lm = ArpaBigram::from_reader(io::Cursor::new(SAMPLE)).unwrap();
        assert_eq!(lm.phones().count(), 3);
        // Explicit bigram.
        assert_eq!(lm.log_prob("aa", "bb"), Some(-0.1));
        // Backed off: p(bb) + b(cc) -- cc has no backoff weight so the pair
        // is effectively impossible.
        assert!(lm.log_prob("cc", "bb").unwrap() < -1.0e6);
        // Backed off with a real weight: p(cc) + b(bb).
        let lp = lm.log_prob("bb", "cc").unwrap();
        assert!((lp - (-1.0 + -0.4)).abs() < 1e-12);
        assert_eq!(lm.log_prob("zz", "aa"), None);
    }

    #[test]
    fn malformed_bigram_line_is_fatal() {
        let bad = SAMPLE.replace("-0.1 aa bb", "-0.1 aa");
        let err = ArpaBigram::from_reader(io::Cursor::new(bad)).unwrap_err();
        assert!(format!("{:#}", err).contains("2-gram"), "{:#}", err);
    }

    #[test]
    fn renormalise_makes_explicit_rows_stochastic() {
        let mut lm = ArpaBigram::from_reader(io::Cursor::new(SAMPLE)).unwrap();
        lm.renormalise(-10.0);
        let total = 10f64.powf(lm.log_prob("aa", "bb").unwrap())
            + 10f64.powf(lm.log_prob("aa", "cc").unwrap());
        assert!((total - 1.0).abs() < 1e-9, "row sums to {}", total);
    }
}

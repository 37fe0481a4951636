//! Parser for bigram language models written as a square text matrix. Each
//! line is a row: the phone name followed by `P(successor|phone)` for every
//! phone in row order. Repeated probabilities may be run-length encoded as
//! `value*count`, which HTK's tooling emits for the long stretches of
//! identical smoothed values.
use anyhow::{ensure, Context};
use ndarray::Array2;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

/// A bigram model read from a square labelled matrix.
#[derive(Debug, Clone, Default)]
pub struct MatrixBigram {
    /// Row (and column) labels in file order.
    pub phones: Vec<String>,
    /// `probs[[i, j]] = P(phones[j] | phones[i])`.
    pub probs: Array2<f64>,
}

impl MatrixBigram {
    /// Parses the matrix file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening matrix bigram '{}'", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing matrix bigram '{}'", path.display()))
    }

    /// Parses matrix text from any reader.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        // First gather every row so the expected width is known, then expand
        // the run-length syntax.
        let mut phones = Vec::new();
        let mut rows = Vec::new();
        for (i, line) in reader.lines().enumerate() {
            let line = line.context("reading matrix bigram")?;
            if line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let phone = fields
                .next()
                .with_context(|| format!("missing row label at line {}", i + 1))?
                .to_string();
            phones.push(phone);
            rows.push((i, fields.map(|f| f.to_string()).collect::<Vec<_>>()));
        }

        let n = phones.len();
        ensure!(n > 0, "matrix bigram is empty");
        let mut probs = Array2::zeros((n, n));
        for (row_idx, (line_idx, tokens)) in rows.into_iter().enumerate() {
            let mut col = 0;
            for token in tokens {
                let (value, count) = match token.split_once('*') {
                    Some((v, c)) => {
                        let count = c.parse::<usize>().with_context(|| {
                            format!("bad run length '{}' at line {}", token, line_idx + 1)
                        })?;
                        (v, count)
                    }
                    None => (token.as_str(), 1),
                };
                let value = value.parse::<f64>().with_context(|| {
                    format!("bad probability '{}' at line {}", token, line_idx + 1)
                })?;
                ensure!(
                    col + count <= n,
                    "row '{}' at line {} has more than {} entries",
                    phones[row_idx],
                    line_idx + 1,
                    n
                );
                for _ in 0..count {
                    probs[[row_idx, col]] = value;
                    col += 1;
                }
            }
            ensure!(
                col == n,
                "row '{}' at line {} has {} entries, expected {}",
                phones[row_idx],
                line_idx + 1,
                col,
                n
            );
        }
        Ok(Self { phones, probs })
    }

    /// Row/column index of a phone.
    pub fn index(&self, phone: &str) -> Option<usize> {
        self.phones.iter().position(|p| p == phone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_run_length_rows() {
        let text = "aa 0.5 0.25*2\nbb 0.1 0.8 0.1\ncc 1.0 0.0*2\n";
        let lm = MatrixBigram::from_reader(io::Cursor::new(text)).unwrap();
        assert_eq!(lm.phones, vec!["aa", "bb", "cc"]);
        assert_eq!(lm.probs[[0, 0]], 0.5);
        assert_eq!(lm.probs[[0, 1]], 0.25);
        assert_eq!(lm.probs[[0, 2]], 0.25);
        assert_eq!(lm.probs[[1, 1]], 0.8);
        assert_eq!(lm.probs[[2, 0]], 1.0);
        assert_eq!(lm.index("bb"), Some(1));
        assert_eq!(lm.index("zz"), None);
    }

    #[test]
    fn ragged_rows_are_fatal() {
        let short = "aa 0.5 0.5\nbb 1.0\n";
        assert!(MatrixBigram::from_reader(io::Cursor::new(short)).is_err());
        let long = "aa 0.5 0.5 0.5\nbb 0.5 0.5*2\n";
        assert!(MatrixBigram::from_reader(io::Cursor::new(long)).is_err());
    }
}

//! Phone language models. Each submodule parses one file format into owned
//! records; turning those records into actual inter-phone transition
//! probabilities is the assembler's job ([`crate::transitions`]), the
//! parsers never touch the matrix.
use anyhow::Context;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

pub mod arpa;
pub mod matrix;
pub mod ngram;
pub mod wordnet;

pub use arpa::ArpaBigram;
pub use matrix::MatrixBigram;
pub use ngram::DiscountedBigram;
pub use wordnet::Wordnet;

/// The source of inter-phone transition probabilities for a decoding run.
#[derive(Debug, Clone)]
pub enum LanguageModel {
    /// No language model, exit mass is spread evenly over successor phones.
    Uniform,
    /// ARPA-MIT back-off bigram file.
    Arpa(ArpaBigram),
    /// Square bigram matrix with row labels.
    Matrix(MatrixBigram),
    /// Discounted unigram/bigram counts produced from a training label file.
    Ngram(DiscountedBigram),
    /// HTK wordnet with bigram log-probabilities on the arcs.
    Wordnet(Wordnet),
}

impl LanguageModel {
    /// Opens the bigram file behind `--b`, working out whether it is
    /// ARPA-MIT or matrix format from the `\data\` header.
    pub fn open_bigram(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("opening bigram LM '{}'", path.display()))?;
        let lm = if text.lines().any(|l| l.trim() == "\\data\\") {
            info!("'{}' looks like an ARPA-MIT bigram", path.display());
            Self::Arpa(ArpaBigram::from_reader(io::Cursor::new(text))?)
        } else {
            info!("'{}' looks like a matrix bigram", path.display());
            Self::Matrix(MatrixBigram::from_reader(io::Cursor::new(text))?)
        };
        Ok(lm)
    }

    /// Opens a wordnet file for `--w`.
    pub fn open_wordnet(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::Wordnet(Wordnet::open(path)?))
    }

    /// Opens a discounted uni/bigram JSON file for `--ub`.
    pub fn open_ngram(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::Ngram(DiscountedBigram::open(path)?))
    }

    /// Whether decoding should be constrained to start and end on the
    /// sentence sentinels. True for every real language model, only the
    /// uniform fallback leaves the endpoints free.
    pub fn constrains_endpoints(&self) -> bool {
        !matches!(self, Self::Uniform)
    }
}

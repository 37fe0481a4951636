#![doc = include_str!("../README.md")]
use crate::features::{DimensionMismatch, Features};
use crate::gmm::StateGmm;
use crate::viterbi::Endpoints;
use anyhow::Context;
use ndarray::Array2;
use std::env;
use std::fs;
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod config;
pub mod features;
pub mod gmm;
pub mod hmm;
pub mod lm;
pub mod mlf;
pub mod pool;
pub mod transitions;
pub mod viterbi;

pub use config::DecoderConfig;
pub use hmm::HmmSet;
pub use lm::LanguageModel;

/// Everything shared between decode workers: the evaluation-ready mixtures,
/// the composed log-domain transition matrix and the endpoint constraints.
/// Immutable once built, so utterances can be decoded from any number of
/// threads at once.
pub struct PhoneDecoder {
    hmm: HmmSet,
    gmms: Vec<StateGmm>,
    /// Assembled probability-domain matrix, kept for dumping and checking.
    transitions: Array2<f64>,
    log_transitions: Array2<f64>,
    endpoints: Option<Endpoints>,
    config: DecoderConfig,
}

/// What happened over a whole corpus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub decoded: usize,
    pub failed: usize,
}

impl PhoneDecoder {
    /// Builds the decoding context from a parsed model and a language
    /// model. This is where all the per-process work happens: mixture
    /// precompute, transition assembly and the log transform.
    pub fn new(hmm: HmmSet, lm: &LanguageModel, config: DecoderConfig) -> anyhow::Result<Self> {
        let gmms = gmm::precompute(&hmm)?;
        let transitions = transitions::assemble(&hmm, lm, &config)?;
        let log_transitions = transitions::log_with_penalty(&transitions, &hmm, &config);
        let endpoints = if lm.constrains_endpoints() {
            Some(find_endpoints(&hmm, &config)?)
        } else {
            None
        };
        Ok(Self {
            hmm,
            gmms,
            transitions,
            log_transitions,
            endpoints,
            config,
        })
    }

    /// The parsed model this decoder was built from.
    pub fn model(&self) -> &HmmSet {
        &self.hmm
    }

    /// The configuration in force.
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// The assembled probability-domain transition matrix.
    pub fn transitions(&self) -> &Array2<f64> {
        &self.transitions
    }

    /// Decodes a single feature file into its MLF record.
    pub fn decode_utterance(&self, source: &Path, style: mlf::Style) -> anyhow::Result<String> {
        let feats = Features::open(source)?;
        if feats.dim() != self.hmm.dim {
            return Err(DimensionMismatch {
                feature_dim: feats.dim(),
                model_dim: self.hmm.dim,
            }
            .into());
        }
        let start = Instant::now();
        let ll = gmm::log_likelihoods(&self.gmms, feats.frames.view());
        let path = viterbi::decode(ll.view(), self.log_transitions.view(), self.endpoints);
        info!(
            "decoded '{}' ({} frames) in {:?}",
            source.display(),
            feats.len(),
            start.elapsed()
        );
        Ok(mlf::format_record(source, &path, &self.hmm, style))
    }

    /// Decodes every utterance listed in the SCP file and writes the MLF.
    ///
    /// Per-utterance failures are logged and counted but don't stop the
    /// run, with one exception: a feature file whose dimensionality doesn't
    /// match the model means the whole batch is wrong, so that aborts. The
    /// output file is only created once decoding finished, so a run that
    /// dies while loading models leaves nothing half-written behind.
    pub fn decode_corpus(
        &self,
        scp: &Path,
        output: &Path,
        style: mlf::Style,
    ) -> anyhow::Result<RunSummary> {
        let sources = read_scp(scp)?;
        info!(
            "decoding {} utterances from '{}'",
            sources.len(),
            scp.display()
        );

        let outcomes = pool::decode_all(self, sources, style);

        let mut records = Vec::with_capacity(outcomes.len());
        let mut failed = 0;
        for outcome in &outcomes {
            match &outcome.record {
                Ok(record) => records.push(record),
                Err(e) => {
                    if e.downcast_ref::<DimensionMismatch>().is_some() {
                        anyhow::bail!(
                            "'{}' cannot come from this model: {:#}",
                            outcome.source.display(),
                            e
                        );
                    }
                    error!("skipping '{}': {:#}", outcome.source.display(), e);
                    failed += 1;
                }
            }
        }

        mlf::write_mlf(output, records.iter().copied())?;
        let summary = RunSummary {
            decoded: records.len(),
            failed,
        };
        info!(
            "wrote {} records to '{}', {} utterances failed",
            summary.decoded,
            output.display(),
            summary.failed
        );
        Ok(summary)
    }

    /// Saves the assembled probability-domain transition matrix as a `.npy`
    /// for inspection from numpy.
    pub fn dump_transitions(&self, path: &Path) -> anyhow::Result<()> {
        ndarray_npy::write_npy(path, &self.transitions)
            .with_context(|| format!("writing transitions to '{}'", path.display()))
    }
}

/// Resolves the endpoint constraints: the first emitting state of whichever
/// start sentinel the model contains and the last emitting state of
/// whichever end sentinel it contains.
fn find_endpoints(hmm: &HmmSet, cfg: &DecoderConfig) -> anyhow::Result<Endpoints> {
    let start = cfg
        .start_labels
        .iter()
        .find_map(|l| hmm.phone_index(l))
        .map(|i| hmm.phones[i].first_state());
    let end = cfg
        .end_labels
        .iter()
        .find_map(|l| hmm.phone_index(l))
        .map(|i| hmm.phones[i].last_state());
    match (start, end) {
        (Some(start), Some(end)) => Ok(Endpoints { start, end }),
        _ => anyhow::bail!(
            "the language model needs sentence sentinels but the model defines none of {:?} / {:?}",
            cfg.start_labels,
            cfg.end_labels
        ),
    }
}

/// Reads the newline-separated list of feature files to decode.
fn read_scp(path: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let file =
        fs::File::open(path).with_context(|| format!("opening SCP file '{}'", path.display()))?;
    let mut sources = Vec::new();
    for line in io::BufReader::new(file).lines() {
        let line = line.with_context(|| format!("reading SCP file '{}'", path.display()))?;
        let line = line.trim();
        if !line.is_empty() {
            sources.push(PathBuf::from(line));
        }
    }
    Ok(sources)
}

/// Convenience function to setup logging for any binaries I create.
/// Automatically sets the library and the decoder binary to `info` logging
/// by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("phone_rec=info,decoder=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use std::io::Cursor;

    /// !ENTER / A / B / !EXIT over one dimensional features, three emitting
    /// states for the real phones, one for the sentinels. A sits around 0.0
    /// and B around 10.0.
    const PIPELINE_DEFS: &str = r#"~h "!ENTER"
<NUMSTATES> 3
<STATE> 2
<MEAN> 1
 -5.0
<VARIANCE> 1
 1.0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.1 0.9
 0.0 0.0 0.0
~h "A"
<NUMSTATES> 5
<STATE> 2
<MEAN> 1
 0.0
<VARIANCE> 1
 1.0
<STATE> 3
<MEAN> 1
 0.5
<VARIANCE> 1
 1.0
<STATE> 4
<MEAN> 1
 1.0
<VARIANCE> 1
 1.0
<TRANSP> 5
 0.0 1.0 0.0 0.0 0.0
 0.0 0.5 0.5 0.0 0.0
 0.0 0.0 0.5 0.5 0.0
 0.0 0.0 0.0 0.5 0.5
 0.0 0.0 0.0 0.0 0.0
~h "B"
<NUMSTATES> 5
<STATE> 2
<MEAN> 1
 10.0
<VARIANCE> 1
 1.0
<STATE> 3
<MEAN> 1
 10.5
<VARIANCE> 1
 1.0
<STATE> 4
<MEAN> 1
 11.0
<VARIANCE> 1
 1.0
<TRANSP> 5
 0.0 1.0 0.0 0.0 0.0
 0.0 0.5 0.5 0.0 0.0
 0.0 0.0 0.5 0.5 0.0
 0.0 0.0 0.0 0.5 0.5
 0.0 0.0 0.0 0.0 0.0
~h "!EXIT"
<NUMSTATES> 3
<STATE> 2
<MEAN> 1
 15.0
<VARIANCE> 1
 1.0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.1 0.9
 0.0 0.0 0.0
"#;

    fn pipeline_model() -> HmmSet {
        HmmSet::from_reader(Cursor::new(PIPELINE_DEFS)).unwrap()
    }

    fn decode_path(decoder: &PhoneDecoder, frames: &Array2<f32>) -> Vec<usize> {
        let ll = gmm::log_likelihoods(&decoder.gmms, frames.view());
        viterbi::decode(ll.view(), decoder.log_transitions.view(), decoder.endpoints)
            .iter()
            .map(|s| s.state)
            .collect()
    }

    fn phone_sequence(decoder: &PhoneDecoder, frames: &Array2<f32>) -> Vec<String> {
        let map = decoder.hmm.state_phones();
        let mut phones: Vec<String> = Vec::new();
        for state in decode_path(decoder, frames) {
            let name = decoder.hmm.phones[map[state]].name.clone();
            if phones.last() != Some(&name) {
                phones.push(name);
            }
        }
        phones
    }

    #[test]
    fn frames_on_the_state_means_recover_the_phone_order() {
        let decoder = PhoneDecoder::new(
            pipeline_model(),
            &LanguageModel::Uniform,
            DecoderConfig::default(),
        )
        .unwrap();
        // Three frames tracing A's state means then three tracing B's.
        let frames = arr2(&[[0.0f32], [0.5], [1.0], [10.0], [10.5], [11.0]]);
        assert_eq!(phone_sequence(&decoder, &frames), vec!["A", "B"]);
    }

    #[test]
    fn a_language_model_pins_the_sentinels() {
        let lm = LanguageModel::Matrix(
            lm::MatrixBigram::from_reader(Cursor::new(
                "!ENTER 0.0 1.0 0.0 0.0\nA 0.0 0.0 1.0 0.0\nB 0.0 0.0 0.0 1.0\n!EXIT 0.0 0.0 0.0 1.0\n",
            ))
            .unwrap(),
        );
        let decoder = PhoneDecoder::new(pipeline_model(), &lm, DecoderConfig::default()).unwrap();
        let frames = arr2(&[
            [-5.0f32],
            [0.0],
            [0.5],
            [1.0],
            [10.0],
            [10.5],
            [11.0],
            [15.0],
        ]);
        assert_eq!(
            phone_sequence(&decoder, &frames),
            vec!["!ENTER", "A", "B", "!EXIT"]
        );
    }

    #[test]
    fn a_huge_insertion_penalty_collapses_ambiguous_input() {
        let cheap = PhoneDecoder::new(
            pipeline_model(),
            &LanguageModel::Uniform,
            DecoderConfig {
                insertion_penalty: 0.0,
                ..DecoderConfig::default()
            },
        )
        .unwrap();
        let expensive = PhoneDecoder::new(
            pipeline_model(),
            &LanguageModel::Uniform,
            DecoderConfig {
                insertion_penalty: 100.0,
                ..DecoderConfig::default()
            },
        )
        .unwrap();
        // Twenty frames alternating between A and B territory in blocks of
        // three, so a cheap decoder can track every block.
        let mut rows = Vec::new();
        for i in 0..20 {
            rows.push([if (i / 3) % 2 == 0 { 0.5f32 } else { 10.5 }]);
        }
        let frames = Array2::from(rows);
        assert!(phone_sequence(&cheap, &frames).len() > 1);
        assert_eq!(phone_sequence(&expensive, &frames).len(), 1);
    }

    #[test]
    fn arpa_self_loops_win_ambiguous_frames() {
        // A -> A at log10 0.9 and A -> B at log10 0.1: with frames that fit
        // A and B about equally the path should settle in A before it ever
        // reaches B.
        let arpa = "\\data\\\n\\1-grams:\n-1.0 !ENTER -0.5\n-0.3 A -0.5\n-0.3 B -0.5\n-1.0 !EXIT -0.5\n\\2-grams:\n-0.046 A A\n-1.0 A B\n\\end\\\n";
        let lm = LanguageModel::Arpa(lm::ArpaBigram::from_reader(Cursor::new(arpa)).unwrap());
        let decoder = PhoneDecoder::new(pipeline_model(), &lm, DecoderConfig::default()).unwrap();
        let frames = arr2(&[
            [-5.0f32],
            [5.25],
            [5.25],
            [5.25],
            [5.25],
            [5.25],
            [5.25],
            [5.25],
            [15.0],
        ]);
        let seq = phone_sequence(&decoder, &frames);
        let first_a = seq.iter().position(|p| p == "A");
        let first_b = seq.iter().position(|p| p == "B");
        match (first_a, first_b) {
            (Some(a), Some(b)) => assert!(a < b, "A should come before B in {:?}", seq),
            (Some(_), None) => {}
            _ => panic!("expected A in the sequence, got {:?}", seq),
        }
    }
}

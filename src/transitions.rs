//! Builds the global state-to-state transition matrix. The parsed model
//! already carries every intra-phone block; what's missing is the
//! probability of moving from the last emitting state of one phone to the
//! first emitting state of another. Each phone's last-state row is short of
//! probability mass by exactly its exit probability, and that mass gets
//! distributed over successor phones according to the language model, then
//! the row is renormalised. Finally the whole matrix moves to the log
//! domain where the grammar scale factor and insertion penalty are applied
//! to the inter-phone entries.
//!
//! Sentence sentinels get special treatment: start sentinels never receive
//! inter-phone mass (nothing re-enters the start of a sentence) and end
//! sentinel rows are forced absorbing so the best path can finish there and
//! stay. A model whose start and end sentinel are the same phone (silence
//! marking both ends of an utterance) gets no special treatment here at
//! all, such a phone has to stay an ordinary, leavable phone.
use crate::config::{DecoderConfig, EPSILON, EPSILON_LOG};
use crate::hmm::HmmSet;
use crate::lm::{ArpaBigram, DiscountedBigram, LanguageModel, MatrixBigram, Wordnet};
use anyhow::{ensure, Context};
use ndarray::Array2;
use std::borrow::Cow;
use tracing::{debug, info};

/// Sentinel phones resolved against a concrete model, by phone index.
#[derive(Debug, Clone, Copy, Default)]
struct Sentinels {
    start: Option<usize>,
    end: Option<usize>,
}

impl Sentinels {
    fn resolve(hmm: &HmmSet, cfg: &DecoderConfig) -> Self {
        let start = cfg.start_labels.iter().find_map(|l| hmm.phone_index(l));
        let end = cfg.end_labels.iter().find_map(|l| hmm.phone_index(l));
        match (start, end) {
            // One phone marking both ends of a sentence can't be absorbing
            // or unreachable, it would trap every path.
            (Some(s), Some(e)) if s == e => Self::default(),
            _ => Self { start, end },
        }
    }

    fn is_start(&self, phone: usize) -> bool {
        self.start == Some(phone)
    }

    fn is_end(&self, phone: usize) -> bool {
        self.end == Some(phone)
    }
}

/// Composes the full probability-domain transition matrix from the model's
/// intra-phone blocks and a language model. Every row of the result is
/// checked to be stochastic within [`EPSILON`]; a row that can't be made so
/// means the model and LM don't describe the same phone set and the run is
/// aborted.
pub fn assemble(
    hmm: &HmmSet,
    lm: &LanguageModel,
    cfg: &DecoderConfig,
) -> anyhow::Result<Array2<f64>> {
    let mut trans = hmm.transitions.clone();
    let sentinels = Sentinels::resolve(hmm, cfg);
    // Exit mass per phone, taken from the pristine intra-only rows before
    // any distribution touches them.
    let exit_mass = hmm
        .phones
        .iter()
        .map(|p| 1.0 - trans.row(p.last_state()).sum())
        .collect::<Vec<_>>();

    // Rows a language model never mentions keep their missing exit mass,
    // which the final validation reports as a model/LM mismatch; only rows
    // the distribution actually touched are renormalised.
    let mut touched = vec![false; hmm.phones.len()];

    match lm {
        LanguageModel::Uniform => {
            distribute_uniform(hmm, &mut trans, &exit_mass, sentinels, &mut touched)
        }
        LanguageModel::Ngram(ngram) => {
            distribute_ngram(hmm, &mut trans, &exit_mass, ngram, cfg, sentinels, &mut touched)
        }
        LanguageModel::Arpa(arpa) => {
            let arpa = if cfg.renormalise_backoff {
                let mut renormed = arpa.clone();
                renormed.renormalise(cfg.threshold_bigrams);
                Cow::Owned(renormed)
            } else {
                Cow::Borrowed(arpa)
            };
            distribute_arpa(hmm, &mut trans, &exit_mass, &arpa, sentinels, &mut touched)?
        }
        LanguageModel::Matrix(matrix) => {
            distribute_matrix(hmm, &mut trans, &exit_mass, matrix, sentinels, &mut touched)?
        }
        LanguageModel::Wordnet(net) => {
            distribute_wordnet(hmm, &mut trans, &exit_mass, net, sentinels, &mut touched)?
        }
    }

    finish(hmm, &mut trans, sentinels, &touched)?;
    Ok(trans)
}

/// Log-transforms an assembled matrix and applies the grammar scale factor
/// and insertion penalty to the inter-phone entries (last emitting state of
/// one phone to first emitting state of another).
pub fn log_with_penalty(probs: &Array2<f64>, hmm: &HmmSet, cfg: &DecoderConfig) -> Array2<f64> {
    let mut log_trans = probs.mapv(|v| (v + EPSILON_LOG).ln());
    for p in &hmm.phones {
        for q in &hmm.phones {
            let cell = &mut log_trans[[p.last_state(), q.first_state()]];
            *cell = *cell * cfg.scale_factor - cfg.insertion_penalty;
        }
    }
    info!(
        "insertion penalty {} and grammar scale factor {}",
        cfg.insertion_penalty, cfg.scale_factor
    );
    log_trans
}

/// No language model: exit mass spread evenly over every phone that isn't a
/// start sentinel.
fn distribute_uniform(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    exit_mass: &[f64],
    sentinels: Sentinels,
    touched: &mut [bool],
) {
    let targets = (hmm.phones.len() - sentinels.start.map_or(0, |_| 1)).max(1) as f64;
    for (p_idx, p) in hmm.phones.iter().enumerate() {
        if sentinels.is_end(p_idx) {
            continue;
        }
        touched[p_idx] = true;
        let row = p.last_state();
        for (q_idx, q) in hmm.phones.iter().enumerate() {
            trans[[row, q.first_state()]] = if sentinels.is_start(q_idx) {
                0.0
            } else {
                exit_mass[p_idx] / targets
            };
        }
    }
}

/// Discounted uni/bigram counts: observed pairs use the discounted bigram,
/// unobserved pairs the discount mass times the successor unigram, phones
/// never seen as a predecessor (or `unigrams_only` runs) plain unigrams.
fn distribute_ngram(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    exit_mass: &[f64],
    lm: &DiscountedBigram,
    cfg: &DecoderConfig,
    sentinels: Sentinels,
    touched: &mut [bool],
) {
    for (p_idx, p) in hmm.phones.iter().enumerate() {
        if sentinels.is_end(p_idx) {
            continue;
        }
        touched[p_idx] = true;
        let row = p.last_state();
        for (q_idx, q) in hmm.phones.iter().enumerate() {
            let value = if sentinels.is_start(q_idx) {
                0.0
            } else {
                let bigram = if cfg.unigrams_only {
                    None
                } else {
                    lm.bigram(&p.name, &q.name)
                };
                exit_mass[p_idx] * bigram.unwrap_or_else(|| lm.unigram(&q.name))
            };
            trans[[row, q.first_state()]] = value;
        }
    }
}

/// ARPA back-off bigrams: `beta * 10^log10 P(q|p)` over every phone pair
/// the LM knows. Phones in the LM but not the model abort the run.
fn distribute_arpa(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    exit_mass: &[f64],
    lm: &ArpaBigram,
    sentinels: Sentinels,
    touched: &mut [bool],
) -> anyhow::Result<()> {
    for p_name in lm.phones() {
        let p_idx = hmm
            .phone_index(p_name)
            .with_context(|| format!("phone '{}' is in the LM but not the model", p_name))?;
        let p = &hmm.phones[p_idx];
        if sentinels.is_end(p_idx) {
            continue;
        }
        touched[p_idx] = true;
        let beta = exit_mass[p_idx];
        ensure!(
            beta > 0.0,
            "phone '{}' has no exit probability to distribute",
            p.name
        );
        let row = p.last_state();
        for q_name in lm.phones() {
            let q_idx = hmm
                .phone_index(q_name)
                .with_context(|| format!("phone '{}' is in the LM but not the model", q_name))?;
            trans[[row, hmm.phones[q_idx].first_state()]] = if sentinels.is_start(q_idx) {
                0.0
            } else {
                let log_prob = lm.log_prob(p_name, q_name).unwrap_or(f64::NEG_INFINITY);
                beta * 10f64.powf(log_prob)
            };
        }
    }
    Ok(())
}

/// Matrix bigrams: `beta * P(q|p)` read straight out of the matrix.
fn distribute_matrix(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    exit_mass: &[f64],
    lm: &MatrixBigram,
    sentinels: Sentinels,
    touched: &mut [bool],
) -> anyhow::Result<()> {
    for (i, p_name) in lm.phones.iter().enumerate() {
        let p_idx = hmm
            .phone_index(p_name)
            .with_context(|| format!("phone '{}' is in the LM but not the model", p_name))?;
        let p = &hmm.phones[p_idx];
        if sentinels.is_end(p_idx) {
            continue;
        }
        touched[p_idx] = true;
        let beta = exit_mass[p_idx];
        ensure!(
            beta > 0.0,
            "phone '{}' has no exit probability to distribute",
            p.name
        );
        let row = p.last_state();
        for (j, q_name) in lm.phones.iter().enumerate() {
            let q_idx = hmm
                .phone_index(q_name)
                .with_context(|| format!("phone '{}' is in the LM but not the model", q_name))?;
            trans[[row, hmm.phones[q_idx].first_state()]] = if sentinels.is_start(q_idx) {
                0.0
            } else {
                beta * lm.probs[[i, j]]
            };
        }
    }
    Ok(())
}

/// Wordnet arcs: `beta * exp(l)` per arc, everything without an arc stays
/// impossible.
fn distribute_wordnet(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    exit_mass: &[f64],
    net: &Wordnet,
    sentinels: Sentinels,
    touched: &mut [bool],
) -> anyhow::Result<()> {
    for arc in &net.arcs {
        let p_name = net.word(arc.from)?;
        let q_name = net.word(arc.to)?;
        let p_idx = hmm
            .phone_index(p_name)
            .with_context(|| format!("phone '{}' is in the wordnet but not the model", p_name))?;
        let q_idx = hmm
            .phone_index(q_name)
            .with_context(|| format!("phone '{}' is in the wordnet but not the model", q_name))?;
        if sentinels.is_end(p_idx) || sentinels.is_start(q_idx) {
            continue;
        }
        touched[p_idx] = true;
        let (p, q) = (&hmm.phones[p_idx], &hmm.phones[q_idx]);
        trans[[p.last_state(), q.first_state()]] = exit_mass[p_idx] * arc.log_prob.exp();
    }
    Ok(())
}

/// Forces end sentinel rows absorbing, renormalises every distributed row
/// and checks the whole matrix is row-stochastic.
fn finish(
    hmm: &HmmSet,
    trans: &mut Array2<f64>,
    sentinels: Sentinels,
    touched: &[bool],
) -> anyhow::Result<()> {
    for (p_idx, p) in hmm.phones.iter().enumerate() {
        let row = p.last_state();
        if sentinels.is_end(p_idx) {
            trans.row_mut(row).fill(0.0);
            trans[[row, row]] = 1.0;
            continue;
        }
        if !touched[p_idx] {
            continue;
        }
        let sum = trans.row(row).sum();
        ensure!(
            sum > 0.0,
            "phone '{}' ends up with no outgoing probability; the LM doesn't cover it",
            p.name
        );
        trans.row_mut(row).mapv_inplace(|v| v / sum);
        debug!("row of '{}' renormalised from {}", p.name, sum);
    }
    for (i, row) in trans.rows().into_iter().enumerate() {
        let sum = row.sum();
        ensure!(
            (sum - 1.0).abs() < EPSILON,
            "transition row {} sums to {} after assembly",
            i,
            sum
        );
    }
    Ok(())
}

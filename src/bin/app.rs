use clap::{ArgGroup, Parser};
use phone_rec::hmm::HmmSet;
use phone_rec::lm::LanguageModel;
use phone_rec::mlf::Style;
use phone_rec::{DecoderConfig, PhoneDecoder};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(group(ArgGroup::new("lm").args(["bigram", "wordnet", "unibigram"])))]
pub struct Args {
    /// Master label file to write the decoded phone sequences to
    output: PathBuf,
    /// SCP file: newline separated list of feature files to decode
    scp: PathBuf,
    /// HTK HMMDEFS file holding the acoustic models
    hmm: PathBuf,
    /// Phone insertion penalty, subtracted from every inter-phone log
    /// transition
    #[clap(long = "p", default_value_t = 2.5)]
    insertion_penalty: f64,
    /// Grammar scale factor applied to inter-phone log transitions
    #[clap(long = "s", default_value_t = 1.0)]
    scale_factor: f64,
    /// Bigram language model, ARPA-MIT or matrix format (auto-detected)
    #[clap(long = "b")]
    bigram: Option<PathBuf>,
    /// HTK wordnet with bigram log-probabilities on the arcs
    #[clap(long = "w")]
    wordnet: Option<PathBuf>,
    /// Discounted unigram/bigram JSON produced from a training MLF
    #[clap(long = "ub")]
    unibigram: Option<PathBuf>,
    /// With --ub, ignore the bigrams and distribute by unigrams alone
    #[clap(long)]
    unigrams_only: bool,
    /// With an ARPA bigram, renormalise rows after thresholded back-off
    #[clap(long)]
    renormalise_backoff: bool,
    /// Emit state-level labels with posteriors instead of phones only
    #[clap(long)]
    per_state: bool,
    /// Saves the assembled transition matrix as .npy for debugging
    #[clap(long)]
    dump_transitions: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    phone_rec::setup_logging();
    let args = Args::parse();

    let config = DecoderConfig {
        insertion_penalty: args.insertion_penalty,
        scale_factor: args.scale_factor,
        unigrams_only: args.unigrams_only,
        renormalise_backoff: args.renormalise_backoff,
        ..DecoderConfig::default()
    };

    let lm = if let Some(path) = &args.bigram {
        info!("transitions between phones from the bigram LM '{}'", path.display());
        LanguageModel::open_bigram(path)?
    } else if let Some(path) = &args.wordnet {
        info!("transitions between phones from the wordnet '{}'", path.display());
        LanguageModel::open_wordnet(path)?
    } else if let Some(path) = &args.unibigram {
        info!(
            "transitions between phones from the discounted bigram LM '{}'",
            path.display()
        );
        LanguageModel::open_ngram(path)?
    } else {
        info!("transitions between phones are uniform");
        LanguageModel::Uniform
    };

    info!("Loading models");
    let hmm = HmmSet::open(&args.hmm)?;
    let decoder = PhoneDecoder::new(hmm, &lm, config)?;

    if let Some(path) = &args.dump_transitions {
        decoder.dump_transitions(path)?;
    }

    let style = if args.per_state {
        Style::PerState
    } else {
        Style::Phones
    };
    decoder.decode_corpus(&args.scp, &args.output, style)?;
    Ok(())
}

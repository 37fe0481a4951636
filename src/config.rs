//! All the knobs that influence transition assembly and decoding live in one
//! immutable record so that the assembler, decoder and CLI agree on defaults.

/// Tolerance for checking that assembled transition rows are stochastic.
pub const EPSILON: f64 = 1e-6;

/// Added to every probability before taking logs so structural zeros stay
/// finite in the log domain.
pub const EPSILON_LOG: f64 = 1e-30;

/// Configuration shared between the transition assembler and the Viterbi
/// decoder. Construct with [`DecoderConfig::default`] and override fields as
/// needed.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Constant subtracted from every inter-phone log transition. Larger
    /// values discourage short phone segments.
    pub insertion_penalty: f64,
    /// Multiplier on inter-phone log transitions, balancing the language
    /// model against the acoustics.
    pub scale_factor: f64,
    /// With a discounted uni/bigram model, ignore the bigrams and distribute
    /// exit mass by unigram probability alone.
    pub unigrams_only: bool,
    /// Re-normalise ARPA bigram rows after replacing weak bigrams with their
    /// back-off estimate. Off by default; toggle it to compare runs with
    /// and without the renormalisation.
    pub renormalise_backoff: bool,
    /// log10 floor below which an ARPA bigram is considered weaker than its
    /// back-off estimate. Only consulted when `renormalise_backoff` is set.
    pub threshold_bigrams: f64,
    /// Phone names accepted as the sentence-start sentinel, in order of
    /// preference. The first name the model actually defines wins.
    pub start_labels: Vec<String>,
    /// Phone names accepted as the sentence-end sentinel, in order of
    /// preference.
    pub end_labels: Vec<String>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            insertion_penalty: 2.5,
            scale_factor: 1.0,
            unigrams_only: false,
            renormalise_backoff: false,
            threshold_bigrams: -10.0,
            start_labels: vec!["!ENTER".to_string(), "h#".to_string()],
            end_labels: vec!["!EXIT".to_string(), "h#".to_string()],
        }
    }
}


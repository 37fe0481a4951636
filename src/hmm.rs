//! Parser for HTK HMM definition files (HMMDEFS, chapter 7 of the HTK book).
//! The text format is a sequence of `~h "phone"` records, each carrying the
//! emitting states with their Gaussian mixture components and an
//! `(n x n)` transition block. HTK pads every HMM with a non-emitting entry
//! and exit state, so an n-state definition contributes n-2 emitting states
//! here. Each phone's emitting states are assigned a contiguous block of
//! global state indices in file order, which is what lets the transition
//! assembler and the Viterbi decoder work on one dense matrix for the whole
//! model set.
//!
//! Parsing is two passes over the buffered lines: the first sizes the global
//! transition matrix, the second fills mixtures and intra-phone transition
//! blocks. Anything malformed is a hard error carrying the 1-based line
//! number, a decoder run can't do anything useful with half a model.
use anyhow::{ensure, Context};
use ndarray::{s, Array1, Array2};
use std::fs;
use std::io::{self, prelude::*};
use std::ops::Range;
use std::path::Path;
use tracing::debug;

/// A phone and the contiguous block of global state indices assigned to its
/// emitting states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phone {
    /// Identifier as written in the HMMDEFS, e.g. `"aa"` or `"!ENTER"`.
    pub name: String,
    /// Global indices of the emitting states, in emission order.
    pub states: Range<usize>,
}

impl Phone {
    /// Global index of the first emitting state.
    pub fn first_state(&self) -> usize {
        self.states.start
    }

    /// Global index of the last emitting state.
    pub fn last_state(&self) -> usize {
        self.states.end - 1
    }

    /// Number of emitting states.
    pub fn n_states(&self) -> usize {
        self.states.len()
    }
}

/// One diagonal-covariance Gaussian of a state's mixture, as read from the
/// file. The evaluation-ready form lives in [`crate::gmm::StateGmm`].
#[derive(Debug, Clone, PartialEq)]
pub struct GmmComponent {
    /// Mixture weight.
    pub weight: f64,
    /// Mean vector, length `dim`.
    pub mean: Array1<f64>,
    /// Diagonal of the covariance matrix, length `dim`.
    pub variance: Array1<f64>,
}

/// An immutable set of phone HMMs: the output of parsing an HMMDEFS file.
#[derive(Debug, Clone)]
pub struct HmmSet {
    /// Phones in file order. Their state ranges tile `0..n_states()`.
    pub phones: Vec<Phone>,
    /// Feature dimensionality the models were trained on.
    pub dim: usize,
    /// Mixture components per global state index.
    pub states: Vec<Vec<GmmComponent>>,
    /// `[N x N]` transition matrix holding only the intra-phone blocks, all
    /// inter-phone entries zero. Each row's missing mass is that state's
    /// probability of leaving the phone.
    pub transitions: Array2<f64>,
}

impl HmmSet {
    /// Parses the HMMDEFS file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening HMM file '{}'", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing HMM file '{}'", path.display()))
    }

    /// Parses HMMDEFS text from any reader so tests can use in-memory
    /// definitions.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let lines = reader
            .lines()
            .collect::<Result<Vec<_>, _>>()
            .context("reading HMM definitions")?;

        // First pass sizes the global matrix.
        let mut n_states_tot = 0;
        for (i, line) in lines.iter().enumerate() {
            if line.contains("<NUMSTATES>") {
                let n = field(line, "<NUMSTATES>", 1, i)?;
                ensure!(
                    n >= 3.0 && n.fract() == 0.0,
                    "<NUMSTATES> must be a whole number of at least 3, got '{}' at line {}",
                    n,
                    i + 1
                );
                n_states_tot += n as usize - 2;
            }
        }
        ensure!(n_states_tot > 0, "no HMM definitions found");

        let mut parser = Parser {
            lines: &lines,
            phones: Vec::new(),
            dim: 0,
            states: Vec::new(),
            transitions: Array2::zeros((n_states_tot, n_states_tot)),
            pending: Vec::new(),
            expected_states: None,
            phone_name: String::new(),
        };
        parser.run()?;

        ensure!(
            parser.states.len() == n_states_tot,
            "expected {} emitting states from <NUMSTATES> records but assigned {}",
            n_states_tot,
            parser.states.len()
        );
        debug!(
            "parsed {} phones, {} states, dimension {}",
            parser.phones.len(),
            n_states_tot,
            parser.dim
        );

        Ok(Self {
            phones: parser.phones,
            dim: parser.dim,
            states: parser.states,
            transitions: parser.transitions,
        })
    }

    /// Total number of emitting states across all phones.
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// Index into [`HmmSet::phones`] for a phone name.
    pub fn phone_index(&self, name: &str) -> Option<usize> {
        self.phones.iter().position(|p| p.name == name)
    }

    /// Map from global state index to owning phone index.
    pub fn state_phones(&self) -> Vec<usize> {
        let mut map = vec![0; self.n_states()];
        for (idx, phone) in self.phones.iter().enumerate() {
            for s in phone.states.clone() {
                map[s] = idx;
            }
        }
        map
    }

    /// HTK-style label for a state, e.g. `aa[2]` for the first emitting
    /// state of `aa` (HTK numbers states from 1 with state 1 non-emitting).
    pub fn state_label(&self, state: usize) -> String {
        let phone = &self.phones[self.state_phones()[state]];
        format!("{}[{}]", phone.name, 2 + state - phone.first_state())
    }
}

/// A component mid-parse, before we know both its vectors arrived.
struct PendingComponent {
    weight: f64,
    mean: Option<Array1<f64>>,
    variance: Option<Array1<f64>>,
}

struct Parser<'a> {
    lines: &'a [String],
    phones: Vec<Phone>,
    dim: usize,
    states: Vec<Vec<GmmComponent>>,
    transitions: Array2<f64>,
    /// States of the phone currently being parsed, flushed at `<TRANSP>`.
    pending: Vec<Vec<PendingComponent>>,
    expected_states: Option<usize>,
    phone_name: String,
}

impl Parser<'_> {
    fn run(&mut self) -> anyhow::Result<()> {
        let mut i = 0;
        while i < self.lines.len() {
            let line = &self.lines[i];
            if line.contains("~h") {
                ensure!(
                    self.pending.is_empty(),
                    "phone '{}' has states but no <TRANSP> block before line {}",
                    self.phone_name,
                    i + 1
                );
                self.phone_name = line
                    .split_whitespace()
                    .nth(1)
                    .map(|s| s.trim_matches('"').to_string())
                    .with_context(|| format!("missing phone name after ~h at line {}", i + 1))?;
            } else if line.contains("<STATE>") {
                self.pending.push(Vec::new());
            } else if line.contains("<NUMSTATES>") {
                // Validated during the sizing pass, remembered here so the
                // <TRANSP> block can be checked against it.
                self.expected_states = Some(field(line, "<NUMSTATES>", 1, i)? as usize - 2);
            } else if line.contains("<MIXTURE>") {
                let weight = field(line, "<MIXTURE>", 2, i)?;
                let state = self.open_state(i)?;
                state.push(PendingComponent {
                    weight,
                    mean: None,
                    variance: None,
                });
            } else if line.contains("<MEAN>") || line.contains("<VARIANCE>") {
                let is_mean = line.contains("<MEAN>");
                let marker = if is_mean { "<MEAN>" } else { "<VARIANCE>" };
                let values = self.vector_after(i, marker)?;
                let state = self.open_state(i)?;
                // A state without an explicit <MIXTURE> marker is a single
                // component of weight 1.
                if state.is_empty() {
                    state.push(PendingComponent {
                        weight: 1.0,
                        mean: None,
                        variance: None,
                    });
                }
                let component = state.last_mut().expect("pushed above");
                if is_mean {
                    component.mean = Some(values);
                } else {
                    component.variance = Some(values);
                }
                i += 1; // skip the vector line
            } else if line.contains("<TRANSP>") {
                i = self.flush_phone(i)?;
            }
            i += 1;
        }
        ensure!(
            self.pending.is_empty(),
            "phone '{}' is missing its <TRANSP> block",
            self.phone_name
        );
        Ok(())
    }

    fn open_state(&mut self, i: usize) -> anyhow::Result<&mut Vec<PendingComponent>> {
        self.pending
            .last_mut()
            .with_context(|| format!("no <STATE> open at line {}", i + 1))
    }

    /// Parses the whitespace separated float vector on the line after `i`,
    /// checking it against the declared length.
    fn vector_after(&mut self, i: usize, marker: &str) -> anyhow::Result<Array1<f64>> {
        let declared = field(self.lines[i].as_str(), marker, 1, i)? as usize;
        let line = self
            .lines
            .get(i + 1)
            .with_context(|| format!("vector missing after line {}", i + 1))?;
        let values = line
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("malformed vector at line {}", i + 2))?;
        ensure!(
            values.len() == declared,
            "vector at line {} has {} values, {} declared",
            i + 2,
            values.len(),
            declared
        );
        if self.dim == 0 {
            self.dim = declared;
        }
        ensure!(
            declared == self.dim,
            "vector at line {} has dimension {} but the model set uses {}",
            i + 2,
            declared,
            self.dim
        );
        Ok(Array1::from_vec(values))
    }

    /// Reads the `<TRANSP>` block at line `i`, assigns the phone its global
    /// state block and copies the intra-phone transitions. Returns the index
    /// of the last consumed line.
    fn flush_phone(&mut self, i: usize) -> anyhow::Result<usize> {
        let n = field(&self.lines[i], "<TRANSP>", 1, i)? as usize;
        ensure!(
            n >= 3,
            "<TRANSP> must declare at least 3 states at line {}",
            i + 1
        );
        let n_emitting = n - 2;
        ensure!(
            self.pending.len() == n_emitting,
            "phone '{}' declares {} emitting states but defines {} at line {}",
            self.phone_name,
            n_emitting,
            self.pending.len(),
            i + 1
        );
        if let Some(expected) = self.expected_states.take() {
            ensure!(
                expected == n_emitting,
                "<TRANSP> size {} disagrees with <NUMSTATES> for phone '{}' at line {}",
                n,
                self.phone_name,
                i + 1
            );
        }

        let base = self.states.len();
        // Rows 1..n-1 and columns 1..n-1 of the HTK block are the emitting
        // to emitting transitions; the dropped last column is the exit mass.
        for j in 0..n_emitting {
            let line = self
                .lines
                .get(i + j + 2)
                .with_context(|| format!("<TRANSP> row missing after line {}", i + 1))?;
            let row = line
                .split_whitespace()
                .map(|t| t.parse::<f64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("malformed <TRANSP> row at line {}", i + j + 3))?;
            ensure!(
                row.len() == n,
                "<TRANSP> row at line {} has {} entries, {} declared",
                i + j + 3,
                row.len(),
                n
            );
            self.transitions
                .slice_mut(s![base + j, base..base + n_emitting])
                .assign(&Array1::from_vec(row[1..n - 1].to_vec()));
        }

        for (offset, state) in self.pending.drain(..).enumerate() {
            ensure!(
                !state.is_empty(),
                "state {} of phone '{}' has no mixture components",
                offset + 2,
                self.phone_name
            );
            let mut components = Vec::with_capacity(state.len());
            for (k, c) in state.into_iter().enumerate() {
                let mean = c.mean.with_context(|| {
                    format!(
                        "mixture {} of '{}' state {} has no <MEAN>",
                        k + 1,
                        self.phone_name,
                        offset + 2
                    )
                })?;
                let variance = c.variance.with_context(|| {
                    format!(
                        "mixture {} of '{}' state {} has no <VARIANCE>",
                        k + 1,
                        self.phone_name,
                        offset + 2
                    )
                })?;
                components.push(GmmComponent {
                    weight: c.weight,
                    mean,
                    variance,
                });
            }
            self.states.push(components);
        }
        self.phones.push(Phone {
            name: std::mem::take(&mut self.phone_name),
            states: base..base + n_emitting,
        });

        // Last consumed line is the final matrix row.
        Ok(i + n)
    }
}

/// Pulls the whitespace separated field at `index` out of a marker line and
/// parses it as a float, reporting the 1-based line number on failure.
fn field(line: &str, marker: &str, index: usize, i: usize) -> anyhow::Result<f64> {
    line.split_whitespace()
        .nth(index)
        .and_then(|t| t.parse::<f64>().ok())
        .with_context(|| format!("malformed {} record at line {}", marker, i + 1))
}

#[cfg(test)]
pub(crate) mod test_defs {
    //! Small handwritten model definitions shared between this module's
    //! tests and the downstream ones building on a parsed model.

    /// Two phones: "aa" with three emitting states (the first a two
    /// component mixture) and exit mass 0.2, "bb" with one emitting state
    /// and exit mass 0.5.
    pub(crate) const TWO_PHONE_DEFS: &str = r#"~o <VECSIZE> 2 <MFCC>
~h "aa"
<BEGINHMM>
<NUMSTATES> 5
<STATE> 2
<MIXTURE> 1 0.6
<MEAN> 2
 0.0 0.0
<VARIANCE> 2
 1.0 1.0
<MIXTURE> 2 0.4
<MEAN> 2
 1.0 1.0
<VARIANCE> 2
 2.0 2.0
<STATE> 3
<MEAN> 2
 2.0 2.0
<VARIANCE> 2
 1.0 1.0
<STATE> 4
<MEAN> 2
 3.0 3.0
<VARIANCE> 2
 1.0 1.0
<TRANSP> 5
 0.0 1.0 0.0 0.0 0.0
 0.0 0.6 0.4 0.0 0.0
 0.0 0.0 0.7 0.3 0.0
 0.0 0.0 0.0 0.8 0.2
 0.0 0.0 0.0 0.0 0.0
<ENDHMM>
~h "bb"
<BEGINHMM>
<NUMSTATES> 3
<STATE> 2
<MEAN> 2
 5.0 5.0
<VARIANCE> 2
 1.0 1.0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
<ENDHMM>
"#;
}

#[cfg(test)]
mod tests {
    use super::test_defs::TWO_PHONE_DEFS;
    use super::*;

    fn parse(defs: &str) -> anyhow::Result<HmmSet> {
        HmmSet::from_reader(io::Cursor::new(defs))
    }

    #[test]
    fn assigns_contiguous_state_blocks_in_file_order() {
        let hmm = parse(TWO_PHONE_DEFS).unwrap();
        assert_eq!(hmm.n_states(), 4);
        assert_eq!(hmm.dim, 2);
        assert_eq!(hmm.phones.len(), 2);
        assert_eq!(hmm.phones[0].name, "aa");
        assert_eq!(hmm.phones[0].states, 0..3);
        assert_eq!(hmm.phones[1].name, "bb");
        assert_eq!(hmm.phones[1].states, 3..4);
        assert_eq!(hmm.state_phones(), vec![0, 0, 0, 1]);
        assert_eq!(hmm.state_label(1), "aa[3]");
        assert_eq!(hmm.state_label(3), "bb[2]");
    }

    #[test]
    fn fills_intra_phone_transition_blocks() {
        let hmm = parse(TWO_PHONE_DEFS).unwrap();
        assert_eq!(hmm.transitions[[0, 0]], 0.6);
        assert_eq!(hmm.transitions[[0, 1]], 0.4);
        assert_eq!(hmm.transitions[[1, 1]], 0.7);
        assert_eq!(hmm.transitions[[1, 2]], 0.3);
        assert_eq!(hmm.transitions[[2, 2]], 0.8);
        // The 0.2 exit probability is the row's missing mass, not an entry.
        assert_eq!(hmm.transitions[[2, 3]], 0.0);
        assert_eq!(hmm.transitions[[3, 3]], 0.5);
        // No inter-phone transitions yet.
        assert_eq!(hmm.transitions[[3, 0]], 0.0);
    }

    #[test]
    fn mixture_weights_and_default_weight() {
        let hmm = parse(TWO_PHONE_DEFS).unwrap();
        assert_eq!(hmm.states[0].len(), 2);
        assert_eq!(hmm.states[0][0].weight, 0.6);
        assert_eq!(hmm.states[0][1].weight, 0.4);
        assert_eq!(hmm.states[0][1].mean, Array1::from_vec(vec![1.0, 1.0]));
        // bb's single state had no <MIXTURE> marker so defaults to weight 1.
        assert_eq!(hmm.states[3].len(), 1);
        assert_eq!(hmm.states[3][0].weight, 1.0);
    }

    #[test]
    fn malformed_numstates_is_fatal_with_line_number() {
        let defs = TWO_PHONE_DEFS.replace("<NUMSTATES> 5", "<NUMSTATES> banana");
        let err = parse(&defs).unwrap_err();
        assert!(format!("{:#}", err).contains("line 4"), "{:#}", err);
    }

    #[test]
    fn short_transp_row_is_fatal() {
        let defs = TWO_PHONE_DEFS.replace(" 0.0 0.0 0.7 0.3 0.0", " 0.0 0.0 0.7");
        assert!(parse(&defs).is_err());
    }

    #[test]
    fn dimension_change_mid_file_is_fatal() {
        let defs = TWO_PHONE_DEFS.replace("<MEAN> 2\n 5.0 5.0", "<MEAN> 3\n 5.0 5.0 5.0");
        assert!(parse(&defs).is_err());
    }
}

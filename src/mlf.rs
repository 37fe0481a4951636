//! Master label file output. An MLF starts with the `#!MLF!#` sentinel and
//! holds one record per utterance: a quoted `*.rec` name line, one label per
//! line and a lone `.` terminator. The compact style collapses the state
//! path to one phone per contiguous run; the per-state style also writes
//! each state-level label with the run's summed log-posterior and per-frame
//! average, which is handy when eyeballing where a path lingered.
use crate::hmm::HmmSet;
use crate::viterbi::PathStep;
use anyhow::Context;
use std::fmt::Write as _;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

/// How much detail a record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Style {
    /// One phone name per run of states belonging to it.
    #[default]
    Phones,
    /// Phone names plus state-level labels with their posteriors.
    PerState,
}

/// Formats one utterance's record. The record is named after the source
/// feature file with its extension swapped for `rec`.
pub fn format_record(source: &Path, path: &[PathStep], hmm: &HmmSet, style: Style) -> String {
    let state_phones = hmm.state_phones();
    let mut record = format!("\"{}\"\n", source.with_extension("rec").display());

    let mut prev_phone = usize::MAX;
    let mut prev_state = usize::MAX;
    let mut run_sum = 0.0;
    let mut run_len = 0usize;
    let mut lines: Vec<String> = Vec::new();

    for step in path {
        let phone = state_phones[step.state];
        match style {
            Style::Phones => {
                if phone != prev_phone {
                    lines.push(hmm.phones[phone].name.clone());
                }
            }
            Style::PerState => {
                if step.state != prev_state {
                    finish_state_run(&mut lines, run_sum, run_len);
                    let mut line = String::new();
                    if phone != prev_phone {
                        line.push_str(&hmm.phones[phone].name);
                        line.push(' ');
                    }
                    line.push_str(&hmm.state_label(step.state));
                    lines.push(line);
                    run_sum = 0.0;
                    run_len = 0;
                }
                run_sum += step.log_posterior;
                run_len += 1;
            }
        }
        prev_phone = phone;
        prev_state = step.state;
    }
    if style == Style::PerState {
        finish_state_run(&mut lines, run_sum, run_len);
    }

    for line in lines {
        record.push_str(&line);
        record.push('\n');
    }
    record.push_str(".\n");
    record
}

/// Appends the posterior sum and per-frame average to the line opening the
/// state run that just ended.
fn finish_state_run(lines: &mut [String], run_sum: f64, run_len: usize) {
    if run_len == 0 {
        return;
    }
    let line = lines.last_mut().expect("a run implies an opened line");
    let _ = write!(line, " {} {}", run_sum, run_sum / run_len as f64);
}

/// Writes the whole label file: sentinel header then every record.
pub fn write_mlf<'a>(
    output: &Path,
    records: impl IntoIterator<Item = &'a String>,
) -> anyhow::Result<()> {
    let file = fs::File::create(output)
        .with_context(|| format!("creating output MLF '{}'", output.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(b"#!MLF!#\n")?;
    for record in records {
        writer.write_all(record.as_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("writing output MLF '{}'", output.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::Phone;
    use ndarray::Array2;
    use std::path::PathBuf;

    /// Two phones with two emitting states each, no mixtures needed for
    /// label formatting.
    fn label_model() -> HmmSet {
        HmmSet {
            phones: vec![
                Phone {
                    name: "aa".into(),
                    states: 0..2,
                },
                Phone {
                    name: "bb".into(),
                    states: 2..4,
                },
            ],
            dim: 1,
            states: vec![vec![]; 4],
            transitions: Array2::zeros((4, 4)),
        }
    }

    fn step(state: usize, log_posterior: f64) -> PathStep {
        PathStep {
            state,
            log_posterior,
        }
    }

    #[test]
    fn collapses_state_runs_to_phones() {
        let hmm = label_model();
        let path = [
            step(0, -1.0),
            step(0, -2.0),
            step(1, -3.0),
            step(2, -4.0),
            step(3, -5.0),
            step(0, -6.0),
        ];
        let record = format_record(&PathBuf::from("utt/sa1.mfc"), &path, &hmm, Style::Phones);
        assert_eq!(record, "\"utt/sa1.rec\"\naa\nbb\naa\n.\n");
    }

    #[test]
    fn per_state_labels_carry_run_posteriors() {
        let hmm = label_model();
        let path = [step(0, -1.0), step(0, -2.0), step(1, -3.0), step(2, -4.0)];
        let record = format_record(&PathBuf::from("sa1.mfc"), &path, &hmm, Style::PerState);
        let expected = "\"sa1.rec\"\n\
            aa aa[2] -3 -1.5\n\
            aa[3] -3 -3\n\
            bb bb[2] -4 -4\n\
            .\n";
        assert_eq!(record, expected);
    }

    #[test]
    fn empty_path_is_just_the_header_and_terminator() {
        let hmm = label_model();
        let record = format_record(&PathBuf::from("sa1.mfc"), &[], &hmm, Style::Phones);
        assert_eq!(record, "\"sa1.rec\"\n.\n");
    }
}

//! Parser for HTK wordnet (lattice) files as produced by
//! `HBuild -m bigramLM dict wdnet`. The header carries `N=` node and `L=`
//! arc counts, `I=` lines declare nodes with their `W=` word and `J=` lines
//! declare arcs with `S=` start node, `E=` end node and an `l=` bigram
//! log-probability. Only the phone pair and log-probability of each arc
//! matter for transition assembly.
use anyhow::{ensure, Context};
use std::collections::HashMap;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use tracing::info;

/// One arc of the wordnet, already in node-id form.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WordnetArc {
    pub from: usize,
    pub to: usize,
    /// Natural-log probability of the bigram on this arc.
    pub log_prob: f64,
}

/// A wordnet reduced to what transition assembly needs: the node id to word
/// mapping and the bigram arcs.
#[derive(Debug, Clone, Default)]
pub struct Wordnet {
    pub words: HashMap<usize, String>,
    pub arcs: Vec<WordnetArc>,
}

impl Wordnet {
    /// Parses the wordnet file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening wordnet '{}'", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("parsing wordnet '{}'", path.display()))
    }

    /// Parses wordnet text from any reader.
    pub fn from_reader(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut declared_nodes = None;
        let mut words = HashMap::new();
        let mut arcs = Vec::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line.context("reading wordnet")?;
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let Some(first) = fields.first() else {
                continue;
            };
            if first.starts_with("N=") {
                declared_nodes = Some(tagged::<usize>(&fields, "N=", i)?);
            } else if first.starts_with("I=") {
                let id = tagged::<usize>(&fields, "I=", i)?;
                let word = tagged::<String>(&fields, "W=", i)?;
                words.insert(id, word);
            } else if first.starts_with("J=") {
                arcs.push(WordnetArc {
                    from: tagged::<usize>(&fields, "S=", i)?,
                    to: tagged::<usize>(&fields, "E=", i)?,
                    log_prob: tagged::<f64>(&fields, "l=", i)?,
                });
            }
        }

        if let Some(declared) = declared_nodes {
            ensure!(
                declared == words.len(),
                "header declares {} nodes but {} were defined",
                declared,
                words.len()
            );
        }
        info!("parsed wordnet: {} nodes, {} arcs", words.len(), arcs.len());
        Ok(Self { words, arcs })
    }

    /// The word on a node.
    pub fn word(&self, node: usize) -> anyhow::Result<&str> {
        self.words
            .get(&node)
            .map(|w| w.as_str())
            .with_context(|| format!("arc references undefined node {}", node))
    }
}

/// Finds the `tag=value` field in a line and parses the value.
fn tagged<T: std::str::FromStr>(fields: &[&str], tag: &str, i: usize) -> anyhow::Result<T> {
    fields
        .iter()
        .find_map(|f| f.strip_prefix(tag))
        .and_then(|v| v.parse::<T>().ok())
        .with_context(|| format!("missing or malformed '{}' field at line {}", tag, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"VERSION=1.0
N=3 L=3
I=0 W=!ENTER
I=1 W=aa
I=2 W=!EXIT
J=0 S=0 E=1 l=-0.105
J=1 S=1 E=1 l=-1.609
J=2 S=1 E=2 l=-2.303
"#;

    #[test]
    fn parses_nodes_and_arcs() {
        let net = Wordnet::from_reader(io::Cursor::new(SAMPLE)).unwrap();
        assert_eq!(net.words.len(), 3);
        assert_eq!(net.word(1).unwrap(), "aa");
        assert_eq!(net.arcs.len(), 3);
        assert_eq!(net.arcs[1].from, 1);
        assert_eq!(net.arcs[1].to, 1);
        assert!((net.arcs[2].log_prob - -2.303).abs() < 1e-12);
    }

    #[test]
    fn node_count_mismatch_is_fatal() {
        let bad = SAMPLE.replace("N=3 L=3", "N=4 L=3");
        assert!(Wordnet::from_reader(io::Cursor::new(bad)).is_err());
    }

    #[test]
    fn arc_without_log_prob_is_fatal() {
        let bad = SAMPLE.replace("J=1 S=1 E=1 l=-1.609", "J=1 S=1 E=1");
        assert!(Wordnet::from_reader(io::Cursor::new(bad)).is_err());
    }
}

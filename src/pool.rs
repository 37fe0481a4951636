//! Fixed pool of decode workers. Each worker owns one utterance end to end:
//! read the feature file, evaluate the mixtures, run Viterbi, format the
//! record. The decoder context is shared read-only by every worker and
//! utterances are handed out over a channel, so a slow utterance never
//! blocks the rest of the batch. Results come back over a second channel in
//! completion order; records are self-contained so the output order doesn't
//! matter.
use crate::mlf::Style;
use crate::PhoneDecoder;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::debug;

/// Result of decoding one utterance.
#[derive(Debug)]
pub struct Outcome {
    /// Feature file the utterance came from.
    pub source: PathBuf,
    /// The formatted MLF record, or whatever went wrong.
    pub record: anyhow::Result<String>,
}

/// Decodes every utterance across as many workers as the machine has
/// hardware threads, returning one outcome per input.
pub fn decode_all(decoder: &PhoneDecoder, sources: Vec<PathBuf>, style: Style) -> Vec<Outcome> {
    if sources.is_empty() {
        return Vec::new();
    }
    let n_workers = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(sources.len());

    let (job_tx, job_rx) = mpsc::channel::<PathBuf>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let (result_tx, result_rx) = mpsc::channel();

    thread::scope(|scope| {
        for worker in 0..n_workers {
            let job_rx = Arc::clone(&job_rx);
            let result_tx = result_tx.clone();
            scope.spawn(move || loop {
                // The lock is scoped to the receive; holding it while
                // decoding would serialise the pool. Once the main thread
                // drops its sender the channel drains and recv errors,
                // which is the shutdown signal.
                let job = { job_rx.lock().unwrap().recv() };
                let Ok(source) = job else { break };
                debug!("worker {} decoding '{}'", worker, source.display());
                let record = decoder.decode_utterance(&source, style);
                if result_tx.send(Outcome { source, record }).is_err() {
                    break;
                }
            });
        }
        for source in sources {
            job_tx.send(source).expect("workers outlive the send loop");
        }
        drop(job_tx);
        drop(result_tx);
        result_rx.iter().collect()
    })
}

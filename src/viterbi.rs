//! Most-likely state path search. Plain max-product dynamic programming
//! over the `[T x N]` log-likelihoods and the `[N x N]` log-transition
//! matrix with a backpointer table for the traceback. The inner maximisation
//! only visits states that were reachable at the previous frame, which with
//! an endpoint-constrained start collapses the first few frames to a
//! handful of candidates.
//!
//! Numerical trouble is deliberately not an error here: when every path
//! into a frame has vanished the decoder logs a warning and keeps producing
//! whatever best-effort path exists. A run over thousands of utterances
//! shouldn't die because one of them underflowed.
use ndarray::{Array2, ArrayView2};
use tracing::warn;

/// One frame of the decoded path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathStep {
    /// Global state index occupied at this frame.
    pub state: usize,
    /// Accumulated log-posterior of the best path through this state.
    pub log_posterior: f64,
}

/// Start and end constraints used when a language model is active: the path
/// must begin in the start sentinel's first emitting state and finish in the
/// end sentinel's last emitting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub start: usize,
    pub end: usize,
}

/// Runs the Viterbi search and returns the best state path, one step per
/// frame. An empty likelihood matrix yields an empty path.
pub fn decode(
    ll: ArrayView2<'_, f64>,
    log_trans: ArrayView2<'_, f64>,
    endpoints: Option<Endpoints>,
) -> Vec<PathStep> {
    let (n_frames, n_states) = ll.dim();
    if n_frames == 0 || n_states == 0 {
        return Vec::new();
    }

    let mut psi = Array2::from_elem((n_frames, n_states), f64::NEG_INFINITY);
    let mut backpointers = Array2::<usize>::zeros((n_frames, n_states));

    match endpoints {
        Some(e) => psi[[0, e.start]] = ll[[0, e.start]],
        None => psi.row_mut(0).assign(&ll.row(0)),
    }

    let mut active = reachable(&psi, 0);
    for t in 1..n_frames {
        if active.is_empty() {
            warn!("every path vanished entering frame {}, continuing best effort", t);
            active = (0..n_states).collect();
        }
        for j in 0..n_states {
            let mut best = f64::NEG_INFINITY;
            let mut best_k = active[0];
            for &k in &active {
                let candidate = psi[[t - 1, k]] + log_trans[[k, j]];
                if candidate > best {
                    best = candidate;
                    best_k = k;
                }
            }
            psi[[t, j]] = best + ll[[t, j]];
            backpointers[[t, j]] = best_k;
        }
        active = reachable(&psi, t);
    }

    let last = n_frames - 1;
    let (final_state, final_score) = match endpoints {
        Some(e) => (e.end, psi[[last, e.end]]),
        None => {
            let mut best = (0, f64::NEG_INFINITY);
            for (j, &score) in psi.row(last).iter().enumerate() {
                if score > best.1 {
                    best = (j, score);
                }
            }
            best
        }
    };
    if !final_score.is_finite() {
        warn!("best final path has no finite probability, emitting it anyway");
    }

    let mut path = vec![
        PathStep {
            state: final_state,
            log_posterior: final_score,
        };
        n_frames
    ];
    for t in (0..last).rev() {
        let state = backpointers[[t + 1, path[t + 1].state]];
        path[t] = PathStep {
            state,
            log_posterior: psi[[t, state]],
        };
    }
    path
}

/// States with a surviving path at frame `t`.
fn reachable(psi: &Array2<f64>, t: usize) -> Vec<usize> {
    psi.row(t)
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .map(|(j, _)| j)
        .collect()
}

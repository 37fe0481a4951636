//! Gaussian mixture evaluation. The parsed `(weight, mean, variance)`
//! triples are converted once into a column-oriented form with the Gaussian
//! normalisation constants folded into the weights, after which evaluating a
//! whole utterance against a state is a handful of broadcast array
//! operations. All arithmetic happens in f64, the feature files only store
//! f32 but the exponentials underflow far too easily at single precision.
use crate::hmm::HmmSet;
use anyhow::ensure;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::f64::consts::PI;

/// Evaluation-ready form of one state's Gaussian mixture.
///
/// For component `k` of a state with parsed parameters `(pi_k, mu_k,
/// sigma2_k)` this caches `weights[k] = pi_k / sqrt(det(2 pi Sigma_k))` and
/// `inv_vars[:,k] = 1 / sigma2_k`, so the density is just a weighted sum of
/// `exp(-0.5 * quadratic form)` terms with no normalisation left to do at
/// evaluation time.
#[derive(Debug, Clone)]
pub struct StateGmm {
    /// Per-component weights with the normaliser folded in, length `K`.
    pub weights: Array1<f64>,
    /// Component means, `[D x K]`.
    pub means: Array2<f64>,
    /// Inverse variance diagonals, `[D x K]`.
    pub inv_vars: Array2<f64>,
}

/// Converts every state of the model into its evaluation-ready form, in
/// global state order.
pub fn precompute(hmm: &HmmSet) -> anyhow::Result<Vec<StateGmm>> {
    let dim = hmm.dim;
    let mut out = Vec::with_capacity(hmm.n_states());
    for (state_id, components) in hmm.states.iter().enumerate() {
        let k = components.len();
        let mut weights = Array1::zeros(k);
        let mut means = Array2::zeros((dim, k));
        let mut inv_vars = Array2::zeros((dim, k));
        for (j, c) in components.iter().enumerate() {
            ensure!(
                c.variance.iter().all(|&v| v > 0.0),
                "state {} has a non-positive variance in mixture {}",
                state_id,
                j + 1
            );
            // pi_k / sqrt(det(2 pi Sigma)) computed via logs, the direct
            // product underflows for realistic dimensionalities.
            let log_norm = -0.5 * c.variance.mapv(|v| (2.0 * PI * v).ln()).sum();
            weights[j] = c.weight * log_norm.exp();
            means.column_mut(j).assign(&c.mean);
            inv_vars.column_mut(j).assign(&c.variance.mapv(|v| 1.0 / v));
        }
        out.push(StateGmm {
            weights,
            means,
            inv_vars,
        });
    }
    Ok(out)
}

/// Computes the `[T x N]` matrix of per-frame per-state log-likelihoods for
/// an utterance.
///
/// The mixture sum is taken directly in the linear domain; the cached
/// weights already include the normalising constants so the terms stay
/// well-scaled for inputs the models were trained on. Everything is
/// vectorised over frames: per component we broadcast the mean and inverse
/// variance over the whole utterance and reduce along the feature axis.
pub fn log_likelihoods(gmms: &[StateGmm], frames: ArrayView2<'_, f32>) -> Array2<f64> {
    let frames = frames.mapv(f64::from);
    let n_frames = frames.nrows();
    let mut out = Array2::zeros((n_frames, gmms.len()));
    for (state_id, gmm) in gmms.iter().enumerate() {
        let mut mixture = Array1::<f64>::zeros(n_frames);
        for k in 0..gmm.weights.len() {
            let mean = gmm.means.column(k);
            let inv_var = gmm.inv_vars.column(k);
            let diff = &frames - &mean;
            let quad = (&diff * &diff * &inv_var).sum_axis(Axis(1));
            mixture += &quad.mapv(|q| gmm.weights[k] * (-0.5 * q).exp());
        }
        out.column_mut(state_id).assign(&mixture.mapv(f64::ln));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmm::HmmSet;
    use ndarray::arr2;
    use std::io;

    const UNIT_DEFS: &str = r#"~h "x"
<NUMSTATES> 3
<STATE> 2
<MEAN> 2
 1.0 -1.0
<VARIANCE> 2
 1.0 1.0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
"#;

    fn unit_model() -> HmmSet {
        HmmSet::from_reader(io::Cursor::new(UNIT_DEFS)).unwrap()
    }

    #[test]
    fn identity_covariance_matches_closed_form() {
        let gmms = precompute(&unit_model()).unwrap();
        // With unit variances the cached weight is exactly (2 pi)^(-D/2).
        let expected_w = (2.0 * PI).powi(-1);
        assert!((gmms[0].weights[0] - expected_w).abs() < 1e-12);

        let frames = arr2(&[[1.0f32, -1.0], [2.0, 0.0], [-1.0, 3.0]]);
        let ll = log_likelihoods(&gmms, frames.view());
        // log N(x; mu, I) = -0.5 ||x - mu||^2 + ln w
        for (t, sq) in [(0, 0.0), (1, 2.0), (2, 20.0)] {
            let expected = -0.5 * sq + expected_w.ln();
            assert!(
                (ll[[t, 0]] - expected).abs() < 1e-9,
                "frame {}: {} vs {}",
                t,
                ll[[t, 0]],
                expected
            );
        }
    }

    #[test]
    fn likelihoods_are_finite_for_well_scaled_input() {
        let hmm =
            HmmSet::from_reader(io::Cursor::new(crate::hmm::test_defs::TWO_PHONE_DEFS)).unwrap();
        let gmms = precompute(&hmm).unwrap();
        let frames = arr2(&[
            [0.0f32, 0.0],
            [1.5, 1.5],
            [3.0, 3.0],
            [5.0, 5.0],
            [-2.0, 7.0],
        ]);
        let ll = log_likelihoods(&gmms, frames.view());
        let floor = -31.0 * hmm.dim as f64;
        for v in ll.iter() {
            assert!(v.is_finite(), "non-finite log likelihood {}", v);
            assert!(*v >= floor, "{} under the well-scaled floor {}", v, floor);
        }
    }

    #[test]
    fn mixture_weights_sum_under_the_density() {
        // Two components at the same mean halve and double the variance, the
        // value at the shared mean is the weighted sum of the two peaks.
        let defs = r#"~h "m"
<NUMSTATES> 3
<STATE> 2
<MIXTURE> 1 0.25
<MEAN> 1
 0.0
<VARIANCE> 1
 1.0
<MIXTURE> 2 0.75
<MEAN> 1
 0.0
<VARIANCE> 1
 4.0
<TRANSP> 3
 0.0 1.0 0.0
 0.0 0.5 0.5
 0.0 0.0 0.0
"#;
        let hmm = HmmSet::from_reader(io::Cursor::new(defs)).unwrap();
        let gmms = precompute(&hmm).unwrap();
        let ll = log_likelihoods(&gmms, arr2(&[[0.0f32]]).view());
        let expected = (0.25 / (2.0 * PI).sqrt() + 0.75 / (2.0 * PI * 4.0).sqrt()).ln();
        assert!((ll[[0, 0]] - expected).abs() < 1e-12);
    }

    #[test]
    fn zero_variance_is_rejected() {
        let defs = UNIT_DEFS.replace(" 1.0 1.0\n<TRANSP>", " 0.0 1.0\n<TRANSP>");
        let hmm = HmmSet::from_reader(io::Cursor::new(defs)).unwrap();
        assert!(precompute(&hmm).is_err());
    }
}

//! Reader for HTK binary parameter files (`*.mfc` and friends). The layout is
//! a 12 byte big-endian header followed by the frames as rows of 32-bit
//! floats: `i32` frame count, `i32` sample period in 100ns units, `i16` bytes
//! per frame and `i16` parameter kind. We only need the shape to turn the
//! payload into a dense frame matrix, but the period and kind are kept around
//! because they make diagnostics a lot less cryptic.
use anyhow::{bail, Context};
use ndarray::Array2;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;

/// An utterance worth of acoustic frames plus the header metadata.
#[derive(Debug, Clone)]
pub struct Features {
    /// Dense `[T x D]` frame matrix, one row per frame.
    pub frames: Array2<f32>,
    /// Frame period in 100ns units (100_000 for the usual 10ms step).
    pub sample_period: i32,
    /// HTK parameter kind code (e.g. MFCC_E_D_A).
    pub parameter_kind: i16,
}

impl Features {
    /// Loads the feature file at `path`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("opening feature file '{}'", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("reading feature file '{}'", path.display()))
    }

    /// Reads the binary layout from any reader, mostly so tests can feed in
    /// an in-memory buffer instead of shipping feature files around.
    pub fn from_reader(mut reader: impl Read) -> anyhow::Result<Self> {
        let mut header = [0u8; 12];
        reader
            .read_exact(&mut header)
            .context("reading 12 byte header")?;
        let n_samples = i32::from_be_bytes(header[0..4].try_into().unwrap());
        let sample_period = i32::from_be_bytes(header[4..8].try_into().unwrap());
        let sample_size = i16::from_be_bytes(header[8..10].try_into().unwrap());
        let parameter_kind = i16::from_be_bytes(header[10..12].try_into().unwrap());

        if n_samples < 0 {
            bail!("negative frame count {} in header", n_samples);
        }
        if sample_size <= 0 || sample_size % 4 != 0 {
            bail!(
                "frame width {} bytes is not a whole number of 32-bit floats",
                sample_size
            );
        }
        let rows = n_samples as usize;
        let cols = sample_size as usize / 4;

        let mut payload = vec![0u8; rows * cols * 4];
        reader
            .read_exact(&mut payload)
            .with_context(|| format!("reading {} frames of {} floats", rows, cols))?;

        let values = payload
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes(b.try_into().unwrap()))
            .collect::<Vec<_>>();
        let frames = Array2::from_shape_vec((rows, cols), values).expect("shape checked above");

        Ok(Self {
            frames,
            sample_period,
            parameter_kind,
        })
    }

    /// Number of frames in the utterance.
    pub fn len(&self) -> usize {
        self.frames.nrows()
    }

    /// Whether the utterance holds no frames at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Width of each frame.
    pub fn dim(&self) -> usize {
        self.frames.ncols()
    }
}

/// Raised when an utterance's frame width doesn't match the model's. The
/// orchestrator treats this as fatal for the whole run, everything else that
/// goes wrong with a single feature file only skips that utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionMismatch {
    /// Frame width found in the feature file.
    pub feature_dim: usize,
    /// Frame width the acoustic model was trained with.
    pub model_dim: usize,
}

impl fmt::Display for DimensionMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "feature dimension {} does not match model dimension {}",
            self.feature_dim, self.model_dim
        )
    }
}

impl Error for DimensionMismatch {}

//! Contrastive learning loss functions

use parking_lot::Mutex;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    autograd::Variable,
    config::{LossConfig, NumericPolicy},
    error::{ErrorContext, TandemError, TandemResult, WithContext},
    nn::similarity::{CosineSimilarity, SimilarityFunction},
    tensor::{Device, Shape},
};
use super::{
    classification::CrossEntropyLoss,
    utils::{check_pair, enforce_policy},
    Loss, Reduction,
};

/// Which entries of the (2N, 2N) similarity matrix are negatives.
///
/// Row `r` of the stacked batch pairs with row `(r + N) mod 2N`; the diagonal
/// and that partner are excluded, everything else is a negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationMask {
    batch_size: usize,
    mask: Vec<bool>,
}

impl CorrelationMask {
    pub fn new(batch_size: usize) -> TandemResult<Self> {
        if batch_size == 0 {
            return Err(TandemError::config_error("batch_size", "must be positive"));
        }
        let size = 2 * batch_size;
        let mut mask = vec![true; size * size];
        for r in 0..size {
            mask[r * size + r] = false;
            mask[r * size + (r + batch_size) % size] = false;
        }
        Ok(Self { batch_size, mask })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Side length 2N
    pub fn size(&self) -> usize {
        2 * self.batch_size
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        self.mask[row * self.size() + col]
    }

    /// Column holding the positive pair of `row`
    pub fn partner(&self, row: usize) -> usize {
        (row + self.batch_size) % self.size()
    }

    /// Negatives per row, 2N - 2
    pub fn negatives_per_row(&self) -> usize {
        self.size() - 2
    }

    /// Flat row-major indices of every negative entry
    pub fn negative_indices(&self) -> Vec<usize> {
        self.mask.iter()
            .enumerate()
            .filter_map(|(i, &keep)| keep.then_some(i))
            .collect()
    }
}

/// InfoNCE / NT-Xent over a batch and its paired view.
///
/// Both views are stacked into 2N rows, compared with the configured
/// similarity and scaled by `1 / temperature`. Each row's logits are its
/// positive followed by its negatives, and the loss is the summed
/// cross-entropy against class 0 divided by 2N.
pub struct SimClrLoss {
    mask: CorrelationMask,
    negative_indices: Vec<usize>,
    temperature: f32,
    n_negative: Option<usize>,
    similarity: Box<dyn SimilarityFunction>,
    rng: Mutex<StdRng>,
    policy: NumericPolicy,
    device: Device,
}

impl SimClrLoss {
    /// Cosine-similarity InfoNCE with every negative kept
    pub fn new(batch_size: usize, temperature: f32) -> TandemResult<Self> {
        Self::with_similarity(batch_size, temperature, Box::new(CosineSimilarity))
    }

    pub fn with_similarity(
        batch_size: usize,
        temperature: f32,
        similarity: Box<dyn SimilarityFunction>,
    ) -> TandemResult<Self> {
        if !(temperature.is_finite() && temperature > 0.0) {
            return Err(TandemError::config_error(
                "temperature",
                &format!("must be positive and finite, got {}", temperature),
            ));
        }
        let mask = CorrelationMask::new(batch_size)?;
        let negative_indices = mask.negative_indices();
        Ok(Self {
            mask,
            negative_indices,
            temperature,
            n_negative: None,
            similarity,
            rng: Mutex::new(StdRng::from_entropy()),
            policy: NumericPolicy::default(),
            device: Device::default(),
        })
    }

    pub fn from_config(config: &LossConfig) -> TandemResult<Self> {
        let contrastive = &config.contrastive;
        let mut loss = Self::with_similarity(
            config.batch_size,
            contrastive.temperature,
            contrastive.similarity.build(),
        )?
        .with_negatives(contrastive.negative_cap())
        .with_numeric_policy(config.runtime.numeric_policy)
        .on_device(config.runtime.device);
        if let Some(seed) = config.runtime.seed {
            loss = loss.with_seed(seed);
        }
        Ok(loss)
    }

    /// Keep at most `cap` randomly chosen negatives per row; `None` or 0 keeps all
    pub fn with_negatives(mut self, cap: Option<usize>) -> Self {
        self.n_negative = cap.filter(|&k| k > 0);
        self
    }

    /// Seed the internal generator used by [`SimClrLoss::forward`]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn with_numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn batch_size(&self) -> usize {
        self.mask.batch_size()
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn mask(&self) -> &CorrelationMask {
        &self.mask
    }

    /// Columns of negatives each logits row carries
    pub fn negatives_kept(&self) -> usize {
        let all = self.mask.negatives_per_row();
        self.n_negative.map_or(all, |k| k.min(all))
    }

    /// The (2N, 1 + K) logits matrix: column 0 holds each row's positive.
    ///
    /// Negatives are shuffled only when the cap drops some of them; otherwise
    /// they keep column order and `rng` is left untouched.
    pub fn logits<R>(&self, x: &Variable<2>, x_pair: &Variable<2>, rng: &mut R) -> TandemResult<Variable<2>>
    where
        R: Rng + ?Sized,
    {
        check_pair(x, x_pair, self.device, "SimClrLoss")?;
        let n = self.batch_size();
        if x.shape().rows() != n {
            return Err(TandemError::shape_error(
                &format!("batch of {} rows", n),
                &format!("{} rows", x.shape().rows()),
                None,
            ))
            .with_context(|| {
                ErrorContext::new("SimClrLoss")
                    .with_shape(x.shape())
                    .with_hint("construct a new SimClrLoss for a different batch size")
            });
        }

        let size = self.mask.size();
        let z = Variable::cat(&[x, x_pair], 0)?;
        let sim = self.similarity
            .similarity(&z, &z)?
            .mul_scalar(1.0 / self.temperature)?;
        if sim.shape().dims != [size, size] {
            return Err(TandemError::shape_error(
                &format!("[{}, {}] similarity matrix", size, size),
                &sim.shape().to_string(),
                Some(&format!("{} must compare every pair of rows", self.similarity.name())),
            ));
        }

        // one gather lays out [positive | negatives] per row
        let per_row = self.mask.negatives_per_row();
        let kept = self.negatives_kept();
        let mut picked = Vec::with_capacity(size * (1 + kept));
        for row in 0..size {
            let negatives = &self.negative_indices[row * per_row..(row + 1) * per_row];
            picked.push(row * size + self.mask.partner(row));
            if kept < per_row {
                let mut shuffled = negatives.to_vec();
                shuffled.shuffle(rng);
                picked.extend_from_slice(&shuffled[..kept]);
            } else {
                picked.extend_from_slice(negatives);
            }
        }
        if kept < per_row {
            tracing::trace!(kept, available = per_row, "subsampled negatives");
        }

        sim.gather(&picked, Shape::new([size, 1 + kept]))
    }

    /// Loss with negatives drawn from `rng`
    pub fn forward_with_rng<R>(&self, x: &Variable<2>, x_pair: &Variable<2>, rng: &mut R) -> TandemResult<Variable<0>>
    where
        R: Rng + ?Sized,
    {
        let logits = self.logits(x, x_pair, rng)?;
        let rows = logits.shape().rows();
        let labels = vec![0usize; rows];
        let loss = CrossEntropyLoss::new(Reduction::Sum)
            .forward(&logits, &labels)?
            .mul_scalar(1.0 / rows as f32)?;

        tracing::debug!(loss = loss.item(), batch_size = self.batch_size(), "simclr forward");
        enforce_policy(loss, self.policy, "SimClrLoss")
    }
}

impl Loss for SimClrLoss {
    /// Loss with negatives drawn from the internal generator
    fn forward(&self, x: &Variable<2>, x_pair: &Variable<2>) -> TandemResult<Variable<0>> {
        // the shared generator is held only long enough to fork a per-call stream
        let seed = self.rng.lock().gen::<u64>();
        self.forward_with_rng(x, x_pair, &mut StdRng::seed_from_u64(seed))
    }

    fn name(&self) -> &'static str { "SimClrLoss" }
    fn reduction(&self) -> Reduction { Reduction::Sum }
}

//! Supervised saliency losses and the binary cross-entropy used by the discriminator.

use burn::nn::loss::BinaryCrossEntropyLossConfig;
use burn::nn::pool::{AvgPool2d, AvgPool2dConfig};
use burn::nn::PaddingConfig2d;
use burn::prelude::*;
use burn::tensor::activation::sigmoid;

const PROB_EPSILON: f64 = 1e-7;

/// Pixel-wise supervision of one logit map against ground truth in `[0, 1]`.
pub trait SupervisedLoss<B: Backend> {
    /// `weight`, when given, is a per-pixel `[batch, 1, h, w]` map multiplied into the loss.
    fn loss(&self, logits: Tensor<B, 4>, gt: Tensor<B, 4>, weight: Option<Tensor<B, 4>>)
        -> Tensor<B, 1>;
}

/// Boundary-weighted BCE plus weighted IoU.
///
/// Pixels whose local mean differs from their own label (object boundaries) get
/// up to six times the weight of flat regions.
pub struct StructureLoss {
    pool: AvgPool2d,
}

impl StructureLoss {
    pub fn new(kernel: usize) -> Self {
        let pad = kernel / 2;
        Self {
            pool: AvgPool2dConfig::new([kernel, kernel])
                .with_strides([1, 1])
                .with_padding(PaddingConfig2d::Explicit(pad, pad))
                .with_count_include_pad(true)
                .init(),
        }
    }
}

impl Default for StructureLoss {
    fn default() -> Self {
        Self::new(31)
    }
}

impl<B: Backend> SupervisedLoss<B> for StructureLoss {
    fn loss(
        &self,
        logits: Tensor<B, 4>,
        gt: Tensor<B, 4>,
        weight: Option<Tensor<B, 4>>,
    ) -> Tensor<B, 1> {
        let [batch, channels, _, _] = logits.dims();
        let edge = self.pool.forward(gt.clone()).sub(gt.clone()).abs();
        let mut weit = edge.mul_scalar(5.0).add_scalar(1.0);
        if let Some(weight) = weight {
            weit = weit.mul(weight);
        }

        let wbce = bce_with_logits(logits.clone(), gt.clone())
            .mul(weit.clone())
            .sum_dim(3)
            .sum_dim(2)
            .div(weit.clone().sum_dim(3).sum_dim(2).add_scalar(PROB_EPSILON));

        let prob = sigmoid(logits);
        let inter = prob.clone().mul(gt.clone()).mul(weit.clone()).sum_dim(3).sum_dim(2);
        let union = prob.add(gt).mul(weit).sum_dim(3).sum_dim(2);
        let wiou = inter
            .clone()
            .add_scalar(1.0)
            .div(union.sub(inter).add_scalar(1.0))
            .neg()
            .add_scalar(1.0);

        wbce.add(wiou).reshape([batch * channels]).mean()
    }
}

/// Element-wise, numerically stable BCE on logits.
pub fn bce_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    target: Tensor<B, D>,
) -> Tensor<B, D> {
    logits
        .clone()
        .clamp_min(0.0)
        .sub(logits.clone().mul(target))
        .add(logits.abs().neg().exp().log1p())
}

/// Mean BCE of discriminator logits against a hard real (1) or fake (0) label.
pub fn adversarial_bce<B: Backend>(logits: Tensor<B, 4>, real: bool) -> Tensor<B, 1> {
    let logits = logits.flatten::<2>(1, 3);
    let device = logits.device();
    let targets = if real {
        Tensor::<B, 2, Int>::ones(logits.dims(), &device)
    } else {
        Tensor::<B, 2, Int>::zeros(logits.dims(), &device)
    };
    BinaryCrossEntropyLossConfig::new()
        .with_logits(true)
        .init(&device)
        .forward(logits, targets)
}

/// Mean BCE between probabilities and soft targets, both in `[0, 1]`.
///
/// Used where the target is soft, e.g. the confidence discriminator's label.
pub fn bce<B: Backend, const D: usize>(prob: Tensor<B, D>, target: Tensor<B, D>) -> Tensor<B, 1> {
    let prob = prob.clamp(PROB_EPSILON, 1.0 - PROB_EPSILON);
    let positive = target.clone().mul(prob.clone().log());
    let negative = target.neg().add_scalar(1.0).mul(prob.neg().add_scalar(1.0).log());
    positive.add(negative).neg().mean()
}

/// Soft label for the confidence discriminator: high where the prediction disagrees with GT.
pub fn confidence_target<B: Backend>(gt: Tensor<B, 4>, prob: Tensor<B, 4>) -> Tensor<B, 4> {
    let agree = gt.clone().mul(prob.clone().neg().add_scalar(1.0));
    let disagree = gt.neg().add_scalar(1.0).mul(prob);
    agree.add(disagree)
}

/// Average `loss` over every output map, each with its optional weight.
pub fn average_over_outputs<B: Backend, L: SupervisedLoss<B> + ?Sized>(
    loss: &L,
    outputs: &[Tensor<B, 4>],
    gt: &Tensor<B, 4>,
    weights: Option<&[Tensor<B, 4>]>,
) -> Tensor<B, 1> {
    let total = outputs
        .iter()
        .enumerate()
        .map(|(idx, output)| {
            let weight = weights.and_then(|weights| weights.get(idx).cloned());
            loss.loss(output.clone(), gt.clone(), weight)
        })
        .reduce(|acc, loss| acc.add(loss));
    match total {
        Some(total) => total.div_scalar(outputs.len() as f64),
        None => Tensor::zeros([1], &gt.device()),
    }
}

use burn::{
    module::RunningState,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    prelude::*,
    tensor::{cast::ToElement, module::conv2d, ops::ConvOptions, Distribution},
};

/// Configuration of the power iteration used to estimate a weight's largest
/// singular value.
#[derive(Config, Debug)]
pub struct SpectralNormConfig {
    /// Power iteration steps per training forward pass.
    #[config(default = 1)]
    pub n_power_iterations: usize,
    /// Steps run once on the freshly initialized weight so the first
    /// estimate is already converged.
    #[config(default = 50)]
    pub init_power_iterations: usize,
    #[config(default = 1e-12)]
    pub epsilon: f64,
}

impl SpectralNormConfig {
    /// Prepares the singular vector estimate for `weight`, viewed as a
    /// `[dims[0], rest]` matrix.
    pub fn init<B: Backend, const D: usize>(&self, weight: Tensor<B, D>) -> SpectralNorm<B> {
        let device = weight.device();
        let matrix = as_matrix(weight.detach());
        let [rows, _] = matrix.dims();

        let u = Tensor::<B, 2>::random([rows, 1], Distribution::Normal(0.0, 1.0), &device);
        let u = l2_normalize(u, self.epsilon);
        let (u, _) = power_iteration(matrix, u, self.init_power_iterations, self.epsilon);

        SpectralNorm {
            u: RunningState::new(u),
            n_power_iterations: self.n_power_iterations,
            epsilon: self.epsilon,
        }
    }
}

/// Rescales a weight by its estimated largest singular value.
///
/// The left singular vector estimate `u` is part of the module record but is
/// not trained. It advances only when the backend tracks gradients, so
/// inference passes over the same weights give identical results.
#[derive(Module, Debug)]
pub struct SpectralNorm<B: Backend> {
    u: RunningState<Tensor<B, 2>>,
    n_power_iterations: usize,
    epsilon: f64,
}

impl<B: Backend> SpectralNorm<B> {
    /// Returns `weight / sigma`. Gradients flow through both the weight and
    /// `sigma`; the singular vectors are treated as constants.
    pub fn normalize<const D: usize>(&self, weight: Tensor<B, D>) -> Tensor<B, D> {
        let dims = weight.dims();
        let matrix = as_matrix(weight);
        let sigma = self.estimate(matrix.clone(), true);

        matrix.div(sigma).reshape(dims)
    }

    /// Same as [`SpectralNorm::normalize`] but never advances the stored
    /// estimate, even on autodiff backends.
    pub fn normalized<const D: usize>(&self, weight: Tensor<B, D>) -> Tensor<B, D> {
        let dims = weight.dims();
        let matrix = as_matrix(weight);
        let sigma = self.estimate(matrix.clone(), false);

        matrix.div(sigma).reshape(dims)
    }

    /// Current estimate of the largest singular value of `weight`. Leaves the
    /// stored estimate untouched.
    pub fn sigma<const D: usize>(&self, weight: Tensor<B, D>) -> f32 {
        self.estimate(as_matrix(weight.detach()), false)
            .into_scalar()
            .to_f32()
    }

    // `advance` only has an effect when the backend tracks gradients.
    fn estimate(&self, matrix: Tensor<B, 2>, advance: bool) -> Tensor<B, 2> {
        let advance = advance && B::ad_enabled();
        let u = match advance {
            true => self.u.value_sync(),
            false => self.u.value(),
        };
        let (u, v) = power_iteration(
            matrix.clone().detach(),
            u,
            self.n_power_iterations,
            self.epsilon,
        );

        if advance {
            self.u.update(u.clone().detach());
        }

        u.transpose()
            .matmul(matrix.matmul(v))
            .clamp_min(self.epsilon)
    }
}

#[derive(Config, Debug)]
pub struct SnConv2dConfig {
    pub channels: [usize; 2],
    pub kernel_size: usize,
    #[config(default = 1)]
    pub stride: usize,
    /// Symmetric zero padding, `kernel_size / 2` when unset.
    #[config(default = "None")]
    pub padding: Option<usize>,
    #[config(default = "SpectralNormConfig::new()")]
    pub spectral_norm: SpectralNormConfig,
}

impl SnConv2dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SnConv2d<B> {
        let padding = self.padding.unwrap_or(self.kernel_size / 2);
        let conv = Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
            .with_stride([self.stride, self.stride])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .init(device);
        let norm = self.spectral_norm.init(conv.weight.val());

        SnConv2d {
            conv,
            norm,
            stride: [self.stride, self.stride],
            padding: [padding, padding],
        }
    }
}

/// 2D convolution whose kernel is spectrally normalized on every pass.
#[derive(Module, Debug)]
pub struct SnConv2d<B: Backend> {
    conv: Conv2d<B>,
    norm: SpectralNorm<B>,
    stride: [usize; 2],
    padding: [usize; 2],
}

impl<B: Backend> SnConv2d<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let weight = self.norm.normalize(self.conv.weight.val());
        let bias = self.conv.bias.as_ref().map(|bias| bias.val());

        conv2d(
            input,
            weight,
            bias,
            ConvOptions::new(self.stride, self.padding, [1, 1], 1),
        )
    }

    /// The kernel [`SnConv2d::forward`] would apply, without advancing the
    /// singular vector estimate.
    pub fn normalized_weight(&self) -> Tensor<B, 4> {
        self.norm.normalized(self.conv.weight.val())
    }

    /// Learned weight and bias elements, leaving out the power iteration
    /// state.
    pub fn num_weights(&self) -> usize {
        let bias = self
            .conv
            .bias
            .as_ref()
            .map_or(0, |bias| bias.val().shape().num_elements());

        self.conv.weight.val().shape().num_elements() + bias
    }

    /// Estimated largest singular value of the raw, unnormalized kernel.
    pub fn sigma(&self) -> f32 {
        self.norm.sigma(self.conv.weight.val())
    }
}

fn as_matrix<B: Backend, const D: usize>(weight: Tensor<B, D>) -> Tensor<B, 2> {
    let dims = weight.dims();
    let rows = dims[0];
    let cols = dims[1..].iter().product::<usize>();

    weight.reshape([rows, cols])
}

fn l2_normalize<B: Backend>(vector: Tensor<B, 2>, epsilon: f64) -> Tensor<B, 2> {
    let norm = vector
        .clone()
        .powf_scalar(2.0)
        .sum_dim(0)
        .sqrt()
        .add_scalar(epsilon);

    vector.div(norm)
}

// u: [rows, 1] -> (u: [rows, 1], v: [cols, 1])
fn power_iteration<B: Backend>(
    matrix: Tensor<B, 2>,
    u: Tensor<B, 2>,
    steps: usize,
    epsilon: f64,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let mut u = u;
    for _ in 0..steps {
        let v = l2_normalize(matrix.clone().transpose().matmul(u), epsilon);
        u = l2_normalize(matrix.clone().matmul(v), epsilon);
    }
    let v = l2_normalize(matrix.transpose().matmul(u.clone()), epsilon);

    (u, v)
}

/// Reference singular value computation for checking the normalized kernels.
#[cfg(test)]
pub(crate) fn largest_singular_value<B: Backend>(weight: Tensor<B, 4>) -> f64 {
    let [rows, ..] = weight.dims();
    let values = weight.into_data().to_vec::<f32>().unwrap();
    let cols = values.len() / rows;

    let mut v: Vec<f64> = (0..cols).map(|j| 1.0 + (j as f64 * 0.37).sin()).collect();
    let mut sigma = 0.0;
    for _ in 0..2000 {
        let wv: Vec<f64> = (0..rows)
            .map(|i| (0..cols).map(|j| values[i * cols + j] as f64 * v[j]).sum())
            .collect();
        let wtwv: Vec<f64> = (0..cols)
            .map(|j| (0..rows).map(|i| values[i * cols + j] as f64 * wv[i]).sum())
            .collect();
        let norm = wtwv.iter().map(|x| x * x).sum::<f64>().sqrt();
        sigma = norm.sqrt();
        v = wtwv.iter().map(|x| x / norm).collect();
    }

    sigma
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InferenceBackend as TestBackend;
    use burn::backend::Autodiff;

    type TrainBackend = Autodiff<TestBackend>;

    fn random<B: Backend>(shape: [usize; 4], device: &B::Device) -> Tensor<B, 4> {
        Tensor::random(shape, Distribution::Normal(0.0, 1.0), device)
    }

    fn untrained_estimate() -> SpectralNormConfig {
        SpectralNormConfig::new().with_init_power_iterations(0)
    }

    #[test]
    fn normalized_kernel_has_unit_spectral_norm() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([32, 64], 3)
            .init::<TestBackend>(&device);

        let raw = largest_singular_value(conv.conv.weight.val());
        let estimate = conv.sigma() as f64;
        assert!((raw - estimate).abs() / raw < 1e-2, "{raw} vs {estimate}");

        let sigma = largest_singular_value(conv.normalized_weight());
        assert!(sigma <= 1.0 + 1e-2, "sigma = {sigma}");
        assert!(sigma >= 1.0 - 1e-2, "sigma = {sigma}");
    }

    #[test]
    fn forward_keeps_conv_geometry() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([3, 8], 3)
            .with_stride(2)
            .init::<TestBackend>(&device);
        let output = conv.forward(Tensor::zeros([2, 3, 16, 12], &device));
        assert_eq!(output.dims(), [2, 8, 8, 6]);

        let conv = SnConv2dConfig::new([8, 1], 1).init::<TestBackend>(&device);
        let output = conv.forward(Tensor::zeros([2, 8, 8, 6], &device));
        assert_eq!(output.dims(), [2, 1, 8, 6]);
        assert_eq!(conv.num_weights(), 9);
    }

    #[test]
    fn inference_leaves_estimate_untouched() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([4, 4], 3)
            .with_spectral_norm(untrained_estimate())
            .init::<TestBackend>(&device);
        let before = conv.norm.u.value().into_data();

        let input = random::<TestBackend>([1, 4, 8, 8], &device);
        let first = conv.forward(input.clone()).into_data();
        let second = conv.forward(input).into_data();

        conv.norm.u.value().into_data().assert_eq(&before, true);
        first.assert_eq(&second, true);
    }

    #[test]
    fn training_advances_estimate() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([16, 16], 3)
            .with_spectral_norm(untrained_estimate())
            .init::<TrainBackend>(&device);
        let before = conv.norm.u.value().into_data();

        let input = random::<TrainBackend>([1, 16, 8, 8], &device);
        for _ in 0..30 {
            let _ = conv.forward(input.clone());
        }
        let after = conv.norm.u.value_sync().into_data();
        assert_ne!(
            before.to_vec::<f32>().unwrap(),
            after.to_vec::<f32>().unwrap()
        );

        let sigma = largest_singular_value(conv.normalized_weight().inner());
        assert!(sigma <= 1.0 + 1e-2, "sigma = {sigma}");
    }

    #[test]
    fn diagnostics_do_not_advance_estimate() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([16, 16], 3)
            .with_spectral_norm(untrained_estimate())
            .init::<TrainBackend>(&device);
        let before = conv.norm.u.value_sync().into_data();

        for _ in 0..5 {
            let _ = conv.sigma();
            let _ = conv.normalized_weight();
        }

        conv.norm.u.value_sync().into_data().assert_eq(&before, true);
    }

    #[test]
    fn gradients_reach_the_raw_kernel() {
        let device = Default::default();
        let conv = SnConv2dConfig::new([3, 4], 3).init::<TrainBackend>(&device);
        let input = random::<TrainBackend>([1, 3, 8, 8], &device);

        let grads = conv.forward(input).mean().backward();
        assert!(conv.conv.weight.grad(&grads).is_some());
    }
}

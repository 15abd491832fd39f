use burn::{
    config::Config,
    module::{Ignored, Module},
    nn::{
        BatchNorm, BatchNormConfig, Gelu, Linear, LinearConfig, PaddingConfig2d,
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
    },
    prelude::*,
    tensor::activation::{relu, sigmoid},
};

use crate::model::dpt::{IntermediateLayer, PATCH_SIZE, interpolate::resize_bilinear};

#[derive(Config, Debug)]
pub struct DptHeadConfig {
    /// Embedding width of the backbone tokens.
    pub in_channels: usize,
    /// Common channel width of the fusion chain.
    pub features: usize,
    /// Per-layer projection widths, shallow to deep.
    pub out_channels: [usize; 4],
    #[config(default = "1")]
    pub nclass: usize,
    #[config(default = "false")]
    pub use_batch_norm: bool,
    #[config(default = "false")]
    pub use_class_token: bool,
    #[config(default = "false")]
    pub metric_depth: bool,
}

/// Dense-prediction decoder over four transformer feature maps.
///
/// Each feature entry is reprojected to a layer-specific width, resampled
/// into a strict power-of-2 spatial hierarchy (finest at layer 0), reduced to
/// a common width, then fused top-down through four refinement stages. The
/// depth variant ends with an upsample to the 14x patch grid; the
/// segmentation variant emits per-class logits at the fused resolution.
#[derive(Module, Debug)]
pub struct DptHead<B: Backend> {
    projects: Vec<Conv2d<B>>,
    resize_layers: Vec<ResizeOp<B>>,
    readout_projects: Option<Vec<ReadoutProject<B>>>,
    scratch: Scratch<B>,
}

impl<B: Backend> DptHead<B> {
    pub fn new(device: &B::Device, config: DptHeadConfig) -> Self {
        let mut projects = Vec::with_capacity(4);
        for &channels in &config.out_channels {
            projects.push(
                Conv2dConfig::new([config.in_channels, channels], [1, 1])
                    .with_bias(true)
                    .init(device),
            );
        }

        let resize_layers = vec![
            ResizeOp::conv_transpose(
                ConvTranspose2dConfig::new(
                    [config.out_channels[0], config.out_channels[0]],
                    [4, 4],
                )
                .with_stride([4, 4])
                .with_bias(true)
                .init(device),
            ),
            ResizeOp::conv_transpose(
                ConvTranspose2dConfig::new(
                    [config.out_channels[1], config.out_channels[1]],
                    [2, 2],
                )
                .with_stride([2, 2])
                .with_bias(true)
                .init(device),
            ),
            ResizeOp::identity(),
            ResizeOp::conv(
                Conv2dConfig::new([config.out_channels[3], config.out_channels[3]], [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .with_stride([2, 2])
                    .with_bias(true)
                    .init(device),
            ),
        ];

        let readout_projects = if config.use_class_token {
            let mut readouts = Vec::with_capacity(4);
            for _ in 0..4 {
                readouts.push(ReadoutProject::new(device, config.in_channels));
            }
            Some(readouts)
        } else {
            None
        };

        let scratch = Scratch::new(
            device,
            &config.out_channels,
            config.features,
            config.nclass,
            config.use_batch_norm,
            config.metric_depth,
        );

        Self {
            projects,
            resize_layers,
            readout_projects,
            scratch,
        }
    }

    /// Decodes four ordered feature entries (shallow to deep) into a dense
    /// prediction. Depth output is `[batch, 1, 14 * patch_h, 14 * patch_w]`;
    /// segmentation output is `[batch, nclass]` at the fused resolution.
    pub fn forward(
        &self,
        features: &[IntermediateLayer<B>],
        patch_h: usize,
        patch_w: usize,
    ) -> Tensor<B, 4> {
        assert_eq!(
            features.len(),
            4,
            "DptHead expects exactly 4 feature entries, got {}",
            features.len()
        );

        let mut resampled = Vec::with_capacity(4);
        for (idx, entry) in features.iter().enumerate() {
            resampled.push(self.prepare_layer(entry, idx, patch_h, patch_w));
        }

        let path_1 = self.fuse(resampled);

        match &self.scratch.output {
            OutputHead::Depth(head) => head.forward(path_1, patch_h, patch_w),
            OutputHead::Segmentation(head) => head.forward(path_1),
        }
    }

    fn prepare_layer(
        &self,
        entry: &IntermediateLayer<B>,
        idx: usize,
        patch_h: usize,
        patch_w: usize,
    ) -> Tensor<B, 4> {
        let tokens = if let Some(readouts) = &self.readout_projects {
            let class_token = entry
                .class_token
                .clone()
                .expect("class token required when readout fusion is enabled");
            readouts[idx].forward(entry.patches.clone(), class_token)
        } else {
            entry.patches.clone()
        };

        let dims = tokens.shape().dims::<3>();
        assert_eq!(
            dims[1],
            patch_h * patch_w,
            "feature entry {idx} holds {} tokens, expected a {patch_h}x{patch_w} grid",
            dims[1]
        );

        // Tokens are in row-major spatial order, so a channel-first reshape
        // recovers the patch grid.
        let x = tokens.permute([0, 2, 1]).reshape([
            dims[0] as i32,
            dims[2] as i32,
            patch_h as i32,
            patch_w as i32,
        ]);
        let x = self.projects[idx].forward(x);
        self.resize_layers[idx].forward(x)
    }

    fn fuse(&self, features: Vec<Tensor<B, 4>>) -> Tensor<B, 4> {
        let mut it = features.into_iter();
        let layer_1 = it.next().expect("missing layer 1");
        let layer_2 = it.next().expect("missing layer 2");
        let layer_3 = it.next().expect("missing layer 3");
        let layer_4 = it.next().expect("missing layer 4");

        let layer_1_rn = self.scratch.layer1_rn.forward(layer_1);
        let layer_2_rn = self.scratch.layer2_rn.forward(layer_2);
        let layer_3_rn = self.scratch.layer3_rn.forward(layer_3);
        let layer_4_rn = self.scratch.layer4_rn.forward(layer_4);

        let path_4 = self
            .scratch
            .refinenet4
            .forward(layer_4_rn, None, Some(hw(&layer_3_rn)));
        let path_3 = self
            .scratch
            .refinenet3
            .forward(path_4, Some(layer_3_rn), Some(hw(&layer_2_rn)));
        let path_2 = self
            .scratch
            .refinenet2
            .forward(path_3, Some(layer_2_rn), Some(hw(&layer_1_rn)));
        self.scratch
            .refinenet1
            .forward(path_2, Some(layer_1_rn), None)
    }
}

fn hw<B: Backend>(tensor: &Tensor<B, 4>) -> [usize; 2] {
    let dims = tensor.shape().dims::<4>();
    [dims[2], dims[3]]
}

/// Class-token fusion: the whole-image token is broadcast over every patch
/// position, concatenated channel-wise, and projected back to the embedding
/// width.
#[derive(Module, Debug)]
struct ReadoutProject<B: Backend> {
    linear: Linear<B>,
    activation: Gelu,
}

impl<B: Backend> ReadoutProject<B> {
    fn new(device: &B::Device, in_channels: usize) -> Self {
        Self {
            linear: LinearConfig::new(2 * in_channels, in_channels).init(device),
            activation: Gelu::new(),
        }
    }

    fn forward(&self, patches: Tensor<B, 3>, class_token: Tensor<B, 2>) -> Tensor<B, 3> {
        let readout = class_token.unsqueeze_dim::<3>(1).expand(patches.shape());
        let fused = Tensor::cat(vec![patches, readout], 2);
        self.activation.forward(self.linear.forward(fused))
    }
}

/// Layer-specific spatial resampler: transpose-conv upsample, strided conv
/// downsample, or identity.
#[derive(Module, Debug)]
struct ResizeOp<B: Backend> {
    conv_t: Option<ConvTranspose2d<B>>,
    conv: Option<Conv2d<B>>,
}

impl<B: Backend> ResizeOp<B> {
    fn identity() -> Self {
        Self {
            conv_t: None,
            conv: None,
        }
    }

    fn conv_transpose(layer: ConvTranspose2d<B>) -> Self {
        Self {
            conv_t: Some(layer),
            conv: None,
        }
    }

    fn conv(layer: Conv2d<B>) -> Self {
        Self {
            conv_t: None,
            conv: Some(layer),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        if let Some(layer) = &self.conv_t {
            layer.forward(x)
        } else if let Some(layer) = &self.conv {
            layer.forward(x)
        } else {
            x
        }
    }
}

#[derive(Module, Debug)]
struct Scratch<B: Backend> {
    layer1_rn: Conv2d<B>,
    layer2_rn: Conv2d<B>,
    layer3_rn: Conv2d<B>,
    layer4_rn: Conv2d<B>,
    refinenet1: FeatureFusionBlock<B>,
    refinenet2: FeatureFusionBlock<B>,
    refinenet3: FeatureFusionBlock<B>,
    refinenet4: FeatureFusionBlock<B>,
    output: OutputHead<B>,
}

impl<B: Backend> Scratch<B> {
    fn new(
        device: &B::Device,
        in_channels: &[usize; 4],
        features: usize,
        nclass: usize,
        use_batch_norm: bool,
        metric_depth: bool,
    ) -> Self {
        let output = if nclass > 1 {
            OutputHead::Segmentation(SegmentationOutputHead::new(device, features, nclass))
        } else {
            let activation = if metric_depth {
                DepthActivation::Sigmoid
            } else {
                DepthActivation::Relu
            };
            OutputHead::Depth(DepthOutputHead::new(device, features, activation))
        };

        Self {
            layer1_rn: reduction_conv(device, in_channels[0], features),
            layer2_rn: reduction_conv(device, in_channels[1], features),
            layer3_rn: reduction_conv(device, in_channels[2], features),
            layer4_rn: reduction_conv(device, in_channels[3], features),
            refinenet1: FeatureFusionBlock::new(device, features, true, use_batch_norm),
            refinenet2: FeatureFusionBlock::new(device, features, true, use_batch_norm),
            refinenet3: FeatureFusionBlock::new(device, features, true, use_batch_norm),
            refinenet4: FeatureFusionBlock::new(device, features, false, use_batch_norm),
            output,
        }
    }
}

fn reduction_conv<B: Backend>(
    device: &B::Device,
    in_channels: usize,
    out_channels: usize,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .with_bias(false)
        .init(device)
}

/// Output stage of the decoder. The depth and segmentation variants have
/// different output contracts (channel count and spatial size), so each
/// carries its own weight set.
#[derive(Module, Debug)]
enum OutputHead<B: Backend> {
    Depth(DepthOutputHead<B>),
    Segmentation(SegmentationOutputHead<B>),
}

#[derive(Debug, Clone)]
enum DepthActivation {
    /// Bounded output in [0, 1], later scaled by the maximum depth.
    Sigmoid,
    /// Unbounded non-negative output for relative depth.
    Relu,
}

#[derive(Module, Debug)]
struct DepthOutputHead<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    activation: Ignored<DepthActivation>,
}

impl<B: Backend> DepthOutputHead<B> {
    fn new(device: &B::Device, features: usize, activation: DepthActivation) -> Self {
        let mid = 32;
        Self {
            conv1: Conv2dConfig::new([features, features / 2], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device),
            conv2: Conv2dConfig::new([features / 2, mid], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device),
            conv3: Conv2dConfig::new([mid, 1], [1, 1]).with_bias(true).init(device),
            activation: Ignored(activation),
        }
    }

    fn forward(&self, path_1: Tensor<B, 4>, patch_h: usize, patch_w: usize) -> Tensor<B, 4> {
        let x = self.conv1.forward(path_1);
        let x = resize_bilinear(x, [patch_h * PATCH_SIZE, patch_w * PATCH_SIZE]);
        let x = relu(self.conv2.forward(x));
        let x = self.conv3.forward(x);
        match self.activation.0 {
            DepthActivation::Sigmoid => sigmoid(x),
            DepthActivation::Relu => relu(x),
        }
    }
}

/// Per-class logits emitted at the fused resolution with no upsample.
#[derive(Module, Debug)]
struct SegmentationOutputHead<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

impl<B: Backend> SegmentationOutputHead<B> {
    fn new(device: &B::Device, features: usize, nclass: usize) -> Self {
        Self {
            conv1: Conv2dConfig::new([features, features], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(true)
                .init(device),
            conv2: Conv2dConfig::new([features, nclass], [1, 1])
                .with_bias(true)
                .init(device),
        }
    }

    fn forward(&self, path_1: Tensor<B, 4>) -> Tensor<B, 4> {
        self.conv2.forward(relu(self.conv1.forward(path_1)))
    }
}

/// Fuses a coarser accumulator with the next finer-scale map via residual
/// convolutions and an aligned-corner upsample to the requested size.
///
/// Without an explicit target the block doubles its resolution, which is how
/// the terminal refinement stage reaches the fused output resolution.
#[derive(Module, Debug)]
struct FeatureFusionBlock<B: Backend> {
    residual1: Option<ResidualConvUnit<B>>,
    residual2: ResidualConvUnit<B>,
    out_conv: Conv2d<B>,
}

impl<B: Backend> FeatureFusionBlock<B> {
    fn new(device: &B::Device, channels: usize, has_lateral: bool, use_batch_norm: bool) -> Self {
        let residual1 = if has_lateral {
            Some(ResidualConvUnit::new(device, channels, use_batch_norm))
        } else {
            None
        };
        Self {
            residual1,
            residual2: ResidualConvUnit::new(device, channels, use_batch_norm),
            out_conv: Conv2dConfig::new([channels, channels], [1, 1])
                .with_bias(true)
                .init(device),
        }
    }

    fn forward(
        &self,
        accumulator: Tensor<B, 4>,
        lateral: Option<Tensor<B, 4>>,
        size: Option<[usize; 2]>,
    ) -> Tensor<B, 4> {
        let mut y = accumulator;
        if let (Some(residual), Some(lateral)) = (&self.residual1, lateral) {
            y = y + residual.forward(lateral);
        }

        y = self.residual2.forward(y);
        let current = hw(&y);
        let target = size.unwrap_or([current[0] * 2, current[1] * 2]);
        y = resize_bilinear(y, target);
        self.out_conv.forward(y)
    }
}

#[derive(Module, Debug)]
struct ResidualConvUnit<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    norm1: Option<BatchNorm<B>>,
    norm2: Option<BatchNorm<B>>,
}

impl<B: Backend> ResidualConvUnit<B> {
    fn new(device: &B::Device, channels: usize, use_batch_norm: bool) -> Self {
        // Conv bias is redundant when a batch norm follows.
        let conv = |in_ch, out_ch| {
            Conv2dConfig::new([in_ch, out_ch], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(!use_batch_norm)
                .init(device)
        };
        let norm = || {
            use_batch_norm.then(|| BatchNormConfig::new(channels).init(device))
        };

        Self {
            conv1: conv(channels, channels),
            conv2: conv(channels, channels),
            norm1: norm(),
            norm2: norm(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.conv1.forward(relu(input.clone()));
        if let Some(norm) = &self.norm1 {
            x = norm.forward(x);
        }
        let mut x = self.conv2.forward(relu(x));
        if let Some(norm) = &self.norm2 {
            x = norm.forward(x);
        }
        x + input
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::dpt::test_support::layer_features;

    type TestBackend = crate::InferenceBackend;

    fn small_config() -> DptHeadConfig {
        DptHeadConfig::new(32, 16, [8, 16, 32, 32])
    }

    #[test]
    fn depth_head_emits_fourteen_times_patch_grid() {
        let device = <TestBackend as Backend>::Device::default();
        let head = DptHead::<TestBackend>::new(&device, small_config());
        let (patch_h, patch_w) = (4, 6);
        let features = layer_features(&device, 2, patch_h, patch_w, 32, false);

        let output = head.forward(&features, patch_h, patch_w);

        assert_eq!(
            output.shape().dims(),
            [2, 1, patch_h * PATCH_SIZE, patch_w * PATCH_SIZE]
        );
    }

    #[test]
    fn segmentation_head_stays_at_fused_resolution() {
        let device = <TestBackend as Backend>::Device::default();
        let head =
            DptHead::<TestBackend>::new(&device, small_config().with_nclass(5));
        let (patch_h, patch_w) = (4, 4);
        let features = layer_features(&device, 1, patch_h, patch_w, 32, false);

        let output = head.forward(&features, patch_h, patch_w);

        // The fusion chain ends two doublings above the finest resampled map
        // (x4 from the layer-0 resampler, x2 from the terminal refinement),
        // and per-class logits are never upsampled to the 14x grid.
        assert_eq!(output.shape().dims(), [1, 5, patch_h * 8, patch_w * 8]);
    }

    #[test]
    fn metric_activation_bounds_output_to_unit_interval() {
        let device = <TestBackend as Backend>::Device::default();
        let head = DptHead::<TestBackend>::new(
            &device,
            small_config().with_metric_depth(true),
        );
        let features = layer_features(&device, 1, 2, 2, 32, false);

        let output = head.forward(&features, 2, 2);
        let values = output
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap();

        assert!(values.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn readout_fusion_preserves_output_shape() {
        let device = <TestBackend as Backend>::Device::default();
        let plain = DptHead::<TestBackend>::new(&device, small_config());
        let fused = DptHead::<TestBackend>::new(
            &device,
            small_config().with_use_class_token(true),
        );
        let features = layer_features(&device, 1, 3, 3, 32, true);

        let plain_out = plain.forward(&features, 3, 3);
        let fused_out = fused.forward(&features, 3, 3);

        assert_eq!(plain_out.shape().dims::<4>(), fused_out.shape().dims::<4>());
    }

    #[test]
    fn batch_norm_toggle_runs_forward() {
        let device = <TestBackend as Backend>::Device::default();
        let head = DptHead::<TestBackend>::new(
            &device,
            small_config().with_use_batch_norm(true),
        );
        let features = layer_features(&device, 1, 2, 2, 32, false);

        let output = head.forward(&features, 2, 2);

        assert_eq!(output.shape().dims(), [1, 1, 2 * PATCH_SIZE, 2 * PATCH_SIZE]);
    }

    #[test]
    #[should_panic(expected = "exactly 4 feature entries")]
    fn rejects_short_feature_list() {
        let device = <TestBackend as Backend>::Device::default();
        let head = DptHead::<TestBackend>::new(&device, small_config());
        let features = layer_features(&device, 1, 2, 2, 32, false);

        head.forward(&features[..2], 2, 2);
    }

    #[test]
    #[should_panic(expected = "class token required")]
    fn readout_without_class_token_fails_loudly() {
        let device = <TestBackend as Backend>::Device::default();
        let head = DptHead::<TestBackend>::new(
            &device,
            small_config().with_use_class_token(true),
        );
        let features = layer_features(&device, 1, 2, 2, 32, false);

        head.forward(&features, 2, 2);
    }
}

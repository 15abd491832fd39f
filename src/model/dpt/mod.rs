use burn::{config::Config, prelude::*, tensor::activation::relu};
use thiserror::Error;

mod head;
mod interpolate;

pub use head::{DptHead, DptHeadConfig};
pub use interpolate::resize_bilinear;

/// Patch size of the DINOv2 backbone family.
pub const PATCH_SIZE: usize = 14;

/// One backbone layer's features: a patch-token grid in row-major spatial
/// order, plus the whole-image class token when requested.
#[derive(Clone, Debug)]
pub struct IntermediateLayer<B: Backend> {
    pub patches: Tensor<B, 3>,
    pub class_token: Option<Tensor<B, 2>>,
}

/// Seam to the pretrained patch-based transformer. The backbone is an
/// external collaborator: it is constructed, loaded, and owned by the caller
/// and injected into [`DptDinov2`] at construction.
pub trait DinoBackbone<B: Backend> {
    /// Embedding width of the emitted tokens.
    fn embed_dim(&self) -> usize;

    /// Number of transformer blocks, used to resolve count-based layer
    /// selection.
    fn depth(&self) -> usize;

    /// Runs the backbone and returns the features of the requested blocks,
    /// ordered shallow to deep.
    fn get_intermediate_layers(
        &self,
        input: Tensor<B, 4>,
        blocks: &[usize],
        return_class_token: bool,
    ) -> Vec<IntermediateLayer<B>>;
}

/// Which backbone blocks feed the decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LayerSelection {
    /// Explicit block indices, shallow to deep.
    Indices([usize; 4]),
    /// The last `n` blocks, resolved against the backbone's depth.
    LastN(usize),
}

impl LayerSelection {
    pub fn resolve(&self, depth: usize) -> Vec<usize> {
        match self {
            Self::Indices(indices) => indices.to_vec(),
            Self::LastN(count) => {
                assert!(
                    *count <= depth,
                    "cannot select the last {count} blocks of a {depth}-block backbone"
                );
                (depth - count..depth).collect()
            }
        }
    }
}

/// Named encoder presets: backbone size (small/base/large) crossed with
/// backbone generation. The generations differ only in which blocks are
/// tapped: v2 uses fixed non-contiguous indices, v1 the last four blocks.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub enum EncoderVariant {
    VitS,
    VitB,
    VitL,
    V2VitS,
    V2VitB,
    V2VitL,
}

impl EncoderVariant {
    pub fn embed_dim(&self) -> usize {
        match self {
            Self::VitS | Self::V2VitS => 384,
            Self::VitB | Self::V2VitB => 768,
            Self::VitL | Self::V2VitL => 1024,
        }
    }

    /// Common channel width of the decoder's fusion chain.
    pub fn features(&self) -> usize {
        match self {
            Self::VitS | Self::V2VitS => 64,
            Self::VitB | Self::V2VitB => 128,
            Self::VitL | Self::V2VitL => 256,
        }
    }

    /// Per-layer projection widths, shallow to deep.
    pub fn out_channels(&self) -> [usize; 4] {
        match self {
            Self::VitS | Self::V2VitS => [48, 96, 192, 384],
            Self::VitB | Self::V2VitB => [96, 192, 384, 768],
            Self::VitL | Self::V2VitL => [256, 512, 1024, 1024],
        }
    }

    pub fn layer_selection(&self) -> LayerSelection {
        match self {
            Self::VitS | Self::VitB | Self::VitL => LayerSelection::LastN(4),
            Self::V2VitS | Self::V2VitB => LayerSelection::Indices([2, 5, 8, 11]),
            Self::V2VitL => LayerSelection::Indices([4, 11, 17, 23]),
        }
    }
}

/// Depth post-processing applied to the decoder's bounded/unbounded output.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DepthMode {
    /// Real-world units: the sigmoid-bounded decoder output is scaled by the
    /// maximum representable depth, so values land in `[0, max_depth]`.
    Metric { max_depth: f64 },
    /// Unitless depth ordering, rectified to `[0, inf)`.
    Relative,
}

#[derive(Debug, Error)]
pub enum DptError {
    #[error(
        "incompatible input geometry: expected [batch, 3, h, w] with h and w \
         multiples of {PATCH_SIZE}, got {shape:?}"
    )]
    IncompatibleGeometry { shape: [usize; 4] },
}

#[derive(Config, Debug)]
pub struct DptDinov2Config {
    pub encoder: EncoderVariant,
    #[config(default = "false")]
    pub use_batch_norm: bool,
    #[config(default = "false")]
    pub use_class_token: bool,
    #[config(default = "false")]
    pub metric_depth: bool,
    #[config(default = "20.0")]
    pub max_depth: f64,
}

/// Monocular depth estimator: an injected DINOv2-style backbone feeding the
/// [`DptHead`] decoder, with final upsampling and depth post-processing.
#[derive(Clone, Debug)]
pub struct DptDinov2<B: Backend, V: DinoBackbone<B>> {
    backbone: V,
    head: DptHead<B>,
    encoder: EncoderVariant,
    layer_selection: LayerSelection,
    mode: DepthMode,
}

impl<B: Backend, V: DinoBackbone<B>> DptDinov2<B, V> {
    pub fn new(device: &B::Device, config: DptDinov2Config, backbone: V) -> Self {
        let encoder = config.encoder;
        assert_eq!(
            backbone.embed_dim(),
            encoder.embed_dim(),
            "backbone embedding width does not match the {encoder:?} preset"
        );

        let head_config =
            DptHeadConfig::new(encoder.embed_dim(), encoder.features(), encoder.out_channels())
                .with_use_batch_norm(config.use_batch_norm)
                .with_use_class_token(config.use_class_token)
                .with_metric_depth(config.metric_depth);
        let head = DptHead::new(device, head_config);

        let mode = if config.metric_depth {
            DepthMode::Metric {
                max_depth: config.max_depth,
            }
        } else {
            DepthMode::Relative
        };

        Self {
            backbone,
            head,
            encoder,
            layer_selection: encoder.layer_selection(),
            mode,
        }
    }

    /// Predicts a depth map for an image batch whose height and width are
    /// multiples of the backbone patch size.
    ///
    /// Metric mode yields values in `[0, max_depth]`; relative mode yields
    /// values in `[0, inf)`. The returned tensor is `[batch, height, width]`.
    pub fn infer(&self, input: Tensor<B, 4>) -> Result<Tensor<B, 3>, DptError> {
        let dims = input.shape().dims::<4>();
        let [_, channels, height, width] = dims;
        if channels != 3
            || height == 0
            || width == 0
            || height % PATCH_SIZE != 0
            || width % PATCH_SIZE != 0
        {
            return Err(DptError::IncompatibleGeometry { shape: dims });
        }

        let blocks = self.layer_selection.resolve(self.backbone.depth());
        let features = self
            .backbone
            .get_intermediate_layers(input, &blocks, true);

        let depth = self
            .head
            .forward(&features, height / PATCH_SIZE, width / PATCH_SIZE);

        // The decoder already lands on the input resolution when both sides
        // are multiples of the patch size; resize only on mismatch.
        let out_dims = depth.shape().dims::<4>();
        let depth = if out_dims[2] != height || out_dims[3] != width {
            resize_bilinear(depth, [height, width])
        } else {
            depth
        };

        let depth = match self.mode {
            DepthMode::Metric { max_depth } => depth.mul_scalar(max_depth),
            DepthMode::Relative => relu(depth),
        };

        Ok(depth.squeeze_dim(1))
    }

    pub fn encoder(&self) -> EncoderVariant {
        self.encoder
    }

    pub fn mode(&self) -> DepthMode {
        self.mode
    }

    pub fn head(&self) -> &DptHead<B> {
        &self.head
    }

    pub fn backbone(&self) -> &V {
        &self.backbone
    }
}

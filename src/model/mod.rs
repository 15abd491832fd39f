pub mod dpt;

pub use dpt::{
    DepthMode, DinoBackbone, DptDinov2, DptDinov2Config, DptError, DptHead, DptHeadConfig,
    EncoderVariant, IntermediateLayer, LayerSelection, PATCH_SIZE,
};

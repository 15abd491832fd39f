#![recursion_limit = "256"]

pub mod inference;
pub mod model;

pub use model::dpt::{
    DepthMode, DinoBackbone, DptDinov2, DptDinov2Config, DptError, DptHead, DptHeadConfig,
    EncoderVariant, IntermediateLayer, LayerSelection, PATCH_SIZE,
};

#[cfg(feature = "backend_cuda")]
pub type InferenceBackend = burn::backend::Cuda<f32>;

#[cfg(all(feature = "backend_wgpu", not(feature = "backend_cuda")))]
pub type InferenceBackend = burn::backend::Wgpu<f32>;

#[cfg(all(
    feature = "backend_ndarray",
    not(any(feature = "backend_cuda", feature = "backend_wgpu"))
))]
pub type InferenceBackend = burn::backend::NdArray<f32>;

#[cfg(test)]
mod tests {
    use super::model::dpt::{
        DptDinov2, DptDinov2Config, EncoderVariant, test_support::StubBackbone,
    };

    #[cfg(feature = "backend_cuda")]
    use burn::backend::Cuda as CudaBackend;

    #[cfg(feature = "backend_ndarray")]
    use burn::backend::NdArray as NdArrayBackend;

    #[cfg(feature = "backend_wgpu")]
    use burn::backend::Wgpu as WgpuBackend;

    use burn::prelude::*;

    #[cfg(any(feature = "backend_wgpu", feature = "backend_cuda"))]
    use std::panic::{self, AssertUnwindSafe};

    const TEST_SIDE: usize = 224;

    fn test_config() -> DptDinov2Config {
        DptDinov2Config::new(EncoderVariant::VitS)
            .with_metric_depth(true)
            .with_max_depth(10.0)
    }

    fn build_model<B: Backend>(device: &B::Device) -> DptDinov2<B, StubBackbone> {
        DptDinov2::new(device, test_config(), StubBackbone::vits())
    }

    #[allow(dead_code)]
    #[derive(Clone, Copy)]
    enum Availability {
        Optional(&'static str),
        Required(&'static str),
    }

    fn resolve_device<B, F>(make_device: F, availability: Availability) -> Option<B::Device>
    where
        B: Backend,
        F: Fn() -> Result<B::Device, String>,
    {
        match make_device() {
            Ok(device) => Some(device),
            Err(reason) => match availability {
                Availability::Optional(label) => {
                    println!("ignored {label}: {reason}");
                    None
                }
                Availability::Required(label) => panic!("{label}: {reason}"),
            },
        }
    }

    fn run_initializes_test<B, F>(make_device: F, availability: Availability)
    where
        B: Backend,
        F: Fn() -> Result<B::Device, String>,
    {
        let Some(device) = resolve_device::<B, _>(make_device, availability) else {
            return;
        };

        let model = build_model::<B>(&device);
        assert_eq!(model.encoder(), EncoderVariant::VitS);
    }

    fn run_roundtrip_test<B, F>(make_device: F, availability: Availability)
    where
        B: Backend,
        F: Fn() -> Result<B::Device, String>,
    {
        let Some(device) = resolve_device::<B, _>(make_device, availability) else {
            return;
        };

        let model = build_model::<B>(&device);
        let record = model.head().clone().into_record();
        let reloaded = build_model::<B>(&device);
        let _ = reloaded.head().clone().load_record(record);
    }

    fn run_inference_test<B, F>(make_device: F, availability: Availability)
    where
        B: Backend,
        F: Fn() -> Result<B::Device, String>,
    {
        let Some(device) = resolve_device::<B, _>(make_device, availability) else {
            return;
        };

        let model = build_model::<B>(&device);
        let input = Tensor::<B, 4>::zeros([1, 3, TEST_SIDE, TEST_SIDE], &device);
        let depth = model.infer(input).expect("inference failed");

        assert_eq!(depth.shape().dims(), [1, TEST_SIDE, TEST_SIDE]);
    }

    #[cfg(feature = "backend_ndarray")]
    fn init_ndarray_device() -> Result<<NdArrayBackend<f32> as Backend>::Device, String> {
        Ok(<NdArrayBackend<f32> as Backend>::Device::default())
    }

    #[cfg(feature = "backend_wgpu")]
    fn init_wgpu_device() -> Result<<WgpuBackend<f32> as Backend>::Device, String> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            <WgpuBackend<f32> as Backend>::Device::default()
        }))
        .map_err(|_| "WGPU runtime unavailable on this system.".to_string())
    }

    #[cfg(feature = "backend_cuda")]
    fn init_cuda_device() -> Result<<CudaBackend<f32> as Backend>::Device, String> {
        panic::catch_unwind(AssertUnwindSafe(|| {
            <CudaBackend<f32> as Backend>::Device::default()
        }))
        .map_err(|_| "CUDA runtime unavailable on this system.".to_string())
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn dpt_dinov2_initializes_ndarray() {
        run_initializes_test::<NdArrayBackend<f32>, _>(
            init_ndarray_device,
            Availability::Required("NdArray backend unavailable"),
        );
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn dpt_dinov2_roundtrip_record_ndarray() {
        run_roundtrip_test::<NdArrayBackend<f32>, _>(
            init_ndarray_device,
            Availability::Required("NdArray backend unavailable"),
        );
    }

    #[test]
    #[cfg(feature = "backend_ndarray")]
    fn dpt_dinov2_infers_ndarray() {
        run_inference_test::<NdArrayBackend<f32>, _>(
            init_ndarray_device,
            Availability::Required("NdArray backend unavailable"),
        );
    }

    #[test]
    #[cfg(feature = "backend_wgpu")]
    fn dpt_dinov2_initializes_wgpu() {
        run_initializes_test::<WgpuBackend<f32>, _>(
            init_wgpu_device,
            Availability::Optional("WGPU backend test"),
        );
    }

    #[test]
    #[cfg(feature = "backend_wgpu")]
    fn dpt_dinov2_infers_wgpu() {
        run_inference_test::<WgpuBackend<f32>, _>(
            init_wgpu_device,
            Availability::Optional("WGPU backend test"),
        );
    }

    #[test]
    #[cfg(feature = "backend_cuda")]
    fn dpt_dinov2_initializes_cuda() {
        run_initializes_test::<CudaBackend<f32>, _>(
            init_cuda_device,
            Availability::Required("CUDA backend unavailable"),
        );
    }

    #[test]
    #[cfg(feature = "backend_cuda")]
    fn dpt_dinov2_infers_cuda() {
        run_inference_test::<CudaBackend<f32>, _>(
            init_cuda_device,
            Availability::Required("CUDA backend unavailable"),
        );
    }
}

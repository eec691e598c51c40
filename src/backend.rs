//! Compute backend used by the binaries.

use burn::backend::Autodiff;

#[cfg(not(feature = "cuda"))]
pub type InferenceBackend = burn::backend::WebGpu<f32, i32>;
#[cfg(feature = "cuda")]
pub type InferenceBackend = burn_cuda::Cuda<f32, i32>;

pub type TrainingBackend = Autodiff<InferenceBackend>;

#[cfg(not(feature = "cuda"))]
pub fn default_device() -> burn::backend::wgpu::WgpuDevice {
    burn::backend::wgpu::WgpuDevice::default()
}

#[cfg(feature = "cuda")]
pub fn default_device() -> burn_cuda::CudaDevice {
    burn_cuda::CudaDevice::default()
}

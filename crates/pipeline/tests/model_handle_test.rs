use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use omnigen_pipeline::{
    DiffusionModel, ModelHandle, ModelKwargs, ModelPlacement, PipelineError, PromptKvCache,
};

#[derive(Debug)]
struct RecordingModel {
    device: Device,
}

impl Default for RecordingModel {
    fn default() -> Self {
        Self { device: Device::Cpu }
    }
}

impl DiffusionModel for RecordingModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn dtype(&self) -> DType {
        DType::F32
    }

    fn forward(
        &mut self,
        latents: &Tensor,
        _timestep: f64,
        _kwargs: &ModelKwargs,
        _cache: &mut PromptKvCache,
    ) -> Result<Tensor> {
        Ok(latents.zeros_like()?)
    }

    fn move_to(&mut self, device: &Device) -> Result<()> {
        self.device = device.clone();
        Ok(())
    }

    fn offload_layers_to_host(&mut self) -> Result<()> {
        Ok(())
    }
}

#[test]
fn handle_starts_where_the_weights_live() {
    let handle = ModelHandle::new(Box::new(RecordingModel::default()));
    assert!(handle.is_loaded());
    assert_eq!(handle.placement(), ModelPlacement::OnHost);
}

#[test]
fn unloaded_handles_refuse_to_serve_the_model() {
    let mut handle = ModelHandle::unloaded();
    assert!(!handle.is_loaded());
    assert_eq!(handle.placement(), ModelPlacement::Unloaded);

    let err = handle.model_mut().expect_err("no weights installed");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::ModelUnavailable)
    ));
    assert!(handle.partially_offload().is_err());

    handle.install(Box::new(RecordingModel::default()));
    assert!(handle.is_loaded());
    assert_eq!(handle.placement(), ModelPlacement::OnHost);
}

#[test]
fn moving_to_the_current_placement_is_a_no_op() -> Result<()> {
    let mut handle = ModelHandle::new(Box::new(RecordingModel::default()));
    handle.move_to(&Device::Cpu)?;
    assert_eq!(handle.placement(), ModelPlacement::OnHost);
    Ok(())
}

#[test]
fn partial_offload_is_sticky_until_the_next_move() -> Result<()> {
    let mut handle = ModelHandle::new(Box::new(RecordingModel::default()));
    handle.partially_offload()?;
    assert_eq!(handle.placement(), ModelPlacement::PartiallyOffloaded);
    // Offloading again does not re-run the layer walk.
    handle.partially_offload()?;
    assert_eq!(handle.placement(), ModelPlacement::PartiallyOffloaded);

    handle.move_to(&Device::Cpu)?;
    assert_eq!(handle.placement(), ModelPlacement::OnHost);
    Ok(())
}

use std::fmt;
use std::time::Duration;

use crate::model::ModelPlacement;

/// Pipeline-level events intended for observability, profiling, and
/// debugging. Event semantics stay stable even as the internals move.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BatchPrepared {
        prompts: usize,
        branches: usize,
        separate: bool,
    },

    ImagesEncoded {
        count: usize,
        duration: Duration,
    },

    ModelMoved {
        placement: ModelPlacement,
    },

    SamplingStarted {
        steps: usize,
        guidance_scale: f64,
        img_guidance_scale: Option<f64>,
    },

    SamplingFinished {
        steps: usize,
        duration: Duration,
    },
}

fn format_duration_s(duration: &Duration) -> String {
    format!("{:.3}s", duration.as_secs_f64())
}

impl serde::Serialize for PipelineEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use PipelineEvent::*;

        match self {
            BatchPrepared {
                prompts,
                branches,
                separate,
            } => {
                #[derive(serde::Serialize)]
                struct Event {
                    kind: &'static str,
                    prompts: usize,
                    branches: usize,
                    separate: bool,
                }

                Event {
                    kind: "batch_prepared",
                    prompts: *prompts,
                    branches: *branches,
                    separate: *separate,
                }
                .serialize(serializer)
            }
            ImagesEncoded { count, duration } => {
                #[derive(serde::Serialize)]
                struct Event {
                    kind: &'static str,
                    count: usize,
                    duration_s: f64,
                }

                Event {
                    kind: "images_encoded",
                    count: *count,
                    duration_s: duration.as_secs_f64(),
                }
                .serialize(serializer)
            }
            ModelMoved { placement } => {
                #[derive(serde::Serialize)]
                struct Event<'a> {
                    kind: &'static str,
                    placement: &'a ModelPlacement,
                }

                Event {
                    kind: "model_moved",
                    placement,
                }
                .serialize(serializer)
            }
            SamplingStarted {
                steps,
                guidance_scale,
                img_guidance_scale,
            } => {
                #[derive(serde::Serialize)]
                struct Event {
                    kind: &'static str,
                    steps: usize,
                    guidance_scale: f64,
                    img_guidance_scale: Option<f64>,
                }

                Event {
                    kind: "sampling_started",
                    steps: *steps,
                    guidance_scale: *guidance_scale,
                    img_guidance_scale: *img_guidance_scale,
                }
                .serialize(serializer)
            }
            SamplingFinished { steps, duration } => {
                #[derive(serde::Serialize)]
                struct Event {
                    kind: &'static str,
                    steps: usize,
                    duration_s: f64,
                }

                Event {
                    kind: "sampling_finished",
                    steps: *steps,
                    duration_s: duration.as_secs_f64(),
                }
                .serialize(serializer)
            }
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use PipelineEvent::*;

        match self {
            BatchPrepared {
                prompts,
                branches,
                separate,
            } => write!(
                f,
                "BatchPrepared prompts={prompts} branches={branches} separate={separate}"
            ),
            ImagesEncoded { count, duration } => write!(
                f,
                "ImagesEncoded count={count} in {}",
                format_duration_s(duration)
            ),
            ModelMoved { placement } => write!(f, "ModelMoved placement={placement}"),
            SamplingStarted {
                steps,
                guidance_scale,
                img_guidance_scale,
            } => match img_guidance_scale {
                Some(img) => write!(
                    f,
                    "SamplingStarted steps={steps} guidance_scale={guidance_scale} img_guidance_scale={img}"
                ),
                None => write!(f, "SamplingStarted steps={steps} guidance_scale={guidance_scale}"),
            },
            SamplingFinished { steps, duration } => write!(
                f,
                "SamplingFinished steps={steps} in {}",
                format_duration_s(duration)
            ),
        }
    }
}

/// Observer interface for pipeline lifecycle and generation metrics.
///
/// The default implementation is a no-op so callers only opt in when they
/// care.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, _event: &PipelineEvent) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

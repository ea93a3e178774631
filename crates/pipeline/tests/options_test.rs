use omnigen_pipeline::{GenerateOptions, GenerateOptionsPatch, PipelineError};

#[test]
fn defaults_match_the_reference_settings() {
    let options = GenerateOptions::default();
    assert_eq!(options.height, 1024);
    assert_eq!(options.width, 1024);
    assert_eq!(options.num_inference_steps, 50);
    assert_eq!(options.guidance_scale, 3.0);
    assert_eq!(options.img_guidance_scale, 1.6);
    assert!(options.use_img_guidance);
    assert!(options.use_kv_cache);
    assert!(options.offload_kv_cache);
    assert!(!options.separate_cfg_infer);
    assert!(!options.offload_model);
    assert!(!options.move_to_ram);
    assert_eq!(options.max_input_image_size, 1024);
    assert!(options.seed.is_none());
    options.validate().expect("defaults validate");
}

#[test]
fn patch_overrides_only_set_fields() {
    let patch = GenerateOptionsPatch {
        num_inference_steps: Some(25),
        guidance_scale: Some(2.5),
        seed: Some(7),
        ..GenerateOptionsPatch::default()
    };
    let options = GenerateOptions::default() + &patch;
    assert_eq!(options.num_inference_steps, 25);
    assert_eq!(options.guidance_scale, 2.5);
    assert_eq!(options.seed, Some(7));
    // Untouched fields keep their defaults.
    assert_eq!(options.img_guidance_scale, 1.6);
    assert_eq!(options.height, 1024);
}

#[test]
fn patch_deserializes_from_sparse_json() {
    let patch: GenerateOptionsPatch = serde_json::from_str(
        r#"{"height": 512, "width": 512, "separate_cfg_infer": true}"#,
    )
    .expect("sparse patch parses");
    let options = GenerateOptions::default() + &patch;
    assert_eq!((options.height, options.width), (512, 512));
    assert!(options.separate_cfg_infer);
    assert_eq!(options.num_inference_steps, 50);
}

#[test]
fn invalid_output_sizes_are_rejected() {
    let options = GenerateOptions {
        height: 1000,
        ..GenerateOptions::default()
    };
    assert!(matches!(
        options.validate(),
        Err(PipelineError::InvalidOutputSize { height: 1000, .. })
    ));

    let options = GenerateOptions {
        width: 0,
        ..GenerateOptions::default()
    };
    assert!(options.validate().is_err());
}

#[test]
fn step_and_guidance_bounds_are_enforced() {
    let options = GenerateOptions {
        num_inference_steps: 0,
        ..GenerateOptions::default()
    };
    assert!(matches!(
        options.validate(),
        Err(PipelineError::NoInferenceSteps)
    ));

    let options = GenerateOptions {
        guidance_scale: -1.0,
        ..GenerateOptions::default()
    };
    assert!(matches!(
        options.validate(),
        Err(PipelineError::InvalidGuidanceScale(_))
    ));
}

#[test]
fn prepare_options_mirror_the_request() {
    let options = GenerateOptions {
        height: 512,
        width: 768,
        negative_prompt: Some("grainy".to_string()),
        separate_cfg_infer: true,
        use_img_guidance: false,
        ..GenerateOptions::default()
    };
    let prepare = options.prepare_options();
    assert_eq!((prepare.height, prepare.width), (512, 768));
    assert_eq!(prepare.negative_prompt.as_deref(), Some("grainy"));
    assert!(prepare.separate_cfg);
    assert!(!prepare.use_img_cfg);
}

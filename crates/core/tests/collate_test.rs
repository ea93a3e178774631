use anyhow::Result;
use candle_core::Tensor;
use omnigen_core::{Collator, ImageSpan, MultimodalPrompt, DEFAULT_PAD_TOKEN_ID};

fn text_unit(ids: &[i64]) -> MultimodalPrompt {
    MultimodalPrompt::text_only(ids.to_vec())
}

#[test]
fn batch_is_left_padded_to_common_length() -> Result<()> {
    let units = vec![text_unit(&[11, 12, 13, 14, 15]), text_unit(&[21, 22, 23])];
    let sizes = vec![(32, 32); 2];
    let batch = Collator::new().assemble(&units, &sizes)?;

    let ids = batch.input_ids.to_vec2::<i64>()?;
    assert_eq!(ids[0], vec![11, 12, 13, 14, 15]);
    assert_eq!(
        ids[1],
        vec![DEFAULT_PAD_TOKEN_ID, DEFAULT_PAD_TOKEN_ID, 21, 22, 23]
    );

    // seq = 5 text + 1 time token + 4 output patch tokens
    assert_eq!(batch.attention_mask.dims(), &[2, 10, 10]);
    assert_eq!(batch.position_ids.dims(), &[2, 10]);
    Ok(())
}

#[test]
fn positions_restart_after_padding() -> Result<()> {
    let units = vec![text_unit(&[11, 12, 13, 14, 15]), text_unit(&[21, 22, 23])];
    let sizes = vec![(32, 32); 2];
    let batch = Collator::new().assemble(&units, &sizes)?;

    let positions = batch.position_ids.to_vec2::<i64>()?;
    assert_eq!(positions[0], (0..=9).collect::<Vec<i64>>());
    assert_eq!(positions[1], vec![0, 0, 0, 1, 2, 3, 4, 5, 6, 7]);
    Ok(())
}

#[test]
fn mask_is_causal_over_text_and_dense_over_image_block() -> Result<()> {
    let units = vec![text_unit(&[11, 12, 13])];
    let sizes = vec![(32, 32)];
    let batch = Collator::new().assemble(&units, &sizes)?;
    let mask = batch.attention_mask.to_vec3::<f32>()?;
    let row = &mask[0];

    // 3 text tokens + time token form a causal block of 4.
    assert_eq!(row[0][..4], [1.0, 0.0, 0.0, 0.0]);
    assert_eq!(row[3][..4], [1.0, 1.0, 1.0, 1.0]);
    // No text row sees the output-image block.
    assert!(row[3][4..].iter().all(|&v| v == 0.0));
    // Output-image rows see everything.
    for image_row in &row[4..8] {
        assert!(image_row.iter().all(|&v| v == 1.0));
    }
    Ok(())
}

#[test]
fn pad_rows_stay_visible_but_pad_columns_do_not() -> Result<()> {
    let units = vec![text_unit(&[11, 12, 13, 14, 15]), text_unit(&[21, 22, 23])];
    let sizes = vec![(32, 32); 2];
    let batch = Collator::new().assemble(&units, &sizes)?;
    let mask = batch.attention_mask.to_vec3::<f32>()?;
    let padded_row = &mask[1];

    // Pad query rows are all ones so their softmax stays finite.
    assert!(padded_row[0].iter().all(|&v| v == 1.0));
    assert!(padded_row[1].iter().all(|&v| v == 1.0));
    // Real rows never attend to the pad columns.
    for row in &padded_row[2..] {
        assert_eq!(row[..2], [0.0, 0.0]);
    }
    assert_eq!(padded_row[2][2], 1.0);
    Ok(())
}

#[test]
fn smaller_output_gets_filler_embeddings_and_dead_columns() -> Result<()> {
    let units = vec![text_unit(&[11, 12]), text_unit(&[21, 22])];
    let sizes = vec![(32, 32), (16, 16)]; // 4 tokens vs 1 token
    let batch = Collator::new().with_hidden_size(8).assemble(&units, &sizes)?;

    assert!(batch.padding_images[0].is_none());
    let filler = batch.padding_images[1].as_ref().expect("filler embeddings");
    assert_eq!(filler.dims(), &[1, 3, 8]);
    let sum = filler.sum_all()?.to_scalar::<f32>()?;
    assert_eq!(sum, 0.0);

    // The 3 unused trailing key columns are dead for every query row.
    let mask = batch.attention_mask.to_vec3::<f32>()?;
    let seq_len = mask[1][0].len();
    for row in &mask[1] {
        assert!(row[seq_len - 3..].iter().all(|&v| v == 0.0));
    }
    // The full-size unit keeps its entire image block.
    assert!(mask[0][seq_len - 1].iter().skip(2).all(|&v| v == 1.0));
    Ok(())
}

#[test]
fn input_image_spans_are_shifted_and_opened() -> Result<()> {
    let pixel = Tensor::zeros((3, 32, 32), candle_core::DType::F32, &candle_core::Device::Cpu)?;
    let with_image = MultimodalPrompt {
        input_ids: vec![0, 0, 31, 32, 33],
        image_spans: vec![ImageSpan::new(0, 2)],
        pixel_values: vec![pixel],
    };
    let units = vec![text_unit(&[11, 12, 13, 14, 15, 16, 17]), with_image];
    let sizes = vec![(32, 32); 2];
    let batch = Collator::new().assemble(&units, &sizes)?;

    // Two pad slots shift the span right.
    assert_eq!(batch.image_sizes[&1], vec![ImageSpan::new(2, 4)]);
    assert!(!batch.image_sizes.contains_key(&0));

    // Patch tokens gained mutual visibility beyond the causal triangle.
    let mask = batch.attention_mask.to_vec3::<f32>()?;
    assert_eq!(mask[1][2][3], 1.0);

    // Pixel tensors pick up a leading batch axis.
    assert_eq!(batch.pixel_values.len(), 1);
    assert_eq!(batch.pixel_values[0].dims(), &[1, 3, 32, 32]);
    Ok(())
}

#[test]
fn empty_batch_is_rejected() {
    let result = Collator::new().assemble(&[], &[]);
    assert!(result.is_err());
}

#[test]
fn unit_and_size_counts_must_match() {
    let units = vec![text_unit(&[11])];
    let result = Collator::new().assemble(&units, &[(32, 32), (32, 32)]);
    assert!(result.is_err());
}

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use omnigen_pipeline::{KvEntry, PromptKvCache};

fn projection(tokens: usize) -> Tensor {
    Tensor::zeros((1, 2, tokens, 8), DType::F32, &Device::Cpu).expect("projection tensor")
}

#[test]
fn entries_must_be_rank_four_and_shape_matched() -> Result<()> {
    let flat = Tensor::zeros((4, 8), DType::F32, &Device::Cpu)?;
    assert!(KvEntry::new(flat.clone(), flat).is_err());

    let key = projection(6);
    let value = projection(7);
    assert!(KvEntry::new(key, value).is_err());

    let entry = KvEntry::new(projection(6), projection(6))?;
    assert_eq!(entry.prompt_len(), 6);
    Ok(())
}

#[test]
fn layers_record_in_order_exactly_once() -> Result<()> {
    let mut cache = PromptKvCache::new();
    assert!(cache.is_empty());
    cache.record(0, KvEntry::new(projection(5), projection(5))?)?;
    cache.record(1, KvEntry::new(projection(5), projection(5))?)?;
    assert_eq!(cache.num_layers(), 2);
    assert_eq!(cache.prompt_len(), 5);

    // Overwriting layer 0 and skipping ahead are both rejected.
    assert!(cache
        .record(0, KvEntry::new(projection(5), projection(5))?)
        .is_err());
    assert!(cache
        .record(3, KvEntry::new(projection(5), projection(5))?)
        .is_err());
    Ok(())
}

#[test]
fn layers_must_cache_the_same_prompt_length() -> Result<()> {
    let mut cache = PromptKvCache::new();
    cache.record(0, KvEntry::new(projection(5), projection(5))?)?;
    assert!(cache
        .record(1, KvEntry::new(projection(9), projection(9))?)
        .is_err());
    Ok(())
}

#[test]
fn relocation_keeps_every_layer() -> Result<()> {
    let mut cache = PromptKvCache::new();
    cache.record(0, KvEntry::new(projection(5), projection(5))?)?;
    cache.record(1, KvEntry::new(projection(5), projection(5))?)?;

    cache.offload_to_host()?;
    assert_eq!(cache.num_layers(), 2);
    cache.restage(&Device::Cpu)?;
    assert_eq!(cache.num_layers(), 2);
    assert!(cache.layer(0).expect("layer 0 present").key().device().is_cpu());

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.prompt_len(), 0);
    Ok(())
}

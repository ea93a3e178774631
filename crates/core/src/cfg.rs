use anyhow::{ensure, Result};

use crate::collate::{BatchTensors, Collator};
use crate::prompt::MultimodalPrompt;

/// Number of conditioning branches concatenated into one forward batch.
///
/// Branch order is fixed: `[positive..., negative..., image_cfg...]`. The
/// same order must be used when chunking model output back into branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchLayout {
    /// Positive and negative branches only.
    Two,
    /// Positive, negative, and image-conditioned branches.
    Three,
}

impl BranchLayout {
    pub fn branch_count(self) -> usize {
        match self {
            BranchLayout::Two => 2,
            BranchLayout::Three => 3,
        }
    }

    pub fn has_image_branch(self) -> bool {
        matches!(self, BranchLayout::Three)
    }
}

/// The conditioning variants sharing one batch position.
#[derive(Debug, Clone)]
pub struct CfgBranches {
    pub positive: MultimodalPrompt,
    pub negative: MultimodalPrompt,
    pub image_cfg: Option<MultimodalPrompt>,
}

/// Determines the branch layout of a batch, requiring it to be uniform: the
/// image-cfg branch is present for every prompt or for none.
pub fn layout_of(branch_sets: &[CfgBranches]) -> Result<BranchLayout> {
    ensure!(!branch_sets.is_empty(), "no conditioning branches to compose");
    let with_image = branch_sets
        .iter()
        .filter(|set| set.image_cfg.is_some())
        .count();
    ensure!(
        with_image == 0 || with_image == branch_sets.len(),
        "image-cfg branch present for {with_image} of {} prompts; must be all or none",
        branch_sets.len()
    );
    Ok(if with_image > 0 {
        BranchLayout::Three
    } else {
        BranchLayout::Two
    })
}

/// Concatenates all branches branch-major and collates them as one batch.
///
/// Every branch shares the padded length and mask tensor; branches stay
/// independent only because each occupies its own batch row.
pub fn compose_combined(
    collator: &Collator,
    branch_sets: Vec<CfgBranches>,
    target_sizes: &[(usize, usize)],
) -> Result<(BatchTensors, BranchLayout)> {
    let layout = layout_of(&branch_sets)?;
    ensure!(
        branch_sets.len() == target_sizes.len(),
        "{} branch sets but {} target sizes",
        branch_sets.len(),
        target_sizes.len()
    );

    let count = branch_sets.len();
    let mut units = Vec::with_capacity(count * layout.branch_count());
    let mut positives = Vec::with_capacity(count);
    let mut negatives = Vec::with_capacity(count);
    let mut image_cfgs = Vec::new();
    for set in branch_sets {
        positives.push(set.positive);
        negatives.push(set.negative);
        if let Some(image_cfg) = set.image_cfg {
            image_cfgs.push(image_cfg);
        }
    }
    units.extend(positives);
    units.extend(negatives);
    units.extend(image_cfgs);

    let sizes: Vec<(usize, usize)> = target_sizes
        .iter()
        .cycle()
        .take(count * layout.branch_count())
        .copied()
        .collect();

    let tensors = collator.assemble(&units, &sizes)?;
    Ok((tensors, layout))
}

/// Collates each branch independently; one [`BatchTensors`] per branch in
/// layout order. Costs one pad/mask pass per branch but lets the caller feed
/// branches to the model one at a time.
pub fn compose_separate(
    collator: &Collator,
    branch_sets: Vec<CfgBranches>,
    target_sizes: &[(usize, usize)],
) -> Result<(Vec<BatchTensors>, BranchLayout)> {
    let layout = layout_of(&branch_sets)?;
    ensure!(
        branch_sets.len() == target_sizes.len(),
        "{} branch sets but {} target sizes",
        branch_sets.len(),
        target_sizes.len()
    );

    let mut positives = Vec::with_capacity(branch_sets.len());
    let mut negatives = Vec::with_capacity(branch_sets.len());
    let mut image_cfgs = Vec::new();
    for set in branch_sets {
        positives.push(set.positive);
        negatives.push(set.negative);
        if let Some(image_cfg) = set.image_cfg {
            image_cfgs.push(image_cfg);
        }
    }

    let mut batches = Vec::with_capacity(layout.branch_count());
    batches.push(collator.assemble(&positives, target_sizes)?);
    batches.push(collator.assemble(&negatives, target_sizes)?);
    if layout.has_image_branch() {
        batches.push(collator.assemble(&image_cfgs, target_sizes)?);
    }
    Ok((batches, layout))
}

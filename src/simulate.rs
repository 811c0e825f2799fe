//! Simulated populations and marker shuffling.
//!
//! All randomness comes from the generator passed in; nothing here touches
//! global state, so a seeded [`rand_chacha::ChaCha8Rng`] reproduces a run.

use ndarray::{Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PergolaError;
use crate::genotype::RawGenotypes;
use crate::numeric::haldane_inverse;

/// Layout of a simulated mapping population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationParams {
    pub ploidy: u8,
    pub n_chromosomes: usize,
    pub markers_per_chromosome: usize,
    pub n_samples: usize,
    /// Map distance between neighboring markers, in Morgans.
    pub marker_spacing: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            ploidy: 4,
            n_chromosomes: 7,
            markers_per_chromosome: 20,
            n_samples: 200,
            marker_spacing: 0.02,
        }
    }
}

/// A simulated raw genotype table and the true chromosome of each marker.
#[derive(Debug, Clone)]
pub struct SimulatedPopulation {
    pub genotypes: RawGenotypes,
    /// 1-based chromosome of each marker row.
    pub chromosomes: Vec<usize>,
}

/// Draw a population in which every sample carries `ploidy` chromatids,
/// each an independent recombinant of a heterozygous parent's two
/// haplotypes (alleles `1` and `0`). Crossovers follow Haldane's model,
/// with no interference.
///
/// Markers are laid out chromosome by chromosome in map order and named
/// `c{chromosome}_m{index}`; columns are named `s{sample}_{chromatid}`.
pub fn simulate_population<R: Rng + ?Sized>(
    params: &SimulationParams,
    rng: &mut R,
) -> Result<SimulatedPopulation, PergolaError> {
    if params.ploidy == 0 {
        return Err(PergolaError::InvalidInput("ploidy must be positive".into()));
    }
    if !(params.marker_spacing >= 0.0 && params.marker_spacing.is_finite()) {
        return Err(PergolaError::InvalidInput(format!(
            "marker spacing must be a non-negative distance, got {}",
            params.marker_spacing
        )));
    }
    let ploidy = params.ploidy as usize;
    let n_markers = params.n_chromosomes * params.markers_per_chromosome;
    let n_cols = params.n_samples * ploidy;
    let switch_prob = haldane_inverse(params.marker_spacing);

    let mut values = Array2::<f64>::zeros((n_markers, n_cols));
    for col in 0..n_cols {
        for chrom in 0..params.n_chromosomes {
            let first = chrom * params.markers_per_chromosome;
            let mut allele = rng.gen_bool(0.5);
            for k in 0..params.markers_per_chromosome {
                if k > 0 && rng.gen_bool(switch_prob) {
                    allele = !allele;
                }
                values[[first + k, col]] = if allele { 1.0 } else { 0.0 };
            }
        }
    }

    let mut marker_ids = Vec::with_capacity(n_markers);
    let mut chromosomes = Vec::with_capacity(n_markers);
    for chrom in 1..=params.n_chromosomes {
        for k in 1..=params.markers_per_chromosome {
            marker_ids.push(format!("c{}_m{}", chrom, k));
            chromosomes.push(chrom);
        }
    }
    let column_names = (1..=params.n_samples)
        .flat_map(|s| (1..=ploidy).map(move |h| format!("s{}_{}", s, h)))
        .collect();

    debug!(
        markers = n_markers,
        samples = params.n_samples,
        ploidy = params.ploidy,
        "simulated population"
    );
    Ok(SimulatedPopulation {
        genotypes: RawGenotypes::new(marker_ids, column_names, values)?,
        chromosomes,
    })
}

/// Randomly permute the marker rows of `raw`.
///
/// Returns the shuffled table and the permutation, where row `k` of the
/// output is row `permutation[k]` of the input.
pub fn shuffle_markers<R: Rng + ?Sized>(
    raw: &RawGenotypes,
    rng: &mut R,
) -> (RawGenotypes, Vec<usize>) {
    let mut permutation: Vec<usize> = (0..raw.marker_ids.len()).collect();
    permutation.shuffle(rng);
    let shuffled = RawGenotypes {
        marker_ids: permutation
            .iter()
            .map(|&i| raw.marker_ids[i].clone())
            .collect(),
        column_names: raw.column_names.clone(),
        values: raw.values.select(Axis(0), &permutation),
    };
    (shuffled, permutation)
}

//! The full analysis: raw genotypes to ordered linkage groups and a map.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PergolaError;
use crate::genotype::{encode, GenotypeMatrix, RawGenotypes};
use crate::group::{group_markers, GroupAssignment, GroupingOptions};
use crate::map::{GeneticMap, MappingFunction};
use crate::order::{order_groups, GroupOrder, OrderOptions};
use crate::recomb::{estimate_rf, RecombinationOptions, RfMatrix};

/// Every setting of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PergolaConfig {
    pub ploidy: u8,
    /// Leading columns skipped before the sample columns, e.g. parents.
    pub ignore_columns: usize,
    pub recombination: RecombinationOptions,
    pub grouping: GroupingOptions,
    pub ordering: OrderOptions,
    pub mapping: MappingFunction,
}

impl Default for PergolaConfig {
    fn default() -> Self {
        Self {
            ploidy: 2,
            ignore_columns: 0,
            recombination: RecombinationOptions::default(),
            grouping: GroupingOptions::default(),
            ordering: OrderOptions::default(),
            mapping: MappingFunction::default(),
        }
    }
}

pub struct PergolaResult {
    pub genotypes: GenotypeMatrix,
    pub rf: RfMatrix,
    pub groups: GroupAssignment,
    pub orders: Vec<GroupOrder>,
    pub map: GeneticMap,
}

/// Encode, estimate RFs, group, order, and map.
pub fn run(raw: &RawGenotypes, config: &PergolaConfig) -> Result<PergolaResult, PergolaError> {
    let genotypes = encode(raw, config.ploidy, config.ignore_columns)?;
    let rf = estimate_rf(&genotypes, &config.recombination)?;
    let groups = group_markers(&rf, &config.grouping)?;
    let orders = order_groups(&rf, &groups, &config.ordering)?;
    let map = GeneticMap::build(&rf, &orders, &config.mapping)?;
    info!(
        markers = rf.len(),
        groups = orders.len(),
        "finished linkage analysis"
    );
    Ok(PergolaResult {
        genotypes,
        rf,
        groups,
        orders,
        map,
    })
}

//! Deterministic construction of linkage maps for polyploid organisms.
//!
//! Raw genotypes with `ploidy` allele columns per sample are encoded into
//! dosages ([`genotype::encode`]), turned into a matrix of pairwise
//! recombination frequencies by a minimum-recombination count
//! ([`recomb::estimate_rf`]), clustered into linkage groups
//! ([`group::group_markers`]), and ordered within each group by minimizing
//! the sum of adjacent recombination frequencies, SARF
//! ([`order::order_groups`]). A [`map::GeneticMap`] lays the ordered markers
//! out in centiMorgans.
//!
//! ```no_run
//! use pergola::prelude::*;
//! let raw = RawGenotypes::from_tsv("genotypes.tsv.gz")
//!               .expect("could not read genotypes");
//! let config = PergolaConfig {
//!     ploidy: 4,
//!     ignore_columns: 8,
//!     grouping: GroupingOptions { cut: Cut::Groups(7), ..Default::default() },
//!     ..Default::default()
//! };
//! let result = pergola::pipeline::run(&raw, &config).expect("analysis failed");
//!
//! for (name, linkage_map) in result.map.iter() {
//!     println!("{}\t{}", name, linkage_map.total_length());
//! }
//! ```
//!
//! SARF is also available on its own, e.g. to compare candidate orders:
//!
//! ```
//! use pergola::order::sarf;
//! let rf = ndarray::array![[0.0, 0.1, 0.3], [0.1, 0.0, 0.1], [0.3, 0.1, 0.0]];
//! assert!(sarf(rf.view(), &[0, 1, 2], 1).unwrap() < sarf(rf.view(), &[1, 0, 2], 1).unwrap());
//! ```

pub mod cluster;
pub mod error;
pub mod file;
pub mod genotype;
pub mod group;
pub mod map;
mod numeric;
pub mod order;
pub mod pipeline;
pub mod recomb;
pub mod simulate;

pub use error::PergolaError;
pub use order::sarf;

pub mod prelude {
    pub use crate::cluster::{ClusterTree, Linkage};
    pub use crate::error::PergolaError;
    pub use crate::genotype::{encode, GenotypeMatrix, RawGenotypes};
    pub use crate::group::{group_markers, Cut, FilterOptions, GroupAssignment, GroupingOptions};
    pub use crate::map::{GeneticMap, MapFunction, MappingFunction};
    pub use crate::order::{order_groups, order_markers, sarf, GroupOrder, OrderOptions};
    pub use crate::pipeline::PergolaConfig;
    pub use crate::recomb::{estimate_rf, RecombinationOptions, RfMatrix};
}

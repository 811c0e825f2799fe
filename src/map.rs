//! Genetic maps built from ordered linkage groups.
//!
//! Adjacent recombination frequencies along an order are converted to map
//! distances by a [`MapFunction`] and accumulated into positions in
//! centiMorgans.

use genomap::GenomeMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

use crate::error::PergolaError;
use crate::file::writer_or_stdout;
use crate::numeric::{cumulative_sum, haldane, kosambi};
use crate::order::GroupOrder;
use crate::recomb::{format_float, RfMatrix};

/// RFs are clamped to this before transforming, since 0.5 maps to infinity.
pub const MAX_MAPPABLE_RF: f64 = 0.499;

/// Converts a recombination fraction to a map distance in Morgans.
pub trait MapFunction {
    fn distance(&self, rf: f64) -> f64;
}

/// The standard mapping functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingFunction {
    /// Distance equals the recombination fraction.
    Morgan,
    /// No crossover interference.
    #[default]
    Haldane,
    /// Kosambi's interference model.
    Kosambi,
}

impl MapFunction for MappingFunction {
    fn distance(&self, rf: f64) -> f64 {
        let rf = rf.clamp(0.0, MAX_MAPPABLE_RF);
        match self {
            MappingFunction::Morgan => rf,
            MappingFunction::Haldane => haldane(rf),
            MappingFunction::Kosambi => kosambi(rf),
        }
    }
}

impl std::str::FromStr for MappingFunction {
    type Err = PergolaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "morgan" | "none" => Ok(MappingFunction::Morgan),
            "haldane" => Ok(MappingFunction::Haldane),
            "kosambi" => Ok(MappingFunction::Kosambi),
            _ => Err(PergolaError::InvalidInput(format!(
                "unknown mapping function '{}'",
                s
            ))),
        }
    }
}

/// Marker positions of a single linkage group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkageMap {
    pub marker_ids: Vec<String>,
    /// Cumulative positions in centiMorgans, starting at zero.
    pub positions: Vec<f64>,
}

impl LinkageMap {
    /// Lay out the markers of `order` using the RF between neighbors.
    pub fn from_order<F: MapFunction + ?Sized>(
        rf: &RfMatrix,
        order: &GroupOrder,
        mapping: &F,
    ) -> LinkageMap {
        let distances: Vec<f64> = order
            .adjacent_rf(rf)
            .into_iter()
            .map(|r| 100.0 * mapping.distance(r))
            .collect();
        let mut positions = cumulative_sum(&distances);
        positions.truncate(order.len());
        LinkageMap {
            marker_ids: order.marker_ids.clone(),
            positions,
        }
    }

    /// The total map length, in centiMorgans.
    pub fn total_length(&self) -> f64 {
        self.positions.last().copied().unwrap_or(0.0)
    }
}

/// Linkage maps keyed by group name (`LG1`, `LG2`, ...).
pub struct GeneticMap {
    pub map: GenomeMap<LinkageMap>,
}

impl GeneticMap {
    pub fn build<F: MapFunction + ?Sized>(
        rf: &RfMatrix,
        orders: &[GroupOrder],
        mapping: &F,
    ) -> Result<GeneticMap, PergolaError> {
        let mut map = GenomeMap::new();
        for order in orders {
            let linkage_map = LinkageMap::from_order(rf, order, mapping);
            debug!(
                group = order.group,
                length_cm = linkage_map.total_length(),
                "built linkage map"
            );
            map.insert(&group_name(order.group), linkage_map)?;
        }
        Ok(GeneticMap { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<&LinkageMap> {
        self.map.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LinkageMap)> {
        self.map.iter()
    }

    /// Write `group`, `marker`, `position` rows (positions in cM).
    pub fn write_tsv(&self, filepath: Option<&str>) -> Result<(), PergolaError> {
        let mut writer = writer_or_stdout(filepath, None)?;
        writeln!(writer, "group\tmarker\tposition")?;
        for (name, linkage_map) in self.iter() {
            for (marker, position) in linkage_map.marker_ids.iter().zip(&linkage_map.positions) {
                writeln!(writer, "{}\t{}\t{}", name, marker, format_float(*position))?;
            }
        }
        writer.finish()?;
        Ok(())
    }
}

pub fn group_name(group: usize) -> String {
    format!("LG{}", group)
}

//! Linkage groups: cutting the clustering tree and filtering stray markers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info};

use crate::cluster::{ClusterTree, Linkage};
use crate::error::PergolaError;
use crate::file::{writer_or_stdout, InputFile};
use crate::recomb::RfMatrix;

/// Integer label of a linkage group.
pub type GroupId = usize;

/// Group label of markers that were filtered out.
pub const UNASSIGNED: GroupId = 0;

/// Where to cut the clustering tree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cut {
    /// Exactly this many groups.
    Groups(usize),
    /// Keep merges at or below this height.
    Height(f64),
}

/// Rules for moving markers into group [`UNASSIGNED`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    /// Groups with fewer members than this are dissolved.
    pub min_group_size: usize,
    /// A marker whose RF to every other member of its group exceeds this is
    /// removed from the group. Singleton groups are left to `min_group_size`.
    pub isolation_threshold: Option<f64>,
    /// A marker whose RF to an earlier kept member of its group is at or below
    /// this is a near-duplicate and is removed; one marker of each cluster of
    /// duplicates stays.
    #[serde(default)]
    pub duplicate_threshold: Option<f64>,
}

impl Default for FilterOptions {
    fn default() -> Self {
        Self {
            min_group_size: 5,
            isolation_threshold: None,
            duplicate_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupingOptions {
    pub linkage: Linkage,
    pub cut: Cut,
    pub filter: Option<FilterOptions>,
}

impl Default for GroupingOptions {
    fn default() -> Self {
        Self {
            linkage: Linkage::default(),
            cut: Cut::Groups(1),
            filter: None,
        }
    }
}

/// Marker id to linkage group, in RF matrix order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupAssignment {
    pub groups: IndexMap<String, GroupId>,
}

impl GroupAssignment {
    pub fn from_labels(marker_ids: &[String], labels: &[GroupId]) -> Result<Self, PergolaError> {
        if marker_ids.len() != labels.len() {
            return Err(PergolaError::InvalidInput(format!(
                "{} group labels for {} markers",
                labels.len(),
                marker_ids.len()
            )));
        }
        let groups: IndexMap<String, GroupId> = marker_ids
            .iter()
            .cloned()
            .zip(labels.iter().copied())
            .collect();
        if groups.len() != marker_ids.len() {
            return Err(PergolaError::InvalidInput(
                "marker ids are not unique".into(),
            ));
        }
        Ok(Self { groups })
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn get(&self, marker: &str) -> Option<GroupId> {
        self.groups.get(marker).copied()
    }

    /// Labels in marker order.
    pub fn labels(&self) -> Vec<GroupId> {
        self.groups.values().copied().collect()
    }

    /// The distinct assigned groups, ascending, excluding [`UNASSIGNED`].
    pub fn group_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self
            .groups
            .values()
            .copied()
            .filter(|&g| g != UNASSIGNED)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Marker indices belonging to `group`, ascending.
    pub fn members(&self, group: GroupId) -> Vec<usize> {
        self.groups
            .values()
            .enumerate()
            .filter(|(_, &g)| g == group)
            .map(|(i, _)| i)
            .collect()
    }

    /// Check that this assignment labels exactly the markers of `rf`, in order.
    pub fn check_matches(&self, rf: &RfMatrix) -> Result<(), PergolaError> {
        if self.len() != rf.len() || !self.groups.keys().eq(rf.marker_ids.iter()) {
            return Err(PergolaError::InvalidInput(
                "group assignment does not match the RF matrix markers".into(),
            ));
        }
        Ok(())
    }

    /// Read a two-column `marker`, `group` TSV written by [`GroupAssignment::write_tsv`].
    pub fn from_tsv(filepath: &str) -> Result<Self, PergolaError> {
        let mut rdr = InputFile::new(filepath).tsv_reader(true)?;
        let mut marker_ids = Vec::new();
        let mut labels = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let marker = record.get(0).ok_or(PergolaError::MissingField)?;
            let group_str = record.get(1).ok_or(PergolaError::MissingField)?;
            let group: GroupId = group_str.trim().parse().map_err(|_| {
                PergolaError::ParseError(format!(
                    "Failed to parse group from string: {}",
                    group_str
                ))
            })?;
            marker_ids.push(marker.to_string());
            labels.push(group);
        }
        GroupAssignment::from_labels(&marker_ids, &labels)
    }

    pub fn write_tsv(&self, filepath: Option<&str>) -> Result<(), PergolaError> {
        let mut writer = writer_or_stdout(filepath, None)?;
        writeln!(writer, "marker\tgroup")?;
        for (marker, group) in &self.groups {
            writeln!(writer, "{}\t{}", marker, group)?;
        }
        writer.finish()?;
        Ok(())
    }
}

/// Cluster the markers of `rf` and cut the tree into linkage groups.
pub fn group_markers(
    rf: &RfMatrix,
    options: &GroupingOptions,
) -> Result<GroupAssignment, PergolaError> {
    let tree = ClusterTree::build(rf, options.linkage)?;
    let mut labels = match options.cut {
        Cut::Groups(k) => tree.cut(k)?,
        Cut::Height(h) => tree.cut_height(h),
    };
    if let Some(filter) = &options.filter {
        filter_groups(rf, &mut labels, filter);
    }
    let assignment = GroupAssignment::from_labels(&rf.marker_ids, &labels)?;
    info!(
        markers = rf.len(),
        groups = assignment.group_ids().len(),
        unassigned = assignment.members(UNASSIGNED).len(),
        "grouped markers"
    );
    Ok(assignment)
}

/// Move isolated markers, near-duplicates, and members of small groups to
/// [`UNASSIGNED`], then renumber the remaining groups `1..` by first appearance.
pub fn filter_groups(rf: &RfMatrix, labels: &mut [GroupId], filter: &FilterOptions) {
    let n_groups = labels.iter().copied().max().unwrap_or(UNASSIGNED);
    let members_of = |labels: &[GroupId], g: GroupId| -> Vec<usize> {
        (0..labels.len()).filter(|&i| labels[i] == g).collect()
    };

    if let Some(threshold) = filter.isolation_threshold {
        for g in 1..=n_groups {
            let members = members_of(labels, g);
            if members.len() < 2 {
                continue;
            }
            let isolated: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| {
                    members
                        .iter()
                        .filter(|&&j| j != i)
                        .all(|&j| rf.get(i, j) > threshold)
                })
                .collect();
            for i in isolated {
                debug!(marker = %rf.marker_ids[i], group = g, "removed isolated marker");
                labels[i] = UNASSIGNED;
            }
        }
    }

    if let Some(threshold) = filter.duplicate_threshold {
        for g in 1..=n_groups {
            let mut kept: Vec<usize> = Vec::new();
            for i in members_of(labels, g) {
                if let Some(&j) = kept.iter().find(|&&j| rf.get(i, j) <= threshold) {
                    debug!(
                        marker = %rf.marker_ids[i],
                        duplicate_of = %rf.marker_ids[j],
                        group = g,
                        "removed near-duplicate marker"
                    );
                    labels[i] = UNASSIGNED;
                } else {
                    kept.push(i);
                }
            }
        }
    }

    for g in 1..=n_groups {
        let members = members_of(labels, g);
        if !members.is_empty() && members.len() < filter.min_group_size {
            debug!(group = g, size = members.len(), "dissolved small group");
            for i in members {
                labels[i] = UNASSIGNED;
            }
        }
    }

    let mut renumber = vec![UNASSIGNED; n_groups + 1];
    let mut next = UNASSIGNED;
    for label in labels.iter_mut().filter(|l| **l != UNASSIGNED) {
        if renumber[*label] == UNASSIGNED {
            next += 1;
            renumber[*label] = next;
        }
        *label = renumber[*label];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn rf() -> RfMatrix {
        let ids = (0..6).map(|i| format!("m{}", i)).collect();
        RfMatrix::new(
            ids,
            array![
                [0.00, 0.05, 0.06, 0.40, 0.45, 0.48],
                [0.05, 0.00, 0.30, 0.42, 0.44, 0.47],
                [0.06, 0.30, 0.00, 0.41, 0.43, 0.46],
                [0.40, 0.42, 0.41, 0.00, 0.02, 0.49],
                [0.45, 0.44, 0.43, 0.02, 0.00, 0.47],
                [0.48, 0.47, 0.46, 0.49, 0.47, 0.00],
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_group_markers() {
        let options = GroupingOptions {
            cut: Cut::Groups(3),
            ..Default::default()
        };
        let groups = group_markers(&rf(), &options).unwrap();
        assert_eq!(groups.labels(), vec![1, 1, 1, 2, 2, 3]);
        assert_eq!(groups.group_ids(), vec![1, 2, 3]);
        assert_eq!(groups.members(2), vec![3, 4]);
        assert_eq!(groups.get("m5"), Some(3));
        assert!(groups.check_matches(&rf()).is_ok());
    }

    #[test]
    fn test_min_group_size_filter() {
        let options = GroupingOptions {
            cut: Cut::Groups(3),
            filter: Some(FilterOptions {
                min_group_size: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let groups = group_markers(&rf(), &options).unwrap();
        assert_eq!(groups.labels(), vec![1, 1, 1, 2, 2, 0]);
        assert_eq!(groups.members(UNASSIGNED), vec![5]);
        assert_eq!(groups.group_ids(), vec![1, 2]);
    }

    #[test]
    fn test_isolation_filter_renumbers() {
        // m5 is far from everything in its group; labels deliberately out of order
        let mut labels = vec![3, 3, 3, 1, 1, 1];
        let filter = FilterOptions {
            min_group_size: 2,
            isolation_threshold: Some(0.35),
            duplicate_threshold: None,
        };
        filter_groups(&rf(), &mut labels, &filter);
        assert_eq!(labels, vec![1, 1, 1, 2, 2, 0]);

        let mut labels = vec![1, 2, 2, 1, 3, 3];
        filter_groups(&rf(), &mut labels, &filter);
        // groups 1 and 3 lose both members, group 2 becomes group 1
        assert_eq!(labels, vec![0, 1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_duplicate_filter() {
        // m0 and m1 are identical, m3 repeats m2 at RF 0.01
        let rf = RfMatrix::new(
            (0..5).map(|i| format!("m{}", i)).collect(),
            array![
                [0.00, 0.00, 0.10, 0.11, 0.20],
                [0.00, 0.00, 0.10, 0.11, 0.20],
                [0.10, 0.10, 0.00, 0.01, 0.10],
                [0.11, 0.11, 0.01, 0.00, 0.09],
                [0.20, 0.20, 0.10, 0.09, 0.00],
            ],
        )
        .unwrap();
        let filter = FilterOptions {
            min_group_size: 1,
            isolation_threshold: None,
            duplicate_threshold: Some(0.0),
        };
        let mut labels = vec![1; 5];
        filter_groups(&rf, &mut labels, &filter);
        assert_eq!(labels, vec![1, 0, 1, 1, 1]);

        let filter = FilterOptions {
            duplicate_threshold: Some(0.01),
            ..filter
        };
        let mut labels = vec![1; 5];
        filter_groups(&rf, &mut labels, &filter);
        assert_eq!(labels, vec![1, 0, 1, 0, 1]);

        // the survivor of a dissolved group does not keep its number
        let filter = FilterOptions {
            min_group_size: 2,
            ..filter
        };
        let mut labels = vec![1, 1, 2, 2, 2];
        filter_groups(&rf, &mut labels, &filter);
        assert_eq!(labels, vec![0, 0, 1, 0, 1]);
    }

    #[test]
    fn test_from_labels_mismatch() {
        let ids = vec!["a".to_string(), "b".to_string()];
        assert!(GroupAssignment::from_labels(&ids, &[1]).is_err());
        let dup = vec!["a".to_string(), "a".to_string()];
        assert!(GroupAssignment::from_labels(&dup, &[1, 1]).is_err());
    }

    #[test]
    fn test_tsv_roundtrip() {
        let options = GroupingOptions {
            cut: Cut::Height(0.2),
            ..Default::default()
        };
        let groups = group_markers(&rf(), &options).unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("groups.tsv");
        let path = path.to_str().unwrap();
        groups.write_tsv(Some(path)).unwrap();
        assert_eq!(GroupAssignment::from_tsv(path).unwrap(), groups);
    }
}

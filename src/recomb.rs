//! Pairwise recombination frequencies from dosage data.
//!
//! The estimate is a minimum-recombination count, not a likelihood: for each
//! sample, the change in dosage between two markers is explained by the
//! fewest allele-transmission events that could produce it, which is the
//! absolute dosage difference. Summing over samples and dividing by the
//! number of observed allele comparisons (samples × ploidy) gives a frequency.
//!
//! For fully informative data (e.g. doubled haploids coded `0`/`ploidy`)
//! unlinked markers sit at 0.5, which is also the default cap.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::{debug, info, warn};

use crate::error::PergolaError;
use crate::file::{writer_or_stdout, InputFile};
use crate::genotype::{Dosage, GenotypeMatrix, MISSING};
use crate::numeric::is_symmetric_dissimilarity;

/// The value used for unlinked or uninformative marker pairs.
pub const DEFAULT_CAP: f64 = 0.5;

/// Tolerance when checking supplied matrices for symmetry.
const SYMMETRY_EPS: f64 = 1e-9;

/// Configuration of the recombination frequency estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecombinationOptions {
    /// Upper bound of every estimate, and the value given to pairs with no
    /// jointly observed samples.
    pub cap: f64,
    /// Fail with [`PergolaError::UndefinedFrequency`] rather than substituting
    /// `cap` for pairs with no jointly observed samples.
    pub strict: bool,
}

impl Default for RecombinationOptions {
    fn default() -> Self {
        Self {
            cap: DEFAULT_CAP,
            strict: false,
        }
    }
}

/// A labeled, square, symmetric matrix of recombination frequencies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RfMatrix {
    pub marker_ids: Vec<String>,
    pub values: Array2<f64>,
    /// The cap the matrix was estimated with, when known.
    #[serde(default)]
    pub cap: Option<f64>,
}

impl RfMatrix {
    /// Wrap `values`, checking it is square, symmetric, zero on the diagonal,
    /// within `[0, 1]`, and labeled once per row.
    pub fn new(marker_ids: Vec<String>, values: Array2<f64>) -> Result<Self, PergolaError> {
        let (nrows, ncols) = values.dim();
        if nrows != ncols {
            return Err(PergolaError::InvalidInput(format!(
                "RF matrix must be square, got {}x{}",
                nrows, ncols
            )));
        }
        if marker_ids.len() != nrows {
            return Err(PergolaError::InvalidInput(format!(
                "{} marker ids for a {}x{} RF matrix",
                marker_ids.len(),
                nrows,
                ncols
            )));
        }
        if let Some(bad) = values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
            return Err(PergolaError::InvalidInput(format!(
                "RF matrix values must lie in [0, 1], found {}",
                bad
            )));
        }
        if !is_symmetric_dissimilarity(values.view(), SYMMETRY_EPS) {
            return Err(PergolaError::InvalidInput(
                "RF matrix must be symmetric with a zero diagonal".into(),
            ));
        }
        Ok(Self {
            marker_ids,
            values,
            cap: None,
        })
    }

    /// Record the cap the values were estimated with, checking none exceeds it.
    pub fn with_cap(mut self, cap: f64) -> Result<Self, PergolaError> {
        if !(cap > 0.0 && cap <= 1.0) {
            return Err(PergolaError::InvalidInput(format!(
                "RF cap must be in (0, 1], got {}",
                cap
            )));
        }
        if let Some(bad) = self.values.iter().find(|&&v| v > cap + SYMMETRY_EPS) {
            return Err(PergolaError::InvalidInput(format!(
                "RF value {} exceeds the cap {}",
                bad, cap
            )));
        }
        self.cap = Some(cap);
        Ok(self)
    }

    /// Number of markers.
    pub fn len(&self) -> usize {
        self.marker_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[[i, j]]
    }

    /// Index of the marker named `name`, if present.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.marker_ids.iter().position(|m| m == name)
    }

    /// The submatrix of the markers at `indices`, in that order.
    ///
    /// Used both to restrict to a linkage group and to view the matrix
    /// in a chosen marker order.
    pub fn submatrix(&self, indices: &[usize]) -> Result<RfMatrix, PergolaError> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(PergolaError::InvalidInput(format!(
                "marker index {} out of range for {} markers",
                bad,
                self.len()
            )));
        }
        let values = self
            .values
            .select(Axis(0), indices)
            .select(Axis(1), indices);
        Ok(RfMatrix {
            marker_ids: indices.iter().map(|&i| self.marker_ids[i].clone()).collect(),
            values,
            cap: self.cap,
        })
    }

    /// Read a square RF matrix written by [`RfMatrix::write_tsv`].
    ///
    /// The `#markers=` and `#cap=` header lines, when present, are checked
    /// against the table.
    pub fn from_tsv(filepath: &str) -> Result<RfMatrix, PergolaError> {
        let input_file = InputFile::new(filepath);
        let header = parse_header(&input_file.comments()?)?;
        let mut rdr = input_file.tsv_reader(true)?;
        let column_header = rdr.headers()?.clone();
        let column_ids: Vec<String> = column_header.iter().skip(1).map(String::from).collect();

        let mut row_ids = Vec::new();
        let mut flat = Vec::with_capacity(column_ids.len() * column_ids.len());
        for result in rdr.records() {
            let record = result?;
            let marker = record.get(0).ok_or(PergolaError::MissingField)?;
            for field in record.iter().skip(1) {
                let value: f64 = field.trim().parse().map_err(|_| {
                    PergolaError::ParseError(format!(
                        "Failed to parse RF value '{}' in row '{}'",
                        field, marker
                    ))
                })?;
                flat.push(value);
            }
            row_ids.push(marker.to_string());
        }
        if row_ids != column_ids {
            return Err(PergolaError::InvalidInput(
                "RF matrix row and column labels differ".into(),
            ));
        }
        if let Some(n) = header.markers {
            if n != row_ids.len() {
                return Err(PergolaError::InvalidInput(format!(
                    "RF matrix header declares {} markers but {} rows were read",
                    n,
                    row_ids.len()
                )));
            }
        }
        let values = Array2::from_shape_vec((row_ids.len(), column_ids.len()), flat)
            .map_err(|e| PergolaError::InvalidInput(e.to_string()))?;
        let rf = RfMatrix::new(row_ids, values)?;
        match header.cap {
            Some(cap) => rf.with_cap(cap),
            None => Ok(rf),
        }
    }

    /// Write the matrix as a labeled TSV, to standard out if `filepath` is `None`.
    pub fn write_tsv(&self, filepath: Option<&str>) -> Result<(), PergolaError> {
        let mut header = vec![format!("markers={}", self.len())];
        if let Some(cap) = self.cap {
            header.push(format!("cap={}", format_float(cap)));
        }
        let mut writer = writer_or_stdout(filepath, Some(header))?;
        writeln!(writer, "marker\t{}", self.marker_ids.join("\t"))?;
        for (marker, row) in self.marker_ids.iter().zip(self.values.outer_iter()) {
            let fields: Vec<String> = row.iter().map(|v| format_float(*v)).collect();
            writeln!(writer, "{}\t{}", marker, fields.join("\t"))?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Provenance lines at the top of an RF matrix file.
#[derive(Default)]
struct MatrixHeader {
    markers: Option<usize>,
    cap: Option<f64>,
}

fn parse_header(comments: &[String]) -> Result<MatrixHeader, PergolaError> {
    let mut header = MatrixHeader::default();
    for comment in comments {
        let Some((key, value)) = comment.split_once('=') else {
            continue;
        };
        let bad = || PergolaError::ParseError(format!("bad RF matrix header line '#{}'", comment));
        match key.trim() {
            "markers" => header.markers = Some(value.trim().parse().map_err(|_| bad())?),
            "cap" => header.cap = Some(value.trim().parse().map_err(|_| bad())?),
            _ => {}
        }
    }
    Ok(header)
}

/// Format a float to eight decimal places, dropping trailing zeros.
pub fn format_float(x: f64) -> String {
    let formatted = format!("{:.8}", x);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Fewest allele-transmission events that change dosage `a` into `b`.
///
/// Each event moves one allele copy, so this is the absolute difference.
/// Ties among equally small explanations do not change the count.
#[inline]
pub fn min_recombinations(a: Dosage, b: Dosage) -> u32 {
    a.abs_diff(b) as u32
}

/// Sum of minimum recombination counts and number of jointly observed
/// samples for two markers.
fn pair_counts(x: ArrayView1<Dosage>, y: ArrayView1<Dosage>) -> (u64, u64) {
    Zip::from(&x).and(&y).fold((0, 0), |(events, observed), &a, &b| {
        if a == MISSING || b == MISSING {
            (events, observed)
        } else {
            (events + min_recombinations(a, b) as u64, observed + 1)
        }
    })
}

/// Estimate the recombination frequency matrix of all marker pairs.
///
/// Rows are computed in parallel. Each RF is clamped to `[0, cap]`; pairs
/// with no jointly observed sample get `cap` unless `options.strict` is set.
pub fn estimate_rf(
    geno: &GenotypeMatrix,
    options: &RecombinationOptions,
) -> Result<RfMatrix, PergolaError> {
    if !(options.cap > 0.0 && options.cap <= 1.0) {
        return Err(PergolaError::InvalidInput(format!(
            "RF cap must be in (0, 1], got {}",
            options.cap
        )));
    }
    let m = geno.n_markers();
    let scale = geno.ploidy as f64;

    // upper triangle, row by row
    let upper: Vec<Vec<(u64, u64)>> = (0..m)
        .into_par_iter()
        .map(|i| {
            let x = geno.marker(i);
            ((i + 1)..m)
                .map(|j| pair_counts(x, geno.marker(j)))
                .collect()
        })
        .collect();

    let mut values = Array2::<f64>::zeros((m, m));
    let mut undefined = 0usize;
    for (i, row) in upper.iter().enumerate() {
        for (offset, &(events, observed)) in row.iter().enumerate() {
            let j = i + 1 + offset;
            let rf = if observed == 0 {
                if options.strict {
                    return Err(PergolaError::UndefinedFrequency(
                        geno.marker_ids[i].clone(),
                        geno.marker_ids[j].clone(),
                    ));
                }
                undefined += 1;
                options.cap
            } else {
                (events as f64 / (observed as f64 * scale)).min(options.cap)
            };
            values[[i, j]] = rf;
            values[[j, i]] = rf;
        }
    }

    if undefined > 0 {
        warn!(
            "{} marker pairs share no observed samples; set to cap {}",
            undefined, options.cap
        );
    }
    info!(
        markers = m,
        samples = geno.n_samples(),
        ploidy = geno.ploidy,
        "estimated recombination frequency matrix"
    );
    debug!(undefined, cap = options.cap, "RF estimate summary");

    Ok(RfMatrix {
        marker_ids: geno.marker_ids.clone(),
        values,
        cap: Some(options.cap),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileError;
    use crate::numeric::assert_float_eq;
    use crate::simulate::{simulate_population, SimulationParams};
    use ndarray::array;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use tempfile::tempdir;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_min_recombinations() {
        assert_eq!(min_recombinations(0, 0), 0);
        assert_eq!(min_recombinations(4, 1), 3);
        assert_eq!(min_recombinations(1, 4), 3);
    }

    #[test]
    fn test_estimate_small() {
        // tetraploid, 3 samples
        let dosages = array![[0, 2, 4], [1, 2, 4], [4, MISSING, 0]];
        let geno = GenotypeMatrix::new(4, names("m", 3), names("s", 3), dosages).unwrap();
        let rf = estimate_rf(&geno, &RecombinationOptions::default()).unwrap();

        assert_float_eq(rf.get(0, 1), 1.0 / 12.0, 1e-12);
        // markers 0 and 2: samples 0 and 2 observed, 8 events over 8 comparisons
        // gives 1.0, clamped to the cap
        assert_float_eq(rf.get(0, 2), DEFAULT_CAP, 1e-12);
        assert_float_eq(rf.get(2, 0), DEFAULT_CAP, 1e-12);
        for i in 0..3 {
            assert_eq!(rf.get(i, i), 0.0);
        }
    }

    #[test]
    fn test_undefined_pair() {
        let dosages = array![[0, MISSING], [MISSING, 1]];
        let geno = GenotypeMatrix::new(2, names("m", 2), names("s", 2), dosages).unwrap();

        let options = RecombinationOptions {
            cap: 0.4,
            strict: false,
        };
        let rf = estimate_rf(&geno, &options).unwrap();
        assert_float_eq(rf.get(0, 1), 0.4, 1e-12);

        let strict = RecombinationOptions {
            strict: true,
            ..Default::default()
        };
        assert!(matches!(
            estimate_rf(&geno, &strict),
            Err(PergolaError::UndefinedFrequency(_, _))
        ));
    }

    #[test]
    fn test_bad_cap() {
        let geno = GenotypeMatrix::new(2, names("m", 1), names("s", 1), array![[0]]).unwrap();
        let options = RecombinationOptions {
            cap: 0.0,
            strict: false,
        };
        assert!(matches!(
            estimate_rf(&geno, &options),
            Err(PergolaError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_symmetric_zero_diagonal_and_bounded() {
        for &ploidy in &[1u8, 2, 4, 6] {
            let mut rng = ChaCha8Rng::seed_from_u64(ploidy as u64);
            let params = SimulationParams {
                ploidy,
                n_chromosomes: 2,
                markers_per_chromosome: 8,
                n_samples: 30,
                marker_spacing: 0.1,
            };
            let raw = simulate_population(&params, &mut rng).unwrap().genotypes;
            let geno = crate::genotype::encode(&raw, ploidy, 0).unwrap();
            let rf = estimate_rf(&geno, &RecombinationOptions::default()).unwrap();
            let m = rf.len();
            for i in 0..m {
                assert_eq!(rf.get(i, i), 0.0);
                for j in 0..m {
                    assert_eq!(rf.get(i, j), rf.get(j, i));
                    assert!(rf.get(i, j) >= 0.0 && rf.get(i, j) <= DEFAULT_CAP);
                }
            }
            // the checked constructor accepts the estimate
            assert!(RfMatrix::new(rf.marker_ids.clone(), rf.values.clone()).is_ok());
        }
    }

    #[test]
    fn test_rf_matrix_validation() {
        let ids = names("m", 2);
        assert!(RfMatrix::new(ids.clone(), array![[0.0, 0.1], [0.2, 0.0]]).is_err());
        assert!(RfMatrix::new(ids.clone(), array![[0.0, 0.1, 0.1], [0.1, 0.0, 0.1]]).is_err());
        assert!(RfMatrix::new(names("m", 3), array![[0.0, 0.1], [0.1, 0.0]]).is_err());
        assert!(RfMatrix::new(ids, array![[0.0, -0.1], [-0.1, 0.0]]).is_err());
    }

    #[test]
    fn test_rf_matrix_rejects_out_of_range() {
        let inf = f64::INFINITY;
        let unbounded = array![
            [0.0, inf, inf, inf],
            [inf, 0.0, inf, inf],
            [inf, inf, 0.0, inf],
            [inf, inf, inf, 0.0],
        ];
        assert!(matches!(
            RfMatrix::new(names("m", 4), unbounded),
            Err(PergolaError::InvalidInput(_))
        ));
        assert!(matches!(
            RfMatrix::new(names("m", 2), array![[0.0, 7.5], [7.5, 0.0]]),
            Err(PergolaError::InvalidInput(_))
        ));
        assert!(RfMatrix::new(names("m", 2), array![[0.0, 1.0], [1.0, 0.0]]).is_ok());
    }

    #[test]
    fn test_from_tsv_rejects_out_of_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rf.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "marker\ta\tb").unwrap();
        writeln!(f, "a\t0\tinf").unwrap();
        writeln!(f, "b\tinf\t0").unwrap();
        drop(f);
        assert!(matches!(
            RfMatrix::from_tsv(path.to_str().unwrap()),
            Err(PergolaError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_tsv_checks_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rf.tsv");
        let write = |lines: &[&str]| {
            let mut f = std::fs::File::create(&path).unwrap();
            for line in lines {
                writeln!(f, "{}", line).unwrap();
            }
        };
        let path_str = path.to_str().unwrap();

        write(&["#markers=3", "marker\ta\tb", "a\t0\t0.2", "b\t0.2\t0"]);
        assert!(matches!(
            RfMatrix::from_tsv(path_str),
            Err(PergolaError::InvalidInput(_))
        ));

        write(&["#cap=0.1", "marker\ta\tb", "a\t0\t0.2", "b\t0.2\t0"]);
        assert!(matches!(
            RfMatrix::from_tsv(path_str),
            Err(PergolaError::InvalidInput(_))
        ));

        write(&["#markers=2", "#cap=0.25", "marker\ta\tb", "a\t0\t0.2", "b\t0.2\t0"]);
        let rf = RfMatrix::from_tsv(path_str).unwrap();
        assert_eq!(rf.cap, Some(0.25));

        write(&[]);
        assert!(matches!(
            RfMatrix::from_tsv(path_str),
            Err(PergolaError::FileError(FileError::EmptyFile(_)))
        ));
    }

    #[test]
    fn test_submatrix() {
        let rf = RfMatrix::new(
            names("m", 3),
            array![[0.0, 0.1, 0.2], [0.1, 0.0, 0.3], [0.2, 0.3, 0.0]],
        )
        .unwrap();
        let sub = rf.submatrix(&[2, 0]).unwrap();
        assert_eq!(sub.marker_ids, vec!["m2".to_string(), "m0".to_string()]);
        assert_eq!(sub.values, array![[0.0, 0.2], [0.2, 0.0]]);
        assert_eq!(rf.index_of("m1"), Some(1));
        assert!(rf.submatrix(&[3]).is_err());
    }

    #[test]
    fn test_tsv_roundtrip() {
        let rf = RfMatrix::new(
            names("m", 3),
            array![[0.0, 0.125, 0.2], [0.125, 0.0, 0.3], [0.2, 0.3, 0.0]],
        )
        .unwrap();
        let dir = tempdir().unwrap();
        let path = dir.path().join("rf.tsv.gz");
        let path = path.to_str().unwrap();
        rf.write_tsv(Some(path)).unwrap();
        let back = RfMatrix::from_tsv(path).unwrap();
        assert_eq!(back.marker_ids, rf.marker_ids);
        assert_eq!(back.values, rf.values);
        assert_eq!(back.cap, None);
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(0.125), "0.125");
        assert_eq!(format_float(0.0), "0");
        assert_eq!(format_float(2.0), "2");
    }
}

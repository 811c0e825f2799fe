//! Raw allele tables and their encoding into dosage matrices.
//!
//! Raw input carries `ploidy` columns per sample, each an allele indicator
//! (`0` or `1`, or missing). [`encode`] sums each run of `ploidy` columns into
//! a single dosage, giving one [`GenotypeMatrix`] cell per marker and sample.

use ndarray::{s, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tracing::debug;

use crate::error::PergolaError;
use crate::file::{writer_or_stdout, InputFile};

/// The integer type of an allele dosage.
pub type Dosage = u8;

/// Sentinel for a dosage that could not be observed.
pub const MISSING: Dosage = Dosage::MAX;

/// Tokens that are read as missing values in genotype tables.
const MISSING_TOKENS: [&str; 4] = ["", "NA", "-", "."];

/// A raw, unencoded genotype table: markers × columns, missing values as `NaN`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawGenotypes {
    pub marker_ids: Vec<String>,
    pub column_names: Vec<String>,
    pub values: Array2<f64>,
}

impl RawGenotypes {
    pub fn new(
        marker_ids: Vec<String>,
        column_names: Vec<String>,
        values: Array2<f64>,
    ) -> Result<Self, PergolaError> {
        let (nrows, ncols) = values.dim();
        if marker_ids.len() != nrows {
            return Err(PergolaError::InvalidInput(format!(
                "{} marker ids for {} rows",
                marker_ids.len(),
                nrows
            )));
        }
        if column_names.len() != ncols {
            return Err(PergolaError::InvalidInput(format!(
                "{} column names for {} columns",
                column_names.len(),
                ncols
            )));
        }
        Ok(Self {
            marker_ids,
            column_names,
            values,
        })
    }

    /// Read a tab-delimited genotype table, possibly gzip-compressed.
    ///
    /// The first row is a header; its first field is ignored. Every other
    /// row is a marker id followed by one numeric value per column. `NA`,
    /// `-`, `.` and empty fields are missing.
    ///
    /// ```text
    /// marker  P1_1  P1_2  S1_1  S1_2
    /// m1      1     0     1     0
    /// m2      1     0     NA    NA
    /// ```
    pub fn from_tsv(filepath: &str) -> Result<Self, PergolaError> {
        let input_file = InputFile::new(filepath);
        let mut rdr = input_file.tsv_reader(true)?;

        let header = rdr.headers()?.clone();
        let column_names: Vec<String> = header.iter().skip(1).map(String::from).collect();
        let ncols = column_names.len();

        let mut marker_ids = Vec::new();
        let mut flat = Vec::new();
        for result in rdr.records() {
            let record = result?;
            let marker = record.get(0).ok_or(PergolaError::MissingField)?;
            for field in record.iter().skip(1) {
                flat.push(parse_allele(field.trim(), marker)?);
            }
            marker_ids.push(marker.to_string());
        }

        let values = Array2::from_shape_vec((marker_ids.len(), ncols), flat)
            .map_err(|e| PergolaError::InvalidInput(e.to_string()))?;
        debug!(
            markers = marker_ids.len(),
            columns = ncols,
            "read raw genotype table from {}",
            filepath
        );
        RawGenotypes::new(marker_ids, column_names, values)
    }

    /// Write the table in the layout [`RawGenotypes::from_tsv`] reads, with
    /// missing values as `NA`.
    pub fn write_tsv(&self, filepath: Option<&str>) -> Result<(), PergolaError> {
        let mut writer = writer_or_stdout(filepath, None)?;
        writeln!(writer, "marker\t{}", self.column_names.join("\t"))?;
        for (marker, row) in self.marker_ids.iter().zip(self.values.outer_iter()) {
            let fields: Vec<String> = row
                .iter()
                .map(|v| {
                    if v.is_nan() {
                        "NA".to_string()
                    } else {
                        v.to_string()
                    }
                })
                .collect();
            writeln!(writer, "{}\t{}", marker, fields.join("\t"))?;
        }
        writer.finish()?;
        Ok(())
    }
}

/// Ploidy must be positive and leave [`MISSING`] free as a sentinel.
fn check_ploidy(ploidy: u8) -> Result<(), PergolaError> {
    if ploidy == 0 || ploidy >= MISSING {
        return Err(PergolaError::InvalidInput(format!(
            "ploidy must be between 1 and {}, got {}",
            MISSING - 1,
            ploidy
        )));
    }
    Ok(())
}

fn parse_allele(field: &str, marker: &str) -> Result<f64, PergolaError> {
    if MISSING_TOKENS.contains(&field) {
        return Ok(f64::NAN);
    }
    field.parse::<f64>().map_err(|_| {
        PergolaError::ParseError(format!(
            "Failed to parse genotype value '{}' for marker '{}'",
            field, marker
        ))
    })
}

/// Encoded dosage matrix: markers × samples, entries `0..=ploidy` or [`MISSING`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenotypeMatrix {
    pub ploidy: u8,
    pub marker_ids: Vec<String>,
    pub sample_ids: Vec<String>,
    pub dosages: Array2<Dosage>,
}

impl GenotypeMatrix {
    /// Build a dosage matrix, checking dimensions and that every dosage
    /// is at most `ploidy`.
    pub fn new(
        ploidy: u8,
        marker_ids: Vec<String>,
        sample_ids: Vec<String>,
        dosages: Array2<Dosage>,
    ) -> Result<Self, PergolaError> {
        check_ploidy(ploidy)?;
        let (nrows, ncols) = dosages.dim();
        if marker_ids.len() != nrows || sample_ids.len() != ncols {
            return Err(PergolaError::InvalidInput(format!(
                "dosage matrix is {}x{}, but {} marker ids and {} sample ids given",
                nrows,
                ncols,
                marker_ids.len(),
                sample_ids.len()
            )));
        }
        if let Some(((i, j), &d)) = dosages
            .indexed_iter()
            .find(|(_, d)| **d != MISSING && **d > ploidy)
        {
            return Err(PergolaError::InvalidInput(format!(
                "dosage {} of marker '{}' in sample '{}' exceeds ploidy {}",
                d, marker_ids[i], sample_ids[j], ploidy
            )));
        }
        Ok(Self {
            ploidy,
            marker_ids,
            sample_ids,
            dosages,
        })
    }

    pub fn n_markers(&self) -> usize {
        self.dosages.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.dosages.ncols()
    }

    /// The dosages of marker `i` across samples.
    pub fn marker(&self, i: usize) -> ArrayView1<'_, Dosage> {
        self.dosages.row(i)
    }

    /// A copy with marker rows rearranged so that row `k` is old row `order[k]`.
    pub fn select_markers(&self, order: &[usize]) -> GenotypeMatrix {
        GenotypeMatrix {
            ploidy: self.ploidy,
            marker_ids: order.iter().map(|&i| self.marker_ids[i].clone()).collect(),
            sample_ids: self.sample_ids.clone(),
            dosages: self.dosages.select(Axis(0), order),
        }
    }
}

/// Collapse every run of `ploidy` allele columns into one dosage per sample.
///
/// The first `ignore_columns` columns (e.g. parental genotypes) are dropped.
/// A sample's dosage is missing if any of its allele columns is missing.
/// Sample ids are the names of the first column of each run.
pub fn encode(
    raw: &RawGenotypes,
    ploidy: u8,
    ignore_columns: usize,
) -> Result<GenotypeMatrix, PergolaError> {
    check_ploidy(ploidy)?;
    let ncols = raw.values.ncols();
    if ignore_columns > ncols {
        return Err(PergolaError::InvalidInput(format!(
            "cannot ignore {} columns of a {}-column table",
            ignore_columns, ncols
        )));
    }
    let data_cols = ncols - ignore_columns;
    let p = ploidy as usize;
    if data_cols % p != 0 {
        return Err(PergolaError::InvalidInput(format!(
            "{} data columns is not a multiple of ploidy {}",
            data_cols, ploidy
        )));
    }
    let n_samples = data_cols / p;
    let data = raw.values.slice(s![.., ignore_columns..]);

    let mut dosages = Array2::<Dosage>::from_elem((raw.values.nrows(), n_samples), MISSING);
    for (i, row) in data.outer_iter().enumerate() {
        for (j, alleles) in row.exact_chunks(p).into_iter().enumerate() {
            if alleles.iter().any(|a| a.is_nan()) {
                continue;
            }
            let sum = alleles.sum();
            if sum < 0.0 || sum > ploidy as f64 || sum.fract() != 0.0 {
                return Err(PergolaError::InvalidInput(format!(
                    "alleles of marker '{}' sum to {}, not a dosage in 0..={}",
                    raw.marker_ids[i], sum, ploidy
                )));
            }
            dosages[[i, j]] = sum as Dosage;
        }
    }

    let sample_ids = raw.column_names[ignore_columns..]
        .iter()
        .step_by(p)
        .cloned()
        .collect();
    debug!(
        markers = raw.marker_ids.len(),
        samples = n_samples,
        ploidy,
        "encoded raw genotypes"
    );
    GenotypeMatrix::new(ploidy, raw.marker_ids.clone(), sample_ids, dosages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::io::Write;
    use tempfile::tempdir;

    fn names(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_encode_tetraploid() {
        let values = array![
            [1., 1., 0., 0., 1., 0., 1., 0., 0., 0.],
            [0., 0., 1., 1., 1., 1., f64::NAN, 0., 0., 0.],
        ];
        let raw = RawGenotypes::new(names("m", 2), names("c", 10), values).unwrap();
        let geno = encode(&raw, 4, 2).unwrap();
        assert_eq!(geno.n_samples(), 2);
        assert_eq!(geno.sample_ids, vec!["c2".to_string(), "c6".to_string()]);
        assert_eq!(geno.dosages, array![[2, 0], [4, MISSING]]);
    }

    #[test]
    fn test_encode_not_divisible() {
        let raw = RawGenotypes::new(names("m", 1), names("c", 7), Array2::zeros((1, 7))).unwrap();
        // 7 - 1 = 6 columns, not a multiple of 4
        assert!(matches!(
            encode(&raw, 4, 1),
            Err(PergolaError::InvalidInput(_))
        ));
        assert!(matches!(
            encode(&raw, 2, 8),
            Err(PergolaError::InvalidInput(_))
        ));
        assert!(encode(&raw, 3, 1).is_ok());
    }

    #[test]
    fn test_encode_bad_sum() {
        let raw = RawGenotypes::new(names("m", 1), names("c", 2), array![[1.0, 1.5]]).unwrap();
        assert!(matches!(
            encode(&raw, 2, 0),
            Err(PergolaError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_dosage_exceeds_ploidy() {
        let res = GenotypeMatrix::new(2, names("m", 1), names("s", 2), array![[1, 3]]);
        assert!(matches!(res, Err(PergolaError::InvalidInput(_))));
        let ok = GenotypeMatrix::new(2, names("m", 1), names("s", 2), array![[2, MISSING]]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_ploidy_bounds() {
        let res = GenotypeMatrix::new(MISSING, names("m", 1), names("s", 1), array![[2]]);
        assert!(matches!(res, Err(PergolaError::InvalidInput(_))));
        assert!(GenotypeMatrix::new(0, names("m", 1), names("s", 1), array![[0]]).is_err());
        assert!(GenotypeMatrix::new(MISSING - 1, names("m", 1), names("s", 1), array![[200]]).is_ok());

        let raw = RawGenotypes::new(names("m", 1), names("c", 255), Array2::zeros((1, 255))).unwrap();
        assert!(matches!(
            encode(&raw, MISSING, 0),
            Err(PergolaError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_select_markers() {
        let geno =
            GenotypeMatrix::new(2, names("m", 3), names("s", 1), array![[0], [1], [2]]).unwrap();
        let sub = geno.select_markers(&[2, 0]);
        assert_eq!(sub.marker_ids, vec!["m2".to_string(), "m0".to_string()]);
        assert_eq!(sub.dosages, array![[2], [0]]);
    }

    #[test]
    fn test_from_tsv() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geno.tsv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "marker\ta_1\ta_2\tb_1\tb_2").unwrap();
        writeln!(f, "m1\t1\t0\t1\t1").unwrap();
        writeln!(f, "m2\tNA\t0\t0\t-").unwrap();
        drop(f);

        let raw = RawGenotypes::from_tsv(path.to_str().unwrap()).unwrap();
        assert_eq!(raw.marker_ids, vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(raw.column_names.len(), 4);
        assert!(raw.values[[1, 0]].is_nan());

        let geno = encode(&raw, 2, 0).unwrap();
        assert_eq!(geno.dosages, array![[1, 2], [MISSING, MISSING]]);
    }

    #[test]
    fn test_write_tsv_gz() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("geno.tsv.gz");
        let raw = RawGenotypes::new(
            names("m", 2),
            names("c", 2),
            array![[1.0, 0.0], [f64::NAN, 1.0]],
        )
        .unwrap();
        raw.write_tsv(Some(path.to_str().unwrap())).unwrap();

        let back = RawGenotypes::from_tsv(path.to_str().unwrap()).unwrap();
        assert_eq!(back.marker_ids, raw.marker_ids);
        assert_eq!(back.column_names, raw.column_names);
        assert!(back.values[[1, 0]].is_nan());
        assert_eq!(back.values[[1, 1]], 1.0);
    }
}

use genomap::GenomeMapError;
use std::io;
use thiserror::Error;

use crate::file::FileError;

#[derive(Error, Debug)]
pub enum PergolaError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Recombination frequency undefined for markers '{0}' and '{1}' (no shared observed samples)")]
    UndefinedFrequency(String, String),
    #[error("Group {0} has too few members")]
    EmptyGroup(String),
    #[error("TSV parsing error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("File reading error: {0}")]
    FileError(#[from] FileError),
    #[error("Missing field")]
    MissingField,
    #[error("Failed to parse a column: {0}")]
    ParseError(String),
    #[error("GenomeMap Error: error updating GenomeMap")]
    GenomeMapError(#[from] GenomeMapError),
}

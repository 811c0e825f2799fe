//! Plaintext and gzip-compressed TSV input and output.
//!
//! Genotype tables and RF matrices are usually large and often shipped
//! gzip-compressed, so [`InputFile`] sniffs the gzip magic bytes and
//! [`OutputFile`] compresses whenever the path ends in `.gz`.
//!
use csv::ReaderBuilder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Write;
use std::io::{self, BufWriter};
use std::io::{BufRead, BufReader, Read};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error: {0}")]
    IOError(#[from] io::Error),
    #[error("File '{0}' is empty")]
    EmptyFile(String),
}

/// Check if a file is a gzipped by looking for the magic numbers
fn is_gzipped_file(file_path: &str) -> io::Result<bool> {
    let mut file = File::open(file_path)?;
    let mut buffer = [0; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        // files shorter than two bytes cannot be gzip
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// A TSV input file, possibly gzip-compressed.
pub struct InputFile {
    pub filepath: String,
}

impl InputFile {
    pub fn new(filepath: &str) -> Self {
        Self {
            filepath: filepath.to_string(),
        }
    }

    /// Opens the file and returns a buffered reader, decompressing if the
    /// content is gzip.
    pub fn reader(&self) -> Result<BufReader<Box<dyn Read>>, FileError> {
        let file = File::open(&self.filepath)?;
        let reader: Box<dyn Read> = if is_gzipped_file(&self.filepath)? {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(BufReader::new(reader))
    }

    /// The `#` comment lines at the top of the file, without the `#`.
    ///
    /// Errors with [`FileError::EmptyFile`] if there is nothing to read.
    pub fn comments(&self) -> Result<Vec<String>, FileError> {
        let mut buf_reader = self.reader()?;
        let mut comments = Vec::new();
        let mut line = String::new();
        let mut first = true;
        loop {
            line.clear();
            let n = buf_reader.read_line(&mut line)?;
            if n == 0 {
                if first {
                    return Err(FileError::EmptyFile(self.filepath.clone()));
                }
                break;
            }
            first = false;
            match line.strip_prefix('#') {
                Some(comment) => comments.push(comment.trim_end_matches(['\n', '\r']).to_string()),
                None => break,
            }
        }
        Ok(comments)
    }

    /// A tab-delimited [`csv::Reader`] over this file. Lines starting with
    /// `#` are skipped.
    pub fn tsv_reader(
        &self,
        has_headers: bool,
    ) -> Result<csv::Reader<BufReader<Box<dyn Read>>>, FileError> {
        let reader = self.reader()?;
        Ok(ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(has_headers)
            .comment(Some(b'#'))
            .flexible(false)
            .from_reader(reader))
    }
}

/// A TSV output file; gzip-compressed when the path ends with `.gz`.
pub struct OutputFile {
    pub filepath: String,
    pub header: Option<Vec<String>>,
}

impl OutputFile {
    /// Constructs a new `OutputFile`.
    ///
    /// * `header` - optional comment lines, each written prefixed with `#`.
    pub fn new(filepath: &str, header: Option<Vec<String>>) -> Self {
        Self {
            filepath: filepath.to_string(),
            header,
        }
    }

    /// Opens the file and returns a writer, with any comment header already written.
    pub fn writer(&self) -> Result<OutputWriter, io::Error> {
        let outfile = &self.filepath;
        let mut writer = if outfile.ends_with(".gz") {
            OutputWriter::Gzip(BufWriter::new(GzEncoder::new(
                File::create(outfile)?,
                Compression::default(),
            )))
        } else {
            OutputWriter::Plain(BufWriter::new(File::create(outfile)?))
        };
        write_header(&mut writer, self.header.as_deref())?;
        Ok(writer)
    }
}

/// A buffered writer to a plain file, a gzip file, or standard out.
///
/// Call [`OutputWriter::finish`] when done: it flushes and, for gzip, writes
/// the stream trailer, reporting any error.
pub enum OutputWriter {
    Plain(BufWriter<File>),
    Gzip(BufWriter<GzEncoder<File>>),
    Stdout(BufWriter<io::Stdout>),
}

impl OutputWriter {
    pub fn finish(self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(mut w) => w.flush(),
            OutputWriter::Gzip(w) => {
                let encoder = w.into_inner().map_err(|e| e.into_error())?;
                encoder.finish()?;
                Ok(())
            }
            OutputWriter::Stdout(mut w) => w.flush(),
        }
    }
}

impl Write for OutputWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputWriter::Plain(w) => w.write(buf),
            OutputWriter::Gzip(w) => w.write(buf),
            OutputWriter::Stdout(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputWriter::Plain(w) => w.flush(),
            OutputWriter::Gzip(w) => w.flush(),
            OutputWriter::Stdout(w) => w.flush(),
        }
    }
}

fn write_header(writer: &mut OutputWriter, header: Option<&[String]>) -> io::Result<()> {
    for entry in header.unwrap_or_default() {
        writeln!(writer, "#{}", entry)?;
    }
    Ok(())
}

/// Open `filepath` for writing, or standard out if `None`, and write the
/// `#` comment `header` lines.
pub fn writer_or_stdout(
    filepath: Option<&str>,
    header: Option<Vec<String>>,
) -> Result<OutputWriter, io::Error> {
    match filepath {
        Some(path) => OutputFile::new(path, header).writer(),
        None => {
            let mut writer = OutputWriter::Stdout(BufWriter::new(io::stdout()));
            write_header(&mut writer, header.as_deref())?;
            Ok(writer)
        }
    }
}

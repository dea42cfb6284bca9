use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "output::Args")]
pub struct Args {
    /// Write to this file instead of the terminal.
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    #[arg(long, short = 'f', value_enum, default_value_t = Format::Table)]
    format: Format,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize a record to JSON")]
    SerializeJson(#[source] serde_json::Error),
    #[error("could not encode a CSV field of {0} bytes")]
    SerializeCsv(usize),
    #[error("CSV headers must be written before any record")]
    LateCsvHeaders,
}

impl Args {
    pub fn new(format: Format) -> Self {
        Self { output: None, format }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn to_output(self) -> Result<Output, Error> {
        let io = match &self.output {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(self.to_writer(io))
    }

    pub fn to_writer(self, io: Box<dyn std::io::Write>) -> Output {
        let formatter = match self.format {
            Format::Table => Formatter::Table { comfy: new_table(), rows: 0, written: false },
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Output { args: self, io, formatter }
    }
}

/// Rows of records, rendered as a table, JSON lines or CSV.
///
/// Tables are written out on [`Output::flush`] and [`Output::commit`]; the other formats are
/// streamed.
pub struct Output {
    args: Args,
    io: Box<dyn std::io::Write>,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table, rows: usize, written: bool },
    Jsonl,
}

impl Output {
    pub fn table_headers(&mut self, hdrs: &[&'static str]) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    return Err(Error::LateCsvHeaders);
                }
                *written_records = true;
                self.write_csv_row(hdrs)?;
            }
            Formatter::Table { comfy, .. } => {
                comfy.set_header(hdrs.to_vec());
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: AsRef<str>>(&mut self, values: &[V]) -> Result<(), Error> {
        let max_len = 2 + 2 * values.iter().map(|v| v.as_ref().len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        for (idx, value) in values.iter().enumerate() {
            if idx > 0 {
                let (WriteResult::InputEmpty, written) = writer.delimiter(&mut output) else {
                    return Err(Error::SerializeCsv(0));
                };
                self.io.write_all(&output[..written]).map_err(|e| self.write_error(e))?;
            }
            let input = value.as_ref().as_bytes();
            let (WriteResult::InputEmpty, consumed, written) = writer.field(input, &mut output) else {
                return Err(Error::SerializeCsv(input.len()));
            };
            debug_assert_eq!(input.len(), consumed);
            self.io.write_all(&output[..written]).map_err(|e| self.write_error(e))?;
        }
        let (WriteResult::InputEmpty, written) = writer.terminator(&mut output) else {
            return Err(Error::SerializeCsv(0));
        };
        self.io.write_all(&output[..written]).map_err(|e| self.write_error(e))
    }

    /// Add one record. `table_row` feeds the table and CSV formats, `serde_record` the JSON one.
    pub fn result<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy, rows, .. } => {
                comfy.add_row(table_row());
                *rows += 1;
            }
            Formatter::Jsonl => {
                serde_json::to_writer(&mut self.io, &serde_record())
                    .map_err(Error::SerializeJson)?;
                writeln!(self.io).map_err(|e| self.write_error(e))?
            }
        }
        Ok(())
    }

    /// Push the records added so far out to the destination.
    ///
    /// Pending table rows are written as a table of their own, under the same headers.
    pub fn flush(&mut self) -> Result<(), Error> {
        if let Formatter::Table { rows, .. } = &self.formatter {
            if *rows > 0 {
                self.write_table()?;
            }
        }
        self.io.flush().map_err(|e| self.write_error(e))
    }

    fn write_table(&mut self) -> Result<(), Error> {
        let Formatter::Table { comfy, rows, written } = &mut self.formatter else {
            return Ok(());
        };
        let mut next = new_table();
        if let Some(header) = comfy.header() {
            next.set_header(header.clone());
        }
        let full = std::mem::replace(comfy, next);
        *rows = 0;
        *written = true;
        writeln!(self.io, "{full}").map_err(|e| self.write_error(e))
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.args.output {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.into()),
        }
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { rows: 0, written: false, .. } = self.formatter {
            self.write_table()?;
        }
        self.flush()
    }
}

fn new_table() -> comfy_table::Table {
    let mut comfy = comfy_table::Table::new();
    comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
    comfy
}

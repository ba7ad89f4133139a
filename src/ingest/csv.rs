use super::chain::TransformChain;
use super::fields::FieldIndexMap;
use super::status::StatusReporter;
use super::{DataToProcessWriter, RecordLayout, RecordSink, WriteError};
use crate::config::types::DataDescription;
use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

/// Physical lines one quoted record may span before the input is rejected.
pub const MAX_LINES_PER_RECORD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvOptions {
    pub delimiter: char,
    pub quote: char,
    pub line_terminator: char,
    pub max_lines_per_record: usize,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            line_terminator: '\n',
            max_lines_per_record: MAX_LINES_PER_RECORD,
        }
    }
}

impl CsvOptions {
    pub fn from_description(description: &DataDescription) -> Self {
        Self {
            delimiter: description.field_delimiter,
            quote: description.quote_character,
            line_terminator: description.line_terminator,
            max_lines_per_record: MAX_LINES_PER_RECORD,
        }
    }

    fn terminator_byte(&self) -> u8 {
        u8::try_from(u32::from(self.line_terminator)).unwrap_or(b'\n')
    }
}

/// Splits delimited text into records, following quoted values across lines.
pub struct CsvRecordReader<R> {
    reader: R,
    options: CsvOptions,
    line_number: usize,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> CsvRecordReader<R> {
    pub fn new(reader: R, options: CsvOptions) -> Self {
        Self {
            reader,
            options,
            line_number: 0,
            line: Vec::new(),
        }
    }

    /// Next record, or `None` at end of input. Blank lines are skipped.
    pub async fn next_record(
        &mut self,
        reporter: &mut StatusReporter,
    ) -> Result<Option<Vec<String>>, WriteError> {
        let quote = self.options.quote;
        let delimiter = self.options.delimiter;
        let terminator = self.options.terminator_byte();

        let mut fields = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut first_line = None;
        let mut lines_in_record = 0;

        loop {
            self.line.clear();
            let n = self
                .reader
                .read_until(terminator, &mut self.line)
                .await
                .map_err(WriteError::Input)?;
            if n == 0 {
                if first_line.is_none() {
                    return Ok(None);
                }
                // EOF inside a quoted value: keep what was read
                fields.push(current);
                return Ok(Some(fields));
            }
            reporter.report_bytes_read(n);
            self.line_number += 1;

            let mut bytes = self.line.as_slice();
            if bytes.last() == Some(&terminator) {
                bytes = &bytes[..bytes.len() - 1];
            }
            if terminator == b'\n' && bytes.last() == Some(&b'\r') {
                bytes = &bytes[..bytes.len() - 1];
            }
            let text = String::from_utf8_lossy(bytes);

            match first_line {
                None if text.is_empty() => continue,
                None => first_line = Some(self.line_number),
                Some(_) => current.push(self.options.line_terminator),
            }

            lines_in_record += 1;
            if lines_in_record > self.options.max_lines_per_record {
                return Err(WriteError::Csv {
                    message: format!(
                        "max number of lines to read exceeded while reading quoted column \
                         beginning on line {} and ending on line {}",
                        first_line.unwrap_or(self.line_number),
                        self.line_number
                    ),
                });
            }

            let mut chars = text.chars().peekable();
            while let Some(c) = chars.next() {
                if in_quotes {
                    if c == quote {
                        if chars.peek() == Some(&quote) {
                            current.push(quote);
                            chars.next();
                        } else {
                            in_quotes = false;
                        }
                    } else {
                        current.push(c);
                    }
                } else if c == quote {
                    in_quotes = true;
                } else if c == delimiter {
                    fields.push(std::mem::take(&mut current));
                } else {
                    current.push(c);
                }
            }

            if !in_quotes {
                fields.push(current);
                return Ok(Some(fields));
            }
        }
    }
}

/// Delimited text with a header line.
pub struct CsvDataToProcessWriter {
    layout: RecordLayout,
    options: CsvOptions,
    chain: Option<TransformChain>,
}

impl CsvDataToProcessWriter {
    pub fn new(layout: RecordLayout, options: CsvOptions) -> Self {
        Self {
            layout,
            options,
            chain: None,
        }
    }
}

#[async_trait]
impl DataToProcessWriter for CsvDataToProcessWriter {
    fn build_transforms_and_header(
        &mut self,
        header: Option<&[String]>,
    ) -> Result<FieldIndexMap, WriteError> {
        let (map, chain) = self.layout.build(header)?;
        self.chain = Some(chain);
        Ok(map)
    }

    async fn write(
        &mut self,
        input: &mut (dyn AsyncRead + Unpin + Send),
        sink: &mut RecordSink<'_>,
    ) -> Result<(), WriteError> {
        let mut records = CsvRecordReader::new(BufReader::new(input), self.options.clone());

        let Some(header) = records.next_record(sink.reporter()).await? else {
            info!("no header found in delimited input, nothing to write");
            return Ok(());
        };

        let map = self.build_transforms_and_header(Some(header.as_slice()))?;
        let Some(mut chain) = self.chain.take() else {
            return Ok(());
        };
        sink.write_header(&map.output_names).await?;

        while let Some(mut row) = records.next_record(sink.reporter()).await? {
            sink.reporter().report_record_seen(row.len());

            if row.len() < map.input_len {
                let missing = map
                    .required_inputs
                    .iter()
                    .filter(|&&i| i >= row.len())
                    .count();
                sink.reporter().report_missing_fields(missing);
                row.resize(map.input_len, String::new());
            }

            sink.process(&mut chain, &row).await?;
        }

        Ok(())
    }
}

use super::chain::TransformChain;
use super::fields::FieldIndexMap;
use super::{DataToProcessWriter, RecordLayout, RecordSink, WriteError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tracing::warn;

/// Malformed documents tolerated in one call before the input is rejected.
pub const MAX_JSON_PARSE_ERRORS: usize = 10;

/// Longest single document; anything longer is treated as malformed.
pub const MAX_JSON_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

enum Candidate {
    Complete(Vec<u8>),
    Broken(String),
}

/// Brace matching state for one candidate object.
#[derive(Default)]
struct Scan {
    object: Vec<u8>,
    closers: Vec<u8>,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Feed `chunk`, stopping at the end of the object or where it breaks.
    /// Returns the bytes used and the outcome, if any.
    fn feed(&mut self, chunk: &[u8], max_bytes: usize) -> (usize, Option<Candidate>) {
        let mut consumed = 0;
        for &b in chunk {
            consumed += 1;
            if self.closers.is_empty() {
                // anything between objects is skipped
                if b == b'{' {
                    self.closers.push(b'}');
                    self.object.push(b);
                }
                continue;
            }

            self.object.push(b);
            if self.object.len() > max_bytes {
                let message = format!("document longer than {max_bytes} bytes");
                return (consumed, Some(Candidate::Broken(message)));
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' => self.closers.push(b'}'),
                b'[' => self.closers.push(b']'),
                b'}' | b']' => {
                    if self.closers.pop() != Some(b) {
                        let message = format!("unexpected '{}' in object", b as char);
                        return (consumed, Some(Candidate::Broken(message)));
                    }
                    if self.closers.is_empty() {
                        let object = std::mem::take(&mut self.object);
                        return (consumed, Some(Candidate::Complete(object)));
                    }
                }
                _ => {}
            }
        }
        (consumed, None)
    }
}

/// Yields top-level JSON objects from a byte stream.
///
/// Objects may be concatenated, separated by whitespace or newlines, or
/// wrapped in an array. A balanced document that fails to parse is skipped
/// whole. An unbalanced one (truncated, mismatched or oversized) is counted
/// and scanning restarts just after its opening brace, so the objects that
/// follow it are still found. Once more than `max_errors` documents have
/// been skipped reading fails with [`WriteError::MalformedInput`].
pub struct JsonDocumentReader<R> {
    reader: R,
    max_errors: usize,
    max_document_bytes: usize,
    errors: usize,
    /// Bytes of a broken candidate still to be rescanned.
    replay: Vec<u8>,
    replay_pos: usize,
}

impl<R: AsyncBufRead + Unpin> JsonDocumentReader<R> {
    pub fn new(reader: R, max_errors: usize) -> Self {
        Self {
            reader,
            max_errors,
            max_document_bytes: MAX_JSON_DOCUMENT_BYTES,
            errors: 0,
            replay: Vec::new(),
            replay_pos: 0,
        }
    }

    pub fn with_max_document_bytes(mut self, max_document_bytes: usize) -> Self {
        self.max_document_bytes = max_document_bytes;
        self
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    /// Next object and the number of bytes read from the input to reach it.
    pub async fn next_object(
        &mut self,
    ) -> Result<Option<(Map<String, Value>, usize)>, WriteError> {
        let mut bytes = 0;
        loop {
            let Some(candidate) = self.next_candidate(&mut bytes).await? else {
                return Ok(None);
            };
            match candidate {
                Candidate::Complete(raw) => match serde_json::from_slice::<Value>(&raw) {
                    Ok(Value::Object(object)) => return Ok(Some((object, bytes))),
                    Ok(_) => self.skip("top-level value is not an object".to_string())?,
                    Err(e) => self.skip(e.to_string())?,
                },
                Candidate::Broken(message) => self.skip(message)?,
            }
        }
    }

    fn skip(&mut self, message: String) -> Result<(), WriteError> {
        self.errors += 1;
        if self.errors > self.max_errors {
            return Err(WriteError::MalformedInput {
                errors: self.errors,
                message,
            });
        }
        warn!(errors = self.errors, error = %message, "skipping malformed JSON document");
        Ok(())
    }

    /// Rescan everything after the opening brace of a broken candidate.
    fn resync(&mut self, object: Vec<u8>) {
        let mut replay = object.get(1..).unwrap_or_default().to_vec();
        replay.extend_from_slice(&self.replay[self.replay_pos..]);
        self.replay = replay;
        self.replay_pos = 0;
    }

    /// Scan to the end of the next balanced `{ ... }`.
    async fn next_candidate(
        &mut self,
        bytes: &mut usize,
    ) -> Result<Option<Candidate>, WriteError> {
        let mut scan = Scan::default();

        loop {
            let found = if self.replay_pos < self.replay.len() {
                let pending = &self.replay[self.replay_pos..];
                let (consumed, found) = scan.feed(pending, self.max_document_bytes);
                self.replay_pos += consumed;
                found
            } else {
                if !self.replay.is_empty() {
                    self.replay = Vec::new();
                    self.replay_pos = 0;
                }
                let chunk = self.reader.fill_buf().await.map_err(WriteError::Input)?;
                if chunk.is_empty() {
                    if scan.object.is_empty() {
                        return Ok(None);
                    }
                    self.resync(std::mem::take(&mut scan.object));
                    return Ok(Some(Candidate::Broken(
                        "unexpected end of input inside an object".to_string(),
                    )));
                }
                let (consumed, found) = scan.feed(chunk, self.max_document_bytes);
                self.reader.consume(consumed);
                *bytes += consumed;
                found
            };

            match found {
                Some(Candidate::Broken(message)) => {
                    self.resync(std::mem::take(&mut scan.object));
                    return Ok(Some(Candidate::Broken(message)));
                }
                Some(complete) => return Ok(Some(complete)),
                None => {}
            }
        }
    }
}

/// Flatten nested objects into dotted names.
///
/// Scalar arrays become comma-joined strings. Arrays containing objects are
/// skipped and their names added to `skipped_arrays`. `null` values are
/// treated as absent.
pub fn flatten_object(
    object: &Map<String, Value>,
    skipped_arrays: &mut HashSet<String>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    flatten_into("", object, &mut out, skipped_arrays);
    out
}

fn flatten_into(
    prefix: &str,
    object: &Map<String, Value>,
    out: &mut HashMap<String, String>,
    skipped_arrays: &mut HashSet<String>,
) {
    for (key, value) in object {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };

        match value {
            Value::Object(inner) => flatten_into(&name, inner, out, skipped_arrays),
            Value::Array(items) => {
                if items.iter().any(|v| v.is_object() || v.is_array()) {
                    skipped_arrays.insert(name);
                    continue;
                }
                let joined = items
                    .iter()
                    .filter_map(scalar_to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                out.insert(name, joined);
            }
            other => {
                if let Some(s) = scalar_to_string(other) {
                    out.insert(name, s);
                }
            }
        }
    }
}

pub(crate) fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Fill an input record from named values, returning how many were absent.
pub(crate) fn fill_input(
    map: &FieldIndexMap,
    mut values: HashMap<String, String>,
) -> (Vec<String>, usize) {
    let mut raw = vec![String::new(); map.input_len];
    let mut missing = 0;
    for (name, &i) in &map.input {
        match values.remove(name) {
            Some(value) => raw[i] = value,
            None => missing += 1,
        }
    }
    (raw, missing)
}

/// One JSON document per record.
pub struct JsonDataToProcessWriter {
    layout: RecordLayout,
    chain: Option<TransformChain>,
}

impl JsonDataToProcessWriter {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            chain: None,
        }
    }
}

#[async_trait]
impl DataToProcessWriter for JsonDataToProcessWriter {
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
        let map = self.build_transforms_and_header(None)?;
        let Some(mut chain) = self.chain.take() else {
            return Ok(());
        };
        sink.write_header(&map.output_names).await?;

        let mut documents = JsonDocumentReader::new(BufReader::new(input), MAX_JSON_PARSE_ERRORS);
        let mut skipped_arrays = HashSet::new();

        while let Some((document, bytes)) = documents.next_object().await? {
            sink.reporter().report_bytes_read(bytes);

            let fields = flatten_object(&document, &mut skipped_arrays);
            sink.reporter().report_record_seen(fields.len());

            let (raw, missing) = fill_input(&map, fields);
            sink.reporter().report_missing_fields(missing);
            sink.process(&mut chain, &raw).await?;
        }

        if !skipped_arrays.is_empty() {
            let mut names: Vec<_> = skipped_arrays.into_iter().collect();
            names.sort();
            warn!(fields = ?names, "ignored arrays of objects in JSON input");
        }
        Ok(())
    }
}

use super::chain::TransformChain;
use super::fields::FieldIndexMap;
use super::json::{fill_input, scalar_to_string, JsonDocumentReader, MAX_JSON_PARSE_ERRORS};
use super::{DataToProcessWriter, RecordLayout, RecordSink, WriteError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::io::{AsyncRead, BufReader};
use tracing::debug;

/// Name given to a bucket's document count when no summary count field is configured.
pub const DOC_COUNT_FIELD: &str = "doc_count";

/// Hierarchical aggregation results, one record per leaf bucket.
///
/// The document (or its `aggregations` member) holds the outermost level by
/// name. Each level is an object with a `buckets` array; every bucket carries
/// a `key` and may nest the next level by name. A leaf record gets the key of
/// every enclosing bucket under its level name, the leaf's `doc_count` and
/// the `value` of each single-value metric in the leaf.
pub struct AggregatedJsonDataToProcessWriter {
    layout: RecordLayout,
    levels: Vec<String>,
    doc_count_field: String,
    chain: Option<TransformChain>,
}

impl AggregatedJsonDataToProcessWriter {
    pub fn new(
        layout: RecordLayout,
        levels: Vec<String>,
        summary_count_field: Option<String>,
    ) -> Self {
        Self {
            layout,
            levels,
            doc_count_field: summary_count_field.unwrap_or_else(|| DOC_COUNT_FIELD.to_string()),
            chain: None,
        }
    }

    /// Expand one document into leaf records.
    pub fn leaf_records(&self, document: &Map<String, Value>) -> Vec<HashMap<String, String>> {
        let root = match document.get("aggregations") {
            Some(Value::Object(aggregations)) => aggregations,
            _ => document,
        };

        let mut records = Vec::new();
        let mut keys = Vec::new();
        self.walk(0, root, &mut keys, &mut records);
        records
    }

    fn walk(
        &self,
        depth: usize,
        container: &Map<String, Value>,
        keys: &mut Vec<(String, String)>,
        records: &mut Vec<HashMap<String, String>>,
    ) {
        let buckets = self.levels.get(depth).and_then(|level| {
            container
                .get(level)
                .and_then(|v| v.get("buckets"))
                .and_then(Value::as_array)
                .map(|buckets| (level, buckets))
        });

        match buckets {
            Some((level, buckets)) => {
                for bucket in buckets {
                    let Value::Object(bucket) = bucket else {
                        continue;
                    };
                    let key = bucket
                        .get("key")
                        .and_then(scalar_to_string)
                        .or_else(|| bucket.get("key_as_string").and_then(scalar_to_string))
                        .unwrap_or_default();
                    keys.push((level.clone(), key));
                    self.walk(depth + 1, bucket, keys, records);
                    keys.pop();
                }
            }
            None if depth == 0 => {
                debug!(levels = ?self.levels, "document has no aggregation buckets");
            }
            None => records.push(self.leaf(container, keys)),
        }
    }

    fn leaf(
        &self,
        bucket: &Map<String, Value>,
        keys: &[(String, String)],
    ) -> HashMap<String, String> {
        let mut record: HashMap<String, String> = keys.iter().cloned().collect();

        if let Some(count) = bucket.get("doc_count").and_then(scalar_to_string) {
            record.insert(self.doc_count_field.clone(), count);
        }
        for (name, value) in bucket {
            if let Some(metric) = value.get("value").and_then(scalar_to_string) {
                record.insert(name.clone(), metric);
            }
        }
        record
    }
}

#[async_trait]
impl DataToProcessWriter for AggregatedJsonDataToProcessWriter {
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
        while let Some((document, bytes)) = documents.next_object().await? {
            sink.reporter().report_bytes_read(bytes);

            for fields in self.leaf_records(&document) {
                sink.reporter().report_record_seen(fields.len());
                let (raw, missing) = fill_input(&map, fields);
                sink.reporter().report_missing_fields(missing);
                sink.process(&mut chain, &raw).await?;
            }
        }
        Ok(())
    }
}

use super::chain::TransformChain;
use super::fields::FieldIndexMap;
use super::{DataToProcessWriter, RecordLayout, RecordSink, WriteError};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Input field holding the whole line; transforms extract everything else from it.
pub const RAW_FIELD: &str = "raw";

/// Unstructured text, one record per line.
pub struct SingleLineDataToProcessWriter {
    layout: RecordLayout,
    chain: Option<TransformChain>,
}

impl SingleLineDataToProcessWriter {
    pub fn new(layout: RecordLayout) -> Self {
        Self {
            layout,
            chain: None,
        }
    }
}

#[async_trait]
impl DataToProcessWriter for SingleLineDataToProcessWriter {
    fn build_transforms_and_header(
        &mut self,
        header: Option<&[String]>,
    ) -> Result<FieldIndexMap, WriteError> {
        let (map, chain) = self.layout.build(header)?;
        if !map.input.contains_key(RAW_FIELD) {
            return Err(WriteError::MissingField {
                field: RAW_FIELD.to_string(),
                header: Vec::new(),
            });
        }
        self.chain = Some(chain);
        Ok(map)
    }

    async fn write(
        &mut self,
        input: &mut (dyn AsyncRead + Unpin + Send),
        sink: &mut RecordSink<'_>,
    ) -> Result<(), WriteError> {
        let map = self.build_transforms_and_header(None)?;
        let (Some(mut chain), Some(&raw_index)) = (self.chain.take(), map.input.get(RAW_FIELD))
        else {
            return Ok(());
        };
        sink.write_header(&map.output_names).await?;

        let mut reader = BufReader::new(input);
        let mut line = Vec::new();
        loop {
            line.clear();
            let n = reader.read_until(b'\n', &mut line).await.map_err(WriteError::Input)?;
            if n == 0 {
                break;
            }
            sink.reporter().report_bytes_read(n);

            // invalid UTF-8 is replaced, never fatal
            let decoded = String::from_utf8_lossy(&line);
            let text = decoded.trim_end_matches(&['\n', '\r'][..]);
            if text.is_empty() {
                continue;
            }
            sink.reporter().report_record_seen(1);

            let mut raw = vec![String::new(); map.input_len];
            raw[raw_index] = text.to_string();
            sink.reporter().report_missing_fields(map.input_len - 1);
            sink.process(&mut chain, &raw).await?;
        }
        Ok(())
    }
}

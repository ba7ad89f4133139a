use super::transform::{Area, TransformIndex, TransformSpec};
use super::WriteError;
use crate::wire::CONTROL_FIELD_NAME;
use std::collections::{HashMap, HashSet};

/// Resolved slot layout for one ingestion call.
///
/// The output side is fixed for the life of a process: the time field at 0,
/// the analysis fields in sorted order, then the control field. The input side
/// depends on the header of the data being ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIndexMap {
    pub input: HashMap<String, usize>,
    pub input_len: usize,
    pub output_names: Vec<String>,
    pub output: HashMap<String, usize>,
    pub scratch: HashMap<String, usize>,
    /// (input index, output index) for fields copied without a transform.
    pub pass_through: Vec<(usize, usize)>,
    /// Input indices of configured fields, used for missing-field accounting.
    pub required_inputs: Vec<usize>,
}

impl FieldIndexMap {
    pub fn num_analysis_fields(&self) -> usize {
        self.output_names.len() - 2
    }

    /// Where a transform reads `name` from.
    pub fn read_index(&self, name: &str) -> Option<TransformIndex> {
        if let Some(&i) = self.scratch.get(name) {
            return Some(TransformIndex::new(Area::Scratch, i));
        }
        if let Some(&i) = self.output.get(name) {
            if i != 0 && self.is_transform_output_slot(name) {
                return Some(TransformIndex::new(Area::Output, i));
            }
        }
        self.input
            .get(name)
            .map(|&i| TransformIndex::new(Area::Input, i))
    }

    fn is_transform_output_slot(&self, name: &str) -> bool {
        let Some(&out) = self.output.get(name) else {
            return false;
        };
        !self.pass_through.iter().any(|&(_, o)| o == out)
    }

    /// Where a transform writes `name` to.
    pub fn write_index(&self, name: &str) -> Option<TransformIndex> {
        if let Some(&i) = self.scratch.get(name) {
            return Some(TransformIndex::new(Area::Scratch, i));
        }
        match self.output.get(name) {
            Some(&i) if i != 0 => Some(TransformIndex::new(Area::Output, i)),
            _ => None,
        }
    }
}

/// Computes input and output layouts from job configuration.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    time_field: String,
    analysis_fields: Vec<String>,
    transform_outputs: HashSet<String>,
    transform_inputs: Vec<String>,
}

impl FieldMapper {
    /// `analysis_fields` must already exclude the time field; they are sorted here.
    pub fn new(time_field: &str, analysis_fields: &[String], transforms: &[TransformSpec]) -> Self {
        let mut analysis_fields = analysis_fields.to_vec();
        analysis_fields.sort();
        analysis_fields.dedup();

        let transform_outputs = transforms
            .iter()
            .flat_map(|t| t.outputs.iter().cloned())
            .collect();
        let transform_inputs = transforms
            .iter()
            .flat_map(|t| t.inputs.iter().cloned())
            .collect();

        Self {
            time_field: time_field.to_string(),
            analysis_fields,
            transform_outputs,
            transform_inputs,
        }
    }

    pub fn time_field(&self) -> &str {
        &self.time_field
    }

    pub fn analysis_fields(&self) -> &[String] {
        &self.analysis_fields
    }

    /// The header record: time, sorted analysis fields, control field.
    pub fn output_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.analysis_fields.len() + 2);
        names.push(self.time_field.clone());
        names.extend(self.analysis_fields.iter().cloned());
        names.push(CONTROL_FIELD_NAME.to_string());
        names
    }

    pub fn is_transform_output(&self, field: &str) -> bool {
        self.transform_outputs.contains(field)
    }

    /// Source fields the configuration needs, in checking order.
    pub fn required_input_fields(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(&self.time_field)
            .chain(self.analysis_fields.iter())
            .chain(self.transform_inputs.iter())
            .filter(|f| !self.is_transform_output(f))
            .filter(|f| seen.insert(f.as_str()))
            .cloned()
            .collect()
    }

    /// Map a header-bearing source. Every required field must be present.
    pub fn map_header(&self, header: &[String]) -> Result<FieldIndexMap, WriteError> {
        let mut input = HashMap::new();
        for (i, name) in header.iter().enumerate() {
            input.entry(name.clone()).or_insert(i);
        }

        for field in self.required_input_fields() {
            if !input.contains_key(&field) {
                return Err(WriteError::MissingField {
                    field,
                    header: header.to_vec(),
                });
            }
        }

        Ok(self.build(input, header.len()))
    }

    /// Map a source without a header; the input record is laid out in
    /// [`required_input_fields`](Self::required_input_fields) order.
    pub fn map_synthetic(&self) -> FieldIndexMap {
        let fields = self.required_input_fields();
        let len = fields.len();
        let input = fields.into_iter().enumerate().map(|(i, f)| (f, i)).collect();
        self.build(input, len)
    }

    fn build(&self, input: HashMap<String, usize>, input_len: usize) -> FieldIndexMap {
        let output_names = self.output_names();
        let output: HashMap<String, usize> = output_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        // Intermediate transform results, plus a transformed time field, live in scratch.
        let mut scratch_names: Vec<&String> = self
            .transform_outputs
            .iter()
            .filter(|f| *f == &self.time_field || !output.contains_key(*f))
            .collect();
        scratch_names.sort();
        let scratch = scratch_names
            .into_iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();

        let pass_through = self
            .analysis_fields
            .iter()
            .filter(|f| !self.is_transform_output(f))
            .filter_map(|f| Some((*input.get(f)?, *output.get(f)?)))
            .collect();

        let required_inputs = self
            .required_input_fields()
            .iter()
            .filter_map(|f| input.get(f).copied())
            .collect();

        FieldIndexMap {
            input,
            input_len,
            output_names,
            output,
            scratch,
            pass_through,
            required_inputs,
        }
    }
}

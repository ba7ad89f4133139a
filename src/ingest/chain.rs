use super::fields::FieldIndexMap;
use super::timestamp::TimestampParser;
use super::transform::{
    Areas, Transform, TransformError, TransformIndex, TransformResult, TransformSpec,
};
use super::WriteError;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted { epoch: i64 },
    InvalidDate,
    OutOfOrder { epoch: i64 },
    Excluded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainResult {
    pub outcome: RecordOutcome,
    pub failed_transforms: usize,
}

/// Runs the date transform and the configured transforms over each record.
///
/// Transforms producing the time field run before the date transform, the
/// rest after it. Within each group producers run before their consumers and
/// configured order is otherwise kept.
#[derive(Debug)]
pub struct TransformChain {
    pre_date: Vec<Transform>,
    date_input: TransformIndex,
    parser: TimestampParser,
    post_date: Vec<Transform>,
    pass_through: Vec<(usize, usize)>,
    latency: i64,
    scratch: Vec<String>,
    output: Vec<String>,
}

impl TransformChain {
    pub fn build(
        map: &FieldIndexMap,
        time_field: &str,
        transforms: &[TransformSpec],
        parser: TimestampParser,
        latency: i64,
    ) -> Result<Self, WriteError> {
        let ordered = dependency_order(transforms)?;
        let pre_date_set = producers_of(time_field, transforms);

        let mut pre_date = Vec::new();
        let mut post_date = Vec::new();
        for i in ordered {
            let spec = &transforms[i];
            let transform = bind(map, spec)?;
            if pre_date_set.contains(&i) {
                pre_date.push(transform);
            } else {
                post_date.push(transform);
            }
        }

        let date_input = resolve(map, time_field)?;

        Ok(Self {
            pre_date,
            date_input,
            parser,
            post_date,
            pass_through: map.pass_through.clone(),
            latency,
            scratch: vec![String::new(); map.scratch.len()],
            output: vec![String::new(); map.output_names.len()],
        })
    }

    /// The output record produced by the last accepted [`apply`](Self::apply).
    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Transform one raw record.
    ///
    /// A record is accepted when its time is no earlier than `high_water`
    /// minus the latency window; `high_water` only moves on acceptance.
    pub fn apply(&mut self, raw: &[String], high_water: &mut Option<i64>) -> ChainResult {
        for slot in self.output.iter_mut().chain(self.scratch.iter_mut()) {
            slot.clear();
        }
        for &(i, o) in &self.pass_through {
            if let Some(value) = raw.get(i) {
                self.output[o].clone_from(value);
            }
        }

        let mut failed_transforms = 0;
        let mut areas = Areas {
            input: raw,
            scratch: &mut self.scratch,
            output: &mut self.output,
        };

        let finish = |outcome, failed_transforms| ChainResult {
            outcome,
            failed_transforms,
        };

        if run_all(&self.pre_date, &mut areas, &mut failed_transforms) {
            return finish(RecordOutcome::Excluded, failed_transforms);
        }

        let time_value = areas.get(self.date_input);
        let epoch = match self.parser.parse_epoch_secs(time_value) {
            Ok(epoch) => epoch,
            Err(e) => {
                debug!(error = %e, "dropping record with unparseable time");
                return finish(RecordOutcome::InvalidDate, failed_transforms);
            }
        };

        if let Some(latest) = *high_water {
            if epoch < latest.saturating_sub(self.latency) {
                return finish(RecordOutcome::OutOfOrder { epoch }, failed_transforms);
            }
        }

        if run_all(&self.post_date, &mut areas, &mut failed_transforms) {
            return finish(RecordOutcome::Excluded, failed_transforms);
        }

        areas.output[0] = epoch.to_string();
        *high_water = Some(high_water.map_or(epoch, |latest| latest.max(epoch)));
        finish(RecordOutcome::Accepted { epoch }, failed_transforms)
    }
}

/// Returns true when a transform excluded the record.
fn run_all(transforms: &[Transform], areas: &mut Areas<'_>, failed: &mut usize) -> bool {
    for transform in transforms {
        match transform.apply(areas) {
            TransformResult::Ok => {}
            TransformResult::Fail => {
                debug!(transform = transform.name(), "transform failed, record kept");
                *failed += 1;
            }
            TransformResult::Exclude => return true,
        }
    }
    false
}

fn resolve(map: &FieldIndexMap, field: &str) -> Result<TransformIndex, WriteError> {
    map.read_index(field).ok_or_else(|| {
        let mut header: Vec<(usize, String)> =
            map.input.iter().map(|(k, &v)| (v, k.clone())).collect();
        header.sort();
        WriteError::MissingField {
            field: field.to_string(),
            header: header.into_iter().map(|(_, name)| name).collect(),
        }
    })
}

fn bind(map: &FieldIndexMap, spec: &TransformSpec) -> Result<Transform, WriteError> {
    let inputs = spec
        .inputs
        .iter()
        .map(|name| resolve(map, name))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = spec
        .outputs
        .iter()
        .filter_map(|name| map.write_index(name))
        .collect();
    Ok(Transform::new(spec, inputs, outputs))
}

/// Stable topological order of `transforms` (indices), producers first.
pub fn dependency_order(transforms: &[TransformSpec]) -> Result<Vec<usize>, TransformError> {
    let mut producer: HashMap<&str, usize> = HashMap::new();
    for (i, t) in transforms.iter().enumerate() {
        for out in &t.outputs {
            if producer.insert(out.as_str(), i).is_some() {
                return Err(TransformError::DuplicateOutput(out.clone()));
            }
        }
    }

    let depends_on: Vec<HashSet<usize>> = transforms
        .iter()
        .enumerate()
        .map(|(i, t)| {
            t.inputs
                .iter()
                .filter_map(|input| producer.get(input.as_str()).copied())
                .filter(|&p| p != i)
                .collect()
        })
        .collect();

    // Kahn's algorithm, always taking the earliest configured ready transform.
    let mut done = vec![false; transforms.len()];
    let mut order = Vec::with_capacity(transforms.len());
    while order.len() < transforms.len() {
        let next = (0..transforms.len())
            .find(|&i| !done[i] && depends_on[i].iter().all(|&d| done[d]));
        match next {
            Some(i) => {
                done[i] = true;
                order.push(i);
            }
            None => {
                let remaining: Vec<String> = (0..transforms.len())
                    .filter(|&i| !done[i])
                    .map(|i| transforms[i].outputs.join(","))
                    .collect();
                return Err(TransformError::Cycle(remaining.join(" <-> ")));
            }
        }
    }

    Ok(order)
}

/// Indices of transforms that contribute, directly or transitively, to `field`.
fn producers_of(field: &str, transforms: &[TransformSpec]) -> HashSet<usize> {
    let mut wanted = vec![field.to_string()];
    let mut found = HashSet::new();
    while let Some(name) = wanted.pop() {
        for (i, t) in transforms.iter().enumerate() {
            if t.outputs.contains(&name) && found.insert(i) {
                wanted.extend(t.inputs.iter().cloned());
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::TransformConfig;
    use crate::ingest::fields::FieldMapper;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn spec(name: &str, inputs: &[&str], outputs: &[&str], args: &[&str]) -> TransformSpec {
        TransformSpec::from_config(&TransformConfig {
            transform: name.to_string(),
            inputs: strings(inputs),
            outputs: strings(outputs),
            arguments: strings(args),
            condition: None,
        })
        .unwrap()
    }

    fn chain(
        header: &[&str],
        analysis: &[&str],
        transforms: Vec<TransformSpec>,
        format: &str,
        latency: i64,
    ) -> TransformChain {
        let mapper = FieldMapper::new("time", &strings(analysis), &transforms);
        let map = mapper.map_header(&strings(header)).unwrap();
        TransformChain::build(
            &map,
            "time",
            &transforms,
            TimestampParser::new(format).unwrap(),
            latency,
        )
        .unwrap()
    }

    #[test]
    fn test_pass_through_and_time_formatting() {
        let mut chain = chain(&["time", "metric", "value"], &["value"], vec![], "epoch", 0);
        let mut hwm = None;

        let result = chain.apply(&strings(&["1.9", "cpu", "1.0"]), &mut hwm);
        assert_eq!(result.outcome, RecordOutcome::Accepted { epoch: 1 });
        assert_eq!(chain.output(), &["1", "1.0", ""]);
        assert_eq!(hwm, Some(1));
    }

    #[test]
    fn test_invalid_date_dropped() {
        let mut chain = chain(&["time", "value"], &["value"], vec![], "epoch", 0);
        let mut hwm = None;

        let result = chain.apply(&strings(&["yesterday", "1"]), &mut hwm);
        assert_eq!(result.outcome, RecordOutcome::InvalidDate);
        assert_eq!(hwm, None);
    }

    #[test]
    fn test_latency_window() {
        let mut chain = chain(&["time", "value"], &["value"], vec![], "epoch", 2);
        let mut hwm = None;

        let outcomes: Vec<_> = ["4", "5", "3", "4", "2"]
            .iter()
            .map(|t| chain.apply(&strings(&[t, "x"]), &mut hwm).outcome)
            .collect();

        assert_eq!(
            outcomes,
            vec![
                RecordOutcome::Accepted { epoch: 4 },
                RecordOutcome::Accepted { epoch: 5 },
                RecordOutcome::Accepted { epoch: 3 },
                RecordOutcome::Accepted { epoch: 4 },
                RecordOutcome::OutOfOrder { epoch: 2 },
            ]
        );
        assert_eq!(hwm, Some(5));
    }

    #[test]
    fn test_transform_builds_time_field_before_parsing() {
        let transforms = vec![spec("concat", &["date", "clock"], &["time"], &["T"])];
        let mut chain = chain(
            &["date", "clock", "value"],
            &["value"],
            transforms,
            "%Y-%m-%dT%H:%M:%S",
            0,
        );
        let mut hwm = None;

        let result = chain.apply(&strings(&["1970-01-01", "00:00:10", "3"]), &mut hwm);
        assert_eq!(result.outcome, RecordOutcome::Accepted { epoch: 10 });
        assert_eq!(chain.output(), &["10", "3", ""]);
    }

    #[test]
    fn test_failed_transform_keeps_record() {
        let transforms = vec![spec("extract", &["msg"], &["code"], &[r"code=(\d+)"])];
        let mut chain = chain(&["time", "msg"], &["code"], transforms, "epoch", 0);
        let mut hwm = None;

        let result = chain.apply(&strings(&["5", "no code here"]), &mut hwm);
        assert_eq!(result.outcome, RecordOutcome::Accepted { epoch: 5 });
        assert_eq!(result.failed_transforms, 1);
        assert_eq!(chain.output(), &["5", "", ""]);
    }

    #[test]
    fn test_excluded_record_does_not_move_high_water_mark() {
        let mut exclude = TransformConfig {
            transform: "exclude".to_string(),
            inputs: strings(&["level"]),
            outputs: vec![],
            arguments: vec![],
            condition: None,
        };
        exclude.condition = Some(crate::config::types::ConditionConfig {
            operator: crate::config::types::ConditionOperator::Match,
            value: "debug".to_string(),
        });
        let transforms = vec![TransformSpec::from_config(&exclude).unwrap()];
        let mut chain = chain(&["time", "level", "value"], &["value"], transforms, "epoch", 0);
        let mut hwm = None;

        let result = chain.apply(&strings(&["9", "debug", "1"]), &mut hwm);
        assert_eq!(result.outcome, RecordOutcome::Excluded);
        assert_eq!(hwm, None);
    }

    #[test]
    fn test_dependency_order_puts_producers_first() {
        let transforms = vec![
            spec("uppercase", &["joined"], &["loud"], &[]),
            spec("concat", &["a", "b"], &["joined"], &[]),
            spec("trim", &["c"], &["clean"], &[]),
        ];
        assert_eq!(dependency_order(&transforms).unwrap(), vec![1, 0, 2]);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let transforms = vec![
            spec("uppercase", &["y"], &["x"], &[]),
            spec("lowercase", &["x"], &["y"], &[]),
        ];
        assert!(matches!(
            dependency_order(&transforms),
            Err(TransformError::Cycle(_))
        ));
    }

    #[test]
    fn test_chained_transforms_feed_output() {
        let transforms = vec![
            spec("uppercase", &["joined"], &["loud"], &[]),
            spec("concat", &["a", "b"], &["joined"], &["-"]),
        ];
        let mut chain = chain(&["time", "a", "b"], &["loud"], transforms, "epoch", 0);
        let mut hwm = None;

        chain.apply(&strings(&["1", "x", "y"]), &mut hwm);
        assert_eq!(chain.output(), &["1", "X-Y", ""]);
    }
}

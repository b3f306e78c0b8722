//! Deterministic sampling.
//!
//! Bucket numbers are part of the external contract: the same key must produce the same bucket in
//! every implementation of the engine, so the hash function, its seed and the scale are fixed.
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::{
    conditions::{Condition, ConditionsChecker},
    source::{SourceDescriptor, SourceResolver},
    value::{to_js_string, Inputs},
    Result,
};

const HASH_SEED: u32 = 1;

/// Bucketed numbers are in `[0, MAX_BUCKETED_NUMBER)`: a percentage with three decimal places.
pub const MAX_BUCKETED_NUMBER: u32 = 100_000;

const BUCKET_KEY_SEPARATOR: &str = ".";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub by: SampleBy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Condition>,
    /// Threshold on the `0..100000` scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[f64; 2]>,
}

/// What the bucket key is made of.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleBy {
    /// First source that resolves to a defined value.
    Or { or: Vec<SourceDescriptor> },
    /// All sources, joined with `.`.
    Multiple(Vec<SourceDescriptor>),
    Single(SourceDescriptor),
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleResult {
    pub is_sampled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_sample: Option<Sample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucketed_number: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_key: Option<String>,
}

/// MurmurHash3, x86 32-bit variant.
pub fn murmurhash_v3(key: impl AsRef<[u8]>, seed: u32) -> Result<u32> {
    Ok(murmur3::murmur3_32(&mut Cursor::new(key.as_ref()), seed)?)
}

/// Map a bucket key to a number in `[0, MAX_BUCKETED_NUMBER)`.
pub fn get_bucketed_number(bucket_key: &str) -> Result<u32> {
    let hash = murmurhash_v3(bucket_key, HASH_SEED)?;
    Ok(((u64::from(hash) * u64::from(MAX_BUCKETED_NUMBER)) >> 32) as u32)
}

#[derive(Clone, Copy)]
pub struct Bucketer<'a> {
    checker: ConditionsChecker<'a>,
    resolver: SourceResolver<'a>,
}

impl<'a> Bucketer<'a> {
    pub fn new(checker: ConditionsChecker<'a>, resolver: SourceResolver<'a>) -> Bucketer<'a> {
        Bucketer { checker, resolver }
    }

    pub fn get_bucket_key(&self, by: &SampleBy, inputs: &Inputs) -> String {
        let (sources, first_only) = match by {
            SampleBy::Or { or } => (or.as_slice(), true),
            SampleBy::Multiple(sources) => (sources.as_slice(), false),
            SampleBy::Single(source) => (std::slice::from_ref(source), false),
        };

        let mut values = sources
            .iter()
            .filter_map(|source| self.resolver.resolve(source, inputs))
            .map(|value| to_js_string(&value));

        if first_only {
            values.next().unwrap_or_default()
        } else {
            values.collect::<Vec<_>>().join(BUCKET_KEY_SEPARATOR)
        }
    }

    /// Decide whether `inputs` fall into the sample.
    ///
    /// The first sample whose conditions match (or that has none) is used. Without a matching
    /// sample everything is sampled.
    pub fn is_sampled(&self, samples: &[Sample], inputs: &Inputs) -> SampleResult {
        let Some(sample) = samples.iter().find(|sample| {
            sample
                .conditions
                .as_ref()
                .map_or(true, |conditions| self.checker.all_are_matched(conditions, inputs))
        }) else {
            return SampleResult {
                is_sampled: true,
                ..SampleResult::default()
            };
        };

        let bucket_key = self.get_bucket_key(&sample.by, inputs);
        let bucketed_number = match get_bucketed_number(&bucket_key) {
            Ok(bucketed_number) => bucketed_number,
            Err(err) => {
                log::error!(target: "eventvisor",
                            bucket_key = bucket_key.as_str();
                            "error hashing bucket key: {err}");
                return SampleResult {
                    is_sampled: true,
                    matched_sample: Some(sample.clone()),
                    bucketed_number: None,
                    bucket_key: Some(bucket_key),
                };
            }
        };
        let bucket = f64::from(bucketed_number);

        let below_percentage = sample
            .percentage
            .is_some_and(|percentage| percentage > 0.0 && bucket < percentage);
        // Both bounds have to be crossed at once, so for a well-formed `[low, high]` this never
        // excludes anything. Kept as is for compatibility with existing datafiles.
        let outside_range = sample
            .range
            .is_some_and(|[low, high]| bucket < low && bucket > high);

        let is_sampled = !(below_percentage || outside_range);
        log::trace!(target: "eventvisor",
                    bucket_key = bucket_key.as_str(),
                    bucketed_number,
                    is_sampled;
                    "evaluated sample");

        SampleResult {
            is_sampled,
            matched_sample: Some(sample.clone()),
            bucketed_number: Some(bucketed_number),
            bucket_key: Some(bucket_key),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        attributes::AttributesManager, datafile::Datafile, datafile_reader::DatafileReader,
        effects::EffectsManager, emitter::Emitter, evaluator::Evaluator, modules::ModulesManager,
        value::Inputs,
    };

    use super::*;

    #[test]
    fn murmurhash_reference_values() {
        assert_eq!(murmurhash_v3("", 1).unwrap(), 1364076727);
        assert_eq!(murmurhash_v3("25", 1).unwrap(), 871497492);
        assert_eq!(murmurhash_v3("25.John", 1).unwrap(), 165272834);
        assert_eq!(murmurhash_v3("hello", 1).unwrap(), 3142237357);
        assert_eq!(murmurhash_v3("héllo", 1).unwrap(), 3542237226);
        assert_eq!(murmurhash_v3("user-123", 1).unwrap(), 2713655292);
    }

    #[test]
    fn bucketed_numbers_are_stable() {
        let cases = [
            ("25", 20291),
            ("25.John", 3848),
            ("user-123", 63182),
            ("user-123.device-234", 77429),
            ("", 31759),
            ("u1", 47324),
            ("hello", 73160),
            ("héllo", 82474),
            ("test-key-for-bucketing", 60565),
        ];
        for (key, expected) in cases {
            assert_eq!(get_bucketed_number(key).unwrap(), expected, "bucket of {key:?}");
            assert!(get_bucketed_number(key).unwrap() < MAX_BUCKETED_NUMBER);
        }
    }

    struct Fixture {
        reader: DatafileReader,
        modules: ModulesManager,
        attributes: AttributesManager,
        effects: EffectsManager,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                reader: DatafileReader::new(Datafile::empty()),
                modules: ModulesManager::new(),
                attributes: AttributesManager::new(Emitter::new()),
                effects: EffectsManager::new(),
            }
        }

        fn bucketer(&self) -> Bucketer<'_> {
            Evaluator::new(&self.reader, &self.modules, &self.attributes, &self.effects).bucketer()
        }
    }

    fn payload(payload: serde_json::Value) -> Inputs {
        let mut inputs = Inputs::new();
        inputs.insert("payload".to_owned(), payload);
        inputs
    }

    #[test]
    fn bucket_key_composition() {
        let f = Fixture::new();
        let inputs = payload(json!({"age": 25, "name": "John"}));
        let by = |v| serde_json::from_value::<SampleBy>(v).unwrap();

        assert_eq!(
            f.bucketer()
                .get_bucket_key(&by(json!([{"source": "payload.age"}])), &inputs),
            "25"
        );
        assert_eq!(
            f.bucketer().get_bucket_key(
                &by(json!([{"source": "payload.age"}, {"source": "payload.name"}])),
                &inputs
            ),
            "25.John"
        );
        assert_eq!(
            f.bucketer()
                .get_bucket_key(&by(json!({"payload": "age"})), &inputs),
            "25"
        );
        assert_eq!(
            f.bucketer().get_bucket_key(
                &by(json!({"or": ["payload.missing", "payload.name", "payload.age"]})),
                &inputs
            ),
            "John"
        );
        // undefined values are skipped
        assert_eq!(
            f.bucketer().get_bucket_key(
                &by(json!(["payload.age", "payload.missing", "payload.name"])),
                &inputs
            ),
            "25.John"
        );
    }

    #[test]
    fn percentage_threshold() {
        let f = Fixture::new();
        // "25" buckets to 20291
        let inputs = payload(json!({"age": 25}));
        let sample = |percentage: f64| -> Vec<Sample> {
            vec![serde_json::from_value(json!({"by": "payload.age", "percentage": percentage}))
                .unwrap()]
        };

        let result = f.bucketer().is_sampled(&sample(20291.0), &inputs);
        assert!(result.is_sampled);
        assert_eq!(result.bucketed_number, Some(20291));
        assert_eq!(result.bucket_key.as_deref(), Some("25"));

        assert!(!f.bucketer().is_sampled(&sample(20292.0), &inputs).is_sampled);
        assert!(!f.bucketer().is_sampled(&sample(100000.0), &inputs).is_sampled);
        assert!(f.bucketer().is_sampled(&sample(0.0), &inputs).is_sampled);
    }

    #[test]
    fn first_matching_sample_wins() {
        let f = Fixture::new();
        let samples: Vec<Sample> = serde_json::from_value(json!([
            {
                "by": "payload.age",
                "conditions": [{"source": "payload.country", "operator": "equals", "value": "de"}],
                "percentage": 100000
            },
            {"by": "payload.age", "percentage": 0}
        ]))
        .unwrap();

        assert!(f
            .bucketer()
            .is_sampled(&samples, &payload(json!({"age": 25, "country": "nl"})))
            .is_sampled);
        assert!(!f
            .bucketer()
            .is_sampled(&samples, &payload(json!({"age": 25, "country": "de"})))
            .is_sampled);

        let result = f.bucketer().is_sampled(&samples[..1], &payload(json!({"age": 25})));
        assert!(result.is_sampled);
        assert!(result.matched_sample.is_none());
    }

    #[test]
    fn range_never_excludes_well_formed_bounds() {
        let f = Fixture::new();
        let samples: Vec<Sample> =
            serde_json::from_value(json!([{"by": "payload.age", "range": [50000, 60000]}]))
                .unwrap();
        assert!(f.bucketer().is_sampled(&samples, &payload(json!({"age": 25}))).is_sampled);
    }
}

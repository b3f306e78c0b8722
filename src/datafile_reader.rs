use std::{collections::HashMap, sync::Mutex};

use regex::{Regex, RegexBuilder};

use crate::{
    datafile::{
        Attribute, ComplexPersist, Datafile, Destination, Effect, Event, Persist, TryParse,
    },
    Error, Result,
};

/// Read-only view over one datafile revision.
///
/// A new reader is created for every datafile; the only interior state is the regex cache.
pub struct DatafileReader {
    datafile: Datafile,
    regex_cache: Mutex<HashMap<(String, String), Regex>>,
}

impl DatafileReader {
    pub fn new(datafile: Datafile) -> DatafileReader {
        DatafileReader {
            datafile,
            regex_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn datafile(&self) -> &Datafile {
        &self.datafile
    }

    pub fn get_schema_version(&self) -> &str {
        &self.datafile.schema_version
    }

    pub fn get_revision(&self) -> &str {
        &self.datafile.revision
    }

    pub fn get_attribute(&self, attribute_name: &str) -> Option<&Attribute> {
        parsed("attribute", attribute_name, self.datafile.attributes.get(attribute_name))
    }

    pub fn get_attribute_names(&self) -> Vec<&str> {
        self.datafile.attributes.keys().map(String::as_str).collect()
    }

    pub fn get_event(&self, event_name: &str) -> Option<&Event> {
        parsed("event", event_name, self.datafile.events.get(event_name))
    }

    pub fn get_destination(&self, destination_name: &str) -> Option<&Destination> {
        parsed(
            "destination",
            destination_name,
            self.datafile.destinations.get(destination_name),
        )
    }

    pub fn get_destination_names(&self) -> Vec<&str> {
        self.datafile.destinations.keys().map(String::as_str).collect()
    }

    pub fn get_effect(&self, effect_name: &str) -> Option<&Effect> {
        parsed("effect", effect_name, self.datafile.effects.get(effect_name))
    }

    pub fn get_effect_names(&self) -> Vec<&str> {
        self.datafile.effects.keys().map(String::as_str).collect()
    }

    /// Compile (or fetch from cache) a regex with JavaScript-style flags.
    ///
    /// Supported flags: `i` (case-insensitive), `m` (multi-line), `s` (dot matches new line).
    /// `u`, `g` and `y` are accepted and have no effect on matching.
    pub fn get_regex(&self, pattern: &str, flags: &str) -> Result<Regex> {
        let key = (pattern.to_owned(), flags.to_owned());
        // Regex is cheap to clone (reference-counted internally).
        if let Some(regex) = self.regex_cache.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(regex);
        }

        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                'm' => builder.multi_line(true),
                's' => builder.dot_matches_new_line(true),
                'u' | 'g' | 'y' => &mut builder,
                other => return Err(Error::InvalidRegexFlag(other)),
            };
        }
        let regex = builder.build().map_err(|err| Error::InvalidRegex {
            pattern: pattern.to_owned(),
            flags: flags.to_owned(),
            message: err.to_string(),
        })?;

        if let Ok(mut cache) = self.regex_cache.lock() {
            cache.insert(key, regex.clone());
        }
        Ok(regex)
    }

    /// Candidate storage bindings of an attribute or effect, in declaration order.
    pub fn get_persists(&self, persist: Option<&Persist>) -> Option<Vec<ComplexPersist>> {
        persist.map(Persist::to_complex)
    }
}

fn parsed<'a, T>(kind: &str, name: &str, entity: Option<&'a TryParse<T>>) -> Option<&'a T> {
    match entity? {
        TryParse::Parsed(entity) => Some(entity),
        TryParse::ParseFailed(_) => {
            log::warn!(target: "eventvisor", kind, name; "failed to parse {kind} from datafile");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{datafile::Datafile, Error};

    use super::DatafileReader;

    fn reader() -> DatafileReader {
        DatafileReader::new(
            Datafile::from_value(json!({
                "schemaVersion": "1",
                "revision": "3",
                "attributes": {
                    "userId": {"type": "string", "persist": "localStorage"},
                    "broken": {"type": "string", "transforms": 5}
                },
                "destinations": {
                    "b": {"transport": "console"},
                    "a": {"transport": "console"}
                },
                "effects": {
                    "counter": {"on": ["event_tracked"], "state": 0, "persist": [
                        {"storage": "session", "conditions": "*"},
                        "local"
                    ]}
                }
            }))
            .unwrap(),
        )
    }

    #[test]
    fn entity_access() {
        let reader = reader();
        assert_eq!(reader.get_revision(), "3");
        assert_eq!(reader.get_schema_version(), "1");
        assert!(reader.get_attribute("userId").is_some());
        assert!(reader.get_attribute("broken").is_none());
        assert!(reader.get_attribute("missing").is_none());
        assert_eq!(reader.get_attribute_names(), ["userId", "broken"]);
        // declaration order is preserved
        assert_eq!(reader.get_destination_names(), ["b", "a"]);
        assert!(reader.get_event("anything").is_none());
    }

    #[test]
    fn persists_are_flattened() {
        let reader = reader();
        let effect = reader.get_effect("counter").unwrap();
        let persists = reader.get_persists(effect.persist.as_ref()).unwrap();
        assert_eq!(persists.len(), 2);
        assert_eq!(persists[0].storage, "session");
        assert!(persists[0].conditions.is_some());
        assert_eq!(persists[1].storage, "local");

        let attribute = reader.get_attribute("userId").unwrap();
        let persists = reader.get_persists(attribute.persist.as_ref()).unwrap();
        assert_eq!(persists[0].storage, "localStorage");

        assert!(reader.get_persists(None).is_none());
    }

    #[test]
    fn regex_flags() {
        let reader = reader();
        assert!(!reader.get_regex("^abc$", "").unwrap().is_match("ABC"));
        assert!(reader.get_regex("^abc$", "i").unwrap().is_match("ABC"));
        assert!(reader.get_regex("^b$", "m").unwrap().is_match("a\nb"));
        assert!(reader.get_regex("a.b", "s").unwrap().is_match("a\nb"));
        assert!(reader.get_regex("abc", "gu").unwrap().is_match("xabcx"));
        // cached
        assert!(reader.get_regex("^abc$", "i").unwrap().is_match("abc"));

        assert!(matches!(
            reader.get_regex("abc", "q"),
            Err(Error::InvalidRegexFlag('q'))
        ));
        assert!(matches!(
            reader.get_regex("(", ""),
            Err(Error::InvalidRegex { .. })
        ));
    }
}

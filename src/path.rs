//! Dotted path addressing shared by source resolution, transforms and validation error paths.
//!
//! Paths are written as `a.b.2.c` or `a.b[2].c`. A segment made only of ASCII digits addresses an
//! array element; when applied to an object it is used as a plain key.

use std::fmt::{self, Display};

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Field(String),
    Index(usize),
}

impl PathSegment {
    fn parse(s: &str) -> PathSegment {
        let is_index = !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        match s.parse() {
            Ok(index) if is_index => PathSegment::Index(index),
            _ => PathSegment::Field(s.to_owned()),
        }
    }

    fn as_key(&self) -> String {
        match self {
            PathSegment::Field(key) => key.clone(),
            PathSegment::Index(index) => index.to_string(),
        }
    }

    fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        match (self, value) {
            (PathSegment::Field(key), Value::Object(map)) => map.get(key),
            (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string()),
            (PathSegment::Index(index), Value::Array(items)) => items.get(*index),
            _ => None,
        }
    }
}

/// Parsed path. An empty path addresses the root value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    pub fn parse(s: &str) -> Path {
        let segments = s
            .split('.')
            .flat_map(|part| {
                // `items[2]` is the same as `items.2`
                let mut pieces = Vec::new();
                let mut rest = part;
                while let Some(open) = rest.find('[') {
                    let Some(close) = rest[open..].find(']').map(|i| open + i) else {
                        break;
                    };
                    pieces.push(&rest[..open]);
                    pieces.push(&rest[open + 1..close]);
                    rest = &rest[close + 1..];
                }
                pieces.push(rest);
                pieces
            })
            .filter(|piece| !piece.is_empty())
            .map(PathSegment::parse)
            .collect();
        Path { segments }
    }

    pub fn from_segments(segments: Vec<PathSegment>) -> Path {
        Path { segments }
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.segments.push(segment);
    }

    /// Return a new path with `segment` appended.
    pub fn join(&self, segment: PathSegment) -> Path {
        let mut path = self.clone();
        path.push(segment);
        path
    }

    /// Read the value at this path. Missing intermediate segments yield `None`.
    pub fn get<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| segment.get(current))
    }

    /// Write `new_value` at this path, creating intermediate containers as needed.
    ///
    /// Intermediate containers are arrays when the following segment is an index and objects
    /// otherwise. Writing into `null` or a primitive is a no-op. An empty path replaces the root.
    pub fn set(&self, root: &mut Value, new_value: Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            *root = new_value;
            return;
        };
        if root.is_null() {
            return;
        }

        let mut current = root;
        for (i, segment) in parents.iter().enumerate() {
            let next_is_index = matches!(self.segments[i + 1], PathSegment::Index(_));
            let Some(next) = child_or_insert(current, segment, next_is_index) else {
                return;
            };
            current = next;
        }

        match (last, current) {
            (PathSegment::Index(index), Value::Array(items)) => {
                if *index >= items.len() {
                    items.resize(*index + 1, Value::Null);
                }
                items[*index] = new_value;
            }
            (segment, Value::Object(map)) => {
                map.insert(segment.as_key(), new_value);
            }
            _ => {}
        }
    }

    /// Remove the value at this path. Array elements are spliced out. Missing paths are ignored.
    pub fn remove(&self, root: &mut Value) {
        let Some((last, parents)) = self.segments.split_last() else {
            return;
        };

        let mut current = root;
        for segment in parents {
            let next = match (segment, current) {
                (PathSegment::Index(index), Value::Array(items)) => items.get_mut(*index),
                (segment, Value::Object(map)) => map.get_mut(&segment.as_key()),
                _ => None,
            };
            let Some(next) = next else {
                return;
            };
            current = next;
        }

        match (last, current) {
            (PathSegment::Index(index), Value::Array(items)) => {
                if *index < items.len() {
                    items.remove(*index);
                }
            }
            (segment, Value::Object(map)) => {
                map.remove(&segment.as_key());
            }
            _ => {}
        }
    }
}

fn child_or_insert<'a>(
    current: &'a mut Value,
    segment: &PathSegment,
    next_is_index: bool,
) -> Option<&'a mut Value> {
    let empty = || {
        if next_is_index {
            Value::Array(Vec::new())
        } else {
            Value::Object(serde_json::Map::new())
        }
    };

    match (segment, current) {
        (PathSegment::Index(index), Value::Array(items)) => {
            if *index >= items.len() {
                items.resize(*index + 1, Value::Null);
            }
            let item = &mut items[*index];
            if item.is_null() {
                *item = empty();
            }
            Some(item)
        }
        (segment, Value::Object(map)) => {
            let child = map.entry(segment.as_key()).or_insert_with(empty);
            if child.is_null() {
                *child = empty();
            }
            Some(child)
        }
        _ => None,
    }
}

impl From<&str> for Path {
    fn from(value: &str) -> Self {
        Path::parse(value)
    }
}

impl Display for Path {
    /// Formats the path as `a.b[2].c`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Field(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Field(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

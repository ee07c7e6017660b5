//! URL path templates: compilation, anchored matching, and path building.
//!
//! Templates use `{name}` for variable segments. A variable always occupies a
//! whole segment, so a captured value never contains a `/`. Templates without
//! variables are matched by plain string equality.

use regex::Regex;

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Errors from compiling a template or building a path from it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path template is empty")]
    Empty,
    #[error("unbalanced braces in path template: {template}")]
    UnbalancedBraces { template: String },
    #[error("empty variable name in path template: {template}")]
    EmptyVariable { template: String },
    #[error("duplicate variable `{name}` in path template: {template}")]
    DuplicateVariable { name: String, template: String },
    #[error("variable must occupy a whole segment, found `{segment}`")]
    PartialSegment { segment: String },
    #[error("missing value for path variable `{name}`")]
    MissingValue { name: String },
    #[error("invalid value for path variable `{name}`: {value:?}")]
    InvalidValue { name: String, value: String },
}

// ---------------------------------------------------------------------------
// PathValues
// ---------------------------------------------------------------------------

/// Ordered mapping of variable name to segment value.
///
/// Produced by [`PathTemplate::matches`] in template order and consumed by
/// [`PathTemplate::build`]. Names are unique; inserting an existing name
/// replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathValues {
    entries: Vec<(String, String)>,
}

impl PathValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to `value`, keeping the original position of `name`.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PathValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (k, v) in iter {
            values.insert(k, v);
        }
        values
    }
}

// ---------------------------------------------------------------------------
// PathTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A compiled URL path template.
#[derive(Debug, Clone)]
pub struct PathTemplate {
    template: String,
    segments: Vec<Segment>,
    variables: Vec<String>,
    /// Anchored matcher; `None` for static templates.
    regex: Option<Regex>,
}

impl PathTemplate {
    /// Compiles `template` into a matcher.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] for empty templates, unbalanced braces, empty
    /// or duplicate variable names, and variables sharing a segment with
    /// literal text.
    pub fn compile(template: &str) -> Result<Self, PathError> {
        if template.is_empty() {
            return Err(PathError::Empty);
        }
        check_braces(template)?;

        let mut segments = Vec::new();
        let mut variables: Vec<String> = Vec::new();
        for raw in template.split(SEPARATOR) {
            let segment = parse_segment(template, raw)?;
            if let Segment::Variable(name) = &segment {
                if variables.contains(name) {
                    return Err(PathError::DuplicateVariable {
                        name: name.clone(),
                        template: template.to_string(),
                    });
                }
                variables.push(name.clone());
            }
            segments.push(segment);
        }

        let regex = if variables.is_empty() {
            None
        } else {
            let body: Vec<String> = segments
                .iter()
                .map(|s| match s {
                    Segment::Literal(lit) => regex::escape(lit),
                    Segment::Variable(_) => "([^/]+)".to_string(),
                })
                .collect();
            let pattern = format!("^{}$", body.join("/"));
            // Every piece is escaped or a fixed group, so this cannot fail.
            Some(Regex::new(&pattern).map_err(|_| PathError::UnbalancedBraces {
                template: template.to_string(),
            })?)
        };

        Ok(Self {
            template: template.to_string(),
            segments,
            variables,
            regex,
        })
    }

    /// Returns the template text this matcher was compiled from.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// `true` when the template has no variable segments.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.regex.is_none()
    }

    /// Variable names in template order.
    #[must_use]
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Number of literal characters, used to rank overlapping templates.
    #[must_use]
    pub fn static_char_count(&self) -> usize {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.len(),
                Segment::Variable(_) => 0,
            })
            .sum()
    }

    /// Matches the whole of `candidate` against this template.
    ///
    /// Returns the captured variable values in template order, or `None` when
    /// the path does not match. Matching is case-sensitive.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> Option<PathValues> {
        let Some(regex) = &self.regex else {
            return (candidate == self.template).then(PathValues::new);
        };
        let captures = regex.captures(candidate)?;
        let values = self
            .variables
            .iter()
            .zip(captures.iter().skip(1))
            .filter_map(|(name, m)| m.map(|m| (name.clone(), m.as_str().to_string())))
            .collect();
        Some(values)
    }

    /// Builds a concrete path by substituting every variable from `values`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError::MissingValue`] when a variable has no value and
    /// [`PathError::InvalidValue`] when a value is empty or contains `/`.
    pub fn build(&self, values: &PathValues) -> Result<String, PathError> {
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => parts.push(lit.as_str()),
                Segment::Variable(name) => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| PathError::MissingValue { name: name.clone() })?;
                    if value.is_empty() || value.contains(SEPARATOR) {
                        return Err(PathError::InvalidValue {
                            name: name.clone(),
                            value: value.to_string(),
                        });
                    }
                    parts.push(value);
                }
            }
        }
        Ok(parts.join("/"))
    }
}

fn check_braces(template: &str) -> Result<(), PathError> {
    let mut open = false;
    for c in template.chars() {
        match c {
            '{' if open => return Err(unbalanced(template)),
            '{' => open = true,
            '}' if !open => return Err(unbalanced(template)),
            '}' => open = false,
            '/' if open => return Err(unbalanced(template)),
            _ => {}
        }
    }
    if open {
        return Err(unbalanced(template));
    }
    Ok(())
}

fn unbalanced(template: &str) -> PathError {
    PathError::UnbalancedBraces {
        template: template.to_string(),
    }
}

fn parse_segment(template: &str, raw: &str) -> Result<Segment, PathError> {
    if !raw.contains('{') {
        return Ok(Segment::Literal(raw.to_string()));
    }
    let inner = raw
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .filter(|s| !s.contains('{') && !s.contains('}'))
        .ok_or_else(|| PathError::PartialSegment {
            segment: raw.to_string(),
        })?;
    let name = inner.trim();
    if name.is_empty() {
        return Err(PathError::EmptyVariable {
            template: template.to_string(),
        });
    }
    Ok(Segment::Variable(name.to_string()))
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Joins a service base path and an operation path into `/base/op/` form.
///
/// Runs of two or more separators collapse into one, and the result always
/// begins and ends with a separator: `concat_path("/a/", "/b") == "/a/b/"`.
#[must_use]
pub fn concat_path(base: &str, operation: &str) -> String {
    collapse_separators(&format!("/{base}/{operation}/"))
}

/// Normalizes an inbound request path with the same rule as [`concat_path`].
#[must_use]
pub fn normalize_path(path: &str) -> String {
    collapse_separators(&format!("/{path}/"))
}

fn collapse_separators(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if c == SEPARATOR && out.ends_with(SEPARATOR) {
            continue;
        }
        out.push(c);
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

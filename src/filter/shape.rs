//! Request shaping: break an HTTP request line (`METHOD /path?query
//! HTTP/1.x`, or a bare path) into method, path, protocol and query parts,
//! match the path against the operator's `:param` patterns and derive the
//! normalized shape fields. Every produced field is prefixed with the source
//! field name, itself behind the optional shape prefix.

use event::Event;
use filter::{Filter, FilterError};
use serde_json::Value;
use std::collections::BTreeMap;
use url::form_urlencoded;

/// How query parameters are expanded into fields.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryMode {
    /// Only the listed keys become fields.
    Whitelist(Vec<String>),
    All,
}

/// One `/literal/:param/...` path pattern. Patterns are compared in
/// configuration order and the first match wins.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Pattern {
    pub fn compile(raw: &str) -> Pattern {
        let segments = raw
            .split('/')
            .map(|seg| {
                if let Some(name) = seg.strip_prefix(':') {
                    Segment::Param(name.to_string())
                } else {
                    Segment::Literal(seg.to_string())
                }
            })
            .collect();
        Pattern {
            raw: raw.to_string(),
            segments: segments,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Match a concrete path, yielding the bound parameters. A `:param`
    /// matches exactly one `/`-delimited segment.
    fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let got: Vec<&str> = path.split('/').collect();
        if got.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (seg, have) in self.segments.iter().zip(got) {
            match *seg {
                Segment::Literal(ref lit) => {
                    if lit != have {
                        return None;
                    }
                }
                Segment::Param(ref name) => params.push((name.clone(), have.to_string())),
            }
        }
        Some(params)
    }
}

pub struct RequestShaper {
    prefix: String,
    fields: Vec<String>,
    patterns: Vec<Pattern>,
    query_mode: QueryMode,
}

impl RequestShaper {
    pub fn new(
        prefix: Option<&str>,
        fields: Vec<String>,
        patterns: Vec<Pattern>,
        query_mode: QueryMode,
    ) -> RequestShaper {
        let prefix = match prefix {
            Some(p) if !p.is_empty() => format!("{}_", p),
            _ => String::new(),
        };
        RequestShaper {
            prefix: prefix,
            fields: fields,
            patterns: patterns,
            query_mode: query_mode,
        }
    }

    fn shape_field(&self, field: &str, event: &mut Event) -> Result<(), FilterError> {
        let raw = match event.data.get(field) {
            Some(&Value::String(ref s)) => s.clone(),
            Some(_) => return Err(FilterError::NotAString(field.to_string())),
            None => return Ok(()),
        };
        let key = |suffix: &str| format!("{}{}_{}", self.prefix, field, suffix);

        // METHOD /path HTTP/1.x or a bare path
        let parts: Vec<&str> = raw.split(' ').collect();
        let uri = if parts.len() == 3 {
            event
                .data
                .insert(key("method"), Value::String(parts[0].to_string()));
            event
                .data
                .insert(key("protocol_version"), Value::String(parts[2].to_string()));
            parts[1]
        } else {
            parts[0]
        };

        let mut split = uri.splitn(2, '?');
        let path = split.next().unwrap_or("");
        let query = split.next();

        event.data.insert(key("uri"), Value::String(uri.to_string()));
        event
            .data
            .insert(key("path"), Value::String(path.to_string()));

        let mut query_shape = String::new();
        if let Some(query) = query {
            event
                .data
                .insert(key("query"), Value::String(query.to_string()));

            let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
            let mut occurrences: Vec<String> = Vec::new();
            for (k, v) in form_urlencoded::parse(query.as_bytes()) {
                grouped
                    .entry(k.clone().into_owned())
                    .or_insert_with(Vec::new)
                    .push(v.into_owned());
                occurrences.push(k.into_owned());
            }
            for (k, mut vs) in grouped {
                let wanted = match self.query_mode {
                    QueryMode::All => true,
                    QueryMode::Whitelist(ref keys) => keys.iter().any(|w| *w == k),
                };
                if wanted {
                    if vs.len() > 1 {
                        vs.sort();
                    }
                    event.data.insert(
                        key(&format!("query_{}", k)),
                        Value::String(vs.join(", ")),
                    );
                }
            }
            // shape keeps one entry per occurrence, keys sorted, values
            // replaced with a placeholder
            occurrences.sort();
            query_shape = occurrences
                .iter()
                .map(|k| format!("{}=?", k))
                .collect::<Vec<String>>()
                .join("&");
        }

        let mut path_shape = path.to_string();
        for pattern in &self.patterns {
            if let Some(params) = pattern.matches(path) {
                for (name, val) in params {
                    event
                        .data
                        .insert(key(&format!("path_{}", name)), Value::String(val));
                }
                path_shape = pattern.raw().to_string();
                break;
            }
        }
        event
            .data
            .insert(key("pathshape"), Value::String(path_shape.clone()));
        let shape = if query_shape.is_empty() {
            path_shape
        } else {
            event
                .data
                .insert(key("queryshape"), Value::String(query_shape.clone()));
            format!("{}?{}", path_shape, query_shape)
        };
        event.data.insert(key("shape"), Value::String(shape));
        Ok(())
    }
}

impl Filter for RequestShaper {
    fn name(&self) -> &'static str {
        "request_shape"
    }

    fn process(&self, event: &mut Event) -> Result<(), FilterError> {
        for field in &self.fields {
            self.shape_field(field, event)?;
        }
        Ok(())
    }
}

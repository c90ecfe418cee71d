//! Prometheus text exposition parsing for the `prometheus` fetch type.
//!
//! Produces a JSON object keyed by family name:
//!
//! ```text
//! { "up": { "name": "up", "help": "...", "type": "gauge",
//!           "metrics": [ { "labels": {"job": "x"}, "value": "1" } ] } }
//! ```
//!
//! Summaries and histograms group their `_sum`, `_count`, `quantile` and
//! `le` samples into one metric per label set. Values stay strings so
//! `NaN` and `+Inf` survive.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpositionError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },
}

#[derive(Debug, Default)]
struct Family {
    help: String,
    kind: String,
    /// Label set (without `le` / `quantile`) → metric object.
    metrics: Vec<(BTreeMap<String, String>, Map<String, Value>)>,
}

impl Family {
    fn metric_mut(&mut self, labels: BTreeMap<String, String>) -> &mut Map<String, Value> {
        let index = match self.metrics.iter().position(|(l, _)| *l == labels) {
            Some(index) => index,
            None => {
                let mut metric = Map::new();
                metric.insert("labels".to_string(), json!(labels));
                self.metrics.push((labels, metric));
                self.metrics.len() - 1
            }
        };
        &mut self.metrics[index].1
    }
}

struct Sample {
    name: String,
    labels: BTreeMap<String, String>,
    value: String,
}

/// Parse a scrape body.
pub fn parse(text: &str) -> Result<Value, ExpositionError> {
    let mut families: BTreeMap<String, Family> = BTreeMap::new();

    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment.trim_start().splitn(3, ' ');
            match (parts.next(), parts.next(), parts.next()) {
                (Some("HELP"), Some(name), help) => {
                    families.entry(name.to_string()).or_default().help = help.unwrap_or_default().to_string();
                }
                (Some("TYPE"), Some(name), Some(kind)) => {
                    families.entry(name.to_string()).or_default().kind = kind.trim().to_string();
                }
                _ => {}
            }
            continue;
        }

        let sample = parse_sample(line).map_err(|reason| ExpositionError::Malformed {
            line: index + 1,
            reason,
        })?;
        add_sample(&mut families, sample);
    }

    let out: Map<String, Value> = families
        .into_iter()
        .map(|(name, family)| {
            let kind = if family.kind.is_empty() { "untyped".to_string() } else { family.kind };
            let metrics: Vec<Value> = family.metrics.into_iter().map(|(_, m)| Value::Object(m)).collect();
            let value = json!({
                "name": name,
                "help": family.help,
                "type": kind,
                "metrics": metrics,
            });
            (name, value)
        })
        .collect();

    Ok(Value::Object(out))
}

fn add_sample(families: &mut BTreeMap<String, Family>, mut sample: Sample) {
    for suffix in ["_bucket", "_sum", "_count"] {
        let Some(base) = sample.name.strip_suffix(suffix) else {
            continue;
        };
        let Some(family) = families.get_mut(base) else {
            continue;
        };
        let (group_label, group_key) = match family.kind.as_str() {
            "histogram" => ("le", "buckets"),
            "summary" => ("quantile", "quantiles"),
            _ => continue,
        };

        let field = &suffix[1..];
        if field == "bucket" {
            let bound = sample.labels.remove(group_label).unwrap_or_default();
            let metric = family.metric_mut(sample.labels);
            insert_grouped(metric, group_key, bound, sample.value);
        } else {
            family
                .metric_mut(sample.labels)
                .insert(field.to_string(), Value::String(sample.value));
        }
        return;
    }

    let family = families.entry(sample.name.clone()).or_default();
    if family.kind == "summary" {
        if let Some(quantile) = sample.labels.remove("quantile") {
            let metric = family.metric_mut(sample.labels);
            insert_grouped(metric, "quantiles", quantile, sample.value);
            return;
        }
    }
    family
        .metric_mut(sample.labels)
        .insert("value".to_string(), Value::String(sample.value));
}

fn insert_grouped(metric: &mut Map<String, Value>, key: &str, bound: String, value: String) {
    let group = metric
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(map) = group {
        map.insert(bound, Value::String(value));
    }
}

fn parse_sample(line: &str) -> Result<Sample, String> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| "missing value".to_string())?;
    let name = line[..name_end].to_string();
    if name.is_empty() {
        return Err("missing metric name".to_string());
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if rest.starts_with('{') {
        let (parsed, after) = parse_labels(&rest[1..])?;
        labels = parsed;
        rest = after;
    }

    let value = rest
        .split_whitespace()
        .next()
        .ok_or_else(|| format!("missing value for {name}"))?
        .to_string();

    Ok(Sample { name, labels, value })
}

/// Parse `a="b",c="d"}` and return the remainder after `}`.
fn parse_labels(input: &str) -> Result<(BTreeMap<String, String>, &str), String> {
    let mut labels = BTreeMap::new();
    let mut chars = input.char_indices().peekable();

    loop {
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(&(start, c)) = chars.peek() else {
            return Err("unterminated label set".to_string());
        };
        if c == '}' {
            return Ok((labels, &input[start + 1..]));
        }

        let mut key = String::new();
        for (_, c) in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }
        if chars.next().map(|(_, c)| c) != Some('"') {
            return Err(format!("label {key} value must be quoted"));
        }

        let mut value = String::new();
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            match c {
                '\\' => match chars.next().map(|(_, c)| c) {
                    Some('n') => value.push('\n'),
                    Some(other) => value.push(other),
                    None => break,
                },
                '"' => {
                    closed = true;
                    break;
                }
                other => value.push(other),
            }
        }
        if !closed {
            return Err(format!("label {key} value is not closed"));
        }
        labels.insert(key.trim().to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRAPE: &str = r#"
# HELP up Whether the target is up.
# TYPE up gauge
up{job="node",instance="a:9100"} 1
up{job="node",instance="b:9100"} 0
# HELP rpc_seconds RPC latency.
# TYPE rpc_seconds summary
rpc_seconds{quantile="0.5"} 0.2
rpc_seconds{quantile="0.9"} 0.7
rpc_seconds_sum 12.5
rpc_seconds_count 40
# TYPE req_bytes histogram
req_bytes_bucket{le="100"} 3
req_bytes_bucket{le="+Inf"} 5
req_bytes_sum 420
req_bytes_count 5
orphan 7 1700000000000
"#;

    #[test]
    fn parses_gauge_family() {
        let parsed = parse(SCRAPE).unwrap();
        let up = &parsed["up"];
        assert_eq!(up["type"], "gauge");
        assert_eq!(up["help"], "Whether the target is up.");
        assert_eq!(up["metrics"].as_array().unwrap().len(), 2);
        assert_eq!(up["metrics"][0]["labels"]["instance"], "a:9100");
        assert_eq!(up["metrics"][1]["value"], "0");
    }

    #[test]
    fn groups_summary_and_histogram() {
        let parsed = parse(SCRAPE).unwrap();

        let rpc = &parsed["rpc_seconds"]["metrics"][0];
        assert_eq!(rpc["quantiles"]["0.9"], "0.7");
        assert_eq!(rpc["sum"], "12.5");
        assert_eq!(rpc["count"], "40");

        let req = &parsed["req_bytes"]["metrics"][0];
        assert_eq!(req["buckets"]["+Inf"], "5");
        assert_eq!(req["count"], "5");
        assert!(parsed.get("req_bytes_bucket").is_none());
    }

    #[test]
    fn untyped_samples_and_escapes() {
        let parsed = parse("orphan 7 1700000000000\nlabelled{path=\"a\\\"b\"} 2\n").unwrap();
        assert_eq!(parsed["orphan"]["type"], "untyped");
        assert_eq!(parsed["orphan"]["metrics"][0]["value"], "7");
        assert_eq!(parsed["labelled"]["metrics"][0]["labels"]["path"], "a\"b");
    }

    #[test]
    fn malformed_line_reports_position() {
        let err = parse("ok 1\nbroken{a=b} 1\n").unwrap_err();
        assert!(matches!(err, ExpositionError::Malformed { line: 2, .. }));
    }
}

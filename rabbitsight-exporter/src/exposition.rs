//! Prometheus text exposition format (0.0.4).

use std::collections::{BTreeMap, HashSet};
use std::io::Write;

use rabbitsight_common::MetricSample;
use tracing::debug;

/// Content type of the rendered output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render samples grouped by family, families sorted by name.
///
/// Within a family, samples keep the order they were collected in. A second
/// sample with the same name and label values is dropped.
pub fn render(samples: &[MetricSample]) -> String {
    let mut families: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
    for sample in samples {
        families.entry(sample.name()).or_default().push(sample);
    }

    let mut output = Vec::with_capacity(samples.len() * 100);

    for (name, series) in families {
        let first = series[0];
        writeln!(output, "# HELP {} {}", name, escape_help(first.help())).ok();
        writeln!(output, "# TYPE {} {}", name, first.kind().as_str()).ok();

        let mut seen = HashSet::with_capacity(series.len());
        for sample in series {
            let labels = format_labels(sample);
            if !seen.insert(labels.clone()) {
                debug!(metric = name, labels = %labels, "Dropping duplicate sample");
                continue;
            }
            writeln!(output, "{}{} {}", name, labels, format_value(sample.value())).ok();
        }
    }

    String::from_utf8(output).unwrap_or_default()
}

fn format_labels(sample: &MetricSample) -> String {
    let parts: Vec<String> = sample
        .labels()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect();

    if parts.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", parts.join(","))
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

/// Escape special characters in label values.
fn escape_label_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '"' => result.push_str("\\\""),
            '\n' => result.push_str("\\n"),
            _ => result.push(c),
        }
    }
    result
}

/// Format a floating point value for Prometheus.
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{:.0}", value)
    } else {
        format!("{}", value)
    }
}

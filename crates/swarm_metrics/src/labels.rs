use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Unique identity of a metric series: name plus canonical labels.
///
/// Labels are stored in a `BTreeMap`, so two label sets with the same
/// key-value pairs always compare and hash equal regardless of the order
/// they were supplied in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    pub fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_owned(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
        }
    }

    pub fn no_labels(name: &str) -> Self {
        Self::new(name, &[])
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)?;
        if !self.labels.is_empty() {
            f.write_str("{")?;
            for (i, (k, v)) in self.labels.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{k}={v:?}")?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_order_does_not_matter() {
        let a = SeriesKey::new("http_requests_total", &[("label", "home"), ("status", "2xx")]);
        let b = SeriesKey::new("http_requests_total", &[("status", "2xx"), ("label", "home")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_display() {
        let k = SeriesKey::new("x", &[("b", "2"), ("a", "1")]);
        assert_eq!(k.to_string(), "x{a=\"1\",b=\"2\"}");
    }
}

use serde::Serialize;
use serde_json::Value;

/// A structured key/value pair attached to a log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribute {
    pub key: String,
    pub value: Value,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, Value::String(value.into()))
    }

    pub fn error(err: &dyn std::error::Error) -> Self {
        Self::string("error.message", err.to_string())
    }
}

/// Renders a list of attributes as a single JSON object, later keys winning.
pub fn render(attrs: &[Attribute]) -> String {
    let mut map = serde_json::Map::with_capacity(attrs.len());
    for attr in attrs {
        map.insert(attr.key.clone(), attr.value.clone());
    }
    Value::Object(map).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_merges_duplicate_keys() {
        let out = render(&[
            Attribute::string("a", "1"),
            Attribute::new("b", 2),
            Attribute::string("a", "3"),
        ]);
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["a"], "3");
        assert_eq!(v["b"], 2);
    }
}

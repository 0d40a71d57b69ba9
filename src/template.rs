//! Request templating.
//!
//! URLs, query parameters, shell arguments and JSON bodies may contain
//! placeholders:
//!
//! - `{set_specification}`, `{since}`, `{identity}`
//! - `{$.path}`: a JSON path resolved against the document or seed
//!
//! Unknown placeholders are left untouched so literal braces survive.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::Value;

use harvester_core::json_path::JsonPath;

#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateContext<'a> {
    pub set_specification: &'a str,
    pub since: &'a str,
    pub identity: Option<&'a str>,
    pub properties: Option<&'a Value>,
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.first().map(scalar_text).unwrap_or_default(),
        other => other.to_string(),
    }
}

impl TemplateContext<'_> {
    fn lookup(&self, name: &str) -> Result<Option<String>> {
        Ok(match name {
            "set_specification" => Some(self.set_specification.to_string()),
            "since" => Some(self.since.to_string()),
            "identity" => self.identity.map(str::to_string),
            path if path.starts_with('$') => {
                let path = JsonPath::parse(path)?;
                Some(
                    self.properties
                        .map(|p| scalar_text(&path.resolve(p)))
                        .unwrap_or_default(),
                )
            }
            _ => None,
        })
    }

    /// Substitute every known placeholder in `template`.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            out.push_str(&rest[..start]);
            let name = &rest[start + 1..start + len];
            match self.lookup(name)? {
                Some(value) => out.push_str(&value),
                None => out.push_str(&rest[start..=start + len]),
            }
            rest = &rest[start + len + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Render every value of a parameter map, dropping parameters that
    /// rendered empty.
    pub fn render_params(&self, params: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        let mut rendered = BTreeMap::new();
        for (key, template) in params {
            let value = self.render(template)?;
            if !value.is_empty() {
                rendered.insert(key.clone(), value);
            }
        }
        Ok(rendered)
    }

    pub fn render_args(&self, args: &[String]) -> Result<Vec<String>> {
        args.iter().map(|a| self.render(a)).collect()
    }

    /// Render the strings inside a JSON body. A string that is exactly one
    /// `{$.path}` placeholder is replaced by the resolved JSON value.
    pub fn render_value(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::String(s) => {
                let whole = s
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                    .filter(|inner| inner.starts_with('$') && !inner.contains('}'));
                match (whole, self.properties) {
                    (Some(path), Some(properties)) => JsonPath::parse(path)?.resolve(properties),
                    _ => Value::String(self.render(s)?),
                }
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in map {
                    rendered.insert(k.clone(), self.render_value(v)?);
                }
                Value::Object(rendered)
            }
            other => other.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn renders_named_and_path_placeholders() {
        let props = json!({"url": "https://example.com/1", "ids": [7, 8]});
        let ctx = TemplateContext {
            set_specification: "edurep",
            since: "2024-01-01T00:00:00Z",
            identity: Some("abc"),
            properties: Some(&props),
        };
        assert_eq!(
            ctx.render("https://x.org/{set_specification}?from={since}&id={identity}").unwrap(),
            "https://x.org/edurep?from=2024-01-01T00:00:00Z&id=abc"
        );
        assert_eq!(ctx.render("{$.url}").unwrap(), "https://example.com/1");
        assert_eq!(ctx.render("n={$.ids}").unwrap(), "n=7");
        assert_eq!(ctx.render("{unknown} {").unwrap(), "{unknown} {");
    }

    #[test]
    fn empty_params_are_dropped() {
        let ctx = TemplateContext::default();
        let mut params = BTreeMap::new();
        params.insert("from".to_string(), "{since}".to_string());
        params.insert("set".to_string(), "all".to_string());
        let rendered = ctx.render_params(&params).unwrap();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered["set"], "all");
    }

    #[test]
    fn whole_path_strings_keep_json_type() {
        let props = json!({"ids": [1, 2]});
        let ctx = TemplateContext {
            properties: Some(&props),
            ..Default::default()
        };
        let body = ctx
            .render_value(&json!({"ids": "{$.ids}", "label": "id {$.ids}"}))
            .unwrap();
        assert_eq!(body, json!({"ids": [1, 2], "label": "id 1"}));
    }
}

//! OAI-PMH extractor.
//!
//! Pages arrive as XML and are converted to JSON by the resource cache, so
//! `<header status="deleted">` becomes `header.@status` and Dublin Core
//! elements keep their prefix (`dc:title`). The default objective reads
//! `ListRecords` responses in `oai_dc` format; deleted headers become seeds
//! with `state = "deleted"`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use harvester_core::json_path::JsonPath;
use harvester_core::objective::{ExtractError, Extractor, Objective};

use super::{parse_timestamp, Source};
use crate::config::PhaseConfig;

pub struct OaiPmhSource;

/// Text content of an XML-derived value: strings, `#text` members and
/// arrays of either.
fn texts(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Value::Object(map) => map.get("#text").map(texts).unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(texts).collect(),
        _ => Vec::new(),
    }
}

/// The metadata record of an element, whatever its format prefix.
fn metadata_record(element: &Value) -> Option<&Map<String, Value>> {
    element
        .get("metadata")?
        .as_object()?
        .values()
        .find_map(Value::as_object)
}

fn dc_texts(element: &Value, name: &str) -> Vec<String> {
    metadata_record(element)
        .and_then(|record| record.get(&format!("dc:{}", name)))
        .map(texts)
        .unwrap_or_default()
}

fn first_dc(name: &'static str) -> Extractor {
    Extractor::func(move |_, element| {
        Ok(dc_texts(element, name)
            .into_iter()
            .next()
            .map(Value::String)
            .unwrap_or(Value::Null))
    })
}

fn all_dc(name: &'static str) -> Extractor {
    Extractor::func(move |_, element| {
        Ok(Value::Array(
            dc_texts(element, name).into_iter().map(Value::String).collect(),
        ))
    })
}

fn path(raw: &str) -> Result<Extractor, ExtractError> {
    Ok(Extractor::Path(JsonPath::parse(raw)?))
}

/// The `resumptionToken` of a list response, when another page follows.
pub fn resumption_token(page: &Value) -> Option<String> {
    page.get("OAI-PMH")?
        .as_object()?
        .values()
        .filter_map(|verb| verb.get("resumptionToken"))
        .flat_map(texts)
        .next()
}

impl OaiPmhSource {
    fn objective() -> Result<Objective, ExtractError> {
        Ok(Objective::new()
            .with_iterator(JsonPath::parse("$.OAI-PMH.ListRecords.record")?)
            .field("external_id", path("$.header.identifier")?)
            .field(
                "state",
                Extractor::func(|_, element| {
                    let status = element
                        .get("header")
                        .and_then(|h| h.get("@status"))
                        .and_then(Value::as_str);
                    Ok(Value::String(
                        if status == Some("deleted") { "deleted" } else { "active" }.to_string(),
                    ))
                }),
            )
            .field("datestamp", path("$.header.datestamp")?)
            .field("set_specs", path("$.header.setSpec")?)
            .field("title", first_dc("title"))
            .field("description", first_dc("description"))
            .field("language", first_dc("language"))
            .field("publisher", first_dc("publisher"))
            .field("format", first_dc("format"))
            .field("copyright", first_dc("rights"))
            .field("keywords", all_dc("subject"))
            .field("authors", all_dc("creator"))
            .field(
                "url",
                Extractor::func(|_, element| {
                    Ok(dc_texts(element, "identifier")
                        .into_iter()
                        .find(|id| id.starts_with("http://") || id.starts_with("https://"))
                        .map(Value::String)
                        .unwrap_or(Value::Null))
                }),
            ))
    }
}

impl Source for OaiPmhSource {
    fn name(&self) -> &str {
        "oai_pmh"
    }

    fn description(&self) -> &str {
        "OAI-PMH ListRecords feeds in Dublin Core"
    }

    fn default_objective(&self) -> Objective {
        // The built-in paths are constant and known to parse.
        Self::objective().unwrap_or_default()
    }

    fn callback(&self, name: &str) -> Option<Extractor> {
        match name {
            // Every Dublin Core element, prefix stripped, as a list of texts.
            "dublin_core" => Some(Extractor::func(|page, seed| {
                let Some(id) = seed.get("external_id").and_then(Value::as_str) else {
                    return Ok(Value::Null);
                };
                let records = JsonPath::parse("$.OAI-PMH.ListRecords.record")?.resolve(page);
                let records = match &records {
                    Value::Array(items) => items.iter().collect::<Vec<_>>(),
                    other => vec![other],
                };
                let Some(element) = records.into_iter().find(|r| {
                    r.get("header")
                        .and_then(|h| h.get("identifier"))
                        .and_then(Value::as_str)
                        == Some(id)
                }) else {
                    return Ok(Value::Null);
                };
                let mut fields = Map::new();
                if let Some(record) = metadata_record(element) {
                    for (key, value) in record {
                        if let Some(name) = key.strip_prefix("dc:") {
                            fields.insert(
                                format!("dc_{}", name),
                                Value::Array(texts(value).into_iter().map(Value::String).collect()),
                            );
                        }
                    }
                }
                Ok(Value::Object(fields))
            })),
            _ => None,
        }
    }

    fn check_page(&self, page: &Value) -> Result<()> {
        let Some(error) = page.get("OAI-PMH").and_then(|root| root.get("error")) else {
            return Ok(());
        };
        let code = error.get("@code").and_then(Value::as_str).unwrap_or("");
        if code == "noRecordsMatch" {
            return Ok(());
        }
        bail!(
            "OAI-PMH error {}: {}",
            if code.is_empty() { "unknown" } else { code },
            texts(error).join(" ")
        )
    }

    fn harvested_at(&self, phase: &PhaseConfig, page: &Value) -> Result<Option<DateTime<Utc>>> {
        if let Some(path) = &phase.contribute_data.harvested_at {
            let value = JsonPath::parse(path)?.resolve(page);
            return Ok(value.as_str().and_then(parse_timestamp));
        }
        Ok(page
            .get("OAI-PMH")
            .and_then(|root| root.get("responseDate"))
            .and_then(Value::as_str)
            .and_then(parse_timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::sources::extract_seeds;
    use crate::sources::xml::xml_to_value;
    use serde_json::json;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH>
  <responseDate>2024-02-01T10:00:00Z</responseDate>
  <ListRecords>
    <record>
      <header><identifier>oai:1</identifier><datestamp>2024-01-30</datestamp></header>
      <metadata>
        <oai_dc:dc>
          <dc:title>Fractions</dc:title>
          <dc:identifier>urn:isbn:123</dc:identifier>
          <dc:identifier>https://example.com/1</dc:identifier>
          <dc:subject>math</dc:subject>
          <dc:subject>primary</dc:subject>
          <dc:language>nl</dc:language>
        </oai_dc:dc>
      </metadata>
    </record>
    <record>
      <header status="deleted"><identifier>oai:2</identifier></header>
    </record>
    <resumptionToken>next-1</resumptionToken>
  </ListRecords>
</OAI-PMH>"#;

    fn phase(callback: Option<&str>) -> PhaseConfig {
        let config = parse_config(
            r#"
[db]
path = "/tmp/x.sqlite"
[resources.http]
type = "http"
[sources.edurep]
extractor = "oai_pmh"
[sources.edurep.entities.products]
set_specification = "all"
[[sources.edurep.entities.products.phases]]
phase = "records"
strategy = "initial"
retrieve_data = { resource = "http", url = "https://example.org/oai?verb=ListRecords" }
[entities.products]
identifier = "external_id"
"#,
        )
        .unwrap();
        let mut phase = config.sources["edurep"].entities["products"].phases[0].clone();
        phase.contribute_data.callback = callback.map(str::to_string);
        phase
    }

    #[test]
    fn extracts_dublin_core_and_deletes() {
        let page = xml_to_value(PAGE).unwrap();
        let seeds: Vec<_> = extract_seeds(&OaiPmhSource, &phase(None), &page)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(seeds.len(), 2);
        let first = &seeds[0].properties;
        assert_eq!(first["external_id"], json!("oai:1"));
        assert_eq!(first["title"], json!("Fractions"));
        assert_eq!(first["url"], json!("https://example.com/1"));
        assert_eq!(first["keywords"], json!(["math", "primary"]));
        assert_eq!(seeds[0].language().as_deref(), Some("nl"));
        assert!(!seeds[0].is_deleted());
        assert!(seeds[1].is_deleted());
        assert_eq!(seeds[1].identity("external_id").as_deref(), Some("oai:2"));
    }

    #[test]
    fn reports_response_date_and_token() {
        let page = xml_to_value(PAGE).unwrap();
        let at = OaiPmhSource.harvested_at(&phase(None), &page).unwrap().unwrap();
        assert_eq!(at.to_rfc3339(), "2024-02-01T10:00:00+00:00");
        assert_eq!(resumption_token(&page).as_deref(), Some("next-1"));
    }

    #[test]
    fn dublin_core_callback_adds_all_elements() {
        let page = xml_to_value(PAGE).unwrap();
        let seeds = extract_seeds(&OaiPmhSource, &phase(Some("dublin_core")), &page).unwrap();
        let first = seeds[0].as_ref().unwrap();
        assert_eq!(
            first.properties["dc_identifier"],
            json!(["urn:isbn:123", "https://example.com/1"])
        );
    }

    #[test]
    fn no_records_match_is_an_empty_page() {
        let page = json!({"OAI-PMH": {"error": {"@code": "noRecordsMatch", "#text": "none"}}});
        assert!(extract_seeds(&OaiPmhSource, &phase(None), &page).unwrap().is_empty());
        let bad = json!({"OAI-PMH": {"error": {"@code": "badArgument", "#text": "nope"}}});
        let err = extract_seeds(&OaiPmhSource, &phase(None), &bad).unwrap_err();
        assert!(err.to_string().contains("badArgument"));
    }
}

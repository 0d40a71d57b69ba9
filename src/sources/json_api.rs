//! Generic JSON REST extractor, driven entirely by the phase objective.

use super::Source;

pub struct JsonApiSource;

impl Source for JsonApiSource {
    fn name(&self) -> &str {
        "json_api"
    }

    fn description(&self) -> &str {
        "JSON REST endpoints mapped by a configured objective"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::sources::{extract_seeds, next_page, PageRequest};
    use serde_json::json;
    use std::collections::BTreeMap;

    const CONFIG: &str = r#"
[db]
path = "/tmp/x.sqlite"
[resources.http]
type = "http"
[sources.sharekit]
extractor = "json_api"
[sources.sharekit.entities.products]
set_specification = "edusources"
[[sources.sharekit.entities.products.phases]]
phase = "records"
strategy = "initial"
retrieve_data = { resource = "http", url = "https://api.example.org/items", pagination = { type = "next_url", path = "$.links.next" } }
contribute_data = { harvested_at = "$.meta.generated", objective = { "@" = "$.data", external_id = "$.id", title = "$.attributes.title", state = "$.attributes.state", source = "~.meta.source" } }
[entities.products]
identifier = "external_id"
"#;

    #[test]
    fn extracts_with_configured_objective() {
        let config = parse_config(CONFIG).unwrap();
        let phase = &config.sources["sharekit"].entities["products"].phases[0];
        let page = json!({
            "meta": {"generated": "2024-05-01T08:00:00Z", "source": "sharekit"},
            "links": {"next": "https://api.example.org/items?page=2"},
            "data": [
                {"id": "a", "attributes": {"title": "One", "state": "active"}},
                {"id": 7, "attributes": {"title": "Two", "state": "deleted"}}
            ]
        });
        let seeds: Vec<_> = extract_seeds(&JsonApiSource, phase, &page)
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(seeds.len(), 2);
        assert_eq!(seeds[0].properties["title"], json!("One"));
        assert_eq!(seeds[0].properties["source"], json!("sharekit"));
        assert_eq!(seeds[1].identity("external_id").as_deref(), Some("7"));
        assert!(seeds[1].is_deleted());

        let at = JsonApiSource.harvested_at(phase, &page).unwrap().unwrap();
        assert_eq!(at.to_rfc3339(), "2024-05-01T08:00:00+00:00");

        let current = PageRequest {
            url: "https://api.example.org/items".into(),
            params: BTreeMap::new(),
            page_number: None,
        };
        let next = next_page(&phase.retrieve_data.pagination, &page, &current, 2)
            .unwrap()
            .unwrap();
        assert_eq!(next.url, "https://api.example.org/items?page=2");
    }
}

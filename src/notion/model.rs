use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::model::{Listing, RemotePage};

/// Envelope shared by every paginated Notion list endpoint.
#[derive(Deserialize, Debug)]
pub struct ListResp<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> From<ListResp<T>> for Listing<T> {
    fn from(resp: ListResp<T>) -> Self {
        Listing {
            results: resp.results,
            next_cursor: resp.next_cursor,
            has_more: resp.has_more,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct PageObject {
    pub id: String,
    pub last_edited_time: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub in_trash: bool,
    #[serde(default)]
    pub parent: Value,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

impl PageObject {
    /// Archived and trashed pages count as gone.
    pub fn into_remote_page(self, type_property: &str) -> Option<RemotePage> {
        if self.archived || self.in_trash {
            return None;
        }
        let title = page_title(&self.properties);
        let page_type = self
            .properties
            .get(type_property)
            .and_then(property_tag)
            .unwrap_or_else(|| parent_kind(&self.parent).to_string());
        Some(RemotePage {
            external_id: self.id,
            title,
            page_type,
            edited_at: self.last_edited_time,
        })
    }
}

fn plain_text(segments: &Value) -> String {
    segments
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|seg| seg.get("plain_text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Text of the page's `title`-typed property, whatever it is named.
pub fn page_title(properties: &Map<String, Value>) -> String {
    properties
        .values()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))
        .and_then(|p| p.get("title"))
        .map(plain_text)
        .unwrap_or_default()
}

fn property_tag(prop: &Value) -> Option<String> {
    let tag = match prop.get("type").and_then(Value::as_str)? {
        "select" | "status" => prop
            .get(prop["type"].as_str()?)
            .and_then(|v| v.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        "multi_select" => prop
            .get("multi_select")
            .and_then(Value::as_array)
            .and_then(|opts| opts.first())
            .and_then(|o| o.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
        "rich_text" => prop.get("rich_text").map(plain_text),
        _ => None,
    };
    tag.filter(|t| !t.trim().is_empty())
}

fn parent_kind(parent: &Value) -> &'static str {
    match parent.get("type").and_then(Value::as_str) {
        Some("database_id") => "database",
        Some("page_id") => "page",
        Some("block_id") => "block",
        _ => "workspace",
    }
}

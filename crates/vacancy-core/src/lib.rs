//! Core domain model for the vacancy harvester.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vacancy-core";

/// Collection the enriched vacancies are indexed into.
pub const VACANCY_INDEX: &str = "full_vacancies";

/// Short listing entry as it appears on a search results page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingSummary {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One page of search results from the remote listing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ListingPage {
    #[serde(default)]
    pub items: Vec<ListingSummary>,
    #[serde(default)]
    pub page: u32,
    #[serde(default, rename = "pages")]
    pub total_pages: u32,
    #[serde(default, rename = "found")]
    pub total_found: u64,
    #[serde(default)]
    pub per_page: u32,
}

/// Full vacancy record fetched by id. `description` is raw remote HTML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(from = "RawListingDetail")]
pub struct ListingDetail {
    pub id: String,
    pub name: String,
    pub description: String,
    pub key_skills: BTreeSet<String>,
}

#[derive(Deserialize)]
struct RawListingDetail {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    key_skills: Vec<RawKeySkill>,
}

#[derive(Deserialize)]
struct RawKeySkill {
    name: String,
}

impl From<RawListingDetail> for ListingDetail {
    fn from(raw: RawListingDetail) -> Self {
        Self {
            id: raw.id,
            name: raw.name,
            description: raw.description.unwrap_or_default(),
            key_skills: raw
                .key_skills
                .into_iter()
                .map(|skill| skill.name.trim().to_string())
                .filter(|name| !name.is_empty())
                .collect(),
        }
    }
}

/// Strips tag-like substrings (`<...>`) out of remote HTML.
#[derive(Debug, Clone)]
pub struct TagStripper {
    pattern: Regex,
}

impl Default for TagStripper {
    fn default() -> Self {
        Self::new()
    }
}

impl TagStripper {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(r"</?[^>]+>").expect("tag pattern is a valid regex"),
        }
    }

    pub fn strip(&self, html: &str) -> String {
        self.pattern.replace_all(html, "").into_owned()
    }
}

/// Sanitized vacancy as persisted in the document store.
///
/// Only obtainable from a [`ListingDetail`] passed through a [`TagStripper`],
/// so stored descriptions never carry markup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VacancyDocument {
    id: String,
    name: String,
    description: String,
    key_skills: Vec<String>,
}

impl VacancyDocument {
    pub fn from_detail(detail: ListingDetail, stripper: &TagStripper) -> Self {
        Self {
            description: stripper.strip(&detail.description),
            id: detail.id,
            name: detail.name,
            key_skills: detail.key_skills.into_iter().collect(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn key_skills(&self) -> &[String] {
        &self.key_skills
    }
}

/// What a failed request was fetching, which decides how a replay is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    Page,
    Detail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRequest {
    pub url: String,
    pub kind: RequestKind,
}

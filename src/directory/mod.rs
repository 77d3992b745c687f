//! Interpreter directory: roster types, the directory service seam, and the
//! availability-filtered candidate resolver.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interpreter {
    pub id: String,
    pub name: String,
    pub phone: String,
    /// Priority tier; lower tiers are dialed first.
    pub priority: u32,
    /// Declared availability per weekday (`mon`..`sun`), as `HH:MM-HH:MM`.
    /// A day with no window means unavailable that day.
    #[serde(default)]
    pub windows: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Language {
    pub id: String,
    pub name: String,
    /// Digit the caller presses to select this language.
    pub digit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessCode {
    pub id: String,
    pub code: String,
}

/// One dialable interpreter candidate. The fallback destination reuses this
/// shape with no interpreter id.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub interpreter_id: Option<String>,
    pub phone: String,
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Full interpreter roster for the owner of an inbound number.
    async fn interpreters(&self, called_number: &str) -> Result<Vec<Interpreter>>;
    async fn source_languages(&self, called_number: &str) -> Result<Vec<Language>>;
    async fn target_languages(&self, called_number: &str, source_id: &str)
        -> Result<Vec<Language>>;
    async fn verify_access_code(
        &self,
        called_number: &str,
        digits: &str,
    ) -> Result<Option<AccessCode>>;
    /// Display lookups used when writing history records.
    async fn language(&self, id: &str) -> Result<Option<Language>>;
    async fn interpreter(&self, id: &str) -> Result<Option<Interpreter>>;
}

/// Filters the roster to interpreters of `tier` whose declared window for
/// the current weekday covers `now`. Returns an empty set, never an error,
/// when nothing qualifies; escalation is the caller's concern. The result
/// is a simultaneous-dial set, so no ordering is promised.
pub fn find_candidates(roster: &[Interpreter], tier: u32, now: DateTime<Tz>) -> Vec<Candidate> {
    let day = weekday_key(now.weekday());
    let time = now.time();
    roster
        .iter()
        .filter(|i| i.priority == tier)
        .filter(|i| match i.windows.get(day) {
            Some(window) => window_covers(&i.id, window, time),
            None => false,
        })
        .map(|i| Candidate {
            interpreter_id: Some(i.id.clone()),
            phone: i.phone.clone(),
        })
        .collect()
}

fn weekday_key(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

fn window_covers(interpreter_id: &str, window: &str, time: NaiveTime) -> bool {
    let Some((start, end)) = parse_window(window) else {
        debug!(interpreter_id, window, "unparseable availability window, excluding");
        return false;
    };
    if start >= end {
        debug!(interpreter_id, window, "inverted availability window, excluding");
        return false;
    }
    start <= time && time < end
}

fn parse_window(window: &str) -> Option<(NaiveTime, NaiveTime)> {
    let (start, end) = window.split_once('-')?;
    let start = NaiveTime::parse_from_str(start.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end.trim(), "%H:%M").ok()?;
    Some((start, end))
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DirectoryData {
    #[serde(default)]
    pub numbers: Vec<NumberDirectory>,
}

/// Directory entries scoped to the owner of one inbound number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberDirectory {
    pub number: String,
    #[serde(default)]
    pub interpreters: Vec<Interpreter>,
    #[serde(default)]
    pub languages: Vec<Language>,
    #[serde(default)]
    pub access_codes: Vec<AccessCode>,
}

pub struct MemoryDirectory {
    numbers: HashMap<String, NumberDirectory>,
}

impl MemoryDirectory {
    pub fn new(data: DirectoryData) -> Self {
        let numbers = data
            .numbers
            .into_iter()
            .map(|n| (n.number.clone(), n))
            .collect();
        Self { numbers }
    }

    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read directory data '{}': {}", path, e))?;
        let data: DirectoryData = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("failed to parse directory data '{}': {}", path, e))?;
        Ok(Self::new(data))
    }
}

#[async_trait]
impl DirectoryService for MemoryDirectory {
    async fn interpreters(&self, called_number: &str) -> Result<Vec<Interpreter>> {
        Ok(self
            .numbers
            .get(called_number)
            .map(|n| n.interpreters.clone())
            .unwrap_or_default())
    }

    async fn source_languages(&self, called_number: &str) -> Result<Vec<Language>> {
        Ok(self
            .numbers
            .get(called_number)
            .map(|n| n.languages.clone())
            .unwrap_or_default())
    }

    async fn target_languages(
        &self,
        called_number: &str,
        source_id: &str,
    ) -> Result<Vec<Language>> {
        Ok(self
            .numbers
            .get(called_number)
            .map(|n| {
                n.languages
                    .iter()
                    .filter(|l| l.id != source_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn verify_access_code(
        &self,
        called_number: &str,
        digits: &str,
    ) -> Result<Option<AccessCode>> {
        Ok(self.numbers.get(called_number).and_then(|n| {
            n.access_codes.iter().find(|c| c.code == digits).cloned()
        }))
    }

    async fn language(&self, id: &str) -> Result<Option<Language>> {
        Ok(self
            .numbers
            .values()
            .flat_map(|n| n.languages.iter())
            .find(|l| l.id == id)
            .cloned())
    }

    async fn interpreter(&self, id: &str) -> Result<Option<Interpreter>> {
        Ok(self
            .numbers
            .values()
            .flat_map(|n| n.interpreters.iter())
            .find(|i| i.id == id)
            .cloned())
    }
}

pub struct HttpDirectory {
    client: reqwest::Client,
    url: String,
    headers: Option<HashMap<String, String>>,
}

impl HttpDirectory {
    pub fn new(url: String, headers: Option<HashMap<String, String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            headers,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned + Default>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.url.trim_end_matches('/'), path);
        let mut req = self.client.get(&url);
        if let Some(headers) = &self.headers {
            for (k, v) in headers {
                req = req.header(k, v);
            }
        }
        let resp = req.send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(T::default());
        }
        Ok(resp.error_for_status()?.json::<T>().await?)
    }
}

#[async_trait]
impl DirectoryService for HttpDirectory {
    async fn interpreters(&self, called_number: &str) -> Result<Vec<Interpreter>> {
        self.get_json(&format!(
            "/numbers/{}/interpreters",
            urlencoding::encode(called_number)
        ))
        .await
    }

    async fn source_languages(&self, called_number: &str) -> Result<Vec<Language>> {
        self.get_json(&format!(
            "/numbers/{}/languages",
            urlencoding::encode(called_number)
        ))
        .await
    }

    async fn target_languages(
        &self,
        called_number: &str,
        source_id: &str,
    ) -> Result<Vec<Language>> {
        let all: Vec<Language> = self.source_languages(called_number).await?;
        Ok(all.into_iter().filter(|l| l.id != source_id).collect())
    }

    async fn verify_access_code(
        &self,
        called_number: &str,
        digits: &str,
    ) -> Result<Option<AccessCode>> {
        self.get_json(&format!(
            "/numbers/{}/access-codes/{}",
            urlencoding::encode(called_number),
            urlencoding::encode(digits)
        ))
        .await
    }

    async fn language(&self, id: &str) -> Result<Option<Language>> {
        self.get_json(&format!("/languages/{}", urlencoding::encode(id)))
            .await
    }

    async fn interpreter(&self, id: &str) -> Result<Option<Interpreter>> {
        self.get_json(&format!("/interpreters/{}", urlencoding::encode(id)))
            .await
    }
}

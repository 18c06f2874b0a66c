use async_trait::async_trait;
use chrono::{ DateTime, NaiveDate };
use log::{ debug, info, warn };
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client as HttpClient;
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use url::Url;

use crate::commands::now_in_offset;
use crate::config::prompt::{ render, PromptConfig, PromptError };

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/customsearch/v1";

/// Articles dated further than this from today are dropped from news results.
const MAX_NEWS_AGE_DAYS: i64 = 7;

const NEWS_DOMAINS: &[&str] = &[
    "g1.globo.com",
    "globo.com",
    "oglobo.globo.com",
    "extra.globo.com",
    "uol.com.br",
    "noticias.uol.com.br",
    "tilt.uol.com.br",
    "bbc.com",
    "bbc.co.uk",
    "cnn.com",
    "cnnbrasil.com.br",
    "reuters.com",
    "bloomberg.com",
    "bloomberg.com.br",
    "estadao.com.br",
    "estadao.com",
    "folha.uol.com.br",
    "folha.com",
    "correiobraziliense.com.br",
    "valor.com.br",
    "valor.globo.com",
    "veja.abril.com.br",
    "veja.com",
    "exame.com",
    "terra.com.br",
    "r7.com",
    "noticias.r7.com",
    "band.uol.com.br",
    "band.com.br",
    "sbt.com.br",
    "metropoles.com",
    "correio24horas.com.br",
    "bahianoticias.com.br",
    "atarde.uol.com.br",
    "tribunadabahia.com.br",
    "news.google.com",
    "noticias.google.com",
];

const NEWS_KEYWORDS: &[&str] = &[
    "notícia",
    "noticia",
    "news",
    "reportagem",
    "política",
    "politica",
    "economia",
    "econômico",
    "economico",
    "tecnologia",
    "esporte",
    "futebol",
    "entretenimento",
    "celebridade",
    "saúde",
    "saude",
    "educação",
    "educacao",
    "meio ambiente",
    "internacional",
    "mundo",
    "brasil",
    "governo",
    "presidente",
    "ministro",
    "congresso",
    "senado",
    "câmara",
    "camara",
    "eleição",
    "eleicao",
    "votação",
    "votacao",
    "protesto",
    "manifestação",
    "acidente",
    "emergência",
    "emergencia",
    "descoberta",
    "pesquisa",
    "estudo",
    "anúncio",
    "anuncio",
    "lançamento",
    "lancamento",
    "clima",
    "previsão",
    "temperatura",
];

const REDIRECT_MARKERS: &[&str] = &["/sorry/", "redirect", "goo.gl", "bit.ly", "tinyurl.com"];

const DATE_METATAGS: &[&str] = &["article:published_time", "og:updated_time", "date", "lastmod"];

static DMY_SLASH: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").unwrap());
static DMY_DOT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").unwrap());
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})").unwrap());
static LONG_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2}) de ([a-zç]+) de (\d{4})\b").unwrap()
});
static SHORT_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2}) ([a-zç]+) (\d{4})\b").unwrap());
static RELATIVE_DAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b(hoje|ontem|amanhã|amanha)\b").unwrap());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub link: String,
    pub date: Option<String>,
    pub is_news: bool,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchItem {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub pagemap: Option<PageMap>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageMap {
    #[serde(default)]
    pub metatags: Vec<HashMap<String, Value>>,
}

impl SearchItem {
    fn metatags(&self) -> Option<&HashMap<String, Value>> {
        self.pagemap.as_ref().and_then(|p| p.metatags.first())
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    /// `news` enhances the query, restricts it to recent pages and keeps only
    /// results that look like current news.
    async fn search(
        &self,
        query: &str,
        news: bool
    ) -> Result<Vec<SearchResult>, Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub api_key: String,
    pub engine_id: String,
    pub base_url: String,
    pub result_count: u32,
    pub date_restrict: String,
    /// Offset that decides which calendar day counts as today for staleness.
    pub utc_offset_hours: i32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            engine_id: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            result_count: 10,
            date_restrict: "d7".to_string(),
            utc_offset_hours: -3,
        }
    }
}

pub struct GoogleSearchClient {
    http: HttpClient,
    config: SearchConfig,
}

impl GoogleSearchClient {
    pub fn new(config: SearchConfig) -> Result<Self, Box<dyn Error + Send + Sync>> {
        if config.api_key.is_empty() || config.engine_id.is_empty() {
            return Err("Search API key and engine id are required".into());
        }
        let http = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { http, config })
    }

    fn build_url(&self, query: &str, news: bool) -> Result<Url, url::ParseError> {
        let count = self.config.result_count.clamp(1, 10).to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("key", self.config.api_key.as_str()),
            ("cx", self.config.engine_id.as_str()),
            ("q", query),
            ("num", count.as_str())
        ];
        if news && !self.config.date_restrict.is_empty() {
            params.push(("dateRestrict", self.config.date_restrict.as_str()));
        }
        Url::parse_with_params(&self.config.base_url, &params)
    }

    fn today(&self) -> NaiveDate {
        now_in_offset(self.config.utc_offset_hours).date_naive()
    }
}

#[async_trait]
impl WebSearch for GoogleSearchClient {
    async fn search(
        &self,
        query: &str,
        news: bool
    ) -> Result<Vec<SearchResult>, Box<dyn Error + Send + Sync>> {
        let effective_query = if news { enhance_news_query(query) } else { query.to_string() };
        info!("GoogleSearchClient::search() → q='{}' news={}", effective_query, news);

        let url = self.build_url(&effective_query, news)?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("Search request failed: {} - {}", status, body).into());
        }

        let data = response.json::<SearchResponse>().await?;
        if data.items.is_empty() {
            info!("No search results for '{}'", query);
            return Ok(Vec::new());
        }

        let today = self.today();
        let results = if news {
            filter_news_results(&data.items, today)
        } else {
            data.items
                .iter()
                .map(|item| SearchResult {
                    title: item.title.clone(),
                    snippet: item.snippet.clone(),
                    link: item.link.clone(),
                    date: extract_date(&item.snippet, item.metatags()),
                    is_news: false,
                })
                .collect()
        };
        debug!("{} of {} results kept", results.len(), data.items.len());
        Ok(results)
    }
}

pub fn enhance_news_query(query: &str) -> String {
    let lower = query.to_lowercase();
    if lower.contains("notícia") || lower.contains("noticia") {
        query.to_string()
    } else {
        format!("{} notícias hoje atualizado", query)
    }
}

fn is_redirect(link: &str) -> bool {
    REDIRECT_MARKERS.iter().any(|m| link.contains(m))
}

pub fn is_news_domain(link: &str) -> bool {
    let host = match Url::parse(link) {
        Ok(url) =>
            match url.host_str() {
                Some(h) => h.to_lowercase(),
                None => {
                    return false;
                }
            }
        Err(_) => {
            return false;
        }
    };
    NEWS_DOMAINS.iter().any(|d| host.contains(d) || d.contains(host.as_str()))
}

pub fn has_news_keywords(text: &str) -> bool {
    let lower = text.to_lowercase();
    NEWS_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// First date-looking fragment in the snippet, else a publication metatag.
pub fn extract_date(snippet: &str, metatags: Option<&HashMap<String, Value>>) -> Option<String> {
    let patterns: [&Lazy<Regex>; 6] = [
        &DMY_SLASH,
        &DMY_DOT,
        &ISO_DATE,
        &LONG_DATE,
        &SHORT_DATE,
        &RELATIVE_DAY,
    ];
    for pattern in patterns {
        if let Some(m) = pattern.find(snippet) {
            return Some(m.as_str().to_string());
        }
    }

    let tags = metatags?;
    DATE_METATAGS.iter()
        .filter_map(|key| tags.get(*key).and_then(|v| v.as_str()))
        .find(|v| !v.trim().is_empty())
        .map(|v| v.to_string())
}

fn month_from_name(name: &str) -> Option<u32> {
    let lower = name.to_lowercase();
    let prefix: String = lower.chars().take(3).collect();
    let month = match prefix.as_str() {
        "jan" => 1,
        "fev" | "feb" => 2,
        "mar" => 3,
        "abr" | "apr" => 4,
        "mai" | "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "ago" | "aug" => 8,
        "set" | "sep" => 9,
        "out" | "oct" => 10,
        "nov" => 11,
        "dez" | "dec" => 12,
        _ => {
            return None;
        }
    };
    Some(month)
}

fn ymd(year: &str, month: u32, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month, day.parse().ok()?)
}

/// Parses the fragments `extract_date` produces. Day-first, as written in Brazil.
pub fn parse_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.date_naive());
    }
    if let Some(c) = RELATIVE_DAY.captures(text) {
        return match c[1].to_lowercase().as_str() {
            "hoje" => Some(today),
            "ontem" => today.pred_opt(),
            _ => today.succ_opt(),
        };
    }
    if let Some(c) = ISO_DATE.captures(text) {
        return ymd(&c[1], c[2].parse().ok()?, &c[3]);
    }
    if let Some(c) = DMY_SLASH.captures(text).or_else(|| DMY_DOT.captures(text)) {
        return ymd(&c[3], c[2].parse().ok()?, &c[1]);
    }
    if let Some(c) = LONG_DATE.captures(text).or_else(|| SHORT_DATE.captures(text)) {
        return ymd(&c[3], month_from_name(&c[2])?, &c[1]);
    }
    None
}

/// Only a date that parses can make a result stale.
pub fn is_stale(date: &str, today: NaiveDate) -> bool {
    match parse_date(date, today) {
        Some(d) => (today - d).num_days().abs() > MAX_NEWS_AGE_DAYS,
        None => false,
    }
}

pub fn filter_news_results(items: &[SearchItem], today: NaiveDate) -> Vec<SearchResult> {
    let mut results = Vec::new();

    for item in items {
        if is_redirect(&item.link) {
            continue;
        }
        let text = format!("{} {}", item.title, item.snippet);
        if !is_news_domain(&item.link) && !has_news_keywords(&text) {
            continue;
        }
        let date = extract_date(&item.snippet, item.metatags());
        if let Some(d) = &date {
            if is_stale(d, today) {
                debug!("Dropping stale result '{}' dated {}", item.title, d);
                continue;
            }
        }
        results.push(SearchResult {
            title: item.title.clone(),
            snippet: item.snippet.clone(),
            link: item.link.clone(),
            date,
            is_news: true,
        });
    }

    results
}

/// Formats the first hit as an inline answer.
pub fn first_hit_answer(
    config: &PromptConfig,
    results: &[SearchResult]
) -> Result<Option<String>, PromptError> {
    let hit = match results.first() {
        Some(hit) => hit,
        None => {
            return Ok(None);
        }
    };
    let answer = render(
        config,
        "search_answer",
        &[
            ("title", hit.title.trim()),
            ("snippet", hit.snippet.trim()),
            ("link", hit.link.trim()),
        ]
    )?;
    Ok(Some(answer))
}

/// Runs a search and formats the first hit, degrading to the localized
/// "could not find" message on failure or no results.
pub async fn answer_with_search(
    search: &dyn WebSearch,
    config: &PromptConfig,
    query: &str,
    news: bool
) -> String {
    let results = match search.search(query, news).await {
        Ok(results) => results,
        Err(e) => {
            warn!("Web search failed for '{}': {}", query, e);
            Vec::new()
        }
    };
    match first_hit_answer(config, &results) {
        Ok(Some(answer)) => answer,
        Ok(None) => config.text("search_failed").to_string(),
        Err(e) => {
            warn!("Could not format search answer: {}", e);
            config.text("search_failed").to_string()
        }
    }
}

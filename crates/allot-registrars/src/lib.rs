//! Registrar scraper capabilities: family routing, the capability contract,
//! and HTTP clients for the remote scrape service of each registrar family.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use allot_core::{matcher, normalize_tax_id, AllotmentStatus};

pub const CRATE_NAME: &str = "allot-registrars";

/// Closed set of registrar families a job can be routed to. Free-text
/// registrar names collapse onto this enum so routing stays exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrarFamily {
    Kfin,
    LinkIntime,
    Bigshare,
}

impl RegistrarFamily {
    pub const ALL: [RegistrarFamily; 3] = [Self::Kfin, Self::LinkIntime, Self::Bigshare];

    /// Kfin handles the bulk of listings, so it is the fallback for absent
    /// or unrecognized hints.
    pub const FALLBACK: RegistrarFamily = Self::Kfin;

    pub fn from_hint(hint: Option<&str>) -> Self {
        let Some(hint) = hint else {
            return Self::FALLBACK;
        };
        let upper = hint.to_ascii_uppercase();
        if upper.contains("KFIN") || upper.contains("KARVY") {
            Self::Kfin
        } else if upper.contains("LINK") || upper.contains("INTIME") || upper.contains("MUFG") {
            Self::LinkIntime
        } else if upper.contains("BIGSHARE") {
            Self::Bigshare
        } else {
            Self::FALLBACK
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kfin => "kfin",
            Self::LinkIntime => "link_intime",
            Self::Bigshare => "bigshare",
        }
    }
}

impl std::fmt::Display for RegistrarFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusDetail {
    pub tax_id: String,
    pub status: AllotmentStatus,
    pub units: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusReport {
    pub details: Vec<StatusDetail>,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("capability request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("capability returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("capability payload could not be parsed: {0}")]
    Payload(String),
    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

/// Black-box scrape capability for one registrar family: given a company and
/// a batch of tax IDs, report a status per ID. Heavy lifting (browser
/// automation, CAPTCHA solving) happens on the remote side.
#[async_trait]
pub trait RegistrarScraper: Send + Sync {
    fn family(&self) -> RegistrarFamily;

    async fn check_status(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
        tax_ids: &[String],
    ) -> Result<StatusReport, ScrapeError>;
}

/// Per-ID `unknown` report for a company the matcher could not link with
/// acceptable confidence. An inconclusive answer, never a guess.
fn unmatched_report(company_name: &str, tax_ids: &[String]) -> StatusReport {
    StatusReport {
        details: tax_ids
            .iter()
            .map(|tax_id| StatusDetail {
                tax_id: normalize_tax_id(tax_id),
                status: AllotmentStatus::Unknown,
                units: 0,
                message: format!("no confident registrar match for company {company_name:?}"),
            })
            .collect(),
    }
}

/// Registrar sites phrase outcomes loosely; fold the common variants onto
/// the status domain. Anything unrecognized is `unknown`.
fn parse_status_text(raw: &str) -> AllotmentStatus {
    let lower = raw.trim().to_ascii_lowercase();
    if lower.is_empty() {
        return AllotmentStatus::Unknown;
    }
    if let Some(status) = AllotmentStatus::parse(&lower.replace([' ', '-'], "_")) {
        // a capability never legitimately reports the in-flight marker
        if status != AllotmentStatus::InFlight {
            return status;
        }
    }
    if lower.contains("not") && lower.contains("appl") {
        AllotmentStatus::NotApplied
    } else if lower.contains("not") || lower.contains("nil") || lower.contains("no record") {
        AllotmentStatus::NotAllotted
    } else if lower.contains("allot") {
        AllotmentStatus::Allotted
    } else {
        AllotmentStatus::Unknown
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

fn build_client(config: &CapabilityConfig) -> Result<reqwest::Client, ScrapeError> {
    let client = reqwest::Client::builder()
        .gzip(true)
        .timeout(config.timeout)
        .user_agent(config.user_agent.clone())
        .build()?;
    Ok(client)
}

async fn expect_success(resp: reqwest::Response) -> Result<reqwest::Response, ScrapeError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(ScrapeError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

/// KFin capability: JSON company search plus a per-batch status query.
pub struct KfinScraper {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct KfinCompany {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct KfinCompanyList {
    companies: Vec<KfinCompany>,
}

#[derive(Debug, Deserialize)]
struct KfinStatusEntry {
    tax_id: String,
    status: String,
    #[serde(default)]
    units: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct KfinStatusResponse {
    details: Vec<KfinStatusEntry>,
}

impl KfinScraper {
    pub fn new(config: &CapabilityConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn resolve_company(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
    ) -> Result<Option<String>, ScrapeError> {
        if let Some(hint) = client_hint {
            return Ok(Some(hint.to_string()));
        }
        let url = format!("{}/companies", self.base_url);
        let resp = expect_success(self.client.get(&url).send().await?).await?;
        let list: KfinCompanyList = resp.json().await?;
        let names: Vec<&str> = list.companies.iter().map(|c| c.name.as_str()).collect();
        let found = matcher::best_match(
            company_name,
            names.iter().copied(),
            matcher::STRICT_MATCH_THRESHOLD,
        );
        Ok(found.map(|m| list.companies[m.index].id.clone()))
    }
}

#[async_trait]
impl RegistrarScraper for KfinScraper {
    fn family(&self) -> RegistrarFamily {
        RegistrarFamily::Kfin
    }

    async fn check_status(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
        tax_ids: &[String],
    ) -> Result<StatusReport, ScrapeError> {
        let Some(company_id) = self.resolve_company(company_name, client_hint).await? else {
            debug!(company = company_name, "kfin company match below threshold");
            return Ok(unmatched_report(company_name, tax_ids));
        };
        let normalized: Vec<String> = tax_ids.iter().map(|t| normalize_tax_id(t)).collect();
        let url = format!("{}/allotment-status", self.base_url);
        let resp = expect_success(
            self.client
                .post(&url)
                .json(&serde_json::json!({
                    "company_id": company_id,
                    "tax_ids": normalized,
                }))
                .send()
                .await?,
        )
        .await?;
        let body: KfinStatusResponse = resp.json().await?;
        Ok(StatusReport {
            details: body
                .details
                .into_iter()
                .map(|entry| StatusDetail {
                    tax_id: normalize_tax_id(&entry.tax_id),
                    status: parse_status_text(&entry.status),
                    units: entry.units.max(0),
                    message: entry.message,
                })
                .collect(),
        })
    }
}

/// Link Intime capability. Same shape as KFin behind a different wire
/// format: a bare corporate list and PAN-keyed results.
pub struct LinkIntimeScraper {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct LinkIntimeCorporate {
    code: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct LinkIntimeResult {
    pan: String,
    allotment: String,
    #[serde(default)]
    shares: i64,
    #[serde(default)]
    remarks: String,
}

#[derive(Debug, Deserialize)]
struct LinkIntimeStatusResponse {
    results: Vec<LinkIntimeResult>,
}

impl LinkIntimeScraper {
    pub fn new(config: &CapabilityConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn resolve_corporate(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
    ) -> Result<Option<String>, ScrapeError> {
        if let Some(hint) = client_hint {
            return Ok(Some(hint.to_string()));
        }
        let url = format!("{}/corporates", self.base_url);
        let resp = expect_success(self.client.get(&url).send().await?).await?;
        let corporates: Vec<LinkIntimeCorporate> = resp.json().await?;
        let names: Vec<&str> = corporates.iter().map(|c| c.display_name.as_str()).collect();
        let found = matcher::best_match(
            company_name,
            names.iter().copied(),
            matcher::STRICT_MATCH_THRESHOLD,
        );
        Ok(found.map(|m| corporates[m.index].code.clone()))
    }
}

#[async_trait]
impl RegistrarScraper for LinkIntimeScraper {
    fn family(&self) -> RegistrarFamily {
        RegistrarFamily::LinkIntime
    }

    async fn check_status(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
        tax_ids: &[String],
    ) -> Result<StatusReport, ScrapeError> {
        let Some(code) = self.resolve_corporate(company_name, client_hint).await? else {
            debug!(company = company_name, "link intime corporate match below threshold");
            return Ok(unmatched_report(company_name, tax_ids));
        };
        let normalized: Vec<String> = tax_ids.iter().map(|t| normalize_tax_id(t)).collect();
        let url = format!("{}/status", self.base_url);
        let resp = expect_success(
            self.client
                .post(&url)
                .json(&serde_json::json!({
                    "code": code,
                    "pans": normalized,
                }))
                .send()
                .await?,
        )
        .await?;
        let body: LinkIntimeStatusResponse = resp.json().await?;
        Ok(StatusReport {
            details: body
                .results
                .into_iter()
                .map(|entry| StatusDetail {
                    tax_id: normalize_tax_id(&entry.pan),
                    status: parse_status_text(&entry.allotment),
                    units: entry.shares.max(0),
                    message: entry.remarks,
                })
                .collect(),
        })
    }
}

/// Bigshare capability renders HTML; company choices come from a select
/// element and statuses from a result table.
pub struct BigshareScraper {
    client: reqwest::Client,
    base_url: String,
}

impl BigshareScraper {
    pub fn new(config: &CapabilityConfig) -> Result<Self, ScrapeError> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn resolve_company(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
    ) -> Result<Option<String>, ScrapeError> {
        if let Some(hint) = client_hint {
            return Ok(Some(hint.to_string()));
        }
        let url = format!("{}/companies", self.base_url);
        let resp = expect_success(self.client.get(&url).send().await?).await?;
        let html = resp.text().await?;
        let options = parse_company_options(&html)?;
        let names: Vec<&str> = options.iter().map(|(_, name)| name.as_str()).collect();
        let found = matcher::best_match(
            company_name,
            names.iter().copied(),
            matcher::STRICT_MATCH_THRESHOLD,
        );
        Ok(found.map(|m| options[m.index].0.clone()))
    }
}

#[async_trait]
impl RegistrarScraper for BigshareScraper {
    fn family(&self) -> RegistrarFamily {
        RegistrarFamily::Bigshare
    }

    async fn check_status(
        &self,
        company_name: &str,
        client_hint: Option<&str>,
        tax_ids: &[String],
    ) -> Result<StatusReport, ScrapeError> {
        let Some(company_id) = self.resolve_company(company_name, client_hint).await? else {
            debug!(company = company_name, "bigshare company match below threshold");
            return Ok(unmatched_report(company_name, tax_ids));
        };
        let normalized: Vec<String> = tax_ids.iter().map(|t| normalize_tax_id(t)).collect();
        let url = format!(
            "{}/status?company={}&pans={}",
            self.base_url,
            company_id,
            normalized.join(",")
        );
        let resp = expect_success(self.client.get(&url).send().await?).await?;
        let html = resp.text().await?;
        parse_status_table(&html)
    }
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Payload(e.to_string()))
}

fn parse_company_options(html: &str) -> Result<Vec<(String, String)>, ScrapeError> {
    let document = Html::parse_document(html);
    let option_sel = selector("select option[value]")?;
    Ok(document
        .select(&option_sel)
        .filter_map(|node| {
            let value = node.value().attr("value")?.trim().to_string();
            let name = node.text().collect::<String>().trim().to_string();
            if value.is_empty() || name.is_empty() {
                None
            } else {
                Some((value, name))
            }
        })
        .collect())
}

fn parse_status_table(html: &str) -> Result<StatusReport, ScrapeError> {
    let document = Html::parse_document(html);
    let row_sel = selector("table tr")?;
    let cell_sel = selector("td")?;

    let mut details = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < 2 {
            continue;
        }
        let units = cells
            .get(2)
            .and_then(|c| c.parse::<i64>().ok())
            .unwrap_or(0);
        details.push(StatusDetail {
            tax_id: normalize_tax_id(&cells[0]),
            status: parse_status_text(&cells[1]),
            units: units.max(0),
            message: cells.get(3).cloned().unwrap_or_default(),
        });
    }
    if details.is_empty() {
        return Err(ScrapeError::Payload(
            "no status rows in capability response".to_string(),
        ));
    }
    Ok(StatusReport { details })
}

/// One scraper per registrar family. The worker routes through
/// `RegistrarFamily::from_hint` and looks the capability up here.
#[derive(Default)]
pub struct ScraperRegistry {
    scrapers: HashMap<RegistrarFamily, Arc<dyn RegistrarScraper>>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, scraper: Arc<dyn RegistrarScraper>) {
        self.scrapers.insert(scraper.family(), scraper);
    }

    pub fn scraper_for(&self, family: RegistrarFamily) -> Option<Arc<dyn RegistrarScraper>> {
        self.scrapers.get(&family).cloned()
    }

    pub fn families(&self) -> Vec<RegistrarFamily> {
        let mut out: Vec<RegistrarFamily> = self.scrapers.keys().copied().collect();
        out.sort_by_key(|f| f.as_str());
        out
    }
}

enum ScriptedStep {
    Report(StatusReport),
    Fail(String),
}

/// Deterministic capability for tests: plays scripted steps in order, then
/// falls back to a fixed per-ID outcome (or goes unavailable).
pub struct ScriptedScraper {
    family: RegistrarFamily,
    steps: Mutex<VecDeque<ScriptedStep>>,
    fallback: Option<(AllotmentStatus, i64)>,
    calls: AtomicUsize,
}

impl ScriptedScraper {
    pub fn always(family: RegistrarFamily, status: AllotmentStatus, units: i64) -> Self {
        Self {
            family,
            steps: Mutex::new(VecDeque::new()),
            fallback: Some((status, units)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing_then(
        family: RegistrarFamily,
        error: &str,
        status: AllotmentStatus,
        units: i64,
    ) -> Self {
        Self {
            family,
            steps: Mutex::new(VecDeque::from([ScriptedStep::Fail(error.to_string())])),
            fallback: Some((status, units)),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn push_report(&self, report: StatusReport) {
        self.steps.lock().await.push_back(ScriptedStep::Report(report));
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RegistrarScraper for ScriptedScraper {
    fn family(&self) -> RegistrarFamily {
        self.family
    }

    async fn check_status(
        &self,
        _company_name: &str,
        _client_hint: Option<&str>,
        tax_ids: &[String],
    ) -> Result<StatusReport, ScrapeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().await.pop_front();
        match step {
            Some(ScriptedStep::Report(report)) => Ok(report),
            Some(ScriptedStep::Fail(message)) => Err(ScrapeError::Unavailable(message)),
            None => match self.fallback {
                Some((status, units)) => Ok(StatusReport {
                    details: tax_ids
                        .iter()
                        .map(|tax_id| StatusDetail {
                            tax_id: normalize_tax_id(tax_id),
                            status,
                            units,
                            message: String::new(),
                        })
                        .collect(),
                }),
                None => Err(ScrapeError::Unavailable("script exhausted".to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_routing_matches_family_aliases() {
        assert_eq!(
            RegistrarFamily::from_hint(Some("KFin Technologies Limited")),
            RegistrarFamily::Kfin
        );
        assert_eq!(
            RegistrarFamily::from_hint(Some("Karvy Computershare")),
            RegistrarFamily::Kfin
        );
        assert_eq!(
            RegistrarFamily::from_hint(Some("Link Intime India Pvt Ltd")),
            RegistrarFamily::LinkIntime
        );
        assert_eq!(
            RegistrarFamily::from_hint(Some("MUFG Intime India")),
            RegistrarFamily::LinkIntime
        );
        assert_eq!(
            RegistrarFamily::from_hint(Some("Bigshare Services")),
            RegistrarFamily::Bigshare
        );
    }

    #[test]
    fn unrecognized_or_missing_hints_fall_back() {
        assert_eq!(
            RegistrarFamily::from_hint(Some("Cameo Corporate Services")),
            RegistrarFamily::FALLBACK
        );
        assert_eq!(RegistrarFamily::from_hint(None), RegistrarFamily::FALLBACK);
    }

    #[test]
    fn status_text_variants_fold_onto_the_domain() {
        assert_eq!(parse_status_text("Allotted"), AllotmentStatus::Allotted);
        assert_eq!(parse_status_text("ALLOTMENT DONE"), AllotmentStatus::Allotted);
        assert_eq!(parse_status_text("Not Allotted"), AllotmentStatus::NotAllotted);
        assert_eq!(parse_status_text("No record found"), AllotmentStatus::NotAllotted);
        assert_eq!(parse_status_text("Not Applied"), AllotmentStatus::NotApplied);
        assert_eq!(parse_status_text("in flight"), AllotmentStatus::Unknown);
        assert_eq!(parse_status_text("???"), AllotmentStatus::Unknown);
        assert_eq!(parse_status_text(""), AllotmentStatus::Unknown);
    }

    #[test]
    fn company_options_parse_from_select_markup() {
        let html = r#"
            <html><body>
              <select id="company">
                <option value="">-- choose --</option>
                <option value="TT24">Tata Technologies Limited</option>
                <option value="IP09">ICICI Prudential AMC</option>
              </select>
            </body></html>
        "#;
        let options = parse_company_options(html).unwrap();
        assert_eq!(
            options,
            vec![
                ("TT24".to_string(), "Tata Technologies Limited".to_string()),
                ("IP09".to_string(), "ICICI Prudential AMC".to_string()),
            ]
        );
    }

    #[test]
    fn status_table_rows_parse_to_details() {
        let html = r#"
            <table class="allotment">
              <tr><th>PAN</th><th>Status</th><th>Shares</th></tr>
              <tr><td>abcde1234f</td><td>Allotted</td><td>15</td></tr>
              <tr><td>FGHIJ5678K</td><td>Not Allotted</td><td>0</td><td>oversubscribed</td></tr>
            </table>
        "#;
        let report = parse_status_table(html).unwrap();
        assert_eq!(report.details.len(), 2);
        assert_eq!(report.details[0].tax_id, "ABCDE1234F");
        assert_eq!(report.details[0].status, AllotmentStatus::Allotted);
        assert_eq!(report.details[0].units, 15);
        assert_eq!(report.details[1].status, AllotmentStatus::NotAllotted);
        assert_eq!(report.details[1].message, "oversubscribed");
    }

    #[test]
    fn empty_status_table_is_a_payload_error() {
        assert!(matches!(
            parse_status_table("<html><body>maintenance</body></html>"),
            Err(ScrapeError::Payload(_))
        ));
    }

    #[test]
    fn unmatched_company_reports_unknown_per_id() {
        let report = unmatched_report(
            "Obscure Ventures",
            &["abcde1234f".to_string(), "FGHIJ5678K".to_string()],
        );
        assert_eq!(report.details.len(), 2);
        assert!(report
            .details
            .iter()
            .all(|d| d.status == AllotmentStatus::Unknown && d.units == 0));
        assert_eq!(report.details[0].tax_id, "ABCDE1234F");
    }

    #[tokio::test]
    async fn scripted_scraper_plays_failure_then_fallback() {
        let scraper = ScriptedScraper::failing_then(
            RegistrarFamily::Kfin,
            "capability timeout",
            AllotmentStatus::Allotted,
            10,
        );
        let ids = vec!["ABCDE1234F".to_string()];

        let first = scraper.check_status("Tata Technologies", None, &ids).await;
        assert!(matches!(first, Err(ScrapeError::Unavailable(_))));

        let second = scraper
            .check_status("Tata Technologies", None, &ids)
            .await
            .unwrap();
        assert_eq!(second.details[0].status, AllotmentStatus::Allotted);
        assert_eq!(second.details[0].units, 10);
        assert_eq!(scraper.call_count(), 2);
    }

    #[test]
    fn registry_routes_by_family() {
        let mut registry = ScraperRegistry::new();
        registry.insert(Arc::new(ScriptedScraper::always(
            RegistrarFamily::LinkIntime,
            AllotmentStatus::Allotted,
            1,
        )));
        assert!(registry.scraper_for(RegistrarFamily::LinkIntime).is_some());
        assert!(registry.scraper_for(RegistrarFamily::Bigshare).is_none());
        assert_eq!(registry.families(), vec![RegistrarFamily::LinkIntime]);
    }
}

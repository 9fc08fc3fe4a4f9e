//! Language-model collaborator: client contract, prompt builders and strict
//! response schemas for comparable scoring, market insights and recommendations.

use std::time::Duration;

use async_trait::async_trait;
use comps_core::{ComparableResult, MarketInsight, MarketPosition, Parcel, ValueRange};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "comps-ai";

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl AiConfig {
    /// `None` when no credential is configured; callers then stay on the deterministic path.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        if api_key.trim().is_empty() {
            return None;
        }
        Some(Self {
            api_key,
            base_url: std::env::var("COMPS_AI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: std::env::var("COMPS_AI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            timeout: Duration::from_secs(
                std::env::var("COMPS_AI_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(20),
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("model returned no content")]
    EmptyResponse,
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response violates contract: {0}")]
    Schema(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Run one chat completion and return the assistant text.
    async fn complete(&self, request: &ChatRequest) -> Result<String, AiError>;
}

/// OpenAI-compatible chat-completions client.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    config: AiConfig,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn body(&self, request: &ChatRequest) -> serde_json::Value {
        serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<String, AiError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    AiError::Timeout(self.config.timeout)
                } else {
                    AiError::Request(err)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AiError::HttpStatus {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let completion: ChatCompletion = resp.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(AiError::EmptyResponse)?;
        debug!(model = %self.config.model, bytes = content.len(), "chat completion received");
        Ok(content)
    }
}

/// Attribute subset sent to the model for one parcel.
#[derive(Debug, Clone, Serialize)]
pub struct ParcelSummary<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<&'a str>,
    pub address: &'a str,
    pub city: &'a str,
    pub building_area: Option<f64>,
    pub zoning_code: Option<&'a str>,
    pub year_built: Option<i32>,
    pub assessed_value: Option<f64>,
}

impl<'a> ParcelSummary<'a> {
    pub fn target(parcel: &'a Parcel) -> Self {
        Self {
            id: None,
            ..Self::candidate(parcel)
        }
    }

    pub fn candidate(parcel: &'a Parcel) -> Self {
        Self {
            id: Some(&parcel.id),
            address: &parcel.address,
            city: &parcel.city,
            building_area: parcel.building_area,
            zoning_code: parcel.zoning_code.as_deref(),
            year_built: parcel.year_built,
            assessed_value: parcel.assessed_value,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ComparableSummary<'a> {
    address: &'a str,
    city: &'a str,
    building_area: Option<f64>,
    assessed_value: Option<f64>,
    year_built: Option<i32>,
    similarity_score: f64,
    distance_miles: Option<f64>,
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

pub fn candidate_scoring_request(
    target: &Parcel,
    batch: &[Parcel],
    min_similarity: f64,
) -> ChatRequest {
    let candidates: Vec<_> = batch.iter().map(ParcelSummary::candidate).collect();
    let user = format!(
        "Score each candidate industrial parcel for how comparable it is to the target.\n\n\
         Target parcel:\n{target}\n\n\
         Candidate parcels:\n{candidates}\n\n\
         Weigh location (same city or county), building size, year built, zoning class and \
         assessed value.\n\
         Respond with a JSON array only. Each element must be an object with exactly these keys:\n\
         \"id\" (the candidate id string), \"similarity_score\" (0.0-1.0), \
         \"confidence_score\" (0.0-1.0), \"reasoning\" (one short sentence).\n\
         Leave out candidates whose similarity_score would be {min_similarity} or lower.",
        target = pretty(&ParcelSummary::target(target)),
        candidates = pretty(&candidates),
    );
    ChatRequest {
        system: "You compare industrial real estate parcels. Reply with valid JSON only.".into(),
        user,
        temperature: 0.1,
        max_tokens: 2000,
    }
}

fn comparable_summaries(comparables: &[ComparableResult]) -> Vec<ComparableSummary<'_>> {
    comparables
        .iter()
        .map(|c| ComparableSummary {
            address: &c.parcel.address,
            city: &c.parcel.city,
            building_area: c.parcel.building_area,
            assessed_value: c.parcel.assessed_value,
            year_built: c.parcel.year_built,
            similarity_score: c.similarity_score,
            distance_miles: c.distance_miles,
        })
        .collect()
}

pub fn market_insight_request(target: &Parcel, comparables: &[ComparableResult]) -> ChatRequest {
    let user = format!(
        "Assess the market position of the target industrial parcel against its comparables.\n\n\
         Target parcel:\n{target}\n\n\
         Comparables:\n{comps}\n\n\
         Base the assessment on assessed value per square foot, location and building \
         characteristics. Respond with one JSON object with keys:\n\
         \"market_position\" (one of \"above_market\", \"at_market\", \"below_market\"),\n\
         \"value_range\" ({{\"min\": number, \"max\": number}} in dollars),\n\
         \"market_trends\" (string), \"key_insights\" (array of strings), \
         \"recommendations\" (array of strings).",
        target = pretty(&ParcelSummary::target(target)),
        comps = pretty(&comparable_summaries(comparables)),
    );
    ChatRequest {
        system: "You are an industrial real estate market analyst. Reply with valid JSON only."
            .into(),
        user,
        temperature: 0.2,
        max_tokens: 1500,
    }
}

pub fn recommendation_request(target: &Parcel, comparables: &[ComparableResult]) -> ChatRequest {
    let avg_similarity = if comparables.is_empty() {
        0.0
    } else {
        comparables.iter().map(|c| c.similarity_score).sum::<f64>() / comparables.len() as f64
    };
    let distances: Vec<f64> = comparables
        .iter()
        .filter_map(|c| c.distance_miles)
        .filter(|d| *d > 0.0)
        .collect();
    let summary = serde_json::json!({
        "target_parcel": ParcelSummary::target(target),
        "comparables_count": comparables.len(),
        "avg_similarity_score": avg_similarity,
        "distance_range": {
            "min": distances.iter().copied().reduce(f64::min).unwrap_or(0.0),
            "max": distances.iter().copied().reduce(f64::max).unwrap_or(0.0),
        },
    });
    let user = format!(
        "Given this comparable analysis of an industrial parcel, suggest 3 to 5 concrete next \
         steps for an owner or investor covering valuation, market position and risk.\n\n{}\n\n\
         Respond with a JSON array of strings only.",
        pretty(&summary)
    );
    ChatRequest {
        system: "You advise on industrial real estate. Reply with a JSON array of strings only."
            .into(),
        user,
        temperature: 0.3,
        max_tokens: 800,
    }
}

/// Pull the JSON payload out of a reply that may be wrapped in a markdown fence.
pub fn extract_json_payload(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim();
        }
    }
    trimmed
}

/// One element of the candidate-scoring reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CandidateScore {
    pub id: String,
    pub similarity_score: f64,
    pub confidence_score: f64,
    pub reasoning: String,
}

fn check_unit(name: &str, id: &str, value: f64) -> Result<(), AiError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(AiError::Schema(format!("{name} for {id} out of range: {value}")))
    }
}

pub fn parse_candidate_scores(response: &str) -> Result<Vec<CandidateScore>, AiError> {
    let payload = extract_json_payload(response);
    if !payload.starts_with('[') {
        return Err(AiError::Schema("expected a JSON array".into()));
    }
    let scores: Vec<CandidateScore> = serde_json::from_str(payload)?;
    for score in &scores {
        check_unit("similarity_score", &score.id, score.similarity_score)?;
        check_unit("confidence_score", &score.id, score.confidence_score)?;
    }
    Ok(scores)
}

#[derive(Debug, Deserialize)]
struct MarketInsightReply {
    market_position: String,
    value_range: ValueRangeReply,
    market_trends: String,
    key_insights: Vec<String>,
    recommendations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ValueRangeReply {
    min: f64,
    max: f64,
}

pub fn parse_market_insight(response: &str) -> Result<MarketInsight, AiError> {
    let reply: MarketInsightReply = serde_json::from_str(extract_json_payload(response))?;
    let market_position = match reply.market_position.as_str() {
        "above_market" => MarketPosition::AboveMarket,
        "at_market" => MarketPosition::AtMarket,
        "below_market" => MarketPosition::BelowMarket,
        other => {
            return Err(AiError::Schema(format!("unknown market_position {other:?}")));
        }
    };
    let ValueRangeReply { min, max } = reply.value_range;
    if !min.is_finite() || !max.is_finite() || min < 0.0 || min > max {
        return Err(AiError::Schema(format!("invalid value_range {min}..{max}")));
    }
    Ok(MarketInsight {
        market_position,
        value_range: ValueRange {
            min: min.trunc() as i64,
            max: max.trunc() as i64,
        },
        market_trends: reply.market_trends,
        key_insights: reply.key_insights,
        recommendations: reply.recommendations,
    })
}

pub fn parse_recommendations(response: &str) -> Result<Vec<String>, AiError> {
    let payload = extract_json_payload(response);
    if !payload.starts_with('[') {
        return Err(AiError::Schema("expected a JSON array of strings".into()));
    }
    let items: Vec<String> = serde_json::from_str(payload)?;
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn parcel(id: &str) -> Parcel {
        Parcel {
            id: id.to_string(),
            region_id: "cook".into(),
            address: "1 Dock St".into(),
            city: "Chicago".into(),
            state: "IL".into(),
            zip_code: None,
            property_type: None,
            zoning_code: Some("M-1".into()),
            building_area: Some(50_000.0),
            lot_area: None,
            year_built: Some(2000),
            assessed_value: Some(2_000_000.0),
            market_value: None,
            sale_price: None,
            sale_date: None,
            latitude: None,
            longitude: None,
            data_source: "test".into(),
            last_updated: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
            quality_score: None,
            is_verified: false,
            outlier_flags: vec![],
        }
    }

    #[test]
    fn parses_plain_and_fenced_score_arrays() {
        let plain = r#"[{"id":"a","similarity_score":0.8,"confidence_score":0.7,"reasoning":"close"}]"#;
        let fenced = format!("Here you go:\n```json\n{plain}\n```\n");
        let expected = vec![CandidateScore {
            id: "a".into(),
            similarity_score: 0.8,
            confidence_score: 0.7,
            reasoning: "close".into(),
        }];
        assert_eq!(parse_candidate_scores(plain).unwrap(), expected);
        assert_eq!(parse_candidate_scores(&fenced).unwrap(), expected);
    }

    #[test]
    fn missing_field_is_a_recoverable_error() {
        let reply = r#"[{"id":"a","similarity_score":0.8,"reasoning":"close"}]"#;
        assert!(matches!(parse_candidate_scores(reply), Err(AiError::Json(_))));
    }

    #[test]
    fn out_of_range_score_violates_contract() {
        let reply = r#"[{"id":"a","similarity_score":1.4,"confidence_score":0.7,"reasoning":"x"}]"#;
        assert!(matches!(parse_candidate_scores(reply), Err(AiError::Schema(_))));
    }

    #[test]
    fn object_instead_of_array_is_rejected() {
        let reply = r#"{"id":"a","similarity_score":0.4,"confidence_score":0.7,"reasoning":"x"}"#;
        assert!(matches!(parse_candidate_scores(reply), Err(AiError::Schema(_))));
        assert!(parse_candidate_scores("not json at all").is_err());
    }

    #[test]
    fn market_insight_contract_is_enforced() {
        let ok = r#"{"market_position":"below_market","value_range":{"min":1500000.7,"max":2200000},
            "market_trends":"steady","key_insights":["a"],"recommendations":["b"]}"#;
        let insight = parse_market_insight(ok).unwrap();
        assert_eq!(insight.market_position, MarketPosition::BelowMarket);
        assert_eq!(insight.value_range, ValueRange { min: 1_500_000, max: 2_200_000 });

        let bad_position = ok.replace("below_market", "sideways");
        assert!(matches!(parse_market_insight(&bad_position), Err(AiError::Schema(_))));

        let inverted = ok.replace("1500000.7", "3000000");
        assert!(matches!(parse_market_insight(&inverted), Err(AiError::Schema(_))));
    }

    #[test]
    fn recommendations_must_be_string_array() {
        assert_eq!(
            parse_recommendations(r#"["hold", "refinance"]"#).unwrap(),
            vec!["hold".to_string(), "refinance".to_string()]
        );
        assert!(parse_recommendations(r#"{"items":[]}"#).is_err());
        assert!(parse_recommendations(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn scoring_prompt_lists_candidate_ids_but_not_target_id() {
        let target = parcel("target-1");
        let batch = vec![parcel("cand-1"), parcel("cand-2")];
        let request = candidate_scoring_request(&target, &batch, 0.3);
        assert!(request.user.contains("\"id\": \"cand-1\""));
        assert!(request.user.contains("\"id\": \"cand-2\""));
        assert!(!request.user.contains("target-1"));
        assert_eq!(request.max_tokens, 2000);
    }

    #[test]
    fn client_body_carries_model_and_messages() {
        let client = OpenAiClient::new(AiConfig {
            api_key: "k".into(),
            base_url: "http://localhost:9/v1/".into(),
            model: "test-model".into(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(client.endpoint(), "http://localhost:9/v1/chat/completions");
        let body = client.body(&ChatRequest {
            system: "s".into(),
            user: "u".into(),
            temperature: 0.5,
            max_tokens: 10,
        });
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["messages"][1]["content"], "u");
        assert_eq!(body["max_tokens"], 10);
    }
}

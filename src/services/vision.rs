use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::{config::AiConfig, error::AppError, services::storage::ImageUpload};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const ID_CARD_PROMPT: &str = "You are checking a student or staff identity card for a campus \
carpooling service. Look at the image and answer with JSON only, no prose, in the form \
{\"authentic\": boolean, \"name\": string or null, \"institution\": string or null}. \
Set authentic to false if the image is not a real institutional ID card, is a screenshot of \
a template, or is unreadable. name is the card holder's full name as printed.";

const TIP_PROMPT: &str = "Write one short, upbeat tip (max 30 words) encouraging college \
students to carpool safely and sustainably. Plain text only, no quotes, no hashtags.";

const FALLBACK_TIPS: &[&str] = &[
    "Sharing one car with three classmates keeps three cars off the road. Small rides, big difference.",
    "Share your live location with a friend before you set off. Safe trips are the best trips.",
    "Be at the pickup point a few minutes early. Your driver and co-riders will thank you.",
    "Split the fuel, split the playlist, and split the carbon footprint. Carpool on!",
];

/// What the model read off an ID card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdCardAnalysis {
    pub authentic: bool,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationOutcome {
    pub verified: bool,
    pub reason: String,
    pub extracted_name: Option<String>,
}

impl VerificationOutcome {
    pub fn skipped() -> Self {
        Self {
            verified: false,
            reason: "identity verification is not configured".into(),
            extracted_name: None,
        }
    }
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn analyze_id_card(&self, image: &ImageUpload) -> Result<IdCardAnalysis, AppError>;
    async fn motivational_tip(&self) -> Result<String, AppError>;
}

/// Decides verification from the model's reading and the name given at signup.
pub fn assess_id_card(analysis: &IdCardAnalysis, claimed_name: &str) -> VerificationOutcome {
    let extracted_name = analysis.name.clone();
    if !analysis.authentic {
        return VerificationOutcome {
            verified: false,
            reason: "ID card could not be confirmed as authentic".into(),
            extracted_name,
        };
    }
    match analysis.name.as_deref() {
        Some(printed) if names_match(claimed_name, printed) => VerificationOutcome {
            verified: true,
            reason: "ID card verified".into(),
            extracted_name,
        },
        Some(_) => VerificationOutcome {
            verified: false,
            reason: "name on the ID card does not match the account name".into(),
            extracted_name,
        },
        None => VerificationOutcome {
            verified: false,
            reason: "no name could be read from the ID card".into(),
            extracted_name,
        },
    }
}

/// Every token of the claimed name must appear on the card, ignoring case.
pub fn names_match(claimed: &str, printed: &str) -> bool {
    let printed: Vec<String> = tokens(printed).collect();
    let mut claimed = tokens(claimed).peekable();
    claimed.peek().is_some() && claimed.all(|token| printed.contains(&token))
}

fn tokens(name: &str) -> impl Iterator<Item = String> + '_ {
    name.split(|c: char| c.is_whitespace() || c == '.' || c == ',')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
}

/// Pulls the JSON object out of a reply that may be wrapped in a code fence.
pub fn parse_id_card_reply(reply: &str) -> Result<IdCardAnalysis, AppError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let body = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => {
            return Err(AppError::Upstream(
                "vision model reply contained no JSON object".into(),
            ))
        }
    };
    serde_json::from_str(body)
        .map_err(|err| AppError::Upstream(format!("vision model reply was malformed: {err}")))
}

pub fn fallback_tip(seed: u32) -> &'static str {
    FALLBACK_TIPS[seed as usize % FALLBACK_TIPS.len()]
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(self) -> Option<String> {
        let text: String = self
            .candidates
            .into_iter()
            .next()?
            .content?
            .parts
            .into_iter()
            .filter_map(|part| part.text)
            .collect();
        let text = text.trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

/// Gemini `generateContent` client.
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    config: AiConfig,
}

impl GeminiClient {
    pub fn new(config: AiConfig) -> Result<Self, AppError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    async fn generate(&self, body: serde_json::Value) -> Result<String, AppError> {
        let path = format!("v1beta/models/{}:generateContent", self.config.model);
        let url = self
            .config
            .api_base
            .join(&path)
            .map_err(|err| AppError::Config(format!("invalid model URL: {err}")))?;

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AppError::Upstream(format!(
                "vision model returned {}",
                response.status()
            )));
        }
        let parsed: GenerateResponse = response.json().await?;
        parsed
            .text()
            .ok_or_else(|| AppError::Upstream("vision model returned no text".into()))
    }
}

#[async_trait]
impl VisionModel for GeminiClient {
    async fn analyze_id_card(&self, image: &ImageUpload) -> Result<IdCardAnalysis, AppError> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": ID_CARD_PROMPT },
                    { "inline_data": { "mime_type": image.mime_type, "data": image.base64() } }
                ]
            }],
            "generationConfig": { "responseMimeType": "application/json" }
        });
        let reply = self.generate(body).await?;
        debug!(reply = %reply, "id card analysis reply");
        let analysis = parse_id_card_reply(&reply)?;
        info!(authentic = analysis.authentic, "id card analysed");
        Ok(analysis)
    }

    async fn motivational_tip(&self) -> Result<String, AppError> {
        let body = json!({ "contents": [{ "parts": [{ "text": TIP_PROMPT }] }] });
        self.generate(body).await
    }
}

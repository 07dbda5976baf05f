// Trip planner chat proxy
//
// Wraps the user's message with preference and network context, forwards it
// to Google Gemini and pulls a structured {message, routes} reply out of the
// model text. When the model is unreachable a canned reply is returned and
// marked as `fallback` so callers can tell the two apart.

use crate::transit_catalog::TransitCatalog;
use crate::transit_models::{Result, RoutePlan, RouteStep, TripPreferences, YourRouteError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_GEMINI_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent";

const SYSTEM_PROMPT: &str = "You are YourRoute AI, a transit assistant for Delhi's public transportation system. Your role is to:

1. Help users plan routes using Delhi Metro and DTC buses
2. Provide transit information and service updates
3. Consider user preferences (accessibility, walking distance, cost, time)
4. Suggest alternative routes when delays occur
5. Answer questions about transit stops, schedules, and services

This platform is in active development: real-time predictions and personalised recommendations are limited. Mention this when relevant.

Respond in a helpful, conversational tone with actionable information. When suggesting routes, use the structured format below so the app can render them.";

const RESPONSE_FORMAT: &str = r#"Please provide a helpful response. If suggesting routes, format them as JSON objects with the following structure:
{
  "message": "Your conversational response",
  "routes": [
    {
      "id": 1,
      "title": "Route description",
      "duration": "25 min",
      "distance": "8.2 km",
      "mode": "Metro + Bus",
      "steps": [
        { "mode": "walk", "duration": "3 min", "description": "Walk to nearest metro station" }
      ],
      "cost": "₹30",
      "accessibility": true
    }
  ]
}"#;

const DEV_STATUS_NOTE: &str = "⚠️ **Development Status**: This platform is currently in active development. Some features may be limited or unavailable.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatReply {
    pub message: String,
    #[serde(default)]
    pub routes: Vec<RoutePlan>,
    #[serde(default = "ReplySource::model")]
    pub source: ReplySource,
}

impl ReplySource {
    fn model() -> Self {
        ReplySource::Model
    }
}

/// A validated `/chat` request body.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub message: String,
    pub preferences: TripPreferences,
}

impl ChatRequest {
    /// `message` must be a non-empty string. Unusable preferences are
    /// ignored rather than rejected.
    pub fn from_json(body: &Value) -> Result<Self> {
        let message = match body.get("message") {
            Some(Value::String(m)) if !m.is_empty() => m.clone(),
            _ => return Err(YourRouteError::ParseError("Invalid message format".to_string())),
        };

        let preferences = match body.get("preferences") {
            Some(p @ Value::Object(_)) => serde_json::from_value(p.clone()).unwrap_or_else(|e| {
                log::debug!("Ignoring malformed preferences ({})", e);
                TripPreferences::default()
            }),
            _ => TripPreferences::default(),
        };

        Ok(ChatRequest { message, preferences })
    }
}

// ============================================================================
// Model seam
// ============================================================================

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub api_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        GeminiConfig {
            api_key: None,
            api_url: DEFAULT_GEMINI_URL.to_string(),
            max_tokens: 1000,
            temperature: 0.7,
        }
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    const REQUEST_TIMEOUT_SECS: u64 = 30;

    pub fn new(config: GeminiConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| YourRouteError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(GeminiClient { client, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| YourRouteError::ConfigError("Gemini API key not configured".to_string()))?;

        let body = json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": self.config.temperature,
                "maxOutputTokens": self.config.max_tokens,
                "topP": 0.8,
                "topK": 40
            }
        });

        let response = self
            .client
            .post(&self.config.api_url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| YourRouteError::NetworkError(format!("Failed to reach Gemini: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(YourRouteError::UpstreamError(format!("Gemini returned {}", status)));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| YourRouteError::ParseError(format!("Invalid Gemini response: {}", e)))?;

        payload["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| YourRouteError::UpstreamError("Gemini response had no candidate text".to_string()))
    }
}

// ============================================================================
// Planner
// ============================================================================

pub struct TripPlanner {
    model: Arc<dyn LanguageModel>,
    catalog: TransitCatalog,
}

impl TripPlanner {
    pub fn new(model: Arc<dyn LanguageModel>, catalog: TransitCatalog) -> Self {
        TripPlanner { model, catalog }
    }

    pub fn catalog(&self) -> &TransitCatalog {
        &self.catalog
    }

    pub fn build_context(&self, preferences: &TripPreferences) -> String {
        let mut context = String::new();

        if let Some(mode) = preferences
            .preferred_mode
            .as_deref()
            .filter(|m| !m.is_empty() && *m != "any")
        {
            context.push_str(&format!("User prefers {} transport. ", mode));
        }
        if let Some(distance) = preferences.max_walk_distance.filter(|d| *d > 0.0) {
            context.push_str(&format!("Maximum walking distance: {}m. ", distance));
        }
        if preferences.accessibility {
            context.push_str("Accessibility features required. ");
        }
        if preferences.avoid_stairs {
            context.push_str("Avoid stairs and escalators. ");
        }

        context.push_str(&self.catalog.chat_context());
        context
    }

    pub async fn respond(&self, request: &ChatRequest) -> ChatReply {
        let context = self.build_context(&request.preferences);
        let prompt = format!(
            "{}\n\n{}\n\nUser Query: {}\n\n{}",
            SYSTEM_PROMPT, context, request.message, RESPONSE_FORMAT
        );

        match self.model.generate(&prompt).await {
            Ok(text) => parse_model_reply(&text),
            Err(e) => {
                log::warn!("⚠️  Gemini API error, answering with fallback: {}", e);
                fallback_reply(&request.message)
            }
        }
    }
}

#[derive(Deserialize)]
struct StructuredReply {
    message: String,
    #[serde(default)]
    routes: Vec<RoutePlan>,
}

/// Uses the outermost `{...}` span of the model text when it parses as a
/// structured reply, otherwise the whole text becomes the message.
pub fn parse_model_reply(text: &str) -> ChatReply {
    let structured = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => {
            serde_json::from_str::<StructuredReply>(&text[start..=end]).ok()
        }
        _ => None,
    };

    match structured {
        Some(reply) => ChatReply {
            message: reply.message,
            routes: reply.routes,
            source: ReplySource::Model,
        },
        None => {
            log::debug!("Could not parse JSON from model reply, returning as message only");
            ChatReply {
                message: text.to_string(),
                routes: Vec::new(),
                source: ReplySource::Model,
            }
        }
    }
}

fn words(message: &str) -> Vec<String> {
    message
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn step(mode: &str, duration: &str, description: &str) -> RouteStep {
    RouteStep {
        mode: mode.to_string(),
        duration: duration.to_string(),
        description: description.to_string(),
    }
}

/// Canned answer chosen by keyword.
pub fn fallback_reply(message: &str) -> ChatReply {
    let words = words(message);
    let has = |w: &str| words.iter().any(|x| x == w);

    let (message, routes) = if has("hello") || has("hi") {
        (
            format!(
                "Hello! I'm YourRoute AI, your transit assistant for Delhi. 🚀\n\n{}\n\nHow can I help you plan your journey today?",
                DEV_STATUS_NOTE
            ),
            Vec::new(),
        )
    } else if has("metro") || has("delhi") {
        (
            format!(
                "I can help you navigate Delhi's metro network! Delhi Metro has 8 color-coded lines covering over 390 km. 🚇\n\n{}\n\nWhat's your destination? (Note: Advanced features like real-time predictions are still being implemented)",
                DEV_STATUS_NOTE
            ),
            vec![RoutePlan {
                id: 1,
                title: "Sample Metro Route (Development Mode)".to_string(),
                duration: "20 min".to_string(),
                distance: "6.5 km".to_string(),
                mode: "Metro".to_string(),
                steps: vec![
                    step("walk", "3 min", "Walk to nearest metro station"),
                    step("metro", "15 min", "Take Yellow Line to Central Secretariat"),
                    step("walk", "2 min", "Walk to destination"),
                ],
                cost: "₹20".to_string(),
                accessibility: true,
            }],
        )
    } else if has("bus") || has("dtc") {
        (
            format!(
                "Delhi Transport Corporation (DTC) buses serve the entire city with over 3,800 buses on 700+ routes. I can help you find the best bus route! 🚌\n\n{}\n\nWhat's your destination? (Note: Advanced features like real-time predictions are still being implemented)",
                DEV_STATUS_NOTE
            ),
            vec![RoutePlan {
                id: 2,
                title: "Sample Bus Route (Development Mode)".to_string(),
                duration: "35 min".to_string(),
                distance: "12 km".to_string(),
                mode: "Bus".to_string(),
                steps: vec![
                    step("walk", "2 min", "Walk to bus stop"),
                    step("bus", "30 min", "Take bus 522 to destination"),
                    step("walk", "3 min", "Walk to final destination"),
                ],
                cost: "₹15".to_string(),
                accessibility: false,
            }],
        )
    } else {
        (
            format!(
                "I'm sorry, I'm having trouble processing your request right now. Please try asking about metro routes, bus schedules, or specific destinations in Delhi.\n\n{}",
                DEV_STATUS_NOTE
            ),
            Vec::new(),
        )
    };

    ChatReply {
        message,
        routes,
        source: ReplySource::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubModel {
        reply: Result<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl StubModel {
        fn answering(text: &str) -> Arc<Self> {
            Arc::new(StubModel { reply: Ok(text.to_string()), prompts: Mutex::new(Vec::new()) })
        }

        fn failing() -> Arc<Self> {
            Arc::new(StubModel {
                reply: Err(YourRouteError::UpstreamError("503".to_string())),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for StubModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            match &self.reply {
                Ok(text) => Ok(text.clone()),
                Err(e) => Err(YourRouteError::UpstreamError(e.to_string())),
            }
        }
    }

    fn request(message: &str) -> ChatRequest {
        ChatRequest { message: message.to_string(), preferences: TripPreferences::default() }
    }

    #[test]
    fn request_requires_a_string_message() {
        assert!(ChatRequest::from_json(&json!({})).is_err());
        assert!(ChatRequest::from_json(&json!({ "message": 42 })).is_err());
        assert!(ChatRequest::from_json(&json!({ "message": "" })).is_err());

        let ok = ChatRequest::from_json(&json!({
            "message": "Rajiv Chowk to Saket",
            "preferences": { "preferredMode": "metro", "maxWalkDistance": 500, "avoidStairs": true }
        }))
        .unwrap();
        assert_eq!(ok.preferences.preferred_mode.as_deref(), Some("metro"));
        assert_eq!(ok.preferences.max_walk_distance, Some(500.0));
        assert!(ok.preferences.avoid_stairs);

        let odd = ChatRequest::from_json(&json!({ "message": "hi", "preferences": "fast" })).unwrap();
        assert_eq!(odd.preferences, TripPreferences::default());
    }

    #[test]
    fn context_reflects_preferences() {
        let planner = TripPlanner::new(StubModel::answering(""), TransitCatalog::delhi());
        let prefs = TripPreferences {
            preferred_mode: Some("bus".to_string()),
            max_walk_distance: Some(800.0),
            accessibility: true,
            avoid_stairs: false,
        };

        let context = planner.build_context(&prefs);
        assert!(context.starts_with(
            "User prefers bus transport. Maximum walking distance: 800m. Accessibility features required. "
        ));
        assert!(context.ends_with("Sample bus routes: 522, 543, 615. "));

        let any = TripPreferences { preferred_mode: Some("any".to_string()), ..Default::default() };
        assert!(planner.build_context(&any).starts_with("Available metro lines"));
    }

    #[test]
    fn extracts_structured_reply_from_model_text() {
        let text = r#"Sure! Here you go:
```json
{"message": "Take the Yellow Line.", "routes": [{"id": "3", "title": "Direct", "steps": [{"mode": "metro", "duration": "18 min", "description": "Yellow Line to Saket"}], "accessibility": true}]}
```"#;
        let reply = parse_model_reply(text);
        assert_eq!(reply.source, ReplySource::Model);
        assert_eq!(reply.message, "Take the Yellow Line.");
        assert_eq!(reply.routes.len(), 1);
        assert_eq!(reply.routes[0].id, 3);
        assert_eq!(reply.routes[0].steps[0].mode, "metro");
    }

    #[test]
    fn plain_text_reply_is_kept_whole() {
        let reply = parse_model_reply("The Blue Line runs every 4 minutes {roughly}.");
        assert_eq!(reply.message, "The Blue Line runs every 4 minutes {roughly}.");
        assert!(reply.routes.is_empty());
    }

    #[test]
    fn fallback_picks_reply_by_keyword() {
        assert!(fallback_reply("Hi there").message.starts_with("Hello!"));
        assert!(fallback_reply("which metro goes to Saket?").message.contains("metro network"));
        assert_eq!(fallback_reply("Best DTC bus to ITO").routes[0].mode, "Bus");
        assert!(fallback_reply("weather?").routes.is_empty());
        assert_eq!(fallback_reply("weather?").source, ReplySource::Fallback);
    }

    #[tokio::test]
    async fn model_failure_falls_back() {
        let planner = TripPlanner::new(StubModel::failing(), TransitCatalog::delhi());
        let reply = planner.respond(&request("metro to airport")).await;
        assert_eq!(reply.source, ReplySource::Fallback);
        assert_eq!(reply.routes.len(), 1);
    }

    #[tokio::test]
    async fn prompt_carries_context_and_query() {
        let model = StubModel::answering(r#"{"message": "ok", "routes": []}"#);
        let planner = TripPlanner::new(model.clone(), TransitCatalog::delhi());

        let reply = planner.respond(&request("Kashmere Gate to ITO")).await;
        assert_eq!(reply.message, "ok");
        assert_eq!(reply.source, ReplySource::Model);

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("User Query: Kashmere Gate to ITO"));
        assert!(prompts[0].contains("Available metro lines: Yellow Line"));
    }

    #[tokio::test]
    async fn missing_api_key_is_a_config_error() {
        let client = GeminiClient::new(GeminiConfig::default()).unwrap();
        assert!(!client.is_configured());
        assert!(matches!(client.generate("hello").await, Err(YourRouteError::ConfigError(_))));
    }
}

// Terminal trip planner
//
// Talks to a running server's /api/ai/chat the way the web widget does,
// keeping a local transcript. If the server cannot be reached a local canned
// reply is shown instead.

use crate::ai_planner::{ChatReply, ReplySource};
use crate::transit_models::{
    ChatMessage, ChatRole, Result, RoutePlan, RouteStep, TripPreferences, YourRouteError,
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Clone, Default)]
pub struct ChatTranscript {
    messages: Vec<ChatMessage>,
}

impl ChatTranscript {
    const TITLE_CHARS: usize = 30;

    pub fn push(&mut self, role: ChatRole, content: impl Into<String>) {
        self.messages.push(ChatMessage::new(role, content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// First user message, shortened.
    pub fn title(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| {
                let head: String = m.content.chars().take(Self::TITLE_CHARS).collect();
                format!("{}...", head)
            })
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    data: Option<ChatReply>,
}

pub struct PlannerClient {
    client: reqwest::Client,
    chat_url: String,
}

impl PlannerClient {
    const REQUEST_TIMEOUT_SECS: u64 = 45;

    pub fn new(server_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| YourRouteError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(PlannerClient {
            client,
            chat_url: format!("{}/api/ai/chat", server_url.trim_end_matches('/')),
        })
    }

    async fn post(&self, message: &str, preferences: &TripPreferences) -> Result<ChatReply> {
        let response = self
            .client
            .post(&self.chat_url)
            .json(&json!({ "message": message, "preferences": preferences }))
            .send()
            .await
            .map_err(|e| YourRouteError::NetworkError(format!("AI service not available: {}", e)))?;

        if !response.status().is_success() {
            return Err(YourRouteError::UpstreamError(format!(
                "AI service returned {}",
                response.status()
            )));
        }

        let envelope: Envelope = response
            .json()
            .await
            .map_err(|e| YourRouteError::ParseError(format!("Invalid chat response: {}", e)))?;

        match envelope.data {
            Some(reply) if envelope.success => Ok(reply),
            _ => Err(YourRouteError::UpstreamError("Chat response had no data".to_string())),
        }
    }

    pub async fn ask(&self, message: &str, preferences: &TripPreferences) -> ChatReply {
        match self.post(message, preferences).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("⚠️  {}", e);
                local_fallback(message)
            }
        }
    }
}

/// Shown when the server itself is unreachable.
pub fn local_fallback(message: &str) -> ChatReply {
    let lowered = message.to_lowercase();
    let mentions = |w: &str| {
        lowered
            .split(|c: char| !c.is_alphanumeric())
            .any(|token| token == w)
    };

    if mentions("hello") || mentions("hi") {
        return ChatReply {
            message: "Hello! I'm YourRoute AI. 🚀\n\nHow can I help you plan your journey today?".to_string(),
            routes: Vec::new(),
            source: ReplySource::Fallback,
        };
    }

    if mentions("delhi") || mentions("metro") || mentions("bus") {
        return ChatReply {
            message: "I can help you navigate Delhi's transit system! 🚇\n\nWhat's your destination?".to_string(),
            routes: vec![RoutePlan {
                id: 1,
                title: "Sample Route (Development Mode)".to_string(),
                duration: "25 min".to_string(),
                distance: "8.2 km".to_string(),
                mode: "Metro + Bus".to_string(),
                steps: vec![
                    RouteStep {
                        mode: "walk".to_string(),
                        duration: "3 min".to_string(),
                        description: "Walk to nearest metro station".to_string(),
                    },
                    RouteStep {
                        mode: "metro".to_string(),
                        duration: "15 min".to_string(),
                        description: "Take Yellow Line to Central Secretariat".to_string(),
                    },
                    RouteStep {
                        mode: "bus".to_string(),
                        duration: "7 min".to_string(),
                        description: "Take bus 522 to destination".to_string(),
                    },
                ],
                cost: "₹30".to_string(),
                accessibility: true,
            }],
            source: ReplySource::Fallback,
        };
    }

    ChatReply {
        message: "I'm having trouble connecting to my AI service right now. Please try again later or ask me about Delhi Metro and bus routes.".to_string(),
        routes: Vec::new(),
        source: ReplySource::Fallback,
    }
}

fn step_icon(mode: &str) -> &'static str {
    match mode.to_lowercase().as_str() {
        "walk" => "🚶",
        "metro" => "🚇",
        "bus" => "🚌",
        _ => "➡️",
    }
}

pub fn render_route_card(route: &RoutePlan) -> String {
    let mut card = format!("🗺️  {} ({})\n", route.title, route.mode);
    card.push_str(&format!(
        "   ⏱  {} · 📏 {} · 💰 {} · ♿ {}\n",
        route.duration,
        route.distance,
        route.cost,
        if route.accessibility { "accessible" } else { "not accessible" }
    ));
    for (i, step) in route.steps.iter().enumerate() {
        card.push_str(&format!(
            "   {}. {} {} ({}) - {}\n",
            i + 1,
            step_icon(&step.mode),
            step.mode,
            step.duration,
            step.description
        ));
    }
    card
}

fn print_reply(reply: &ChatReply) {
    println!("\n🤖 {}", reply.message);
    if reply.source == ReplySource::Fallback {
        println!("   (offline answer)");
    }
    for route in &reply.routes {
        println!("\n{}", render_route_card(route));
    }
}

/// Interactive loop on stdin. `/new` starts over, `/history` shows the
/// transcript, `/quit` exits.
pub async fn run_chat(server_url: &str, preferences: TripPreferences) -> Result<()> {
    let client = PlannerClient::new(server_url)?;
    let mut transcript = ChatTranscript::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("💬 YourRoute trip planner ({})", server_url);
    println!("   Type a question, /new, /history or /quit\n");

    loop {
        print!("you> ");
        std::io::Write::flush(&mut std::io::stdout()).ok();

        let line = match lines
            .next_line()
            .await
            .map_err(|e| YourRouteError::FileError(format!("Failed to read stdin: {}", e)))?
        {
            Some(line) => line,
            None => break,
        };

        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" | "/clear" => {
                transcript.clear();
                println!("🧹 New chat started");
            }
            "/history" => {
                if let Some(title) = transcript.title() {
                    println!("📜 {}", title);
                }
                for message in transcript.messages() {
                    let who = match message.role {
                        ChatRole::User => "you",
                        ChatRole::Assistant => "ai",
                    };
                    println!("   [{}] {}: {}", message.timestamp.format("%H:%M:%S"), who, message.content);
                }
            }
            question => {
                transcript.push(ChatRole::User, question);
                let reply = client.ask(question, &preferences).await;
                transcript.push(ChatRole::Assistant, reply.message.clone());
                print_reply(&reply);
            }
        }
    }

    Ok(())
}

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use regex::Regex;
use reqwest::Client as HttpClient;
use serenity::Client;
use serenity::all::{
    ChannelId, Context, EditMessage, EventHandler, GatewayIntents, Http, Message, MessageId,
    ReactionType, Ready,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::calendar::CalendarExporter;
use crate::core::correlation::{CorrelationStore, ParseStatus};
use crate::core::grist::GristClient;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::schemas::{CallbackPayload, Event, ParseMode};

const IMAGE_MAX_BYTES: usize = 10 * 1024 * 1024;
const CDN_TIMEOUT: Duration = Duration::from_secs(30);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_MAX_CHARS: usize = 1800;

const BUSY_MESSAGE: &str =
    "Hmm, I'm having trouble connecting right now. Mind trying again in a moment?";

fn url_regex() -> Regex {
    // Unwrap is fine for a fixed pattern
    Regex::new(r"https?://[^\s<>]+").unwrap()
}

fn extract_url(content: &str) -> Option<String> {
    url_regex().find(content).map(|m| m.as_str().to_string())
}

fn image_attachment_urls(msg: &Message) -> Vec<String> {
    msg.attachments
        .iter()
        .filter(|a| {
            a.content_type
                .as_deref()
                .map(|ct| ct.starts_with("image/"))
                .unwrap_or(false)
        })
        .map(|a| a.url.clone())
        .collect()
}

fn select_parse_mode(url: Option<&str>, image_count: usize) -> Option<(ParseMode, String)> {
    match (url, image_count) {
        (Some(_), n) if n > 0 => Some((ParseMode::Hybrid, format!("link + {} image(s)", n))),
        (None, n) if n > 0 => Some((ParseMode::Image, format!("{} image(s)", n))),
        (Some(_), _) => Some((ParseMode::Url, "event link".to_string())),
        (None, 0) => None,
        _ => None,
    }
}

/// Split digest markdown into chat-sized chunks along line boundaries.
fn chunk_lines(markdown: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in markdown.split('\n') {
        if !current.is_empty() && current.chars().count() + line.chars().count() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            current.push_str(line);
        } else {
            current.push('\n');
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn format_event_reply(event: &Event, result_url: Option<&str>) -> String {
    let mut lines = vec![format!("**{}**", event.title)];

    if let Some(ref start) = event.start_datetime {
        lines.push(format!("When: {}", start));
    }

    if let Some(ref location) = event.location {
        match (&location.venue, &location.address) {
            (Some(venue), Some(address)) => lines.push(format!("Where: {}, {}", venue, address)),
            (Some(venue), None) => lines.push(format!("Where: {}", venue)),
            (None, Some(address)) => lines.push(format!("Where: {}", address)),
            (None, None) => {}
        }
    }

    if let Some(ref description) = event.description {
        if !description.is_empty() {
            let shown = if description.chars().count() > 200 {
                let cut: String = description.chars().take(197).collect();
                format!("{}...", cut)
            } else {
                description.clone()
            };
            lines.push(format!("\n{}", shown));
        }
    }

    if let Some(ref price) = event.price {
        lines.push(format!("Price: {}", price));
    }

    if let Some(result_url) = result_url {
        lines.push(format!("\nSaved to: {}", result_url));
    }

    if let Some(confidence) = event.confidence_score {
        if confidence < 0.7 {
            lines.push("\n_Note: Some details may be incomplete_".to_string());
        }
    }

    lines.join("\n")
}

/// Routes completion callbacks back into chat: settles the correlation row,
/// swaps the placeholder for the final reply and records the new reply id.
pub struct CompletionNotifier {
    http: Arc<Http>,
    store: Arc<CorrelationStore>,
    channels: Vec<u64>,
}

impl CompletionNotifier {
    pub fn new(http: Arc<Http>, store: Arc<CorrelationStore>, channels: Vec<u64>) -> Self {
        Self {
            http,
            store,
            channels,
        }
    }

    pub async fn handle_parse_complete(&self, payload: CallbackPayload) {
        let status = if payload.status == "completed" {
            ParseStatus::Completed
        } else {
            ParseStatus::Failed
        };

        let record = match self
            .store
            .complete(&payload.request_id, status, payload.result_url.as_deref())
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!("No request found for agent ID {}", payload.request_id);
                return;
            }
            Err(e) => {
                error!("Correlation update failed for {}: {}", payload.request_id, e);
                return;
            }
        };

        if let Some(record_id) = payload.record_id {
            if let Err(e) = self.store.set_record_id(&payload.request_id, record_id).await {
                warn!("Failed to store record id for {}: {}", payload.request_id, e);
            }
        }

        // The row does not remember its channel; scan the monitored ones.
        let mut found = None;
        for channel_id in &self.channels {
            let channel = ChannelId::new(*channel_id);
            if let Ok(message) = self
                .http
                .get_message(channel, MessageId::new(record.response_message_id))
                .await
            {
                found = Some((channel, message));
                break;
            }
        }
        let Some((channel, placeholder)) = found else {
            error!(
                "Could not find response message {}",
                record.response_message_id
            );
            return;
        };

        if let Err(e) = placeholder.delete(&self.http).await {
            warn!("Failed to delete placeholder message: {}", e);
        }

        let original = match self
            .http
            .get_message(channel, MessageId::new(record.origin_message_id))
            .await
        {
            Ok(message) => message,
            Err(e) => {
                error!("Message {} not found: {}", record.origin_message_id, e);
                return;
            }
        };

        let content = match (&status, &payload.event) {
            (ParseStatus::Completed, Some(event)) => {
                format_event_reply(event, payload.result_url.as_deref())
            }
            (ParseStatus::Completed, None) => match payload.result_url {
                Some(ref url) => format!("All set! I've added your event: {}", url),
                None => "All set! Your event has been added.".to_string(),
            },
            _ => {
                let error_msg = payload.error.as_deref().unwrap_or("Unknown error");
                format!(
                    "I couldn't parse that link. {}\nCould you double-check it's an event link and try again?",
                    error_msg
                )
            }
        };

        match original.reply(&self.http, content).await {
            Ok(final_reply) => {
                if let Err(e) = self
                    .store
                    .update_response_id(&payload.request_id, final_reply.id.get())
                    .await
                {
                    warn!("Failed to update response id: {}", e);
                }
                info!(
                    "Completed processing for agent request {}",
                    payload.request_id
                );
            }
            Err(e) => error!("Failed to send completion reply: {}", e),
        }
    }
}

struct Handler {
    store: Arc<CorrelationStore>,
    grist: Arc<GristClient>,
    exporter: Arc<CalendarExporter>,
    monitored_channels: HashSet<u64>,
    agent_api_url: String,
    callback_url: String,
    client: HttpClient,
}

impl Handler {
    async fn handle_calendar_command(&self, ctx: &Context, msg: &Message) {
        info!("Calendar export requested by {}", msg.author.name);

        let mut response = match msg.reply(&ctx.http, "📅 Generating calendar export...").await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send calendar placeholder: {}", e);
                return;
            }
        };

        match self.exporter.export(None).await {
            Ok(markdown) => {
                if markdown.chars().count() <= 1900 {
                    let content = format!("```markdown\n{}\n```", markdown);
                    if let Err(e) = response
                        .edit(&ctx.http, EditMessage::new().content(content))
                        .await
                    {
                        error!("Failed to edit calendar reply: {}", e);
                    }
                } else {
                    let _ = response
                        .edit(
                            &ctx.http,
                            EditMessage::new().content("Calendar export (split due to length):"),
                        )
                        .await;
                    for chunk in chunk_lines(&markdown, CHUNK_MAX_CHARS) {
                        if let Err(e) = msg
                            .channel_id
                            .say(&ctx.http, format!("```markdown\n{}\n```", chunk))
                            .await
                        {
                            error!("Failed to send calendar chunk: {}", e);
                            break;
                        }
                    }
                }
                info!("Calendar export completed, {} chars", markdown.len());
            }
            Err(e) => {
                error!("Error generating calendar: {}", e);
                let _ = response
                    .edit(
                        &ctx.http,
                        EditMessage::new()
                            .content("Sorry, there was an error generating the calendar export."),
                    )
                    .await;
            }
        }
    }

    /// A reply to one of our event confirmations sets the editorial text on
    /// the stored record.
    async fn handle_potential_editorial_reply(&self, ctx: &Context, msg: &Message) {
        let Some(replied_to) = msg.referenced_message.as_deref().map(|m| m.id.get()).or_else(
            || {
                msg.message_reference
                    .as_ref()
                    .and_then(|r| r.message_id.map(|id| id.get()))
            },
        ) else {
            return;
        };

        let record = match self.store.get_by_response_id(replied_to).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                error!("Editorial lookup failed: {}", e);
                return;
            }
        };

        let Some(record_id) = record.record_id else {
            warn!(
                "Reply to event message {} but no record id stored",
                replied_to
            );
            return;
        };

        let editorial = msg.content.trim();
        if editorial.is_empty() {
            return;
        }

        info!("Updating editorial for record {}", record_id);

        if self.grist.update_editorial(record_id, editorial).await {
            let _ = msg
                .react(&ctx.http, ReactionType::Unicode("✅".to_string()))
                .await;
        } else {
            let _ = msg
                .react(&ctx.http, ReactionType::Unicode("❌".to_string()))
                .await;
            let _ = msg
                .reply(
                    &ctx.http,
                    "Sorry, I couldn't update the editorial text. Please try again.",
                )
                .await;
        }
    }

    async fn download_image(&self, image_url: &str) -> Option<String> {
        let res = self
            .client
            .get(image_url)
            .timeout(CDN_TIMEOUT)
            .send()
            .await;
        match res {
            Ok(res) if res.status().is_success() => match res.bytes().await {
                Ok(bytes) => {
                    if bytes.len() > IMAGE_MAX_BYTES {
                        warn!("Image too large: {} bytes", bytes.len());
                        return None;
                    }
                    Some(base64::engine::general_purpose::STANDARD.encode(&bytes))
                }
                Err(e) => {
                    error!("Error reading image body: {}", e);
                    None
                }
            },
            Ok(res) => {
                error!("Failed to download image: status {}", res.status());
                None
            }
            Err(e) => {
                error!("Error downloading image: {}", e);
                None
            }
        }
    }

    /// Submit the job to the agent. Returns the agent's request id when the
    /// submission was accepted.
    async fn send_to_agent(
        &self,
        url: Option<&str>,
        origin_message_id: u64,
        parse_mode: ParseMode,
        image_b64: Option<String>,
    ) -> Option<String> {
        let mut payload = serde_json::json!({
            "callback_url": self.callback_url,
            "origin_message_id": origin_message_id,
            "parse_mode": parse_mode,
        });
        if let Some(url) = url {
            payload["url"] = serde_json::json!(url);
        }
        let image_len = image_b64.as_ref().map(|i| i.len());
        if let Some(image_b64) = image_b64 {
            payload["image_base64"] = serde_json::Value::String(image_b64);
        }

        info!(
            "Sending to agent: mode={:?}, url={:?}, image={:?} chars",
            parse_mode, url, image_len
        );

        let res = self
            .client
            .post(&self.agent_api_url)
            .json(&payload)
            .timeout(SUBMIT_TIMEOUT)
            .send()
            .await;

        match res {
            Ok(res) if res.status().is_success() => {
                let data: serde_json::Value = res.json().await.ok()?;
                data["request_id"].as_str().map(str::to_string)
            }
            Ok(res) => {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                error!("Agent API returned status {}: {}", status, body);
                None
            }
            Err(e) => {
                error!("Error calling agent API: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _: Context, ready: Ready) {
        info!("Bot logged in as {}", ready.user.name);
        info!("Monitoring channels: {:?}", self.monitored_channels);
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        if !self.monitored_channels.contains(&msg.channel_id.get()) {
            return;
        }

        if msg.content.trim().eq_ignore_ascii_case("!calendar") {
            self.handle_calendar_command(&ctx, &msg).await;
            return;
        }

        // A reply may set editorial text and still contain a new link
        if msg.message_reference.is_some() {
            self.handle_potential_editorial_reply(&ctx, &msg).await;
        }

        let url = extract_url(&msg.content);
        let images = image_attachment_urls(&msg);

        let Some((mut parse_mode, target_desc)) = select_parse_mode(url.as_deref(), images.len())
        else {
            return;
        };

        info!(
            "Processing message {} ({:?}): url={:?}, images={}",
            msg.id,
            parse_mode,
            url,
            images.len()
        );

        let mut response = match msg
            .reply(&ctx.http, format!("⏳ Parsing {}...", target_desc))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send placeholder reply: {}", e);
                return;
            }
        };

        match self
            .store
            .create_request(msg.id.get(), response.id.get())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                info!("Message {} already tracked, skipping", msg.id);
                let _ = response.delete(&ctx.http).await;
                return;
            }
            Err(e) => {
                error!("Failed to track message {}: {}", msg.id, e);
                return;
            }
        }

        let mut image_b64 = None;
        if let Some(first_image) = images.first() {
            image_b64 = self.download_image(first_image).await;
            if image_b64.is_none() {
                warn!("Failed to download image for message {}", msg.id);
                if parse_mode == ParseMode::Image {
                    let _ = response
                        .edit(
                            &ctx.http,
                            EditMessage::new().content(
                                "Sorry, I couldn't download that image. Could you try uploading it again?",
                            ),
                        )
                        .await;
                    let _ = self.store.fail_by_origin(msg.id.get()).await;
                    return;
                }
                // Hybrid falls back to the URL alone
                parse_mode = ParseMode::Url;
            }
        }

        match self
            .send_to_agent(url.as_deref(), msg.id.get(), parse_mode, image_b64)
            .await
        {
            Some(request_id) => {
                if let Err(e) = self.store.assign_request(msg.id.get(), &request_id).await {
                    error!("Failed to assign request id: {}", e);
                }
                info!("Message {} sent to agent with ID {}", msg.id, request_id);
            }
            None => {
                let _ = response
                    .edit(&ctx.http, EditMessage::new().content(BUSY_MESSAGE))
                    .await;
                let _ = self.store.fail_by_origin(msg.id.get()).await;
            }
        }
    }
}

pub struct DiscordConsumerConfig {
    pub token: String,
    pub channels: Vec<u64>,
    pub agent_api_url: String,
    pub callback_url: String,
    pub store: Arc<CorrelationStore>,
    pub grist: Arc<GristClient>,
    pub exporter: Arc<CalendarExporter>,
}

/// Discord gateway consumer: watches configured channels for event links and
/// flyer images and turns them into parse jobs.
pub struct DiscordConsumer {
    config: DiscordConsumerConfig,
}

impl DiscordConsumer {
    pub fn new(config: DiscordConsumerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LifecycleComponent for DiscordConsumer {
    async fn on_init(&mut self) -> Result<()> {
        info!("Discord Consumer Interface initializing...");
        Ok(())
    }

    async fn on_start(&mut self) -> Result<()> {
        let handler = Handler {
            store: Arc::clone(&self.config.store),
            grist: Arc::clone(&self.config.grist),
            exporter: Arc::clone(&self.config.exporter),
            monitored_channels: self.config.channels.iter().copied().collect(),
            agent_api_url: self.config.agent_api_url.clone(),
            callback_url: self.config.callback_url.clone(),
            client: HttpClient::new(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES | GatewayIntents::MESSAGE_CONTENT;

        match Client::builder(&self.config.token, intents)
            .event_handler(handler)
            .await
        {
            Ok(mut client) => {
                tokio::spawn(async move {
                    if let Err(why) = client.start().await {
                        error!("Discord client error: {:?}", why);
                    }
                });
            }
            Err(e) => {
                error!("Failed to create Discord client: {}. Discord disabled.", e);
            }
        }
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        info!("Discord Consumer Interface shutting down...");
        Ok(())
    }
}

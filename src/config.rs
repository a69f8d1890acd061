use anyhow::{Result, bail};
use chrono::Weekday;
use std::env;

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Application settings loaded from environment variables. A `.env` file in
/// the working directory is honored when present.
#[derive(Debug, Clone)]
pub struct Settings {
    // Gemini API
    pub gemini_api_key: String,
    pub gemini_model: String,

    // HTTP server
    pub host: String,
    pub port: u16,

    // Headless-browser fetch service
    pub browser_fetch_url: String,

    // Grist record store
    pub grist_api_key: String,
    pub grist_api_base: String,
    pub grist_doc_id: String,
    pub grist_table: String,
    pub grist_ui_base: String,
    pub grist_ui_doc_id: String,
    pub grist_ui_page: String,

    // Discord consumer; the component is skipped when the token is empty
    pub discord_token: String,
    pub discord_channels: Vec<u64>,
    pub agent_api_url: String,
    pub callback_url: String,
    pub db_path: String,

    // Pipeline policy
    pub low_confidence_threshold: f64,
    pub calendar_week_start: Weekday,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let port: u16 = var_or("PORT", "8000").parse()?;
        let default_api = format!("http://localhost:{}/api/parse", port);
        let default_callback = format!("http://localhost:{}/api/callback", port);

        let settings = Self {
            gemini_api_key: var_or("GEMINI_API_KEY", ""),
            gemini_model: var_or("GEMINI_MODEL", "gemini-2.0-flash"),
            host: var_or("HOST", "0.0.0.0"),
            port,
            browser_fetch_url: var_or("BROWSER_FETCH_URL", "http://localhost:3333/fetch"),
            grist_api_key: var_or("GRIST_API_KEY", ""),
            grist_api_base: var_or("GRIST_API_BASE", "https://docs.getgrist.com/api"),
            grist_doc_id: var_or("GRIST_DOC_ID", ""),
            grist_table: var_or("GRIST_TABLE", "Events"),
            grist_ui_base: var_or("GRIST_UI_BASE", "https://docs.getgrist.com"),
            grist_ui_doc_id: var_or("GRIST_UI_DOC_ID", ""),
            grist_ui_page: var_or("GRIST_UI_PAGE", "Events"),
            discord_token: var_or("DISCORD_TOKEN", ""),
            discord_channels: parse_channels(&var_or("DISCORD_CHANNELS", ""))?,
            agent_api_url: var_or("AGENT_API_URL", &default_api),
            callback_url: var_or("CALLBACK_URL", &default_callback),
            db_path: var_or("DB_PATH", "weave_bot.db"),
            low_confidence_threshold: var_or("LOW_CONFIDENCE_THRESHOLD", "0.3").parse()?,
            calendar_week_start: parse_weekday(&var_or("CALENDAR_WEEK_START", "monday"))?,
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn discord_enabled(&self) -> bool {
        !self.discord_token.is_empty()
    }

    fn validate(&self) -> Result<()> {
        if self.gemini_api_key.is_empty() {
            bail!("GEMINI_API_KEY is required");
        }
        if self.discord_enabled() && self.discord_channels.is_empty() {
            bail!("DISCORD_CHANNELS is required when DISCORD_TOKEN is set");
        }
        Ok(())
    }
}

fn parse_channels(raw: &str) -> Result<Vec<u64>> {
    let mut channels = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse() {
            Ok(id) => channels.push(id),
            Err(_) => bail!("Invalid channel id in DISCORD_CHANNELS: {}", part),
        }
    }
    Ok(channels)
}

fn parse_weekday(raw: &str) -> Result<Weekday> {
    match raw.trim().to_lowercase().as_str() {
        "monday" | "mon" => Ok(Weekday::Mon),
        "tuesday" | "tue" => Ok(Weekday::Tue),
        "wednesday" | "wed" => Ok(Weekday::Wed),
        "thursday" | "thu" => Ok(Weekday::Thu),
        "friday" | "fri" => Ok(Weekday::Fri),
        "saturday" | "sat" => Ok(Weekday::Sat),
        "sunday" | "sun" => Ok(Weekday::Sun),
        other => bail!("Invalid CALENDAR_WEEK_START: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_list_parses_with_whitespace() {
        assert_eq!(
            parse_channels("123, 456 ,789").unwrap(),
            vec![123, 456, 789]
        );
        assert!(parse_channels("").unwrap().is_empty());
        assert!(parse_channels("123,abc").is_err());
    }

    #[test]
    fn weekday_parses_long_and_short_names() {
        assert_eq!(parse_weekday("Monday").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday("sun").unwrap(), Weekday::Sun);
        assert!(parse_weekday("someday").is_err());
    }
}

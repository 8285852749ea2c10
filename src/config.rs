use std::{env, net::SocketAddr, path::PathBuf};

use url::Url;

use crate::error::AppError;

const DEFAULT_AI_BASE: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_AI_MODEL: &str = "gemini-1.5-flash";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub listen_addr: SocketAddr,
    pub data_root: PathBuf,
    pub static_root: PathBuf,
    pub cookie_secret: String,
    /// Institutional domains allowed to sign up. Empty means any domain.
    pub allowed_email_domains: Vec<String>,
    pub ai: Option<AiConfig>,
    pub osrm_url: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_base: Url,
    pub api_key: String,
    pub model: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://carpool.db".to_string());
        let listen_addr: SocketAddr = env::var("APP_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid APP_LISTEN_ADDR: {err}")))?;

        let data_root = env::var("DATA_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let static_root = env::var("STATIC_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("static"));

        let cookie_secret = env::var("COOKIE_SECRET")
            .unwrap_or_else(|_| "change-me-campus-carpool-cookie-secret".to_string());

        let allowed_email_domains = env::var("ALLOWED_EMAIL_DOMAINS")
            .map(|raw| parse_domain_list(&raw))
            .unwrap_or_default();

        let ai = match env::var("AI_API_KEY") {
            Ok(api_key) if !api_key.trim().is_empty() => {
                let api_base = env::var("AI_API_BASE").unwrap_or_else(|_| DEFAULT_AI_BASE.into());
                let api_base = Url::parse(&api_base)
                    .map_err(|err| AppError::Config(format!("invalid AI_API_BASE: {err}")))?;
                let model = env::var("AI_MODEL").unwrap_or_else(|_| DEFAULT_AI_MODEL.into());
                Some(AiConfig {
                    api_base,
                    api_key: api_key.trim().to_string(),
                    model,
                })
            }
            _ => None,
        };

        let osrm_url = match env::var("OSRM_URL") {
            Ok(raw) if !raw.trim().is_empty() => Some(
                Url::parse(raw.trim())
                    .map_err(|err| AppError::Config(format!("invalid OSRM_URL: {err}")))?,
            ),
            _ => None,
        };

        Ok(Self {
            database_url,
            listen_addr,
            data_root,
            static_root,
            cookie_secret,
            allowed_email_domains,
            ai,
            osrm_url,
        })
    }

    pub fn allows_domain(&self, domain: &str) -> bool {
        self.allowed_email_domains.is_empty()
            || self
                .allowed_email_domains
                .iter()
                .any(|allowed| allowed == domain)
    }
}

fn parse_domain_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().trim_start_matches('@').to_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.ring.com";
pub const DEFAULT_OAUTH_URL: &str = "https://oauth.ring.com/oauth/token";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_agent: String,
    pub api_url: String,
    pub oauth_url: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: "nestcam".to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            oauth_url: DEFAULT_OAUTH_URL.to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

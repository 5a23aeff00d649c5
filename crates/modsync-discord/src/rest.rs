// # Discord REST Client
//
// Thin command client for the Discord HTTP API v10.
//
// ## Responsibilities
//
// - One HTTP request per call; retry, backoff and time bounds belong to the
//   replicator
// - Map HTTP status codes onto the core error taxonomy so transient failures
//   (429, 5xx, transport) can be told apart from final ones (401, 403, 404)
// - Attach the audit log reason to every mutation
// - Dry-run mode: lookups are performed, mutations are only logged
//
// ## Security Requirements
//
// - The bot token NEVER appears in logs or `Debug` output
// - An empty token is rejected at construction
//
// ## API Reference
//
// - Create ban: PUT `/guilds/{guild}/bans/{user}`
// - Remove ban: DELETE `/guilds/{guild}/bans/{user}`
// - Timeout: PATCH `/guilds/{guild}/members/{user}` `{communication_disabled_until}`
// - Lookups: GET `/users/@me`, `/gateway/bot`, `/guilds/{guild}/members/{user}`,
//   `/guilds/{guild}/roles`, `/guilds/{guild}/bans/{user}`

use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use modsync_core::{BanRequest, Error, GuildId, Result, UserId};

use crate::api;

/// Discord API base URL
pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// HTTP timeout for API requests
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/modsync-lab/modsync, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Discord REST client
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct DiscordRest {
    /// Bot token
    /// ⚠️ NEVER log this value
    token: Arc<str>,

    base_url: String,

    client: reqwest::Client,

    /// Dry-run mode: perform lookups but skip mutations
    dry_run: bool,
}

// Custom Debug implementation that hides the bot token
impl std::fmt::Debug for DiscordRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordRest")
            .field("token", &"<REDACTED>")
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl DiscordRest {
    /// Create a client for the public API
    pub fn new(token: impl Into<String>, dry_run: bool) -> Result<Self> {
        Self::with_base_url(token, DISCORD_API_BASE, dry_run)
    }

    /// Create a client against another base URL (proxies, tests)
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
        dry_run: bool,
    ) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(Error::config("Discord bot token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            token: Arc::from(token.trim()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            dry_run,
        })
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Token for the gateway IDENTIFY payload
    pub(crate) fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", format!("Bot {}", self.token))
    }

    /// Send and map transport and status failures
    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::network(format!("{}: request timed out", what))
            } else {
                Error::network(format!("{}: HTTP request failed: {}", what, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let header_retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to read error response".to_string());

        let retry_after = parse_retry_after(header_retry_after.as_deref(), &body);
        Err(status_error(status, retry_after, &body, what))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path), what).await?;
        response
            .json()
            .await
            .map_err(|e| Error::platform(format!("{}: failed to parse response: {}", what, e)))
    }

    /// The bot's own user
    pub async fn current_user(&self) -> Result<api::User> {
        self.get_json("/users/@me", "current user lookup").await
    }

    /// Gateway URL for this bot
    pub async fn gateway_url(&self) -> Result<String> {
        let bot: api::GatewayBot = self.get_json("/gateway/bot", "gateway lookup").await?;
        Ok(bot.url)
    }

    pub async fn get_member(&self, guild: GuildId, user: UserId) -> Result<api::Member> {
        self.get_json(
            &format!("/guilds/{}/members/{}", guild, user),
            "member lookup",
        )
        .await
    }

    pub async fn get_roles(&self, guild: GuildId) -> Result<Vec<api::Role>> {
        self.get_json(&format!("/guilds/{}/roles", guild), "role lookup")
            .await
    }

    pub async fn get_ban(&self, guild: GuildId, user: UserId) -> Result<api::Ban> {
        self.get_json(&format!("/guilds/{}/bans/{}", guild, user), "ban lookup")
            .await
    }

    /// Ban a user; works for users that are not members
    pub async fn create_ban(
        &self,
        guild: GuildId,
        user: UserId,
        request: &BanRequest,
    ) -> Result<()> {
        let path = format!("/guilds/{}/bans/{}", guild, user);
        let payload = serde_json::json!({
            "delete_message_seconds": request.delete_message_secs,
        });
        self.mutate(Method::PUT, &path, Some(payload), &request.reason, "ban")
            .await
    }

    pub async fn remove_ban(&self, guild: GuildId, user: UserId, reason: &str) -> Result<()> {
        let path = format!("/guilds/{}/bans/{}", guild, user);
        self.mutate(Method::DELETE, &path, None, reason, "unban")
            .await
    }

    /// Set or clear a member's timeout
    pub async fn set_communication_disabled_until(
        &self,
        guild: GuildId,
        user: UserId,
        until: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<()> {
        let path = format!("/guilds/{}/members/{}", guild, user);
        let payload = serde_json::json!({
            "communication_disabled_until":
                until.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        });
        let what = if until.is_some() { "timeout" } else { "timeout removal" };
        self.mutate(Method::PATCH, &path, Some(payload), reason, what)
            .await
    }

    async fn mutate(
        &self,
        method: Method,
        path: &str,
        payload: Option<serde_json::Value>,
        reason: &str,
        what: &str,
    ) -> Result<()> {
        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would send {} request to {} with payload: {} (reason: {})",
                method,
                self.url(path),
                payload.as_ref().map(|p| p.to_string()).unwrap_or_default(),
                reason
            );
            return Ok(());
        }

        let mut request = self
            .request(method, path)
            .header("X-Audit-Log-Reason", encode_audit_reason(reason));
        if let Some(payload) = payload {
            request = request.json(&payload);
        }

        self.send(request, what).await?;
        Ok(())
    }
}

/// Percent-encode an audit log reason for the header
pub fn encode_audit_reason(reason: &str) -> String {
    urlencoding::encode(reason).into_owned()
}

/// Server-requested wait from a 429: the JSON body is more precise than the header
pub fn parse_retry_after(header: Option<&str>, body: &str) -> Option<Duration> {
    let from_body = serde_json::from_str::<api::RateLimitBody>(body)
        .ok()
        .map(|limit| limit.retry_after);
    let from_header = header.and_then(|value| value.trim().parse::<f64>().ok());

    from_body
        .or(from_header)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Map a non-success status onto the error taxonomy
pub fn status_error(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
    what: &str,
) -> Error {
    match status.as_u16() {
        401 => Error::auth(format!("{}: invalid bot token. Status: {}", what, status)),
        403 => Error::forbidden(format!("{}: {} - {}", what, status, body)),
        404 => Error::not_found(format!("{}: {} - {}", what, status, body)),
        429 => Error::rate_limited(
            format!("{}: rate limit exceeded. Status: {}", what, status),
            retry_after,
        ),
        500..=599 => Error::http(format!("{}: Discord server error (transient): {} - {}", what, status, body)),
        _ => Error::platform(format!("{} failed: {} - {}", what, status, body)),
    }
}

//! Status page served on the onion service's auxiliary port

use std::path::Path;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Name shown when the profile has none
pub const DEFAULT_NAME: &str = "murmur agent";

/// Contents of `profile.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Short description
    #[serde(default)]
    pub bio: String,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            name: DEFAULT_NAME.to_string(),
            bio: String::new(),
        }
    }
}

impl Profile {
    /// Read `path`, falling back to defaults when missing or malformed
    pub fn load(path: &Path) -> Self {
        let parsed = std::fs::read(path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Profile>(&bytes).ok());
        match parsed {
            Some(mut profile) => {
                if profile.name.is_empty() {
                    profile.name = DEFAULT_NAME.to_string();
                }
                profile
            }
            None => Profile::default(),
        }
    }
}

/// Everything rendered on the page
#[derive(Debug, Clone)]
pub struct StatusPage {
    /// Operator profile
    pub profile: Profile,
    /// Our address
    pub address: String,
    /// Crate version
    pub version: String,
}

impl StatusPage {
    /// Page for `address` with the current crate version
    pub fn new(profile: Profile, address: impl Into<String>) -> Self {
        StatusPage {
            profile,
            address: address.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// The HTML document
    pub fn render(&self) -> String {
        let bio = if self.profile.bio.is_empty() {
            String::new()
        } else {
            format!("<p class=\"bio\">{}</p>\n", escape_html(&self.profile.bio))
        };
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{name}</title>
<style>
  body {{ background: #0a0a0a; color: #c8c8c8; font-family: monospace; max-width: 720px; margin: 0 auto; padding: 40px 20px; }}
  h1 {{ color: #ff6600; }}
  .bio {{ color: #777; }}
  code {{ display: block; background: #111; padding: 8px 12px; word-break: break-all; }}
  footer {{ margin-top: 48px; color: #444; font-size: 11px; }}
</style>
</head>
<body>
<h1>{name}</h1>
{bio}<h2>Address</h2>
<code>{address}.onion</code>
<footer>murmur v{version}</footer>
</body>
</html>
"#,
            name = escape_html(&self.profile.name),
            bio = bio,
            address = escape_html(&self.address),
            version = escape_html(&self.version),
        )
    }
}

/// Escape text for HTML element and attribute content
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

async fn index(State(page): State<Arc<String>>) -> impl IntoResponse {
    (
        [
            (header::CACHE_CONTROL, "no-store"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
            (header::X_FRAME_OPTIONS, "DENY"),
            (header::REFERRER_POLICY, "no-referrer"),
        ],
        Html(page.as_str().to_owned()),
    )
}

/// Router serving the page at every path
pub fn router(page: &StatusPage) -> Router {
    let rendered = Arc::new(page.render());
    Router::new()
        .route("/", get(index))
        .fallback(index)
        .with_state(rendered)
}

/// Serve `page` on `listener` until `token` fires
pub async fn serve(listener: TcpListener, page: StatusPage, token: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "status page listening");
    }
    axum::serve(listener, router(&page))
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    debug!("status page stopped");
    Ok(())
}

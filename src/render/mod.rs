//! Message rendering for campaign steps.
//!
//! Two token dialects are understood:
//! - structured: `{{contact.first_name}}`, `{{agent.name}}`, ...
//! - legacy brackets found in older campaign content: `<client_first_name>`,
//!   `<agent_name>`, `<current_date>`, ...
//!
//! Structured tokens are resolved first, legacy tokens second, and the
//! compliance opt-out suffix is appended last (at most once).

pub mod fields;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

pub use fields::{FieldIndex, PersonName, normalize_key, normalize_phone};

use crate::config::EngineConfig;

/// Fallback values used when a lead or campaign lacks the information.
#[derive(Debug, Clone)]
pub struct RenderDefaults {
    pub agent_name: String,
    pub campaign_name: String,
    pub folder_name: String,
    pub opt_out_suffix: String,
}

impl RenderDefaults {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            agent_name: config.default_agent_name.clone(),
            campaign_name: config.default_campaign_name.clone(),
            folder_name: config.default_folder_name.clone(),
            opt_out_suffix: config.opt_out_suffix.clone(),
        }
    }
}

/// Everything a step template may refer to.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub contact: PersonName,
    pub agent: Option<PersonName>,
    pub campaign_name: Option<String>,
    pub folder_name: Option<String>,
    pub now: DateTime<Utc>,
    pub timezone: Tz,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    defaults: RenderDefaults,
}

impl Renderer {
    pub fn new(defaults: RenderDefaults) -> Self {
        Self { defaults }
    }

    /// Render a step body for one lead.
    pub fn render(&self, text: &str, ctx: &RenderContext) -> String {
        // The default agent label is a phrase, not a name to split.
        let agent = ctx.agent.clone().unwrap_or_else(|| PersonName {
            first: None,
            last: None,
            full: Some(self.defaults.agent_name.clone()),
        });

        let body = render_structured(text, &ctx.contact, &agent);
        let body = self.render_legacy(&body, ctx, &agent);
        append_opt_out(&body, &self.defaults.opt_out_suffix)
    }

    fn render_legacy(&self, text: &str, ctx: &RenderContext, agent: &PersonName) -> String {
        replace_tokens(text, '<', '>', |inner| {
            if inner.is_empty() || !inner.chars().all(|c| c.is_ascii_alphabetic() || c == '_') {
                return None;
            }
            let local = ctx.now.with_timezone(&ctx.timezone);
            let value = match inner.to_ascii_lowercase().as_str() {
                "client_first_name" | "first_name" => {
                    ctx.contact.first.clone().unwrap_or_else(|| "there".to_string())
                }
                "client_last_name" | "last_name" => ctx.contact.last.clone().unwrap_or_default(),
                "client_full_name" | "client_name" | "full_name" => {
                    ctx.contact.full.clone().unwrap_or_else(|| "there".to_string())
                }
                "agent_name" | "agent_full_name" => agent
                    .full
                    .clone()
                    .unwrap_or_else(|| self.defaults.agent_name.clone()),
                "agent_first_name" => agent
                    .first
                    .clone()
                    .unwrap_or_else(|| self.defaults.agent_name.clone()),
                "agent_last_name" => agent.last.clone().unwrap_or_default(),
                "campaign_name" => ctx
                    .campaign_name
                    .clone()
                    .unwrap_or_else(|| self.defaults.campaign_name.clone()),
                "folder_name" => ctx
                    .folder_name
                    .clone()
                    .unwrap_or_else(|| self.defaults.folder_name.clone()),
                "current_date" | "date" => local.format("%B %-d, %Y").to_string(),
                "current_time" | "time" => local.format("%-I:%M %p").to_string(),
                _ => return None,
            };
            Some(value)
        })
    }
}

fn render_structured(text: &str, contact: &PersonName, agent: &PersonName) -> String {
    replace_tokens(text, '{', '}', |inner| {
        let (namespace, field) = inner.trim().split_once('.')?;
        let (person, is_agent) = match namespace.trim() {
            "contact" | "lead" | "client" => (contact, false),
            "agent" | "user" => (agent, true),
            _ => return None,
        };
        let value = match normalize_key(field).as_str() {
            "firstname" | "first" if is_agent => person.first.clone().or_else(|| person.full.clone()),
            "firstname" | "first" => person.first.clone(),
            "lastname" | "last" => person.last.clone(),
            "fullname" | "name" => person.full.clone(),
            _ => return None,
        };
        Some(value.unwrap_or_default())
    })
}

/// Replace every delimited token for which `resolve` returns a value.
///
/// Structured tokens use doubled braces; legacy tokens use single angle
/// brackets. Unresolved tokens are copied through untouched.
fn replace_tokens<F>(text: &str, open: char, close: char, mut resolve: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let (open_tok, close_tok) = if open == '{' {
        ("{{".to_string(), "}}".to_string())
    } else {
        (open.to_string(), close.to_string())
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(&open_tok) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + open_tok.len()..];

        match after_open.find(&close_tok) {
            Some(end) if !after_open[..end].contains(&open_tok) => {
                let inner = &after_open[..end];
                match resolve(inner) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str(&open_tok);
                        out.push_str(inner);
                        out.push_str(&close_tok);
                    }
                }
                rest = &after_open[end + close_tok.len()..];
            }
            _ => {
                out.push_str(&open_tok);
                rest = after_open;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Append the opt-out suffix unless the body already carries it.
pub fn append_opt_out(body: &str, suffix: &str) -> String {
    let suffix = suffix.trim();
    if suffix.is_empty() {
        return body.to_string();
    }
    if body.to_lowercase().contains(&suffix.to_lowercase()) {
        return body.to_string();
    }

    let trimmed = body.trim_end();
    if trimmed.is_empty() {
        return suffix.to_string();
    }
    format!("{}\n\n{}", trimmed, suffix)
}

//! Configuration types for the network tap.

use serde::{Deserialize, Serialize};

use crate::classify::DEFAULT_KEYWORDS;

pub const DEFAULT_CONSOLE_KEYWORDS: &[&str] = &["弹幕", "chat"];

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// URL substrings that mark a request as chat-relevant (case-insensitive).
    pub keywords: Vec<String>,
    /// Console text fragments worth logging on platforms that watch the console.
    pub console_keywords: Vec<String>,
    pub channel_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub idle_poll_ms: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            keywords: DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            console_keywords: DEFAULT_CONSOLE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
            channel_capacity: 1024,
            shutdown_grace_ms: 2000,
            idle_poll_ms: 100,
        }
    }
}

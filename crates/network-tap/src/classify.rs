/// Keyword set used when no configuration overrides it.
pub const DEFAULT_KEYWORDS: &[&str] = &["chat", "message", "comment", "im", "push", "fetch"];

/// Stateless, per-request URL classification.
#[derive(Clone, Debug)]
pub struct Classifier {
    keywords: Vec<String>,
}

impl Classifier {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.as_ref().trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// First keyword found in the URL, if any.
    pub fn matched(&self, url: &str) -> Option<&str> {
        let url = url.to_lowercase();
        self.keywords
            .iter()
            .find(|keyword| url.contains(keyword.as_str()))
            .map(String::as_str)
    }

    pub fn is_chat_relevant(&self, url: &str) -> bool {
        self.matched(url).is_some()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webcast_fetch_is_chat_relevant() {
        let classifier = Classifier::default();
        assert!(classifier.is_chat_relevant("https://x.com/webcast/im/fetch"));
    }

    #[test]
    fn static_asset_is_not_chat_relevant() {
        let classifier = Classifier::default();
        assert!(!classifier.is_chat_relevant("https://x.com/static/logo.png"));
    }

    #[test]
    fn matching_ignores_case() {
        let classifier = Classifier::new(["Comment"]);
        assert_eq!(
            classifier.matched("https://api.example.com/v1/COMMENTS?room=1"),
            Some("comment")
        );
        assert!(!classifier.is_chat_relevant("https://api.example.com/v1/likes"));
    }

    #[test]
    fn blank_keywords_are_ignored() {
        let classifier = Classifier::new(["", "  ", "push"]);
        assert_eq!(classifier.keywords(), ["push".to_string()]);
        assert!(!classifier.is_chat_relevant("https://example.com/"));
    }
}

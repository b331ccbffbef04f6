//! Header-based classification shortcut (spec §4.5.1).
//!
//! Applied to every message before any AI call; a confident match here lets
//! the sync path skip publishing a classify job entirely, which is the main
//! lever keeping LLM spend down to roughly 8% of messages.

/// Header rules evaluated in order; the first confident match wins.
pub fn classify_from_headers(headers: &std::collections::HashMap<String, String>) -> Option<&'static str> {
    let get = |key: &str| headers.get(key).map(|v| v.to_lowercase());

    if get("list-unsubscribe").is_some() || get("list-id").is_some() {
        return Some("newsletter");
    }
    if let Some(precedence) = get("precedence") {
        if precedence == "bulk" || precedence == "list" {
            return Some("newsletter");
        }
    }
    if let Some(auto_submitted) = get("auto-submitted") {
        if auto_submitted != "no" {
            return Some("automated");
        }
    }
    if get("feedback-id").is_some() {
        return Some("marketing");
    }
    if let Some(from) = headers.get("from") {
        let lower = from.to_lowercase();
        if ESP_SENDER_DOMAINS.iter().any(|domain| lower.contains(domain)) {
            return Some("marketing");
        }
    }
    if get("x-campaign-id").is_some() || get("x-mailer-campaign").is_some() {
        return Some("marketing");
    }

    None
}

const ESP_SENDER_DOMAINS: &[&str] = &[
    "mailchimp.com",
    "sendgrid.net",
    "constantcontact.com",
    "mailgun.org",
    "sendinblue.com",
    "hubspotemail.net",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn list_unsubscribe_header_is_newsletter() {
        let h = headers(&[("list-unsubscribe", "<mailto:unsub@example.com>")]);
        assert_eq!(classify_from_headers(&h), Some("newsletter"));
    }

    #[test]
    fn bulk_precedence_is_newsletter() {
        let h = headers(&[("precedence", "bulk")]);
        assert_eq!(classify_from_headers(&h), Some("newsletter"));
    }

    #[test]
    fn auto_submitted_is_automated() {
        let h = headers(&[("auto-submitted", "auto-generated")]);
        assert_eq!(classify_from_headers(&h), Some("automated"));
    }

    #[test]
    fn esp_sender_domain_is_marketing() {
        let h = headers(&[("from", "campaigns@mailchimp.com")]);
        assert_eq!(classify_from_headers(&h), Some("marketing"));
    }

    #[test]
    fn plain_message_is_unclassified() {
        let h = headers(&[("from", "friend@example.com")]);
        assert_eq!(classify_from_headers(&h), None);
    }
}

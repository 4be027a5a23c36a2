use crate::config::LinksConfig;
use crate::database::PageDocument;
use crate::security::identity::Identity;
use crate::security::rate_limit::{LimitType, RateLimitDenial};
use crate::services::search_engine::SearchOutcome;
use chrono::{DateTime, Utc};
use std::fmt::Write;

const SEPARATOR_LEN: usize = 80;

const ADDITIONAL_HEADING: &str = "Additional Related Documentation:";
const ADDITIONAL_INTRO: &str =
    "These related pages also matched your query and can be retrieved with the fetch tool:";

fn separator() -> String {
    "─".repeat(SEPARATOR_LEN)
}

fn anonymous_footer(subscription_url: &str) -> String {
    format!(
        "\n\n{}\n\nYou are using the free anonymous tier. Subscribe for higher \
         limits and IP-pinned access: {}",
        separator(),
        subscription_url
    )
}

/// Render the search tool response text.
pub fn render_search_response(
    outcome: &SearchOutcome,
    anonymous: bool,
    subscription_url: &str,
) -> String {
    let mut text = String::new();

    if outcome.results.is_empty() {
        text.push_str("No results found for this query.");
    } else {
        for (i, result) in outcome.results.iter().enumerate() {
            if i > 0 {
                let _ = write!(text, "\n{}\n\n", separator());
            }
            let title = result
                .group
                .title
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or("Untitled");
            let _ = write!(
                text,
                "[{}] {}\nSource: {}\n\n{}\n",
                i + 1,
                title,
                result.group.url,
                result.group.content
            );
        }
    }

    if !outcome.additional_urls.is_empty() {
        let _ = write!(text, "\n{}\n\n{}\n{}\n", separator(), ADDITIONAL_HEADING, ADDITIONAL_INTRO);
        for additional in &outcome.additional_urls {
            text.push_str(&additional.url);
            text.push('\n');
        }
    }

    if anonymous {
        text.push_str(&anonymous_footer(subscription_url));
    }

    text
}

/// Render the fetch tool response text.
pub fn render_fetch_response(
    document: &PageDocument,
    anonymous: bool,
    subscription_url: &str,
) -> String {
    let mut text = match document.title.as_deref().filter(|t| !t.trim().is_empty()) {
        Some(title) => format!("{}\n\n{}", title, document.content),
        None => document.content.clone(),
    };

    if anonymous {
        text.push_str(&anonymous_footer(subscription_url));
    }

    text
}

/// Human-readable rate-limit denial, pointing anonymous callers at the
/// subscription page and authenticated callers at the upgrade page.
pub fn render_rate_limit_message(
    denial: &RateLimitDenial,
    identity: &Identity,
    links: &LinksConfig,
    now: DateTime<Utc>,
) -> String {
    let upsell = if identity.is_anonymous() {
        format!("Subscribe for higher limits: {}", links.subscription_url)
    } else {
        format!("Upgrade your plan for higher limits: {}", links.upgrade_url)
    };

    match denial.limit_type {
        LimitType::Minute => {
            let wait_seconds = (denial.reset_at - now).num_seconds().max(0);
            format!(
                "Rate limit exceeded: at most {} requests per minute on the {} \
                 plan. Try again in {} seconds. {}",
                denial.minute_limit, denial.plan, wait_seconds, upsell
            )
        }
        LimitType::Weekly => {
            format!(
                "Weekly limit reached: the {} plan allows {} requests per week. \
                 The quota resets at {}. {}",
                denial.plan,
                denial.weekly_limit,
                denial.reset_at.format("%Y-%m-%d %H:%M UTC"),
                upsell
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::identity::{IdentityKind, Plan};
    use crate::services::search_engine::{AdditionalUrl, MergedGroup, RankedResult};

    fn group(url: &str, title: Option<&str>, content: &str) -> MergedGroup {
        MergedGroup {
            id: 1,
            url: url.to_string(),
            title: title.map(|t| t.to_string()),
            content: content.to_string(),
            chunk_index: 0,
            total_chunks: 1,
            merged_chunk_indices: None,
        }
    }

    fn outcome(results: Vec<MergedGroup>, additional: Vec<AdditionalUrl>) -> SearchOutcome {
        SearchOutcome {
            results: results
                .into_iter()
                .enumerate()
                .map(|(position, group)| RankedResult { position, group })
                .collect(),
            additional_urls: additional,
        }
    }

    fn links() -> LinksConfig {
        LinksConfig {
            subscription_url: "https://example.com/subscribe".to_string(),
            upgrade_url: "https://example.com/upgrade".to_string(),
        }
    }

    #[test]
    fn numbers_blocks_and_separates_with_rule_lines() {
        let text = render_search_response(
            &outcome(
                vec![
                    group("u1", Some("First"), "body one"),
                    group("u2", Some("Second"), "body two"),
                ],
                vec![],
            ),
            false,
            "https://example.com/subscribe",
        );

        assert!(text.contains("[1] First\nSource: u1\n\nbody one\n"));
        assert!(text.contains("[2] Second\nSource: u2\n\nbody two\n"));
        assert_eq!(text.matches(&"─".repeat(80)).count(), 1);
        assert!(!text.contains("Additional Related Documentation:"));
    }

    #[test]
    fn missing_title_renders_untitled() {
        let text = render_search_response(
            &outcome(vec![group("u1", None, "body")], vec![]),
            false,
            "https://example.com/subscribe",
        );
        assert!(text.starts_with("[1] Untitled\nSource: u1"));
    }

    #[test]
    fn additional_urls_render_one_per_line() {
        let additional = vec![
            AdditionalUrl {
                url: "u2".to_string(),
                title: Some("Other".to_string()),
                character_count: 42,
            },
            AdditionalUrl {
                url: "u3".to_string(),
                title: None,
                character_count: 7,
            },
        ];
        let text = render_search_response(
            &outcome(vec![group("u1", Some("T"), "body")], additional),
            false,
            "https://example.com/subscribe",
        );

        assert!(text.contains("Additional Related Documentation:"));
        assert!(text.contains("\nu2\n"));
        assert!(text.contains("\nu3\n"));
    }

    #[test]
    fn anonymous_callers_get_the_subscription_footer() {
        let text = render_search_response(
            &outcome(vec![group("u1", Some("T"), "body")], vec![]),
            true,
            "https://example.com/subscribe",
        );
        assert!(text.contains("https://example.com/subscribe"));

        let without = render_search_response(
            &outcome(vec![group("u1", Some("T"), "body")], vec![]),
            false,
            "https://example.com/subscribe",
        );
        assert!(!without.contains("https://example.com/subscribe"));
    }

    #[test]
    fn empty_outcome_renders_no_results_line() {
        let text = render_search_response(
            &outcome(vec![], vec![]),
            false,
            "https://example.com/subscribe",
        );
        assert_eq!(text, "No results found for this query.");
    }

    #[test]
    fn fetch_renders_title_then_content() {
        let doc = PageDocument {
            id: 1,
            title: Some("SwiftUI".to_string()),
            content: "Declarative UI.".to_string(),
        };
        assert_eq!(
            render_fetch_response(&doc, false, "x"),
            "SwiftUI\n\nDeclarative UI."
        );

        let untitled = PageDocument {
            id: 2,
            title: None,
            content: "Body only.".to_string(),
        };
        assert_eq!(render_fetch_response(&untitled, false, "x"), "Body only.");
    }

    #[test]
    fn minute_denial_mentions_limit_and_wait() {
        let now = DateTime::parse_from_rfc3339("2026-07-29T15:30:45Z")
            .unwrap()
            .with_timezone(&Utc);
        let denial = RateLimitDenial {
            limit_type: LimitType::Minute,
            plan: "pro".to_string(),
            weekly_limit: 10_000,
            minute_limit: 20,
            weekly_used: 50,
            minute_used: 20,
            reset_at: now + chrono::Duration::seconds(15),
        };
        let identity = Identity {
            kind: IdentityKind::Token,
            user_id: "u".to_string(),
            plan: Plan::Pro,
            token_prefix: None,
        };

        let text = render_rate_limit_message(&denial, &identity, &links(), now);
        assert!(text.contains("20 requests per minute"));
        assert!(text.contains("15 seconds"));
        assert!(text.contains("https://example.com/upgrade"));
    }

    #[test]
    fn weekly_denial_points_anonymous_users_at_subscription() {
        let now = Utc::now();
        let denial = RateLimitDenial {
            limit_type: LimitType::Weekly,
            plan: "hobby".to_string(),
            weekly_limit: 10,
            minute_limit: 1,
            weekly_used: 10,
            minute_used: 0,
            reset_at: now,
        };
        let identity = Identity::anonymous("1.2.3.4");

        let text = render_rate_limit_message(&denial, &identity, &links(), now);
        assert!(text.contains("hobby plan allows 10 requests per week"));
        assert!(text.contains("https://example.com/subscribe"));
    }
}

use once_cell::sync::Lazy;
use regex::Regex;

/// Trailing filler phrases that add recency intent but no retrieval signal.
const TRAILING_PHRASES: &[&str] = &[
    "today",
    "yesterday",
    "this week",
    "this month",
    "this year",
    "right now",
    "currently",
    "latest",
    "recently",
];

static TRAILING_ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\d{4}-\d{2}-\d{2}$").expect("valid date regex"));

/// Strip temporal tokens from the end of a query.
///
/// Deterministic and side-effect free: repeatedly removes trailing phrases
/// from the fixed list (word-boundary, case-insensitive) and trailing ISO
/// dates, along with any punctuation left dangling. Returns the original
/// query if stripping would leave nothing.
pub fn clean_temporal_tokens(query: &str) -> String {
    let mut current = query.trim().to_string();

    loop {
        let before = current.len();

        current = strip_trailing_punctuation(&current);

        if let Some(m) = TRAILING_ISO_DATE.find(&current) {
            current = current[..m.start()].trim_end().to_string();
        }

        let lower = current.to_lowercase();
        for phrase in TRAILING_PHRASES {
            if lower.ends_with(phrase) {
                let cut = current.len() - phrase.len();
                if !current.is_char_boundary(cut) {
                    continue;
                }
                // Word boundary: start of string or non-alphanumeric before it.
                let at_boundary = cut == 0
                    || current[..cut]
                        .chars()
                        .next_back()
                        .map(|c| !c.is_alphanumeric())
                        .unwrap_or(true);
                if at_boundary {
                    current = current[..cut].trim_end().to_string();
                    break;
                }
            }
        }

        if current.len() == before {
            break;
        }
    }

    current = strip_trailing_punctuation(&current);

    if current.is_empty() {
        query.trim().to_string()
    } else {
        current
    }
}

fn strip_trailing_punctuation(s: &str) -> String {
    s.trim_end_matches(|c: char| c == ',' || c == '.' || c == '?' || c == '!' || c == ':')
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_today() {
        assert_eq!(
            clean_temporal_tokens("SwiftUI navigation today"),
            "SwiftUI navigation"
        );
    }

    #[test]
    fn strips_stacked_temporal_phrases() {
        assert_eq!(
            clean_temporal_tokens("WWDC sessions this week, today"),
            "WWDC sessions"
        );
    }

    #[test]
    fn strips_trailing_iso_date() {
        assert_eq!(
            clean_temporal_tokens("Xcode release notes 2025-06-18"),
            "Xcode release notes"
        );
    }

    #[test]
    fn is_case_insensitive() {
        assert_eq!(clean_temporal_tokens("Swift updates LATEST"), "Swift updates");
    }

    #[test]
    fn leaves_mid_query_tokens_alone() {
        assert_eq!(
            clean_temporal_tokens("today extension widget"),
            "today extension widget"
        );
    }

    #[test]
    fn does_not_split_words() {
        // "uptoday" is not the word "today".
        assert_eq!(clean_temporal_tokens("metrics uptoday"), "metrics uptoday");
    }

    #[test]
    fn falls_back_to_original_when_everything_strips() {
        assert_eq!(clean_temporal_tokens("today"), "today");
        assert_eq!(clean_temporal_tokens("  this week "), "this week");
    }

    #[test]
    fn is_idempotent() {
        let once = clean_temporal_tokens("Core Data migration this year");
        let twice = clean_temporal_tokens(&once);
        assert_eq!(once, twice);
    }
}

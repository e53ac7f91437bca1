//! Baidu SERP HTML interpretation.
//!
//! Marker strings are the live page's own text; selectors target the desktop
//! layout (the backend pins a desktop Chrome UA so the DOM matches).

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use crate::web::backend::SearchResult;

static RESULT_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)<h3[^>]*>\s*<a[^>]+href="(?P<href>[^"]+)"[^>]*>(?P<title>.*?)</a>\s*</h3>"#,
    )
    .expect("result block regex")
});

static TAG_STRIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("tag strip regex"));

static SNIPPET_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)class="content-right_[^"]*"[^>]*>(?P<text>.*?)</"#).expect("snippet regex")
});

const NO_RESULTS_MARKERS: &[&str] = &[
    "很抱歉，没有找到",
    "没有找到相关结果",
    "找不到和您查询相符的结果",
];

const CAPTCHA_MARKERS: &[&str] = &["wappass.baidu.com", "安全验证", "请输入验证码"];

/// Parse a results page. `Ok(Some(err))` reports a page-level condition
/// (`captcha_required`, `parse_failed`) rather than a result list.
pub fn parse_baidu_html(html: &str) -> (Vec<SearchResult>, Option<&'static str>) {
    if html.trim().is_empty() {
        return (Vec::new(), Some("parse_failed"));
    }
    if detect_captcha(html) {
        return (Vec::new(), Some("captcha_required"));
    }

    let mut results = Vec::new();
    let snippets: Vec<String> = SNIPPET_BLOCK
        .captures_iter(html)
        .map(|c| clean_text(&c["text"]))
        .collect();
    for (i, captures) in RESULT_BLOCK.captures_iter(html).enumerate() {
        let title = clean_text(&captures["title"]);
        let url = captures["href"].trim().to_string();
        if title.is_empty() || url.is_empty() {
            continue;
        }
        results.push(SearchResult {
            title,
            url,
            snippet: snippets.get(i).cloned().unwrap_or_default(),
        });
    }
    (results, None)
}

pub fn detect_captcha(html: &str) -> bool {
    let lower = html.to_lowercase();
    CAPTCHA_MARKERS.iter().any(|m| html.contains(m))
        || (lower.contains("captcha") && lower.contains("baidu.com"))
}

/// A genuine empty result page, as opposed to a layout the parser missed.
pub fn detect_no_results(html: &str) -> bool {
    NO_RESULTS_MARKERS.iter().any(|m| html.contains(m))
}

/// The page still looks like a SERP (result containers present), so zero
/// parsed items means the DOM drifted from the selectors.
pub fn detect_possible_results_structure(html: &str) -> bool {
    html.contains("id=\"content_left\"") || html.contains("class=\"result")
}

/// Small structural probe attached to parse errors for diagnosis.
pub fn get_serp_probe(html: &str) -> Value {
    json!({
        "has_content_left": html.contains("id=\"content_left\""),
        "result_class_count": html.matches("class=\"result").count(),
        "h3_count": html.matches("<h3").count(),
        "bytes": html.len(),
    })
}

fn clean_text(fragment: &str) -> String {
    let stripped = TAG_STRIP.replace_all(fragment, "");
    stripped
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERP: &str = r#"
        <div id="content_left">
          <div class="result c-container">
            <h3 class="t"><a href="https://example.com/1">First <em>hit</em></a></h3>
            <div class="content-right_abc">Snippet one text</div>
          </div>
          <div class="result c-container">
            <h3 class="t"><a href="https://example.com/2">Second hit</a></h3>
            <div class="content-right_def">Snippet two text</div>
          </div>
        </div>"#;

    #[test]
    fn parses_titles_urls_and_snippets() {
        let (results, err) = parse_baidu_html(SERP);
        assert!(err.is_none());
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "First hit");
        assert_eq!(results[0].url, "https://example.com/1");
        assert_eq!(results[0].snippet, "Snippet one text");
    }

    #[test]
    fn captcha_page_is_reported() {
        let (_, err) = parse_baidu_html("<html>wappass.baidu.com verify</html>");
        assert_eq!(err, Some("captcha_required"));
    }

    #[test]
    fn empty_input_is_parse_failed() {
        let (_, err) = parse_baidu_html("   ");
        assert_eq!(err, Some("parse_failed"));
    }

    #[test]
    fn classification_helpers() {
        assert!(detect_no_results("<div>很抱歉，没有找到与此相关的结果</div>"));
        assert!(!detect_no_results(SERP));
        assert!(detect_possible_results_structure(SERP));
        assert!(!detect_possible_results_structure("<html><body>plain</body></html>"));
    }

    #[test]
    fn probe_reports_structure() {
        let probe = get_serp_probe(SERP);
        assert_eq!(probe["has_content_left"], true);
        assert_eq!(probe["result_class_count"], 2);
    }
}

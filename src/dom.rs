//! Reduce raw page markup to a bounded digest of interactive elements.
//!
//! The digest is what the model plans against, so it has to stay small and
//! decision-useful: search inputs first (they are the dominant target in
//! practice and must not be crowded out by truncation), then everything that
//! looks clickable, one JSON descriptor per line, capped at a character
//! budget.

use scraper::node::Element;
use scraper::{ElementRef, Html};

use crate::types::ElementDescriptor;

const STRIPPED_TAGS: [&str; 6] = ["script", "style", "meta", "link", "noscript", "svg"];
const INTERACTIVE_TAGS: [&str; 5] = ["a", "button", "input", "textarea", "select"];
const CLICKABLE_ROLES: [&str; 3] = ["button", "link", "tab"];
const CLICKABLE_CLASSES: [&str; 6] = ["btn", "button", "clickable", "link", "submit", "nav-item"];
const INVISIBLE_CLASSES: [&str; 5] = [
    "hidden",
    "invisible",
    "collapsed",
    "sr-only",
    "visually-hidden",
];

type SearchPattern = fn(&Element) -> bool;

/// Search-input patterns, applied in order over all input/textarea elements.
/// An element matching several patterns appears once per match; downstream
/// resolution collapses the duplicates.
const SEARCH_PATTERNS: [SearchPattern; 6] = [
    |el| el.attr("type") == Some("search"),
    |el| el.attr("name") == Some("q"),
    |el| attr_contains(el, "placeholder", &["search"]),
    |el| attr_contains(el, "aria-label", &["search"]),
    |el| class_attr_contains(el, &["search", "query"]),
    |el| attr_contains(el, "id", &["search", "query"]),
];

pub fn build_digest(raw_markup: &str, max_chars: usize) -> String {
    let document = Html::parse_document(raw_markup);
    let root = document.root_element();

    let inputs: Vec<ElementRef> = elements(root)
        .filter(|el| matches!(el.value().name(), "input" | "textarea"))
        .collect();

    let mut search_candidates: Vec<ElementRef> = Vec::new();
    for pattern in SEARCH_PATTERNS {
        for el in &inputs {
            if pattern(el.value()) {
                search_candidates.push(*el);
            }
        }
    }
    let search_ids: Vec<_> = search_candidates.iter().map(|el| el.id()).collect();

    let mut lines: Vec<String> = Vec::new();
    for el in &search_candidates {
        let desc = describe(el, Role::Search {
            visible: is_likely_visible(el),
        });
        if !desc.is_empty() {
            lines.push(desc.to_digest_line());
        }
    }

    let mut emitted = Vec::new();
    for el in elements(root) {
        if !is_clickable_candidate(&el) || search_ids.contains(&el.id()) {
            continue;
        }
        if emitted.contains(&el.id()) || !is_likely_visible(&el) {
            continue;
        }
        emitted.push(el.id());
        let desc = describe(&el, Role::Clickable);
        if !desc.is_empty() {
            lines.push(desc.to_digest_line());
        }
    }

    truncate_chars(&lines.join("\n"), max_chars)
}

/// All element nodes under `root`, excluding non-content subtrees.
fn elements(root: ElementRef<'_>) -> impl Iterator<Item = ElementRef<'_>> {
    root.descendants()
        .filter_map(ElementRef::wrap)
        .filter(|el| !in_stripped_subtree(el))
}

fn in_stripped_subtree(el: &ElementRef) -> bool {
    if STRIPPED_TAGS.contains(&el.value().name()) {
        return true;
    }
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| STRIPPED_TAGS.contains(&a.value().name()))
}

fn is_clickable_candidate(el: &ElementRef) -> bool {
    let value = el.value();
    if INTERACTIVE_TAGS.contains(&value.name()) {
        return true;
    }
    if value.attr("onclick").is_some() {
        return true;
    }
    if value.attr("role").is_some_and(|r| CLICKABLE_ROLES.contains(&r)) {
        return true;
    }
    value
        .classes()
        .any(|class| CLICKABLE_CLASSES.contains(&class))
}

/// Attribute-level visibility heuristic. Computed styles are not available
/// from raw markup, so this only catches explicit hiding.
fn is_likely_visible(el: &ElementRef) -> bool {
    let value = el.value();
    if value.attr("hidden").is_some() {
        return false;
    }
    if let Some(style) = value.attr("style") {
        let compact: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();
        if compact.contains("display:none") || compact.contains("visibility:hidden") {
            return false;
        }
    }
    if value.attr("width") == Some("0") || value.attr("height") == Some("0") {
        return false;
    }
    !value.classes().any(|class| {
        INVISIBLE_CLASSES
            .iter()
            .any(|invisible| class.contains(invisible))
    })
}

enum Role {
    Search { visible: bool },
    Clickable,
}

fn describe(el: &ElementRef, role: Role) -> ElementDescriptor {
    let value = el.value();
    let mut desc = ElementDescriptor::default();
    desc.put("tag", value.name());
    for attr in ["id", "name", "type", "placeholder", "aria-label", "role"] {
        if let Some(v) = value.attr(attr) {
            desc.put(attr, v);
        }
    }
    let class = value.classes().collect::<Vec<_>>().join(" ");
    if !class.is_empty() {
        desc.put("class", class);
    }
    let text = el.text().collect::<String>();
    let text = text.trim();
    if !text.is_empty() {
        desc.put("text", text.chars().take(100).collect::<String>());
    }
    match role {
        Role::Search { visible } => {
            desc.put("is_search", true);
            desc.put("is_visible", visible);
        }
        Role::Clickable => {
            for attr in ["href", "onclick"] {
                if let Some(v) = value.attr(attr) {
                    desc.put(attr, v);
                }
            }
            desc.put("is_visible", true);
        }
    }
    if let Some(location) = breadcrumb(el) {
        desc.put("location", location);
    }
    desc
}

/// Ancestor-chain breadcrumb, up to 3 levels, outermost first. Each level is
/// `tag#id` when an id exists, else `tag.class1.class2`, else the bare tag.
fn breadcrumb(el: &ElementRef) -> Option<String> {
    let mut parts: Vec<String> = el
        .ancestors()
        .filter_map(ElementRef::wrap)
        .take(3)
        .map(|ancestor| {
            let value = ancestor.value();
            let mut part = value.name().to_string();
            if let Some(id) = value.attr("id") {
                part.push('#');
                part.push_str(id);
            } else {
                let classes: Vec<_> = value.classes().collect();
                if !classes.is_empty() {
                    part.push('.');
                    part.push_str(&classes.join("."));
                }
            }
            part
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    parts.reverse();
    Some(parts.join(" > "))
}

fn attr_contains(el: &Element, attr: &str, needles: &[&str]) -> bool {
    el.attr(attr)
        .map(str::to_ascii_lowercase)
        .is_some_and(|v| needles.iter().any(|n| v.contains(n)))
}

fn class_attr_contains(el: &Element, needles: &[&str]) -> bool {
    let joined = el.classes().collect::<Vec<_>>().join(" ").to_ascii_lowercase();
    needles.iter().any(|n| joined.contains(n))
}

/// Character-budget truncation, safe on multi-byte input. The cut may land
/// mid-line; callers tolerate a dangling partial last descriptor.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ElementDescriptor;

    const PAGE: &str = r#"
        <html><head>
          <script>var x = "input";</script>
          <style>.btn { color: red; }</style>
        </head><body>
          <div id="header" class="top-nav">
            <input type="search" id="site-search" placeholder="Search the site">
            <a href="/home">Home</a>
            <button class="btn submit-order">Order now</button>
          </div>
          <a href="/secret" style="display: none">Hidden link</a>
          <a href="/skip" class="sr-only">Skip</a>
          <div role="tab">Pricing</div>
          <div onclick="openMenu()">Menu</div>
        </body></html>"#;

    fn lines(digest: &str) -> Vec<ElementDescriptor> {
        digest
            .lines()
            .map(|l| serde_json::from_str(l).expect("digest line should be valid JSON"))
            .collect()
    }

    #[test]
    fn output_respects_char_budget() {
        for budget in [10, 100, 5000] {
            let digest = build_digest(PAGE, budget);
            assert!(digest.chars().count() <= budget);
        }
    }

    #[test]
    fn every_line_has_at_least_one_key() {
        for desc in lines(&build_digest(PAGE, 5000)) {
            assert!(!desc.is_empty());
            assert!(desc.get_str("tag").is_some());
        }
    }

    #[test]
    fn search_inputs_come_first_and_are_tagged() {
        let descs = lines(&build_digest(PAGE, 5000));
        let first = &descs[0];
        assert_eq!(first.get_str("tag"), Some("input"));
        assert_eq!(first.0.get("is_search"), Some(&serde_json::json!(true)));
        // The search box matched three patterns (type, placeholder, id) and
        // is emitted once per match, ahead of every clickable element.
        let search_count = descs
            .iter()
            .take_while(|d| d.0.get("is_search").is_some())
            .count();
        assert_eq!(search_count, 3);
    }

    #[test]
    fn hidden_clickables_are_dropped() {
        let digest = build_digest(PAGE, 5000);
        assert!(!digest.contains("/secret"));
        assert!(!digest.contains("/skip"));
    }

    #[test]
    fn hidden_search_inputs_survive_with_visibility_flag() {
        let page = r#"<body><input type="search" id="q" class="hidden"></body>"#;
        let descs = lines(&build_digest(page, 5000));
        assert!(!descs.is_empty());
        assert_eq!(descs[0].0.get("is_visible"), Some(&serde_json::json!(false)));
    }

    #[test]
    fn role_onclick_and_class_make_elements_clickable() {
        let descs = lines(&build_digest(PAGE, 5000));
        let texts: Vec<_> = descs.iter().filter_map(|d| d.get_str("text")).collect();
        assert!(texts.contains(&"Pricing"));
        assert!(texts.contains(&"Menu"));
        assert!(texts.contains(&"Order now"));
    }

    #[test]
    fn script_and_style_content_never_leaks() {
        let digest = build_digest(PAGE, 5000);
        assert!(!digest.contains("var x"));
        assert!(!digest.contains("color: red"));
    }

    #[test]
    fn breadcrumb_prefers_id_over_classes() {
        let descs = lines(&build_digest(PAGE, 5000));
        let home = descs
            .iter()
            .find(|d| d.get_str("href") == Some("/home"))
            .unwrap();
        let location = home.get_str("location").unwrap();
        assert!(location.ends_with("div#header"), "location: {location}");
    }

    #[test]
    fn empty_markup_yields_empty_digest() {
        assert_eq!(build_digest("", 5000), "");
        assert_eq!(build_digest("<html></html>", 5000), "");
    }

    #[test]
    fn text_is_capped_at_100_chars() {
        let page = format!("<body><a href='/x'>{}</a></body>", "y".repeat(400));
        let descs = lines(&build_digest(&page, 5000));
        assert_eq!(descs[0].get_str("text").unwrap().chars().count(), 100);
    }
}

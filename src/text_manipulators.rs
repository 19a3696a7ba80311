use regex::Regex;
use scraper::ElementRef;

pub fn extract_text(node: ElementRef) -> String {
    normalize_whitespace(&node.text().collect::<String>())
}

/// Collapses runs of whitespace (including NBSP) into single spaces.
pub fn normalize_whitespace(text: &str) -> String {
    text.split(|c: char| c.is_whitespace() || c == '\u{a0}')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Cuts `text` to at most `max` characters without splitting a char.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

pub struct PriceParser {
    // Regex that pulls the numeric part out of a rendered price.
    amount_regex: Regex,
    // Regex that finds an ISO currency code next to the amount.
    code_regex: Regex,
}

impl PriceParser {
    pub fn new() -> anyhow::Result<Self> {
        let amount_regex = Regex::new(r"\d[\d.,\s\u{a0}']*\d|\d")?;
        let code_regex = Regex::new(r"\b([A-Z]{3})\b")?;
        Ok(Self {
            amount_regex,
            code_regex,
        })
    }

    /// Parses strings like `€ 1.234,50`, `US$199`, `1,299 USD`.
    /// Returns the amount and, when recognisable, an ISO currency code.
    pub fn parse(&self, text: &str) -> Option<(f64, Option<String>)> {
        let m = self.amount_regex.find(text)?;
        let amount = parse_amount(m.as_str())?;
        let currency = self.currency(text);
        Some((amount, currency))
    }

    fn currency(&self, text: &str) -> Option<String> {
        if let Some(caps) = self.code_regex.captures(text) {
            return caps.get(1).map(|m| m.as_str().to_string());
        }
        let code = if text.contains('€') {
            "EUR"
        } else if text.contains('£') {
            "GBP"
        } else if text.contains('¥') {
            "JPY"
        } else if text.contains('₹') {
            "INR"
        } else if text.contains('$') {
            "USD"
        } else {
            return None;
        };
        Some(code.to_string())
    }
}

fn parse_amount(raw: &str) -> Option<f64> {
    let digits: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect();
    let last_dot = digits.rfind('.');
    let last_comma = digits.rfind(',');

    let decimal_sep = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(if d > c { '.' } else { ',' }),
        (Some(d), None) => decimal_if_not_grouping(&digits, '.', d),
        (None, Some(c)) => decimal_if_not_grouping(&digits, ',', c),
        (None, None) => None,
    };

    let mut normalized = String::with_capacity(digits.len());
    for c in digits.chars() {
        match c {
            '0'..='9' => normalized.push(c),
            sep if Some(sep) == decimal_sep => normalized.push('.'),
            _ => {}
        }
    }
    normalized.parse::<f64>().ok()
}

// A lone separator followed by exactly three digits reads as grouping
// ("1.234", "12,500"); anything else is a decimal point.
fn decimal_if_not_grouping(digits: &str, sep: char, last: usize) -> Option<char> {
    let occurrences = digits.matches(sep).count();
    let tail = digits.len() - last - 1;
    if occurrences > 1 || tail == 3 {
        None
    } else {
        Some(sep)
    }
}

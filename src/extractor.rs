//! Room/rate extraction from a fetched listing page.
//!
//! The primary path is a declarative selector set; when it yields no priced
//! room the `application/ld+json` `offers` blocks are consulted. The verdict
//! is conservative: only a room with a usable price counts as available.

use anyhow::anyhow;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::{Value, json};

use crate::text_manipulators::{PriceParser, extract_text};

/// CSS selectors describing a source's result page.
#[derive(Debug, Clone)]
pub struct SelectorSet {
    pub room: String,
    pub room_name: String,
    pub price: String,
    pub sold_out: String,
    pub sold_out_phrases: Vec<String>,
    pub challenge_phrases: Vec<String>,
}

impl Default for SelectorSet {
    fn default() -> Self {
        Self {
            room: ".room, [data-room-id], .hprt-table tbody tr".to_string(),
            room_name: ".room-name, [data-room-name], .hprt-roomtype-icon-link".to_string(),
            price: ".price, [data-price], .prco-valign-middle-helper".to_string(),
            sold_out: ".sold-out, .soldout, [data-sold-out]".to_string(),
            sold_out_phrases: [
                "sold out",
                "no availability",
                "no rooms available",
                "fully booked",
                "not available on your dates",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            challenge_phrases: [
                "captcha",
                "verify you are human",
                "are you a robot",
                "unusual traffic",
                "cf-chl",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRate {
    pub name: String,
    pub raw_price: Option<String>,
    pub price: Option<f64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Available { price: f64, currency: Option<String> },
    SoldOut { marker: String },
    Challenge { marker: String },
    Ambiguous,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub rooms: Vec<RoomRate>,
    pub sold_out_marker: Option<String>,
    pub challenge_marker: Option<String>,
    pub from_json_ld: bool,
}

impl Extraction {
    pub fn verdict(&self) -> Verdict {
        let cheapest = self
            .rooms
            .iter()
            .filter_map(|r| r.price.filter(|p| *p > 0.0).map(|p| (p, &r.currency)))
            .min_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((price, currency)) = cheapest {
            return Verdict::Available {
                price,
                currency: currency.clone(),
            };
        }
        if let Some(marker) = &self.challenge_marker {
            return Verdict::Challenge {
                marker: marker.clone(),
            };
        }
        if let Some(marker) = &self.sold_out_marker {
            return Verdict::SoldOut {
                marker: marker.clone(),
            };
        }
        Verdict::Ambiguous
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "rooms": self.rooms,
            "soldOutMarker": self.sold_out_marker,
            "challengeMarker": self.challenge_marker,
            "fromJsonLd": self.from_json_ld,
        })
    }
}

/// Site-specific extraction logic plugs in here.
pub trait Extractor: Send + Sync {
    fn extract(&self, body: &str) -> Extraction;
}

struct CompiledSelectors {
    room: Selector,
    room_name: Selector,
    price: Selector,
    sold_out: Selector,
    json_ld: Selector,
}

pub struct SelectorExtractor {
    selectors: CompiledSelectors,
    sold_out_phrases: Vec<String>,
    challenge_phrases: Vec<String>,
    price_parser: PriceParser,
    default_currency: Option<String>,
}

fn compile(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {:?}: {:?}", css, e))
}

impl SelectorExtractor {
    pub fn new(set: &SelectorSet, default_currency: Option<String>) -> anyhow::Result<Self> {
        let selectors = CompiledSelectors {
            room: compile(&set.room)?,
            room_name: compile(&set.room_name)?,
            price: compile(&set.price)?,
            sold_out: compile(&set.sold_out)?,
            json_ld: compile(r#"script[type="application/ld+json"]"#)?,
        };
        Ok(Self {
            selectors,
            sold_out_phrases: set.sold_out_phrases.iter().map(|p| p.to_lowercase()).collect(),
            challenge_phrases: set.challenge_phrases.iter().map(|p| p.to_lowercase()).collect(),
            price_parser: PriceParser::new()?,
            default_currency,
        })
    }

    fn room_rates(&self, document: &Html) -> Vec<RoomRate> {
        let mut rooms = Vec::new();
        for room in document.select(&self.selectors.room) {
            let name = room
                .select(&self.selectors.room_name)
                .next()
                .map(extract_text)
                .unwrap_or_default();
            let price_node = room.select(&self.selectors.price).next();
            let raw_price = price_node.map(|node| {
                node.value()
                    .attr("data-price")
                    .map(str::to_string)
                    .unwrap_or_else(|| extract_text(node))
            });
            let parsed = raw_price.as_deref().and_then(|p| self.price_parser.parse(p));
            rooms.push(RoomRate {
                name,
                price: parsed.as_ref().map(|(amount, _)| *amount),
                currency: parsed
                    .and_then(|(_, currency)| currency)
                    .or_else(|| self.default_currency.clone()),
                raw_price,
            });
        }
        rooms
    }

    fn json_ld_rates(&self, document: &Html) -> (Vec<RoomRate>, bool) {
        let mut rooms = Vec::new();
        let mut sold_out = false;
        for script in document.select(&self.selectors.json_ld) {
            let text = script.text().collect::<String>();
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            collect_offers(&value, &mut rooms, &mut sold_out);
        }
        for room in &mut rooms {
            if room.currency.is_none() {
                room.currency = self.default_currency.clone();
            }
        }
        (rooms, sold_out)
    }

    fn find_phrase(haystack: &str, phrases: &[String]) -> Option<String> {
        phrases.iter().find(|p| haystack.contains(p.as_str())).cloned()
    }
}

impl Extractor for SelectorExtractor {
    fn extract(&self, body: &str) -> Extraction {
        let document = Html::parse_document(body);
        let mut extraction = Extraction {
            rooms: self.room_rates(&document),
            ..Default::default()
        };

        let has_price = extraction.rooms.iter().any(|r| r.price.is_some());
        let mut ld_sold_out = false;
        if !has_price {
            let (ld_rooms, sold_out) = self.json_ld_rates(&document);
            ld_sold_out = sold_out;
            if ld_rooms.iter().any(|r| r.price.is_some()) {
                extraction.rooms = ld_rooms;
                extraction.from_json_ld = true;
            }
        }

        let lowered = body.to_lowercase();
        extraction.sold_out_marker = document
            .select(&self.selectors.sold_out)
            .next()
            .map(|node| {
                let text = extract_text(node);
                if text.is_empty() { "sold-out element".to_string() } else { text }
            })
            .or_else(|| Self::find_phrase(&lowered, &self.sold_out_phrases))
            .or_else(|| ld_sold_out.then(|| "schema.org availability".to_string()));
        extraction.challenge_marker = Self::find_phrase(&lowered, &self.challenge_phrases);
        extraction
    }
}

fn collect_offers(value: &Value, rooms: &mut Vec<RoomRate>, sold_out: &mut bool) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_offers(item, rooms, sold_out);
            }
        }
        Value::Object(map) => {
            if let Some(availability) = map.get("availability").and_then(Value::as_str) {
                if availability.contains("OutOfStock") || availability.contains("SoldOut") {
                    *sold_out = true;
                }
            }
            if let Some(price) = map.get("price") {
                let amount = match price {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                let available = map
                    .get("availability")
                    .and_then(Value::as_str)
                    .map(|a| !a.contains("OutOfStock") && !a.contains("SoldOut"))
                    .unwrap_or(true);
                if available {
                    rooms.push(RoomRate {
                        name: map
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        raw_price: Some(price.to_string()),
                        price: amount,
                        currency: map
                            .get("priceCurrency")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    });
                }
            }
            for child in map.values() {
                if child.is_object() || child.is_array() {
                    collect_offers(child, rooms, sold_out);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> SelectorExtractor {
        SelectorExtractor::new(&SelectorSet::default(), Some("EUR".to_string())).unwrap()
    }

    #[test]
    fn test_priced_rooms_are_available() {
        let html = r#"<html><body>
            <div class="room"><span class="room-name">Double</span><span class="price">€ 240</span></div>
            <div class="room"><span class="room-name">Single</span><span class="price">€ 180,50</span></div>
        </body></html>"#;
        let extraction = extractor().extract(html);
        assert_eq!(extraction.rooms.len(), 2);
        assert_eq!(
            extraction.verdict(),
            Verdict::Available {
                price: 180.5,
                currency: Some("EUR".to_string())
            }
        );
    }

    #[test]
    fn test_data_price_attribute_wins() {
        let html = r#"<div data-room-id="7"><b data-room-name>Suite</b><i data-price="310.00">see price</i></div>"#;
        let extraction = extractor().extract(html);
        assert_eq!(extraction.rooms[0].price, Some(310.0));
        assert_eq!(extraction.rooms[0].name, "Suite");
    }

    #[test]
    fn test_sold_out_marker_is_red() {
        let html = r#"<div class="notice">Sorry, we have no availability for these dates.</div>"#;
        let verdict = extractor().extract(html).verdict();
        assert!(matches!(verdict, Verdict::SoldOut { .. }));
    }

    #[test]
    fn test_room_without_price_is_not_available() {
        let html = r#"<div class="room"><span class="room-name">Double</span></div>"#;
        assert_eq!(extractor().extract(html).verdict(), Verdict::Ambiguous);
    }

    #[test]
    fn test_challenge_page() {
        let html = r#"<html><title>Verify you are human</title><div id="px-captcha"></div></html>"#;
        assert!(matches!(
            extractor().extract(html).verdict(),
            Verdict::Challenge { .. }
        ));
    }

    #[test]
    fn test_json_ld_fallback() {
        let html = r#"<script type="application/ld+json">
            {"@type": "Hotel", "makesOffer": [
                {"@type": "Offer", "name": "Twin", "price": "129.00", "priceCurrency": "CHF"},
                {"@type": "Offer", "name": "Loft", "price": 99, "availability": "https://schema.org/SoldOut"}
            ]}
        </script>"#;
        let extraction = extractor().extract(html);
        assert!(extraction.from_json_ld);
        assert_eq!(
            extraction.verdict(),
            Verdict::Available {
                price: 129.0,
                currency: Some("CHF".to_string())
            }
        );
    }

    #[test]
    fn test_invalid_selector_is_rejected() {
        let set = SelectorSet {
            room: "div[".to_string(),
            ..Default::default()
        };
        assert!(SelectorExtractor::new(&set, None).is_err());
    }
}

//! Deterministic pattern classifier.
//!
//! The fallback when no remote classifier is configured. Scores each intent
//! by the fraction of its example tokens present in the lowercased user
//! text, extracts slots with type-tagged patterns, and picks the argmax.
//!
//! The sentinel suffix `(HANG ON)` forces a random intent at confidence
//! 0.3, which exercises misclassification handling end to end.

use super::{Classifier, Intent};
use crate::flow::{IntentDef, SlotType};
use async_trait::async_trait;
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc, Weekday};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, OnceLock};

const SENTINEL: &str = "(HANG ON)";
const SENTINEL_CONFIDENCE: f64 = 0.3;

pub struct PatternClassifier {
    rng: Mutex<StdRng>,
}

impl Default for PatternClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternClassifier {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded variant for deterministic sentinel draws.
    #[allow(dead_code)] // Used in tests
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn random_intent(&self, intents: &BTreeMap<String, IntentDef>) -> Option<String> {
        let names: Vec<&String> = intents.keys().collect();
        let mut rng = self.rng.lock().unwrap();
        names.choose(&mut *rng).map(|n| (*n).clone())
    }
}

#[async_trait]
impl Classifier for PatternClassifier {
    async fn classify(
        &self,
        text: &str,
        intents: &BTreeMap<String, IntentDef>,
        _context: &Value,
    ) -> Intent {
        let trimmed = text.trim();
        if trimmed.ends_with(SENTINEL) {
            let stripped = trimmed[..trimmed.len() - SENTINEL.len()].trim();
            if let Some(name) = self.random_intent(intents) {
                let slots = intents
                    .get(&name)
                    .map_or_else(|| Value::Object(Map::new()), |def| extract_slots(def, stripped));
                return Intent::new(name, SENTINEL_CONFIDENCE, slots);
            }
        }

        let lower = text.to_lowercase();
        let text_tokens: BTreeSet<String> = tokenize(&lower).collect();

        let mut best: Option<(&String, f64)> = None;
        for (name, def) in intents {
            let score = example_overlap(def, &text_tokens);
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((name, score));
            }
        }

        match best {
            Some((name, score)) => {
                let slots = intents
                    .get(name)
                    .map_or_else(|| Value::Object(Map::new()), |def| extract_slots(def, text));
                Intent::new(name.clone(), score, slots)
            }
            None => Intent::new("unknown", 0.0, Value::Object(Map::new())),
        }
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Fraction of the intent's example tokens present in the user text.
fn example_overlap(def: &IntentDef, text_tokens: &BTreeSet<String>) -> f64 {
    let example_tokens: BTreeSet<String> = def
        .examples
        .iter()
        .flat_map(|e| tokenize(&e.to_lowercase()).collect::<Vec<_>>())
        .collect();
    if example_tokens.is_empty() {
        return 0.0;
    }
    let hits = example_tokens
        .iter()
        .filter(|t| text_tokens.contains(*t))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f64 / example_tokens.len() as f64;
    score
}

fn extract_slots(def: &IntentDef, text: &str) -> Value {
    let mut slots = Map::new();
    for (name, slot_type) in &def.slots {
        if let Some(value) = extract_slot(*slot_type, text) {
            slots.insert(name.clone(), value);
        }
    }
    Value::Object(slots)
}

/// Extract one typed slot from the user text.
pub fn extract_slot(slot_type: SlotType, text: &str) -> Option<Value> {
    match slot_type {
        SlotType::Number => extract_number(text),
        SlotType::Date => extract_date(text, Utc::now().date_naive()),
        SlotType::Time => extract_time(text),
        SlotType::Name => extract_name(text),
        SlotType::Phone => extract_phone(text),
        SlotType::String => Some(Value::String(text.trim().to_string())),
    }
}

fn extract_number(text: &str) -> Option<Value> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\d+").expect("number pattern"));
    re.find(text)?.as_str().parse::<i64>().ok().map(Value::from)
}

fn extract_date(text: &str, today: NaiveDate) -> Option<Value> {
    let lower = text.to_lowercase();

    if lower.contains("today") {
        return Some(iso(today));
    }
    if lower.contains("tomorrow") {
        return Some(iso(today + ChronoDuration::days(1)));
    }

    static ISO_RE: OnceLock<Regex> = OnceLock::new();
    let iso_re = ISO_RE.get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("iso date pattern"));
    if let Some(caps) = iso_re.captures(&lower) {
        return Some(Value::String(caps[0].to_string()));
    }

    static US_RE: OnceLock<Regex> = OnceLock::new();
    let us_re = US_RE.get_or_init(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("us date pattern"));
    if let Some(caps) = us_re.captures(&lower) {
        let month: u32 = caps[1].parse().ok()?;
        let day: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day).map(iso);
    }

    static WEEKDAY_RE: OnceLock<Regex> = OnceLock::new();
    let weekday_re = WEEKDAY_RE.get_or_init(|| {
        Regex::new(r"\b(?:next\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b")
            .expect("weekday pattern")
    });
    if let Some(caps) = weekday_re.captures(&lower) {
        let target = parse_weekday(&caps[1])?;
        let ahead = i64::from(target.num_days_from_monday())
            - i64::from(today.weekday().num_days_from_monday());
        let ahead = ahead.rem_euclid(7);
        let ahead = if ahead == 0 { 7 } else { ahead };
        return Some(iso(today + ChronoDuration::days(ahead)));
    }

    None
}

fn iso(date: NaiveDate) -> Value {
    Value::String(date.format("%Y-%m-%d").to_string())
}

fn parse_weekday(name: &str) -> Option<Weekday> {
    match name {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

fn extract_time(text: &str) -> Option<Value> {
    let lower = text.to_lowercase();

    static HM_RE: OnceLock<Regex> = OnceLock::new();
    let hm_re = HM_RE
        .get_or_init(|| Regex::new(r"\b(\d{1,2}):(\d{2})\s*(am|pm)?\b").expect("time pattern"));
    for caps in hm_re.captures_iter(&lower) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        if let Some(normalized) = normalize_time(hour, minute, caps.get(3).map(|m| m.as_str())) {
            return Some(normalized);
        }
    }

    static H_RE: OnceLock<Regex> = OnceLock::new();
    let h_re = H_RE.get_or_init(|| Regex::new(r"\b(\d{1,2})\s*(am|pm)\b").expect("hour pattern"));
    if let Some(caps) = h_re.captures(&lower) {
        let hour: u32 = caps[1].parse().ok()?;
        return normalize_time(hour, 0, Some(&caps[2]));
    }

    None
}

fn normalize_time(hour: u32, minute: u32, meridiem: Option<&str>) -> Option<Value> {
    if minute > 59 {
        return None;
    }
    let hour = match meridiem {
        Some("pm") if hour < 12 => hour + 12,
        Some("am") if hour == 12 => 0,
        _ => hour,
    };
    if hour > 23 {
        return None;
    }
    Some(Value::String(format!("{hour:02}:{minute:02}")))
}

fn extract_name(text: &str) -> Option<Value> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b([A-Z][a-z]+)\s+([A-Z][a-z]+)\b").expect("name pattern")
    });
    let caps = re.captures(text)?;
    Some(Value::String(format!("{} {}", &caps[1], &caps[2])))
}

fn extract_phone(text: &str) -> Option<Value> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?:\+?1[ .-]?)?(?:\(\d{3}\)[ .-]?|\d{3}[ .-])?\d{3}[ .-]?\d{4}\b")
            .expect("phone pattern")
    });
    re.find(text).map(|m| Value::String(m.as_str().to_string()))
}

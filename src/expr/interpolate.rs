//! Variable interpolation for `{{path}}` and `{{path, format}}` tokens.
//!
//! Unresolved tokens are left verbatim. Formatting is locale-aware; the
//! locale comes from the `locale` variable and defaults to `en-US`.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use regex_lite::{Captures, Regex};
use serde_json::Value;

use super::{get_path_value, strip_token};

fn token_regex() -> &'static Regex {
    static TOKEN_REGEX: OnceLock<Regex> = OnceLock::new();
    TOKEN_REGEX.get_or_init(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("valid regex"))
}

/// Replace every resolvable token in `template`.
pub fn interpolate(template: &str, vars: &Value) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    let locale = Locale::resolve(vars);
    token_regex()
        .replace_all(template, |caps: &Captures| {
            let (path, format) = split_token(&caps[1]);
            match get_path_value(vars, path) {
                Some(value) => match format {
                    Some(format) => format_value(value, format, &locale, vars),
                    None => value_to_string(value),
                },
                None => caps[0].to_string(),
            }
        })
        .to_string()
}

/// Resolve a template to a JSON value.
///
/// A template that is exactly one unformatted token yields the referenced
/// value itself (arrays and objects included); anything else is interpolated
/// into a string.
pub fn resolve_value(template: &str, vars: &Value) -> Value {
    if let Some(inner) = strip_token(template) {
        let (path, format) = split_token(inner);
        if format.is_none() {
            if let Some(value) = get_path_value(vars, path) {
                return value.clone();
            }
        }
    }
    Value::String(interpolate(template, vars))
}

/// Interpolate every string inside a JSON tree.
pub fn interpolate_value(value: &Value, vars: &Value) -> Value {
    match value {
        Value::String(s) => resolve_value(s, vars),
        Value::Array(items) => Value::Array(items.iter().map(|v| interpolate_value(v, vars)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Convert a JSON value to its textual substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn split_token(inner: &str) -> (&str, Option<&str>) {
    match inner.split_once(',') {
        Some((path, format)) => (path.trim(), Some(format.trim())),
        None => (inner.trim(), None),
    }
}

/// Number and date conventions for one locale.
#[derive(Debug, Clone, PartialEq)]
struct Locale {
    group: &'static str,
    decimal: char,
    date: &'static str,
    time: &'static str,
    currency: &'static str,
    symbol_after: bool,
    percent_space: bool,
}

impl Locale {
    fn resolve(vars: &Value) -> Self {
        let tag = vars
            .get("locale")
            .and_then(Value::as_str)
            .unwrap_or("en-US")
            .replace('_', "-");
        Self::for_tag(&tag)
    }

    fn for_tag(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "en-us" | "en" => Self {
                group: ",",
                decimal: '.',
                date: "%m/%d/%Y",
                time: "%I:%M %p",
                currency: "USD",
                symbol_after: false,
                percent_space: false,
            },
            "en-gb" => Self {
                group: ",",
                decimal: '.',
                date: "%d/%m/%Y",
                time: "%H:%M",
                currency: "GBP",
                symbol_after: false,
                percent_space: false,
            },
            "de-de" | "de" => Self {
                group: ".",
                decimal: ',',
                date: "%d.%m.%Y",
                time: "%H:%M",
                currency: "EUR",
                symbol_after: true,
                percent_space: true,
            },
            "fr-fr" | "fr" => Self {
                group: " ",
                decimal: ',',
                date: "%d/%m/%Y",
                time: "%H:%M",
                currency: "EUR",
                symbol_after: true,
                percent_space: true,
            },
            _ => Self {
                group: "",
                decimal: '.',
                date: "%Y-%m-%d",
                time: "%H:%M:%S",
                currency: "USD",
                symbol_after: true,
                percent_space: false,
            },
        }
    }

    fn number(&self, value: f64, decimals: usize) -> String {
        let formatted = format!("{:.*}", decimals, value.abs());
        let (int_part, frac_part) = match formatted.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (formatted.as_str(), None),
        };

        let mut grouped = String::new();
        let digits: Vec<char> = int_part.chars().collect();
        for (i, digit) in digits.iter().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push_str(self.group);
            }
            grouped.push(*digit);
        }

        let mut out = String::new();
        if value < 0.0 && formatted.chars().any(|c| c != '0' && c != '.') {
            out.push('-');
        }
        out.push_str(&grouped);
        if let Some(frac) = frac_part {
            out.push(self.decimal);
            out.push_str(frac);
        }
        out
    }
}

fn currency_symbol(code: &str) -> Option<&'static str> {
    match code {
        "USD" => Some("$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        "JPY" => Some("¥"),
        "INR" => Some("₹"),
        _ => None,
    }
}

const MAX_DECIMALS: usize = 20;

fn parse_decimals(arg: Option<&str>) -> Option<usize> {
    arg.and_then(|a| a.parse::<usize>().ok())
        .map(|d| d.min(MAX_DECIMALS))
}

fn format_value(value: &Value, format: &str, locale: &Locale, vars: &Value) -> String {
    let (kind, arg) = match format.split_once(':') {
        Some((kind, arg)) => (kind.trim(), Some(arg.trim())),
        None => (format, None),
    };

    match kind.to_ascii_lowercase().as_str() {
        "number" => match as_number(value) {
            Some(n) => {
                let decimals = parse_decimals(arg)
                    .unwrap_or(if n.fract() == 0.0 { 0 } else { 2 });
                locale.number(n, decimals)
            }
            None => value_to_string(value),
        },
        "currency" => match as_number(value) {
            Some(n) => {
                let code = arg
                    .map(str::to_ascii_uppercase)
                    .or_else(|| {
                        vars.get("currency")
                            .and_then(Value::as_str)
                            .map(str::to_ascii_uppercase)
                    })
                    .unwrap_or_else(|| locale.currency.to_string());
                let decimals = if code == "JPY" { 0 } else { 2 };
                let amount = locale.number(n, decimals);
                match currency_symbol(&code) {
                    Some(symbol) if locale.symbol_after => format!("{} {}", amount, symbol),
                    Some(symbol) => match amount.strip_prefix('-') {
                        Some(positive) => format!("-{}{}", symbol, positive),
                        None => format!("{}{}", symbol, amount),
                    },
                    None => format!("{} {}", amount, code),
                }
            }
            None => value_to_string(value),
        },
        "percent" => match as_number(value) {
            Some(n) => {
                let pct = n * 100.0;
                let decimals = parse_decimals(arg)
                    .unwrap_or(if (pct * 10.0).round() % 10.0 == 0.0 { 0 } else { 1 });
                let number = locale.number(pct, decimals);
                if locale.percent_space {
                    format!("{} %", number)
                } else {
                    format!("{}%", number)
                }
            }
            None => value_to_string(value),
        },
        "date" => match as_datetime(value) {
            Some(dt) => dt.format(arg.unwrap_or(locale.date)).to_string(),
            None => value_to_string(value),
        },
        "time" => match as_datetime(value) {
            Some(dt) => dt.format(arg.unwrap_or(locale.time)).to_string(),
            None => value_to_string(value),
        },
        "datetime" => match as_datetime(value) {
            Some(dt) => dt
                .format(&format!("{} {}", locale.date, locale.time))
                .to_string(),
            None => value_to_string(value),
        },
        "upper" => value_to_string(value).to_uppercase(),
        "lower" => value_to_string(value).to_lowercase(),
        "json" => value.to_string(),
        _ => value_to_string(value),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

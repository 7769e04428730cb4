//! Deterministic rule-based cleanup of catalog names.
//!
//! Every rule maps its own output to itself, so `clean(clean(x)) == clean(x)`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Unit spellings and their canonical short form. Canonical forms map to themselves.
const UNITS: &[(&str, &str)] = &[
    ("мм", "мм"),
    ("mm", "мм"),
    ("millimeter", "мм"),
    ("millimeters", "мм"),
    ("миллиметр", "мм"),
    ("миллиметра", "мм"),
    ("миллиметров", "мм"),
    ("см", "см"),
    ("cm", "см"),
    ("сантиметр", "см"),
    ("сантиметров", "см"),
    ("кг", "кг"),
    ("kg", "кг"),
    ("kilogram", "кг"),
    ("килограмм", "кг"),
    ("килограмма", "кг"),
    ("килограммов", "кг"),
    ("шт", "шт"),
    ("pcs", "шт"),
    ("pc", "шт"),
    ("piece", "шт"),
    ("pieces", "шт"),
    ("штука", "шт"),
    ("штуки", "шт"),
    ("штук", "шт"),
    ("л", "л"),
    ("liter", "л"),
    ("litre", "л"),
    ("литр", "л"),
    ("литра", "л"),
    ("литров", "л"),
    ("вт", "вт"),
    ("watt", "вт"),
    ("ватт", "вт"),
    ("квт", "квт"),
    ("kw", "квт"),
    ("киловатт", "квт"),
];

/// Non-unit abbreviations. No expansion is itself a key.
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("эл", "электрический"),
    ("нерж", "нержавеющий"),
    ("оцинк", "оцинкованный"),
    ("шестигр", "шестигранный"),
    ("оборуд", "оборудование"),
    ("изд", "изделие"),
    ("тов", "товар"),
    ("упак", "упаковка"),
    ("комп", "комплект"),
    ("diam", "диаметр"),
    ("диам", "диаметр"),
];

static DECIMAL_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d),(\d)").expect("static regex is valid"));

static NUMBER_LETTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d)(\p{L}+)").expect("static regex is valid"));

static UNIT_TOKEN: Lazy<Regex> = Lazy::new(|| word_table_regex(UNITS));

static ABBREVIATION_TOKEN: Lazy<Regex> = Lazy::new(|| word_table_regex(ABBREVIATIONS));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex is valid"));

fn word_table_regex(table: &[(&str, &str)]) -> Regex {
    let mut keys: Vec<&str> = table.iter().map(|(k, _)| *k).collect();
    // Longest first so alternation prefers the full spelling
    keys.sort_by_key(|k| std::cmp::Reverse(k.chars().count()));
    let alternation = keys
        .iter()
        .map(|k| regex::escape(k))
        .collect::<Vec<_>>()
        .join("|");
    Regex::new(&format!(r"\b({})\b\.?", alternation)).expect("static regex is valid")
}

fn lookup(table: &[(&'static str, &'static str)], key: &str) -> Option<&'static str> {
    table.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
}

/// Clean a raw catalog name
pub fn clean(raw: &str) -> String {
    let text = unify_quotes_and_dashes(raw).to_lowercase().replace('ё', "е");
    let text = DECIMAL_COMMA.replace_all(&text, "$1.$2");
    let text = NUMBER_LETTERS.replace_all(&text, |caps: &Captures| {
        let letters = &caps[2];
        if lookup(UNITS, letters).is_some() {
            format!("{} {}", &caps[1], letters)
        } else {
            caps[0].to_string()
        }
    });
    let text = ABBREVIATION_TOKEN.replace_all(&text, |caps: &Captures| {
        let expansion = lookup(ABBREVIATIONS, &caps[1]).unwrap_or("");
        format!("{} ", expansion)
    });
    let text = UNIT_TOKEN.replace_all(&text, |caps: &Captures| {
        let unit = lookup(UNITS, &caps[1]).unwrap_or("");
        format!("{} ", unit)
    });
    let text = strip_punctuation(&text);
    WHITESPACE.replace_all(&text, " ").trim().to_string()
}

/// Cleaned-name prefix used to pre-partition duplicate detection batches
pub fn blocking_key(name: &str, len: usize) -> String {
    let prefix: String = clean(name).chars().take(len).collect();
    prefix.trim_end().to_string()
}

fn unify_quotes_and_dashes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '«' | '»' | '“' | '”' | '„' => '"',
            '‘' | '’' | '‚' => '\'',
            '—' | '–' | '−' => '-',
            other => other,
        })
        .collect()
}

/// Keep letters, digits and `%`; keep `.` only between digits and `-`/`/` only between
/// alphanumerics; everything else becomes whitespace.
fn strip_punctuation(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| chars.get(p)).copied();
        let next = chars.get(i + 1).copied();
        let keep = match c {
            c if c.is_alphanumeric() || c.is_whitespace() || c == '%' => true,
            '.' => prev.is_some_and(|p| p.is_ascii_digit()) && next.is_some_and(|n| n.is_ascii_digit()),
            '-' | '/' => {
                prev.is_some_and(|p| p.is_alphanumeric()) && next.is_some_and(|n| n.is_alphanumeric())
            }
            _ => false,
        };
        out.push(if keep { c } else { ' ' });
    }
    out
}

//! Relative-date placeholder resolution
//!
//! Expands phrases such as "last month" or `{{CURRENT_YEAR}}` into absolute
//! literals against a reference date. Resolution is a pure function of the text
//! and the reference date; phrases that are not recognized are left in place
//! for the model to interpret.
use chrono::{Datelike, NaiveDate};
use lazy_static::lazy_static;
use regex::{Captures, Match, Regex};
use serde::Serialize;

lazy_static! {
    static ref TEMPLATE_TOKEN: Regex = Regex::new(
        r"(?i)\{\{\s*(CURRENT_YEAR|CURRENT_MONTH|CURRENT_DATE|YEAR_MONTH|TODAY)\s*(?:([+-])\s*(\d{1,4}))?\s*\}\}"
    )
    .unwrap();
    static ref YEAR_MONTH_PAIR: Regex = Regex::new(
        r"(?i)\{\{\s*CURRENT_YEAR\s*(?:([+-])\s*(\d{1,4}))?\s*\}\}(\s*-\s*)\{\{\s*CURRENT_MONTH\s*(?:([+-])\s*(\d{1,4}))?\s*\}\}"
    )
    .unwrap();
    static ref IN_MONTH_NAME: Regex = Regex::new(
        r"(?i)\bin\s+(january|february|march|april|may|june|july|august|september|october|november|december|jan|feb|mar|apr|jun|jul|aug|sept|sep|oct|nov|dec)\b(?:\s+((?:19|20)\d{2})\b)?"
    )
    .unwrap();
    static ref IN_YEAR: Regex = Regex::new(r"(?i)\bin\s+((?:19|20)\d{2})\b").unwrap();
    static ref RELATIVE_MONTH: Regex = Regex::new(r"(?i)\b(this|last|previous)\s+month\b").unwrap();
    static ref RELATIVE_YEAR: Regex = Regex::new(r"(?i)\b(this|last|previous)\s+year\b").unwrap();
    static ref RELATIVE_DAY: Regex = Regex::new(r"(?i)\b(today|yesterday)\b").unwrap();
}

/// One phrase that was rewritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub phrase: String,
    pub literal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub text: String,
    pub replacements: Vec<Replacement>,
}

impl Resolution {
    pub fn changed(&self) -> bool {
        !self.replacements.is_empty()
    }
}

/// Stateless resolver; kept as a type so callers can hold it next to the other
/// pipeline stages.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderResolver;

impl PlaceholderResolver {
    pub fn new() -> Self {
        Self
    }

    /// Replace every recognized relative-time expression in `text`.
    pub fn resolve(&self, text: &str, reference: NaiveDate) -> Resolution {
        let mut replacements = Vec::new();

        let text = Self::apply_templates(text, reference, &mut replacements);
        let text = Self::apply(&IN_MONTH_NAME, &text, &mut replacements, |caps| {
            let month = month_number(&caps[1])?;
            let year = match caps.get(2) {
                Some(y) => y.as_str().parse().ok()?,
                None => reference.year(),
            };
            Some(format!("in month {}", year_month(year, month)))
        });
        let text = Self::apply(&IN_YEAR, &text, &mut replacements, |caps| {
            Some(format!("in year {}", &caps[1]))
        });
        let text = Self::apply(&RELATIVE_MONTH, &text, &mut replacements, |caps| {
            let delta = if caps[1].eq_ignore_ascii_case("this") { 0 } else { -1 };
            let (year, month) = shift_month(reference.year(), reference.month(), delta);
            Some(format!("month {}", year_month(year, month)))
        });
        let text = Self::apply(&RELATIVE_YEAR, &text, &mut replacements, |caps| {
            let delta = if caps[1].eq_ignore_ascii_case("this") { 0 } else { 1 };
            Some(format!("year {}", reference.year() - delta))
        });
        let text = Self::apply(&RELATIVE_DAY, &text, &mut replacements, |caps| {
            let day = if caps[1].eq_ignore_ascii_case("today") {
                reference
            } else {
                reference.pred_opt()?
            };
            Some(day.format("%Y-%m-%d").to_string())
        });

        Resolution { text, replacements }
    }

    /// Replace only `{{...}}` template tokens. Used on generated SQL, where
    /// words like "today" may be part of a literal.
    pub fn resolve_templates(&self, text: &str, reference: NaiveDate) -> Resolution {
        let mut replacements = Vec::new();
        let text = Self::apply_templates(text, reference, &mut replacements);
        Resolution { text, replacements }
    }

    /// `{{CURRENT_YEAR}}-{{CURRENT_MONTH-1}}` is resolved as one year-month so
    /// the month offset carries into the year.
    fn apply_templates(text: &str, reference: NaiveDate, replacements: &mut Vec<Replacement>) -> String {
        let text = Self::apply(&YEAR_MONTH_PAIR, text, replacements, |caps| {
            let years = offset(caps.get(1), caps.get(2))?;
            let months = offset(caps.get(4), caps.get(5))?;
            let (year, month) = shift_month(reference.year() + years, reference.month(), months);
            Some(format!("{:04}{}{:02}", year, &caps[3], month))
        });
        Self::apply(&TEMPLATE_TOKEN, &text, replacements, |caps| {
            Self::template_literal(caps, reference)
        })
    }

    fn apply<F>(pattern: &Regex, text: &str, replacements: &mut Vec<Replacement>, literal: F) -> String
    where
        F: Fn(&Captures) -> Option<String>,
    {
        pattern
            .replace_all(text, |caps: &Captures| {
                let phrase = caps[0].to_string();
                match literal(caps) {
                    Some(value) => {
                        replacements.push(Replacement {
                            phrase,
                            literal: value.clone(),
                        });
                        value
                    }
                    None => phrase,
                }
            })
            .into_owned()
    }

    fn template_literal(caps: &Captures, reference: NaiveDate) -> Option<String> {
        let offset = offset(caps.get(2), caps.get(3))?;

        match caps[1].to_ascii_uppercase().as_str() {
            "CURRENT_YEAR" => Some((reference.year() + offset).to_string()),
            // A lone month token has no year to carry into; it names the month of the year.
            "CURRENT_MONTH" => {
                let month = (reference.month0() as i32 + offset).rem_euclid(12) + 1;
                Some(format!("{:02}", month))
            }
            "YEAR_MONTH" => {
                let (year, month) = shift_month(reference.year(), reference.month(), offset);
                Some(year_month(year, month))
            }
            "CURRENT_DATE" | "TODAY" => {
                let day = reference.checked_add_signed(chrono::Duration::days(offset as i64))?;
                Some(day.format("%Y-%m-%d").to_string())
            }
            _ => None,
        }
    }
}

/// Signed template offset; zero when the token carries none.
fn offset(sign: Option<Match>, amount: Option<Match>) -> Option<i32> {
    match (sign, amount) {
        (Some(sign), Some(amount)) => {
            let amount: i32 = amount.as_str().parse().ok()?;
            Some(if sign.as_str() == "-" { -amount } else { amount })
        }
        _ => Some(0),
    }
}

/// Calendar-correct month arithmetic, carrying into the year.
pub fn shift_month(year: i32, month: u32, delta: i32) -> (i32, u32) {
    let index = year * 12 + month as i32 - 1 + delta;
    (index.div_euclid(12), (index.rem_euclid(12) + 1) as u32)
}

fn year_month(year: i32, month: u32) -> String {
    format!("{:04}-{:02}", year, month)
}

fn month_number(name: &str) -> Option<u32> {
    let month = match name.to_ascii_lowercase().as_str() {
        "january" | "jan" => 1,
        "february" | "feb" => 2,
        "march" | "mar" => 3,
        "april" | "apr" => 4,
        "may" => 5,
        "june" | "jun" => 6,
        "july" | "jul" => 7,
        "august" | "aug" => 8,
        "september" | "sept" | "sep" => 9,
        "october" | "oct" => 10,
        "november" | "nov" => 11,
        "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

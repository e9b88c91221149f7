//! Regex entity extraction with source spans.
//!
//! Spans are byte offsets into the scanned text (subject + newline + body).
//! Values are deduplicated per kind; the first occurrence wins the span.

use mailpipe_core::analysis::{EntityMatch, EntitySet};
use once_cell::sync::Lazy;
use regex::Regex;

struct Extractor {
    regex: Regex,
    /// Capture group holding the value; 0 = whole match.
    group: usize,
    confidence: f64,
}

fn ex(pattern: &str, group: usize, confidence: f64) -> Extractor {
    Extractor {
        regex: Regex::new(pattern).expect("static pattern"),
        group,
        confidence,
    }
}

static PO_NUMBERS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(
            r"(?i)\b(?:p\.?o\.?|purchase\s+order)\s*(?:number|no\.?)?\s*[:#]?\s*(\d{5,10})\b",
            1,
            0.95,
        ),
        ex(r"(?i)\bpo[-#](\d{5,10})\b", 1, 0.95),
    ]
});

static QUOTE_NUMBERS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(r"(?i)\b(qt-\d{3,8})\b", 1, 0.95),
        ex(
            r"(?i)\bquot(?:e|ation)\s*(?:number|no\.?)?\s*[:#]?\s*([a-z]{0,3}-?\d{3,8})\b",
            1,
            0.9,
        ),
    ]
});

static CASE_NUMBERS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(
            r"(?i)\b(?:case|ticket|incident|sr|inc)\s*(?:number|no\.?)?\s*[:#]?\s*(\d{4,12})\b",
            1,
            0.9,
        ),
        ex(r"(?i)\b((?:inc|sr|cs)\d{5,12})\b", 1, 0.85),
    ]
});

static PART_NUMBERS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![ex(r"\b([A-Z]{2,5}\d{2,6}(?:-[A-Z0-9]{2,8})+)\b", 1, 0.6)]
});

static MONEY_AMOUNTS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(r"(\$\s?\d{1,3}(?:,\d{3})*(?:\.\d{2})?)", 1, 0.95),
        ex(r"(?i)\b((?:usd|eur|gbp)\s?\d[\d,]*(?:\.\d{2})?)\b", 1, 0.9),
    ]
});

static DATES: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(r"\b(\d{4}-\d{2}-\d{2})\b", 1, 0.95),
        ex(r"\b(\d{1,2}/\d{1,2}/\d{2,4})\b", 1, 0.85),
        ex(
            r"(?i)\b((?:jan|feb|mar|apr|may|jun|jul|aug|sep|oct|nov|dec)[a-z]*\.?\s+\d{1,2}(?:st|nd|rd|th)?(?:,?\s+\d{4})?)\b",
            1,
            0.8,
        ),
        ex(
            r"(?i)\b(?:by|before|until|due)\s+((?:mon|tues?|wednes|thurs?|fri|satur|sun)day)\b",
            1,
            0.7,
        ),
    ]
});

static PEOPLE: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![
        ex(r"(?:Hi|Hello|Dear|Hey)[ ,]+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)", 1, 0.7),
        ex(
            r"(?:Regards|Thanks|Thank you|Best|Sincerely|Cheers),?\s*\n\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)",
            1,
            0.65,
        ),
    ]
});

static ORGANIZATIONS: Lazy<Vec<Extractor>> = Lazy::new(|| {
    vec![ex(
        r"\b([A-Z][A-Za-z&]+(?:\s+[A-Z][A-Za-z&]+)*\s+(?:Inc|LLC|Corp|Corporation|Ltd|GmbH|Co)\.?)(?:\s|$|[,.;])",
        1,
        0.7,
    )]
});

fn run(extractors: &[Extractor], text: &str, out: &mut Vec<EntityMatch>) {
    for e in extractors {
        for caps in e.regex.captures_iter(text) {
            let Some(m) = caps.get(e.group) else { continue };
            let value = m.as_str().trim().to_string();
            if value.is_empty() || out.iter().any(|x| x.value.eq_ignore_ascii_case(&value)) {
                continue;
            }
            out.push(EntityMatch {
                value,
                confidence: e.confidence,
                span_start: m.start(),
                span_end: m.end(),
            });
        }
    }
}

/// Extract all recognized entity kinds from the scanned text.
pub fn extract(text: &str) -> EntitySet {
    let mut set = EntitySet::default();
    run(&PO_NUMBERS, text, &mut set.po_numbers);
    run(&QUOTE_NUMBERS, text, &mut set.quote_numbers);
    run(&CASE_NUMBERS, text, &mut set.case_numbers);
    run(&PART_NUMBERS, text, &mut set.part_numbers);
    run(&MONEY_AMOUNTS, text, &mut set.money_amounts);
    run(&DATES, text, &mut set.dates);
    run(&PEOPLE, text, &mut set.people);
    run(&ORGANIZATIONS, text, &mut set.organizations);
    set
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn po_number_with_marker() {
        let set = extract("Urgent: PO 12345678 approval needed");
        assert_eq!(set.po_numbers.len(), 1);
        assert_eq!(set.po_numbers[0].value, "12345678");
        assert!(set.po_numbers[0].confidence >= 0.9);
    }

    #[test]
    fn po_number_span_points_at_digits() {
        let text = "re PO 555123 thanks";
        let set = extract(text);
        let m = &set.po_numbers[0];
        assert_eq!(&text[m.span_start..m.span_end], "555123");
    }

    #[test]
    fn money_amounts_with_commas() {
        let set = extract("total spend of $50,000 this quarter, then USD 1,200.50 next");
        let values: Vec<&str> = set.money_amounts.iter().map(|m| m.value.as_str()).collect();
        assert!(values.contains(&"$50,000"));
        assert!(values.iter().any(|v| v.contains("1,200.50")));
    }

    #[test]
    fn quote_numbers() {
        let set = extract("please confirm quote #QT-9987 accepted");
        assert!(set.quote_numbers.iter().any(|m| m.value.eq_ignore_ascii_case("QT-9987")));
    }

    #[test]
    fn case_numbers() {
        let set = extract("following up on case #448822 and ticket 9912");
        let values: Vec<&str> = set.case_numbers.iter().map(|m| m.value.as_str()).collect();
        assert!(values.contains(&"448822"));
        assert!(values.contains(&"9912"));
    }

    #[test]
    fn dates_weekday_deadline() {
        let set = extract("need the approval by Friday at the latest");
        assert!(set.dates.iter().any(|m| m.value.eq_ignore_ascii_case("friday")));
    }

    #[test]
    fn dates_iso_and_month() {
        let set = extract("delivery window 2025-07-01, kickoff March 3rd");
        assert!(set.dates.iter().any(|m| m.value == "2025-07-01"));
        assert!(set.dates.iter().any(|m| m.value.starts_with("March 3")));
    }

    #[test]
    fn people_from_greeting_and_signature() {
        let set = extract("Hi Maria,\nplease review.\n\nRegards,\nJohn Smith");
        let values: Vec<&str> = set.people.iter().map(|m| m.value.as_str()).collect();
        assert!(values.contains(&"Maria"));
        assert!(values.contains(&"John Smith"));
    }

    #[test]
    fn organizations_with_suffix() {
        let set = extract("the contract with Acme Widgets Inc. is signed");
        assert!(set.organizations.iter().any(|m| m.value.starts_with("Acme Widgets Inc")));
    }

    #[test]
    fn values_dedupe_keeping_first_span() {
        let set = extract("PO 12345678 mentioned twice: PO 12345678");
        assert_eq!(set.po_numbers.len(), 1);
        assert_eq!(set.po_numbers[0].span_start, 3);
    }

    #[test]
    fn empty_text_yields_empty_set() {
        assert!(extract("").is_empty());
    }
}

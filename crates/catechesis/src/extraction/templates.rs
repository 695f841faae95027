//! Per-kind field templates applied to recognized lines.
//!
//! A line belongs to the field whose label it starts with (longest label wins).
//! The value is the rest of the line, or the next line when the label stands
//! alone. Labels are matched on accent-folded lowercase text; values keep their
//! original spelling.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;

use super::engine::RecognizedPage;
use super::DocumentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Date,
    Timestamp,
    Amount,
    Reference,
}

#[derive(Debug)]
struct FieldTemplate {
    field: &'static str,
    labels: &'static [&'static str],
    value: ValueKind,
}

const BIRTH_RECORD: &[FieldTemplate] = &[
    FieldTemplate {
        field: "last_name",
        labels: &["nom", "nom de famille", "surname", "last name", "family name"],
        value: ValueKind::Text,
    },
    FieldTemplate {
        field: "given_names",
        labels: &["prenoms", "prenom", "prenom(s)", "given names", "first name", "first names"],
        value: ValueKind::Text,
    },
    FieldTemplate {
        field: "birth_date",
        labels: &["date de naissance", "ne le", "nee le", "ne(e) le", "date of birth", "born on"],
        value: ValueKind::Date,
    },
    FieldTemplate {
        field: "birth_place",
        labels: &["lieu de naissance", "ne a", "nee a", "ne(e) a", "place of birth", "born at"],
        value: ValueKind::Text,
    },
];

const BAPTISM_RECORD: &[FieldTemplate] = &[
    FieldTemplate {
        field: "baptism_date",
        labels: &["date de bapteme", "baptise le", "baptisee le", "baptise(e) le", "date of baptism", "baptized on"],
        value: ValueKind::Date,
    },
    FieldTemplate {
        field: "parish",
        labels: &["paroisse", "paroisse de bapteme", "parish", "eglise"],
        value: ValueKind::Text,
    },
    FieldTemplate {
        field: "officiant",
        labels: &["celebrant", "officiant", "ministre", "pretre", "minister", "par l'abbe", "par le pere"],
        value: ValueKind::Text,
    },
];

const TRANSFER_ATTESTATION: &[FieldTemplate] = &[
    FieldTemplate {
        field: "origin_parish",
        labels: &["paroisse d'origine", "paroisse de provenance", "paroisse", "origin parish", "from parish"],
        value: ValueKind::Text,
    },
    FieldTemplate {
        field: "prior_year",
        labels: &["annee precedente", "niveau precedent", "classe precedente", "annee de catechese", "prior year", "previous year", "previous level"],
        value: ValueKind::Text,
    },
];

const PAYMENT_PROOF: &[FieldTemplate] = &[
    FieldTemplate {
        field: "transaction_id",
        labels: &["id de transaction", "id transaction", "transaction id", "numero de transaction", "reference", "ref", "txn id"],
        value: ValueKind::Reference,
    },
    FieldTemplate {
        field: "amount",
        labels: &["montant", "amount", "vous avez envoye", "you sent", "paiement de", "somme"],
        value: ValueKind::Amount,
    },
    FieldTemplate {
        field: "timestamp",
        labels: &["date", "date et heure", "date/heure", "date & heure", "time", "le"],
        value: ValueKind::Timestamp,
    },
];

/// Labels that look like a template label but name something else.
const DECOY_LABELS: &[&str] = &[
    "nom du pere",
    "nom de la mere",
    "prenom du pere",
    "prenoms du pere",
    "prenom de la mere",
    "prenoms de la mere",
    "nom du parrain",
    "nom de la marraine",
    "date de l'acte",
    "date de delivrance",
    "frais",
    "fees",
    "solde",
    "balance",
    "nouveau solde",
];

fn templates(kind: DocumentKind) -> &'static [FieldTemplate] {
    match kind {
        DocumentKind::BirthRecord => BIRTH_RECORD,
        DocumentKind::BaptismRecord => BAPTISM_RECORD,
        DocumentKind::TransferAttestation => TRANSFER_ATTESTATION,
        DocumentKind::PaymentProof => PAYMENT_PROOF,
    }
}

/// Field names a kind's template reads, in template order.
pub fn template_fields(kind: DocumentKind) -> impl Iterator<Item = &'static str> {
    templates(kind).iter().map(|template| template.field)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateMatch {
    /// Every template field, `None` when it could not be read.
    pub fields: BTreeMap<String, Option<String>>,
    /// Recognition confidence of each field that was read.
    pub confidences: Vec<f32>,
}

pub fn apply(kind: DocumentKind, page: &RecognizedPage) -> TemplateMatch {
    let templates = templates(kind);
    let mut result = TemplateMatch {
        fields: templates
            .iter()
            .map(|template| (template.field.to_string(), None))
            .collect(),
        confidences: Vec::new(),
    };

    let folded: Vec<String> = page.lines.iter().map(|line| fold(&line.text)).collect();

    for (index, line) in page.lines.iter().enumerate() {
        let Some((template, label_len)) = label_at(templates, &folded[index]) else {
            continue;
        };
        let Some(template) = template else {
            continue;
        };
        if matches!(result.fields.get(template.field), Some(Some(_))) {
            continue;
        }

        let rest = strip_separators(&line.text.chars().skip(label_len).collect::<String>());
        let (raw, confidence) = if rest.is_empty() {
            match page.lines.get(index + 1) {
                Some(next) if label_at(templates, &folded[index + 1]).is_none() => {
                    (next.text.trim().to_string(), line.confidence.min(next.confidence))
                }
                _ => continue,
            }
        } else {
            (rest, line.confidence)
        };

        if let Some(value) = normalize(template.value, &raw) {
            result.fields.insert(template.field.to_string(), Some(value));
            result.confidences.push(confidence.clamp(0.0, 1.0));
        }
    }

    result
}

/// Longest label the line starts with. `Some((None, _))` means a decoy label.
fn label_at<'t>(
    templates: &'t [FieldTemplate],
    folded: &str,
) -> Option<(Option<&'t FieldTemplate>, usize)> {
    let line = folded.trim_start();
    let indent = folded.chars().count() - line.chars().count();

    let fields = templates.iter().flat_map(|template| {
        template
            .labels
            .iter()
            .map(move |label| (Some(template), *label))
    });
    let decoys = DECOY_LABELS.iter().map(|label| (None, *label));

    fields
        .chain(decoys)
        .filter(|(_, label)| starts_with_word(line, label))
        .max_by_key(|(_, label)| label.chars().count())
        .map(|(template, label)| (template, indent + label.chars().count()))
}

fn starts_with_word(line: &str, label: &str) -> bool {
    line.starts_with(label)
        && !line[label.len()..]
            .chars()
            .next()
            .is_some_and(char::is_alphanumeric)
}

fn strip_separators(rest: &str) -> String {
    rest.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ':' | '-' | '=' | '.' | '\u{2013}'))
        .trim()
        .to_string()
}

/// Lowercase and drop diacritics, one output char per input char so offsets
/// found in the folded text apply to the original.
pub fn fold(text: &str) -> String {
    text.chars()
        .map(|c| {
            let lower = c.to_lowercase().next().unwrap_or(c);
            match lower {
                'à' | 'á' | 'â' | 'ä' | 'ã' => 'a',
                'é' | 'è' | 'ê' | 'ë' => 'e',
                'í' | 'ì' | 'î' | 'ï' => 'i',
                'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
                'ú' | 'ù' | 'û' | 'ü' => 'u',
                'ç' => 'c',
                'ñ' => 'n',
                'œ' => 'o',
                'æ' => 'a',
                '\u{2019}' | '`' => '\'',
                '\u{a0}' => ' ',
                other => other,
            }
        })
        .collect()
}

fn normalize(kind: ValueKind, raw: &str) -> Option<String> {
    let raw = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if raw.is_empty() {
        return None;
    }

    match kind {
        ValueKind::Text => Some(raw),
        ValueKind::Date => parse_date(&raw).map(|date| date.format("%Y-%m-%d").to_string()),
        ValueKind::Timestamp => parse_timestamp(&raw),
        ValueKind::Amount => parse_amount(&raw).map(|amount| amount.to_string()),
        ValueKind::Reference => parse_reference(&raw),
    }
}

static NUMERIC_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[/.\-](\d{1,2})[/.\-](\d{4})\b").expect("static pattern compiles")
});
static ISO_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("static pattern compiles"));
static WORDED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})(?:er)?\s+([a-z]+)\.?\s+(\d{4})\b").expect("static pattern compiles")
});
static CLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[:h](\d{2})(?::(\d{2}))?\b").expect("static pattern compiles")
});
static AMOUNT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{1,3}(?:[ .,']\d{3})+|\d+)").expect("static pattern compiles")
});
static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9.\-]{3,}").expect("static pattern compiles"));

fn month_number(name: &str) -> Option<u32> {
    let month = match name {
        "janvier" | "january" | "jan" | "janv" => 1,
        "fevrier" | "february" | "feb" | "fev" | "fevr" => 2,
        "mars" | "march" | "mar" => 3,
        "avril" | "april" | "apr" | "avr" => 4,
        "mai" | "may" => 5,
        "juin" | "june" | "jun" => 6,
        "juillet" | "july" | "jul" | "juil" => 7,
        "aout" | "august" | "aug" => 8,
        "septembre" | "september" | "sep" | "sept" => 9,
        "octobre" | "october" | "oct" => 10,
        "novembre" | "november" | "nov" => 11,
        "decembre" | "december" | "dec" => 12,
        _ => return None,
    };
    Some(month)
}

/// Day-first numeric dates, ISO dates, and French or English worded dates.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let folded = fold(raw);

    if let Some(caps) = ISO_DATE.captures(&folded) {
        return NaiveDate::from_ymd_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, caps[3].parse().ok()?);
    }
    if let Some(caps) = NUMERIC_DATE.captures(&folded) {
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?);
    }
    if let Some(caps) = WORDED_DATE.captures(&folded) {
        let month = month_number(&caps[2])?;
        return NaiveDate::from_ymd_opt(caps[3].parse().ok()?, month, caps[1].parse().ok()?);
    }
    None
}

fn parse_timestamp(raw: &str) -> Option<String> {
    let date = parse_date(raw)?;
    let time = CLOCK.captures(raw).and_then(|caps| {
        let seconds = caps
            .get(3)
            .and_then(|value| value.as_str().parse().ok())
            .unwrap_or(0);
        NaiveTime::from_hms_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, seconds)
    });

    Some(match time {
        Some(time) => date.and_time(time).format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => date.format("%Y-%m-%d").to_string(),
    })
}

/// First amount on the line in whole francs. Group separators are dropped.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let found = AMOUNT.find(raw)?;
    let digits: String = found.as_str().chars().filter(char::is_ascii_digit).collect();
    digits.parse::<i64>().ok().filter(|amount| *amount > 0)
}

fn parse_reference(raw: &str) -> Option<String> {
    REFERENCE
        .find_iter(raw)
        .map(|found| found.as_str().trim_end_matches(['.', '-']))
        .find(|candidate| candidate.len() >= 4 && candidate.chars().any(|c| c.is_ascii_digit()))
        .map(|candidate| candidate.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::engine::RecognizedLine;

    fn page(lines: &[(&str, f32)]) -> RecognizedPage {
        RecognizedPage {
            lines: lines
                .iter()
                .map(|(text, confidence)| RecognizedLine {
                    text: text.to_string(),
                    confidence: *confidence,
                })
                .collect(),
            dominant_rgb: None,
        }
    }

    #[test]
    fn birth_record_fields_are_read_and_decoys_skipped() {
        let matched = apply(
            DocumentKind::BirthRecord,
            &page(&[
                ("EXTRAIT D'ACTE DE NAISSANCE", 0.95),
                ("Nom du père : Ibrahima Diallo", 0.9),
                ("Nom : DIALLO", 0.92),
                ("Prénoms : Amadou", 0.92),
                ("Né le : 12/03/2015", 0.92),
                ("Lieu de naissance", 0.92),
                ("Thiès", 0.92),
            ]),
        );

        let field = |name: &str| matched.fields.get(name).cloned().flatten();
        assert_eq!(field("last_name").as_deref(), Some("DIALLO"));
        assert_eq!(field("given_names").as_deref(), Some("Amadou"));
        assert_eq!(field("birth_date").as_deref(), Some("2015-03-12"));
        assert_eq!(field("birth_place").as_deref(), Some("Thiès"));
        assert_eq!(matched.confidences.len(), 4);
    }

    #[test]
    fn missing_fields_stay_present_as_none() {
        let matched = apply(
            DocumentKind::BaptismRecord,
            &page(&[("Paroisse : Saint Joseph de Médina", 0.8)]),
        );
        assert_eq!(matched.fields.len(), 3);
        assert_eq!(matched.fields.get("baptism_date"), Some(&None));
        assert_eq!(
            matched.fields.get("parish").cloned().flatten().as_deref(),
            Some("Saint Joseph de Médina")
        );
    }

    #[test]
    fn payment_proof_values_are_normalized() {
        let matched = apply(
            DocumentKind::PaymentProof,
            &page(&[
                ("Vous avez envoyé 15 000 F à Paroisse Ste Thérèse", 0.9),
                ("Frais : 150 F", 0.9),
                ("ID de transaction : tx8f3k29", 0.9),
                ("Date : 02/10/2025 14h32", 0.9),
            ]),
        );
        let field = |name: &str| matched.fields.get(name).cloned().flatten();
        assert_eq!(field("amount").as_deref(), Some("15000"));
        assert_eq!(field("transaction_id").as_deref(), Some("TX8F3K29"));
        assert_eq!(field("timestamp").as_deref(), Some("2025-10-02T14:32:00"));
    }

    #[test]
    fn dates_parse_in_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2015, 3, 12);
        assert_eq!(parse_date("12/03/2015"), expected);
        assert_eq!(parse_date("2015-03-12"), expected);
        assert_eq!(parse_date("12 mars 2015"), expected);
        assert_eq!(parse_date("12 March 2015"), expected);
        assert_eq!(parse_date("31/02/2015"), None);
        assert_eq!(parse_date("soon"), None);
    }

    #[test]
    fn amounts_ignore_group_separators() {
        assert_eq!(parse_amount("15 000 FCFA"), Some(15_000));
        assert_eq!(parse_amount("25.000F"), Some(25_000));
        assert_eq!(parse_amount("7500"), Some(7_500));
        assert_eq!(parse_amount("néant"), None);
    }

    #[test]
    fn folding_keeps_character_offsets() {
        let original = "Prénoms : Ndèye Fatou";
        assert_eq!(fold(original).chars().count(), original.chars().count());
        assert_eq!(fold("ÉGLISE Sœur"), "eglise sour");
    }
}

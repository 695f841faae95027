//! Mobile-money provider signatures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::engine::RecognizedPage;
use super::templates::fold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MobileMoneyProvider {
    Wave,
    OrangeMoney,
    FreeMoney,
}

impl MobileMoneyProvider {
    pub const ALL: [MobileMoneyProvider; 3] = [
        MobileMoneyProvider::Wave,
        MobileMoneyProvider::OrangeMoney,
        MobileMoneyProvider::FreeMoney,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            MobileMoneyProvider::Wave => "wave",
            MobileMoneyProvider::OrangeMoney => "orange_money",
            MobileMoneyProvider::FreeMoney => "free_money",
        }
    }

    fn keywords(self) -> &'static [&'static str] {
        match self {
            MobileMoneyProvider::Wave => &["wave", "wave.com", "wave mobile money"],
            MobileMoneyProvider::OrangeMoney => &["orange money", "orangemoney", "#144#", "orange finances mobiles"],
            MobileMoneyProvider::FreeMoney => &["free money", "freemoney", "#150#"],
        }
    }

    fn brand_rgb(self) -> [u8; 3] {
        match self {
            MobileMoneyProvider::Wave => [29, 196, 255],
            MobileMoneyProvider::OrangeMoney => [255, 121, 0],
            MobileMoneyProvider::FreeMoney => [205, 30, 37],
        }
    }
}

impl fmt::Display for MobileMoneyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for MobileMoneyProvider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match fold(value).replace([' ', '-'], "_").as_str() {
            "wave" => Ok(Self::Wave),
            "orange_money" | "orangemoney" | "om" => Ok(Self::OrangeMoney),
            "free_money" | "freemoney" => Ok(Self::FreeMoney),
            other => Err(format!("unknown mobile-money provider '{other}'")),
        }
    }
}

const KEYWORD_WEIGHT: f32 = 0.6;
const COLOUR_WEIGHT: f32 = 0.5;
const DETECTION_THRESHOLD: f32 = 0.5;
/// Euclidean RGB distance under which a dominant colour counts as the brand's.
const COLOUR_TOLERANCE: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProviderMatch {
    pub provider: MobileMoneyProvider,
    pub score: f32,
}

/// Identify the provider from keyword and colour signatures before any field
/// is read off the receipt.
pub fn detect(page: &RecognizedPage) -> Option<ProviderMatch> {
    let text = page
        .lines
        .iter()
        .map(|line| fold(&line.text))
        .collect::<Vec<_>>()
        .join("\n");

    MobileMoneyProvider::ALL
        .iter()
        .map(|provider| {
            let mut score = 0.0;
            if provider
                .keywords()
                .iter()
                .any(|keyword| contains_word(&text, keyword))
            {
                score += KEYWORD_WEIGHT;
            }
            if let Some(rgb) = page.dominant_rgb {
                if colour_distance(rgb, provider.brand_rgb()) <= COLOUR_TOLERANCE {
                    score += COLOUR_WEIGHT;
                }
            }
            ProviderMatch {
                provider: *provider,
                score: f32::min(score, 1.0),
            }
        })
        .filter(|candidate| candidate.score >= DETECTION_THRESHOLD)
        .max_by(|a, b| a.score.total_cmp(&b.score))
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + needle.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

fn colour_distance(a: [u8; 3], b: [u8; 3]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let delta = f32::from(*x) - f32::from(*y);
            delta * delta
        })
        .sum::<f32>()
        .sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_identify_the_provider() {
        let page = RecognizedPage::from_lines(["Transfert Orange Money", "Montant: 15 000 FCFA"], 0.9);
        let found = detect(&page).expect("detected");
        assert_eq!(found.provider, MobileMoneyProvider::OrangeMoney);
    }

    #[test]
    fn brand_colour_alone_is_enough() {
        let page = RecognizedPage::from_lines(["Paiement effectue"], 0.8).with_colour([30, 190, 250]);
        assert_eq!(
            detect(&page).map(|found| found.provider),
            Some(MobileMoneyProvider::Wave)
        );
    }

    #[test]
    fn embedded_words_do_not_match() {
        let page = RecognizedPage::from_lines(["microwave repair receipt"], 0.9);
        assert!(detect(&page).is_none());
    }

    #[test]
    fn providers_parse_from_common_spellings() {
        assert_eq!("Orange Money".parse::<MobileMoneyProvider>(), Ok(MobileMoneyProvider::OrangeMoney));
        assert_eq!("free-money".parse::<MobileMoneyProvider>(), Ok(MobileMoneyProvider::FreeMoney));
        assert!("paypal".parse::<MobileMoneyProvider>().is_err());
    }
}

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Region canonicalization for Italian postal addresses.
//!
//! Back-office records carry the administrative region as free text typed
//! by many different people: `"Emilia Romagna"`, `"EMILIA-ROMAGNA"`,
//! `"Friuli V.G."`, `"Valle d'Aosta"`, `"Trentino Alto Adige/Südtirol"`.
//! This crate folds all of them onto one of the 20 fixed [`Region`]s so
//! that census subsets and map marker filters agree on membership.
//!
//! Matching happens on a normalized key (see [`normalize_key`]): diacritics
//! stripped, anything that is not a letter turned into a space, whitespace
//! collapsed, uppercased.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// One of the 20 Italian administrative regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    /// Abruzzo.
    Abruzzo,
    /// Basilicata.
    Basilicata,
    /// Calabria.
    Calabria,
    /// Campania.
    Campania,
    /// Emilia-Romagna.
    EmiliaRomagna,
    /// Friuli-Venezia Giulia.
    FriuliVeneziaGiulia,
    /// Lazio.
    Lazio,
    /// Liguria.
    Liguria,
    /// Lombardia.
    Lombardia,
    /// Marche.
    Marche,
    /// Molise.
    Molise,
    /// Piemonte.
    Piemonte,
    /// Puglia.
    Puglia,
    /// Sardegna.
    Sardegna,
    /// Sicilia.
    Sicilia,
    /// Toscana.
    Toscana,
    /// Trentino-Alto Adige.
    TrentinoAltoAdige,
    /// Umbria.
    Umbria,
    /// Valle d'Aosta.
    ValleDAosta,
    /// Veneto.
    Veneto,
}

impl Region {
    /// Every region, in alphabetical order of its canonical name.
    pub const ALL: [Self; 20] = [
        Self::Abruzzo,
        Self::Basilicata,
        Self::Calabria,
        Self::Campania,
        Self::EmiliaRomagna,
        Self::FriuliVeneziaGiulia,
        Self::Lazio,
        Self::Liguria,
        Self::Lombardia,
        Self::Marche,
        Self::Molise,
        Self::Piemonte,
        Self::Puglia,
        Self::Sardegna,
        Self::Sicilia,
        Self::Toscana,
        Self::TrentinoAltoAdige,
        Self::Umbria,
        Self::ValleDAosta,
        Self::Veneto,
    ];

    /// The canonical display name, as used in filters and persisted
    /// records.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Abruzzo => "Abruzzo",
            Self::Basilicata => "Basilicata",
            Self::Calabria => "Calabria",
            Self::Campania => "Campania",
            Self::EmiliaRomagna => "Emilia-Romagna",
            Self::FriuliVeneziaGiulia => "Friuli-Venezia Giulia",
            Self::Lazio => "Lazio",
            Self::Liguria => "Liguria",
            Self::Lombardia => "Lombardia",
            Self::Marche => "Marche",
            Self::Molise => "Molise",
            Self::Piemonte => "Piemonte",
            Self::Puglia => "Puglia",
            Self::Sardegna => "Sardegna",
            Self::Sicilia => "Sicilia",
            Self::Toscana => "Toscana",
            Self::TrentinoAltoAdige => "Trentino-Alto Adige",
            Self::Umbria => "Umbria",
            Self::ValleDAosta => "Valle d'Aosta",
            Self::Veneto => "Veneto",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Returned when a string does not name any region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRegion(pub String);

impl fmt::Display for UnknownRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a recognised region", self.0)
    }
}

impl std::error::Error for UnknownRegion {}

impl FromStr for Region {
    type Err = UnknownRegion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        to_canonical_region(s).ok_or_else(|| UnknownRegion(s.to_string()))
    }
}

impl Serialize for Region {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Region {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Common spellings and variants that do not normalize onto a canonical
/// name by themselves. Keys are already in [`normalize_key`] form.
const ALIASES: &[(&str, Region)] = &[
    ("ABRUZZI", Region::Abruzzo),
    ("LUCANIA", Region::Basilicata),
    ("EMILIA", Region::EmiliaRomagna),
    ("ROMAGNA", Region::EmiliaRomagna),
    ("EMILIA ROMAGNA", Region::EmiliaRomagna),
    ("EMILIAROMAGNA", Region::EmiliaRomagna),
    ("FRIULI", Region::FriuliVeneziaGiulia),
    ("FVG", Region::FriuliVeneziaGiulia),
    ("FRIULI V G", Region::FriuliVeneziaGiulia),
    ("FRIULI VG", Region::FriuliVeneziaGiulia),
    ("FRIULI VENEZIA", Region::FriuliVeneziaGiulia),
    ("FRIULI VENEZIA GIULIA", Region::FriuliVeneziaGiulia),
    ("VENEZIA GIULIA", Region::FriuliVeneziaGiulia),
    ("LATIUM", Region::Lazio),
    ("LOMBARDY", Region::Lombardia),
    ("PIEDMONT", Region::Piemonte),
    ("PUGLIE", Region::Puglia),
    ("APULIA", Region::Puglia),
    ("SARDINIA", Region::Sardegna),
    ("SICILY", Region::Sicilia),
    ("TUSCANY", Region::Toscana),
    ("TRENTINO", Region::TrentinoAltoAdige),
    ("ALTO ADIGE", Region::TrentinoAltoAdige),
    ("SUDTIROL", Region::TrentinoAltoAdige),
    ("SUEDTIROL", Region::TrentinoAltoAdige),
    ("TRENTINO ALTO ADIGE SUDTIROL", Region::TrentinoAltoAdige),
    ("TRENTINO SUDTIROL", Region::TrentinoAltoAdige),
    ("TRENTINO AA", Region::TrentinoAltoAdige),
    ("VAL D AOSTA", Region::ValleDAosta),
    ("VALLE DAOSTA", Region::ValleDAosta),
    ("VALLE AOSTA", Region::ValleDAosta),
    ("VALLEE D AOSTE", Region::ValleDAosta),
    ("AOSTA VALLEY", Region::ValleDAosta),
];

/// Normalized canonical names, keyed for exact lookup.
static CANONICAL: LazyLock<BTreeMap<String, Region>> = LazyLock::new(|| {
    Region::ALL
        .iter()
        .map(|region| (normalize_key(region.name()), *region))
        .collect()
});

/// Normalizes free text into a comparison key.
///
/// Uppercases, strips diacritics, replaces every non-letter with a space
/// and collapses runs of whitespace. Applying it twice yields the same key
/// as applying it once.
#[must_use]
pub fn normalize_key(input: &str) -> String {
    let folded: String = input
        .to_uppercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolves free text to a canonical region.
///
/// The alias table is consulted first, then the canonical names
/// themselves. Returns `None` when nothing matches.
#[must_use]
pub fn to_canonical_region(input: &str) -> Option<Region> {
    let key = normalize_key(input);
    if key.is_empty() {
        return None;
    }

    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, region)| *region)
        .or_else(|| CANONICAL.get(&key).copied())
}

/// Returns `true` when a free-text region field belongs to `region`.
///
/// Used to filter displayed markers independently of census subsets.
#[must_use]
pub fn matches_region(raw: &str, region: Region) -> bool {
    to_canonical_region(raw) == Some(region)
}

/// Returns `true` when two free-text region fields name the same region.
/// Unresolvable text matches nothing, not even itself.
#[must_use]
pub fn regions_match(a: &str, b: &str) -> bool {
    to_canonical_region(a).is_some_and(|region| matches_region(b, region))
}

//! Address assembly for geocoding queries.
//!
//! Back-office records keep the address split over several free-text
//! fields, any of which may be blank or padded. Queries are built by
//! joining the non-empty components in a fixed order: street, postal
//! code, city, province, then an optional country qualifier.

use geocensus_entity_models::AddressFields;

/// Values that mean "no data" in back-office exports.
static BLANK_VALUES: &[&str] = &["-", "N/A", "ND", "N.D.", "NULL", "SNC", "S.N.C."];

/// Trims and collapses inner whitespace; maps placeholder values to an
/// empty string.
#[must_use]
pub fn clean_component(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if BLANK_VALUES
        .iter()
        .any(|blank| collapsed.eq_ignore_ascii_case(blank))
    {
        return String::new();
    }
    collapsed
}

/// Builds a one-line address from the entity's components.
///
/// The region is not part of the query: providers resolve it from the
/// city and province, and misspelled regions only add noise.
#[must_use]
pub fn build_address(fields: &AddressFields<'_>, country_qualifier: Option<&str>) -> String {
    let mut parts: Vec<String> = [
        fields.street,
        fields.postal_code,
        fields.city,
        fields.province,
    ]
    .iter()
    .map(|part| clean_component(part))
    .filter(|part| !part.is_empty())
    .collect();

    if let Some(country) = country_qualifier.map(clean_component)
        && !country.is_empty()
    {
        parts.push(country);
    }

    parts.join(", ")
}

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;

/// key: territory-table -> US states + Canadian provinces
static TERRITORY_CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("alabama", "AL"),
        ("alaska", "AK"),
        ("arizona", "AZ"),
        ("arkansas", "AR"),
        ("california", "CA"),
        ("colorado", "CO"),
        ("connecticut", "CT"),
        ("delaware", "DE"),
        ("florida", "FL"),
        ("georgia", "GA"),
        ("hawaii", "HI"),
        ("idaho", "ID"),
        ("illinois", "IL"),
        ("indiana", "IN"),
        ("iowa", "IA"),
        ("kansas", "KS"),
        ("kentucky", "KY"),
        ("louisiana", "LA"),
        ("maine", "ME"),
        ("maryland", "MD"),
        ("massachusetts", "MA"),
        ("michigan", "MI"),
        ("minnesota", "MN"),
        ("mississippi", "MS"),
        ("missouri", "MO"),
        ("montana", "MT"),
        ("nebraska", "NE"),
        ("nevada", "NV"),
        ("new hampshire", "NH"),
        ("new jersey", "NJ"),
        ("new mexico", "NM"),
        ("new york", "NY"),
        ("north carolina", "NC"),
        ("north dakota", "ND"),
        ("ohio", "OH"),
        ("oklahoma", "OK"),
        ("oregon", "OR"),
        ("pennsylvania", "PA"),
        ("rhode island", "RI"),
        ("south carolina", "SC"),
        ("south dakota", "SD"),
        ("tennessee", "TN"),
        ("texas", "TX"),
        ("utah", "UT"),
        ("vermont", "VT"),
        ("virginia", "VA"),
        ("washington", "WA"),
        ("west virginia", "WV"),
        ("wisconsin", "WI"),
        ("wyoming", "WY"),
        ("alberta", "AB"),
        ("british columbia", "BC"),
        ("manitoba", "MB"),
        ("new brunswick", "NB"),
        ("newfoundland and labrador", "NL"),
        ("northwest territories", "NT"),
        ("nova scotia", "NS"),
        ("nunavut", "NU"),
        ("ontario", "ON"),
        ("prince edward island", "PE"),
        ("quebec", "QC"),
        ("saskatchewan", "SK"),
        ("yukon", "YT"),
    ])
});

/// Canonicalize a territory to its 2-letter code. Full names map through the
/// table (case-insensitive); values already in code form are uppercased;
/// anything unrecognized passes through trimmed and unchanged.
pub fn normalize(name: &str) -> String {
    let trimmed = name.trim();
    let lowered = trimmed.to_lowercase();
    if let Some(code) = TERRITORY_CODES.get(lowered.as_str()) {
        return (*code).to_string();
    }
    if trimmed.len() == 2 {
        let upper = trimmed.to_ascii_uppercase();
        if TERRITORY_CODES.values().any(|code| *code == upper) {
            return upper;
        }
    }
    trimmed.to_string()
}

/// Split the raw semicolon-delimited lists, normalize each entry, and divide
/// them into billable territories and entries matching the home territory.
/// The billable side is the union after normalization: a territory claimed in
/// more than one list counts once. Home matching is a filter, so every
/// occurrence of the home territory lands on the excluded side.
pub fn partition_billable(raw_lists: &[&str], home: &str) -> (Vec<String>, Vec<String>) {
    let home = normalize(home);
    let mut billable = Vec::new();
    let mut excluded = Vec::new();
    let mut seen = HashSet::new();
    for raw in raw_lists {
        for entry in raw.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let normalized = normalize(entry);
            if !home.is_empty() && normalized.eq_ignore_ascii_case(&home) {
                excluded.push(normalized);
            } else if seen.insert(normalized.to_lowercase()) {
                billable.push(normalized);
            }
        }
    }
    (billable, excluded)
}

/// Number of billable territories in one raw list, home territory excluded.
pub fn count_billable(raw_list: &str, home: &str) -> usize {
    partition_billable(&[raw_list], home).0.len()
}

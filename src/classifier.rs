use crate::types::UNKNOWN_COUNTRY;
use std::collections::HashMap;

/// Maps a region hint (colo code) to a country tag. Never fails.
pub trait Classifier: Send + Sync {
    fn classify(&self, region_hint: &str) -> String;
}

/// Built-in colo → ISO country table.
const COLO_COUNTRIES: &[(&str, &str)] = &[
    ("ATL", "US"), ("BOS", "US"), ("BUF", "US"), ("CHI", "US"), ("DEN", "US"),
    ("DFW", "US"), ("EWR", "US"), ("IAD", "US"), ("LAS", "US"), ("LAX", "US"),
    ("MIA", "US"), ("MSP", "US"), ("ORD", "US"), ("PDX", "US"), ("PHX", "US"),
    ("SAN", "US"), ("SEA", "US"), ("SJC", "US"), ("STL", "US"), ("IAH", "US"),
    ("HKG", "HK"),
    ("TPE", "TW"),
    ("NRT", "JP"), ("KIX", "JP"), ("ITM", "JP"),
    ("ICN", "KR"), ("GMP", "KR"),
    ("SIN", "SG"),
    ("LHR", "GB"), ("MAN", "GB"), ("EDI", "GB"),
    ("FRA", "DE"), ("DUS", "DE"), ("HAM", "DE"), ("MUC", "DE"),
    ("CDG", "FR"), ("MRS", "FR"),
    ("AMS", "NL"),
    ("SYD", "AU"), ("MEL", "AU"), ("PER", "AU"), ("BNE", "AU"),
    ("YYZ", "CA"), ("YVR", "CA"), ("YUL", "CA"),
    ("GRU", "BR"), ("GIG", "BR"),
    ("BOM", "IN"), ("DEL", "IN"),
    ("MAD", "ES"), ("MXP", "IT"), ("ARN", "SE"), ("CPH", "DK"),
    ("WAW", "PL"), ("PRG", "CZ"), ("VIE", "AT"), ("ZRH", "CH"),
];

/// Static colo table lookup, keyed on the first three letters of the hint.
#[derive(Debug, Clone)]
pub struct ColoTable {
    table: HashMap<String, String>,
}

impl ColoTable {
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Add or override mappings.
    pub fn with_entries<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (colo, country) in entries {
            self.table.insert(
                colo.as_ref().trim().to_ascii_uppercase(),
                country.as_ref().trim().to_ascii_uppercase(),
            );
        }
        self
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl Default for ColoTable {
    fn default() -> Self {
        ColoTable::empty().with_entries(COLO_COUNTRIES.iter().copied())
    }
}

impl Classifier for ColoTable {
    fn classify(&self, region_hint: &str) -> String {
        let code: String = region_hint
            .trim()
            .chars()
            .take(3)
            .map(|c| c.to_ascii_uppercase())
            .collect();
        self.table
            .get(&code)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_COUNTRY.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_colos_map() {
        let t = ColoTable::default();
        assert_eq!(t.classify("LAX"), "US");
        assert_eq!(t.classify("hkg"), "HK");
        assert_eq!(t.classify("NRT01"), "JP");
    }

    #[test]
    fn unknown_and_empty_are_unknown() {
        let t = ColoTable::default();
        assert_eq!(t.classify(""), UNKNOWN_COUNTRY);
        assert_eq!(t.classify("ZZZ"), UNKNOWN_COUNTRY);
    }

    #[test]
    fn extension_overrides_without_touching_defaults() {
        let t = ColoTable::default().with_entries([("JNB", "za"), ("SIN", "XX")]);
        assert_eq!(t.classify("JNB"), "ZA");
        assert_eq!(t.classify("SIN"), "XX");
        assert_eq!(t.classify("AMS"), "NL");
    }
}

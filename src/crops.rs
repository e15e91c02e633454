/// Crops offered by the suggestion dropdown. Scoring itself accepts any
/// free-text crop name; this list only feeds autocomplete.
pub const CROP_CATALOG: &[&str] = &[
    "Barley",
    "Cassava",
    "Carrot",
    "Coffee",
    "Cotton",
    "Maize",
    "Millet",
    "Onion",
    "Peanut",
    "Potato",
    "Rice",
    "Sorghum",
    "Soybean",
    "Sugarcane",
    "Sunflower",
    "Tomato",
    "Wheat",
];

pub fn suggestions(query: &str, limit: usize) -> Vec<&'static str> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }
    CROP_CATALOG
        .iter()
        .copied()
        .filter(|crop| crop.to_lowercase().contains(&needle))
        .take(limit)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_substrings_case_insensitively() {
        assert_eq!(suggestions("RI", 10), vec!["Rice"]);
        assert_eq!(suggestions("ca", 10), vec!["Cassava", "Carrot", "Sugarcane"]);
    }

    #[test]
    fn preserves_catalog_order_and_limit() {
        assert_eq!(suggestions("o", 3), vec!["Carrot", "Coffee", "Cotton"]);
    }

    #[test]
    fn blank_query_yields_nothing() {
        assert!(suggestions("   ", 10).is_empty());
        assert!(suggestions("", 10).is_empty());
    }
}

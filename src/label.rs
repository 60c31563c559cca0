use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Waste categories the classifier can produce, in model output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WasteCategory {
    #[serde(rename = "廚餘")]
    FoodWaste,
    #[serde(rename = "電子")]
    Electronics,
    #[serde(rename = "布料")]
    Textiles,
    #[serde(rename = "塑料")]
    Plastics,
    #[serde(rename = "玻璃")]
    Glass,
    #[serde(rename = "紙類")]
    Paper,
    #[serde(rename = "金屬")]
    Metal,
}

impl std::fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl WasteCategory {
    pub fn all() -> &'static [WasteCategory] {
        &[
            WasteCategory::FoodWaste,
            WasteCategory::Electronics,
            WasteCategory::Textiles,
            WasteCategory::Plastics,
            WasteCategory::Glass,
            WasteCategory::Paper,
            WasteCategory::Metal,
        ]
    }

    /// Class name as emitted by the model metadata.
    pub fn name(&self) -> &'static str {
        match self {
            WasteCategory::FoodWaste => "廚餘",
            WasteCategory::Electronics => "電子",
            WasteCategory::Textiles => "布料",
            WasteCategory::Plastics => "塑料",
            WasteCategory::Glass => "玻璃",
            WasteCategory::Paper => "紙類",
            WasteCategory::Metal => "金屬",
        }
    }

    pub fn english_name(&self) -> &'static str {
        match self {
            WasteCategory::FoodWaste => "food waste",
            WasteCategory::Electronics => "electronics",
            WasteCategory::Textiles => "textiles",
            WasteCategory::Plastics => "plastics",
            WasteCategory::Glass => "glass",
            WasteCategory::Paper => "paper",
            WasteCategory::Metal => "metal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown waste category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for WasteCategory {
    type Err = UnknownCategory;

    /// Accepts the model class name or the English name, ignoring surrounding whitespace.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::all()
            .iter()
            .copied()
            .find(|category| {
                category.name() == trimmed || category.english_name().eq_ignore_ascii_case(trimmed)
            })
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_class_names() {
        assert_eq!("玻璃".parse::<WasteCategory>().unwrap(), WasteCategory::Glass);
        assert_eq!(" 紙類 ".parse::<WasteCategory>().unwrap(), WasteCategory::Paper);
        assert_eq!("Metal".parse::<WasteCategory>().unwrap(), WasteCategory::Metal);
        assert_eq!(
            "cardboard".parse::<WasteCategory>().unwrap_err().to_string(),
            "unknown waste category 'cardboard'"
        );
    }

    #[test]
    fn test_enumeration_order_matches_model() {
        let names: Vec<&str> = WasteCategory::all().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["廚餘", "電子", "布料", "塑料", "玻璃", "紙類", "金屬"]);
    }
}

//! PM2.5 based air quality index.
//!
//! The index is always derived from the raw `pm25` concentration at read time and
//! never persisted, so changing a breakpoint reclassifies every stored reading.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    #[serde(rename = "USG")]
    Usg,
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    Hazardous,
}

impl AqiCategory {
    pub const fn index(self) -> i32 {
        match self {
            Self::Good => 50,
            Self::Moderate => 100,
            Self::Usg => 150,
            Self::Unhealthy => 200,
            Self::VeryUnhealthy => 300,
            Self::Hazardous => 400,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Good => "Good",
            Self::Moderate => "Moderate",
            Self::Usg => "USG",
            Self::Unhealthy => "Unhealthy",
            Self::VeryUnhealthy => "Very Unhealthy",
            Self::Hazardous => "Hazardous",
        }
    }
}

impl fmt::Display for AqiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive upper bounds in µg/m³, ascending. Anything above the last one is hazardous.
const BREAKPOINTS: [(f64, AqiCategory); 5] = [
    (12.0, AqiCategory::Good),
    (35.4, AqiCategory::Moderate),
    (55.4, AqiCategory::Usg),
    (150.4, AqiCategory::Unhealthy),
    (250.4, AqiCategory::VeryUnhealthy),
];

pub fn category(pm25: f64) -> AqiCategory {
    BREAKPOINTS
        .iter()
        .find(|(upper, _)| pm25 <= *upper)
        .map_or(AqiCategory::Hazardous, |&(_, category)| category)
}

/// Maps a PM2.5 concentration to its `(index, category)` pair.
pub fn classify(pm25: Option<f64>) -> (Option<i32>, Option<AqiCategory>) {
    match pm25 {
        Some(pm25) => {
            let category = category(pm25);
            (Some(category.index()), Some(category))
        }
        None => (None, None),
    }
}

//! Artifact file names.
//!
//! Every stored image is named so the name alone says what it is:
//!
//! ```text
//! {hash8}_{location}_{subject}_{confidence}_{source}_{YYYYMMDD}[_{seq}].{ext}
//! 3f9a12cc_interior_kitchen_60_z_20261018.jpg
//! 3f9a12cc_interior_kitchen_60_z_20261018_01.jpg
//! ```
//!
//! Confidence and sequence are zero-padded to two digits. [`parse_name`]
//! accepts only the canonical form, so it and [`NameFields::to_name`] are
//! exact inverses.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use url::Url;

use crate::error::NameError;
use crate::models::ImageSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Exterior,
    Interior,
    System,
    Feature,
}

impl Location {
    const ALL: [Location; 4] = [
        Location::Exterior,
        Location::Interior,
        Location::System,
        Location::Feature,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Exterior => "exterior",
            Location::Interior => "interior",
            Location::System => "system",
            Location::Feature => "feature",
        }
    }
}

impl FromStr for Location {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| NameError::UnknownValue {
                field: "location",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed subject vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Front,
    Back,
    Aerial,
    Pool,
    Yard,
    Garage,
    Kitchen,
    Living,
    Dining,
    Master,
    Bedroom,
    Bathroom,
    Laundry,
    Office,
    Roof,
    Hvac,
    Electrical,
    Plumbing,
    WaterHeater,
    Solar,
    Fireplace,
    Patio,
    View,
    Floorplan,
    Unknown,
}

impl Subject {
    const ALL: [Subject; 25] = [
        Subject::Front,
        Subject::Back,
        Subject::Aerial,
        Subject::Pool,
        Subject::Yard,
        Subject::Garage,
        Subject::Kitchen,
        Subject::Living,
        Subject::Dining,
        Subject::Master,
        Subject::Bedroom,
        Subject::Bathroom,
        Subject::Laundry,
        Subject::Office,
        Subject::Roof,
        Subject::Hvac,
        Subject::Electrical,
        Subject::Plumbing,
        Subject::WaterHeater,
        Subject::Solar,
        Subject::Fireplace,
        Subject::Patio,
        Subject::View,
        Subject::Floorplan,
        Subject::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::Front => "front",
            Subject::Back => "back",
            Subject::Aerial => "aerial",
            Subject::Pool => "pool",
            Subject::Yard => "yard",
            Subject::Garage => "garage",
            Subject::Kitchen => "kitchen",
            Subject::Living => "living",
            Subject::Dining => "dining",
            Subject::Master => "master",
            Subject::Bedroom => "bedroom",
            Subject::Bathroom => "bathroom",
            Subject::Laundry => "laundry",
            Subject::Office => "office",
            Subject::Roof => "roof",
            Subject::Hvac => "hvac",
            Subject::Electrical => "electrical",
            Subject::Plumbing => "plumbing",
            Subject::WaterHeater => "water-heater",
            Subject::Solar => "solar",
            Subject::Fireplace => "fireplace",
            Subject::Patio => "patio",
            Subject::View => "view",
            Subject::Floorplan => "floorplan",
            Subject::Unknown => "unknown",
        }
    }

    /// Where this subject is normally photographed.
    pub fn default_location(&self) -> Location {
        match self {
            Subject::Front
            | Subject::Back
            | Subject::Aerial
            | Subject::Pool
            | Subject::Yard
            | Subject::Garage
            | Subject::Patio
            | Subject::View => Location::Exterior,
            Subject::Kitchen
            | Subject::Living
            | Subject::Dining
            | Subject::Master
            | Subject::Bedroom
            | Subject::Bathroom
            | Subject::Laundry
            | Subject::Office => Location::Interior,
            Subject::Roof
            | Subject::Hvac
            | Subject::Electrical
            | Subject::Plumbing
            | Subject::WaterHeater
            | Subject::Solar => Location::System,
            Subject::Fireplace | Subject::Floorplan | Subject::Unknown => Location::Feature,
        }
    }

    /// URL keywords that suggest this subject, most specific first. A
    /// hyphenated keyword matches consecutive path tokens.
    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Subject::Front => &["front", "exterior", "facade", "curb"],
            Subject::Back => &["backyard", "rear"],
            Subject::Aerial => &["aerial", "drone"],
            Subject::Pool => &["pool", "spa"],
            Subject::Yard => &["yard", "lawn", "landscape", "landscaping"],
            Subject::Garage => &["garage", "carport"],
            Subject::Kitchen => &["kitchen"],
            Subject::Living => &["living", "family-room", "great-room"],
            Subject::Dining => &["dining"],
            Subject::Master => &["master", "primary"],
            Subject::Bedroom => &["bedroom", "bedrooms", "bed"],
            Subject::Bathroom => &["bathroom", "bathrooms", "bath"],
            Subject::Laundry => &["laundry"],
            Subject::Office => &["office", "den"],
            Subject::Roof => &["roof"],
            Subject::Hvac => &["hvac", "furnace", "ac-unit", "condenser"],
            Subject::Electrical => &["electrical", "panel"],
            Subject::Plumbing => &["plumbing"],
            Subject::WaterHeater => &["water-heater", "waterheater"],
            Subject::Solar => &["solar"],
            Subject::Fireplace => &["fireplace"],
            Subject::Patio => &["patio", "deck", "porch"],
            Subject::View => &["view"],
            Subject::Floorplan => &["floorplan", "floor-plan"],
            Subject::Unknown => &[],
        }
    }
}

impl FromStr for Subject {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| NameError::UnknownValue {
                field: "subject",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const EXTENSIONS: [&str; 6] = ["jpg", "png", "webp", "gif", "bmp", "tiff"];

/// Everything an artifact name encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFields {
    pub property_hash: String,
    pub location: Location,
    pub subject: Subject,
    pub confidence: u8,
    pub source: ImageSource,
    pub date: NaiveDate,
    pub sequence: Option<u32>,
    pub extension: String,
}

impl NameFields {
    pub fn validate(&self) -> Result<(), NameError> {
        let malformed = |reason: &str| NameError::Malformed {
            name: format!("{:?}", self),
            reason: reason.to_string(),
        };
        if self.property_hash.len() != 8
            || !self
                .property_hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(malformed("property hash must be 8 lowercase hex digits"));
        }
        if self.confidence > 100 {
            return Err(NameError::Confidence(self.confidence as u32));
        }
        if self.sequence == Some(0) {
            return Err(malformed("sequence starts at 1"));
        }
        if !EXTENSIONS.contains(&self.extension.as_str()) {
            return Err(NameError::UnknownValue {
                field: "extension",
                value: self.extension.clone(),
            });
        }
        Ok(())
    }

    /// Render the canonical file name. Fields are assumed valid.
    pub fn to_name(&self) -> String {
        let mut name = format!(
            "{}_{}_{}_{:02}_{}_{}",
            self.property_hash,
            self.location,
            self.subject,
            self.confidence,
            self.source.code(),
            self.date.format("%Y%m%d"),
        );
        if let Some(seq) = self.sequence {
            name.push_str(&format!("_{:02}", seq));
        }
        name.push('.');
        name.push_str(&self.extension);
        name
    }
}

/// Parse a canonical artifact name back into its fields.
pub fn parse_name(name: &str) -> Result<NameFields, NameError> {
    let malformed = |reason: &str| NameError::Malformed {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let (stem, extension) = name
        .rsplit_once('.')
        .ok_or_else(|| malformed("missing extension"))?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 6 && parts.len() != 7 {
        return Err(malformed("expected 6 or 7 underscore-separated fields"));
    }

    let confidence: u8 = parts[3]
        .parse()
        .map_err(|_| malformed("confidence is not a number"))?;
    if format!("{:02}", confidence) != parts[3] {
        return Err(malformed("confidence is not canonical"));
    }

    let mut code = parts[4].chars();
    let source = match (code.next(), code.next()) {
        (Some(c), None) => ImageSource::from_code(c).ok_or_else(|| NameError::UnknownValue {
            field: "source code",
            value: parts[4].to_string(),
        })?,
        _ => return Err(malformed("source code must be one letter")),
    };

    if parts[5].len() != 8 {
        return Err(malformed("date must be YYYYMMDD"));
    }
    let date = NaiveDate::parse_from_str(parts[5], "%Y%m%d")
        .map_err(|_| malformed("date must be YYYYMMDD"))?;

    let sequence = match parts.get(6) {
        Some(raw) => {
            let seq: u32 = raw
                .parse()
                .map_err(|_| malformed("sequence is not a number"))?;
            if format!("{:02}", seq) != *raw {
                return Err(malformed("sequence is not canonical"));
            }
            Some(seq)
        }
        None => None,
    };

    let fields = NameFields {
        property_hash: parts[0].to_string(),
        location: parts[1].parse()?,
        subject: parts[2].parse()?,
        confidence,
        source,
        date,
        sequence,
        extension: extension.to_string(),
    };
    fields.validate()?;
    Ok(fields)
}

/// Name for `fields` that does not yet exist in `dir`.
///
/// The first candidate carries no sequence suffix; on a collision the
/// suffix counts up from `_01` until a free name is found. Existing files
/// are never overwritten.
pub fn generate_name(dir: &Path, fields: &NameFields) -> Result<NameFields, NameError> {
    fields.validate()?;
    let mut candidate = NameFields {
        sequence: None,
        ..fields.clone()
    };
    while dir.join(candidate.to_name()).exists() {
        let next = candidate.sequence.map_or(1, |s| s + 1);
        candidate.sequence = Some(next);
    }
    Ok(candidate)
}

/// Best guess at what an image shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub location: Location,
    pub subject: Subject,
    pub confidence: u8,
}

impl Classification {
    pub const UNKNOWN: Classification = Classification {
        location: Location::Feature,
        subject: Subject::Unknown,
        confidence: 0,
    };
}

/// Assigns location, subject and confidence to a downloaded image.
pub trait ImageClassifier: Send + Sync {
    fn classify(&self, url: &Url, bytes: &[u8]) -> Classification;
}

/// Classifies from keywords in the image URL path. Listing CDNs often
/// carry room captions in file names; anything else is `feature/unknown`.
pub struct KeywordClassifier;

impl ImageClassifier for KeywordClassifier {
    fn classify(&self, url: &Url, _bytes: &[u8]) -> Classification {
        let tokens = path_tokens(url);
        Subject::ALL
            .iter()
            .find(|s| s.keywords().iter().any(|k| has_keyword(&tokens, k)))
            .map(|s| Classification {
                location: s.default_location(),
                subject: *s,
                confidence: 60,
            })
            .unwrap_or(Classification::UNKNOWN)
    }
}

/// Lowercase alphanumeric runs of the URL path: `/fp/Kitchen_Island-2.jpg`
/// gives `fp kitchen island 2 jpg`.
fn path_tokens(url: &Url) -> Vec<String> {
    url.path()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn has_keyword(tokens: &[String], keyword: &str) -> bool {
    let parts: Vec<&str> = keyword.split('-').collect();
    tokens
        .windows(parts.len())
        .any(|w| w.iter().zip(&parts).all(|(t, p)| t == p))
}

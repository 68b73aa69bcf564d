//! Spatial-reference compatibility checks.
//!
//! Extraction never reprojects. This module only detects when features and
//! rasters disagree and reports it, at most once per category.
//!
//! Two references are equal when:
//! 1. the strings are identical;
//! 2. either side is undefined;
//! 3. their normalized forms match. Authority codes are taken from
//!    `AUTH:CODE`, OGC URNs and URLs, or the root `AUTHORITY`/`ID` of a
//!    WKT definition (the horizontal part of a compound CRS). Without a code,
//!    WKT is compared ignoring whitespace and case.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use log::warn;

use crate::operation::Operation;
use crate::source::FeatureSource;

/// Cache key: the two reference strings, in call order.
type CacheKey = (String, String);

/// Memo of reference comparisons.
///
/// Entries are computed deterministically from their key and never removed,
/// so one cache can be shared across extractions through an `Arc`.
#[derive(Debug, Default)]
pub struct CrsCache {
    entries: RwLock<HashMap<CacheKey, bool>>,
}

impl CrsCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether two references describe the same CRS.
    #[must_use]
    pub fn equivalent(&self, a: Option<&str>, b: Option<&str>) -> bool {
        let (Some(a), Some(b)) = (a, b) else {
            return true;
        };
        if a == b {
            return true;
        }

        let key = (a.to_string(), b.to_string());
        let cached = self
            .entries
            .read()
            .ok()
            .and_then(|entries| entries.get(&key).copied());
        if let Some(equal) = cached {
            return equal;
        }
        let equal = normalize(a) == normalize(b);
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key, equal);
        }
        equal
    }

    /// Number of memoized comparisons.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map_or(0, |entries| entries.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which pair of inputs disagreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrsCategory {
    ValueRaster,
    WeightRaster,
}

impl CrsCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValueRaster => "value raster",
            Self::WeightRaster => "weighting raster",
        }
    }
}

/// A spatial-reference mismatch between features and a raster.
#[derive(Debug, Clone, PartialEq)]
pub struct CrsWarning {
    pub category: CrsCategory,
    /// Name of the first raster found to disagree
    pub raster: String,
    pub features_crs: String,
    pub raster_crs: String,
}

impl fmt::Display for CrsWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raster = if self.raster.is_empty() {
            String::new()
        } else {
            format!(" '{}'", self.raster)
        };
        write!(
            f,
            "Spatial reference of features ({}) does not match that of {}{raster} ({})",
            self.features_crs,
            self.category.as_str(),
            self.raster_crs
        )
    }
}

/// Compare the features' reference with every value and weighting raster
/// used by `ops`. Emits at most one warning per category; never fails.
#[must_use]
pub fn check(features: &dyn FeatureSource, ops: &[Operation], cache: &CrsCache) -> Vec<CrsWarning> {
    let Some(features_crs) = features.spatial_reference() else {
        return Vec::new();
    };

    let mut warnings: Vec<CrsWarning> = Vec::new();
    for op in ops {
        let candidates = std::iter::once((CrsCategory::ValueRaster, &op.values))
            .chain(op.weights.as_ref().map(|w| (CrsCategory::WeightRaster, w)));
        for (category, raster) in candidates {
            if warnings.iter().any(|w| w.category == category) {
                continue;
            }
            let raster_crs = raster.spatial_reference();
            if cache.equivalent(Some(features_crs), raster_crs) {
                continue;
            }
            let warning = CrsWarning {
                category,
                raster: raster.name().to_string(),
                features_crs: features_crs.to_string(),
                raster_crs: raster_crs.unwrap_or_default().to_string(),
            };
            warn!("{warning}");
            warnings.push(warning);
        }
    }
    warnings
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NormalizedCrs {
    Authority(String, String),
    Wkt(String),
}

fn normalize(text: &str) -> NormalizedCrs {
    let text = text.trim();
    if let Some(code) = authority_from_identifier(text) {
        return code;
    }
    if let Some(node) = WktParser::new(text).parse() {
        if let Some((auth, code)) = node.horizontal().authority() {
            return authority(&auth, &code);
        }
    }
    NormalizedCrs::Wkt(canonical_wkt(text))
}

fn authority(auth: &str, code: &str) -> NormalizedCrs {
    let auth = auth.trim().to_ascii_uppercase();
    let code = code.trim().to_ascii_uppercase();
    if auth == "OGC" && code == "CRS84" {
        return NormalizedCrs::Authority("EPSG".to_string(), "4326".to_string());
    }
    NormalizedCrs::Authority(auth, code)
}

/// `EPSG:4326`, `urn:ogc:def:crs:EPSG::4326`, or
/// `http://www.opengis.net/def/crs/EPSG/0/4326`.
fn authority_from_identifier(text: &str) -> Option<NormalizedCrs> {
    if text.contains('[') || text.contains(char::is_whitespace) {
        return None;
    }
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("urn:ogc:def:crs:") {
        let parts: Vec<&str> = text.split(':').collect();
        let auth = parts.get(4)?;
        let code = parts.last()?;
        return Some(authority(auth, code));
    }
    if lower.starts_with("http://www.opengis.net/def/crs/")
        || lower.starts_with("https://www.opengis.net/def/crs/")
    {
        let parts: Vec<&str> = text.trim_end_matches('/').split('/').collect();
        let code = parts.last()?;
        let auth = parts.get(parts.len().checked_sub(3)?)?;
        return Some(authority(auth, code));
    }
    let (auth, code) = text.split_once(':')?;
    if auth.is_empty() || code.is_empty() || code.contains(':') {
        return None;
    }
    Some(authority(auth, code))
}

fn canonical_wkt(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quoted = false;
    for c in text.chars() {
        if c == '"' {
            quoted = !quoted;
        }
        if quoted {
            out.push(c);
        } else if !c.is_whitespace() {
            out.extend(c.to_uppercase());
        }
    }
    out.replace('(', "[").replace(')', "]")
}

#[derive(Debug)]
enum WktItem {
    Node(WktNode),
    Atom(String),
}

#[derive(Debug)]
struct WktNode {
    keyword: String,
    items: Vec<WktItem>,
}

const COMPOUND_KEYWORDS: &[&str] = &["COMPD_CS", "COMPOUNDCRS"];
const VERTICAL_KEYWORDS: &[&str] = &["VERT_CS", "VERTCRS", "VERTICALCRS"];
const AUTHORITY_KEYWORDS: &[&str] = &["AUTHORITY", "ID"];

impl WktNode {
    fn children(&self) -> impl Iterator<Item = &WktNode> {
        self.items.iter().filter_map(|item| match item {
            WktItem::Node(node) => Some(node),
            WktItem::Atom(_) => None,
        })
    }

    /// The node itself, the horizontal part of a compound CRS, or the source
    /// of a bound CRS.
    fn horizontal(&self) -> &WktNode {
        if COMPOUND_KEYWORDS.contains(&self.keyword.as_str()) {
            if let Some(part) = self.children().find(|child| {
                !VERTICAL_KEYWORDS.contains(&child.keyword.as_str())
                    && !AUTHORITY_KEYWORDS.contains(&child.keyword.as_str())
            }) {
                return part.horizontal();
            }
        }
        if self.keyword == "BOUNDCRS" {
            if let Some(source) = self
                .children()
                .find(|child| child.keyword == "SOURCECRS")
                .and_then(|source| source.children().next())
            {
                return source.horizontal();
            }
        }
        self
    }

    /// Root-level `AUTHORITY["EPSG","4326"]` or `ID["EPSG",4326]`.
    fn authority(&self) -> Option<(String, String)> {
        let node = self
            .children()
            .find(|child| AUTHORITY_KEYWORDS.contains(&child.keyword.as_str()))?;
        let mut atoms = node.items.iter().filter_map(|item| match item {
            WktItem::Atom(atom) => Some(atom.clone()),
            WktItem::Node(_) => None,
        });
        Some((atoms.next()?, atoms.next()?))
    }
}

struct WktParser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> WktParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
        }
    }

    fn parse(mut self) -> Option<WktNode> {
        let node = self.node()?;
        self.skip_whitespace();
        self.chars.peek().is_none().then_some(node)
    }

    fn skip_whitespace(&mut self) {
        while self.chars.next_if(|c| c.is_whitespace()).is_some() {}
    }

    fn node(&mut self) -> Option<WktNode> {
        self.skip_whitespace();
        let keyword = self.word();
        self.skip_whitespace();
        if keyword.is_empty() || !matches!(self.chars.next()?, '[' | '(') {
            return None;
        }
        self.body(keyword)
    }

    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.chars.next_if(|c| c.is_ascii_alphanumeric() || *c == '_') {
            word.push(c);
        }
        word
    }

    /// Items up to the closing bracket of a node whose opening bracket has
    /// been consumed.
    fn body(&mut self, keyword: String) -> Option<WktNode> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match *self.chars.peek()? {
                ']' | ')' => {
                    self.chars.next();
                    break;
                },
                ',' => {
                    self.chars.next();
                },
                '"' => {
                    self.chars.next();
                    let mut atom = String::new();
                    loop {
                        let c = self.chars.next()?;
                        if c == '"' {
                            if self.chars.next_if_eq(&'"').is_some() {
                                atom.push('"');
                                continue;
                            }
                            break;
                        }
                        atom.push(c);
                    }
                    items.push(WktItem::Atom(atom));
                },
                c if c.is_ascii_alphabetic() => {
                    // A nested node, or a bare enum value such as `north`
                    let word = self.word();
                    self.skip_whitespace();
                    if self.chars.next_if(|c| matches!(c, '[' | '(')).is_some() {
                        items.push(WktItem::Node(self.body(word.to_ascii_uppercase())?));
                    } else {
                        items.push(WktItem::Atom(word));
                    }
                },
                _ => {
                    let mut atom = String::new();
                    while let Some(c) = self.chars.next_if(|c| !matches!(c, ',' | ']' | ')')) {
                        atom.push(c);
                    }
                    items.push(WktItem::Atom(atom.trim().to_string()));
                },
            }
        }
        Some(WktNode {
            keyword: keyword.to_ascii_uppercase(),
            items,
        })
    }
}

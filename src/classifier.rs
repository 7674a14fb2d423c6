//! Maps a schema summary plus a naming hint to one analysis category.
//!
//! Hints win outright. Without a matching hint, each category is scored by
//! how many of its field signatures the summary satisfies; a zero or tied top
//! score resolves to `Unknown` rather than guessing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::schema::{name_matches_any, FieldKind, SchemaSummary};

pub const REVENUE_TERMS: &[&str] = &["revenue", "amount", "value", "sales", "income", "arr", "mrr"];
pub const ENTITY_TERMS: &[&str] = &["customer", "client", "company", "account", "name"];
pub const QUARTER_TERMS: &[&str] = &["quarter", "qoq", "q1", "q2", "q3", "q4"];
pub const GEO_TERMS: &[&str] = &[
    "country", "region", "geographic", "geography", "location", "market", "territory", "city",
];
pub const BRIDGE_TERMS: &[&str] = &[
    "expansion", "contraction", "churn", "upsell", "downsell", "new", "starting", "beginning",
    "opening", "ending", "closing", "retention", "bridge",
];
pub const SHARE_TERMS: &[&str] = &[
    "share", "concentration", "percent", "%", "contribution", "cumulative", "pareto",
];
pub const PERIOD_TERMS: &[&str] = &[
    "month", "monthly", "mom", "date", "period", "jan", "feb", "mar", "apr", "may", "jun",
    "jul", "aug", "sep", "oct", "nov", "dec",
];

/// Closed set of recognized business-data shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisCategory {
    QuarterlyRevenue,
    RevenueBridge,
    CountryWise,
    CustomerConcentration,
    MonthlyRevenue,
    Unknown,
}

impl AnalysisCategory {
    pub const ALL: [AnalysisCategory; 6] = [
        Self::QuarterlyRevenue,
        Self::RevenueBridge,
        Self::CountryWise,
        Self::CustomerConcentration,
        Self::MonthlyRevenue,
        Self::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::QuarterlyRevenue => "quarterly_revenue",
            Self::RevenueBridge => "revenue_bridge",
            Self::CountryWise => "country_wise",
            Self::CustomerConcentration => "customer_concentration",
            Self::MonthlyRevenue => "monthly_revenue",
            Self::Unknown => "unknown",
        }
    }

    /// Display label used in prompts and narratives.
    pub fn label(self) -> &'static str {
        match self {
            Self::QuarterlyRevenue => "quarterly revenue",
            Self::RevenueBridge => "revenue bridge",
            Self::CountryWise => "country-wise revenue",
            Self::CustomerConcentration => "customer concentration",
            Self::MonthlyRevenue => "month-on-month revenue",
            Self::Unknown => "general business",
        }
    }
}

impl fmt::Display for AnalysisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown analysis category: {}", s))
    }
}

/// Hint keywords, tested in this order; the first category with a hit wins.
const HINT_KEYWORDS: &[(AnalysisCategory, &[&str])] = &[
    (AnalysisCategory::QuarterlyRevenue, &["quarterly", "qoq", "quarter"]),
    (AnalysisCategory::RevenueBridge, &["bridge", "churn", "retention"]),
    (AnalysisCategory::CountryWise, &["country", "region", "geographic"]),
    (AnalysisCategory::CustomerConcentration, &["customer", "concentration", "client"]),
    (AnalysisCategory::MonthlyRevenue, &["monthly", "month", "mom"]),
];

#[derive(Debug, Clone, Copy)]
enum KindClass {
    Measure,
    Label,
    Any,
}

impl KindClass {
    fn admits(self, kind: FieldKind) -> bool {
        match self {
            Self::Measure => kind.is_measure(),
            Self::Label => !kind.is_measure(),
            Self::Any => true,
        }
    }
}

/// A category expects at least `min_fields` fields whose names carry one of
/// `keywords` and whose kind fits `class`. A `defining` signature must hold
/// for the category to score at all.
#[derive(Debug, Clone, Copy)]
struct Signature {
    keywords: &'static [&'static str],
    class: KindClass,
    min_fields: usize,
    defining: bool,
}

const fn sig(keywords: &'static [&'static str], class: KindClass, min_fields: usize, defining: bool) -> Signature {
    Signature {
        keywords,
        class,
        min_fields,
        defining,
    }
}

const QUARTERLY: &[Signature] = &[
    sig(QUARTER_TERMS, KindClass::Measure, 2, true),
    sig(REVENUE_TERMS, KindClass::Measure, 1, false),
    sig(ENTITY_TERMS, KindClass::Label, 1, false),
];
const BRIDGE: &[Signature] = &[
    sig(BRIDGE_TERMS, KindClass::Measure, 2, true),
    sig(REVENUE_TERMS, KindClass::Measure, 1, false),
    sig(ENTITY_TERMS, KindClass::Label, 1, false),
];
const COUNTRY: &[Signature] = &[
    sig(GEO_TERMS, KindClass::Label, 1, true),
    sig(REVENUE_TERMS, KindClass::Measure, 1, false),
];
const CUSTOMER: &[Signature] = &[
    sig(ENTITY_TERMS, KindClass::Label, 1, true),
    sig(REVENUE_TERMS, KindClass::Measure, 1, false),
    sig(SHARE_TERMS, KindClass::Any, 1, false),
];
const MONTHLY: &[Signature] = &[
    sig(PERIOD_TERMS, KindClass::Any, 1, true),
    sig(REVENUE_TERMS, KindClass::Measure, 1, false),
];

fn signatures(category: AnalysisCategory) -> &'static [Signature] {
    match category {
        AnalysisCategory::QuarterlyRevenue => QUARTERLY,
        AnalysisCategory::RevenueBridge => BRIDGE,
        AnalysisCategory::CountryWise => COUNTRY,
        AnalysisCategory::CustomerConcentration => CUSTOMER,
        AnalysisCategory::MonthlyRevenue => MONTHLY,
        AnalysisCategory::Unknown => &[],
    }
}

/// How a category was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationBasis {
    Hint,
    Content,
    Ambiguous,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: AnalysisCategory,
    pub basis: ClassificationBasis,
    /// Content scores per category; empty when a hint decided.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scores: Vec<(AnalysisCategory, usize)>,
}

/// Category implied by a file or sheet name, if any.
pub fn category_from_hint(hint: &str) -> Option<AnalysisCategory> {
    let lower = hint.to_lowercase();
    HINT_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(category, _)| *category)
}

pub fn classify_detailed(summary: &SchemaSummary, hint: Option<&str>) -> Classification {
    if let Some(category) = hint.and_then(category_from_hint) {
        debug!("Hint {:?} selects {}", hint, category);
        return Classification {
            category,
            basis: ClassificationBasis::Hint,
            scores: Vec::new(),
        };
    }

    let scores: Vec<(AnalysisCategory, usize)> = AnalysisCategory::ALL
        .into_iter()
        .filter(|c| *c != AnalysisCategory::Unknown)
        .map(|c| (c, content_score(summary, c)))
        .collect();

    let top = scores.iter().map(|(_, s)| *s).max().unwrap_or(0);
    let leaders: Vec<AnalysisCategory> = scores
        .iter()
        .filter(|(_, s)| *s == top)
        .map(|(c, _)| *c)
        .collect();

    let (category, basis) = if top == 0 {
        (AnalysisCategory::Unknown, ClassificationBasis::NoMatch)
    } else if leaders.len() > 1 {
        debug!("Classification ambiguous between {:?} (score {})", leaders, top);
        (AnalysisCategory::Unknown, ClassificationBasis::Ambiguous)
    } else {
        (leaders[0], ClassificationBasis::Content)
    };

    Classification {
        category,
        basis,
        scores,
    }
}

fn content_score(summary: &SchemaSummary, category: AnalysisCategory) -> usize {
    let mut score = 0;
    for signature in signatures(category) {
        let matching = summary
            .fields
            .iter()
            .filter(|f| signature.class.admits(f.kind) && name_matches_any(&f.name, signature.keywords))
            .count();
        if matching >= signature.min_fields {
            score += 1;
        } else if signature.defining {
            return 0;
        }
    }
    score
}

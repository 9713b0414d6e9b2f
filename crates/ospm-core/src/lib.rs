//! Core domain model for the open-source programs catalog.
//!
//! Everything in this crate is pure: filtering, urgency classification and
//! ingestion duplicate detection operate on in-memory values only.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ospm-core";

/// Days ahead of today a deadline may fall and still count as urgent.
pub const URGENT_WINDOW_DAYS: i64 = 7;

const PRIORITY_TAGS: [&str; 2] = ["paid", "urgent"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Beginner => "beginner",
            Difficulty::Intermediate => "intermediate",
            Difficulty::Advanced => "advanced",
        }
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown difficulty `{0}` (expected beginner, intermediate or advanced)")]
pub struct UnknownDifficulty(pub String);

impl FromStr for Difficulty {
    type Err = UnknownDifficulty;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "beginner" => Ok(Difficulty::Beginner),
            "intermediate" => Ok(Difficulty::Intermediate),
            "advanced" => Ok(Difficulty::Advanced),
            _ => Err(UnknownDifficulty(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn default_program_type() -> String {
    "Open Source".to_string()
}

/// A catalog entry describing one open-source contribution opportunity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: u64,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default = "default_program_type")]
    pub program_type: String,
    #[serde(default)]
    pub timeline: String,
    #[serde(default)]
    pub opens_in: String,
    #[serde(default)]
    pub deadline: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub official_site: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tech: Option<String>,
}

/// Ingestion input. Admin callers may omit any field, including the id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ProgramDraft {
    pub id: Option<u64>,
    pub name: String,
    pub slug: String,
    pub difficulty: Option<Difficulty>,
    pub program_type: Option<String>,
    pub timeline: String,
    pub opens_in: String,
    pub deadline: String,
    pub description: String,
    pub official_site: String,
    pub tags: Vec<String>,
    pub tech: Option<String>,
}

impl ProgramDraft {
    pub fn into_program(self, id: u64) -> Program {
        Program {
            id,
            name: self.name,
            slug: self.slug,
            difficulty: self.difficulty.unwrap_or_default(),
            program_type: self.program_type.unwrap_or_else(default_program_type),
            timeline: self.timeline,
            opens_in: self.opens_in,
            deadline: self.deadline,
            description: self.description,
            official_site: self.official_site,
            tags: self.tags,
            tech: self.tech,
        }
    }

    fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            "Unknown".to_string()
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no program id left to assign: ids already reach {}", u64::MAX)]
pub struct IdSpaceExhausted;

/// Hands out ids for drafts that arrive without one, continuing after the
/// highest id already in use.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: Option<u64>,
}

impl IdAllocator {
    pub fn after<'a>(programs: impl IntoIterator<Item = &'a Program>) -> Self {
        let max = programs.into_iter().map(|p| p.id).max().unwrap_or(0);
        Self {
            next: max.checked_add(1),
        }
    }

    pub fn assign(&mut self, draft: ProgramDraft) -> Result<Program, IdSpaceExhausted> {
        let id = match draft.id {
            Some(id) => {
                if self.next.is_some_and(|next| id >= next) {
                    self.next = id.checked_add(1);
                }
                id
            }
            None => {
                let id = self.next.ok_or(IdSpaceExhausted)?;
                self.next = id.checked_add(1);
                id
            }
        };
        Ok(draft.into_program(id))
    }
}

/// Materializes a full replacement catalog from admin drafts.
pub fn programs_from_drafts(drafts: Vec<ProgramDraft>) -> Result<Vec<Program>, IdSpaceExhausted> {
    let explicit_max = drafts.iter().filter_map(|d| d.id).max().unwrap_or(0);
    let mut ids = IdAllocator {
        next: explicit_max.checked_add(1),
    };
    drafts.into_iter().map(|d| ids.assign(d)).collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgramQuery {
    pub difficulty: Option<String>,
    pub tech: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

impl ProgramQuery {
    pub fn matches(&self, program: &Program) -> bool {
        if let Some(difficulty) = non_empty(&self.difficulty) {
            if program.difficulty.as_str() != difficulty {
                return false;
            }
        }
        if let Some(tech) = non_empty(&self.tech) {
            let field_hit = program
                .tech
                .as_deref()
                .is_some_and(|t| t.to_lowercase() == tech);
            let tag_hit = program
                .tags
                .iter()
                .any(|tag| tag.to_lowercase().contains(&tech));
            if !field_hit && !tag_hit {
                return false;
            }
        }
        true
    }
}

/// Conjunctive difficulty/tech filter preserving catalog order.
pub fn filter_programs(programs: &[Program], query: &ProgramQuery) -> Vec<Program> {
    programs
        .iter()
        .filter(|p| query.matches(p))
        .cloned()
        .collect()
}

/// The `n` programs with the highest ids, highest first.
pub fn latest_additions(programs: &[Program], n: usize) -> Vec<Program> {
    let mut sorted = programs.to_vec();
    sorted.sort_by(|a, b| b.id.cmp(&a.id));
    sorted.truncate(n);
    sorted
}

const DATED_FORMATS: [&str; 7] = [
    "%Y-%m-%d",
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d %B, %Y",
    "%Y/%m/%d",
    "%m/%d/%Y",
];

const YEARLESS_FORMATS: [&str; 2] = ["%B %d | %Y", "%d %B | %Y"];

/// Longest token run that can hold one of the accepted date shapes.
const MAX_DATE_TOKENS: usize = 4;

// `%Y` accepts short years, so `March 2026` would otherwise read as day 20 of year 26.
fn plausible(date: NaiveDate) -> Option<NaiveDate> {
    (1900..=9999).contains(&date.year()).then_some(date)
}

fn has_year_token(candidate: &str) -> bool {
    candidate
        .split(|c: char| !c.is_ascii_digit())
        .any(|digits| digits.len() == 4)
}

fn parse_exact(candidate: &str, reference_year: i32) -> Option<NaiveDate> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(candidate) {
        return plausible(ts.date_naive());
    }
    if let Some(date) = DATED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(candidate, fmt).ok().and_then(plausible))
    {
        return Some(date);
    }
    if has_year_token(candidate) {
        return None;
    }
    let with_year = format!("{candidate} | {reference_year}");
    YEARLESS_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&with_year, fmt).ok())
}

/// Best-effort parse of a free-text deadline such as `April 2, 2025`,
/// `2025-04-02`, `10/20/2026` or `October 31`. Yearless dates resolve against
/// `reference_year`. Commentary before or after the date is ignored; the
/// earliest, then longest, run of tokens that reads as a date wins.
pub fn parse_deadline(raw: &str, reference_year: i32) -> Option<NaiveDate> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    for start in 0..tokens.len() {
        let longest = MAX_DATE_TOKENS.min(tokens.len() - start);
        for len in (1..=longest).rev() {
            let joined = tokens[start..start + len].join(" ");
            let candidate = joined.trim_matches(['(', ')', ',', '.', ';', ':']);
            if candidate.is_empty() {
                continue;
            }
            if let Some(date) = parse_exact(candidate, reference_year) {
                return Some(date);
            }
        }
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrgencyReason {
    DeadlineSoon,
    PriorityTag,
    Internship,
}

/// First reason a program qualifies as urgent at `now`, if any. A deadline
/// date means its midnight; it must fall in `[now, now + 7 days]`.
pub fn urgency_reason(program: &Program, now: NaiveDateTime) -> Option<UrgencyReason> {
    if let Some(deadline) = parse_deadline(&program.deadline, now.year()) {
        let deadline = deadline.and_time(NaiveTime::MIN);
        if deadline >= now && deadline <= now + Duration::days(URGENT_WINDOW_DAYS) {
            return Some(UrgencyReason::DeadlineSoon);
        }
    }
    if program
        .tags
        .iter()
        .any(|t| PRIORITY_TAGS.contains(&t.trim().to_lowercase().as_str()))
    {
        return Some(UrgencyReason::PriorityTag);
    }
    if program.program_type.trim().eq_ignore_ascii_case("internship") {
        return Some(UrgencyReason::Internship);
    }
    None
}

pub fn urgent_programs(programs: &[Program], now: NaiveDateTime) -> Vec<Program> {
    programs
        .iter()
        .filter(|p| urgency_reason(p, now).is_some())
        .cloned()
        .collect()
}

fn identity_key(value: &str) -> String {
    value.trim().to_lowercase()
}

/// Lookup sets used to reject ingestion candidates that collide on name, slug
/// or official site.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    names: HashSet<String>,
    slugs: HashSet<String>,
    sites: HashSet<String>,
}

impl IdentityIndex {
    pub fn from_catalog(programs: &[Program]) -> Self {
        let mut index = Self::default();
        for p in programs {
            index.insert(&p.name, &p.slug, &p.official_site);
        }
        index
    }

    fn insert(&mut self, name: &str, slug: &str, site: &str) {
        self.names.insert(identity_key(name));
        self.slugs.insert(identity_key(slug));
        self.sites.insert(identity_key(site));
    }

    /// A blank field is a key like any other: two programs without a slug
    /// collide on it.
    pub fn is_duplicate(&self, draft: &ProgramDraft) -> bool {
        let hit = |set: &HashSet<String>, value: &str| set.contains(&identity_key(value));
        hit(&self.names, &draft.name)
            || hit(&self.slugs, &draft.slug)
            || hit(&self.sites, &draft.official_site)
    }

    pub fn record(&mut self, draft: &ProgramDraft) {
        self.insert(&draft.name, &draft.slug, &draft.official_site);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub catalog: Vec<Program>,
    pub accepted_names: Vec<String>,
    pub rejected_names: Vec<String>,
}

/// Appends the non-duplicate candidates to `existing`, in input order.
pub fn merge_new_programs(
    existing: Vec<Program>,
    candidates: Vec<ProgramDraft>,
) -> Result<MergeOutcome, IdSpaceExhausted> {
    let mut index = IdentityIndex::from_catalog(&existing);
    let mut ids = IdAllocator::after(&existing);
    let mut catalog = existing;
    let mut accepted_names = Vec::new();
    let mut rejected_names = Vec::new();

    for draft in candidates {
        if index.is_duplicate(&draft) {
            rejected_names.push(draft.display_name());
            continue;
        }
        index.record(&draft);
        accepted_names.push(draft.name.clone());
        catalog.push(ids.assign(draft)?);
    }

    Ok(MergeOutcome {
        catalog,
        accepted_names,
        rejected_names,
    })
}

/// Built-in catalog used when neither the primary file nor its cache is usable.
pub fn default_catalog() -> Vec<Program> {
    vec![
        Program {
            id: 1,
            name: "Google Summer of Code (GSoC)".to_string(),
            slug: "gsoc".to_string(),
            difficulty: Difficulty::Intermediate,
            program_type: "Internship".to_string(),
            timeline: "Applications Feb–Apr, coding May–Aug (varies by year)".to_string(),
            opens_in: "March".to_string(),
            deadline: "April 2, 2025".to_string(),
            description: "Work with open source organizations on a 3-month programming project during your summer break.".to_string(),
            official_site: "https://summerofcode.withgoogle.com/".to_string(),
            tags: vec!["Paid".to_string(), "Remote".to_string(), "Global".to_string()],
            tech: None,
        },
        Program {
            id: 4,
            name: "Hacktoberfest".to_string(),
            slug: "hacktoberfest".to_string(),
            difficulty: Difficulty::Intermediate,
            program_type: "Open Source".to_string(),
            timeline: "October 1–31 every year".to_string(),
            opens_in: "October".to_string(),
            deadline: "October 31".to_string(),
            description: "Month-long celebration of open source focused on submitting pull requests to participating repositories.".to_string(),
            official_site: "https://hacktoberfest.com/".to_string(),
            tags: vec!["Remote".to_string(), "Global".to_string()],
            tech: None,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmailError {
    #[error("email address is empty")]
    Empty,
    #[error("`{0}` is not a valid email address")]
    Malformed(String),
}

/// A syntactically valid subscriber address. Matching is exact-string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

const LOCAL_SPECIALS: &str = "!#$%&'*+/=?^_`{|}~-.";

impl EmailAddress {
    pub fn parse(raw: &str) -> Result<Self, EmailError> {
        if raw.trim().is_empty() {
            return Err(EmailError::Empty);
        }
        let malformed = || EmailError::Malformed(raw.to_string());
        if raw.len() > 254 {
            return Err(malformed());
        }
        let (local, domain) = raw.split_once('@').ok_or_else(malformed)?;
        if !valid_local_part(local) || !valid_domain(domain) {
            return Err(malformed());
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn valid_local_part(local: &str) -> bool {
    !local.is_empty()
        && local.len() <= 64
        && !local.starts_with('.')
        && !local.ends_with('.')
        && !local.contains("..")
        && local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || LOCAL_SPECIALS.contains(c))
}

fn valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let labels_ok = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    let tld = labels[labels.len() - 1];
    labels_ok && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

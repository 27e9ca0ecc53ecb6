//! Ordered name-matching policies used to resolve a requested application
//! name against installed bundles.
//!
//! Each policy is tried in turn over every candidate; the first policy that
//! matches anything wins, and its confidence is reported with the match.

use appkeep_core::{compact_name, name_key, normalize_name, significant_words};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Alias,
    Substring,
    WhitespaceInsensitive,
    WordFragment,
}

impl MatchStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Alias => "alias",
            Self::Substring => "substring",
            Self::WhitespaceInsensitive => "whitespace_insensitive",
            Self::WordFragment => "word_fragment",
        }
    }

    pub fn confidence(self) -> f32 {
        match self {
            Self::Exact => 1.0,
            Self::Alias => 0.9,
            Self::Substring => 0.7,
            Self::WhitespaceInsensitive => 0.6,
            Self::WordFragment => 0.4,
        }
    }
}

pub trait Matcher: Send + Sync {
    fn strategy(&self) -> MatchStrategy;
    fn matches(&self, query: &str, candidate: &str) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub index: usize,
    pub strategy: MatchStrategy,
    pub confidence: f32,
}

/// Short names people type, keyed by [`name_key`], and the bundle name they mean.
const ALIASES: &[(&str, &str)] = &[
    ("vscode", "Visual Studio Code"),
    ("code", "Visual Studio Code"),
    ("chrome", "Google Chrome"),
    ("edge", "Microsoft Edge"),
    ("word", "Microsoft Word"),
    ("excel", "Microsoft Excel"),
    ("powerpoint", "Microsoft PowerPoint"),
    ("outlook", "Microsoft Outlook"),
    ("onenote", "Microsoft OneNote"),
    ("teams", "Microsoft Teams"),
    ("zoom", "zoom.us"),
    ("iterm", "iTerm"),
    ("iterm2", "iTerm"),
    ("intellij", "IntelliJ IDEA"),
    ("idea", "IntelliJ IDEA"),
    ("sublime", "Sublime Text"),
    ("webex", "Cisco Webex Meetings"),
    ("acrobat", "Adobe Acrobat Reader"),
    ("vlc", "VLC"),
];

/// Request fragments whose installed bundle name shares no useful substring
/// with what callers ask for.
const RECOVERY_FRAGMENTS: &[(&str, &str)] = &[
    ("zoom", "zoomus"),
    ("vscode", "visualstudiocode"),
    ("intellij", "intellijideace"),
    ("parallels", "parallelsdesktop"),
    ("githubdesktop", "githubdesktop"),
    ("acrobat", "adobeacrobatreader"),
    ("adobereader", "adobeacrobatreader"),
    ("office", "microsoftword"),
];

pub fn canonical_alias(name: &str) -> Option<&'static str> {
    let key = name_key(name);
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, target)| *target)
}

/// Every short alias that points at `display_name`.
pub fn aliases_for(display_name: &str) -> Vec<&'static str> {
    let key = name_key(display_name);
    ALIASES
        .iter()
        .filter(|(_, target)| name_key(target) == key)
        .map(|(alias, _)| *alias)
        .collect()
}

pub struct ExactMatcher;

impl Matcher for ExactMatcher {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::Exact
    }

    fn matches(&self, query: &str, candidate: &str) -> bool {
        normalize_name(query) == normalize_name(candidate)
    }
}

pub struct AliasMatcher;

impl Matcher for AliasMatcher {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::Alias
    }

    fn matches(&self, query: &str, candidate: &str) -> bool {
        let candidate_key = name_key(candidate);
        if canonical_alias(query).is_some_and(|target| name_key(target) == candidate_key) {
            return true;
        }
        canonical_alias(candidate).is_some_and(|target| name_key(target) == name_key(query))
    }
}

pub struct SubstringMatcher;

impl Matcher for SubstringMatcher {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::Substring
    }

    fn matches(&self, query: &str, candidate: &str) -> bool {
        let query = normalize_name(query);
        !query.is_empty() && normalize_name(candidate).contains(&query)
    }
}

pub struct WhitespaceInsensitiveMatcher;

impl Matcher for WhitespaceInsensitiveMatcher {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::WhitespaceInsensitive
    }

    fn matches(&self, query: &str, candidate: &str) -> bool {
        let query = compact_name(query);
        !query.is_empty() && compact_name(candidate).contains(&query)
    }
}

pub struct WordFragmentMatcher;

impl Matcher for WordFragmentMatcher {
    fn strategy(&self) -> MatchStrategy {
        MatchStrategy::WordFragment
    }

    fn matches(&self, query: &str, candidate: &str) -> bool {
        let query_key = name_key(query);
        let candidate_key = name_key(candidate);
        if query_key.is_empty() || candidate_key.is_empty() {
            return false;
        }
        if RECOVERY_FRAGMENTS
            .iter()
            .any(|(fragment, installed)| {
                query_key.contains(fragment) && candidate_key == *installed
            })
        {
            return true;
        }

        let candidate_words = significant_words(candidate);
        significant_words(query)
            .first()
            .filter(|word| word.len() >= 4)
            .is_some_and(|word| candidate_words.iter().any(|candidate| candidate == word))
    }
}

/// Policies used to find an installed application to remove.
pub fn uninstall_matchers() -> Vec<Box<dyn Matcher>> {
    vec![
        Box::new(ExactMatcher),
        Box::new(AliasMatcher),
        Box::new(SubstringMatcher),
        Box::new(WhitespaceInsensitiveMatcher),
        Box::new(WordFragmentMatcher),
    ]
}

/// Policies used to confirm a freshly deployed bundle.
pub fn verification_matchers() -> Vec<Box<dyn Matcher>> {
    vec![
        Box::new(ExactMatcher),
        Box::new(SubstringMatcher),
        Box::new(WhitespaceInsensitiveMatcher),
    ]
}

pub fn resolve<S: AsRef<str>>(
    query: &str,
    candidates: &[S],
    matchers: &[Box<dyn Matcher>],
) -> Option<Resolution> {
    matchers.iter().find_map(|matcher| {
        candidates
            .iter()
            .position(|candidate| matcher.matches(query, candidate.as_ref()))
            .map(|index| Resolution {
                index,
                strategy: matcher.strategy(),
                confidence: matcher.strategy().confidence(),
            })
    })
}

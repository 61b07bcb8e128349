//! Fuzzy Name Matching
//!
//! Pure scoring functions used by the entity resolver: honorific-stripping
//! normalization, Jaro-Winkler string distance, and a nickname table so
//! "Bill Porter" and "William Porter" score as the same person.

// ============================================================================
// CONSTANTS
// ============================================================================

/// Winkler prefix scaling factor
const WINKLER_PREFIX_SCALE: f64 = 0.1;

/// Maximum shared-prefix length considered by the Winkler boost
const WINKLER_MAX_PREFIX: usize = 4;

/// Surname similarity required before nickname/surname bonuses apply
const SURNAME_MATCH_THRESHOLD: f64 = 0.9;

/// Floor applied when first names are nickname variants and surnames match
const NICKNAME_CLAMP: f64 = 0.95;

/// Additive bonus for a matching surname
const SURNAME_BONUS: f64 = 0.05;

/// Titles stripped from the front of a name
const HONORIFICS: &[&str] = &[
    "mr", "mrs", "ms", "miss", "mx", "dr", "prof", "professor", "rev", "sir", "madam", "capt",
    "captain", "lt", "sgt",
];

/// Suffixes stripped from the end of a name
const SUFFIXES: &[&str] = &[
    "jr", "sr", "ii", "iii", "iv", "v", "esq", "phd", "md", "dds", "cpa", "mba",
];

/// Common nickname groups. Names in the same group are treated as variants
/// of one first name.
const NICKNAME_GROUPS: &[&[&str]] = &[
    &["william", "will", "bill", "billy", "liam"],
    &["robert", "rob", "bob", "bobby", "bert"],
    &["richard", "rich", "rick", "ricky", "dick"],
    &["michael", "mike", "mikey", "mick"],
    &["james", "jim", "jimmy", "jamie"],
    &["john", "jon", "johnny", "jack"],
    &["jonathan", "jon", "jonny"],
    &["jacob", "jake"],
    &["joseph", "joe", "joey"],
    &["thomas", "tom", "tommy"],
    &["charles", "charlie", "chuck", "chas"],
    &["christopher", "chris", "topher", "kit"],
    &["daniel", "dan", "danny"],
    &["matthew", "matt", "matty"],
    &["anthony", "tony"],
    &["andrew", "andy", "drew"],
    &["steven", "steve", "stephen"],
    &["edward", "ed", "eddie", "ted", "ned"],
    &["benjamin", "ben", "benny"],
    &["samuel", "sam", "sammy"],
    &["alexander", "alex", "xander", "sasha"],
    &["nicholas", "nick", "nicky"],
    &["zachary", "zach", "zack"],
    &["timothy", "tim", "timmy"],
    &["gregory", "greg"],
    &["jeffrey", "jeff"],
    &["kenneth", "ken", "kenny"],
    &["ronald", "ron", "ronnie"],
    &["donald", "don", "donnie"],
    &["lawrence", "larry"],
    &["theodore", "theo", "ted", "teddy"],
    &["frederick", "fred", "freddy"],
    &["raymond", "ray"],
    &["peter", "pete"],
    &["david", "dave", "davey"],
    &["elizabeth", "liz", "lizzy", "beth", "betsy", "eliza", "libby"],
    &["katherine", "catherine", "kate", "katie", "kathy", "cathy", "kitty"],
    &["margaret", "maggie", "meg", "peggy", "marge"],
    &["jennifer", "jen", "jenny"],
    &["jessica", "jess", "jessie"],
    &["rebecca", "becky", "becca"],
    &["victoria", "vicky", "tori"],
    &["patricia", "pat", "patty", "trish", "tricia"],
    &["susan", "sue", "susie", "suzanne"],
    &["deborah", "deb", "debbie"],
    &["barbara", "barb", "babs"],
    &["christina", "christine", "chris", "tina", "chrissy"],
    &["stephanie", "steph"],
    &["samantha", "sam", "sammy"],
    &["alexandra", "alex", "sandra", "sasha", "lexi"],
    &["abigail", "abby", "gail"],
    &["natalie", "nat"],
    &["gabrielle", "gabby", "gabi"],
    &["danielle", "dani"],
    &["kimberly", "kim"],
    &["cynthia", "cindy"],
    &["pamela", "pam"],
    &["sandra", "sandy"],
    &["nancy", "nan"],
    &["dorothy", "dot", "dottie"],
    &["florence", "flo", "flossie"],
    &["josephine", "jo", "josie"],
    &["eleanor", "ellie", "nora"],
    &["emily", "em", "emmy"],
];

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Normalize a display name for comparison: lowercase, strip honorifics and
/// suffixes, collapse whitespace and punctuation separators.
pub fn normalize(name: &str) -> String {
    let lowered = name.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| c.is_whitespace() || c == ',' || c == '.')
        .filter(|t| !t.is_empty())
        .collect();

    let mut kept: Vec<&str> = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        if i == 0 && HONORIFICS.contains(token) && tokens.len() > 1 {
            continue;
        }
        if i == tokens.len() - 1 && SUFFIXES.contains(token) && !kept.is_empty() {
            continue;
        }
        kept.push(*token);
    }

    kept.join(" ")
}

// ============================================================================
// JARO-WINKLER
// ============================================================================

/// Jaro similarity between two strings, in [0, 1]
fn jaro(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let match_window = (a.len().max(b.len()) / 2).saturating_sub(1);
    let mut a_matched = vec![false; a.len()];
    let mut b_matched = vec![false; b.len()];
    let mut matches = 0usize;

    for (i, ca) in a.iter().enumerate() {
        let lo = i.saturating_sub(match_window);
        let hi = (i + match_window + 1).min(b.len());
        for j in lo..hi {
            if !b_matched[j] && b[j] == *ca {
                a_matched[i] = true;
                b_matched[j] = true;
                matches += 1;
                break;
            }
        }
    }

    if matches == 0 {
        return 0.0;
    }

    // Count transpositions among matched characters
    let mut transpositions = 0usize;
    let mut j = 0usize;
    for (i, matched) in a_matched.iter().enumerate() {
        if !matched {
            continue;
        }
        while !b_matched[j] {
            j += 1;
        }
        if a[i] != b[j] {
            transpositions += 1;
        }
        j += 1;
    }

    let m = matches as f64;
    (m / a.len() as f64 + m / b.len() as f64 + (m - transpositions as f64 / 2.0) / m) / 3.0
}

/// Jaro-Winkler similarity: Jaro plus a boost for a shared prefix
pub fn jaro_winkler(a: &str, b: &str) -> f64 {
    let jaro_score = jaro(a, b);

    let prefix_len = a
        .chars()
        .zip(b.chars())
        .take(WINKLER_MAX_PREFIX)
        .take_while(|(ca, cb)| ca == cb)
        .count();

    (jaro_score + prefix_len as f64 * WINKLER_PREFIX_SCALE * (1.0 - jaro_score)).min(1.0)
}

// ============================================================================
// NICKNAMES
// ============================================================================

/// True when the two first names belong to the same nickname group
pub fn is_nickname_variant(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    NICKNAME_GROUPS
        .iter()
        .any(|group| group.contains(&a) && group.contains(&b))
}

/// Split a normalized name into (first token, last token)
fn first_last(name: &str) -> (Option<&str>, Option<&str>) {
    let mut tokens = name.split_whitespace();
    let first = tokens.next();
    let last = tokens.next_back().or(first);
    (first, last)
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Name similarity in [0, 1].
///
/// Combines Jaro-Winkler over the normalized full strings with nickname and
/// surname evidence: when the first names are recognized nickname variants
/// and the surnames match at >= 0.9, the score is clamped up to >= 0.95.
pub fn similarity(name_a: &str, name_b: &str) -> f64 {
    let a = normalize(name_a);
    let b = normalize(name_b);

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let mut score = jaro_winkler(&a, &b);

    let (first_a, last_a) = first_last(&a);
    let (first_b, last_b) = first_last(&b);

    if let (Some(fa), Some(la), Some(fb), Some(lb)) = (first_a, last_a, first_b, last_b) {
        // Only meaningful when both names actually carry a surname token
        if fa != la && fb != lb {
            let surname_score = jaro_winkler(la, lb);
            if surname_score >= SURNAME_MATCH_THRESHOLD {
                score = (score + SURNAME_BONUS).min(1.0);
                if is_nickname_variant(fa, fb) {
                    score = score.max(NICKNAME_CLAMP);
                }
            }
        }
    }

    score.min(1.0)
}

// ============================================================================
// TESTS
// ============================================================================

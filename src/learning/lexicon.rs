//! Curated word lists and line patterns used by the edit analyzer.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Opening salutation line: "Hi,", "Hello John,", "Dear Dr. Smith:".
pub static GREETING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(hi|hello|hey|hiya|howdy|dear|greetings|good (morning|afternoon|evening))\b[^\n]{0,40}[,!:.]?$",
    )
    .expect("greeting pattern is valid")
});

/// Closing valediction line: "Best,", "Kind regards", "Thanks!".
pub static VALEDICTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(best( regards| wishes)?|regards|kind regards|warm regards|warmly|sincerely|yours( truly| sincerely)?|cheers|thanks( again| so much)?|thank you|many thanks|all the best|talk soon|take care)[,!.]?$",
    )
    .expect("valediction pattern is valid")
});

/// A bare signature line under a valediction: one to three capitalized words.
pub static NAME_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\p{Lu}[\p{L}'.-]*( \p{Lu}[\p{L}'.-]*){0,2}$").expect("name pattern is valid")
});

/// Vocabulary that marks a formal register.
pub const FORMAL_WORDS: &[&str] = &[
    "regarding",
    "kindly",
    "therefore",
    "furthermore",
    "additionally",
    "however",
    "assist",
    "require",
    "requested",
    "appreciate",
    "inform",
    "obtain",
    "purchase",
    "commence",
    "utilize",
    "approximately",
    "sufficient",
    "inquire",
    "inquiry",
    "pleased",
    "certainly",
    "accordingly",
];

/// Vocabulary that marks a casual register.
pub const CASUAL_WORDS: &[&str] = &[
    "hey", "yeah", "yep", "sure", "cool", "awesome", "gonna", "wanna", "ok", "okay", "btw", "cheers",
    "great", "thx", "np", "lol", "totally", "stuff", "anyway", "gotcha",
];

/// Recognizable boilerplate phrases, lower-case and space-separated.
pub const BOILERPLATE_PHRASES: &[&str] = &[
    "i hope this email finds you well",
    "i hope this finds you well",
    "hope you are doing well",
    "please do not hesitate to reach out",
    "please do not hesitate to contact me",
    "please let me know if you have any questions",
    "thank you for reaching out",
    "thank you for your email",
    "thanks for reaching out",
    "i wanted to follow up",
    "just wanted to follow up",
    "at your earliest convenience",
    "looking forward to hearing from you",
    "as per my last email",
    "sounds good",
    "no worries",
    "happy to help",
    "let me know",
    "thanks so much",
];

/// Function words never reported as lexical preferences.
pub static STOPWORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "if", "then", "so", "to", "of", "in", "on", "at",
        "for", "with", "by", "from", "as", "is", "are", "was", "were", "be", "been", "am", "it",
        "its", "it's", "this", "that", "these", "those", "i", "i'm", "i'll", "i've", "i'd", "me",
        "my", "we", "our", "us", "you", "your", "you're", "he", "she", "they", "them", "their",
        "his", "her", "do", "does", "did", "have", "has", "had", "will", "would", "can", "could",
        "should", "not", "no", "yes", "just", "also", "up", "out", "about", "there", "here",
        "what", "when", "which", "who", "how", "all", "any", "some", "more", "very", "too",
    ]
    .into_iter()
    .collect()
});

pub fn is_formal(word: &str) -> bool {
    FORMAL_WORDS.iter().any(|w| *w == word)
}

pub fn is_casual(word: &str) -> bool {
    CASUAL_WORDS.iter().any(|w| *w == word)
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(word)
}

/// Lower-cased word tokens. Apostrophes stay inside words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Boilerplate phrases occurring in a token stream, in order of first
/// occurrence, each with the token positions it covers.
pub fn find_phrases(tokens: &[String]) -> Vec<(&'static str, Vec<usize>)> {
    let mut found: Vec<(usize, &'static str, Vec<usize>)> = Vec::new();
    let mut covered: HashSet<usize> = HashSet::new();

    // Longest phrases first so "i hope this email finds you well" wins over
    // any shorter phrase inside it.
    let mut phrases: Vec<&'static str> = BOILERPLATE_PHRASES.to_vec();
    phrases.sort_by_key(|p| std::cmp::Reverse(p.split(' ').count()));

    for phrase in phrases {
        let words: Vec<&str> = phrase.split(' ').collect();
        if words.len() > tokens.len() {
            continue;
        }
        for start in 0..=tokens.len() - words.len() {
            let window = start..start + words.len();
            if window.clone().any(|i| covered.contains(&i)) {
                continue;
            }
            if tokens[window.clone()].iter().zip(&words).all(|(t, w)| t == w) {
                let positions: Vec<usize> = window.collect();
                covered.extend(positions.iter().copied());
                found.push((start, phrase, positions));
                break;
            }
        }
    }

    found.sort_by_key(|(start, _, _)| *start);
    found.into_iter().map(|(_, p, pos)| (p, pos)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_lines() {
        for line in ["Hi,", "Hi John,", "Hello there!", "Dear Dr. Smith:", "Good morning Sam,", "hey"] {
            assert!(GREETING.is_match(line), "{line}");
        }
        for line in ["History is long.", "Highly recommend it", "I can help."] {
            assert!(!GREETING.is_match(line), "{line}");
        }
    }

    #[test]
    fn valediction_lines() {
        for line in ["Best,", "Best regards,", "Thanks!", "Cheers", "Kind regards", "Thank you."] {
            assert!(VALEDICTION.is_match(line), "{line}");
        }
        assert!(!VALEDICTION.is_match("Thanks for the update on the project."));
    }

    #[test]
    fn name_line_is_short_capitalized() {
        assert!(NAME_LINE.is_match("Jane"));
        assert!(NAME_LINE.is_match("Jane O'Neil"));
        assert!(!NAME_LINE.is_match("see you soon"));
        assert!(!NAME_LINE.is_match("I can help."));
    }

    #[test]
    fn tokenize_keeps_contractions() {
        assert_eq!(tokenize("I'm sure, it's OK!"), vec!["i'm", "sure", "it's", "ok"]);
        assert_eq!(tokenize("  "), Vec::<String>::new());
    }

    #[test]
    fn phrases_prefer_longest_match() {
        let tokens = tokenize("I hope this email finds you well. Let me know!");
        let found = find_phrases(&tokens);
        let names: Vec<&str> = found.iter().map(|(p, _)| *p).collect();
        assert_eq!(names, vec!["i hope this email finds you well", "let me know"]);
        assert_eq!(found[0].1, (0..7).collect::<Vec<_>>());
    }
}

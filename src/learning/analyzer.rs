//! Edit diff analysis: what did the human change between our draft and the
//! text they actually sent?
//!
//! Pure and deterministic. Each rule runs independently and emits at most
//! one signal per value; output order is greeting, sign-off, length/tone,
//! phrases, then single words.

use std::collections::HashSet;

use similar::{ChangeTag, TextDiff};

use crate::config::LearningConfig;
use crate::learning::lexicon::{self, GREETING, NAME_LINE, VALEDICTION};
use crate::learning::preference::{Length, Preference, Tone};

/// Greeting lines longer than this are treated as body text.
const MAX_GREETING_WORDS: usize = 8;
/// Words shorter than this are never reported.
const MIN_LEXICAL_LEN: usize = 3;

/// A message split into its greeting, body, and sign-off.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageParts {
    pub greeting: Option<String>,
    pub body: String,
    /// Valediction plus any signature name line under it.
    pub signoff: Option<String>,
}

impl MessageParts {
    pub fn parse(text: &str) -> Self {
        let lines: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        let mut start = 0;
        let mut end = lines.len();

        let greeting = match lines.first() {
            Some(first)
                if GREETING.is_match(first) && first.split_whitespace().count() <= MAX_GREETING_WORDS =>
            {
                start = 1;
                Some(first.to_string())
            }
            _ => None,
        };

        let signoff = if end > start && VALEDICTION.is_match(lines[end - 1]) {
            end -= 1;
            Some(lines[end].to_string())
        } else if end >= start + 2
            && NAME_LINE.is_match(lines[end - 1])
            && VALEDICTION.is_match(lines[end - 2])
        {
            end -= 2;
            Some(lines[end..].join("\n"))
        } else {
            None
        };

        Self {
            greeting,
            body: lines[start..end].join("\n"),
            signoff,
        }
    }
}

/// Extracts preference signals from (draft, final) pairs.
#[derive(Debug, Clone)]
pub struct EditDiffAnalyzer {
    config: LearningConfig,
}

impl EditDiffAnalyzer {
    pub fn new(config: LearningConfig) -> Self {
        Self { config }
    }

    /// Signals confirmed by the human's edit.
    ///
    /// Empty for an empty final text (a denial) and for an unchanged draft.
    pub fn analyze(&self, draft: &str, final_text: &str) -> Vec<Preference> {
        self.analyze_reply(draft, final_text, "")
    }

    /// Like [`analyze`](Self::analyze), with the inbound message as a source
    /// of names that should never become word preferences.
    pub fn analyze_reply(&self, draft: &str, final_text: &str, inbound: &str) -> Vec<Preference> {
        if final_text.trim().is_empty() || draft.trim() == final_text.trim() {
            return Vec::new();
        }

        let d = MessageParts::parse(draft);
        let f = MessageParts::parse(final_text);
        let mut signals = Vec::new();

        if d.greeting.is_some() && f.greeting.is_none() {
            signals.push(Preference::NoGreeting);
        }
        if d.signoff.is_some() && f.signoff.is_none() {
            signals.push(Preference::NoSignoff);
        }

        let d_tokens = lexicon::tokenize(&d.body);
        let f_tokens = lexicon::tokenize(&f.body);
        let d_set: HashSet<&str> = d_tokens.iter().map(String::as_str).collect();
        let f_set: HashSet<&str> = f_tokens.iter().map(String::as_str).collect();

        signals.extend(self.length_and_tone(&d_tokens, &f_tokens, &d_set, &f_set));

        let changed = change_fraction(&d.body, &f.body);
        if changed > self.config.rewrite_threshold {
            tracing::debug!(changed, "Near-total rewrite, skipping lexical signals");
            return signals;
        }

        // Phrases
        let d_phrases = lexicon::find_phrases(&d_tokens);
        let f_phrases = lexicon::find_phrases(&f_tokens);
        let d_names: HashSet<&str> = d_phrases.iter().map(|(p, _)| *p).collect();
        let f_names: HashSet<&str> = f_phrases.iter().map(|(p, _)| *p).collect();

        let mut d_explained: HashSet<usize> = HashSet::new();
        for (phrase, positions) in &d_phrases {
            if !f_names.contains(phrase) {
                signals.push(Preference::AvoidPhrase(phrase.to_string()));
                d_explained.extend(positions.iter().copied());
            }
        }
        let mut f_explained: HashSet<usize> = HashSet::new();
        for (phrase, positions) in &f_phrases {
            if !d_names.contains(phrase) {
                signals.push(Preference::PreferPhrase(phrase.to_string()));
                f_explained.extend(positions.iter().copied());
            }
        }

        // Words
        let cap = self.config.max_lexical_signals;
        for word in novel_words(&d_tokens, &f_set, &d_explained, &HashSet::new(), cap) {
            signals.push(Preference::AvoidWord(word));
        }
        let names = proper_nouns(&[d.body.as_str(), f.body.as_str(), inbound]);
        for word in novel_words(&f_tokens, &d_set, &f_explained, &names, cap) {
            signals.push(Preference::PreferWord(word));
        }

        signals
    }

    /// Style preferences the human visibly kept: the draft's greeting or
    /// sign-off survived into the final text.
    pub fn retained(&self, draft: &str, final_text: &str) -> Vec<Preference> {
        if final_text.trim().is_empty() {
            return Vec::new();
        }
        let d = MessageParts::parse(draft);
        let f = MessageParts::parse(final_text);
        let mut kept = Vec::new();
        if d.greeting.is_some() && f.greeting.is_some() {
            kept.push(Preference::NoGreeting);
        }
        if d.signoff.is_some() && f.signoff.is_some() {
            kept.push(Preference::NoSignoff);
        }
        kept
    }

    fn length_and_tone(
        &self,
        d_tokens: &[String],
        f_tokens: &[String],
        d_set: &HashSet<&str>,
        f_set: &HashSet<&str>,
    ) -> Vec<Preference> {
        let (dn, fn_) = (d_tokens.len() as f64, f_tokens.len() as f64);
        if d_tokens.is_empty() {
            return Vec::new();
        }

        if fn_ <= self.config.brief_ratio * dn && f_tokens.len() <= self.config.short_message_words {
            return vec![Preference::Tone(Tone::Concise), Preference::Length(Length::Brief)];
        }

        let near_equal = (fn_ - dn).abs() <= self.config.casual_length_tolerance * dn;
        let formal_dropped = d_set
            .iter()
            .any(|w| lexicon::is_formal(w) && !f_set.contains(w));
        let casual_added = f_set
            .iter()
            .any(|w| lexicon::is_casual(w) && !d_set.contains(w));
        if near_equal && formal_dropped && casual_added {
            return vec![Preference::Tone(Tone::Casual)];
        }
        Vec::new()
    }
}

/// Fraction of word tokens touched by the edit, in `[0, 1]`.
fn change_fraction(old: &str, new: &str) -> f64 {
    let diff = TextDiff::from_words(old, new);
    let (mut changed, mut total) = (0usize, 0usize);
    for change in diff.iter_all_changes() {
        if change.value().trim().is_empty() {
            continue;
        }
        total += 1;
        if change.tag() != ChangeTag::Equal {
            changed += 1;
        }
    }
    if total == 0 {
        0.0
    } else {
        changed as f64 / total as f64
    }
}

/// Tokens absent from `other`, in order of first occurrence, skipping
/// phrase-explained positions, stopwords, short words, numbers, and `exclude`.
fn novel_words(
    tokens: &[String],
    other: &HashSet<&str>,
    explained: &HashSet<usize>,
    exclude: &HashSet<String>,
    cap: usize,
) -> Vec<String> {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        if out.len() >= cap {
            break;
        }
        let t = token.as_str();
        if explained.contains(&i)
            || other.contains(t)
            || lexicon::is_stopword(t)
            || t.chars().count() < MIN_LEXICAL_LEN
            || t.chars().all(|c| c.is_ascii_digit())
            || exclude.contains(t)
            || !seen.insert(t)
        {
            continue;
        }
        out.push(token.clone());
    }
    out
}

/// Lower-cased words that look like names in any of `texts`.
///
/// A word capitalized mid-sentence is a name. A capitalized sentence
/// opener is one too, unless it also appears in lower case or is a known
/// function or register word.
fn proper_nouns(texts: &[&str]) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut openers = HashSet::new();
    let mut lowercase = HashSet::new();
    for line in texts.iter().flat_map(|text| text.lines()) {
        let mut sentence_start = true;
        for raw in line.split_whitespace() {
            let word = raw.trim_matches(|c: char| !(c.is_alphanumeric() || c == '\''));
            if let Some(first) = word.chars().next() {
                let lower = word.to_lowercase();
                if !first.is_uppercase() {
                    lowercase.insert(lower);
                } else if sentence_start {
                    openers.insert(lower);
                } else {
                    names.insert(lower);
                }
                sentence_start = raw.ends_with(['.', '!', '?', ':']);
            }
        }
    }
    names.extend(openers.into_iter().filter(|w| {
        !lowercase.contains(w) && !lexicon::is_stopword(w) && !lexicon::is_formal(w) && !lexicon::is_casual(w)
    }));
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> EditDiffAnalyzer {
        EditDiffAnalyzer::new(LearningConfig::default())
    }

    #[test]
    fn identical_texts_emit_nothing() {
        let a = analyzer();
        for text in ["Hi,\nSure.\nBest,", "", "plain body", "Hello Sam,\nSee below.\nThanks,\nAlex"] {
            assert!(a.analyze(text, text).is_empty(), "{text:?}");
        }
        assert!(a.analyze("Hi,\nok", "  Hi,\nok  ").is_empty());
    }

    #[test]
    fn greeting_and_signature_removed() {
        let signals = analyzer().analyze("Hi John,\nI can help.\nBest,\nJane", "I can help.");
        assert_eq!(signals, vec![Preference::NoGreeting, Preference::NoSignoff]);
    }

    #[test]
    fn greeting_removed_with_bare_valediction() {
        let signals = analyzer().analyze("Hi,\nSure, happy to help.\nBest,", "Sure, happy to help.");
        assert_eq!(signals, vec![Preference::NoGreeting, Preference::NoSignoff]);
    }

    #[test]
    fn empty_final_is_not_an_edit() {
        assert!(analyzer().analyze("Hi,\nSure.\nBest,", "   ").is_empty());
        assert!(analyzer().retained("Hi,\nSure.\nBest,", "").is_empty());
    }

    #[test]
    fn both_greetings_emit_no_greeting_signal() {
        let signals = analyzer().analyze("Hi Sam,\nThe doc is ready.", "Hello Sam,\nThe doc is ready.");
        assert!(!signals.contains(&Preference::NoGreeting));
    }

    #[test]
    fn much_shorter_final_is_brief_and_concise() {
        let draft = "Thank you for the detailed update on the migration plan. I have reviewed \
                     every section carefully and I think the timeline looks reasonable overall, \
                     although we may want to revisit staffing later.";
        let signals = analyzer().analyze(draft, "Looks good, thanks.");
        assert!(signals.contains(&Preference::Tone(Tone::Concise)));
        assert!(signals.contains(&Preference::Length(Length::Brief)));
    }

    #[test]
    fn formal_to_casual_swap_is_casual_tone() {
        let draft = "I would appreciate it if you could send the report regarding the budget.";
        let final_text = "Hey could you send the report on the budget? Thanks, cool.";
        let signals = analyzer().analyze(draft, final_text);
        assert!(signals.contains(&Preference::Tone(Tone::Casual)), "{signals:?}");
        assert!(!signals.contains(&Preference::Length(Length::Brief)));
    }

    #[test]
    fn removed_word_is_avoided() {
        let signals = analyzer().analyze(
            "Please kindly review the attached proposal.",
            "Please review the attached proposal.",
        );
        assert_eq!(signals, vec![Preference::AvoidWord("kindly".into())]);
    }

    #[test]
    fn introduced_names_are_not_preferred() {
        let signals = analyzer().analyze("Let us meet on Monday.", "Let us meet on Tuesday with Priya.");
        assert!(signals.contains(&Preference::AvoidWord("monday".into())));
        assert!(!signals.iter().any(|s| matches!(s, Preference::PreferWord(_))), "{signals:?}");
    }

    #[test]
    fn sentence_opening_names_are_not_preferred() {
        let signals = analyzer().analyze(
            "I can meet on Friday.",
            "Priya can join. I can meet on Friday.",
        );
        assert_eq!(signals, vec![Preference::PreferWord("join".into())]);
    }

    #[test]
    fn names_from_the_inbound_message_are_not_preferred() {
        let draft = "Happy to set up the call.";
        let final_text = "Happy to set up the call, bring dana along.";
        let inbound = "Could Dana from finance join the call?";

        let bare = analyzer().analyze(draft, final_text);
        assert!(bare.contains(&Preference::PreferWord("dana".into())), "{bare:?}");

        let signals = analyzer().analyze_reply(draft, final_text, inbound);
        assert!(!signals.contains(&Preference::PreferWord("dana".into())), "{signals:?}");
        assert!(signals.contains(&Preference::PreferWord("bring".into())), "{signals:?}");
    }

    #[test]
    fn opener_seen_in_lower_case_is_still_a_word() {
        let names = proper_nouns(&["Thanks again.", "Many thanks."]);
        assert!(!names.contains("thanks"));
        let names = proper_nouns(&["Priya agreed.", "Ask Sam."]);
        assert!(names.contains("priya"));
        assert!(names.contains("sam"));
    }

    #[test]
    fn near_total_rewrite_skips_lexical_signals() {
        let signals = analyzer().analyze(
            "The quarterly numbers look strong across every region.",
            "Can't talk now, will call later.",
        );
        assert!(signals.is_empty(), "{signals:?}");
    }

    #[test]
    fn boilerplate_phrases_are_tracked_as_phrases() {
        let signals = analyzer().analyze(
            "I hope this finds you well. The signed contract is attached for your review.",
            "The signed contract is attached for your review. Let me know.",
        );
        assert_eq!(
            signals,
            vec![
                Preference::AvoidPhrase("i hope this finds you well".into()),
                Preference::PreferPhrase("let me know".into()),
            ]
        );
    }

    #[test]
    fn lexical_signals_are_capped() {
        let draft = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima mike november oscar papa";
        let final_text = "golf hotel india juliet kilo lima mike november oscar papa";
        let signals = analyzer().analyze(draft, final_text);
        let words: Vec<&str> = signals
            .iter()
            .filter_map(|s| match s {
                Preference::AvoidWord(w) => Some(w.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(words, vec!["alpha", "bravo", "charlie", "delta", "echo"]);
    }

    #[test]
    fn retained_reports_kept_greeting_and_signoff() {
        let a = analyzer();
        let draft = "Hi Sam,\nThe doc is ready.\nThanks,\nAlex";
        let kept = a.retained(draft, "Hi Sam,\nThe doc is ready now.\nThanks,\nAlex");
        assert_eq!(kept, vec![Preference::NoGreeting, Preference::NoSignoff]);
        assert_eq!(a.retained(draft, "The doc is ready.\nThanks,\nAlex"), vec![Preference::NoSignoff]);
    }

    #[test]
    fn parts_split_greeting_body_signoff() {
        let parts = MessageParts::parse("Hi John,\n\nI can help.\n\nBest,\nJane");
        assert_eq!(parts.greeting.as_deref(), Some("Hi John,"));
        assert_eq!(parts.body, "I can help.");
        assert_eq!(parts.signoff.as_deref(), Some("Best,\nJane"));
    }
}

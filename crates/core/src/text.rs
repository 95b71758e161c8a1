//! Word counting and the literal padding/truncation policy shared by the
//! length loop, the chapter floor and the enhancement bands.

const TERMINAL_PUNCTUATION: [char; 7] = ['.', '!', '?', '…', '。', '！', '？'];
const CLOSING_MARKS: [char; 8] = ['"', '\'', '”', '’', ')', ']', '»', '*'];

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// True when the last non-whitespace character, looking through closing
/// quotes and brackets, ends a sentence.
pub fn ends_with_terminal(text: &str) -> bool {
    let trimmed = text.trim_end().trim_end_matches(CLOSING_MARKS.as_slice());
    trimmed
        .chars()
        .next_back()
        .map(|ch| TERMINAL_PUNCTUATION.contains(&ch))
        .unwrap_or(false)
}

pub fn force_terminal(text: &mut String) {
    if ends_with_terminal(text) {
        return;
    }
    let trimmed_len = text.trim_end().len();
    text.truncate(trimmed_len);
    text.push('.');
}

/// Appends `filler` until `text` holds at least `target` words.
/// Returns the number of filler repetitions appended.
pub fn pad_to(text: &mut String, target: usize, filler: &str) -> usize {
    let filler_words = count_words(filler);
    let current = count_words(text);
    if current >= target || filler_words == 0 {
        return 0;
    }

    let repeats = (target - current).div_ceil(filler_words);
    for _ in 0..repeats {
        if !text.trim_end().is_empty() {
            let trimmed_len = text.trim_end().len();
            text.truncate(trimmed_len);
            text.push(' ');
        }
        text.push_str(filler.trim());
    }
    repeats
}

/// Keeps the first `limit` words of `text`, preserving the original spacing
/// and line breaks up to the cut.
pub fn truncate_words(text: &str, limit: usize) -> String {
    if limit == 0 {
        return String::new();
    }

    let mut seen = 0usize;
    let mut in_word = false;
    for (idx, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if in_word {
                in_word = false;
                if seen == limit {
                    return text[..idx].to_string();
                }
            }
        } else if !in_word {
            in_word = true;
            seen += 1;
        }
    }
    text.trim_end().to_string()
}

/// Inclusive word band around a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Band {
    pub target: usize,
    pub lower: usize,
    pub upper: usize,
}

impl Band {
    pub fn around(target: usize, tolerance: f64) -> Self {
        let tolerance = tolerance.clamp(0.0, 1.0);
        let lower = (target as f64 * (1.0 - tolerance) - 1e-9).ceil() as usize;
        let upper = (target as f64 * (1.0 + tolerance) + 1e-9).floor() as usize;
        Self {
            target,
            lower: lower.min(target),
            upper: upper.max(target),
        }
    }

    pub fn contains(&self, words: usize) -> bool {
        (self.lower..=self.upper).contains(&words)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandCorrection {
    Unchanged,
    Padded,
    Truncated,
}

/// Brings `text` into `band`: under the band it is padded with `filler` and cut
/// back to exactly the target, over the band it is cut to exactly the target.
pub fn correct_to_band(text: &str, band: Band, filler: &str) -> (String, BandCorrection) {
    let words = count_words(text);
    if band.contains(words) {
        return (text.to_string(), BandCorrection::Unchanged);
    }

    if words < band.lower {
        let mut padded = text.to_string();
        pad_to(&mut padded, band.target, filler);
        if count_words(&padded) > band.target {
            padded = truncate_words(&padded, band.target);
        }
        (padded, BandCorrection::Padded)
    } else {
        (truncate_words(text, band.target), BandCorrection::Truncated)
    }
}

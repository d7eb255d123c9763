//! Normalizing whitespace in recognized text.

use std::sync::LazyLock;

use regex::Regex;

static HORIZONTAL_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("failed to compile regex"));

static EXTRA_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("failed to compile regex"));

static SPACE_BEFORE_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+([.,!?;:])").expect("failed to compile regex"));

/// Tidy up OCR output.
///
/// Runs of spaces and tabs become one space, line breaks are kept but at most
/// one blank line survives in a row, whitespace before punctuation is removed,
/// and the result is trimmed.
pub fn clean_ocr_text(text: &str) -> String {
    let text = HORIZONTAL_WHITESPACE.replace_all(text, " ");
    let text = EXTRA_BLANK_LINES.replace_all(&text, "\n\n");
    let text = SPACE_BEFORE_PUNCTUATION.replace_all(&text, "$1");
    text.trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_spaces_and_tabs() {
        assert_eq!(clean_ocr_text("Umowa \t  najmu   lokalu"), "Umowa najmu lokalu");
    }

    #[test]
    fn keeps_line_breaks_and_one_blank_line() {
        assert_eq!(
            clean_ocr_text("Paragraf 1\nTreść\n\n\n\n\nParagraf 2"),
            "Paragraf 1\nTreść\n\nParagraf 2"
        );
    }

    #[test]
    fn removes_space_before_punctuation() {
        assert_eq!(
            clean_ocr_text("Warszawa , dnia 1 stycznia .\nTak !"),
            "Warszawa, dnia 1 stycznia.\nTak!"
        );
    }

    #[test]
    fn trims_and_handles_empty_input() {
        assert_eq!(clean_ocr_text("\n\n  tekst  \n\x0C"), "tekst");
        assert_eq!(clean_ocr_text("   "), "");
    }
}

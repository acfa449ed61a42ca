//! Character-level diff between two versions of a document's text.
//!
//! Clients send whole-document text; the hub needs the smallest single
//! splice that turns the current text into the new one:
//! ```text
//! old:  h [e] llo        common prefix "h", common suffix "llo"
//! new:  h [a] llo        → delete 1 char at 1, insert "a"
//! ```

/// A single splice: delete `delete_len` chars at `position`, then insert `insert` there.
///
/// Positions and lengths count `char`s, not bytes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextEdit {
    pub position: usize,
    pub delete_len: usize,
    pub insert: String,
}

impl TextEdit {
    /// True when applying the edit changes nothing.
    pub fn is_noop(&self) -> bool {
        self.delete_len == 0 && self.insert.is_empty()
    }
}

/// Compute the splice turning `old` into `new`.
///
/// Trims the longest common prefix, then the longest common suffix of what
/// remains, so prefix and suffix never overlap.
pub fn text_edit(old: &str, new: &str) -> TextEdit {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = old
        .iter()
        .rev()
        .zip(new.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    TextEdit {
        position: prefix,
        delete_len: old.len() - prefix - suffix,
        insert: new[prefix..new.len() - suffix].iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Apply an edit to a string, char-wise.
    fn splice(old: &str, edit: &TextEdit) -> String {
        let chars: Vec<char> = old.chars().collect();
        let mut out: String = chars[..edit.position].iter().collect();
        out.push_str(&edit.insert);
        out.extend(&chars[edit.position + edit.delete_len..]);
        out
    }

    #[test]
    fn test_single_substitution() {
        let edit = text_edit("hello", "hallo");
        assert_eq!(
            edit,
            TextEdit { position: 1, delete_len: 1, insert: "a".into() }
        );
    }

    #[test]
    fn test_identical_is_noop() {
        assert!(text_edit("same", "same").is_noop());
        assert!(text_edit("", "").is_noop());
    }

    #[test]
    fn test_pure_insert_and_delete() {
        let edit = text_edit("helo", "hello");
        assert_eq!(edit.delete_len, 0);
        assert_eq!(edit.insert, "l");
        assert_eq!(splice("helo", &edit), "hello");

        let edit = text_edit("hello world", "hello");
        assert_eq!(edit, TextEdit { position: 5, delete_len: 6, insert: String::new() });
    }

    #[test]
    fn test_repeated_chars_do_not_overlap() {
        // Prefix "aa" and suffix "aa" would overlap without the bound.
        let edit = text_edit("aaa", "aaaa");
        assert_eq!(edit.delete_len, 0);
        assert_eq!(edit.insert, "a");
        assert_eq!(splice("aaa", &edit), "aaaa");

        let edit = text_edit("aaaa", "aa");
        assert_eq!(edit.delete_len, 2);
        assert_eq!(splice("aaaa", &edit), "aa");
    }

    #[test]
    fn test_from_and_to_empty() {
        assert_eq!(text_edit("", "abc"), TextEdit { position: 0, delete_len: 0, insert: "abc".into() });
        assert_eq!(text_edit("abc", ""), TextEdit { position: 0, delete_len: 3, insert: String::new() });
    }

    #[test]
    fn test_multibyte_positions_count_chars() {
        let edit = text_edit("naïve café", "naïve cafés");
        assert_eq!(edit.position, 10);
        assert_eq!(splice("naïve café", &edit), "naïve cafés");

        let edit = text_edit("日本語", "日本の語");
        assert_eq!(edit, TextEdit { position: 2, delete_len: 0, insert: "の".into() });
    }

    #[test]
    fn test_splice_roundtrips_arbitrary_pairs() {
        let pairs = [
            ("", ""),
            ("abc", "xyz"),
            ("The quick fox", "The slow brown fox"),
            ("abcabc", "abc"),
            ("mississippi", "missouri"),
        ];
        for (old, new) in pairs {
            assert_eq!(splice(old, &text_edit(old, new)), new, "{old:?} -> {new:?}");
        }
    }
}

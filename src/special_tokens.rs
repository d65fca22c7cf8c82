//! Reserved tokens occupying the first vocabulary ids.

/// Padding token, id 0.
pub const PAD_WORD: &str = "<blank>";
/// Unknown-token fallback, id 1.
pub const UNK_WORD: &str = "<unk>";
/// Beginning-of-sequence marker, id 2.
pub const BOS_WORD: &str = "<s>";
/// End-of-sequence marker, id 3.
pub const EOS_WORD: &str = "</s>";

/// Id of [`PAD_WORD`].
pub const PAD: u32 = 0;
/// Id of [`UNK_WORD`].
pub const UNK: u32 = 1;
/// Id of [`BOS_WORD`].
pub const BOS: u32 = 2;
/// Id of [`EOS_WORD`].
pub const EOS: u32 = 3;

const RESERVED: [&str; 4] = [PAD_WORD, UNK_WORD, BOS_WORD, EOS_WORD];

/// The reserved tokens in id order.
#[must_use]
pub fn reserved_tokens() -> &'static [&'static str] {
    &RESERVED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_ids_match_positions() {
        let tokens = reserved_tokens();
        assert_eq!(tokens[PAD as usize], PAD_WORD);
        assert_eq!(tokens[UNK as usize], UNK_WORD);
        assert_eq!(tokens[BOS as usize], BOS_WORD);
        assert_eq!(tokens[EOS as usize], EOS_WORD);
    }
}

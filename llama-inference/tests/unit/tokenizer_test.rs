use super::*;

fn vocab_from(entries: &[(&str, f32)]) -> Vocabulary {
    Vocabulary::from_tokens(
        entries
            .iter()
            .map(|(text, score)| (text.as_bytes().to_vec(), *score))
            .collect(),
    )
}

/// Filler entries so that interesting tokens land on chosen ids.
fn filler(n: usize) -> Vec<(Vec<u8>, f32)> {
    (0..n)
        .map(|i| (format!("<filler-{i}>").into_bytes(), 0.0))
        .collect()
}

#[test]
fn empty_input_yields_nothing_even_with_bos() {
    let vocab = vocab_from(&[]);
    assert!(vocab.tokenize("", true).is_empty());
    assert!(vocab.tokenize("", false).is_empty());
}

#[test]
fn bos_is_prepended() {
    let vocab = vocab_from(&[]);
    let ids = vocab.tokenize("a", true);
    assert_eq!(ids[0], TOKEN_BOS);
}

#[test]
fn unknown_bytes_fall_back_to_byte_ids() {
    let vocab = vocab_from(&[]);
    // 'x' = 0x78, 'y' = 0x79, 'z' = 0x7A
    assert_eq!(vocab.tokenize("xyz", false), vec![0x7B, 0x7C, 0x7D]);
}

#[test]
fn multibyte_character_splits_into_byte_ids() {
    // U+1F642 is F0 9F 99 82; with an empty vocabulary each byte is emitted
    // with the +3 offset.
    let vocab = vocab_from(&[]);
    assert_eq!(vocab.tokenize("\u{1F642}", false), vec![243, 162, 156, 133]);
}

#[test]
fn higher_scoring_merge_wins() {
    let mut tokens = filler(10);
    tokens.push((b"a".to_vec(), 0.0)); // id 10
    tokens.push((b"b".to_vec(), 0.0)); // id 11
    tokens.push((b"ab".to_vec(), 1.0)); // id 12
    tokens.push((b"abc".to_vec(), 2.0)); // id 13
    tokens.push((b"c".to_vec(), 0.0)); // id 14
    let vocab = Vocabulary::from_tokens(tokens);

    assert_eq!(vocab.tokenize("abc", false), vec![13]);
}

#[test]
fn equal_scores_merge_leftmost_first() {
    // "aaa" with only "a" and "aa" in the vocabulary: both candidate pairs
    // carry the same score, so the left one merges and the tail stays.
    let vocab = vocab_from(&[("a", 0.0), ("aa", 1.0)]);
    let aa = vocab.id_for(b"aa").unwrap();
    let a = vocab.id_for(b"a").unwrap();
    assert_eq!(vocab.tokenize("aaa", false), vec![aa, a]);
}

#[test]
fn stale_queue_entries_are_discarded() {
    // "abcd": merging "bc" first would block "ab" and "cd"; scores force
    // "bc" to win, then the stale neighbors must not resurface as merges.
    let vocab = vocab_from(&[
        ("a", 0.0),
        ("b", 0.0),
        ("c", 0.0),
        ("d", 0.0),
        ("ab", 1.0),
        ("bc", 5.0),
        ("cd", 1.0),
    ]);
    let a = vocab.id_for(b"a").unwrap();
    let bc = vocab.id_for(b"bc").unwrap();
    let d = vocab.id_for(b"d").unwrap();
    assert_eq!(vocab.tokenize("abcd", false), vec![a, bc, d]);
}

#[test]
fn chained_merges_reach_the_longest_token() {
    let vocab = vocab_from(&[("h", 0.1), ("e", 0.1), ("he", 0.5), ("hel", 1.0), ("l", 0.1)]);
    let hel = vocab.id_for(b"hel").unwrap();
    let l = vocab.id_for(b"l").unwrap();
    // "hell" -> he + l + l -> hel + l
    assert_eq!(vocab.tokenize("hell", false), vec![hel, l]);
}

#[test]
fn byte_fallback_reconstructs_the_input() {
    let vocab = vocab_from(&[]);
    let text = "no merges here";
    let ids = vocab.tokenize(text, false);
    let bytes: Vec<u8> = ids.iter().map(|&id| (id - 3) as u8).collect();
    assert_eq!(bytes, text.as_bytes());
}

#[test]
fn token_lookup_round_trips() {
    let vocab = vocab_from(&[("hello", 1.5)]);
    let id = vocab.id_for(b"hello").unwrap();
    assert_eq!(vocab.token_bytes(id).unwrap(), b"hello");
    assert_eq!(vocab.token_to_str(id).unwrap(), "hello");
    assert_eq!(vocab.token_score(id).unwrap(), 1.5);
    assert!(vocab.token_bytes(99).is_none());
}

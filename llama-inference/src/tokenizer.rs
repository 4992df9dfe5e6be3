//! Score-maximizing byte-pair tokenizer over a sentencepiece-style
//! vocabulary.
//!
//! Text is split into UTF-8 characters, then adjacent pieces are merged
//! greedily: the candidate pair whose merged form has the highest vocabulary
//! score wins, with the leftmost pair breaking ties. Pieces that never merge
//! into a vocabulary entry fall back to one id per raw byte.

#[cfg(test)]
#[path = "../tests/unit/tokenizer_test.rs"]
mod tokenizer_test;

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

pub type TokenId = u32;

/// Beginning-of-sequence token id.
pub const TOKEN_BOS: TokenId = 1;
/// End-of-sequence token id.
pub const TOKEN_EOS: TokenId = 2;

/// Offset added to a raw byte when no vocabulary entry covers it.
const BYTE_FALLBACK_OFFSET: u32 = 3;

pub struct TokenScore {
    pub text: Vec<u8>,
    pub score: f32,
}

/// Ordered token list plus the reverse byte-sequence lookup.
pub struct Vocabulary {
    id_to_token: Vec<TokenScore>,
    token_to_id: HashMap<Vec<u8>, TokenId>,
}

impl Vocabulary {
    pub fn from_tokens(tokens: Vec<(Vec<u8>, f32)>) -> Self {
        let mut id_to_token = Vec::with_capacity(tokens.len());
        let mut token_to_id = HashMap::with_capacity(tokens.len());
        for (i, (text, score)) in tokens.into_iter().enumerate() {
            token_to_id.insert(text.clone(), i as TokenId);
            id_to_token.push(TokenScore { text, score });
        }
        Self {
            id_to_token,
            token_to_id,
        }
    }

    pub fn n_vocab(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn token_bytes(&self, id: TokenId) -> Option<&[u8]> {
        self.id_to_token.get(id as usize).map(|t| t.text.as_slice())
    }

    pub fn token_score(&self, id: TokenId) -> Option<f32> {
        self.id_to_token.get(id as usize).map(|t| t.score)
    }

    /// Text form of a token; lossy when the stored bytes are not valid UTF-8
    /// on their own (byte-fallback pieces of a split multi-byte character).
    pub fn token_to_str(&self, id: TokenId) -> Option<Cow<'_, str>> {
        self.token_bytes(id).map(String::from_utf8_lossy)
    }

    pub fn id_for(&self, bytes: &[u8]) -> Option<TokenId> {
        self.token_to_id.get(bytes).copied()
    }

    /// Tokenize `text`; empty input yields an empty sequence even when
    /// `add_bos` is set.
    pub fn tokenize(&self, text: &str, add_bos: bool) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        if bytes.is_empty() {
            return Vec::new();
        }

        let mut output = Vec::new();
        if add_bos {
            output.push(TOKEN_BOS);
        }

        // One symbol per UTF-8 character, linked both ways.
        let mut symbols: Vec<Symbol> = Vec::new();
        let mut offs = 0;
        while offs < bytes.len() {
            let n = utf8_len(bytes[offs]).min(bytes.len() - offs);
            let index = symbols.len() as isize;
            symbols.push(Symbol {
                start: offs,
                n,
                prev: index - 1,
                next: if offs + n == bytes.len() {
                    -1
                } else {
                    index + 1
                },
            });
            offs += n;
        }

        let mut work_queue = BinaryHeap::new();
        for i in 1..symbols.len() {
            self.try_add_bigram(bytes, &symbols, &mut work_queue, i as isize - 1, i as isize);
        }

        // Keep substituting the highest-scoring pair for as long as we can.
        // Entries may be stale by the time they are popped; the consumed and
        // size checks drop them.
        while let Some(bigram) = work_queue.pop() {
            let left_n = symbols[bigram.left].n;
            let right_n = symbols[bigram.right].n;
            if left_n == 0 || right_n == 0 || left_n + right_n != bigram.size {
                continue;
            }

            // Merge the right symbol into the left one and unlink it.
            symbols[bigram.left].n += right_n;
            symbols[bigram.right].n = 0;
            let next = symbols[bigram.right].next;
            symbols[bigram.left].next = next;
            if next >= 0 {
                symbols[next as usize].prev = bigram.left as isize;
            }

            let prev = symbols[bigram.left].prev;
            self.try_add_bigram(bytes, &symbols, &mut work_queue, prev, bigram.left as isize);
            self.try_add_bigram(bytes, &symbols, &mut work_queue, bigram.left as isize, next);
        }

        let mut i = 0isize;
        while i != -1 {
            let sym = &symbols[i as usize];
            let piece = &bytes[sym.start..sym.start + sym.n];
            match self.token_to_id.get(piece) {
                Some(&id) => output.push(id),
                None => {
                    output.extend(piece.iter().map(|&b| b as u32 + BYTE_FALLBACK_OFFSET));
                }
            }
            i = sym.next;
        }

        output
    }

    fn try_add_bigram(
        &self,
        bytes: &[u8],
        symbols: &[Symbol],
        work_queue: &mut BinaryHeap<Bigram>,
        left: isize,
        right: isize,
    ) {
        if left == -1 || right == -1 {
            return;
        }
        let start = symbols[left as usize].start;
        let size = symbols[left as usize].n + symbols[right as usize].n;
        let piece = &bytes[start..start + size];

        if let Some(&id) = self.token_to_id.get(piece) {
            work_queue.push(Bigram {
                left: left as usize,
                right: right as usize,
                score: self.id_to_token[id as usize].score,
                size,
            });
        }
    }
}

impl std::fmt::Debug for Vocabulary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vocabulary")
            .field("n_vocab", &self.id_to_token.len())
            .finish()
    }
}

/// Byte length of a UTF-8 character from its lead byte.
fn utf8_len(lead: u8) -> usize {
    const LOOKUP: [usize; 16] = [1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 3, 4];
    LOOKUP[(lead >> 4) as usize]
}

struct Symbol {
    start: usize,
    n: usize,
    prev: isize,
    next: isize,
}

struct Bigram {
    left: usize,
    right: usize,
    score: f32,
    size: usize,
}

impl PartialEq for Bigram {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Bigram {}

impl PartialOrd for Bigram {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Bigram {
    // Highest score pops first; on equal scores the leftmost pair wins.
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.left.cmp(&self.left))
    }
}

use std::collections::VecDeque;

/// The number of bytes carried by one data-channel word.
pub const WORD_BYTES: usize = 8;

/// One beat of a data channel. Valid bytes are packed from the start of
/// `data` and flagged in `keep`; `last` marks the final word of a transfer.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Word {
    pub data: [u8; WORD_BYTES],
    pub keep: u8,
    pub last: bool,
}

impl Word {
    /// Creates a word from up to eight bytes.
    pub fn new(bytes: &[u8], last: bool) -> Self {
        debug_assert!(bytes.len() <= WORD_BYTES);
        let len = bytes.len().min(WORD_BYTES);
        let mut data = [0; WORD_BYTES];
        data[..len].copy_from_slice(&bytes[..len]);
        Self {
            data,
            keep: keep_mask(len),
            last,
        }
    }

    /// The number of valid bytes.
    pub fn len(&self) -> usize {
        self.keep.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.keep == 0
    }

    /// The valid bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Word({:02x?}", self.bytes())?;
        if self.last {
            write!(f, ", last")?;
        }
        write!(f, ")")
    }
}

/// A keep mask with the low `len` bits set.
pub fn keep_mask(len: usize) -> u8 {
    match len {
        0 => 0,
        len if len >= WORD_BYTES => 0xff,
        len => (1u8 << len) - 1,
    }
}

/// Splits bytes into a packed word stream with `last` on the final word.
pub fn to_words(bytes: &[u8]) -> Vec<Word> {
    let count = bytes.chunks(WORD_BYTES).len();
    bytes
        .chunks(WORD_BYTES)
        .enumerate()
        .map(|(i, chunk)| Word::new(chunk, i + 1 == count))
        .collect()
}

/// Concatenates the valid bytes of a word stream.
pub fn from_words<'a>(words: impl IntoIterator<Item = &'a Word>) -> Vec<u8> {
    words
        .into_iter()
        .flat_map(|word| word.bytes().iter().copied())
        .collect()
}

/// Re-slices a word stream along byte boundaries that do not line up with
/// the incoming words.
///
/// Bytes of incoming words are staged and handed out again as packed words of
/// whatever size the consumer asks for. A stage never asks for more than one
/// word at a time and pulls a new word only while fewer bytes are staged than
/// requested, so at most two words' worth of bytes are ever held.
#[derive(Debug, Default, Clone)]
pub struct Realigner {
    staged: VecDeque<u8>,
}

impl Realigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of staged bytes.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Stages the valid bytes of `word`.
    pub fn push(&mut self, word: &Word) {
        self.staged.extend(word.bytes().iter().copied());
    }

    /// Takes up to `len` staged bytes as one word.
    pub fn take(&mut self, len: usize, last: bool) -> Word {
        let len = len.min(WORD_BYTES).min(self.staged.len());
        let bytes: Vec<u8> = self.staged.drain(..len).collect();
        Word::new(&bytes, last)
    }

    /// Throws away anything staged.
    pub fn clear(&mut self) {
        self.staged.clear();
    }
}

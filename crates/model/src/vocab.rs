//! Character vocabulary: a fixed bijection between symbols and dense token ids.

use crate::error::{ModelError, Result};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    itos: Vec<char>,
    stoi: HashMap<char, usize>,
}

impl Vocabulary {
    /// Builds a vocabulary where each symbol's id is its position.
    pub fn new(symbols: impl IntoIterator<Item = char>) -> Result<Self> {
        let mut itos = Vec::new();
        let mut stoi = HashMap::new();
        for symbol in symbols {
            if stoi.insert(symbol, itos.len()).is_some() {
                return Err(ModelError::InvalidToken(format!(
                    "duplicate vocabulary symbol {:?}",
                    symbol
                )));
            }
            itos.push(symbol);
        }
        Ok(Self { itos, stoi })
    }

    /// Sorted distinct characters of a training corpus.
    pub fn from_corpus(text: &str) -> Self {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        let stoi = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self { itos: chars, stoi }
    }

    pub fn size(&self) -> usize {
        self.itos.len()
    }

    pub fn symbols(&self) -> &[char] {
        &self.itos
    }

    pub fn encode_symbol(&self, symbol: char) -> Option<usize> {
        self.stoi.get(&symbol).copied()
    }

    pub fn decode_id(&self, id: usize) -> Option<char> {
        self.itos.get(id).copied()
    }

    /// Encodes every character of `text`; unknown characters are an error, the
    /// vocabulary never grows.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.encode_symbol(c).ok_or_else(|| {
                    ModelError::InvalidToken(format!("symbol {:?} is not in the vocabulary", c))
                })
            })
            .collect()
    }

    pub fn decode(&self, ids: &[usize]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                self.decode_id(id).ok_or_else(|| {
                    ModelError::InvalidToken(format!(
                        "id {} outside vocabulary of {}",
                        id,
                        self.size()
                    ))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_every_symbol() {
        let vocab = Vocabulary::from_corpus("make tweets great again #1\n");
        for &symbol in vocab.symbols() {
            let id = vocab.encode_symbol(symbol).unwrap();
            assert!(id < vocab.size());
            assert_eq!(vocab.decode_id(id), Some(symbol));
        }
        let ids = vocab.encode("great").unwrap();
        assert_eq!(vocab.decode(&ids).unwrap(), "great");
    }

    #[test]
    fn corpus_alphabet_is_sorted() {
        let vocab = Vocabulary::from_corpus("cab");
        assert_eq!(vocab.symbols(), &['a', 'b', 'c']);
        assert_eq!(vocab.encode("abc").unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unknown_symbols_are_rejected() {
        let vocab = Vocabulary::new(['a', 'b']).unwrap();
        assert_eq!(vocab.encode("abz").unwrap_err().kind(), "invalid_token");
        assert!(vocab.decode(&[2]).is_err());
    }

    #[test]
    fn duplicate_symbols_are_rejected() {
        assert!(Vocabulary::new(['a', 'a']).is_err());
    }
}

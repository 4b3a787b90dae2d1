//! Byte-prefix dictionary used to classify incoming connections
//!
//! Prefixes map to an arbitrary tag. Matching consumes bytes from a reader
//! one at a time and stops at the first terminal node, so the shortest
//! registered prefix wins and nothing past it is ever read. The consumed
//! bytes are handed back to the caller for replay.

use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A 256-way prefix tree. Immutable once built; safe to share behind a
/// static for unsynchronized concurrent matching.
#[derive(Debug, Default)]
pub struct Trie<T> {
    root: Node<T>,
}

#[derive(Debug)]
struct Node<T> {
    children: HashMap<u8, Node<T>>,
    terminal: Option<T>,
}

impl<T> Default for Node<T> {
    fn default() -> Self {
        Self {
            children: HashMap::new(),
            terminal: None,
        }
    }
}

impl<T: Clone> Trie<T> {
    pub fn new() -> Self {
        Self {
            root: Node::default(),
        }
    }

    /// Register `tag` at the node reached by `prefix`. Inserting the same
    /// prefix twice overwrites the previous tag.
    pub fn put(&mut self, prefix: &[u8], tag: T) {
        let mut node = &mut self.root;
        for &b in prefix {
            node = node.children.entry(b).or_default();
        }
        node.terminal = Some(tag);
    }

    /// Descend the trie while pulling bytes from `r`.
    ///
    /// Returns the matched tag together with every byte read, in order, so
    /// the caller can replay them. `Ok(None)` means the stream diverged from
    /// all registered prefixes; the consumed bytes are still returned.
    /// Reader errors (including EOF before a terminal) propagate.
    pub async fn match_with_reader<R>(&self, r: &mut R) -> io::Result<(Option<T>, Vec<u8>)>
    where
        R: AsyncRead + Unpin,
    {
        let mut consumed = Vec::new();
        let mut node = &self.root;
        loop {
            if let Some(tag) = &node.terminal {
                return Ok((Some(tag.clone()), consumed));
            }
            let mut byte = [0u8; 1];
            let n = r.read(&mut byte).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended before a prefix matched",
                ));
            }
            consumed.push(byte[0]);
            match node.children.get(&byte[0]) {
                Some(child) => node = child,
                None => return Ok((None, consumed)),
            }
        }
    }
}

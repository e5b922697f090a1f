//! Listener tokens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle identifying one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic token source. Tokens are never handed out twice by the same
/// generator.
#[derive(Debug, Default)]
pub struct TokenGenerator {
    last: AtomicU64,
}

impl TokenGenerator {
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> Token {
        Token(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tokens_are_unique_across_threads() {
        let generator = Arc::new(TokenGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let g = Arc::clone(&generator);
                thread::spawn(move || (0..250).map(|_| g.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for token in handle.join().expect("worker panicked") {
                assert!(seen.insert(token), "duplicate token {token}");
            }
        }
        assert_eq!(seen.len(), 1_000);
    }
}

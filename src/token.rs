//! Tokens naming in-flight commands
//!
//! The [`Token`] handed to the peripheral carries the slab key of the
//! command together with the sequence number it was inserted under. A
//! completion that arrives after the key was freed (or reused) carries the
//! wrong sequence number and is detected instead of resolving the wrong
//! command.

use std::fmt;

/// Handle to a command held by a LUN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    slot: u32,
    generation: u32,
}

impl Token {
    pub(crate) fn new(slot: u32, generation: u32) -> Self {
        Token { slot, generation }
    }

    /// Slab key of the command
    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_equality() {
        let token = Token::new(3, 7);
        assert_eq!(token.to_string(), "3.7");
        assert_eq!(token, Token::new(3, 7));
        assert_ne!(token, Token::new(3, 8));
    }
}

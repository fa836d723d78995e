//! Token arithmetic for the tablet ring.
//!
//! Tokens are signed 64-bit values with two synthetic extremes below and
//! above every real token. Tablet boundaries are power-of-two divisions of
//! a monotonic linearisation of the ring, chosen so that splitting a tablet
//! simply shifts one bit: tablet `i` of a `count`-tablet map covers exactly
//! tablets `2i` and `2i+1` of the `2*count`-tablet map.

use serde::{Deserialize, Serialize};

/// A position on the token ring.
///
/// `Minimum` and `Maximum` are synthetic extremes that never identify a key;
/// the first real token is `i64::MIN + 1` and the largest is `i64::MAX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Token {
    /// Sorts before every real token.
    Minimum,
    /// A real ring position.
    Key(i64),
    /// Sorts after every real token.
    Maximum,
}

impl Token {
    /// The first real token on the ring.
    pub fn first() -> Token {
        Token::Key(i64::MIN + 1)
    }

    /// The last real token on the ring.
    pub fn last() -> Token {
        Token::Key(i64::MAX)
    }

    /// The key value, if this is a real token.
    pub fn key(self) -> Option<i64> {
        match self {
            Token::Key(v) => Some(v),
            _ => None,
        }
    }

    /// Collapse to the `i64` used as a catalog clustering key. The synthetic
    /// extremes map onto the unused edges of the key space.
    pub fn catalog_key(self) -> i64 {
        match self {
            Token::Minimum => i64::MIN,
            Token::Key(v) => v,
            Token::Maximum => i64::MAX,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Minimum => write!(f, "minimum"),
            Token::Key(v) => write!(f, "{}", v),
            Token::Maximum => write!(f, "maximum"),
        }
    }
}

/// The immediate successor of a token. The largest real token steps onto
/// the synthetic maximum, which is absorbing.
pub fn next_token(t: Token) -> Token {
    match t {
        Token::Minimum => Token::first(),
        Token::Key(i64::MAX) => Token::Maximum,
        Token::Key(v) => Token::Key(v + 1),
        Token::Maximum => Token::Maximum,
    }
}

/// Which half of a tablet's range a token falls into, relative to a
/// prospective split of that tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RangeSide {
    /// Lower half after a prospective split.
    Left,
    /// Upper half after a prospective split.
    Right,
}

/// Inclusive range of real tokens owned by one tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    /// First token of the range.
    pub first: Token,
    /// Last token of the range.
    pub last: Token,
}

impl TokenRange {
    /// Whether the range contains a token.
    pub fn contains(&self, t: Token) -> bool {
        t >= self.first && t <= self.last
    }
}

impl std::fmt::Display for TokenRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.first, self.last)
    }
}

// Maps the signed ring onto u64 so that unsigned order equals ring order
// and power-of-two prefixes align with tablet boundaries.
fn linearize(v: i64) -> u64 {
    (v as u64) ^ (1 << 63)
}

fn delinearize(u: u64) -> i64 {
    (u ^ (1 << 63)) as i64
}

/// Index of the tablet owning `t` in a map of `1 << log2` tablets.
pub fn tablet_index(log2: u32, t: Token) -> u64 {
    debug_assert!(log2 < 64);
    match t {
        Token::Minimum => 0,
        Token::Maximum => (1u64 << log2) - 1,
        Token::Key(v) => {
            if log2 == 0 {
                0
            } else {
                linearize(v) >> (64 - log2)
            }
        }
    }
}

/// Index of the owning tablet plus the side of its range the token falls
/// into after a prospective split.
pub fn tablet_index_and_side(log2: u32, t: Token) -> (u64, RangeSide) {
    let index = tablet_index(log2, t);
    let side = match t {
        Token::Minimum => RangeSide::Left,
        Token::Maximum => RangeSide::Right,
        Token::Key(v) => {
            if (linearize(v) >> (63 - log2)) & 1 == 0 {
                RangeSide::Left
            } else {
                RangeSide::Right
            }
        }
    };
    (index, side)
}

/// First token of tablet `index` in a map of `1 << log2` tablets.
pub fn first_token(log2: u32, index: u64) -> Token {
    debug_assert!(log2 < 64 && index < (1u64 << log2));
    if index == 0 {
        Token::first()
    } else {
        Token::Key(delinearize(index << (64 - log2)))
    }
}

/// Last token of tablet `index` in a map of `1 << log2` tablets.
pub fn last_token(log2: u32, index: u64) -> Token {
    debug_assert!(log2 < 64 && index < (1u64 << log2));
    if log2 == 0 {
        return Token::last();
    }
    let shift = 64 - log2;
    // The last tablet's upper bound shifts past bit 63; the wrap-around
    // yields exactly u64::MAX.
    let upper = (index + 1).wrapping_shl(shift).wrapping_sub(1);
    Token::Key(delinearize(upper))
}

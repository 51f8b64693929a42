//! Layout tag catalog.
//!
//! A tag names a canonical physical arrangement using the conventional
//! letter notation: each letter is a logical axis (`a` is axis 0), the order
//! of the letters is the outer order from outermost to innermost, an
//! uppercase letter marks a blocked axis, and the trailing `<size><letter>`
//! groups list the inner blocks from outermost to innermost.
//!
//! | tag           | rank | meaning                                        |
//! |---------------|------|------------------------------------------------|
//! | `abx`         | any  | plain row-major                                |
//! | `axb`         | any  | channels-last (`b` innermost)                  |
//! | `acdb`        | 4    | plain, `b` innermost                           |
//! | `aBcd16b`     | 4    | `b` split into blocks of 16                    |
//! | `ABcd4b16a4b` | 4    | `a` blocked by 16, `b` by 4·4 around it        |
//!
//! `any` and `undef` are selectors, not arrangements; they are not part of
//! [`LayoutTag::CATALOG`] and never realize.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

/// Highest rank a descriptor may have.
pub const MAX_RANK: usize = 6;

macro_rules! layout_tags {
    ($($tag:ident),* $(,)?) => {
        /// Symbolic selector for a canonical physical memory arrangement.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum LayoutTag {
            /// Unset.
            undef,
            /// Implementation chooses.
            any,
            /// Plain row-major at every rank.
            abx,
            /// Plain channels-last at every rank.
            axb,
            $($tag),*
        }

        impl LayoutTag {
            /// Every tag that names a physical arrangement, in catalog order.
            pub const CATALOG: &'static [LayoutTag] = &[
                LayoutTag::abx,
                LayoutTag::axb,
                $(LayoutTag::$tag),*
            ];

            pub const fn name(self) -> &'static str {
                match self {
                    LayoutTag::undef => "undef",
                    LayoutTag::any => "any",
                    LayoutTag::abx => "abx",
                    LayoutTag::axb => "axb",
                    $(LayoutTag::$tag => stringify!($tag)),*
                }
            }
        }
    };
}

layout_tags! {
    // plain
    a,
    ab, ba,
    abc, acb, bac, bca, cba,
    abcd, abdc, acdb, bacd, bcda, cdba,
    abcde, acdeb, bacde, bcdea, cdeba,
    abcdef, acbdef, defcab,
    // blocked
    Ab16a, AB16b16a, AB4b16a4b,
    aBc4b, aBc8b, aBc16b, Acb16a, ABc16a16b, ABc4b16a4b,
    aBcd4b, aBcd8b, aBcd16b, Acdb16a, ABcd8a8b, ABcd16a16b, ABcd16b16a, ABcd4b16a4b, aBCd16b16c,
    aBcde8b, aBcde16b, ABcde16a16b, ABcde4b16a4b, aBCde16b16c, aBCde4c16b4c,
    aBcdef16b, aBCdef16b16c, aBCdef4c16b4c,
}

/// Axis order and inner blocks decoded from a tag at a concrete rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagLayout {
    /// Logical axes from outermost to innermost.
    pub order: Vec<usize>,
    /// `(axis, size)` inner blocks from outermost to innermost.
    pub blocks: Vec<(usize, usize)>,
}

impl TagLayout {
    pub fn rank(&self) -> usize {
        self.order.len()
    }

    pub fn is_plain(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Parses the letter notation. Letters past the axis prefix close a block.
    fn parse(pattern: &str) -> Self {
        let prefix_len = pattern
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(pattern.len());
        let (axes, tail) = pattern.split_at(prefix_len);

        let order = axes
            .bytes()
            .map(|b| (b.to_ascii_lowercase() - b'a') as usize)
            .collect();

        let mut blocks = Vec::new();
        let mut size = 0usize;
        for b in tail.bytes() {
            if b.is_ascii_digit() {
                size = size * 10 + (b - b'0') as usize;
            } else {
                blocks.push(((b.to_ascii_lowercase() - b'a') as usize, size));
                size = 0;
            }
        }

        Self { order, blocks }
    }
}

impl LayoutTag {
    /// Returns `true` for the selectors `any` and `undef`.
    pub const fn is_selector(self) -> bool {
        matches!(self, LayoutTag::any | LayoutTag::undef)
    }

    /// Returns `true` for tags that realize at every rank.
    pub const fn is_rank_generic(self) -> bool {
        matches!(self, LayoutTag::abx | LayoutTag::axb)
    }

    /// The only rank a fixed tag realizes at. `None` for rank-generic tags
    /// and selectors.
    pub fn rank(self) -> Option<usize> {
        if self.is_selector() || self.is_rank_generic() {
            return None;
        }
        Some(TagLayout::parse(self.name()).rank())
    }

    /// Returns `true` if the tag carries inner blocks at any rank.
    pub fn is_blocked(self) -> bool {
        !self.is_selector()
            && !self.is_rank_generic()
            && !TagLayout::parse(self.name()).is_plain()
    }

    /// Decodes the tag at `rank`. `None` when the tag does not realize there.
    ///
    /// # Example
    /// ```
    /// use memlayout::LayoutTag;
    ///
    /// let layout = LayoutTag::aBcd16b.layout(4).unwrap();
    /// assert_eq!(layout.order, vec![0, 1, 2, 3]);
    /// assert_eq!(layout.blocks, vec![(1, 16)]);
    /// assert!(LayoutTag::aBcd16b.layout(3).is_none());
    /// assert_eq!(LayoutTag::axb.layout(4).unwrap().order, vec![0, 2, 3, 1]);
    /// ```
    pub fn layout(self, rank: usize) -> Option<TagLayout> {
        if rank == 0 || rank > MAX_RANK {
            return None;
        }
        match self {
            LayoutTag::undef | LayoutTag::any => None,
            LayoutTag::abx => Some(TagLayout {
                order: (0..rank).collect(),
                blocks: Vec::new(),
            }),
            LayoutTag::axb => {
                let order = if rank == 1 {
                    vec![0]
                } else {
                    core::iter::once(0).chain(2..rank).chain(core::iter::once(1)).collect()
                };
                Some(TagLayout {
                    order,
                    blocks: Vec::new(),
                })
            }
            fixed => {
                let layout = TagLayout::parse(fixed.name());
                (layout.rank() == rank).then_some(layout)
            }
        }
    }
}

impl fmt::Display for LayoutTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LayoutTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "undef" => Ok(LayoutTag::undef),
            "any" => Ok(LayoutTag::any),
            _ => LayoutTag::CATALOG
                .iter()
                .copied()
                .find(|tag| tag.name() == s)
                .ok_or_else(|| Error::Config(format!("unknown layout tag `{s}`"))),
        }
    }
}

impl Serialize for LayoutTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for LayoutTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

//! In-process implementations of the session store's collaborator
//! contracts: the display-name generator and the avatar factory.

use std::collections::HashSet;

use okeproto::AvatarDescriptor;
use okesession::{AvatarFactory, NameGenerator};
use rand::seq::IndexedRandom;
use rand::Rng;

const ADJECTIVES: &[&str] = &[
    "Brave", "Velvet", "Golden", "Midnight", "Electric", "Smooth", "Cosmic", "Neon", "Mellow",
    "Wild", "Silver", "Funky", "Lucky", "Dizzy", "Roaring", "Gentle",
];

const NOUNS: &[&str] = &[
    "Nightingale", "Crooner", "Maestro", "Siren", "Troubadour", "Baritone", "Soprano", "Rockstar",
    "Diva", "Busker", "Falsetto", "Virtuoso", "Minstrel", "Yodeler", "Chanteuse", "Tenor",
];

/// Word-list display-name generator ("Velvet Crooner", "Neon Diva 2", …).
pub struct WordListNames;

impl NameGenerator for WordListNames {
    fn generate_unique(&self, existing: &HashSet<String>) -> String {
        let mut rng = rand::rng();

        for _ in 0..64 {
            let adjective = ADJECTIVES.choose(&mut rng).unwrap();
            let noun = NOUNS.choose(&mut rng).unwrap();
            let candidate = format!("{adjective} {noun}");
            if !existing.contains(&candidate) {
                return candidate;
            }
        }

        // The word lists are exhausted in a very full room; fall back to a
        // numbered name, still unique among the known ones.
        let mut n = 2;
        loop {
            let candidate = format!("Singer {n}");
            if !existing.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

const AVATAR_GLYPHS: &[&str] = &[
    "mic", "headphones", "vinyl", "star", "notes", "cassette", "speaker", "disco",
];

/// Random avatar factory: a glyph plus a small random palette.
pub struct RandomAvatars;

impl AvatarFactory for RandomAvatars {
    fn new_random_with_colors(&self) -> AvatarDescriptor {
        let mut rng = rand::rng();
        let glyph = AVATAR_GLYPHS.choose(&mut rng).unwrap();

        let colors = (0..3)
            .map(|_| format!("#{:06x}", rng.random_range(0..0x100_0000u32)))
            .collect();

        AvatarDescriptor {
            id: format!("avatar-{glyph}"),
            colors,
        }
    }
}

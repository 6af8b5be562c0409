//! Bus identities: the great-hall token and orc names.

use rand::seq::SliceRandom;
use rand::RngCore;
use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
    "angry", "brutal", "cunning", "dark", "feral", "grim", "hungry", "iron", "mad", "rotten",
    "savage", "sly", "stinking", "vile", "wild",
];

const NAMES: &[&str] = &[
    "azog", "bolg", "gorbag", "grishnakh", "lugdush", "mauhur", "muzgash", "radbug", "shagrat",
    "snaga", "ufthak", "ugluk",
];

/// Generate a fresh great-hall token (32 random bytes, hex encoded).
pub fn generate_great_hall() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random orc name such as `grim-shagrat-4f1c`.
pub fn generate_orc_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("nameless");
    let name = NAMES.choose(&mut rng).copied().unwrap_or("orc");
    let mut suffix = [0u8; 2];
    rng.fill_bytes(&mut suffix);
    format!("{}-{}-{}", adjective, name, hex::encode(suffix))
}

/// Identity a bus stamps on the messages it forwards.
pub fn generate_router_id() -> String {
    Uuid::new_v4().to_string()
}

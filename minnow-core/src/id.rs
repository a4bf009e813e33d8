//! Identifier generation and ordering.

use std::cmp::Ordering;

/// Prefix of message correlation ids.
pub const MSG_PREFIX: &str = "MSGID_";
/// Prefix of tunnel ids.
pub const TUNNEL_PREFIX: &str = "TUNNEL_";

/// Generate a random id of the form `<prefix>xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx`.
pub fn gen_uuid(prefix: &str) -> String {
    let mut bits: u128 = rand::random();
    // Version 4, RFC 4122 variant.
    bits = (bits & !(0xf_u128 << 76)) | (0x4_u128 << 76);
    bits = (bits & !(0x3_u128 << 62)) | (0x2_u128 << 62);
    let hex = format!("{:032x}", bits);
    format!(
        "{}{}-{}-{}-{}-{}",
        prefix,
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Total order used to pick a winner when two runtimes create the same
/// tunnel concurrently.
///
/// Longer ids rank higher; ids of equal length compare bytewise. Both sides
/// evaluate the same order, so they converge on the same id.
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    a.len()
        .cmp(&b.len())
        .then_with(|| a.as_bytes().cmp(b.as_bytes()))
}

/// Whether `a` wins over `b` under [`compare_ids`].
pub fn uuid_is_higher(a: &str, b: &str) -> bool {
    compare_ids(a, b) == Ordering::Greater
}

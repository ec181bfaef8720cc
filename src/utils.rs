//! Identifier helpers for trades, users and rooms

use bech32::Bech32m;
use uuid7::uuid7;

/// Bytes of the slug digest kept in the room slug.
const SLUG_BYTES: usize = 20;

// construct a unique id then encode using bech32m
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Opaque public identifier for a trade room.
///
/// uuid7 values are time ordered, so the slug is taken from a digest of a fresh
/// uuid7 instead. Two rooms created back to back share no visible prefix and the
/// slug cannot be derived from the internal trade id.
pub fn new_room_slug() -> anyhow::Result<String> {
    let digest = hex::decode(sha256::digest(&uuid7().as_bytes().to_vec()))?;
    let hrp = bech32::Hrp::parse("room")?;
    let encode = bech32::encode::<Bech32m>(hrp, &digest[..SLUG_BYTES])?;
    Ok(encode)
}

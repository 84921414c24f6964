use k9::assert_equal;
use natrelay_proto::keys::KeyError;
use natrelay_proto::{Keypair, PublicKey};

#[test]
fn same_seed_same_key() {
    let a = Keypair::from_seed(b"workstation-7").public_key();
    let b = Keypair::from_seed(b"workstation-7").public_key();
    assert_equal!(a, b);
}

#[test]
fn different_seeds_differ() {
    let a = Keypair::from_seed(b"seed-a").public_key();
    let b = Keypair::from_seed(b"seed-b").public_key();
    assert_ne!(a, b);
}

#[test]
fn public_key_hex_roundtrip() {
    let key = Keypair::generate().public_key();
    let hex = key.to_hex();
    assert_equal!(hex.len(), 64);
    assert_equal!(hex.parse::<PublicKey>().unwrap(), key);
    assert_equal!(key.to_string(), hex);
}

#[test]
fn public_key_rejects_bad_input() {
    assert_equal!(
        PublicKey::from_hex("abcd"),
        Err(KeyError::InvalidLength(2))
    );
    assert!(matches!(
        PublicKey::from_hex("zz"),
        Err(KeyError::InvalidHex(_))
    ));
}

#[test]
fn public_key_serializes_as_hex() {
    let key = Keypair::from_seed(b"seed").public_key();
    assert_equal!(
        serde_json::to_value(key).unwrap(),
        serde_json::Value::String(key.to_hex())
    );
}

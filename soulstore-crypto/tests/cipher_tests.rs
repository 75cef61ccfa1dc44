use soulstore_crypto::cipher::{
    decrypt, decrypt_string, encrypt, encrypt_deterministic, encrypt_string, NONCE_SIZE, TAG_SIZE,
};
use soulstore_crypto::{generate_random_key, EncryptedData};

#[test]
fn encrypt_decrypt_roundtrip() {
    let key = generate_random_key();
    let sealed = encrypt(&key, b"hello").unwrap();
    assert_eq!(sealed.ciphertext.len(), 5 + TAG_SIZE);
    assert_eq!(decrypt(&key, &sealed).unwrap(), b"hello");
}

#[test]
fn random_nonces_differ() {
    let key = generate_random_key();
    let a = encrypt(&key, b"same").unwrap();
    let b = encrypt(&key, b"same").unwrap();
    assert_ne!(a.nonce, b.nonce);
}

#[test]
fn deterministic_mode_is_stable_per_key() {
    let key = generate_random_key();
    let a = encrypt_deterministic(&key, b"name").unwrap();
    let b = encrypt_deterministic(&key, b"name").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, encrypt_deterministic(&key, b"other").unwrap());

    let other_key = generate_random_key();
    assert_ne!(a, encrypt_deterministic(&other_key, b"name").unwrap());
    assert_eq!(decrypt(&key, &a).unwrap(), b"name");
}

#[test]
fn wrong_key_fails() {
    let sealed = encrypt(&generate_random_key(), b"secret").unwrap();
    assert!(decrypt(&generate_random_key(), &sealed).is_err());
}

#[test]
fn base64_and_key_string_roundtrip() {
    let key = generate_random_key();
    let sealed = encrypt(&key, b"payload").unwrap();
    assert_eq!(EncryptedData::from_base64(&sealed.to_base64()).unwrap(), sealed);

    let as_key = sealed.to_key_string();
    assert!(!as_key.contains('/') && !as_key.contains('+') && !as_key.contains('='));
    assert_eq!(EncryptedData::from_key_string(&as_key).unwrap(), sealed);
}

#[test]
fn too_short_data_is_rejected() {
    let short = vec![0u8; NONCE_SIZE + TAG_SIZE - 1];
    use base64::{engine::general_purpose::STANDARD, Engine};
    assert!(EncryptedData::from_base64(&STANDARD.encode(short)).is_err());
}

#[test]
fn string_helpers_roundtrip() {
    let key = generate_random_key();
    let sealed = encrypt_string(&key, "héllo").unwrap();
    assert_eq!(decrypt_string(&key, &sealed).unwrap(), "héllo");
}

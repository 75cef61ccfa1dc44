use soulstore_crypto::{
    EntityKey, EnvelopeCipher, KdfParams, MasterKeyCipher, PassthroughCipher, Salt,
};

fn master() -> MasterKeyCipher {
    MasterKeyCipher::from_password("correct horse", Salt::from_bytes([3; 16]), &KdfParams::insecure_fast())
        .unwrap()
}

#[test]
fn passthrough_leaves_payload_untouched() {
    let cipher = PassthroughCipher;
    assert!(!cipher.is_encrypting());
    assert_eq!(cipher.encrypt("S1", b"plain").unwrap(), b"plain");
    assert_eq!(cipher.decrypt("S1", b"plain").unwrap(), b"plain");
}

#[test]
fn master_cipher_roundtrip_and_hides_payload() {
    let cipher = master();
    assert!(cipher.is_encrypting());
    let sealed = cipher.encrypt("S1", b"{\"name\":\"Ada\"}").unwrap();
    assert!(!String::from_utf8_lossy(&sealed).contains("Ada"));
    assert_eq!(cipher.decrypt("S1", &sealed).unwrap(), b"{\"name\":\"Ada\"}");
}

#[test]
fn wrapped_keys_roundtrip_through_both_ciphers() {
    let key = EntityKey::generate();
    for cipher in [&PassthroughCipher as &dyn EnvelopeCipher, &master()] {
        let wrapped = cipher.wrap_key(&key).unwrap();
        let back = cipher.unwrap_key(&wrapped).unwrap();
        assert_eq!(back.key().as_bytes(), key.key().as_bytes());
    }
}

#[test]
fn master_wrapped_key_records_salt_and_nonce() {
    let cipher = master();
    let wrapped = cipher.wrap_key(&EntityKey::generate()).unwrap();
    assert_eq!(wrapped.s, Salt::from_bytes([3; 16]).to_base64());
    assert!(!wrapped.iv.is_empty());
}

#[test]
fn wrong_master_cannot_unwrap() {
    let wrapped = master().wrap_key(&EntityKey::generate()).unwrap();
    let other = MasterKeyCipher::from_password("wrong", Salt::from_bytes([3; 16]), &KdfParams::insecure_fast())
        .unwrap();
    assert!(other.unwrap_key(&wrapped).is_err());
}

#[test]
fn entity_key_encrypts_names_stably() {
    let key = EntityKey::generate();
    let a = key.encrypt_name("secretField").unwrap();
    assert_eq!(a, key.encrypt_name("secretField").unwrap());
    assert!(!a.contains("secret"));
    assert_eq!(key.decrypt_name(&a).unwrap(), "secretField");
    assert!(EntityKey::generate().decrypt_name(&a).is_err());
}

//! CMS enveloped-data unwrap for `CiphertextForRecipient` blobs.
//!
//! KMS wraps the recipient-encrypted payload as ASN.1 enveloped-data with one
//! RSA-OAEP-SHA256 key-transport recipient and AES-256-CBC content
//! encryption. The framing KMS emits uses BER indefinite lengths, which the
//! strict DER decoders reject, so the walker here accepts both definite and
//! indefinite lengths and locates the matching end-of-contents markers
//! structurally.
//!
//! Nothing in this module ever puts key or plaintext material into an error.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use der::asn1::ObjectIdentifier;
use rsa::{Oaep, RsaPrivateKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const OID_ENVELOPED_DATA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.3");
pub const OID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
pub const OID_RSAES_OAEP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.7");
pub const OID_AES256_CBC: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_CTX0_PRIMITIVE: u8 = 0x80;
const TAG_CTX0_CONSTRUCTED: u8 = 0xa0;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Decode(&'static str),
    #[error("unsupported envelope algorithm")]
    UnsupportedAlgorithm,
    #[error("envelope decryption failed")]
    Decrypt,
}

/// One tag-length-value unit. For indefinite-length values `content` spans
/// everything up to (but not including) the end-of-contents marker.
struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
}

fn read_tlv<'a>(data: &'a [u8], pos: &mut usize) -> Result<Tlv<'a>, EnvelopeError> {
    let tag = *data.get(*pos).ok_or(EnvelopeError::Decode("truncated tag"))?;
    *pos += 1;
    let first = *data
        .get(*pos)
        .ok_or(EnvelopeError::Decode("truncated length"))?;
    *pos += 1;

    if first == 0x80 {
        // Indefinite length: walk child TLVs until the EOC at this level.
        if tag & 0x20 == 0 {
            return Err(EnvelopeError::Decode("indefinite length on primitive"));
        }
        let start = *pos;
        loop {
            let next = data
                .get(*pos..*pos + 2)
                .ok_or(EnvelopeError::Decode("unterminated indefinite value"))?;
            if next == [0x00, 0x00] {
                let content = &data[start..*pos];
                *pos += 2;
                return Ok(Tlv { tag, content });
            }
            read_tlv(data, pos)?;
        }
    }

    let len = if first & 0x80 == 0 {
        first as usize
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return Err(EnvelopeError::Decode("unsupported length encoding"));
        }
        let bytes = data
            .get(*pos..*pos + n)
            .ok_or(EnvelopeError::Decode("truncated length"))?;
        *pos += n;
        bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
    };

    let content = data
        .get(*pos..*pos + len)
        .ok_or(EnvelopeError::Decode("truncated value"))?;
    *pos += len;
    Ok(Tlv { tag, content })
}

fn expect_tag<'a>(
    data: &'a [u8],
    pos: &mut usize,
    tag: u8,
    what: &'static str,
) -> Result<&'a [u8], EnvelopeError> {
    let tlv = read_tlv(data, pos)?;
    if tlv.tag != tag {
        return Err(EnvelopeError::Decode(what));
    }
    Ok(tlv.content)
}

fn expect_oid(
    data: &[u8],
    pos: &mut usize,
    oid: ObjectIdentifier,
    what: &'static str,
) -> Result<(), EnvelopeError> {
    let content = expect_tag(data, pos, TAG_OID, what)?;
    if content != oid.as_bytes() {
        return Err(EnvelopeError::Decode(what));
    }
    Ok(())
}

struct Envelope<'a> {
    encrypted_key: &'a [u8],
    iv: &'a [u8],
    ciphertext: Vec<u8>,
}

fn parse(data: &[u8]) -> Result<Envelope<'_>, EnvelopeError> {
    let mut pos = 0;
    let content_info = expect_tag(data, &mut pos, TAG_SEQUENCE, "ContentInfo")?;

    let mut pos = 0;
    expect_oid(
        content_info,
        &mut pos,
        OID_ENVELOPED_DATA,
        "enveloped-data content type",
    )?;
    let wrapped = expect_tag(
        content_info,
        &mut pos,
        TAG_CTX0_CONSTRUCTED,
        "ContentInfo content",
    )?;

    let mut pos = 0;
    let enveloped = expect_tag(wrapped, &mut pos, TAG_SEQUENCE, "EnvelopedData")?;

    let mut pos = 0;
    expect_tag(enveloped, &mut pos, TAG_INTEGER, "EnvelopedData version")?;
    let recipients = expect_tag(enveloped, &mut pos, TAG_SET, "recipientInfos")?;

    // One KeyTransRecipientInfo; extra recipients are ignored.
    let mut rpos = 0;
    let ktri = expect_tag(recipients, &mut rpos, TAG_SEQUENCE, "KeyTransRecipientInfo")?;
    let mut kpos = 0;
    expect_tag(ktri, &mut kpos, TAG_INTEGER, "recipient version")?;
    // RecipientIdentifier: IssuerAndSerialNumber or [0] SubjectKeyIdentifier;
    // either way it does not select anything here.
    read_tlv(ktri, &mut kpos)?;
    let key_alg = expect_tag(ktri, &mut kpos, TAG_SEQUENCE, "keyEncryptionAlgorithm")?;
    let mut apos = 0;
    let alg_oid = expect_tag(key_alg, &mut apos, TAG_OID, "key algorithm oid")?;
    if alg_oid != OID_RSAES_OAEP.as_bytes() {
        return Err(EnvelopeError::UnsupportedAlgorithm);
    }
    let encrypted_key = expect_tag(ktri, &mut kpos, TAG_OCTET_STRING, "encryptedKey")?;

    let eci = expect_tag(enveloped, &mut pos, TAG_SEQUENCE, "EncryptedContentInfo")?;
    let mut epos = 0;
    expect_oid(eci, &mut epos, OID_DATA, "content type")?;
    let content_alg = expect_tag(eci, &mut epos, TAG_SEQUENCE, "contentEncryptionAlgorithm")?;
    let mut apos = 0;
    let alg_oid = expect_tag(content_alg, &mut apos, TAG_OID, "content algorithm oid")?;
    if alg_oid != OID_AES256_CBC.as_bytes() {
        return Err(EnvelopeError::UnsupportedAlgorithm);
    }
    let iv = expect_tag(content_alg, &mut apos, TAG_OCTET_STRING, "cbc iv")?;
    if iv.len() != 16 {
        return Err(EnvelopeError::Decode("cbc iv"));
    }

    // [0] IMPLICIT encryptedContent: either a primitive span or a
    // constructed series of OCTET STRING chunks.
    let content = read_tlv(eci, &mut epos)?;
    let ciphertext = match content.tag {
        TAG_CTX0_PRIMITIVE => content.content.to_vec(),
        TAG_CTX0_CONSTRUCTED => {
            let mut chunks = Vec::new();
            let mut cpos = 0;
            while cpos < content.content.len() {
                let chunk =
                    expect_tag(content.content, &mut cpos, TAG_OCTET_STRING, "content chunk")?;
                chunks.extend_from_slice(chunk);
            }
            chunks
        }
        _ => return Err(EnvelopeError::Decode("encryptedContent")),
    };

    Ok(Envelope {
        encrypted_key,
        iv,
        ciphertext,
    })
}

/// Unwrap one enveloped-data blob: RSA-OAEP-SHA256 the content key with
/// `private_key`, then AES-256-CBC decrypt the payload and strip PKCS#7
/// padding.
pub fn unwrap_enveloped_data(
    data: &[u8],
    private_key: &RsaPrivateKey,
) -> Result<Vec<u8>, EnvelopeError> {
    let envelope = parse(data)?;

    let cek = Zeroizing::new(
        private_key
            .decrypt(Oaep::new::<Sha256>(), envelope.encrypted_key)
            .map_err(|_| EnvelopeError::Decrypt)?,
    );
    if cek.len() != 32 {
        return Err(EnvelopeError::Decrypt);
    }

    Aes256CbcDec::new_from_slices(&cek, envelope.iv)
        .map_err(|_| EnvelopeError::Decrypt)?
        .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
        .map_err(|_| EnvelopeError::Decrypt)
}

/// Test-support encoder producing the blobs KMS would return. Lives here so
/// both the unit tests and the stubbed-upstream integration tests can build
/// recipient ciphertexts.
pub mod testenc {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use rsa::RsaPublicKey;

    type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

    /// Outer framing of the produced blob.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Framing {
        /// Definite lengths throughout.
        Der,
        /// Indefinite lengths on the constructed nodes, the way KMS encodes.
        IndefiniteBer,
    }

    fn definite(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        let len = content.len();
        if len < 0x80 {
            out.push(len as u8);
        } else {
            let bytes = len.to_be_bytes();
            let skip = bytes.iter().take_while(|b| **b == 0).count();
            out.push(0x80 | (bytes.len() - skip) as u8);
            out.extend_from_slice(&bytes[skip..]);
        }
        out.extend_from_slice(content);
        out
    }

    fn indefinite(tag: u8, content: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0x80];
        out.extend_from_slice(content);
        out.extend_from_slice(&[0x00, 0x00]);
        out
    }

    fn constructed(framing: Framing, tag: u8, content: &[u8]) -> Vec<u8> {
        match framing {
            Framing::Der => definite(tag, content),
            Framing::IndefiniteBer => indefinite(tag, content),
        }
    }

    fn oid(value: ObjectIdentifier) -> Vec<u8> {
        definite(TAG_OID, value.as_bytes())
    }

    /// Encrypt `plaintext` under a fresh CBC pass with `cek`/`iv`, wrap `cek`
    /// to `recipient`, and emit the enveloped-data blob.
    pub fn encode_enveloped_data(
        recipient: &RsaPublicKey,
        cek: &[u8; 32],
        iv: &[u8; 16],
        plaintext: &[u8],
        framing: Framing,
    ) -> Vec<u8> {
        let ciphertext = Aes256CbcEnc::new(cek.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut rng = rsa::rand_core::OsRng;
        let encrypted_key = recipient
            .encrypt(&mut rng, Oaep::new::<Sha256>(), cek)
            .expect("RSA-OAEP wrap");

        // KeyTransRecipientInfo with a [0] SubjectKeyIdentifier rid.
        let mut ktri = Vec::new();
        ktri.extend_from_slice(&definite(TAG_INTEGER, &[2]));
        ktri.extend_from_slice(&definite(TAG_CTX0_PRIMITIVE, &[0u8; 20]));
        let mut key_alg = oid(OID_RSAES_OAEP);
        key_alg.extend_from_slice(&definite(TAG_SEQUENCE, &[]));
        ktri.extend_from_slice(&definite(TAG_SEQUENCE, &key_alg));
        ktri.extend_from_slice(&definite(TAG_OCTET_STRING, &encrypted_key));
        let recipients = definite(TAG_SET, &definite(TAG_SEQUENCE, &ktri));

        let mut content_alg = oid(OID_AES256_CBC);
        content_alg.extend_from_slice(&definite(TAG_OCTET_STRING, iv));
        let mut eci = oid(OID_DATA);
        eci.extend_from_slice(&definite(TAG_SEQUENCE, &content_alg));
        match framing {
            Framing::Der => {
                eci.extend_from_slice(&definite(TAG_CTX0_PRIMITIVE, &ciphertext));
            }
            Framing::IndefiniteBer => {
                // Constructed, chunked OCTET STRINGs.
                let chunk = definite(TAG_OCTET_STRING, &ciphertext);
                eci.extend_from_slice(&indefinite(TAG_CTX0_CONSTRUCTED, &chunk));
            }
        }

        let mut enveloped = definite(TAG_INTEGER, &[2]);
        enveloped.extend_from_slice(&recipients);
        enveloped.extend_from_slice(&constructed(framing, TAG_SEQUENCE, &eci));

        let mut content_info = oid(OID_ENVELOPED_DATA);
        content_info.extend_from_slice(&constructed(
            framing,
            TAG_CTX0_CONSTRUCTED,
            &constructed(framing, TAG_SEQUENCE, &enveloped),
        ));
        constructed(framing, TAG_SEQUENCE, &content_info)
    }
}

#[cfg(test)]
mod tests {
    use super::testenc::{encode_enveloped_data, Framing};
    use super::*;
    use rand::RngCore;
    use rsa::{RsaPrivateKey, RsaPublicKey};

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let private = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn roundtrip_der_and_ber() {
        let (private, public) = keypair();
        let mut cek = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut cek);
        rand::thread_rng().fill_bytes(&mut iv);

        for framing in [Framing::Der, Framing::IndefiniteBer] {
            for len in [16usize, 32, 256, 4096] {
                let mut plaintext = vec![0u8; len];
                rand::thread_rng().fill_bytes(&mut plaintext);
                let blob = encode_enveloped_data(&public, &cek, &iv, &plaintext, framing);
                let out = unwrap_enveloped_data(&blob, &private).unwrap();
                assert_eq!(out, plaintext, "{framing:?} len {len}");
            }
        }
    }

    #[test]
    fn wrong_key_fails_without_leaking() {
        let (_, public) = keypair();
        let (other_private, _) = keypair();
        let blob = encode_enveloped_data(&public, &[7u8; 32], &[9u8; 16], b"sixteen byte msg", Framing::Der);
        let err = unwrap_enveloped_data(&blob, &other_private).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decrypt));
        assert!(!format!("{err}").contains("sixteen"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let (private, _) = keypair();
        assert!(matches!(
            unwrap_enveloped_data(b"not asn1", &private),
            Err(EnvelopeError::Decode(_))
        ));
        assert!(matches!(
            unwrap_enveloped_data(&[0x30, 0x80, 0x06], &private),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn non_oaep_recipient_is_unsupported() {
        let (private, public) = keypair();
        let mut blob = encode_enveloped_data(&public, &[1u8; 32], &[2u8; 16], &[0u8; 16], Framing::Der);
        // Swap the RSAES-OAEP oid (…01.01.07) for rsaEncryption (…01.01.01).
        let oaep = OID_RSAES_OAEP.as_bytes();
        let at = blob
            .windows(oaep.len())
            .position(|w| w == oaep)
            .unwrap();
        blob[at + oaep.len() - 1] = 0x01;
        assert!(matches!(
            unwrap_enveloped_data(&blob, &private),
            Err(EnvelopeError::UnsupportedAlgorithm)
        ));
    }
}

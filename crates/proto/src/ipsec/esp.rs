//! ESP (Encapsulating Security Payload) Protocol
//!
//! Implements RFC 4303 - IP Encapsulating Security Payload (ESP) for the
//! block ciphers of the transform registry.
//!
//! # ESP Packet Format (RFC 4303)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |               Security Parameters Index (SPI)                 | ^Auth
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |                      Sequence Number                          | |erage
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |
//! |                    IV (cipher block, CBC only)                | |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ | ----
//! |                    Payload Data (variable)                    | |  ^
//! ~                                                               ~ |  |
//! |                                                               | |Conf.
//! +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |Cov-
//! |               |     Padding (0-255 bytes)                     | |erage
//! +-+-+-+-+-+-+-+-+               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ |  |
//! |                               |  Pad Length   | Next Header   | v  v
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+ ----
//! |         Integrity Check Value-ICV   (variable)                |
//! ~                                                               ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # Padding and IV
//!
//! The encrypted part is aligned to lcm(block size, 8); filler bytes are
//! 1, 2, 3, ... The IV of the first record of an SA is random; every later
//! record chains from the last ciphertext block of the previous one.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use kestrel_proto::ipsec::esp::EspPacket;
//!
//! let esp = EspPacket::encapsulate(&sa, payload, proto::UDP)?;
//! let bytes = esp.to_bytes();
//!
//! let esp = EspPacket::from_bytes(&bytes, iv_len, icv_len)?;
//! let (payload, next_header) = esp.decapsulate(&sa, true)?;
//! ```

use crate::ipsec::packet::{proto, HeaderInfo, Packet};
use crate::ipsec::sadb::{IpsecProtocol, SaHandle, SaId, Sadb, SecurityAssociation};
use crate::ipsec::xform::digest_eq;
use crate::ipsec::{logging, Error, Result};
use rand::RngCore;

/// SPI and sequence number
pub const ESP_HEADER_LEN: usize = 8;

/// Pad length and next header
pub const ESP_TRAILER_LEN: usize = 2;

/// Largest padding alignment whose pad length fits the one-byte field
pub const MAX_ALIGNMENT: usize = 256;

/// ESP Packet
///
/// Represents an ESP packet as defined in RFC 4303.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EspPacket {
    /// Security Parameters Index (SPI)
    pub spi: u32,

    /// Sequence Number
    pub sequence: u32,

    /// Initialization Vector (empty for ECB transforms)
    pub iv: Vec<u8>,

    /// Encrypted payload, padding, pad length and next header
    pub encrypted_data: Vec<u8>,

    /// Integrity Check Value (present when the SA authenticates)
    pub icv: Option<Vec<u8>>,
}

impl EspPacket {
    /// Create new ESP packet
    ///
    /// # Arguments
    ///
    /// * `spi` - Security Parameters Index
    /// * `sequence` - Sequence number
    /// * `iv` - Initialization vector
    /// * `encrypted_data` - Encrypted payload (includes padding, pad length and next header)
    /// * `icv` - Integrity Check Value (None when the SA has no digest)
    pub fn new(
        spi: u32,
        sequence: u32,
        iv: Vec<u8>,
        encrypted_data: Vec<u8>,
        icv: Option<Vec<u8>>,
    ) -> Self {
        EspPacket {
            spi,
            sequence,
            iv,
            encrypted_data,
            icv,
        }
    }

    /// Serialize ESP packet to bytes
    ///
    /// ```text
    /// | SPI (4) | Sequence (4) | IV (variable) | Encrypted Data (variable) | [ICV (variable)] |
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len());
        bytes.extend_from_slice(&self.spi.to_be_bytes());
        bytes.extend_from_slice(&self.sequence.to_be_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.encrypted_data);
        if let Some(icv) = &self.icv {
            bytes.extend_from_slice(icv);
        }
        bytes
    }

    /// Parse ESP packet from bytes
    ///
    /// # Arguments
    ///
    /// * `data` - Raw ESP record
    /// * `iv_len` - IV length of the SA's cipher (0 for ECB)
    /// * `icv_len` - ICV length of the SA's digest (0 without authentication)
    ///
    /// # Errors
    ///
    /// - `BufferTooShort` if the record cannot hold header, IV and ICV
    pub fn from_bytes(data: &[u8], iv_len: usize, icv_len: usize) -> Result<Self> {
        let min_len = ESP_HEADER_LEN + iv_len + icv_len;
        if data.len() < min_len {
            return Err(Error::BufferTooShort {
                required: min_len,
                available: data.len(),
            });
        }

        let spi = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let sequence = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let encrypted_start = ESP_HEADER_LEN + iv_len;
        let encrypted_end = data.len() - icv_len;

        Ok(EspPacket {
            spi,
            sequence,
            iv: data[ESP_HEADER_LEN..encrypted_start].to_vec(),
            encrypted_data: data[encrypted_start..encrypted_end].to_vec(),
            icv: (icv_len > 0).then(|| data[encrypted_end..].to_vec()),
        })
    }

    /// Get total packet length
    pub fn len(&self) -> usize {
        ESP_HEADER_LEN
            + self.iv.len()
            + self.encrypted_data.len()
            + self.icv.as_ref().map_or(0, |i| i.len())
    }

    /// Check if packet is empty (never true; SPI and sequence are always present)
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Encapsulate (encrypt) payload data with an ESP SA
    ///
    /// Takes the next sequence number, pads to lcm(block size, 8), encrypts
    /// with the SA's chaining IV and appends the ICV when the SA
    /// authenticates. The SA lock is held for the whole operation.
    ///
    /// # Errors
    ///
    /// - `SaNotFound` if the SA is DEAD
    /// - `SequenceOverflow` when the sequence space is exhausted
    /// - `Internal` if the SA has no cipher
    pub fn encapsulate(sa: &SecurityAssociation, payload: &[u8], next_header: u8) -> Result<Self> {
        let enc = sa
            .enc()
            .ok_or_else(|| Error::Internal(format!("ESP SA {} without cipher", sa.id())))?;
        let alignment = lcm(enc.block_size(), 8);
        if alignment > MAX_ALIGNMENT {
            return Err(Error::InvalidParameter(format!(
                "{} block size {} needs {}-byte alignment, trailer allows {}",
                enc.name(),
                enc.block_size(),
                alignment,
                MAX_ALIGNMENT
            )));
        }
        let pad_len = calculate_padding(payload.len(), alignment);

        // Payload | Padding | Pad Length | Next Header
        let mut plaintext = Vec::with_capacity(payload.len() + pad_len + ESP_TRAILER_LEN);
        plaintext.extend_from_slice(payload);
        plaintext.extend((1..=pad_len).map(|i| i as u8));
        plaintext.push(pad_len as u8);
        plaintext.push(next_header);

        let mut st = sa.lock();
        sa.ensure_usable(&st)?;
        let sequence = st.next_sequence()?;

        let iv_len = enc.iv_size();
        let iv = match st.iv() {
            Some(iv) if iv.len() == iv_len => iv.to_vec(),
            _ => {
                let mut iv = vec![0u8; iv_len];
                rand::thread_rng().fill_bytes(&mut iv);
                iv
            }
        };

        let encrypted_data = enc.encrypt(&iv, &plaintext)?;
        if iv_len > 0 {
            st.set_iv(encrypted_data[encrypted_data.len() - iv_len..].to_vec());
        }

        let icv = match sa.auth() {
            Some(auth) => Some(auth.icv(&[
                &sa.spi().to_be_bytes(),
                &sequence.to_be_bytes(),
                &iv,
                &encrypted_data,
            ])?),
            None => None,
        };

        sa.record_use(&mut st, payload.len() as u64);
        drop(st);

        logging::log_esp_packet("encrypt", sa.spi(), sequence, payload.len());
        Ok(EspPacket {
            spi: sa.spi(),
            sequence,
            iv,
            encrypted_data,
            icv,
        })
    }

    /// Decapsulate (decrypt) ESP packet with an ESP SA
    ///
    /// Order: ICV, decrypt, replay check, trailer, then replay update. A
    /// packet that fails any step leaves the window untouched.
    ///
    /// # Returns
    ///
    /// Returns tuple of (decrypted_payload, next_header)
    ///
    /// # Errors
    ///
    /// - `InvalidSpi` if SPI doesn't match SA
    /// - `SaNotFound` if the SA is DEAD
    /// - `AuthenticationFailed` on ICV mismatch or a missing ICV
    /// - `MalformedCiphertext` for empty or ragged ciphertext or a bad pad length
    /// - `ReplayDetected` for a duplicate or too old sequence number
    pub fn decapsulate(
        &self,
        sa: &SecurityAssociation,
        replay_protection: bool,
    ) -> Result<(Vec<u8>, u8)> {
        if self.spi != sa.spi() {
            return Err(Error::InvalidSpi(self.spi));
        }
        let enc = sa
            .enc()
            .ok_or_else(|| Error::Internal(format!("ESP SA {} without cipher", sa.id())))?;

        let mut st = sa.lock();
        sa.ensure_usable(&st)?;

        if let Some(auth) = sa.auth() {
            let received = self.icv.as_deref().ok_or_else(|| {
                Error::AuthenticationFailed(format!("ESP ICV missing for {}", sa.id()))
            })?;
            let computed = auth.icv(&[
                &self.spi.to_be_bytes(),
                &self.sequence.to_be_bytes(),
                &self.iv,
                &self.encrypted_data,
            ])?;
            if !digest_eq(&computed, received) {
                return Err(Error::AuthenticationFailed(format!(
                    "ESP ICV mismatch for {}",
                    sa.id()
                )));
            }
        }

        if self.encrypted_data.is_empty() {
            return Err(Error::MalformedCiphertext("empty ciphertext".into()));
        }
        let plaintext = enc.decrypt(&self.iv, &self.encrypted_data)?;

        if replay_protection && !st.replay().check(self.sequence) {
            return Err(Error::ReplayDetected(self.sequence));
        }

        if plaintext.len() < ESP_TRAILER_LEN {
            return Err(Error::MalformedCiphertext(format!(
                "{} bytes cannot hold the trailer",
                plaintext.len()
            )));
        }
        let pad_len = usize::from(plaintext[plaintext.len() - 2]);
        let next_header = plaintext[plaintext.len() - 1];
        if pad_len + ESP_TRAILER_LEN > plaintext.len() {
            return Err(Error::MalformedCiphertext(format!(
                "pad length {} exceeds {}-byte plaintext",
                pad_len,
                plaintext.len()
            )));
        }
        let payload_len = plaintext.len() - pad_len - ESP_TRAILER_LEN;

        if replay_protection {
            st.replay_mut().update(self.sequence);
        }
        sa.record_use(&mut st, payload_len as u64);
        drop(st);

        logging::log_esp_packet("decrypt", self.spi, self.sequence, payload_len);
        let mut payload = plaintext;
        payload.truncate(payload_len);
        Ok((payload, next_header))
    }
}

/// Calculate padding length needed for ESP
///
/// # Arguments
///
/// * `payload_len` - Length of the payload (without trailer)
/// * `block_size` - Alignment of payload + padding + 2-byte trailer
///
/// # Formula
///
/// ```text
/// (payload_len + pad_len + 2) % block_size == 0
/// ```
pub fn calculate_padding(payload_len: usize, block_size: usize) -> usize {
    let total_with_trailer = payload_len + ESP_TRAILER_LEN;
    let remainder = total_with_trailer % block_size;
    if remainder == 0 {
        0
    } else {
        block_size - remainder
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Least common multiple; the ESP alignment is `lcm(block_size, 8)`
pub fn lcm(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 {
        return a.max(b);
    }
    a / gcd(a, b) * b
}

/// Encrypt everything after the insertion point of `packet` with `sa`
///
/// The upper-layer data (and any header after the insertion point) becomes
/// the ESP payload; the record replaces it at the tail of the packet.
/// Returns the sequence number used.
pub fn output(sa: &SecurityAssociation, packet: &mut Packet) -> Result<u32> {
    let (at, nh_offset) = packet.insertion_point()?;
    let next_header = packet.as_bytes()[nh_offset];
    let payload = packet.as_bytes()[at..].to_vec();

    let esp = EspPacket::encapsulate(sa, &payload, next_header)?;

    packet.truncate(at);
    packet.extend(&esp.to_bytes());
    packet.set_next_header_at(nh_offset, proto::ESP)?;
    packet.fix_payload_len()?;
    Ok(esp.sequence)
}

/// Process the ESP record at `at`: look up its SA, decrypt, splice the
/// payload back in
///
/// On success the handle of the SA used is returned together with the
/// recovered next header; the caller releases the handle. On failure no
/// handle is left checked out.
pub fn input(
    sadb: &Sadb,
    packet: &mut Packet,
    at: &HeaderInfo,
    replay_protection: bool,
) -> Result<(SaHandle, u8)> {
    let record = &packet.as_bytes()[at.offset..];
    if record.len() < ESP_HEADER_LEN {
        return Err(Error::BufferTooShort {
            required: ESP_HEADER_LEN,
            available: record.len(),
        });
    }
    let spi = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
    let id = SaId::new(packet.dst(), IpsecProtocol::Esp, spi);
    let sa = sadb
        .find(&id)
        .ok_or_else(|| Error::SaNotFound(id.to_string()))?;

    let result = decode_record(&sa, record, replay_protection);
    let (payload, next_header) = match result {
        Ok(decoded) => decoded,
        Err(e) => {
            sadb.release(sa);
            return Err(e);
        }
    };

    packet.truncate(at.offset);
    packet.extend(&payload);
    packet.set_next_header_at(at.nh_offset, next_header)?;
    packet.fix_payload_len()?;
    Ok((sa, next_header))
}

fn decode_record(
    sa: &SecurityAssociation,
    record: &[u8],
    replay_protection: bool,
) -> Result<(Vec<u8>, u8)> {
    let iv_len = sa.enc().map_or(0, |e| e.iv_size());
    let icv_len = sa.auth().map_or(0, |a| a.icv_len());
    let esp = EspPacket::from_bytes(record, iv_len, icv_len)?;
    esp.decapsulate(sa, replay_protection)
}

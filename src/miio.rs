use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut as _, BlockEncryptMut as _, KeyIvInit as _};
use md5::{Digest as _, Md5};
use tokio_util::bytes::{Buf as _, BufMut as _, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// The UDP port the device listens on.
pub const PORT: u16 = 54321;

const MAGIC: u16 = 0x2131;
const HEADER_LENGTH: usize = 32;

type Encryptor = cbc::Encryptor<aes::Aes128>;
type Decryptor = cbc::Decryptor<aes::Aes128>;

#[derive(thiserror::Error, Debug)]
pub enum TokenError {
    #[error("device token must be 32 hexadecimal characters long, got {0}")]
    Length(usize),
    #[error("device token is not valid hexadecimal")]
    Hex(#[source] hex::FromHexError),
}

/// The 16 byte secret shared with the device.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Token([u8; 16]);

impl Token {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl std::str::FromStr for Token {
    type Err = TokenError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(TokenError::Length(s.len()));
        }
        let mut bytes = [0; 16];
        hex::decode_to_slice(s, &mut bytes).map_err(TokenError::Hex)?;
        Ok(Self(bytes))
    }
}

// Tokens end up in logs via `connection::Args`, only ever show a prefix.
impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = hex::encode(&self.0[..3]);
        write!(f, "Token({}...)", &prefix[..5])
    }
}

fn md5(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// A packet sent to the device.
#[derive(Debug, Clone)]
pub enum Packet {
    /// Asks the device for its ID and current stamp.
    Hello,
    /// A plaintext JSON payload, encrypted on the way out.
    Message { device_id: u32, stamp: u32, payload: Vec<u8> },
}

/// A packet received from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Hello { device_id: u32, stamp: u32 },
    /// The decrypted JSON payload.
    Message { device_id: u32, stamp: u32, payload: Vec<u8> },
}

#[derive(thiserror::Error, Debug)]
enum DecodeError {
    #[error("datagram of {0} bytes is shorter than the header")]
    Short(usize),
    #[error("unexpected magic {0:#06x}")]
    Magic(u16),
    #[error("header declares {declared} bytes, datagram has {actual}")]
    Length { declared: usize, actual: usize },
    #[error("checksum mismatch")]
    Checksum,
    #[error("payload could not be decrypted")]
    Decrypt,
}

/// Frames, checksums and encrypts the device protocol packets.
///
/// Every datagram holds exactly one packet, so the decoder always consumes its whole input.
/// Malformed datagrams are logged and skipped rather than reported as errors, as anybody on the
/// network can send us garbage.
pub struct MiioCodec {
    token: Token,
    key: [u8; 16],
    iv: [u8; 16],
}

impl MiioCodec {
    pub fn new(token: Token) -> Self {
        let key = md5(&[token.as_bytes()]);
        let iv = md5(&[&key, token.as_bytes()]);
        Self { token, key, iv }
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Encryptor::new(&self.key.into(), &self.iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        Decryptor::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .ok()
    }

    fn parse(&self, datagram: &[u8]) -> Result<Reply, DecodeError> {
        let Some((header, body)) = datagram.split_at_checked(HEADER_LENGTH) else {
            return Err(DecodeError::Short(datagram.len()));
        };
        let mut fields = header;
        let magic = fields.get_u16();
        if magic != MAGIC {
            return Err(DecodeError::Magic(magic));
        }
        let declared = usize::from(fields.get_u16());
        if declared != datagram.len() {
            return Err(DecodeError::Length { declared, actual: datagram.len() });
        }
        let _unknown = fields.get_u32();
        let device_id = fields.get_u32();
        let stamp = fields.get_u32();
        if body.is_empty() {
            // The hello reply carries the token (or zeroes) instead of a checksum.
            return Ok(Reply::Hello { device_id, stamp });
        }
        let checksum = md5(&[&header[..16], self.token.as_bytes(), body]);
        if checksum[..] != header[16..] {
            return Err(DecodeError::Checksum);
        }
        let mut payload = self.decrypt(body).ok_or(DecodeError::Decrypt)?;
        while payload.last() == Some(&0) {
            payload.pop();
        }
        Ok(Reply::Message { device_id, stamp, payload })
    }
}

impl Encoder<Packet> for MiioCodec {
    type Error = std::io::Error;
    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match packet {
            Packet::Hello => {
                dst.reserve(HEADER_LENGTH);
                dst.put_u16(MAGIC);
                dst.put_u16(HEADER_LENGTH as u16);
                dst.put_bytes(0xff, HEADER_LENGTH - 4);
            }
            Packet::Message { device_id, stamp, payload } => {
                let encrypted = self.encrypt(&payload);
                let length = u16::try_from(HEADER_LENGTH + encrypted.len()).map_err(|_| {
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "payload does not fit into a single packet",
                    )
                })?;
                let start = dst.len();
                dst.reserve(usize::from(length));
                dst.put_u16(MAGIC);
                dst.put_u16(length);
                dst.put_u32(0);
                dst.put_u32(device_id);
                dst.put_u32(stamp);
                let checksum = md5(&[&dst[start..], self.token.as_bytes(), &encrypted]);
                dst.put_slice(&checksum);
                dst.put_slice(&encrypted);
            }
        }
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for MiioCodec {
    type Item = Reply;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let datagram = src.split();
        trace!(message = "attempt at decoding", buffer = ?datagram);
        match self.parse(&datagram) {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                debug!(message = "dropping a malformed datagram", error = (&e as &dyn std::error::Error));
                Ok(None)
            }
        }
    }
}

/// The JSON request carried inside a [`Packet::Message`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DeviceError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u32,
    pub kind: ResponseKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    Result(serde_json::Value),
    Error(DeviceError),
}

impl Response {
    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        #[derive(serde::Deserialize)]
        struct Raw {
            id: u32,
            #[serde(default)]
            result: serde_json::Value,
            #[serde(default)]
            error: Option<DeviceError>,
        }
        let raw = serde_json::from_slice::<Raw>(payload)?;
        let kind = match raw.error {
            Some(error) => ResponseKind::Error(error),
            None => ResponseKind::Result(raw.result),
        };
        Ok(Self { id: raw.id, kind })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOKEN: &str = "00112233445566778899aabbccddeeff";

    fn codec() -> MiioCodec {
        MiioCodec::new(TOKEN.parse().unwrap())
    }

    #[test]
    fn token_must_be_32_hex_characters() {
        assert!(matches!("abcd".parse::<Token>(), Err(TokenError::Length(4))));
        let not_hex = "zz112233445566778899aabbccddeeff";
        assert!(matches!(not_hex.parse::<Token>(), Err(TokenError::Hex(_))));
        let token: Token = TOKEN.parse().unwrap();
        assert_eq!(token.as_bytes()[15], 0xff);
        assert_eq!(format!("{token:?}"), "Token(00112...)");
    }

    #[test]
    fn hello_packet() {
        let mut buffer = BytesMut::new();
        codec().encode(Packet::Hello, &mut buffer).unwrap();
        assert_eq!(buffer.len(), 32);
        assert_eq!(&buffer[..4], &[0x21, 0x31, 0x00, 0x20]);
        assert!(buffer[4..].iter().all(|&b| b == 0xff));
    }

    #[test]
    fn hello_reply() {
        let mut datagram = BytesMut::new();
        datagram.put_u16(MAGIC);
        datagram.put_u16(32);
        datagram.put_u32(0);
        datagram.put_u32(0x0102_0304);
        datagram.put_u32(1000);
        datagram.put_bytes(0, 16);
        let reply = codec().decode(&mut datagram).unwrap();
        assert_eq!(reply, Some(Reply::Hello { device_id: 0x0102_0304, stamp: 1000 }));
        assert!(datagram.is_empty());
    }

    #[test]
    fn message_matches_known_packet() {
        // Generated independently with a reference AES-128-CBC/MD5 implementation.
        let expected = hex::decode(concat!(
            "213100500000000001020304000003e8",
            "67280582b0b5c6df3c2690ad5aa10aac",
            "a5516ec6151955dc2bb2d43e7c84c183",
            "3ad6abd2560c09de4318b095b7713e23",
            "0bbed4ee40764c0304f323716693cc0a",
        ))
        .unwrap();
        let payload = br#"{"id":1,"method":"get_prop","params":["power"]}"#.to_vec();
        let mut buffer = BytesMut::new();
        let packet = Packet::Message { device_id: 0x0102_0304, stamp: 1000, payload };
        codec().encode(packet, &mut buffer).unwrap();
        assert_eq!(&buffer[..], &expected[..]);
    }

    #[test]
    fn message_is_decrypted_and_trimmed() {
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        let payload = b"{\"id\":7,\"result\":[\"ok\"]}\0".to_vec();
        codec.encode(Packet::Message { device_id: 9, stamp: 10, payload }, &mut buffer).unwrap();
        let Some(Reply::Message { device_id, stamp, payload }) = codec.decode(&mut buffer).unwrap()
        else {
            panic!("expected a message");
        };
        assert_eq!((device_id, stamp), (9, 10));
        let response = Response::from_payload(&payload).unwrap();
        assert_eq!(response, Response { id: 7, kind: ResponseKind::Result(json!(["ok"])) });
    }

    #[test]
    fn corrupted_datagrams_are_skipped() {
        let mut codec = codec();
        let mut buffer = BytesMut::new();
        let payload = br#"{"id":1,"result":[]}"#.to_vec();
        codec.encode(Packet::Message { device_id: 1, stamp: 1, payload }, &mut buffer).unwrap();
        let last = buffer.len() - 1;
        buffer[last] ^= 0x55;
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());

        let mut short = BytesMut::from(&[0x21, 0x31, 0x00][..]);
        assert_eq!(codec.decode(&mut short).unwrap(), None);

        let mut wrong_magic = BytesMut::from(&[0u8; 32][..]);
        assert_eq!(codec.decode(&mut wrong_magic).unwrap(), None);
    }

    #[test]
    fn device_error_response() {
        let payload = br#"{"id":3,"error":{"code":-5001,"message":"invalid arg"}}"#;
        let response = Response::from_payload(payload).unwrap();
        assert_eq!(
            response.kind,
            ResponseKind::Error(DeviceError { code: -5001, message: "invalid arg".into() })
        );
    }
}

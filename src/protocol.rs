use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// A chat line as exchanged by the chat front-ends.
///
/// On the wire it is the text `<sender> content` encoded as UTF-16LE code
/// units. The framing layer never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        ChatMessage {
            sender: sender.into(),
            content: content.into(),
        }
    }

    /// Encodes the message as a frame payload.
    pub fn to_wire(&self) -> Bytes {
        let text = self.to_string();
        let mut buf = BytesMut::with_capacity(text.len() * 2);
        for unit in text.encode_utf16() {
            buf.put_u16_le(unit);
        }
        buf.freeze()
    }

    /// Parses a frame payload (example: "<avery> hi there").
    pub fn from_wire(payload: &[u8]) -> Result<Self> {
        let text = decode_utf16(payload)?;
        let (sender, content) = text
            .strip_prefix('<')
            .and_then(|rest| rest.split_once("> "))
            .ok_or_else(|| anyhow::anyhow!("Invalid message format: {}", text))?;
        Ok(ChatMessage::new(sender, content))
    }
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}> {}", self.sender, self.content)
    }
}

/// Decodes UTF-16LE text.
pub fn decode_utf16(payload: &[u8]) -> Result<String> {
    if payload.len() % 2 != 0 {
        return Err(anyhow::anyhow!(
            "UTF-16 payload has odd length {}",
            payload.len()
        ));
    }
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16(&units)?)
}
